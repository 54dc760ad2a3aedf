use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// Memory held by one cache entry (or one cache, when providers aggregate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStat {
    pub category_name: String,
    pub cache_name: String,
    pub byte_length: usize,
}

impl CacheStat {
    pub fn new(category_name: impl Into<String>, cache_name: impl Into<String>, byte_length: usize) -> Self {
        Self {
            category_name: category_name.into(),
            cache_name: cache_name.into(),
            byte_length,
        }
    }
}

pub trait StatsProvider: Send + Sync {
    fn get_stats(&self) -> Vec<CacheStat>;
}

/// Collects stats from every registered provider.
#[derive(Default)]
pub struct StatsManager {
    providers: Mutex<Vec<Arc<dyn StatsProvider>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&self, provider: Arc<dyn StatsProvider>) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    pub fn get_stats(&self) -> Vec<CacheStat> {
        let providers = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        providers
            .iter()
            .flat_map(|provider| provider.get_stats())
            .collect()
    }

    /// Sums byte lengths per `(category, cache)` pair.
    pub fn summarize(stats: &[CacheStat]) -> Vec<CacheStat> {
        let mut grouped: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for stat in stats {
            *grouped
                .entry((stat.category_name.as_str(), stat.cache_name.as_str()))
                .or_default() += stat.byte_length;
        }
        grouped
            .into_iter()
            .map(|((category, cache), bytes)| CacheStat::new(category, cache, bytes))
            .collect()
    }

    pub fn show(stats: &[CacheStat]) -> String {
        let summary = Self::summarize(stats);
        let total: usize = summary.iter().map(|stat| stat.byte_length).sum();
        let mut out = String::new();
        for stat in &summary {
            out.push_str(&format!(
                "\t{} / {}: {} bytes\n",
                stat.category_name, stat.cache_name, stat.byte_length
            ));
        }
        out.push_str(&format!("\tTotal: {total} bytes\n"));
        out
    }
}
