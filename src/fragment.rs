use std::fmt::{self, Display};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::cursor::CursorSnapshot;
use crate::hashing::{HashOverrides, StableHasher};
use crate::run_context::{Halt, ScriptRunContext};

pub type FragmentFn = Arc<dyn Fn(&mut ScriptRunContext<'_>) -> Result<(), Halt> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(String);

impl FragmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derived from the defining function and the position the fragment
    /// occupies in the output, so the same call site keeps its id across runs.
    pub fn derive(name: &str, position: &[u32]) -> Self {
        let overrides = HashOverrides::default();
        let mut hasher = StableHasher::new(&overrides);
        hasher.write_tag("fragment");
        hasher.write_str(name);
        hasher.write_u64(position.len() as u64);
        for index in position {
            hasher.write_u64(u64::from(*index));
        }
        Self(format!("{name}-{}", hasher.finish().short()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub name: String,
    pub closure: FragmentFn,
    pub cursor: CursorSnapshot,
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

/// Fragments of the most recent full run, in registration order.
#[derive(Default, Debug)]
pub struct FragmentRegistry {
    fragments: IndexMap<FragmentId, Fragment>,
}

impl FragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fragment: Fragment) {
        self.fragments.insert(fragment.id.clone(), fragment);
    }

    pub fn get(&self, id: &FragmentId) -> Option<&Fragment> {
        self.fragments.get(id)
    }

    pub fn remove(&mut self, id: &FragmentId) -> Option<Fragment> {
        self.fragments.shift_remove(id)
    }

    pub fn contains(&self, id: &FragmentId) -> bool {
        self.fragments.contains_key(id)
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.values()
    }
}
