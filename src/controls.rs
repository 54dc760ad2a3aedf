//! Interactive-control state that survives reruns.
//!
//! Controls are keyed by a [`ControlId`] derived from where and how they were
//! declared, never from their value. The store reconciles each run's
//! declarations against values the client submitted, remembers on-change
//! callbacks, and forgets controls that a run did not declare.

use std::collections::HashSet;
use std::fmt::{self, Display};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hashing::{HashOverrides, StableHasher};
use crate::run_context::ControlCallback;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlId(String);

impl ControlId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ControlId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Checkbox,
    /// Integer-valued. A submitted float is kept and rounded when read.
    Slider,
    TextInput,
    Button,
    Selectbox,
}

impl ControlKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Checkbox => "checkbox",
            Self::Slider => "slider",
            Self::TextInput => "text_input",
            Self::Button => "button",
            Self::Selectbox => "selectbox",
        }
    }

    /// Trigger controls hold their value for exactly one run.
    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Button)
    }

    fn accepts(&self, value: &ControlValue) -> bool {
        matches!(
            (self, value),
            (Self::Checkbox | Self::Button, ControlValue::Bool(_))
                | (Self::Slider | Self::Selectbox, ControlValue::Int(_))
                | (Self::TextInput, ControlValue::Text(_))
        ) || matches!((self, value), (Self::Slider, ControlValue::Float(v)) if v.is_finite())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ControlValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Integers as-is, finite floats rounded to the nearest integer.
    pub fn as_rounded_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value) if value.is_finite() => Some(value.round() as i64),
            _ => None,
        }
    }

    fn approx_size(&self) -> usize {
        match self {
            Self::Text(text) => std::mem::size_of::<Self>() + text.len(),
            _ => std::mem::size_of::<Self>(),
        }
    }
}

impl Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value:?}"),
        }
    }
}

/// Values submitted by a client, keyed by control id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlSnapshot(IndexMap<ControlId, ControlValue>);

impl ControlSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<ControlId>, value: ControlValue) -> Self {
        self.insert(id.into(), value);
        self
    }

    pub fn insert(&mut self, id: ControlId, value: ControlValue) {
        self.0.insert(id, value);
    }

    pub fn get(&self, id: &ControlId) -> Option<&ControlValue> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ControlId, &ControlValue)> {
        self.0.iter()
    }
}

/// Everything that identifies a control declaration.
#[derive(Debug, Clone)]
pub struct ControlSpec<'a> {
    pub kind: ControlKind,
    pub site: &'a str,
    pub label: &'a str,
    pub default: &'a ControlValue,
    pub options: &'a [String],
    pub user_key: Option<&'a str>,
}

impl ControlSpec<'_> {
    /// Keyed controls are identified by key and configuration; unkeyed ones
    /// additionally by their declaration site.
    pub fn id(&self) -> ControlId {
        let overrides = HashOverrides::default();
        let mut hasher = StableHasher::new(&overrides);
        hasher.write_tag(self.kind.name());
        if self.user_key.is_none() {
            hasher.write_str(self.site);
        }
        hasher.write_str(self.label);
        hasher.write_str(&self.default.to_string());
        hasher.write_u64(self.options.len() as u64);
        for option in self.options {
            hasher.write_str(option);
        }
        let fingerprint = hasher.finish();
        match self.user_key {
            Some(key) => ControlId(format!("$$ID-{}-{}", fingerprint.short(), key)),
            None => ControlId(format!("$$ID-{}-None", fingerprint.short())),
        }
    }
}

pub struct ControlDeclaration {
    pub id: ControlId,
    pub kind: ControlKind,
    pub label: String,
    pub default: ControlValue,
    pub incoming: Option<ControlValue>,
    pub on_change: Option<ControlCallback>,
}

#[derive(Clone)]
pub struct ControlRecord {
    pub kind: Option<ControlKind>,
    pub value: ControlValue,
    pub previous: Option<ControlValue>,
    pub changed: bool,
    pub callback: Option<ControlCallback>,
}

impl fmt::Debug for ControlRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlRecord")
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("previous", &self.previous)
            .field("changed", &self.changed)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ControlRecord {
    fn set(&mut self, value: ControlValue) {
        if self.value != value {
            self.previous = Some(std::mem::replace(&mut self.value, value));
            self.changed = true;
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    #[error(
        "There are multiple identical {kind} controls labeled `{label}` (id `{id}`). \
         Give each one a unique `key`."
    )]
    DuplicateId {
        id: ControlId,
        kind: &'static str,
        label: String,
    },
}

#[derive(Default)]
pub struct ControlStore {
    records: IndexMap<ControlId, ControlRecord>,
    declared: HashSet<ControlId>,
    user_values: IndexMap<String, serde_json::Value>,
}

impl ControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_run(&mut self) {
        self.declared.clear();
    }

    /// Merges a client snapshot into the store and returns, in registration
    /// order, the ids of controls whose value changed and that have an
    /// on-change callback.
    pub fn apply_incoming(&mut self, snapshot: &ControlSnapshot) -> Vec<ControlId> {
        for record in self.records.values_mut() {
            record.changed = false;
        }

        for (id, value) in snapshot.iter() {
            match self.records.get_mut(id) {
                Some(record) => record.set(value.clone()),
                None => {
                    self.records.insert(
                        id.clone(),
                        ControlRecord {
                            kind: None,
                            value: value.clone(),
                            previous: None,
                            changed: true,
                            callback: None,
                        },
                    );
                }
            }
        }

        self.records
            .iter()
            .filter(|(_, record)| record.changed && record.callback.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Declares a control for the current run and returns its value: the
    /// incoming value if one was supplied, else the stored value, else the
    /// default.
    pub fn declare(&mut self, declaration: ControlDeclaration) -> Result<ControlValue, ControlError> {
        let ControlDeclaration {
            id,
            kind,
            label,
            default,
            incoming,
            on_change,
        } = declaration;

        if !self.declared.insert(id.clone()) {
            return Err(ControlError::DuplicateId {
                id,
                kind: kind.name(),
                label,
            });
        }

        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| ControlRecord {
                kind: Some(kind),
                value: default.clone(),
                previous: None,
                changed: false,
                callback: None,
            });
        record.kind = Some(kind);
        record.callback = on_change;

        if let Some(incoming) = incoming {
            record.set(incoming);
        }
        if !kind.accepts(&record.value) {
            tracing::warn!(
                control = %id,
                value = %record.value,
                kind = kind.name(),
                "stored value does not fit control, using default"
            );
            record.value = default;
            record.changed = false;
        }

        Ok(record.value.clone())
    }

    pub fn declared_this_run(&self) -> &HashSet<ControlId> {
        &self.declared
    }

    /// Removes every record not present in `declared`; returns removed ids.
    pub fn cull(&mut self, declared: &HashSet<ControlId>) -> Vec<ControlId> {
        let mut removed = Vec::new();
        self.records.retain(|id, _| {
            let keep = declared.contains(id);
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    pub fn cull_undeclared(&mut self) -> Vec<ControlId> {
        let declared = std::mem::take(&mut self.declared);
        let removed = self.cull(&declared);
        self.declared = declared;
        removed
    }

    pub fn reset_triggers(&mut self) {
        for record in self.records.values_mut() {
            if record.kind.is_some_and(|kind| kind.is_trigger()) {
                record.value = ControlValue::Bool(false);
                record.changed = false;
            }
        }
    }

    pub fn callback(&self, id: &ControlId) -> Option<ControlCallback> {
        self.records.get(id).and_then(|record| record.callback.clone())
    }

    pub fn get(&self, id: &ControlId) -> Option<&ControlRecord> {
        self.records.get(id)
    }

    pub fn value(&self, id: &ControlId) -> Option<&ControlValue> {
        self.records.get(id).map(|record| &record.value)
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot(
            self.records
                .iter()
                .map(|(id, record)| (id.clone(), record.value.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn set_user_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.user_values.insert(key.into(), value);
    }

    pub fn user_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.user_values.get(key)
    }

    pub fn byte_size(&self) -> usize {
        let records: usize = self
            .records
            .iter()
            .map(|(id, record)| id.0.len() + record.value.approx_size())
            .sum();
        let user: usize = self
            .user_values
            .iter()
            .map(|(key, value)| key.len() + value.to_string().len())
            .sum();
        records + user
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::run_context::{Halt, ScriptRunContext};

    fn checkbox(id: &str, default: bool) -> ControlDeclaration {
        ControlDeclaration {
            id: ControlId::from(id),
            kind: ControlKind::Checkbox,
            label: id.to_string(),
            default: ControlValue::Bool(default),
            incoming: None,
            on_change: None,
        }
    }

    fn noop_callback() -> ControlCallback {
        Arc::new(|_ctx: &mut ScriptRunContext<'_>| -> Result<(), Halt> { Ok(()) })
    }

    #[test]
    fn declare_prefers_incoming_then_stored_then_default() {
        let mut store = ControlStore::new();
        store.begin_run();
        assert_eq!(
            store.declare(checkbox("a", false)).unwrap(),
            ControlValue::Bool(false)
        );

        store.begin_run();
        store.apply_incoming(&ControlSnapshot::new().with("a", ControlValue::Bool(true)));
        assert_eq!(
            store.declare(checkbox("a", false)).unwrap(),
            ControlValue::Bool(true)
        );

        store.begin_run();
        store.apply_incoming(&ControlSnapshot::new());
        assert_eq!(
            store.declare(checkbox("a", false)).unwrap(),
            ControlValue::Bool(true)
        );

        store.begin_run();
        let mut explicit = checkbox("a", false);
        explicit.incoming = Some(ControlValue::Bool(false));
        assert_eq!(store.declare(explicit).unwrap(), ControlValue::Bool(false));
    }

    #[test]
    fn declaring_twice_in_one_run_fails() {
        let mut store = ControlStore::new();
        store.begin_run();
        store.declare(checkbox("a", false)).unwrap();
        let err = store.declare(checkbox("a", false)).unwrap_err();
        assert!(matches!(err, ControlError::DuplicateId { .. }));

        store.begin_run();
        assert!(store.declare(checkbox("a", false)).is_ok());
    }

    #[test]
    fn apply_incoming_reports_changed_controls_with_callbacks() {
        let mut store = ControlStore::new();
        store.begin_run();
        let mut with_callback = checkbox("watched", false);
        with_callback.on_change = Some(noop_callback());
        store.declare(with_callback).unwrap();
        store.declare(checkbox("silent", false)).unwrap();

        let snapshot = ControlSnapshot::new()
            .with("silent", ControlValue::Bool(true))
            .with("watched", ControlValue::Bool(true));
        assert_eq!(store.apply_incoming(&snapshot), vec![ControlId::from("watched")]);

        let record = store.get(&ControlId::from("watched")).unwrap();
        assert_eq!(record.previous, Some(ControlValue::Bool(false)));
        assert!(record.changed);

        // resubmitting the same value is not a change
        assert!(store.apply_incoming(&snapshot).is_empty());
    }

    #[test]
    fn cull_removes_undeclared_controls() {
        let mut store = ControlStore::new();
        store.begin_run();
        store.declare(checkbox("kept", false)).unwrap();
        store.declare(checkbox("branch", false)).unwrap();
        store.cull_undeclared();
        assert_eq!(store.len(), 2);

        store.begin_run();
        store.declare(checkbox("kept", false)).unwrap();
        let removed = store.cull_undeclared();
        assert_eq!(removed, vec![ControlId::from("branch")]);
        assert!(store.get(&ControlId::from("branch")).is_none());
    }

    #[test]
    fn triggers_reset_after_run() {
        let mut store = ControlStore::new();
        store.begin_run();
        let button = ControlDeclaration {
            id: ControlId::from("go"),
            kind: ControlKind::Button,
            label: "Go".to_string(),
            default: ControlValue::Bool(false),
            incoming: None,
            on_change: None,
        };
        store.declare(button).unwrap();
        store.apply_incoming(&ControlSnapshot::new().with("go", ControlValue::Bool(true)));
        assert_eq!(
            store.value(&ControlId::from("go")),
            Some(&ControlValue::Bool(true))
        );
        store.reset_triggers();
        assert_eq!(
            store.value(&ControlId::from("go")),
            Some(&ControlValue::Bool(false))
        );
    }

    #[test]
    fn mismatched_stored_value_falls_back_to_default() {
        let mut store = ControlStore::new();
        store.apply_incoming(
            &ControlSnapshot::new().with("a", ControlValue::Text("yes".to_string())),
        );
        store.begin_run();
        assert_eq!(
            store.declare(checkbox("a", true)).unwrap(),
            ControlValue::Bool(true)
        );
    }

    #[test]
    fn sliders_keep_submitted_floats() {
        let mut store = ControlStore::new();
        let slider = || ControlDeclaration {
            id: ControlId::from("level"),
            kind: ControlKind::Slider,
            label: "Level".to_string(),
            default: ControlValue::Int(1),
            incoming: None,
            on_change: None,
        };
        store.begin_run();
        store.declare(slider()).unwrap();

        store.apply_incoming(&ControlSnapshot::new().with("level", ControlValue::Float(3.6)));
        store.begin_run();
        let value = store.declare(slider()).unwrap();
        assert_eq!(value, ControlValue::Float(3.6));
        assert_eq!(value.as_rounded_int(), Some(4));

        store.apply_incoming(&ControlSnapshot::new().with("level", ControlValue::Float(f64::NAN)));
        store.begin_run();
        assert_eq!(store.declare(slider()).unwrap(), ControlValue::Int(1));
    }

    #[test]
    fn snapshots_serialize_as_ordered_objects() {
        let snapshot = ControlSnapshot::new()
            .with("b", ControlValue::Bool(true))
            .with("a", ControlValue::Int(3));
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"b":true,"a":3}"#);
        let back: ControlSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn control_ids_depend_on_configuration_not_value() {
        let default = ControlValue::Bool(false);
        let spec = ControlSpec {
            kind: ControlKind::Checkbox,
            site: "page:3:1",
            label: "Agree",
            default: &default,
            options: &[],
            user_key: None,
        };
        let other_site = ControlSpec {
            site: "page:9:1",
            ..spec.clone()
        };
        let keyed = ControlSpec {
            user_key: Some("agree"),
            ..spec.clone()
        };
        let keyed_elsewhere = ControlSpec {
            site: "page:9:1",
            ..keyed.clone()
        };
        assert_eq!(spec.id(), spec.clone().id());
        assert_ne!(spec.id(), other_site.id());
        assert_eq!(keyed.id(), keyed_elsewhere.id());
        assert!(keyed.id().as_str().ends_with("-agree"));
    }
}
