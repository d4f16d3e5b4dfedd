//! Free-form request-scoped properties.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// String-keyed JSON values propagated with a `RunContext`.
///
/// Copy-and-modify only: `with` returns a new map, so a map shared by a
/// running job never changes underneath it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap {
    values: BTreeMap<String, serde_json::Value>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn without(mut self, key: &str) -> Self {
        self.values.remove(key);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn copy_and_modify_leaves_original_untouched() {
        let base = PropertyMap::new().with("tenant", "acme");
        let derived = base.clone().with("page", 3).without("tenant");

        assert_eq!(base.get("tenant"), Some(&json!("acme")));
        assert!(!derived.contains("tenant"));
        assert_eq!(derived.get("page"), Some(&json!(3)));
    }

    #[test]
    fn serializes_as_plain_object() {
        let map = PropertyMap::new().with("a", 1).with("b", true);
        assert_eq!(serde_json::to_value(&map).unwrap(), json!({"a": 1, "b": true}));
    }
}
