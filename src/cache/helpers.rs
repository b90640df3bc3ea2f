//! Helpers for cached values that are lists of records.
//!
//! Records are matched by an identifier field, `id` unless another field is
//! named. Every helper is copy-on-write: the input is never modified.

use std::collections::BTreeMap;

use serde_json::Value;

/// Identifier field used when none is named.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Helpers handed to setter callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetHelpers;

impl SetHelpers {
    /// Replace the record whose `id` matches `item`'s, or append `item`.
    pub fn insert(&self, items: &Value, item: Value) -> Value {
        self.insert_by(items, item, DEFAULT_ID_FIELD)
    }

    pub fn insert_by(&self, items: &Value, item: Value, field: &str) -> Value {
        let Some(list) = items.as_array() else {
            return items.clone();
        };
        if item.is_null() {
            return items.clone();
        }
        let mut copy = list.clone();
        match position(list, item.get(field), field) {
            Some(index) => copy[index] = item,
            None => copy.push(item),
        }
        Value::Array(copy)
    }

    /// Shallow-merge `updates` into the record whose `id` equals `id`.
    pub fn update(&self, items: &Value, id: &Value, updates: &Value) -> Value {
        self.update_by(items, id, updates, DEFAULT_ID_FIELD)
    }

    pub fn update_by(&self, items: &Value, id: &Value, updates: &Value, field: &str) -> Value {
        let Some(list) = items.as_array() else {
            return items.clone();
        };
        let Some(index) = position(list, Some(id), field) else {
            return items.clone();
        };
        let mut copy = list.clone();
        copy[index] = merge(&list[index], updates);
        Value::Array(copy)
    }

    /// Remove the record whose `id` equals `id`.
    pub fn delete(&self, items: &Value, id: &Value) -> Value {
        self.delete_by(items, id, DEFAULT_ID_FIELD)
    }

    pub fn delete_by(&self, items: &Value, id: &Value, field: &str) -> Value {
        let Some(list) = items.as_array() else {
            return items.clone();
        };
        let Some(index) = position(list, Some(id), field) else {
            return items.clone();
        };
        let mut copy = list.clone();
        copy.remove(index);
        Value::Array(copy)
    }
}

/// Helpers handed to read-side transform functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseHelpers;

impl UseHelpers {
    /// Index a list of records by their `id`.
    pub fn mapify(&self, items: &Value) -> BTreeMap<String, Value> {
        self.mapify_by(items, DEFAULT_ID_FIELD)
    }

    /// Index a list of records by `field`. String identifiers are used as-is,
    /// other values by their JSON text. Records without the field are skipped.
    pub fn mapify_by(&self, items: &Value, field: &str) -> BTreeMap<String, Value> {
        items
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|record| {
                let id = record.get(field)?;
                let key = match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((key, record.clone()))
            })
            .collect()
    }
}

// A record without the field never matches, and neither does a missing id.
fn position(list: &[Value], id: Option<&Value>, field: &str) -> Option<usize> {
    let id = id?;
    list.iter().position(|record| record.get(field) == Some(id))
}

fn merge(record: &Value, updates: &Value) -> Value {
    match (record, updates) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (name, value) in patch {
                merged.insert(name.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => record.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn insert_appends_new_record() {
        let items = json!([{"id": 1, "name": "a"}]);
        let next = SetHelpers.insert(&items, json!({"id": 2, "name": "b"}));

        assert_eq!(next, json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]));
        assert_eq!(items, json!([{"id": 1, "name": "a"}]));
    }

    #[test]
    fn insert_replaces_matching_record_in_place() {
        let items = json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]);
        let next = SetHelpers.insert(&items, json!({"id": 1, "name": "z"}));

        assert_eq!(next, json!([{"id": 1, "name": "z"}, {"id": 2, "name": "b"}]));
    }

    #[test]
    fn insert_by_custom_field() {
        let items = json!([{"slug": "x", "v": 1}]);
        let next = SetHelpers.insert_by(&items, json!({"slug": "x", "v": 2}), "slug");

        assert_eq!(next, json!([{"slug": "x", "v": 2}]));
    }

    #[test]
    fn insert_into_non_list_is_identity() {
        let items = json!({"not": "a list"});
        assert_eq!(SetHelpers.insert(&items, json!({"id": 1})), items);
        assert_eq!(SetHelpers.insert(&json!([]), Value::Null), json!([]));
    }

    #[test]
    fn update_merges_fields_shallowly() {
        let items = json!([{"id": 1, "name": "a", "tags": ["x"]}]);
        let next = SetHelpers.update(&items, &json!(1), &json!({"name": "b", "done": true}));

        assert_eq!(next, json!([{"id": 1, "name": "b", "tags": ["x"], "done": true}]));
        assert_eq!(items, json!([{"id": 1, "name": "a", "tags": ["x"]}]));
    }

    #[test]
    fn update_missing_record_is_noop() {
        let items = json!([{"id": 1}]);
        assert_eq!(SetHelpers.update(&items, &json!(9), &json!({"x": 1})), items);
    }

    #[test]
    fn delete_removes_matching_record() {
        let items = json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]);
        let next = SetHelpers.delete(&items, &json!("b"));

        assert_eq!(next, json!([{"id": "a"}, {"id": "c"}]));
        assert_eq!(items.as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn delete_missing_record_is_noop() {
        let items = json!([{"id": 1}]);
        assert_eq!(SetHelpers.delete(&items, &json!(2)), items);
    }

    #[test]
    fn ids_compare_by_json_value() {
        let items = json!([{"id": 1}]);
        assert_eq!(SetHelpers.delete(&items, &json!("1")), items);
    }

    #[test]
    fn mapify_indexes_by_id() {
        let items = json!([{"id": 1, "n": "a"}, {"id": "k", "n": "b"}, {"n": "no id"}]);
        let map = UseHelpers.mapify(&items);

        assert_eq!(map.len(), 2);
        assert_eq!(map["1"], json!({"id": 1, "n": "a"}));
        assert_eq!(map["k"], json!({"id": "k", "n": "b"}));
    }

    #[test]
    fn mapify_non_list_is_empty() {
        assert!(UseHelpers.mapify(&json!(null)).is_empty());
    }
}
