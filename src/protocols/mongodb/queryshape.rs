// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! Normalized query shapes.
//!
//! A shape is the command document with every scalar leaf replaced by the
//! integer `1`, keys sorted lexicographically at each level, serialized
//! as compact JSON. Two queries that differ only in their literal values
//! share a shape, which makes it a low-cardinality grouping key.

use bson::{Bson, Document};
use serde_json::{Map, Value};

pub fn shape(document: &Document) -> String {
    serde_json::to_string(&document_shape(document)).unwrap_or_default()
}

fn document_shape(document: &Document) -> Value {
    let mut map = Map::new();
    for (key, value) in document {
        map.insert(key.clone(), value_shape(value));
    }
    Value::Object(map)
}

fn value_shape(value: &Bson) -> Value {
    match value {
        Bson::Document(document) => document_shape(document),
        Bson::Array(items) => Value::Array(items.iter().map(value_shape).collect()),
        _ => Value::from(1),
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    #[test]
    fn scalars_collapse_and_keys_sort() {
        let document = doc! {
            "find": "c0",
            "filter": { "rating": { "$gte": 9 }, "cuisine": "italian" },
        };
        assert_eq!(
            super::shape(&document),
            r#"{"filter":{"cuisine":1,"rating":{"$gte":1}},"find":1}"#,
        );
    }

    #[test]
    fn empty_key_is_preserved() {
        let document = doc! { "": "value" };
        assert_eq!(super::shape(&document), r#"{"":1}"#);
    }

    #[test]
    fn arrays_recurse() {
        let document = doc! { "pipeline": [ { "$match": { "a": 5 } }, 3 ] };
        assert_eq!(
            super::shape(&document),
            r#"{"pipeline":[{"$match":{"a":1}},1]}"#,
        );
    }
}
