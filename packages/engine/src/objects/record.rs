// packages/engine/src/objects/record.rs
//! Decoded object records

use crate::model::types::{Type, BUILTIN_TYPES};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Decoded form of a recorded value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectRecord {
    Null,
    /// The value could not be recorded at all
    NotRecorded,
    String {
        value: String,
    },
    Integral {
        type_name: String,
        value: i64,
    },
    Number {
        type_name: String,
        value: f64,
    },
    Bool {
        value: bool,
    },
    Char {
        value: char,
    },
    Bytes {
        len: u32,
        head: Vec<u8>,
    },
    Collection {
        type_name: String,
        size: u32,
        elements: Vec<ObjectRecord>,
    },
    Map {
        type_name: String,
        size: u32,
        entries: Vec<(ObjectRecord, ObjectRecord)>,
    },
    Throwable {
        type_name: String,
        message: Option<String>,
    },
    Printed {
        type_name: String,
        identity_hash: u32,
        text: String,
    },
    Identity {
        type_name: String,
        identity_hash: u32,
    },
}

impl ObjectRecord {
    /// Short human readable form, used by exports and logs
    pub fn pretty(&self) -> String {
        match self {
            ObjectRecord::Null => "null".to_string(),
            ObjectRecord::NotRecorded => "?".to_string(),
            ObjectRecord::String { value } => format!("\"{}\"", value),
            ObjectRecord::Integral { value, .. } => value.to_string(),
            ObjectRecord::Number { value, .. } => value.to_string(),
            ObjectRecord::Bool { value } => value.to_string(),
            ObjectRecord::Char { value } => format!("'{}'", value),
            ObjectRecord::Bytes { len, .. } => format!("bytes[{}]", len),
            ObjectRecord::Collection { size, elements, .. } => {
                let shown: Vec<String> = elements.iter().map(ObjectRecord::pretty).collect();
                let more = if (*size as usize) > elements.len() { ", ..." } else { "" };
                format!("[{}{}]", shown.join(", "), more)
            }
            ObjectRecord::Map { size, entries, .. } => {
                let shown: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{} -> {}", k.pretty(), v.pretty()))
                    .collect();
                let more = if (*size as usize) > entries.len() { ", ..." } else { "" };
                format!("{{{}{}}}", shown.join(", "), more)
            }
            ObjectRecord::Throwable { type_name, message } => match message {
                Some(message) => format!("{}: {}", type_name, message),
                None => type_name.clone(),
            },
            ObjectRecord::Printed { text, .. } => text.clone(),
            ObjectRecord::Identity {
                type_name,
                identity_hash,
            } => format!("{}@{:x}", type_name, identity_hash),
        }
    }
}

/// Resolves type ids found in encoded objects
pub trait TypeResolver {
    fn resolve_type(&self, id: u64) -> Option<Arc<Type>>;

    /// Name of the type, falling back to builtins and then to the raw id
    fn type_name(&self, id: u64) -> String {
        if let Some(ty) = self.resolve_type(id) {
            return ty.name.clone();
        }
        BUILTIN_TYPES
            .all()
            .into_iter()
            .find(|ty| ty.id == id)
            .map(|ty| ty.name.clone())
            .unwrap_or_else(|| format!("type#{}", id))
    }
}

impl TypeResolver for HashMap<u64, Arc<Type>> {
    fn resolve_type(&self, id: u64) -> Option<Arc<Type>> {
        self.get(&id).cloned()
    }
}

/// Resolver that knows only builtin types
pub struct BuiltinResolver;

impl TypeResolver for BuiltinResolver {
    fn resolve_type(&self, _id: u64) -> Option<Arc<Type>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretty() {
        let list = ObjectRecord::Collection {
            type_name: "list".into(),
            size: 5,
            elements: vec![
                ObjectRecord::Integral {
                    type_name: "i64".into(),
                    value: 1,
                },
                ObjectRecord::String { value: "a".into() },
            ],
        };
        assert_eq!(list.pretty(), "[1, \"a\", ...]");
        assert_eq!(
            ObjectRecord::Identity {
                type_name: "app.Foo".into(),
                identity_hash: 255
            }
            .pretty(),
            "app.Foo@ff"
        );
    }

    #[test]
    fn test_type_name_fallbacks() {
        let mut types = HashMap::new();
        types.insert(40, Arc::new(Type::new(40, "app.Bar", [], [])));

        assert_eq!(types.type_name(40), "app.Bar");
        assert_eq!(types.type_name(BUILTIN_TYPES.string.id), "string");
        assert_eq!(BuiltinResolver.type_name(999), "type#999");
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_value(ObjectRecord::String { value: "x".into() }).unwrap();
        assert_eq!(json["kind"], "string");
        assert_eq!(json["value"], "x");
    }
}
