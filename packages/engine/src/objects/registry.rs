// packages/engine/src/objects/registry.rs
//! Recorder registry, owned by one recording session
//!
//! Picks the first recorder in priority order that supports a value's type
//! and caches the choice per type id. A recorder that fails once bans itself
//! for the rest of the session; the value it was writing is recorded by
//! identity instead. Nesting deeper than [`MAX_NESTING_DEPTH`] counts as a
//! failure of the enclosing collection or map recorder.

use crate::model::types::Type;
use crate::objects::recorders::{RecorderKind, BYTES_HEAD_LEN, IDENTITY_FLAG, RECORDED_FLAG};
use crate::objects::value::Value;
use crate::observability::VALUES_DEGRADED;
use crate::utils::errors::{EngineError, Result};
use crate::wire::binary::BinaryOutput;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Deepest nesting of collections and maps that is recorded
pub const MAX_NESTING_DEPTH: usize = 16;

/// Per-session recorder state
pub struct ObjectRecorderRegistry {
    max_collection_elements: usize,
    banned: HashSet<RecorderKind>,
    by_type: HashMap<u64, RecorderKind>,
    seen_types: HashSet<u64>,
    new_types: Vec<Arc<Type>>,
    degraded: u64,
}

impl ObjectRecorderRegistry {
    pub fn new(max_collection_elements: usize) -> Self {
        Self {
            max_collection_elements,
            banned: HashSet::new(),
            by_type: HashMap::new(),
            seen_types: HashSet::new(),
            new_types: Vec::new(),
            degraded: 0,
        }
    }

    /// Values recorded by identity because a recorder failed
    pub fn degraded(&self) -> u64 {
        self.degraded
    }

    pub fn is_banned(&self, kind: RecorderKind) -> bool {
        self.banned.contains(&kind)
    }

    /// Non-builtin types encountered since the last call
    pub fn take_new_types(&mut self) -> Vec<Arc<Type>> {
        std::mem::take(&mut self.new_types)
    }

    /// Encode `value` into `out`
    ///
    /// On error nothing is left in `out` beyond its original length.
    pub fn encode(&mut self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let mark = out.len();
        let result = self.encode_nested(value, out, 0);
        if result.is_err() {
            out.truncate(mark);
        }
        result
    }

    /// Encode an absent value
    pub fn encode_null(&self, out: &mut Vec<u8>) {
        out.write_u8(RecorderKind::Null.id());
        out.write_u64(Value::Null.type_info().id);
    }

    /// Recorder that will be used for `value`
    pub fn recorder_for(&mut self, ty: &Type, value: &Value) -> RecorderKind {
        if value.is_null() {
            return RecorderKind::Null;
        }
        if let Some(kind) = self.by_type.get(&ty.id) {
            if !self.banned.contains(kind) && kind.supports(ty, value) {
                return *kind;
            }
        }

        let kind = RecorderKind::PRIORITY
            .iter()
            .copied()
            .find(|kind| !self.banned.contains(kind) && kind.supports(ty, value))
            .unwrap_or(RecorderKind::Identity);
        self.by_type.insert(ty.id, kind);
        kind
    }

    fn encode_nested(&mut self, value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<()> {
        if depth > MAX_NESTING_DEPTH {
            return Err(EngineError::EncodingFailed(format!(
                "Nesting deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }

        let ty = value.type_info();
        self.note_type(&ty);
        let kind = self.recorder_for(&ty, value);

        out.write_u8(kind.id());
        out.write_u64(ty.id);

        match (kind, value) {
            (RecorderKind::Null, _) => {}
            (RecorderKind::String, Value::Str(s)) => out.write_str(s),
            (RecorderKind::Integral, Value::Int(v)) => out.write_i64(*v),
            (RecorderKind::Number, Value::Float(v)) => out.write_f64(*v),
            (RecorderKind::Number, Value::Int(v)) => out.write_f64(*v as f64),
            (RecorderKind::Boolean, Value::Bool(v)) => out.write_bool(*v),
            (RecorderKind::Char, Value::Char(c)) => out.write_u32(*c as u32),
            (RecorderKind::Bytes, Value::Bytes(bytes)) => {
                out.write_u32(bytes.len() as u32);
                out.write_blob(&bytes[..bytes.len().min(BYTES_HEAD_LEN)]);
            }
            (RecorderKind::Throwable, Value::Throwable { message, .. }) => {
                out.write_bool(message.is_some());
                if let Some(message) = message {
                    out.write_str(message);
                }
            }
            (RecorderKind::Collection, _) | (RecorderKind::Map, _) => {
                self.write_elements(kind, value, out, depth)
            }
            (RecorderKind::Printing, Value::Object(object)) => match object.render() {
                Ok(text) => {
                    out.write_u8(RECORDED_FLAG);
                    out.write_u32(object.identity_hash());
                    out.write_str(&text);
                }
                Err(reason) => {
                    self.ban(kind, &reason);
                    out.write_u8(IDENTITY_FLAG);
                    out.write_u32(object.identity_hash());
                }
            },
            _ => {
                // only identity remains; the header already says so
                out.write_u32(value.identity_hash());
            }
        }
        Ok(())
    }

    /// Collection or map payload; rolls back to identity on failure
    fn write_elements(&mut self, kind: RecorderKind, value: &Value, out: &mut Vec<u8>, depth: usize) {
        let mark = out.len();
        out.write_u8(RECORDED_FLAG);

        let written = match (kind, value) {
            (RecorderKind::Map, Value::Map(entries)) => self.write_entries(entries, out, depth),
            (_, Value::List(items)) => self.write_items(items, out, depth),
            (_, Value::Object(object)) => match object.elements() {
                Some(Ok(items)) => self.write_items(&items, out, depth),
                Some(Err(reason)) => Err(EngineError::EncodingFailed(reason)),
                None => Err(EngineError::EncodingFailed(format!(
                    "{} does not expose its elements",
                    object.type_info().name
                ))),
            },
            _ => Err(EngineError::EncodingFailed("Unexpected value for collection".to_string())),
        };

        if let Err(e) = written {
            out.truncate(mark);
            self.ban(kind, &e.to_string());
            out.write_u8(IDENTITY_FLAG);
            out.write_u32(value.identity_hash());
        }
    }

    fn write_items(&mut self, items: &[Value], out: &mut Vec<u8>, depth: usize) -> Result<()> {
        let count = items.len().min(self.max_collection_elements);
        out.write_u32(items.len() as u32);
        out.write_u32(count as u32);
        for item in &items[..count] {
            self.encode_nested(item, out, depth + 1)?;
        }
        Ok(())
    }

    fn write_entries(&mut self, entries: &[(Value, Value)], out: &mut Vec<u8>, depth: usize) -> Result<()> {
        let count = entries.len().min(self.max_collection_elements);
        out.write_u32(entries.len() as u32);
        out.write_u32(count as u32);
        for (key, value) in &entries[..count] {
            self.encode_nested(key, out, depth + 1)?;
            self.encode_nested(value, out, depth + 1)?;
        }
        Ok(())
    }

    fn ban(&mut self, kind: RecorderKind, reason: &str) {
        if self.banned.insert(kind) {
            info!("{:?} recorder disabled for this session after a failure: {}", kind, reason);
            self.by_type.retain(|_, cached| *cached != kind);
        } else {
            debug!("{:?} recorder failed again: {}", kind, reason);
        }
        self.degraded += 1;
        metrics::counter!(VALUES_DEGRADED).increment(1);
    }

    fn note_type(&mut self, ty: &Arc<Type>) {
        if !ty.is_builtin() && self.seen_types.insert(ty.id) {
            self.new_types.push(Arc::clone(ty));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{TypeTrait, BUILTIN_TYPES};
    use crate::objects::record::{BuiltinResolver, ObjectRecord};
    use crate::objects::recorders::decode_object;
    use crate::objects::value::HostObject;

    #[derive(Debug)]
    struct Widget {
        ty: Arc<Type>,
        text: Option<String>,
    }

    impl HostObject for Widget {
        fn type_info(&self) -> &Arc<Type> {
            &self.ty
        }

        fn identity_hash(&self) -> u32 {
            42
        }

        fn render(&self) -> std::result::Result<String, String> {
            self.text.clone().ok_or_else(|| "render failed".to_string())
        }
    }

    #[derive(Debug)]
    struct BrokenBag(Arc<Type>);

    impl HostObject for BrokenBag {
        fn type_info(&self) -> &Arc<Type> {
            &self.0
        }

        fn identity_hash(&self) -> u32 {
            7
        }

        fn elements(&self) -> Option<std::result::Result<Vec<Value>, String>> {
            Some(Err("modified during iteration".to_string()))
        }
    }

    fn printable() -> Arc<Type> {
        Arc::new(Type::new(30, "app.Widget", [TypeTrait::ConcreteClass, TypeTrait::Printable], []))
    }

    fn round_trip(registry: &mut ObjectRecorderRegistry, value: &Value) -> ObjectRecord {
        let mut out = Vec::new();
        registry.encode(value, &mut out).unwrap();
        decode_object(&out, &BuiltinResolver).unwrap()
    }

    #[test]
    fn test_scalars() {
        let mut registry = ObjectRecorderRegistry::new(3);
        assert_eq!(round_trip(&mut registry, &Value::from("x")), ObjectRecord::String { value: "x".into() });
        assert_eq!(round_trip(&mut registry, &Value::Bool(true)), ObjectRecord::Bool { value: true });
        assert_eq!(round_trip(&mut registry, &Value::Char('λ')), ObjectRecord::Char { value: 'λ' });
        assert_eq!(round_trip(&mut registry, &Value::Null), ObjectRecord::Null);
        assert_eq!(
            round_trip(&mut registry, &Value::Int(-5)),
            ObjectRecord::Integral {
                type_name: "i64".into(),
                value: -5
            }
        );
    }

    #[test]
    fn test_collection_is_capped() {
        let mut registry = ObjectRecorderRegistry::new(3);
        let list = Value::List((0..10).map(Value::Int).collect());

        match round_trip(&mut registry, &list) {
            ObjectRecord::Collection { size, elements, .. } => {
                assert_eq!(size, 10);
                assert_eq!(elements.len(), 3);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_map_entries() {
        let mut registry = ObjectRecorderRegistry::new(3);
        let map = Value::Map(vec![(Value::from("k"), Value::Int(1))]);

        match round_trip(&mut registry, &map) {
            ObjectRecord::Map { size, entries, .. } => {
                assert_eq!(size, 1);
                assert_eq!(entries[0].0, ObjectRecord::String { value: "k".into() });
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_failing_collection_bans_itself_and_falls_back_to_identity() {
        let mut registry = ObjectRecorderRegistry::new(3);
        let ty = Arc::new(Type::new(31, "app.Bag", [TypeTrait::Collection], []));
        let bag = Value::Object(Arc::new(BrokenBag(ty)));

        let record = round_trip(&mut registry, &Value::List(vec![bag]));

        // the outer list was already being written by the collection recorder
        match record {
            ObjectRecord::Collection { elements, .. } => {
                assert_eq!(
                    elements[0],
                    ObjectRecord::Identity {
                        type_name: "type#31".into(),
                        identity_hash: 7
                    }
                );
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert!(registry.is_banned(RecorderKind::Collection));
        assert_eq!(registry.degraded(), 1);

        // later lists are recorded by identity
        let later = round_trip(&mut registry, &Value::List(vec![Value::Int(1)]));
        assert!(matches!(later, ObjectRecord::Identity { .. }));
    }

    #[test]
    fn test_printing_recorder() {
        let mut registry = ObjectRecorderRegistry::new(3);
        let widget = Value::Object(Arc::new(Widget {
            ty: printable(),
            text: Some("Widget(1)".into()),
        }));

        assert_eq!(
            round_trip(&mut registry, &widget),
            ObjectRecord::Printed {
                type_name: "type#30".into(),
                identity_hash: 42,
                text: "Widget(1)".into()
            }
        );
        assert_eq!(registry.take_new_types().len(), 1);
        assert!(registry.take_new_types().is_empty());
    }

    #[test]
    fn test_printing_failure_bans_printer() {
        let mut registry = ObjectRecorderRegistry::new(3);
        let broken = Value::Object(Arc::new(Widget { ty: printable(), text: None }));
        let fine = Value::Object(Arc::new(Widget {
            ty: printable(),
            text: Some("ok".into()),
        }));

        assert!(matches!(round_trip(&mut registry, &broken), ObjectRecord::Identity { .. }));
        assert!(registry.is_banned(RecorderKind::Printing));
        assert!(matches!(round_trip(&mut registry, &fine), ObjectRecord::Identity { .. }));
    }

    #[test]
    fn test_throwable() {
        let mut registry = ObjectRecorderRegistry::new(3);
        let error = Value::Throwable {
            ty: Arc::clone(&BUILTIN_TYPES.error),
            message: Some("boom".into()),
        };
        assert_eq!(
            round_trip(&mut registry, &error),
            ObjectRecord::Throwable {
                type_name: "error".into(),
                message: Some("boom".into())
            }
        );
    }

    #[test]
    fn test_deep_nesting_degrades_innermost_list() {
        let mut registry = ObjectRecorderRegistry::new(3);
        let mut value = Value::Int(0);
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            value = Value::List(vec![value]);
        }

        let mut out = vec![1, 2, 3];
        // the innermost list fails, degrades to identity and the rest still encodes
        registry.encode(&value, &mut out).unwrap();
        assert!(out.len() > 3);
        assert!(registry.is_banned(RecorderKind::Collection));
    }
}
