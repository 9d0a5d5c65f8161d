// packages/engine/src/objects/recorders.rs
//! Recorder variants and the decoding side of their formats
//!
//! ```text
//! encoded object = [recorder id u8][type id u64][recorder payload]
//! ```
//!
//! Every payload is self-delimiting, so nested objects inside collections and
//! maps are written back to back without a length prefix.

use crate::model::types::{Type, TypeTrait};
use crate::objects::record::{ObjectRecord, TypeResolver};
use crate::objects::registry::MAX_NESTING_DEPTH;
use crate::objects::value::Value;
use crate::utils::errors::{EngineError, Result};
use crate::wire::binary::ByteReader;

/// Payload flag: elements (or rendered text) follow
pub(crate) const RECORDED_FLAG: u8 = 1;
/// Payload flag: the recorder fell back to identity
pub(crate) const IDENTITY_FLAG: u8 = 0;

/// Bytes recorded from the head of a byte array
pub(crate) const BYTES_HEAD_LEN: usize = 16;

/// Built-in recorders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderKind {
    String,
    Integral,
    Boolean,
    Bytes,
    Collection,
    Map,
    Char,
    Number,
    Throwable,
    Printing,
    Identity,
    Null,
}

impl RecorderKind {
    /// Recorders in dispatch order; identity is the terminal catch-all
    pub const PRIORITY: [RecorderKind; 11] = [
        RecorderKind::String,
        RecorderKind::Integral,
        RecorderKind::Boolean,
        RecorderKind::Bytes,
        RecorderKind::Collection,
        RecorderKind::Map,
        RecorderKind::Char,
        RecorderKind::Number,
        RecorderKind::Throwable,
        RecorderKind::Printing,
        RecorderKind::Identity,
    ];

    pub fn id(self) -> u8 {
        match self {
            RecorderKind::Identity => 0,
            RecorderKind::String => 2,
            RecorderKind::Throwable => 5,
            RecorderKind::Number => 8,
            RecorderKind::Null => 9,
            RecorderKind::Collection => 10,
            RecorderKind::Integral => 12,
            RecorderKind::Map => 13,
            RecorderKind::Char => 28,
            RecorderKind::Bytes => 29,
            RecorderKind::Printing => 91,
            RecorderKind::Boolean => 100,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        let kind = match id {
            0 => RecorderKind::Identity,
            2 => RecorderKind::String,
            5 => RecorderKind::Throwable,
            8 => RecorderKind::Number,
            9 => RecorderKind::Null,
            10 => RecorderKind::Collection,
            12 => RecorderKind::Integral,
            13 => RecorderKind::Map,
            28 => RecorderKind::Char,
            29 => RecorderKind::Bytes,
            91 => RecorderKind::Printing,
            100 => RecorderKind::Boolean,
            _ => return None,
        };
        Some(kind)
    }

    /// Dispatch order; lower goes first
    pub fn order(self) -> u8 {
        match self {
            RecorderKind::String | RecorderKind::Integral => 0,
            RecorderKind::Boolean | RecorderKind::Bytes | RecorderKind::Collection | RecorderKind::Map => 1,
            RecorderKind::Char => 8,
            RecorderKind::Number => 10,
            RecorderKind::Throwable => 20,
            RecorderKind::Printing => 99,
            RecorderKind::Identity | RecorderKind::Null => u8::MAX,
        }
    }

    /// Whether this recorder can write `value` of type `ty`
    pub fn supports(self, ty: &Type, value: &Value) -> bool {
        match self {
            RecorderKind::String => ty.has_trait(TypeTrait::String) && matches!(value, Value::Str(_)),
            RecorderKind::Integral => ty.has_trait(TypeTrait::Integral) && matches!(value, Value::Int(_)),
            RecorderKind::Boolean => ty.has_trait(TypeTrait::Boolean) && matches!(value, Value::Bool(_)),
            RecorderKind::Bytes => ty.has_trait(TypeTrait::ByteArray) && matches!(value, Value::Bytes(_)),
            RecorderKind::Collection => {
                ty.has_trait(TypeTrait::Collection) && matches!(value, Value::List(_) | Value::Object(_))
            }
            RecorderKind::Map => ty.has_trait(TypeTrait::Map) && matches!(value, Value::Map(_)),
            RecorderKind::Char => ty.has_trait(TypeTrait::Char) && matches!(value, Value::Char(_)),
            RecorderKind::Number => {
                ty.has_trait(TypeTrait::Number) && matches!(value, Value::Float(_) | Value::Int(_))
            }
            RecorderKind::Throwable => {
                ty.has_trait(TypeTrait::Throwable) && matches!(value, Value::Throwable { .. })
            }
            RecorderKind::Printing => ty.has_trait(TypeTrait::Printable) && matches!(value, Value::Object(_)),
            RecorderKind::Identity => true,
            RecorderKind::Null => value.is_null(),
        }
    }
}

/// Decode one encoded object
pub fn decode_object(data: &[u8], types: &dyn TypeResolver) -> Result<ObjectRecord> {
    if data.is_empty() {
        return Ok(ObjectRecord::NotRecorded);
    }
    let mut reader = ByteReader::new(data);
    let record = read_object(&mut reader, types, 0)?;
    if !reader.is_empty() {
        return Err(EngineError::DecodingFailed(format!(
            "{} trailing bytes after object",
            reader.remaining()
        )));
    }
    Ok(record)
}

/// Read one object nested `depth` levels deep from `reader`
///
/// Writers never nest deeper than [`MAX_NESTING_DEPTH`], so anything deeper
/// is corrupt and rejected before it can exhaust the stack.
fn read_object(reader: &mut ByteReader<'_>, types: &dyn TypeResolver, depth: usize) -> Result<ObjectRecord> {
    if depth > MAX_NESTING_DEPTH {
        return Err(EngineError::DecodingFailed(format!(
            "Object nested deeper than {} levels",
            MAX_NESTING_DEPTH
        )));
    }
    let id = reader.read_u8()?;
    let kind = RecorderKind::from_id(id)
        .ok_or_else(|| EngineError::DecodingFailed(format!("Unknown recorder id {}", id)))?;
    let type_id = reader.read_u64()?;

    let record = match kind {
        RecorderKind::Null => ObjectRecord::Null,
        RecorderKind::String => ObjectRecord::String {
            value: reader.read_str()?,
        },
        RecorderKind::Integral => ObjectRecord::Integral {
            type_name: types.type_name(type_id),
            value: reader.read_i64()?,
        },
        RecorderKind::Number => ObjectRecord::Number {
            type_name: types.type_name(type_id),
            value: reader.read_f64()?,
        },
        RecorderKind::Boolean => ObjectRecord::Bool {
            value: reader.read_bool()?,
        },
        RecorderKind::Char => {
            let code = reader.read_u32()?;
            let value = char::from_u32(code)
                .ok_or_else(|| EngineError::DecodingFailed(format!("Invalid char {:#x}", code)))?;
            ObjectRecord::Char { value }
        }
        RecorderKind::Bytes => {
            let len = reader.read_u32()?;
            let head = reader.read_blob()?.to_vec();
            ObjectRecord::Bytes { len, head }
        }
        RecorderKind::Collection => {
            if reader.read_u8()? == RECORDED_FLAG {
                let size = reader.read_u32()?;
                let count = reader.read_u32()?;
                let mut elements = Vec::with_capacity(count.min(64) as usize);
                for _ in 0..count {
                    elements.push(read_object(reader, types, depth + 1)?);
                }
                ObjectRecord::Collection {
                    type_name: types.type_name(type_id),
                    size,
                    elements,
                }
            } else {
                read_identity(reader, types, type_id)?
            }
        }
        RecorderKind::Map => {
            if reader.read_u8()? == RECORDED_FLAG {
                let size = reader.read_u32()?;
                let count = reader.read_u32()?;
                let mut entries = Vec::with_capacity(count.min(64) as usize);
                for _ in 0..count {
                    let key = read_object(reader, types, depth + 1)?;
                    let value = read_object(reader, types, depth + 1)?;
                    entries.push((key, value));
                }
                ObjectRecord::Map {
                    type_name: types.type_name(type_id),
                    size,
                    entries,
                }
            } else {
                read_identity(reader, types, type_id)?
            }
        }
        RecorderKind::Throwable => {
            let message = if reader.read_bool()? {
                Some(reader.read_str()?)
            } else {
                None
            };
            ObjectRecord::Throwable {
                type_name: types.type_name(type_id),
                message,
            }
        }
        RecorderKind::Printing => {
            let flag = reader.read_u8()?;
            let identity_hash = reader.read_u32()?;
            if flag == RECORDED_FLAG {
                ObjectRecord::Printed {
                    type_name: types.type_name(type_id),
                    identity_hash,
                    text: reader.read_str()?,
                }
            } else {
                ObjectRecord::Identity {
                    type_name: types.type_name(type_id),
                    identity_hash,
                }
            }
        }
        RecorderKind::Identity => read_identity(reader, types, type_id)?,
    };
    Ok(record)
}

fn read_identity(reader: &mut ByteReader<'_>, types: &dyn TypeResolver, type_id: u64) -> Result<ObjectRecord> {
    Ok(ObjectRecord::Identity {
        type_name: types.type_name(type_id),
        identity_hash: reader.read_u32()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::BUILTIN_TYPES;
    use crate::objects::record::BuiltinResolver;

    #[test]
    fn test_ids_round_trip() {
        for kind in RecorderKind::PRIORITY.iter().chain([RecorderKind::Null].iter()) {
            assert_eq!(RecorderKind::from_id(kind.id()), Some(*kind));
        }
        assert_eq!(RecorderKind::from_id(77), None);
    }

    #[test]
    fn test_priority_is_sorted_by_order() {
        let orders: Vec<u8> = RecorderKind::PRIORITY.iter().map(|k| k.order()).collect();
        let mut sorted = orders.clone();
        sorted.sort();
        assert_eq!(orders, sorted);
    }

    #[test]
    fn test_supports_requires_matching_value() {
        let string = &BUILTIN_TYPES.string;
        assert!(RecorderKind::String.supports(string, &Value::from("x")));
        assert!(!RecorderKind::String.supports(string, &Value::Int(1)));
        assert!(RecorderKind::Number.supports(&BUILTIN_TYPES.integral, &Value::Int(1)));
        assert!(RecorderKind::Identity.supports(string, &Value::Null));
    }

    #[test]
    fn test_empty_object_is_not_recorded() {
        assert_eq!(decode_object(&[], &BuiltinResolver).unwrap(), ObjectRecord::NotRecorded);
    }

    #[test]
    fn test_unknown_recorder_id() {
        let mut data = vec![77u8];
        data.extend_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            decode_object(&data, &BuiltinResolver),
            Err(EngineError::DecodingFailed(_))
        ));
    }

    /// `levels` list headers each holding one element, around a null
    fn nested_lists(levels: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for _ in 0..levels {
            data.push(RecorderKind::Collection.id());
            data.extend_from_slice(&BUILTIN_TYPES.list.id.to_le_bytes());
            data.push(RECORDED_FLAG);
            data.extend_from_slice(&1u32.to_le_bytes());
            data.extend_from_slice(&1u32.to_le_bytes());
        }
        data.push(RecorderKind::Null.id());
        data.extend_from_slice(&BUILTIN_TYPES.null.id.to_le_bytes());
        data
    }

    #[test]
    fn test_nesting_within_limit_decodes() {
        let record = decode_object(&nested_lists(MAX_NESTING_DEPTH), &BuiltinResolver).unwrap();
        let mut depth = 0;
        let mut current = &record;
        while let ObjectRecord::Collection { elements, .. } = current {
            depth += 1;
            current = &elements[0];
        }
        assert_eq!(depth, MAX_NESTING_DEPTH);
        assert_eq!(*current, ObjectRecord::Null);
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        assert!(matches!(
            decode_object(&nested_lists(MAX_NESTING_DEPTH + 1), &BuiltinResolver),
            Err(EngineError::DecodingFailed(_))
        ));
        // far past any stack budget
        assert!(matches!(
            decode_object(&nested_lists(200_000), &BuiltinResolver),
            Err(EngineError::DecodingFailed(_))
        ));
    }
}
