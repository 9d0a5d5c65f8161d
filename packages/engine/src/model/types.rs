// packages/engine/src/model/types.rs
//! Runtime types and the traits used for recorder dispatch

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Classification of a type, set once when the type is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TypeTrait {
    ConcreteClass = 0,
    Throwable = 1,
    RootObject = 2,
    String = 3,
    Primitive = 4,
    Number = 5,
    Boolean = 6,
    Integral = 7,
    Char = 8,
    Fractional = 9,
    ByteArray = 10,
    NonPrimitiveArray = 11,
    Enum = 12,
    Collection = 13,
    Map = 14,
    Interface = 15,
    TypeVar = 16,
    ClassObject = 17,
    Printable = 18,
    Null = 19,
    Unknown = 20,
}

impl TypeTrait {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use TypeTrait::*;
        let value = match code {
            0 => ConcreteClass,
            1 => Throwable,
            2 => RootObject,
            3 => String,
            4 => Primitive,
            5 => Number,
            6 => Boolean,
            7 => Integral,
            8 => Char,
            9 => Fractional,
            10 => ByteArray,
            11 => NonPrimitiveArray,
            12 => Enum,
            13 => Collection,
            14 => Map,
            15 => Interface,
            16 => TypeVar,
            17 => ClassObject,
            18 => Printable,
            19 => Null,
            20 => Unknown,
            _ => return None,
        };
        Some(value)
    }
}

/// A runtime type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type {
    pub id: u64,
    pub name: String,
    pub traits: BTreeSet<TypeTrait>,
    pub super_type_names: BTreeSet<String>,
}

impl Type {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        traits: impl IntoIterator<Item = TypeTrait>,
        super_type_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            traits: traits.into_iter().collect(),
            super_type_names: super_type_names.into_iter().collect(),
        }
    }

    pub fn has_trait(&self, type_trait: TypeTrait) -> bool {
        self.traits.contains(&type_trait)
    }

    /// Whether this is one of the reserved builtin types
    pub fn is_builtin(&self) -> bool {
        self.id < FIRST_USER_TYPE_ID
    }
}

pub const NULL_TYPE_ID: u64 = 1;
pub const BOOL_TYPE_ID: u64 = 2;
pub const INTEGRAL_TYPE_ID: u64 = 3;
pub const FLOAT_TYPE_ID: u64 = 4;
pub const CHAR_TYPE_ID: u64 = 5;
pub const STRING_TYPE_ID: u64 = 6;
pub const BYTES_TYPE_ID: u64 = 7;
pub const LIST_TYPE_ID: u64 = 8;
pub const MAP_TYPE_ID: u64 = 9;
pub const ERROR_TYPE_ID: u64 = 10;
pub const UNKNOWN_TYPE_ID: u64 = 11;

/// Ids below this value are reserved for builtin types
pub const FIRST_USER_TYPE_ID: u64 = 16;

/// Builtin types shared by every recorder and reader
pub struct BuiltinTypes {
    pub null: Arc<Type>,
    pub boolean: Arc<Type>,
    pub integral: Arc<Type>,
    pub float: Arc<Type>,
    pub char: Arc<Type>,
    pub string: Arc<Type>,
    pub bytes: Arc<Type>,
    pub list: Arc<Type>,
    pub map: Arc<Type>,
    pub error: Arc<Type>,
    pub unknown: Arc<Type>,
}

impl BuiltinTypes {
    pub fn all(&self) -> Vec<Arc<Type>> {
        vec![
            Arc::clone(&self.null),
            Arc::clone(&self.boolean),
            Arc::clone(&self.integral),
            Arc::clone(&self.float),
            Arc::clone(&self.char),
            Arc::clone(&self.string),
            Arc::clone(&self.bytes),
            Arc::clone(&self.list),
            Arc::clone(&self.map),
            Arc::clone(&self.error),
            Arc::clone(&self.unknown),
        ]
    }
}

fn builtin(id: u64, name: &str, traits: &[TypeTrait]) -> Arc<Type> {
    Arc::new(Type::new(id, name, traits.iter().copied(), std::iter::empty()))
}

/// Process-wide builtin type table
pub static BUILTIN_TYPES: Lazy<BuiltinTypes> = Lazy::new(|| {
    use TypeTrait::*;
    BuiltinTypes {
        null: builtin(NULL_TYPE_ID, "null", &[Null]),
        boolean: builtin(BOOL_TYPE_ID, "bool", &[Primitive, Boolean]),
        integral: builtin(INTEGRAL_TYPE_ID, "i64", &[Primitive, Number, Integral]),
        float: builtin(FLOAT_TYPE_ID, "f64", &[Primitive, Number, Fractional]),
        char: builtin(CHAR_TYPE_ID, "char", &[Primitive, Char]),
        string: builtin(STRING_TYPE_ID, "string", &[String, ConcreteClass]),
        bytes: builtin(BYTES_TYPE_ID, "bytes", &[ByteArray]),
        list: builtin(LIST_TYPE_ID, "list", &[Collection, ConcreteClass]),
        map: builtin(MAP_TYPE_ID, "map", &[Map, ConcreteClass]),
        error: builtin(ERROR_TYPE_ID, "error", &[Throwable, ConcreteClass]),
        unknown: builtin(UNKNOWN_TYPE_ID, "unknown", &[Unknown]),
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trait_codes_round_trip() {
        for code in 0..=20u8 {
            let t = TypeTrait::from_code(code).unwrap();
            assert_eq!(t.code(), code);
        }
        assert!(TypeTrait::from_code(200).is_none());
    }

    #[test]
    fn test_builtins_are_reserved() {
        for ty in BUILTIN_TYPES.all() {
            assert!(ty.is_builtin(), "{} should be builtin", ty.name);
        }
        assert!(BUILTIN_TYPES.string.has_trait(TypeTrait::String));
        assert!(!Type::new(FIRST_USER_TYPE_ID, "a.B", [], []).is_builtin());
    }
}
