// packages/engine/src/objects/value.rs
//! Runtime values handed to the recorder by instrumentation

use crate::model::types::{Type, BUILTIN_TYPES};
use std::fmt;
use std::sync::Arc;

/// An object owned by the host program
///
/// The engine never inspects host objects beyond this trait. Rendering and
/// element access may fail; the registry degrades to an identity record when
/// they do.
pub trait HostObject: fmt::Debug + Send + Sync {
    /// Runtime type of the object
    fn type_info(&self) -> &Arc<Type>;

    /// Identity of the object (stable for its lifetime)
    fn identity_hash(&self) -> u32;

    /// Human readable rendering
    fn render(&self) -> Result<String, String> {
        Err(format!("{} cannot be rendered", self.type_info().name))
    }

    /// Elements of a host collection, if the object is one
    fn elements(&self) -> Option<Result<Vec<Value>, String>> {
        None
    }
}

/// Value of an argument, callee or return value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Throwable { ty: Arc<Type>, message: Option<String> },
    Object(Arc<dyn HostObject>),
}

impl Value {
    pub fn str(value: impl Into<String>) -> Self {
        Value::Str(value.into())
    }

    /// Runtime type used for recorder dispatch
    pub fn type_info(&self) -> Arc<Type> {
        let builtin = &*BUILTIN_TYPES;
        match self {
            Value::Null => Arc::clone(&builtin.null),
            Value::Bool(_) => Arc::clone(&builtin.boolean),
            Value::Int(_) => Arc::clone(&builtin.integral),
            Value::Float(_) => Arc::clone(&builtin.float),
            Value::Char(_) => Arc::clone(&builtin.char),
            Value::Str(_) => Arc::clone(&builtin.string),
            Value::Bytes(_) => Arc::clone(&builtin.bytes),
            Value::List(_) => Arc::clone(&builtin.list),
            Value::Map(_) => Arc::clone(&builtin.map),
            Value::Throwable { ty, .. } => Arc::clone(ty),
            Value::Object(object) => Arc::clone(object.type_info()),
        }
    }

    /// Identity used when the value is recorded by identity only
    pub fn identity_hash(&self) -> u32 {
        match self {
            Value::Object(object) => object.identity_hash(),
            other => (other as *const Value as usize) as u32,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::TypeTrait;

    #[derive(Debug)]
    struct Opaque(Arc<Type>);

    impl HostObject for Opaque {
        fn type_info(&self) -> &Arc<Type> {
            &self.0
        }

        fn identity_hash(&self) -> u32 {
            0xBEEF
        }
    }

    #[test]
    fn test_builtin_types() {
        assert_eq!(Value::from("x").type_info().id, BUILTIN_TYPES.string.id);
        assert!(Value::Float(1.0).type_info().has_trait(TypeTrait::Fractional));
        assert!(Value::Null.is_null());
    }

    #[test]
    fn test_host_object_defaults() {
        let ty = Arc::new(Type::new(20, "app.Opaque", [TypeTrait::ConcreteClass], []));
        let object = Opaque(Arc::clone(&ty));
        assert!(object.render().is_err());
        assert!(object.elements().is_none());

        let value = Value::Object(Arc::new(object));
        assert_eq!(value.identity_hash(), 0xBEEF);
        assert_eq!(value.type_info().name, "app.Opaque");
    }
}
