// packages/engine/src/model/method.rs
//! Instrumented methods

use serde::{Deserialize, Serialize};
use std::fmt;

/// A method or constructor, registered once per call site and shared by all recordings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub id: u64,
    pub name: String,
    pub declaring_type_id: u64,
    pub is_static: bool,
    pub is_constructor: bool,
    pub returns_something: bool,
}

impl Method {
    /// `Type.name` style description, given the declaring type name
    pub fn to_short_string(&self, declaring_type_name: &str) -> String {
        let simple = declaring_type_name
            .rsplit(['.', ':'])
            .next()
            .unwrap_or(declaring_type_name);
        format!("{}.{}", simple, self.name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_string() {
        let method = Method {
            id: 7,
            name: "run".to_string(),
            declaring_type_id: 20,
            is_static: false,
            is_constructor: false,
            returns_something: true,
        };
        assert_eq!(method.to_short_string("com.example.Worker"), "Worker.run");
        assert_eq!(method.to_short_string("app::jobs::Worker"), "Worker.run");
        assert_eq!(method.to_string(), "run#7");
    }
}
