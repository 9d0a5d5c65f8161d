// packages/engine/src/model/record.rs
//! Call ids and decoded enter / exit records

use crate::objects::ObjectRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Call identifier, unique and gap-free within one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl CallId {
    /// The root call of every recording
    pub const ROOT: CallId = CallId(1);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }

    pub fn next(self) -> CallId {
        CallId(self.0 + 1)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A method entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnterRecord {
    pub recording_id: i32,
    pub call_id: CallId,
    pub method_id: u64,
    pub callee: ObjectRecord,
    pub args: Vec<ObjectRecord>,
    pub timestamp_nanos: Option<i64>,
}

/// How a call ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitValue {
    Returned(ObjectRecord),
    Thrown(ObjectRecord),
}

impl ExitValue {
    pub fn record(&self) -> &ObjectRecord {
        match self {
            ExitValue::Returned(record) | ExitValue::Thrown(record) => record,
        }
    }

    pub fn is_thrown(&self) -> bool {
        matches!(self, ExitValue::Thrown(_))
    }
}

/// A method exit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitRecord {
    pub recording_id: i32,
    pub call_id: CallId,
    pub value: ExitValue,
    pub timestamp_nanos: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_call_id() {
        assert!(CallId::ROOT.is_root());
        assert_eq!(CallId::ROOT.next(), CallId(2));
        assert!(!CallId(2).is_root());
    }

    #[test]
    fn test_exit_value() {
        let thrown = ExitValue::Thrown(ObjectRecord::Null);
        assert!(thrown.is_thrown());
        assert_eq!(thrown.record(), &ObjectRecord::Null);
    }
}
