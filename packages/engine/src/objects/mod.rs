// packages/engine/src/objects/mod.rs
//! Object recording
//!
//! Instrumentation hands the engine [`Value`]s; the session's
//! [`ObjectRecorderRegistry`] turns them into bytes and readers decode them
//! back into [`ObjectRecord`]s.

pub mod record;
pub mod recorders;
pub mod registry;
pub mod value;

pub use record::{BuiltinResolver, ObjectRecord, TypeResolver};
pub use recorders::{decode_object, RecorderKind};
pub use registry::ObjectRecorderRegistry;
pub use value::{HostObject, Value};
