// packages/engine/src/model/mod.rs
//! Data model shared by the writer and the reader

pub mod metadata;
pub mod method;
pub mod record;
pub mod types;

pub use metadata::{ProcessMetadata, RecordingMetadata};
pub use method::Method;
pub use record::{CallId, EnterRecord, ExitRecord, ExitValue};
pub use types::{Type, TypeTrait, BUILTIN_TYPES, FIRST_USER_TYPE_ID};
