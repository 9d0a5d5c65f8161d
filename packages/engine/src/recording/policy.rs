// packages/engine/src/recording/policy.rs
//! Start-recording policies
//!
//! Consulted only when a thread's session is idle and an instrumented method
//! is entered. Once a recording has started it runs until its root call exits.

use crate::model::Method;
use crate::utils::errors::{EngineError, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decides whether a recording may start at `method`
pub trait StartRecordingPolicy: Send + Sync {
    fn can_start_recording(&self, method: &Method) -> bool;
}

/// Start wherever instrumentation says so
#[derive(Debug, Default)]
pub struct AlwaysEnabled;

impl StartRecordingPolicy for AlwaysEnabled {
    fn can_start_recording(&self, _method: &Method) -> bool {
        true
    }
}

/// Never start; used when recording is switched on through [`Overridable`]
#[derive(Debug, Default)]
pub struct Disabled;

impl StartRecordingPolicy for Disabled {
    fn can_start_recording(&self, _method: &Method) -> bool {
        false
    }
}

/// Start only once `delay` has passed since the policy was created
#[derive(Debug)]
pub struct DelayBased {
    enabled_at: Instant,
}

impl DelayBased {
    pub fn new(delay: Duration) -> Self {
        Self {
            enabled_at: Instant::now() + delay,
        }
    }
}

impl StartRecordingPolicy for DelayBased {
    fn can_start_recording(&self, _method: &Method) -> bool {
        Instant::now() >= self.enabled_at
    }
}

/// Start only at the given methods
#[derive(Debug, Default)]
pub struct StartMethods {
    method_ids: HashSet<u64>,
}

impl StartMethods {
    pub fn new(method_ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            method_ids: method_ids.into_iter().collect(),
        }
    }
}

impl StartRecordingPolicy for StartMethods {
    fn can_start_recording(&self, method: &Method) -> bool {
        self.method_ids.contains(&method.id)
    }
}

const DEFER: u8 = 0;
const FORCE_ON: u8 = 1;
const FORCE_OFF: u8 = 2;

/// Wraps a policy with an external on/off switch
pub struct Overridable {
    inner: Box<dyn StartRecordingPolicy>,
    state: AtomicU8,
}

impl Overridable {
    pub fn new(inner: impl StartRecordingPolicy + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            state: AtomicU8::new(DEFER),
        }
    }

    pub fn enable(&self) {
        self.state.store(FORCE_ON, Ordering::Release);
    }

    pub fn disable(&self) {
        self.state.store(FORCE_OFF, Ordering::Release);
    }

    /// Hand the decision back to the wrapped policy
    pub fn reset(&self) {
        self.state.store(DEFER, Ordering::Release);
    }
}

impl StartRecordingPolicy for Overridable {
    fn can_start_recording(&self, method: &Method) -> bool {
        match self.state.load(Ordering::Acquire) {
            FORCE_ON => true,
            FORCE_OFF => false,
            _ => self.inner.can_start_recording(method),
        }
    }
}

impl<P: StartRecordingPolicy + ?Sized> StartRecordingPolicy for Arc<P> {
    fn can_start_recording(&self, method: &Method) -> bool {
        (**self).can_start_recording(method)
    }
}

/// Parse `"default"` (or empty), `"api"` or `"delay:<seconds>"`
pub fn parse_policy(text: &str) -> Result<Overridable> {
    let text = text.trim();
    let policy = match text {
        "" | "default" => Overridable::new(AlwaysEnabled),
        "api" => Overridable::new(Disabled),
        _ => match text.strip_prefix("delay:") {
            Some(secs) => {
                let secs: u64 = secs
                    .trim()
                    .parse()
                    .map_err(|e| EngineError::ConfigError(format!("Invalid delay '{}': {}", secs, e)))?;
                Overridable::new(DelayBased::new(Duration::from_secs(secs)))
            }
            None => {
                return Err(EngineError::ConfigError(format!(
                    "Unsupported recording policy: {}",
                    text
                )))
            }
        },
    };
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(id: u64) -> Method {
        Method {
            id,
            name: "run".into(),
            declaring_type_id: 16,
            is_static: true,
            is_constructor: false,
            returns_something: false,
        }
    }

    #[test]
    fn test_parse() {
        assert!(parse_policy("").unwrap().can_start_recording(&method(1)));
        assert!(parse_policy("default").unwrap().can_start_recording(&method(1)));
        assert!(!parse_policy("api").unwrap().can_start_recording(&method(1)));
        assert!(!parse_policy("delay:3600").unwrap().can_start_recording(&method(1)));
        assert!(parse_policy("delay:0").unwrap().can_start_recording(&method(1)));
        assert!(parse_policy("delay:soon").is_err());
        assert!(parse_policy("sometimes").is_err());
    }

    #[test]
    fn test_override() {
        let policy = parse_policy("api").unwrap();
        policy.enable();
        assert!(policy.can_start_recording(&method(1)));
        policy.disable();
        assert!(!policy.can_start_recording(&method(1)));
        policy.reset();
        assert!(!policy.can_start_recording(&method(1)));
    }

    #[test]
    fn test_start_methods() {
        let policy = StartMethods::new([7]);
        assert!(policy.can_start_recording(&method(7)));
        assert!(!policy.can_start_recording(&method(8)));
    }
}
