//! The executable step of a compiled chain.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ExternalCallError;
use crate::runtime::context::ChainContext;

/// Where a unit sends answer tokens while it runs.
#[derive(Debug, Clone)]
pub struct TokenSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl TokenSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, token: impl Into<String>) {
        if let Some(tx) = &self.tx {
            // A closed receiver means nobody is listening any more.
            let _ = tx.send(token.into());
        }
    }
}

/// A bound, executable instance of a function definition.
///
/// Units are immutable once built and shared by every execution of their
/// chain; all per-request state lives in the [`ChainContext`] they receive.
#[async_trait]
pub trait FunctionalUnit: Send + Sync + std::fmt::Debug {
    /// The function kind this unit was built from.
    fn kind(&self) -> &str;

    /// Whether running the unit twice is harmless, making it safe to retry.
    fn idempotent(&self) -> bool {
        true
    }

    /// Run the step, reading and updating `ctx`. The returned text becomes
    /// `ctx.previous_output` for the next unit.
    async fn run(&self, ctx: &mut ChainContext, sink: &TokenSink) -> Result<String, ExternalCallError>;
}

/// Validated parameters handed to a unit factory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundParams {
    values: BTreeMap<String, Value>,
}

impl BoundParams {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn usize(&self, name: &str) -> Option<usize> {
        self.get(name)
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn f32(&self, name: &str) -> Option<f32> {
        self.get(name).and_then(Value::as_f64).map(|n| n as f32)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bound_params_accessors() {
        let params = BoundParams::new(BTreeMap::from([
            ("k".to_string(), json!(5)),
            ("t".to_string(), json!(0.5)),
            ("s".to_string(), json!("x")),
            ("b".to_string(), json!(true)),
            ("n".to_string(), Value::Null),
        ]));
        assert_eq!(params.usize("k"), Some(5));
        assert_eq!(params.f32("t"), Some(0.5));
        assert_eq!(params.str("s"), Some("x"));
        assert_eq!(params.bool("b"), Some(true));
        assert!(params.get("n").is_none());
        assert!(params.usize("s").is_none());
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TokenSink::new(tx);
        sink.emit("a");
        sink.emit(String::from("b"));
        drop(sink);
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
        assert_eq!(rx.recv().await, None);
        TokenSink::discard().emit("ignored");
    }
}
