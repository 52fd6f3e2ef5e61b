//! Operator functions - the opaque computation behind each operator
//!
//! Functions are compute-only: they read the operator descriptor and the
//! payloads of upstream operators and return a payload. They never touch
//! worker state.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::coord::types::{OperatorId, Payload, RunId, WorkerAddress};

/// Context for one operator execution (immutable, clonable)
#[derive(Debug, Clone)]
pub struct OperatorCtx {
    pub run_id: RunId,
    pub operator_id: OperatorId,
    /// Worker executing the operator
    pub worker: WorkerAddress,
    /// Descriptor from the workflow definition
    pub payload: Payload,
    /// Upstream operator → its result payload
    pub inputs: BTreeMap<OperatorId, Payload>,
}

impl OperatorCtx {
    /// Get an upstream result by operator id
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, upstream: &str) -> anyhow::Result<T> {
        let value = self
            .inputs
            .get(&OperatorId::from(upstream))
            .ok_or_else(|| anyhow::anyhow!("Input from '{}' not found", upstream))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize input from '{}': {}", upstream, e))
    }

    /// Inputs as a JSON object keyed by upstream id
    pub fn inputs_json(&self) -> Value {
        let map: Map<String, Value> = self
            .inputs
            .iter()
            .map(|(id, value)| (id.as_str().to_string(), value.clone()))
            .collect();
        Value::Object(map)
    }
}

/// The opaque per-operator execution function
#[async_trait]
pub trait OperatorFunction: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &OperatorCtx) -> anyhow::Result<Payload>;
}

/// Echo function: returns its descriptor and inputs
pub struct EchoFunction;

#[async_trait]
impl OperatorFunction for EchoFunction {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &OperatorCtx) -> anyhow::Result<Payload> {
        tracing::info!("Echo operator: {} on {}", ctx.operator_id, ctx.worker);
        Ok(json!({
            "operator": ctx.operator_id,
            "payload": ctx.payload,
            "inputs": ctx.inputs_json(),
        }))
    }
}

type BoxedFn = dyn Fn(OperatorCtx) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync;

/// Wraps an async closure as an [`OperatorFunction`]
#[derive(Clone)]
pub struct FnOperator {
    name: String,
    func: Arc<BoxedFn>,
}

impl FnOperator {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(OperatorCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |ctx| Box::pin(func(ctx))),
        }
    }
}

#[async_trait]
impl OperatorFunction for FnOperator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &OperatorCtx) -> anyhow::Result<Payload> {
        (self.func)(ctx.clone()).await
    }
}
