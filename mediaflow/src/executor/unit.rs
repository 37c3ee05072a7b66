//! The stage unit contract.

use crate::core::StageId;
use crate::errors::UnitFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// The JSON document handed to a stage unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRequest {
    /// The stage being run.
    pub stage: StageId,
    /// The working directory of the unit of work.
    pub workdir: PathBuf,
    /// Upstream output, or null when the unit locates its own input.
    pub input: Value,
    /// Named parameters.
    pub params: Value,
}

/// Receives a running unit's completion fraction, nominally in `[0, 1]`.
pub type UnitProgress<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// A blocking stage implementation.
pub trait StageUnit: Send + Sync {
    /// Runs the stage and returns its JSON output, reporting partial
    /// completion through `progress` as it goes.
    fn invoke(&self, request: &UnitRequest, progress: &UnitProgress<'_>) -> Result<Value, UnitFailure>;
}

/// A non-blocking stage implementation.
///
/// Suspension happens only while awaiting the unit; the orchestrator never
/// interleaves work inside a stage.
#[async_trait]
pub trait AsyncStageUnit: Send + Sync {
    /// Runs the stage and returns its JSON output, reporting partial
    /// completion through `progress` as it goes.
    async fn invoke(
        &self,
        request: &UnitRequest,
        progress: &UnitProgress<'_>,
    ) -> Result<Value, UnitFailure>;
}

impl<U: StageUnit + ?Sized> StageUnit for Arc<U> {
    fn invoke(&self, request: &UnitRequest, progress: &UnitProgress<'_>) -> Result<Value, UnitFailure> {
        (**self).invoke(request, progress)
    }
}

#[async_trait]
impl<U: AsyncStageUnit + ?Sized> AsyncStageUnit for Arc<U> {
    async fn invoke(
        &self,
        request: &UnitRequest,
        progress: &UnitProgress<'_>,
    ) -> Result<Value, UnitFailure> {
        (**self).invoke(request, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = UnitRequest {
            stage: StageId::Align,
            workdir: PathBuf::from("/work/ep"),
            input: Value::Null,
            params: json!({"model": "base"}),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "stage": "align",
                "workdir": "/work/ep",
                "input": null,
                "params": {"model": "base"}
            })
        );
    }
}
