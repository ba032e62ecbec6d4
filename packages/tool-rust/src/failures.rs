//! Collects per-peer failures of a distributed operation.

use parking_lot::Mutex;

use crate::error::{ToolError, ToolResult};

/// Thread-safe sink for failures raised while every peer is attempted.
#[derive(Debug, Default)]
pub struct FailureRecorder {
    reasons: Mutex<Vec<String>>,
}

impl FailureRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, reason: impl Into<String>) {
        self.reasons.lock().push(reason.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reasons.lock().is_empty()
    }

    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }

    /// `Ok` when nothing was recorded, otherwise a [`ToolError::Protocol`]
    /// carrying every reason.
    ///
    /// # Errors
    ///
    /// Returns the aggregate when at least one failure was recorded.
    pub fn reraise(&self) -> ToolResult<()> {
        let reasons = self.reasons();
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ToolError::Protocol { reasons })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reraise_aggregates_reasons() {
        let failures = FailureRecorder::new();
        assert!(failures.reraise().is_ok());
        failures.add("node a: prepare rejected");
        failures.add("node b: timeout");
        match failures.reraise() {
            Err(ToolError::Protocol { reasons }) => assert_eq!(reasons.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
