use crate::result::MethodResult;

/// Write-only sink for finished results.
///
/// Hooks run on the scheduler's state lock, so implementations must not
/// block and always observe `test_start` strictly before `test_complete`
/// for a given method.
pub trait Reporter: Send + Sync {
    fn test_start(&self, result: &MethodResult);
    fn test_complete(&self, result: &MethodResult);
    /// Called once at the end of the run; false marks the run as failed.
    fn report(&self) -> bool;
}

pub struct PrintReporter {}

impl Reporter for PrintReporter {
    fn test_start(&self, result: &MethodResult) {
        tracing::debug!(
            class_path = %result.class_path(),
            method = %result.method.name,
            "test started"
        );
    }

    fn test_complete(&self, result: &MethodResult) {
        tracing::info!(
            class_path = %result.class_path(),
            method = %result.method.name,
            success = result.success,
            retried = result.previous_run.is_some(),
            "test complete"
        );
    }

    fn report(&self) -> bool {
        true
    }
}
