use std::time::Duration;

use tokio::time::Instant;

use crate::queue::TestUnit;
use crate::result::MethodResult;

/// Ledger entry for a class that is currently some runner's
/// responsibility. Exists iff the class is checked out; removal is
/// authoritative.
pub struct CheckOut {
    pub runner: String,
    pub class_path: String,
    /// Methods still awaiting a result, in dispatch order.
    pub methods: Vec<String>,
    pub passed_methods: Vec<(String, MethodResult)>,
    pub failed_methods: Vec<(String, MethodResult)>,
    pub start_time: f64,
    /// Wall-clock deadline; pushed forward every time a result arrives.
    pub timeout_time: Instant,
}

impl CheckOut {
    pub fn new(runner: &str, test: &TestUnit, start_time: f64, runner_timeout: Duration) -> Self {
        CheckOut {
            runner: runner.to_string(),
            class_path: test.class_path.clone(),
            methods: test.methods.clone(),
            passed_methods: Vec::new(),
            failed_methods: Vec::new(),
            start_time,
            timeout_time: Instant::now() + runner_timeout,
        }
    }

    pub fn extend_deadline(&mut self, runner_timeout: Duration) {
        self.timeout_time = Instant::now() + runner_timeout;
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }

    pub fn remove_method(&mut self, name: &str) {
        self.methods.retain(|m| m != name);
    }

    pub fn record_passed(&mut self, result: MethodResult) {
        Self::upsert(&mut self.passed_methods, result);
    }

    pub fn record_failed(&mut self, result: MethodResult) {
        Self::upsert(&mut self.failed_methods, result);
    }

    // A repeated result for the same method (class teardown reporting
    // twice) replaces the earlier one instead of duplicating the entry.
    fn upsert(list: &mut Vec<(String, MethodResult)>, result: MethodResult) {
        let name = result.method.name.clone();
        match list.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = result,
            None => list.push((name, result)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::COMPLETION_SENTINEL;
    use crate::result::MethodInfo;

    fn unit() -> TestUnit {
        TestUnit {
            class_path: "m C".to_string(),
            methods: vec![
                "a".to_string(),
                "b".to_string(),
                COMPLETION_SENTINEL.to_string(),
            ],
            last_runner: None,
        }
    }

    fn passed(name: &str) -> MethodResult {
        MethodResult {
            method: MethodInfo {
                module: "m".to_string(),
                class: "C".to_string(),
                name: name.to_string(),
                full_name: None,
                fixture_type: None,
            },
            success: true,
            previous_run: None,
            start_time: None,
            end_time: None,
            run_time: None,
            normalized_run_time: None,
            complete: true,
            failure: None,
            error: None,
            interrupted: None,
            exception_info: None,
            exception_info_pretty: None,
            exception_only: None,
            runner_id: None,
        }
    }

    #[test]
    fn methods_keep_dispatch_order() {
        let record = CheckOut::new("r1", &unit(), 0.0, Duration::from_secs(300));
        assert_eq!(record.methods, vec!["a", "b", COMPLETION_SENTINEL]);
        assert!(record.has_method("a"));
        assert!(!record.has_method("c"));
    }

    #[test]
    fn remove_method_shrinks_the_outstanding_set() {
        let mut record = CheckOut::new("r1", &unit(), 0.0, Duration::from_secs(300));
        record.remove_method("a");
        assert_eq!(record.methods, vec!["b", COMPLETION_SENTINEL]);
    }

    #[test]
    fn repeated_results_replace_instead_of_duplicating() {
        let mut record = CheckOut::new("r1", &unit(), 0.0, Duration::from_secs(300));
        record.record_passed(passed("a"));
        record.record_passed(passed("a"));
        assert_eq!(record.passed_methods.len(), 1);
    }
}
