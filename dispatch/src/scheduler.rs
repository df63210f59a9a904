use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, sleep_until, Instant};

use crate::api::DispatchError;
use crate::checkout::CheckOut;
use crate::config::Config;
use crate::discovery::DiscoveredClass;
use crate::queue::{MatchQueue, TestUnit, COMPLETION_SENTINEL};
use crate::reporter::Reporter;
use crate::result::{MethodInfo, MethodResult};
use crate::time::{unix_seconds, TimeSource};

/// Why a class is leaving the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckIn {
    Finished,
    TimedOut,
    EarlyShutdown,
}

struct SchedulerState {
    queue: MatchQueue,
    checked_out: HashMap<String, CheckOut>,
    /// `(class_path, method)` pairs that already consumed their one retry
    /// after a failure.
    failed_rerun_methods: HashSet<(String, String)>,
    /// Same, for methods whose runner went silent.
    timeout_rerun_methods: HashSet<(String, String)>,
    /// Earlier attempts, kept so reporters can see them on the retry.
    previous_run_results: HashMap<(String, String), MethodResult>,
    /// Every runner that ever asked for work.
    runners: HashSet<String>,
    /// Runners that posted a result but have not come back for the next
    /// test yet. Shutdown waits for these.
    runners_outstanding: HashSet<String>,
    failure_count: u32,
    shutting_down: bool,
    last_activity: Instant,
}

/// Owns all dispatch state behind one lock: the matching queue, the
/// check-out ledger, the retry bookkeeping and the shutdown flags. Handlers
/// and timers call in from the runtime; nothing here blocks while holding
/// the lock.
pub struct Scheduler {
    runner_timeout: Duration,
    server_timeout: Duration,
    shutdown_delay_for_connection_close: Duration,
    shutdown_delay_for_outstanding_runners: Duration,
    disable_requeueing: bool,
    failure_limit: u32,
    revision: Option<String>,
    reporters: Vec<Arc<dyn Reporter>>,
    timesource: Box<dyn TimeSource + Send + Sync>,
    stopper: Arc<Notify>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        reporters: Vec<Arc<dyn Reporter>>,
        timesource: Box<dyn TimeSource + Send + Sync>,
        stopper: Arc<Notify>,
    ) -> Scheduler {
        Scheduler {
            runner_timeout: config.runner_timeout.0,
            server_timeout: config.server_timeout.0,
            shutdown_delay_for_connection_close: config.shutdown_delay_for_connection_close.0,
            shutdown_delay_for_outstanding_runners: config.shutdown_delay_for_outstanding_runners.0,
            disable_requeueing: config.disable_requeueing,
            failure_limit: config.failure_limit,
            revision: config.revision.clone(),
            reporters,
            timesource,
            stopper,
            state: Mutex::new(SchedulerState {
                queue: MatchQueue::new(),
                checked_out: HashMap::new(),
                failed_rerun_methods: HashSet::new(),
                timeout_rerun_methods: HashSet::new(),
                previous_run_results: HashMap::new(),
                runners: HashSet::new(),
                runners_outstanding: HashSet::new(),
                failure_count: 0,
                shutting_down: false,
                last_activity: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("poisoned scheduler state lock")
    }

    /// Queue every discovered class at priority 0. Classes without any
    /// runnable methods are skipped.
    pub fn enqueue_discovered(&self, classes: Vec<DiscoveredClass>) {
        let mut state = self.state();
        for class in classes {
            if class.methods.is_empty() {
                continue;
            }

            let class_path = class.class_path();
            let mut methods = class.methods;
            methods.push(COMPLETION_SENTINEL.to_string());
            state.queue.add_test(
                0,
                TestUnit {
                    class_path,
                    methods,
                    last_runner: None,
                },
            );
        }
    }

    /// Park until a test can be handed to this runner, or until the queue
    /// is finalized (`None` means the runner is done).
    ///
    /// A runner is not given back a class it already attempted while other
    /// runners exist: the test returns to the queue and the worker re-parks
    /// at a lower priority, so a competing request wins the retry.
    pub async fn next_test(self: Arc<Self>, runner_id: &str) -> Option<TestUnit> {
        self.state().runners.insert(runner_id.to_string());

        let mut priority = 0;
        loop {
            let (tx, rx) = oneshot::channel();
            {
                let mut state = self.state();
                state.queue.add_worker(priority, runner_id, tx);
                state.queue.match_pairs();
            }

            let (w_priority, test) = match rx.await {
                Ok(Some(delivery)) => delivery,
                Ok(None) | Err(_) => return None,
            };

            {
                let mut state = self.state();
                state.queue.claim_delivery();
                let only_runner = state.runners.len() <= 1;
                if test.last_runner.as_deref() != Some(runner_id) || only_runner {
                    self.check_out(&mut state, runner_id, &test);
                    drop(state);

                    let this = self.clone();
                    let runner = runner_id.to_string();
                    let class_path = test.class_path.clone();
                    tokio::spawn(async move { this.class_timeout(runner, class_path).await });
                    return Some(test);
                }

                state.queue.add_test(0, test);
                state.queue.match_pairs();
                priority = w_priority + 1;
            }
            // Let another runner's request run before we park again.
            tokio::task::yield_now().await;
        }
    }

    /// Apply one posted result to the owning check-out record.
    pub fn record_result(
        &self,
        runner_id: &str,
        result: MethodResult,
    ) -> Result<(), DispatchError> {
        let mut state = self.state();
        let class_path = result.class_path();
        let method_name = result.method.name.clone();
        let unexpected = result
            .method
            .fixture_type
            .is_some_and(|f| f.can_return_unexpected_results());

        {
            let record = state
                .checked_out
                .get(&class_path)
                .ok_or_else(|| DispatchError::ClassNotCheckedOut(class_path.clone()))?;
            if record.runner != runner_id {
                return Err(DispatchError::WrongRunner {
                    class_path: class_path.clone(),
                    owner: record.runner.clone(),
                    runner: runner_id.to_string(),
                });
            }
            if !record.has_method(&method_name) && !unexpected {
                return Err(DispatchError::MethodNotCheckedOut {
                    method: method_name.clone(),
                    runner: runner_id.to_string(),
                });
            }
        }

        state.last_activity = Instant::now();

        // The sentinel only signals that the runner is done with the class;
        // it is not a real method and never reaches the reporters.
        let sentinel = method_name == COMPLETION_SENTINEL;
        let success = result.success;
        if !sentinel {
            let record = state
                .checked_out
                .get_mut(&class_path)
                .expect("record validated above");
            if success {
                record.record_passed(result);
            } else {
                record.record_failed(result);
            }

            if !success {
                state.failure_count += 1;
                if self.failure_limit > 0 && state.failure_count >= self.failure_limit {
                    tracing::error!(
                        failure_count = state.failure_count,
                        "too many failures, shutting down"
                    );
                    self.early_shutdown(&mut state);
                    return Ok(());
                }
            }
        }

        let record = state
            .checked_out
            .get_mut(&class_path)
            .expect("record validated above");
        record.extend_deadline(self.runner_timeout);

        if !unexpected {
            record.remove_method(&method_name);
        }

        if record.methods.is_empty() {
            self.check_in(&mut state, Some(runner_id), &class_path, CheckIn::Finished)
                .expect("finished check-in rejected");
        }

        Ok(())
    }

    fn check_out(&self, state: &mut SchedulerState, runner_id: &str, test: &TestUnit) {
        state.last_activity = Instant::now();
        let record = CheckOut::new(
            runner_id,
            test,
            unix_seconds(self.timesource.now()),
            self.runner_timeout,
        );
        state.checked_out.insert(test.class_path.clone(), record);
    }

    /// Watches one check-out until its deadline truly expires. Result
    /// arrivals push the deadline forward, so the task re-arms instead of
    /// firing; once the record is gone it quietly exits.
    async fn class_timeout(self: Arc<Self>, runner: String, class_path: String) {
        loop {
            let deadline = match self.state().checked_out.get(&class_path) {
                None => return,
                Some(record) => record.timeout_time,
            };
            if Instant::now() < deadline {
                sleep_until(deadline).await;
                continue;
            }

            let mut state = self.state();
            let expired = match state.checked_out.get(&class_path) {
                None => return,
                Some(record) => Instant::now() >= record.timeout_time,
            };
            if !expired {
                // Results arrived while we slept; re-arm at the new deadline.
                continue;
            }

            // Another runner may have checked the class out again in the
            // meantime; that ownership mismatch is not ours to tear down.
            drop(self.check_in(&mut state, Some(&runner), &class_path, CheckIn::TimedOut));
            return;
        }
    }

    /// Remove a class from the ledger and settle its methods: report,
    /// requeue, or synthesize timed-out failures per the retry policy.
    fn check_in(
        &self,
        state: &mut SchedulerState,
        runner: Option<&str>,
        class_path: &str,
        status: CheckIn,
    ) -> Result<(), DispatchError> {
        if status != CheckIn::TimedOut {
            state.last_activity = Instant::now();
        }

        {
            let record = state
                .checked_out
                .get(class_path)
                .ok_or_else(|| DispatchError::ClassNotCheckedOut(class_path.to_string()))?;
            if status != CheckIn::EarlyShutdown && runner != Some(record.runner.as_str()) {
                return Err(DispatchError::WrongRunner {
                    class_path: class_path.to_string(),
                    owner: record.runner.clone(),
                    runner: runner.unwrap_or("<none>").to_string(),
                });
            }
        }

        let record = state
            .checked_out
            .remove(class_path)
            .expect("record validated above");
        let CheckOut {
            runner: owner,
            methods: remaining,
            passed_methods,
            failed_methods,
            ..
        } = record;

        if status == CheckIn::Finished && !remaining.is_empty() {
            panic!(
                "class {} checked in as finished with {} methods still outstanding",
                class_path,
                remaining.len()
            );
        }

        let mut to_report: Vec<MethodResult> = passed_methods
            .into_iter()
            .map(|(_, result)| result)
            .collect();
        let mut requeue_methods: Vec<String> = Vec::new();

        for (method, result) in failed_methods {
            let key = (class_path.to_string(), method.clone());
            let unexpected = result
                .method
                .fixture_type
                .is_some_and(|f| f.can_return_unexpected_results());
            let retry = !self.disable_requeueing
                && status != CheckIn::EarlyShutdown
                && !unexpected
                && !state.failed_rerun_methods.contains(&key);

            if retry {
                let mut stored = result;
                stored.previous_run = state.previous_run_results.get(&key).cloned().map(Box::new);
                state.failed_rerun_methods.insert(key.clone());
                state.previous_run_results.insert(key, stored);
                requeue_methods.push(method);
            } else {
                to_report.push(result);
            }
        }

        // Timed-out methods never produced a result; fabricate one per
        // method so reporters and retries see a real failure.
        let mut synthesized: Vec<MethodResult> = Vec::new();
        if status == CheckIn::TimedOut {
            for method in &remaining {
                if method == COMPLETION_SENTINEL {
                    continue;
                }

                let key = (class_path.to_string(), method.clone());
                let previous = state.previous_run_results.get(&key).cloned().map(Box::new);
                let fake = self.synthesize_timeout_result(class_path, method, &owner, previous);

                if !self.disable_requeueing && !state.timeout_rerun_methods.contains(&key) {
                    state.timeout_rerun_methods.insert(key.clone());
                    state.previous_run_results.insert(key, fake);
                    requeue_methods.push(method.clone());
                } else {
                    synthesized.push(fake);
                }
            }
        }

        for mut result in to_report {
            let key = (class_path.to_string(), result.method.name.clone());
            result.previous_run = state.previous_run_results.get(&key).cloned().map(Box::new);
            for reporter in &self.reporters {
                reporter.test_start(&result);
                reporter.test_complete(&result);
            }
        }
        for result in synthesized {
            for reporter in &self.reporters {
                reporter.test_start(&result);
                reporter.test_complete(&result);
            }
        }

        if !requeue_methods.is_empty() {
            let mut methods = requeue_methods;
            methods.push(COMPLETION_SENTINEL.to_string());
            state.queue.add_test(
                -1,
                TestUnit {
                    class_path: class_path.to_string(),
                    methods,
                    last_runner: Some(owner),
                },
            );
            state.queue.match_pairs();
        }

        if state.queue.empty() && state.checked_out.is_empty() {
            self.shutdown_locked(state);
        }

        Ok(())
    }

    fn synthesize_timeout_result(
        &self,
        class_path: &str,
        method: &str,
        runner: &str,
        previous_run: Option<Box<MethodResult>>,
    ) -> MethodResult {
        let timeout_secs = self.runner_timeout.as_secs_f64();
        let message = format!(
            "The runner running this method ({}) didn't respond within {}s.\n",
            runner, timeout_secs
        );
        let (module, class) = class_path.split_once(' ').unwrap_or((class_path, ""));
        let end_time = unix_seconds(self.timesource.now());

        MethodResult {
            method: MethodInfo {
                module: module.to_string(),
                class: class.to_string(),
                name: method.to_string(),
                full_name: Some(format!("{}.{}", class_path, method)),
                fixture_type: None,
            },
            success: false,
            previous_run,
            start_time: Some(end_time - timeout_secs),
            end_time: Some(end_time),
            run_time: Some(timeout_secs),
            normalized_run_time: Some(format!("{:.2}s", timeout_secs)),
            complete: true,
            failure: None,
            error: Some(true),
            interrupted: None,
            exception_info: Some(message.clone()),
            exception_info_pretty: Some(message.clone()),
            exception_only: Some(message),
            runner_id: Some(runner.to_string()),
        }
    }

    /// Tear down every current check-out (failures are reported, never
    /// requeued) and enter the graceful shutdown sequence.
    fn early_shutdown(&self, state: &mut SchedulerState) {
        let class_paths: Vec<String> = state.checked_out.keys().cloned().collect();
        for class_path in class_paths {
            self.check_in(state, None, &class_path, CheckIn::EarlyShutdown)
                .expect("early-shutdown check-in rejected");
        }
        self.shutdown_locked(state);
    }

    /// Enter the graceful shutdown sequence; safe to call repeatedly.
    pub fn shutdown(&self) {
        let mut state = self.state();
        self.shutdown_locked(&mut state);
    }

    fn shutdown_locked(&self, state: &mut SchedulerState) {
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        state.queue.finalize();

        // A runner that just posted a result still has a GET coming; give
        // it time to pick up its "finished" answer before the listener
        // goes away.
        let delay = if state.runners_outstanding.is_empty() {
            self.shutdown_delay_for_connection_close
        } else {
            self.shutdown_delay_for_outstanding_runners
        };
        tracing::info!(
            delay_secs = delay.as_secs_f64(),
            outstanding = state.runners_outstanding.len(),
            "shutting down"
        );

        let stopper = self.stopper.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            stopper.notify_one();
        });
    }

    /// Stop immediately if shutdown has begun and no runner is owed a
    /// response. Called after every `/tests` answer.
    pub fn maybe_stop(&self) {
        let state = self.state();
        if state.shutting_down && state.runners_outstanding.is_empty() {
            self.stopper.notify_one();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    pub fn mark_outstanding(&self, runner_id: &str) {
        self.state()
            .runners_outstanding
            .insert(runner_id.to_string());
    }

    pub fn discard_outstanding(&self, runner_id: &str) {
        self.state().runners_outstanding.remove(runner_id);
    }

    pub fn check_revision(&self, client: Option<&str>) -> Result<(), DispatchError> {
        let Some(server) = self.revision.as_deref() else {
            return Ok(());
        };
        match client {
            None => Err(DispatchError::MissingRevision),
            Some(client) if client != server => Err(DispatchError::RevisionMismatch {
                client: client.to_string(),
                server: server.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Arm the whole-run inactivity watchdog. Check-outs, results and
    /// check-ins all count as activity and push the deadline out.
    pub fn start_inactivity_timer(self: Arc<Self>) {
        self.state().last_activity = Instant::now();

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = self.state();
                    if state.shutting_down {
                        return;
                    }
                    state.last_activity + self.server_timeout
                };
                if Instant::now() >= deadline {
                    tracing::error!(
                        "no client activity for {:?}, shutting down",
                        self.server_timeout
                    );
                    self.shutdown();
                    return;
                }
                sleep_until(deadline).await;
            }
        });
    }

    /// Final success of the run: every reporter gets its say, the run
    /// passes only if all of them do.
    pub fn final_report(&self) -> bool {
        let reports: Vec<bool> = self.reporters.iter().map(|r| r.report()).collect();
        reports.into_iter().all(|ok| ok)
    }
}
