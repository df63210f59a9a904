use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::sync::oneshot;

/// Pseudo-method appended to every dispatched method list. The runner posts
/// a final result under this name to mark the whole class as done.
pub const COMPLETION_SENTINEL: &str = "run";

/// One dispatchable unit of work: a test class and the methods left to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    pub class_path: String,
    pub methods: Vec<String>,
    /// Runner that last attempted this class; dispatch is biased away from
    /// it when other runners exist.
    pub last_runner: Option<String>,
}

/// What a parked worker eventually receives: its queued priority and a
/// test, or `None` once the queue is finalized.
pub type Delivery = Option<(i32, TestUnit)>;
pub type DeliverySlot = oneshot::Sender<Delivery>;

struct QueuedTest {
    priority: i32,
    seq: u64,
    test: TestUnit,
}

impl QueuedTest {
    fn key(&self) -> (i32, u64) {
        (self.priority, self.seq)
    }
}

impl PartialEq for QueuedTest {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTest {}

impl PartialOrd for QueuedTest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct QueuedWorker {
    priority: i32,
    runner: String,
    seq: u64,
    slot: DeliverySlot,
}

impl QueuedWorker {
    fn key(&self) -> (i32, &str, u64) {
        (self.priority, &self.runner, self.seq)
    }
}

impl PartialEq for QueuedWorker {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedWorker {}

impl PartialOrd for QueuedWorker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedWorker {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Two-sided priority queue pairing pending tests with pending workers.
/// Lower priority value wins on both sides; ties break by runner id then
/// insertion order on the worker side, by insertion order on the test side.
#[derive(Default)]
pub struct MatchQueue {
    tests: BinaryHeap<Reverse<QueuedTest>>,
    workers: BinaryHeap<Reverse<QueuedWorker>>,
    seq: u64,
    finalized: bool,
    /// Tests handed to a worker's slot but not yet claimed on the other
    /// side. They still count as pending: a delivery sitting in a channel
    /// must not make the queue look drained.
    in_flight: usize,
}

impl MatchQueue {
    pub fn new() -> Self {
        MatchQueue::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Queue up a test to be given to a worker. Dropped silently once the
    /// queue is finalized.
    pub fn add_test(&mut self, priority: i32, test: TestUnit) {
        if self.finalized {
            return;
        }

        let seq = self.next_seq();
        self.tests.push(Reverse(QueuedTest {
            priority,
            seq,
            test,
        }));
    }

    /// Queue up a worker to receive a test. Once the queue is finalized the
    /// slot is resolved with `None` immediately.
    pub fn add_worker(&mut self, priority: i32, runner: &str, slot: DeliverySlot) {
        if self.finalized {
            drop(slot.send(None));
            return;
        }

        let seq = self.next_seq();
        self.workers.push(Reverse(QueuedWorker {
            priority,
            runner: runner.to_string(),
            seq,
            slot,
        }));
    }

    /// Whether any tests are pending, counting deliveries that have not
    /// been claimed yet.
    pub fn empty(&self) -> bool {
        self.tests.is_empty() && self.in_flight == 0
    }

    /// Take responsibility for a delivered test. Must be called once per
    /// received delivery, before deciding to run or re-queue it.
    pub fn claim_delivery(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Whether any workers are parked.
    pub fn waiting(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Pair tests with workers until one side runs dry.
    ///
    /// Each pass pops workers in priority order into a skipped buffer until
    /// a test can be popped for one of them; the buffer is then returned to
    /// the worker side verbatim so no worker loses its place while the test
    /// side is momentarily empty.
    pub fn match_pairs(&mut self) {
        loop {
            let mut skipped = Vec::new();
            let mut matched = None;

            while let Some(Reverse(worker)) = self.workers.pop() {
                match self.tests.pop() {
                    Some(Reverse(queued)) => {
                        matched = Some((worker, queued));
                        break;
                    }
                    None => skipped.push(worker),
                }
            }

            for worker in skipped {
                self.workers.push(Reverse(worker));
            }

            let Some((worker, queued)) = matched else {
                return;
            };

            let QueuedTest {
                priority: t_priority,
                seq: t_seq,
                test,
            } = queued;
            match worker.slot.send(Some((worker.priority, test))) {
                Ok(()) => self.in_flight += 1,
                Err(Some((_, test))) => {
                    // The request behind this worker is gone. The test keeps
                    // its place and the next worker gets a shot at it.
                    self.tests.push(Reverse(QueuedTest {
                        priority: t_priority,
                        seq: t_seq,
                        test,
                    }));
                }
                Err(None) => unreachable!("matched deliveries always carry a test"),
            }
        }
    }

    /// Resolve every parked worker with `None` and make all future
    /// `add_worker` calls do the same.
    pub fn finalize(&mut self) {
        self.finalized = true;
        while let Some(Reverse(worker)) = self.workers.pop() {
            drop(worker.slot.send(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(class_path: &str) -> TestUnit {
        TestUnit {
            class_path: class_path.to_string(),
            methods: vec!["a".to_string(), COMPLETION_SENTINEL.to_string()],
            last_runner: None,
        }
    }

    fn recv(rx: &mut oneshot::Receiver<Delivery>) -> Delivery {
        rx.try_recv().expect("worker slot not resolved")
    }

    #[test]
    fn requeued_tests_jump_ahead_of_fresh_ones() {
        let mut queue = MatchQueue::new();
        queue.add_test(0, unit("m Fresh"));
        queue.add_test(-1, unit("m Retry"));

        let (tx, mut rx) = oneshot::channel();
        queue.add_worker(0, "r1", tx);
        queue.match_pairs();

        let (_, test) = recv(&mut rx).expect("expected a test");
        assert_eq!(test.class_path, "m Retry");
    }

    #[test]
    fn equal_priority_tests_are_delivered_in_insertion_order() {
        let mut queue = MatchQueue::new();
        queue.add_test(0, unit("m First"));
        queue.add_test(0, unit("m Second"));

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        queue.add_worker(0, "r1", tx1);
        queue.add_worker(0, "r2", tx2);
        queue.match_pairs();

        assert_eq!(recv(&mut rx1).unwrap().1.class_path, "m First");
        assert_eq!(recv(&mut rx2).unwrap().1.class_path, "m Second");
    }

    #[test]
    fn lowest_priority_worker_wins() {
        let mut queue = MatchQueue::new();
        let (tx_deferred, mut rx_deferred) = oneshot::channel();
        let (tx_fresh, mut rx_fresh) = oneshot::channel();
        queue.add_worker(1, "r1", tx_deferred);
        queue.add_worker(0, "r2", tx_fresh);

        queue.add_test(0, unit("m C"));
        queue.match_pairs();

        assert_eq!(recv(&mut rx_fresh).unwrap().1.class_path, "m C");
        assert!(rx_deferred.try_recv().is_err());
        assert!(queue.waiting());
    }

    #[test]
    fn equal_priority_workers_tie_break_on_runner_id() {
        let mut queue = MatchQueue::new();
        let (tx_b, mut rx_b) = oneshot::channel();
        let (tx_a, mut rx_a) = oneshot::channel();
        queue.add_worker(0, "rb", tx_b);
        queue.add_worker(0, "ra", tx_a);

        queue.add_test(0, unit("m C"));
        queue.match_pairs();

        assert!(recv(&mut rx_a).is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn workers_keep_their_place_while_no_tests_are_queued() {
        let mut queue = MatchQueue::new();
        let (tx, mut rx) = oneshot::channel();
        queue.add_worker(0, "r1", tx);
        queue.match_pairs();

        assert!(rx.try_recv().is_err());
        assert!(queue.waiting());

        queue.add_test(0, unit("m C"));
        queue.match_pairs();
        assert!(recv(&mut rx).is_some());
        assert!(!queue.waiting());
    }

    #[test]
    fn delivery_reports_the_priority_the_worker_was_queued_at() {
        let mut queue = MatchQueue::new();
        let (tx, mut rx) = oneshot::channel();
        queue.add_worker(3, "r1", tx);
        queue.add_test(0, unit("m C"));
        queue.match_pairs();

        let (priority, _) = recv(&mut rx).expect("expected a test");
        assert_eq!(priority, 3);
    }

    #[test]
    fn finalize_drains_parked_workers() {
        let mut queue = MatchQueue::new();
        let (tx, mut rx) = oneshot::channel();
        queue.add_worker(0, "r1", tx);

        queue.finalize();
        assert_eq!(recv(&mut rx), None);
    }

    #[test]
    fn add_worker_after_finalize_resolves_immediately() {
        let mut queue = MatchQueue::new();
        queue.finalize();

        let (tx, mut rx) = oneshot::channel();
        queue.add_worker(0, "r1", tx);
        assert_eq!(recv(&mut rx), None);
    }

    #[test]
    fn add_test_after_finalize_is_dropped() {
        let mut queue = MatchQueue::new();
        queue.finalize();

        queue.add_test(0, unit("m C"));
        assert!(queue.empty());
    }

    #[test]
    fn delivered_tests_count_as_pending_until_claimed() {
        let mut queue = MatchQueue::new();
        let (tx, mut rx) = oneshot::channel();
        queue.add_worker(0, "r1", tx);
        queue.add_test(0, unit("m C"));
        queue.match_pairs();

        // The only test is sitting in the worker's slot, but nothing has
        // picked it up yet.
        assert!(recv(&mut rx).is_some());
        assert!(!queue.empty());

        queue.claim_delivery();
        assert!(queue.empty());
    }

    #[test]
    fn dropped_worker_does_not_lose_the_test() {
        let mut queue = MatchQueue::new();
        let (tx_gone, rx_gone) = oneshot::channel();
        queue.add_worker(0, "r1", tx_gone);
        drop(rx_gone);

        queue.add_test(0, unit("m C"));
        queue.match_pairs();
        assert!(!queue.empty());

        let (tx, mut rx) = oneshot::channel();
        queue.add_worker(0, "r2", tx);
        queue.match_pairs();
        assert_eq!(recv(&mut rx).unwrap().1.class_path, "m C");
    }
}
