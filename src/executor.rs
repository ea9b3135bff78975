//! Prioritised parallel task executor
//!
//! A single process-wide queue with fixed priority lanes feeding a bounded
//! worker pool. Each lane keeps a FIFO of ready tasks plus a min-heap of
//! deferred tasks promoted when their deadline passes. Workers always drain
//! the highest-priority lane with a ready task; when every lane is
//! deferred they sleep until the nearest deadline or a new submission.
//!
//! Per-kind parallelism caps are layered on top via [`TaskGroup`]: a group
//! wraps each task with a semaphore permit so that in-flight tasks of one
//! kind never exceed its cap, regardless of worker count.
//!
//! On shutdown the queue is dropped wholesale: queued tasks vanish
//! silently, running tasks finish their current await.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lane for node-lease renewals; outranks everything else
pub const NODE_LEASE_PRIORITY: usize = 0;
/// Lane for immediate Node stage applications
pub const NODE_PRIORITY: usize = 1;
/// Lane for delayed Node stage applications
pub const NODE_DELAY_PRIORITY: usize = 2;
/// Lane for immediate Pod stage applications
pub const POD_PRIORITY: usize = 3;
/// Lane for delayed Pod stage applications
pub const POD_DELAY_PRIORITY: usize = 4;

const LANES: usize = 5;

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct DeferredTask {
    ready_at: Instant,
    seq: u64,
    fut: TaskFuture,
}

impl PartialEq for DeferredTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl Eq for DeferredTask {}
impl PartialOrd for DeferredTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DeferredTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

#[derive(Default)]
struct Lane {
    ready: VecDeque<TaskFuture>,
    deferred: BinaryHeap<Reverse<DeferredTask>>,
}

enum Pop {
    Run(TaskFuture),
    Sleep(Instant),
    Idle,
}

/// The process-wide prioritised executor
pub struct Executor {
    lanes: Mutex<Vec<Lane>>,
    notify: Notify,
    seq: Mutex<u64>,
}

impl Executor {
    /// Create an executor and spawn its worker pool.
    ///
    /// `total_parallel` bounds how many tasks run at once across all lanes.
    /// Workers exit when `cancel` fires, dropping any queued tasks.
    pub fn start(total_parallel: usize, cancel: CancellationToken) -> Arc<Self> {
        let executor = Arc::new(Self {
            lanes: Mutex::new((0..LANES).map(|_| Lane::default()).collect()),
            notify: Notify::new(),
            seq: Mutex::new(0),
        });
        for _ in 0..total_parallel.max(1) {
            let executor = Arc::clone(&executor);
            let cancel = cancel.clone();
            tokio::spawn(async move { executor.worker_loop(cancel).await });
        }
        executor
    }

    /// Default worker count: sixteen per available core
    pub fn default_parallelism() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 16
    }

    /// Enqueue a task on a lane, optionally deferred by `delay`
    pub fn submit<F>(&self, priority: usize, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let priority = priority.min(LANES - 1);
        let fut: TaskFuture = Box::pin(fut);
        {
            let mut lanes = self.lanes.lock();
            if delay.is_zero() {
                lanes[priority].ready.push_back(fut);
            } else {
                let seq = {
                    let mut seq = self.seq.lock();
                    *seq += 1;
                    *seq
                };
                lanes[priority].deferred.push(Reverse(DeferredTask {
                    ready_at: Instant::now() + delay,
                    seq,
                    fut,
                }));
            }
        }
        self.notify.notify_one();
    }

    /// Pop the best runnable task, or report how long to wait
    fn pop(&self) -> Pop {
        let now = Instant::now();
        let mut lanes = self.lanes.lock();
        let mut nearest: Option<Instant> = None;

        for lane in lanes.iter_mut() {
            // Promote due deferred tasks in deadline order.
            while lane
                .deferred
                .peek()
                .is_some_and(|Reverse(t)| t.ready_at <= now)
            {
                let Reverse(task) = lane.deferred.pop().expect("peeked");
                lane.ready.push_back(task.fut);
            }
            if let Some(fut) = lane.ready.pop_front() {
                return Pop::Run(fut);
            }
            if let Some(Reverse(task)) = lane.deferred.peek() {
                nearest = Some(match nearest {
                    Some(n) => n.min(task.ready_at),
                    None => task.ready_at,
                });
            }
        }

        match nearest {
            Some(deadline) => Pop::Sleep(deadline),
            None => Pop::Idle,
        }
    }

    async fn worker_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.pop() {
                Pop::Run(fut) => fut.await,
                Pop::Sleep(deadline) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Pop::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        debug!("executor worker stopped");
    }
}

/// A parallelism-capped view of the executor for one resource kind
#[derive(Clone)]
pub struct TaskGroup {
    executor: Arc<Executor>,
    limit: Arc<Semaphore>,
    priority: usize,
    delay_priority: usize,
}

impl TaskGroup {
    /// Create a group with its own in-flight cap and lane pair
    pub fn new(
        executor: Arc<Executor>,
        parallelism: usize,
        priority: usize,
        delay_priority: usize,
    ) -> Self {
        Self {
            executor,
            limit: Arc::new(Semaphore::new(parallelism.max(1))),
            priority,
            delay_priority,
        }
    }

    /// Submit a task; `delay` routes it to the group's delayed lane.
    ///
    /// The group's cap is enforced when the task starts: at most
    /// `parallelism` tasks of this group are in flight at any instant.
    pub fn submit<F>(&self, delay: Option<Duration>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let limit = Arc::clone(&self.limit);
        let wrapped = async move {
            // Closed only at process shutdown; dropping the task then is
            // exactly the drain behavior we want.
            let Ok(_permit) = limit.acquire_owned().await else {
                return;
            };
            fut.await;
        };
        match delay {
            Some(d) if !d.is_zero() => self.executor.submit(self.delay_priority, d, wrapped),
            _ => self.executor.submit(self.priority, Duration::ZERO, wrapped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(workers: usize) -> (Arc<Executor>, CancellationToken) {
        let cancel = CancellationToken::new();
        (Executor::start(workers, cancel.clone()), cancel)
    }

    #[tokio::test]
    async fn runs_submitted_tasks() {
        let (exec, cancel) = executor(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            exec.submit(POD_PRIORITY, Duration::ZERO, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        cancel.cancel();
    }

    #[tokio::test]
    async fn higher_priority_lane_drains_first() {
        // Single worker so execution order is observable.
        let (exec, cancel) = executor(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Park the worker briefly so both submissions queue up.
        let gate = Arc::new(Notify::new());
        {
            let gate = Arc::clone(&gate);
            exec.submit(NODE_LEASE_PRIORITY, Duration::ZERO, async move {
                gate.notified().await;
            });
        }
        for (lane, tag) in [(POD_PRIORITY, "pod"), (NODE_PRIORITY, "node")] {
            let order = Arc::clone(&order);
            exec.submit(lane, Duration::ZERO, async move {
                order.lock().push(tag);
            });
        }
        gate.notify_one();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock(), vec!["node", "pod"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn deferred_tasks_wait_for_their_deadline() {
        let (exec, cancel) = executor(2);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            exec.submit(POD_DELAY_PRIORITY, Duration::from_millis(150), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "fired before deadline");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn group_cap_bounds_in_flight_tasks() {
        let (exec, cancel) = executor(8);
        let group = TaskGroup::new(exec, 2, POD_PRIORITY, POD_DELAY_PRIORITY);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            group.submit(None, async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {peak:?} exceeded cap");
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_drops_queued_tasks() {
        let (exec, cancel) = executor(1);
        let ran = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker, then queue behind it and cancel.
        exec.submit(NODE_PRIORITY, Duration::ZERO, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        {
            let ran = Arc::clone(&ran);
            exec.submit(NODE_PRIORITY, Duration::ZERO, async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "queued task ran after cancel");
    }
}
