//! Ordered per-container threading model.
//!
//! Two-stage pipeline: jobs land in an unbounded inqueue; a single
//! **shuttle** task drains it. Jobs that still need deserialization go to a
//! fixed-size pool *and* into a FIFO holding queue — the pool runs
//! `calculate_containers` in parallel, but the shuttle only releases jobs
//! from the holding queue head-first, so arrival order survives parallel
//! deserialization. A ready job is individuated into one piece per
//! destination container and offered to that container's dedicated worker,
//! which drains its own FIFO.
//!
//! # Ordering
//!
//! For two accepted jobs J₁ before J₂ with pieces for container C, C sees
//! J₁'s piece first. Across containers there is no ordering.
//!
//! # Backpressure
//!
//! `submit_limited` counts the job against a process-wide limit that
//! callers can observe; submission itself never blocks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use switchyard_core::{config, NodeConfiguration};

use crate::container::{ContainerJob, ContainerJobMetadata, MessageDeliveryJob};

/// Idle iterations before an idle loop starts yielding.
const SPIN_YIELD_COUNT: u32 = 100;

/// Idle iterations before an idle loop starts sleeping.
const SPIN_SLEEP_COUNT: u32 = 500;

/// Sleep used once a loop has escalated past yielding.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Bound on waiting for the shuttle during close.
const SHUTTLE_STOP_WAIT: Duration = Duration::from_secs(10);

/// Tunables for the threading model.
#[derive(Debug, Clone)]
pub struct ThreadingConfig {
    /// Soft ceiling on outstanding limited jobs.
    pub max_pending: i64,
    /// When true, `close` does not wait for container workers to drain.
    pub hard_shutdown: bool,
    /// Parallelism of the deserialization pool.
    pub deserialization_threads: usize,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            max_pending: config::DEFAULT_MAX_PENDING,
            hard_shutdown: config::DEFAULT_HARD_SHUTDOWN,
            deserialization_threads: config::DEFAULT_DESERIALIZATION_THREADS,
        }
    }
}

impl ThreadingConfig {
    /// Read the recognized threading keys out of a node configuration.
    pub fn from_node_config(node_config: &NodeConfiguration) -> Self {
        let defaults = Self::default();
        Self {
            max_pending: node_config.get_i64(config::THREADING_MAX_PENDING, defaults.max_pending),
            hard_shutdown: node_config
                .get_bool(config::THREADING_HARD_SHUTDOWN, defaults.hard_shutdown),
            deserialization_threads: node_config.get_usize(
                config::THREADING_DESERIALIZATION_THREADS,
                defaults.deserialization_threads,
            ),
        }
    }
}

/// Per-job bookkeeping shared between the shuttle and container workers.
struct JobHolder {
    job: Arc<dyn MessageDeliveryJob>,
    limited: bool,
    num_limited: Arc<AtomicI64>,
    queued_container_jobs: AtomicI64,
    unfinished_container_jobs: AtomicI64,
}

impl JobHolder {
    fn new(
        job: Arc<dyn MessageDeliveryJob>,
        limited: bool,
        num_limited: Arc<AtomicI64>,
    ) -> Arc<Self> {
        if limited {
            num_limited.fetch_add(1, Ordering::AcqRel);
        }
        Arc::new(Self {
            job,
            limited,
            num_limited,
            queued_container_jobs: AtomicI64::new(0),
            unfinished_container_jobs: AtomicI64::new(0),
        })
    }

    /// Drop the whole job before individuation.
    fn reject(&self) {
        if self.limited {
            self.num_limited.fetch_sub(1, Ordering::AcqRel);
        }
        self.job.rejected();
    }

    fn pre_enqueue_track(&self) {
        self.queued_container_jobs.fetch_add(1, Ordering::AcqRel);
        self.unfinished_container_jobs.fetch_add(1, Ordering::AcqRel);
    }

    fn pre_work_track(&self) {
        if self.queued_container_jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // the final piece is leaving its queue: the job no longer
            // occupies a limited slot
            if self.limited {
                self.num_limited.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn post_work_track(&self) {
        if self.unfinished_container_jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.job.individuated_jobs_complete();
        }
    }
}

/// One individuated piece, owned by a container worker's queue.
struct ContainerJobHolder {
    piece: Box<dyn ContainerJob>,
    whole: Arc<JobHolder>,
    meta: ContainerJobMetadata,
}

impl ContainerJobHolder {
    /// Builds the holder and registers it with the job's counters. All
    /// holders of a job must be constructed before any is enqueued, else an
    /// early completion can observe a zero count while pieces remain.
    fn new(piece: Box<dyn ContainerJob>, whole: Arc<JobHolder>, meta: ContainerJobMetadata) -> Self {
        whole.pre_enqueue_track();
        Self { piece, whole, meta }
    }

    fn process(self) {
        self.whole.pre_work_track();
        self.piece.execute(&self.meta);
        self.whole.post_work_track();
    }

    fn reject(self) {
        self.whole.pre_work_track();
        self.piece.reject(&self.meta);
        self.whole.post_work_track();
    }
}

struct ContainerWorker {
    tx: mpsc::UnboundedSender<ContainerJobHolder>,
}

impl ContainerWorker {
    fn spawn(stopped: Arc<AtomicBool>, handles: &Mutex<Vec<JoinHandle<()>>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(container_worker_task(rx, stopped));
        handles
            .lock()
            .expect("threading lock poisoned")
            .push(handle);
        Self { tx }
    }
}

async fn container_worker_task(
    mut rx: mpsc::UnboundedReceiver<ContainerJobHolder>,
    stopped: Arc<AtomicBool>,
) {
    let mut try_count: u32 = 0;
    while !stopped.load(Ordering::Acquire) {
        match rx.try_recv() {
            Ok(holder) => {
                try_count = 0;
                holder.process();
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
            Err(mpsc::error::TryRecvError::Empty) => {
                try_count += 1;
                if try_count > SPIN_SLEEP_COUNT {
                    tokio::time::sleep(IDLE_SLEEP).await;
                } else if try_count > SPIN_YIELD_COUNT {
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    // account for whatever is still queued
    rx.close();
    while let Ok(holder) = rx.try_recv() {
        holder.reject();
    }
}

/// The threading model: accepts [`MessageDeliveryJob`]s and drives them to
/// their containers in arrival order.
pub struct OrderedPerContainerThreadingModel {
    inqueue_tx: mpsc::UnboundedSender<Arc<JobHolder>>,
    stopped: Arc<AtomicBool>,
    num_limited: Arc<AtomicI64>,
    max_pending: i64,
    hard_shutdown: bool,
    shuttle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl OrderedPerContainerThreadingModel {
    /// Start the shuttle and the deserialization pool.
    pub fn start(threading_config: ThreadingConfig) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let num_limited = Arc::new(AtomicI64::new(0));
        let worker_handles = Arc::new(Mutex::new(Vec::new()));

        let (inqueue_tx, inqueue_rx) = mpsc::unbounded_channel();
        let (deser_tx, deser_rx) = mpsc::unbounded_channel::<Arc<JobHolder>>();

        // deserialization pool: N workers draining one shared queue
        let deser_rx = Arc::new(tokio::sync::Mutex::new(deser_rx));
        for _ in 0..threading_config.deserialization_threads.max(1) {
            let deser_rx = Arc::clone(&deser_rx);
            let handle = tokio::spawn(async move {
                loop {
                    let next = { deser_rx.lock().await.recv().await };
                    match next {
                        Some(holder) => holder.job.calculate_containers(),
                        None => break,
                    }
                }
            });
            worker_handles
                .lock()
                .expect("threading lock poisoned")
                .push(handle);
        }

        let shuttle = tokio::spawn(shuttle_task(
            inqueue_rx,
            deser_tx,
            Arc::clone(&stopped),
            Arc::clone(&worker_handles),
        ));

        Self {
            inqueue_tx,
            stopped,
            num_limited,
            max_pending: threading_config.max_pending,
            hard_shutdown: threading_config.hard_shutdown,
            shuttle: Mutex::new(Some(shuttle)),
            worker_handles,
        }
    }

    /// Accept a job with no backpressure accounting.
    pub fn submit(&self, job: Arc<dyn MessageDeliveryJob>) {
        self.enqueue(job, false);
    }

    /// Accept a job counted against the limited ceiling. Submission still
    /// never blocks; callers watch [`Self::pending_limited`] and degrade
    /// upstream when it passes [`Self::max_pending`].
    pub fn submit_limited(&self, job: Arc<dyn MessageDeliveryJob>) {
        self.enqueue(job, true);
    }

    fn enqueue(&self, job: Arc<dyn MessageDeliveryJob>, limited: bool) {
        let holder = JobHolder::new(job, limited, Arc::clone(&self.num_limited));
        if self.stopped.load(Ordering::Acquire) {
            tracing::debug!("submission after shutdown, rejecting");
            holder.reject();
            return;
        }
        if let Err(err) = self.inqueue_tx.send(holder) {
            err.0.reject();
            tracing::error!("failed to queue message for delivery");
        }
    }

    /// Outstanding limited jobs.
    pub fn pending_limited(&self) -> i64 {
        self.num_limited.load(Ordering::Acquire)
    }

    /// The configured soft ceiling for limited jobs.
    pub fn max_pending(&self) -> i64 {
        self.max_pending
    }

    /// True when [`Self::pending_limited`] is at or beyond the ceiling.
    pub fn is_saturated(&self) -> bool {
        self.pending_limited() >= self.max_pending
    }

    /// Stop the pipeline. Remaining work is rejected; with
    /// `hard_shutdown = false` the call also waits for container workers to
    /// finish draining.
    pub async fn close(&self) {
        self.stopped.store(true, Ordering::Release);

        let shuttle = self
            .shuttle
            .lock()
            .expect("threading lock poisoned")
            .take();
        if let Some(handle) = shuttle {
            if tokio::time::timeout(SHUTTLE_STOP_WAIT, handle).await.is_err() {
                tracing::warn!("couldn't stop the shuttle task");
            }
        }

        if !self.hard_shutdown {
            let handles: Vec<JoinHandle<()>> = {
                let mut guard = self.worker_handles.lock().expect("threading lock poisoned");
                guard.drain(..).collect()
            };
            for handle in handles {
                if tokio::time::timeout(SHUTTLE_STOP_WAIT, handle).await.is_err() {
                    tracing::warn!("couldn't stop a container worker");
                }
            }
        }
    }
}

async fn shuttle_task(
    mut inqueue_rx: mpsc::UnboundedReceiver<Arc<JobHolder>>,
    deser_tx: mpsc::UnboundedSender<Arc<JobHolder>>,
    stopped: Arc<AtomicBool>,
    worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
)
{
    let mut deser_queue: VecDeque<Arc<JobHolder>> = VecDeque::new();
    let mut workers: HashMap<usize, ContainerWorker> = HashMap::new();
    let mut try_count: u32 = 0;

    while !stopped.load(Ordering::Acquire) {
        let mut some_work_done = false;

        // Phase I: pull newly submitted jobs
        match inqueue_rx.try_recv() {
            Ok(holder) => {
                some_work_done = true;
                try_count = 0;
                if holder.job.containers_calculated() {
                    fan_out(holder, &mut workers, &stopped, &worker_handles);
                } else {
                    if deser_tx.send(Arc::clone(&holder)).is_err() {
                        // pool is gone (shutdown race); do the work inline so
                        // the job still moves
                        holder.job.calculate_containers();
                    }
                    deser_queue.push_back(holder);
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) if deser_queue.is_empty() => break,
            Err(_) => {}
        }

        // Phase II: release the holding queue strictly head-first
        let head_ready = deser_queue
            .front()
            .is_some_and(|head| head.job.containers_calculated());
        if head_ready {
            if let Some(holder) = deser_queue.pop_front() {
                some_work_done = true;
                try_count = 0;
                fan_out(holder, &mut workers, &stopped, &worker_handles);
            }
        }

        if !some_work_done {
            try_count += 1;
            if try_count > SPIN_SLEEP_COUNT {
                tokio::time::sleep(IDLE_SLEEP).await;
            } else if try_count > SPIN_YIELD_COUNT {
                tokio::task::yield_now().await;
            }
        }
    }

    // reject everything that never reached a worker
    for holder in deser_queue.drain(..) {
        holder.reject();
    }
    inqueue_rx.close();
    while let Ok(holder) = inqueue_rx.try_recv() {
        holder.reject();
    }
    // dropping the workers' senders lets each drain-and-reject its queue
}

fn fan_out(
    holder: Arc<JobHolder>,
    workers: &mut HashMap<usize, ContainerWorker>,
    stopped: &Arc<AtomicBool>,
    worker_handles: &Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let deliveries = holder.job.container_data();
    if deliveries.is_empty() {
        tracing::info!("message resolved to no destination containers");
        holder.reject();
        return;
    }

    let pieces = holder.job.individuate();
    if pieces.is_empty() {
        holder.reject();
        return;
    }

    // Construct every holder before enqueueing any: a piece that completes
    // instantly must not see the job's counters at zero while siblings are
    // still unregistered.
    let piece_holders: Vec<ContainerJobHolder> = pieces
        .into_iter()
        .zip(deliveries.iter())
        .map(|(piece, meta)| ContainerJobHolder::new(piece, Arc::clone(&holder), meta.clone()))
        .collect();

    for piece_holder in piece_holders {
        let key = piece_holder.meta.container_key();
        let worker = workers
            .entry(key)
            .or_insert_with(|| ContainerWorker::spawn(Arc::clone(stopped), worker_handles));
        if let Err(err) = worker.tx.send(piece_holder) {
            // worker shut down underneath us; keep the counting honest
            err.0.reject();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use switchyard_core::{ClusterId, RoutedMessage};

    use super::*;
    use crate::container::MessageContainer;

    struct RecordingContainer {
        cluster: ClusterId,
        delivered: Mutex<Vec<u64>>,
        rejected: AtomicU32,
    }

    impl RecordingContainer {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                cluster: ClusterId::new("test", name),
                delivered: Mutex::new(Vec::new()),
                rejected: AtomicU32::new(0),
            })
        }

        fn delivered(&self) -> Vec<u64> {
            self.delivered.lock().expect("lock").clone()
        }
    }

    impl MessageContainer for RecordingContainer {
        fn cluster_id(&self) -> &ClusterId {
            &self.cluster
        }

        fn deliver(&self, message: Arc<RoutedMessage>) {
            let seq = u64::from_be_bytes(message.key[..8].try_into().expect("seq key"));
            self.delivered.lock().expect("lock").push(seq);
        }

        fn rejected(&self, _message: Arc<RoutedMessage>) {
            self.rejected.fetch_add(1, Ordering::AcqRel);
        }
    }

    struct TestJob {
        message: Arc<RoutedMessage>,
        deliveries: Vec<ContainerJobMetadata>,
        calculated: AtomicBool,
        completed: Arc<AtomicU32>,
    }

    impl TestJob {
        fn new(
            seq: u64,
            containers: Vec<Arc<RecordingContainer>>,
            completed: Arc<AtomicU32>,
        ) -> Arc<Self> {
            Arc::new(Self {
                message: Arc::new(RoutedMessage {
                    containers: (0..containers.len() as u32).collect(),
                    key: seq.to_be_bytes().to_vec(),
                    payload: Vec::new(),
                }),
                deliveries: containers
                    .into_iter()
                    .map(|c| ContainerJobMetadata {
                        container: c as Arc<dyn MessageContainer>,
                    })
                    .collect(),
                calculated: AtomicBool::new(false),
                completed,
            })
        }
    }

    struct TestPiece {
        message: Arc<RoutedMessage>,
    }

    impl ContainerJob for TestPiece {
        fn execute(self: Box<Self>, meta: &ContainerJobMetadata) {
            meta.container.deliver(self.message);
        }

        fn reject(self: Box<Self>, meta: &ContainerJobMetadata) {
            meta.container.rejected(self.message);
        }
    }

    impl MessageDeliveryJob for TestJob {
        fn containers_calculated(&self) -> bool {
            self.calculated.load(Ordering::Acquire)
        }

        fn calculate_containers(&self) {
            self.calculated.store(true, Ordering::Release);
        }

        fn container_data(&self) -> Vec<ContainerJobMetadata> {
            self.deliveries.clone()
        }

        fn individuate(&self) -> Vec<Box<dyn ContainerJob>> {
            self.deliveries
                .iter()
                .map(|_| {
                    Box::new(TestPiece {
                        message: Arc::clone(&self.message),
                    }) as Box<dyn ContainerJob>
                })
                .collect()
        }

        fn rejected(&self) {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }

        fn individuated_jobs_complete(&self) {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn wait_until(deadline_ms: u64, mut condition: impl FnMut() -> bool) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_container_receives_in_order() {
        let model = OrderedPerContainerThreadingModel::start(ThreadingConfig::default());
        let container = RecordingContainer::new("only");
        let completed = Arc::new(AtomicU32::new(0));

        for seq in 0..50u64 {
            model.submit(TestJob::new(seq, vec![container.clone()], completed.clone()));
        }

        wait_until(5000, || completed.load(Ordering::Acquire) == 50).await;
        assert_eq!(container.delivered(), (0..50).collect::<Vec<u64>>());

        model.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_multi_container_job_reaches_both() {
        let model = OrderedPerContainerThreadingModel::start(ThreadingConfig::default());
        let c1 = RecordingContainer::new("one");
        let c2 = RecordingContainer::new("two");
        let completed = Arc::new(AtomicU32::new(0));

        model.submit(TestJob::new(
            7,
            vec![c1.clone(), c2.clone()],
            completed.clone(),
        ));

        wait_until(5000, || completed.load(Ordering::Acquire) == 1).await;
        assert_eq!(c1.delivered(), vec![7]);
        assert_eq!(c2.delivered(), vec![7]);

        model.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limited_counter_returns_to_zero() {
        let model = OrderedPerContainerThreadingModel::start(ThreadingConfig::default());
        let container = RecordingContainer::new("limited");
        let completed = Arc::new(AtomicU32::new(0));

        for seq in 0..20u64 {
            model.submit_limited(TestJob::new(
                seq,
                vec![container.clone()],
                completed.clone(),
            ));
        }

        wait_until(5000, || completed.load(Ordering::Acquire) == 20).await;
        wait_until(5000, || model.pending_limited() == 0).await;

        model.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_after_close_rejects() {
        let model = OrderedPerContainerThreadingModel::start(ThreadingConfig::default());
        model.close().await;

        let container = RecordingContainer::new("late");
        let completed = Arc::new(AtomicU32::new(0));
        model.submit_limited(TestJob::new(1, vec![container], completed.clone()));

        // rejected() fires synchronously on the submit path
        assert_eq!(completed.load(Ordering::Acquire), 1);
        assert_eq!(model.pending_limited(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_job_with_no_containers_is_rejected() {
        let model = OrderedPerContainerThreadingModel::start(ThreadingConfig::default());
        let completed = Arc::new(AtomicU32::new(0));

        model.submit(TestJob::new(1, vec![], completed.clone()));

        wait_until(5000, || completed.load(Ordering::Acquire) == 1).await;
        model.close().await;
    }
}
