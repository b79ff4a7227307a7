use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blacklist::{BlacklistPolicyEnforcer, FunctionBlacklist};
use crate::cost::{FunctionCostRecord, FunctionCostStore, InMemoryFunctionCostStore};
use crate::function::FunctionOutputs;
use crate::graph::NodeIndex;
use crate::settings::{DispatcherSettings, GridSettings};
use crate::stats::{
    CalculationNodeStatisticsGatherer, DiscardingInvocationStatisticsGatherer,
    DiscardingNodeStatisticsGatherer, FunctionInvocationStatisticsGatherer,
};
use crate::value::FunctionId;

pub mod job;
pub mod node;
pub mod partition;


pub use job::{
    CalculationJob, CalculationJobResult, FailureReason, ItemResult, JobItem, JobSpecification,
    NodeFault,
};
pub use node::{CalculationNode, LocalCalculationNode};
pub use partition::{CostBasedJobSizer, CostedItem, FixedSizeJobSizer, JobSizingStrategy};

/// Shared components the dispatcher consults and feeds.
#[derive(Clone)]
pub struct DispatcherCollaborators {
    pub cost_store: Arc<dyn FunctionCostStore>,
    pub job_sizer: Arc<dyn JobSizingStrategy>,
    pub blacklist: Arc<FunctionBlacklist>,
    /// Turns repeated function faults into blacklist rules; `None` leaves the
    /// blacklist to administrators.
    pub enforcer: Option<Arc<BlacklistPolicyEnforcer>>,
    pub invocation_statistics: Arc<dyn FunctionInvocationStatisticsGatherer>,
    pub node_statistics: Arc<dyn CalculationNodeStatisticsGatherer>,
}

impl DispatcherCollaborators {
    /// In-memory cost store, cost-based sizing, a fresh blacklist enforced with
    /// the configured policy and discarding statistics.
    pub fn new(settings: &GridSettings) -> Self {
        let blacklist = Arc::new(FunctionBlacklist::new("default"));
        Self {
            cost_store: Arc::new(InMemoryFunctionCostStore::new()),
            job_sizer: Arc::new(CostBasedJobSizer::new(settings.job_sizing.clone())),
            enforcer: Some(Arc::new(BlacklistPolicyEnforcer::new(
                settings.blacklist.clone(),
                Arc::clone(&blacklist),
            ))),
            blacklist,
            invocation_statistics: Arc::new(DiscardingInvocationStatisticsGatherer),
            node_statistics: Arc::new(DiscardingNodeStatisticsGatherer),
        }
    }

    #[must_use]
    pub fn with_cost_store(mut self, cost_store: Arc<dyn FunctionCostStore>) -> Self {
        self.cost_store = cost_store;
        self
    }

    #[must_use]
    pub fn with_job_sizer(mut self, job_sizer: Arc<dyn JobSizingStrategy>) -> Self {
        self.job_sizer = job_sizer;
        self
    }

    /// Replaces the blacklist. An existing enforcer keeps its policy and moves
    /// to the new blacklist.
    #[must_use]
    pub fn with_blacklist(mut self, blacklist: Arc<FunctionBlacklist>, settings: &GridSettings) -> Self {
        if self.enforcer.is_some() {
            self.enforcer = Some(Arc::new(BlacklistPolicyEnforcer::new(
                settings.blacklist.clone(),
                Arc::clone(&blacklist),
            )));
        }
        self.blacklist = blacklist;
        self
    }

    #[must_use]
    pub fn with_enforcer(mut self, enforcer: Option<Arc<BlacklistPolicyEnforcer>>) -> Self {
        self.enforcer = enforcer;
        self
    }

    #[must_use]
    pub fn with_invocation_statistics(
        mut self,
        gatherer: Arc<dyn FunctionInvocationStatisticsGatherer>,
    ) -> Self {
        self.invocation_statistics = gatherer;
        self
    }

    #[must_use]
    pub fn with_node_statistics(mut self, gatherer: Arc<dyn CalculationNodeStatisticsGatherer>) -> Self {
        self.node_statistics = gatherer;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    ItemCompleted {
        item_id: NodeIndex,
        values: FunctionOutputs,
    },
    ItemFailed {
        item_id: NodeIndex,
        reason: FailureReason,
    },
    /// The context has no queued or running jobs left.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    None,
    /// Dispatch nothing new; let running jobs finish.
    Drain,
    /// Abandon running jobs and discard their results.
    Interrupt,
}

/// Per-plan dispatch bookkeeping shared between a plan and the dispatcher.
#[derive(Debug)]
pub struct DispatchContext {
    plan_id: Uuid,
    configuration_name: String,
    cancellation: watch::Sender<Cancellation>,
    retry_budget: AtomicU32,
    failed: AtomicBool,
    outstanding_jobs: AtomicUsize,
    events: mpsc::UnboundedSender<DispatchEvent>,
}

impl DispatchContext {
    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn configuration_name(&self) -> &str {
        &self.configuration_name
    }

    pub fn cancel(&self, may_interrupt: bool) {
        let requested = if may_interrupt {
            Cancellation::Interrupt
        } else {
            Cancellation::Drain
        };
        self.cancellation.send_if_modified(|current| {
            let escalate = match *current {
                Cancellation::None => true,
                Cancellation::Drain => requested == Cancellation::Interrupt,
                Cancellation::Interrupt => false,
            };
            if escalate {
                *current = requested;
            }
            escalate
        });
    }

    pub fn cancellation(&self) -> Cancellation {
        *self.cancellation.borrow()
    }

    pub fn subscribe_cancellation(&self) -> watch::Receiver<Cancellation> {
        self.cancellation.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation() != Cancellation::None
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancellation() == Cancellation::Interrupt
    }

    /// Whether the retry budget ran out.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn remaining_retries(&self) -> u32 {
        self.retry_budget.load(Ordering::Acquire)
    }

    /// Jobs queued or running on a node.
    pub fn outstanding_jobs(&self) -> usize {
        self.outstanding_jobs.load(Ordering::Acquire)
    }

    fn consume_retry(&self) -> bool {
        self.retry_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| budget.checked_sub(1))
            .is_ok()
    }

    fn emit(&self, event: DispatchEvent) {
        // The plan may already have stopped listening.
        let _ = self.events.send(event);
    }

    fn job_started(&self) {
        self.outstanding_jobs.fetch_add(1, Ordering::AcqRel);
    }

    fn job_finished(&self) {
        if self.outstanding_jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.emit(DispatchEvent::Idle);
        }
    }

    async fn interrupted(&self) {
        let mut cancellation = self.cancellation.subscribe();
        if cancellation
            .wait_for(|c| *c == Cancellation::Interrupt)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }
}

struct QueuedJob {
    job: CalculationJob,
    context: Arc<DispatchContext>,
    /// Nodes that already faulted on these items.
    avoid: HashSet<String>,
}

struct NodeHandle {
    node: Arc<dyn CalculationNode>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

struct DispatcherInner {
    settings: DispatcherSettings,
    collaborators: DispatcherCollaborators,
    queue: Mutex<VecDeque<QueuedJob>>,
    job_available: Notify,
    nodes: DashMap<String, NodeHandle>,
    submitted_items: AtomicU64,
}

/// Splits ready items into jobs and runs them on a pool of calculation nodes.
///
/// Each node contributes one worker per unit of capacity. Workers pull the
/// next eligible job from a shared queue, so slow nodes take less work. Job
/// outcomes come back to the owning plan as [`DispatchEvent`]s.
///
/// Workers run until [`remove_node`](Self::remove_node) or
/// [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct JobDispatcher {
    inner: Arc<DispatcherInner>,
}

impl JobDispatcher {
    pub fn new(settings: DispatcherSettings, collaborators: DispatcherCollaborators) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                settings,
                collaborators,
                queue: Mutex::new(VecDeque::new()),
                job_available: Notify::new(),
                nodes: DashMap::new(),
                submitted_items: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.inner.settings
    }

    pub fn collaborators(&self) -> &DispatcherCollaborators {
        &self.inner.collaborators
    }

    pub fn add_node(&self, node: Arc<dyn CalculationNode>) {
        let node_id = node.node_id().to_string();
        let (shutdown, _) = watch::channel(false);
        let workers = (0..node.capacity().max(1))
            .map(|_| {
                let inner = Arc::clone(&self.inner);
                let node = Arc::clone(&node);
                let shutdown = shutdown.subscribe();
                tokio::spawn(async move { inner.run_worker(node, shutdown).await })
            })
            .collect::<Vec<_>>();
        info!("Node {node_id} joined with {} workers", workers.len());

        let previous = self.inner.nodes.insert(
            node_id,
            NodeHandle {
                node,
                shutdown,
                workers,
            },
        );
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Stops the node's workers once their current jobs finish.
    pub fn remove_node(&self, node_id: &str) -> bool {
        match self.inner.nodes.remove(node_id) {
            Some((_, handle)) => {
                handle.stop();
                info!("Node {node_id} left");
                // Jobs avoiding every other node may now be eligible.
                self.inner.job_available.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        let node_ids: Vec<String> = self.inner.nodes.iter().map(|e| e.key().clone()).collect();
        for node_id in node_ids {
            self.remove_node(&node_id);
        }
    }

    /// Items handed to nodes so far, counting every resubmission.
    pub fn submitted_item_count(&self) -> u64 {
        self.inner.submitted_items.load(Ordering::Acquire)
    }

    pub fn queued_job_count(&self) -> usize {
        self.inner.lock_queue().len()
    }

    pub fn new_context(
        &self,
        plan_id: Uuid,
        configuration_name: impl Into<String>,
    ) -> (Arc<DispatchContext>, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (cancellation, _) = watch::channel(Cancellation::None);
        let context = DispatchContext {
            plan_id,
            configuration_name: configuration_name.into(),
            cancellation,
            retry_budget: AtomicU32::new(self.inner.settings.plan_retry_budget),
            failed: AtomicBool::new(false),
            outstanding_jobs: AtomicUsize::new(0),
            events,
        };
        (Arc::new(context), receiver)
    }

    /// Queues ready items for execution under `context`.
    ///
    /// Blacklisted items are reported failed at once and never reach a node.
    pub async fn dispatch(&self, context: &Arc<DispatchContext>, items: Vec<JobItem>) {
        if context.is_cancelled() || items.is_empty() {
            return;
        }
        let start = Instant::now();
        let collaborators = &self.inner.collaborators;
        collaborators.blacklist.purge_expired();

        let (blocked, runnable): (Vec<JobItem>, Vec<JobItem>) = items.into_iter().partition(|item| {
            collaborators
                .blacklist
                .is_blacklisted(&item.function_id, &item.parameters, &item.target)
        });
        for item in blocked {
            debug!("Item {} skipped: {} is blacklisted", item.item_id, item.function_id);
            context.emit(DispatchEvent::ItemFailed {
                item_id: item.item_id,
                reason: FailureReason::FunctionBlacklisted,
            });
        }
        if runnable.is_empty() {
            return;
        }

        let costs = self.load_costs(context.configuration_name(), &runnable).await;
        let costed = runnable
            .into_iter()
            .map(|item| CostedItem {
                cost: costs.get(&item.function_id).cloned().flatten(),
                item,
            })
            .collect();
        let jobs = collaborators.job_sizer.partition(costed);

        if context.is_cancelled() {
            return;
        }
        let job_count = jobs.len();
        for items in jobs {
            let specification = JobSpecification::new(context.plan_id, context.configuration_name());
            self.inner
                .enqueue(context, CalculationJob::new(specification, items), HashSet::new());
        }
        debug!(
            "Queued {job_count} jobs for plan {} in {:?}",
            context.plan_id,
            start.elapsed()
        );
    }

    async fn load_costs(
        &self,
        configuration_name: &str,
        items: &[JobItem],
    ) -> HashMap<FunctionId, Option<FunctionCostRecord>> {
        let mut costs = HashMap::new();
        for item in items {
            if costs.contains_key(&item.function_id) {
                continue;
            }
            let cost = match self
                .inner
                .collaborators
                .cost_store
                .load(configuration_name, &item.function_id, None)
                .await
            {
                Ok(cost) => cost,
                Err(e) => {
                    warn!("No cost estimate for {}: {e}", item.function_id);
                    None
                }
            };
            costs.insert(item.function_id.clone(), cost);
        }
        costs
    }

    /// Drops the context's queued jobs; returns how many were dropped.
    pub fn purge_cancelled(&self, context: &Arc<DispatchContext>) -> usize {
        let purged = {
            let mut queue = self.inner.lock_queue();
            let (purged, kept): (VecDeque<QueuedJob>, VecDeque<QueuedJob>) = queue
                .drain(..)
                .partition(|queued| Arc::ptr_eq(&queued.context, context));
            *queue = kept;
            purged
        };
        for queued in &purged {
            queued.context.job_finished();
        }
        if !purged.is_empty() {
            debug!("Purged {} queued jobs of plan {}", purged.len(), context.plan_id);
        }
        purged.len()
    }
}

impl NodeHandle {
    fn stop(&self) {
        self.shutdown.send_replace(true);
        debug!(
            "Stopping {} workers of node {}",
            self.workers.len(),
            self.node.node_id()
        );
    }
}

impl DispatcherInner {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedJob>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, context: &Arc<DispatchContext>, job: CalculationJob, avoid: HashSet<String>) {
        context.job_started();
        self.lock_queue().push_back(QueuedJob {
            job,
            context: Arc::clone(context),
            avoid,
        });
        self.job_available.notify_waiters();
    }

    /// Takes the first job this node may run. A job avoids the nodes that
    /// faulted on it unless no other node is left.
    fn take_job(&self, node_id: &str) -> Option<QueuedJob> {
        let mut queue = self.lock_queue();
        let position = queue.iter().position(|queued| {
            !queued.avoid.contains(node_id)
                || self.nodes.iter().all(|entry| queued.avoid.contains(entry.key()))
        })?;
        queue.remove(position)
    }

    async fn next_job(&self, node_id: &str) -> QueuedJob {
        loop {
            let notified = self.job_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(queued) = self.take_job(node_id) {
                return queued;
            }
            notified.await;
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        node: Arc<dyn CalculationNode>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let node_id = node.node_id().to_string();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let failure_rate = self
                .collaborators
                .node_statistics
                .recent_failure_rate(&node_id)
                .clamp(0.0, 1.0);
            if failure_rate > 0.0 {
                let backoff = self.settings.node_failure_backoff().mul_f64(failure_rate);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }

            let queued = tokio::select! {
                _ = shutdown.changed() => break,
                queued = self.next_job(&node_id) => queued,
            };
            self.run_job(node.as_ref(), queued).await;
        }
        debug!("Worker of node {node_id} stopped");
    }

    async fn submit_with_deadline(
        &self,
        node: &dyn CalculationNode,
        job: CalculationJob,
    ) -> Result<CalculationJobResult, NodeFault> {
        match self.settings.max_job_execution() {
            Some(limit) => timeout(limit, node.submit(job))
                .await
                .unwrap_or(Err(NodeFault::Timeout(limit))),
            None => node.submit(job).await,
        }
    }

    /// Rules may have been added while the job sat in the queue; matching
    /// items fail here instead of reaching the node. Returns `None` when no
    /// item is left to submit.
    fn withhold_blacklisted(&self, context: &DispatchContext, job: CalculationJob) -> Option<CalculationJob> {
        let blacklist = &self.collaborators.blacklist;
        blacklist.purge_expired();
        if !job.items.iter().any(|item| {
            blacklist.is_blacklisted(&item.function_id, &item.parameters, &item.target)
        }) {
            return Some(job);
        }

        let (blocked, runnable): (Vec<JobItem>, Vec<JobItem>) =
            job.items.iter().cloned().partition(|item| {
                blacklist.is_blacklisted(&item.function_id, &item.parameters, &item.target)
            });
        for item in blocked {
            debug!(
                "Item {} withheld from job {}: {} is blacklisted",
                item.item_id, job.specification.job_id, item.function_id
            );
            context.emit(DispatchEvent::ItemFailed {
                item_id: item.item_id,
                reason: FailureReason::FunctionBlacklisted,
            });
        }
        if runnable.is_empty() {
            None
        } else {
            Some(CalculationJob::new(job.specification, runnable))
        }
    }

    async fn run_job(&self, node: &dyn CalculationNode, queued: QueuedJob) {
        let QueuedJob {
            job,
            context,
            avoid,
        } = queued;
        if context.is_interrupted() {
            context.job_finished();
            return;
        }
        let Some(job) = self.withhold_blacklisted(&context, job) else {
            context.job_finished();
            return;
        };

        let node_id = node.node_id();
        let item_count = job.len();
        self.submitted_items
            .fetch_add(item_count as u64, Ordering::AcqRel);
        debug!(
            "Submitting job {} (attempt {}, {item_count} items) to {node_id}",
            job.specification.job_id, job.specification.attempt
        );

        let start = Instant::now();
        let outcome = tokio::select! {
            outcome = self.submit_with_deadline(node, job.clone()) => outcome,
            () = context.interrupted() => {
                debug!("Abandoned job {} on {node_id}", job.specification.job_id);
                context.job_finished();
                return;
            }
        };
        let duration_nanos = nanos(start.elapsed());

        match outcome {
            Ok(result) => {
                self.collaborators.node_statistics.job_completed(
                    node_id,
                    item_count as u64,
                    result.execution_nanos,
                    duration_nanos,
                );
                self.handle_result(&context, &job, result);
            }
            Err(fault) => {
                warn!("Job {} failed on {node_id}: {fault}", job.specification.job_id);
                self.collaborators
                    .node_statistics
                    .job_failed(node_id, duration_nanos);
                self.handle_fault(&context, job, avoid, node_id, &fault);
            }
        }
        context.job_finished();
    }

    fn handle_result(&self, context: &Arc<DispatchContext>, job: &CalculationJob, result: CalculationJobResult) {
        if context.is_interrupted() {
            return;
        }
        let collaborators = &self.collaborators;
        let reported = result.item_results.len();
        let mut not_executed = Vec::new();

        for (item, item_result) in job.items.iter().zip(result.item_results) {
            match item_result {
                ItemResult::Success {
                    values,
                    execution_nanos,
                    input_bytes,
                    output_bytes,
                } => {
                    collaborators.invocation_statistics.function_invoked(
                        context.configuration_name(),
                        &item.function_id,
                        1,
                        execution_nanos as f64,
                        input_bytes as f64,
                        output_bytes as f64,
                    );
                    if let Some(enforcer) = &collaborators.enforcer {
                        enforcer.record_success(&item.function_id, &item.parameters, &item.target);
                    }
                    context.emit(DispatchEvent::ItemCompleted {
                        item_id: item.item_id,
                        values,
                    });
                }
                ItemResult::Failure(reason) => {
                    if let (FailureReason::FunctionFault(_), Some(enforcer)) = (&reason, &collaborators.enforcer) {
                        enforcer.record_failure(&item.function_id, &item.parameters, &item.target);
                    }
                    context.emit(DispatchEvent::ItemFailed {
                        item_id: item.item_id,
                        reason,
                    });
                }
                ItemResult::NotExecuted => not_executed.push(item.clone()),
            }
        }
        not_executed.extend(job.items.iter().skip(reported).cloned());

        if !not_executed.is_empty() {
            debug!(
                "Resubmitting {} items of job {} not executed by {}",
                not_executed.len(),
                job.specification.job_id,
                result.node_id
            );
            let specification = job.specification.resubmitted(job.specification.attempt);
            self.resubmit(context, specification, not_executed, HashSet::new());
        }
    }

    fn handle_fault(
        &self,
        context: &Arc<DispatchContext>,
        job: CalculationJob,
        mut avoid: HashSet<String>,
        node_id: &str,
        fault: &NodeFault,
    ) {
        if context.is_interrupted() {
            return;
        }
        let items = Arc::unwrap_or_clone(job.items);
        if job.specification.attempt < self.settings.max_job_attempts {
            avoid.insert(node_id.to_string());
            let specification = job.specification.resubmitted(job.specification.attempt + 1);
            self.resubmit(context, specification, items, avoid);
        } else {
            for item in items {
                context.emit(DispatchEvent::ItemFailed {
                    item_id: item.item_id,
                    reason: FailureReason::TransportFault(fault.to_string()),
                });
            }
        }
    }

    fn resubmit(
        &self,
        context: &Arc<DispatchContext>,
        specification: JobSpecification,
        items: Vec<JobItem>,
        avoid: HashSet<String>,
    ) {
        if context.is_cancelled() {
            return;
        }
        if !context.consume_retry() {
            if !context.failed.swap(true, Ordering::AcqRel) {
                warn!("Plan {} exhausted its retry budget", context.plan_id);
            }
            for item in items {
                context.emit(DispatchEvent::ItemFailed {
                    item_id: item.item_id,
                    reason: FailureReason::RetryBudgetExhausted,
                });
            }
            return;
        }
        self.enqueue(context, CalculationJob::new(specification, items), avoid);
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
