use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatcher::{Cancellation, DispatchContext, DispatchEvent, FailureReason, JobDispatcher, JobItem};
use crate::function::{FunctionInputs, FunctionOutputs};
use crate::graph::{DependencyGraph, NodeIndex};
use crate::stats::{DiscardingGraphStatisticsGatherer, GraphExecutionStatisticsGatherer};
use crate::value::{ComputedValue, ValueSpecification};

#[cfg(test)]
mod tests;

/// Market data values available to a cycle, keyed by the graph's
/// market data requirements.
pub type MarketDataSnapshot = IndexMap<ValueSpecification, ComputedValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl PlanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanState::Completed | PlanState::Cancelled | PlanState::Failed)
    }
}

/// Everything needed to run one cycle of a graph.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub plan_id: Uuid,
    pub cycle_id: u64,
    pub graph: Arc<DependencyGraph>,
    pub market_data: MarketDataSnapshot,
}

impl ExecutionPlan {
    pub fn new(graph: Arc<DependencyGraph>, market_data: MarketDataSnapshot) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            cycle_id: 0,
            graph,
            market_data,
        }
    }

    #[must_use]
    pub fn with_cycle_id(mut self, cycle_id: u64) -> Self {
        self.cycle_id = cycle_id;
        self
    }
}

/// Outcome of a finished cycle. Every output of every item appears in exactly
/// one of `values` or `failures`, unless a successful function left an output
/// unset.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    pub plan_id: Uuid,
    pub configuration_name: String,
    pub values: IndexMap<ValueSpecification, ComputedValue>,
    pub failures: IndexMap<ValueSpecification, FailureReason>,
    pub item_count: usize,
    pub duration: Duration,
}

impl CycleResult {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("plan has already been started or cancelled")]
    AlreadyStarted,
    #[error("plan did not complete within {0:?}")]
    Timeout(Duration),
    #[error("plan was cancelled")]
    Cancelled,
    #[error("plan failed after exhausting its retry budget")]
    Failed { result: Arc<CycleResult> },
}

#[derive(Debug, Clone)]
struct PlanStatus {
    state: PlanState,
    result: Option<Arc<CycleResult>>,
}

struct PlanInner {
    plan: ExecutionPlan,
    dispatcher: JobDispatcher,
    graph_statistics: RwLock<Arc<dyn GraphExecutionStatisticsGatherer>>,
    context: Arc<DispatchContext>,
    events: Mutex<Option<mpsc::UnboundedReceiver<DispatchEvent>>>,
    status: watch::Sender<PlanStatus>,
}

/// A handle over one execution plan. Clones share the plan, so any number of
/// callers may wait on it.
#[derive(Clone)]
pub struct PlanExecutor {
    inner: Arc<PlanInner>,
}

impl PlanExecutor {
    pub fn new(plan: ExecutionPlan, dispatcher: JobDispatcher) -> Self {
        let (context, events) =
            dispatcher.new_context(plan.plan_id, plan.graph.configuration_name());
        let (status, _) = watch::channel(PlanStatus {
            state: PlanState::Created,
            result: None,
        });
        Self {
            inner: Arc::new(PlanInner {
                plan,
                dispatcher,
                graph_statistics: RwLock::new(Arc::new(DiscardingGraphStatisticsGatherer)),
                context,
                events: Mutex::new(Some(events)),
                status,
            }),
        }
    }

    /// Reports the plan's totals to `gatherer` on completion. Clones of the
    /// executor share the gatherer.
    #[must_use]
    pub fn with_graph_statistics(self, gatherer: Arc<dyn GraphExecutionStatisticsGatherer>) -> Self {
        *self
            .inner
            .graph_statistics
            .write()
            .unwrap_or_else(PoisonError::into_inner) = gatherer;
        self
    }

    pub fn plan_id(&self) -> Uuid {
        self.inner.plan.plan_id
    }

    pub fn state(&self) -> PlanState {
        self.inner.status.borrow().state
    }

    /// Starts dispatching.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::AlreadyStarted`] unless the plan is still `Created`.
    pub fn start(&self) -> Result<(), PlanError> {
        let started = self.inner.status.send_if_modified(|status| {
            if status.state == PlanState::Created {
                status.state = PlanState::Running;
                true
            } else {
                false
            }
        });
        let events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (true, Some(events)) = (started, events) else {
            return Err(PlanError::AlreadyStarted);
        };

        info!(
            "Starting plan {} (cycle {}) with {} items",
            self.inner.plan.plan_id,
            self.inner.plan.cycle_id,
            self.inner.plan.graph.len()
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { PlanDriver::new(inner).run(events).await });
        Ok(())
    }

    /// Waits for the plan to finish. A plan that is never started never
    /// finishes.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cancelled`] for a cancelled plan and
    /// [`PlanError::Failed`] when the retry budget ran out.
    pub async fn get(&self) -> Result<Arc<CycleResult>, PlanError> {
        let mut status = self.inner.status.subscribe();
        let finished = match status.wait_for(|s| s.state.is_terminal()).await {
            Ok(status) => status.clone(),
            Err(_) => return Err(PlanError::Cancelled),
        };
        match (finished.state, finished.result) {
            (PlanState::Completed, Some(result)) => Ok(result),
            (PlanState::Failed, Some(result)) => Err(PlanError::Failed { result }),
            _ => Err(PlanError::Cancelled),
        }
    }

    /// Like [`get`](Self::get), but gives up after `limit`. Giving up leaves
    /// the plan running.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Timeout`] when `limit` elapses first.
    pub async fn get_timeout(&self, limit: Duration) -> Result<Arc<CycleResult>, PlanError> {
        tokio::time::timeout(limit, self.get())
            .await
            .map_err(|_| PlanError::Timeout(limit))?
    }

    /// Cancels the plan; returns false when it had already finished.
    ///
    /// With `may_interrupt` the plan is cancelled at once and running jobs are
    /// abandoned. Otherwise nothing new is dispatched and the plan becomes
    /// `Cancelled` once its running jobs finish.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let mut accepted = false;
        self.inner.status.send_if_modified(|status| match status.state {
            PlanState::Created => {
                status.state = PlanState::Cancelled;
                accepted = true;
                true
            }
            PlanState::Running => {
                accepted = true;
                if may_interrupt {
                    status.state = PlanState::Cancelled;
                }
                may_interrupt
            }
            _ => false,
        });
        if !accepted {
            return false;
        }

        self.inner.context.cancel(may_interrupt);
        self.inner.dispatcher.purge_cancelled(&self.inner.context);
        info!(
            "Cancelled plan {} (interrupt: {may_interrupt})",
            self.inner.plan.plan_id
        );
        true
    }
}

/// Records outcomes and releases dependants. The only writer of a running
/// plan's results, so completion is decided exactly once.
struct PlanDriver {
    inner: Arc<PlanInner>,
    start: Instant,
    remaining_upstream: Vec<usize>,
    recorded: Vec<bool>,
    recorded_count: usize,
    succeeded: usize,
    available: IndexMap<ValueSpecification, ComputedValue>,
    values: IndexMap<ValueSpecification, ComputedValue>,
    failures: IndexMap<ValueSpecification, FailureReason>,
}

impl PlanDriver {
    fn new(inner: Arc<PlanInner>) -> Self {
        let graph = &inner.plan.graph;
        let remaining_upstream = (0..graph.len()).map(|i| graph.upstream(i).len()).collect();
        let recorded = vec![false; graph.len()];
        let available = inner.plan.market_data.clone();
        Self {
            inner,
            start: Instant::now(),
            remaining_upstream,
            recorded,
            recorded_count: 0,
            succeeded: 0,
            available,
            values: IndexMap::new(),
            failures: IndexMap::new(),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<DispatchEvent>) {
        let graph = Arc::clone(&self.inner.plan.graph);
        let roots: Vec<NodeIndex> = graph
            .execution_order()
            .iter()
            .copied()
            .filter(|&i| self.remaining_upstream[i] == 0)
            .collect();
        let ready = self.prepare(roots);
        self.dispatch(ready).await;

        let mut cancellation = self.inner.context.subscribe_cancellation();
        loop {
            let requested = *cancellation.borrow_and_update();
            match requested {
                Cancellation::Interrupt => {
                    debug!("Plan {} driver stopped by interrupt", self.inner.plan.plan_id);
                    return;
                }
                Cancellation::Drain if self.inner.context.outstanding_jobs() == 0 => {
                    self.finish_cancelled();
                    return;
                }
                Cancellation::None if self.recorded_count == self.recorded.len() => {
                    self.complete();
                    return;
                }
                _ => {}
            }

            tokio::select! {
                changed = cancellation.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    let released = self.apply(event);
                    let ready = self.prepare(released);
                    self.dispatch(ready).await;
                }
            }
        }
    }

    async fn dispatch(&self, ready: Vec<JobItem>) {
        if !ready.is_empty() {
            self.inner.dispatcher.dispatch(&self.inner.context, ready).await;
        }
    }

    /// Records one outcome; returns the dependants it made ready.
    fn apply(&mut self, event: DispatchEvent) -> Vec<NodeIndex> {
        match event {
            DispatchEvent::ItemCompleted { item_id, values } => self.record_success(item_id, values),
            DispatchEvent::ItemFailed { item_id, reason } => self.record_failure(item_id, reason),
            DispatchEvent::Idle => Vec::new(),
        }
    }

    fn record_success(&mut self, item_id: NodeIndex, values: FunctionOutputs) -> Vec<NodeIndex> {
        if !self.mark_recorded(item_id) {
            return Vec::new();
        }
        self.succeeded += 1;
        for (specification, value) in values {
            self.available.insert(specification.clone(), value.clone());
            self.values.insert(specification, value);
        }
        self.release(item_id)
    }

    fn record_failure(&mut self, item_id: NodeIndex, reason: FailureReason) -> Vec<NodeIndex> {
        if !self.mark_recorded(item_id) {
            return Vec::new();
        }
        if let Some(node) = self.inner.plan.graph.node(item_id) {
            debug!("Item {} ({}) failed: {reason}", node.id, reason.code());
            for output in &node.outputs {
                self.failures.insert(output.clone(), reason.clone());
            }
        }
        self.release(item_id)
    }

    fn mark_recorded(&mut self, item_id: NodeIndex) -> bool {
        match self.recorded.get_mut(item_id) {
            Some(recorded) if !*recorded => {
                *recorded = true;
                self.recorded_count += 1;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, item_id: NodeIndex) -> Vec<NodeIndex> {
        let graph = Arc::clone(&self.inner.plan.graph);
        let mut released = Vec::new();
        for &dependant in graph.dependants(item_id) {
            self.remaining_upstream[dependant] -= 1;
            if self.remaining_upstream[dependant] == 0 {
                released.push(dependant);
            }
        }
        released
    }

    /// Resolves inputs of newly ready items. Items missing an input fail here,
    /// and so on down the graph; the rest are returned for dispatch.
    fn prepare(&mut self, mut pending: Vec<NodeIndex>) -> Vec<JobItem> {
        let graph = Arc::clone(&self.inner.plan.graph);
        let mut ready = Vec::new();
        while let Some(index) = pending.pop() {
            let Some(node) = graph.node(index) else {
                continue;
            };
            let inputs: Option<IndexMap<ValueSpecification, ComputedValue>> = node
                .inputs
                .iter()
                .map(|spec| self.available.get(spec).map(|v| (spec.clone(), v.clone())))
                .collect();
            match inputs {
                Some(inputs) => {
                    ready.push(JobItem::from_node(index, node, FunctionInputs::new(inputs)));
                }
                None => {
                    let released = self.record_failure(index, FailureReason::MissingInputs);
                    pending.extend(released);
                }
            }
        }
        ready.sort_by_key(|item| item.item_id);
        ready
    }

    fn result(&mut self) -> Arc<CycleResult> {
        Arc::new(CycleResult {
            plan_id: self.inner.plan.plan_id,
            configuration_name: self.inner.plan.graph.configuration_name().to_string(),
            values: std::mem::take(&mut self.values),
            failures: std::mem::take(&mut self.failures),
            item_count: self.recorded.len(),
            duration: self.start.elapsed(),
        })
    }

    fn complete(&mut self) {
        let failed = self.inner.context.has_failed();
        let result = self.result();
        let state = if failed {
            PlanState::Failed
        } else {
            PlanState::Completed
        };
        let failed_items = self.recorded_count - self.succeeded;

        let finished = self.inner.status.send_if_modified(|status| {
            if status.state != PlanState::Running {
                return false;
            }
            status.state = state;
            status.result = Some(Arc::clone(&result));
            true
        });
        if !finished {
            return;
        }

        info!(
            "Plan {} {:?}: {} values, {} failures in {:?}",
            result.plan_id,
            state,
            result.values.len(),
            result.failures.len(),
            result.duration
        );
        let graph_statistics = self
            .inner
            .graph_statistics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        graph_statistics.graph_executed(
            &result.configuration_name,
            result.item_count as u64,
            self.succeeded as u64,
            failed_items as u64,
            u64::try_from(result.duration.as_nanos()).unwrap_or(u64::MAX),
        );
    }

    fn finish_cancelled(&self) {
        self.inner.status.send_if_modified(|status| {
            if status.state != PlanState::Running {
                return false;
            }
            status.state = PlanState::Cancelled;
            true
        });
        info!(
            "Plan {} cancelled after draining running jobs",
            self.inner.plan.plan_id
        );
    }
}
