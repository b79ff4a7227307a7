use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::JobDispatcher;
use crate::graph::{DependencyGraph, GraphError};
use crate::plan::{CycleResult, ExecutionPlan, MarketDataSnapshot, PlanError, PlanExecutor};
use crate::settings::{RecompilationPolicy, ViewProcessSettings};
use crate::stats::{DiscardingGraphStatisticsGatherer, GraphExecutionStatisticsGatherer};


const REPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewProcessState {
    Compiling,
    Running,
    Suspended,
    Terminated,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ViewProcessError {
    #[error("compilation failed: {0}")]
    Compilation(#[from] GraphError),
    #[error("cannot {operation} a view process that is {state:?}")]
    InvalidTransition {
        operation: &'static str,
        state: ViewProcessState,
    },
}

/// A named set of desired outputs. Its content is only meaningful to the
/// [`GraphCompiler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    #[serde(default)]
    pub content: Value,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, content: Value) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }
}

#[async_trait]
pub trait GraphCompiler: Send + Sync {
    async fn compile(&self, definition: &ViewDefinition) -> Result<DependencyGraph, GraphError>;
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Current values for the graph's market data requirements.
    async fn snapshot(&self, graph: &DependencyGraph) -> MarketDataSnapshot;
}

/// Collaborators of a view process.
#[derive(Clone)]
pub struct ViewProcessContext {
    pub compiler: Arc<dyn GraphCompiler>,
    pub market_data: Arc<dyn MarketDataSource>,
    pub dispatcher: JobDispatcher,
    pub settings: ViewProcessSettings,
    pub graph_statistics: Arc<dyn GraphExecutionStatisticsGatherer>,
}

impl ViewProcessContext {
    pub fn new(
        compiler: Arc<dyn GraphCompiler>,
        market_data: Arc<dyn MarketDataSource>,
        dispatcher: JobDispatcher,
        settings: ViewProcessSettings,
    ) -> Self {
        Self {
            compiler,
            market_data,
            dispatcher,
            settings,
            graph_statistics: Arc::new(DiscardingGraphStatisticsGatherer),
        }
    }

    #[must_use]
    pub fn with_graph_statistics(mut self, gatherer: Arc<dyn GraphExecutionStatisticsGatherer>) -> Self {
        self.graph_statistics = gatherer;
        self
    }
}

/// Published after every cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_number: u64,
    /// Starts at 1 and increases with every successful compilation.
    pub graph_version: u64,
    pub plan_id: Uuid,
    pub outcome: Result<Arc<CycleResult>, PlanError>,
}

struct ViewShared {
    definition: ViewDefinition,
    state: watch::Sender<ViewProcessState>,
    change_pending: AtomicBool,
    recompile_forced: AtomicBool,
    wake: Notify,
    active_plan: Mutex<Option<PlanExecutor>>,
    reports: broadcast::Sender<CycleReport>,
    cycles_completed: AtomicU64,
    graph_version: AtomicU64,
}

impl ViewShared {
    fn state(&self) -> ViewProcessState {
        *self.state.borrow()
    }

    fn is_terminated(&self) -> bool {
        self.state() == ViewProcessState::Terminated
    }

    fn transition(&self, from: ViewProcessState, to: ViewProcessState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn terminate(&self) {
        self.state.send_if_modified(|state| {
            if *state == ViewProcessState::Terminated {
                false
            } else {
                *state = ViewProcessState::Terminated;
                true
            }
        });
        self.wake.notify_waiters();
    }

    fn lock_active_plan(&self) -> std::sync::MutexGuard<'_, Option<PlanExecutor>> {
        self.active_plan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_active_plan(&self) {
        if let Some(plan) = self.lock_active_plan().as_ref() {
            plan.cancel(true);
        }
    }
}

/// Drives the cycles of one view and decides when its graph is recompiled.
///
/// The process starts `Compiling`, moves to `Running` once the first graph is
/// available and then runs one cycle after another. A failed first
/// compilation terminates it; later failures keep the previous graph.
pub struct ViewProcessWorker {
    shared: Arc<ViewShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ViewProcessWorker {
    pub fn start(definition: ViewDefinition, context: ViewProcessContext) -> Self {
        let (state, _) = watch::channel(ViewProcessState::Compiling);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let shared = Arc::new(ViewShared {
            definition,
            state,
            change_pending: AtomicBool::new(false),
            recompile_forced: AtomicBool::new(false),
            wake: Notify::new(),
            active_plan: Mutex::new(None),
            reports,
            cycles_completed: AtomicU64::new(0),
            graph_version: AtomicU64::new(0),
        });
        info!("Starting view process {}", shared.definition.name);
        let task = tokio::spawn(CycleLoop::new(Arc::clone(&shared), context).run());
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.definition.name
    }

    pub fn state(&self) -> ViewProcessState {
        self.shared.state()
    }

    /// Waits until the state satisfies `predicate` and returns it.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> ViewProcessState
    where
        F: FnMut(ViewProcessState) -> bool,
    {
        let mut state = self.shared.state.subscribe();
        let reached = match state.wait_for(|s| predicate(*s)).await {
            Ok(state) => *state,
            Err(_) => self.shared.state(),
        };
        reached
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.shared.reports.subscribe()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.shared.cycles_completed.load(Ordering::Acquire)
    }

    pub fn graph_version(&self) -> u64 {
        self.shared.graph_version.load(Ordering::Acquire)
    }

    /// Market data or configuration changed; the recompilation policy decides
    /// what happens next.
    pub fn notify_change(&self) {
        self.shared.change_pending.store(true, Ordering::Release);
        self.shared.wake.notify_waiters();
    }

    /// Recompiles before the next cycle whatever the policy.
    pub fn force_recompile(&self) {
        self.shared.recompile_forced.store(true, Ordering::Release);
        self.shared.wake.notify_waiters();
    }

    /// Stops starting new cycles; a running cycle completes.
    ///
    /// # Errors
    ///
    /// Fails unless the process is `Running`.
    pub fn suspend(&self) -> Result<(), ViewProcessError> {
        if self
            .shared
            .transition(ViewProcessState::Running, ViewProcessState::Suspended)
        {
            info!("Suspended view process {}", self.name());
            Ok(())
        } else {
            Err(ViewProcessError::InvalidTransition {
                operation: "suspend",
                state: self.state(),
            })
        }
    }

    /// # Errors
    ///
    /// Fails unless the process is `Suspended`.
    pub fn resume(&self) -> Result<(), ViewProcessError> {
        if self
            .shared
            .transition(ViewProcessState::Suspended, ViewProcessState::Running)
        {
            info!("Resumed view process {}", self.name());
            Ok(())
        } else {
            Err(ViewProcessError::InvalidTransition {
                operation: "resume",
                state: self.state(),
            })
        }
    }

    /// Cancels the running cycle, terminates the process and waits for its
    /// task to exit. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.shared.terminate();
        self.shared.cancel_active_plan();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("View process {} task ended abnormally: {e}", self.name());
            }
            info!("View process {} terminated", self.name());
        }
    }
}

impl Drop for ViewProcessWorker {
    fn drop(&mut self) {
        self.shared.terminate();
        self.shared.cancel_active_plan();
    }
}

/// The task behind a [`ViewProcessWorker`].
struct CycleLoop {
    shared: Arc<ViewShared>,
    context: ViewProcessContext,
    cycles_since_compile: u64,
    parallel_compilation: Option<JoinHandle<Result<DependencyGraph, GraphError>>>,
}

impl CycleLoop {
    fn new(shared: Arc<ViewShared>, context: ViewProcessContext) -> Self {
        Self {
            shared,
            context,
            cycles_since_compile: 0,
            parallel_compilation: None,
        }
    }

    async fn run(mut self) {
        let name = self.shared.definition.name.clone();
        let mut graph = match self.context.compiler.compile(&self.shared.definition).await {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                error!("Initial compilation of view {name} failed: {e}");
                self.shared.terminate();
                return;
            }
        };
        self.shared.graph_version.store(1, Ordering::Release);
        if !self
            .shared
            .transition(ViewProcessState::Compiling, ViewProcessState::Running)
        {
            return;
        }
        info!("View {name} compiled {} items", graph.len());

        while self.wait_until_runnable().await {
            if let Some(recompiled) = self.recompile_if_due().await {
                graph = recompiled;
            }
            if self.shared.is_terminated() {
                break;
            }

            let cycle_start = Instant::now();
            self.run_cycle(&graph).await;

            if let Some(compilation) = self.parallel_compilation.take() {
                match compilation.await {
                    Ok(Ok(recompiled)) => graph = self.adopt(recompiled),
                    Ok(Err(e)) => error!("Recompilation of view {name} failed: {e}"),
                    Err(e) => error!("Recompilation of view {name} aborted: {e}"),
                }
            }

            let completed = self.shared.cycles_completed.load(Ordering::Acquire);
            if self
                .context
                .settings
                .max_cycles
                .is_some_and(|max| completed >= max)
            {
                info!("View {name} reached its cycle limit");
                self.shared.terminate();
                break;
            }
            self.pace(cycle_start).await;
        }

        if let Some(compilation) = self.parallel_compilation.take() {
            compilation.abort();
        }
        debug!("Cycle loop of view {name} stopped");
    }

    /// Waits while suspended; false once terminated.
    async fn wait_until_runnable(&self) -> bool {
        let mut state = self.shared.state.subscribe();
        let runnable = match state
            .wait_for(|s| matches!(s, ViewProcessState::Running | ViewProcessState::Terminated))
            .await
        {
            Ok(state) => *state == ViewProcessState::Running,
            Err(_) => false,
        };
        runnable
    }

    async fn pace(&self, cycle_start: Instant) {
        let remaining = self
            .context
            .settings
            .min_cycle_interval()
            .saturating_sub(cycle_start.elapsed());
        if remaining.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        let mut state = self.shared.state.subscribe();
        tokio::select! {
            () = tokio::time::sleep(remaining) => {}
            _ = state.wait_for(|s| *s == ViewProcessState::Terminated) => {}
            () = self.shared.wake.notified() => {}
        };
    }

    fn adopt(&mut self, graph: DependencyGraph) -> Arc<DependencyGraph> {
        let version = self.shared.graph_version.fetch_add(1, Ordering::AcqRel) + 1;
        self.cycles_since_compile = 0;
        info!(
            "View {} now on graph version {version} ({} items)",
            self.shared.definition.name,
            graph.len()
        );
        Arc::new(graph)
    }

    /// Applies the recompilation policy; returns the graph to switch to now.
    async fn recompile_if_due(&mut self) -> Option<Arc<DependencyGraph>> {
        let forced = self.shared.recompile_forced.swap(false, Ordering::AcqRel);
        match self.context.settings.recompilation {
            RecompilationPolicy::Immediate => {
                let changed = self.shared.change_pending.swap(false, Ordering::AcqRel);
                if changed || forced {
                    return self.compile_now().await;
                }
            }
            RecompilationPolicy::Parallel if self.parallel_compilation.is_none() => {
                if forced {
                    self.shared.change_pending.store(false, Ordering::Release);
                    return self.compile_now().await;
                }
                self.compile_in_background_if_changed();
            }
            RecompilationPolicy::Parallel => {}
            RecompilationPolicy::Deferred { after_cycles } => {
                let due = after_cycles.is_some_and(|n| self.cycles_since_compile >= n);
                if forced || due {
                    self.shared.change_pending.store(false, Ordering::Release);
                    return self.compile_now().await;
                }
            }
        }
        None
    }

    /// Under the parallel policy, starts compiling a pending change while the
    /// current graph keeps cycling.
    fn compile_in_background_if_changed(&mut self) {
        if self.context.settings.recompilation != RecompilationPolicy::Parallel
            || self.parallel_compilation.is_some()
            || !self.shared.change_pending.swap(false, Ordering::AcqRel)
        {
            return;
        }
        let compiler = Arc::clone(&self.context.compiler);
        let definition = self.shared.definition.clone();
        debug!("Recompiling view {} alongside the running cycle", definition.name);
        self.parallel_compilation = Some(tokio::spawn(async move { compiler.compile(&definition).await }));
    }

    async fn compile_now(&mut self) -> Option<Arc<DependencyGraph>> {
        if !self
            .shared
            .transition(ViewProcessState::Running, ViewProcessState::Compiling)
        {
            return None;
        }
        let start = Instant::now();
        let compiled = self.context.compiler.compile(&self.shared.definition).await;
        self.shared
            .transition(ViewProcessState::Compiling, ViewProcessState::Running);
        match compiled {
            Ok(graph) => {
                debug!("Recompiled view {} in {:?}", self.shared.definition.name, start.elapsed());
                Some(self.adopt(graph))
            }
            Err(e) => {
                error!(
                    "Recompilation of view {} failed, keeping the previous graph: {e}",
                    self.shared.definition.name
                );
                None
            }
        }
    }

    async fn run_cycle(&mut self, graph: &Arc<DependencyGraph>) {
        let cycle_number = self.shared.cycles_completed.load(Ordering::Acquire) + 1;
        let market_data = self.context.market_data.snapshot(graph).await;
        let plan = ExecutionPlan::new(Arc::clone(graph), market_data).with_cycle_id(cycle_number);
        let executor = PlanExecutor::new(plan, self.context.dispatcher.clone())
            .with_graph_statistics(Arc::clone(&self.context.graph_statistics));

        *self.shared.lock_active_plan() = Some(executor.clone());
        if self.shared.is_terminated() {
            executor.cancel(true);
        } else if let Err(e) = executor.start() {
            warn!("Cycle {cycle_number} did not start: {e}");
        }

        let shared = Arc::clone(&self.shared);
        let finished = await_cycle(
            &executor,
            self.context.settings.cycle_timeout(),
            &shared.definition.name,
            cycle_number,
        );
        tokio::pin!(finished);
        let outcome = loop {
            tokio::select! {
                outcome = &mut finished => break outcome,
                () = shared.wake.notified() => self.compile_in_background_if_changed(),
            }
        };
        *self.shared.lock_active_plan() = None;

        self.shared.cycles_completed.fetch_add(1, Ordering::AcqRel);
        self.cycles_since_compile += 1;
        match &outcome {
            Ok(result) => debug!(
                "Cycle {cycle_number} produced {} values and {} failures",
                result.values.len(),
                result.failures.len()
            ),
            Err(e) => debug!("Cycle {cycle_number} ended without a result: {e}"),
        }
        // No subscribers is not an error.
        let _ = self.shared.reports.send(CycleReport {
            cycle_number,
            graph_version: self.shared.graph_version.load(Ordering::Acquire),
            plan_id: executor.plan_id(),
            outcome,
        });
    }
}

/// Waits for a cycle's plan, cancelling it once it overruns `limit`.
async fn await_cycle(
    executor: &PlanExecutor,
    limit: Option<Duration>,
    view_name: &str,
    cycle_number: u64,
) -> Result<Arc<CycleResult>, PlanError> {
    let Some(limit) = limit else {
        return executor.get().await;
    };
    match executor.get_timeout(limit).await {
        Err(PlanError::Timeout(_)) => {
            warn!("Cycle {cycle_number} of view {view_name} overran {limit:?}; cancelling it");
            executor.cancel(true);
            executor.get().await
        }
        outcome => outcome,
    }
}
