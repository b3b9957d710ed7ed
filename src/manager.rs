//! The manager: module registry, store graph, scheduling and progress.
//!
//! The manager owns every module and every store. Wiring happens on the
//! caller's thread before the run; during the run the graph is read-only,
//! so none of it needs locking. `run` spawns one named thread per module,
//! blocks until the whole graph drains through sentinel propagation, and
//! returns a per-module status report.

use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use tracing::{error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::module::{run_module, CancelToken, Module, ModuleState, Outcome, RunContext};
use crate::store::{QueueStore, StoreRef};

/// How often the background monitor samples store depths.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(200);

/// Elements of burst headroom per worker thread for source-fed stores.
const BURST_FACTOR: usize = 64;

/// Arena handle for a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ModuleId(usize);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module #{}", self.0)
    }
}

/// Arena handle for an allocated store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StoreId(usize);

/// Parallelism available to the pipeline. The manager owns the sizing and
/// injects the handle into modules that fan out internal sub-tasks.
#[derive(Debug, Clone, Copy)]
pub struct Workers {
    threads: NonZeroUsize,
}

impl Workers {
    /// Size from the machine's available parallelism.
    pub fn detect() -> Self {
        Self {
            threads: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Explicit worker count, clamped to at least one.
    pub fn fixed(threads: usize) -> Self {
        Self {
            threads: NonZeroUsize::new(threads).unwrap_or(NonZeroUsize::MIN),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads.get()
    }
}

/// Capacity policy for a store allocated by [`Manager::link_modules`].
#[derive(Debug, Clone, Copy)]
pub enum StoreCapacity {
    /// Link fed directly by a source: sized by the throughput heuristic,
    /// `min(64 × workers, max_elements / 2)`.
    SourceDriven { max_elements: usize },
    /// Explicit capacity; `put` blocks once it is reached.
    Bounded(usize),
    /// No backpressure; suits sink-side links where growth is acceptable.
    Unbounded,
}

/// Per-module status in a finished run. `run` returning `Ok` does not imply
/// every module succeeded; inspect the states.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub id: ModuleId,
    pub name: String,
    pub state: ModuleState,
}

/// Final status of every module of a finished run, in registration order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub statuses: Vec<ModuleStatus>,
}

impl RunReport {
    pub fn all_completed(&self) -> bool {
        self.statuses
            .iter()
            .all(|s| s.state == ModuleState::Completed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ModuleStatus> {
        self.statuses
            .iter()
            .filter(|s| matches!(s.state, ModuleState::Failed(_)))
    }
}

struct Node<E> {
    module: Box<dyn Module<E>>,
    state: ModuleState,
}

/// Owner of the module registry and the store graph.
pub struct Manager<E> {
    nodes: Vec<Node<E>>,
    stores: Vec<StoreRef<E>>,
    links: Vec<(ModuleId, ModuleId)>,
    workers: Workers,
    cancel: CancelToken,
    progress: Arc<AtomicU8>,
}

impl<E: Clone + Send + 'static> Default for Manager<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> Manager<E> {
    pub fn new() -> Self {
        Self::with_workers(Workers::detect())
    }

    pub fn with_workers(workers: Workers) -> Self {
        Self {
            nodes: Vec::new(),
            stores: Vec::new(),
            links: Vec::new(),
            workers,
            cancel: CancelToken::new(),
            progress: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Register a module and return its handle.
    pub fn add<M: Module<E> + 'static>(&mut self, module: M) -> ModuleId {
        let id = ModuleId(self.nodes.len());
        self.nodes.push(Node {
            module: Box::new(module),
            state: ModuleState::Created,
        });
        id
    }

    /// Allocate a store and wire it from `from`'s next output port to `to`'s
    /// next input port. Linking an unregistered handle is a fatal
    /// configuration error, raised before anything is allocated.
    pub fn link_modules(
        &mut self,
        from: ModuleId,
        to: ModuleId,
        capacity: StoreCapacity,
    ) -> PipelineResult<StoreId> {
        for id in [from, to] {
            if id.0 >= self.nodes.len() {
                return Err(PipelineError::UnknownModule(id));
            }
        }

        let store: StoreRef<E> = match capacity {
            StoreCapacity::SourceDriven { max_elements } => {
                let n = source_capacity(self.workers.threads(), max_elements);
                info!(capacity = n, "allocating source-fed store");
                Arc::new(QueueStore::bounded(n))
            }
            StoreCapacity::Bounded(n) => Arc::new(QueueStore::bounded(n)),
            StoreCapacity::Unbounded => Arc::new(QueueStore::unbounded()),
        };

        self.nodes[from.0]
            .module
            .ports_mut()
            .add_output(Arc::clone(&store));
        self.nodes[to.0]
            .module
            .ports_mut()
            .add_input(Arc::clone(&store));
        for id in [from, to] {
            let node = &mut self.nodes[id.0];
            if node.state == ModuleState::Created {
                node.state = ModuleState::Wired;
            }
        }

        let store_id = StoreId(self.stores.len());
        self.stores.push(store);
        self.links.push((from, to));
        Ok(store_id)
    }

    /// Every store allocated by this manager, in link order.
    pub fn store_registry(&self) -> &[StoreRef<E>] {
        &self.stores
    }

    pub fn store(&self, id: StoreId) -> Option<&StoreRef<E>> {
        self.stores.get(id.0)
    }

    pub fn module_state(&self, id: ModuleId) -> Option<&ModuleState> {
        self.nodes.get(id.0).map(|n| &n.state)
    }

    /// Cancellation handle shared by every run loop this manager schedules.
    /// Cancelling mid-run stops modules at their next iteration boundary;
    /// `reset` installs a fresh token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Most recent progress sample, in percent. Derived from store depths:
    /// `100 × (1 − current_max / historical_max)`.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Clear both registries so the manager can be rewired and re-run.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.stores.clear();
        self.links.clear();
        self.cancel = CancelToken::new();
        self.progress.store(0, Ordering::Relaxed);
    }

    /// Run the pipeline to completion.
    ///
    /// Validates every module's wiring check and the graph's acyclicity
    /// first; any failure aborts before a single module starts. Modules are
    /// then spawned in registration order and held at a readiness barrier
    /// until every one of them has finished its setup, so no downstream
    /// module polls a store its producer has not opened yet. The call blocks
    /// until all module threads finish and returns their final states; a
    /// partial failure is visible only in the report, never as an `Err`.
    pub fn run(&mut self) -> PipelineResult<RunReport> {
        if self.nodes.is_empty() {
            return Ok(RunReport {
                statuses: Vec::new(),
            });
        }

        let unwired: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.module.check())
            .map(|n| n.module.name().to_string())
            .collect();
        if !unwired.is_empty() {
            error!(?unwired, "aborting run: modules failed the wiring check");
            return Err(PipelineError::UnwiredModules { names: unwired });
        }
        self.validate_acyclic()?;

        let workers = self.workers;
        for node in &mut self.nodes {
            node.state = ModuleState::Checked;
            node.module.set_workers(workers);
        }

        let barrier = Arc::new(Barrier::new(self.nodes.len()));
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let stores = self.stores.clone();
        let progress = Arc::clone(&self.progress);
        let cancel = self.cancel.clone();

        thread::scope(|s| {
            let monitor = thread::Builder::new()
                .name("store-monitor".into())
                .spawn_scoped(s, move || monitor_loop(&stores, &progress, &stop_rx))
                .expect("failed to spawn monitor thread");

            let mut handles = Vec::with_capacity(self.nodes.len());
            for node in &mut self.nodes {
                let ctx = RunContext::with_readiness(cancel.clone(), Arc::clone(&barrier));
                let name = node.module.name().to_string();
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(s, move || {
                        node.state = ModuleState::Running;
                        info!(module = %name, "module thread started");
                        let result =
                            catch_unwind(AssertUnwindSafe(|| run_module(&mut *node.module, &ctx)));
                        node.state = match result {
                            Ok(Ok(Outcome::Completed)) => ModuleState::Completed,
                            Ok(Ok(Outcome::Cancelled)) => ModuleState::Cancelled,
                            Ok(Err(e)) => {
                                error!(module = %name, error = %e, "module failed");
                                ModuleState::Failed(e.to_string())
                            }
                            Err(_) => {
                                error!(module = %name, "module panicked in its processing step");
                                ModuleState::Failed("panic in processing step".into())
                            }
                        };
                        info!(module = %name, state = ?node.state, "module thread finished");
                    })
                    .expect("failed to spawn module thread");
                handles.push(handle);
            }

            for handle in handles {
                let _ = handle.join();
            }
            let _ = stop_tx.send(());
            let _ = monitor.join();
        });

        Ok(RunReport {
            statuses: self
                .nodes
                .iter()
                .enumerate()
                .map(|(i, n)| ModuleStatus {
                    id: ModuleId(i),
                    name: n.module.name().to_string(),
                    state: n.state.clone(),
                })
                .collect(),
        })
    }

    /// Sentinel propagation assumes no cycles; reject cyclic wiring before
    /// the run starts.
    fn validate_acyclic(&self) -> PipelineResult<()> {
        let mut graph = DiGraph::<usize, ()>::new();
        let indices: Vec<_> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
        for (from, to) in &self.links {
            graph.add_edge(indices[from.0], indices[to.0], ());
        }
        match toposort(&graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => {
                let offender = graph[cycle.node_id()];
                Err(PipelineError::CyclicGraph {
                    name: self.nodes[offender].module.name().to_string(),
                })
            }
        }
    }
}

/// Throughput heuristic for a store fed directly by a source.
fn source_capacity(workers: usize, max_elements: usize) -> usize {
    (BURST_FACTOR * workers).min(max_elements / 2).max(1)
}

/// Samples every store's depth each interval and derives a liveness-style
/// progress figure from the high-water mark, without any module cooperating.
fn monitor_loop<E>(stores: &[StoreRef<E>], progress: &AtomicU8, stop_rx: &flume::Receiver<()>) {
    let mut historical_max = 1usize;
    loop {
        match stop_rx.recv_timeout(MONITOR_INTERVAL) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
            Err(flume::RecvTimeoutError::Timeout) => {}
        }
        let current_max = stores.iter().map(|s| s.size()).max().unwrap_or(0);
        historical_max = historical_max.max(current_max);
        progress.store(
            progress_percent(current_max, historical_max),
            Ordering::Relaxed,
        );
    }
}

fn progress_percent(current_max: usize, historical_max: usize) -> u8 {
    if historical_max == 0 {
        return 100;
    }
    let pct = 100.0 - (current_max as f32 / historical_max as f32) * 100.0;
    pct.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Ports;
    use proptest::prelude::*;

    struct Nop {
        ports: Ports<u8>,
    }

    impl Nop {
        fn new() -> Self {
            Self {
                ports: Ports::new(),
            }
        }
    }

    impl Module<u8> for Nop {
        fn name(&self) -> &str {
            "nop"
        }
        fn ports(&self) -> &Ports<u8> {
            &self.ports
        }
        fn ports_mut(&mut self) -> &mut Ports<u8> {
            &mut self.ports
        }
    }

    #[test]
    fn linking_unregistered_module_fails_before_allocation() {
        let mut manager: Manager<u8> = Manager::with_workers(Workers::fixed(2));
        let a = manager.add(Nop::new());
        let bogus = ModuleId(42);
        let err = manager
            .link_modules(a, bogus, StoreCapacity::Unbounded)
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownModule(id) if id == bogus));
        assert!(manager.store_registry().is_empty());
    }

    #[test]
    fn unwired_module_aborts_run_before_start() {
        let mut manager: Manager<u8> = Manager::with_workers(Workers::fixed(2));
        manager.add(Nop::new());
        let err = manager.run().unwrap_err();
        assert!(
            matches!(err, PipelineError::UnwiredModules { ref names } if names == &["nop".to_string()])
        );
    }

    #[test]
    fn cyclic_wiring_is_rejected() {
        let mut manager: Manager<u8> = Manager::with_workers(Workers::fixed(2));
        let a = manager.add(Nop::new());
        let b = manager.add(Nop::new());
        manager.link_modules(a, b, StoreCapacity::Unbounded).unwrap();
        manager.link_modules(b, a, StoreCapacity::Unbounded).unwrap();
        let err = manager.run().unwrap_err();
        assert!(matches!(err, PipelineError::CyclicGraph { .. }));
    }

    #[test]
    fn reset_clears_both_registries() {
        let mut manager: Manager<u8> = Manager::with_workers(Workers::fixed(2));
        let a = manager.add(Nop::new());
        let b = manager.add(Nop::new());
        manager.link_modules(a, b, StoreCapacity::Bounded(4)).unwrap();
        manager.reset();
        assert!(manager.store_registry().is_empty());
        assert_eq!(manager.module_state(a), None);
        assert_eq!(manager.progress(), 0);
    }

    #[test]
    fn source_capacity_heuristic() {
        // Bounded by the per-worker burst budget.
        assert_eq!(source_capacity(2, 1_000_000), 128);
        // Bounded by half the expected element count.
        assert_eq!(source_capacity(8, 100), 50);
        // Never zero.
        assert_eq!(source_capacity(1, 0), 1);
    }

    #[test]
    fn empty_manager_runs_to_empty_report() {
        let mut manager: Manager<u8> = Manager::with_workers(Workers::fixed(1));
        let report = manager.run().unwrap();
        assert!(report.statuses.is_empty());
        assert!(report.all_completed());
    }

    proptest! {
        #[test]
        fn progress_stays_within_bounds(samples in proptest::collection::vec(0usize..10_000, 1..100)) {
            let mut historical = 1usize;
            for current in samples {
                historical = historical.max(current);
                let p = progress_percent(current, historical);
                prop_assert!(p <= 100);
            }
        }
    }
}
