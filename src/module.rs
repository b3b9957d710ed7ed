//! The module contract and its canonical run loop.
//!
//! A module is a unit of computation with named input/output ports. Modules
//! with no inputs are sources, modules with both kinds of port are
//! transforms, modules with no outputs are sinks. The engine drives every
//! module through the same loop in [`run_module`], which also owns terminal
//! element propagation: implementations only provide the `produce` /
//! `process` steps and the lifecycle hooks.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::element::Element;
use crate::error::{ModuleError, ModuleResult};
use crate::manager::Workers;
use crate::store::StoreRef;

/// Small integer identifying one port of a module.
pub type PortId = u16;

/// How long an idle poll loop waits for input before re-checking
/// cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Module lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ModuleState {
    /// Registered, no ports wired yet.
    Created,
    /// At least one port wired.
    Wired,
    /// Passed the pre-run wiring check.
    Checked,
    /// Run loop active.
    Running,
    /// Run loop finished after observing or emitting the terminal element.
    Completed,
    /// Run loop observed a cancellation request at an iteration boundary.
    Cancelled,
    /// Run loop ended on an unrecoverable error; the reason is kept for the
    /// run report.
    Failed(String),
}

/// Cooperative cancellation handle, observed by run loops at iteration
/// boundaries only, never mid-step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cooperative stop of every loop holding this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The port table of a module: small integer port id to store, for each
/// direction. Mutable during the wiring phase, read-only once the module
/// runs.
pub struct Ports<E> {
    inputs: BTreeMap<PortId, StoreRef<E>>,
    outputs: BTreeMap<PortId, StoreRef<E>>,
}

impl<E> Default for Ports<E> {
    fn default() -> Self {
        Self {
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl<E> Ports<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, port: PortId, store: StoreRef<E>) {
        self.inputs.insert(port, store);
    }

    pub fn set_output(&mut self, port: PortId, store: StoreRef<E>) {
        self.outputs.insert(port, store);
    }

    pub fn set_inputs(&mut self, stores: BTreeMap<PortId, StoreRef<E>>) {
        self.inputs = stores;
    }

    pub fn set_outputs(&mut self, stores: BTreeMap<PortId, StoreRef<E>>) {
        self.outputs = stores;
    }

    /// Wire a store to the next free input port. Convenience for modules
    /// with a single input.
    pub fn add_input(&mut self, store: StoreRef<E>) -> PortId {
        let port = self.inputs.keys().next_back().map_or(0, |p| p + 1);
        self.inputs.insert(port, store);
        port
    }

    /// Wire a store to the next free output port. Convenience for modules
    /// with a single output.
    pub fn add_output(&mut self, store: StoreRef<E>) -> PortId {
        let port = self.outputs.keys().next_back().map_or(0, |p| p + 1);
        self.outputs.insert(port, store);
        port
    }

    pub fn input(&self, port: PortId) -> Option<&StoreRef<E>> {
        self.inputs.get(&port)
    }

    pub fn output(&self, port: PortId) -> Option<&StoreRef<E>> {
        self.outputs.get(&port)
    }

    pub fn inputs(&self) -> impl Iterator<Item = (PortId, &StoreRef<E>)> {
        self.inputs.iter().map(|(p, s)| (*p, s))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (PortId, &StoreRef<E>)> {
        self.outputs.iter().map(|(p, s)| (*p, s))
    }

    pub fn has_inputs(&self) -> bool {
        !self.inputs.is_empty()
    }

    pub fn has_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }
}

/// Core trait every pipeline module implements.
pub trait Module<E: Clone + Send + 'static>: Send {
    /// Name used in logs and the run report.
    fn name(&self) -> &str;

    fn ports(&self) -> &Ports<E>;

    fn ports_mut(&mut self) -> &mut Ports<E>;

    /// Whether this module's required ports are wired. Scheduling a module
    /// that fails this check aborts the run before any module starts.
    fn check(&self) -> bool {
        self.ports().has_inputs() || self.ports().has_outputs()
    }

    /// Late-bound parallelism handle, injected by the manager before
    /// scheduling, for modules that fan out internal sub-tasks.
    fn set_workers(&mut self, _workers: Workers) {}

    /// Called once before the run loop starts. Open resources here.
    fn setup(&mut self) -> ModuleResult<()> {
        Ok(())
    }

    /// Called once after the run loop ends. Flush and release here.
    fn teardown(&mut self) {}

    /// Source step: produce the next element. `Some(Element::Last(_))`
    /// signals exhaustion; `None` stops producing without a sentinel, which
    /// leaves downstream modules polling forever — only return it when the
    /// pipeline is being torn down by other means.
    fn produce(&mut self) -> ModuleResult<Option<Element<E>>> {
        Ok(None)
    }

    /// Transform/sink step: handle one element from `port`, optionally
    /// emitting one payload. The driver tags and forwards the emission, so
    /// implementations never construct the outgoing terminal element
    /// themselves. Default is identity pass-through.
    fn process(&mut self, _port: PortId, element: Element<E>) -> ModuleResult<Option<E>> {
        Ok(Some(element.into_payload()))
    }
}

/// How a run loop ended, short of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
}

/// Everything a run loop needs besides the module itself: the cancellation
/// token and an optional readiness rendezvous shared with sibling modules.
pub struct RunContext {
    cancel: CancelToken,
    ready: Option<Arc<Barrier>>,
}

impl RunContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            ready: None,
        }
    }

    /// A context whose loop starts only after every participant of
    /// `barrier` has finished its setup.
    pub fn with_readiness(cancel: CancelToken, barrier: Arc<Barrier>) -> Self {
        Self {
            cancel,
            ready: Some(barrier),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn signal_ready(&self) {
        if let Some(barrier) = &self.ready {
            barrier.wait();
        }
    }
}

/// Drive a module through its canonical run loop.
///
/// The loop shape is chosen by which ports are wired: outputs only runs the
/// production loop, anything with inputs runs the poll loop. The driver owns
/// sentinel propagation: after the final terminal input element it emits
/// exactly one terminal element on every output port.
pub fn run_module<E: Clone + Send + 'static>(
    module: &mut dyn Module<E>,
    ctx: &RunContext,
) -> ModuleResult<Outcome> {
    // The readiness signal must fire even when setup fails, otherwise
    // sibling modules would wait on the barrier forever.
    let setup = catch_unwind(AssertUnwindSafe(|| module.setup()));
    ctx.signal_ready();
    match setup {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(ModuleError::processing("panic during setup")),
    }

    let inputs: Vec<(PortId, StoreRef<E>)> = module
        .ports()
        .inputs()
        .map(|(p, s)| (p, Arc::clone(s)))
        .collect();
    let outputs: Vec<StoreRef<E>> = module
        .ports()
        .outputs()
        .map(|(_, s)| Arc::clone(s))
        .collect();

    let result = if inputs.is_empty() {
        source_loop(module, &outputs, ctx)
    } else {
        poll_loop(module, &inputs, &outputs, ctx)
    };
    module.teardown();
    result
}

/// Production loop for modules without inputs.
fn source_loop<E: Clone + Send + 'static>(
    module: &mut dyn Module<E>,
    outputs: &[StoreRef<E>],
    ctx: &RunContext,
) -> ModuleResult<Outcome> {
    loop {
        if ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        match module.produce()? {
            Some(Element::Data(e)) => {
                if !broadcast(outputs, Element::Data(e), ctx) {
                    return Ok(Outcome::Cancelled);
                }
            }
            Some(Element::Last(e)) => {
                if !broadcast(outputs, Element::Last(e), ctx) {
                    return Ok(Outcome::Cancelled);
                }
                return Ok(Outcome::Completed);
            }
            None => {
                warn!(
                    module = module.name(),
                    "source exhausted without a terminal element; downstream will not terminate on its own"
                );
                return Ok(Outcome::Completed);
            }
        }
    }
}

/// Poll loop for transforms and sinks.
fn poll_loop<E: Clone + Send + 'static>(
    module: &mut dyn Module<E>,
    inputs: &[(PortId, StoreRef<E>)],
    outputs: &[StoreRef<E>],
    ctx: &RunContext,
) -> ModuleResult<Outcome> {
    let mut open = vec![true; inputs.len()];
    let mut open_count = inputs.len();
    // Rotating scan start keeps multi-input modules fair under load.
    let mut scan_from = 0;

    loop {
        if ctx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let mut acquired = None;
        for k in 0..inputs.len() {
            let i = (scan_from + k) % inputs.len();
            if open[i] {
                if let Some(el) = inputs[i].1.get() {
                    acquired = Some((i, el));
                    break;
                }
            }
        }
        if acquired.is_none() {
            // All open inputs are idle: wait briefly on one of them instead
            // of spinning. Timeouts fall through to the cancellation check.
            if let Some(i) = (0..inputs.len()).find(|&i| open[i]) {
                acquired = inputs[i].1.recv_timeout(POLL_INTERVAL).map(|el| (i, el));
            }
        }
        let Some((i, el)) = acquired else { continue };
        scan_from = (i + 1) % inputs.len();
        let port = inputs[i].0;

        match el {
            Element::Data(e) => {
                if let Some(out) = module.process(port, Element::Data(e))? {
                    if !broadcast(outputs, Element::Data(out), ctx) {
                        return Ok(Outcome::Cancelled);
                    }
                }
            }
            Element::Last(e) => {
                let out = module.process(port, Element::Last(e.clone()))?;
                open[i] = false;
                open_count -= 1;
                if open_count == 0 {
                    // Final terminal input: propagate our own terminal
                    // element. A step that emitted nothing falls back to the
                    // incoming terminal payload so the sentinel never stalls.
                    if !broadcast(outputs, Element::Last(out.unwrap_or(e)), ctx) {
                        return Ok(Outcome::Cancelled);
                    }
                    return Ok(Outcome::Completed);
                }
                if let Some(out) = out {
                    if !broadcast(outputs, Element::Data(out), ctx) {
                        return Ok(Outcome::Cancelled);
                    }
                }
            }
        }
    }
}

/// Write an element to every output port. Backpressure is a suspension
/// point: a full store is retried on a short timeout so the writer still
/// observes cancellation. Returns `false` when the write was abandoned
/// because of a cancellation request.
fn broadcast<E: Clone>(outputs: &[StoreRef<E>], el: Element<E>, ctx: &RunContext) -> bool {
    let Some((last, rest)) = outputs.split_last() else {
        return true;
    };
    for store in rest {
        if !put_cancellable(store, el.clone(), ctx) {
            return false;
        }
    }
    put_cancellable(last, el, ctx)
}

fn put_cancellable<E>(store: &StoreRef<E>, mut el: Element<E>, ctx: &RunContext) -> bool {
    loop {
        match store.put_timeout(el, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(returned) => {
                if ctx.is_cancelled() {
                    return false;
                }
                el = returned;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::QueueStore;

    struct Doubler {
        ports: Ports<i64>,
    }

    impl Module<i64> for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }
        fn ports(&self) -> &Ports<i64> {
            &self.ports
        }
        fn ports_mut(&mut self) -> &mut Ports<i64> {
            &mut self.ports
        }
        fn process(&mut self, _port: PortId, element: Element<i64>) -> ModuleResult<Option<i64>> {
            Ok(Some(element.into_payload() * 2))
        }
    }

    #[test]
    fn default_check_requires_a_wired_port() {
        let mut m = Doubler {
            ports: Ports::new(),
        };
        assert!(!m.check());
        m.ports_mut().add_input(Arc::new(QueueStore::unbounded()));
        assert!(m.check());
    }

    #[test]
    fn transform_propagates_terminal_element() {
        let input: StoreRef<i64> = Arc::new(QueueStore::unbounded());
        let output: StoreRef<i64> = Arc::new(QueueStore::unbounded());
        let mut m = Doubler {
            ports: Ports::new(),
        };
        m.ports_mut().add_input(Arc::clone(&input));
        m.ports_mut().add_output(Arc::clone(&output));

        input.put(Element::Data(1));
        input.put(Element::Data(2));
        input.put(Element::Last(3));

        let outcome = run_module(&mut m, &RunContext::new(CancelToken::new())).unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(output.get(), Some(Element::Data(2)));
        assert_eq!(output.get(), Some(Element::Data(4)));
        assert_eq!(output.get(), Some(Element::Last(6)));
        assert!(output.get().is_none());
    }

    #[test]
    fn cancelled_before_start_never_processes() {
        let input: StoreRef<i64> = Arc::new(QueueStore::unbounded());
        let mut m = Doubler {
            ports: Ports::new(),
        };
        m.ports_mut().add_input(Arc::clone(&input));
        input.put(Element::Data(1));

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = run_module(&mut m, &RunContext::new(cancel)).unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        // The element is still in the store: cancellation is observed at
        // the iteration boundary.
        assert_eq!(input.size(), 1);
    }

    #[test]
    fn port_ids_allocate_next_free_slot() {
        let mut ports: Ports<i64> = Ports::new();
        assert_eq!(ports.add_input(Arc::new(QueueStore::unbounded())), 0);
        assert_eq!(ports.add_input(Arc::new(QueueStore::unbounded())), 1);
        ports.set_input(7, Arc::new(QueueStore::unbounded()));
        assert_eq!(ports.add_input(Arc::new(QueueStore::unbounded())), 8);
        assert_eq!(ports.inputs().count(), 4);
    }
}
