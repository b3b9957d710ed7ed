//! Streaming dataflow engine.
//!
//! Independent processing modules exchange typed elements through bounded,
//! thread-safe FIFO stores. The manager wires module outputs to downstream
//! inputs, runs every module concurrently, and the whole graph drains
//! through an in-band terminal element rather than a global stop signal:
//! backpressure is the only other coordination between stages.

pub mod element;
pub mod error;
pub mod manager;
pub mod module;
pub mod store;
pub mod table;


pub use element::Element;
pub use error::{ModuleError, ModuleResult, PipelineError, PipelineResult};
pub use manager::{
    Manager, ModuleId, ModuleStatus, RunReport, StoreCapacity, StoreId, Workers,
};
pub use module::{
    run_module, CancelToken, Module, ModuleState, Outcome, PortId, Ports, RunContext,
    POLL_INTERVAL,
};
pub use store::{QueueStore, Store, StoreRef};
pub use table::{ExtendableTable, TableFifo, TableRow};
