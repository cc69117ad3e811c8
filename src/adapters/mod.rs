//! Protocol adapters: independent listeners that translate an external
//! protocol's requests into virtual-memory reads and writes. The trait below
//! is the entire contract a new protocol implementation must satisfy; byte
//! level framing of real ICS protocols lives behind it and is out of scope
//! here.

pub mod scada;
pub mod status;

pub use scada::ScadaAdapter;
pub use status::StatusAdapter;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AdapterConfig, AdapterKind};
use crate::memory::{Address, MemoryMap};
use crate::simproto::Guid;

pub trait ProtocolAdapter: Send + 'static {
    fn name(&self) -> &'static str;

    /// The fixed set of addresses this adapter serves, declared at
    /// construction. Requests outside the set are rejected per-protocol.
    fn serves(&self) -> &[Address];

    /// Take ownership of the bound listener and run until shutdown. Adapters
    /// touch the device only through the memory map's read/write contract.
    fn start(
        self: Box<Self>,
        listener: TcpListener,
        memory: Arc<MemoryMap>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>;
}

/// Construct a configured adapter serving the device's full address layout.
pub fn build_adapter(
    config: &AdapterConfig,
    guid: Guid,
    model_kind: &str,
    memory: &MemoryMap,
) -> Box<dyn ProtocolAdapter> {
    let serves: Vec<Address> = memory.addresses().collect();
    match config.kind {
        AdapterKind::Scada => Box::new(ScadaAdapter::new(serves)),
        AdapterKind::Status => Box::new(StatusAdapter::new(guid, model_kind, serves)),
    }
}
