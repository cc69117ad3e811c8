//! # gridsim
//!
//! A networked industrial-control device emulator. Each process is one
//! device (RTU, PLC, HMI) that exposes a virtual memory map to protocol
//! adapters and keeps a chain of independently running devices physically
//! consistent by exchanging state snapshots with its topological neighbors.
//!
//! ## Features
//!
//! - **Virtual memory map**: typed, per-address-atomic store backing all
//!   protocol access and the simulation loop
//! - **Physical simulation**: fixed-tick device models selected from a
//!   static registry, deterministic and unit-testable without networking
//! - **simproto**: lossy, snapshot-based, sequence-gated peer state exchange
//!   with reconnect/backoff and graceful degradation under peer loss
//! - **Protocol adapters**: independent TCP listeners translating external
//!   requests into memory-map reads and writes
//! - **Lifecycle supervision**: fail-fast startup, isolated component
//!   faults, coordinated shutdown with a bounded grace period
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gridsim::{DeviceConfig, DeviceHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeviceConfig::from_file("device.json")?;
//!     let handler = DeviceHandler::start(config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     handler.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`memory`] - the virtual memory map shared across components
//! - [`models`] - device-type step functions and the model registry
//! - [`core`] - the per-device simulation loop
//! - [`simproto`] - the inter-device state-exchange protocol
//! - [`peer`] - PeerLink transport (dial, accept, reconnect)
//! - [`adapters`] - protocol adapter contract and built-in adapters
//! - [`handler`] - device lifecycle state machine and supervision
//! - [`config`] - the configuration consumed by the handler

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod memory;
pub mod models;
pub mod peer;
pub mod simproto;

// Re-export the main public types for convenience
pub use config::{DeviceConfig, Parameters};
pub use core::DeviceCore;
pub use error::{ConfigError, MemoryError, StartupError};
pub use handler::{DeviceHandler, HandlerState};
pub use memory::{Address, MemoryMap, Namespace, Value, ValueKind, Writer};
pub use models::DeviceModel;
pub use simproto::{Guid, PeerMessage, PeerTable};
