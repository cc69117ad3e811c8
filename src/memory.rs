use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Instant;

use crate::error::MemoryError;

/// Point classes a simulated device can expose. Protocol adapters map their
/// own addressing schemes (coil numbers, IOAs, register offsets) onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
    Measurement,
}

/// Protocol-agnostic key for one simulated point. Stable for the device's
/// lifetime; the full address set is fixed when the memory map is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub namespace: Namespace,
    pub index: u16,
}

impl Address {
    pub const fn new(namespace: Namespace, index: u16) -> Self {
        Self { namespace, index }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.namespace, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
}

/// A typed simulation value. The kind is declared per address at device
/// construction and every write must preserve it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float accessor; integers coerce, which keeps adapter-side writes of
    /// round numbers from tripping over JSON's int/float distinction.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:.3}", x),
        }
    }
}

/// Who completed the last write to a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Writer {
    Simulation,
    Peer(crate::simproto::Guid),
    Adapter(String),
}

#[derive(Debug)]
struct Cell {
    value: Value,
    last_modified: Instant,
    last_writer: Writer,
}

/// The virtual memory map: the single point of truth a device exposes to its
/// protocol adapters and its own simulation loop.
///
/// The address set is fixed at construction. Each cell carries its own lock,
/// so operations on distinct addresses proceed concurrently while reads and
/// writes to the same address serialize (last-writer-wins by completion
/// order). No caller holds a cell lock across I/O.
#[derive(Debug)]
pub struct MemoryMap {
    cells: BTreeMap<Address, RwLock<Cell>>,
}

impl MemoryMap {
    /// Build a map from a layout of (address, initial value); the initial
    /// value fixes each address's declared kind.
    pub fn new(layout: impl IntoIterator<Item = (Address, Value)>) -> Self {
        let now = Instant::now();
        let cells = layout
            .into_iter()
            .map(|(addr, value)| {
                let cell = Cell {
                    value,
                    last_modified: now,
                    last_writer: Writer::Simulation,
                };
                (addr, RwLock::new(cell))
            })
            .collect();
        Self { cells }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.cells.contains_key(&addr)
    }

    /// Declared kind of an address, if defined.
    pub fn kind(&self, addr: Address) -> Option<ValueKind> {
        self.cells
            .get(&addr)
            .map(|cell| cell.read().unwrap_or_else(|e| e.into_inner()).value.kind())
    }

    pub fn read(&self, addr: Address) -> Result<Value, MemoryError> {
        let cell = self.cells.get(&addr).ok_or(MemoryError::NotFound(addr))?;
        Ok(cell.read().unwrap_or_else(|e| e.into_inner()).value)
    }

    /// Write a value, enforcing the declared kind. A failed write leaves the
    /// prior value untouched; a successful one updates the modification
    /// timestamp and writer tag.
    pub fn write(&self, addr: Address, value: Value, writer: Writer) -> Result<(), MemoryError> {
        let cell = self.cells.get(&addr).ok_or(MemoryError::NotFound(addr))?;
        let mut guard = cell.write().unwrap_or_else(|e| e.into_inner());
        if guard.value.kind() != value.kind() {
            return Err(MemoryError::TypeMismatch {
                addr,
                expected: guard.value.kind(),
                got: value.kind(),
            });
        }
        guard.value = value;
        guard.last_modified = Instant::now();
        guard.last_writer = writer;
        Ok(())
    }

    pub fn last_modified(&self, addr: Address) -> Option<Instant> {
        self.cells
            .get(&addr)
            .map(|cell| cell.read().unwrap_or_else(|e| e.into_inner()).last_modified)
    }

    pub fn last_writer(&self, addr: Address) -> Option<Writer> {
        self.cells
            .get(&addr)
            .map(|cell| cell.read().unwrap_or_else(|e| e.into_inner()).last_writer.clone())
    }

    /// All defined addresses, in stable order.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.cells.keys().copied()
    }

    /// Current (address, value) snapshot, in stable order.
    pub fn snapshot(&self) -> Vec<(Address, Value)> {
        self.cells
            .iter()
            .map(|(addr, cell)| (*addr, cell.read().unwrap_or_else(|e| e.into_inner()).value))
            .collect()
    }
}
