pub mod powergrid;

pub use powergrid::{Load, Source, Transmission};

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::config::Parameters;
use crate::error::ConfigError;
use crate::memory::{Address, Value};
use crate::simproto::{FieldMap, SnapshotSet};

/// Inputs for one simulation step. Everything the step depends on is in here;
/// given equal context and model state the result is identical, which keeps
/// models unit-testable without any networking.
pub struct StepContext<'a> {
    /// Ticks elapsed since the simulation loop started.
    pub tick: u64,
    /// Latest-known state of upstream neighbors (may be stale, never blocks).
    pub upstream: &'a SnapshotSet,
    /// Latest-known feedback from downstream neighbors.
    pub downstream: &'a SnapshotSet,
    /// Current values of the model's adapter-writable control points.
    pub controls: &'a [(Address, Value)],
}

/// What one step produced: memory writes plus the exported field maps handed
/// to the peer links for transmission.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub points: Vec<(Address, Value)>,
    pub export_downstream: FieldMap,
    pub export_upstream: FieldMap,
}

/// One device type's physical model.
///
/// Implementations declare their memory layout and control points at
/// construction and advance their state once per tick via [`step`]. A source
/// ignores `ctx.upstream`; a sink leaves `export_downstream` empty.
///
/// [`step`]: DeviceModel::step
pub trait DeviceModel: Send {
    fn kind(&self) -> &'static str;

    /// Full address layout (address, initial value); fixes each address's
    /// declared type for the device's lifetime.
    fn memory_layout(&self) -> Vec<(Address, Value)>;

    /// Addresses adapters may write to influence the model (e.g. breaker
    /// coils). Their current values are fed back through `ctx.controls`.
    fn control_points(&self) -> Vec<Address> {
        Vec::new()
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> StepOutput;
}

pub type ModelFactory = fn(&Parameters) -> Result<Box<dyn DeviceModel>, ConfigError>;

static REGISTRY: OnceLock<HashMap<&'static str, ModelFactory>> = OnceLock::new();

/// Static registry mapping a device-type tag to its factory. Populated once
/// at first use; selecting a model is a table lookup, not reflection.
fn registry() -> &'static HashMap<&'static str, ModelFactory> {
    REGISTRY.get_or_init(|| {
        let mut models: HashMap<&'static str, ModelFactory> = HashMap::new();
        models.insert("source", Source::from_params);
        models.insert("transmission", Transmission::from_params);
        models.insert("load", Load::from_params);
        models
    })
}

pub fn build_model(kind: &str, params: &Parameters) -> Result<Box<dyn DeviceModel>, ConfigError> {
    let factory = registry()
        .get(kind)
        .ok_or_else(|| ConfigError::UnknownModel(kind.to_string()))?;
    factory(params)
}

pub fn known_models() -> Vec<&'static str> {
    let mut kinds: Vec<&'static str> = registry().keys().copied().collect();
    kinds.sort_unstable();
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_models() {
        assert_eq!(known_models(), vec!["load", "source", "transmission"]);
        let params: Parameters = serde_json::from_str(r#"{"voltage": 526315.79}"#).unwrap();
        let model = build_model("source", &params).unwrap();
        assert_eq!(model.kind(), "source");
    }

    #[test]
    fn unknown_model_is_rejected() {
        let params = Parameters::default();
        assert!(matches!(
            build_model("reactor", &params),
            Err(ConfigError::UnknownModel(_))
        ));
    }

    #[test]
    fn factory_surfaces_parameter_errors() {
        let params = Parameters::default();
        assert!(matches!(
            build_model("source", &params),
            Err(ConfigError::MissingParameter("voltage"))
        ));
    }
}
