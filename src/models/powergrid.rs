//! Simple power-grid device models: a generation source, a transmission
//! substation with breaker-switched loads, and a consumer load. Together they
//! form the canonical source → transmission → load chain.

use crate::config::Parameters;
use crate::error::ConfigError;
use crate::memory::{Address, Namespace, Value};
use crate::models::{DeviceModel, StepContext, StepOutput};

/// Field names on the simproto wire.
pub const FIELD_VOLTAGE: &str = "voltage";
pub const FIELD_LOAD: &str = "load";

/// Source: generator output voltage.
pub const SOURCE_VOLTAGE: Address = Address::new(Namespace::Measurement, 0);

/// Transmission: line measurements and breaker coils.
pub const TX_VOLTAGE_IN: Address = Address::new(Namespace::Measurement, 0);
pub const TX_VOLTAGE_OUT: Address = Address::new(Namespace::Measurement, 1);
pub const TX_CURRENT: Address = Address::new(Namespace::Measurement, 2);
pub const TX_BREAKER_BASE: u16 = 0;

/// Load: consumption measurements.
pub const LOAD_VOLTAGE: Address = Address::new(Namespace::Measurement, 0);
pub const LOAD_CURRENT: Address = Address::new(Namespace::Measurement, 1);
pub const LOAD_POWER: Address = Address::new(Namespace::Measurement, 2);

const MAX_BREAKERS: usize = 16;

/// A generation source. With no upstream neighbors, its export derives purely
/// from its parameters and elapsed time.
#[derive(Debug)]
pub struct Source {
    voltage: f64,
    /// Relative ripple amplitude; zero (the default) gives an exact output.
    fluctuation: f64,
}

impl Source {
    pub fn from_params(params: &Parameters) -> Result<Box<dyn DeviceModel>, ConfigError> {
        let voltage = params.float("voltage")?;
        let fluctuation = params.float_or("fluctuation", 0.0)?;
        if !(0.0..=1.0).contains(&fluctuation) {
            return Err(ConfigError::InvalidParameter {
                name: "fluctuation",
                reason: "must be within [0, 1]".into(),
            });
        }
        Ok(Box::new(Self {
            voltage,
            fluctuation,
        }))
    }
}

impl DeviceModel for Source {
    fn kind(&self) -> &'static str {
        "source"
    }

    fn memory_layout(&self) -> Vec<(Address, Value)> {
        vec![(SOURCE_VOLTAGE, Value::Float(self.voltage))]
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> StepOutput {
        let ripple = self.fluctuation * (ctx.tick as f64 * 0.1).sin();
        let volts = self.voltage * (1.0 + ripple);

        let mut out = StepOutput::default();
        out.points.push((SOURCE_VOLTAGE, Value::Float(volts)));
        out.export_downstream
            .insert(FIELD_VOLTAGE.into(), Value::Float(volts));
        out
    }
}

/// A transmission substation: a bank of breaker-switched loads between its
/// upstream feed and its downstream consumers. Bit `i` of `state` set means
/// breaker `i` is closed and `loads[i]` is connected.
#[derive(Debug)]
pub struct Transmission {
    loads: Vec<f64>,
    state: u16,
    vin: f64,
    vout: f64,
    amp: f64,
}

impl Transmission {
    pub fn from_params(params: &Parameters) -> Result<Box<dyn DeviceModel>, ConfigError> {
        let loads = params.float_list("loads")?;
        if loads.is_empty() || loads.len() > MAX_BREAKERS {
            return Err(ConfigError::InvalidParameter {
                name: "loads",
                reason: format!("expected 1..={} load values", MAX_BREAKERS),
            });
        }
        if loads.iter().any(|r| *r < 0.0 || !r.is_finite()) {
            return Err(ConfigError::InvalidParameter {
                name: "loads",
                reason: "load resistances must be finite and non-negative".into(),
            });
        }
        let state = params.int("state")?;
        let max_state = (1i64 << loads.len()) - 1;
        if !(0..=max_state).contains(&state) {
            return Err(ConfigError::InvalidParameter {
                name: "state",
                reason: format!("breaker state must be within 0..={}", max_state),
            });
        }
        Ok(Box::new(Self {
            loads,
            state: state as u16,
            vin: 0.0,
            vout: 0.0,
            amp: 0.0,
        }))
    }

    fn breaker(index: usize) -> Address {
        Address::new(Namespace::Coil, TX_BREAKER_BASE + index as u16)
    }

    /// Equivalent resistance of the connected loads. All breakers open means
    /// an open circuit; a connected zero-ohm load is a short.
    fn equivalent_load(&self) -> f64 {
        if self.state == 0 {
            return f64::INFINITY;
        }
        let mut r_eq: Option<f64> = None;
        for (i, r) in self.loads.iter().enumerate() {
            if self.state & (1 << i) == 0 {
                continue;
            }
            if *r == 0.0 {
                return 0.0;
            }
            r_eq = Some(match r_eq {
                None => *r,
                Some(acc) => acc * r / (acc + r),
            });
        }
        r_eq.unwrap_or(f64::INFINITY)
    }
}

impl DeviceModel for Transmission {
    fn kind(&self) -> &'static str {
        "transmission"
    }

    fn memory_layout(&self) -> Vec<(Address, Value)> {
        let mut layout = vec![
            (TX_VOLTAGE_IN, Value::Float(0.0)),
            (TX_VOLTAGE_OUT, Value::Float(0.0)),
            (TX_CURRENT, Value::Float(0.0)),
        ];
        for i in 0..self.loads.len() {
            let closed = self.state & (1 << i) != 0;
            layout.push((Self::breaker(i), Value::Bool(closed)));
        }
        layout
    }

    fn control_points(&self) -> Vec<Address> {
        (0..self.loads.len()).map(Self::breaker).collect()
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> StepOutput {
        // Adapter writes to the breaker coils land here on the next tick.
        for (addr, value) in ctx.controls {
            if addr.namespace != Namespace::Coil {
                continue;
            }
            let bit = addr.index - TX_BREAKER_BASE;
            if usize::from(bit) >= self.loads.len() {
                continue;
            }
            if let Some(closed) = value.as_bool() {
                if closed {
                    self.state |= 1 << bit;
                } else {
                    self.state &= !(1 << bit);
                }
            }
        }

        let r_eq = self.equivalent_load();
        let vin = ctx.upstream.field(FIELD_VOLTAGE).and_then(|(v, _)| v.as_float());
        let r_load = ctx.downstream.field(FIELD_LOAD).and_then(|(v, _)| v.as_float());

        if r_eq.is_infinite() {
            // Breakers open: nothing flows downstream.
            self.vout = 0.0;
            self.amp = 0.0;
        } else if let (Some(vin), Some(r_load)) = (vin, r_load) {
            self.vin = vin;
            if r_load.is_infinite() {
                // Open circuit further down the grid.
                self.vout = vin;
            } else {
                self.vout = vin * r_load / (r_load + r_eq);
            }
            if r_eq == 0.0 {
                // Short circuit: current runs away; clamp because neither the
                // memory map nor the wire carries non-finite floats.
                self.amp = f64::MAX;
            } else {
                self.amp = (vin - self.vout) / r_eq;
            }
        }
        // Missing upstream or downstream data: hold the previous values.

        let mut out = StepOutput::default();
        out.points.push((TX_VOLTAGE_IN, Value::Float(self.vin)));
        out.points.push((TX_VOLTAGE_OUT, Value::Float(self.vout)));
        out.points.push((TX_CURRENT, Value::Float(self.amp)));
        out.export_downstream
            .insert(FIELD_VOLTAGE.into(), Value::Float(self.vout));
        // Report the total load seen from upstream once the downstream side
        // has reported its own; non-finite loads are omitted rather than sent.
        if let Some(r_load) = r_load {
            let total = r_eq + r_load;
            if total.is_finite() {
                out.export_upstream
                    .insert(FIELD_LOAD.into(), Value::Float(total));
            }
        }
        out
    }
}

/// A consumer load: computes drawn current and consumed power from the
/// upstream voltage and reports its resistance back upstream. A sink; it
/// exports nothing downstream.
#[derive(Debug)]
pub struct Load {
    load: f64,
    vin: f64,
}

impl Load {
    pub fn from_params(params: &Parameters) -> Result<Box<dyn DeviceModel>, ConfigError> {
        let load = params.float("load")?;
        if !load.is_finite() || load <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: "load",
                reason: "load resistance must be positive".into(),
            });
        }
        Ok(Box::new(Self { load, vin: 0.0 }))
    }
}

impl DeviceModel for Load {
    fn kind(&self) -> &'static str {
        "load"
    }

    fn memory_layout(&self) -> Vec<(Address, Value)> {
        vec![
            (LOAD_VOLTAGE, Value::Float(0.0)),
            (LOAD_CURRENT, Value::Float(0.0)),
            (LOAD_POWER, Value::Float(0.0)),
        ]
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> StepOutput {
        if let Some(vin) = ctx.upstream.field(FIELD_VOLTAGE).and_then(|(v, _)| v.as_float()) {
            self.vin = vin;
        }
        let amp = self.vin / self.load;
        let power = self.vin * amp;

        let mut out = StepOutput::default();
        out.points.push((LOAD_VOLTAGE, Value::Float(self.vin)));
        out.points.push((LOAD_CURRENT, Value::Float(amp)));
        out.points.push((LOAD_POWER, Value::Float(power)));
        out.export_upstream
            .insert(FIELD_LOAD.into(), Value::Float(self.load));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simproto::{FieldMap, Guid, PeerMessage, PeerTable, SnapshotSet};
    use std::time::Duration;

    fn params(json: &str) -> Parameters {
        serde_json::from_str(json).unwrap()
    }

    fn snapshot_with(guid: Guid, field: &str, value: f64) -> SnapshotSet {
        let table = PeerTable::new([guid], Duration::from_secs(60));
        let mut fields = FieldMap::new();
        fields.insert(field.into(), Value::Float(value));
        table.ingest(&PeerMessage::new(guid, 1, fields));
        table.snapshot()
    }

    fn ctx<'a>(
        upstream: &'a SnapshotSet,
        downstream: &'a SnapshotSet,
        controls: &'a [(Address, Value)],
    ) -> StepContext<'a> {
        StepContext {
            tick: 0,
            upstream,
            downstream,
            controls,
        }
    }

    #[test]
    fn source_exports_configured_voltage() {
        let mut source =
            Source::from_params(&params(r#"{"voltage": 526315.79}"#)).unwrap();
        let empty = SnapshotSet::default();
        let out = source.step(&ctx(&empty, &empty, &[]));
        assert_eq!(
            out.export_downstream.get(FIELD_VOLTAGE),
            Some(&Value::Float(526315.79))
        );
        assert!(out.export_upstream.is_empty());
    }

    #[test]
    fn transmission_divides_voltage_across_reported_load() {
        let mut tx = Transmission::from_params(&params(
            r#"{"loads": [0.394737, 0.394737, 0.394737], "state": 7}"#,
        ))
        .unwrap();
        let upstream = snapshot_with(Guid(1), FIELD_VOLTAGE, 526315.79);
        let downstream = snapshot_with(Guid(3), FIELD_LOAD, 12.5);
        let out = tx.step(&ctx(&upstream, &downstream, &[]));

        let r_eq = 0.394737 / 3.0;
        let expected_vout = 526315.79 * 12.5 / (12.5 + r_eq);
        let vout = out.export_downstream[FIELD_VOLTAGE].as_float().unwrap();
        assert!((vout - expected_vout).abs() < 1e-6);

        let total = out.export_upstream[FIELD_LOAD].as_float().unwrap();
        assert!((total - (12.5 + r_eq)).abs() < 1e-9);
    }

    #[test]
    fn transmission_with_open_breakers_exports_zero() {
        let mut tx = Transmission::from_params(&params(
            r#"{"loads": [0.394737, 0.394737], "state": 0}"#,
        ))
        .unwrap();
        let upstream = snapshot_with(Guid(1), FIELD_VOLTAGE, 1000.0);
        let downstream = snapshot_with(Guid(3), FIELD_LOAD, 12.5);
        let out = tx.step(&ctx(&upstream, &downstream, &[]));
        assert_eq!(
            out.export_downstream.get(FIELD_VOLTAGE),
            Some(&Value::Float(0.0))
        );
        // Open circuit is not representable on the wire; the field is omitted.
        assert!(out.export_upstream.get(FIELD_LOAD).is_none());
    }

    #[test]
    fn transmission_holds_last_values_without_peer_data() {
        let mut tx = Transmission::from_params(&params(
            r#"{"loads": [0.5], "state": 1}"#,
        ))
        .unwrap();
        let upstream = snapshot_with(Guid(1), FIELD_VOLTAGE, 1000.0);
        let downstream = snapshot_with(Guid(3), FIELD_LOAD, 10.0);
        let first = tx.step(&ctx(&upstream, &downstream, &[]));
        let vout = first.export_downstream[FIELD_VOLTAGE].as_float().unwrap();

        // No fresh data at all: the previous output is retained.
        let empty = SnapshotSet::default();
        let second = tx.step(&ctx(&empty, &empty, &[]));
        assert_eq!(
            second.export_downstream[FIELD_VOLTAGE].as_float().unwrap(),
            vout
        );
    }

    #[test]
    fn breaker_coil_writes_rewire_the_state() {
        let mut tx = Transmission::from_params(&params(
            r#"{"loads": [0.394737, 0.394737, 0.394737], "state": 7}"#,
        ))
        .unwrap();
        let upstream = snapshot_with(Guid(1), FIELD_VOLTAGE, 1000.0);
        let downstream = snapshot_with(Guid(3), FIELD_LOAD, 12.5);

        // Open every breaker through the coil control points.
        let controls: Vec<(Address, Value)> = (0..3)
            .map(|i| {
                (
                    Address::new(Namespace::Coil, TX_BREAKER_BASE + i),
                    Value::Bool(false),
                )
            })
            .collect();
        let out = tx.step(&ctx(&upstream, &downstream, &controls));
        assert_eq!(
            out.export_downstream.get(FIELD_VOLTAGE),
            Some(&Value::Float(0.0))
        );
    }

    #[test]
    fn load_computes_consumed_power() {
        let mut load = Load::from_params(&params(r#"{"load": 12.5}"#)).unwrap();
        let upstream = snapshot_with(Guid(2), FIELD_VOLTAGE, 520833.33);
        let empty = SnapshotSet::default();
        let out = load.step(&ctx(&upstream, &empty, &[]));

        let amp = 520833.33 / 12.5;
        let power = 520833.33 * amp;
        assert_eq!(out.points[1].1, Value::Float(amp));
        assert_eq!(out.points[2].1, Value::Float(power));
        assert_eq!(
            out.export_upstream.get(FIELD_LOAD),
            Some(&Value::Float(12.5))
        );
        assert!(out.export_downstream.is_empty());
    }

    #[test]
    fn parameter_validation_rejects_bad_configs() {
        assert!(Transmission::from_params(&params(r#"{"loads": [], "state": 0}"#)).is_err());
        assert!(Transmission::from_params(&params(
            r#"{"loads": [0.5], "state": 2}"#
        ))
        .is_err());
        assert!(Load::from_params(&params(r#"{"load": -1.0}"#)).is_err());
        assert!(Source::from_params(&params(r#"{"voltage": 1.0, "fluctuation": 2.0}"#)).is_err());
    }
}
