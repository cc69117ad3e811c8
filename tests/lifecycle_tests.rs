//! Device lifecycle and end-to-end tests: fail-fast startup, adapter service
//! while running, coordinated shutdown, and a full three-device chain
//! converging over real sockets. Every bind uses port 0.

use gridsim::models::powergrid::{LOAD_POWER, TX_VOLTAGE_OUT};
use gridsim::{
    Address, DeviceConfig, DeviceHandler, HandlerState, Namespace, StartupError, Value, Writer,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

fn source_config(guid: u32, downstream: &[u32]) -> DeviceConfig {
    let json = format!(
        r#"{{
            "guid": {guid},
            "device": "source",
            "parameters": {{"voltage": 526315.79}},
            "downstream": {downstream:?},
            "sim_bind": "127.0.0.1:0",
            "tick_ms": 50,
            "grace_ms": 2000
        }}"#
    );
    DeviceConfig::from_json(&json).unwrap()
}

fn transmission_config(guid: u32, upstream: (u32, SocketAddr), downstream: &[u32]) -> DeviceConfig {
    let json = format!(
        r#"{{
            "guid": {guid},
            "device": "transmission",
            "parameters": {{"loads": [0.394737, 0.394737, 0.394737], "state": 7}},
            "upstream": [{{"guid": {}, "addr": "{}"}}],
            "downstream": {downstream:?},
            "sim_bind": "127.0.0.1:0",
            "adapters": [{{"kind": "scada", "bind": "127.0.0.1:0"}}],
            "tick_ms": 50,
            "grace_ms": 2000
        }}"#,
        upstream.0, upstream.1
    );
    DeviceConfig::from_json(&json).unwrap()
}

fn load_config(guid: u32, upstream: (u32, SocketAddr)) -> DeviceConfig {
    let json = format!(
        r#"{{
            "guid": {guid},
            "device": "load",
            "parameters": {{"load": 12.5}},
            "upstream": [{{"guid": {}, "addr": "{}"}}],
            "sim_bind": "127.0.0.1:0",
            "tick_ms": 50,
            "grace_ms": 2000
        }}"#,
        upstream.0, upstream.1
    );
    DeviceConfig::from_json(&json).unwrap()
}

/// Polls a float point in the handler's memory until it satisfies the
/// predicate or the deadline passes.
async fn wait_for_point<F>(handler: &DeviceHandler, addr: Address, check: F)
where
    F: Fn(f64) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(Value::Float(v)) = handler.memory().read(addr) {
                if check(v) {
                    return;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "{} never satisfied the predicate (last = {:?})",
            addr,
            handler.memory().read(addr)
        )
    });
}

#[tokio::test]
async fn device_runs_and_stops_within_grace() {
    let handler = DeviceHandler::start(source_config(1, &[])).await.unwrap();
    let state = handler.state();
    assert_eq!(*state.borrow(), HandlerState::Running);

    // The simulation is actually ticking.
    let voltage = Address::new(Namespace::Measurement, 0);
    wait_for_point(&handler, voltage, |v| v == 526315.79).await;

    let started = std::time::Instant::now();
    handler.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(*state.borrow(), HandlerState::Stopped);
}

#[tokio::test]
async fn shutdown_releases_the_listener_ports() {
    let handler = DeviceHandler::start(source_config(1, &[])).await.unwrap();
    let sim_addr = handler.sim_addr();
    handler.shutdown().await;

    // The port is free again for the next incarnation.
    let rebound = TcpListener::bind(sim_addr).await;
    assert!(rebound.is_ok(), "simproto port still held: {:?}", rebound.err());
}

#[tokio::test]
async fn bind_conflict_fails_fast() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let json = format!(
        r#"{{
            "guid": 1,
            "device": "source",
            "parameters": {{"voltage": 1000.0}},
            "sim_bind": "{addr}"
        }}"#
    );
    let config = DeviceConfig::from_json(&json).unwrap();
    let result = DeviceHandler::start(config).await;
    assert!(matches!(result, Err(StartupError::Bind { role: "simproto", .. })));
}

#[tokio::test]
async fn zero_tick_interval_aborts_startup() {
    // Deserialized directly so the handler's own validation is what rejects
    // it; a zero interval must never reach the simulation loop.
    let json = r#"{
        "guid": 1,
        "device": "source",
        "parameters": {"voltage": 1000.0},
        "sim_bind": "127.0.0.1:0",
        "tick_ms": 0
    }"#;
    let config: DeviceConfig = serde_json::from_str(json).unwrap();
    assert!(matches!(
        DeviceHandler::start(config).await,
        Err(StartupError::Config(_))
    ));
}

#[tokio::test]
async fn invalid_model_parameters_abort_startup() {
    let json = r#"{
        "guid": 1,
        "device": "source",
        "parameters": {},
        "sim_bind": "127.0.0.1:0"
    }"#;
    let config: DeviceConfig = serde_json::from_str(json).unwrap();
    assert!(matches!(
        DeviceHandler::start(config).await,
        Err(StartupError::Config(_))
    ));
}

async fn scada_request(addr: SocketAddr, request: serde_json::Value) -> serde_json::Value {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();
    let mut lines = BufReader::new(reader).lines();
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn scada_adapter_reads_and_writes_over_tcp() {
    // A transmission with no live neighbors still serves its memory map.
    let sim_placeholder: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let handler = DeviceHandler::start(transmission_config(2, (1, sim_placeholder), &[3]))
        .await
        .unwrap();
    let (name, scada_addr) = handler.adapter_addrs()[0];
    assert_eq!(name, "scada");

    // Breaker 0 starts closed.
    let response = scada_request(
        scada_addr,
        serde_json::json!({"op": "read", "namespace": "Coil", "index": 0}),
    )
    .await;
    assert_eq!(response["ok"], true);
    assert_eq!(response["value"], serde_json::json!({"Bool": true}));

    // Trip it and read it back.
    let response = scada_request(
        scada_addr,
        serde_json::json!({"op": "write", "namespace": "Coil", "index": 0, "value": {"Bool": false}}),
    )
    .await;
    assert_eq!(response["ok"], true);

    let coil = Address::new(Namespace::Coil, 0);
    assert_eq!(handler.memory().read(coil).unwrap(), Value::Bool(false));
    assert_eq!(
        handler.memory().last_writer(coil),
        Some(Writer::Adapter("scada".into()))
    );

    // Type violations are rejected without disturbing the stored value.
    let response = scada_request(
        scada_addr,
        serde_json::json!({"op": "write", "namespace": "Coil", "index": 0, "value": {"Float": 1.5}}),
    )
    .await;
    assert_eq!(response["ok"], false);
    assert_eq!(handler.memory().read(coil).unwrap(), Value::Bool(false));

    handler.shutdown().await;
}

#[tokio::test]
async fn scada_drops_clients_streaming_unterminated_garbage() {
    let sim_placeholder: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let handler = DeviceHandler::start(transmission_config(2, (1, sim_placeholder), &[3]))
        .await
        .unwrap();
    let (_, scada_addr) = handler.adapter_addrs()[0];

    // Well past the request cap with no newline: the client is disconnected
    // instead of the adapter buffering indefinitely.
    let stream = TcpStream::connect(scada_addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let flood = vec![b'z'; 64 * 1024];
    let _ = writer.write_all(&flood).await;
    let mut lines = BufReader::new(reader).lines();
    let eof = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("client was not disconnected");
    assert!(matches!(eof, Ok(None) | Err(_)));

    // The adapter keeps serving well-behaved clients.
    let response = scada_request(
        scada_addr,
        serde_json::json!({"op": "read", "namespace": "Coil", "index": 0}),
    )
    .await;
    assert_eq!(response["ok"], true);

    handler.shutdown().await;
}

#[tokio::test]
async fn three_device_chain_converges_over_sockets() {
    let source = DeviceHandler::start(source_config(1, &[2])).await.unwrap();
    let tx = DeviceHandler::start(transmission_config(2, (1, source.sim_addr()), &[3]))
        .await
        .unwrap();
    let load = DeviceHandler::start(load_config(3, (2, tx.sim_addr())))
        .await
        .unwrap();

    // Steady state: vout ~ 520833.33, load power ~ 2.170139e10.
    wait_for_point(&tx, TX_VOLTAGE_OUT, |v| {
        (v - 520833.33).abs() < 520833.33 * 1e-4
    })
    .await;
    wait_for_point(&load, LOAD_POWER, |v| {
        (v - 2.170139e10).abs() < 2.170139e10 * 1e-4
    })
    .await;

    // Trip every breaker through the SCADA adapter: the chain de-energizes.
    let (_, scada_addr) = tx.adapter_addrs()[0];
    for index in 0..3 {
        let response = scada_request(
            scada_addr,
            serde_json::json!({"op": "write", "namespace": "Coil", "index": index, "value": {"Bool": false}}),
        )
        .await;
        assert_eq!(response["ok"], true);
    }
    wait_for_point(&tx, TX_VOLTAGE_OUT, |v| v == 0.0).await;
    wait_for_point(&load, LOAD_POWER, |v| v == 0.0).await;

    load.shutdown().await;
    tx.shutdown().await;
    source.shutdown().await;
}

#[tokio::test]
async fn upstream_loss_leaves_last_values_in_place() {
    let source = DeviceHandler::start(source_config(1, &[2])).await.unwrap();
    let tx = DeviceHandler::start(transmission_config(2, (1, source.sim_addr()), &[3]))
        .await
        .unwrap();
    let load = DeviceHandler::start(load_config(3, (2, tx.sim_addr())))
        .await
        .unwrap();

    wait_for_point(&load, LOAD_POWER, |v| v > 1e10).await;
    let before = match load.memory().read(LOAD_POWER).unwrap() {
        Value::Float(v) => v,
        other => panic!("unexpected {:?}", other),
    };

    // Kill the source; its dependents keep ticking on last-known state.
    source.shutdown().await;
    sleep(Duration::from_millis(500)).await;
    let after = match load.memory().read(LOAD_POWER).unwrap() {
        Value::Float(v) => v,
        other => panic!("unexpected {:?}", other),
    };
    assert!((after - before).abs() <= before * 1e-6);

    load.shutdown().await;
    tx.shutdown().await;
}
