//! Newline-delimited JSON read/write adapter, the diagnostic/HMI face of a
//! device. One request per line, one response per line; malformed requests
//! and memory errors are reported to the offending client and never disturb
//! the memory map or other adapters.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ProtocolAdapter;
use crate::memory::{Address, MemoryMap, Namespace, Value, Writer};
use crate::simproto;

const MAX_REQUEST_SIZE: usize = 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    Read {
        namespace: Namespace,
        index: u16,
    },
    Write {
        namespace: Namespace,
        index: u16,
        value: Value,
    },
}

#[derive(Debug, Serialize)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn value(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    fn ok() -> Self {
        Self {
            ok: true,
            value: None,
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(message.into()),
        }
    }
}

pub struct ScadaAdapter {
    serves: Vec<Address>,
}

impl ScadaAdapter {
    pub fn new(serves: Vec<Address>) -> Self {
        Self { serves }
    }
}

impl ProtocolAdapter for ScadaAdapter {
    fn name(&self) -> &'static str {
        "scada"
    }

    fn serves(&self) -> &[Address] {
        &self.serves
    }

    fn start(
        self: Box<Self>,
        listener: TcpListener,
        memory: Arc<MemoryMap>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(accept_loop(Arc::new(*self), listener, memory, shutdown))
    }
}

async fn accept_loop(
    adapter: Arc<ScadaAdapter>,
    listener: TcpListener,
    memory: Arc<MemoryMap>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "scada client connected");
                    let adapter = Arc::clone(&adapter);
                    let memory = Arc::clone(&memory);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(adapter, stream, memory, shutdown).await {
                            debug!(%addr, error = %e, "scada client error");
                        }
                        debug!(%addr, "scada client disconnected");
                    });
                }
                Err(e) => {
                    warn!(error = %e, "scada accept failed");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("scada adapter stopped");
}

async fn handle_client(
    adapter: Arc<ScadaAdapter>,
    stream: TcpStream,
    memory: Arc<MemoryMap>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        // A request exceeding the size cap mid-line is an error here, which
        // drops the client instead of buffering without bound.
        let line = tokio::select! {
            frame = simproto::read_frame(&mut reader, MAX_REQUEST_SIZE, &mut buf) => match frame? {
                Some(_) => String::from_utf8_lossy(&buf).into_owned(),
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&adapter, &memory, &line);
        let mut payload = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"ok":false,"error":"internal serialization failure"}"#.to_string()
        });
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

fn dispatch(adapter: &ScadaAdapter, memory: &MemoryMap, line: &str) -> Response {
    if line.len() > MAX_REQUEST_SIZE {
        return Response::error("request too large");
    }
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return Response::error(format!("invalid request: {}", e)),
    };
    match request {
        Request::Read { namespace, index } => {
            let addr = Address::new(namespace, index);
            if !adapter.serves.contains(&addr) {
                return Response::error(format!("address {} not served", addr));
            }
            match memory.read(addr) {
                Ok(value) => Response::value(value),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::Write {
            namespace,
            index,
            value,
        } => {
            let addr = Address::new(namespace, index);
            if !adapter.serves.contains(&addr) {
                return Response::error(format!("address {} not served", addr));
            }
            match memory.write(addr, value, Writer::Adapter("scada".to_string())) {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(e.to_string()),
            }
        }
    }
}
