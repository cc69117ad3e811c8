//! Plain-text status adapter: each connection receives one rendered snapshot
//! of the device's memory map and is closed. The read-only counterpart of the
//! scada adapter, for scanners and humans with netcat.

use std::fmt::Write as _;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ProtocolAdapter;
use crate::memory::{Address, MemoryMap};
use crate::simproto::Guid;

pub struct StatusAdapter {
    banner: String,
    serves: Vec<Address>,
}

impl StatusAdapter {
    pub fn new(guid: Guid, model_kind: &str, serves: Vec<Address>) -> Self {
        Self {
            banner: format!("device {} ({})", guid, model_kind),
            serves,
        }
    }

    fn render(&self, memory: &MemoryMap) -> String {
        let mut page = String::new();
        let _ = writeln!(page, "{}", self.banner);
        for addr in &self.serves {
            if let Ok(value) = memory.read(*addr) {
                let _ = writeln!(page, "{} = {}", addr, value);
            }
        }
        page
    }
}

impl ProtocolAdapter for StatusAdapter {
    fn name(&self) -> &'static str {
        "status"
    }

    fn serves(&self) -> &[Address] {
        &self.serves
    }

    fn start(
        self: Box<Self>,
        listener: TcpListener,
        memory: Arc<MemoryMap>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((mut stream, addr)) => {
                            debug!(%addr, "status client connected");
                            let page = self.render(&memory);
                            if let Err(e) = stream.write_all(page.as_bytes()).await {
                                debug!(%addr, error = %e, "status write failed");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "status accept failed");
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("status adapter stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Namespace, Value};

    #[test]
    fn renders_every_served_point() {
        let volts = Address::new(Namespace::Measurement, 0);
        let breaker = Address::new(Namespace::Coil, 0);
        let memory = MemoryMap::new([
            (volts, Value::Float(520833.333)),
            (breaker, Value::Bool(true)),
        ]);
        let adapter = StatusAdapter::new(Guid(2), "transmission", vec![volts, breaker]);
        let page = adapter.render(&memory);
        assert!(page.starts_with("device 2 (transmission)"));
        assert!(page.contains("Measurement[0] = 520833.333"));
        assert!(page.contains("Coil[0] = true"));
    }
}
