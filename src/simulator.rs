//! The facade that wires the state store, command center, and transport together and
//! owns the single-connection lifecycle.
//!
//! Grounded on spec §4.5 and on `original_source/server/simulator.go`'s `setDeviceName`
//! (the Linux `machine-info`/`hcitool`/`hciconfig`/`service bluetooth restart` shell-out
//! sequence), which spec §9's "platform coupling" note says to isolate behind a single
//! hook rather than carry into the protocol core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::command_center::{CommandCenter, Transport};
use crate::error::{Error, Result};
use crate::state::Store;

/// Called with the pump's advertised name whenever it is (re)established. The
/// production deployment backs this with the Linux BlueZ shell-out sequence; tests and
/// the reference binary can supply a no-op or logging closure instead.
pub type SetDeviceName = Box<dyn Fn(&str) + Send + Sync>;

/// Owns the store, the command center, and the open-connection flag. One `Simulator`
/// models one pump; at most one controller may be connected to it at a time.
pub struct Simulator {
    store: Arc<Store>,
    command_center: Arc<CommandCenter>,
    has_open_connection: AtomicBool,
    set_device_name: SetDeviceName,
}

impl Simulator {
    pub async fn new(store: Arc<Store>, transport: Arc<dyn Transport>, set_device_name: SetDeviceName) -> Self {
        let (pump_type, name) = store.read(|s| (s.pump_type, s.name.clone())).await;
        let command_center = CommandCenter::new(store.clone(), transport, pump_type, name.clone());
        (set_device_name)(&name);
        Self {
            store,
            command_center,
            has_open_connection: AtomicBool::new(false),
            set_device_name,
        }
    }

    pub fn command_center(&self) -> Arc<CommandCenter> {
        Arc::clone(&self.command_center)
    }

    /// Called when the transport reports a new incoming connection. Rejects a second
    /// concurrent connection; otherwise resets connection-scoped session state.
    pub async fn on_connect(&self) -> Result<()> {
        if self.has_open_connection.swap(true, Ordering::SeqCst) {
            warn!("rejecting connection attempt: a controller is already connected");
            return Err(Error::Transport("a connection is already open".into()));
        }
        self.command_center.reset_session().await;
        let name = self.store.read(|s| s.name.clone()).await;
        (self.set_device_name)(&name);
        info!(name = %name, "accepted new connection");
        Ok(())
    }

    /// Called when the transport reports the connection has dropped.
    pub async fn on_disconnect(&self) {
        self.command_center.reset_session().await;
        self.has_open_connection.store(false, Ordering::SeqCst);
        info!("connection closed, session cleared");
    }

    /// Feeds one write-characteristic fragment to the command center.
    pub async fn on_write(&self, fragment: &[u8]) -> Result<()> {
        self.command_center.handle_fragment(fragment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct NullTransport;
    impl Transport for NullTransport {
        fn notify(&self, _chunk: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn temp_state_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dana-sim-simulator-test-{label}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn second_connection_is_rejected() {
        let path = temp_state_path("reject");
        let store = Arc::new(Store::load(&path));
        let names: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let names2 = names.clone();
        let sim = Simulator::new(
            store,
            Arc::new(NullTransport),
            Box::new(move |n| names2.lock().unwrap().push(n.to_string())),
        )
        .await;

        sim.on_connect().await.unwrap();
        assert!(sim.on_connect().await.is_err());
        sim.on_disconnect().await;
        assert!(sim.on_connect().await.is_ok());

        let _ = std::fs::remove_file(&path);
    }
}
