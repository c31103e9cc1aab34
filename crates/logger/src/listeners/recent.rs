//! Serve the latest reading of every sensor over TCP
//!
//! Each client that connects receives one snapshot, one line per sensor
//! ordered by id, and the connection is closed:
//!
//! ```text
//! <id>,<cooked> <unit>,<timestamp>,<signal or ->,<kind>,<name>
//! ```

use super::{ListenerContext, ListenerParams, port_param, string_param};
use anyhow::{Context, anyhow};
use common::{DataListener, DataPoint, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 4711;

type Latest = Arc<Mutex<BTreeMap<u16, Arc<DataPoint>>>>;

struct Server {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct RecentValuesListener {
    host: String,
    port: u16,
    runtime: Option<Handle>,
    latest: Latest,
    server: Mutex<Option<Server>>,
}

impl RecentValuesListener {
    pub const TAG: &'static str = "RecentValuesListener";

    /// Create the listener and try to start the TCP server
    ///
    /// Without a runtime, or when binding fails, readings are still
    /// collected and the server start is retried on the next point.
    pub fn new(host: impl Into<String>, port: u16, runtime: Option<Handle>) -> Self {
        let listener = Self {
            host: host.into(),
            port,
            runtime,
            latest: Arc::new(Mutex::new(BTreeMap::new())),
            server: Mutex::new(None),
        };

        if let Err(e) = listener.ensure_server() {
            error!("Unable to start TCP server: {:#}", e);
        }
        listener
    }

    pub fn from_params(
        params: &ListenerParams,
        context: &ListenerContext,
    ) -> Result<Arc<dyn DataListener>> {
        let host = string_param(params, "host", DEFAULT_HOST)?;
        let port = port_param(params, "port", DEFAULT_PORT)?;
        Ok(Arc::new(Self::new(host, port, context.runtime.clone())))
    }

    /// Address the server is bound to, once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|server| server.local_addr)
    }

    /// Current snapshot text
    pub fn snapshot(&self) -> String {
        render_snapshot(&self.latest.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn ensure_server(&self) -> anyhow::Result<()> {
        let mut server = self.server.lock().unwrap_or_else(PoisonError::into_inner);
        if server.is_some() {
            return Ok(());
        }

        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("no async runtime available"))?;

        info!("Creating TCP server at {}:{}", self.host, self.port);
        let std_listener = std::net::TcpListener::bind((self.host.as_str(), self.port))
            .with_context(|| format!("Failed to bind {}:{}", self.host, self.port))?;
        std_listener
            .set_nonblocking(true)
            .context("Failed to set socket non-blocking")?;
        let local_addr = std_listener.local_addr()?;

        let _guard = runtime.enter();
        let tcp_listener = tokio::net::TcpListener::from_std(std_listener)
            .context("Failed to convert listener to tokio")?;
        let task = runtime.spawn(serve(tcp_listener, Arc::clone(&self.latest)));

        *server = Some(Server { local_addr, task });
        Ok(())
    }
}

async fn serve(listener: tokio::net::TcpListener, latest: Latest) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        debug!("Snapshot requested by {}", peer);
        let response = render_snapshot(&latest.lock().unwrap_or_else(PoisonError::into_inner));

        if let Err(e) = stream.write_all(response.as_bytes()).await {
            warn!("Failed to send snapshot to {}: {}", peer, e);
            continue;
        }
        let _ = stream.shutdown().await;
    }
}

/// Render one line per sensor, ordered by id
pub fn render_snapshot(latest: &BTreeMap<u16, Arc<DataPoint>>) -> String {
    latest
        .values()
        .map(|point| {
            format!(
                "{},{:.6} {},{},{},{},{}\n",
                point.sensor_id,
                point.cooked(),
                point.sensor.unit(),
                point.timestamp,
                point.signal_text(),
                point.sensor.kind(),
                point.sensor.name()
            )
        })
        .collect()
}

impl DataListener for RecentValuesListener {
    fn name(&self) -> &str {
        Self::TAG
    }

    fn on_new_data(&self, point: Arc<DataPoint>) -> anyhow::Result<()> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point.sensor_id, point);

        self.ensure_server()
    }
}

impl Drop for RecentValuesListener {
    fn drop(&mut self) {
        if let Some(server) = self
            .server
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            server.task.abort();
        }
    }
}
