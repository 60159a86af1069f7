//! Broker supervisor: composition root, boot/shutdown sequencing and the
//! error dispatcher.
//!
//! Boot order: data/log directories, record store, coordination (paths +
//! broker registration), TCP listener (`SO_REUSEPORT` on Unix), then the
//! accept loop, the error dispatcher and the offset flusher. Shutdown
//! reverses it: cancel the broker scope, close every session, let
//! in-flight work drain, flush pending last offsets, deregister from
//! coordination and drop the store.

use anyhow::{Context, Result};
use quiver_coordination::{Coordination, MemoryCoordination};
use quiver_storage::RecordStore;
use quiver_wire::Message;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::error::SessionError;
use crate::fanout::{self, BrokerShared};
use crate::session_manager::SessionManager;

const STORE_NAME: &str = "qstore";

/// Builder-style entry point for running a broker.
pub struct BrokerServer {
    config: BrokerConfig,
    coordination: Option<Arc<dyn Coordination>>,
}

impl BrokerServer {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            coordination: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Inject a coordination backend. Defaults to the in-process one.
    pub fn with_coordination(mut self, coordination: Arc<dyn Coordination>) -> Self {
        self.coordination = Some(coordination);
        self
    }

    /// Boot the broker. Returns once the listener is accepting.
    pub async fn start(self) -> Result<BrokerHandle> {
        let config = self.config;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("create log dir {}", config.log_dir.display()))?;

        let store = RecordStore::open(config.data_dir.join(STORE_NAME))
            .context("open record store")?;
        tracing::info!(dir = %config.data_dir.display(), "record store opened");

        let coordination = self
            .coordination
            .unwrap_or_else(|| Arc::new(MemoryCoordination::new()));
        let core = Arc::new(quiver_broker::Broker::new(
            store,
            coordination,
            config.coordination_timeout(),
        ));

        let listener = bind_listener(config.port).context("bind listener")?;
        let local_addr = listener.local_addr().context("listener local addr")?;

        let host = outbound_host();
        if !is_public_host(&host) {
            tracing::warn!(%host, "broker is not reachable from an external network");
        }
        let advertised_addr = format!("{host}:{}", local_addr.port());
        core.register_broker(&advertised_addr)
            .await
            .context("register broker in coordination")?;

        let sessions = Arc::new(SessionManager::new());
        let shared = Arc::new(BrokerShared {
            config: config.clone(),
            core: Arc::clone(&core),
            sessions: Arc::clone(&sessions),
            advertised_addr: advertised_addr.clone(),
        });

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (error_tx, error_rx) = mpsc::channel::<SessionError>(64);

        let accept_task = tokio::spawn(fanout::run_accept_loop(
            listener,
            Arc::clone(&shared),
            error_tx,
            cancel_rx.clone(),
        ));
        let dispatch_task = tokio::spawn(dispatch_errors(
            error_rx,
            Arc::clone(&sessions),
            cancel_tx.clone(),
        ));
        let flush_task = tokio::spawn(run_offset_flusher(
            Arc::clone(&core),
            config.offset_flush_interval(),
            cancel_rx.clone(),
        ));

        tracing::info!(addr = %local_addr, advertised = %advertised_addr, "broker started");
        Ok(BrokerHandle {
            local_addr,
            advertised_addr,
            core,
            sessions,
            cancel_tx,
            tasks: vec![accept_task, dispatch_task, flush_task],
        })
    }
}

/// Running broker. Shut it down explicitly to get the drain sequence;
/// dropping it just abandons the tasks.
pub struct BrokerHandle {
    local_addr: SocketAddr,
    advertised_addr: String,
    core: Arc<quiver_broker::Broker>,
    sessions: Arc<SessionManager>,
    cancel_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn core(&self) -> &Arc<quiver_broker::Broker> {
        &self.core
    }

    /// Wait until the broker scope is cancelled (a broker-stoppable error
    /// escalated by the dispatcher).
    pub async fn stopped(&self) {
        let mut cancel_rx = self.cancel_tx.subscribe();
        while !*cancel_rx.borrow() {
            if cancel_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("broker shutting down");
        let _ = self.cancel_tx.send(true);
        self.sessions.close_all();
        for task in self.tasks {
            let _ = task.await;
        }
        if let Err(err) = self.core.flush_offsets().await {
            tracing::warn!(error = %err, "final offset flush failed");
        }
        if let Err(err) = self.core.deregister_broker(&self.advertised_addr).await {
            tracing::warn!(error = %err, "broker deregistration failed");
        }
        tracing::info!("broker stopped");
        Ok(())
    }
}

/// Apply the error taxonomy to each session error: ack the client, fan
/// out broadcastable failures, close the session, stop the broker.
async fn dispatch_errors(
    mut errors: mpsc::Receiver<SessionError>,
    sessions: Arc<SessionManager>,
    cancel_tx: watch::Sender<bool>,
) {
    while let Some(SessionError { session, error }) = errors.recv().await {
        tracing::debug!(session = session.id(), error = %error, "session error");
        if let Some(code) = error.ack_code() {
            let _ = session
                .write(Message::ErrorAck {
                    code,
                    msg: error.to_string(),
                })
                .await;
        }
        if error.broadcastable() {
            sessions
                .broadcast(Message::ErrorAck {
                    code: error.broadcast_code(),
                    msg: error.to_string(),
                })
                .await;
        }
        if error.session_closeable() {
            session.close();
        }
        if error.broker_stoppable() {
            tracing::error!(error = %error, "broker-stoppable error; shutting down");
            let _ = cancel_tx.send(true);
        }
    }
}

/// Coalesced last-offset flush on the configured interval.
async fn run_offset_flusher(
    core: Arc<quiver_broker::Broker>,
    interval: std::time::Duration,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = core.flush_offsets().await {
                    tracing::warn!(error = %err, "periodic offset flush failed");
                }
            }
        }
    }
}

/// Bind the listener with address reuse; `SO_REUSEPORT` on Unix lets two
/// broker processes share a port.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

/// The address peers can reach us on, resolved from the default route.
fn outbound_host() -> String {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) => ip.to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

fn is_public_host(host: &str) -> bool {
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            !(ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified())
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_host_detection() {
        assert!(!is_public_host("127.0.0.1"));
        assert!(!is_public_host("10.1.2.3"));
        assert!(!is_public_host("192.168.0.4"));
        assert!(!is_public_host("0.0.0.0"));
        assert!(is_public_host("93.184.216.34"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reuseport_allows_binding_the_same_port_twice() {
        let first = bind_listener(0).expect("first bind");
        let port = first.local_addr().expect("addr").port();
        let second = bind_listener(port).expect("second bind");
        assert_eq!(second.local_addr().expect("addr").port(), port);
    }
}
