//! VIIPER: userspace USB input-device emulation exported over USB/IP.
//!
//! Two TCP listeners run side by side: the USB/IP port serves device
//! enumeration and URB traffic to a kernel client (`vhci-hcd`,
//! `usbip-win2`), and the control port lets feeders create buses, add
//! devices and stream input/output frames, optionally inside an
//! authenticated, encrypted session.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = viiper_server::Server::start(viiper_server::ServerConfig::default()).await?;
//! println!("usbip on {}", server.usbip_addr());
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod batch;
mod config;
mod conn;
mod control;
mod handlers;
mod problem;
mod router;
mod usbip;

pub use config::{ConfigError, ServerConfig, DEFAULT_CONTROL_ADDR, DEFAULT_USBIP_ADDR};
pub use problem::Problem;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use viiper_auth::{AuthError, AuthKey};
use viiper_bus::{BusRegistry, BusTimeouts, CancelScope, ExportMeta};
use viiper_devices::DeviceRegistry;

/// Invoked after every successful device add; platform integrations use it
/// to auto-attach a localhost USB/IP client. The hook must not block.
pub type AttachHook = Arc<dyn Fn(&ExportMeta) + Send + Sync>;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] io::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// State shared by both listeners and every connection task.
pub struct ServerState {
    pub config: ServerConfig,
    pub buses: Arc<BusRegistry>,
    pub devices: Arc<DeviceRegistry>,
    pub(crate) auth_key: Option<AuthKey>,
    pub(crate) attach_hook: Option<AttachHook>,
}

impl ServerState {
    /// Whether this peer must complete the handshake before issuing
    /// requests.
    pub(crate) fn requires_auth(&self, peer: &SocketAddr) -> bool {
        if self.auth_key.is_none() {
            return false;
        }
        self.config.require_localhost_auth || !peer.ip().is_loopback()
    }
}

pub struct Server {
    state: Arc<ServerState>,
    usbip_addr: SocketAddr,
    control_addr: SocketAddr,
    shutdown: CancelScope,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Start both listeners with the built-in device registry.
    pub async fn start(config: ServerConfig) -> Result<Server, StartError> {
        Server::start_with(config, Arc::new(DeviceRegistry::with_builtins()), None).await
    }

    /// Start with a custom device registry and optional auto-attach hook.
    pub async fn start_with(
        config: ServerConfig,
        devices: Arc<DeviceRegistry>,
        attach_hook: Option<AttachHook>,
    ) -> Result<Server, StartError> {
        let auth_key = match &config.password {
            Some(password) => Some(AuthKey::derive(password)?),
            None => None,
        };

        let buses = BusRegistry::new(BusTimeouts {
            device_handler_connect: config.device_handler_connect_timeout,
            bus_cleanup: config.bus_cleanup_timeout,
        });

        let usbip_listener = TcpListener::bind(config.usbip_listen_addr).await?;
        let control_listener = TcpListener::bind(config.control_listen_addr).await?;
        let usbip_addr = usbip_listener.local_addr()?;
        let control_addr = control_listener.local_addr()?;

        let state = Arc::new(ServerState {
            config,
            buses,
            devices,
            auth_key,
            attach_hook,
        });

        let shutdown = CancelScope::new();
        let accept_tasks = vec![
            tokio::spawn(usbip::serve(
                usbip_listener,
                Arc::clone(&state),
                shutdown.clone(),
            )),
            tokio::spawn(control::serve(
                control_listener,
                Arc::clone(&state),
                shutdown.clone(),
            )),
        ];

        info!(%usbip_addr, %control_addr, auth = state.auth_key.is_some(), "viiper listening");
        Ok(Server {
            state,
            usbip_addr,
            control_addr,
            shutdown,
            accept_tasks,
        })
    }

    pub fn usbip_addr(&self) -> SocketAddr {
        self.usbip_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stop accepting, cancel every device context (which unblocks URB loops
    /// and feeder streams) and wait for the accept loops to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.state.buses.close_all();
        for task in self.accept_tasks {
            let _ = task.await;
        }
        info!("viiper stopped");
    }
}

/// Peer-went-away errors that log at info rather than error.
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
