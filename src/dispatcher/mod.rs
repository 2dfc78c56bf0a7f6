//! Per-tunnel orchestrator.
//!
//! One [`DispatcherService`] owns one tunnel listener and one upstream
//! [`HttpForwarder`]. Its lifecycle is strictly linear:
//!
//! ```text
//! Created ──open──▶ Opening ──▶ Open ──close──▶ Closing ──▶ Closed
//!                      │                           ▲
//!                      └──────── failure ──────────┘
//! ```
//!
//! A failed `open` still passes through `Closing`, tearing down whatever
//! was started. Every task the service spawns runs inside its `tunnel` span.

mod handlers;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::assets::AssetRoot;
use crate::descriptor::{TunnelDescriptor, UpstreamTarget};
use crate::provisioning::{ProvisionError, ResourceProvisioner};
use crate::proxy::{self, BridgeOptions, ForwardError, ForwarderOptions, HttpForwarder};
use crate::routing::strip_tunnel_prefix;
use crate::transport::{TransportError, TunnelListener, TunnelTransport};

/// Behaviour switches for one tunnel.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Accept and bridge WebSocket connections (default true).
    pub enable_websocket: bool,
    /// Create the relay resource on open and delete it on close (default false).
    pub dynamic_resource_creation: bool,
    /// Pause after provisioning before listening (default 2s).
    pub provisioning_grace: Duration,
    pub forwarder: ForwarderOptions,
    pub bridge: BridgeOptions,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            enable_websocket: true,
            dynamic_resource_creation: false,
            provisioning_grace: Duration::from_secs(2),
            forwarder: ForwarderOptions::default(),
            bridge: BridgeOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum DispatchError {
    /// `open` or `close` called in a state that does not allow it.
    InvalidState {
        operation: &'static str,
        state: ServiceState,
    },
    /// Cancelled before the tunnel was open.
    Cancelled,
    /// Dynamic provisioning enabled but no provisioner attached.
    NoProvisioner,
    Provision(ProvisionError),
    Transport(TransportError),
    Forwarder(ForwardError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { operation, state } => {
                write!(f, "cannot {operation} a tunnel that is {state}")
            }
            Self::Cancelled => write!(f, "cancelled while opening"),
            Self::NoProvisioner => write!(f, "dynamic resource creation needs a provisioner"),
            Self::Provision(e) => write!(f, "provisioning failed: {e}"),
            Self::Transport(e) => write!(f, "listener failed: {e}"),
            Self::Forwarder(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Provision(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Forwarder(e) => Some(e),
            _ => None,
        }
    }
}

/// Runs one tunnel: listener, request handler, WebSocket accept loop.
pub struct DispatcherService {
    descriptor: Arc<TunnelDescriptor>,
    options: DispatcherOptions,
    transport: Arc<dyn TunnelTransport>,
    provisioner: Option<Arc<dyn ResourceProvisioner>>,
    context: Arc<handlers::Context>,
    state: Mutex<ServiceState>,
    listener: Mutex<Option<Arc<dyn TunnelListener>>>,
    /// Set once this instance created the relay resource.
    provisioned: AtomicBool,
    /// Ends the accept loop and every bridge session.
    shutdown: CancellationToken,
    span: Span,
}

impl DispatcherService {
    pub fn new(
        descriptor: TunnelDescriptor,
        target: UpstreamTarget,
        options: DispatcherOptions,
        transport: Arc<dyn TunnelTransport>,
        assets: AssetRoot,
    ) -> Result<Self, DispatchError> {
        let span = info_span!("tunnel", name = %descriptor.tunnel_name);
        let forwarder = HttpForwarder::new(
            target,
            descriptor.tunnel_name.clone(),
            options.forwarder.clone(),
        )
        .map_err(DispatchError::Forwarder)?;

        let context = Arc::new(handlers::Context {
            relay_name: descriptor.tunnel_name.clone(),
            forwarder: Arc::new(forwarder),
            assets,
            tasks: TaskTracker::new(),
        });
        Ok(Self {
            descriptor: Arc::new(descriptor),
            options,
            transport,
            provisioner: None,
            context,
            state: Mutex::new(ServiceState::Created),
            listener: Mutex::new(None),
            provisioned: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            span,
        })
    }

    /// Attach the collaborator used when dynamic provisioning is enabled.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn descriptor(&self) -> &TunnelDescriptor {
        &self.descriptor
    }

    pub fn target(&self) -> &UpstreamTarget {
        self.context.forwarder.target()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Public address of the open listener.
    pub fn address(&self) -> Option<String> {
        self.current_listener().map(|l| l.address())
    }

    fn set_state(&self, next: ServiceState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(parent: &self.span, from = %*state, to = %next, "State change");
        *state = next;
    }

    fn current_listener(&self) -> Option<Arc<dyn TunnelListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Provision (if dynamic), open the listener, start the accept loop and
    /// register the request handler.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), DispatchError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ServiceState::Created {
                return Err(DispatchError::InvalidState {
                    operation: "open",
                    state: *state,
                });
            }
            *state = ServiceState::Opening;
        }

        match self.start(cancel).instrument(self.span.clone()).await {
            Ok(()) => {
                self.set_state(ServiceState::Open);
                info!(
                    parent: &self.span,
                    address = %self.address().unwrap_or_default(),
                    target = %self.target().http_base(),
                    "Tunnel open"
                );
                Ok(())
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Tunnel failed to open");
                self.set_state(ServiceState::Closing);
                self.teardown(cancel).instrument(self.span.clone()).await;
                self.set_state(ServiceState::Closed);
                Err(e)
            }
        }
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), DispatchError> {
        if let Some(original) = &self.descriptor.original_name {
            warn!(original = %original, "Tunnel name normalised to lowercase");
        }

        if self.options.dynamic_resource_creation {
            let provisioner = self.provisioner.as_ref().ok_or(DispatchError::NoProvisioner)?;
            info!("Creating hybrid connection");
            provisioner
                .create(&self.descriptor)
                .await
                .map_err(DispatchError::Provision)?;
            self.provisioned.store(true, Ordering::SeqCst);

            tokio::select! {
                () = tokio::time::sleep(self.options.provisioning_grace) => {}
                () = cancel.cancelled() => return Err(DispatchError::Cancelled),
            }
        }

        let listener = tokio::select! {
            result = self.transport.open_listener(&self.descriptor) => {
                result.map_err(DispatchError::Transport)?
            }
            () = cancel.cancelled() => return Err(DispatchError::Cancelled),
        };
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener.clone());

        if self.options.enable_websocket {
            let accept = AcceptLoop {
                listener: listener.clone(),
                target: self.target().clone(),
                relay_name: self.descriptor.tunnel_name.clone(),
                options: self.options.bridge.clone(),
                shutdown: self.shutdown.clone(),
                tasks: self.context.tasks.clone(),
            };
            self.context
                .tasks
                .spawn(accept.run().instrument(Span::current()));
        }

        listener.set_request_handler(handlers::router(self.context.clone()));
        Ok(())
    }

    /// Stop the tunnel. In-flight requests may finish until `cancel` fires;
    /// after that they are abandoned with a warning. Closing a closed
    /// service is a no-op.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), DispatchError> {
        match self.state() {
            ServiceState::Closed => return Ok(()),
            ServiceState::Open => {}
            state => {
                return Err(DispatchError::InvalidState {
                    operation: "close",
                    state,
                })
            }
        }
        self.set_state(ServiceState::Closing);
        self.teardown(cancel).instrument(self.span.clone()).await;
        self.set_state(ServiceState::Closed);
        info!(parent: &self.span, "Tunnel closed");
        Ok(())
    }

    /// Best-effort release of everything `start` may have acquired.
    async fn teardown(&self, cancel: &CancellationToken) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            if let Err(e) = listener.close().await {
                warn!(error = %e, "Listener close failed");
            }
        }

        self.shutdown.cancel();
        let tasks = &self.context.tasks;
        tasks.close();
        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "Waiting for in-flight work");
            tokio::select! {
                () = tasks.wait() => {}
                () = cancel.cancelled() => {
                    warn!(in_flight = tasks.len(), "Shutdown budget exhausted, abandoning in-flight work");
                }
            }
        }

        if self.context.forwarder.dispose() {
            debug!("Upstream client disposed");
        }

        if self.provisioned.swap(false, Ordering::SeqCst) {
            if let Some(provisioner) = &self.provisioner {
                if let Err(e) = provisioner.delete(&self.descriptor).await {
                    warn!(error = %e, "Failed to delete hybrid connection");
                }
            }
        }
    }
}

/// Hands each inbound WebSocket connection to its own bridge task.
struct AcceptLoop {
    listener: Arc<dyn TunnelListener>,
    target: UpstreamTarget,
    relay_name: String,
    options: BridgeOptions,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let conn = tokio::select! {
                conn = self.listener.accept_connection() => conn,
                () = self.shutdown.cancelled() => None,
            };
            let Some(conn) = conn else { break };

            let relative = strip_tunnel_prefix(conn.path(), &self.relay_name);
            let upstream = self.target.websocket_url_for(&relative);
            info!(path = %relative, %upstream, "WebSocket accepted");

            let options = self.options.clone();
            let cancel = self.shutdown.clone();
            self.tasks.spawn(
                async move {
                    if let Err(e) = proxy::bridge(conn, &upstream, &options, cancel).await {
                        warn!(error = %e, "WebSocket bridge failed");
                    }
                }
                .instrument(Span::current()),
            );
        }
        debug!("Accept loop stopped");
    }
}
