//! SSH server: accepts client connections, authenticates them through the
//! realm dispatcher, and relays every channel and request to the resolved
//! target container.
//!
//! Each connection gets its own [`ConnectionHandler`] task. The target
//! connection is established at the first channel or forwarding activity
//! after the handshake, before any channel data flows; a fingerprint or dial
//! failure at that point tears the client connection down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{client, Channel, ChannelId, Disconnect, MethodKind, MethodSet, Pty, Sig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthDispatcher, TargetDescriptor};
use crate::bridge::{self, ChannelOp, TargetHandler};
use crate::config::ProxyConfig;

/// Shared state for the SSH server.
pub struct ServerState {
    pub dispatcher: AuthDispatcher,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    /// Shared server state.
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Resolved target, set by a successful password authentication and
    /// consumed when the bridge is established.
    descriptor: Option<TargetDescriptor>,

    /// The second-hop connection, established lazily.
    target: Option<client::Handle<TargetHandler>>,

    /// Relay senders for active session channels.
    channels: HashMap<ChannelId, mpsc::Sender<ChannelOp>>,

    /// Channel relay tasks, aborted at teardown if still running.
    relay_tasks: Vec<JoinHandle<()>>,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            descriptor: None,
            target: None,
            channels: HashMap::new(),
            relay_tasks: Vec::new(),
        }
    }

    /// Establish the target connection if it is not up yet. Consumes the
    /// descriptor; a missing descriptor after the handshake is fatal for the
    /// connection.
    async fn ensure_target(&mut self, server_handle: russh::server::Handle) -> Result<()> {
        if self.target.is_some() {
            return Ok(());
        }

        let descriptor = self
            .descriptor
            .take()
            .context("no target descriptor after handshake")?;

        info!(
            peer = %self.peer_addr,
            target = %descriptor.address,
            "establishing bridge"
        );

        let handle = bridge::connect_target(&descriptor, server_handle).await?;
        self.target = Some(handle);
        Ok(())
    }

    async fn forward(&self, channel: ChannelId, op: ChannelOp) {
        if let Some(ops) = self.channels.get(&channel) {
            let _ = ops.send(op).await;
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Authenticate via the realm dispatcher. All failures look the same to
    /// the client; the internal kind goes to the log.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer_addr, user = %user, "password auth attempt");

        match self.server.dispatcher.authenticate(user, password).await {
            Ok(authenticated) => {
                info!(
                    peer = %self.peer_addr,
                    realm = authenticated.address.realm.name(),
                    principal = %authenticated.address.principal,
                    index = authenticated.address.index,
                    "authentication succeeded"
                );
                self.descriptor = Some(authenticated.descriptor);
                Ok(Auth::Accept)
            }
            Err(err) => {
                warn!(
                    peer = %self.peer_addr,
                    user = %user,
                    kind = err.kind(),
                    "authentication-failed"
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    /// Open a matching session channel on the target and join the pair.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.ensure_target(session.handle()).await?;
        let Some(target) = self.target.as_mut() else {
            return Ok(false);
        };

        let target_channel = match target.channel_open_session().await {
            Ok(target_channel) => target_channel,
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "target refused session channel");
                return Ok(false);
            }
        };
        let (ops, task) =
            bridge::spawn_channel_relay(session.handle(), channel.id(), target_channel);
        self.channels.insert(channel.id(), ops);
        self.relay_tasks.push(task);

        debug!(peer = %self.peer_addr, channel = ?channel.id(), "session channel joined");
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelOp::Data(data.to_vec())).await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelOp::ExtendedData(code, data.to_vec()))
            .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelOp::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender closes the target side once queued ops drain.
        self.channels.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelOp::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelOp::Shell).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelOp::Exec(data.to_vec())).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelOp::Env(variable_name.to_string(), variable_value.to_string()),
        )
        .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelOp::Subsystem(name.to_string()))
            .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelOp::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelOp::Signal(signal)).await;
        Ok(())
    }

    /// Handle direct-tcpip (local port forward): open the same channel on
    /// the target and join the pair.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.ensure_target(session.handle()).await?;
        let Some(target) = self.target.as_mut() else {
            return Ok(false);
        };

        debug!(
            peer = %self.peer_addr,
            host_to_connect,
            port_to_connect,
            "direct-tcpip request"
        );

        match target
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(target_channel) => {
                self.relay_tasks
                    .push(bridge::spawn_tcpip_join(channel, target_channel));
                Ok(true)
            }
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "target refused direct-tcpip");
                Ok(false)
            }
        }
    }

    /// Forward tcpip-forward global requests; the target's forwarded-tcpip
    /// channels come back through the bridge's client handler.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.ensure_target(session.handle()).await?;
        let Some(target) = self.target.as_mut() else {
            return Ok(false);
        };

        match target.tcpip_forward(address.to_string(), *port).await {
            Ok(bound_port) => {
                if bound_port != 0 {
                    *port = bound_port;
                }
                Ok(bound_port != 0)
            }
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "target refused tcpip-forward");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(target) = self.target.as_mut() else {
            return Ok(false);
        };

        match target.cancel_tcpip_forward(address.to_string(), port).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "target refused cancel-tcpip-forward");
                Ok(false)
            }
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!(peer = %self.peer_addr, "connection closed");

        // Closing the client side closes the target side: channel relays see
        // their senders drop and flush, then the transport goes away.
        if let Some(target) = self.target.take() {
            tokio::spawn(async move {
                let _ = target
                    .disconnect(Disconnect::ByApplication, "session ended", "en")
                    .await;
            });
        }

        for task in self.relay_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Run the SSH server on the configured listen address.
pub async fn run_server(
    config: Arc<ProxyConfig>,
    host_key: russh::keys::PrivateKey,
    dispatcher: AuthDispatcher,
) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    run_on(listener, host_key, dispatcher).await
}

/// Run the SSH server on an already-bound listener.
pub async fn run_on(
    listener: TcpListener,
    host_key: russh::keys::PrivateKey,
    dispatcher: AuthDispatcher,
) -> Result<()> {
    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from(&[MethodKind::Password][..]),
        keys: vec![host_key],
        ..Default::default()
    });

    let state = Arc::new(ServerState { dispatcher });

    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!("SSH session ended: {}", e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {}", e);
                }
            }
        });
    }
}
