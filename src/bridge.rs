//! The duplex SSH relay between an authenticated client connection and the
//! in-container daemon.
//!
//! [`connect_target`] dials the descriptor's address, pins the daemon's host
//! key by MD5 fingerprint, and authenticates with the per-instance private
//! key. Each session channel is then joined to a matching target channel by
//! [`spawn_channel_relay`]: the pump task owns the target channel, applies
//! operations arriving from the server-side handler, and relays everything
//! the target emits back through the server handle. Raw tcpip channels use
//! the simpler [`spawn_tcpip_join`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::server;
use russh::{client, Channel, ChannelId, ChannelMsg, CryptoVec, Pty, Sig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::TargetDescriptor;
use crate::keys::{decode_private_key, md5_fingerprint};

/// Client handler for the second hop. Enforces fingerprint pinning and hands
/// target-originated forwarded-tcpip channels back to the client connection.
pub struct TargetHandler {
    expected_fingerprint: String,
    server: server::Handle,
}

impl client::Handler for TargetHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let presented = md5_fingerprint(key);
        if presented == self.expected_fingerprint {
            return Ok(true);
        }
        warn!(
            expected = %self.expected_fingerprint,
            %presented,
            "target host key fingerprint mismatch"
        );
        Ok(false)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            connected_address,
            connected_port, "target opened forwarded-tcpip channel"
        );
        let client_side = self
            .server
            .channel_open_forwarded_tcpip(
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            )
            .await
            .context("failed to open forwarded-tcpip channel to client")?;
        spawn_tcpip_join(client_side, channel);
        Ok(())
    }
}

/// Dial the target and authenticate the second hop.
///
/// The returned handle owns the outbound connection; dropping it (or calling
/// `disconnect`) tears the target side down.
pub async fn connect_target(
    descriptor: &TargetDescriptor,
    server: server::Handle,
) -> Result<client::Handle<TargetHandler>> {
    let key = decode_private_key(&descriptor.private_key)
        .context("invalid private key in target descriptor")?;

    let config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    });

    let handler = TargetHandler {
        expected_fingerprint: descriptor.host_fingerprint.clone(),
        server,
    };

    let mut handle = client::connect(config, descriptor.address.as_str(), handler)
        .await
        .with_context(|| format!("failed to connect to target {}", descriptor.address))?;

    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    let auth = handle
        .authenticate_publickey(
            descriptor.user.clone(),
            PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
        )
        .await?;
    if !auth.success() {
        bail!("target rejected key authentication");
    }

    Ok(handle)
}

/// A channel-level operation forwarded from the client side to the target.
/// Dropping the sender closes the target channel after the queue drains.
#[derive(Debug)]
pub enum ChannelOp {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    Eof,
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Env(String, String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    Subsystem(String),
}

/// Join one session channel to its target channel.
///
/// The pump preserves byte order per direction and pairs request replies
/// (success/failure) with their originating requests; stderr stays on the
/// extended-data stream. EOF is half-close: the pump keeps running until
/// either side closes.
pub fn spawn_channel_relay(
    server: server::Handle,
    id: ChannelId,
    target: Channel<client::Msg>,
) -> (mpsc::Sender<ChannelOp>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ChannelOp>(32);

    let task = tokio::spawn(async move {
        let mut target = target;
        loop {
            tokio::select! {
                msg = target.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if server.data(id, CryptoVec::from_slice(&data)).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if server
                                .extended_data(id, ext, CryptoVec::from_slice(&data))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = server.eof(id).await;
                        }
                        Some(ChannelMsg::Success) => {
                            let _ = server.channel_success(id).await;
                        }
                        Some(ChannelMsg::Failure) => {
                            let _ = server.channel_failure(id).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            let _ = server.exit_status_request(id, exit_status).await;
                        }
                        Some(ChannelMsg::ExitSignal {
                            signal_name,
                            core_dumped,
                            error_message,
                            lang_tag,
                        }) => {
                            let _ = server
                                .exit_signal_request(
                                    id,
                                    signal_name,
                                    core_dumped,
                                    error_message,
                                    lang_tag,
                                )
                                .await;
                        }
                        Some(ChannelMsg::Close) | None => {
                            let _ = server.close(id).await;
                            break;
                        }
                        Some(_) => {}
                    }
                }
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            if apply_channel_op(&target, op).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Client side closed; the queue has drained.
                            let _ = target.eof().await;
                            let _ = target.close().await;
                            break;
                        }
                    }
                }
            }
        }
    });

    (tx, task)
}

async fn apply_channel_op(
    target: &Channel<client::Msg>,
    op: ChannelOp,
) -> Result<(), russh::Error> {
    match op {
        ChannelOp::Data(bytes) => target.data(&bytes[..]).await,
        ChannelOp::ExtendedData(ext, bytes) => target.extended_data(ext, &bytes[..]).await,
        ChannelOp::Eof => target.eof().await,
        ChannelOp::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            target
                .request_pty(
                    true,
                    &term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    &modes,
                )
                .await
        }
        ChannelOp::Shell => target.request_shell(true).await,
        ChannelOp::Exec(command) => target.exec(true, command).await,
        ChannelOp::Env(name, value) => target.set_env(true, name, value).await,
        ChannelOp::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            target
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        ChannelOp::Signal(signal) => target.signal(signal).await,
        ChannelOp::Subsystem(name) => target.request_subsystem(true, &name).await,
    }
}

/// Join a raw tcpip channel pair (direct-tcpip or forwarded-tcpip): data and
/// EOF flow through, close on either side closes the other.
pub fn spawn_tcpip_join(
    client_side: Channel<server::Msg>,
    target_side: Channel<client::Msg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut client_side = client_side;
        let mut target_side = target_side;
        loop {
            tokio::select! {
                msg = client_side.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if target_side.data(&data[..]).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = target_side.eof().await;
                        }
                        Some(ChannelMsg::Close) | None => {
                            let _ = target_side.close().await;
                            break;
                        }
                        Some(_) => {}
                    }
                }
                msg = target_side.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if client_side.data(&data[..]).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = client_side.eof().await;
                        }
                        Some(ChannelMsg::Close) | None => {
                            let _ = client_side.close().await;
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    })
}
