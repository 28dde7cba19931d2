//! Persistent multiplexed SSH transports, one per node.
//!
//! Each live transport carries a cooperative keepalive task. Liveness is
//! re-tested with a keepalive packet whenever a pooled transport is reused;
//! dead transports are evicted and redialed. Dials never happen while the
//! pool map lock is held.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::api::NodeInfo;
use md5::{Digest, Md5};
use ssh2::{HostKeyType, Session};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task;
use tracing::{debug, info, warn};

use crate::hooks::{HookContext, HookPoint, HookRegistry};

/// Fallback SSH port when the node spec carries 0.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Dial timeout for new transports.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Cadence of the per-transport keepalive task.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no ssh key configured for node {node}")]
    MissingKey { node: String },
    #[error("ssh dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("ssh auth failed for {user}@{addr}: {source}")]
    Auth {
        user: String,
        addr: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("host key mismatch for {host}: got {got}, expected {expected}")]
    HostKeyMismatch {
        host: String,
        got: String,
        expected: String,
    },
    #[error("could not capture host key from {host}")]
    MissingHostKey { host: String },
    #[error("command exited with status {exit_code}")]
    CommandFailed { exit_code: i32, output: String },
    #[error("ssh session error: {0}")]
    Session(#[source] anyhow::Error),
}

/// Captured output of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Combined stdout and stderr.
    pub output: String,
    /// Process exit status.
    pub exit_code: i32,
}

/// A live authenticated transport. Cloning shares the underlying session.
#[derive(Clone)]
pub struct Transport {
    // Manual Debug impl below: ssh2::Session doesn't implement Debug.
    session: Arc<StdMutex<Session>>,
    stop: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    fn new(session: Session) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            session: Arc::new(StdMutex::new(session)),
            stop: Arc::new(stop),
        }
    }

    /// Sends a lightweight keepalive packet to test liveness.
    async fn is_alive(&self) -> bool {
        let session = Arc::clone(&self.session);
        task::spawn_blocking(move || {
            let session = session.lock().unwrap_or_else(|err| err.into_inner());
            session.keepalive_send().is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Runs a command in a fresh single-use session channel.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let session = Arc::clone(&self.session);
        let command = command.to_string();
        task::spawn_blocking(move || exec_blocking(&session, &command))
            .await
            .map_err(|err| TransportError::Session(anyhow::anyhow!("exec task aborted: {err}")))?
    }

    /// Runs a command, forwarding output chunks through `tx` as they arrive.
    /// Returns the exit status once the channel closes.
    pub async fn exec_streamed(
        &self,
        command: &str,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<i32, TransportError> {
        let session = Arc::clone(&self.session);
        let command = command.to_string();
        task::spawn_blocking(move || exec_streamed_blocking(&session, &command, tx))
            .await
            .map_err(|err| TransportError::Session(anyhow::anyhow!("exec task aborted: {err}")))?
    }

    fn shutdown(&self) {
        let _ = self.stop.send(true);
        if let Ok(session) = self.session.lock() {
            let _ = session.disconnect(None, "orbit shutdown", None);
        }
    }
}

fn exec_blocking(
    session: &Arc<StdMutex<Session>>,
    command: &str,
) -> Result<ExecOutput, TransportError> {
    let session = session.lock().unwrap_or_else(|err| err.into_inner());
    let mut channel = session.channel_session().map_err(session_err)?;
    channel.exec(command).map_err(session_err)?;

    let mut output = String::new();
    channel.read_to_string(&mut output).map_err(io_err)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).map_err(io_err)?;
    output.push_str(&stderr);

    channel.wait_close().map_err(session_err)?;
    let exit_code = channel.exit_status().map_err(session_err)?;
    if exit_code != 0 {
        return Err(TransportError::CommandFailed { exit_code, output });
    }
    Ok(ExecOutput {
        output,
        exit_code: 0,
    })
}

fn exec_streamed_blocking(
    session: &Arc<StdMutex<Session>>,
    command: &str,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<i32, TransportError> {
    let session = session.lock().unwrap_or_else(|err| err.into_inner());
    let mut channel = session.channel_session().map_err(session_err)?;
    channel.exec(command).map_err(session_err)?;

    let mut buf = [0_u8; 8192];
    loop {
        let read = channel.read(&mut buf).map_err(io_err)?;
        if read == 0 {
            break;
        }
        if tx.blocking_send(buf[..read].to_vec()).is_err() {
            // Consumer went away; stop forwarding.
            break;
        }
    }

    channel.wait_close().map_err(session_err)?;
    channel.exit_status().map_err(session_err)
}

fn session_err(err: ssh2::Error) -> TransportError {
    TransportError::Session(err.into())
}

fn io_err(err: std::io::Error) -> TransportError {
    TransportError::Session(err.into())
}

/// Pool of persistent transports keyed by node name.
pub struct Pool {
    conns: Mutex<HashMap<String, Transport>>,
    hooks: Arc<HookRegistry>,
}

impl Pool {
    /// Creates an empty pool.
    pub fn new(hooks: Arc<HookRegistry>) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            hooks,
        }
    }

    /// Returns a healthy pooled transport for the node, dialing a new one
    /// when none exists or the pooled one is dead.
    pub async fn connect(&self, node: &NodeInfo) -> Result<Transport, TransportError> {
        let existing = { self.conns.lock().await.get(&node.spec.name).cloned() };
        if let Some(transport) = existing {
            if transport.is_alive().await {
                return Ok(transport);
            }
            // Evict only if the map still holds the dead instance.
            let mut conns = self.conns.lock().await;
            if let Some(current) = conns.get(&node.spec.name) {
                if Arc::ptr_eq(&current.session, &transport.session) {
                    conns.remove(&node.spec.name);
                }
            }
            drop(conns);
            transport.shutdown();
            debug!(node = %node.spec.name, "stale ssh transport evicted");
        }

        let transport = dial(node).await?;

        let mut conns = self.conns.lock().await;
        if let Some(raced) = conns.get(&node.spec.name) {
            // Another caller won the dial race; keep theirs.
            let raced = raced.clone();
            drop(conns);
            transport.shutdown();
            return Ok(raced);
        }
        conns.insert(node.spec.name.clone(), transport.clone());
        drop(conns);

        spawn_keepalive(node.spec.name.clone(), transport.clone());
        info!(node = %node.spec.name, host = %node.spec.host, "ssh connected");
        self.hooks.fire(
            HookPoint::NodeConnect,
            &HookContext {
                node: Some(node.spec.name.clone()),
                ..Default::default()
            },
        );

        Ok(transport)
    }

    /// Runs a command on the node, returning combined output. A non-zero
    /// exit status surfaces as [`TransportError::CommandFailed`].
    pub async fn run(&self, node: &NodeInfo, command: &str) -> Result<ExecOutput, TransportError> {
        let transport = self.connect(node).await?;
        transport.exec(command).await
    }

    /// Runs a command, forwarding output through `tx` as it arrives.
    pub async fn run_streamed(
        &self,
        node: &NodeInfo,
        command: &str,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<i32, TransportError> {
        let transport = self.connect(node).await?;
        transport.exec_streamed(command, tx).await
    }

    /// Releases the transport for one node.
    pub async fn disconnect(&self, name: &str) {
        let removed = self.conns.lock().await.remove(name);
        if let Some(transport) = removed {
            transport.shutdown();
            info!(node = name, "ssh disconnected");
            self.hooks.fire(
                HookPoint::NodeDisconnect,
                &HookContext {
                    node: Some(name.to_string()),
                    ..Default::default()
                },
            );
        }
    }

    /// Releases all transports.
    pub async fn close(&self) {
        let drained: Vec<(String, Transport)> = self.conns.lock().await.drain().collect();
        for (name, transport) in drained {
            transport.shutdown();
            info!(node = %name, "ssh connection closed");
            self.hooks.fire(
                HookPoint::NodeDisconnect,
                &HookContext {
                    node: Some(name),
                    ..Default::default()
                },
            );
        }
    }
}

fn spawn_keepalive(node: String, transport: Transport) {
    let mut stop = transport.stop.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        // The first tick fires immediately; skip it so the cadence starts
        // one interval after the dial.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    if !transport.is_alive().await {
                        warn!(node = %node, "ssh keepalive failed, connection may be dead");
                        break;
                    }
                }
            }
        }
    });
}

async fn dial(node: &NodeInfo) -> Result<Transport, TransportError> {
    let node = node.clone();
    task::spawn_blocking(move || dial_blocking(&node))
        .await
        .map_err(|err| TransportError::Session(anyhow::anyhow!("dial task aborted: {err}")))?
}

fn dial_blocking(node: &NodeInfo) -> Result<Transport, TransportError> {
    let spec = &node.spec;
    if spec.key.is_empty() {
        return Err(TransportError::MissingKey {
            node: spec.name.clone(),
        });
    }

    let port = if spec.port == 0 {
        DEFAULT_SSH_PORT
    } else {
        spec.port
    };
    let addr = format!("{}:{}", spec.host, port);

    let session = handshake(&addr)?;

    let fingerprint = {
        let (raw_key, _) = session
            .host_key()
            .ok_or_else(|| TransportError::MissingHostKey {
                host: spec.host.clone(),
            })?;
        fingerprint_md5(raw_key)
    };
    verify_host_key(node, &fingerprint)?;

    session
        .userauth_pubkey_file(&spec.user, None, Path::new(&spec.key), None)
        .map_err(|err| TransportError::Auth {
            user: spec.user.clone(),
            addr: addr.clone(),
            source: err.into(),
        })?;
    if !session.authenticated() {
        return Err(TransportError::Auth {
            user: spec.user.clone(),
            addr,
            source: anyhow::anyhow!("server rejected public key"),
        });
    }

    session.set_keepalive(true, KEEPALIVE_INTERVAL.as_secs() as u32);
    Ok(Transport::new(session))
}

fn handshake(addr: &str) -> Result<Session, TransportError> {
    let dial_err = |source: anyhow::Error| TransportError::Dial {
        addr: addr.to_string(),
        source,
    };

    let socket = addr
        .to_socket_addrs()
        .map_err(|err| dial_err(err.into()))?
        .next()
        .ok_or_else(|| dial_err(anyhow::anyhow!("no addresses resolved")))?;
    let tcp = TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT)
        .map_err(|err| dial_err(err.into()))?;

    let mut session = Session::new().map_err(session_err)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|err| dial_err(err.into()))?;
    Ok(session)
}

/// Applies the host-key trust policy: unknown keys are accepted for the
/// operator to review later; trusted keys must match exactly.
fn verify_host_key(node: &NodeInfo, presented: &str) -> Result<(), TransportError> {
    if node.host_key_known && !node.key_fingerprint.is_empty() && presented != node.key_fingerprint
    {
        return Err(TransportError::HostKeyMismatch {
            host: node.spec.host.clone(),
            got: presented.to_string(),
            expected: node.key_fingerprint.clone(),
        });
    }
    Ok(())
}

/// Dials the address without authenticating, purely to capture the server's
/// host key. Returns the MD5 fingerprint and the encoded host-key line, so
/// the operator can review them before promoting the node to trusted.
pub async fn gather_host_key(
    host: &str,
    port: u16,
    _timeout: Duration,
) -> Result<(String, String), TransportError> {
    let host = host.to_string();
    let port = if port == 0 { DEFAULT_SSH_PORT } else { port };
    task::spawn_blocking(move || {
        let addr = format!("{host}:{port}");
        let session = handshake(&addr)?;
        let (raw_key, key_type) = session
            .host_key()
            .ok_or_else(|| TransportError::MissingHostKey { host: host.clone() })?;
        Ok((
            fingerprint_md5(raw_key),
            encode_host_key(&host, key_type, raw_key),
        ))
    })
    .await
    .map_err(|err| TransportError::Session(anyhow::anyhow!("gather task aborted: {err}")))?
}

/// Legacy MD5 colon-hex fingerprint of a raw public host key.
pub fn fingerprint_md5(key: &[u8]) -> String {
    let digest = Md5::digest(key);
    let parts: Vec<String> = digest.iter().map(|b| format!("{b:02x}")).collect();
    parts.join(":")
}

/// Serialises a host key to a `host type base64` known-hosts style line.
pub fn encode_host_key(host: &str, key_type: HostKeyType, key: &[u8]) -> String {
    format!("{host} {} {}", host_key_type_name(key_type), BASE64.encode(key))
}

fn host_key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Unknown => "unknown",
        _ => "ssh-ed25519",
    }
}
