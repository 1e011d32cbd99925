//! Endpoints: one shim subprocess plus the relay socket that stands in for
//! its remote peer.
//!
//! Both roles bind an ephemeral UDP socket and launch their implementation
//! with `-addr <host>:<port>` pointing at it. They differ only in how the
//! shim's real address is learned:
//!
//! * the client's peer is the source of the first datagram it sends
//!   (learned by the relay, see [`crate::relay`]);
//! * the server announces its listening port as the first line on stdout.

mod client;
mod server;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::UdpSocket;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::Implementation;

/// How long a shim gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Errors that keep the harness from running a case at all. Any of these
/// aborts the whole run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to bind relay socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read relay socket address: {0}")]
    LocalAddr(#[source] std::io::Error),

    #[error("failed to spawn {role} shim {}: {source}", .path.display())]
    Spawn {
        role: Role,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} shim has no {stream} pipe")]
    StreamAttach { role: Role, stream: &'static str },

    #[error("failed to read server port announcement: {0}")]
    PortAnnouncement(#[source] std::io::Error),

    #[error("server closed stdout before announcing its port")]
    AnnouncementClosed,

    #[error("server announced {line:?}, which is not a port number")]
    InvalidPort { line: String },

    #[error("server did not announce its port within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("failed to resolve server address {target}: {reason}")]
    ResolvePeer { target: String, reason: String },
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

// ---------------------------------------------------------------------------
// PeerAddr
// ---------------------------------------------------------------------------

/// The shim's real address. Set at most once; later attempts are ignored.
#[derive(Debug, Clone, Default)]
pub struct PeerAddr(Arc<OnceLock<SocketAddr>>);

impl PeerAddr {
    pub fn resolved(addr: SocketAddr) -> Self {
        let peer = Self::default();
        peer.learn(addr);
        peer
    }

    pub fn get(&self) -> Option<SocketAddr> {
        self.0.get().copied()
    }

    /// Record `addr` if no address is known yet. Returns `true` only for the
    /// call that actually set it.
    pub fn learn(&self, addr: SocketAddr) -> bool {
        self.0.set(addr).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Network half of an endpoint: what the relay needs.
#[derive(Debug, Clone)]
pub struct Link {
    pub role: Role,
    pub socket: Arc<UdpSocket>,
    pub peer: PeerAddr,
}

/// Process half of an endpoint: what the event multiplexer needs.
#[derive(Debug)]
pub struct ProcessIo {
    pub role: Role,
    pub child: Child,
    pub stdout: BufReader<ChildStdout>,
    pub stderr: BufReader<ChildStderr>,
}

/// A running shim and its relay socket, created fresh for every test case.
#[derive(Debug)]
pub struct Endpoint {
    link: Link,
    io: ProcessIo,
}

impl Endpoint {
    pub fn split(self) -> (Link, ProcessIo) {
        (self.link, self.io)
    }

    /// Stop the shim and reap it. Used when a case is abandoned before its
    /// run loop starts.
    pub async fn shutdown(mut self) {
        terminate_child(self.io.role, &mut self.io.child).await;
    }
}

/// Bind an ephemeral relay socket on `host`.
///
/// An IP literal is bound directly; `::` asks for a dual-stack socket and
/// falls back to `0.0.0.0` on hosts without IPv6. Anything else is resolved
/// as a host name.
async fn bind_relay_socket(host: &str) -> Result<(UdpSocket, SocketAddr), HarnessError> {
    let socket = match host.parse::<IpAddr>() {
        Ok(ip) => match bind_ip(SocketAddr::new(ip, 0)).await {
            Err(e) if ip == IpAddr::V6(Ipv6Addr::UNSPECIFIED) => {
                warn!(error = %e, "IPv6 relay bind failed, falling back to IPv4");
                bind_ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?
            }
            bound => bound?,
        },
        Err(_) => {
            let addr = format!("{}:0", host);
            UdpSocket::bind(&addr)
                .await
                .map_err(|source| HarnessError::Bind { addr, source })?
        }
    };
    let local = socket.local_addr().map_err(HarnessError::LocalAddr)?;
    Ok((socket, local))
}

async fn bind_ip(addr: SocketAddr) -> Result<UdpSocket, HarnessError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| HarnessError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn host_port(host: &str, port: u16) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(ip) => SocketAddr::new(IpAddr::V6(ip), port).to_string(),
        Err(_) => format!("{}:{}", host, port),
    }
}

/// Launch a shim with its fixed args, the case args, and `-addr`.
fn spawn_shim(
    role: Role,
    implementation: &Implementation,
    case_args: &[String],
    addr_arg: &str,
) -> Result<ProcessIo, HarnessError> {
    debug!(
        %role,
        path = %implementation.path.display(),
        args = ?implementation.args,
        case_args = ?case_args,
        addr = addr_arg,
        "spawning shim"
    );

    let mut child = Command::new(&implementation.path)
        .args(&implementation.args)
        .args(case_args)
        .arg("-addr")
        .arg(addr_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HarnessError::Spawn {
            role,
            path: implementation.path.clone(),
            source,
        })?;

    let stdout = child.stdout.take().ok_or(HarnessError::StreamAttach {
        role,
        stream: "stdout",
    })?;
    let stderr = child.stderr.take().ok_or(HarnessError::StreamAttach {
        role,
        stream: "stderr",
    })?;

    info!(%role, pid = child.id(), "shim started");

    Ok(ProcessIo {
        role,
        child,
        stdout: BufReader::new(stdout),
        stderr: BufReader::new(stderr),
    })
}

/// Gracefully terminate a shim that may still be running, then reap it.
///
/// Sends SIGTERM first, waits up to [`TERMINATE_GRACE`], then kills.
pub(crate) async fn terminate_child(role: Role, child: &mut Child) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(%role, exit_code = status.code(), "shim already exited");
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` belongs to a child we have not reaped yet.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%role, exit_code = status.code(), "shim exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(%role, error = %e, "error waiting for shim after SIGTERM");
        }
        Err(_) => {
            warn!(%role, "shim did not exit after SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(%role, error = %e, "failed to kill shim");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
