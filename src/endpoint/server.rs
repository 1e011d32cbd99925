use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};

use super::{
    bind_relay_socket, host_port, spawn_shim, terminate_child, Endpoint, HarnessError, Link,
    PeerAddr, ProcessIo, Role,
};
use crate::config::{HarnessOptions, Implementation};

impl Endpoint {
    /// Start the server shim and wait for it to announce its listening port.
    ///
    /// The first stdout line must be the port as plain decimal digits. The
    /// peer becomes `<advertise_host>:<port>`. If the announcement is missing
    /// or malformed the shim is stopped before the error is returned.
    pub async fn server(
        implementation: &Implementation,
        case_args: &[String],
        options: &HarnessOptions,
    ) -> Result<Self, HarnessError> {
        let (socket, local) = bind_relay_socket(&options.bind_host).await?;
        let addr_arg = host_port(&options.advertise_host, local.port());
        debug!(relay = %local, "server relay socket bound");

        let mut io = spawn_shim(Role::Server, implementation, case_args, &addr_arg)?;

        let peer = match discover_server_peer(&mut io, local, options).await {
            Ok(peer) => peer,
            Err(e) => {
                terminate_child(Role::Server, &mut io.child).await;
                return Err(e);
            }
        };
        info!(%peer, "server announced its port");

        Ok(Self {
            link: Link {
                role: Role::Server,
                socket: Arc::new(socket),
                peer: PeerAddr::resolved(peer),
            },
            io,
        })
    }
}

async fn discover_server_peer(
    io: &mut ProcessIo,
    local: SocketAddr,
    options: &HarnessOptions,
) -> Result<SocketAddr, HarnessError> {
    let mut line = String::new();
    let read = tokio::time::timeout(options.startup_timeout, io.stdout.read_line(&mut line))
        .await
        .map_err(|_| HarnessError::StartupTimeout {
            timeout: options.startup_timeout,
        })?
        .map_err(HarnessError::PortAnnouncement)?;
    if read == 0 {
        return Err(HarnessError::AnnouncementClosed);
    }

    let announced = line.trim();
    debug!(line = announced, "read server port");
    let port = parse_port(announced)?;
    resolve_peer(&options.advertise_host, port, local).await
}

fn parse_port(line: &str) -> Result<u16, HarnessError> {
    let digits = !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit());
    match line.parse::<u16>() {
        Ok(port) if digits && port != 0 => Ok(port),
        _ => Err(HarnessError::InvalidPort {
            line: line.to_string(),
        }),
    }
}

/// Resolve `host:port` to an address the relay socket bound at `local` can
/// send to. IPv4 results win; on an IPv6 relay socket they are used in their
/// IPv4-mapped form.
async fn resolve_peer(host: &str, port: u16, local: SocketAddr) -> Result<SocketAddr, HarnessError> {
    let target = host_port(host, port);
    let mut candidates: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| HarnessError::ResolvePeer {
            target: target.clone(),
            reason: e.to_string(),
        })?
        .collect();
    candidates.sort_by_key(|a| !a.is_ipv4());

    candidates
        .into_iter()
        .find_map(|a| reachable_from(local, a))
        .ok_or_else(|| HarnessError::ResolvePeer {
            target,
            reason: format!("no address reachable from relay socket {}", local),
        })
}

fn reachable_from(local: SocketAddr, addr: SocketAddr) -> Option<SocketAddr> {
    match (local, addr) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) | (SocketAddr::V6(_), SocketAddr::V6(_)) => {
            Some(addr)
        }
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => Some(SocketAddr::new(
            IpAddr::V6(v4.ip().to_ipv6_mapped()),
            v4.port(),
        )),
        (SocketAddr::V4(_), SocketAddr::V6(_)) => None,
    }
}
