//! Datagram shuttle between the two endpoints of a test case.
//!
//! One [`shuttle`] task runs per direction. Each reads from its source
//! endpoint's relay socket and forwards the bytes, unmodified, to the
//! destination endpoint's peer through the destination's relay socket. The
//! first datagram seen on a socket whose peer is still unknown teaches the
//! relay that peer (this is how the client's address is discovered).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::Link;

/// Largest datagram the relay will carry.
pub const MAX_UDP_PAYLOAD: usize = 65535;

/// Retry policy for failed socket reads.
#[derive(Debug, Clone, Copy)]
pub struct ReadRetry {
    pub backoff: Duration,
    pub max_consecutive: u32,
}

/// Counters for one direction, returned when it stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub bytes: u64,
    /// Datagrams that arrived before the destination peer was known.
    pub dropped: u64,
}

/// Why a direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    Cancelled,
    WriteFailed,
    ReadErrorLimit,
}

/// Forward datagrams from `from` to `to` until cancelled or the direction
/// fails.
///
/// Read errors are treated as transient: the loop backs off and retries,
/// giving up only after `retry.max_consecutive` failures in a row. A write
/// error ends the direction.
pub async fn shuttle(
    from: Link,
    to: Link,
    retry: ReadRetry,
    cancel: CancellationToken,
) -> (RelayStats, RelayExit) {
    let direction = format!("{}->{}", from.role, to.role);
    debug!(direction = direction.as_str(), "relay started");

    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let mut stats = RelayStats::default();
    let mut consecutive_errors: u32 = 0;

    let exit = loop {
        let received = tokio::select! {
            biased;

            _ = cancel.cancelled() => break RelayExit::Cancelled,
            result = from.socket.recv_from(&mut buf) => result,
        };

        let (len, sender) = match received {
            Ok(r) => {
                consecutive_errors = 0;
                r
            }
            Err(e) => {
                consecutive_errors += 1;
                debug!(
                    direction = direction.as_str(),
                    error = %e,
                    consecutive = consecutive_errors,
                    "recv_from error"
                );
                if consecutive_errors >= retry.max_consecutive {
                    warn!(
                        direction = direction.as_str(),
                        error = %e,
                        "giving up after repeated read errors"
                    );
                    break RelayExit::ReadErrorLimit;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break RelayExit::Cancelled,
                    _ = tokio::time::sleep(retry.backoff) => continue,
                }
            }
        };

        if from.peer.learn(sender) {
            info!(role = %from.role, peer = %sender, "learned peer address");
        }

        let Some(dest) = to.peer.get() else {
            stats.dropped += 1;
            debug!(
                direction = direction.as_str(),
                bytes = len,
                "destination peer unknown, dropping datagram"
            );
            continue;
        };

        debug!(direction = direction.as_str(), bytes = len, to = %dest, "forwarding datagram");

        let sent = tokio::select! {
            biased;

            _ = cancel.cancelled() => break RelayExit::Cancelled,
            result = to.socket.send_to(&buf[..len], dest) => result,
        };
        if let Err(e) = sent {
            debug!(direction = direction.as_str(), error = %e, "send_to failed, stopping direction");
            break RelayExit::WriteFailed;
        }

        stats.forwarded += 1;
        stats.bytes += len as u64;
    };

    debug!(
        direction = direction.as_str(),
        forwarded = stats.forwarded,
        bytes = stats.bytes,
        dropped = stats.dropped,
        exit = ?exit,
        "relay stopped"
    );
    (stats, exit)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
