//! Per-case run loop.
//!
//! Wires a client and a server endpoint together (two relay directions, two
//! event multiplexers), then consumes events until a verdict is reached:
//!
//! * both shims exit cleanly: the case is over;
//! * either shim exits with an error: the case is over immediately;
//! * the case timeout elapses: the case is over and counts as failed.
//!
//! Output lines and stream closures are logged but never decide anything.
//! Once the loop returns, every task of the case is cancelled and joined and
//! both shims are reaped before [`run`] returns.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::HarnessOptions;
use crate::endpoint::{Endpoint, Role};
use crate::events::{self, EndpointEvent, TerminalStatus};
use crate::relay::{self, ReadRetry, RelayExit, RelayStats};

// ---------------------------------------------------------------------------
// CaseOutcome
// ---------------------------------------------------------------------------

/// What is known about each side when the run loop stops. A side whose
/// process had not exited yet has no status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaseOutcome {
    pub client: Option<TerminalStatus>,
    pub server: Option<TerminalStatus>,
    pub timed_out: bool,
}

impl CaseOutcome {
    /// A case passes only if both shims exited cleanly.
    pub fn passed(&self) -> bool {
        !self.timed_out
            && self.client.as_ref().is_some_and(TerminalStatus::is_success)
            && self.server.as_ref().is_some_and(TerminalStatus::is_success)
    }

    pub fn client_error(&self) -> Option<&str> {
        self.client.as_ref().and_then(TerminalStatus::error)
    }

    pub fn server_error(&self) -> Option<&str> {
        self.server.as_ref().and_then(TerminalStatus::error)
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Finished,
}

/// Decision state for one case: the terminal status of each side, set once.
#[derive(Debug, Default)]
pub struct RunState {
    client: Option<TerminalStatus>,
    server: Option<TerminalStatus>,
}

impl RunState {
    pub fn running(&self, role: Role) -> bool {
        self.side(role).is_none()
    }

    fn side(&self, role: Role) -> &Option<TerminalStatus> {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    fn side_mut(&mut self, role: Role) -> &mut Option<TerminalStatus> {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }

    pub fn apply(&mut self, role: Role, event: EndpointEvent) -> Step {
        match event {
            EndpointEvent::OutputLine { source, text } => {
                debug!(%role, %source, line = text.as_str(), "shim output");
                Step::Continue
            }
            EndpointEvent::StreamClosed { source } => {
                debug!(%role, %source, "shim output closed");
                Step::Continue
            }
            EndpointEvent::ProcessExited { status } => {
                let slot = self.side_mut(role);
                if slot.is_some() {
                    warn!(%role, "duplicate exit event ignored");
                    return Step::Continue;
                }
                let failed = !status.is_success();
                info!(%role, status = ?status, "shim exited");
                *slot = Some(status);

                if failed || (!self.running(Role::Client) && !self.running(Role::Server)) {
                    Step::Finished
                } else {
                    Step::Continue
                }
            }
        }
    }

    pub fn into_outcome(self, timed_out: bool) -> CaseOutcome {
        CaseOutcome {
            client: self.client,
            server: self.server,
            timed_out,
        }
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

/// Relay and supervise one client/server pair until a verdict is reached,
/// then tear everything down.
pub async fn run(client: Endpoint, server: Endpoint, options: &HarnessOptions) -> CaseOutcome {
    let cancel = CancellationToken::new();
    let retry = ReadRetry {
        backoff: options.read_error_backoff,
        max_consecutive: options.max_consecutive_read_errors,
    };

    let (client_link, client_io) = client.split();
    let (server_link, server_io) = server.split();

    debug!("shuttling");
    let relays: Vec<JoinHandle<(RelayStats, RelayExit)>> = vec![
        tokio::spawn(
            relay::shuttle(client_link.clone(), server_link.clone(), retry, cancel.clone())
                .in_current_span(),
        ),
        tokio::spawn(relay::shuttle(server_link, client_link, retry, cancel.clone()).in_current_span()),
    ];

    let (client_rx, mut producers) = events::spawn(client_io, cancel.clone());
    let (server_rx, server_producers) = events::spawn(server_io, cancel.clone());
    producers.extend(server_producers);

    let outcome = supervise(client_rx, server_rx, options.case_timeout).await;

    cancel.cancel();
    for (handle, direction) in relays.into_iter().zip(["client->server", "server->client"]) {
        match handle.await {
            Ok((stats, exit)) => debug!(
                direction,
                forwarded = stats.forwarded,
                bytes = stats.bytes,
                dropped = stats.dropped,
                exit = ?exit,
                "relay joined"
            ),
            Err(e) => warn!(direction, error = %e, "relay task failed"),
        }
    }
    for result in futures::future::join_all(producers).await {
        if let Err(e) = result {
            warn!(error = %e, "event producer failed");
        }
    }
    debug!("case torn down");

    outcome
}

/// Consume both event streams until the state machine finishes or the
/// timeout elapses.
async fn supervise(
    mut client_rx: mpsc::Receiver<EndpointEvent>,
    mut server_rx: mpsc::Receiver<EndpointEvent>,
    timeout: Option<Duration>,
) -> CaseOutcome {
    let mut state = RunState::default();
    let mut client_open = true;
    let mut server_open = true;

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let timed_out = loop {
        let (role, event) = tokio::select! {
            event = client_rx.recv(), if client_open => match event {
                Some(event) => (Role::Client, event),
                None => {
                    client_open = false;
                    continue;
                }
            },
            event = server_rx.recv(), if server_open => match event {
                Some(event) => (Role::Server, event),
                None => {
                    server_open = false;
                    continue;
                }
            },
            _ = &mut deadline, if client_open || server_open => {
                warn!(timeout = ?timeout, "case timed out");
                break true;
            }
            else => {
                warn!("event streams ended without a verdict");
                break false;
            }
        };

        if state.apply(role, event) == Step::Finished {
            break false;
        }
    };

    state.into_outcome(timed_out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
