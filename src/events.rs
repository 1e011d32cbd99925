//! Per-endpoint event multiplexer.
//!
//! Three producers feed one channel per endpoint: a line reader for stdout,
//! one for stderr, and a waiter for the process exit. The orchestrator only
//! ever sees [`EndpointEvent`]s and never touches the pipes or the child.
//! Lines from the same stream arrive in program order; nothing else is
//! ordered.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::endpoint::{terminate_child, ProcessIo, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSource::Stdout => write!(f, "stdout"),
            OutputSource::Stderr => write!(f, "stderr"),
        }
    }
}

/// How a shim process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Failure(String),
}

impl TerminalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalStatus::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TerminalStatus::Success => None,
            TerminalStatus::Failure(e) => Some(e),
        }
    }

    fn from_wait(result: std::io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => TerminalStatus::Success,
            Ok(status) => TerminalStatus::Failure(status.to_string()),
            Err(e) => TerminalStatus::Failure(format!("wait failed: {}", e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    OutputLine { source: OutputSource, text: String },
    StreamClosed { source: OutputSource },
    ProcessExited { status: TerminalStatus },
}

/// Start the three producers for `io`. Returns the merged event stream and
/// the producer handles; every producer stops once `cancel` fires, and the
/// exit waiter stops and reaps the child if it is still running.
pub fn spawn(
    io: ProcessIo,
    cancel: CancellationToken,
) -> (mpsc::Receiver<EndpointEvent>, Vec<JoinHandle<()>>) {
    let ProcessIo {
        role,
        child,
        stdout,
        stderr,
    } = io;

    // Capacity 1: producers hand events over one at a time.
    let (tx, rx) = mpsc::channel(1);

    let handles = vec![
        tokio::spawn(read_lines(
            role,
            OutputSource::Stdout,
            stdout,
            tx.clone(),
            cancel.clone(),
        )),
        tokio::spawn(read_lines(
            role,
            OutputSource::Stderr,
            stderr,
            tx.clone(),
            cancel.clone(),
        )),
        tokio::spawn(wait_exit(role, child, tx, cancel)),
    ];

    (rx, handles)
}

/// Send unless cancelled. Returns `false` when the producer should stop.
async fn publish(
    tx: &mpsc::Sender<EndpointEvent>,
    event: EndpointEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Consecutive read errors tolerated on one output stream before the reader
/// stops reading and just holds the pipe open until cancellation.
const MAX_STREAM_READ_ERRORS: u32 = 16;

/// Forward each line of `reader` as an [`EndpointEvent::OutputLine`].
///
/// Lines are raw bytes converted lossily, so a shim writing non-UTF-8 output
/// is never cut off. The pipe stays open until EOF or cancellation; closing
/// it early would kill the shim with SIGPIPE on its next write.
async fn read_lines<R>(
    role: Role,
    source: OutputSource,
    mut reader: R,
    tx: mpsc::Sender<EndpointEvent>,
    cancel: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut errors = 0u32;
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                errors = 0;
                let event = EndpointEvent::OutputLine {
                    source,
                    text: String::from_utf8_lossy(&buf).trim().to_string(),
                };
                if !publish(&tx, event, &cancel).await {
                    return;
                }
            }
            Err(e) => {
                errors += 1;
                debug!(%role, %source, error = %e, errors, "output stream read failed");
                if errors >= MAX_STREAM_READ_ERRORS {
                    warn!(%role, %source, "output stream unreadable, holding it open");
                    cancel.cancelled().await;
                    return;
                }
            }
        }
    }

    debug!(%role, %source, "output stream closed");
    publish(&tx, EndpointEvent::StreamClosed { source }, &cancel).await;
}

async fn wait_exit(
    role: Role,
    mut child: Child,
    tx: mpsc::Sender<EndpointEvent>,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            terminate_child(role, &mut child).await;
            return;
        }
        result = child.wait() => result,
    };

    let status = TerminalStatus::from_wait(result);
    debug!(%role, status = ?status, "shim exited");

    if !publish(&tx, EndpointEvent::ProcessExited { status }, &cancel).await {
        // Receiver is gone; the child is already reaped.
        debug!(%role, "exit event not delivered");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> ProcessIo {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh");
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        ProcessIo {
            role: Role::Server,
            child,
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<EndpointEvent>) -> Vec<EndpointEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_merges_lines_closes_and_exit() {
        let io = spawn_sh("echo one; echo two; echo oops >&2; exit 0");
        let (rx, handles) = spawn(io, CancellationToken::new());
        let events = collect(rx).await;
        for h in handles {
            h.await.unwrap();
        }

        let stdout: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                EndpointEvent::OutputLine {
                    source: OutputSource::Stdout,
                    text,
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);

        assert!(events.contains(&EndpointEvent::OutputLine {
            source: OutputSource::Stderr,
            text: "oops".into()
        }));
        assert!(events.contains(&EndpointEvent::StreamClosed {
            source: OutputSource::Stdout
        }));
        assert!(events.contains(&EndpointEvent::StreamClosed {
            source: OutputSource::Stderr
        }));

        let exits: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, EndpointEvent::ProcessExited { .. }))
            .collect();
        assert_eq!(
            exits,
            vec![&EndpointEvent::ProcessExited {
                status: TerminalStatus::Success
            }]
        );
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_stream_open() {
        let io = spawn_sh(r"printf '\377\n'; sleep 0.2; echo after; exit 0");
        let (rx, _handles) = spawn(io, CancellationToken::new());
        let events = collect(rx).await;

        let stdout: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                EndpointEvent::OutputLine {
                    source: OutputSource::Stdout,
                    text,
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["\u{FFFD}", "after"]);
        assert!(events.contains(&EndpointEvent::ProcessExited {
            status: TerminalStatus::Success
        }));
    }

    #[tokio::test]
    async fn test_line_without_trailing_newline() {
        let io = spawn_sh("printf 'partial'");
        let (rx, _handles) = spawn(io, CancellationToken::new());
        let events = collect(rx).await;

        assert!(events.contains(&EndpointEvent::OutputLine {
            source: OutputSource::Stdout,
            text: "partial".into()
        }));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let io = spawn_sh("exit 3");
        let (rx, _handles) = spawn(io, CancellationToken::new());
        let events = collect(rx).await;

        let status = events
            .iter()
            .find_map(|e| match e {
                EndpointEvent::ProcessExited { status } => Some(status.clone()),
                _ => None,
            })
            .expect("exit event");
        assert!(!status.is_success());
        assert!(status.error().unwrap().contains('3'));
    }

    #[tokio::test]
    async fn test_cancel_stops_producers_and_reaps_child() {
        let io = spawn_sh("sleep 30");
        let cancel = CancellationToken::new();
        let (_rx, handles) = spawn(io, cancel.clone());

        cancel.cancel();
        let joined = tokio::time::timeout(
            Duration::from_secs(10),
            futures::future::join_all(handles),
        )
        .await
        .expect("producers should stop after cancellation");
        assert!(joined.iter().all(|r| r.is_ok()));
    }
}
