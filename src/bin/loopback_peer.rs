//! Reference shim for exercising the harness.
//!
//! Implements the endpoint invocation contract: takes `-addr host:port`,
//! and in server mode announces its real port on the first stdout line.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "loopback-peer", about = "Reference client/server shim for shimrunner", version)]
struct Cli {
    /// Address of the harness relay socket
    #[arg(long, global = true)]
    addr: Option<String>,

    /// How long to wait for a datagram, in milliseconds
    #[arg(long, global = true, default_value = "5000")]
    wait_ms: u64,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Send one datagram and check the reply
    Client {
        #[arg(long, default_value = "PING")]
        send: String,
        #[arg(long, default_value = "PONG")]
        expect: String,
    },

    /// Announce a port, answer one datagram, and exit
    Server {
        #[arg(long, default_value = "PING")]
        expect: String,
        #[arg(long, default_value = "PONG")]
        reply: String,
        /// Exit right after announcing, with this code
        #[arg(long)]
        exit_code: Option<u8>,
        /// Announce this text instead of the port
        #[arg(long)]
        announce: Option<String>,
    },
}

/// Accept the Go-style single-dash `-addr` the harness passes.
fn normalize_args(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|a| if a == "-addr" { "--addr".to_string() } else { a })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_from(normalize_args(std::env::args()));
    let wait = Duration::from_millis(cli.wait_ms);

    let result = match cli.role {
        Role::Client { send, expect } => run_client(cli.addr.as_deref(), &send, &expect, wait).await,
        Role::Server {
            expect,
            reply,
            exit_code,
            announce,
        } => run_server(&expect, &reply, exit_code, announce, wait).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("loopback-peer: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_client(addr: Option<&str>, send: &str, expect: &str, wait: Duration) -> Result<ExitCode> {
    let Some(addr) = addr else {
        bail!("client requires -addr");
    };
    let socket = UdpSocket::bind("127.0.0.1:0").await.context("bind client socket")?;
    socket.connect(addr).await.with_context(|| format!("connect to {}", addr))?;

    socket.send(send.as_bytes()).await.context("send")?;
    debug!(addr, payload = send, "sent");

    let mut buf = [0u8; 65535];
    let len = tokio::time::timeout(wait, socket.recv(&mut buf))
        .await
        .context("timed out waiting for reply")?
        .context("recv")?;
    let got = String::from_utf8_lossy(&buf[..len]);
    println!("received {}", got);

    Ok(if got == expect {
        ExitCode::SUCCESS
    } else {
        eprintln!("expected {:?}, got {:?}", expect, got);
        ExitCode::FAILURE
    })
}

async fn run_server(
    expect: &str,
    reply: &str,
    exit_code: Option<u8>,
    announce: Option<String>,
    wait: Duration,
) -> Result<ExitCode> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.context("bind server socket")?;
    let port = socket.local_addr().context("local address")?.port();

    println!("{}", announce.unwrap_or_else(|| port.to_string()));

    if let Some(code) = exit_code {
        info!(code, "exiting without traffic");
        return Ok(ExitCode::from(code));
    }

    let mut buf = [0u8; 65535];
    let (len, from) = tokio::time::timeout(wait, socket.recv_from(&mut buf))
        .await
        .context("timed out waiting for datagram")?
        .context("recv_from")?;
    let got = String::from_utf8_lossy(&buf[..len]).into_owned();
    println!("received {} from {}", got, from);

    socket.send_to(reply.as_bytes(), from).await.context("send reply")?;

    Ok(if got == expect {
        ExitCode::SUCCESS
    } else {
        eprintln!("expected {:?}, got {:?}", expect, got);
        ExitCode::FAILURE
    })
}
