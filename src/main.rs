//! `acp-multiplex` binary: wire the broker to the real world.
//!
//! Usage: `acp-multiplex <agent-cmd> [agent-args…]`. The agent argv is passed
//! through untouched, so the multiplexer can be dropped in wherever the agent
//! binary itself would be launched. Our stdio carries the primary client; the
//! Unix socket announced on stderr carries everyone else.

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use acp_multiplex::acceptor::{self, SocketAcceptor};
use acp_multiplex::agent::AgentChannel;
use acp_multiplex::broker::{Broker, BrokerEvent, BrokerExit};
use acp_multiplex::registry::{self, ClientId};

/// Multiplex one ACP agent across several clients.
///
/// Spawns the agent with the given argv, speaks ACP to it over stdio, and
/// re-exposes the session on this process's stdio plus a Unix socket that
/// additional clients can join mid-session.
#[derive(Parser, Debug)]
#[command(name = "acp-multiplex", version, about)]
struct Cli {
    /// Agent command to spawn.
    agent_cmd: String,

    /// Arguments passed to the agent untouched.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    agent_args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Respect RUST_LOG; diagnostics go to stderr, stdout belongs to the
    // primary client's JSON-RPC stream.
    env_logger::Builder::from_default_env().init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("acp-multiplex: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let (events_tx, events_rx) = mpsc::unbounded_channel::<BrokerEvent>();

    let agent = AgentChannel::spawn(&cli.agent_cmd, &cli.agent_args, events_tx.clone())
        .with_context(|| format!("failed to spawn agent `{}`", cli.agent_cmd))?;

    let socket_path = acceptor::default_socket_path();
    let acceptor = SocketAcceptor::bind(socket_path.clone())
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    // Contractual announcement: observer tooling scans stderr for the
    // `socket ` token to find the session.
    eprintln!("listening on socket {}", socket_path.display());
    let accept_task = tokio::spawn(acceptor.run(events_tx.clone()));

    // The primary client rides our own stdio.
    let queue = registry::spawn_client_io(
        ClientId::Primary,
        tokio::io::stdin(),
        tokio::io::stdout(),
        events_tx.clone(),
    );
    let _ = events_tx.send(BrokerEvent::ClientAttached {
        client: ClientId::Primary,
        queue,
    });

    spawn_signal_listener(events_tx.clone())?;

    let exit = Broker::new(events_rx, agent.sender()).run().await;

    accept_task.abort();
    let _ = std::fs::remove_file(&socket_path);
    agent.shutdown().await;

    Ok(match exit {
        BrokerExit::AgentExited { code } => {
            eprintln!("acp-multiplex: agent exited with code {code}");
            code
        }
        BrokerExit::Signalled { signal } => 128 + signal,
    })
}

/// Turn SIGINT/SIGTERM into a broker shutdown event.
fn spawn_signal_listener(events: mpsc::UnboundedSender<BrokerEvent>) -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        let signal = tokio::select! {
            _ = sigint.recv() => SignalKind::interrupt().as_raw_value(),
            _ = sigterm.recv() => SignalKind::terminate().as_raw_value(),
        };
        let _ = events.send(BrokerEvent::Shutdown { signal });
    });
    Ok(())
}
