//! Agent channel: owns the agent subprocess and its stdio.
//!
//! The broker spawns the agent with the argv passed on our own command line
//! and speaks line-delimited JSON-RPC over its stdin/stdout. Four background
//! tasks do the work:
//!
//! - a **writer** draining the unbounded outbound queue to the child's stdin
//!   (one writer, so frames never interleave);
//! - a **reader** parsing framed lines off the child's stdout into broker
//!   events (malformed lines are logged and dropped, the stream survives);
//! - a **stderr pump** copying the agent's diagnostics through to ours;
//! - an **exit watcher** owning the child handle, reporting its exit status
//!   and handling the kill-with-grace shutdown path.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::broker::BrokerEvent;
use crate::framing::{self, LineReader};
use crate::jsonrpc::Envelope;

/// How long a shutting-down agent gets to exit on its own after its stdin
/// closes, before being killed.
const EXIT_GRACE: Duration = Duration::from_secs(3);

/// Handle to a running agent subprocess.
pub struct AgentChannel {
    outbound: mpsc::UnboundedSender<String>,
    kill: oneshot::Sender<()>,
    exited: oneshot::Receiver<i32>,
}

impl AgentChannel {
    /// Spawn the agent and wire its stdio to the broker's event stream.
    pub fn spawn(
        command: &str,
        args: &[String],
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> io::Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("agent stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("agent stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("agent stderr not captured"))?;

        log::info!("spawned agent: {command} {}", args.join(" "));

        // Writer: single consumer of the outbound queue, so writes to the
        // agent are serialized in enqueue order. Dropping every sender closes
        // the queue, which closes the agent's stdin.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = framing::write_line(&mut stdin, &line).await {
                    log::error!("write to agent failed: {e}");
                    break;
                }
            }
        });

        // Reader: framed lines off the agent's stdout.
        let reader_events = events.clone();
        tokio::spawn(async move {
            let mut lines = LineReader::new(stdout);
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match Envelope::from_line(&line) {
                        Ok(msg) => {
                            if reader_events.send(BrokerEvent::AgentMessage(msg)).is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("dropping malformed line from agent: {e}"),
                    },
                    Ok(None) => {
                        log::info!("agent closed stdout");
                        return;
                    }
                    Err(e) => {
                        log::error!("read from agent failed: {e}");
                        return;
                    }
                }
            }
        });

        // Stderr pump: the agent's diagnostics belong on our stderr.
        tokio::spawn(async move {
            let mut stderr = stderr;
            let mut ours = tokio::io::stderr();
            let _ = tokio::io::copy(&mut stderr, &mut ours).await;
        });

        // Exit watcher: owns the child. Reports the exit code, or on the
        // shutdown path waits out the grace period before killing.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = oneshot::channel::<i32>();
        tokio::spawn(async move {
            let early = tokio::select! {
                status = child.wait() => Some(exit_code(status)),
                _ = kill_rx => None,
            };
            let code = match early {
                Some(code) => code,
                // Shutdown requested: stdin is closing, give the agent a
                // grace period to exit before killing it.
                None => match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                    Ok(status) => exit_code(status),
                    Err(_) => {
                        log::warn!("agent did not exit within {EXIT_GRACE:?}, killing");
                        let _ = child.kill().await;
                        exit_code(child.wait().await)
                    }
                },
            };
            let _ = events.send(BrokerEvent::AgentExited { code });
            let _ = exited_tx.send(code);
        });

        Ok(Self {
            outbound: outbound_tx,
            kill: kill_tx,
            exited: exited_rx,
        })
    }

    /// A handle the broker uses to queue frames for the agent's stdin.
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// Close the agent's stdin, give it [`EXIT_GRACE`] to exit on its own,
    /// then kill it. Waits (bounded) for the process to be reaped.
    pub async fn shutdown(self) {
        let Self {
            outbound,
            kill,
            exited,
        } = self;
        drop(outbound);
        let _ = kill.send(());
        let _ = tokio::time::timeout(EXIT_GRACE + Duration::from_secs(2), exited).await;
    }
}

/// Map an exit status to the code we propagate: the child's own code, or the
/// conventional `128 + signal` when it died to a signal.
fn exit_code(status: io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
        Err(e) => {
            log::error!("failed to reap agent: {e}");
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
