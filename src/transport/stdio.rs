//! Stdio transport for the flow bridge.
//!
//! Reads one JSON message per line from stdin and writes one JSON event per
//! line to stdout. Messages are handled concurrently; events are written in
//! the order the node emits them.

use crate::error::{BridgeError, BridgeResult};
use crate::models::{FlowMessage, NodeEvent};
use crate::node::QueryNode;
use crate::transport::Transport;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Stdio transport implementation.
pub struct StdioTransport {
    node: Arc<QueryNode>,
    events: Mutex<Option<UnboundedReceiver<NodeEvent>>>,
}

impl StdioTransport {
    /// Create a new stdio transport.
    ///
    /// # Arguments
    ///
    /// * `node` - Node handling every inbound message
    /// * `events` - Receiving half of the node's event channel
    pub fn new(node: Arc<QueryNode>, events: UnboundedReceiver<NodeEvent>) -> Self {
        Self {
            node,
            events: Mutex::new(Some(events)),
        }
    }

    /// Serve messages from `reader` until it is exhausted or `shutdown`
    /// resolves, then wait for in-flight messages and close the node.
    ///
    /// Returns `true` when `shutdown` ended the loop.
    pub async fn serve<R, W, S>(&self, reader: R, mut writer: W, shutdown: S) -> BridgeResult<bool>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| BridgeError::internal("Transport is already running"))?;

        let mut lines = reader.lines();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut shutdown_requested = false;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.dispatch(&line, &mut tasks),
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read input");
                        break;
                    }
                },
                Some(event) = events.recv() => write_event(&mut writer, &event).await?,
                Some(joined) = tasks.join_next() => log_join(joined),
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    shutdown_requested = true;
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight messages");
        }
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_join(joined),
                    None => break,
                },
                Some(event) = events.recv() => write_event(&mut writer, &event).await?,
            }
        }

        // Shutdown failures are logged by the node and do not stop the host.
        let _ = self.node.close().await;

        while let Ok(event) = events.try_recv() {
            write_event(&mut writer, &event).await?;
        }

        Ok(shutdown_requested)
    }

    fn dispatch(&self, line: &str, tasks: &mut JoinSet<()>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let parsed = serde_json::from_str::<JsonValue>(line)
            .map_err(|e| BridgeError::message(format!("Invalid JSON: {}", e)))
            .and_then(FlowMessage::try_from);

        match parsed {
            Ok(msg) => {
                let node = Arc::clone(&self.node);
                tasks.spawn(async move { node.handle(msg).await });
            }
            Err(e) => warn!(error = %e, "Skipping malformed message"),
        }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> BridgeResult<()> {
        info!("Starting flow bridge with stdio transport");

        let reader = BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();

        let shutdown = async {
            wait_for_signal().await;
            info!("Send the signal again to force exit");
            tokio::spawn(async {
                wait_for_signal().await;
                warn!("Received second signal, forcing immediate exit");
                std::process::exit(1);
            });
        };

        let shutdown_requested = self.serve(reader, writer, shutdown).await?;

        if shutdown_requested {
            // stdin reads cannot be interrupted, so the runtime would hang on exit
            info!("Exiting process");
            std::process::exit(0);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &NodeEvent) -> BridgeResult<()> {
    let mut line = serde_json::to_vec(event)
        .map_err(|e| BridgeError::internal(format!("Failed to encode event: {}", e)))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| BridgeError::internal(format!("Failed to write event: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::internal(format!("Failed to flush output: {}", e)))
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    match joined {
        Ok(()) => debug!("Message handled"),
        Err(e) => warn!(error = %e, "Message task failed"),
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
