//! Newline-delimited stdio transport.
//!
//! Each input line is handled on the blocking pool so pipelines never block the
//! reader. Responses go through one channel to a single writer task, which keeps
//! output lines whole.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::mcp::server::ToolServer;

const RESPONSE_QUEUE: usize = 64;

/// Serve requests until `reader` reaches EOF or `shutdown` resolves.
///
/// On EOF in-flight requests run to completion. On shutdown they are cancelled
/// first. Either way every pending response is written before returning.
pub async fn serve<R, W, F>(
    server: Arc<ToolServer>,
    reader: R,
    writer: W,
    shutdown: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (tx, rx) = mpsc::channel::<String>(RESPONSE_QUEUE);
    let writer_task = tokio::spawn(write_responses(writer, rx));
    let mut lines = BufReader::new(reader).lines();
    let mut handlers: JoinSet<()> = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read request line")? else {
                    debug!("input closed");
                    break;
                };
                let server = Arc::clone(&server);
                let tx = tx.clone();
                handlers.spawn_blocking(move || {
                    if let Some(response) = server.handle_line(&line)
                        && tx.blocking_send(response).is_err()
                    {
                        warn!("response dropped; writer has stopped");
                    }
                });
            }
            () = &mut shutdown => {
                info!("interrupt received; cancelling in-flight requests");
                server.cancel_all();
                break;
            }
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                log_join(joined);
            }
        }
    }

    while let Some(joined) = handlers.join_next().await {
        log_join(joined);
    }
    drop(tx);
    writer_task.await.context("join response writer")?
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("write response")?;
        writer.flush().await.context("flush response")?;
    }
    writer.shutdown().await.context("close output")?;
    Ok(())
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        warn!(err = %err, "request handler panicked");
    }
}
