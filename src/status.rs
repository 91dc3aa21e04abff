use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::collector::CollectorTable;
use crate::error::AgentError;

/// Concurrent status connections served at once. Anything beyond this
/// is dropped rather than queued behind the pipeline.
const MAX_CONNECTIONS: usize = 8;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind the status listener and serve until cancelled.
pub async fn run(
    listen: String,
    table: CollectorTable,
    cancel: CancellationToken,
) -> Result<(), AgentError> {
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| AgentError::Config(format!("status_listen {listen}: {e}")))?;
    tracing::info!(addr = %listen, "status server listening");
    serve(listener, table, cancel).await;
    Ok(())
}

/// Accept loop over an already-bound listener. Every connection gets a
/// fresh snapshot of the collector table as a JSON array.
pub async fn serve(listener: TcpListener, table: CollectorTable, cancel: CancellationToken) {
    let permits = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "status accept failed");
                        continue;
                    }
                };
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    // Over the connection cap; the client can retry.
                    continue;
                };
                let table = table.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = serve_one(stream, table).await {
                        tracing::debug!(%err, "status connection error");
                    }
                });
            }
        }
    }
}

async fn serve_one(mut stream: TcpStream, table: CollectorTable) -> std::io::Result<()> {
    // The response is the same for any request, so the request itself
    // is read only to be polite to the client.
    let mut request = [0u8; 1024];
    let _ = tokio::time::timeout(REQUEST_TIMEOUT, stream.read(&mut request)).await;

    let body = serde_json::to_vec(&table.snapshot()).map_err(std::io::Error::other)?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}
