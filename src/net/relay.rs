//! Full-duplex byte relay between a hijacked client connection and a
//! backend connection.
//!
//! # Data Flow
//! ```text
//! client ──read──▶ (inline, caller's task) ──write──▶ backend
//! client ◀─write── (spawned task)          ◀──read── backend
//! ```
//!
//! Bytes are copied opaquely; by the time a relay starts both legs are raw
//! post-HTTP streams. Read and write errors end a direction exactly like EOF.

use serde::{Deserialize, Serialize};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// What to do with the tunnel once one direction has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolicy {
    /// Tear down both legs as soon as either direction ends. In-flight data in
    /// the other direction may be cut off.
    #[default]
    CloseOnFirst,
    /// Propagate EOF as a write shutdown and wait for both directions to end.
    HalfClose,
}

/// Bytes moved in each direction.
///
/// A direction reports `None` when it was torn down before reaching EOF or
/// an error, which only happens under [`RelayPolicy::CloseOnFirst`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: Option<u64>,
    pub backend_to_client: Option<u64>,
}

/// Relay bytes between `client` and `backend` until the policy says stop.
///
/// Both streams are owned by the relay and are closed when it returns.
pub async fn relay<C, B>(client: C, backend: B, policy: RelayPolicy) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_rd, mut client_wr) = io::split(client);
    let (mut backend_rd, mut backend_wr) = io::split(backend);

    let mut reverse = tokio::spawn(async move {
        let copied = copy_then_shutdown(&mut backend_rd, &mut client_wr).await;
        tracing::trace!(bytes = copied, "backend → client finished");
        copied
    });

    let forward = async {
        let copied = copy_then_shutdown(&mut client_rd, &mut backend_wr).await;
        tracing::trace!(bytes = copied, "client → backend finished");
        copied
    };

    match policy {
        RelayPolicy::CloseOnFirst => {
            tokio::select! {
                up = forward => {
                    reverse.abort();
                    RelayStats { client_to_backend: Some(up), backend_to_client: None }
                }
                down = &mut reverse => RelayStats {
                    client_to_backend: None,
                    backend_to_client: down.ok(),
                },
            }
        }
        RelayPolicy::HalfClose => {
            let up = forward.await;
            let down = reverse.await.ok();
            RelayStats {
                client_to_backend: Some(up),
                backend_to_client: down,
            }
        }
    }
}

/// Copy until EOF or the first I/O error, then shut down `writer`.
///
/// Returns the bytes delivered to `writer`, including those moved before an
/// error ended the direction.
async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, bytes = copied, "relay read ended with I/O error");
                break;
            }
        };
        if let Err(e) = write_chunk(writer, &buf[..n]).await {
            tracing::debug!(error = %e, bytes = copied, "relay write ended with I/O error");
            break;
        }
        copied += n as u64;
    }
    let _ = writer.shutdown().await;
    copied
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}
