//! Bidirectional byte relay between a local stream and a tunnel stream

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// local → remote
    pub bytes_up: u64,
    /// remote → local
    pub bytes_down: u64,
}

/// Errors that mean the peer simply went away
pub fn is_normal_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Copy both directions concurrently until each source is exhausted.
///
/// Each direction shuts down its destination's write half when it ends.
/// Every chunk is added to `transferred` as it is written. Abrupt peer
/// closes count as a normal end; any other I/O error is returned.
pub async fn relay<L, R>(local: L, remote: R, transferred: &AtomicU64) -> io::Result<RelayStats>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
    R: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let ((bytes_up, up), (bytes_down, down)) = tokio::join!(
        copy_counted(&mut local_read, &mut remote_write, transferred),
        copy_counted(&mut remote_read, &mut local_write, transferred),
    );

    for result in [up, down] {
        if let Err(e) = result {
            if !is_normal_close(&e) {
                return Err(e);
            }
        }
    }

    Ok(RelayStats {
        bytes_up,
        bytes_down,
    })
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    transferred: &AtomicU64,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let result = pump(reader, writer, transferred, &mut total).await;

    // Half-close so the other side sees EOF
    let shutdown = writer.shutdown().await;

    match (result, shutdown) {
        (Err(e), _) => (total, Err(e)),
        (Ok(()), Err(e)) if !is_normal_close(&e) => (total, Err(e)),
        _ => (total, Ok(())),
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    transferred: &AtomicU64,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
        transferred.fetch_add(n as u64, Ordering::Relaxed);
    }
}
