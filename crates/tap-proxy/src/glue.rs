use std::io;

use tap_http::{BufferedConn, IO_CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::recorder::ExchangeRecorder;

/// Forwards bytes until EOF, buffered leftovers first, then half-closes the
/// sink so the peer can drain its remaining response bytes.
pub(crate) async fn relay_raw<R, W>(conn: &mut BufferedConn<R>, sink: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;

    let leftover = conn.take_buffered();
    if !leftover.is_empty() {
        sink.write_all(&leftover).await?;
        total += leftover.len() as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        sink.write_all(&chunk[..read]).await?;
        total += read as u64;
    }

    shutdown_quietly(sink).await?;
    Ok(total)
}

/// The upstream→client direction: relays bytes verbatim, feeding each run to
/// the recorder when capture is enabled. Upstream EOF half-closes the client
/// write side after the recorder has seen end-of-stream.
pub(crate) async fn relay_response<R, W>(
    upstream: &mut R,
    client: &mut W,
    mut recorder: Option<&mut ExchangeRecorder>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = upstream.read(&mut chunk).await?;
        if read == 0 {
            if let Some(recorder) = recorder.as_deref_mut() {
                recorder.finish().await;
            }
            shutdown_quietly(client).await?;
            return Ok(total);
        }
        client.write_all(&chunk[..read]).await?;
        if let Some(recorder) = recorder.as_deref_mut() {
            recorder.observe(&chunk[..read]).await;
        }
        total += read as u64;
    }
}

/// Opaque splice for an established tunnel: both directions relayed with
/// half-close propagation, no capture. Returns bytes moved per direction.
pub(crate) async fn splice(client: TcpStream, upstream: TcpStream) -> io::Result<(u64, u64)> {
    let (client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let mut client_conn = BufferedConn::new(client_read);

    tokio::try_join!(
        relay_raw(&mut client_conn, &mut upstream_write),
        relay_response(&mut upstream_read, &mut client_write, None),
    )
}

/// Half-closes a write side, swallowing the error kinds a peer that has
/// already gone away produces.
pub(crate) async fn shutdown_quietly<W>(sink: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match sink.shutdown().await {
        Ok(()) => Ok(()),
        Err(error) if benign_shutdown_error(&error) => Ok(()),
        Err(error) => Err(error),
    }
}

fn benign_shutdown_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
