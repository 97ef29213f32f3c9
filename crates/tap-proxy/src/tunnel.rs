use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tap_core::{parse_connect_target, ProxyEngine};
use tap_http::{BufferedConn, HttpRequestHead, IO_CHUNK_SIZE};
use tap_observe::RecordSink;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::{dial_upstream, glue, write_bad_request};

const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

/// CONNECT upgrade states. Raw bytes the client sends ahead of the upstream
/// connection are held in arrival order and drained as the first tunneled
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TunnelState {
    Idle,
    BeganConnecting,
    AwaitingEnd,
    AwaitingConnection { pending: Vec<Bytes> },
    UpgradeComplete { pending: Vec<Bytes> },
    UpgradeFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TunnelEvent {
    Head,
    End,
    Raw(Bytes),
    DialSucceeded,
    DialFailed,
}

/// What the connection task must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelStep {
    Continue,
    Glue,
    Reject,
}

pub(crate) fn advance(state: TunnelState, event: TunnelEvent) -> (TunnelState, TunnelStep) {
    match (state, event) {
        (TunnelState::Idle, TunnelEvent::Head) => {
            (TunnelState::BeganConnecting, TunnelStep::Continue)
        }
        (TunnelState::BeganConnecting, TunnelEvent::End) => (
            TunnelState::AwaitingConnection {
                pending: Vec::new(),
            },
            TunnelStep::Continue,
        ),
        (TunnelState::BeganConnecting, TunnelEvent::DialSucceeded) => {
            (TunnelState::AwaitingEnd, TunnelStep::Continue)
        }
        (TunnelState::AwaitingEnd, TunnelEvent::End) => (
            TunnelState::UpgradeComplete {
                pending: Vec::new(),
            },
            TunnelStep::Glue,
        ),
        (TunnelState::AwaitingConnection { mut pending }, TunnelEvent::Raw(bytes)) => {
            pending.push(bytes);
            (
                TunnelState::AwaitingConnection { pending },
                TunnelStep::Continue,
            )
        }
        (TunnelState::AwaitingConnection { pending }, TunnelEvent::DialSucceeded) => {
            (TunnelState::UpgradeComplete { pending }, TunnelStep::Glue)
        }
        (TunnelState::UpgradeComplete { mut pending }, TunnelEvent::Raw(bytes)) => {
            pending.push(bytes);
            (
                TunnelState::UpgradeComplete { pending },
                TunnelStep::Continue,
            )
        }
        (
            TunnelState::BeganConnecting | TunnelState::AwaitingConnection { .. },
            TunnelEvent::DialFailed,
        ) => (TunnelState::UpgradeFailed, TunnelStep::Reject),
        (TunnelState::UpgradeFailed, _) => (TunnelState::UpgradeFailed, TunnelStep::Continue),
        (_, _) => (TunnelState::UpgradeFailed, TunnelStep::Reject),
    }
}

/// Drives a CONNECT upgrade: dial the target, absorb any bytes the client
/// pushes early, then answer 200, drain those bytes upstream, and splice.
pub(crate) async fn run<S>(
    engine: Arc<ProxyEngine<S>>,
    flow_id: u64,
    mut conn: BufferedConn<TcpStream>,
    head: HttpRequestHead,
) -> io::Result<()>
where
    S: RecordSink + 'static,
{
    let target = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(error) => {
            warn!(flow_id, code = error.code(), "rejecting CONNECT request");
            return write_bad_request(&mut conn.stream).await;
        }
    };
    debug!(flow_id, url = %target.url(), "tunnel requested");

    let mut state = TunnelState::Idle;
    (state, _) = advance(state, TunnelEvent::Head);
    // A CONNECT head carries no body, so its terminator is the end marker.
    (state, _) = advance(state, TunnelEvent::End);
    let leftover = conn.take_buffered();
    if !leftover.is_empty() {
        (state, _) = advance(state, TunnelEvent::Raw(Bytes::from(leftover)));
    }

    let dial = dial_upstream(
        &target.host,
        target.port,
        engine.config.upstream_connect_timeout(),
    );
    tokio::pin!(dial);
    let mut chunk = [0_u8; IO_CHUNK_SIZE];

    let upstream = loop {
        tokio::select! {
            result = dial.as_mut() => {
                let event = if result.is_ok() {
                    TunnelEvent::DialSucceeded
                } else {
                    TunnelEvent::DialFailed
                };
                let step;
                (state, step) = advance(state, event);
                match (step, result) {
                    (TunnelStep::Glue, Ok(stream)) => break stream,
                    (_, Err(error)) => {
                        warn!(flow_id, host = %target.host, %error, "upstream dial failed");
                        return write_bad_request(&mut conn.stream).await;
                    }
                    (_, Ok(_)) => {
                        debug!(flow_id, "upgrade abandoned after dial");
                        return Ok(());
                    }
                }
            }
            read = conn.stream.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(flow_id, "client closed before upstream connected");
                    return Ok(());
                }
                Ok(read) => {
                    (state, _) = advance(
                        state,
                        TunnelEvent::Raw(Bytes::copy_from_slice(&chunk[..read])),
                    );
                }
                Err(error) => {
                    debug!(flow_id, %error, "client read failed before upstream connected");
                    return Ok(());
                }
            },
        }
    };

    let pending = match state {
        TunnelState::UpgradeComplete { pending } => pending,
        _ => Vec::new(),
    };

    conn.stream.write_all(ESTABLISHED_RESPONSE).await?;
    conn.stream.flush().await?;

    let mut upstream = upstream;
    for bytes in &pending {
        upstream.write_all(bytes).await?;
    }

    info!(flow_id, host = %target.host, port = target.port, "tunnel established");
    match glue::splice(conn.stream, upstream).await {
        Ok((from_client, from_server)) => {
            info!(
                flow_id,
                bytes_from_client = from_client,
                bytes_from_server = from_server,
                "tunnel closed"
            );
        }
        Err(error) => {
            debug!(flow_id, %error, "tunnel closed with error");
        }
    }
    Ok(())
}
