use std::io;
use std::sync::Arc;

use tap_cache::BodyCache;
use tap_core::{parse_forward_target, ProxyEngine};
use tap_http::{
    encode_body_chunk, encode_body_end, header_value, rewrite_request_line, BodyPart, BodyReader,
    BufferedConn, HttpHeader, HttpRequestHead,
};
use tap_observe::{header_map, RecordSink, RequestRecord};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::recorder::ExchangeRecorder;
use crate::{dial_upstream, glue, write_bad_request};

const REPLAY_CHUNK_SIZE: usize = 4 * 1024;

/// Plain forward proxying. The upstream dial runs concurrently with request
/// body intake: payload bytes received first spool into the capture file, and
/// once the dial lands they are replayed upstream in arrival order behind the
/// origin-form head.
pub(crate) async fn run<S>(
    engine: Arc<ProxyEngine<S>>,
    flow_id: u64,
    mut conn: BufferedConn<TcpStream>,
    head: HttpRequestHead,
) -> io::Result<()>
where
    S: RecordSink + 'static,
{
    let target = match parse_forward_target(&head.target, header_value(&head.headers, "host")) {
        Ok(target) => target,
        Err(error) => {
            warn!(flow_id, code = error.code(), "rejecting forward request");
            return write_bad_request(&mut conn.stream).await;
        }
    };

    let cache = match BodyCache::create(&engine.config.capture_dir).await {
        Ok(cache) => cache,
        Err(error) => {
            warn!(flow_id, %error, "body capture unavailable");
            return write_bad_request(&mut conn.stream).await;
        }
    };
    let (mut request_body, response_body) = cache.into_parts();

    let request_record = RequestRecord {
        url: target.url.clone(),
        method: head.method.clone(),
        headers: header_map(
            head.headers
                .iter()
                .map(|header| (header.name.as_str(), header.value.as_str())),
        ),
        body: None,
    };

    let body_mode = head.body_mode;
    let mut reader = BodyReader::new(body_mode);
    let mut request_complete = reader.is_done();
    let mut trailers: Vec<HttpHeader> = Vec::new();

    let dial = dial_upstream(
        &target.host,
        target.port,
        engine.config.upstream_connect_timeout(),
    );
    tokio::pin!(dial);

    let mut upstream = loop {
        if request_complete {
            match dial.as_mut().await {
                Ok(stream) => break stream,
                Err(error) => {
                    warn!(flow_id, host = %target.host, %error, "upstream dial failed");
                    return write_bad_request(&mut conn.stream).await;
                }
            }
        }
        tokio::select! {
            result = dial.as_mut() => match result {
                Ok(stream) => break stream,
                Err(error) => {
                    warn!(flow_id, host = %target.host, %error, "upstream dial failed");
                    return write_bad_request(&mut conn.stream).await;
                }
            },
            part = reader.next_part(&mut conn) => match part {
                Ok(BodyPart::Chunk(bytes)) => request_body.append(&bytes).await?,
                Ok(BodyPart::End { trailers: received }) => {
                    trailers = received;
                    request_complete = true;
                }
                Err(error) => {
                    debug!(flow_id, %error, "request body aborted before upstream connected");
                    return Ok(());
                }
            },
        }
    };

    info!(flow_id, host = %target.host, port = target.port, "upstream connected");
    upstream
        .write_all(&rewrite_request_line(&head, &target.origin_form))
        .await?;

    if request_body.has_data() {
        request_body.flush().await?;
        let mut replay = File::open(request_body.path()).await?;
        let mut buffer = [0_u8; REPLAY_CHUNK_SIZE];
        loop {
            let read = replay.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            upstream
                .write_all(&encode_body_chunk(body_mode, &buffer[..read]))
                .await?;
        }
    }
    if request_complete {
        upstream
            .write_all(&encode_body_end(body_mode, &trailers))
            .await?;
    }

    let publish_engine = Arc::clone(&engine);
    let mut recorder = ExchangeRecorder::new(
        flow_id,
        request_record,
        request_body.path().to_path_buf(),
        response_body,
        engine.config.max_head_bytes,
        Box::new(move |record| publish_engine.publish_record(record)),
    );

    let (client_stream, leftover) = conn.into_parts();
    let (client_read, mut client_write) = client_stream.into_split();
    let mut client_conn = BufferedConn::from_parts(client_read, leftover);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let request_direction = async {
        let mut sent = 0_u64;
        if !request_complete {
            loop {
                match reader.next_part(&mut client_conn).await? {
                    BodyPart::Chunk(bytes) => {
                        request_body.append(&bytes).await?;
                        upstream_write
                            .write_all(&encode_body_chunk(body_mode, &bytes))
                            .await?;
                        sent += bytes.len() as u64;
                    }
                    BodyPart::End { trailers } => {
                        upstream_write
                            .write_all(&encode_body_end(body_mode, &trailers))
                            .await?;
                        break;
                    }
                }
            }
        }
        let relayed = glue::relay_raw(&mut client_conn, &mut upstream_write).await?;
        Ok::<u64, io::Error>(sent + relayed)
    };
    let response_direction =
        glue::relay_response(&mut upstream_read, &mut client_write, Some(&mut recorder));

    match tokio::try_join!(request_direction, response_direction) {
        Ok((from_client, from_server)) => {
            info!(
                flow_id,
                bytes_from_client = from_client,
                bytes_from_server = from_server,
                "forward exchange closed"
            );
        }
        Err(error) => {
            debug!(flow_id, %error, "forward exchange closed with error");
        }
    }
    Ok(())
}
