//! The proxy server: accepts connections, classifies the first request as
//! plain-forward or CONNECT, and hands off to the matching engine.

mod forward;
mod glue;
mod recorder;
mod tunnel;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tap_core::{ProxyConfigError, ProxyEngine};
use tap_http::{parse_http_request_head, BufferedConn};
use tap_observe::{ExchangeRecord, RecordSink};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

pub struct ProxyServer<S>
where
    S: RecordSink + 'static,
{
    engine: Arc<ProxyEngine<S>>,
}

impl<S> ProxyServer<S>
where
    S: RecordSink + 'static,
{
    pub fn new(engine: ProxyEngine<S>) -> Result<Self, ProxyConfigError> {
        engine.config.validate()?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn engine(&self) -> &Arc<ProxyEngine<S>> {
        &self.engine
    }

    /// Completed-exchange records, delivered after each response finishes.
    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeRecord> {
        self.engine.subscribe()
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!(
            "{}:{}",
            self.engine.config.listen_addr, self.engine.config.listen_port
        );
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "proxy listening");
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                if let Err(error) = handle_client(engine, stream, client_addr).await {
                    debug!(client = %client_addr, %error, "connection handling failed");
                }
            });
        }
    }

    pub async fn run_until_shutdown(
        self,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> io::Result<()> {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        tokio::select! {
            result = self.run() => result,
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(_) => Ok(()),
                    Err(_) => Ok(()),
                }
            }
        }
    }
}

async fn handle_client<S>(
    engine: Arc<ProxyEngine<S>>,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()>
where
    S: RecordSink + 'static,
{
    let local_addr = stream.local_addr()?;
    let mut conn = BufferedConn::new(stream);

    let head_bytes = match conn
        .read_until(b"\r\n\r\n", engine.config.max_head_bytes)
        .await
    {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(()),
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
            debug!(client = %client_addr, "client closed before request head completed");
            return Ok(());
        }
        Err(error) => {
            warn!(client = %client_addr, %error, "unreadable request head");
            return write_bad_request(&mut conn.stream).await;
        }
    };

    let head = match parse_http_request_head(&head_bytes) {
        Ok(head) => head,
        Err(error) => {
            warn!(client = %client_addr, code = error.code(), "invalid first message");
            return write_bad_request(&mut conn.stream).await;
        }
    };

    let flow_id = engine.allocate_flow_id();
    info!(
        flow_id,
        client = %client_addr,
        local = %local_addr,
        method = %head.method,
        target = %head.target,
        version = head.version.as_str(),
        "accepted request"
    );

    if head.method == "CONNECT" {
        tunnel::run(engine, flow_id, conn, head).await
    } else {
        forward::run(engine, flow_id, conn, head).await
    }
}

/// The rejection every validation failure produces: a bare 400 with no body,
/// flushed, then an outbound half-close so the peer can drain it.
async fn write_bad_request(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(BAD_REQUEST_RESPONSE).await?;
    stream.flush().await?;
    glue::shutdown_quietly(stream).await
}

async fn dial_upstream(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let connect = TcpStream::connect((host, port));
    match timeout {
        Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out")
        })?,
        None => connect.await,
    }
}
