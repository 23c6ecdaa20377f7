//! Request handlers for the DNS server.
//!
//! This module runs the UDP and TCP listener loops. Every inbound message is
//! handled on its own task, bounded by a shared semaphore, and all tasks are
//! tracked so shutdown can wait for them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::MAX_PACKET_SIZE;
use crate::errors::DnsError;
use crate::resolver::{QueryPipeline, Transport};

/// How long a new TCP connection may take to deliver its first message.
pub const TCP_FIRST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a TCP connection is kept open waiting for a further message.
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared by the listener loops and their handler tasks.
pub struct HandlerContext {
    pipeline: QueryPipeline,
    limiter: Arc<Semaphore>,
    max_in_flight: usize,
    tracker: TaskTracker,
    /// Stops the listeners from taking new work.
    shutdown: CancellationToken,
    /// Cancels handlers still running after the drain deadline.
    abort: CancellationToken,
}

impl HandlerContext {
    pub fn new(pipeline: QueryPipeline, max_concurrent_queries: usize) -> Self {
        let max_in_flight = max_concurrent_queries.max(1);
        Self {
            pipeline,
            limiter: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn pipeline(&self) -> &QueryPipeline {
        &self.pipeline
    }

    /// Number of messages currently being handled.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.limiter.available_permits()
    }

    /// Tell the listener loops to stop accepting work.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for in-flight handlers, cancelling them at the deadline.
    ///
    /// # Returns
    /// `true` if every handler finished on its own.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        if timeout(deadline, self.tracker.wait()).await.is_ok() {
            return true;
        }
        warn!(
            "{} handlers still running after {:?}, cancelling them",
            self.tracker.len(),
            deadline
        );
        self.abort.cancel();
        self.tracker.wait().await;
        false
    }
}

/// Run the UDP DNS server until shutdown.
///
/// # Arguments
/// * `socket` - The bound UDP socket.
/// * `ctx` - Shared handler state.
pub async fn run_udp_server(socket: Arc<UdpSocket>, ctx: Arc<HandlerContext>) {
    if let Ok(addr) = socket.local_addr() {
        info!("UDP DNS server listening on {}", addr);
    }
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let received = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (amt, src) = match received {
            Ok(received) => received,
            Err(e) => {
                error!("UDP receive error: {}", e);
                continue;
            }
        };
        let query = buf[..amt].to_vec();

        let permit = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            permit = ctx.limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let socket = socket.clone();
        let handler = ctx.clone();
        ctx.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = handler.abort.cancelled() => {
                    debug!("Abandoned UDP query from {}", src);
                }
                result = handle_udp_query(&query, src, &socket, &handler.pipeline) => {
                    if let Err(e) = result {
                        warn!("UDP query error: {}", e);
                    }
                }
            }
        });
    }
    info!("UDP DNS server stopped");
}

/// Handle a UDP DNS query.
///
/// # Arguments
/// * `query` - The DNS query.
/// * `src` - The source address of the query.
/// * `socket` - The UDP socket to send the response on.
/// * `pipeline` - The query pipeline.
///
/// # Returns
/// A `Result` indicating whether the reply could be sent.
pub async fn handle_udp_query(
    query: &[u8],
    src: SocketAddr,
    socket: &UdpSocket,
    pipeline: &QueryPipeline,
) -> Result<(), DnsError> {
    debug!("UDP query of {} bytes from {}", query.len(), src);
    if let Some(response) = pipeline.handle(query, Transport::Udp).await {
        socket.send_to(&response, src).await?;
    }
    Ok(())
}

/// Run the TCP DNS server until shutdown.
///
/// # Arguments
/// * `listener` - The bound TCP listener.
/// * `ctx` - Shared handler state.
pub async fn run_tcp_server(listener: TcpListener, ctx: Arc<HandlerContext>) {
    if let Ok(addr) = listener.local_addr() {
        info!("TCP DNS server listening on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let handler = ctx.clone();
                ctx.tracker.spawn(async move {
                    tokio::select! {
                        _ = handler.abort.cancelled() => {
                            debug!("Abandoned TCP connection from {}", addr);
                        }
                        result = handle_tcp_connection(stream, addr, &handler) => {
                            if let Err(e) = result {
                                warn!("TCP connection error: {}", e);
                            }
                        }
                    }
                });
            }
            Err(e) => error!("TCP accept error: {}", e),
        }
    }
    info!("TCP DNS server stopped");
}

/// Read one length-prefixed message.
///
/// # Returns
/// `None` if the peer closed the connection before sending a length.
async fn read_tcp_message(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, DnsError> {
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut query = vec![0u8; len];
    stream.read_exact(&mut query).await?;
    Ok(Some(query))
}

/// Send a DNS response over TCP with its length prefix.
pub async fn send_tcp_response(stream: &mut TcpStream, response: &[u8]) -> Result<(), DnsError> {
    let len = u16::try_from(response.len())
        .map_err(|_| DnsError::Protocol("response longer than 65535 bytes".into()))?;
    let mut framed = Vec::with_capacity(response.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(response);
    stream.write_all(&framed).await?;
    Ok(())
}

/// Handle a TCP DNS connection.
///
/// The connection stays open while the client keeps sending messages within
/// the idle window.
///
/// # Arguments
/// * `stream` - The TCP stream.
/// * `addr` - The client address.
/// * `ctx` - Shared handler state.
///
/// # Returns
/// A `Result` indicating success or failure.
pub async fn handle_tcp_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: &HandlerContext,
) -> Result<(), DnsError> {
    let mut wait = TCP_FIRST_READ_TIMEOUT;

    loop {
        let next = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            next = timeout(wait, read_tcp_message(&mut stream)) => next,
        };
        let query = match next {
            Ok(Ok(Some(query))) => query,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("TCP connection from {} idle, closing", addr);
                break;
            }
        };
        debug!("TCP query of {} bytes from {}", query.len(), addr);

        let _permit = ctx
            .limiter
            .acquire()
            .await
            .map_err(|_| DnsError::Protocol("handler pool closed".into()))?;
        if let Some(response) = ctx.pipeline.handle(&query, Transport::Tcp).await {
            send_tcp_response(&mut stream, &response).await?;
        }
        wait = TCP_IDLE_TIMEOUT;
    }
    Ok(())
}
