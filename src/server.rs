//! Server lifecycle.
//!
//! `Server` owns the listening sockets and the handler pool and exposes the
//! start/stop/status operations an admin surface drives.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::errors::DnsError;
use crate::handlers::{run_tcp_server, run_udp_server, HandlerContext};
use crate::resolver::QueryPipeline;

/// What `Server::status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub udp_addr: Option<SocketAddr>,
    pub tcp_addr: Option<SocketAddr>,
    pub started_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

struct Running {
    ctx: Arc<HandlerContext>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    started_at: DateTime<Utc>,
    listeners: Vec<JoinHandle<()>>,
}

impl Running {
    fn status(&self) -> ServerStatus {
        ServerStatus {
            running: true,
            udp_addr: Some(self.udp_addr),
            tcp_addr: Some(self.tcp_addr),
            started_at: Some(self.started_at),
            in_flight: self.ctx.in_flight(),
        }
    }
}

/// The DNS server endpoint.
pub struct Server {
    pipeline: QueryPipeline,
    state: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(pipeline: QueryPipeline) -> Self {
        Self {
            pipeline,
            state: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &QueryPipeline {
        &self.pipeline
    }

    /// Start listening on the configured port on all interfaces.
    ///
    /// Binds the IPv6 wildcard in dual-stack mode, falling back to IPv4 only
    /// where the host has no IPv6.
    pub async fn start(&self) -> Result<ServerStatus, DnsError> {
        let port = self.pipeline.settings().resolver().listen_port;
        match self.start_on(SocketAddr::from(([0u16; 8], port))).await {
            Err(DnsError::Io(e)) => {
                warn!("Dual-stack bind on port {} failed ({}), using IPv4 only", port, e);
                self.start_on(SocketAddr::from(([0, 0, 0, 0], port))).await
            }
            result => result,
        }
    }

    /// Start listening on `addr`, UDP and TCP.
    ///
    /// With port 0 the TCP listener takes the port the UDP socket was given.
    ///
    /// # Returns
    /// The status after start-up, or an error if already running or a
    /// socket cannot be bound.
    pub async fn start_on(&self, addr: SocketAddr) -> Result<ServerStatus, DnsError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(DnsError::Config("server is already running".into()));
        }

        let udp = bind_udp(addr).map_err(|e| {
            error!("Failed to bind UDP socket on {}: {}", addr, e);
            e
        })?;
        let udp_addr = udp.local_addr()?;
        let tcp = bind_tcp(udp_addr).map_err(|e| {
            error!("Failed to bind TCP listener on {}: {}", udp_addr, e);
            e
        })?;
        let tcp_addr = tcp.local_addr()?;

        let config = self.pipeline.settings().config();
        let ctx = Arc::new(HandlerContext::new(
            self.pipeline.clone(),
            config.max_concurrent_queries,
        ));
        let listeners = vec![
            tokio::spawn(run_udp_server(Arc::new(udp), ctx.clone())),
            tokio::spawn(run_tcp_server(tcp, ctx.clone())),
        ];

        let running = Running {
            ctx,
            udp_addr,
            tcp_addr,
            started_at: Utc::now(),
            listeners,
        };
        let status = running.status();
        *state = Some(running);
        info!("DNS server started on {}", udp_addr);
        Ok(status)
    }

    /// Stop accepting queries and wait for in-flight ones.
    ///
    /// Handlers still running after the drain timeout are cancelled and do
    /// not reply.
    ///
    /// # Returns
    /// `false` if the server was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.state.lock().await.take() else {
            return false;
        };
        info!("Stopping DNS server on {}", running.udp_addr);

        running.ctx.begin_shutdown();
        for listener in running.listeners {
            if let Err(e) = listener.await {
                error!("Listener task failed: {}", e);
            }
        }

        let drain = self.pipeline.settings().config().drain_timeout();
        if running.ctx.drain(drain).await {
            info!("DNS server stopped");
        } else {
            info!("DNS server stopped after cancelling pending queries");
        }
        true
    }

    pub async fn status(&self) -> ServerStatus {
        match self.state.lock().await.as_ref() {
            Some(running) => running.status(),
            None => ServerStatus {
                running: false,
                udp_addr: None,
                tcp_addr: None,
                started_at: None,
                in_flight: 0,
            },
        }
    }
}

/// Bind a UDP socket. An IPv6 wildcard also accepts IPv4 clients.
fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
