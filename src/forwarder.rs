//! Upstream forwarding.
//!
//! Queries the resolver cannot answer itself are relayed to the configured
//! upstream over UDP. A truncated UDP reply is retried once over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};

use crate::config::ResolverSettings;
use crate::dns::{Header, HEADER_LEN};
use crate::errors::ForwardError;

/// Largest datagram the upstream may send back. The client's EDNS buffer
/// size is passed through, so replies can exceed what we accept from clients.
const MAX_UPSTREAM_REPLY: usize = u16::MAX as usize;

/// Something that can answer a query on the resolver's behalf.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `query` upstream and return the raw reply.
    ///
    /// The reply carries the same transaction ID as `query`.
    async fn forward(
        &self,
        query: &[u8],
        settings: &ResolverSettings,
    ) -> Result<Vec<u8>, ForwardError>;
}

/// Forwarder talking to `settings.upstream` over the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct Forwarder;

fn query_id(query: &[u8]) -> Result<u16, ForwardError> {
    if query.len() < HEADER_LEN {
        return Err(ForwardError::MalformedReply(
            "query shorter than a header".into(),
        ));
    }
    Ok(u16::from_be_bytes([query[0], query[1]]))
}

/// Whether `reply` is a response to the query with `id`.
fn is_reply_to(reply: &[u8], id: u16) -> bool {
    reply.len() >= HEADER_LEN
        && u16::from_be_bytes([reply[0], reply[1]]) == id
        && reply[2] & 0x80 != 0
}

fn is_truncated(reply: &[u8]) -> bool {
    reply[2] & (Header::TC >> 8) as u8 != 0
}

fn local_bind_addr(upstream: SocketAddr) -> SocketAddr {
    match upstream {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self
    }

    /// Forward a query over UDP.
    ///
    /// # Arguments
    /// * `upstream` - The upstream resolver.
    /// * `query` - The query bytes.
    /// * `deadline` - When to give up.
    ///
    /// # Returns
    /// The first reply whose ID matches the query. Datagrams with any other
    /// ID are ignored.
    async fn forward_udp(
        upstream: SocketAddr,
        query: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, ForwardError> {
        let id = query_id(query)?;
        let socket = UdpSocket::bind(local_bind_addr(upstream)).await?;
        socket.connect(upstream).await?;
        socket.send(query).await?;

        let until = Instant::now() + deadline;
        let mut buf = vec![0u8; MAX_UPSTREAM_REPLY];
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            let size = timeout(remaining, socket.recv(&mut buf))
                .await
                .map_err(|_| ForwardError::Timeout)??;
            let reply = &buf[..size];
            if is_reply_to(reply, id) {
                return Ok(reply.to_vec());
            }
            debug!("Ignoring stray datagram from upstream {}", upstream);
        }
    }

    /// Forward a query over TCP with 2-byte length framing.
    async fn forward_tcp(
        upstream: SocketAddr,
        query: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, ForwardError> {
        let id = query_id(query)?;
        let exchange = async {
            let mut stream = TcpStream::connect(upstream).await?;

            let mut framed = Vec::with_capacity(query.len() + 2);
            framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
            framed.extend_from_slice(query);
            stream.write_all(&framed).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let resp_len = u16::from_be_bytes(len_buf) as usize;

            let mut resp_buf = vec![0u8; resp_len];
            stream.read_exact(&mut resp_buf).await?;
            Ok::<_, std::io::Error>(resp_buf)
        };

        let reply = timeout(deadline, exchange)
            .await
            .map_err(|_| ForwardError::Timeout)??;
        if !is_reply_to(&reply, id) {
            return Err(ForwardError::MalformedReply(
                "TCP reply does not match the query".into(),
            ));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Upstream for Forwarder {
    async fn forward(
        &self,
        query: &[u8],
        settings: &ResolverSettings,
    ) -> Result<Vec<u8>, ForwardError> {
        let mut query = query.to_vec();
        query_id(&query)?;
        // always ask the upstream to recurse
        query[2] |= (Header::RD >> 8) as u8;

        let upstream = settings.upstream;
        debug!("Forwarding query to resolver: {}", upstream);
        let reply = Self::forward_udp(upstream, &query, settings.query_timeout).await?;
        if !is_truncated(&reply) {
            return Ok(reply);
        }

        debug!("UDP reply from {} truncated, retrying over TCP", upstream);
        let reply = Self::forward_tcp(upstream, &query, settings.query_timeout).await?;
        if is_truncated(&reply) {
            return Err(ForwardError::TruncatedAfterTcp);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Message, Question};
    use tokio::net::TcpListener;

    fn query(id: u16) -> Vec<u8> {
        let mut msg = Message::default();
        msg.header.id = id;
        msg.questions.push(Question::new("example.net.", 1, 1));
        msg.encode().unwrap()
    }

    fn settings(upstream: SocketAddr, secs: u64) -> ResolverSettings {
        ResolverSettings {
            upstream,
            query_timeout: Duration::from_secs(secs),
            ..ResolverSettings::default()
        }
    }

    fn as_reply(mut bytes: Vec<u8>, truncated: bool) -> Vec<u8> {
        bytes[2] |= 0x80;
        if truncated {
            bytes[2] |= 0x02;
        }
        bytes
    }

    #[tokio::test]
    async fn ignores_mismatched_ids_and_sets_rd() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let request = buf[..len].to_vec();
            assert_eq!(request[2] & 0x01, 0x01);
            let mut wrong = as_reply(request.clone(), false);
            wrong[0] ^= 0xFF;
            upstream.send_to(&wrong, peer).await.unwrap();
            upstream.send_to(&as_reply(request, false), peer).await.unwrap();
        });

        let reply = Forwarder::new()
            .forward(&query(0x1234), &settings(addr, 2))
            .await
            .unwrap();
        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]), 0x1234);
    }

    #[tokio::test]
    async fn large_edns_reply_is_received_whole() {
        use crate::dns::WireRecord;
        use crate::record::{DnsRecord, RecordType};

        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let request = Message::parse(&buf[..len]).unwrap();
            let mut reply = Message {
                header: request.header,
                questions: request.questions.clone(),
                additionals: request.additionals.clone(),
                ..Default::default()
            };
            reply.header.set(Header::QR, true);
            for i in 0..50 {
                let txt = DnsRecord::new(
                    "example.net.",
                    RecordType::TXT,
                    &format!("{i:02}{}", "t".repeat(100)),
                    60,
                );
                reply.answers.push(WireRecord::from_record(&txt, 60).unwrap());
            }
            let bytes = reply.encode().unwrap();
            assert!(bytes.len() > 4096);
            upstream.send_to(&bytes, peer).await.unwrap();
        });

        let mut msg = Message::default();
        msg.header.id = 0x0E0E;
        msg.questions.push(Question::new("example.net.", 16, 1));
        msg.additionals.push(WireRecord::opt(8192, false));
        let reply = Forwarder::new()
            .forward(&msg.encode().unwrap(), &settings(addr, 2))
            .await
            .unwrap();

        assert!(reply.len() > 4096);
        let parsed = Message::parse(&reply).unwrap();
        assert_eq!(parsed.answers.len(), 50);
    }

    #[tokio::test]
    async fn times_out_without_reply() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let result = Forwarder::new().forward(&query(7), &settings(addr, 1)).await;
        assert!(matches!(result, Err(ForwardError::Timeout)));
        drop(silent);
    }

    #[tokio::test]
    async fn retries_truncated_reply_over_tcp() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind(addr).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = udp.recv_from(&mut buf).await.unwrap();
            udp.send_to(&as_reply(buf[..len].to_vec(), true), peer)
                .await
                .unwrap();
        });
        tokio::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut request = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut request).await.unwrap();
            let reply = as_reply(request, false);
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let reply = Forwarder::new()
            .forward(&query(9), &settings(addr, 2))
            .await
            .unwrap();
        assert_eq!(reply[2] & 0x02, 0);
    }
}
