//! End-to-end tests: a real server on loopback talking to a fake upstream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use homedns::cache::DnsCache;
use homedns::config::{ResolverSettings, SettingsHandle};
use homedns::db::RecordStore;
use homedns::dns::{Header, Message, Question, Rcode, WireRecord};
use homedns::errors::RecordError;
use homedns::forwarder::Forwarder;
use homedns::record::{DnsRecord, RecordType};
use homedns::resolver::QueryPipeline;
use homedns::server::Server;
use homedns::stats::Stats;

/// Upstream answering every A query with `1.2.3.4`, TTL 300.
async fn fake_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let request = Message::parse(&buf[..len]).unwrap();
            let mut reply = Message {
                header: request.header,
                questions: request.questions.clone(),
                ..Default::default()
            };
            reply.header.set(Header::QR, true);
            reply.header.set(Header::RA, true);
            let name = &request.questions[0].name;
            let answer = DnsRecord::new(name, RecordType::A, "1.2.3.4", 300);
            reply
                .answers
                .push(WireRecord::from_record(&answer, 300).unwrap());
            socket
                .send_to(&reply.encode().unwrap(), peer)
                .await
                .unwrap();
        }
    });
    (addr, queries)
}

struct Harness {
    server: Server,
    addr: SocketAddr,
    records: Arc<RecordStore>,
    cache: Arc<DnsCache>,
}

async fn start(settings: ResolverSettings, records: RecordStore) -> Harness {
    let records = Arc::new(records);
    let cache = Arc::new(DnsCache::new(1000));
    let pipeline = QueryPipeline::new(
        records.clone(),
        cache.clone(),
        Arc::new(SettingsHandle::fixed(settings)),
        Arc::new(Forwarder::new()),
        Arc::new(Stats::new()),
    );
    let server = Server::new(pipeline);
    let status = server
        .start_on("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    Harness {
        server,
        addr: status.udp_addr.unwrap(),
        records,
        cache,
    }
}

fn query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut msg = Message::default();
    msg.header.id = id;
    msg.header.set(Header::RD, true);
    msg.questions.push(Question::new(name, qtype.code(), 1));
    msg.encode().unwrap()
}

async fn ask_udp(addr: SocketAddr, name: &str, qtype: RecordType) -> Message {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&query(0x2468, name, qtype), addr)
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no reply")
        .unwrap();
    let reply = Message::parse(&buf[..len]).unwrap();
    assert_eq!(reply.header.id, 0x2468);
    reply
}

async fn ask_tcp(stream: &mut TcpStream, id: u16, name: &str) -> Message {
    let request = query(id, name, RecordType::A);
    stream
        .write_all(&(request.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&request).await.unwrap();
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.unwrap();
    let mut reply = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut reply).await.unwrap();
    Message::parse(&reply).unwrap()
}

#[tokio::test]
async fn local_record_answered_authoritatively() {
    let (upstream, queries) = fake_upstream().await;
    let h = start(
        ResolverSettings {
            upstream,
            ..ResolverSettings::default()
        },
        RecordStore::in_memory(),
    )
    .await;
    h.records
        .add(DnsRecord::new("example.com.", RecordType::A, "93.184.216.34", 3600))
        .unwrap();

    let reply = ask_udp(h.addr, "example.com.", RecordType::A).await;
    assert_eq!(reply.header.rcode(), Rcode::NoError);
    assert!(reply.header.has(Header::AA));
    assert_eq!(reply.answers.len(), 1);
    let answer = reply.answers[0].to_record().unwrap();
    assert_eq!(answer.value, "93.184.216.34");
    assert_eq!(answer.ttl, 3600);
    assert_eq!(queries.load(Ordering::SeqCst), 0);

    h.server.stop().await;
}

#[tokio::test]
async fn forwarded_answer_served_from_cache() {
    let (upstream, queries) = fake_upstream().await;
    let h = start(
        ResolverSettings {
            upstream,
            ..ResolverSettings::default()
        },
        RecordStore::in_memory(),
    )
    .await;

    let first = ask_udp(h.addr, "example.net.", RecordType::A).await;
    assert_eq!(first.header.rcode(), Rcode::NoError);
    assert!(!first.header.has(Header::AA));
    assert!(first.header.has(Header::RA));
    assert_eq!(first.answers[0].rdata, vec![1, 2, 3, 4]);
    assert_eq!(first.answers[0].ttl, 300);

    let second = ask_udp(h.addr, "Example.Net.", RecordType::A).await;
    assert!(!second.header.has(Header::AA));
    assert_eq!(second.answers[0].rdata, vec![1, 2, 3, 4]);
    assert!(second.answers[0].ttl <= 300);

    assert_eq!(queries.load(Ordering::SeqCst), 1);
    assert_eq!(h.cache.len(), 1);
    h.server.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_gives_servfail() {
    // bound but never answers
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let h = start(
        ResolverSettings {
            upstream: silent.local_addr().unwrap(),
            query_timeout: Duration::from_secs(1),
            ..ResolverSettings::default()
        },
        RecordStore::in_memory(),
    )
    .await;

    let began = Instant::now();
    let reply = ask_udp(h.addr, "unknown.example.", RecordType::A).await;
    let elapsed = began.elapsed();
    assert_eq!(reply.header.rcode(), Rcode::ServFail);
    assert!(reply.header.has(Header::RA));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));
    assert!(h.cache.is_empty());

    h.server.stop().await;
}

#[tokio::test]
async fn ptr_synthesis_and_short_circuit() {
    let (upstream, queries) = fake_upstream().await;
    let h = start(
        ResolverSettings {
            upstream,
            auto_build_ptr_from_a: true,
            ..ResolverSettings::default()
        },
        RecordStore::in_memory(),
    )
    .await;
    h.records
        .add(DnsRecord::new("host.lan.", RecordType::A, "10.0.0.5", 900))
        .unwrap();

    let reply = ask_udp(h.addr, "5.0.0.10.in-addr.arpa.", RecordType::PTR).await;
    assert_eq!(reply.header.rcode(), Rcode::NoError);
    assert!(reply.header.has(Header::AA));
    let ptr = reply.answers[0].to_record().unwrap();
    assert_eq!(ptr.value, "host.lan.");
    assert_eq!(ptr.ttl, 900);
    h.server.stop().await;

    let h = start(
        ResolverSettings {
            upstream,
            auto_build_ptr_from_a: false,
            forward_ptr_queries: false,
            ..ResolverSettings::default()
        },
        RecordStore::in_memory(),
    )
    .await;
    h.records
        .add(DnsRecord::new("host.lan.", RecordType::A, "10.0.0.5", 900))
        .unwrap();

    let reply = ask_udp(h.addr, "5.0.0.10.in-addr.arpa.", RecordType::PTR).await;
    assert_eq!(reply.header.rcode(), Rcode::NxDomain);
    assert!(reply.header.has(Header::AA));
    assert!(reply.answers.is_empty());
    assert_eq!(queries.load(Ordering::SeqCst), 0);
    h.server.stop().await;
}

#[tokio::test]
async fn duplicate_add_leaves_snapshot_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dnsrecords.json");
    let store = RecordStore::open(path.clone()).unwrap();

    store
        .add(DnsRecord::new("foo.lan.", RecordType::A, "10.0.0.1", 3600))
        .unwrap();
    let before = std::fs::read(&path).unwrap();

    let err = store
        .add(DnsRecord::new("FOO.lan", RecordType::A, "10.0.0.1", 3600))
        .unwrap_err();
    assert!(matches!(err, RecordError::Duplicate { .. }));
    assert_eq!(store.len(), 1);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn tcp_connection_serves_several_queries() {
    let (upstream, _) = fake_upstream().await;
    let h = start(
        ResolverSettings {
            upstream,
            ..ResolverSettings::default()
        },
        RecordStore::in_memory(),
    )
    .await;
    h.records
        .add(DnsRecord::new("a.lan.", RecordType::A, "10.0.0.1", 60))
        .unwrap();
    h.records
        .add(DnsRecord::new("b.lan.", RecordType::A, "10.0.0.2", 60))
        .unwrap();

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    let first = ask_tcp(&mut stream, 1, "a.lan.").await;
    assert_eq!(first.header.id, 1);
    assert_eq!(first.answers[0].rdata, vec![10, 0, 0, 1]);
    let second = ask_tcp(&mut stream, 2, "b.lan.").await;
    assert_eq!(second.header.id, 2);
    assert_eq!(second.answers[0].rdata, vec![10, 0, 0, 2]);

    // the server closes the connection once the idle window passes
    let mut buf = [0u8; 1];
    let closed = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed, 0);

    h.server.stop().await;
}

#[tokio::test]
async fn stopped_server_no_longer_answers() {
    let (upstream, _) = fake_upstream().await;
    let h = start(
        ResolverSettings {
            upstream,
            ..ResolverSettings::default()
        },
        RecordStore::in_memory(),
    )
    .await;
    assert!(h.server.stop().await);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&query(9, "example.net.", RecordType::A), h.addr)
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    assert!(timeout(Duration::from_millis(300), client.recv_from(&mut buf))
        .await
        .map(|r| r.is_err())
        .unwrap_or(true));
}
