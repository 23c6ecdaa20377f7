//! Reply assembly.
//!
//! Everything the resolver sends back to a client goes through here, whether
//! it answers from local records, from the cache, or relays an upstream reply.

use crate::config::MAX_PACKET_SIZE;
use crate::dns::{Header, Message, Question, Rcode, WireRecord, HEADER_LEN, MAX_UDP_PAYLOAD};
use crate::errors::DnsError;
use crate::record::DnsRecord;
use crate::utils::names_equal;

/// Header flags chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyFlags {
    pub authoritative: bool,
    pub recursion_available: bool,
}

impl ReplyFlags {
    /// Flags for an answer sourced from the record store.
    pub fn authoritative() -> Self {
        Self {
            authoritative: true,
            recursion_available: true,
        }
    }

    /// Flags for an answer sourced from the cache or the upstream.
    pub fn recursive() -> Self {
        Self {
            authoritative: false,
            recursion_available: true,
        }
    }
}

/// Largest UDP reply the client said it can take.
pub fn udp_limit(request: &Message) -> usize {
    request
        .edns_payload_size()
        .map(|size| (size as usize).clamp(MAX_UDP_PAYLOAD, MAX_PACKET_SIZE))
        .unwrap_or(MAX_UDP_PAYLOAD)
}

/// Build the header of a reply to `request`.
fn reply_header(request: &Header, rcode: Rcode, flags: ReplyFlags) -> Header {
    let mut header = Header {
        id: request.id,
        // keep opcode and RD from the request
        flags: request.flags & (0x7800 | Header::RD),
        ..Default::default()
    };
    header.set(Header::QR, true);
    header.set(Header::AA, flags.authoritative);
    header.set(Header::RA, flags.recursion_available);
    header.set_rcode(rcode);
    header
}

/// Build a reply carrying `answers`.
///
/// # Arguments
/// * `request` - The parsed request; its ID and question are copied.
/// * `rcode` - Response code to set.
/// * `answers` - Answer records, with the TTL each should carry on the wire.
/// * `flags` - AA/RA choice.
/// * `max_size` - Size limit; answers that do not fit are dropped and TC is set.
///
/// # Returns
/// The encoded reply.
pub fn build_reply(
    request: &Message,
    rcode: Rcode,
    answers: &[DnsRecord],
    flags: ReplyFlags,
    max_size: usize,
) -> Result<Vec<u8>, DnsError> {
    let mut reply = Message {
        header: reply_header(&request.header, rcode, flags),
        questions: request.questions.clone(),
        ..Default::default()
    };
    for answer in answers {
        reply.answers.push(WireRecord::from_record(answer, answer.ttl)?);
    }
    if request.opt().is_some() {
        reply
            .additionals
            .push(WireRecord::opt(MAX_PACKET_SIZE as u16, request.dnssec_ok()));
    }
    fit_to_size(reply, max_size)
}

fn same_rrset(a: &WireRecord, b: &WireRecord) -> bool {
    a.rtype == b.rtype && a.class == b.class && names_equal(&a.name, &b.name)
}

/// Encode `reply`, dropping records from the end until it fits in `max_size`.
///
/// Authority and non-OPT additional records go first, then whole answer
/// RRsets starting with the last one. TC is set whenever an answer had to be
/// dropped.
pub fn fit_to_size(mut reply: Message, max_size: usize) -> Result<Vec<u8>, DnsError> {
    let encoded = reply.encode()?;
    if encoded.len() <= max_size {
        return Ok(encoded);
    }

    reply.authorities.clear();
    reply.additionals.retain(WireRecord::is_opt);

    let mut size = reply.encode()?.len();
    let mut truncated = false;
    while size > max_size {
        let Some(last) = reply.answers.last().cloned() else {
            break;
        };
        reply.answers.retain(|rr| !same_rrset(rr, &last));
        size = reply.encode()?.len();
        truncated = true;
    }
    reply.header.set(Header::TC, truncated || size > max_size);
    reply.encode()
}

/// Shrink a relayed upstream reply to the client's UDP limit.
pub fn truncate_reply(reply: Vec<u8>, max_size: usize) -> Result<Vec<u8>, DnsError> {
    if reply.len() <= max_size {
        return Ok(reply);
    }
    let message = Message::parse(&reply)?;
    fit_to_size(message, max_size)
}

/// Build an error reply from raw request bytes.
///
/// Works even when the request could not be parsed past the transaction ID;
/// the question is echoed only if it parses.
///
/// # Arguments
/// * `raw` - The request bytes as received.
/// * `rcode` - Response code to send.
///
/// # Returns
/// `None` when not even the ID is recoverable or the packet is itself a reply.
pub fn error_reply(raw: &[u8], rcode: Rcode) -> Option<Vec<u8>> {
    if raw.len() < 2 {
        return None;
    }
    let mut request = Header {
        id: u16::from_be_bytes([raw[0], raw[1]]),
        ..Default::default()
    };
    if let Some(&high) = raw.get(2) {
        if high & 0x80 != 0 {
            return None;
        }
        request.flags = (high as u16) << 8;
    }

    let questions: Vec<Question> = if raw.len() >= HEADER_LEN {
        Message::parse(raw).map(|m| m.questions).unwrap_or_default()
    } else {
        Vec::new()
    };

    let reply = Message {
        header: reply_header(&request, rcode, ReplyFlags::recursive()),
        questions,
        ..Default::default()
    };
    reply.encode().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;

    fn request(name: &str, qtype: u16) -> Message {
        let mut msg = Message::default();
        msg.header.id = 0x4242;
        msg.header.set(Header::RD, true);
        msg.questions.push(Question::new(name, qtype, 1));
        msg
    }

    #[test]
    fn copies_id_question_and_flags() {
        let req = request("host.lan.", 1);
        let answer = DnsRecord::new("host.lan.", RecordType::A, "10.0.0.5", 3600);
        let bytes = build_reply(
            &req,
            Rcode::NoError,
            &[answer],
            ReplyFlags::authoritative(),
            MAX_UDP_PAYLOAD,
        )
        .unwrap();

        let reply = Message::parse(&bytes).unwrap();
        assert_eq!(reply.header.id, 0x4242);
        assert!(reply.header.has(Header::QR));
        assert!(reply.header.has(Header::AA));
        assert!(reply.header.has(Header::RD));
        assert!(!reply.header.has(Header::TC));
        assert_eq!(reply.questions, req.questions);
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].ttl, 3600);
        assert_eq!(reply.answers[0].rdata, vec![10, 0, 0, 5]);
    }

    #[test]
    fn truncates_to_limit() {
        let req = request("big.lan.", 16);
        let answers: Vec<DnsRecord> = (0..10)
            .map(|i| {
                DnsRecord::new("big.lan.", RecordType::TXT, &format!("{i}{}", "x".repeat(100)), 60)
            })
            .collect();
        let bytes = build_reply(
            &req,
            Rcode::NoError,
            &answers,
            ReplyFlags::authoritative(),
            MAX_UDP_PAYLOAD,
        )
        .unwrap();

        assert!(bytes.len() <= MAX_UDP_PAYLOAD);
        let reply = Message::parse(&bytes).unwrap();
        assert!(reply.header.has(Header::TC));
        // one RRset that does not fit is dropped whole
        assert!(reply.answers.is_empty());
        assert_eq!(reply.questions, req.questions);
    }

    #[test]
    fn truncation_keeps_whole_rrsets() {
        let req = request("mixed.lan.", 255);
        let mut answers: Vec<DnsRecord> = (1..=3)
            .map(|i| DnsRecord::new("mixed.lan.", RecordType::A, &format!("10.0.0.{i}"), 60))
            .collect();
        answers.extend((0..5).map(|i| {
            DnsRecord::new("mixed.lan.", RecordType::TXT, &format!("{i}{}", "w".repeat(100)), 60)
        }));
        let bytes = build_reply(
            &req,
            Rcode::NoError,
            &answers,
            ReplyFlags::authoritative(),
            MAX_UDP_PAYLOAD,
        )
        .unwrap();

        let reply = Message::parse(&bytes).unwrap();
        assert!(reply.header.has(Header::TC));
        assert_eq!(reply.answers.len(), 3);
        assert!(reply
            .answers
            .iter()
            .all(|rr| rr.rtype == RecordType::A.code()));
    }

    #[test]
    fn honours_edns_buffer() {
        let mut req = request("big.lan.", 16);
        req.additionals.push(WireRecord::opt(4096, false));
        assert_eq!(udp_limit(&req), 4096);

        let answers: Vec<DnsRecord> = (0..10)
            .map(|i| DnsRecord::new("big.lan.", RecordType::TXT, &format!("{i}{}", "y".repeat(100)), 60))
            .collect();
        let bytes = build_reply(&req, Rcode::NoError, &answers, ReplyFlags::authoritative(), udp_limit(&req))
            .unwrap();
        let reply = Message::parse(&bytes).unwrap();
        assert!(!reply.header.has(Header::TC));
        assert_eq!(reply.answers.len(), 10);
        assert_eq!(reply.edns_payload_size(), Some(4096));
    }

    #[test]
    fn error_reply_from_garbage() {
        let reply = error_reply(&[0xAB, 0xCD, 0x01], Rcode::FormErr).unwrap();
        let header = Header::parse(&reply).unwrap();
        assert_eq!(header.id, 0xABCD);
        assert_eq!(header.rcode(), Rcode::FormErr);
        assert!(header.has(Header::QR));
        assert_eq!(header.qdcount, 0);

        assert!(error_reply(&[0xAB], Rcode::FormErr).is_none());
        // responses are never answered
        assert!(error_reply(&[0, 1, 0x80, 0], Rcode::FormErr).is_none());
    }

    #[test]
    fn notimp_echoes_question() {
        let mut req = request("host.lan.", 1);
        req.header.flags |= 2 << 11; // STATUS opcode
        let raw = req.encode().unwrap();
        let reply = Message::parse(&error_reply(&raw, Rcode::NotImp).unwrap()).unwrap();
        assert_eq!(reply.header.rcode(), Rcode::NotImp);
        assert_eq!(reply.header.opcode(), 2);
        assert_eq!(reply.questions, req.questions);
    }
}
