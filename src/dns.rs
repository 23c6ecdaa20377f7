//! DNS protocol implementation.
//!
//! This module provides the RFC 1035 message codec: header, question,
//! resource records and the EDNS OPT pseudo-record. Names are decompressed on
//! read and written uncompressed.

use crate::errors::DnsError;
use crate::record::{decode_rdata, encode_rdata, DnsClass, DnsRecord, RecordType};
use crate::utils::{encode_dns_name, normalize_name, read_name};

/// Length of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// Classic UDP payload limit when the client does not advertise EDNS.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Record type of the EDNS OPT pseudo-record.
pub const TYPE_OPT: u16 = 41;

/// Opcode for a standard query.
pub const OPCODE_QUERY: u8 = 0;

/// DNS response codes produced or inspected by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl Rcode {
    pub fn code(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::Other(code) => code & 0x0F,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            other => Rcode::Other(other),
        }
    }
}

/// The fixed 12-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub const QR: u16 = 0x8000;
    pub const AA: u16 = 0x0400;
    pub const TC: u16 = 0x0200;
    pub const RD: u16 = 0x0100;
    pub const RA: u16 = 0x0080;

    /// Parse the header at the start of a message.
    pub fn parse(buf: &[u8]) -> Result<Header, DnsError> {
        if buf.len() < HEADER_LEN {
            return Err(DnsError::Protocol(format!(
                "message of {} bytes is shorter than a header",
                buf.len()
            )));
        }
        let word = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        Ok(Header {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags >> 11) & 0x0F) as u8
    }

    pub fn rcode(&self) -> Rcode {
        Rcode::from_code((self.flags & 0x0F) as u8)
    }

    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.flags = (self.flags & !0x0F) | rcode.code() as u16;
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u16, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}

/// One entry of the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: &str, qtype: u16, qclass: u16) -> Self {
        Self {
            name: name.to_string(),
            qtype,
            qclass,
        }
    }

    fn parse(buf: &[u8], pos: usize) -> Result<(Question, usize), DnsError> {
        let (name, pos) = read_name(buf, pos)?;
        let fixed = buf
            .get(pos..pos + 4)
            .ok_or_else(|| DnsError::Protocol("question runs past end of message".into()))?;
        let question = Question {
            name,
            qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
            qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        };
        Ok((question, pos + 4))
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), DnsError> {
        out.extend(encode_dns_name(&self.name)?);
        out.extend_from_slice(&self.qtype.to_be_bytes());
        out.extend_from_slice(&self.qclass.to_be_bytes());
        Ok(())
    }

    /// The query name lower-cased and fully qualified.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    pub fn record_type(&self) -> RecordType {
        RecordType::from_code(self.qtype)
    }

    pub fn class(&self) -> DnsClass {
        DnsClass(self.qclass)
    }
}

/// A resource record in wire form.
///
/// RDATA is stored without compression pointers, so a record can be copied
/// into another message as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl WireRecord {
    fn parse(buf: &[u8], pos: usize) -> Result<(WireRecord, usize), DnsError> {
        let (name, pos) = read_name(buf, pos)?;
        let fixed = buf
            .get(pos..pos + 10)
            .ok_or_else(|| DnsError::Protocol("record runs past end of message".into()))?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let class = u16::from_be_bytes([fixed[2], fixed[3]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        let start = pos + 10;
        let raw = buf
            .get(start..start + rdlength)
            .ok_or_else(|| DnsError::Protocol("RDATA runs past end of message".into()))?;

        let kind = RecordType::from_code(rtype);
        let rdata = match kind {
            // These carry names that may point elsewhere in the message.
            RecordType::CNAME
            | RecordType::NS
            | RecordType::PTR
            | RecordType::MX
            | RecordType::SRV
            | RecordType::SOA => {
                let text = decode_rdata(kind, buf, start, rdlength)?;
                encode_rdata(kind, &text)
                    .map_err(|e| DnsError::Protocol(format!("bad {kind} RDATA: {e}")))?
            }
            _ => raw.to_vec(),
        };

        let record = WireRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        };
        Ok((record, start + rdlength))
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), DnsError> {
        if self.rdata.len() > u16::MAX as usize {
            return Err(DnsError::Protocol("RDATA longer than 65535 bytes".into()));
        }
        out.extend(encode_dns_name(&self.name)?);
        out.extend_from_slice(&self.rtype.to_be_bytes());
        out.extend_from_slice(&self.class.to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        out.extend_from_slice(&(self.rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.rdata);
        Ok(())
    }

    /// Build the wire form of a stored record, with an explicit TTL.
    pub fn from_record(record: &DnsRecord, ttl: u32) -> Result<WireRecord, DnsError> {
        Ok(WireRecord {
            name: record.name.clone(),
            rtype: record.rtype.code(),
            class: record.class.0,
            ttl,
            rdata: record.rdata()?,
        })
    }

    /// Convert to the store/cache representation.
    pub fn to_record(&self) -> Result<DnsRecord, DnsError> {
        let rtype = RecordType::from_code(self.rtype);
        let value = decode_rdata(rtype, &self.rdata, 0, self.rdata.len())?;
        let mut record = DnsRecord::new(&normalize_name(&self.name), rtype, &value, self.ttl);
        record.class = DnsClass(self.class);
        Ok(record)
    }

    /// Build an EDNS OPT pseudo-record advertising `payload` bytes.
    pub fn opt(payload: u16, dnssec_ok: bool) -> WireRecord {
        WireRecord {
            name: ".".into(),
            rtype: TYPE_OPT,
            class: payload,
            ttl: if dnssec_ok { 0x0000_8000 } else { 0 },
            rdata: Vec::new(),
        }
    }

    pub fn is_opt(&self) -> bool {
        self.rtype == TYPE_OPT
    }
}

/// A complete DNS message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<WireRecord>,
    pub authorities: Vec<WireRecord>,
    pub additionals: Vec<WireRecord>,
}

impl Message {
    /// Parse a complete message.
    ///
    /// # Arguments
    /// * `buf` - The raw message bytes.
    ///
    /// # Returns
    /// The parsed message, or a protocol error if any section is malformed.
    pub fn parse(buf: &[u8]) -> Result<Message, DnsError> {
        let header = Header::parse(buf)?;
        let mut pos = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.qdcount.min(8) as usize);
        for _ in 0..header.qdcount {
            let (question, next) = Question::parse(buf, pos)?;
            questions.push(question);
            pos = next;
        }

        let mut sections: [Vec<WireRecord>; 3] = Default::default();
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, count) in sections.iter_mut().zip(counts) {
            for _ in 0..count {
                let (record, next) = WireRecord::parse(buf, pos)?;
                section.push(record);
                pos = next;
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Encode the message. Section counts are taken from the vectors.
    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        let mut header = self.header;
        header.qdcount = count(self.questions.len())?;
        header.ancount = count(self.answers.len())?;
        header.nscount = count(self.authorities.len())?;
        header.arcount = count(self.additionals.len())?;

        let mut out = Vec::with_capacity(MAX_UDP_PAYLOAD);
        header.write(&mut out);
        for question in &self.questions {
            question.write(&mut out)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.write(&mut out)?;
        }
        Ok(out)
    }

    /// The OPT pseudo-record, if the message carries one.
    pub fn opt(&self) -> Option<&WireRecord> {
        self.additionals.iter().find(|r| r.is_opt())
    }

    /// The UDP payload size advertised through EDNS.
    pub fn edns_payload_size(&self) -> Option<u16> {
        self.opt().map(|opt| opt.class)
    }

    /// Whether the DNSSEC OK bit is set in the OPT record.
    pub fn dnssec_ok(&self) -> bool {
        self.opt().map(|opt| opt.ttl & 0x0000_8000 != 0).unwrap_or(false)
    }
}

fn count(len: usize) -> Result<u16, DnsError> {
    u16::try_from(len).map_err(|_| DnsError::Protocol("too many records in section".into()))
}

/// Rewrite the header of a forwarded reply for the client.
///
/// Sets the client's transaction ID, clears AA and sets RA, leaving the rest
/// of the upstream bytes untouched.
pub fn patch_forwarded_reply(reply: &mut [u8], id: u16) -> Result<(), DnsError> {
    if reply.len() < HEADER_LEN {
        return Err(DnsError::Protocol("reply shorter than a header".into()));
    }
    reply[..2].copy_from_slice(&id.to_be_bytes());
    reply[2] &= !((Header::AA >> 8) as u8);
    reply[3] |= Header::RA as u8;
    Ok(())
}
