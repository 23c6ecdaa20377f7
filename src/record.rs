//! Resource record model.
//!
//! A [`DnsRecord`] is the administrator-facing form of an RR: textual value,
//! presentation-form owner name and the metadata timestamps kept in the
//! records snapshot. Conversion to and from wire RDATA lives here too, since
//! both the record store (validation) and the cache (upstream answers) need it.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::DnsError;
use crate::utils::{encode_dns_name, normalize_name, read_name, validate_name};

/// Largest TTL a record may carry (RFC 2181 section 8).
pub const MAX_TTL: u32 = i32::MAX as u32;

/// Query type code for `ANY`.
pub const QTYPE_ANY: u16 = 255;

/// Resource record types understood by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    /// Anything else, stored and passed through as opaque RDATA.
    Other(u16),
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::PTR => 12,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            12 => RecordType::PTR,
            15 => RecordType::MX,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            other => RecordType::Other(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => f.write_str("A"),
            RecordType::NS => f.write_str("NS"),
            RecordType::CNAME => f.write_str("CNAME"),
            RecordType::SOA => f.write_str("SOA"),
            RecordType::PTR => f.write_str("PTR"),
            RecordType::MX => f.write_str("MX"),
            RecordType::TXT => f.write_str("TXT"),
            RecordType::AAAA => f.write_str("AAAA"),
            RecordType::SRV => f.write_str("SRV"),
            RecordType::Other(code) => write!(f, "TYPE{code}"),
        }
    }
}

impl FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let rtype = match upper.as_str() {
            "A" => RecordType::A,
            "NS" => RecordType::NS,
            "CNAME" => RecordType::CNAME,
            "SOA" => RecordType::SOA,
            "PTR" => RecordType::PTR,
            "MX" => RecordType::MX,
            "TXT" => RecordType::TXT,
            "AAAA" => RecordType::AAAA,
            "SRV" => RecordType::SRV,
            other => match other.strip_prefix("TYPE").map(str::parse::<u16>) {
                Some(Ok(code)) => RecordType::from_code(code),
                _ => return Err(DnsError::Config(format!("unknown record type: {s}"))),
            },
        };
        Ok(rtype)
    }
}

impl Serialize for RecordType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// DNS class. Everything is `IN` in practice; other classes pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DnsClass(pub u16);

impl DnsClass {
    pub const IN: DnsClass = DnsClass(1);
    pub const CH: DnsClass = DnsClass(3);
    pub const HS: DnsClass = DnsClass(4);

    pub fn is_in(&self) -> bool {
        *self == DnsClass::IN
    }
}

impl Default for DnsClass {
    fn default() -> Self {
        DnsClass::IN
    }
}

impl fmt::Display for DnsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DnsClass::IN => f.write_str("IN"),
            DnsClass::CH => f.write_str("CH"),
            DnsClass::HS => f.write_str("HS"),
            DnsClass(code) => write!(f, "CLASS{code}"),
        }
    }
}

impl FromStr for DnsClass {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "IN" => Ok(DnsClass::IN),
            "CH" => Ok(DnsClass::CH),
            "HS" => Ok(DnsClass::HS),
            other => other
                .strip_prefix("CLASS")
                .and_then(|code| code.parse().ok())
                .map(DnsClass)
                .ok_or_else(|| DnsError::Config(format!("unknown class: {s}"))),
        }
    }
}

impl Serialize for DnsClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DnsClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A resource record as kept in the record store and the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,

    #[serde(rename = "type")]
    pub rtype: RecordType,

    #[serde(default, skip_serializing_if = "DnsClass::is_in")]
    pub class: DnsClass,

    pub value: String,

    pub ttl: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_on: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_on: Option<DateTime<Utc>>,

    /// Hardware address of the host, if the administrator recorded one.
    #[serde(default, rename = "mac", skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_query: Option<DateTime<Utc>>,
}

impl DnsRecord {
    /// Create an `IN` record without metadata.
    pub fn new(name: &str, rtype: RecordType, value: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype,
            class: DnsClass::IN,
            value: value.to_string(),
            ttl,
            added_on: None,
            updated_on: None,
            mac_address: None,
            last_query: None,
        }
    }

    /// Validate the record and bring it into canonical form.
    ///
    /// The owner name is lower-cased and made fully qualified, and the value
    /// is re-rendered from its wire form so that equal values compare equal
    /// (for example `2001:DB8::0:1` and `2001:db8::1`).
    pub fn normalized(mut self) -> Result<Self, DnsError> {
        if self.name.trim().is_empty() {
            return Err(DnsError::Config("record name must not be empty".into()));
        }
        self.name = normalize_name(&self.name);
        validate_name(&self.name)?;

        if self.ttl > MAX_TTL {
            return Err(DnsError::Config(format!(
                "TTL {} exceeds maximum {}",
                self.ttl, MAX_TTL
            )));
        }

        let rdata = encode_rdata(self.rtype, &self.value)?;
        self.value = decode_rdata(self.rtype, &rdata, 0, rdata.len())?;
        Ok(self)
    }

    /// Whether this record has the same identity as another: `(name, type, value)`.
    pub fn same_identity(&self, other: &DnsRecord) -> bool {
        self.rtype == other.rtype
            && self.class == other.class
            && self.name.eq_ignore_ascii_case(&other.name)
            && self.value == other.value
    }

    /// Encode the value as wire RDATA.
    pub fn rdata(&self) -> Result<Vec<u8>, DnsError> {
        encode_rdata(self.rtype, &self.value)
    }
}

fn parse_u16(field: &str, what: &str) -> Result<u16, DnsError> {
    field
        .parse()
        .map_err(|_| DnsError::Config(format!("invalid {what}: {field}")))
}

fn parse_u32(field: &str, what: &str) -> Result<u32, DnsError> {
    field
        .parse()
        .map_err(|_| DnsError::Config(format!("invalid {what}: {field}")))
}

fn target_name(value: &str) -> Result<Vec<u8>, DnsError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DnsError::Config("target name must not be empty".into()));
    }
    encode_dns_name(&normalize_name(value))
}

/// Split TXT presentation text into character-strings.
///
/// Quoted segments become separate strings; unquoted text is one string.
/// Anything longer than 255 bytes is split.
fn txt_strings(value: &str) -> Vec<Vec<u8>> {
    let trimmed = value.trim();
    let mut segments: Vec<Vec<u8>> = Vec::new();

    if trimmed.starts_with('"') {
        let bytes = trimmed.as_bytes();
        let mut current = Vec::new();
        let mut in_quotes = false;
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            i += 1;
            match c {
                b'"' if in_quotes => {
                    segments.push(std::mem::take(&mut current));
                    in_quotes = false;
                }
                b'"' => in_quotes = true,
                b'\\' if in_quotes => {
                    let digits = bytes.get(i..i + 3).filter(|d| d.iter().all(u8::is_ascii_digit));
                    match digits.and_then(|d| std::str::from_utf8(d).ok()?.parse::<u8>().ok()) {
                        Some(value) => {
                            current.push(value);
                            i += 3;
                        }
                        None => {
                            if let Some(&next) = bytes.get(i) {
                                current.push(next);
                                i += 1;
                            }
                        }
                    }
                }
                _ if in_quotes => current.push(c),
                _ => {}
            }
        }
        if in_quotes {
            segments.push(current);
        }
    } else {
        segments.push(trimmed.as_bytes().to_vec());
    }

    segments
        .into_iter()
        .flat_map(|seg| {
            if seg.is_empty() {
                vec![Vec::new()]
            } else {
                seg.chunks(255).map(<[u8]>::to_vec).collect()
            }
        })
        .collect()
}

/// Encode a textual record value as wire RDATA.
///
/// # Arguments
/// * `rtype` - The record type.
/// * `value` - The value in presentation form.
///
/// # Returns
/// The RDATA bytes, or a configuration error if the value does not parse.
pub fn encode_rdata(rtype: RecordType, value: &str) -> Result<Vec<u8>, DnsError> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    match rtype {
        RecordType::A => value
            .trim()
            .parse::<Ipv4Addr>()
            .map(|ip| ip.octets().to_vec())
            .map_err(|_| DnsError::Config(format!("invalid IPv4 address: {value}"))),
        RecordType::AAAA => value
            .trim()
            .parse::<Ipv6Addr>()
            .map(|ip| ip.octets().to_vec())
            .map_err(|_| DnsError::Config(format!("invalid IPv6 address: {value}"))),
        RecordType::CNAME | RecordType::PTR | RecordType::NS => target_name(value),
        RecordType::MX => {
            let [preference, exchange] = fields.as_slice() else {
                return Err(DnsError::Config(format!("invalid MX value: {value}")));
            };
            let mut out = parse_u16(preference, "MX preference")?.to_be_bytes().to_vec();
            out.extend(target_name(exchange)?);
            Ok(out)
        }
        RecordType::SRV => {
            let [priority, weight, port, target] = fields.as_slice() else {
                return Err(DnsError::Config(format!("invalid SRV value: {value}")));
            };
            let mut out = Vec::with_capacity(6 + target.len() + 2);
            out.extend(parse_u16(priority, "SRV priority")?.to_be_bytes());
            out.extend(parse_u16(weight, "SRV weight")?.to_be_bytes());
            out.extend(parse_u16(port, "SRV port")?.to_be_bytes());
            out.extend(target_name(target)?);
            Ok(out)
        }
        RecordType::SOA => {
            let [mname, rname, serial, refresh, retry, expire, minimum] = fields.as_slice() else {
                return Err(DnsError::Config(format!("invalid SOA value: {value}")));
            };
            let mut out = target_name(mname)?;
            out.extend(target_name(rname)?);
            for (field, what) in [
                (serial, "SOA serial"),
                (refresh, "SOA refresh"),
                (retry, "SOA retry"),
                (expire, "SOA expire"),
                (minimum, "SOA minimum"),
            ] {
                out.extend(parse_u32(field, what)?.to_be_bytes());
            }
            Ok(out)
        }
        RecordType::TXT => {
            let mut out = Vec::with_capacity(value.len() + 1);
            for s in txt_strings(value) {
                out.push(s.len() as u8);
                out.extend_from_slice(&s);
            }
            Ok(out)
        }
        RecordType::Other(_) => {
            // RFC 3597 generic form: \# <length> <hex>
            match fields.as_slice() {
                ["\\#", len, hex_parts @ ..] => {
                    let len: usize = len
                        .parse()
                        .map_err(|_| DnsError::Config(format!("invalid RDATA length: {len}")))?;
                    let data = hex::decode(hex_parts.concat())
                        .map_err(|e| DnsError::Config(format!("invalid RDATA hex: {e}")))?;
                    if data.len() != len {
                        return Err(DnsError::Config(format!(
                            "RDATA length {} does not match declared {}",
                            data.len(),
                            len
                        )));
                    }
                    Ok(data)
                }
                _ => Err(DnsError::Config(format!(
                    "value for {rtype} must use the \\# <len> <hex> form"
                ))),
            }
        }
    }
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DnsError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| DnsError::Protocol("RDATA too short".into()))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, DnsError> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DnsError::Protocol("RDATA too short".into()))
}

/// Render wire RDATA in presentation form.
///
/// # Arguments
/// * `rtype` - The record type.
/// * `msg` - Buffer holding the RDATA; for upstream replies this is the whole
///   message so that compressed names can be followed.
/// * `start` - Offset of the RDATA within `msg`.
/// * `len` - RDLENGTH.
///
/// # Returns
/// The textual value.
pub fn decode_rdata(
    rtype: RecordType,
    msg: &[u8],
    start: usize,
    len: usize,
) -> Result<String, DnsError> {
    let end = start + len;
    let rdata = msg
        .get(start..end)
        .ok_or_else(|| DnsError::Protocol("RDATA runs past end of message".into()))?;

    let value = match rtype {
        RecordType::A => {
            let octets: [u8; 4] = rdata
                .try_into()
                .map_err(|_| DnsError::Protocol("A RDATA must be 4 bytes".into()))?;
            Ipv4Addr::from(octets).to_string()
        }
        RecordType::AAAA => {
            let octets: [u8; 16] = rdata
                .try_into()
                .map_err(|_| DnsError::Protocol("AAAA RDATA must be 16 bytes".into()))?;
            Ipv6Addr::from(octets).to_string()
        }
        RecordType::CNAME | RecordType::PTR | RecordType::NS => read_name(msg, start)?.0,
        RecordType::MX => {
            let preference = read_u16(msg, start)?;
            let (exchange, _) = read_name(msg, start + 2)?;
            format!("{preference} {exchange}")
        }
        RecordType::SRV => {
            let priority = read_u16(msg, start)?;
            let weight = read_u16(msg, start + 2)?;
            let port = read_u16(msg, start + 4)?;
            let (target, _) = read_name(msg, start + 6)?;
            format!("{priority} {weight} {port} {target}")
        }
        RecordType::SOA => {
            let (mname, next) = read_name(msg, start)?;
            let (rname, next) = read_name(msg, next)?;
            if next + 20 > end {
                return Err(DnsError::Protocol("SOA RDATA too short".into()));
            }
            format!(
                "{} {} {} {} {} {} {}",
                mname,
                rname,
                read_u32(msg, next)?,
                read_u32(msg, next + 4)?,
                read_u32(msg, next + 8)?,
                read_u32(msg, next + 12)?,
                read_u32(msg, next + 16)?
            )
        }
        RecordType::TXT => {
            let mut parts = Vec::new();
            let mut pos = 0;
            while pos < rdata.len() {
                let slen = rdata[pos] as usize;
                let s = rdata
                    .get(pos + 1..pos + 1 + slen)
                    .ok_or_else(|| DnsError::Protocol("TXT string runs past RDATA".into()))?;
                let mut quoted = String::with_capacity(slen + 2);
                quoted.push('"');
                for &b in s {
                    match b {
                        b'"' | b'\\' => {
                            quoted.push('\\');
                            quoted.push(b as char);
                        }
                        0x20..=0x7e => quoted.push(b as char),
                        _ => quoted.push_str(&format!("\\{b:03}")),
                    }
                }
                quoted.push('"');
                parts.push(quoted);
                pos += 1 + slen;
            }
            parts.join(" ")
        }
        RecordType::Other(_) => format!("\\# {} {}", rdata.len(), hex::encode(rdata)),
    };
    Ok(value)
}
