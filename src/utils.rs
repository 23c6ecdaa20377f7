//! Utility functions for DNS names.
//!
//! Names are handled in presentation form (`host.lan.`) everywhere outside
//! the wire codec. Bytes that cannot appear literally in a label are written
//! with the usual `\DDD` escapes so that any wire name survives a round trip.

use std::net::Ipv4Addr;

use crate::errors::DnsError;

/// Maximum length of a single label on the wire.
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum length of an encoded name on the wire, including the root byte.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum number of compression pointers followed while reading one name.
const MAX_POINTER_HOPS: usize = 64;

/// Lower-case a name and make sure it is fully qualified.
pub fn normalize_name(name: &str) -> String {
    let mut out = name.trim().to_ascii_lowercase();
    // A dot preceded by an odd run of backslashes is part of the last label.
    let body = out.strip_suffix('.').unwrap_or(&out);
    let escapes = body.len() - body.trim_end_matches('\\').len();
    if !out.ends_with('.') || escapes % 2 == 1 {
        out.push('.');
    }
    out
}

/// Compare two names the way DNS does (ASCII case-insensitive, trailing dot optional).
pub fn names_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Split a presentation-form name into raw label bytes.
///
/// # Arguments
/// * `name` - The name, with or without the trailing dot.
///
/// # Returns
/// The labels, or an error if an escape is malformed or a label is empty.
pub fn split_labels(name: &str) -> Result<Vec<Vec<u8>>, DnsError> {
    let mut labels = Vec::new();
    if name == "." || name.is_empty() {
        return Ok(labels);
    }

    let bytes = name.as_bytes();
    let mut label = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let rest = &bytes[i + 1..];
                if rest.len() >= 3 && rest[..3].iter().all(u8::is_ascii_digit) {
                    let value = (rest[0] - b'0') as u16 * 100
                        + (rest[1] - b'0') as u16 * 10
                        + (rest[2] - b'0') as u16;
                    if value > 255 {
                        return Err(DnsError::Protocol(format!("bad escape in name {name}")));
                    }
                    label.push(value as u8);
                    i += 4;
                } else if let Some(&c) = rest.first() {
                    label.push(c);
                    i += 2;
                } else {
                    return Err(DnsError::Protocol(format!("dangling escape in name {name}")));
                }
            }
            b'.' => {
                if label.is_empty() {
                    return Err(DnsError::Protocol(format!("empty label in name {name}")));
                }
                labels.push(std::mem::take(&mut label));
                i += 1;
            }
            c => {
                label.push(c);
                i += 1;
            }
        }
    }
    if !label.is_empty() {
        labels.push(label);
    }
    Ok(labels)
}

/// Check a name against the RFC 1035 length limits.
pub fn validate_name(name: &str) -> Result<(), DnsError> {
    encode_dns_name(name).map(|_| ())
}

/// Encode a domain name in DNS wire format, without compression.
///
/// # Arguments
/// * `name` - The domain name to encode.
///
/// # Returns
/// The encoded name, or an error if a label or the whole name is too long.
pub fn encode_dns_name(name: &str) -> Result<Vec<u8>, DnsError> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in split_labels(name)? {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::Protocol(format!(
                "label longer than {MAX_LABEL_LEN} bytes in {name}"
            )));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(&label);
    }
    out.push(0);
    if out.len() > MAX_NAME_LEN {
        return Err(DnsError::Protocol(format!("name longer than {MAX_NAME_LEN} bytes: {name}")));
    }
    Ok(out)
}

/// Append one label to a presentation-form name, escaping as needed.
fn push_label(out: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' => {
                out.push('\\');
                out.push(b as char);
            }
            0x21..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{b:03}")),
        }
    }
    out.push('.');
}

/// Read a possibly compressed name from a DNS message.
///
/// # Arguments
/// * `buf` - The whole message.
/// * `start` - Offset of the name.
///
/// # Returns
/// The name in presentation form and the offset just past it in the
/// original position (compression pointers are followed but not counted).
pub fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut hops = 0;
    let mut wire_len = 1;

    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| DnsError::Protocol("name runs past end of message".into()))?
            as usize;

        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    if end.is_none() {
                        end = Some(pos + 1);
                    }
                    break;
                }
                let label = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or_else(|| DnsError::Protocol("label runs past end of message".into()))?;
                wire_len += len + 1;
                if wire_len > MAX_NAME_LEN {
                    return Err(DnsError::Protocol("name exceeds 255 bytes".into()));
                }
                push_label(&mut name, label);
                pos += len + 1;
            }
            0xC0 => {
                let low = *buf
                    .get(pos + 1)
                    .ok_or_else(|| DnsError::Protocol("truncated compression pointer".into()))?;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DnsError::Protocol("compression pointer loop".into()));
                }
                pos = ((len & 0x3F) << 8) | low as usize;
            }
            _ => return Err(DnsError::Protocol(format!("unsupported label type 0x{len:02x}"))),
        }
    }

    if name.is_empty() {
        name.push('.');
    }
    // `end` is always set once the loop breaks.
    Ok((name, end.unwrap_or(pos + 1)))
}

/// Recover the IPv4 address from an `in-addr.arpa.` name.
///
/// Returns `None` for anything that is not a complete four-octet reverse name.
pub fn reverse_to_ipv4(name: &str) -> Option<Ipv4Addr> {
    let lower = name.trim_end_matches('.').to_ascii_lowercase();
    let prefix = lower.strip_suffix(".in-addr.arpa")?;
    let octets: Vec<u8> = prefix
        .split('.')
        .map(|part| part.parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    match octets.as_slice() {
        [d, c, b, a] => Some(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        assert_eq!(normalize_name("Host.LAN"), "host.lan.");
        assert_eq!(normalize_name("host.lan."), "host.lan.");
        assert!(names_equal("Host.Lan.", "host.lan"));
    }

    #[test]
    fn encodes_and_rejects_long_labels() {
        assert_eq!(
            encode_dns_name("a.bc.").unwrap(),
            vec![1, b'a', 2, b'b', b'c', 0]
        );
        assert_eq!(encode_dns_name(".").unwrap(), vec![0]);

        let long = format!("{}.lan.", "x".repeat(64));
        assert!(encode_dns_name(&long).is_err());
        assert!(encode_dns_name("a..b.").is_err());
    }

    #[test]
    fn reads_compressed_names() {
        // "lan." at offset 0, then "host" + pointer to 0.
        let buf = [3, b'l', b'a', b'n', 0, 4, b'h', b'o', b's', b't', 0xC0, 0x00];
        let (name, next) = read_name(&buf, 5).unwrap();
        assert_eq!(name, "host.lan.");
        assert_eq!(next, 12);
    }

    #[test]
    fn rejects_pointer_loops() {
        let buf = [0xC0, 0x00];
        assert!(read_name(&buf, 0).is_err());
    }

    #[test]
    fn escapes_odd_bytes() {
        let buf = [3, b'a', b'.', 0x07, 0];
        let (name, _) = read_name(&buf, 0).unwrap();
        assert_eq!(name, "a\\.\\007.");
        assert_eq!(encode_dns_name(&name).unwrap(), buf.to_vec());
    }

    #[test]
    fn reverse_names() {
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert_eq!(reverse_to_ipv4("5.0.0.10.IN-ADDR.ARPA."), Some(ip));
        assert_eq!(reverse_to_ipv4("0.10.in-addr.arpa."), None);
        assert_eq!(reverse_to_ipv4("host.lan."), None);
    }
}
