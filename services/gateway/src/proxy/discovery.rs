//! Destination-hostname discovery from the initial peeked bytes.
//!
//! Three tiers, in order: an HTTP/1.x `Host:` header, a TLS ClientHello
//! SNI (the inner TLS is never terminated, only peeked), and a literal
//! match of a known zone name in the printable prefix. The tiers have
//! known false-positive and false-negative modes; whatever is matched,
//! the full peeked buffer is forwarded unchanged.

use crate::store::{normalize_name, zone_matches};

/// Try each discovery tier against the buffer.
///
/// `zone_names` (normalized) feed the literal tier; the returned
/// hostname is normalized but not yet authorized.
pub fn discover_hostname(buffer: &[u8], zone_names: &[String]) -> Option<String> {
    if let Some(host) = parse_host_header(buffer) {
        return Some(host);
    }
    if let Some(host) = parse_sni(buffer) {
        return Some(host);
    }
    zone_literal(buffer, zone_names)
}

/// Find an HTTP/1.x `Host:` header anywhere in the buffer.
///
/// Only complete (newline-terminated) lines are considered: the header
/// value may still be arriving, and a truncated hostname must not route.
fn parse_host_header(buffer: &[u8]) -> Option<String> {
    let end = buffer.iter().rposition(|&b| b == b'\n')?;
    for line in buffer[..end].split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() < 5 || !line[..5].eq_ignore_ascii_case(b"host:") {
            continue;
        }
        let value = std::str::from_utf8(&line[5..]).ok()?.trim();
        // Strip a port suffix; bracketed IPv6 literals never name a zone.
        let host = value.split(':').next().unwrap_or(value);
        if host.is_empty() {
            return None;
        }
        return Some(normalize_name(host));
    }
    None
}

/// Parse SNI out of a TLS ClientHello, if the buffer starts with one.
///
/// TLS record: type (0x16 = handshake), version, length; then the
/// ClientHello: type (0x01), length, version, random, session id,
/// cipher suites, compression methods, extensions. SNI is extension 0.
pub fn parse_sni(buffer: &[u8]) -> Option<String> {
    // Record header (5) + handshake type and length (4).
    if buffer.len() < 9 || buffer[0] != 0x16 {
        return None;
    }

    let handshake = &buffer[5..];
    if handshake[0] != 0x01 {
        return None;
    }

    let client_hello = &handshake[4..];
    if client_hello.len() < 35 {
        return None;
    }

    // Version (2) + random (32).
    let mut pos = 34;

    let session_id_len = *client_hello.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len =
        u16::from_be_bytes([*client_hello.get(pos)?, *client_hello.get(pos + 1)?]) as usize;
    pos += 2 + cipher_suites_len;

    let compression_len = *client_hello.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len =
        u16::from_be_bytes([*client_hello.get(pos)?, *client_hello.get(pos + 1)?]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(client_hello.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
        pos += 4;

        if ext_type == 0x0000 {
            let ext = client_hello.get(pos..pos + ext_len)?;
            return parse_sni_extension(ext);
        }
        pos += ext_len;
    }

    None
}

/// SNI extension: 2-byte list length, then entries of name type (0 =
/// hostname), 2-byte length, and the name.
fn parse_sni_extension(data: &[u8]) -> Option<String> {
    let list_len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    let mut pos = 2;

    while pos + 3 <= 2 + list_len {
        let name_type = *data.get(pos)?;
        let name_len = u16::from_be_bytes([*data.get(pos + 1)?, *data.get(pos + 2)?]) as usize;
        pos += 3;

        if name_type == 0 {
            let name = data.get(pos..pos + name_len)?;
            let hostname = std::str::from_utf8(name).ok()?;
            return Some(normalize_name(hostname));
        }
        pos += name_len;
    }

    None
}

/// Best-effort literal scan: tokenize the printable prefix on hostname
/// boundaries and return the first token inside a known zone.
fn zone_literal(buffer: &[u8], zone_names: &[String]) -> Option<String> {
    let printable_len = buffer
        .iter()
        .position(|&b| !(b.is_ascii_graphic() || b.is_ascii_whitespace()))
        .unwrap_or(buffer.len());
    let prefix = std::str::from_utf8(&buffer[..printable_len]).ok()?;
    let prefix = prefix.to_lowercase();

    for token in prefix.split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-')) {
        let token = token.trim_matches('.');
        if token.is_empty() {
            continue;
        }
        if zone_names.iter().any(|zone| zone_matches(token, zone)) {
            return Some(token.to_string());
        }
    }

    None
}
