//! Minimal HTTP/1.1 framing for the remote store client.
//!
//! Requests are written into a caller-provided buffer and responses are
//! parsed in place; nothing here touches the network.

use core::fmt::Write as FmtWrite;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Patch,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpError {
    Overflow,
    Malformed,
}

/// Write a complete request (head and body) into `out`, returning its length.
pub fn write_request(
    out: &mut [u8],
    method: Method,
    host: &str,
    target: &str,
    body: &[u8],
) -> Result<usize, HttpError> {
    let mut head: heapless::String<384> = heapless::String::new();
    write!(
        head,
        "{} {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        method.as_str(),
        target,
        host,
        body.len()
    )
    .map_err(|_| HttpError::Overflow)?;

    let total = head.len() + body.len();
    if total > out.len() {
        return Err(HttpError::Overflow);
    }
    out[..head.len()].copy_from_slice(head.as_bytes());
    out[head.len()..total].copy_from_slice(body);
    Ok(total)
}

pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

pub fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header_str = core::str::from_utf8(header).ok()?;
    for line in header_str.lines() {
        // Case-insensitive prefix check without allocation
        if line.len() >= 15 && line[..15].eq_ignore_ascii_case("content-length:") {
            return line[15..].trim().parse().ok();
        }
    }
    None
}

/// True once `data` holds a full response with a declared length.
/// Responses without Content-Length are complete when the peer closes.
pub fn is_complete(data: &[u8]) -> bool {
    match find_header_end(data) {
        Some(header_end) => match parse_content_length(&data[..header_end]) {
            Some(len) => data.len() >= header_end + 4 + len,
            None => false,
        },
        None => false,
    }
}

/// Split a buffered response into status code and body.
pub fn parse_response(data: &[u8]) -> Result<(u16, &[u8]), HttpError> {
    let header_end = find_header_end(data).ok_or(HttpError::Malformed)?;
    let header = core::str::from_utf8(&data[..header_end]).map_err(|_| HttpError::Malformed)?;

    let status_line = header.lines().next().ok_or(HttpError::Malformed)?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or(HttpError::Malformed)?;

    let mut body = &data[header_end + 4..];
    if let Some(len) = parse_content_length(&data[..header_end]) {
        if body.len() < len {
            return Err(HttpError::Malformed);
        }
        body = &body[..len];
    }
    Ok((status, body))
}

/// Parse a dotted IPv4 address without heap allocation.
pub fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut octet_idx = 0;

    for part in s.split('.') {
        if octet_idx >= 4 {
            return None;
        }
        octets[octet_idx] = part.parse().ok()?;
        octet_idx += 1;
    }

    if octet_idx == 4 {
        Some(octets)
    } else {
        None
    }
}

/// Append `s` percent-encoded (RFC 3986 unreserved characters pass through).
pub fn push_encoded<const N: usize>(out: &mut heapless::String<N>, s: &str) -> Result<(), HttpError> {
    for byte in s.bytes() {
        let unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~');
        if unreserved {
            out.push(byte as char).map_err(|_| HttpError::Overflow)?;
        } else {
            write!(out, "%{:02X}", byte).map_err(|_| HttpError::Overflow)?;
        }
    }
    Ok(())
}
