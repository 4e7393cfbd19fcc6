//! HTTP/1.x framing helpers for the rewrite and colorize pipelines
//!
//! Messages are handled as raw bytes. A decoded message is a header block
//! (start line plus header lines, each CRLF-terminated, no blank line) and a
//! body with chunked transfer coding and gzip content coding removed.

use crate::error::PolicyError;
use crate::Result;
use flate2::read::MultiGzDecoder;
use std::io::Read;
use tracing::{debug, warn};

pub const CRLF: &[u8] = b"\r\n";

/// Header block and decoded body of one HTTP message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMessage {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    /// A chunked body was decoded and its Transfer-Encoding line dropped
    pub dechunked: bool,
    /// A gzip body was inflated and its Content-Encoding line dropped
    pub inflated: bool,
}

impl DecodedMessage {
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.body.is_empty()
    }

    /// Reassemble the message without re-applying any transfer or content coding
    pub fn recombine(&self) -> Vec<u8> {
        recombine(&self.header, &self.body)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split a raw message at the blank line ending the header block
///
/// Bare-LF framing is accepted. Without a blank line the whole input is header.
pub fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    let crlf = find(raw, b"\r\n\r\n").map(|i| (i, 4));
    let lf = find(raw, b"\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    };
    match split {
        Some((idx, len)) => (&raw[..idx], &raw[idx + len..]),
        None => (raw, &raw[raw.len()..]),
    }
}

/// Lines of a header block with line terminators removed
pub fn header_lines(head: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = head
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

fn join_lines<L: AsRef<[u8]>>(lines: &[L]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line.as_ref());
        out.extend_from_slice(CRLF);
    }
    out
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end.max(start)]
}

/// Split `Name: value` into its trimmed parts
pub fn split_header_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|b| *b == b':')?;
    Some((trim_bytes(&line[..colon]), trim_bytes(&line[colon + 1..])))
}

fn is_header(line: &[u8], name: &str) -> bool {
    split_header_line(line).is_some_and(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
}

/// First value of header `name` in a header block
pub fn header_value(header: &[u8], name: &str) -> Option<String> {
    header_lines(header)
        .into_iter()
        .skip(1)
        .filter_map(split_header_line)
        .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
}

/// Start line of a message
pub fn start_line(header: &[u8]) -> &[u8] {
    let (head, _) = split_header_body(header);
    let end = head.iter().position(|b| *b == b'\n').unwrap_or(head.len());
    let line = &head[..end];
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Decode a chunked body, ignoring chunk extensions and trailers
pub fn decode_chunked(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;
    loop {
        let line_end = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| PolicyError::codec("missing chunk size line"))?;
        let size_line = rest[..line_end].strip_suffix(b"\r").unwrap_or(&rest[..line_end]);
        let size_field = size_line
            .split(|b| *b == b';')
            .next()
            .unwrap_or_default();
        let size_field = trim_bytes(size_field);
        let size_str = std::str::from_utf8(size_field)
            .map_err(|_| PolicyError::codec("chunk size is not ascii"))?;
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|e| PolicyError::codec(format!("invalid chunk size {:?}: {}", size_str, e)))?;
        rest = &rest[line_end + 1..];

        if size == 0 {
            return Ok(out);
        }
        if rest.len() < size {
            return Err(PolicyError::codec(format!(
                "truncated chunk: want {} bytes, have {}",
                size,
                rest.len()
            )));
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size..];

        if rest.is_empty() {
            // Stream cut right after a chunk; keep what arrived
            return Ok(out);
        }
        rest = rest
            .strip_prefix(CRLF)
            .or_else(|| rest.strip_prefix(b"\n"))
            .ok_or_else(|| PolicyError::codec("chunk data not followed by CRLF"))?;
    }
}

/// Inflate a gzip body (multi-member streams included)
pub fn decode_gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    MultiGzDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| PolicyError::codec(format!("gzip: {}", e)))?;
    Ok(out)
}

/// Normalize a raw message into header block and decoded body
///
/// Decode failures are not fatal: the original body and its coding header are
/// kept and rules simply run against the encoded bytes.
pub fn decode_message(raw: &[u8]) -> DecodedMessage {
    let (head, body) = split_header_body(raw);
    let lines = header_lines(head);

    let mut chunked_at = None;
    let mut gzip_at = None;
    for (idx, line) in lines.iter().enumerate().skip(1) {
        let Some((name, value)) = split_header_line(line) else {
            continue;
        };
        let value = value.to_ascii_lowercase();
        if name.eq_ignore_ascii_case(b"transfer-encoding") && find(&value, b"chunked").is_some() {
            chunked_at.get_or_insert(idx);
        } else if name.eq_ignore_ascii_case(b"content-encoding") && find(&value, b"gzip").is_some()
        {
            gzip_at.get_or_insert(idx);
        }
    }

    let mut message = DecodedMessage {
        body: body.to_vec(),
        ..Default::default()
    };
    let mut dropped = Vec::new();

    if let Some(idx) = chunked_at {
        match decode_chunked(&message.body) {
            Ok(decoded) => {
                message.body = decoded;
                message.dechunked = true;
                dropped.push(idx);
            }
            Err(e) => warn!("Keeping chunked body as-is: {}", e),
        }
    }

    if let Some(idx) = gzip_at {
        match decode_gzip(&message.body) {
            Ok(decoded) => {
                message.body = decoded;
                message.inflated = true;
                dropped.push(idx);
            }
            Err(e) => warn!("Keeping gzip body as-is: {}", e),
        }
    }

    let kept: Vec<&[u8]> = lines
        .iter()
        .enumerate()
        .filter(|(idx, _)| !dropped.contains(idx))
        .map(|(_, line)| *line)
        .collect();
    message.header = join_lines(&kept);
    message
}

/// Join a header block and body, repairing Content-Length for the final body
///
/// The length is rewritten when the header already carries one or the body is
/// non-empty, and left alone while a Transfer-Encoding header is present.
pub fn recombine(header: &[u8], body: &[u8]) -> Vec<u8> {
    let header = if header_value(header, "transfer-encoding").is_some() {
        header.to_vec()
    } else if header_value(header, "content-length").is_some() || !body.is_empty() {
        set_header(header, "Content-Length", &body.len().to_string())
    } else {
        header.to_vec()
    };

    let mut out = Vec::with_capacity(header.len() + body.len() + 4);
    out.extend_from_slice(&header);
    if !header.is_empty() && !header.ends_with(CRLF) {
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(CRLF);
    out.extend_from_slice(body);
    out
}

/// Set header `name` to `value`, replacing the first occurrence or appending
pub fn set_header(header: &[u8], name: &str, value: &str) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = header_lines(header).into_iter().map(<[u8]>::to_vec).collect();
    let existing = lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, line)| is_header(line, name))
        .map(|(idx, _)| idx);

    match existing {
        Some(idx) => {
            let original_name = split_header_line(&lines[idx])
                .map(|(n, _)| n.to_vec())
                .unwrap_or_else(|| name.as_bytes().to_vec());
            let mut line = original_name;
            line.extend_from_slice(b": ");
            line.extend_from_slice(value.as_bytes());
            lines[idx] = line;
        }
        None => lines.push(format!("{}: {}", name, value).into_bytes()),
    }
    join_lines(&lines)
}

/// Merge `extra` name/value pairs into the request's Cookie header
///
/// Existing cookies keep their order; a pair with an existing name replaces
/// that value, new names are appended. Multiple Cookie lines collapse into one.
pub fn merge_cookies(header: &[u8], extra: &[(String, String)]) -> Vec<u8> {
    let lines = header_lines(header);
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut first_cookie_line = None;

    for (idx, line) in lines.iter().enumerate().skip(1) {
        if !is_header(line, "cookie") {
            continue;
        }
        first_cookie_line.get_or_insert(idx);
        let Some((_, value)) = split_header_line(line) else {
            continue;
        };
        for piece in String::from_utf8_lossy(value).split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let (name, value) = piece.split_once('=').unwrap_or((piece, ""));
            pairs.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    for (name, value) in extra {
        match pairs.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value.clone(),
            None => pairs.push((name.clone(), value.clone())),
        }
    }

    let merged = pairs
        .iter()
        .map(|(n, v)| format!("{}={}", n, v))
        .collect::<Vec<_>>()
        .join("; ");
    let cookie_line = format!("Cookie: {}", merged).into_bytes();

    let mut out: Vec<Vec<u8>> = Vec::with_capacity(lines.len() + 1);
    for (idx, line) in lines.iter().enumerate() {
        if Some(idx) == first_cookie_line {
            out.push(cookie_line.clone());
        } else if idx == 0 || !is_header(line, "cookie") {
            out.push(line.to_vec());
        }
    }
    if first_cookie_line.is_none() {
        out.push(cookie_line);
    }
    join_lines(&out)
}

/// Parts of a request line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a [u8],
    pub uri: &'a [u8],
    pub version: &'a [u8],
}

/// Split `METHOD SP request-target SP HTTP-version`
///
/// The target is everything between the first and last space, so targets
/// containing raw spaces survive. A line with a single space has no version.
pub fn parse_request_line(line: &[u8]) -> Option<RequestLine<'_>> {
    let first = line.iter().position(|b| *b == b' ')?;
    let last = line.iter().rposition(|b| *b == b' ')?;
    if last == first {
        return Some(RequestLine {
            method: &line[..first],
            uri: &line[first + 1..],
            version: &[],
        });
    }
    Some(RequestLine {
        method: &line[..first],
        uri: &line[first + 1..last],
        version: &line[last + 1..],
    })
}

impl RequestLine<'_> {
    /// Render the line with a different request target
    pub fn with_uri(&self, uri: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.method.len() + uri.len() + self.version.len() + 2);
        out.extend_from_slice(self.method);
        out.push(b' ');
        out.extend_from_slice(uri);
        if !self.version.is_empty() {
            out.push(b' ');
            out.extend_from_slice(self.version);
        }
        out
    }
}

/// Replace the start line of a header block
pub fn replace_start_line(header: &[u8], line: &[u8]) -> Vec<u8> {
    let mut lines = header_lines(header);
    if lines.is_empty() {
        lines.push(line);
    } else {
        lines[0] = line;
    }
    join_lines(&lines)
}

/// Repair a response before rules run on it
///
/// The status line must read `HTTP/x.y NNN [reason]`; a missing reason is
/// filled from the status code. Header lines without a colon are dropped and
/// line endings normalized to CRLF. The body is passed through untouched.
pub fn fix_response(raw: &[u8]) -> Result<Vec<u8>> {
    let (head, body) = split_header_body(raw);
    let lines = header_lines(head);
    let status = lines
        .first()
        .ok_or_else(|| PolicyError::codec("empty response"))?;
    let status_line = fix_status_line(status)?;

    let mut fixed = vec![status_line];
    for line in lines.iter().skip(1) {
        if split_header_line(line).is_some() {
            fixed.push(line.to_vec());
        } else {
            debug!(line = %String::from_utf8_lossy(line), "Dropping malformed response header line");
        }
    }

    let mut out = join_lines(&fixed);
    out.extend_from_slice(CRLF);
    out.extend_from_slice(body);
    Ok(out)
}

fn fix_status_line(line: &[u8]) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if !text.starts_with("HTTP/") {
        return Err(PolicyError::codec(format!("invalid status line {:?}", text)));
    }

    let mut parts = text.splitn(3, ' ');
    let version = parts.next().unwrap_or("HTTP/1.1");
    let code_text = parts.next().unwrap_or_default().trim();
    let reason = parts.next().unwrap_or_default().trim();

    let code = code_text
        .parse::<u16>()
        .ok()
        .filter(|_| code_text.len() == 3)
        .and_then(|c| http::StatusCode::from_u16(c).ok())
        .ok_or_else(|| PolicyError::codec(format!("invalid status code {:?}", code_text)))?;

    let reason = if reason.is_empty() {
        code.canonical_reason().unwrap_or_default()
    } else {
        reason
    };
    let line = if reason.is_empty() {
        format!("{} {}", version, code.as_u16())
    } else {
        format!("{} {} {}", version, code.as_u16(), reason)
    };
    Ok(line.into_bytes())
}
