//! Wire framing: protocol versions, the ASCII preamble, headers, chunking.
//!
//! A frame is `pysoa-redis/<v>//` followed by zero or more
//! `header:value;` pairs and then the serialized envelope bytes (or one
//! chunk of them). Version 1 frames are bare envelope bytes with no
//! preamble; version 2 adds the `content-type` header; version 3 adds
//! `chunk-count`/`chunk-id` for chunked responses. Requests are never
//! chunked.

use crate::errors::MalformedMessage;

const PREAMBLE_MARKER: &[u8] = b"pysoa-redis/";
const PREAMBLE_TERMINATOR: &[u8] = b"//";

/// The wire protocol version in effect for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1,
    V2,
    V3,
}

impl ProtocolVersion {
    pub fn from_number(number: u64) -> Option<Self> {
        match number {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            3 => Some(ProtocolVersion::V3),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }

    /// The ASCII preamble emitted for this version (empty for version 1).
    pub fn preamble(self) -> Vec<u8> {
        match self {
            ProtocolVersion::V1 => Vec::new(),
            other => format!("pysoa-redis/{}//", other.number()).into_bytes(),
        }
    }

    pub fn supports_content_type_header(self) -> bool {
        self >= ProtocolVersion::V2
    }

    pub fn supports_chunking(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// Identifies the version of a received frame and strips the preamble.
    ///
    /// Frames carrying the marker name their version explicitly. For
    /// compatibility with older peers that sent the `content-type` header
    /// with no marker, a frame starting with `content-type` is treated as
    /// version 2. Anything else is a version-1 frame.
    pub fn extract(data: &[u8]) -> Result<(Self, &[u8]), MalformedMessage> {
        if let Some(rest) = data.strip_prefix(PREAMBLE_MARKER) {
            let digits_end = rest.iter().position(|b| !b.is_ascii_digit()).unwrap_or(rest.len());
            let (digits, terminated) = rest.split_at(digits_end);
            if digits.is_empty() || !terminated.starts_with(PREAMBLE_TERMINATOR) {
                return Err(MalformedMessage("malformed protocol preamble".to_owned()));
            }
            let number: u64 = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| MalformedMessage("malformed protocol preamble".to_owned()))?;
            let version = ProtocolVersion::from_number(number).ok_or_else(|| {
                MalformedMessage(format!("unsupported protocol version {}", number))
            })?;
            return Ok((version, &terminated[PREAMBLE_TERMINATOR.len()..]));
        }
        if data.starts_with(b"content-type") {
            return Ok((ProtocolVersion::V2, data));
        }
        Ok((ProtocolVersion::V1, data))
    }
}

/// The headers a frame may carry. Unknown header names are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub content_type: Option<String>,
    pub chunk_count: Option<u32>,
    pub chunk_id: Option<u32>,
}

fn is_header_name_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b == b'-'
}

fn is_header_value_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'/' | b'.' | b'-')
}

/// Parses leading `header:value;` pairs off a frame, returning the headers
/// and the remaining payload. Parsing stops at the first byte sequence
/// that does not look like a header, so binary payloads pass through
/// untouched.
pub fn extract_headers(mut data: &[u8]) -> (Headers, &[u8]) {
    let mut headers = Headers::default();
    loop {
        let Some((name, value, rest)) = match_header(data) else {
            return (headers, data);
        };
        match name {
            "content-type" => headers.content_type = Some(value.to_owned()),
            "chunk-count" => headers.chunk_count = value.parse().ok(),
            "chunk-id" => headers.chunk_id = value.parse().ok(),
            _ => {}
        }
        data = rest;
        // Tolerate space padding between headers from foreign producers.
        while let [b' ' | b'\t', rest @ ..] = data {
            data = rest;
        }
    }
}

fn match_header(data: &[u8]) -> Option<(&str, &str, &[u8])> {
    let name_end = data.iter().position(|b| !is_header_name_byte(*b))?;
    if name_end == 0 {
        return None;
    }
    let mut cursor = name_end;
    while data.get(cursor) == Some(&b' ') || data.get(cursor) == Some(&b'\t') {
        cursor += 1;
    }
    if data.get(cursor) != Some(&b':') {
        return None;
    }
    cursor += 1;
    while data.get(cursor) == Some(&b' ') || data.get(cursor) == Some(&b'\t') {
        cursor += 1;
    }
    let value_start = cursor;
    while data.get(cursor).is_some_and(|b| is_header_value_byte(*b)) {
        cursor += 1;
    }
    let value_end = cursor;
    while data.get(cursor) == Some(&b' ') || data.get(cursor) == Some(&b'\t') {
        cursor += 1;
    }
    if data.get(cursor) != Some(&b';') {
        return None;
    }
    let name = std::str::from_utf8(&data[..name_end]).ok()?;
    let value = std::str::from_utf8(&data[value_start..value_end]).ok()?;
    Some((name, value, &data[cursor + 1..]))
}

fn header_bytes(name: &str, value: &str) -> Vec<u8> {
    format!("{}:{};", name, value).into_bytes()
}

/// Frames a serialized envelope for the wire.
///
/// With `chunk_size` set (server responses over the chunking threshold,
/// version 3 peers only), the payload is split into `ceil(len/chunk_size)`
/// frames, each carrying `chunk-count` and a 1-based `chunk-id`.
pub fn build_frames(
    version: ProtocolVersion,
    content_type: &str,
    payload: &[u8],
    chunk_size: Option<usize>,
) -> Vec<Vec<u8>> {
    let preamble = version.preamble();
    let content_type_header = if version.supports_content_type_header() {
        header_bytes("content-type", content_type)
    } else {
        Vec::new()
    };

    if let Some(chunk_size) = chunk_size.filter(|size| *size > 0 && payload.len() > *size) {
        debug_assert!(version.supports_chunking());
        let chunk_count = payload.len().div_ceil(chunk_size);
        return payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let mut frame = preamble.clone();
                frame.extend_from_slice(&content_type_header);
                frame.extend_from_slice(&header_bytes("chunk-count", &chunk_count.to_string()));
                frame.extend_from_slice(&header_bytes("chunk-id", &(index + 1).to_string()));
                frame.extend_from_slice(chunk);
                frame
            })
            .collect();
    }

    let mut frame = preamble;
    frame.extend_from_slice(&content_type_header);
    frame.extend_from_slice(payload);
    vec![frame]
}
