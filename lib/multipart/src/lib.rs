// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `multipart/form-data` preamble parser for firmware image uploads.
//!
//! An image upload POST arrives split across an arbitrary number of TCP
//! segments, but the protocol guarantees that the entire preamble -- the
//! HTTP headers, the first boundary line, the part headers, and the blank
//! line before the payload -- fits in the *first* segment. This parser
//! scans only that first segment and produces an [`UploadDescriptor`]
//! locating the payload and sizing the image; every later segment is pure
//! payload/trailer bytes and never comes back here.
//!
//! The image size is computed arithmetically from the declared
//! `Content-Length`, subtracting the preamble span and the fixed size of the
//! trailing `--boundary--` framing. The constants involved (`2` and `5`)
//! mirror the exact CRLF layout produced by the recovery UI's upload client;
//! deriving the size by scanning for the terminating boundary instead would
//! change observable behavior for other clients, so the arithmetic is kept
//! as-is.
//!
//! If any part of the preamble is missing from the segment, parsing fails
//! closed: no descriptor, no flash traffic.

#![cfg_attr(not(test), no_std)]

use memchr::memchr;

/// Longest boundary we will track, including the leading `--`.
pub const MAX_BOUNDARY_LEN: usize = 1024;

const CONTENT_TYPE_PREFIX: &[u8] = b"Content-Type: multipart/form-data; boundary=";
const CONTENT_LENGTH_PREFIX: &[u8] = b"Content-Length: ";

/// Where the payload lives and how big the image is, derived from the first
/// segment of an upload POST.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadDescriptor {
    /// Boundary token, prefixed with `--` as it appears on boundary lines.
    pub boundary: heapless::Vec<u8, MAX_BOUNDARY_LEN>,
    /// Declared total body length from the `Content-Length` header.
    pub content_length: u32,
    /// Exact image payload size in bytes.
    pub image_size: u32,
    /// Offset of the first body byte (past the HTTP header block) within
    /// the parsed segment. `Content-Length` counts from here.
    pub body_start: usize,
    /// Offset of the first payload byte within the parsed segment.
    pub payload_start: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PreambleError {
    /// No `Content-Type: multipart/form-data; boundary=` header.
    MissingContentType,
    /// No `Content-Length` header, or its value is not a decimal number.
    MissingContentLength,
    /// Boundary token longer than [`MAX_BOUNDARY_LEN`].
    BoundaryTooLong,
    /// The body never repeats the boundary line.
    BoundaryNotFound,
    /// No blank line after the part headers, so no payload in this segment.
    PayloadNotFound,
}

/// Iterator over `\n`-terminated lines of a byte buffer, yielding
/// `(offset, line)` with the line's `\r`/`\n` terminators still attached.
struct Lines<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let start = self.pos;
        let rest = &self.buf[start..];
        match memchr(b'\n', rest) {
            Some(i) => {
                self.pos = start + i + 1;
                Some((start, &rest[..=i]))
            }
            None => {
                self.pos = self.buf.len();
                Some((start, rest))
            }
        }
    }
}

/// Strips a trailing `\r\n` or `\n` from a line.
fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Bounded decimal parse; rejects empty input and overflow.
fn parse_dec(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() {
        return None;
    }
    let mut v: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
    }
    Some(v)
}

/// Parses the complete upload preamble out of the first segment of a POST.
///
/// `segment` is the whole TCP segment, request line included. On success the
/// returned descriptor's `payload_start` indexes into this same segment;
/// bytes from there on (up to `image_size`, whichever ends first) are image
/// data.
pub fn parse_preamble(segment: &[u8]) -> Result<UploadDescriptor, PreambleError> {
    let mut boundary: heapless::Vec<u8, MAX_BOUNDARY_LEN> = heapless::Vec::new();
    let mut content_length: Option<u32> = None;
    let mut body_start = None;

    // Phase 1 and 2: walk the HTTP headers, capturing the boundary and the
    // declared content length, until the blank line ending the header block.
    let mut lines = Lines::new(segment);
    for (off, line) in &mut lines {
        if line.first() == Some(&b'\r') || line.first() == Some(&b'\n') {
            body_start = Some(off + line.len());
            break;
        }
        let bare = strip_eol(line);
        if let Some(token) = bare.strip_prefix(CONTENT_TYPE_PREFIX) {
            if boundary.is_empty() {
                boundary
                    .extend_from_slice(b"--")
                    .map_err(|_| PreambleError::BoundaryTooLong)?;
                boundary
                    .extend_from_slice(token)
                    .map_err(|_| PreambleError::BoundaryTooLong)?;
            }
        } else if let Some(value) = bare.strip_prefix(CONTENT_LENGTH_PREFIX) {
            content_length = parse_dec(value);
        }
    }

    if boundary.is_empty() {
        return Err(PreambleError::MissingContentType);
    }
    let content_length =
        content_length.ok_or(PreambleError::MissingContentLength)?;
    let body_start = body_start.ok_or(PreambleError::PayloadNotFound)?;

    // Phase 3: find the boundary line in the body.
    let mut boundary_line = None;
    let mut body_lines = Lines::new(&segment[body_start..]);
    for (off, line) in &mut body_lines {
        if line.starts_with(&boundary) {
            boundary_line = Some(off);
            break;
        }
    }
    let boundary_line = boundary_line.ok_or(PreambleError::BoundaryNotFound)?;

    // Phase 4: the next blank line ends the part headers; the payload begins
    // two bytes (one CRLF) past it. The line must carry its full CRLF: a
    // bare `\r` at the end of the segment means the blank line was split
    // across segments and the preamble guarantee is broken, so the offsets
    // it would produce point past the segment.
    for (off, line) in body_lines {
        if line.starts_with(b"\r\n") {
            let span = (off - boundary_line) as u32;
            let overhead = span
                .checked_add(2 + boundary.len() as u32 + 5)
                .ok_or(PreambleError::PayloadNotFound)?;
            let image_size = content_length
                .checked_sub(overhead)
                .ok_or(PreambleError::PayloadNotFound)?;
            return Ok(UploadDescriptor {
                boundary,
                content_length,
                image_size,
                body_start,
                payload_start: body_start + off + 2,
            });
        }
    }

    Err(PreambleError::PayloadNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a complete upload POST the way the recovery UI does, returning
    /// the request bytes and the offset where the payload landed.
    fn build_post(boundary: &str, payload: &[u8]) -> (Vec<u8>, usize) {
        let part_headers = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"img.bin\"\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n"
        );
        // The reference client terminates the body with CRLF, the closing
        // boundary, and a bare CR -- boundary_len + 5 bytes past the payload,
        // which is exactly what the size arithmetic accounts for.
        let trailer = format!("\r\n--{boundary}--\r");
        let content_length = part_headers.len() + payload.len() + trailer.len();

        let mut req = format!(
            "POST /download_imgA HTTP/1.1\r\n\
             Host: recovery\r\n\
             Content-Type: multipart/form-data; boundary={boundary}\r\n\
             Content-Length: {content_length}\r\n\
             \r\n"
        )
        .into_bytes();
        req.extend_from_slice(part_headers.as_bytes());
        let payload_start = req.len();
        req.extend_from_slice(payload);
        req.extend_from_slice(trailer.as_bytes());
        (req, payload_start)
    }

    #[test]
    fn well_formed_preamble() {
        let payload = b"firmware image bytes".as_slice();
        let (req, payload_start) = build_post("XYZ", payload);

        let d = parse_preamble(&req).unwrap();
        assert_eq!(d.boundary.as_slice(), b"--XYZ");
        assert_eq!(d.payload_start, payload_start);
        assert_eq!(d.image_size as usize, payload.len());
        // The body begins at the first boundary line.
        assert!(req[d.body_start..].starts_with(b"--XYZ"));
        assert_eq!(
            req.len() - d.body_start,
            d.content_length as usize
        );
    }

    #[test]
    fn browser_style_boundary() {
        let payload = vec![0xA5u8; 4096];
        let (req, payload_start) =
            build_post("----WebKitFormBoundaryn3BJWJoZSX6zY1loc", &payload);

        let d = parse_preamble(&req).unwrap();
        assert_eq!(d.payload_start, payload_start);
        assert_eq!(d.image_size as usize, payload.len());
    }

    #[test]
    fn missing_content_type_fails_closed() {
        let req = b"POST /download_imgA HTTP/1.1\r\n\
                    Content-Length: 100\r\n\
                    \r\n\
                    --XYZ\r\n\r\ndata";
        assert_eq!(
            parse_preamble(req),
            Err(PreambleError::MissingContentType)
        );
    }

    #[test]
    fn missing_content_length_fails_closed() {
        let req = b"POST /download_imgA HTTP/1.1\r\n\
                    Content-Type: multipart/form-data; boundary=XYZ\r\n\
                    \r\n\
                    --XYZ\r\n\r\ndata";
        assert_eq!(
            parse_preamble(req),
            Err(PreambleError::MissingContentLength)
        );
    }

    #[test]
    fn boundary_never_repeated_in_body() {
        let req = b"POST /download_imgA HTTP/1.1\r\n\
                    Content-Type: multipart/form-data; boundary=XYZ\r\n\
                    Content-Length: 64\r\n\
                    \r\n\
                    not a boundary\r\n";
        assert_eq!(parse_preamble(req), Err(PreambleError::BoundaryNotFound));
    }

    #[test]
    fn preamble_truncated_before_payload() {
        // Boundary line present but the part headers never end: the upload
        // violates the one-segment preamble guarantee and must be rejected.
        let req = b"POST /download_imgA HTTP/1.1\r\n\
                    Content-Type: multipart/form-data; boundary=XYZ\r\n\
                    Content-Length: 64\r\n\
                    \r\n\
                    --XYZ\r\n\
                    Content-Disposition: form-data; name=\"file\"\r\n";
        assert_eq!(parse_preamble(req), Err(PreambleError::PayloadNotFound));
    }

    #[test]
    fn blank_line_split_across_segments_fails_closed() {
        // The part-header blank line lost its `\n` to the next segment; a
        // descriptor here would locate the payload past the segment end.
        let req = b"POST /download_imgA HTTP/1.1\r\n\
                    Content-Type: multipart/form-data; boundary=XYZ\r\n\
                    Content-Length: 64\r\n\
                    \r\n\
                    --XYZ\r\n\
                    Content-Disposition: form-data; name=\"file\"\r\n\r";
        assert_eq!(parse_preamble(req), Err(PreambleError::PayloadNotFound));
    }

    #[test]
    fn content_length_must_cover_framing() {
        // Declared length smaller than the multipart framing itself.
        let req = b"POST /download_imgA HTTP/1.1\r\n\
                    Content-Type: multipart/form-data; boundary=XYZ\r\n\
                    Content-Length: 3\r\n\
                    \r\n\
                    --XYZ\r\n\
                    Content-Disposition: form-data\r\n\
                    \r\n";
        assert_eq!(parse_preamble(req), Err(PreambleError::PayloadNotFound));
    }

    #[test]
    fn megabyte_image_sizes_exactly() {
        let payload = vec![0u8; 1 << 20];
        let (req, _) = build_post("XYZ", &payload);
        let d = parse_preamble(&req).unwrap();
        assert_eq!(d.image_size, 1 << 20);
    }
}
