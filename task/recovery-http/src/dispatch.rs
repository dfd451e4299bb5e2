// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request-line parsing, route tables, and response framing.
//!
//! Routing is two fixed tables keyed on the exact request path: every GET
//! path that isn't a named operation is a file lookup, and every POST path
//! that isn't a named command is a 404. There is no pattern matching and no
//! query-string handling; the recovery UI doesn't use either.

use core::fmt::Write as _;

use drv_update_api::BootSlot;

/// One transmit buffer's worth of response. Command responses and headers
/// always fit; the 404 echo is truncated to fit.
pub const MAX_RESPONSE_LEN: usize = 1024;

const HEADER_ROOM: usize = 128;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Head,
    Post,
    Unknown,
}

/// Splits the request line into method and path. A request too mangled to
/// contain both comes back as `(Unknown, None)` and earns a 404.
pub fn parse_request_line(segment: &[u8]) -> (Method, Option<&str>) {
    let line_end = segment
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(segment.len());
    let line = &segment[..line_end];

    let mut fields = line.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let method = match fields.next() {
        Some(b"GET") => Method::Get,
        Some(b"HEAD") => Method::Head,
        Some(b"POST") => Method::Post,
        _ => return (Method::Unknown, None),
    };
    let path = fields.next().and_then(|p| core::str::from_utf8(p).ok());
    (method, path)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GetRoute<'a> {
    SysInfo,
    BootImgStatus,
    FlashErase(BootSlot),
    FlashEraseStatus,
    /// Anything else is a file lookup.
    File(&'a str),
}

pub fn get_route(path: &str) -> GetRoute<'_> {
    match path {
        "/sys_info" => GetRoute::SysInfo,
        "/boot_img_status" => GetRoute::BootImgStatus,
        "/flash_erase_imgA" => GetRoute::FlashErase(BootSlot::ImageA),
        "/flash_erase_imgB" => GetRoute::FlashErase(BootSlot::ImageB),
        "/flash_erase_imgWIC" => GetRoute::FlashErase(BootSlot::Wic),
        "/flash_erase_status" => GetRoute::FlashEraseStatus,
        other => GetRoute::File(other),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PostRoute {
    CfgBootImg,
    DownloadImg(BootSlot),
    ValidateCrc,
}

pub fn post_route(path: &str) -> Option<PostRoute> {
    match path {
        "/cfg_boot_img" => Some(PostRoute::CfgBootImg),
        "/download_imgA" => Some(PostRoute::DownloadImg(BootSlot::ImageA)),
        "/download_imgB" => Some(PostRoute::DownloadImg(BootSlot::ImageB)),
        "/download_imgWIC" => Some(PostRoute::DownloadImg(BootSlot::Wic)),
        "/validate_crc" => Some(PostRoute::ValidateCrc),
        _ => None,
    }
}

/// Writes a `200 OK` header into `out`. `Content-Length` is always present
/// so the browser never waits on a close to delimit the body.
pub fn build_response_header(
    content_type: &str,
    content_length: u32,
    out: &mut [u8],
) -> Option<usize> {
    let mut header: heapless::String<HEADER_ROOM> = heapless::String::new();
    write!(
        header,
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {content_length}\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .ok()?;
    let bytes = header.as_bytes();
    out.get_mut(..bytes.len())?.copy_from_slice(bytes);
    Some(bytes.len())
}

/// Writes a complete 404 response, echoing the offending request in the
/// body. The echo is truncated so the whole response fits `out`.
pub fn build_not_found(request: &[u8], out: &mut [u8]) -> usize {
    const PREFIX: &[u8] = b"404 Not Found\r\n";

    let room = out
        .len()
        .saturating_sub(HEADER_ROOM + PREFIX.len());
    let echo = &request[..request.len().min(room)];
    let body_len = PREFIX.len() + echo.len();

    let mut header: heapless::String<HEADER_ROOM> = heapless::String::new();
    if write!(
        header,
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {body_len}\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .is_err()
    {
        return 0;
    }

    let mut len = 0;
    for part in [header.as_bytes(), PREFIX, echo] {
        out[len..len + part.len()].copy_from_slice(part);
        len += part.len();
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_parsing() {
        assert_eq!(
            parse_request_line(b"GET /sys_info HTTP/1.1\r\nHost: x\r\n"),
            (Method::Get, Some("/sys_info"))
        );
        assert_eq!(
            parse_request_line(b"POST /validate_crc HTTP/1.1\r\n"),
            (Method::Post, Some("/validate_crc"))
        );
        assert_eq!(
            parse_request_line(b"HEAD / HTTP/1.1\r\n"),
            (Method::Head, Some("/"))
        );
        assert_eq!(
            parse_request_line(b"BREW /coffee HTCPCP/1.0\r\n"),
            (Method::Unknown, None)
        );
        assert_eq!(parse_request_line(b"GET\r\n"), (Method::Get, None));
    }

    #[test]
    fn get_routes() {
        assert_eq!(get_route("/sys_info"), GetRoute::SysInfo);
        assert_eq!(get_route("/boot_img_status"), GetRoute::BootImgStatus);
        assert_eq!(
            get_route("/flash_erase_imgA"),
            GetRoute::FlashErase(BootSlot::ImageA)
        );
        assert_eq!(
            get_route("/flash_erase_imgWIC"),
            GetRoute::FlashErase(BootSlot::Wic)
        );
        assert_eq!(get_route("/flash_erase_status"), GetRoute::FlashEraseStatus);
        assert_eq!(get_route("/index.htm"), GetRoute::File("/index.htm"));
        // A near-miss on a named route is a file lookup, not an error.
        assert_eq!(
            get_route("/flash_erase_imgC"),
            GetRoute::File("/flash_erase_imgC")
        );
    }

    #[test]
    fn post_routes() {
        assert_eq!(post_route("/cfg_boot_img"), Some(PostRoute::CfgBootImg));
        assert_eq!(
            post_route("/download_imgB"),
            Some(PostRoute::DownloadImg(BootSlot::ImageB))
        );
        assert_eq!(post_route("/validate_crc"), Some(PostRoute::ValidateCrc));
        assert_eq!(post_route("/sys_info"), None);
    }

    #[test]
    fn response_header_shape() {
        let mut buf = [0u8; MAX_RESPONSE_LEN];
        let n =
            build_response_header("application/json", 20, &mut buf).unwrap();
        let s = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 20\r\n"));
        assert!(s.contains("Connection: close\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn not_found_echoes_request() {
        let req = b"GET /nonexistent.htm HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut buf = [0u8; MAX_RESPONSE_LEN];
        let n = build_not_found(req, &mut buf);
        let s = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(s.contains("GET /nonexistent.htm"));
    }

    #[test]
    fn not_found_truncates_huge_requests() {
        let req = vec![b'A'; 4096];
        let mut buf = [0u8; MAX_RESPONSE_LEN];
        let n = build_not_found(&req, &mut buf);
        assert!(n <= buf.len());
        // Content-Length matches the truncated body.
        let s = core::str::from_utf8(&buf[..n]).unwrap();
        let lenline = s
            .lines()
            .find(|l| l.starts_with("Content-Length: "))
            .unwrap();
        let declared: usize =
            lenline["Content-Length: ".len()..].parse().unwrap();
        let body = &s[s.find("\r\n\r\n").unwrap() + 4..];
        assert_eq!(body.len(), declared);
    }
}
