// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-shape JSON, both directions.
//!
//! The recovery UI exchanges a handful of small, fixed-shape JSON documents.
//! Encoding writes them by concatenation into a caller-provided buffer,
//! after checking the buffer against a worst-case length computed from the
//! schema (field widths from [`BoardInfoRecord`], not from the live values).
//! Decoding is a four-token scanner -- object open, quoted name, separator,
//! value -- sufficient for the flat objects the UI posts; nesting, arrays,
//! and string escapes are out of scope and fail the parse.

use crate::util::{parse_u32, trim_leading};
use drv_update_api::{BoardInfoRecord, BootImgStatus, BootSelect};

/// Canonical bodies for command outcomes.
pub const STATUS_SUCCESS: &[u8] = b"{\"Status\":\"Success\"}";
pub const STATUS_FAILED: &[u8] = b"{\"Status\":\"Failed\"}";

/// Worst-case length of one board-info object: the record's fixed field
/// widths plus keys, quotes, and punctuation.
const BOARD_OBJ_MAX: usize = BoardInfoRecord::SIZE + 77;

/// Worst-case `sys_info` body: two board objects, their wrapping keys, the
/// outer braces, and one comma.
pub const SYS_INFO_MAX: usize = 2 * BOARD_OBJ_MAX + 15 + 9 + 3;

/// Worst-case `boot_img_status` body: both booleans `false`, both image
/// names at full width.
pub const BOOT_STATUS_MAX: usize = 90;

/// Worst-case `{"Progress":N}` with a full-width `u32`.
pub const ERASE_PROGRESS_MAX: usize = 23;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JsonError {
    BufferTooSmall,
}

struct Writer<'a> {
    out: &'a mut [u8],
    len: usize,
}

impl<'a> Writer<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, len: 0 }
    }

    fn put(&mut self, s: &[u8]) -> Result<(), JsonError> {
        let end = self
            .len
            .checked_add(s.len())
            .filter(|&e| e <= self.out.len())
            .ok_or(JsonError::BufferTooSmall)?;
        self.out[self.len..end].copy_from_slice(s);
        self.len = end;
        Ok(())
    }

    /// Writes `"key":"value",` (comma optional).
    fn put_str_field(
        &mut self,
        key: &str,
        value: &str,
        comma: bool,
    ) -> Result<(), JsonError> {
        self.put(b"\"")?;
        self.put(key.as_bytes())?;
        self.put(b"\":\"")?;
        self.put(value.as_bytes())?;
        self.put(if comma { b"\"," } else { b"\"" })
    }

    fn put_u32(&mut self, mut v: u32) -> Result<(), JsonError> {
        let mut digits = [0u8; 10];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (v % 10) as u8;
            v /= 10;
            if v == 0 {
                break;
            }
        }
        self.put(&digits[i..])
    }
}

fn put_board_obj(
    w: &mut Writer<'_>,
    key: &str,
    rec: &BoardInfoRecord,
) -> Result<(), JsonError> {
    w.put(b"\"")?;
    w.put(key.as_bytes())?;
    w.put(b"\":{")?;
    w.put_str_field("BrdName", rec.board_name(), true)?;
    w.put_str_field("RevisionNo", rec.revision(), true)?;
    w.put_str_field("SerialNo", rec.serial(), true)?;
    w.put_str_field("State", rec.state(), true)?;
    w.put_str_field("PartNo", rec.part_number(), true)?;
    w.put_str_field("UUID", rec.uuid(), false)?;
    w.put(b"}")
}

/// Encodes the `sys_info` document from the two ID EEPROM records.
pub fn encode_sys_info(
    board: &BoardInfoRecord,
    cc: &BoardInfoRecord,
    out: &mut [u8],
) -> Result<usize, JsonError> {
    if out.len() < SYS_INFO_MAX {
        return Err(JsonError::BufferTooSmall);
    }
    let mut w = Writer::new(out);
    w.put(b"{")?;
    put_board_obj(&mut w, "SysBoardInfo", board)?;
    w.put(b",")?;
    put_board_obj(&mut w, "CcInfo", cc)?;
    w.put(b"}")?;
    Ok(w.len)
}

/// Encodes the `boot_img_status` document.
pub fn encode_boot_img_status(
    status: &BootImgStatus,
    out: &mut [u8],
) -> Result<usize, JsonError> {
    if out.len() < BOOT_STATUS_MAX {
        return Err(JsonError::BufferTooSmall);
    }
    fn b(v: bool) -> &'static [u8] {
        if v {
            b"true"
        } else {
            b"false"
        }
    }
    let mut w = Writer::new(out);
    w.put(b"{\"ImgABootable\":")?;
    w.put(b(status.img_a_bootable))?;
    w.put(b",\"ImgBBootable\":")?;
    w.put(b(status.img_b_bootable))?;
    w.put(b",\"ReqBootImg\":\"")?;
    w.put(status.requested.as_str().as_bytes())?;
    w.put(b"\",\"LastBootImg\":\"")?;
    w.put(status.last_booted.as_str().as_bytes())?;
    w.put(b"\"}")?;
    Ok(w.len)
}

/// Encodes the erase progress document, `{"Progress":N}`.
pub fn encode_erase_progress(
    percent: u32,
    out: &mut [u8],
) -> Result<usize, JsonError> {
    if out.len() < ERASE_PROGRESS_MAX {
        return Err(JsonError::BufferTooSmall);
    }
    let mut w = Writer::new(out);
    w.put(b"{\"Progress\":")?;
    w.put_u32(percent)?;
    w.put(b"}")?;
    Ok(w.len)
}

/// Token scanner over a flat JSON object.
///
/// Yields quoted names, single-character separators, and values (quoted
/// strings or bare tokens). Any structural surprise returns `None` and the
/// caller abandons the document.
pub struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    /// Consumes the object-open brace; `None` if the document doesn't start
    /// with one.
    pub fn new(doc: &'a str) -> Option<Self> {
        let rest = doc.trim_start().strip_prefix('{')?;
        Some(Self { rest })
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Next quoted name, without its quotes.
    pub fn name(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = self.rest.strip_prefix('"')?;
        let end = rest.find('"')?;
        self.rest = &rest[end + 1..];
        Some(&rest[..end])
    }

    /// Next non-whitespace character, consumed.
    pub fn separator(&mut self) -> Option<char> {
        self.skip_ws();
        let c = self.rest.chars().next()?;
        self.rest = &self.rest[c.len_utf8()..];
        Some(c)
    }

    /// Next value: a quoted string (quotes stripped) or a bare token ending
    /// at whitespace, `,`, or `}`.
    pub fn value(&mut self) -> Option<&'a str> {
        self.skip_ws();
        if let Some(rest) = self.rest.strip_prefix('"') {
            let end = rest.find('"')?;
            self.rest = &rest[end + 1..];
            return Some(&rest[..end]);
        }
        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || c == ',' || c == '}')
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (tok, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(tok)
    }
}

fn parse_bool(tok: &str) -> Option<bool> {
    match tok {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_select(tok: &str) -> Option<BootSelect> {
    match tok {
        "ImageA" => Some(BootSelect::ImageA),
        "ImageB" => Some(BootSelect::ImageB),
        _ => None,
    }
}

/// Decodes a `cfg_boot_img` body into its bootable flags and requested
/// image. All three fields are required; unknown names are skipped; a
/// malformed value anywhere rejects the whole document.
pub fn decode_boot_cfg(body: &str) -> Option<(bool, bool, BootSelect)> {
    let mut s = Scanner::new(trim_leading(body))?;
    let mut img_a = None;
    let mut img_b = None;
    let mut req = None;
    loop {
        let name = s.name()?;
        if s.separator()? != ':' {
            return None;
        }
        let val = s.value()?;
        match name {
            "ImgABootable" => img_a = Some(parse_bool(val)?),
            "ImgBBootable" => img_b = Some(parse_bool(val)?),
            "ReqBootImg" => req = Some(parse_select(val)?),
            _ => (),
        }
        match s.separator()? {
            ',' => (),
            '}' => break,
            _ => return None,
        }
    }
    Some((img_a?, img_b?, req?))
}

/// Decodes a `validate_crc` body, returning the client's CRC32.
pub fn decode_crc(body: &str) -> Option<u32> {
    let mut s = Scanner::new(trim_leading(body))?;
    let mut crc = None;
    loop {
        let name = s.name()?;
        if s.separator()? != ':' {
            return None;
        }
        let val = s.value()?;
        if name == "crc" {
            crc = Some(parse_u32(val)?);
        }
        match s.separator()? {
            ',' => (),
            '}' => break,
            _ => return None,
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, uuid: &str) -> BoardInfoRecord {
        let mut r = BoardInfoRecord {
            board_name: [0; 20],
            revision: [0; 8],
            serial: [0; 20],
            state: [0; 8],
            part_number: [0; 20],
            uuid: [0; 36],
        };
        r.board_name[..name.len()].copy_from_slice(name.as_bytes());
        r.revision[..4].copy_from_slice(b"2.0B");
        r.serial[..6].copy_from_slice(b"XFL123");
        r.state[..4].copy_from_slice(b"PASS");
        r.part_number[..5].copy_from_slice(b"05082");
        r.uuid[..uuid.len()].copy_from_slice(uuid.as_bytes());
        r
    }

    #[test]
    fn sys_info_shape() {
        let board = record("VCK190", "aaaa");
        let cc = record("CC-VCK", "bbbb");
        let mut buf = [0u8; SYS_INFO_MAX];
        let n = encode_sys_info(&board, &cc, &mut buf).unwrap();
        let doc = core::str::from_utf8(&buf[..n]).unwrap();
        assert_eq!(
            doc,
            "{\"SysBoardInfo\":{\"BrdName\":\"VCK190\",\
             \"RevisionNo\":\"2.0B\",\"SerialNo\":\"XFL123\",\
             \"State\":\"PASS\",\"PartNo\":\"05082\",\"UUID\":\"aaaa\"},\
             \"CcInfo\":{\"BrdName\":\"CC-VCK\",\"RevisionNo\":\"2.0B\",\
             \"SerialNo\":\"XFL123\",\"State\":\"PASS\",\
             \"PartNo\":\"05082\",\"UUID\":\"bbbb\"}}"
        );
    }

    #[test]
    fn sys_info_needs_worst_case_room() {
        let board = record("X", "u");
        let mut buf = [0u8; SYS_INFO_MAX - 1];
        assert_eq!(
            encode_sys_info(&board, &board, &mut buf),
            Err(JsonError::BufferTooSmall)
        );
    }

    #[test]
    fn full_width_record_fits_the_bound() {
        let full = BoardInfoRecord {
            board_name: [b'n'; 20],
            revision: [b'r'; 8],
            serial: [b's'; 20],
            state: [b't'; 8],
            part_number: [b'p'; 20],
            uuid: [b'u'; 36],
        };
        let mut buf = [0u8; SYS_INFO_MAX];
        let n = encode_sys_info(&full, &full, &mut buf).unwrap();
        assert_eq!(n, SYS_INFO_MAX);
    }

    #[test]
    fn boot_status_shape() {
        let status = BootImgStatus {
            img_a_bootable: true,
            img_b_bootable: false,
            requested: BootSelect::ImageA,
            last_booted: BootSelect::ImageB,
        };
        let mut buf = [0u8; BOOT_STATUS_MAX];
        let n = encode_boot_img_status(&status, &mut buf).unwrap();
        assert_eq!(
            &buf[..n],
            b"{\"ImgABootable\":true,\"ImgBBootable\":false,\
              \"ReqBootImg\":\"ImageA\",\"LastBootImg\":\"ImageB\"}"
                .as_slice()
        );
    }

    #[test]
    fn erase_progress_shape() {
        let mut buf = [0u8; ERASE_PROGRESS_MAX];
        let n = encode_erase_progress(42, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"Progress\":42}");
        let n = encode_erase_progress(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"Progress\":0}");
    }

    #[test]
    fn boot_cfg_decodes_with_arbitrary_spacing() {
        let body = " { \"ImgABootable\" : true ,\r\n\
                    \"ImgBBootable\":false, \"ReqBootImg\": \"ImageB\" }";
        assert_eq!(
            decode_boot_cfg(body),
            Some((true, false, BootSelect::ImageB))
        );
    }

    #[test]
    fn boot_cfg_requires_all_three_fields() {
        assert_eq!(
            decode_boot_cfg("{\"ImgABootable\":true,\"ImgBBootable\":false}"),
            None
        );
    }

    #[test]
    fn boot_cfg_rejects_bad_values() {
        assert_eq!(
            decode_boot_cfg(
                "{\"ImgABootable\":maybe,\"ImgBBootable\":false,\
                 \"ReqBootImg\":\"ImageA\"}"
            ),
            None
        );
        assert_eq!(
            decode_boot_cfg(
                "{\"ImgABootable\":true,\"ImgBBootable\":false,\
                 \"ReqBootImg\":\"ImageC\"}"
            ),
            None
        );
    }

    #[test]
    fn boot_cfg_skips_unknown_names() {
        let body = "{\"Vendor\":\"xyz\",\"ImgABootable\":true,\
                    \"ImgBBootable\":true,\"ReqBootImg\":\"ImageA\"}";
        assert_eq!(
            decode_boot_cfg(body),
            Some((true, true, BootSelect::ImageA))
        );
    }

    #[test]
    fn crc_decode() {
        assert_eq!(decode_crc("{\"crc\":305419896}"), Some(305_419_896));
        assert_eq!(decode_crc("{\"crc\":\"305419896\"}"), Some(305_419_896));
        assert_eq!(decode_crc("{\"crc\":-1}"), None);
        assert_eq!(decode_crc("{\"checksum\":1}"), None);
        assert_eq!(decode_crc("not json"), None);
    }

    #[test]
    fn status_encode_decode_round_trip() {
        let status = BootImgStatus {
            img_a_bootable: false,
            img_b_bootable: true,
            requested: BootSelect::ImageB,
            last_booted: BootSelect::ImageA,
        };
        let mut buf = [0u8; BOOT_STATUS_MAX];
        let n = encode_boot_img_status(&status, &mut buf).unwrap();
        let doc = core::str::from_utf8(&buf[..n]).unwrap();
        // The UI posts back the same three fields it was shown.
        assert_eq!(
            decode_boot_cfg(doc),
            Some((false, true, BootSelect::ImageB))
        );
    }
}
