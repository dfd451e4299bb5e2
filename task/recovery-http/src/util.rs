// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Small text helpers shared by the JSON scanner and the dispatcher.

/// Strips leading spaces and tabs.
pub fn trim_leading(s: &str) -> &str {
    s.trim_start_matches([' ', '\t'])
}

/// True if `s` is a non-empty run of ASCII digits.
pub fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Bounded decimal parse. Rejects empty input, non-digits, and values that
/// overflow `u32`; no sign, no whitespace.
pub fn parse_u32(s: &str) -> Option<u32> {
    if !is_number(s) {
        return None;
    }
    let mut v: u32 = 0;
    for b in s.bytes() {
        v = v.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
    }
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_leading_spaces_and_tabs() {
        assert_eq!(trim_leading("  \t x "), "x ");
        assert_eq!(trim_leading("x"), "x");
        assert_eq!(trim_leading(""), "");
    }

    #[test]
    fn number_classification() {
        assert!(is_number("0"));
        assert!(is_number("1048582"));
        assert!(!is_number(""));
        assert!(!is_number("12a"));
        assert!(!is_number("-1"));
    }

    #[test]
    fn parse_u32_bounds() {
        assert_eq!(parse_u32("4294967295"), Some(u32::MAX));
        assert_eq!(parse_u32("4294967296"), None);
        assert_eq!(parse_u32(""), None);
        assert_eq!(parse_u32("01"), Some(1));
    }
}
