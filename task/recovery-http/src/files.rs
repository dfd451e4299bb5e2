// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static asset names and content types.
//!
//! The web UI ships a small fixed set of files; lookup policy is
//! correspondingly simple. A path is mapped to a store name by dropping the
//! leading slash, a bare `/` (or any directory path) serves `index.htm`,
//! and names longer than [`MAX_FILENAME_LEN`] are rejected before the store
//! is consulted.

/// Longest asset name the server will look up.
pub const MAX_FILENAME_LEN: usize = 100;

const EXTENSIONS: &[(&str, &str)] = &[
    ("htm", "text/html"),
    ("jsn", "application/json"),
    ("js", "application/javascript"),
    ("css", "text/css"),
    ("ico", "image/x-icon"),
    ("svg", "image/svg+xml"),
];

/// Maps a request path to an asset-store name; `None` means the path is too
/// long and the request gets a 404.
pub fn resolve(path: &str) -> Option<heapless::String<MAX_FILENAME_LEN>> {
    let mut name: heapless::String<MAX_FILENAME_LEN> =
        heapless::String::new();
    name.push_str(path.strip_prefix('/').unwrap_or(path)).ok()?;
    if name.is_empty() || name.ends_with('/') {
        name.push_str("index.htm").ok()?;
    }
    Some(name)
}

/// Content type by file extension; anything unrecognized is plain text.
pub fn content_type(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, ct)| *ct)
        .unwrap_or("text/plain")
}
