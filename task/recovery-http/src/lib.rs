// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware-recovery HTTP service.
//!
//! This crate is the application layer of the recovery web server: it owns
//! the per-connection argument pool, the request dispatcher, the static
//! file server, and the fixed-shape JSON codec, and it drives the flash
//! update sequencer in `drv-update-server-core`. It is written against two
//! narrow traits -- [`SocketTx`] for the network stack's transmit side and
//! [`AssetStore`] for the web UI's file system -- so the whole protocol
//! surface runs hosted under `cargo test` with in-memory fakes.
//!
//! The hosting event loop calls [`server::RecoveryServer`]'s `on_accept` /
//! `on_recv` / `on_sent` / `on_close` callbacks from a single thread and
//! calls `run_background_tasks` between network events; nothing here
//! expects concurrency.

#![cfg_attr(not(test), no_std)]

pub mod conn;
pub mod dispatch;
pub mod files;
pub mod json;
pub mod server;
pub mod util;

pub use server::RecoveryServer;

/// Transmit-side failure from the network stack. The server closes the
/// connection on any of these; there is no retry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NetError {
    SendFailed,
}

/// Transmit side of one TCP connection, as provided by the network stack.
pub trait SocketTx {
    /// Bytes the stack will currently accept without blocking or dropping.
    fn send_window(&self) -> usize;

    /// Queues `data` for transmission. File streaming bounds each chunk by
    /// [`send_window`](Self::send_window); small command responses are sent
    /// without consulting it and the stack is expected to buffer them.
    fn send(&mut self, data: &[u8]) -> Result<(), NetError>;

    /// Closes the connection once queued data drains.
    fn close(&mut self);
}

/// Read-only store holding the recovery UI's static assets.
///
/// Lookup is by bare name (no leading slash). The handle is whatever the
/// store needs to find the file again for chunked reads.
pub trait AssetStore {
    type Handle: Copy;

    /// Opens `name`, returning a handle and the file's size in bytes.
    fn open(&mut self, name: &str) -> Option<(Self::Handle, u32)>;

    /// Reads file bytes starting at `offset` into `out`, returning how many
    /// were produced (short only at end of file).
    fn read(&mut self, handle: Self::Handle, offset: u32, out: &mut [u8]) -> usize;
}
