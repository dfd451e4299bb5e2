// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-connection argument pool.
//!
//! Every TCP connection carries one [`ConnectionArg`] holding its transfer
//! state: which file is being streamed out, how much of an upload body is
//! still inbound, and how much of an image remains to be flashed. The args
//! live in a fixed ring of [`POOL_SIZE`] slots allocated in round-robin
//! order. Allocation never fails: if the ring wraps onto a slot whose
//! connection never closed (a leaked or wedged connection), the slot is
//! simply reused and the stale connection loses its state. That trade is
//! deliberate -- the recovery device must keep accepting connections from
//! the one browser that matters, whatever debris earlier connections left.

pub const POOL_SIZE: usize = 1000;

/// Transfer state for one connection. `H` is the asset store's file handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConnectionArg<H> {
    /// Allocation sequence number, for tracing.
    pub count: u32,
    /// File currently being streamed out, if any.
    pub file: Option<H>,
    /// Total size of that file.
    pub file_len: u32,
    /// File bytes not yet handed to the stack.
    pub file_remaining: u32,
    /// Upload body bytes (payload and trailer) not yet received.
    pub upload_remaining: u32,
    /// Image bytes not yet written to flash. Never exceeds
    /// `upload_remaining`: flash can't get ahead of the wire.
    pub flash_remaining: u32,
    /// Flash offset for the next image byte.
    pub flash_offset: u32,
    /// Segments received on this connection.
    pub packet_count: u32,
    /// A `cfg_boot_img` POST on this connection is waiting for its body.
    pub pending_cfg: bool,
    /// Same, for `validate_crc`.
    pub pending_crc: bool,
}

impl<H> ConnectionArg<H> {
    pub const EMPTY: Self = Self {
        count: 0,
        file: None,
        file_len: 0,
        file_remaining: 0,
        upload_remaining: 0,
        flash_remaining: 0,
        flash_offset: 0,
        packet_count: 0,
        pending_cfg: false,
        pending_crc: false,
    };
}

/// Opaque slot index handed back at allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArgId(u16);

/// The ring of connection args.
pub struct ArgPool<H, const N: usize = POOL_SIZE> {
    slots: [ConnectionArg<H>; N],
    next: usize,
    seq: u32,
}

impl<H: Copy, const N: usize> ArgPool<H, N> {
    pub const fn new() -> Self {
        Self {
            slots: [ConnectionArg::EMPTY; N],
            next: 0,
            seq: 0,
        }
    }

    /// Takes the next slot in the ring, zeroing whatever was in it.
    pub fn alloc(&mut self) -> ArgId {
        let id = ArgId(self.next as u16);
        self.next = (self.next + 1) % N;
        self.seq = self.seq.wrapping_add(1);
        self.slots[id.0 as usize] = ConnectionArg {
            count: self.seq,
            ..ConnectionArg::EMPTY
        };
        id
    }

    /// Zeroes a slot at connection close so stale transfer state can't leak
    /// into the slot's next occupant.
    pub fn release(&mut self, id: ArgId) {
        self.slots[id.0 as usize] = ConnectionArg::EMPTY;
    }

    pub fn get(&self, id: ArgId) -> &ConnectionArg<H> {
        &self.slots[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ArgId) -> &mut ConnectionArg<H> {
        &mut self.slots[id.0 as usize]
    }
}

impl<H: Copy, const N: usize> Default for ArgPool<H, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_walks_the_ring() {
        let mut pool: ArgPool<u32, 4> = ArgPool::new();
        let a = pool.alloc();
        let b = pool.alloc();
        assert_ne!(a, b);
        assert_eq!(pool.get(a).count, 1);
        assert_eq!(pool.get(b).count, 2);
    }

    #[test]
    fn exhausted_ring_reuses_oldest_slot() {
        let mut pool: ArgPool<u32, 2> = ArgPool::new();
        let a = pool.alloc();
        pool.get_mut(a).flash_remaining = 77;
        let _b = pool.alloc();
        // Third alloc wraps onto slot 0 even though it was never released.
        let c = pool.alloc();
        assert_eq!(c, a);
        assert_eq!(pool.get(c).flash_remaining, 0);
        assert_eq!(pool.get(c).count, 3);
    }

    #[test]
    fn release_zeroes_the_slot() {
        let mut pool: ArgPool<u32, 4> = ArgPool::new();
        let a = pool.alloc();
        let arg = pool.get_mut(a);
        arg.file = Some(9);
        arg.upload_remaining = 123;
        arg.packet_count = 5;
        arg.pending_cfg = true;
        pool.release(a);
        assert_eq!(*pool.get(a), ConnectionArg::EMPTY);
    }
}
