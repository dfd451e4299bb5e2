// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for debugging the recovery server and its drivers.
//!
//! This is a fixed-size ring of trace entries intended to be owned by the
//! state structure it instruments, so that it shows up in a debugger (or a
//! memory dump) next to the thing it describes rather than in some global.
//! While there is nothing to prevent a ring buffer from being left in
//! production code, the design center is debugging in development: the ring
//! can be walked with GDB or read out of a dump.
//!
//! The payload type must implement `Copy` and `PartialEq`. When an entry is
//! recorded with a payload identical to the most recent entry (same source
//! line, same payload), its count is incremented rather than consuming a new
//! slot, so a tight loop doesn't immediately evict the interesting history.
//!
//! Entries are normally recorded through [`ringbuf_entry!`], which captures
//! the source line of the recording site:
//!
//! ```
//! use ringbuf::{ringbuf_entry, Ringbuf};
//!
//! #[derive(Copy, Clone, Debug, PartialEq, Eq)]
//! enum Trace {
//!     None,
//!     ThingHappened(u32),
//! }
//!
//! let mut ring: Ringbuf<Trace, 16> = Ringbuf::new(Trace::None);
//! ringbuf_entry!(ring, Trace::ThingHappened(42));
//! ```

#![cfg_attr(not(test), no_std)]

/// A single ring buffer entry, carrying a payload of arbitrary type.
///
/// `line` is the source line that recorded the entry (`0` for the initial
/// fill), `generation` counts laps around the ring, and `count` is the number
/// of consecutive identical recordings folded into this entry.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized payload type and size.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Creates a ring with every slot initialized to `init` at generation 0.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    /// Records `payload` attributed to source line `line`.
    ///
    /// Prefer [`ringbuf_entry!`], which fills in `line` for you.
    pub fn entry(&mut self, line: u16, payload: T) {
        let ndx = match self.last {
            None => 0,
            Some(last) => {
                let ent = &mut self.buffer[last];
                if ent.line == line && ent.payload == payload {
                    // Only the count saturates; we'd rather lose the count
                    // than wrap to a state that looks like one occurrence.
                    ent.count = ent.count.saturating_add(1);
                    return;
                }

                if last + 1 == N {
                    0
                } else {
                    last + 1
                }
            }
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation = ent.generation.wrapping_add(1);

        self.last = Some(ndx);
    }

    /// Returns the most recently recorded entry, if anything has been
    /// recorded since construction.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.last.map(|i| &self.buffer[i])
    }
}

/// Records an entry in a ring buffer, capturing the source line.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {
        $buf.entry(line!() as u16, $payload);
    };
}

/// Frozen version of `ringbuf_entry` that discards the payload.
#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {
        let _ = &$buf;
        let _ = &$payload;
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_has_no_last() {
        let ring: Ringbuf<u32, 4> = Ringbuf::new(0);
        assert!(ring.last_entry().is_none());
    }

    #[test]
    fn identical_entries_coalesce() {
        let mut ring: Ringbuf<u32, 4> = Ringbuf::new(0);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(10, 7);

        let e = ring.last_entry().unwrap();
        assert_eq!(e.count, 3);
        assert_eq!(e.payload, 7);
        assert_eq!(ring.last, Some(0));
    }

    #[test]
    fn distinct_entries_advance() {
        let mut ring: Ringbuf<u32, 4> = Ringbuf::new(0);
        ring.entry(10, 7);
        // Same payload from a different line is a distinct entry.
        ring.entry(11, 7);
        assert_eq!(ring.last, Some(1));
        assert_eq!(ring.last_entry().unwrap().count, 1);
    }

    #[test]
    fn wraparound_bumps_generation() {
        let mut ring: Ringbuf<u32, 2> = Ringbuf::new(0);
        for i in 0..5 {
            ring.entry(1, i);
        }
        // 5 entries through a 2-slot ring: slot 0 is on its third lap.
        assert_eq!(ring.last, Some(0));
        assert_eq!(ring.buffer[0].generation, 3);
        assert_eq!(ring.buffer[0].payload, 4);
    }
}
