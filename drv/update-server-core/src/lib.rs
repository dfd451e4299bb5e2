// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash update sequencer for the recovery image slots.
//!
//! This crate drives the persistent side of an image upload:
//! erase -> chunked write -> CRC validation -> boot-selection commit. It is
//! deliberately hardware-independent: the NOR flash driver and the
//! persistent boot-state record come in through the `drv-update-api` traits,
//! which keeps every path here exercisable in hosted tests.
//!
//! The sequencer carries as little state as possible. Per-connection upload
//! progress (bytes remaining, current write offset) belongs to the HTTP
//! layer's connection records; what lives here is the state that is
//! genuinely global to the one flash device: the erase state machine, the
//! single-update-in-progress guard, and the page write-combining buffer.
//!
//! Erase is cooperative. A request only arms the state machine; one sector
//! is erased per [`UpdateSequencer::step_erase`] call, which the hosting
//! event loop invokes between network callbacks, so the server never
//! disappears into a multi-second blocking erase.

#![cfg_attr(not(test), no_std)]

use crc::{Crc, CRC_32_ISO_HDLC};
use drv_update_api::{
    BootImgStatus, BootSlot, BootState, NorFlash, UpdateError,
};
use ringbuf::{ringbuf_entry, Ringbuf};

/// Largest flash page the write-combining buffer can carry.
pub const MAX_PAGE_SIZE: usize = 512;

/// Read granularity for CRC recomputation over flash.
const CRC_READ_CHUNK: usize = 512;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UpdateState {
    NoUpdate,
    InProgress,
}

/// Erase state machine for one image region.
///
/// `Requested` arms the machine; the first status poll latches it to
/// `Started`, after which background stepping erases one sector per call
/// until `Completed`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EraseState {
    NotStarted,
    Requested,
    Started,
    Completed,
}

#[derive(Copy, Clone, Debug)]
pub struct EraseStats {
    pub state: EraseState,
    pub slot: Option<BootSlot>,
    pub sectors_total: u32,
    pub sectors_erased: u32,
}

impl EraseStats {
    const IDLE: Self = Self {
        state: EraseState::NotStarted,
        slot: None,
        sectors_total: 0,
        sectors_erased: 0,
    };

    /// Integer percentage of sectors erased.
    pub fn progress_percent(&self) -> u32 {
        if self.sectors_total == 0 {
            0
        } else {
            self.sectors_erased * 100 / self.sectors_total
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    None,
    EraseRequested(BootSlot),
    SectorErased(u32),
    EraseCompleted,
    UpdateStarted(BootSlot, u32),
    ChunkWritten(u32),
    UpdateFinished,
    CrcComputed(u32),
    CrcMismatch(u32),
    BootStatusCommitted,
}

/// The sequencer. Owns the flash driver and boot-state record handles for
/// the lifetime of the server.
pub struct UpdateSequencer<F, B> {
    flash: F,
    boot: B,
    state: UpdateState,
    erase: EraseStats,
    /// Partial trailing page carried between chunks.
    pending: heapless::Vec<u8, MAX_PAGE_SIZE>,
    trace: Ringbuf<Trace, 32>,
}

impl<F: NorFlash, B: BootState> UpdateSequencer<F, B> {
    pub fn new(flash: F, boot: B) -> Self {
        Self {
            flash,
            boot,
            state: UpdateState::NoUpdate,
            erase: EraseStats::IDLE,
            pending: heapless::Vec::new(),
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Borrows the flash driver, for callers that own other traffic to the
    /// same part.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Borrows the boot-state backend.
    pub fn boot(&self) -> &B {
        &self.boot
    }

    /// Current persistent boot-image status.
    pub fn boot_status(&self) -> BootImgStatus {
        self.boot.status()
    }

    /// Commits a full boot-image status, as requested by `cfg_boot_img`.
    /// A commit identical to the current record performs no flash traffic.
    pub fn commit_boot_status(
        &mut self,
        status: BootImgStatus,
    ) -> Result<(), UpdateError> {
        if status == self.boot.status() {
            return Ok(());
        }
        self.boot.commit(status)?;
        ringbuf_entry!(self.trace, Trace::BootStatusCommitted);
        Ok(())
    }

    /// Clears `slot`'s bootable flag and commits, synchronously.
    ///
    /// This runs before the first image byte is written: a device that
    /// resets mid-upload must never select a half-written image. No-op for
    /// the WIC pseudo-slot, which has no bootable flag.
    pub fn make_not_bootable(
        &mut self,
        slot: BootSlot,
    ) -> Result<(), UpdateError> {
        let cleared = self.boot.status().with_slot_not_bootable(slot);
        self.commit_boot_status(cleared)
    }

    /// Arms (or continues) the erase of `slot`'s region, erasing one sector
    /// before returning. Calling again once `Completed` is a no-op success.
    pub fn request_erase(&mut self, slot: BootSlot) -> Result<(), UpdateError> {
        match self.erase.state {
            EraseState::NotStarted => {
                let sector = self.flash.sector_size() as u32;
                let capacity = self.boot.image_capacity(slot);
                self.erase = EraseStats {
                    state: EraseState::Requested,
                    slot: Some(slot),
                    sectors_total: capacity.div_ceil(sector),
                    sectors_erased: 0,
                };
                ringbuf_entry!(self.trace, Trace::EraseRequested(slot));
            }
            EraseState::Completed => return Ok(()),
            EraseState::Requested | EraseState::Started => (),
        }
        self.erase_one_sector()
    }

    /// Reports erase state and progress percentage.
    ///
    /// Polling the status is what moves `Requested` to `Started`: the
    /// recovery UI requests the erase and then polls, and background
    /// stepping only runs for a `Started` erase.
    pub fn erase_status(&mut self) -> (EraseState, u32) {
        if self.erase.state == EraseState::Requested {
            self.erase.state = EraseState::Started;
        }
        (self.erase.state, self.erase.progress_percent())
    }

    /// Erase progress percentage without the status-poll latch; used by the
    /// response to the erase request itself.
    pub fn erase_progress(&self) -> u32 {
        self.erase.progress_percent()
    }

    /// True while an armed erase should exclude other traffic.
    pub fn erase_in_progress(&self) -> bool {
        matches!(self.erase.state, EraseState::Requested | EraseState::Started)
    }

    /// Erases the next sector if an erase is underway. Called from the
    /// hosting event loop between network callbacks; errors are recorded in
    /// the trace ring and the state machine simply stops advancing.
    pub fn step_erase(&mut self) {
        if self.erase.state == EraseState::Started {
            let _ = self.erase_one_sector();
        }
    }

    fn erase_one_sector(&mut self) -> Result<(), UpdateError> {
        let slot = self.erase.slot.ok_or(UpdateError::BadSlot)?;
        let sector = self.flash.sector_size() as u32;
        let offset = self.boot.image_offset(slot)
            + self.erase.sectors_erased * sector;
        self.flash
            .erase_sector(offset)
            .map_err(|_| UpdateError::EraseFailed)?;
        self.erase.sectors_erased += 1;
        ringbuf_entry!(
            self.trace,
            Trace::SectorErased(self.erase.sectors_erased)
        );
        if self.erase.sectors_erased == self.erase.sectors_total {
            self.erase.state = EraseState::Completed;
            ringbuf_entry!(self.trace, Trace::EraseCompleted);
        }
        Ok(())
    }

    /// Starts an upload of `image_size` bytes into `slot`, returning the
    /// base flash offset writes must begin at.
    ///
    /// Requires the erase state machine to have completed for this same
    /// slot; erase and upload must not interleave, and an upload into a
    /// region erased for a different slot would brick that other slot.
    pub fn begin_update(
        &mut self,
        slot: BootSlot,
        image_size: u32,
    ) -> Result<u32, UpdateError> {
        if self.state == UpdateState::InProgress {
            return Err(UpdateError::UpdateInProgress);
        }
        if self.erase.state != EraseState::Completed
            || self.erase.slot != Some(slot)
        {
            return Err(UpdateError::EraseNotCompleted);
        }
        if image_size > self.boot.image_capacity(slot) {
            return Err(UpdateError::OutOfBounds);
        }
        if self.flash.page_size() > MAX_PAGE_SIZE {
            return Err(UpdateError::BadLength);
        }
        self.pending.clear();
        self.state = UpdateState::InProgress;
        ringbuf_entry!(self.trace, Trace::UpdateStarted(slot, image_size));
        Ok(self.boot.image_offset(slot))
    }

    /// Writes one chunk of image data at `offset`.
    ///
    /// The flash programs whole pages, so a trailing partial page is held
    /// back and prepended to the next chunk (rewinding the write address by
    /// the carried length). `is_last` must be true exactly when this call
    /// delivers the final image byte; the remainder is then flushed
    /// unconditionally.
    pub fn write_chunk(
        &mut self,
        offset: u32,
        data: &[u8],
        is_last: bool,
    ) -> Result<(), UpdateError> {
        if self.state != UpdateState::InProgress {
            return Err(UpdateError::UpdateNotStarted);
        }
        let page = self.flash.page_size();
        let mut addr = (offset as usize)
            .checked_sub(self.pending.len())
            .ok_or(UpdateError::OutOfBounds)? as u32;
        let mut data = data;
        ringbuf_entry!(self.trace, Trace::ChunkWritten(data.len() as u32));

        // Top up the carried partial page first.
        if !self.pending.is_empty() {
            let take = (page - self.pending.len()).min(data.len());
            self.pending
                .extend_from_slice(&data[..take])
                .map_err(|_| UpdateError::BadLength)?;
            data = &data[take..];
            if self.pending.len() == page || is_last {
                self.program(addr, None)?;
                addr += self.pending.len() as u32;
                self.pending.clear();
            }
        }

        while data.len() >= page {
            self.program(addr, Some(&data[..page]))?;
            addr += page as u32;
            data = &data[page..];
        }

        if is_last {
            if !data.is_empty() {
                self.program(addr, Some(data))?;
            }
            self.state = UpdateState::NoUpdate;
            // A finished upload consumes the completed erase; the next
            // upload must erase again.
            if self.erase.state == EraseState::Completed {
                self.erase = EraseStats::IDLE;
            }
            ringbuf_entry!(self.trace, Trace::UpdateFinished);
        } else if !data.is_empty() {
            self.pending
                .extend_from_slice(data)
                .map_err(|_| UpdateError::BadLength)?;
        }
        Ok(())
    }

    /// Programs either the pending buffer (`None`) or an explicit slice.
    /// Split out so the borrow of `self.pending` doesn't fight `self.flash`.
    fn program(
        &mut self,
        addr: u32,
        data: Option<&[u8]>,
    ) -> Result<(), UpdateError> {
        let bytes = match data {
            Some(d) => d,
            None => &self.pending,
        };
        self.flash
            .program(addr, bytes)
            .map_err(|_| UpdateError::WriteFailed)
    }

    /// Drops an upload mid-flight (connection closed or reset).
    ///
    /// No flash rollback happens; the pre-upload bootable-flag clear already
    /// guarantees the half-written image can't be selected.
    pub fn abort_update(&mut self) {
        self.pending.clear();
        self.state = UpdateState::NoUpdate;
    }

    /// Recomputes the CRC32 of `size` bytes at `slot`'s base offset and
    /// compares it to `expected`.
    ///
    /// On mismatch the slot is left exactly as it was: non-bootable and
    /// ineligible for selection. The caller decides whether a match leads to
    /// a boot-selection commit.
    pub fn validate_crc(
        &mut self,
        slot: BootSlot,
        size: u32,
        expected: u32,
    ) -> Result<(), UpdateError> {
        let mut digest = CRC32.digest();
        let mut buf = [0u8; CRC_READ_CHUNK];
        let mut addr = self.boot.image_offset(slot);
        let mut remaining = size as usize;
        while remaining > 0 {
            let len = remaining.min(buf.len());
            self.flash
                .read(addr, &mut buf[..len])
                .map_err(|_| UpdateError::ReadFailed)?;
            digest.update(&buf[..len]);
            addr += len as u32;
            remaining -= len;
        }
        let crc = digest.finalize();
        if crc == expected {
            ringbuf_entry!(self.trace, Trace::CrcComputed(crc));
            Ok(())
        } else {
            ringbuf_entry!(self.trace, Trace::CrcMismatch(crc));
            Err(UpdateError::CrcMismatch)
        }
    }

    /// Marks `slot` bootable and selects it as the requested boot image,
    /// leaving the other slot's flag untouched. Only called after a CRC
    /// match. For WIC there is no persistent state to touch.
    pub fn commit_boot_selection(
        &mut self,
        slot: BootSlot,
    ) -> Result<(), UpdateError> {
        let Some(selection) = slot.selection() else {
            return Ok(());
        };
        let mut status = self.boot.status();
        match slot {
            BootSlot::ImageA => status.img_a_bootable = true,
            BootSlot::ImageB => status.img_b_bootable = true,
            BootSlot::Wic => unreachable!(),
        }
        status.requested = selection;
        self.commit_boot_status(status)
    }
}
