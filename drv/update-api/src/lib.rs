// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for the recovery image update sequencer.
//!
//! This crate carries the types shared between the update sequencer and its
//! callers, plus the traits at the boundary to the external storage
//! collaborators: the NOR flash driver and the persistent boot-state record.
//! Neither collaborator's implementation lives here; the integrating
//! firmware supplies both.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Errors that can be produced by the update sequencer and the storage
/// traits behind it.
///
/// This enumeration doesn't include transport-level errors; those stay in
/// the HTTP layer and never reach the sequencer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateError {
    BadLength = 1,
    UpdateInProgress,
    UpdateNotStarted,
    OutOfBounds,
    EraseNotCompleted,
    EraseFailed,
    WriteFailed,
    ReadFailed,
    CrcMismatch,
    BadSlot,
    StateCommitFailed,
}

/// Target region for an upload or erase.
///
/// `ImageA`/`ImageB` are the two interchangeable bootable firmware slots.
/// `Wic` is the whole-device image at offset 0; it has no bootable flag and
/// never participates in boot selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootSlot {
    ImageA,
    ImageB,
    Wic,
}

impl BootSlot {
    /// The boot selection this slot maps to, or `None` for the WIC
    /// pseudo-slot.
    pub fn selection(self) -> Option<BootSelect> {
        match self {
            BootSlot::ImageA => Some(BootSelect::ImageA),
            BootSlot::ImageB => Some(BootSelect::ImageB),
            BootSlot::Wic => None,
        }
    }
}

/// The device-wide boot image selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootSelect {
    ImageA,
    ImageB,
}

impl BootSelect {
    /// Name as rendered in JSON status documents.
    pub fn as_str(self) -> &'static str {
        match self {
            BootSelect::ImageA => "ImageA",
            BootSelect::ImageB => "ImageB",
        }
    }
}

/// In-memory view of the persistent boot-state record.
///
/// The on-flash layout (redundant copies, checksum) belongs to the
/// `BootState` implementation; this subsystem only ever sees this struct.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootImgStatus {
    pub img_a_bootable: bool,
    pub img_b_bootable: bool,
    pub requested: BootSelect,
    pub last_booted: BootSelect,
}

impl BootImgStatus {
    /// Returns a copy with `slot`'s bootable flag cleared. For `Wic` this is
    /// the identity: the WIC pseudo-slot has no flag to clear.
    pub fn with_slot_not_bootable(self, slot: BootSlot) -> Self {
        match slot {
            BootSlot::ImageA => Self {
                img_a_bootable: false,
                ..self
            },
            BootSlot::ImageB => Self {
                img_b_bootable: false,
                ..self
            },
            BootSlot::Wic => self,
        }
    }
}

/// NOR flash programming interface, as provided by the external driver.
///
/// Geometry is queried rather than const so one sequencer build can serve
/// parts with different page/sector sizes. `program` must be called with at
/// most one page of data and an offset the driver considers writable;
/// callers are responsible for page alignment (the sequencer's
/// write-combining takes care of this).
pub trait NorFlash {
    fn page_size(&self) -> usize;
    fn sector_size(&self) -> usize;
    fn erase_sector(&mut self, offset: u32) -> Result<(), UpdateError>;
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), UpdateError>;
    fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), UpdateError>;
}

/// Persistent boot-state record interface.
///
/// `commit` must be atomic with respect to reset: a device that resets
/// mid-commit must come back with either the old or the new record, never a
/// torn one. How that is achieved (redundant copies, checksums) is the
/// implementation's business.
pub trait BootState {
    fn status(&self) -> BootImgStatus;
    fn commit(&mut self, status: BootImgStatus) -> Result<(), UpdateError>;

    /// Base flash offset of `slot`'s image region.
    fn image_offset(&self, slot: BootSlot) -> u32;

    /// Size in bytes of `slot`'s image region.
    fn image_capacity(&self, slot: BootSlot) -> u32;
}

/// Raw board identification record, as stored in the ID EEPROM.
///
/// Fields are fixed-width ASCII, zero-padded on the right. The JSON encoder
/// copies them out verbatim (minus padding), so sizing here bounds the
/// worst-case `sys_info` response.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Copy, Clone)]
#[repr(C)]
pub struct BoardInfoRecord {
    pub board_name: [u8; 20],
    pub revision: [u8; 8],
    pub serial: [u8; 20],
    pub state: [u8; 8],
    pub part_number: [u8; 20],
    pub uuid: [u8; 36],
}

impl BoardInfoRecord {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Borrows a record from the front of an EEPROM read, if there are
    /// enough bytes.
    pub fn from_eeprom(bytes: &[u8]) -> Option<&Self> {
        Self::ref_from_prefix(bytes).ok().map(|(r, _)| r)
    }

    pub fn board_name(&self) -> &str {
        field_str(&self.board_name)
    }

    pub fn revision(&self) -> &str {
        field_str(&self.revision)
    }

    pub fn serial(&self) -> &str {
        field_str(&self.serial)
    }

    pub fn state(&self) -> &str {
        field_str(&self.state)
    }

    pub fn part_number(&self) -> &str {
        field_str(&self.part_number)
    }

    pub fn uuid(&self) -> &str {
        field_str(&self.uuid)
    }
}

/// Trims the zero padding off a fixed-width field. Non-UTF-8 contents (a
/// blank or corrupt EEPROM) render as an empty string rather than an error;
/// board info is diagnostic, not load-bearing.
fn field_str(field: &[u8]) -> &str {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..len]).unwrap_or("")
}
