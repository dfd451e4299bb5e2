// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The recovery server proper.
//!
//! [`RecoveryServer`] ties the dispatcher, the connection pool, the asset
//! store, and the flash update sequencer together behind four network
//! callbacks plus a background hook:
//!
//! - `on_accept` allocates a connection arg,
//! - `on_recv` dispatches a received segment (a fresh request on the first
//!   segment, upload payload or a deferred POST body on later ones),
//! - `on_sent` resumes a paused file transmit,
//! - `on_close` aborts any in-flight upload and zeroes the arg,
//! - `run_background_tasks` advances the incremental flash erase.
//!
//! All callbacks run on one thread; the sequencer's single-update guard is
//! the only cross-connection exclusion needed.

use crate::conn::{ArgId, ArgPool, POOL_SIZE};
use crate::dispatch::{self, GetRoute, Method, PostRoute, MAX_RESPONSE_LEN};
use crate::files;
use crate::json;
use crate::{AssetStore, NetError, SocketTx};
use drv_update_api::{
    BoardInfoRecord, BootImgStatus, BootSlot, BootState, NorFlash,
    UpdateError,
};
use drv_update_server_core::UpdateSequencer;
use ringbuf::{ringbuf_entry, Ringbuf};

/// File bytes read from the asset store per `send` call.
const FILE_CHUNK: usize = 512;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Accepted(u32),
    Recv(u16),
    DroppedDuringErase,
    NotFound,
    UploadStart(BootSlot, u32),
    UploadSegment(u16),
    UploadDone,
    CommandFailed(UpdateError),
    BadRequest,
    Closed,
}

pub struct RecoveryServer<F, B, A: AssetStore> {
    pool: ArgPool<A::Handle, POOL_SIZE>,
    sequencer: UpdateSequencer<F, B>,
    assets: A,
    board_info: BoardInfoRecord,
    cc_info: BoardInfoRecord,
    /// Slot and size of the most recent image upload, consumed by
    /// `validate_crc`.
    last_upload: Option<(BootSlot, u32)>,
    trace: Ringbuf<Trace, 64>,
}

impl<F, B, A> RecoveryServer<F, B, A>
where
    F: NorFlash,
    B: BootState,
    A: AssetStore,
{
    pub fn new(
        flash: F,
        boot: B,
        assets: A,
        board_info: BoardInfoRecord,
        cc_info: BoardInfoRecord,
    ) -> Self {
        Self {
            pool: ArgPool::new(),
            sequencer: UpdateSequencer::new(flash, boot),
            assets,
            board_info,
            cc_info,
            last_upload: None,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// A new connection was accepted; returns the arg id the stack should
    /// associate with it.
    pub fn on_accept(&mut self) -> ArgId {
        let id = self.pool.alloc();
        ringbuf_entry!(self.trace, Trace::Accepted(self.pool.get(id).count));
        id
    }

    /// The connection closed (or was reset). An upload cut off mid-image is
    /// abandoned; the pre-upload bootable-flag clear already made the
    /// half-written slot unselectable.
    pub fn on_close(&mut self, id: ArgId) {
        let arg = self.pool.get(id);
        if arg.flash_remaining > 0 || arg.upload_remaining > 0 {
            self.sequencer.abort_update();
        }
        self.pool.release(id);
        ringbuf_entry!(self.trace, Trace::Closed);
    }

    /// One received TCP segment. The first segment on a connection is a
    /// request; later segments are upload payload or a deferred POST body.
    pub fn on_recv<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
        segment: &[u8],
    ) -> Result<(), NetError> {
        ringbuf_entry!(
            self.trace,
            Trace::Recv(segment.len().min(u16::MAX as usize) as u16)
        );
        let arg = self.pool.get_mut(id);
        arg.packet_count = arg.packet_count.wrapping_add(1);
        let first = arg.packet_count == 1;

        if !first {
            // Deferred state is per-connection: another connection's
            // continuation segment must never consume this one's pending
            // body.
            let (uploading, pending_cfg, pending_crc) = {
                let arg = self.pool.get(id);
                (
                    arg.upload_remaining > 0,
                    arg.pending_cfg,
                    arg.pending_crc,
                )
            };
            if uploading {
                return self.continue_upload(id, socket, segment);
            }
            if pending_cfg {
                self.pool.get_mut(id).pending_cfg = false;
                return self.handle_cfg_body(socket, segment);
            }
            if pending_crc {
                self.pool.get_mut(id).pending_crc = false;
                return self.handle_crc_body(socket, segment);
            }
            // Continuation with no transfer in progress: stray bytes.
            return Ok(());
        }

        let (method, path) = dispatch::parse_request_line(segment);
        match (method, path) {
            (Method::Get, Some(p)) => {
                self.handle_get(id, socket, p, false, segment)
            }
            (Method::Head, Some(p)) => {
                self.handle_get(id, socket, p, true, segment)
            }
            (Method::Post, Some(p)) => {
                self.handle_post(id, socket, p, segment)
            }
            _ => self.send_not_found(socket, segment),
        }
    }

    /// Previously queued data drained; resume a paused file transmit.
    pub fn on_sent<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
    ) -> Result<(), NetError> {
        if self.pool.get(id).file.is_some() {
            self.pump_file(id, socket)
        } else {
            Ok(())
        }
    }

    /// Runs between network events; each call erases at most one sector.
    pub fn run_background_tasks(&mut self) {
        self.sequencer.step_erase();
    }

    fn handle_get<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
        path: &str,
        head_only: bool,
        segment: &[u8],
    ) -> Result<(), NetError> {
        let route = dispatch::get_route(path);

        // While an erase is underway the only GET that gets an answer is
        // the status poll. Everything else is dropped without a response
        // so a stale UI can't interleave flash traffic with the erase; the
        // connection is left open.
        if self.sequencer.erase_in_progress()
            && route != GetRoute::FlashEraseStatus
        {
            ringbuf_entry!(self.trace, Trace::DroppedDuringErase);
            return Ok(());
        }

        match route {
            GetRoute::SysInfo => {
                let mut body = [0u8; json::SYS_INFO_MAX];
                match json::encode_sys_info(
                    &self.board_info,
                    &self.cc_info,
                    &mut body,
                ) {
                    Ok(n) => self.respond_json(socket, &body[..n], head_only),
                    Err(_) => {
                        self.respond_json(socket, json::STATUS_FAILED, head_only)
                    }
                }
            }
            GetRoute::BootImgStatus => {
                let status = self.sequencer.boot_status();
                let mut body = [0u8; json::BOOT_STATUS_MAX];
                match json::encode_boot_img_status(&status, &mut body) {
                    Ok(n) => self.respond_json(socket, &body[..n], head_only),
                    Err(_) => {
                        self.respond_json(socket, json::STATUS_FAILED, head_only)
                    }
                }
            }
            GetRoute::FlashErase(slot) => {
                if let Err(e) = self.sequencer.request_erase(slot) {
                    ringbuf_entry!(self.trace, Trace::CommandFailed(e));
                    return self.respond_json(
                        socket,
                        json::STATUS_FAILED,
                        head_only,
                    );
                }
                // Answer with progress but without the status-poll latch;
                // background stepping starts once the UI polls.
                let percent = self.sequencer.erase_progress();
                self.send_progress(socket, percent, head_only)
            }
            GetRoute::FlashEraseStatus => {
                let (_state, percent) = self.sequencer.erase_status();
                self.send_progress(socket, percent, head_only)
            }
            GetRoute::File(p) => {
                self.serve_file(id, socket, p, head_only, segment)
            }
        }
    }

    fn handle_post<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
        path: &str,
        segment: &[u8],
    ) -> Result<(), NetError> {
        match dispatch::post_route(path) {
            None => self.send_not_found(socket, segment),
            Some(PostRoute::CfgBootImg) => {
                match post_body(segment).filter(|b| !b.is_empty()) {
                    Some(body) => self.handle_cfg_body(socket, body),
                    None => {
                        // Body arrives in this connection's next segment.
                        self.pool.get_mut(id).pending_cfg = true;
                        Ok(())
                    }
                }
            }
            Some(PostRoute::ValidateCrc) => {
                match post_body(segment).filter(|b| !b.is_empty()) {
                    Some(body) => self.handle_crc_body(socket, body),
                    None => {
                        self.pool.get_mut(id).pending_crc = true;
                        Ok(())
                    }
                }
            }
            Some(PostRoute::DownloadImg(slot)) => {
                self.start_upload(id, socket, slot, segment)
            }
        }
    }

    fn handle_cfg_body<S: SocketTx>(
        &mut self,
        socket: &mut S,
        body: &[u8],
    ) -> Result<(), NetError> {
        let parsed = core::str::from_utf8(body)
            .ok()
            .and_then(json::decode_boot_cfg);
        let Some((img_a, img_b, requested)) = parsed else {
            ringbuf_entry!(self.trace, Trace::BadRequest);
            return self.send_json(socket, json::STATUS_FAILED);
        };
        let status = BootImgStatus {
            img_a_bootable: img_a,
            img_b_bootable: img_b,
            requested,
            // The UI can't rewrite history.
            last_booted: self.sequencer.boot_status().last_booted,
        };
        match self.sequencer.commit_boot_status(status) {
            Ok(()) => self.send_json(socket, json::STATUS_SUCCESS),
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::CommandFailed(e));
                self.send_json(socket, json::STATUS_FAILED)
            }
        }
    }

    fn handle_crc_body<S: SocketTx>(
        &mut self,
        socket: &mut S,
        body: &[u8],
    ) -> Result<(), NetError> {
        let crc = core::str::from_utf8(body).ok().and_then(json::decode_crc);
        let Some(crc) = crc else {
            ringbuf_entry!(self.trace, Trace::BadRequest);
            return self.send_json(socket, json::STATUS_FAILED);
        };
        let Some((slot, size)) = self.last_upload else {
            // Nothing was uploaded; there is nothing to validate.
            ringbuf_entry!(self.trace, Trace::BadRequest);
            return self.send_json(socket, json::STATUS_FAILED);
        };
        let result = self
            .sequencer
            .validate_crc(slot, size, crc)
            .and_then(|()| self.sequencer.commit_boot_selection(slot));
        match result {
            Ok(()) => self.send_json(socket, json::STATUS_SUCCESS),
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::CommandFailed(e));
                self.send_json(socket, json::STATUS_FAILED)
            }
        }
    }

    fn start_upload<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
        slot: BootSlot,
        segment: &[u8],
    ) -> Result<(), NetError> {
        let desc = match multipart::parse_preamble(segment) {
            Ok(d) => d,
            Err(_) => {
                ringbuf_entry!(self.trace, Trace::BadRequest);
                return self.send_json(socket, json::STATUS_FAILED);
            }
        };
        if desc.image_size == 0 {
            ringbuf_entry!(self.trace, Trace::BadRequest);
            return self.send_json(socket, json::STATUS_FAILED);
        }

        let base = match self.sequencer.begin_update(slot, desc.image_size) {
            Ok(base) => base,
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::CommandFailed(e));
                return self.send_json(socket, json::STATUS_FAILED);
            }
        };

        // Clear the slot's bootable flag before the first image byte hits
        // flash: a reset mid-upload must never select a half-written
        // image. If this commit fails the upload never starts.
        if let Err(e) = self.sequencer.make_not_bootable(slot) {
            ringbuf_entry!(self.trace, Trace::CommandFailed(e));
            self.sequencer.abort_update();
            return self.send_json(socket, json::STATUS_FAILED);
        }
        self.last_upload = Some((slot, desc.image_size));
        ringbuf_entry!(
            self.trace,
            Trace::UploadStart(slot, desc.image_size)
        );

        let body_received =
            segment.len().saturating_sub(desc.body_start) as u32;
        let payload_start = desc.payload_start.min(segment.len());
        let payload_in_segment = segment.len() - payload_start;
        let img = (desc.image_size as usize).min(payload_in_segment);

        let arg = self.pool.get_mut(id);
        arg.upload_remaining =
            desc.content_length.saturating_sub(body_received);
        arg.flash_remaining = desc.image_size;
        arg.flash_offset = base;

        self.write_image(
            id,
            socket,
            &segment[payload_start..payload_start + img],
        )
    }

    /// Later segment of an upload body. The leading `flash_remaining` bytes
    /// are image data; whatever follows is the multipart trailer and only
    /// counts against `upload_remaining`.
    fn continue_upload<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
        segment: &[u8],
    ) -> Result<(), NetError> {
        ringbuf_entry!(
            self.trace,
            Trace::UploadSegment(segment.len().min(u16::MAX as usize) as u16)
        );
        let remaining = self.pool.get(id).flash_remaining;
        let img = (remaining as usize).min(segment.len());
        let result = self.write_image(id, socket, &segment[..img]);

        let arg = self.pool.get_mut(id);
        arg.upload_remaining =
            arg.upload_remaining.saturating_sub(segment.len() as u32);
        result
    }

    /// Feeds image bytes to the sequencer and answers the upload POST when
    /// the final byte lands. `data` is already capped at `flash_remaining`.
    fn write_image<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
        data: &[u8],
    ) -> Result<(), NetError> {
        if data.is_empty() {
            return Ok(());
        }
        let (offset, remaining) = {
            let arg = self.pool.get(id);
            (arg.flash_offset, arg.flash_remaining)
        };
        let is_last = data.len() as u32 == remaining;

        if let Err(e) = self.sequencer.write_chunk(offset, data, is_last) {
            ringbuf_entry!(self.trace, Trace::CommandFailed(e));
            // Stop consuming this connection's body.
            let arg = self.pool.get_mut(id);
            arg.flash_remaining = 0;
            arg.upload_remaining = 0;
            self.sequencer.abort_update();
            return self.send_json(socket, json::STATUS_FAILED);
        }

        let done = {
            let arg = self.pool.get_mut(id);
            arg.flash_offset += data.len() as u32;
            arg.flash_remaining -= data.len() as u32;
            arg.flash_remaining == 0
        };
        if done {
            ringbuf_entry!(self.trace, Trace::UploadDone);
            return self.send_json(socket, json::STATUS_SUCCESS);
        }
        Ok(())
    }

    fn serve_file<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
        path: &str,
        head_only: bool,
        segment: &[u8],
    ) -> Result<(), NetError> {
        let Some(name) = files::resolve(path) else {
            return self.send_not_found(socket, segment);
        };
        let Some((handle, len)) = self.assets.open(&name) else {
            return self.send_not_found(socket, segment);
        };

        let mut header = [0u8; 160];
        let Some(n) = dispatch::build_response_header(
            files::content_type(&name),
            len,
            &mut header,
        ) else {
            socket.close();
            return Err(NetError::SendFailed);
        };
        if socket.send(&header[..n]).is_err() {
            socket.close();
            return Err(NetError::SendFailed);
        }
        if head_only || len == 0 {
            socket.close();
            return Ok(());
        }

        let arg = self.pool.get_mut(id);
        arg.file = Some(handle);
        arg.file_len = len;
        arg.file_remaining = len;
        self.pump_file(id, socket)
    }

    /// Streams file bytes until the file is done or the transmit window
    /// closes; `on_sent` picks the transfer back up.
    fn pump_file<S: SocketTx>(
        &mut self,
        id: ArgId,
        socket: &mut S,
    ) -> Result<(), NetError> {
        let mut chunk = [0u8; FILE_CHUNK];
        loop {
            let (handle, offset, remaining) = {
                let arg = self.pool.get(id);
                match arg.file {
                    Some(h) if arg.file_remaining > 0 => {
                        (h, arg.file_len - arg.file_remaining, arg.file_remaining)
                    }
                    _ => {
                        socket.close();
                        return Ok(());
                    }
                }
            };
            let window = socket.send_window();
            if window == 0 {
                return Ok(());
            }
            let want = (remaining as usize).min(chunk.len()).min(window);
            let got = self.assets.read(handle, offset, &mut chunk[..want]);
            if got == 0 {
                // Store came up short; nothing better to do than hang up.
                socket.close();
                return Ok(());
            }
            if socket.send(&chunk[..got]).is_err() {
                socket.close();
                return Err(NetError::SendFailed);
            }
            self.pool.get_mut(id).file_remaining -= got as u32;
        }
    }

    fn send_progress<S: SocketTx>(
        &mut self,
        socket: &mut S,
        percent: u32,
        head_only: bool,
    ) -> Result<(), NetError> {
        let mut body = [0u8; json::ERASE_PROGRESS_MAX];
        match json::encode_erase_progress(percent, &mut body) {
            Ok(n) => self.respond_json(socket, &body[..n], head_only),
            Err(_) => self.respond_json(socket, json::STATUS_FAILED, head_only),
        }
    }

    /// Sends a JSON response; for HEAD requests only the header goes out,
    /// with the Content-Length the body would have had.
    fn respond_json<S: SocketTx>(
        &mut self,
        socket: &mut S,
        body: &[u8],
        head_only: bool,
    ) -> Result<(), NetError> {
        let mut resp = [0u8; MAX_RESPONSE_LEN];
        let header_len = dispatch::build_response_header(
            "application/json",
            body.len() as u32,
            &mut resp,
        );
        let total = match header_len {
            Some(n) if n + body.len() <= resp.len() => {
                if head_only {
                    n
                } else {
                    resp[n..n + body.len()].copy_from_slice(body);
                    n + body.len()
                }
            }
            _ => {
                socket.close();
                return Err(NetError::SendFailed);
            }
        };
        self.send_and_close(socket, &resp[..total])
    }

    fn send_json<S: SocketTx>(
        &mut self,
        socket: &mut S,
        body: &[u8],
    ) -> Result<(), NetError> {
        self.respond_json(socket, body, false)
    }

    fn send_not_found<S: SocketTx>(
        &mut self,
        socket: &mut S,
        request: &[u8],
    ) -> Result<(), NetError> {
        ringbuf_entry!(self.trace, Trace::NotFound);
        let mut resp = [0u8; MAX_RESPONSE_LEN];
        let n = dispatch::build_not_found(request, &mut resp);
        self.send_and_close(socket, &resp[..n])
    }

    fn send_and_close<S: SocketTx>(
        &mut self,
        socket: &mut S,
        data: &[u8],
    ) -> Result<(), NetError> {
        let result = socket.send(data);
        socket.close();
        result
    }
}

/// Locates a POST body: everything past the header-terminating blank line.
fn post_body(segment: &[u8]) -> Option<&[u8]> {
    memchr::memmem::find(segment, b"\r\n\r\n").map(|i| &segment[i + 4..])
}
