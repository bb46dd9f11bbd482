//! Compaction: reclaim the oldest section by relocating its live records
//!
//! Over time, sections accumulate superseded records. Compaction walks the
//! block index, copies every record still living in the oldest section into
//! the active section, then retires and erases the oldest section.
//!
//! Each relocated record is written with the same ordering as a user write:
//! 1. Block-info record (status 0xCC) at the info cursor
//! 2. Payload, read from the oldest section and programmed in chunks
//! 3. Written marker, then the index points at the copy
//! 4. After the last record: erasable markers, erase, reformat
//!
//! In the background (non-priority) mode, user jobs are served between the
//! steps of a copy. In priority mode, entered when no free section is left,
//! compaction runs to completion first; if the active section runs out of
//! room, every entry moved so far is restored and the active section is
//! erased and filled again from scratch.

use tracing::{debug, warn};

use crate::engine::{FeeEngine, Mode, State, Trigger};
use crate::flash::{FlashDriver, FlashJobResult};
use crate::index::Location;
use crate::layout::{BlockInfo, Marker, STATUS_SWITCH};

/// Progress of the running compaction
#[derive(Debug, Default, Clone)]
pub(crate) struct SwitchProgress {
    /// Index slot being relocated
    pub copy_index: usize,
    /// The record being relocated is an invalidation
    pub invalidate: bool,
    /// Payload length of the record being relocated
    pub length: u16,
    /// Next payload byte to read in the oldest section
    pub source: u32,
    /// Payload bytes not yet programmed
    pub remaining: u32,
    /// Block-info slot of the copy
    pub info: u32,
    /// Payload start of the copy
    pub data_start: u32,
    /// Next payload address of the copy
    pub data: u32,
    /// Chunk read from the oldest section
    pub chunk: Vec<u8>,
    /// Space still needed to finish a priority compaction
    pub required: u32,
    /// State to continue with after an interleaved user job
    pub resume: Option<State>,
}

impl<F: FlashDriver> FeeEngine<F> {
    /// Space needed to relocate everything live in the oldest section
    pub(crate) fn calc_required_space(&self) -> u32 {
        let slot = self.layout.slot_size();
        let live: u32 = (0..self.index.len())
            .map(|s| match self.index.get(s) {
                loc if !loc.is_live_in(self.oldest) => 0,
                Location::Invalidated { .. } => slot,
                _ => self.record_space(self.index.size(s)),
            })
            .sum();
        live + self.critical_reserve()
    }

    fn chk_free_space_for_copy(&self, slot: usize, invalidate: bool) -> bool {
        let slot_size = self.layout.slot_size();
        let available = (self.cursor.info + slot_size)
            .saturating_sub(self.cursor.data + self.layout.margin_bytes());
        let required = if self.flags.priority {
            self.switch.required
        } else if invalidate {
            slot_size + self.critical_reserve()
        } else {
            self.record_space(self.index.size(slot)) + self.critical_reserve()
        };
        available >= required
    }

    /// Relocate the next live record of the oldest section, or retire it
    pub(crate) fn section_switching(&mut self) {
        match self.switch.resume {
            Some(State::EraseSection) => {
                self.next = Some(State::EraseSection);
                return;
            }
            Some(state) => {
                self.switch.resume = None;
                self.next = Some(state);
                return;
            }
            None => {}
        }

        if self.oldest == self.active {
            self.mode = Mode::Normal;
            self.flags.priority = false;
            self.next = Some(State::Idle);
            return;
        }

        while self.switch.copy_index < self.index.len()
            && !self.index.get(self.switch.copy_index).is_live_in(self.oldest)
        {
            self.switch.copy_index += 1;
        }

        if self.switch.copy_index >= self.index.len() {
            debug!(section = self.oldest, "oldest section emptied");
            self.switch.copy_index = 0;
            self.flags.priority = false;
            for slot in 0..self.index.len() {
                self.index.set_restart_entry(slot, Location::Unknown);
            }
            self.working = self.oldest;
            self.oldest = self.ring.next(self.oldest);
            self.stats.compactions += 1;
            self.next = Some(State::MarkHeaderErasable);
            return;
        }

        let slot = self.switch.copy_index;
        let location = self.index.get(slot);
        let invalidate = location.is_invalidated();
        if self.chk_free_space_for_copy(slot, invalidate) {
            if self.flags.priority {
                self.index.set_restart_entry(slot, location);
            }
            self.switch.invalidate = invalidate;
            self.switch.length = if invalidate { 0 } else { self.index.size(slot) };
            if let Location::Data { address, .. } = location {
                self.switch.source = address;
            }
            self.next = Some(State::SsCopyInfo);
        } else if self.flags.priority || self.ring.count() == 2 {
            self.restart_switch();
        } else {
            if self.ring.add(self.active, 2) == self.oldest {
                self.flags.priority = true;
            }
            self.mark_section_active(self.ring.next(self.active));
        }
    }

    /// Undo a priority compaction that ran out of room and start it over
    fn restart_switch(&mut self) {
        warn!(active = self.active, oldest = self.oldest, "compaction out of space, restarting");
        self.flags.switch_restarted = true;
        for slot in 0..self.index.len() {
            if self.index.get(slot).section() == Some(self.active) {
                self.index.set(slot, self.index.restart_entry(slot));
            }
            self.index.set_restart_entry(slot, Location::Unknown);
        }
        self.switch.copy_index = 0;
        self.working = self.active;
        self.next = Some(State::MarkHeaderErasable);
    }

    /// Continue with `state` now, or after the pending user job
    fn continue_copy(&mut self, state: State) {
        if self.has_ordinary_job() && !self.flags.priority {
            self.switch.resume = Some(state);
            self.initiate_job();
        } else {
            self.next = Some(state);
        }
    }

    /// A copy step failed: retry the record from scratch after a tick
    fn copy_failed(&mut self) {
        self.switch.resume = None;
        self.trigger_via(Trigger::Switch, State::WaitCycle);
    }

    /// A copy completed: account for it and move on
    fn copy_done(&mut self, space: u32) {
        if self.flags.priority {
            self.switch.required = self.switch.required.saturating_sub(space);
            self.section_switching();
        } else {
            self.trigger_via(Trigger::Switch, State::TriggerJobOrInternal);
        }
    }

    // -------------------------------------------------------------------------
    // Copy states
    // -------------------------------------------------------------------------

    pub(crate) fn enter_copy_info(&mut self) {
        let slot = self.switch.copy_index;
        let data_address = if self.switch.invalidate {
            self.layout.invalidated_address(self.active)
        } else {
            self.cursor.data
        };
        let info = BlockInfo {
            block_number: self.index.number(slot),
            block_length: self.switch.length,
            data_address,
            write_status: STATUS_SWITCH,
        };
        let address = self.cursor.info;
        let bytes = info.to_bytes(self.layout.info_size() as usize);
        if self.flash_write(address, &bytes) {
            self.switch.info = address;
            self.switch.data_start = data_address;
            self.switch.data = data_address;
            self.cursor.info = address.saturating_sub(self.layout.slot_size());
        }
    }

    pub(crate) fn poll_copy_info(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                self.margin_count = 0;
                let slot = self.switch.copy_index;
                if self.switch.invalidate {
                    self.index.set(slot, Location::Invalidated { section: self.active });
                    debug!(block = self.index.number(slot), "invalidation relocated");
                    self.copy_done(self.layout.slot_size());
                    return;
                }
                self.cursor.data += self.layout.align(self.switch.length as u32);
                self.switch.remaining = self.switch.length as u32;
                self.continue_copy(State::SsReadData);
            }
            _ => {
                self.flash_failed();
                self.info_write_failed();
                self.copy_failed();
            }
        }
    }

    pub(crate) fn enter_copy_read(&mut self) {
        let length = self.switch.remaining.min(self.config.buffer_size);
        self.flash_read(self.switch.source, self.layout.align(length));
    }

    pub(crate) fn poll_copy_read(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                let length = self.switch.remaining.min(self.config.buffer_size) as usize;
                let mut chunk = self.flash.take_read_data();
                chunk.truncate(length);
                self.switch.chunk = chunk;
                self.flags.copy_read_retry = false;
                self.continue_copy(State::SsCopyData);
            }
            _ => {
                self.copy_failed();
                if self.flags.copy_read_retry {
                    // Source unreadable twice: the block is lost
                    self.flags.copy_read_retry = false;
                    let slot = self.switch.copy_index;
                    warn!(
                        block = self.index.number(slot),
                        "record unreadable, dropped from compaction"
                    );
                    self.index.set(slot, Location::Inconsistent { section: self.active });
                } else {
                    self.flags.copy_read_retry = true;
                    self.switch.resume = Some(State::SsReadData);
                }
            }
        }
    }

    pub(crate) fn enter_copy_data(&mut self) {
        let chunk = self.layout.padded(&self.switch.chunk);
        let length = self.switch.chunk.len() as u32;
        if self.flash_write(self.switch.data, &chunk) {
            self.switch.data += chunk.len() as u32;
            self.switch.source += length;
            self.switch.remaining = self.switch.remaining.saturating_sub(length);
        }
    }

    pub(crate) fn poll_copy_data(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                if self.switch.remaining == 0 {
                    self.next = Some(State::SsWrittenMarker);
                } else {
                    self.continue_copy(State::SsReadData);
                }
            }
            _ => {
                warn!(address = self.switch.data, "compaction payload write failed");
                self.copy_failed();
            }
        }
    }

    pub(crate) fn enter_copy_written_marker(&mut self) {
        let address = self.layout.written_marker_address(self.switch.info);
        let page = self.layout.marker_page(Marker::Written);
        self.flash_write(address, &page);
    }

    pub(crate) fn poll_copy_written_marker(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                self.switch.resume = None;
                let slot = self.switch.copy_index;
                let section = self.layout.section_of(self.switch.info).unwrap_or(self.active);
                self.index.set(
                    slot,
                    Location::Data {
                        section,
                        address: self.switch.data_start,
                        info: self.switch.info,
                    },
                );
                debug!(block = self.index.number(slot), section, "record relocated");
                self.copy_done(self.record_space(self.switch.length));
            }
            _ => {
                warn!(info = self.switch.info, "compaction marker write failed");
                self.copy_failed();
            }
        }
    }
}
