//! User job states
//!
//! A write goes through three flash requests, each committed in order:
//!
//! 1. block-info record at the info cursor (the cursor moves on submit)
//! 2. payload at the data cursor, split into `buffer_size` chunks
//! 3. written marker behind the block-info record
//!
//! Only after the marker is programmed does the index point at the new
//! record. Invalidate and erase-immediate are a single block-info record
//! without payload. Reads never touch flash when the index already knows
//! the block holds nothing.

use tracing::{debug, warn};

use crate::engine::{FeeEngine, Mode, State};
use crate::flash::{FlashDriver, FlashJobResult};
use crate::index::Location;
use crate::layout::{marker_present, BlockInfo, Marker, STATUS_USER};
use crate::notify::{JobKind, JobResult};

impl<F: FlashDriver> FeeEngine<F> {
    /// Start the current job, or go idle without one
    pub(crate) fn initiate_job(&mut self) {
        if !self.has_ordinary_job() {
            self.next = Some(State::Idle);
            return;
        }
        let Some((kind, slot)) = self.job.as_ref().map(|j| (j.kind, j.slot)) else {
            return;
        };
        match kind {
            JobKind::Read => self.initiate_read(),
            JobKind::Write => self.initiate_store_request(),
            JobKind::Invalidate => {
                if self.index.get(slot).is_invalidated() {
                    self.job_end();
                } else {
                    self.initiate_store_request();
                }
            }
            JobKind::EraseImmediate => {
                if self.index.get(slot).is_inconsistent() {
                    self.job_end();
                } else {
                    self.initiate_store_request();
                }
            }
        }
    }

    pub(crate) fn initiate_read(&mut self) {
        let Some(slot) = self.job.as_ref().map(|j| j.slot) else {
            self.next = Some(State::Idle);
            return;
        };
        if self.delay != crate::config::DELAY_INFINITE {
            self.delay = self.config.delay_ticks;
        }
        match self.index.get(slot) {
            Location::Unknown | Location::Inconsistent { .. } => {
                self.job_error(JobResult::BlockInconsistent)
            }
            Location::Invalidated { .. } => self.job_error(JobResult::BlockInvalid),
            Location::Data { .. } => self.next = Some(State::ReadBlockInfo),
        }
    }

    fn initiate_store_request(&mut self) {
        if self.flags.priority {
            // Pending compaction or healing has to finish first
            self.delay = 0;
            if self.mode == Mode::Startup2 {
                self.startup2();
            } else {
                self.section_switching();
            }
            return;
        }

        let fits = if std::mem::take(&mut self.flags.user_job_changes_section) {
            true
        } else {
            self.chk_free_space()
        };
        if fits {
            self.process_store_request();
        } else {
            self.job_triggers_section_change();
        }
    }

    /// Whether the current job fits the active section, reserve and margin kept free
    fn chk_free_space(&self) -> bool {
        let Some(job) = self.job.as_ref() else {
            return false;
        };
        let slot = self.layout.slot_size();
        let limit = self.cursor.info.saturating_sub((self.layout.margin() - 1) * slot);
        let available = limit.saturating_sub(self.cursor.data);
        let needed = match job.kind {
            JobKind::Write => self.record_space(job.length),
            _ => slot,
        };
        available >= needed + self.critical_reserve()
    }

    fn job_triggers_section_change(&mut self) {
        let next = self.ring.next(self.active);
        let n = self.ring.count();
        debug!(active = self.active, next, "active section full");

        if self.sections[next as usize].status != crate::section::SectionStatus::Empty {
            self.flags.priority = true;
            if self.mode == Mode::Startup2 {
                self.startup2();
            } else {
                self.mode = Mode::Switch;
                self.section_switching();
            }
        } else if n > 2 && self.ring.distance(self.oldest, next) != 1 {
            if self.mode == Mode::Normal && self.ring.distance(next, self.oldest) == n / 2 {
                self.mode = Mode::Switch;
            }
            self.flags.user_job_changes_section = true;
            self.mark_section_active(next);
        } else {
            // Last free section: compaction must complete before the job runs
            self.flags.priority = true;
            self.mode = Mode::Switch;
            self.delay = 0;
            self.mark_section_active(next);
        }
    }

    fn process_store_request(&mut self) {
        let Some(job) = self.job.as_mut() else {
            self.next = Some(State::Idle);
            return;
        };
        if job.kind == JobKind::Write && !self.index.is_configured(job.slot) {
            let current = self.index.size(job.slot);
            if current != job.length {
                if !self.index.resize(job.slot, job.length) {
                    warn!(block = job.block, length = job.length, "unconfigured block over budget");
                    self.job_error(JobResult::NotOk);
                    return;
                }
                job.previous_size = Some(current);
            }
        }
        let kind = job.kind;
        if self.delay != crate::config::DELAY_INFINITE {
            self.delay = self.config.delay_ticks;
        }
        self.buffer_index = 0;
        self.next = Some(match kind {
            JobKind::Invalidate => State::Invalidate,
            JobKind::EraseImmediate => State::EraseImmediate,
            _ => State::WriteBlockInfo,
        });
    }

    // -------------------------------------------------------------------------
    // Block-info records
    // -------------------------------------------------------------------------

    /// Submit a user block-info record at the info cursor
    fn write_user_info(&mut self, length: u16, data_address: u32) {
        let Some(block) = self.job.as_ref().map(|j| j.block) else {
            return;
        };
        let info = BlockInfo {
            block_number: block,
            block_length: length,
            data_address,
            write_status: STATUS_USER,
        };
        let address = self.cursor.info;
        let bytes = info.to_bytes(self.layout.info_size() as usize);
        if self.flash_write(address, &bytes) {
            self.record.info = address;
            self.record.data = data_address;
            self.cursor.info = address.saturating_sub(self.layout.slot_size());
        }
    }

    /// Count a failed block-info write; after `margin` of them the section is closed
    pub(crate) fn info_write_failed(&mut self) {
        self.margin_count += 1;
        if self.margin_count >= self.layout.margin() {
            let slot = self.layout.slot_size();
            self.cursor.data = self.cursor.info.saturating_sub((self.layout.margin() - 1) * slot);
            self.margin_count = 0;
            warn!(section = self.active, "repeated block-info failures, closing section");
        }
    }

    pub(crate) fn enter_write_block_info(&mut self) {
        let length = self.job.as_ref().map_or(0, |j| j.length);
        self.write_user_info(length, self.cursor.data);
    }

    pub(crate) fn enter_invalidate(&mut self) {
        self.write_user_info(0, self.layout.invalidated_address(self.active));
    }

    pub(crate) fn enter_erase_immediate(&mut self) {
        self.write_user_info(0, self.layout.erased_address(self.active));
    }

    pub(crate) fn poll_write_block_info(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                self.margin_count = 0;
                self.next = Some(State::WriteBlockData);
            }
            _ => {
                self.info_write_failed();
                self.job_error(JobResult::NotOk);
            }
        }
    }

    pub(crate) fn poll_invalidate_or_erase(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                self.margin_count = 0;
                let Some(slot) = self.job.as_ref().map(|j| j.slot) else {
                    return;
                };
                let section = self.active;
                let location = if self.state == State::Invalidate {
                    Location::Invalidated { section }
                } else {
                    Location::Inconsistent { section }
                };
                self.commit(slot, location);
                self.job_end();
            }
            _ => {
                self.info_write_failed();
                self.job_error(JobResult::NotOk);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Payload and written marker
    // -------------------------------------------------------------------------

    pub(crate) fn enter_write_block_data(&mut self) {
        let Some(job) = self.job.as_ref() else {
            return;
        };
        let start = self.buffer_index as usize;
        let end = (start + self.config.buffer_size as usize).min(job.data.len());
        let chunk = self.layout.padded(&job.data[start..end]);
        let address = self.cursor.data;
        if self.flash_write(address, &chunk) {
            self.cursor.data += chunk.len() as u32;
            self.buffer_index = end as u32;
        }
    }

    pub(crate) fn poll_write_block_data(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                let total = self.job.as_ref().map_or(0, |j| j.data.len() as u32);
                self.next = Some(if self.buffer_index >= total {
                    State::WrittenMarker
                } else {
                    State::WriteBlockData
                });
            }
            _ => self.job_error(JobResult::NotOk),
        }
    }

    pub(crate) fn enter_written_marker(&mut self) {
        let address = self.layout.written_marker_address(self.record.info);
        let page = self.layout.marker_page(Marker::Written);
        self.flash_write(address, &page);
    }

    pub(crate) fn poll_written_marker(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                let Some(slot) = self.job.as_ref().map(|j| j.slot) else {
                    return;
                };
                let section = self.layout.section_of(self.record.info).unwrap_or(self.active);
                let location = Location::Data {
                    section,
                    address: self.record.data,
                    info: self.record.info,
                };
                self.commit(slot, location);
                self.job_end();
            }
            _ => self.job_error(JobResult::NotOk),
        }
    }

    /// Point `slot` at its new record. A compaction copy of the same block
    /// still in progress is abandoned.
    fn commit(&mut self, slot: usize, location: Location) {
        self.index.set(slot, location);
        if slot == self.switch.copy_index && self.switch.resume != Some(State::EraseSection) {
            self.switch.resume = None;
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub(crate) fn enter_read_block_info(&mut self) {
        let Some(slot) = self.job.as_ref().map(|j| j.slot) else {
            return;
        };
        if let Location::Data { info, .. } = self.index.get(slot) {
            self.flash_read(info, self.layout.slot_size());
        }
    }

    pub(crate) fn poll_read_block_info(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                let bytes = self.flash.take_read_data();
                let Some(job) = self.job.as_ref() else {
                    return;
                };
                let info_size = self.layout.info_size() as usize;
                let expected = match self.index.get(job.slot) {
                    Location::Data { address, .. } => address,
                    _ => u32::MAX,
                };
                let valid = bytes.len() > info_size
                    && BlockInfo::from_bytes(&bytes[..info_size]).is_some_and(|info| {
                        info.block_number == job.block
                            && info.data_address == expected
                            && info.block_length == self.index.size(job.slot)
                    })
                    && marker_present(&bytes[info_size..], Marker::Written);
                if valid {
                    self.next = Some(State::ReadBlockData);
                } else {
                    warn!(block = job.block, "block-info record no longer valid");
                    self.job_error(JobResult::BlockInconsistent);
                }
            }
            _ => self.job_error(JobResult::NotOk),
        }
    }

    pub(crate) fn enter_read_block_data(&mut self) {
        let Some(job) = self.job.as_ref() else {
            return;
        };
        let Location::Data { address, .. } = self.index.get(job.slot) else {
            return;
        };
        let page = self.layout.page_size();
        let start = address + job.offset as u32;
        let aligned_start = start / page * page;
        let length = self.layout.align(start + job.length as u32 - aligned_start);
        self.flash_read(aligned_start, length);
    }

    pub(crate) fn poll_read_block_data(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                let bytes = self.flash.take_read_data();
                let Some(job) = self.job.as_ref() else {
                    return;
                };
                let Location::Data { address, .. } = self.index.get(job.slot) else {
                    self.job_error(JobResult::BlockInconsistent);
                    return;
                };
                let page = self.layout.page_size();
                let start = address + job.offset as u32;
                let skip = (start - start / page * page) as usize;
                match bytes.get(skip..skip + job.length as usize) {
                    Some(payload) => {
                        self.read_data = Some(payload.to_vec());
                        self.job_end();
                    }
                    None => self.job_error(JobResult::NotOk),
                }
            }
            _ => self.job_error(JobResult::NotOk),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::engine::FeeEngine;
    use crate::error::FeeError;
    use crate::index::Location;
    use crate::layout::{Layout, Marker};
    use crate::notify::{EngineStatus, JobKind, JobRecorder, JobResult, Recorded};
    use crate::sim::SimFlash;

    fn engine(config: Config) -> (FeeEngine<SimFlash>, JobRecorder) {
        let recorder = JobRecorder::new();
        let flash = SimFlash::for_config(&config);
        let mut engine = FeeEngine::new(config, flash).unwrap().with_listener(recorder.clone());
        engine.init();
        assert!(engine.tick_until_idle(1000));
        (engine, recorder)
    }

    fn run(engine: &mut FeeEngine<SimFlash>) {
        assert!(engine.tick_until_idle(1000), "engine did not settle");
    }

    #[test]
    fn test_write_layout_on_flash() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let (mut engine, recorder) = engine(config);
        engine.write(1, &[7; 16]).unwrap();
        run(&mut engine);

        let info = layout.first_info_address(0);
        let data = layout.data_start(0);
        assert_eq!(engine.flash().peek(data, 16), &[7; 16]);
        assert_eq!(
            engine.flash().peek(layout.written_marker_address(info), 4),
            &layout.marker_page(Marker::Written)[..]
        );
        assert_eq!(
            engine.block_location(1),
            Some(Location::Data { section: 0, address: data, info })
        );
        match recorder.drain().as_slice() {
            [Recorded::End(report)] => assert_eq!((report.block, report.kind), (1, JobKind::Write)),
            other => panic!("unexpected notifications {:?}", other),
        }
    }

    #[test]
    fn test_buffer_smaller_than_block_splits_payload() {
        let mut config = Config::small();
        config.buffer_size = 4;
        let (mut engine, _) = engine(config);
        let payload: Vec<u8> = (0..16).collect();
        engine.write(3, &payload).unwrap();
        let writes = engine.flash().stats().writes;
        run(&mut engine);
        // info, four chunks, marker
        assert_eq!(engine.flash().stats().writes - writes, 6);

        engine.read(3, 5, 7).unwrap();
        run(&mut engine);
        assert_eq!(engine.take_read_data(), Some((5..12).collect::<Vec<u8>>()));
    }

    #[test]
    fn test_invalidate_then_read() {
        let (mut engine, recorder) = engine(Config::small());
        engine.write(2, &[1; 16]).unwrap();
        engine.invalidate(2).unwrap();
        run(&mut engine);
        assert_eq!(engine.block_location(2), Some(Location::Invalidated { section: 0 }));

        engine.read(2, 0, 16).unwrap();
        run(&mut engine);
        assert_eq!(engine.job_result(), JobResult::BlockInvalid);
        assert_eq!(recorder.last_report().map(|r| r.result), Some(JobResult::BlockInvalid));
    }

    #[test]
    fn test_erase_immediate_of_unwritten_block_needs_no_flash() {
        let (mut engine, _) = engine(Config::small());
        let writes = engine.flash().stats().writes;
        engine.erase_immediate(4).unwrap();
        run(&mut engine);
        assert_eq!(engine.job_result(), JobResult::Ok);
        assert_eq!(engine.flash().stats().writes, writes);
    }

    #[test]
    fn test_failed_payload_write_keeps_previous_value() {
        let (mut engine, _) = engine(Config::small());
        engine.write(1, &[1; 16]).unwrap();
        run(&mut engine);
        let before = engine.block_location(1);

        engine.write(1, &[2; 16]).unwrap();
        // block-info succeeds, payload fails
        engine.tick();
        engine.flash_mut().inject_failures(1);
        run(&mut engine);
        assert_eq!(engine.job_result(), JobResult::NotOk);
        assert_eq!(engine.block_location(1), before);

        engine.read(1, 0, 16).unwrap();
        run(&mut engine);
        assert_eq!(engine.take_read_data(), Some(vec![1; 16]));
    }

    #[test]
    fn test_refused_request_retried_once() {
        let (mut engine, _) = engine(Config::small());
        engine.flash_mut().inject_refusals(1);
        engine.write(1, &[3; 16]).unwrap();
        run(&mut engine);
        assert_eq!(engine.job_result(), JobResult::Ok);
        assert_eq!(engine.stats().retries, 1);

        engine.flash_mut().inject_refusals(2);
        engine.write(1, &[4; 16]).unwrap();
        run(&mut engine);
        assert_eq!(engine.job_result(), JobResult::NotOk);
    }

    #[test]
    fn test_queue_depth() {
        let (mut engine, recorder) = engine(Config::small());
        engine.write(1, &[1; 16]).unwrap();
        for _ in 0..4 {
            engine.read(1, 0, 4).unwrap();
        }
        assert!(matches!(engine.read(1, 0, 4), Err(FeeError::Busy { depth: 4 })));
        assert_eq!(engine.status(), EngineStatus::Busy);
        run(&mut engine);
        assert_eq!(recorder.len(), 5);
        assert!(recorder.drain().iter().all(|e| matches!(e, Recorded::End(_))));
    }

    #[test]
    fn test_queued_job_result_pending_until_it_ends() {
        let (mut engine, recorder) = engine(Config::small());
        engine.write(1, &[1; 16]).unwrap();
        engine.write(2, &[2; 16]).unwrap();
        while recorder.is_empty() {
            engine.tick();
        }
        assert_eq!(engine.job_result(), JobResult::Pending);
        assert_eq!(engine.status(), EngineStatus::Busy);
        run(&mut engine);
        assert_eq!(engine.job_result(), JobResult::Ok);

        recorder.drain();
        engine.read(1, 0, 16).unwrap();
        engine.read(2, 0, 16).unwrap();
        while recorder.is_empty() {
            engine.tick();
        }
        assert_eq!(engine.job_result(), JobResult::Pending);
        assert_eq!(engine.take_read_data(), None, "payload of the first read belongs to it");
        run(&mut engine);
        assert_eq!(engine.take_read_data(), Some(vec![2; 16]));
    }

    #[test]
    fn test_records_keep_margin_below_info_area() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let (mut engine, _) = engine(config);
        for value in 0..60u8 {
            let block = 1 + (value % 3) as u16;
            engine.write(block, &[value; 16]).unwrap();
            run(&mut engine);
            assert_eq!(engine.job_result(), JobResult::Ok);
            for b in 1..=3 {
                if let Some(Location::Data { address, info, .. }) = engine.block_location(b) {
                    assert!(
                        address + layout.align(16) + layout.margin_bytes() <= info,
                        "block {} data at {:#x} runs into the margin below info slot {:#x}",
                        b,
                        address,
                        info
                    );
                }
            }
        }
        assert!(engine.stats().compactions > 0);
    }

    #[test]
    fn test_cancel_write_in_flight() {
        let config = Config::small();
        let flash = SimFlash::for_config(&config).with_latency(3);
        let mut engine = FeeEngine::new(config, flash).unwrap();
        engine.init();
        assert!(engine.tick_until_idle(1000));

        engine.write(1, &[9; 16]).unwrap();
        engine.tick();
        engine.tick();
        engine.cancel().unwrap();
        assert_eq!(engine.job_result(), JobResult::Cancelled);
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.block_location(1), Some(Location::Unknown));

        engine.write(1, &[8; 16]).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::Ok);
    }
}
