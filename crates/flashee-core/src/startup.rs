//! Startup scan: rebuild the section ring and the block index from flash
//!
//! The scan runs in three phases, one flash read per tick:
//!
//! 1. **Headers and footers**: every section is classified and its counters
//!    recorded. The newest formatted section is the one whose counter is
//!    ahead of the others by exactly its ring distance.
//! 2. **Active section**: walking backward from the newest formatted section,
//!    the first Active section is the active one and the last Active section
//!    reached is the oldest.
//! 3. **Block-info areas**: the active section and then every older Active
//!    section is read slot by slot from the footer downward, i.e. in the
//!    order the records were written. A record is trusted only with a valid
//!    checksum and, when it carries data, a written marker.

use tracing::{debug, error, warn};

use crate::engine::{FeeEngine, Mode, State};
use crate::flash::{FlashDriver, FlashJobResult};
use crate::index::Location;
use crate::layout::{is_erased, marker_present, BlockInfo, Half, Marker, SectionMgmt};
use crate::notify::Diagnostic;
use crate::section::{classify_half, decide, SectionInfo, SectionStatus};

/// Progress of the startup scan
#[derive(Debug, Default, Clone)]
pub(crate) struct ScanState {
    /// Classification of the header just read
    header: Option<(SectionStatus, Option<SectionMgmt>)>,
    /// Some header or footer was not blank
    any_written: bool,
    /// Newest formatted section seen so far
    candidate: Option<u8>,
    /// Configured blocks resolved so far
    found: usize,
    /// Data cursor of the section being scanned
    data: u32,
    /// Next block-info slot to examine
    next_slot: u32,
    /// Slots in the chunk being read
    chunk_slots: u32,
    /// Space reserved for trailing damaged records
    lost: u32,
    /// Consecutive erased slots
    erased_run: u32,
    /// Lowest non-erased slot
    last_used: Option<u32>,
}

impl<F: FlashDriver> FeeEngine<F> {
    // -------------------------------------------------------------------------
    // Headers and footers
    // -------------------------------------------------------------------------

    pub(crate) fn enter_read_header(&mut self) {
        let address = self.layout.area_address(self.working, Half::Header);
        self.flash_read(address, self.layout.header_size());
    }

    pub(crate) fn enter_read_footer(&mut self) {
        let address = self.layout.area_address(self.working, Half::Footer);
        self.flash_read(address, self.layout.header_size());
    }

    /// Classify the half just read; a failed read counts as inconsistent
    fn classify_read(&mut self, half: Half) -> Option<(SectionStatus, Option<SectionMgmt>)> {
        match self.flash_result() {
            FlashJobResult::Pending => None,
            FlashJobResult::Ok => {
                let area = self.flash.take_read_data();
                if !is_erased(&area) {
                    self.scan.any_written = true;
                }
                Some(classify_half(&self.layout, half, &area, self.config.config_id))
            }
            _ => {
                warn!(section = self.working, ?half, "management area unreadable");
                self.scan.any_written = true;
                Some((SectionStatus::Inconsistent, None))
            }
        }
    }

    pub(crate) fn poll_read_header(&mut self) {
        if let Some(header) = self.classify_read(Half::Header) {
            self.scan.header = Some(header);
            self.next = Some(State::InitReadFooter);
        }
    }

    pub(crate) fn poll_read_footer(&mut self) {
        let Some((footer, footer_mgmt)) = self.classify_read(Half::Footer) else {
            return;
        };
        let (header, header_mgmt) =
            self.scan.header.take().unwrap_or((SectionStatus::Inconsistent, None));

        let status = decide(header, footer);
        let counter = header_mgmt.or(footer_mgmt).map_or(0, |m| m.section_counter);
        for mgmt in [header_mgmt, footer_mgmt].into_iter().flatten() {
            self.erase_counter = self.erase_counter.max(mgmt.erase_counter);
        }
        let w = self.working;
        self.sections[w as usize] = SectionInfo { status, counter };
        debug!(section = w, ?header, ?footer, ?status, counter, "section classified");

        if matches!(
            status,
            SectionStatus::Active | SectionStatus::Empty | SectionStatus::NoFooter
        ) {
            self.scan.candidate = match self.scan.candidate {
                None => Some(w),
                Some(c) => {
                    let expected =
                        self.sections[c as usize].counter.wrapping_add(self.ring.distance(w, c));
                    if counter == expected {
                        Some(w)
                    } else {
                        Some(c)
                    }
                }
            };
        }

        self.working += 1;
        if self.working < self.ring.count() {
            self.next = Some(State::InitReadHeader);
        } else {
            self.find_newest_active();
            self.begin_fill_cache();
        }
    }

    fn find_newest_active(&mut self) {
        let mut active = None;
        self.oldest = 0;
        if let Some(candidate) = self.scan.candidate {
            let mut s = candidate;
            for _ in 0..self.ring.count() {
                match self.sections[s as usize].status {
                    SectionStatus::Empty | SectionStatus::NoFooter if active.is_none() => {
                        self.oldest = s
                    }
                    SectionStatus::Active => {
                        if active.is_none() {
                            active = Some(s);
                        }
                        self.oldest = s;
                    }
                    _ => {}
                }
                s = self.ring.prev(s);
            }
        }

        match active {
            Some(a) => {
                self.active = a;
                if self.ring.next(a) == self.oldest {
                    // Every section is in use: an earlier compaction was cut short
                    self.flags.priority = true;
                }
            }
            None => {
                if self.scan.any_written {
                    error!("no active section found, stored data cannot be recovered");
                    self.diagnostic(Diagnostic::DataNotRecovered);
                }
                self.active = self.oldest;
            }
        }
        debug!(
            active = self.active,
            oldest = self.oldest,
            priority = self.flags.priority,
            "ring located"
        );
    }

    // -------------------------------------------------------------------------
    // Block-info areas
    // -------------------------------------------------------------------------

    fn begin_fill_cache(&mut self) {
        self.scan.found = 0;
        if self.sections[self.active as usize].status == SectionStatus::Active {
            self.working = self.active;
            self.start_section_scan();
        } else {
            self.startup1_finished();
        }
    }

    fn start_section_scan(&mut self) {
        let w = self.working;
        self.scan.data = self.layout.data_start(w);
        self.scan.next_slot = self.layout.first_info_address(w);
        self.scan.lost = 0;
        self.scan.erased_run = 0;
        self.scan.last_used = None;
        self.fill_cache_or_complete();
    }

    /// Lowest slot address that can still hold a record
    fn scan_floor(&self) -> u32 {
        self.scan.data + self.layout.margin_bytes()
    }

    fn fill_cache_or_complete(&mut self) {
        let slot = self.layout.slot_size();
        let floor = self.scan_floor();
        if self.scan.next_slot < floor {
            self.section_complete();
            return;
        }
        let available = (self.scan.next_slot - floor) / slot + 1;
        self.scan.chunk_slots = available.min(self.config.init_buffer_size / slot).max(1);
        self.next = Some(State::InitFillCache);
    }

    pub(crate) fn enter_fill_cache(&mut self) {
        let slot = self.layout.slot_size();
        let k = self.scan.chunk_slots;
        let address = self.scan.next_slot - (k - 1) * slot;
        self.flash_read(address, k * slot);
    }

    pub(crate) fn poll_fill_cache(&mut self) {
        let chunk = match self.flash_result() {
            FlashJobResult::Pending => return,
            FlashJobResult::Ok => Some(self.flash.take_read_data()),
            _ => {
                warn!(
                    section = self.working,
                    address = self.scan.next_slot,
                    "block-info chunk unreadable"
                );
                None
            }
        };

        let slot = self.layout.slot_size() as usize;
        let info_size = self.layout.info_size() as usize;
        let k = self.scan.chunk_slots as usize;
        for i in 0..k {
            let address = self.scan.next_slot;
            if address < self.scan_floor() {
                self.section_complete();
                return;
            }
            let bytes = chunk.as_ref().and_then(|c| c.get((k - 1 - i) * slot..(k - i) * slot));
            match bytes {
                Some(b) if is_erased(b) => {
                    self.scan.erased_run += 1;
                    if self.scan.erased_run >= self.layout.margin() {
                        self.section_complete();
                        return;
                    }
                }
                Some(b) => {
                    self.scan.erased_run = 0;
                    self.scan.last_used = Some(address);
                    match BlockInfo::from_bytes(&b[..info_size]) {
                        Some(info) => {
                            let written = marker_present(&b[info_size..], Marker::Written);
                            self.process_record(info, address, written);
                        }
                        None => {
                            warn!(address, "damaged block-info record");
                            self.scan.lost += self.layout.align(self.biggest_block() as u32);
                        }
                    }
                }
                None => {
                    self.scan.erased_run = 0;
                    self.scan.last_used = Some(address);
                    self.scan.lost += self.layout.align(self.biggest_block() as u32);
                }
            }
            self.scan.next_slot -= slot as u32;
        }
        self.fill_cache_or_complete();
    }

    fn biggest_block(&self) -> u16 {
        let configured = self.config.blocks.iter().map(|b| b.size).max().unwrap_or(0);
        configured.max(self.config.not_configured_max_size)
    }

    fn process_record(&mut self, info: BlockInfo, address: u32, written: bool) {
        let number = info.block_number;
        let slot = match self.index.slot_of(number) {
            Some(slot) => slot,
            None => match self.index.register(number, info.block_length) {
                Some(slot) => {
                    debug!(
                        block = number,
                        size = info.block_length,
                        "unconfigured block registered"
                    );
                    slot
                }
                None => {
                    error!(block = number, "unconfigured block dropped, budget exhausted");
                    self.flags.not_configured_lost = true;
                    self.diagnostic(Diagnostic::NotConfiguredBlockLost { block: number });
                    self.skip_record_data(info, address);
                    return;
                }
            },
        };

        if self.index.is_configured(slot)
            && info.block_length != 0
            && info.block_length != self.index.size(slot)
        {
            warn!(
                block = number,
                length = info.block_length,
                "record length differs from configuration"
            );
            self.skip_record_data(info, address);
            return;
        }
        self.cache_if_preconditions(slot, info, address, written);
    }

    /// Whether the payload of `info` lies where a record at `address` could have put it
    fn data_in_section(&self, info: &BlockInfo, address: u32) -> bool {
        let end = info.data_address as u64 + self.layout.align(info.block_length as u32) as u64;
        info.data_address >= self.layout.data_start(self.working)
            && end + self.layout.margin_bytes() as u64 <= address as u64
    }

    /// Account for the payload of a record that is not cached
    fn skip_record_data(&mut self, info: BlockInfo, address: u32) {
        if info.block_length > 0 && self.data_in_section(&info, address) {
            let end = info.data_address + self.layout.align(info.block_length as u32);
            self.scan.data = self.scan.data.max(end);
        }
    }

    fn cache_if_preconditions(
        &mut self,
        slot: usize,
        info: BlockInfo,
        address: u32,
        written: bool,
    ) {
        let w = self.working;
        let entry = self.index.get(slot);
        if entry == Location::Unknown || entry.section() == Some(w) {
            if let Some(location) = self.cache_record(slot, info, address, written) {
                if entry == Location::Unknown && self.index.is_configured(slot) {
                    self.scan.found += 1;
                }
                self.index.set(slot, location);
            }
        } else if self.flags.priority && w != self.active && entry.section() == Some(self.active) {
            // Pre-compaction copy, restored if the compaction has to restart
            let restart = self.index.restart_entry(slot);
            if restart == Location::Unknown || restart.section() == Some(w) {
                if let Some(location) = self.cache_record(slot, info, address, written) {
                    self.index.set_restart_entry(slot, location);
                }
            }
        } else {
            self.skip_record_data(info, address);
        }
    }

    /// Location described by a record, None when it must not be trusted
    fn cache_record(
        &mut self,
        slot: usize,
        info: BlockInfo,
        address: u32,
        written: bool,
    ) -> Option<Location> {
        let w = self.working;
        if info.block_length == 0 {
            return Some(if info.data_address == self.layout.invalidated_address(w) {
                Location::Invalidated { section: w }
            } else {
                Location::Inconsistent { section: w }
            });
        }

        if written {
            self.scan.lost = 0;
        }
        if !self.data_in_section(&info, address) {
            warn!(
                block = info.block_number,
                address = info.data_address,
                "record points outside its section"
            );
            return None;
        }
        self.skip_record_data(info, address);
        if !written {
            return None;
        }
        if !self.index.is_configured(slot) && !self.index.resize(slot, info.block_length) {
            return None;
        }
        Some(Location::Data { section: w, address: info.data_address, info: address })
    }

    fn section_complete(&mut self) {
        let w = self.working;
        let data = self.scan.data + self.scan.lost;
        if w == self.active {
            self.cursor.data = data;
            self.cursor.info = match self.scan.last_used {
                Some(address) => address - self.layout.slot_size(),
                None => self.layout.first_info_address(w),
            };
        }
        debug!(section = w, data, last_used = ?self.scan.last_used, "block-info area scanned");
        self.next_scan_step();
    }

    fn next_scan_step(&mut self) {
        let resolved = self.scan.found == self.index.configured_len()
            && !self.flags.priority
            && self.config.not_configured_capacity == 0;
        if resolved {
            self.startup1_finished();
            return;
        }

        let mut s = self.ring.prev(self.working);
        while s != self.active {
            if self.sections[s as usize].status == SectionStatus::Active {
                self.working = s;
                self.start_section_scan();
                return;
            }
            s = self.ring.prev(s);
        }
        self.startup1_finished();
    }

    fn startup1_finished(&mut self) {
        self.delay = 0;
        if self.sections[self.active as usize].status == SectionStatus::Active {
            if self.flags.priority {
                self.mode = Mode::Switch;
                self.switch.required = self.calc_required_space();
            } else {
                self.mode = Mode::Startup2;
                self.working = self.ring.next(self.active);
            }
            debug!(mode = ?self.mode, active = self.active, oldest = self.oldest, "scan finished");
            if !self.critical_block_init() {
                self.initiate_job();
            }
        } else {
            self.mode = Mode::Startup2;
            self.working = self.active;
            self.flags.priority = true;
            debug!(active = self.active, "scan finished without an active section");
            self.startup2();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::engine::FeeEngine;
    use crate::index::Location;
    use crate::layout::{BlockInfo, Layout, Marker, STATUS_USER};
    use crate::notify::{Diagnostic, JobRecorder};
    use crate::section::SectionStatus;
    use crate::sim::SimFlash;

    fn formatted() -> SimFlash {
        let config = Config::small();
        let mut engine = FeeEngine::new(config.clone(), SimFlash::for_config(&config)).unwrap();
        engine.init();
        assert!(engine.tick_until_idle(1000));
        engine.into_flash()
    }

    fn restart(flash: SimFlash, recorder: &JobRecorder) -> FeeEngine<SimFlash> {
        let mut engine =
            FeeEngine::new(Config::small(), flash).unwrap().with_listener(recorder.clone());
        engine.init();
        assert!(engine.tick_until_idle(1000));
        engine
    }

    /// Program a record by hand: info at `slot`, payload at `data`
    fn poke_record(
        flash: &mut SimFlash,
        layout: &Layout,
        slot: u32,
        block: u16,
        data: u32,
        payload: &[u8],
        written: bool,
    ) {
        let info = BlockInfo {
            block_number: block,
            block_length: payload.len() as u16,
            data_address: data,
            write_status: STATUS_USER,
        };
        flash.poke(slot, &info.to_bytes(layout.info_size() as usize));
        flash.poke(data, &layout.padded(payload));
        if written {
            flash.poke(layout.written_marker_address(slot), &layout.marker_page(Marker::Written));
        }
    }

    #[test]
    fn test_scan_recovers_records_in_write_order() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let mut flash = formatted();
        let first = layout.first_info_address(0);
        let slot = layout.slot_size();
        poke_record(&mut flash, &layout, first, 1, layout.data_start(0), &[1; 16], true);
        let second = layout.data_start(0) + 16;
        poke_record(&mut flash, &layout, first - slot, 1, second, &[2; 16], true);

        let recorder = JobRecorder::new();
        let engine = restart(flash, &recorder);
        assert_eq!(
            engine.block_location(1),
            Some(Location::Data { section: 0, address: second, info: first - slot })
        );
        assert_eq!(engine.cursor.data, layout.data_start(0) + 32);
        assert_eq!(engine.cursor.info, first - 2 * slot);
    }

    #[test]
    fn test_unmarked_record_keeps_previous_value() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let mut flash = formatted();
        let first = layout.first_info_address(0);
        let slot = layout.slot_size();
        poke_record(&mut flash, &layout, first, 2, layout.data_start(0), &[1; 16], true);
        let second = layout.data_start(0) + 16;
        poke_record(&mut flash, &layout, first - slot, 2, second, &[2; 16], false);

        let engine = restart(flash, &JobRecorder::new());
        assert_eq!(
            engine.block_location(2),
            Some(Location::Data { section: 0, address: layout.data_start(0), info: first })
        );
        assert_eq!(
            engine.cursor.data,
            layout.data_start(0) + 32,
            "unmarked payload space stays reserved"
        );
    }

    #[test]
    fn test_damaged_record_reserves_biggest_block() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let mut flash = formatted();
        let first = layout.first_info_address(0);
        flash.poke(first, &[0x12, 0x34, 0x56]);

        let engine = restart(flash, &JobRecorder::new());
        assert_eq!(engine.cursor.data, layout.data_start(0) + 16);
        assert_eq!(engine.cursor.info, first - layout.slot_size());
    }

    #[test]
    fn test_unknown_block_without_budget_is_reported() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let mut flash = formatted();
        let first = layout.first_info_address(0);
        poke_record(&mut flash, &layout, first, 77, layout.data_start(0), &[9; 8], true);

        let recorder = JobRecorder::new();
        let engine = restart(flash, &recorder);
        assert!(engine.flags.not_configured_lost);
        assert_eq!(recorder.diagnostics(), vec![Diagnostic::NotConfiguredBlockLost { block: 77 }]);
        assert_eq!(engine.cursor.data, layout.data_start(0) + 8);
    }

    #[test]
    fn test_invalidate_record_restored() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let mut flash = formatted();
        let info = BlockInfo {
            block_number: 3,
            block_length: 0,
            data_address: layout.invalidated_address(0),
            write_status: STATUS_USER,
        };
        flash.poke(layout.first_info_address(0), &info.to_bytes(layout.info_size() as usize));

        let engine = restart(flash, &JobRecorder::new());
        assert_eq!(engine.block_location(3), Some(Location::Invalidated { section: 0 }));
    }

    #[test]
    fn test_foreign_config_id_reformats() {
        let mut config = Config::small();
        let flash = formatted();
        config.config_id = 9;
        let recorder = JobRecorder::new();
        let mut engine = FeeEngine::new(config, flash).unwrap().with_listener(recorder.clone());
        engine.init();
        assert!(engine.tick_until_idle(1000));
        assert_eq!(recorder.diagnostics(), vec![Diagnostic::DataNotRecovered]);
        assert_eq!(engine.section_status(engine.active_section()), Some(SectionStatus::Active));
    }
}
