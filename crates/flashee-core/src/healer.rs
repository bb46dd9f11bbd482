//! Section healing and section management states
//!
//! After the scan, `startup2` walks the ring from the section after the
//! active one toward the oldest, repairing whatever it finds. The same
//! management states are used by compaction to retire and reformat sections.
//!
//! A section goes through these writes, each its own state:
//!
//! - mark erasable: header erasable page, then footer erasable page
//! - erase the whole section
//! - format: management object into the header, then into the footer
//! - mark active: header active page, then footer active page

use tracing::debug;

use crate::engine::{FeeEngine, Mode, State, Trigger};
use crate::flash::{FlashDriver, FlashJobResult};
use crate::layout::{Half, Marker, SectionMgmt};
use crate::section::SectionStatus;

/// Upper bound on sections visited by one healing pass
const MAX_HEAL_STEPS: usize = 256;

impl<F: FlashDriver> FeeEngine<F> {
    /// Repair the section under `working`, or leave startup once the oldest is reached
    pub(crate) fn startup2(&mut self) {
        self.delay = 0;
        for _ in 0..MAX_HEAL_STEPS {
            let w = self.working;
            match self.sections[w as usize].status {
                SectionStatus::Empty => {
                    if w == self.active {
                        self.working = self.ring.next(w);
                        self.mark_section_active(w);
                        return;
                    }
                    self.working = self.ring.next(w);
                }
                SectionStatus::NoFooter => {
                    self.next = Some(State::WriteSectionFooter);
                    return;
                }
                SectionStatus::ErasableHeader => {
                    self.next = Some(State::MarkFooterErasable);
                    return;
                }
                SectionStatus::Active => {
                    if w != self.oldest {
                        self.working = self.ring.next(w);
                        continue;
                    }
                    if self.ring.distance(self.active, self.oldest) >= self.ring.count() / 2 {
                        debug!(
                            active = self.active,
                            oldest = self.oldest,
                            "ring half full, compacting"
                        );
                        self.mode = Mode::Switch;
                        self.trigger_via(Trigger::Switch, State::TriggerJobOrInternal);
                    } else {
                        debug!("healing finished");
                        self.mode = Mode::Normal;
                        self.next = Some(State::Idle);
                    }
                    return;
                }
                _ => {
                    self.next = Some(State::EraseSection);
                    return;
                }
            }
        }
        self.mode = Mode::Normal;
        self.next = Some(State::Idle);
    }

    /// Make `section` the active one, starting with empty cursors
    pub(crate) fn mark_section_active(&mut self, section: u8) {
        debug!(section, "activating section");
        self.active = section;
        self.reset_cursors(section);
        self.next = Some(State::MarkHeaderActive);
    }

    fn write_marker(&mut self, section: u8, half: Half, marker: Marker) {
        let address = self.layout.marker_address(section, half, marker);
        let page = self.layout.marker_page(marker);
        self.flash_write(address, &page);
    }

    // -------------------------------------------------------------------------
    // Active markers
    // -------------------------------------------------------------------------

    pub(crate) fn enter_mark_header_active(&mut self) {
        self.write_marker(self.active, Half::Header, Marker::Active);
    }

    pub(crate) fn enter_mark_footer_active(&mut self) {
        self.write_marker(self.active, Half::Footer, Marker::Active);
    }

    pub(crate) fn poll_mark_header_active(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => return,
            FlashJobResult::Ok => {}
            _ => self.flash_failed(),
        }
        self.next = Some(State::MarkFooterActive);
    }

    pub(crate) fn poll_mark_footer_active(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                self.sections[self.active as usize].status = SectionStatus::Active;
                if self.ring.next(self.active) == self.oldest {
                    self.mode = Mode::Switch;
                    self.flags.priority = true;
                    self.switch.required = self.calc_required_space();
                    self.section_switching();
                    return;
                }
                self.flags.priority = false;
                match self.mode {
                    Mode::Startup2 => {
                        self.trigger_via(Trigger::Startup2, State::TriggerJobOrInternal)
                    }
                    Mode::Switch => self.trigger_via(Trigger::Switch, State::TriggerJobOrInternal),
                    _ => self.initiate_job(),
                }
            }
            _ => {
                self.flash_failed();
                if self.ring.next(self.active) == self.oldest {
                    self.flags.switch_restarted = true;
                }
                // Retire the half-marked section and format it again
                self.working = self.active;
                self.flags.priority = true;
                self.next = Some(State::MarkHeaderErasable);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Erasable markers and erase
    // -------------------------------------------------------------------------

    pub(crate) fn enter_mark_header_erasable(&mut self) {
        self.write_marker(self.working, Half::Header, Marker::Erasable);
    }

    pub(crate) fn enter_mark_footer_erasable(&mut self) {
        self.write_marker(self.working, Half::Footer, Marker::Erasable);
    }

    pub(crate) fn poll_mark_header_erasable(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => return,
            FlashJobResult::Ok => {}
            _ => self.flash_failed(),
        }
        self.next = Some(State::MarkFooterErasable);
    }

    pub(crate) fn poll_mark_footer_erasable(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => return,
            FlashJobResult::Ok => {}
            _ => self.flash_failed(),
        }
        self.sections[self.working as usize].status = SectionStatus::Erasable;
        if self.flags.priority {
            self.next = Some(State::EraseSection);
        } else if self.mode == Mode::Switch {
            self.switch.resume = Some(State::EraseSection);
            self.trigger_via(Trigger::Switch, State::TriggerJobOrInternal);
        } else {
            self.trigger_via(Trigger::Startup2, State::TriggerJobOrInternal);
        }
    }

    pub(crate) fn enter_erase_section(&mut self) {
        let w = self.working;
        debug!(section = w, "erasing section");
        if self.flash_erase(self.layout.section_start(w), self.layout.section_size()) {
            self.erase_counter = self.erase_counter.wrapping_add(1);
            self.stats.sections_erased += 1;
        }
    }

    pub(crate) fn poll_erase_section(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => {}
            FlashJobResult::Ok => {
                self.switch.resume = None;
                self.sections[self.working as usize].status = SectionStatus::Erased;
                self.next = Some(State::WriteSectionHeader);
            }
            FlashJobResult::Cancelled => self.next = Some(State::Idle),
            FlashJobResult::Failed => {
                self.flash_failed();
                if self.flags.priority {
                    self.next = Some(State::EraseSection);
                } else {
                    self.trigger_via(Trigger::Startup2, State::TriggerJobOrInternal);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Formatting
    // -------------------------------------------------------------------------

    fn write_mgmt(&mut self, half: Half) {
        let w = self.working;
        let mgmt = SectionMgmt {
            config_id: self.config.config_id,
            section_counter: self.sections[w as usize].counter,
            erase_counter: self.erase_counter,
        };
        let bytes = mgmt.to_bytes(self.layout.mgmt_size() as usize);
        self.flash_write(self.layout.mgmt_address(w, half), &bytes);
    }

    pub(crate) fn enter_write_section_header(&mut self) {
        let w = self.working;
        if w != self.active {
            let counter = self.sections[self.active as usize]
                .counter
                .wrapping_add(self.ring.distance(w, self.active));
            self.sections[w as usize].counter = counter;
        }
        self.write_mgmt(Half::Header);
    }

    pub(crate) fn enter_write_section_footer(&mut self) {
        self.write_mgmt(Half::Footer);
    }

    pub(crate) fn poll_write_section_header(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => return,
            FlashJobResult::Ok => {
                self.sections[self.working as usize].status = SectionStatus::Empty
            }
            _ => self.flash_failed(),
        }
        self.next = Some(State::WriteSectionFooter);
    }

    pub(crate) fn poll_write_section_footer(&mut self) {
        match self.flash_result() {
            FlashJobResult::Pending => return,
            FlashJobResult::Ok => {
                self.sections[self.working as usize].status = SectionStatus::Empty
            }
            _ => {
                self.flash_failed();
                self.sections[self.working as usize].status = SectionStatus::Inconsistent;
            }
        }

        let w = self.working;
        if self.sections[w as usize].status != SectionStatus::Empty {
            self.next = Some(State::MarkHeaderErasable);
            return;
        }
        debug!(section = w, counter = self.sections[w as usize].counter, "section formatted");

        match (self.mode, self.flags.priority) {
            (Mode::Switch, true) => {
                if self.flags.switch_restarted {
                    self.flags.switch_restarted = false;
                } else {
                    self.active = w;
                }
                self.mark_section_active(self.active);
            }
            (Mode::Switch, false) => {
                if self.ring.distance(self.active, self.oldest) < self.ring.count() / 2 {
                    debug!("compaction finished");
                    self.mode = Mode::Normal;
                    self.initiate_job();
                } else {
                    self.trigger_via(Trigger::Switch, State::TriggerJobOrInternal);
                }
            }
            (_, true) => {
                self.working = self.ring.next(w);
                self.mark_section_active(w);
            }
            (_, false) => self.trigger_via(Trigger::Startup2, State::TriggerJobOrInternal),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::engine::{FeeEngine, Mode};
    use crate::layout::{Half, Layout, ERASE_VALUE};
    use crate::notify::{Diagnostic, EngineStatus, JobRecorder};
    use crate::section::SectionStatus;
    use crate::sim::SimFlash;

    fn formatted(config: &Config) -> SimFlash {
        let mut engine = FeeEngine::new(config.clone(), SimFlash::for_config(config)).unwrap();
        engine.init();
        assert!(engine.tick_until_idle(1000));
        engine.into_flash()
    }

    #[test]
    fn test_missing_footer_is_written() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let mut flash = formatted(&config);
        let footer = layout.mgmt_address(2, Half::Footer);
        flash.poke(footer, &vec![ERASE_VALUE; layout.mgmt_size() as usize]);
        let erases = flash.stats().erases;

        let mut engine = FeeEngine::new(config, flash).unwrap();
        engine.init();
        assert!(engine.tick_until_idle(1000));
        assert_eq!(engine.section_status(2), Some(SectionStatus::Empty));
        assert_eq!(engine.flash().stats().erases, erases, "no erase needed");
        assert_ne!(engine.flash().peek(footer, 4), &[ERASE_VALUE; 4]);
    }

    #[test]
    fn test_erasable_section_is_erased_and_formatted() {
        let config = Config::small();
        let layout = Layout::new(&config);
        let mut flash = formatted(&config);
        let page = layout.page_size();
        flash.poke(layout.area_address(1, Half::Header), &vec![0xDD; page as usize]);

        let mut engine = FeeEngine::new(config, flash).unwrap();
        engine.init();
        assert!(engine.tick_until_idle(1000));
        assert_eq!(engine.section_status(1), Some(SectionStatus::Empty));
        assert_eq!(engine.erase_counter(), 4);
        assert_eq!(engine.mode(), Mode::Normal);
    }

    #[test]
    fn test_failed_erase_reports_and_retries() {
        let config = Config::small();
        let recorder = JobRecorder::new();
        let flash = SimFlash::for_config(&config).with_latency(2);
        let mut engine = FeeEngine::new(config, flash).unwrap().with_listener(recorder.clone());
        engine.init();
        while engine.mode() == Mode::Startup1 {
            engine.tick();
        }
        // the first erase is in flight now
        engine.flash_mut().inject_failures(1);
        assert!(engine.tick_until_idle(1000));
        assert_eq!(engine.status(), EngineStatus::Idle);
        assert_eq!(recorder.diagnostics(), vec![Diagnostic::FlashAccessFailed]);
        assert_eq!(engine.section_status(0), Some(SectionStatus::Active));
        assert_eq!(engine.erase_counter(), 4);
    }
}
