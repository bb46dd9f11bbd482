//! Critical block handling
//!
//! One configured block may be marked critical. Writing it cancels every
//! other job, preempts whatever background step is running and writes the
//! record straight into the active section, which always keeps enough space
//! reserved for it. Once the write completes the engine is frozen: only a
//! read or an erase-immediate of the critical block is accepted, and the
//! erase releases the freeze. A consistent critical record found at startup
//! freezes the engine the same way.

use tracing::{debug, warn};

use crate::engine::{FeeEngine, Job, Mode, State};
use crate::flash::FlashDriver;
use crate::notify::{JobKind, JobResult};
use crate::section::SectionStatus;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CriticalState {
    /// State preempted by the critical write; Some while the engine is frozen
    pub resume: Option<State>,
    /// Pending retry of the preempted state
    pub retry: Option<State>,
    /// Make the next poll of the resumed state see a failed request
    pub force_failure: bool,
    /// The freeze is being released by an erase-immediate
    pub releasing: bool,
}

impl<F: FlashDriver> FeeEngine<F> {
    /// A critical write that has not taken over the engine yet
    pub(crate) fn awaits_critical_takeover(&self, job: &Job) -> bool {
        Some(job.slot) == self.critical_slot
            && job.kind == JobKind::Write
            && self.critical.resume.is_none()
    }

    /// Start a pending critical write ahead of the regular poll.
    ///
    /// Returns true when the write took over this tick.
    pub(crate) fn critical_block_handle(&mut self) -> bool {
        let pending = match &self.job {
            Some(job) => self.awaits_critical_takeover(job),
            None => false,
        };
        if !pending || self.mode == Mode::Startup1 || self.next.is_some() {
            return false;
        }
        // A section being marked or formatted becomes usable first
        if self.sections[self.active as usize].status != SectionStatus::Active {
            return false;
        }
        self.initiate_critical_write()
    }

    fn initiate_critical_write(&mut self) -> bool {
        let Some(slot) = self.critical_slot else {
            return false;
        };
        let slot_size = self.layout.slot_size();
        let limit = self.cursor.info.saturating_sub((self.layout.margin() - 1) * slot_size);
        let needed = self.record_space(self.index.size(slot));
        if limit.saturating_sub(self.cursor.data) < needed {
            warn!(active = self.active, "no room left for the critical block");
            self.job_error(JobResult::NotOk);
            // The preempted step keeps running
            self.next = None;
            return false;
        }

        self.drop_other_jobs();
        debug!(preempted = ?self.state, "critical write takes over");
        self.flash.cancel();
        self.critical.resume = Some(self.state);
        self.critical.retry = self.retry_state.take();
        self.critical.releasing = false;
        self.buffer_index = 0;
        self.next = Some(State::WriteBlockInfo);
        true
    }

    /// Fail every job except the current critical one
    fn drop_other_jobs(&mut self) {
        let queued: Vec<Job> = self.queue.drain(..).collect();
        for job in queued {
            self.reject(job);
        }
    }

    fn reject(&mut self, job: Job) {
        if let Some(size) = job.previous_size {
            self.index.resize(job.slot, size);
        }
        self.stats.jobs_failed += 1;
        if Some(job.slot) != self.critical_slot {
            debug!(block = job.block, kind = ?job.kind, "job cancelled by critical block");
            self.notify(&job, JobResult::NotOk, None);
        }
    }

    /// Clear the way for a newly requested critical write
    pub(crate) fn cancel_for_critical(&mut self) {
        if let Some(job) = self.job.take() {
            if self.state.is_user() {
                self.flash.cancel();
                self.state = State::Idle;
                self.next = None;
            } else if self.state == State::WaitCycle
                && self.retry_state.is_some_and(State::is_user)
            {
                self.retry_state = None;
                self.state = State::Idle;
            }
            self.flags.user_job_changes_section = false;
            self.job_result = JobResult::NotOk;
            self.reject(job);
        }
        self.drop_other_jobs();
    }

    /// Put the engine back into `resume`, failing its interrupted request
    pub(crate) fn resume_state(&mut self, resume: Option<State>) {
        self.retry_state = self.critical.retry.take();
        match resume {
            Some(state) if state.awaits_flash() => {
                self.state = state;
                self.critical.force_failure = true;
                self.next = None;
            }
            Some(state) => self.next = Some(state),
            None => self.next = Some(State::Idle),
        }
    }

    /// Route the end of a critical job. Critical jobs are not notified.
    pub(crate) fn critical_job_finish(&mut self, job: &Job, result: JobResult) {
        let releasing = std::mem::take(&mut self.critical.releasing);
        match job.kind {
            JobKind::Write => {
                if self.critical.resume.is_none() {
                    self.next = Some(State::Idle);
                } else if result != JobResult::Ok && self.index.get(job.slot).is_inconsistent() {
                    // Nothing durable to freeze on
                    let resume = self.critical.resume.take();
                    self.resume_state(resume);
                } else {
                    debug!(block = job.block, ?result, "engine frozen by critical block");
                    self.next = Some(State::CriticalFrozen);
                }
            }
            JobKind::EraseImmediate if releasing => {
                if result == JobResult::Ok {
                    debug!(block = job.block, "critical block released");
                    self.next = Some(State::Idle);
                } else {
                    self.critical.resume = Some(State::Idle);
                    self.next = Some(State::CriticalFrozen);
                }
            }
            _ => {
                self.next = Some(if self.critical.resume.is_some() {
                    State::CriticalFrozen
                } else {
                    State::Idle
                });
            }
        }
    }

    /// Frozen: serve critical reads, release on a critical erase
    pub(crate) fn poll_critical_frozen(&mut self) {
        let Some(kind) = self
            .job
            .as_ref()
            .filter(|j| Some(j.slot) == self.critical_slot)
            .map(|j| j.kind)
        else {
            return;
        };
        match kind {
            JobKind::Read => self.initiate_read(),
            JobKind::EraseImmediate => {
                self.critical.releasing = true;
                let resume = self.critical.resume.take();
                match resume {
                    Some(State::Idle) | None => {
                        self.retry_state = self.critical.retry.take();
                        self.initiate_job();
                    }
                    resume => self.resume_state(resume),
                }
            }
            _ => {}
        }
    }

    /// Freeze at startup when the critical block holds a record.
    ///
    /// Returns true when the engine froze; pending jobs other than critical
    /// reads and erases are failed.
    pub(crate) fn critical_block_init(&mut self) -> bool {
        let Some(slot) = self.critical_slot else {
            return false;
        };
        if self.index.get(slot).is_inconsistent() {
            return false;
        }

        let served = |job: &Job| {
            job.slot == slot && matches!(job.kind, JobKind::Read | JobKind::EraseImmediate)
        };
        if self.job.as_ref().is_some_and(|job| !served(job)) {
            if let Some(job) = self.job.take() {
                self.job_result = JobResult::NotOk;
                self.reject(job);
            }
        }
        let queued: Vec<Job> = self.queue.drain(..).collect();
        for job in queued {
            if served(&job) {
                self.queue.push_back(job);
            } else {
                self.reject(job);
            }
        }
        if self.job.is_none() {
            self.promote_queued_job();
        }

        debug!(block = ?self.config.critical_block, "critical record present, engine frozen");
        self.critical.resume = Some(State::Idle);
        self.next = Some(State::CriticalFrozen);
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::engine::{FeeEngine, Mode};
    use crate::error::FeeError;
    use crate::notify::{JobKind, JobRecorder, JobResult, Recorded};
    use crate::sim::SimFlash;

    const CRITICAL: u16 = 4;

    fn engine(flash: Option<SimFlash>) -> (FeeEngine<SimFlash>, JobRecorder) {
        let config = Config::small().with_critical_block(CRITICAL);
        let flash = flash.unwrap_or_else(|| SimFlash::for_config(&config));
        let recorder = JobRecorder::new();
        let mut engine = FeeEngine::new(config, flash).unwrap().with_listener(recorder.clone());
        engine.init();
        assert!(engine.tick_until_idle(1000));
        (engine, recorder)
    }

    #[test]
    fn test_critical_write_freezes_engine() {
        let (mut engine, recorder) = engine(None);
        engine.write(CRITICAL, &[0xC1; 16]).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::Ok);
        assert!(engine.is_frozen());
        assert!(recorder.is_empty(), "critical jobs are not notified");

        assert!(matches!(engine.write(1, &[1; 16]), Err(FeeError::Frozen { block: CRITICAL })));
        assert!(matches!(engine.invalidate(CRITICAL), Err(FeeError::Frozen { .. })));

        engine.read(CRITICAL, 0, 16).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.take_read_data(), Some(vec![0xC1; 16]));
        assert!(engine.is_frozen());
    }

    #[test]
    fn test_erase_releases_freeze() {
        let (mut engine, _) = engine(None);
        engine.write(CRITICAL, &[0xC1; 16]).unwrap();
        assert!(engine.tick_until_idle(100));
        engine.erase_immediate(CRITICAL).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::Ok);
        assert!(!engine.is_frozen());

        engine.write(1, &[1; 16]).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::Ok);
        engine.read(CRITICAL, 0, 16).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::BlockInconsistent);
    }

    #[test]
    fn test_critical_write_cancels_other_jobs() {
        let (mut engine, recorder) = engine(None);
        engine.write(1, &[1; 16]).unwrap();
        engine.write(2, &[2; 16]).unwrap();
        engine.write(CRITICAL, &[0xC1; 16]).unwrap();
        assert!(engine.tick_until_idle(100));

        let events = recorder.drain();
        assert_eq!(events.len(), 2);
        for (event, block) in events.iter().zip([1, 2]) {
            match event {
                Recorded::Error(report) => {
                    assert_eq!(report.block, block);
                    assert_eq!(report.kind, JobKind::Write);
                    assert_eq!(report.result, JobResult::NotOk);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(engine.job_result(), JobResult::Ok);
    }

    #[test]
    fn test_critical_record_freezes_after_restart() {
        let (mut engine, _) = engine(None);
        engine.write(1, &[1; 16]).unwrap();
        assert!(engine.tick_until_idle(100));
        engine.write(CRITICAL, &[0xC1; 16]).unwrap();
        assert!(engine.tick_until_idle(100));

        let (mut engine, _) = self::engine(Some(engine.into_flash()));
        assert!(engine.is_frozen());
        assert!(matches!(engine.read(1, 0, 16), Err(FeeError::Frozen { .. })));
        engine.erase_immediate(CRITICAL).unwrap();
        assert!(engine.tick_until_idle(100));
        assert!(!engine.is_frozen());
        engine.read(1, 0, 16).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.take_read_data(), Some(vec![1; 16]));
    }

    #[test]
    fn test_critical_write_preempts_compaction() {
        let (mut engine, _) = engine(None);
        engine.write(2, &[2; 16]).unwrap();
        assert!(engine.tick_until_idle(100));
        let mut value = 0u8;
        while engine.mode() != Mode::Switch {
            value += 1;
            engine.write(1, &[value; 16]).unwrap();
            for _ in 0..200 {
                engine.tick();
                if engine.job_result() != JobResult::Pending {
                    break;
                }
            }
            assert_eq!(engine.job_result(), JobResult::Ok);
        }

        engine.write(CRITICAL, &[0xC1; 16]).unwrap();
        assert!(engine.tick_until_idle(200));
        assert!(engine.is_frozen());
        engine.erase_immediate(CRITICAL).unwrap();
        assert!(engine.tick_until_idle(5000));
        assert!(!engine.is_frozen());
        assert_eq!(engine.mode(), Mode::Normal);

        for (block, expected) in [(1, value), (2, 2)] {
            engine.read(block, 0, 16).unwrap();
            assert!(engine.tick_until_idle(100));
            assert_eq!(engine.take_read_data(), Some(vec![expected; 16]), "block {}", block);
        }
    }
}
