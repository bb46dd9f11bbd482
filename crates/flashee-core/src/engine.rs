//! Core emulation engine: one state machine driving one flash request per tick.
//!
//! FeeEngine owns the flash driver, the block index and the section ring.
//! Callers queue jobs through the public API and call `tick()` periodically;
//! each tick polls the result of the request in flight, runs the transitions
//! it causes, and submits at most one new request.
//!
//! **Startup**: scan headers/footers, pick the active section, rebuild the index
//! **Healing**: erase and reformat damaged sections, finish interrupted markings
//! **Jobs**: block-info record, data, written marker, then commit to the index
//! **Compaction**: copy live records out of the oldest section, then erase it
//!
//! The states themselves live in `startup`, `healer`, `jobs`, `compaction` and
//! `critical`; this module holds the context, the dispatch and the API.

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use crate::compaction::SwitchProgress;
use crate::config::Config;
use crate::critical::CriticalState;
use crate::error::{FeeError, FeeResult};
use crate::flash::{DriverStatus, FlashDriver, FlashJobResult, Submit};
use crate::index::{BlockIndex, Location};
use crate::layout::Layout;
use crate::notify::{
    ControlHandle, Diagnostic, EngineStatus, JobKind, JobListener, JobReport, JobResult,
    NoopListener,
};
use crate::section::{Ring, SectionInfo, SectionStatus};
use crate::startup::ScanState;

/// Upper bound on transitions run within one tick
const MAX_TRANSITIONS: usize = 64;

/// Engine states. Flash states submit their request on entry and evaluate
/// its result when polled on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Uninit,
    Idle,
    /// Wait one tick, then retry `retry_state` or run the trigger
    WaitCycle,
    /// Serve a pending job if any, otherwise run the trigger
    TriggerJobOrInternal,
    CriticalFrozen,

    InitReadHeader,
    InitReadFooter,
    InitFillCache,

    MarkHeaderActive,
    MarkFooterActive,
    MarkHeaderErasable,
    MarkFooterErasable,
    WriteSectionHeader,
    WriteSectionFooter,
    EraseSection,

    WriteBlockInfo,
    Invalidate,
    EraseImmediate,
    WriteBlockData,
    WrittenMarker,
    ReadBlockInfo,
    ReadBlockData,

    SsCopyInfo,
    SsReadData,
    SsCopyData,
    SsWrittenMarker,
}

impl State {
    /// States that evaluate a flash request when polled
    pub(crate) fn awaits_flash(self) -> bool {
        !matches!(
            self,
            State::Uninit
                | State::Idle
                | State::WaitCycle
                | State::TriggerJobOrInternal
                | State::CriticalFrozen
        )
    }

    /// States working on behalf of the current job
    pub(crate) fn is_user(self) -> bool {
        matches!(
            self,
            State::WriteBlockInfo
                | State::Invalidate
                | State::EraseImmediate
                | State::WriteBlockData
                | State::WrittenMarker
                | State::ReadBlockInfo
                | State::ReadBlockData
        )
    }
}

/// Operating mode of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Scanning flash and rebuilding the index
    Startup1,
    /// Healing sections after the scan
    Startup2,
    /// Serving jobs
    Normal,
    /// Compacting the oldest section in the background
    Switch,
}

/// Background routine run when the engine has nothing else to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Startup2,
    Switch,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Flags {
    /// Compaction or healing must finish before any job is served
    pub priority: bool,
    /// The current job already moved the active section forward
    pub user_job_changes_section: bool,
    /// The active section is being reformatted after a failed priority compaction
    pub switch_restarted: bool,
    /// The request of the current state was refused for good
    pub final_refusal: bool,
    /// A failed compaction read is being retried
    pub copy_read_retry: bool,
    /// A block found in flash did not fit the unconfigured-block budget
    pub not_configured_lost: bool,
}

/// A caller request
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub kind: JobKind,
    pub slot: usize,
    pub block: u16,
    pub offset: u16,
    pub length: u16,
    pub data: Vec<u8>,
    /// Registered size to restore if a resizing write does not complete
    pub previous_size: Option<u16>,
}

impl Job {
    fn new(kind: JobKind, slot: usize, block: u16) -> Self {
        Self { kind, slot, block, offset: 0, length: 0, data: Vec::new(), previous_size: None }
    }
}

/// Free-space cursors of the active section
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursors {
    /// Next free data address, grows upward
    pub data: u32,
    /// Next free block-info slot, grows downward
    pub info: u32,
}

/// Record currently being written
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Record {
    pub info: u32,
    pub data: u32,
}

/// Engine counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub compactions: u64,
    pub sections_erased: u64,
    pub retries: u64,
}

/// Flash EEPROM emulation engine.
///
/// Nothing happens outside `tick()`: the public job methods only validate
/// and queue, and every flash access is started and observed from the tick.
/// Job completion is reported through the [`JobListener`] and `job_result()`.
pub struct FeeEngine<F: FlashDriver> {
    pub(crate) config: Config,
    pub(crate) layout: Layout,
    pub(crate) ring: Ring,
    pub(crate) flash: F,
    pub(crate) listener: Box<dyn JobListener>,
    pub(crate) control: ControlHandle,

    pub(crate) state: State,
    /// State to enter before the tick ends
    pub(crate) next: Option<State>,
    pub(crate) mode: Mode,
    pub(crate) flags: Flags,
    pub(crate) trigger: Trigger,
    /// Idle ticks left before background work resumes
    pub(crate) delay: u8,
    /// State to re-enter after a refused request
    pub(crate) retry_state: Option<State>,
    pub(crate) retries: u8,

    pub(crate) sections: Vec<SectionInfo>,
    pub(crate) active: u8,
    pub(crate) oldest: u8,
    /// Section being scanned, healed or formatted
    pub(crate) working: u8,
    pub(crate) cursor: Cursors,
    pub(crate) record: Record,
    /// Consecutive block-info writes that failed
    pub(crate) margin_count: u32,
    pub(crate) erase_counter: u32,

    pub(crate) index: BlockIndex,
    pub(crate) critical_slot: Option<usize>,

    pub(crate) job: Option<Job>,
    pub(crate) queue: VecDeque<Job>,
    pub(crate) job_result: JobResult,
    pub(crate) read_data: Option<Vec<u8>>,
    /// Payload bytes of the current job already written
    pub(crate) buffer_index: u32,

    pub(crate) switch: SwitchProgress,
    pub(crate) scan: ScanState,
    pub(crate) critical: CriticalState,
    pub(crate) stats: EngineStats,
}

impl<F: FlashDriver> FeeEngine<F> {
    /// Create an uninitialized engine over `flash`.
    ///
    /// Fails with `InvalidConfig` when the configuration does not validate.
    pub fn new(config: Config, flash: F) -> FeeResult<Self> {
        config.validate().map_err(|reason| FeeError::InvalidConfig { reason })?;
        let layout = Layout::new(&config);
        let index = BlockIndex::new(&config);
        let critical_slot = config.critical_block.and_then(|b| index.slot_of(b));

        Ok(Self {
            layout,
            ring: Ring::new(config.section_count),
            flash,
            listener: Box::new(NoopListener),
            control: ControlHandle::new(),
            state: State::Uninit,
            next: None,
            mode: Mode::Startup1,
            flags: Flags::default(),
            trigger: Trigger::Startup2,
            delay: 0,
            retry_state: None,
            retries: config.max_retries,
            sections: vec![SectionInfo::default(); config.section_count as usize],
            active: 0,
            oldest: 0,
            working: 0,
            cursor: Cursors::default(),
            record: Record::default(),
            margin_count: 0,
            erase_counter: 0,
            index,
            critical_slot,
            job: None,
            queue: VecDeque::with_capacity(config.queue_depth),
            job_result: JobResult::Ok,
            read_data: None,
            buffer_index: 0,
            switch: SwitchProgress::default(),
            scan: ScanState::default(),
            critical: CriticalState::default(),
            stats: EngineStats::default(),
            config,
        })
    }

    /// Route job completions to `listener`
    pub fn with_listener(mut self, listener: impl JobListener + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }

    /// Use an existing control block, e.g. one already given to the driver
    pub fn with_control(mut self, control: ControlHandle) -> Self {
        self.control = control;
        self
    }

    /// Handle for out-of-band control and driver completion callbacks
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Start the startup scan. Any previous state and pending job is dropped.
    pub fn init(&mut self) {
        self.index.reset();
        self.sections.fill(SectionInfo::default());
        self.mode = Mode::Startup1;
        self.flags = Flags::default();
        self.trigger = Trigger::Startup2;
        self.delay = 0;
        self.retry_state = None;
        self.retries = self.config.max_retries;
        self.active = 0;
        self.oldest = 0;
        self.working = 0;
        self.cursor = Cursors::default();
        self.margin_count = 0;
        self.erase_counter = 0;
        self.job = None;
        self.queue.clear();
        self.job_result = JobResult::Ok;
        self.read_data = None;
        self.switch = SwitchProgress::default();
        self.scan = ScanState::default();
        self.critical = CriticalState::default();

        debug!(sections = self.config.section_count, "starting flash scan");
        self.state = State::Idle;
        self.next = Some(State::InitReadHeader);
    }

    /// Cancel the request in flight and return to the uninitialized state
    pub fn shutdown(&mut self) {
        if self.state != State::Uninit {
            self.flash.cancel();
        }
        self.state = State::Uninit;
        self.next = None;
        self.job = None;
        self.queue.clear();
    }

    /// Advance the engine by one step.
    ///
    /// Polls the request in flight, runs the transitions it causes (at most
    /// one of which submits a new request) and ticks the driver.
    pub fn tick(&mut self) {
        if self.state == State::Uninit || self.control.activities_frozen() {
            return;
        }

        // A transition queued outside the tick (init) runs before any poll
        if self.next.is_none() && !self.critical_block_handle() {
            self.poll();
        }

        let mut transitions = 0;
        while let Some(state) = self.next.take() {
            if state != self.state {
                debug!(from = ?self.state, to = ?state, "transition");
            }
            self.state = state;
            self.enter(state);
            transitions += 1;
            if transitions >= MAX_TRANSITIONS {
                warn!(state = ?self.state, "transition limit reached within one tick");
                break;
            }
        }

        self.flash.main_function();
    }

    /// Tick until the engine is idle. Returns false if `max_ticks` ran out first.
    pub fn tick_until_idle(&mut self, max_ticks: usize) -> bool {
        for _ in 0..max_ticks {
            if self.status() == EngineStatus::Idle {
                return true;
            }
            self.tick();
        }
        self.status() == EngineStatus::Idle
    }

    /// Submit the request of a freshly entered state
    fn enter(&mut self, state: State) {
        match state {
            State::Uninit
            | State::Idle
            | State::WaitCycle
            | State::TriggerJobOrInternal
            | State::CriticalFrozen => {}

            State::InitReadHeader => self.enter_read_header(),
            State::InitReadFooter => self.enter_read_footer(),
            State::InitFillCache => self.enter_fill_cache(),

            State::MarkHeaderActive => self.enter_mark_header_active(),
            State::MarkFooterActive => self.enter_mark_footer_active(),
            State::MarkHeaderErasable => self.enter_mark_header_erasable(),
            State::MarkFooterErasable => self.enter_mark_footer_erasable(),
            State::WriteSectionHeader => self.enter_write_section_header(),
            State::WriteSectionFooter => self.enter_write_section_footer(),
            State::EraseSection => self.enter_erase_section(),

            State::WriteBlockInfo => self.enter_write_block_info(),
            State::Invalidate => self.enter_invalidate(),
            State::EraseImmediate => self.enter_erase_immediate(),
            State::WriteBlockData => self.enter_write_block_data(),
            State::WrittenMarker => self.enter_written_marker(),
            State::ReadBlockInfo => self.enter_read_block_info(),
            State::ReadBlockData => self.enter_read_block_data(),

            State::SsCopyInfo => self.enter_copy_info(),
            State::SsReadData => self.enter_copy_read(),
            State::SsCopyData => self.enter_copy_data(),
            State::SsWrittenMarker => self.enter_copy_written_marker(),
        }
    }

    /// Evaluate the current state
    fn poll(&mut self) {
        match self.state {
            State::Uninit => {}
            State::Idle => self.poll_idle(),
            State::WaitCycle => match self.retry_state.take() {
                Some(state) => self.next = Some(state),
                None => self.run_trigger(),
            },
            State::TriggerJobOrInternal => {
                if self.has_ordinary_job() {
                    self.initiate_job();
                } else {
                    self.run_trigger();
                }
            }
            State::CriticalFrozen => self.poll_critical_frozen(),

            State::InitReadHeader => self.poll_read_header(),
            State::InitReadFooter => self.poll_read_footer(),
            State::InitFillCache => self.poll_fill_cache(),

            State::MarkHeaderActive => self.poll_mark_header_active(),
            State::MarkFooterActive => self.poll_mark_footer_active(),
            State::MarkHeaderErasable => self.poll_mark_header_erasable(),
            State::MarkFooterErasable => self.poll_mark_footer_erasable(),
            State::WriteSectionHeader => self.poll_write_section_header(),
            State::WriteSectionFooter => self.poll_write_section_footer(),
            State::EraseSection => self.poll_erase_section(),

            State::WriteBlockInfo => self.poll_write_block_info(),
            State::Invalidate | State::EraseImmediate => self.poll_invalidate_or_erase(),
            State::WriteBlockData => self.poll_write_block_data(),
            State::WrittenMarker => self.poll_written_marker(),
            State::ReadBlockInfo => self.poll_read_block_info(),
            State::ReadBlockData => self.poll_read_block_data(),

            State::SsCopyInfo => self.poll_copy_info(),
            State::SsReadData => self.poll_copy_read(),
            State::SsCopyData => self.poll_copy_data(),
            State::SsWrittenMarker => self.poll_copy_written_marker(),
        }
    }

    fn poll_idle(&mut self) {
        if self.mode == Mode::Startup1 {
            return;
        }
        if self.has_ordinary_job() {
            self.initiate_job();
            return;
        }
        if matches!(self.mode, Mode::Startup2 | Mode::Switch) {
            match self.delay {
                crate::config::DELAY_INFINITE => {}
                0 => match self.mode {
                    Mode::Startup2 => self.startup2(),
                    _ => self.section_switching(),
                },
                _ => self.delay -= 1,
            }
        }
    }

    pub(crate) fn run_trigger(&mut self) {
        match self.trigger {
            Trigger::Startup2 => self.startup2(),
            Trigger::Switch => self.section_switching(),
        }
    }

    /// Run `trigger` from `via` (TriggerJobOrInternal or WaitCycle) on the next tick
    pub(crate) fn trigger_via(&mut self, trigger: Trigger, via: State) {
        self.trigger = trigger;
        self.next = Some(via);
    }

    /// A job that the regular job path may start
    pub(crate) fn has_ordinary_job(&self) -> bool {
        match &self.job {
            Some(job) => !self.awaits_critical_takeover(job),
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Flash access
    // -------------------------------------------------------------------------

    pub(crate) fn flash_read(&mut self, address: u32, length: u32) -> bool {
        let submit = self.flash.read(address, length);
        self.submitted(submit)
    }

    pub(crate) fn flash_write(&mut self, address: u32, data: &[u8]) -> bool {
        let submit = self.flash.write(address, data);
        self.submitted(submit)
    }

    pub(crate) fn flash_erase(&mut self, address: u32, length: u32) -> bool {
        let submit = self.flash.erase(address, length);
        self.submitted(submit)
    }

    fn submitted(&mut self, submit: Submit) -> bool {
        if submit.is_accepted() {
            self.retries = self.config.max_retries;
            self.flags.final_refusal = false;
            if !self.config.polling_mode {
                self.control.flash_job_started();
            }
            return true;
        }
        self.flash_refused();
        false
    }

    /// Retry while the driver is busy, then give up
    fn flash_refused(&mut self) {
        if self.flash.status() == DriverStatus::Busy && self.retries > 0 {
            self.retries -= 1;
            self.stats.retries += 1;
            warn!(
                state = ?self.state,
                retries_left = self.retries,
                "flash busy, retrying next tick"
            );
            self.retry_state = Some(self.state);
            self.next = Some(State::WaitCycle);
            return;
        }

        self.retries = self.config.max_retries;
        warn!(state = ?self.state, "flash request refused");
        if self.state.is_user() {
            self.job_error(JobResult::NotOk);
        } else {
            // Seen as a failed request when the state is polled
            self.flags.final_refusal = true;
        }
    }

    /// Result of the request in flight
    pub(crate) fn flash_result(&mut self) -> FlashJobResult {
        if std::mem::take(&mut self.critical.force_failure)
            || std::mem::take(&mut self.flags.final_refusal)
        {
            return FlashJobResult::Failed;
        }
        if self.config.polling_mode {
            self.flash.job_result()
        } else {
            self.control.flash_result()
        }
    }

    /// Report a failed management write
    pub(crate) fn flash_failed(&mut self) {
        error!(state = ?self.state, section = self.working, "flash access failed");
        self.diagnostic(Diagnostic::FlashAccessFailed);
    }

    pub(crate) fn diagnostic(&mut self, event: Diagnostic) {
        self.listener.on_diagnostic(&event);
    }

    // -------------------------------------------------------------------------
    // Space accounting
    // -------------------------------------------------------------------------

    /// Bytes kept free in every section for a write of the critical block
    pub(crate) fn critical_reserve(&self) -> u32 {
        match self.critical_slot {
            Some(slot) => self.layout.align(self.index.size(slot) as u32) + self.layout.slot_size(),
            None => 0,
        }
    }

    /// Space a record of `length` payload bytes takes, info slot included
    pub(crate) fn record_space(&self, length: u16) -> u32 {
        self.layout.align(length as u32) + self.layout.slot_size()
    }

    /// Point the cursors at an empty `section`
    pub(crate) fn reset_cursors(&mut self, section: u8) {
        self.cursor = Cursors {
            data: self.layout.data_start(section),
            info: self.layout.first_info_address(section),
        };
    }

    // -------------------------------------------------------------------------
    // Job completion
    // -------------------------------------------------------------------------

    pub(crate) fn job_end(&mut self) {
        self.finish_job(JobResult::Ok);
    }

    pub(crate) fn job_error(&mut self, result: JobResult) {
        self.finish_job(result);
    }

    fn finish_job(&mut self, result: JobResult) {
        self.flags.user_job_changes_section = false;
        let Some(job) = self.job.take() else {
            self.next = Some(State::Idle);
            return;
        };
        if result != JobResult::Ok {
            if let Some(size) = job.previous_size {
                self.index.resize(job.slot, size);
            }
        }

        self.job_result = result;
        if result == JobResult::Ok {
            self.stats.jobs_completed += 1;
        } else {
            self.stats.jobs_failed += 1;
            debug!(block = job.block, kind = ?job.kind, ?result, "job failed");
        }
        let data = match (result, job.kind) {
            (JobResult::Ok, JobKind::Read) => self.read_data.clone(),
            _ => None,
        };
        self.promote_queued_job();

        if Some(job.slot) == self.critical_slot {
            self.critical_job_finish(&job, result);
            return;
        }

        self.notify(&job, result, data);
        self.next = Some(State::Idle);
    }

    /// Make the oldest queued job current; its result is pending from now on
    pub(crate) fn promote_queued_job(&mut self) {
        self.job = self.queue.pop_front();
        if self.job.is_some() {
            self.job_result = JobResult::Pending;
            self.read_data = None;
        }
    }

    pub(crate) fn notify(&mut self, job: &Job, result: JobResult, data: Option<Vec<u8>>) {
        let report = JobReport { block: job.block, kind: job.kind, result, data };
        if result == JobResult::Ok {
            self.listener.on_job_end(&report);
        } else {
            self.listener.on_job_error(&report);
        }
    }

    // -------------------------------------------------------------------------
    // Public job API
    // -------------------------------------------------------------------------

    fn ensure_init(&self) -> FeeResult<()> {
        if self.state == State::Uninit {
            return Err(FeeError::Uninit);
        }
        Ok(())
    }

    fn slot(&self, block: u16) -> FeeResult<usize> {
        self.index.slot_of(block).ok_or(FeeError::InvalidBlockNumber { block })
    }

    fn range_job(&self, block: u16, slot: usize, offset: u16, length: u16) -> FeeResult<Job> {
        let size = self.index.size(slot);
        if offset >= size {
            return Err(FeeError::InvalidBlockOffset { block, offset, size });
        }
        if length == 0 || offset as u32 + length as u32 > size as u32 {
            return Err(FeeError::InvalidBlockLength { block, offset, length, size });
        }
        let mut job = Job::new(JobKind::Read, slot, block);
        job.offset = offset;
        job.length = length;
        Ok(job)
    }

    /// Queue a read of `length` bytes at `offset`; the payload is available
    /// through `take_read_data()` and the listener once the job ends Ok.
    pub fn read(&mut self, block: u16, offset: u16, length: u16) -> FeeResult<()> {
        self.ensure_init()?;
        let slot = self.slot(block)?;
        let job = self.range_job(block, slot, offset, length)?;
        self.admit(job)
    }

    /// Queue a write of the whole block
    pub fn write(&mut self, block: u16, data: &[u8]) -> FeeResult<()> {
        self.ensure_init()?;
        let slot = self.slot(block)?;
        let size = self.index.size(slot);
        if data.len() != size as usize {
            return Err(FeeError::InvalidBlockLength {
                block,
                offset: 0,
                length: data.len().min(u16::MAX as usize) as u16,
                size,
            });
        }
        let mut job = Job::new(JobKind::Write, slot, block);
        job.length = size;
        job.data = data.to_vec();
        self.admit(job)
    }

    pub fn invalidate(&mut self, block: u16) -> FeeResult<()> {
        self.ensure_init()?;
        let slot = self.slot(block)?;
        self.admit(Job::new(JobKind::Invalidate, slot, block))
    }

    pub fn erase_immediate(&mut self, block: u16) -> FeeResult<()> {
        self.ensure_init()?;
        let slot = self.slot(block)?;
        self.admit(Job::new(JobKind::EraseImmediate, slot, block))
    }

    /// Write an unconfigured block; its size is taken from `data`
    pub fn write_custom(&mut self, block: u16, data: &[u8]) -> FeeResult<()> {
        self.ensure_init()?;
        if block == 0 || block == u16::MAX || self.config.block_size(block).is_some() {
            return Err(FeeError::InvalidBlockNumber { block });
        }
        let length = data.len().min(u16::MAX as usize) as u16;
        if data.is_empty()
            || data.len() > u16::MAX as usize
            || !self.index.accepts_custom(block, length)
        {
            return Err(FeeError::InvalidBlockLength {
                block,
                offset: 0,
                length,
                size: self.config.not_configured_max_size,
            });
        }
        let slot = match self.index.slot_of(block) {
            Some(slot) => slot,
            None => self.index.register(block, length).ok_or(FeeError::InvalidBlockLength {
                block,
                offset: 0,
                length,
                size: self.config.not_configured_max_size,
            })?,
        };
        let mut job = Job::new(JobKind::Write, slot, block);
        job.length = length;
        job.data = data.to_vec();
        self.admit(job)
    }

    /// Read an unconfigured block
    pub fn read_custom(&mut self, block: u16, offset: u16, length: u16) -> FeeResult<()> {
        self.ensure_init()?;
        let slot = self.slot(block)?;
        if self.index.is_configured(slot) {
            return Err(FeeError::InvalidBlockNumber { block });
        }
        let job = self.range_job(block, slot, offset, length)?;
        self.admit(job)
    }

    fn admit(&mut self, job: Job) -> FeeResult<()> {
        let critical = Some(job.slot) == self.critical_slot;
        let served_frozen = critical && matches!(job.kind, JobKind::Read | JobKind::EraseImmediate);
        if self.is_frozen() && !served_frozen {
            let block = self.config.critical_block.unwrap_or(job.block);
            return Err(FeeError::Frozen { block });
        }
        if critical && job.kind == JobKind::Write {
            self.cancel_for_critical();
        }

        if self.job.is_none() {
            self.job_result = JobResult::Pending;
            self.read_data = None;
            self.job = Some(job);
        } else if self.queue.len() < self.config.queue_depth {
            self.queue.push_back(job);
        } else {
            return Err(FeeError::Busy { depth: self.config.queue_depth });
        }
        Ok(())
    }

    /// Cancel the current job. Queued jobs move up.
    pub fn cancel(&mut self) -> FeeResult<()> {
        self.ensure_init()?;
        let Some(job) = self.job.take() else {
            return Err(FeeError::NothingToCancel);
        };

        if Some(job.slot) == self.critical_slot && job.kind == JobKind::Write {
            if self.critical.resume.is_some() && self.state.is_user() {
                self.flash.cancel();
                let resume = self.critical.resume.take();
                self.resume_state(resume);
            }
        } else if self.state.is_user() {
            self.flash.cancel();
            self.state = State::Idle;
            self.next = None;
        }
        if let Some(size) = job.previous_size {
            self.index.resize(job.slot, size);
        }

        debug!(block = job.block, kind = ?job.kind, "job cancelled");
        self.flags.user_job_changes_section = false;
        self.job_result = JobResult::Cancelled;
        self.promote_queued_job();
        Ok(())
    }

    /// Abort a background section erase. It is retried after the idle delay.
    pub fn cancel_section_erase(&mut self) -> FeeResult<()> {
        self.ensure_init()?;
        if self.flags.priority || self.state != State::EraseSection {
            return Err(FeeError::EraseNotCancellable);
        }
        self.flash.cancel();
        self.delay = self.config.delay_ticks;
        self.state = State::Idle;
        self.next = None;
        debug!(section = self.working, "section erase cancelled");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn status(&self) -> EngineStatus {
        if self.state == State::Uninit {
            EngineStatus::Uninit
        } else if self.job.is_some() || !self.queue.is_empty() {
            EngineStatus::Busy
        } else if self.state == State::CriticalFrozen && self.next.is_none() {
            // Background work waits for the release
            EngineStatus::Idle
        } else if self.mode != Mode::Normal
            || !matches!(self.state, State::Idle | State::CriticalFrozen)
            || self.next.is_some()
        {
            EngineStatus::BusyInternal
        } else {
            EngineStatus::Idle
        }
    }

    /// Result of the most recently finished job, Pending while one runs
    pub fn job_result(&self) -> JobResult {
        self.job_result
    }

    /// Payload of the last successful read
    pub fn take_read_data(&mut self) -> Option<Vec<u8>> {
        self.read_data.take()
    }

    /// Section erases recorded in flash
    pub fn erase_counter(&self) -> u32 {
        self.erase_counter
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn active_section(&self) -> u8 {
        self.active
    }

    pub fn oldest_section(&self) -> u8 {
        self.oldest
    }

    pub fn section_status(&self, section: u8) -> Option<SectionStatus> {
        self.sections.get(section as usize).map(|s| s.status)
    }

    /// Current location of `block`, None if the block is unknown to the engine
    pub fn block_location(&self, block: u16) -> Option<Location> {
        self.index.slot_of(block).map(|slot| self.index.get(slot))
    }

    /// Whether the critical block has frozen the engine
    pub fn is_frozen(&self) -> bool {
        self.critical.resume.is_some()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Hand back the driver, e.g. to restart on the same flash contents
    pub fn into_flash(self) -> F {
        self.flash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;

    fn engine() -> FeeEngine<SimFlash> {
        let config = Config::small();
        let flash = SimFlash::for_config(&config);
        let mut engine = FeeEngine::new(config, flash).unwrap();
        engine.init();
        assert!(engine.tick_until_idle(1000), "startup did not settle");
        engine
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = Config::small();
        config.section_count = 1;
        let flash = SimFlash::for_config(&config);
        match FeeEngine::new(config, flash) {
            Err(FeeError::InvalidConfig { reason }) => assert!(reason.contains("section_count")),
            _ => panic!("Expected InvalidConfig"),
        }
    }

    #[test]
    fn test_api_requires_init() {
        let config = Config::small();
        let flash = SimFlash::for_config(&config);
        let mut engine = FeeEngine::new(config, flash).unwrap();
        assert_eq!(engine.status(), EngineStatus::Uninit);
        assert!(matches!(engine.read(1, 0, 4), Err(FeeError::Uninit)));
        engine.tick();
        assert_eq!(engine.status(), EngineStatus::Uninit);
    }

    #[test]
    fn test_blank_flash_formats_ring() {
        let engine = engine();
        assert_eq!(engine.mode(), Mode::Normal);
        assert_eq!(engine.section_status(0), Some(SectionStatus::Active));
        assert_eq!(engine.section_status(1), Some(SectionStatus::Empty));
        assert_eq!(engine.section_status(2), Some(SectionStatus::Empty));
        assert_eq!(engine.erase_counter(), 3);
    }

    #[test]
    fn test_write_then_read() {
        let mut engine = engine();
        engine.write(2, &[0x5A; 16]).unwrap();
        assert_eq!(engine.status(), EngineStatus::Busy);
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::Ok);

        engine.read(2, 4, 8).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::Ok);
        assert_eq!(engine.take_read_data(), Some(vec![0x5A; 8]));
    }

    #[test]
    fn test_job_queued_before_scan_waits_for_it() {
        let config = Config::small();
        let flash = SimFlash::for_config(&config);
        let mut engine = FeeEngine::new(config, flash).unwrap();
        engine.init();
        engine.write(3, &[0x33; 16]).unwrap();
        engine.read(3, 0, 16).unwrap();

        assert!(engine.tick_until_idle(2000), "queued jobs did not complete");
        assert_eq!(engine.job_result(), JobResult::Ok);
        assert_eq!(engine.take_read_data(), Some(vec![0x33; 16]));
        assert_eq!(engine.section_status(0), Some(SectionStatus::Active));
        assert!(engine.flash().stats().reads > 0);
    }

    #[test]
    fn test_argument_validation() {
        let mut engine = engine();
        assert!(matches!(engine.read(9, 0, 4), Err(FeeError::InvalidBlockNumber { block: 9 })));
        assert!(matches!(engine.read(1, 16, 1), Err(FeeError::InvalidBlockOffset { .. })));
        assert!(matches!(engine.read(1, 8, 9), Err(FeeError::InvalidBlockLength { .. })));
        assert!(matches!(engine.read(1, 0, 0), Err(FeeError::InvalidBlockLength { .. })));
        assert!(matches!(engine.write(1, &[0; 15]), Err(FeeError::InvalidBlockLength { .. })));
        assert!(matches!(engine.cancel(), Err(FeeError::NothingToCancel)));
        assert!(matches!(engine.cancel_section_erase(), Err(FeeError::EraseNotCancellable)));
    }

    #[test]
    fn test_read_unwritten_block_is_inconsistent() {
        let mut engine = engine();
        engine.read(3, 0, 16).unwrap();
        assert!(engine.tick_until_idle(100));
        assert_eq!(engine.job_result(), JobResult::BlockInconsistent);
        assert_eq!(engine.take_read_data(), None);
    }

    #[test]
    fn test_idle_tick_changes_nothing() {
        let mut engine = engine();
        let image = engine.flash().image().to_vec();
        let stats = engine.flash().stats();
        for _ in 0..50 {
            engine.tick();
        }
        assert_eq!(engine.flash().image(), &image[..]);
        assert_eq!(engine.flash().stats(), stats);
        assert_eq!(engine.status(), EngineStatus::Idle);
    }
}
