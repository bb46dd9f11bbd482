//! Job outcomes, caller notifications and out-of-band control
//!
//! Everything the engine reports upward lives here: the per-job result
//! values, the listener trait invoked on job completion, and diagnostic
//! events. The [`ControlHandle`] carries the few fields that may be changed
//! from outside the tick context (driver completion callbacks, activity
//! freeze), each access guarded by a short lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::flash::FlashJobResult;

/// Kind of caller job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Read,
    Write,
    Invalidate,
    EraseImmediate,
}

/// Result of the most recent job as returned by `job_result()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Ok,
    NotOk,
    Pending,
    Cancelled,
    /// Block was never written, erased, or its record is damaged
    BlockInconsistent,
    /// Block was invalidated
    BlockInvalid,
}

/// Engine status as returned by `status()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Uninit,
    Idle,
    /// A caller job is in flight or queued
    Busy,
    /// Only background work (startup, healing, compaction) is running
    BusyInternal,
}

/// Completion report handed to a [`JobListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub block: u16,
    pub kind: JobKind,
    pub result: JobResult,
    /// Payload of a successful read
    pub data: Option<Vec<u8>>,
}

/// Events routed to the diagnostic sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// A flash primitive failed and could not be retried
    FlashAccessFailed,
    /// No active section was found although flash was not blank
    DataNotRecovered,
    /// A block found in flash exceeded the unconfigured-block budget
    NotConfiguredBlockLost { block: u16 },
}

/// Receives job completions. Calls happen from inside `tick()`.
pub trait JobListener: Send {
    fn on_job_end(&mut self, report: &JobReport);
    fn on_job_error(&mut self, report: &JobReport);
    fn on_diagnostic(&mut self, _event: &Diagnostic) {}
}

/// Listener that ignores everything
pub struct NoopListener;

impl JobListener for NoopListener {
    fn on_job_end(&mut self, _report: &JobReport) {}
    fn on_job_error(&mut self, _report: &JobReport) {}
}

/// One recorded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    End(JobReport),
    Error(JobReport),
    Diagnostic(Diagnostic),
}

/// Listener that stores every notification; clones share the same log.
#[derive(Clone, Default)]
pub struct JobRecorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl JobRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far
    pub fn drain(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Most recent job report, successful or not
    pub fn last_report(&self) -> Option<JobReport> {
        self.events.lock().iter().rev().find_map(|e| match e {
            Recorded::End(r) | Recorded::Error(r) => Some(r.clone()),
            Recorded::Diagnostic(_) => None,
        })
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Diagnostic(d) => Some(*d),
                _ => None,
            })
            .collect()
    }
}

impl JobListener for JobRecorder {
    fn on_job_end(&mut self, report: &JobReport) {
        self.events.lock().push(Recorded::End(report.clone()));
    }

    fn on_job_error(&mut self, report: &JobReport) {
        self.events.lock().push(Recorded::Error(report.clone()));
    }

    fn on_diagnostic(&mut self, event: &Diagnostic) {
        self.events.lock().push(Recorded::Diagnostic(*event));
    }
}

struct ControlState {
    activities_frozen: bool,
    flash_result: FlashJobResult,
}

/// Shared out-of-band control block.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<Mutex<ControlState>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControlState {
                activities_frozen: false,
                flash_result: FlashJobResult::Ok,
            })),
        }
    }

    /// Suspend (`true`) or resume (`false`) all tick processing
    pub fn freeze_activities(&self, frozen: bool) {
        self.inner.lock().activities_frozen = frozen;
    }

    pub fn activities_frozen(&self) -> bool {
        self.inner.lock().activities_frozen
    }

    /// Driver completion callback used when polling is disabled
    pub fn flash_job_finished(&self, result: FlashJobResult) {
        self.inner.lock().flash_result = result;
    }

    pub(crate) fn flash_job_started(&self) {
        self.inner.lock().flash_result = FlashJobResult::Pending;
    }

    pub(crate) fn flash_result(&self) -> FlashJobResult {
        self.inner.lock().flash_result
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}
