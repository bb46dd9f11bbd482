//! flashee: Flash EEPROM Emulation Engine
//!
//! Presents a fixed set of numbered blocks with read, write, invalidate and
//! erase-immediate jobs on top of raw NOR flash that can only program pages
//! and erase whole sectors, and that may lose power at any byte.
//!
//! # Architecture
//!
//! - **Sections**: the flash area is a ring of erasable sections. Each one
//!   carries a header and a footer, payload grows upward from the header,
//!   block-info records grow downward from the footer
//! - **Startup**: headers and footers are scanned to find the active section,
//!   then records are read back to rebuild the in-memory block index
//! - **Jobs**: a write is a block-info record, its payload and a written
//!   marker; the index only moves once the marker is in flash
//! - **Compaction**: when the active section fills up, live records are copied
//!   out of the oldest section, which is then erased and reused
//! - **Critical block**: one block may preempt everything and freeze the
//!   engine until it is erased again
//!
//! # Driving the engine
//!
//! Nothing blocks. Job methods validate and queue; `FeeEngine::tick()` moves
//! the state machine forward by at most one flash request and must be called
//! periodically. The flash itself sits behind the [`FlashDriver`] trait;
//! [`SimFlash`] is a NOR model with power-cut injection for tests and tools.

pub mod compaction;
pub mod config;
pub mod critical;
pub mod engine;
pub mod error;
pub mod flash;
pub mod healer;
pub mod index;
pub mod jobs;
pub mod layout;
pub mod notify;
pub mod section;
pub mod sim;
pub mod startup;

// Re-export key types for convenience
pub use config::{BlockConfig, Config, DELAY_INFINITE};
pub use engine::{EngineStats, FeeEngine, Mode};
pub use error::{FeeError, FeeResult};
pub use flash::{DriverStatus, FlashDriver, FlashJobResult, Submit};
pub use index::Location;
pub use notify::{
    ControlHandle, Diagnostic, EngineStatus, JobKind, JobListener, JobRecorder, JobReport,
    JobResult, NoopListener, Recorded,
};
pub use section::SectionStatus;
pub use sim::{SimFlash, SimStats};
