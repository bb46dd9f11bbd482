//! Flash driver interface consumed by the engine
//!
//! A driver accepts at most one asynchronous request at a time. The engine
//! submits a request from its tick, then polls `job_result` on later ticks.
//! Addresses and lengths are always aligned to the driver's page size.

/// Outcome of submitting a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Accepted,
    Refused,
}

impl Submit {
    pub fn is_accepted(self) -> bool {
        self == Submit::Accepted
    }
}

/// Driver activity as reported by `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Idle,
    Busy,
}

/// Result of the most recent request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashJobResult {
    Ok,
    Pending,
    Failed,
    Cancelled,
}

/// Asynchronous NOR flash primitives.
pub trait FlashDriver {
    /// Start reading `length` bytes; fetch them with `take_read_data` once Ok
    fn read(&mut self, address: u32, length: u32) -> Submit;

    /// Start programming `data` at `address`
    fn write(&mut self, address: u32, data: &[u8]) -> Submit;

    /// Start erasing `length` bytes at `address`
    fn erase(&mut self, address: u32, length: u32) -> Submit;

    /// Abort the running request, best effort
    fn cancel(&mut self);

    fn status(&self) -> DriverStatus;

    fn job_result(&self) -> FlashJobResult;

    /// Bytes of the last completed read
    fn take_read_data(&mut self) -> Vec<u8>;

    /// Advance the driver by one tick
    fn main_function(&mut self);
}
