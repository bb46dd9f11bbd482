//! Simulated NOR flash
//!
//! SimFlash implements [`FlashDriver`] over an in-memory byte array with the
//! properties the engine has to survive on real parts:
//!
//! - programming can only clear bits (`mem &= data`), erase sets bytes to 0xFF
//! - writes are page aligned, erases are sector aligned
//! - one request at a time, completed after a configurable number of ticks
//! - power may be cut after any number of programmed or erased bytes,
//!   leaving the interrupted request partially applied
//!
//! Images can be saved to and loaded from disk for host tooling.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::Config;
use crate::error::{FeeError, FeeResult};
use crate::flash::{DriverStatus, FlashDriver, FlashJobResult, Submit};
use crate::layout::ERASE_VALUE;
use crate::notify::ControlHandle;

/// Magic bytes identifying a saved flash image: "FLEE"
const IMAGE_MAGIC: [u8; 4] = *b"FLEE";

/// Image header size in bytes
const IMAGE_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone)]
enum Op {
    Read { address: u32, length: u32 },
    Write { address: u32, data: Vec<u8> },
    Erase { address: u32, length: u32 },
}

/// Operation counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub reads: u64,
    pub writes: u64,
    pub erases: u64,
    pub bytes_programmed: u64,
    pub bytes_erased: u64,
}

/// In-memory NOR flash with fault injection
pub struct SimFlash {
    /// Flash contents
    mem: Vec<u8>,
    /// Write granularity
    page_size: u32,
    /// Erase granularity
    sector_size: u32,
    /// Ticks from acceptance to completion
    latency: u32,
    /// Request in flight
    pending: Option<Op>,
    /// Ticks left for the request in flight
    countdown: u32,
    /// Result of the last request
    result: FlashJobResult,
    /// Bytes of the last completed read
    read_data: Vec<u8>,
    /// Reports Busy until the next tick after an injected refusal
    busy_reported: bool,
    /// Requests still to be refused as busy
    refusals: u32,
    /// Accepted requests still to fail without effect
    failures: u32,
    /// Bytes that may still be programmed or erased before power is lost
    power_budget: Option<u64>,
    powered: bool,
    /// Completion callback target when the engine does not poll
    notifier: Option<ControlHandle>,
    stats: SimStats,
}

impl SimFlash {
    /// Blank (erased) flash of `size` bytes
    pub fn new(size: usize, page_size: u32, sector_size: u32) -> Self {
        Self::from_image(vec![ERASE_VALUE; size], page_size, sector_size)
    }

    /// Blank flash covering every section of `config`
    pub fn for_config(config: &Config) -> Self {
        let size = config.base_address as usize
            + config.section_size as usize * config.section_count as usize;
        Self::new(size, config.virtual_page_size, config.section_size)
    }

    /// Flash holding an existing memory image
    pub fn from_image(mem: Vec<u8>, page_size: u32, sector_size: u32) -> Self {
        Self {
            mem,
            page_size: page_size.max(1),
            sector_size: sector_size.max(1),
            latency: 1,
            pending: None,
            countdown: 0,
            result: FlashJobResult::Ok,
            read_data: Vec::new(),
            busy_reported: false,
            refusals: 0,
            failures: 0,
            power_budget: None,
            powered: true,
            notifier: None,
            stats: SimStats::default(),
        }
    }

    /// Complete requests after `ticks` driver ticks (minimum 1)
    pub fn with_latency(mut self, ticks: u32) -> Self {
        self.latency = ticks.max(1);
        self
    }

    /// Report completions through `control` instead of only via polling
    pub fn with_notifier(mut self, control: ControlHandle) -> Self {
        self.notifier = Some(control);
        self
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn image(&self) -> &[u8] {
        &self.mem
    }

    pub fn into_image(self) -> Vec<u8> {
        self.mem
    }

    /// Raw view of flash contents
    pub fn peek(&self, address: u32, length: usize) -> &[u8] {
        let start = (address as usize).min(self.mem.len());
        let end = (start + length).min(self.mem.len());
        &self.mem[start..end]
    }

    /// Overwrite flash contents directly, bypassing NOR semantics
    pub fn poke(&mut self, address: u32, bytes: &[u8]) {
        let start = address as usize;
        let end = (start + bytes.len()).min(self.mem.len());
        if start < end {
            self.mem[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }

    /// Refuse the next `count` requests as busy
    pub fn inject_refusals(&mut self, count: u32) {
        self.refusals = count;
    }

    /// Fail the next `count` accepted requests without touching memory
    pub fn inject_failures(&mut self, count: u32) {
        self.failures = count;
    }

    /// Lose power once `bytes` more bytes have been programmed or erased
    pub fn cut_power_after(&mut self, bytes: u64) {
        self.power_budget = Some(bytes);
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Power the device back up. Any interrupted request is gone.
    pub fn restore_power(&mut self) {
        self.powered = true;
        self.power_budget = None;
        self.pending = None;
        self.busy_reported = false;
        self.result = FlashJobResult::Ok;
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    fn in_bounds(&self, address: u32, length: u32) -> bool {
        (address as u64 + length as u64) <= self.mem.len() as u64
    }

    fn submit(&mut self, op: Op) -> Submit {
        if !self.powered || self.pending.is_some() {
            return Submit::Refused;
        }
        if self.refusals > 0 {
            self.refusals -= 1;
            self.busy_reported = true;
            return Submit::Refused;
        }
        match &op {
            Op::Read { .. } => self.stats.reads += 1,
            Op::Write { .. } => self.stats.writes += 1,
            Op::Erase { .. } => self.stats.erases += 1,
        }
        self.pending = Some(op);
        self.countdown = self.latency;
        self.result = FlashJobResult::Pending;
        Submit::Accepted
    }

    /// Consume one byte of the power budget; false once power is gone
    fn draw_power(&mut self) -> bool {
        match self.power_budget {
            None => true,
            Some(0) => {
                if self.powered {
                    debug!("simulated power loss");
                }
                self.powered = false;
                false
            }
            Some(n) => {
                self.power_budget = Some(n - 1);
                true
            }
        }
    }

    fn execute(&mut self, op: Op) -> FlashJobResult {
        match op {
            Op::Read { address, length } => {
                let start = address as usize;
                self.read_data = self.mem[start..start + length as usize].to_vec();
                FlashJobResult::Ok
            }
            Op::Write { address, data } => {
                for (i, byte) in data.iter().enumerate() {
                    if !self.draw_power() {
                        return FlashJobResult::Failed;
                    }
                    self.mem[address as usize + i] &= byte;
                    self.stats.bytes_programmed += 1;
                }
                FlashJobResult::Ok
            }
            Op::Erase { address, length } => {
                for i in 0..length as usize {
                    if !self.draw_power() {
                        return FlashJobResult::Failed;
                    }
                    self.mem[address as usize + i] = ERASE_VALUE;
                    self.stats.bytes_erased += 1;
                }
                FlashJobResult::Ok
            }
        }
    }

    fn finish(&mut self, result: FlashJobResult) {
        self.result = result;
        if let Some(control) = &self.notifier {
            control.flash_job_finished(result);
        }
    }

    /// Write the image to `path`.
    ///
    /// Layout:
    ///   [0..4]    magic:       "FLEE"
    ///   [4..8]    page_size:   u32 LE
    ///   [8..12]   sector_size: u32 LE
    ///   [12..16]  length:      u32 LE
    ///   [16..16+length]        flash contents
    ///   [last 4]  checksum:    u32 LE - CRC32C of everything before it
    pub fn save_image(&self, path: &Path) -> FeeResult<()> {
        let mut buf = Vec::with_capacity(IMAGE_HEADER_SIZE + self.mem.len() + 4);
        buf.extend_from_slice(&IMAGE_MAGIC);
        buf.extend_from_slice(&self.page_size.to_le_bytes());
        buf.extend_from_slice(&self.sector_size.to_le_bytes());
        buf.extend_from_slice(&(self.mem.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.mem);
        let checksum = crc32c::crc32c(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        fs::write(path, &buf).map_err(|e| FeeError::io_at(path, e, "Failed to write flash image"))
    }

    /// Load an image written by `save_image`
    pub fn load_image(path: &Path) -> FeeResult<Self> {
        let buf =
            fs::read(path).map_err(|e| FeeError::io_at(path, e, "Failed to read flash image"))?;
        if buf.len() < IMAGE_HEADER_SIZE + 4 {
            return Err(FeeError::ImageCorrupted {
                path: path.to_path_buf(),
                reason: format!("file too short: {} bytes", buf.len()),
            });
        }
        if buf[0..4] != IMAGE_MAGIC {
            return Err(FeeError::ImageCorrupted {
                path: path.to_path_buf(),
                reason: "missing FLEE magic".into(),
            });
        }

        let body_end = buf.len() - 4;
        let expected = u32::from_le_bytes([
            buf[body_end],
            buf[body_end + 1],
            buf[body_end + 2],
            buf[body_end + 3],
        ]);
        let actual = crc32c::crc32c(&buf[..body_end]);
        if expected != actual {
            return Err(FeeError::ChecksumMismatch { path: path.to_path_buf(), expected, actual });
        }

        let page_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let sector_size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let length = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        if IMAGE_HEADER_SIZE + length != body_end {
            return Err(FeeError::ImageCorrupted {
                path: path.to_path_buf(),
                reason: format!(
                    "declared {} bytes, file holds {}",
                    length,
                    body_end - IMAGE_HEADER_SIZE
                ),
            });
        }

        Ok(Self::from_image(buf[IMAGE_HEADER_SIZE..body_end].to_vec(), page_size, sector_size))
    }
}

impl FlashDriver for SimFlash {
    fn read(&mut self, address: u32, length: u32) -> Submit {
        if !self.in_bounds(address, length) {
            return Submit::Refused;
        }
        self.submit(Op::Read { address, length })
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Submit {
        let length = data.len() as u32;
        if address % self.page_size != 0
            || length % self.page_size != 0
            || !self.in_bounds(address, length)
        {
            return Submit::Refused;
        }
        self.submit(Op::Write { address, data: data.to_vec() })
    }

    fn erase(&mut self, address: u32, length: u32) -> Submit {
        if address % self.sector_size != 0
            || length % self.sector_size != 0
            || !self.in_bounds(address, length)
        {
            return Submit::Refused;
        }
        self.submit(Op::Erase { address, length })
    }

    fn cancel(&mut self) {
        if self.pending.take().is_some() {
            self.finish(FlashJobResult::Cancelled);
        }
    }

    fn status(&self) -> DriverStatus {
        if self.pending.is_some() || self.busy_reported {
            DriverStatus::Busy
        } else {
            DriverStatus::Idle
        }
    }

    fn job_result(&self) -> FlashJobResult {
        if !self.powered {
            return FlashJobResult::Failed;
        }
        self.result
    }

    fn take_read_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_data)
    }

    fn main_function(&mut self) {
        self.busy_reported = false;
        let Some(op) = self.pending.take() else {
            return;
        };
        if self.countdown > 1 {
            self.countdown -= 1;
            self.pending = Some(op);
            return;
        }
        let result = if self.failures > 0 {
            self.failures -= 1;
            FlashJobResult::Failed
        } else {
            self.execute(op)
        };
        self.finish(result);
    }
}
