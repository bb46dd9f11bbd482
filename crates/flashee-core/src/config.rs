//! Configuration management for flashee
//!
//! Provides flash geometry presets for common device classes and the block
//! table that defines which logical blocks the engine serves.

use crate::layout::Layout;

/// Background delay value meaning "wait for the next job"
pub const DELAY_INFINITE: u8 = 255;

/// One logical block the engine serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    /// Block number as seen by the caller
    pub number: u16,
    /// Payload size in bytes
    pub size: u16,
}

impl BlockConfig {
    pub const fn new(number: u16, size: u16) -> Self {
        Self { number, size }
    }
}

/// flashee configuration with geometry presets
#[derive(Debug, Clone)]
pub struct Config {
    /// First flash address used by the engine
    pub base_address: u32,
    /// Number of sections in the ring
    pub section_count: u8,
    /// Size of one independently erasable section (bytes)
    pub section_size: u32,
    /// Write granularity; every write and marker is a multiple of it
    pub virtual_page_size: u32,
    /// Identifier stamped into every section header; mismatches read as inconsistent
    pub config_id: u8,
    /// Number of block-info slots kept free between the data and info areas
    pub data_info_margin: u32,
    /// Working buffer for data writes and compaction copies (bytes)
    pub buffer_size: u32,
    /// Read chunk used while scanning block-info areas at startup (bytes)
    pub init_buffer_size: u32,
    /// Idle ticks after a user job before background work resumes
    pub delay_ticks: u8,
    /// Retries of a refused flash request while the driver reports busy
    pub max_retries: u8,
    /// Jobs accepted while another job is in flight
    pub queue_depth: usize,
    /// Poll the driver for results instead of waiting for completion callbacks
    pub polling_mode: bool,
    /// Configured blocks
    pub blocks: Vec<BlockConfig>,
    /// Block given exclusive, freezing completion semantics
    pub critical_block: Option<u16>,
    /// Number of unconfigured blocks tracked when found in flash
    pub not_configured_capacity: usize,
    /// Largest unconfigured block accepted (bytes)
    pub not_configured_max_size: u16,
    /// Total payload budget for unconfigured blocks (bytes)
    pub not_configured_total_size: u32,
}

impl Config {
    /// Small test device: 3 sections of 256 bytes, four 16-byte blocks
    pub fn small() -> Self {
        Self {
            base_address: 0,
            section_count: 3,
            section_size: 256,
            virtual_page_size: 4,
            config_id: 1,
            data_info_margin: 2,
            buffer_size: 16,
            init_buffer_size: 64,
            delay_ticks: 10,
            max_retries: 1,
            queue_depth: 4,
            polling_mode: true,
            blocks: (1..=4).map(|n| BlockConfig::new(n, 16)).collect(),
            critical_block: None,
            not_configured_capacity: 0,
            not_configured_max_size: 0,
            not_configured_total_size: 0,
        }
    }

    /// Typical MCU data flash: 4 sections of 4KB, 8-byte pages
    pub fn dataflash() -> Self {
        Self {
            base_address: 0,
            section_count: 4,
            section_size: 4096,
            virtual_page_size: 8,
            config_id: 1,
            data_info_margin: 2,
            buffer_size: 64,
            init_buffer_size: 240,
            delay_ticks: 10,
            max_retries: 1,
            queue_depth: 8,
            polling_mode: true,
            blocks: vec![
                BlockConfig::new(1, 32),
                BlockConfig::new(2, 64),
                BlockConfig::new(3, 128),
                BlockConfig::new(4, 16),
                BlockConfig::new(5, 256),
                BlockConfig::new(6, 8),
            ],
            critical_block: None,
            not_configured_capacity: 8,
            not_configured_max_size: 64,
            not_configured_total_size: 256,
        }
    }

    /// Same device with one block given critical semantics
    pub fn with_critical_block(mut self, block: u16) -> Self {
        self.critical_block = Some(block);
        self
    }

    /// Size of a configured block, if any
    pub fn block_size(&self, number: u16) -> Option<u16> {
        self.blocks.iter().find(|b| b.number == number).map(|b| b.size)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.section_count < 2 {
            return Err("section_count must be >= 2".into());
        }
        if self.virtual_page_size == 0 {
            return Err("virtual_page_size must be > 0".into());
        }
        if self.section_size == 0 || self.section_size % self.virtual_page_size != 0 {
            return Err("section_size must be a non-zero multiple of virtual_page_size".into());
        }
        if self.base_address % self.virtual_page_size != 0 {
            return Err("base_address must be aligned to virtual_page_size".into());
        }
        let end = self.section_size as u64 * self.section_count as u64 + self.base_address as u64;
        if end > u32::MAX as u64 {
            return Err("flash area exceeds the 32-bit address space".into());
        }
        if self.data_info_margin == 0 {
            return Err("data_info_margin must be >= 1".into());
        }
        if self.buffer_size < self.virtual_page_size
            || self.buffer_size % self.virtual_page_size != 0
        {
            return Err("buffer_size must be a non-zero multiple of virtual_page_size".into());
        }
        if self.queue_depth == 0 {
            return Err("queue_depth must be >= 1".into());
        }
        if self.blocks.is_empty() {
            return Err("at least one block must be configured".into());
        }

        let layout = Layout::new(self);
        if self.init_buffer_size < layout.slot_size()
            || self.init_buffer_size % layout.slot_size() != 0
        {
            return Err(format!(
                "init_buffer_size must be a non-zero multiple of the block-info slot ({} bytes)",
                layout.slot_size()
            ));
        }

        for (i, block) in self.blocks.iter().enumerate() {
            if block.number == 0 || block.number == u16::MAX {
                return Err(format!("block number {} is reserved", block.number));
            }
            if block.size == 0 {
                return Err(format!("block {} has zero size", block.number));
            }
            if self.blocks[..i].iter().any(|b| b.number == block.number) {
                return Err(format!("block {} configured twice", block.number));
            }
        }
        if let Some(critical) = self.critical_block {
            if self.block_size(critical).is_none() {
                return Err(format!("critical block {} is not configured", critical));
            }
        }
        if self.not_configured_capacity > 0 && self.not_configured_max_size == 0 {
            return Err(
                "not_configured_max_size must be > 0 when unconfigured blocks are tracked".into(),
            );
        }

        // Every live record, the critical reserve and the margin must fit one
        // section, otherwise compaction cannot complete.
        let slot = layout.slot_size() as u64;
        let mut live: u64 = self
            .blocks
            .iter()
            .map(|b| layout.align(b.size as u32) as u64 + slot)
            .sum();
        if let Some(size) = self.critical_block.and_then(|c| self.block_size(c)) {
            live += layout.align(size as u32) as u64 + slot;
        }
        if self.not_configured_capacity > 0 {
            let page = self.virtual_page_size as u64;
            live += self.not_configured_capacity as u64 * (slot + page);
            live += self.not_configured_total_size as u64;
        }
        live += self.data_info_margin as u64 * slot;
        if live > layout.usable_size() as u64 {
            return Err(format!(
                "configured blocks need {} bytes but a section only holds {}",
                live,
                layout.usable_size()
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::dataflash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::small().validate().is_ok());
        assert!(Config::dataflash().validate().is_ok());
        assert!(Config::small().with_critical_block(4).validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_critical_block() {
        let err = Config::small().with_critical_block(9).validate().unwrap_err();
        assert!(err.contains("critical block 9"));
    }

    #[test]
    fn test_rejects_duplicate_blocks() {
        let mut cfg = Config::small();
        cfg.blocks.push(BlockConfig::new(2, 8));
        assert!(cfg.validate().unwrap_err().contains("configured twice"));
    }

    #[test]
    fn test_rejects_oversubscribed_section() {
        let mut cfg = Config::small();
        cfg.blocks = (1..=8).map(|n| BlockConfig::new(n, 16)).collect();
        assert!(cfg.validate().unwrap_err().contains("section only holds"));
    }

    #[test]
    fn test_rejects_misaligned_buffer() {
        let mut cfg = Config::small();
        cfg.buffer_size = 6;
        assert!(cfg.validate().is_err());
        cfg.buffer_size = 16;
        cfg.init_buffer_size = 20;
        assert!(cfg.validate().unwrap_err().contains("init_buffer_size"));
    }
}
