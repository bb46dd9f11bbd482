//! Block index: where the current record of every block lives
//!
//! Configured blocks occupy fixed slots in configuration order (sorted by
//! block number). Blocks found in flash but absent from the configuration,
//! and custom blocks written through the API, are registered behind them up
//! to a fixed count and payload budget.

use hashbrown::HashMap;

use crate::config::Config;

/// Current physical state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Never found in flash
    Unknown,
    /// Newest complete record
    Data {
        /// Section holding the record
        section: u8,
        /// Payload address
        address: u32,
        /// Block-info slot address
        info: u32,
    },
    /// Newest record is an invalidation
    Invalidated { section: u8 },
    /// Newest record is an erase, or its write never completed
    Inconsistent { section: u8 },
}

impl Location {
    pub fn section(&self) -> Option<u8> {
        match *self {
            Location::Unknown => None,
            Location::Data { section, .. }
            | Location::Invalidated { section }
            | Location::Inconsistent { section } => Some(section),
        }
    }

    /// Unknown or inconsistent: there is nothing to read or to relocate
    pub fn is_inconsistent(&self) -> bool {
        matches!(self, Location::Unknown | Location::Inconsistent { .. })
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self, Location::Invalidated { .. })
    }

    /// A record in `section` that compaction has to carry forward
    pub fn is_live_in(&self, section: u8) -> bool {
        match *self {
            Location::Data { section: s, .. } | Location::Invalidated { section: s } => {
                s == section
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    number: u16,
    size: u16,
}

/// Location table for configured and registered blocks
#[derive(Debug, Clone)]
pub struct BlockIndex {
    /// Configured blocks, sorted by number; followed by registered ones
    slots: Vec<Slot>,
    /// Number of configured blocks at the front of `slots`
    configured: usize,
    /// Block number to slot for registered blocks
    registered: HashMap<u16, usize>,
    /// Current location of every slot
    entries: Vec<Location>,
    /// Pre-compaction location of slots copied during a priority compaction
    restart: Vec<Location>,
    /// Registry limits
    capacity: usize,
    max_size: u16,
    total_budget: u32,
}

impl BlockIndex {
    pub fn new(config: &Config) -> Self {
        let mut slots: Vec<Slot> = config
            .blocks
            .iter()
            .map(|b| Slot { number: b.number, size: b.size })
            .collect();
        slots.sort_by_key(|s| s.number);
        let configured = slots.len();
        Self {
            entries: vec![Location::Unknown; configured],
            restart: vec![Location::Unknown; configured],
            slots,
            configured,
            registered: HashMap::new(),
            capacity: config.not_configured_capacity,
            max_size: config.not_configured_max_size,
            total_budget: config.not_configured_total_size,
        }
    }

    /// Forget every location and registered block
    pub fn reset(&mut self) {
        self.slots.truncate(self.configured);
        self.entries.truncate(self.configured);
        self.restart.truncate(self.configured);
        self.entries.fill(Location::Unknown);
        self.restart.fill(Location::Unknown);
        self.registered.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn configured_len(&self) -> usize {
        self.configured
    }

    pub fn is_configured(&self, slot: usize) -> bool {
        slot < self.configured
    }

    pub fn slot_of(&self, number: u16) -> Option<usize> {
        match self.slots[..self.configured].binary_search_by_key(&number, |s| s.number) {
            Ok(slot) => Some(slot),
            Err(_) => self.registered.get(&number).copied(),
        }
    }

    pub fn number(&self, slot: usize) -> u16 {
        self.slots[slot].number
    }

    pub fn size(&self, slot: usize) -> u16 {
        self.slots[slot].size
    }

    pub fn get(&self, slot: usize) -> Location {
        self.entries[slot]
    }

    pub fn set(&mut self, slot: usize, location: Location) {
        self.entries[slot] = location;
    }

    pub fn restart_entry(&self, slot: usize) -> Location {
        self.restart[slot]
    }

    pub fn set_restart_entry(&mut self, slot: usize, location: Location) {
        self.restart[slot] = location;
    }

    /// Payload bytes held by registered blocks
    fn registered_total(&self) -> u32 {
        self.slots[self.configured..].iter().map(|s| s.size as u32).sum()
    }

    /// Whether a registered block could hold `size` bytes, given it currently holds `current`
    fn fits_budget(&self, size: u16, current: u16) -> bool {
        size <= self.max_size
            && self.registered_total() - current as u32 + size as u32 <= self.total_budget
    }

    /// Register an unconfigured block. None when over capacity or budget.
    pub fn register(&mut self, number: u16, size: u16) -> Option<usize> {
        if let Some(slot) = self.slot_of(number) {
            return Some(slot);
        }
        if self.registered.len() >= self.capacity || !self.fits_budget(size, 0) {
            return None;
        }
        let slot = self.slots.len();
        self.slots.push(Slot { number, size });
        self.entries.push(Location::Unknown);
        self.restart.push(Location::Unknown);
        self.registered.insert(number, slot);
        Some(slot)
    }

    /// Change the size of a registered block. Configured sizes never change.
    pub fn resize(&mut self, slot: usize, size: u16) -> bool {
        if self.is_configured(slot) {
            return self.slots[slot].size == size;
        }
        if !self.fits_budget(size, self.slots[slot].size) {
            return false;
        }
        self.slots[slot].size = size;
        true
    }

    /// Whether `size` could be accepted for registered or new block `number`
    pub fn accepts_custom(&self, number: u16, size: u16) -> bool {
        match self.registered.get(&number) {
            Some(&slot) => self.fits_budget(size, self.slots[slot].size),
            None => self.registered.len() < self.capacity && self.fits_budget(size, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockConfig;

    fn config() -> Config {
        let mut cfg = Config::small();
        cfg.blocks = vec![BlockConfig::new(7, 16), BlockConfig::new(2, 8), BlockConfig::new(4, 4)];
        cfg.not_configured_capacity = 2;
        cfg.not_configured_max_size = 16;
        cfg.not_configured_total_size = 24;
        cfg
    }

    #[test]
    fn test_slots_sorted_by_block_number() {
        let index = BlockIndex::new(&config());
        assert_eq!(index.slot_of(2), Some(0));
        assert_eq!(index.slot_of(4), Some(1));
        assert_eq!(index.slot_of(7), Some(2));
        assert_eq!(index.slot_of(3), None);
        assert_eq!(index.size(2), 16);
        assert!(index.get(0) == Location::Unknown);
    }

    #[test]
    fn test_location_predicates() {
        let data = Location::Data { section: 1, address: 300, info: 460 };
        assert!(data.is_live_in(1));
        assert!(!data.is_live_in(0));
        assert!(Location::Invalidated { section: 2 }.is_live_in(2));
        assert!(!Location::Inconsistent { section: 2 }.is_live_in(2));
        assert!(Location::Unknown.is_inconsistent());
        assert_eq!(Location::Unknown.section(), None);
    }

    #[test]
    fn test_register_respects_budget() {
        let mut index = BlockIndex::new(&config());
        let a = index.register(100, 16).unwrap();
        assert_eq!(a, 3);
        assert_eq!(index.register(100, 16), Some(3));
        assert!(index.register(101, 16).is_none(), "total budget is 24");
        let b = index.register(101, 8).unwrap();
        assert_eq!(index.slot_of(101), Some(b));
        assert!(index.register(102, 1).is_none(), "capacity is 2");
        assert!(index.register(103, 17).is_none());
    }

    #[test]
    fn test_resize_registered_only() {
        let mut index = BlockIndex::new(&config());
        let slot = index.register(100, 8).unwrap();
        assert!(index.resize(slot, 16));
        assert_eq!(index.size(slot), 16);
        assert!(!index.resize(slot, 17));
        assert!(!index.resize(0, 4));
        assert!(index.resize(0, 8));
    }

    #[test]
    fn test_reset_drops_registered() {
        let mut index = BlockIndex::new(&config());
        index.register(100, 8).unwrap();
        index.set(0, Location::Invalidated { section: 0 });
        index.reset();
        assert_eq!(index.len(), 3);
        assert_eq!(index.slot_of(100), None);
        assert_eq!(index.get(0), Location::Unknown);
    }
}
