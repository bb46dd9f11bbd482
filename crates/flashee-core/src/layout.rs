//! On-flash format definitions for flashee sections
//!
//! Every section follows the same layout:
//! Header + data area (grows up) + block-info area (grows down) + Footer
//!
//! Header and footer carry identical management objects; they differ only in
//! the order of their two marker pages so that a section can be marked active
//! or erasable on either end without rewriting the other.

use crate::config::Config;

/// Value of an erased flash byte
pub const ERASE_VALUE: u8 = 0xFF;

/// Filler for the unused tail of a programmed page
pub const PAD_BYTE: u8 = 0x00;

/// End pattern closing every management object
pub const END_PATTERN: [u8; 2] = [0x77, 0x77];

/// Unaligned size of a management object
pub const MGMT_SIZE: usize = 10;

/// Unaligned size of a block-info record
pub const BLOCK_INFO_SIZE: usize = 10;

/// Block-info written by a user job
pub const STATUS_USER: u8 = 0xBB;

/// Block-info written by a compaction copy
pub const STATUS_SWITCH: u8 = 0xCC;

/// Marker pages. Each marker occupies one full virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Section accepts writes
    Active,
    /// Section may be erased
    Erasable,
    /// Data payload of a block-info completed
    Written,
}

impl Marker {
    pub fn byte(self) -> u8 {
        match self {
            Marker::Active => 0xAA,
            Marker::Erasable => 0xDD,
            Marker::Written => 0x96,
        }
    }
}

/// Which end of a section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Header,
    Footer,
}

/// Address arithmetic for the section ring.
///
/// Header layout (footer swaps the two marker pages):
///   [0 .. P)        erasable marker page
///   [P .. 2P)       active marker page
///   [2P .. 2P+M)    management object, padded to the page size
///
/// Block-info slot layout (slots are allocated downward from the footer):
///   [0 .. I)        block-info record, padded with 0x00
///   [I .. I+P)      written marker page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    base: u32,
    section_size: u32,
    section_count: u8,
    page: u32,
    margin: u32,
}

impl Layout {
    pub fn new(config: &Config) -> Self {
        Self {
            base: config.base_address,
            section_size: config.section_size,
            section_count: config.section_count,
            page: config.virtual_page_size,
            margin: config.data_info_margin,
        }
    }

    /// Round `len` up to the virtual page size
    pub fn align(&self, len: u32) -> u32 {
        (len + self.page - 1) / self.page * self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page
    }

    pub fn section_size(&self) -> u32 {
        self.section_size
    }

    pub fn section_count(&self) -> u8 {
        self.section_count
    }

    /// First byte after the last section
    pub fn flash_end(&self) -> u32 {
        self.base + self.section_size * self.section_count as u32
    }

    pub fn mgmt_size(&self) -> u32 {
        self.align(MGMT_SIZE as u32)
    }

    pub fn header_size(&self) -> u32 {
        2 * self.page + self.mgmt_size()
    }

    pub fn info_size(&self) -> u32 {
        self.align(BLOCK_INFO_SIZE as u32)
    }

    /// Block-info record plus its written marker
    pub fn slot_size(&self) -> u32 {
        self.info_size() + self.page
    }

    /// Bytes between header and footer
    pub fn usable_size(&self) -> u32 {
        self.section_size - 2 * self.header_size()
    }

    /// Bytes kept free between the two growing areas
    pub fn margin_bytes(&self) -> u32 {
        self.margin * self.slot_size()
    }

    pub fn margin(&self) -> u32 {
        self.margin
    }

    pub fn section_start(&self, section: u8) -> u32 {
        self.base + section as u32 * self.section_size
    }

    pub fn section_end(&self, section: u8) -> u32 {
        self.section_start(section) + self.section_size
    }

    pub fn footer_address(&self, section: u8) -> u32 {
        self.section_end(section) - self.header_size()
    }

    pub fn area_address(&self, section: u8, half: Half) -> u32 {
        match half {
            Half::Header => self.section_start(section),
            Half::Footer => self.footer_address(section),
        }
    }

    pub fn data_start(&self, section: u8) -> u32 {
        self.section_start(section) + self.header_size()
    }

    pub fn first_info_address(&self, section: u8) -> u32 {
        self.footer_address(section) - self.slot_size()
    }

    /// Address stored in an invalidate record
    pub fn invalidated_address(&self, section: u8) -> u32 {
        self.footer_address(section)
    }

    /// Address stored in an erase-immediate record
    pub fn erased_address(&self, section: u8) -> u32 {
        self.section_start(section) + 1
    }

    /// Offset of a marker page within a header or footer area
    pub fn marker_offset(&self, half: Half, marker: Marker) -> u32 {
        match (half, marker) {
            (Half::Header, Marker::Erasable) | (Half::Footer, Marker::Active) => 0,
            _ => self.page,
        }
    }

    pub fn marker_address(&self, section: u8, half: Half, marker: Marker) -> u32 {
        self.area_address(section, half) + self.marker_offset(half, marker)
    }

    pub fn mgmt_address(&self, section: u8, half: Half) -> u32 {
        self.area_address(section, half) + 2 * self.page
    }

    /// Written marker of the slot starting at `slot`
    pub fn written_marker_address(&self, slot: u32) -> u32 {
        slot + self.info_size()
    }

    /// Section containing `address`, if inside the flash area
    pub fn section_of(&self, address: u32) -> Option<u8> {
        if address < self.base || address >= self.flash_end() {
            return None;
        }
        Some(((address - self.base) / self.section_size) as u8)
    }

    /// One page of `marker`
    pub fn marker_page(&self, marker: Marker) -> Vec<u8> {
        vec![marker.byte(); self.page as usize]
    }

    /// Copy `data` into a page-aligned buffer, tail filled with PAD_BYTE
    pub fn padded(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        buf.resize(self.align(data.len() as u32) as usize, PAD_BYTE);
        buf
    }
}

/// True when every byte reads as erased
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASE_VALUE)
}

/// A marker page counts as written when its first or last byte carries the
/// pattern. Programming interrupted part-way leaves one end intact.
pub fn marker_present(page: &[u8], marker: Marker) -> bool {
    match (page.first(), page.last()) {
        (Some(&first), Some(&last)) => first == marker.byte() || last == marker.byte(),
        _ => false,
    }
}

/// Section management object stored in header and footer.
///
/// Layout (10 bytes, padded with 0xFF):
///   [0]     config_id:         u8
///   [1]     erase_counter_crc: u8   - low byte of CRC32C(erase_counter LE)
///   [2]     config_id_crc:     u8   - low byte of CRC32C([config_id, section_counter])
///   [3]     section_counter:   u8
///   [4..8]  erase_counter:     u32 LE
///   [8..10] end_pattern:       [0x77, 0x77]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionMgmt {
    /// Configuration identifier the section was formatted for
    pub config_id: u8,
    /// Ring freshness counter, compared modulo 256
    pub section_counter: u8,
    /// Number of section erases performed so far
    pub erase_counter: u32,
}

impl SectionMgmt {
    /// Serialize into a buffer of `len` bytes
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![ERASE_VALUE; len.max(MGMT_SIZE)];
        buf[0] = self.config_id;
        buf[1] = erase_counter_crc(self.erase_counter);
        buf[2] = config_id_crc(self.config_id, self.section_counter);
        buf[3] = self.section_counter;
        buf[4..8].copy_from_slice(&self.erase_counter.to_le_bytes());
        buf[8..10].copy_from_slice(&END_PATTERN);
        buf
    }

    /// Parse and verify; None when the end pattern or a CRC does not match
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MGMT_SIZE || bytes[8..10] != END_PATTERN {
            return None;
        }
        let mgmt = Self {
            config_id: bytes[0],
            section_counter: bytes[3],
            erase_counter: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        };
        if bytes[1] != erase_counter_crc(mgmt.erase_counter)
            || bytes[2] != config_id_crc(mgmt.config_id, mgmt.section_counter)
        {
            return None;
        }
        Some(mgmt)
    }
}

fn erase_counter_crc(erase_counter: u32) -> u8 {
    crc32c::crc32c(&erase_counter.to_le_bytes()) as u8
}

fn config_id_crc(config_id: u8, section_counter: u8) -> u8 {
    crc32c::crc32c(&[config_id, section_counter]) as u8
}

/// Block-info record describing one write, invalidate or erase of a block.
///
/// Layout (10 bytes, padded with 0x00):
///   [0..2]  block_number: u16 LE
///   [2..4]  block_length: u16 LE  - 0 for invalidate / erase-immediate
///   [4..8]  data_address: u32 LE
///   [8]     write_status: u8      - 0xBB user job, 0xCC compaction copy
///   [9]     checksum:     u8      - wrapping sum of [0..9] XOR 0xAA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_number: u16,
    pub block_length: u16,
    pub data_address: u32,
    pub write_status: u8,
}

impl BlockInfo {
    /// Serialize into a buffer of `len` bytes
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![PAD_BYTE; len.max(BLOCK_INFO_SIZE)];
        buf[0..2].copy_from_slice(&self.block_number.to_le_bytes());
        buf[2..4].copy_from_slice(&self.block_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.data_address.to_le_bytes());
        buf[8] = self.write_status;
        buf[9] = info_checksum(&buf[..9]);
        buf
    }

    /// Parse and verify; None on checksum mismatch
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < BLOCK_INFO_SIZE || bytes[9] != info_checksum(&bytes[..9]) {
            return None;
        }
        Some(Self {
            block_number: u16::from_le_bytes([bytes[0], bytes[1]]),
            block_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            data_address: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            write_status: bytes[8],
        })
    }
}

fn info_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) ^ 0xAA
}
