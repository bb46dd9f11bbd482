//! Section status classification and ring arithmetic
//!
//! A section's status is never stored as one field. It is derived from the
//! header and the footer independently, then combined through a fixed table.

use crate::layout::{is_erased, marker_present, Half, Layout, Marker, SectionMgmt};

/// Derived status of a section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionStatus {
    /// Management object fully erased
    Erased,
    /// Formatted, not yet accepting writes
    Empty,
    /// Accepting writes or holding live data
    Active,
    /// Active marker present but the management object is damaged
    ActiveInconsistent,
    /// Marked to be erased
    Erasable,
    /// Erasable marker present but the management object is damaged
    ErasableInconsistent,
    /// Header marked erasable while the footer is not yet
    ErasableHeader,
    /// Header formatted, footer still erased
    NoFooter,
    /// Unreadable or contradictory management data
    Inconsistent,
}

/// Per-section bookkeeping kept in RAM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    pub status: SectionStatus,
    pub counter: u8,
}

impl Default for SectionInfo {
    fn default() -> Self {
        Self { status: SectionStatus::Inconsistent, counter: 0 }
    }
}

/// Classify one half (header or footer area) of a section.
///
/// `area` holds the whole half: both marker pages and the management object.
/// Returns the management object when it is valid for `config_id`.
pub fn classify_half(
    layout: &Layout,
    half: Half,
    area: &[u8],
    config_id: u8,
) -> (SectionStatus, Option<SectionMgmt>) {
    let page = layout.page_size() as usize;
    let mgmt_start = 2 * page;
    let mgmt_end = mgmt_start + layout.mgmt_size() as usize;
    if area.len() < mgmt_end {
        return (SectionStatus::Inconsistent, None);
    }

    let mgmt_bytes = &area[mgmt_start..mgmt_end];
    let (base, mgmt) = if is_erased(mgmt_bytes) {
        (SectionStatus::Erased, None)
    } else {
        match SectionMgmt::from_bytes(mgmt_bytes) {
            Some(m) if m.config_id == config_id => (SectionStatus::Empty, Some(m)),
            _ => (SectionStatus::Inconsistent, None),
        }
    };

    let marker_page = |marker: Marker| {
        let off = layout.marker_offset(half, marker) as usize;
        &area[off..off + page]
    };

    let status = if marker_present(marker_page(Marker::Erasable), Marker::Erasable) {
        if base == SectionStatus::Empty {
            SectionStatus::Erasable
        } else {
            SectionStatus::ErasableInconsistent
        }
    } else if marker_present(marker_page(Marker::Active), Marker::Active) {
        if base == SectionStatus::Empty {
            SectionStatus::Active
        } else {
            SectionStatus::ActiveInconsistent
        }
    } else {
        base
    };
    (status, mgmt)
}

/// Combine header and footer classifications into the section status.
///
/// Agreement on Active or Empty propagates, an erasable marker on either
/// side wins, a valid half contradicted by a damaged one is Inconsistent.
pub fn decide(header: SectionStatus, footer: SectionStatus) -> SectionStatus {
    use SectionStatus::*;

    match header {
        // Formatting writes the header first, so a valid footer under an
        // erased header is the remains of an interrupted erase.
        Erased => match footer {
            Erasable => Erasable,
            _ => Inconsistent,
        },
        Inconsistent => match footer {
            Erasable => Erasable,
            _ => Inconsistent,
        },
        Empty => match footer {
            Erased => NoFooter,
            Empty => Empty,
            Active => Active,
            Erasable | ErasableInconsistent => Erasable,
            _ => Inconsistent,
        },
        Active => match footer {
            Erasable | ErasableInconsistent => Erasable,
            Erased | Empty | Active => Active,
            _ => Inconsistent,
        },
        Erasable | ErasableInconsistent => match footer {
            Empty | Active => ErasableHeader,
            Erasable => Erasable,
            _ if header == Erasable => Erasable,
            _ => Inconsistent,
        },
        ActiveInconsistent => match footer {
            Empty | Active => Active,
            Erasable => Erasable,
            _ => Inconsistent,
        },
        ErasableHeader | NoFooter => Inconsistent,
    }
}

/// Index arithmetic on the ring of sections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    count: u8,
}

impl Ring {
    pub fn new(count: u8) -> Self {
        Self { count }
    }

    pub fn count(self) -> u8 {
        self.count
    }

    pub fn next(self, section: u8) -> u8 {
        self.add(section, 1)
    }

    pub fn prev(self, section: u8) -> u8 {
        if section == 0 {
            self.count - 1
        } else {
            section - 1
        }
    }

    pub fn add(self, section: u8, steps: u8) -> u8 {
        ((section as u16 + steps as u16) % self.count as u16) as u8
    }

    /// Steps forward from `from` to reach `to`
    pub fn distance(self, to: u8, from: u8) -> u8 {
        if to < from {
            self.count - (from - to)
        } else {
            to - from
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::layout::{ERASE_VALUE, MGMT_SIZE};

    fn layout() -> Layout {
        Layout::new(&Config::small())
    }

    /// Build a header/footer area: markers then management object
    fn area(l: &Layout, half: Half, markers: &[Marker], mgmt: Option<SectionMgmt>) -> Vec<u8> {
        let mut buf = vec![ERASE_VALUE; l.header_size() as usize];
        for &m in markers {
            let off = l.marker_offset(half, m) as usize;
            buf[off..off + l.page_size() as usize].fill(m.byte());
        }
        if let Some(m) = mgmt {
            let off = 2 * l.page_size() as usize;
            buf[off..].copy_from_slice(&m.to_bytes(l.mgmt_size() as usize));
        }
        buf
    }

    fn mgmt(config_id: u8) -> SectionMgmt {
        SectionMgmt { config_id, section_counter: 5, erase_counter: 9 }
    }

    #[test]
    fn test_classify_erased_and_empty() {
        let l = layout();
        let (s, m) = classify_half(&l, Half::Header, &area(&l, Half::Header, &[], None), 1);
        assert_eq!(s, SectionStatus::Erased);
        assert!(m.is_none());

        let footer = area(&l, Half::Footer, &[], Some(mgmt(1)));
        let (s, m) = classify_half(&l, Half::Footer, &footer, 1);
        assert_eq!(s, SectionStatus::Empty);
        assert_eq!(m.map(|m| m.section_counter), Some(5));
    }

    #[test]
    fn test_classify_markers() {
        let l = layout();
        let active = area(&l, Half::Header, &[Marker::Active], Some(mgmt(1)));
        assert_eq!(classify_half(&l, Half::Header, &active, 1).0, SectionStatus::Active);

        let both = area(&l, Half::Footer, &[Marker::Active, Marker::Erasable], Some(mgmt(1)));
        assert_eq!(classify_half(&l, Half::Footer, &both, 1).0, SectionStatus::Erasable);

        let damaged = area(&l, Half::Header, &[Marker::Active], None);
        assert_eq!(
            classify_half(&l, Half::Header, &damaged, 1).0,
            SectionStatus::ActiveInconsistent
        );
    }

    #[test]
    fn test_classify_foreign_config_id() {
        let l = layout();
        let other = area(&l, Half::Header, &[], Some(mgmt(2)));
        assert_eq!(classify_half(&l, Half::Header, &other, 1).0, SectionStatus::Inconsistent);
    }

    #[test]
    fn test_classify_torn_management_object() {
        let l = layout();
        let mut torn = area(&l, Half::Footer, &[], Some(mgmt(1)));
        let off = 2 * l.page_size() as usize + MGMT_SIZE - 1;
        torn[off] = ERASE_VALUE;
        assert_eq!(classify_half(&l, Half::Footer, &torn, 1).0, SectionStatus::Inconsistent);
    }

    #[test]
    fn test_decide_table() {
        use SectionStatus::*;
        assert_eq!(decide(Active, Empty), Active);
        assert_eq!(decide(Empty, Empty), Empty);
        assert_eq!(decide(Empty, Erased), NoFooter);
        assert_eq!(decide(Erasable, Active), ErasableHeader);
        assert_eq!(decide(Active, Erasable), Erasable);
        assert_eq!(decide(Erased, Erasable), Erasable);
        assert_eq!(decide(Erased, Erased), Inconsistent);
        assert_eq!(decide(Inconsistent, Erased), Inconsistent);
    }

    #[test]
    fn test_decide_contradiction_is_inconsistent() {
        use SectionStatus::*;
        assert_eq!(decide(Active, Inconsistent), Inconsistent);
        assert_eq!(decide(Empty, Inconsistent), Inconsistent);
        assert_eq!(decide(Inconsistent, Active), Inconsistent);
        assert_eq!(decide(Active, ActiveInconsistent), Inconsistent);
        assert_eq!(decide(Erased, Empty), Inconsistent);
        assert_eq!(decide(Erased, Active), Inconsistent);
    }

    #[test]
    fn test_ring_arithmetic() {
        let ring = Ring::new(3);
        assert_eq!(ring.next(2), 0);
        assert_eq!(ring.prev(0), 2);
        assert_eq!(ring.add(1, 2), 0);
        assert_eq!(ring.distance(0, 2), 1);
        assert_eq!(ring.distance(2, 0), 2);
        assert_eq!(ring.distance(1, 1), 0);
    }
}
