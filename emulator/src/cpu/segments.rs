//! Segment selectors and their descriptor caches.
//!
//! The four-value `(selector, base, limit, attrib)` tuple mirrors the
//! teacher's VMCB state-save-area setters (`Vmcb::set_cs`, `set_ds`, ...),
//! which thread exactly those four values per segment into the guest
//! state. Here the four values live together as one cache per segment
//! instead of four parallel VMCB offsets.

use crate::error::{EmuError, Result};
use crate::memory::Memory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentId {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
}

pub const ALL_SEGMENTS: [SegmentId; 6] = [
    SegmentId::Cs,
    SegmentId::Ds,
    SegmentId::Es,
    SegmentId::Fs,
    SegmentId::Gs,
    SegmentId::Ss,
];

/// Shadow copy of a loaded segment's descriptor, refreshed on every
/// segment-register load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorCache {
    pub base: u32,
    pub limit: u32,
    /// Granularity bit: when set, `limit` is in 4 KiB pages (already
    /// expanded to a byte limit when this struct is populated).
    pub granularity_4k: bool,
    pub dpl: u8,
    pub present: bool,
    pub executable: bool,
    pub readable_writable: bool,
}

impl DescriptorCache {
    /// The cache real-mode selector loads populate: flat, byte granular,
    /// base = selector << 4.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            granularity_4k: false,
            dpl: 0,
            present: true,
            executable: false,
            readable_writable: true,
        }
    }

    /// Decode an 8-byte GDT/LDT descriptor into a cache entry.
    pub fn from_descriptor_bytes(raw: &[u8; 8]) -> Self {
        let limit_low = u16::from_le_bytes([raw[0], raw[1]]) as u32;
        let base_low = u16::from_le_bytes([raw[2], raw[3]]) as u32;
        let base_mid = raw[4] as u32;
        let access = raw[5];
        let limit_high_and_flags = raw[6];
        let base_high = raw[7] as u32;

        let limit_high = (limit_high_and_flags & 0x0F) as u32;
        let granularity_4k = limit_high_and_flags & 0x80 != 0;
        let mut limit = (limit_high << 16) | limit_low;
        if granularity_4k {
            limit = (limit << 12) | 0xFFF;
        }
        let base = (base_high << 24) | (base_mid << 16) | base_low;

        Self {
            base,
            limit,
            granularity_4k,
            dpl: (access >> 5) & 0x03,
            present: access & 0x80 != 0,
            executable: access & 0x08 != 0,
            readable_writable: access & 0x02 != 0,
        }
    }

    /// Effective linear address for `offset`, after an in-limit check.
    pub fn translate(&self, offset: u32, width: u8) -> Result<u32> {
        let end = offset as u64 + width as u64;
        if end > self.limit as u64 + 1 {
            return Err(EmuError::SegmentFault {
                reason: "offset exceeds segment limit",
            });
        }
        Ok(self.base.wrapping_add(offset))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub cache: DescriptorCache,
}

impl Segment {
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            cache: DescriptorCache::real_mode(selector),
        }
    }
}

impl Default for Segment {
    fn default() -> Self {
        Segment::real_mode(0)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentFile {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
}

impl SegmentFile {
    pub fn get(&self, id: SegmentId) -> &Segment {
        match id {
            SegmentId::Cs => &self.cs,
            SegmentId::Ds => &self.ds,
            SegmentId::Es => &self.es,
            SegmentId::Fs => &self.fs,
            SegmentId::Gs => &self.gs,
            SegmentId::Ss => &self.ss,
        }
    }

    pub fn get_mut(&mut self, id: SegmentId) -> &mut Segment {
        match id {
            SegmentId::Cs => &mut self.cs,
            SegmentId::Ds => &mut self.ds,
            SegmentId::Es => &mut self.es,
            SegmentId::Fs => &mut self.fs,
            SegmentId::Gs => &mut self.gs,
            SegmentId::Ss => &mut self.ss,
        }
    }

    /// Reload a segment in real mode: selector<<4 base, 64 KiB byte limit.
    pub fn load_real_mode(&mut self, id: SegmentId, selector: u16) {
        *self.get_mut(id) = Segment::real_mode(selector);
    }

    /// Reload a segment in protected mode from the GDT (or LDT — callers
    /// pass whichever table base/limit applies).
    pub fn load_protected_mode(
        &mut self,
        id: SegmentId,
        selector: u16,
        table_base: u32,
        table_limit: u32,
        mem: &Memory,
    ) -> Result<()> {
        if selector == 0 {
            *self.get_mut(id) = Segment {
                selector: 0,
                cache: DescriptorCache {
                    base: 0,
                    limit: 0,
                    granularity_4k: false,
                    dpl: 0,
                    present: false,
                    executable: false,
                    readable_writable: false,
                },
            };
            return Ok(());
        }
        let index = (selector >> 3) as u32;
        let byte_offset = index * 8;
        if byte_offset + 7 > table_limit {
            return Err(EmuError::SegmentFault {
                reason: "selector index exceeds descriptor table limit",
            });
        }
        let raw = mem.read_bytes(table_base + byte_offset, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        let cache = DescriptorCache::from_descriptor_bytes(&arr);
        if !cache.present {
            return Err(EmuError::SegmentFault {
                reason: "descriptor not present",
            });
        }
        *self.get_mut(id) = Segment { selector, cache };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_load_sets_base_from_selector() {
        let seg = Segment::real_mode(0x1000);
        assert_eq!(seg.cache.base, 0x10000);
        assert_eq!(seg.cache.limit, 0xFFFF);
    }

    #[test]
    fn code_segment_descriptor_decodes_access_byte() {
        // base=0 limit=0xFFFFF access=0x9A flags=0xCF -> 4KiB granular code.
        let raw: [u8; 8] = [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00];
        let cache = DescriptorCache::from_descriptor_bytes(&raw);
        assert_eq!(cache.base, 0);
        assert_eq!(cache.limit, 0xFFFF_FFFF);
        assert!(cache.present);
        assert!(cache.executable);
        assert!(cache.granularity_4k);
    }

    #[test]
    fn out_of_limit_translate_faults() {
        let cache = DescriptorCache {
            base: 0,
            limit: 0xFF,
            granularity_4k: false,
            dpl: 0,
            present: true,
            executable: false,
            readable_writable: true,
        };
        assert!(cache.translate(0x100, 1).is_err());
        assert!(cache.translate(0xFF, 1).is_ok());
    }
}
