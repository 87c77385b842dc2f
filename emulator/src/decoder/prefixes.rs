//! Legacy prefix scan (decoder step 1).
//!
//! `decode_mmio_instruction` scans a handful of these bytes in a `while`
//! loop before reaching its single MOV-family opcode; this widens that
//! loop to the full prefix set (LOCK/REP group, segment overrides,
//! operand- and address-size overrides) and accumulates them instead of
//! discarding everything but operand size.

use crate::cpu::segments::SegmentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepKind {
    Rep,
    Repne,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: Option<RepKind>,
    pub segment_override: Option<SegmentId>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
}

impl Prefixes {
    /// Scans prefix bytes starting at `bytes[0]`, returns (prefixes, count
    /// consumed). Duplicate prefixes within a group are permitted; the
    /// last one scanned wins.
    pub fn scan(bytes: &[u8]) -> (Prefixes, usize) {
        let mut prefixes = Prefixes::default();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                0xF0 => prefixes.lock = true,
                0xF2 => prefixes.rep = Some(RepKind::Repne),
                0xF3 => prefixes.rep = Some(RepKind::Rep),
                0x2E => prefixes.segment_override = Some(SegmentId::Cs),
                0x36 => prefixes.segment_override = Some(SegmentId::Ss),
                0x3E => prefixes.segment_override = Some(SegmentId::Ds),
                0x26 => prefixes.segment_override = Some(SegmentId::Es),
                0x64 => prefixes.segment_override = Some(SegmentId::Fs),
                0x65 => prefixes.segment_override = Some(SegmentId::Gs),
                0x66 => prefixes.operand_size_override = true,
                0x67 => prefixes.address_size_override = true,
                _ => break,
            }
            i += 1;
        }
        (prefixes, i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_segment_override_and_operand_size() {
        let (prefixes, len) = Prefixes::scan(&[0x65, 0x66, 0xB8]);
        assert_eq!(len, 2);
        assert_eq!(prefixes.segment_override, Some(SegmentId::Gs));
        assert!(prefixes.operand_size_override);
    }

    #[test]
    fn duplicate_segment_override_last_wins() {
        let (prefixes, len) = Prefixes::scan(&[0x3E, 0x26, 0x90]);
        assert_eq!(len, 2);
        assert_eq!(prefixes.segment_override, Some(SegmentId::Es));
    }

    #[test]
    fn no_prefixes_consumes_nothing() {
        let (prefixes, len) = Prefixes::scan(&[0x90]);
        assert_eq!(len, 0);
        assert_eq!(prefixes, Prefixes::default());
    }
}
