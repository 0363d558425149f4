//! Up-case (case-folding) table. Usually stored on disk compressed: a
//! `0xFFFF` unit followed by a count stands for that many identity
//! mappings. Plain 65536-entry tables are legal as well.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::checksum::calc_chksum_4byte;
use crate::error::{FsError, Result};

const TABLE_LEN: usize = 0x10000;
const RUN_MARKER: u16 = 0xFFFF;

pub struct UpcaseTable {
    map: Box<[u16]>,
}

impl UpcaseTable {
    fn identity() -> Vec<u16> {
        (0..TABLE_LEN).map(|i| i as u16).collect()
    }

    /// ASCII and Latin-1 folding; what `format` writes and what mount falls
    /// back to when the on-disk table is unusable.
    pub fn builtin() -> Self {
        let mut map = Self::identity();
        for c in b'a'..=b'z' {
            map[c as usize] = (c - 0x20) as u16;
        }
        for c in 0xE0u16..=0xFE {
            if c != 0xF7 {
                map[c as usize] = c - 0x20;
            }
        }
        map[0xFF] = 0x178;
        Self { map: map.into_boxed_slice() }
    }

    /// Decodes an on-disk table after checking its checksum.
    pub fn from_disk(raw: &[u8], expected_checksum: u32) -> Result<Self> {
        let actual = Self::checksum(raw);
        if actual != expected_checksum {
            log::warn!(
                "upcase::from_disk: checksum {:#010x} does not match entry {:#010x}",
                actual,
                expected_checksum
            );
            return Err(FsError::CorruptedUpcase);
        }
        let mut map = Self::identity();
        let mut idx = 0usize;
        let mut units = raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]));
        while let Some(unit) = units.next() {
            // An identity entry comes first: an uncompressed table maps
            // 0xFFFF to itself in its last slot.
            if unit as usize == idx {
                idx += 1;
            } else if unit == RUN_MARKER {
                let Some(run) = units.next() else {
                    return Err(FsError::CorruptedUpcase);
                };
                idx += run as usize;
            } else {
                if idx >= TABLE_LEN {
                    return Err(FsError::CorruptedUpcase);
                }
                map[idx] = unit;
                idx += 1;
            }
        }
        if idx > TABLE_LEN {
            return Err(FsError::CorruptedUpcase);
        }
        Ok(Self { map: map.into_boxed_slice() })
    }

    pub fn checksum(raw: &[u8]) -> u32 {
        calc_chksum_4byte(raw, 0, false)
    }

    /// Encodes the table in compressed on-disk form.
    pub fn compress(&self) -> Vec<u8> {
        let mut out: Vec<u16> = Vec::new();
        let mut i = 0usize;
        while i < TABLE_LEN {
            let mut run = 0usize;
            while i + run < TABLE_LEN && self.map[i + run] == (i + run) as u16 && run < 0xFFFF {
                run += 1;
            }
            if run >= 3 {
                out.push(RUN_MARKER);
                out.push(run as u16);
                i += run;
            } else {
                out.push(self.map[i]);
                i += 1;
            }
        }
        let mut raw = vec![0u8; out.len() * 2];
        for (chunk, unit) in raw.chunks_exact_mut(2).zip(out) {
            chunk.copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }

    pub fn upcase(&self, ch: u16) -> u16 {
        self.map[ch as usize]
    }

    pub fn upcase_name(&self, name: &[u16]) -> Vec<u16> {
        name.iter().map(|&c| self.upcase(c)).collect()
    }

    pub fn names_equal(&self, a: &[u16], b: &[u16]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| self.upcase(x) == self.upcase(y))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builtin_folds_ascii() {
        let table = UpcaseTable::builtin();
        assert_eq!(table.upcase(b'q' as u16), b'Q' as u16);
        assert_eq!(table.upcase(b'Q' as u16), b'Q' as u16);
        assert_eq!(table.upcase(b'1' as u16), b'1' as u16);
        assert_eq!(table.upcase(0xE9), 0xC9);
    }

    #[test]
    fn test_compressed_form_decodes_to_same_table() {
        let table = UpcaseTable::builtin();
        let raw = table.compress();
        assert!(raw.len() < 1024);
        let decoded = UpcaseTable::from_disk(&raw, UpcaseTable::checksum(&raw)).unwrap();
        for ch in [0u16, b'a' as u16, 0x7F, 0xE0, 0xF7, 0xFF, 0x1234, 0xFFFF] {
            assert_eq!(decoded.upcase(ch), table.upcase(ch));
        }
    }

    #[test]
    fn test_uncompressed_table() {
        let mut map = UpcaseTable::identity();
        for c in b'a'..=b'z' {
            map[c as usize] = (c - 0x20) as u16;
        }
        // Greek small alpha..omega, outside the built-in folding.
        for c in 0x3B1u16..=0x3C9 {
            if c != 0x3C2 {
                map[c as usize] = c - 0x20;
            }
        }
        let raw: Vec<u8> = map.iter().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(raw.len(), 2 * TABLE_LEN);
        let table = UpcaseTable::from_disk(&raw, UpcaseTable::checksum(&raw)).unwrap();
        assert_eq!(table.upcase(0x3B1), 0x391);
        assert_eq!(table.upcase(b'z' as u16), b'Z' as u16);
        assert_eq!(table.upcase(0xFFFE), 0xFFFE);
        assert_eq!(table.upcase(0xFFFF), 0xFFFF);
        assert!(table.names_equal(&[0x3B1, 0x3B2], &[0x391, 0x392]));
    }

    #[test]
    fn test_checksum_mismatch() {
        let raw = UpcaseTable::builtin().compress();
        let bad = UpcaseTable::checksum(&raw) ^ 1;
        assert_eq!(UpcaseTable::from_disk(&raw, bad).err(), Some(FsError::CorruptedUpcase));
    }
}
