//! Rolling checksums used by exFAT metadata.

/// Which bytes a 16-bit checksum skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    /// Plain running sum.
    Default,
    /// Entry set: bytes 2 and 3 of the primary entry hold the checksum itself.
    DirEntry,
}

pub fn calc_chksum_2byte(data: &[u8], mut chksum: u16, ty: ChecksumType) -> u16 {
    for (i, &b) in data.iter().enumerate() {
        if ty == ChecksumType::DirEntry && (i == 2 || i == 3) {
            continue;
        }
        chksum = chksum.rotate_right(1).wrapping_add(b as u16);
    }
    chksum
}

/// Boot region checksum. `skip_flags` excludes VolumeFlags (106, 107) and
/// PercentInUse (112), which applies to the first sector only.
pub fn calc_chksum_4byte(data: &[u8], mut chksum: u32, skip_flags: bool) -> u32 {
    for (i, &b) in data.iter().enumerate() {
        if skip_flags && (i == 106 || i == 107 || i == 112) {
            continue;
        }
        chksum = chksum.rotate_right(1).wrapping_add(b as u32);
    }
    chksum
}

/// Entry-set checksum over `entries` (a whole set, primary first).
pub fn entry_set_checksum(entries: &[u8]) -> u16 {
    calc_chksum_2byte(entries, 0, ChecksumType::DirEntry)
}

/// Name hash over already up-cased UTF-16 units, low byte first.
pub fn name_hash(upcased: &[u16]) -> u16 {
    upcased.iter().fold(0, |hash, ch| calc_chksum_2byte(&ch.to_le_bytes(), hash, ChecksumType::Default))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rotation_matches_definition() {
        // ((sum & 1) ? 0x8000 : 0) + (sum >> 1) + byte
        let data = [0x85u8, 0x02, 0xAA, 0xBB, 0x10, 0x00, 0xFF];
        let mut expect: u16 = 0;
        for (i, &b) in data.iter().enumerate() {
            if i == 2 || i == 3 {
                continue;
            }
            expect = (if expect & 1 != 0 { 0x8000 } else { 0 }) + (expect >> 1) + b as u16;
        }
        assert_eq!(entry_set_checksum(&data), expect);
    }

    #[test]
    fn test_checksum_ignores_its_own_field() {
        let mut set = [0u8; 96];
        set[0] = 0x85;
        set[1] = 2;
        let a = entry_set_checksum(&set);
        set[2] = 0x12;
        set[3] = 0x34;
        assert_eq!(entry_set_checksum(&set), a);
        set[40] = 1;
        assert_ne!(entry_set_checksum(&set), a);
    }

    #[test]
    fn test_boot_checksum_skips_flags() {
        let mut sector = [0u8; 512];
        let a = calc_chksum_4byte(&sector, 0, true);
        sector[106] = 0x02;
        sector[112] = 50;
        assert_eq!(calc_chksum_4byte(&sector, 0, true), a);
        sector[108] = 9;
        assert_ne!(calc_chksum_4byte(&sector, 0, true), a);
    }

    #[test]
    fn test_name_hash_case_sensitive_input() {
        let upper: [u16; 3] = [b'A' as u16, b'B' as u16, b'C' as u16];
        let lower: [u16; 3] = [b'a' as u16, b'b' as u16, b'c' as u16];
        assert_ne!(name_hash(&upper), name_hash(&lower));
        assert_eq!(name_hash(&upper), name_hash(&upper));
    }
}
