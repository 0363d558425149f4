//! On-disk directory entry layouts. Every entry is a 32-byte slot; the views
//! below wrap a slot slice (`&[u8]` or `&mut [u8]`) and decode fields in
//! place, little-endian, with no unsafe casts.

use bitflags::bitflags;

use crate::config::*;

bitflags! {
    /// File attributes stored in the file entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttr: u16 {
        const READ_ONLY = 0x0001;
        const HIDDEN    = 0x0002;
        const SYSTEM    = 0x0004;
        const VOLUME    = 0x0008;
        const DIRECTORY = 0x0010;
        const ARCHIVE   = 0x0020;
    }
}

pub const TYPE_UNUSED: u8 = 0x00;
pub const TYPE_BITMAP: u8 = 0x81;
pub const TYPE_UPCASE: u8 = 0x82;
pub const TYPE_VOLUME_LABEL: u8 = 0x83;
pub const TYPE_FILE: u8 = 0x85;
pub const TYPE_VOLUME_GUID: u8 = 0xA0;
pub const TYPE_PADDING: u8 = 0xA1;
pub const TYPE_STREAM: u8 = 0xC0;
pub const TYPE_NAME: u8 = 0xC1;
pub const TYPE_VENDOR_EXT: u8 = 0xE0;
pub const TYPE_VENDOR_ALLOC: u8 = 0xE1;

const IN_USE: u8 = 0x80;
const SECONDARY: u8 = 0x40;
const BENIGN: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryType {
    /// End-of-directory marker; every following slot is unused too.
    Unused,
    /// In-use bit cleared.
    Deleted,
    Bitmap,
    Upcase,
    VolumeLabel,
    File,
    Stream,
    Name,
    /// Any other in-use secondary; carried along with its set.
    BenignSecondary,
    /// Unknown primary entry.
    Unknown,
}

impl DentryType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            TYPE_UNUSED => DentryType::Unused,
            b if b & IN_USE == 0 => DentryType::Deleted,
            TYPE_BITMAP => DentryType::Bitmap,
            TYPE_UPCASE => DentryType::Upcase,
            TYPE_VOLUME_LABEL => DentryType::VolumeLabel,
            TYPE_FILE => DentryType::File,
            TYPE_STREAM => DentryType::Stream,
            TYPE_NAME => DentryType::Name,
            b if b & SECONDARY != 0 && b & BENIGN != 0 => DentryType::BenignSecondary,
            _ => DentryType::Unknown,
        }
    }

    pub fn is_secondary(&self) -> bool {
        matches!(
            self,
            DentryType::Stream | DentryType::Name | DentryType::BenignSecondary
        )
    }

    /// The slot can be reused for a new entry set.
    pub fn is_free(&self) -> bool {
        matches!(self, DentryType::Unused | DentryType::Deleted)
    }
}

pub fn dentry_type(slot: &[u8]) -> DentryType {
    DentryType::from_byte(slot[0])
}

/// Clears the in-use bit of a slot.
pub fn mark_deleted(slot: &mut [u8]) {
    slot[0] &= !IN_USE;
}

#[inline]
fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

#[inline]
fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[inline]
fn le64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
fn put16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Packed exFAT timestamp: DOS date/time, 10 ms increment and UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub time: u32,
    pub ms10: u8,
    pub tz: u8,
}

/// Primary file directory entry (0x85).
pub struct FileEntry<T>(pub T);

impl<T: AsRef<[u8]>> FileEntry<T> {
    pub fn secondary_count(&self) -> u8 {
        self.0.as_ref()[1]
    }

    pub fn checksum(&self) -> u16 {
        le16(self.0.as_ref(), 2)
    }

    pub fn attr(&self) -> FileAttr {
        FileAttr::from_bits_retain(le16(self.0.as_ref(), 4))
    }

    pub fn create_time(&self) -> Timestamp {
        let b = self.0.as_ref();
        Timestamp { time: le32(b, 8), ms10: b[20], tz: b[22] }
    }

    pub fn modify_time(&self) -> Timestamp {
        let b = self.0.as_ref();
        Timestamp { time: le32(b, 12), ms10: b[21], tz: b[23] }
    }

    pub fn access_time(&self) -> Timestamp {
        let b = self.0.as_ref();
        Timestamp { time: le32(b, 16), ms10: 0, tz: b[24] }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> FileEntry<T> {
    pub fn init(&mut self, secondary_count: u8, attr: FileAttr) {
        let b = self.0.as_mut();
        b[..DENTRY_SIZE].fill(0);
        b[0] = TYPE_FILE;
        b[1] = secondary_count;
        put16(b, 4, attr.bits());
    }

    pub fn set_secondary_count(&mut self, n: u8) {
        self.0.as_mut()[1] = n;
    }

    pub fn set_checksum(&mut self, chksum: u16) {
        put16(self.0.as_mut(), 2, chksum);
    }

    pub fn set_attr(&mut self, attr: FileAttr) {
        put16(self.0.as_mut(), 4, attr.bits());
    }

    pub fn set_create_time(&mut self, ts: Timestamp) {
        let b = self.0.as_mut();
        put32(b, 8, ts.time);
        b[20] = ts.ms10;
        b[22] = ts.tz;
    }

    pub fn set_modify_time(&mut self, ts: Timestamp) {
        let b = self.0.as_mut();
        put32(b, 12, ts.time);
        b[21] = ts.ms10;
        b[23] = ts.tz;
    }

    pub fn set_access_time(&mut self, ts: Timestamp) {
        let b = self.0.as_mut();
        put32(b, 16, ts.time);
        b[24] = ts.tz;
    }
}

/// Stream extension entry (0xC0): allocation and size of the file data.
pub struct StreamEntry<T>(pub T);

impl<T: AsRef<[u8]>> StreamEntry<T> {
    pub fn flags(&self) -> u8 {
        self.0.as_ref()[1]
    }

    pub fn is_contiguous(&self) -> bool {
        self.flags() & ALLOC_NO_FAT_CHAIN != 0
    }

    pub fn name_len(&self) -> u8 {
        self.0.as_ref()[3]
    }

    pub fn name_hash(&self) -> u16 {
        le16(self.0.as_ref(), 4)
    }

    pub fn valid_size(&self) -> u64 {
        le64(self.0.as_ref(), 8)
    }

    pub fn first_cluster(&self) -> u32 {
        le32(self.0.as_ref(), 20)
    }

    pub fn size(&self) -> u64 {
        le64(self.0.as_ref(), 24)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> StreamEntry<T> {
    pub fn init(&mut self, flags: u8, first_cluster: u32, size: u64) {
        let b = self.0.as_mut();
        b[..DENTRY_SIZE].fill(0);
        b[0] = TYPE_STREAM;
        b[1] = flags;
        put64(b, 8, size);
        put32(b, 20, first_cluster);
        put64(b, 24, size);
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.0.as_mut()[1] = flags;
    }

    pub fn set_name(&mut self, len: u8, hash: u16) {
        let b = self.0.as_mut();
        b[3] = len;
        put16(b, 4, hash);
    }

    pub fn set_first_cluster(&mut self, clu: u32) {
        put32(self.0.as_mut(), 20, clu);
    }

    /// Sets DataLength and ValidDataLength together.
    pub fn set_size(&mut self, size: u64) {
        let b = self.0.as_mut();
        put64(b, 8, size);
        put64(b, 24, size);
    }
}

/// File name entry (0xC1): up to 15 UTF-16 units.
pub struct NameEntry<T>(pub T);

impl<T: AsRef<[u8]>> NameEntry<T> {
    pub fn unit(&self, i: usize) -> u16 {
        le16(self.0.as_ref(), 2 + i * 2)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> NameEntry<T> {
    pub fn init(&mut self, units: &[u16]) {
        let b = self.0.as_mut();
        b[..DENTRY_SIZE].fill(0);
        b[0] = TYPE_NAME;
        for (i, &u) in units.iter().take(NAME_CHARS_PER_ENTRY).enumerate() {
            put16(b, 2 + i * 2, u);
        }
    }
}

/// Allocation bitmap (0x81) and up-case table (0x82) entries share the
/// placement of FirstCluster and DataLength.
pub struct SystemEntry<T>(pub T);

impl<T: AsRef<[u8]>> SystemEntry<T> {
    pub fn upcase_checksum(&self) -> u32 {
        le32(self.0.as_ref(), 4)
    }

    pub fn first_cluster(&self) -> u32 {
        le32(self.0.as_ref(), 20)
    }

    pub fn size(&self) -> u64 {
        le64(self.0.as_ref(), 24)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> SystemEntry<T> {
    pub fn init_bitmap(&mut self, first_cluster: u32, size: u64) {
        let b = self.0.as_mut();
        b[..DENTRY_SIZE].fill(0);
        b[0] = TYPE_BITMAP;
        put32(b, 20, first_cluster);
        put64(b, 24, size);
    }

    pub fn init_upcase(&mut self, checksum: u32, first_cluster: u32, size: u64) {
        let b = self.0.as_mut();
        b[..DENTRY_SIZE].fill(0);
        b[0] = TYPE_UPCASE;
        put32(b, 4, checksum);
        put32(b, 20, first_cluster);
        put64(b, 24, size);
    }
}

/// Volume label entry (0x83).
pub struct LabelEntry<T>(pub T);

impl<T: AsRef<[u8]>> LabelEntry<T> {
    pub fn label(&self) -> alloc::string::String {
        let b = self.0.as_ref();
        let count = (b[1] as usize).min(VOLUME_LABEL_MAX_CHARS);
        let units = (0..count).map(|i| le16(b, 2 + i * 2));
        char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> LabelEntry<T> {
    pub fn init(&mut self, label: &str) {
        let b = self.0.as_mut();
        b[..DENTRY_SIZE].fill(0);
        b[0] = TYPE_VOLUME_LABEL;
        let mut count = 0;
        for (i, u) in label.encode_utf16().take(VOLUME_LABEL_MAX_CHARS).enumerate() {
            put16(b, 2 + i * 2, u);
            count += 1;
        }
        b[1] = count as u8;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_type_decoding() {
        assert_eq!(DentryType::from_byte(0x00), DentryType::Unused);
        assert_eq!(DentryType::from_byte(0x05), DentryType::Deleted);
        assert_eq!(DentryType::from_byte(0x85), DentryType::File);
        assert_eq!(DentryType::from_byte(0xC0), DentryType::Stream);
        assert_eq!(DentryType::from_byte(0x41), DentryType::Deleted);
        assert_eq!(DentryType::from_byte(0xE0), DentryType::BenignSecondary);
        assert!(DentryType::from_byte(0xC1).is_secondary());
        assert!(!DentryType::from_byte(0x85).is_secondary());
    }

    #[test]
    fn test_stream_fields() {
        let mut slot = [0u8; DENTRY_SIZE];
        let mut stream = StreamEntry(&mut slot[..]);
        stream.init(ALLOC_CONTIGUOUS, 42, 4096);
        stream.set_name(3, 0xBEEF);
        let stream = StreamEntry(&slot[..]);
        assert!(stream.is_contiguous());
        assert_eq!(stream.first_cluster(), 42);
        assert_eq!(stream.size(), 4096);
        assert_eq!(stream.valid_size(), 4096);
        assert_eq!(stream.name_hash(), 0xBEEF);
        assert_eq!(slot[0], TYPE_STREAM);
    }

    #[test]
    fn test_delete_keeps_type_code() {
        let mut slot = [0u8; DENTRY_SIZE];
        FileEntry(&mut slot[..]).init(2, FileAttr::ARCHIVE);
        mark_deleted(&mut slot);
        assert_eq!(slot[0], 0x05);
        assert!(dentry_type(&slot).is_free());
    }

    #[test]
    fn test_label_round_trip() {
        let mut slot = [0u8; DENTRY_SIZE];
        LabelEntry(&mut slot[..]).init("DATA");
        assert_eq!(LabelEntry(&slot[..]).label(), "DATA");
    }
}
