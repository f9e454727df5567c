//! Scan of a merged flash image for an ESP partition table.
//!
//! Table layout: 32-byte entries `AA 50 | type | subtype | offset u32le |
//! size u32le | label [16] | flags u32le`, ended by an all-`FF` line or an
//! MD5 marker line (`EB EB FF..`).
use super::PartitionEntry;

/// Offsets where bootloaders of the supported families place the table
pub const TABLE_OFFSETS: &[usize] = &[0x8000, 0x9000, 0x10000, 0x20000];

const MAX_TABLE_LENGTH: usize = 0xC00;
const ENTRY_SIZE: usize = 32;
const ENTRY_MAGIC: [u8; 2] = [0xAA, 0x50];
const MD5_MARKER: [u8; 2] = [0xEB, 0xEB];
const FLAG_ENCRYPTED: u32 = 0x1;

/// First table found at a known offset, with that offset
pub fn scan(image: &[u8]) -> Option<(u32, Vec<PartitionEntry>)> {
    TABLE_OFFSETS.iter().find_map(|&offset| {
        let table = image.get(offset..)?;
        let entries = parse_table(&table[..table.len().min(MAX_TABLE_LENGTH)]);
        if entries.is_empty() {
            None
        } else {
            Some((offset as u32, entries))
        }
    })
}

/// Entries up to the first non-entry line
pub fn parse_table(data: &[u8]) -> Vec<PartitionEntry> {
    let mut entries = Vec::new();
    for line in data.chunks_exact(ENTRY_SIZE) {
        if line[..2] != ENTRY_MAGIC {
            // End marker, MD5 line, or garbage: the table stops here
            if line[..2] != MD5_MARKER && line.iter().any(|&b| b != 0xFF) {
                log::debug!("Partition table ended at unexpected line");
            }
            break;
        }
        entries.push(parse_entry(line));
    }
    entries
}

fn parse_entry(line: &[u8]) -> PartitionEntry {
    let word = |at: usize| u32::from_le_bytes([line[at], line[at + 1], line[at + 2], line[at + 3]]);
    let label_bytes = &line[12..28];
    let label_end = label_bytes.iter().position(|&b| b == 0).unwrap_or(label_bytes.len());

    PartitionEntry {
        label: String::from_utf8_lossy(&label_bytes[..label_end]).into_owned(),
        partition_type: line[2],
        subtype: line[3],
        offset: word(4),
        size: word(8),
        encrypted: word(28) & FLAG_ENCRYPTED != 0,
    }
}
