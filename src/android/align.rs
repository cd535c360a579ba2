//! zipalign: moves the data of stored entries onto word (or page, for `.so`) boundaries.
//!
//! Padding goes into the local header's extra field, so entry bytes are never touched; only
//! local offsets in the central directory and the central directory offset in the EOCD move.
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::android::zip::{
    CENTRAL_HEADER_LEN, CENTRAL_HEADER_SIGNATURE, END_OF_CENTRAL_DIRECTORY_LEN,
    END_OF_CENTRAL_DIRECTORY_SIGNATURE, LOCAL_HEADER_LEN, LOCAL_HEADER_SIGNATURE,
};

pub const DEFAULT_WORD_ALIGNMENT: u32 = 4;
pub const DEFAULT_PAGE_ALIGNMENT: u32 = 4096;

const MAX_COMMENT_LEN: usize = 0xFFFF;

#[derive(Debug)]
pub enum AlignError {
    Io(io::Error),
    Malformed(String),
}

impl fmt::Display for AlignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignError::Io(err) => write!(f, "I/O error: {err}"),
            AlignError::Malformed(msg) => write!(f, "cannot align archive: {msg}"),
        }
    }
}

impl std::error::Error for AlignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AlignError::Io(err) => Some(err),
            AlignError::Malformed(_) => None,
        }
    }
}

impl From<io::Error> for AlignError {
    fn from(value: io::Error) -> Self {
        AlignError::Io(value)
    }
}

fn malformed<T>(msg: impl Into<String>) -> Result<T, AlignError> {
    Err(AlignError::Malformed(msg.into()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AlignReport {
    pub entries: usize,
    pub padded: usize,
    pub padding_bytes: usize,
}

/// A stored entry whose data does not start on its required boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Misaligned {
    pub name: String,
    pub data_offset: u64,
    pub required: u32,
}

/// Aligns `input` into `output` (which may not be the same file).
pub fn align(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    word_size: u32,
    page_size: u32,
) -> Result<AlignReport, AlignError> {
    let data = fs::read(input.as_ref())?;
    let (aligned, report) = align_bytes(&data, word_size, page_size)?;
    fs::write(output.as_ref(), aligned)?;
    log::info!(
        "aligned {} entries ({} padded, {} bytes of padding)",
        report.entries,
        report.padded,
        report.padding_bytes
    );
    Ok(report)
}

/// In-memory variant of [`align`].
pub fn align_bytes(data: &[u8], word_size: u32, page_size: u32) -> Result<(Vec<u8>, AlignReport), AlignError> {
    check_boundary(word_size)?;
    check_boundary(page_size)?;
    let layout = Layout::parse(data)?;

    let mut by_offset: Vec<&CentralEntry> = layout.entries.iter().collect();
    by_offset.sort_by_key(|entry| entry.local_offset);

    let mut out = Vec::with_capacity(data.len() + layout.entries.len() * 4);
    let mut report = AlignReport {
        entries: layout.entries.len(),
        ..AlignReport::default()
    };
    let first_offset = by_offset
        .first()
        .map_or(layout.cd_offset, |entry| entry.local_offset as usize);
    out.extend_from_slice(&data[..first_offset]);

    let mut new_offsets = vec![0u32; layout.entries.len()];
    for (pos, entry) in by_offset.iter().enumerate() {
        let start = entry.local_offset as usize;
        let end = by_offset
            .get(pos + 1)
            .map_or(layout.cd_offset, |next| next.local_offset as usize);
        let local = LocalHeader::parse(data, start, end)?;

        let new_offset = out.len();
        new_offsets[entry.index] = to_u32(new_offset, "entry offset")?;
        let padding = match entry.required_alignment(word_size, page_size) {
            Some(boundary) => {
                let data_start = new_offset + LOCAL_HEADER_LEN + local.name_len + local.extra_len;
                padding_for(data_start, boundary)
            }
            None => 0,
        };
        let extra_len = u16::try_from(local.extra_len + padding).map_err(|_| {
            AlignError::Malformed(format!("extra field of {} would overflow", entry.name))
        })?;

        let header_end = start + LOCAL_HEADER_LEN + local.name_len + local.extra_len;
        out.extend_from_slice(&data[start..start + 28]);
        out.extend_from_slice(&extra_len.to_le_bytes());
        out.extend_from_slice(&data[start + LOCAL_HEADER_LEN..header_end]);
        out.resize(out.len() + padding, 0);
        out.extend_from_slice(&data[header_end..end]);

        if padding > 0 {
            report.padded += 1;
            report.padding_bytes += padding;
        }
    }

    let new_cd_offset = to_u32(out.len(), "central directory offset")?;
    for entry in &layout.entries {
        let record = &data[entry.record_start..entry.record_end];
        out.extend_from_slice(&record[..42]);
        out.extend_from_slice(&new_offsets[entry.index].to_le_bytes());
        out.extend_from_slice(&record[CENTRAL_HEADER_LEN..]);
    }
    let cd_end = layout.cd_offset + layout.cd_size;
    out.extend_from_slice(&data[cd_end..layout.eocd_pos]);

    let eocd = &data[layout.eocd_pos..];
    out.extend_from_slice(&eocd[..16]);
    out.extend_from_slice(&new_cd_offset.to_le_bytes());
    out.extend_from_slice(&eocd[20..]);
    Ok((out, report))
}

/// Lists the stored entries of `archive` that [`align`] would move.
pub fn verify_alignment(
    archive: impl AsRef<Path>,
    word_size: u32,
    page_size: u32,
) -> Result<Vec<Misaligned>, AlignError> {
    let data = fs::read(archive.as_ref())?;
    verify_alignment_bytes(&data, word_size, page_size)
}

pub fn verify_alignment_bytes(
    data: &[u8],
    word_size: u32,
    page_size: u32,
) -> Result<Vec<Misaligned>, AlignError> {
    check_boundary(word_size)?;
    check_boundary(page_size)?;
    let layout = Layout::parse(data)?;
    let mut misaligned = Vec::new();
    for entry in &layout.entries {
        let Some(boundary) = entry.required_alignment(word_size, page_size) else {
            continue;
        };
        let start = entry.local_offset as usize;
        let local = LocalHeader::parse(data, start, layout.cd_offset)?;
        let data_offset = (start + LOCAL_HEADER_LEN + local.name_len + local.extra_len) as u64;
        if data_offset % u64::from(boundary) != 0 {
            misaligned.push(Misaligned {
                name: entry.name.clone(),
                data_offset,
                required: boundary,
            });
        }
    }
    Ok(misaligned)
}

fn check_boundary(size: u32) -> Result<(), AlignError> {
    if size == 0 || !size.is_power_of_two() {
        return malformed(format!("alignment {size} is not a power of two"));
    }
    Ok(())
}

fn padding_for(offset: usize, boundary: u32) -> usize {
    let boundary = boundary as usize;
    (boundary - offset % boundary) % boundary
}

fn to_u32(value: usize, what: &str) -> Result<u32, AlignError> {
    u32::try_from(value).map_err(|_| AlignError::Malformed(format!("{what} exceeds 4 GiB")))
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, AlignError> {
    match data.get(at..at + 2) {
        Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
        None => malformed(format!("truncated field at offset {at}")),
    }
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, AlignError> {
    match data.get(at..at + 4) {
        Some(bytes) => Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => malformed(format!("truncated field at offset {at}")),
    }
}

struct CentralEntry {
    index: usize,
    name: String,
    method: u16,
    local_offset: u32,
    record_start: usize,
    record_end: usize,
}

impl CentralEntry {
    fn required_alignment(&self, word_size: u32, page_size: u32) -> Option<u32> {
        if self.method != 0 {
            return None;
        }
        if self.name.ends_with(".so") {
            Some(page_size)
        } else {
            Some(word_size)
        }
    }
}

struct Layout {
    entries: Vec<CentralEntry>,
    cd_offset: usize,
    cd_size: usize,
    eocd_pos: usize,
}

impl Layout {
    fn parse(data: &[u8]) -> Result<Self, AlignError> {
        let eocd_pos = find_end_of_central_directory(data)?;
        let total = read_u16(data, eocd_pos + 10)? as usize;
        let cd_size = read_u32(data, eocd_pos + 12)? as usize;
        let cd_offset = read_u32(data, eocd_pos + 16)? as usize;
        if cd_offset + cd_size > eocd_pos {
            return malformed("central directory overlaps the end record");
        }

        let mut entries = Vec::with_capacity(total);
        let mut cursor = cd_offset;
        for index in 0..total {
            if read_u32(data, cursor)? != CENTRAL_HEADER_SIGNATURE {
                return malformed(format!("no central directory entry at offset {cursor}"));
            }
            let method = read_u16(data, cursor + 10)?;
            let name_len = read_u16(data, cursor + 28)? as usize;
            let extra_len = read_u16(data, cursor + 30)? as usize;
            let comment_len = read_u16(data, cursor + 32)? as usize;
            let local_offset = read_u32(data, cursor + 42)?;
            let name_start = cursor + CENTRAL_HEADER_LEN;
            let record_end = name_start + name_len + extra_len + comment_len;
            if record_end > cd_offset + cd_size {
                return malformed(format!("central directory entry {index} is truncated"));
            }
            if local_offset as usize >= cd_offset {
                return malformed(format!("entry {index} points past the central directory"));
            }
            let name = String::from_utf8_lossy(&data[name_start..name_start + name_len]).into_owned();
            entries.push(CentralEntry {
                index,
                name,
                method,
                local_offset,
                record_start: cursor,
                record_end,
            });
            cursor = record_end;
        }

        let mut offsets: Vec<u32> = entries.iter().map(|entry| entry.local_offset).collect();
        offsets.sort_unstable();
        if offsets.windows(2).any(|pair| pair[0] == pair[1]) {
            return malformed("two entries share a local header");
        }

        Ok(Layout {
            entries,
            cd_offset,
            cd_size,
            eocd_pos,
        })
    }
}

fn find_end_of_central_directory(data: &[u8]) -> Result<usize, AlignError> {
    if data.len() < END_OF_CENTRAL_DIRECTORY_LEN {
        return malformed("archive is too short");
    }
    let last = data.len() - END_OF_CENTRAL_DIRECTORY_LEN;
    let first = last.saturating_sub(MAX_COMMENT_LEN);
    (first..=last)
        .rev()
        .find(|&pos| data[pos..pos + 4] == END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes())
        .ok_or_else(|| AlignError::Malformed("no end of central directory record".to_string()))
}

struct LocalHeader {
    name_len: usize,
    extra_len: usize,
}

impl LocalHeader {
    fn parse(data: &[u8], start: usize, limit: usize) -> Result<Self, AlignError> {
        if read_u32(data, start)? != LOCAL_HEADER_SIGNATURE {
            return malformed(format!("no local header at offset {start}"));
        }
        let name_len = read_u16(data, start + 26)? as usize;
        let extra_len = read_u16(data, start + 28)? as usize;
        if start + LOCAL_HEADER_LEN + name_len + extra_len > limit {
            return malformed(format!("local header at offset {start} overruns its entry"));
        }
        Ok(LocalHeader {
            name_len,
            extra_len,
        })
    }
}
