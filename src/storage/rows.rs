//! The append-only, newline-delimited row file: offset-addressed reads,
//! end-of-file appends, and byte-precise compaction on delete.
//!
//! The byte offset of each line's first character is the address that
//! indexes carry. Removing a line shifts every later line down by the
//! removed line's length (terminator included); the matching index
//! offset shift is the caller's responsibility.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, StorageError};
use crate::types::Offset;

/// Current end-of-file offset, where the next appended row will start.
/// A missing row file reads as empty.
pub fn end_offset(path: &Path) -> Result<Offset> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(StorageError::Io(e).into()),
    }
}

/// Append one serialized document as a line, returning the offset of
/// its first character. Creates the row file on first append.
pub fn append_line(path: &Path, line: &str) -> Result<Offset> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(StorageError::Io)?;
    let offset = file.seek(SeekFrom::End(0)).map_err(StorageError::Io)?;
    file.write_all(line.as_bytes()).map_err(StorageError::Io)?;
    file.write_all(b"\n").map_err(StorageError::Io)?;
    Ok(offset)
}

/// Read the line starting at `offset`.
///
/// Returns the line without its terminator, plus the on-disk byte
/// length including it (what compaction must shift by).
pub fn read_line_at(path: &Path, offset: Offset) -> Result<(String, u64)> {
    let file = fs::File::open(path).map_err(StorageError::Io)?;
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(StorageError::Io)?;

    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(StorageError::Io)?;
    if read == 0 {
        return Err(StorageError::NoRowAtOffset(offset).into());
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok((line, read as u64))
}

/// Rewrite the row file without the `len` bytes starting at `offset`,
/// shifting everything after them down.
pub fn remove_line_at(path: &Path, offset: Offset, len: u64) -> Result<()> {
    let bytes = fs::read(path).map_err(StorageError::Io)?;
    let start = offset as usize;
    let end = start + len as usize;
    if end > bytes.len() {
        return Err(StorageError::NoRowAtOffset(offset).into());
    }

    let mut compacted = Vec::with_capacity(bytes.len() - (end - start));
    compacted.extend_from_slice(&bytes[..start]);
    compacted.extend_from_slice(&bytes[end..]);
    fs::write(path, compacted).map_err(StorageError::Io)?;
    Ok(())
}

/// Every `(offset, line)` pair in the row file, in file order. A
/// missing file yields nothing: the table simply has no rows yet.
pub fn scan_lines(path: &Path) -> Result<Vec<(Offset, String)>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::Io(e).into()),
    };

    let mut rows = Vec::new();
    let mut offset: Offset = 0;
    let mut reader = BufReader::new(file);
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(StorageError::Io)?;
        if read == 0 {
            break;
        }
        if line.ends_with('\n') {
            line.pop();
        }
        if !line.is_empty() {
            rows.push((offset, line));
        }
        offset += read as u64;
    }
    Ok(rows)
}
