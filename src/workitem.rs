//! Copy-work descriptor codec for the work-stealing queue.
//!
//! Items travel through the queue as delimited strings bounded by
//! [`MAX_ITEM_LEN`]. The operand length field removes ambiguity when the
//! operand path itself contains the delimiter. A parse failure means the
//! queue is corrupt and is fatal to the operation.

use std::path::PathBuf;

use crate::error::ArchiveError;

/// Maximum encoded size of one queue item.
pub const MAX_ITEM_LEN: usize = 4096;

/// Operation to perform. Currently a singleton; the codec carries the code
/// so new operations can be added without changing the wire shape.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    CopyData = 0,
}

/// One unit of data-copy work: a single chunk of a source file destined for
/// a known byte range of the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// Size of the source file in bytes.
    pub file_size: u64,
    /// Which chunk of the file this item covers.
    pub chunk_index: u64,
    /// Archive offset of the start of the file's data region.
    pub data_offset: u64,
    pub code: OpCode,
    /// Full path to the source file.
    pub path: PathBuf,
}

impl WorkItem {
    /// Encode as `fsize:chunk:offset:code:len:path`.
    pub fn encode(&self) -> Result<String, ArchiveError> {
        let path = self.path.to_string_lossy();
        let out = format!(
            "{}:{}:{}:{}:{}:{}",
            self.file_size,
            self.chunk_index,
            self.data_offset,
            self.code as u32,
            path.len(),
            path
        );
        if out.len() > MAX_ITEM_LEN {
            return Err(ArchiveError::WorkItem(format!(
                "encoded item of {} bytes exceeds queue limit",
                out.len()
            )));
        }
        Ok(out)
    }

    pub fn decode(s: &str) -> Result<Self, ArchiveError> {
        let bad = |what: &str| ArchiveError::WorkItem(format!("could not decode {}: '{}'", what, s));

        let mut parts = s.splitn(6, ':');
        let file_size: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("file size"))?;
        let chunk_index: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("chunk index"))?;
        let data_offset: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("archive offset"))?;
        let code: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("operation code"))?;
        let len: usize = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("operand length"))?;
        let operand = parts.next().ok_or_else(|| bad("operand"))?;
        if operand.len() != len {
            return Err(bad("operand length mismatch"));
        }
        let code = match code {
            0 => OpCode::CopyData,
            _ => return Err(bad("operation code")),
        };
        Ok(WorkItem {
            file_size,
            chunk_index,
            data_offset,
            code,
            path: PathBuf::from(operand),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let item = WorkItem {
            file_size: 123_456,
            chunk_index: 7,
            data_offset: 98_304,
            code: OpCode::CopyData,
            path: PathBuf::from("/data/set1/big.bin"),
        };
        let s = item.encode().unwrap();
        assert_eq!(WorkItem::decode(&s).unwrap(), item);
    }

    #[test]
    fn path_containing_delimiter() {
        let item = WorkItem {
            file_size: 1,
            chunk_index: 0,
            data_offset: 512,
            code: OpCode::CopyData,
            path: PathBuf::from("/odd:name/with:colons"),
        };
        let s = item.encode().unwrap();
        assert_eq!(WorkItem::decode(&s).unwrap().path, item.path);
    }

    #[test]
    fn corrupt_items_are_rejected() {
        assert!(WorkItem::decode("not a work item").is_err());
        assert!(WorkItem::decode("1:2:3:0:99:short").is_err());
        assert!(WorkItem::decode("1:2:3:9:4:path").is_err());
    }

    #[test]
    fn oversized_item_is_rejected() {
        let item = WorkItem {
            file_size: 1,
            chunk_index: 0,
            data_offset: 0,
            code: OpCode::CopyData,
            path: PathBuf::from("/".to_string() + &"x".repeat(MAX_ITEM_LEN)),
        };
        assert!(item.encode().is_err());
    }
}
