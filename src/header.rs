//! Pax header encoding.
//!
//! A single function, [`encode_header`], produces the complete encoded
//! header for an entry: an optional pax extended-header block (with its
//! records padded out to 512 bytes) followed by the ustar header block. The
//! layout planner sizes entries from its output and the write phase writes
//! the same bytes verbatim, so the sizes used to compute offsets can never
//! disagree with what lands in the archive.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tar::{EntryType, Header};

use crate::error::ArchiveError;
use crate::flist::{Entry, EntryKind};
use crate::options::ArchiveOpts;

/// Tar block granularity. Every encoded header is a multiple of this.
pub const BLOCK_SIZE: u64 = 512;

/// Upper bound on a single encoded header. Preserve mode can pull very
/// large extended attribute sets into the pax records; anything beyond this
/// cap is rejected as an encoding error.
pub const HEADER_CAP: usize = 128 * 1024 * 1024;

/// Largest file size representable in the 12-byte octal ustar size field.
const USTAR_MAX_SIZE: u64 = 0o777_7777_7777;

/// Longest symlink target we will encode.
const TARGET_MAX: usize = 4096;

/// Round `n` up to the next multiple of 512.
pub fn pad512(n: u64) -> u64 {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Encode the full header for `entry`, returning the bytes to be written at
/// the entry's archive offset. The returned length is always a multiple of
/// 512 and never exceeds [`HEADER_CAP`].
pub fn encode_header(entry: &Entry, opts: &ArchiveOpts) -> Result<Vec<u8>, ArchiveError> {
    let mut name = entry.rel_path.as_os_str().as_bytes().to_vec();
    if entry.kind == EntryKind::Dir && !name.ends_with(b"/") {
        name.push(b'/');
    }

    let mut records: Vec<(String, Vec<u8>)> = Vec::new();
    if name.len() > 100 {
        records.push(("path".to_string(), name.clone()));
    }

    let link = match &entry.link_target {
        Some(target) => {
            let bytes = target.as_os_str().as_bytes();
            if bytes.len() > TARGET_MAX {
                return Err(ArchiveError::Encode {
                    path: entry.path.clone(),
                    reason: format!("symlink target exceeds {} bytes", TARGET_MAX),
                });
            }
            if bytes.len() > 100 {
                records.push(("linkpath".to_string(), bytes.to_vec()));
            }
            bytes.to_vec()
        }
        None => Vec::new(),
    };

    if entry.size > USTAR_MAX_SIZE {
        records.push(("size".to_string(), entry.size.to_string().into_bytes()));
    }
    if entry.uname.len() > 31 {
        records.push(("uname".to_string(), entry.uname.clone().into_bytes()));
    }
    if entry.gname.len() > 31 {
        records.push(("gname".to_string(), entry.gname.clone().into_bytes()));
    }
    if opts.preserve && matches!(entry.kind, EntryKind::File | EntryKind::Dir) {
        records.extend(xattr_records(&entry.path)?);
    }

    let mut header = Header::new_ustar();
    header.set_entry_type(match entry.kind {
        EntryKind::File => EntryType::Regular,
        EntryKind::Dir => EntryType::Directory,
        EntryKind::Symlink => EntryType::Symlink,
        EntryKind::Other => {
            return Err(ArchiveError::Encode {
                path: entry.path.clone(),
                reason: "unsupported entry kind".to_string(),
            })
        }
    });
    header.set_mode(entry.mode);
    header.set_uid(entry.uid);
    header.set_gid(entry.gid);
    header.set_mtime(entry.mtime.max(0) as u64);
    header.set_size(entry.size.min(USTAR_MAX_SIZE));
    set_name_field(&mut header, &name);
    if !link.is_empty() {
        set_link_field(&mut header, &link);
    }
    let _ = header.set_username(truncated_str(&entry.uname, 31));
    let _ = header.set_groupname(truncated_str(&entry.gname, 31));
    header.set_cksum();

    let mut out = Vec::with_capacity(BLOCK_SIZE as usize * 2);
    if !records.is_empty() {
        let body = pax_body(&records);
        let mut pax = Header::new_ustar();
        pax.set_entry_type(EntryType::XHeader);
        pax.set_mode(0o644);
        pax.set_mtime(entry.mtime.max(0) as u64);
        pax.set_size(body.len() as u64);
        set_name_field(&mut pax, &pax_block_name(&name));
        pax.set_cksum();
        out.extend_from_slice(pax.as_bytes());
        out.extend_from_slice(&body);
        out.resize(pad512(out.len() as u64) as usize, 0);
    }
    out.extend_from_slice(header.as_bytes());

    if out.len() > HEADER_CAP {
        return Err(ArchiveError::Encode {
            path: entry.path.clone(),
            reason: format!("encoded header of {} bytes exceeds buffer cap", out.len()),
        });
    }
    Ok(out)
}

/// Store raw name bytes, truncated to the 100-byte ustar field. Long names
/// carry a pax `path` record that overrides this field on read.
fn set_name_field(header: &mut Header, name: &[u8]) {
    if let Some(ustar) = header.as_ustar_mut() {
        let n = name.len().min(100);
        ustar.name[..n].copy_from_slice(&name[..n]);
    }
}

fn set_link_field(header: &mut Header, link: &[u8]) {
    if let Some(ustar) = header.as_ustar_mut() {
        let n = link.len().min(100);
        ustar.linkname[..n].copy_from_slice(&link[..n]);
    }
}

fn truncated_str(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Conventional name for the extended-header block itself.
fn pax_block_name(name: &[u8]) -> Vec<u8> {
    let mut out = b"PaxHeaders.0/".to_vec();
    out.extend_from_slice(name);
    out.truncate(100);
    out
}

/// Serialize pax records as `"%d key=value\n"` where the leading decimal is
/// the total record length including itself.
fn pax_body(records: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, value) in records {
        let base = key.len() + value.len() + 3;
        let mut len = base;
        loop {
            let total = base + decimal_digits(len);
            if total == len {
                break;
            }
            len = total;
        }
        body.extend_from_slice(len.to_string().as_bytes());
        body.push(b' ');
        body.extend_from_slice(key.as_bytes());
        body.push(b'=');
        body.extend_from_slice(value);
        body.push(b'\n');
    }
    body
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

fn xattr_records(path: &Path) -> Result<Vec<(String, Vec<u8>)>, ArchiveError> {
    let mut records = Vec::new();
    let names = match xattr::list(path) {
        Ok(names) => names,
        // Filesystem without xattr support; nothing to record.
        Err(_) => return Ok(records),
    };
    for name in names {
        if let Ok(Some(value)) = xattr::get(path, &name) {
            let key = format!("SCHILY.xattr.{}", name.to_string_lossy());
            records.push((key, value));
        }
    }
    // Deterministic order so both create backends emit identical headers.
    records.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(rel: &str, kind: EntryKind, size: u64) -> Entry {
        Entry {
            path: PathBuf::from("/src").join(rel),
            rel_path: PathBuf::from(rel),
            kind,
            size,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            uname: "user".to_string(),
            gname: "user".to_string(),
            mtime: 1_700_000_000,
            link_target: None,
        }
    }

    #[test]
    fn short_name_is_one_block() {
        let opts = ArchiveOpts::default();
        let bytes = encode_header(&entry("dir/a", EntryKind::File, 3), &opts).unwrap();
        assert_eq!(bytes.len(), 512);
    }

    #[test]
    fn long_name_gets_pax_blocks() {
        let opts = ArchiveOpts::default();
        let long = "d/".repeat(60) + "leaf.txt";
        let bytes = encode_header(&entry(&long, EntryKind::File, 0), &opts).unwrap();
        // pax header block + one record block + ustar block
        assert_eq!(bytes.len(), 1536);
        assert_eq!(bytes.len() as u64 % BLOCK_SIZE, 0);
        assert_eq!(bytes[156], b'x');
    }

    #[test]
    fn encoded_header_parses_back() {
        let opts = ArchiveOpts::default();
        let long = "nested/".repeat(20) + "file.bin";
        let mut bytes = encode_header(&entry(&long, EntryKind::File, 0), &opts).unwrap();
        // terminate so the reader sees a well-formed archive
        bytes.extend_from_slice(&[0u8; 1024]);
        let mut ar = tar::Archive::new(std::io::Cursor::new(bytes));
        let mut entries = ar.entries().unwrap();
        let first = entries.next().unwrap().unwrap();
        assert_eq!(first.path().unwrap().to_string_lossy(), long);
    }

    #[test]
    fn directory_name_gains_trailing_slash() {
        let opts = ArchiveOpts::default();
        let bytes = encode_header(&entry("dir", EntryKind::Dir, 0), &opts).unwrap();
        assert_eq!(&bytes[..4], b"dir/");
        assert_eq!(bytes[156], b'5');
    }

    #[test]
    fn pax_record_length_is_self_consistent() {
        let body = pax_body(&[("path".to_string(), b"abc".to_vec())]);
        // "12 path=abc\n" is 12 bytes long
        assert_eq!(body, b"12 path=abc\n");
        // a record whose length crosses a digit boundary
        let value = vec![b'x'; 94];
        let body = pax_body(&[("k".to_string(), value)]);
        assert_eq!(body.len(), 101);
        assert!(body.starts_with(b"101 k="));
    }
}
