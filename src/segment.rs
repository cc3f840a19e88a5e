//! A single append-only log file, named `<id>.dat`, memory-mapped for reads.
//!
//! While active a segment is preallocated to `SegmentSize` and appended to through a
//! mutable mapping. Rotation seals it: the file is truncated down to the bytes
//! actually written and remapped read-only, matching §4.2 ("closes append handle,
//! keeps mmap read handle").

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:020}.dat", id))
}

enum Backing {
    Active { mmap: MmapMut, write_offset: u64 },
    /// `None` for an empty segment — `Mmap::map` rejects zero-length files.
    Sealed { mmap: Option<Mmap> },
}

pub struct Segment {
    pub id: u64,
    path: PathBuf,
    max_size: u64,
    backing: Backing,
}

impl Segment {
    /// Create a brand new active segment, preallocated to `max_size`.
    pub fn create_active(dir: &Path, id: u64, max_size: u64) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(max_size)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            id,
            path,
            max_size,
            backing: Backing::Active {
                mmap,
                write_offset: 0,
            },
        })
    }

    /// Reopen an existing file as the active segment, e.g. after recovery decided
    /// how many of its bytes are valid. Extends the file back to `max_size` so
    /// further appends have room.
    pub fn reopen_active(dir: &Path, id: u64, max_size: u64, valid_len: u64) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(max_size)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            id,
            path,
            max_size,
            backing: Backing::Active {
                mmap,
                write_offset: valid_len,
            },
        })
    }

    /// Open a previously sealed segment read-only, mapping exactly its live bytes.
    pub fn open_sealed(dir: &Path, id: u64) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new().read(true).open(&path)?;
        let len = file.metadata()?.len();
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self {
            id,
            path,
            max_size: len,
            backing: Backing::Sealed { mmap },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        matches!(self.backing, Backing::Active { .. })
    }

    /// Bytes written so far (active) or total live bytes (sealed).
    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::Active { write_offset, .. } => *write_offset,
            Backing::Sealed { mmap } => mmap.as_ref().map_or(0, |m| m.len() as u64),
        }
    }

    pub fn fit(&self, size: u64) -> bool {
        match &self.backing {
            Backing::Active { write_offset, .. } => self.max_size - write_offset >= size,
            Backing::Sealed { .. } => false,
        }
    }

    /// Append raw bytes, returning the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        match &mut self.backing {
            Backing::Active { mmap, write_offset } => {
                let len = bytes.len() as u64;
                if self.max_size - *write_offset < len {
                    return Err(Error::ValueTooLarge);
                }
                let start = *write_offset as usize;
                let end = start + bytes.len();
                mmap[start..end].copy_from_slice(bytes);
                *write_offset = end as u64;
                Ok(start as u64)
            }
            Backing::Sealed { .. } => Err(Error::Io(std::io::Error::other(
                "cannot append to a sealed segment",
            ))),
        }
    }

    /// Flush the active mapping to stable storage (fdatasync-equivalent).
    pub fn sync(&self) -> Result<()> {
        if let Backing::Active { mmap, .. } = &self.backing {
            mmap.flush()?;
        }
        Ok(())
    }

    /// Read `length` bytes at `offset`. `OutOfRange` if that would read past the
    /// segment's live data (invariant 5: a truncated tail is treated as nonexistent).
    pub fn read_at(&self, offset: u64, length: u32) -> Result<&[u8]> {
        let end = offset
            .checked_add(length as u64)
            .ok_or(Error::OutOfRange)?;
        if end > self.len() {
            return Err(Error::OutOfRange);
        }
        let start = offset as usize;
        let end = end as usize;
        Ok(match &self.backing {
            Backing::Active { mmap, .. } => &mmap[start..end],
            Backing::Sealed { mmap } => &mmap.as_ref().expect("non-empty range on empty segment")[start..end],
        })
    }

    /// Read the raw bytes of the whole live region, for recovery scans and merge.
    pub fn live_bytes(&self) -> &[u8] {
        let len = self.len() as usize;
        match &self.backing {
            Backing::Active { mmap, .. } => &mmap[..len],
            Backing::Sealed { mmap } => mmap.as_ref().map_or(&[], |m| &m[..len]),
        }
    }

    /// Seal an active segment: truncate the file down to its live length, flush,
    /// and remap it read-only.
    pub fn seal(self) -> Result<Segment> {
        let (write_offset,) = match &self.backing {
            Backing::Active { write_offset, .. } => (*write_offset,),
            Backing::Sealed { .. } => return Ok(self),
        };
        self.sync()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        file.set_len(write_offset)?;
        drop(self.backing);
        let id = self.id;
        let path = self.path;
        drop(file);
        if write_offset == 0 {
            return Ok(Segment {
                id,
                path,
                max_size: 0,
                backing: Backing::Sealed { mmap: None },
            });
        }
        let file = OpenOptions::new().read(true).open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Segment {
            id,
            path,
            max_size: write_offset,
            backing: Backing::Sealed { mmap: Some(mmap) },
        })
    }

    /// Remove this segment's file from disk. Used by merge to retire old generations.
    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create_active(dir.path(), 0, 1024).unwrap();
        let off_a = seg.append(b"hello").unwrap();
        let off_b = seg.append(b"world!").unwrap();
        assert_eq!(seg.read_at(off_a, 5).unwrap(), b"hello");
        assert_eq!(seg.read_at(off_b, 6).unwrap(), b"world!");
    }

    #[test]
    fn fit_respects_cap() {
        let dir = tempdir().unwrap();
        let seg = Segment::create_active(dir.path(), 0, 10).unwrap();
        assert!(seg.fit(10));
        assert!(!seg.fit(11));
    }

    #[test]
    fn out_of_range_read_is_rejected() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create_active(dir.path(), 0, 1024).unwrap();
        seg.append(b"hi").unwrap();
        assert!(matches!(seg.read_at(0, 100), Err(Error::OutOfRange)));
    }

    #[test]
    fn seal_truncates_to_live_length() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create_active(dir.path(), 0, 1024).unwrap();
        seg.append(b"abcdef").unwrap();
        let sealed = seg.seal().unwrap();
        assert_eq!(sealed.len(), 6);
        assert_eq!(
            std::fs::metadata(sealed.path()).unwrap().len(),
            6,
            "sealed file should be truncated to its live bytes"
        );
    }

    #[test]
    fn reopen_active_after_recovery_continues_appending() {
        let dir = tempdir().unwrap();
        {
            let mut seg = Segment::create_active(dir.path(), 3, 1024).unwrap();
            seg.append(b"partial-write").unwrap();
            seg.sync().unwrap();
        }
        let mut reopened = Segment::reopen_active(dir.path(), 3, 1024, 13).unwrap();
        assert_eq!(reopened.read_at(0, 13).unwrap(), b"partial-write");
        let off = reopened.append(b"more").unwrap();
        assert_eq!(off, 13);
    }
}
