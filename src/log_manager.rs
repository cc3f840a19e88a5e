//! Owns the ordered collection of segments, active-segment rotation, and the
//! fsync policy (§4.2). Recovery (§4.6) drives the initial scan; everything
//! after `open` only appends to the active segment or retires sealed ones
//! during merge.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::location::Location;
use crate::record::Record;
use crate::segment::Segment;

pub struct LogManager {
    dir: PathBuf,
    segment_size: u64,
    sync_enable: bool,
    segments: BTreeMap<u64, Segment>,
    active_id: u64,
}

fn list_segment_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".dat") {
            if let Ok(id) = stem.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

impl LogManager {
    /// Open every segment file found in `dir` (sealed, read-only, except the
    /// last which is reopened for append) without yet trusting its contents;
    /// `recovery::scan` walks the returned manager to validate records and
    /// fix up the active segment's true write offset.
    pub fn open(dir: &Path, segment_size: u64, sync_enable: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let ids = list_segment_ids(dir)?;
        let mut segments = BTreeMap::new();

        if ids.is_empty() {
            let seg = Segment::create_active(dir, 0, segment_size)?;
            segments.insert(0, seg);
            return Ok(Self {
                dir: dir.to_path_buf(),
                segment_size,
                sync_enable,
                segments,
                active_id: 0,
            });
        }

        let last_id = *ids.last().unwrap();
        for &id in &ids {
            if id == last_id {
                // Tentatively reopen as active with its on-disk length; recovery
                // will shrink `write_offset` down to the last valid record boundary.
                let len = std::fs::metadata(dir.join(format!("{:020}.dat", id)))?.len();
                let seg = Segment::reopen_active(dir, id, segment_size, len)?;
                segments.insert(id, seg);
            } else {
                let seg = Segment::open_sealed(dir, id)?;
                segments.insert(id, seg);
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            sync_enable,
            segments,
            active_id: last_id,
        })
    }

    /// Start a brand new segment chain at `start_id`, ignoring whatever else
    /// lives in `dir`. Used by merge to write a compacted chain alongside the
    /// segments it is about to replace.
    pub fn create_fresh(dir: &Path, start_id: u64, segment_size: u64, sync_enable: bool) -> Result<Self> {
        let seg = Segment::create_active(dir, start_id, segment_size)?;
        let mut segments = BTreeMap::new();
        segments.insert(start_id, seg);
        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            sync_enable,
            segments,
            active_id: start_id,
        })
    }

    /// Tear down this manager, handing back its segments and active id so they
    /// can be spliced into another manager via `replace_segments`.
    pub fn into_parts(self) -> (Vec<Segment>, u64) {
        (self.segments.into_values().collect(), self.active_id)
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.segments.keys().copied()
    }

    pub fn active_id(&self) -> u64 {
        self.active_id
    }

    /// Truncate the active segment's recognized write offset down to `valid_len`,
    /// discarding whatever garbage trails a crash mid-write. Called once by
    /// recovery right after `open`.
    pub fn truncate_active_to(&mut self, valid_len: u64) -> Result<()> {
        let dir = self.dir.clone();
        let segment_size = self.segment_size;
        let id = self.active_id;
        self.segments.remove(&id);
        let seg = Segment::reopen_active(&dir, id, segment_size, valid_len)?;
        self.segments.insert(id, seg);
        Ok(())
    }

    fn active(&mut self) -> &mut Segment {
        self.segments.get_mut(&self.active_id).expect("active segment missing")
    }

    pub fn segment(&self, id: u64) -> Option<&Segment> {
        self.segments.get(&id)
    }

    /// Append a single already-encoded record to the active segment, rotating
    /// first if it would not fit. A record that cannot fit even a freshly
    /// rotated (empty) segment is a hard `ValueTooLarge` per the design note in
    /// §9 (no record may exceed `SegmentSize`).
    pub fn append(&mut self, bytes: &[u8]) -> Result<Location> {
        let len = bytes.len() as u64;
        if len > self.segment_size {
            return Err(Error::ValueTooLarge);
        }
        if !self.active().fit(len) {
            self.rotate()?;
        }
        let id = self.active_id;
        let offset = self.active().append(bytes)?;
        Ok(Location {
            segment_id: id,
            offset,
            length: bytes.len() as u32,
        })
    }

    /// Append every record of a transaction group as a single atomic batch: if
    /// the whole group does not fit the active segment it rotates first so no
    /// transaction's records ever straddle a segment boundary (§9 open question).
    pub fn append_group(&mut self, encoded: &[Vec<u8>]) -> Result<Vec<Location>> {
        let total: u64 = encoded.iter().map(|b| b.len() as u64).sum();
        if total > self.segment_size {
            return Err(Error::ValueTooLarge);
        }
        if !self.active().fit(total) {
            self.rotate()?;
        }
        encoded.iter().map(|b| self.append(b)).collect()
    }

    pub fn fsync_active(&self) -> Result<()> {
        if self.sync_enable {
            self.segments[&self.active_id].sync()?;
        }
        Ok(())
    }

    pub fn rotate(&mut self) -> Result<()> {
        let old_id = self.active_id;
        let old = self.segments.remove(&old_id).expect("active segment missing");
        let sealed = old.seal()?;
        self.segments.insert(old_id, sealed);

        let new_id = old_id + 1;
        let fresh = Segment::create_active(&self.dir, new_id, self.segment_size)?;
        self.segments.insert(new_id, fresh);
        self.active_id = new_id;
        debug!("rotated log: segment {} sealed, segment {} active", old_id, new_id);
        Ok(())
    }

    pub fn read(&self, location: &Location) -> Result<Record> {
        let seg = self
            .segments
            .get(&location.segment_id)
            .ok_or(Error::OutOfRange)?;
        let bytes = seg.read_at(location.offset, location.length)?;
        Record::decode(bytes)
    }

    /// Replace the whole segment set with a freshly merged chain (merge, §4.7).
    /// `new_segments` must be sealed except for the last, which becomes active.
    pub fn replace_segments(&mut self, new_segments: Vec<Segment>, new_active_id: u64) -> Result<()> {
        let old = std::mem::take(&mut self.segments);
        for seg in new_segments {
            self.segments.insert(seg.id, seg);
        }
        self.active_id = new_active_id;
        for (_, seg) in old {
            seg.unlink()?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataStructure, Flag};
    use tempfile::tempdir;

    fn rec(tx_id: u64, key: &[u8], committed: bool) -> Record {
        Record {
            bucket: b"b".to_vec(),
            key: key.to_vec(),
            value: b"v".to_vec(),
            timestamp: 1,
            tx_id,
            ttl: 0,
            flag: Flag::Put as u16,
            ds: DataStructure::Kv as u16,
            committed,
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut mgr = LogManager::open(dir.path(), 4096, true).unwrap();
        let r = rec(1, b"k", true);
        let loc = mgr.append(&r.encode()).unwrap();
        let back = mgr.read(&loc).unwrap();
        assert_eq!(back.key, b"k");
    }

    #[test]
    fn rotates_when_segment_is_full() {
        let dir = tempdir().unwrap();
        let r = rec(1, b"k", true).encode();
        let cap = (r.len() as u64) + 10;
        let mut mgr = LogManager::open(dir.path(), cap, true).unwrap();
        mgr.append(&r).unwrap();
        assert_eq!(mgr.active_id(), 0);
        mgr.append(&r).unwrap();
        assert_eq!(mgr.active_id(), 1, "second record should not fit alongside the first");
    }

    #[test]
    fn oversized_record_is_rejected() {
        let dir = tempdir().unwrap();
        let mut mgr = LogManager::open(dir.path(), 8, true).unwrap();
        let r = rec(1, b"k", true).encode();
        assert!(matches!(mgr.append(&r), Err(Error::ValueTooLarge)));
    }
}
