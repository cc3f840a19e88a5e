//! Crash recovery (§4.6): replay every segment from the oldest to the newest,
//! keeping only transaction groups that reached their committed trailer, and
//! report how far into the active segment replay could trust.

use log::warn;

use crate::error::Result;
use crate::location::Location;
use crate::log_manager::LogManager;
use crate::op::{Maps, StagedOp};
use crate::record::Record;

/// Replay the whole log into fresh in-memory state, returning it alongside the
/// highest `tx_id` observed (used to seed the live transaction counter so new
/// transactions never reuse an id). Also truncates the active segment down to
/// its last known-good byte via `log.truncate_active_to`.
pub(crate) fn scan(log: &mut LogManager, cache_values: bool) -> Result<(Maps, u64)> {
    let mut maps = Maps::new();
    let mut max_tx_id: u64 = 0;
    let active_id = log.active_id();
    let mut active_valid_len: u64 = 0;

    let ids: Vec<u64> = log.segment_ids().collect();
    for id in ids {
        let bytes_len;
        let mut offset: u64 = 0;
        let mut pending: Vec<(Record, Location)> = Vec::new();
        let mut safe_offset: u64 = 0;
        {
            let seg = log.segment(id).expect("segment listed but missing from manager");
            let bytes = seg.live_bytes();
            bytes_len = bytes.len() as u64;
            loop {
                if offset >= bytes_len {
                    break;
                }
                match Record::decode(&bytes[offset as usize..]) {
                    Ok(rec) => {
                        let length = rec.encoded_len() as u32;
                        let loc = Location {
                            segment_id: id,
                            offset,
                            length,
                        };
                        max_tx_id = max_tx_id.max(rec.tx_id);
                        let committed = rec.committed;
                        pending.push((rec, loc));
                        offset += length as u64;
                        if committed {
                            for (r, l) in pending.drain(..) {
                                let op = StagedOp::from_record(&r)?;
                                op.apply(&mut maps, l, r.timestamp, cache_values);
                            }
                            safe_offset = offset;
                        }
                    }
                    Err(_) => {
                        warn!("segment {} unreadable past offset {}, treating as torn tail", id, offset);
                        break;
                    }
                }
            }
        }
        if !pending.is_empty() {
            warn!(
                "segment {} has {} record(s) from an uncommitted transaction, discarding",
                id,
                pending.len()
            );
        }
        if id == active_id {
            active_valid_len = safe_offset;
        } else if safe_offset != bytes_len {
            warn!(
                "sealed segment {} has trailing bytes past its last committed record",
                id
            );
        }
    }

    log.truncate_active_to(active_valid_len)?;
    Ok((maps, max_tx_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataStructure, Flag};
    use tempfile::tempdir;

    fn put(tx_id: u64, key: &[u8], value: &[u8], committed: bool) -> Record {
        Record {
            bucket: b"b".to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp: 1,
            tx_id,
            ttl: 0,
            flag: Flag::Put as u16,
            ds: DataStructure::Kv as u16,
            committed,
        }
    }

    #[test]
    fn replays_only_committed_groups() {
        let dir = tempdir().unwrap();
        {
            let mut log = LogManager::open(dir.path(), 1 << 20, true).unwrap();
            log.append(&put(1, b"k1", b"v1", true).encode()).unwrap();
            log.fsync_active().unwrap();
        }
        let mut log = LogManager::open(dir.path(), 1 << 20, true).unwrap();
        let (maps, max_tx_id) = scan(&mut log, true).unwrap();
        assert_eq!(max_tx_id, 1);
        let entry = maps.kv.get(b"b".as_slice()).unwrap().get(b"k1").unwrap();
        assert_eq!(entry.cached_value.as_deref(), Some(b"v1".as_slice()));
    }

    #[test]
    fn discards_a_torn_uncommitted_tail() {
        let dir = tempdir().unwrap();
        {
            let mut log = LogManager::open(dir.path(), 1 << 20, true).unwrap();
            log.append(&put(1, b"k1", b"v1", true).encode()).unwrap();
            // Simulate a crash mid transaction: a well-formed record with no trailer.
            log.append(&put(2, b"k2", b"v2", false).encode()).unwrap();
            log.fsync_active().unwrap();
        }
        let mut log = LogManager::open(dir.path(), 1 << 20, true).unwrap();
        let (maps, max_tx_id) = scan(&mut log, true).unwrap();
        assert_eq!(max_tx_id, 2, "tx_id counter must not be reused even for a discarded group");
        assert!(maps.kv.get(b"b".as_slice()).unwrap().get(b"k2").is_none());
        assert!(maps.kv.get(b"b".as_slice()).unwrap().get(b"k1").is_some());
    }
}
