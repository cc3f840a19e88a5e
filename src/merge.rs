//! Compaction (§4.7): rewrite the live state of every bucket into a fresh
//! segment chain and retire the old generations. Runs "stop the world" — the
//! caller holds the store's single write lock for the whole pass, trading
//! merge-time availability for a much simpler implementation than staging
//! partial batches under a lock that is released and reacquired mid-merge.

use crate::clock::now_nanos;
use crate::core::Core;
use crate::error::Result;
use crate::index::{is_expired, IndexEntry};
use crate::log_manager::LogManager;
use crate::op::StagedOp;
use crate::options::Options;

pub(crate) fn merge(core: &mut Core, opts: &Options) -> Result<()> {
    let next_start = core.log.segment_ids().max().unwrap_or(0) + 1;
    let mut tmp = LogManager::create_fresh(core.log.dir(), next_start, core.log.segment_size(), opts.sync_enable)?;

    // Rewritten kv locations have to be captured and spliced back into the
    // index once the new chain is in place — otherwise every entry still
    // points at a segment the swap below is about to unlink (§4.7 step 4).
    let mut rewritten_kv = Vec::new();
    for (bucket, idx) in core.maps.kv.iter() {
        for (key, entry) in idx.iter() {
            if is_expired(entry.timestamp, entry.ttl, now_nanos() / 1_000_000_000) {
                continue;
            }
            let value = match &entry.cached_value {
                Some(v) => v.clone(),
                None => core.log.read(&entry.location)?.value,
            };
            let op = StagedOp::Put {
                bucket: bucket.clone(),
                key: key.clone(),
                value: value.clone(),
                ttl: entry.ttl,
            };
            let rec = op.to_record(0, entry.timestamp, true);
            let location = tmp.append(&rec.encode())?;
            let cached_value = if entry.cached_value.is_some() { Some(value) } else { None };
            rewritten_kv.push((bucket.clone(), key.clone(), location, entry.timestamp, entry.ttl, cached_value));
        }
    }

    for (bucket, lists) in core.maps.lists.iter() {
        for (key, list) in lists.iter() {
            for value in list.lrange(0, -1) {
                let op = StagedOp::RPush {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    value,
                };
                let rec = op.to_record(0, now_nanos(), true);
                tmp.append(&rec.encode())?;
            }
        }
    }

    for (bucket, sets) in core.maps.sets.iter() {
        for (key, set) in sets.iter() {
            for member in set.members() {
                let op = StagedOp::SAdd {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    value: member,
                };
                let rec = op.to_record(0, now_nanos(), true);
                tmp.append(&rec.encode())?;
            }
        }
    }

    for (bucket, zset) in core.maps.zsets.iter() {
        for (member, score, value) in zset.members() {
            let op = StagedOp::ZAdd {
                bucket: bucket.clone(),
                key: member,
                score,
                value,
            };
            let rec = op.to_record(0, now_nanos(), true);
            tmp.append(&rec.encode())?;
        }
    }

    tmp.fsync_active()?;
    let (segments, new_active_id) = tmp.into_parts();
    let rewritten = segments.len();
    core.log.replace_segments(segments, new_active_id)?;

    for (bucket, key, location, timestamp, ttl, cached_value) in rewritten_kv {
        if let Some(idx) = core.maps.kv.get_mut(&bucket) {
            idx.put(key, IndexEntry { location, timestamp, ttl, cached_value });
        }
    }

    log::debug!(
        "merge complete: live state rewritten into {} segment(s) starting at {}",
        rewritten,
        next_start
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_manager::LogManager;
    use crate::op::Maps;
    use crate::options::EntryIdxMode;
    use tempfile::tempdir;

    #[test]
    fn merge_preserves_live_state_and_shrinks_the_log() {
        let dir = tempdir().unwrap();
        let opts = Options::new(dir.path()).segment_size(256);
        let mut log = LogManager::open(dir.path(), 256, true).unwrap();
        let mut maps = Maps::new();

        for i in 0..20u32 {
            let key = format!("k{}", i).into_bytes();
            let op = StagedOp::Put {
                bucket: b"b".to_vec(),
                key: key.clone(),
                value: b"v".to_vec(),
                ttl: 0,
            };
            let rec = op.to_record(1, now_nanos(), true);
            let loc = log.append(&rec.encode()).unwrap();
            op.apply(&mut maps, loc, rec.timestamp, true);
        }
        log.fsync_active().unwrap();
        let segments_before = log.segment_ids().count();

        let mut core = Core { log, maps };
        merge(&mut core, &opts).unwrap();

        assert!(core.maps.kv.get(b"b".as_slice()).unwrap().get(b"k5").is_some());
        assert!(core.log.segment_ids().count() <= segments_before);
        let _ = EntryIdxMode::RamCache;
    }

    #[test]
    fn merge_repoints_mmap_mode_locations_into_the_new_chain() {
        let dir = tempdir().unwrap();
        let opts = Options::new(dir.path()).segment_size(256).entry_idx_mode(EntryIdxMode::Mmap);
        let mut log = LogManager::open(dir.path(), 256, true).unwrap();
        let mut maps = Maps::new();

        for i in 0..20u32 {
            let key = format!("k{}", i).into_bytes();
            let op = StagedOp::Put {
                bucket: b"b".to_vec(),
                key: key.clone(),
                value: b"v".to_vec(),
                ttl: 0,
            };
            let rec = op.to_record(1, now_nanos(), true);
            let loc = log.append(&rec.encode()).unwrap();
            // cache_value = false: mirrors `EntryIdxMode::Mmap`, where the index
            // holds only a location and every read goes through the log.
            op.apply(&mut maps, loc, rec.timestamp, false);
        }
        log.fsync_active().unwrap();

        let mut core = Core { log, maps };
        merge(&mut core, &opts).unwrap();

        let entry = core.maps.kv.get(b"b".as_slice()).unwrap().get(b"k5").unwrap();
        assert!(entry.cached_value.is_none());
        let rec = core.log.read(&entry.location).unwrap();
        assert_eq!(rec.value, b"v");
    }
}
