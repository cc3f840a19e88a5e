//! Read/write transactions (§4.5): a write transaction stages its mutations
//! against a private working copy so it observes its own writes immediately,
//! then frames and appends them as one atomic log group at `commit`. Dropping
//! a transaction without calling `commit` discards any staged work — the same
//! effect as an explicit `rollback`.

use log::debug;

use crate::clock::{now_nanos, now_secs};
use crate::core::Core;
use crate::ds::zset::ScoreRangeOpts;
use crate::error::{Error, Result};
use crate::index::is_expired;
use crate::location::Location;
use crate::op::{Maps, StagedOp};
use crate::Db;

/// Stand-in location for an op that has been applied to the in-transaction
/// working copy but not yet appended to the log; never dereferenced because
/// staged entries always carry a cached value.
const STAGING_LOCATION: Location = Location {
    segment_id: u64::MAX,
    offset: 0,
    length: 0,
};

enum Mode<'db> {
    Read(std::sync::RwLockReadGuard<'db, Core>),
    Write {
        guard: std::sync::RwLockWriteGuard<'db, Core>,
        scratch: Maps,
        staged: Vec<StagedOp>,
        tx_id: u64,
    },
}

pub struct Tx<'db> {
    db: &'db Db,
    mode: Option<Mode<'db>>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new_read(db: &'db Db, guard: std::sync::RwLockReadGuard<'db, Core>) -> Self {
        Self {
            db,
            mode: Some(Mode::Read(guard)),
        }
    }

    pub(crate) fn new_write(
        db: &'db Db,
        guard: std::sync::RwLockWriteGuard<'db, Core>,
        tx_id: u64,
    ) -> Self {
        let scratch = guard.maps.clone();
        Self {
            db,
            mode: Some(Mode::Write {
                guard,
                scratch,
                staged: Vec::new(),
                tx_id,
            }),
        }
    }

    fn maps(&self) -> Result<&Maps> {
        match self.mode.as_ref() {
            None => Err(Error::TxClosed),
            Some(Mode::Read(g)) => Ok(&g.maps),
            Some(Mode::Write { scratch, .. }) => Ok(scratch),
        }
    }

    fn read_value(&self, location: &Location, cached: &Option<Vec<u8>>) -> Result<Vec<u8>> {
        if let Some(v) = cached {
            return Ok(v.clone());
        }
        let log = match self.mode.as_ref() {
            None => return Err(Error::TxClosed),
            Some(Mode::Read(g)) => &g.log,
            Some(Mode::Write { guard, .. }) => &guard.log,
        };
        Ok(log.read(location)?.value)
    }

    fn write_parts(&mut self) -> Result<(&mut Maps, &mut Vec<StagedOp>)> {
        match self.mode.as_mut() {
            None => Err(Error::TxClosed),
            Some(Mode::Read(_)) => Err(Error::TxReadOnly),
            Some(Mode::Write { scratch, staged, .. }) => Ok((scratch, staged)),
        }
    }

    fn stage(&mut self, op: StagedOp) -> Result<()> {
        let (scratch, staged) = self.write_parts()?;
        op.apply(scratch, STAGING_LOCATION, now_nanos(), true);
        staged.push(op);
        Ok(())
    }

    fn check_size(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let cap = self.db.opts.segment_size;
        if key.len() as u64 > cap {
            return Err(Error::KeyTooLarge);
        }
        if value.len() as u64 > cap {
            return Err(Error::ValueTooLarge);
        }
        Ok(())
    }

    /// Commit every staged mutation as one atomic log group, then apply it to
    /// the shared committed state. A transaction with no staged writes (including
    /// every read-only transaction) commits as a no-op.
    pub fn commit(mut self) -> Result<()> {
        let mode = self.mode.take().ok_or(Error::TxClosed)?;
        match mode {
            Mode::Read(_) => Ok(()),
            Mode::Write { mut guard, staged, tx_id, .. } => {
                if staged.is_empty() {
                    return Ok(());
                }
                let n = staged.len();
                let records: Vec<_> = staged
                    .iter()
                    .enumerate()
                    .map(|(i, op)| {
                        let ts = self.db.next_timestamp();
                        op.to_record(tx_id, ts, i == n - 1).encode()
                    })
                    .collect();
                let locations = guard.log.append_group(&records)?;
                if self.db.opts.sync_enable {
                    guard.log.fsync_active()?;
                }
                let cache = self.db.opts.entry_idx_mode == crate::options::EntryIdxMode::RamCache;
                for (op, loc) in staged.iter().zip(locations) {
                    op.apply(&mut guard.maps, loc, now_nanos(), cache);
                }
                debug!("committed tx {} ({} record(s))", tx_id, n);
                Ok(())
            }
        }
    }

    /// Discard every staged mutation. Equivalent to letting the transaction drop.
    pub fn rollback(mut self) -> Result<()> {
        self.mode.take().ok_or(Error::TxClosed)?;
        Ok(())
    }

    // ---- kv (§4.3) ----

    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let maps = self.maps()?;
        let entry = maps
            .kv
            .get(bucket)
            .and_then(|b| b.get(key))
            .ok_or(Error::NotFound)?;
        if is_expired(entry.timestamp, entry.ttl, now_secs()) {
            return Err(Error::Expired);
        }
        self.read_value(&entry.location, &entry.cached_value)
    }

    pub fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8], ttl: u32) -> Result<()> {
        self.check_size(key, value)?;
        self.stage(StagedOp::Put {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
            ttl,
        })
    }

    pub fn delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<()> {
        self.stage(StagedOp::Delete {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
        })
    }

    pub fn prefix_scan(&self, bucket: &[u8], prefix: &[u8], limit: i64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let maps = self.maps()?;
        let Some(b) = maps.kv.get(bucket) else {
            return Ok(Vec::new());
        };
        let now = now_secs();
        let mut out = Vec::new();
        for (k, e) in b.prefix_scan(prefix, limit) {
            if is_expired(e.timestamp, e.ttl, now) {
                continue;
            }
            let v = self.read_value(&e.location, &e.cached_value)?;
            out.push((k, v));
        }
        Ok(out)
    }

    pub fn range_scan(&self, bucket: &[u8], start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let maps = self.maps()?;
        let Some(b) = maps.kv.get(bucket) else {
            return Ok(Vec::new());
        };
        let now = now_secs();
        let mut out = Vec::new();
        for (k, e) in b.range_scan(start, end) {
            if is_expired(e.timestamp, e.ttl, now) {
                continue;
            }
            let v = self.read_value(&e.location, &e.cached_value)?;
            out.push((k, v));
        }
        Ok(out)
    }

    // ---- list (§4.4) ----

    pub fn rpush(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.stage(StagedOp::RPush {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn lpush(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.stage(StagedOp::LPush {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn lpop(&mut self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let (scratch, _) = self.write_parts()?;
        let popped = scratch
            .lists
            .get(bucket)
            .and_then(|m| m.get(key))
            .and_then(|l| l.lpeek().ok().map(|v| v.to_vec()))
            .ok_or(Error::NotFound)?;
        self.stage(StagedOp::LPop {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
        })?;
        Ok(popped)
    }

    pub fn rpop(&mut self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let (scratch, _) = self.write_parts()?;
        let popped = scratch
            .lists
            .get(bucket)
            .and_then(|m| m.get(key))
            .and_then(|l| l.rpeek().ok().map(|v| v.to_vec()))
            .ok_or(Error::NotFound)?;
        self.stage(StagedOp::RPop {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
        })?;
        Ok(popped)
    }

    pub fn lpeek(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        self.maps()?
            .lists
            .get(bucket)
            .and_then(|m| m.get(key))
            .and_then(|l| l.lpeek().ok())
            .map(|v| v.to_vec())
            .ok_or(Error::NotFound)
    }

    pub fn rpeek(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        self.maps()?
            .lists
            .get(bucket)
            .and_then(|m| m.get(key))
            .and_then(|l| l.rpeek().ok())
            .map(|v| v.to_vec())
            .ok_or(Error::NotFound)
    }

    pub fn lrange(&self, bucket: &[u8], key: &[u8], start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .maps()?
            .lists
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|l| l.lrange(start, end))
            .unwrap_or_default())
    }

    pub fn lsize(&self, bucket: &[u8], key: &[u8]) -> Result<usize> {
        Ok(self
            .maps()?
            .lists
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|l| l.len())
            .unwrap_or(0))
    }

    pub fn lrem(&mut self, bucket: &[u8], key: &[u8], count: i64, value: &[u8]) -> Result<usize> {
        let (scratch, _) = self.write_parts()?;
        let removed = scratch
            .lists
            .get(bucket)
            .and_then(|m| m.get(key)).cloned()
            .map(|mut l| l.lrem(count, value))
            .unwrap_or(0);
        self.stage(StagedOp::LRem {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            count,
            value: value.to_vec(),
        })?;
        Ok(removed)
    }

    pub fn lset(&mut self, bucket: &[u8], key: &[u8], index: i64, value: &[u8]) -> Result<()> {
        {
            let (scratch, _) = self.write_parts()?;
            let exists = scratch
                .lists
                .get(bucket)
                .and_then(|m| m.get(key))
                .map(|l| l.lrange(0, -1).len() as i64)
                .map(|len| crate::ds::resolve_index(index, len as usize).is_some())
                .unwrap_or(false);
            if !exists {
                return Err(Error::InvalidArgument(format!("list index {} out of range", index)));
            }
        }
        self.stage(StagedOp::LSet {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            index,
            value: value.to_vec(),
        })
    }

    pub fn ltrim(&mut self, bucket: &[u8], key: &[u8], start: i64, end: i64) -> Result<()> {
        self.stage(StagedOp::LTrim {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            start,
            end,
        })
    }

    // ---- set (§4.4) ----

    pub fn sadd(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<bool> {
        let already = self
            .maps()?
            .sets
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|s| s.is_member(value))
            .unwrap_or(false);
        self.stage(StagedOp::SAdd {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        Ok(!already)
    }

    pub fn srem(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<bool> {
        let present = self
            .maps()?
            .sets
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|s| s.is_member(value))
            .unwrap_or(false);
        self.stage(StagedOp::SRem {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        Ok(present)
    }

    pub fn scard(&self, bucket: &[u8], key: &[u8]) -> Result<usize> {
        Ok(self
            .maps()?
            .sets
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|s| s.card())
            .unwrap_or(0))
    }

    pub fn smembers(&self, bucket: &[u8], key: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .maps()?
            .sets
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|s| s.members())
            .unwrap_or_default())
    }

    pub fn sismember(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<bool> {
        Ok(self
            .maps()?
            .sets
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|s| s.is_member(value))
            .unwrap_or(false))
    }

    pub fn sare_members(&self, bucket: &[u8], key: &[u8], values: &[Vec<u8>]) -> Result<bool> {
        Ok(self
            .maps()?
            .sets
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|s| s.are_members(values))
            .unwrap_or(false))
    }

    pub fn shas_key(&self, bucket: &[u8], key: &[u8]) -> Result<bool> {
        Ok(self
            .maps()?
            .sets
            .get(bucket)
            .and_then(|m| m.get(key))
            .map(|s| !s.is_empty())
            .unwrap_or(false))
    }

    pub fn spop(&mut self, bucket: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let (scratch, _) = self.write_parts()?;
        let picked = scratch
            .sets
            .get(bucket)
            .and_then(|m| m.get(key)).cloned()
            .and_then(|mut s| s.pop())
            .ok_or(Error::NotFound)?;
        self.stage(StagedOp::SPop {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
        })?;
        Ok(picked)
    }

    /// Move `value` from `(src_bucket, src_key)` to `(dst_bucket, dst_key)`; the
    /// two legs may share a bucket (the common case) or differ.
    pub fn smove(
        &mut self,
        src_bucket: &[u8],
        src_key: &[u8],
        dst_bucket: &[u8],
        dst_key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let present = self
            .maps()?
            .sets
            .get(src_bucket)
            .and_then(|m| m.get(src_key))
            .map(|s| s.is_member(value))
            .unwrap_or(false);
        if !present {
            return Err(Error::NotFound);
        }
        self.stage(StagedOp::SMove {
            src_bucket: src_bucket.to_vec(),
            src_key: src_key.to_vec(),
            dst_bucket: dst_bucket.to_vec(),
            dst_key: dst_key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Members of `(bucket, base)` absent from every set named in `others`
    /// (all within the same bucket).
    pub fn sdiff(&self, bucket: &[u8], base: &[u8], others: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        let maps = self.maps()?;
        let Some(b) = maps.sets.get(bucket) else {
            return Ok(Vec::new());
        };
        let Some(base_set) = b.get(base) else {
            return Ok(Vec::new());
        };
        let other_sets: Vec<_> = others.iter().filter_map(|k| b.get(*k)).collect();
        Ok(base_set.diff(&other_sets))
    }

    /// Members of `(base_bucket, base_key)` absent from every `(bucket, key)` pair in `others`.
    pub fn sdiff_across(
        &self,
        base_bucket: &[u8],
        base_key: &[u8],
        others: &[(&[u8], &[u8])],
    ) -> Result<Vec<Vec<u8>>> {
        let maps = self.maps()?;
        let Some(base_set) = maps.sets.get(base_bucket).and_then(|m| m.get(base_key)) else {
            return Ok(Vec::new());
        };
        let other_sets: Vec<_> = others
            .iter()
            .filter_map(|(b, k)| maps.sets.get(*b).and_then(|m| m.get(*k)))
            .collect();
        Ok(base_set.diff(&other_sets))
    }

    /// Union of `(bucket, base)` with every set named in `others` (same bucket).
    pub fn sunion(&self, bucket: &[u8], base: &[u8], others: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        let maps = self.maps()?;
        let Some(b) = maps.sets.get(bucket) else {
            return Ok(Vec::new());
        };
        let empty = crate::ds::SetState::new();
        let base_set = b.get(base).unwrap_or(&empty);
        let other_sets: Vec<_> = others.iter().filter_map(|k| b.get(*k)).collect();
        Ok(base_set.union(&other_sets))
    }

    /// Union of `(base_bucket, base_key)` with every `(bucket, key)` pair in `others`.
    pub fn sunion_across(
        &self,
        base_bucket: &[u8],
        base_key: &[u8],
        others: &[(&[u8], &[u8])],
    ) -> Result<Vec<Vec<u8>>> {
        let maps = self.maps()?;
        let empty = crate::ds::SetState::new();
        let base_set = maps
            .sets
            .get(base_bucket)
            .and_then(|m| m.get(base_key))
            .unwrap_or(&empty);
        let other_sets: Vec<_> = others
            .iter()
            .filter_map(|(b, k)| maps.sets.get(*b).and_then(|m| m.get(*k)))
            .collect();
        Ok(base_set.union(&other_sets))
    }

    // ---- zset (§4.4) ----
    //
    // A sorted set lives at the bucket level (there is no further key
    // dimension): `key` below is always the member-key within that bucket's
    // sorted set.

    pub fn zadd(&mut self, bucket: &[u8], key: &[u8], score: f64, value: &[u8]) -> Result<()> {
        self.stage(StagedOp::ZAdd {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            score,
            value: value.to_vec(),
        })
    }

    pub fn zrem(&mut self, bucket: &[u8], key: &[u8]) -> Result<bool> {
        let present = self
            .maps()?
            .zsets
            .get(bucket)
            .map(|z| z.score(key).is_some())
            .unwrap_or(false);
        self.stage(StagedOp::ZRem {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
        })?;
        Ok(present)
    }

    pub fn zcard(&self, bucket: &[u8]) -> Result<usize> {
        Ok(self.maps()?.zsets.get(bucket).map(|z| z.card()).unwrap_or(0))
    }

    pub fn zscore(&self, bucket: &[u8], key: &[u8]) -> Result<f64> {
        self.maps()?
            .zsets
            .get(bucket)
            .and_then(|z| z.score(key))
            .ok_or(Error::NotFound)
    }

    pub fn zget_by_key(&self, bucket: &[u8], key: &[u8]) -> Result<(f64, Vec<u8>)> {
        self.maps()?
            .zsets
            .get(bucket)
            .and_then(|z| z.get_by_key(key))
            .ok_or(Error::NotFound)
    }

    pub fn zrank(&self, bucket: &[u8], key: &[u8]) -> Result<usize> {
        self.maps()?
            .zsets
            .get(bucket)
            .and_then(|z| z.rank(key))
            .ok_or(Error::NotFound)
    }

    pub fn zmembers(&self, bucket: &[u8]) -> Result<Vec<(Vec<u8>, f64, Vec<u8>)>> {
        Ok(self.maps()?.zsets.get(bucket).map(|z| z.members()).unwrap_or_default())
    }

    pub fn zrange_by_rank(&self, bucket: &[u8], start: i64, end: i64) -> Result<Vec<(Vec<u8>, f64, Vec<u8>)>> {
        Ok(self
            .maps()?
            .zsets
            .get(bucket)
            .map(|z| z.range_by_rank(start, end))
            .unwrap_or_default())
    }

    pub fn zrange_by_score(
        &self,
        bucket: &[u8],
        min: f64,
        max: f64,
        opts: ScoreRangeOpts,
    ) -> Result<Vec<(Vec<u8>, f64, Vec<u8>)>> {
        Ok(self
            .maps()?
            .zsets
            .get(bucket)
            .map(|z| z.range_by_score(min, max, opts))
            .unwrap_or_default())
    }

    pub fn zcount(&self, bucket: &[u8], min: f64, max: f64, opts: ScoreRangeOpts) -> Result<usize> {
        Ok(self
            .maps()?
            .zsets
            .get(bucket)
            .map(|z| z.count(min, max, opts))
            .unwrap_or(0))
    }

    pub fn zpeek_min(&self, bucket: &[u8]) -> Result<(Vec<u8>, f64, Vec<u8>)> {
        self.maps()?.zsets.get(bucket).and_then(|z| z.peek_min()).ok_or(Error::NotFound)
    }

    pub fn zpeek_max(&self, bucket: &[u8]) -> Result<(Vec<u8>, f64, Vec<u8>)> {
        self.maps()?.zsets.get(bucket).and_then(|z| z.peek_max()).ok_or(Error::NotFound)
    }

    pub fn zpop_min(&mut self, bucket: &[u8]) -> Result<(Vec<u8>, f64, Vec<u8>)> {
        let (scratch, _) = self.write_parts()?;
        let popped = scratch
            .zsets
            .get(bucket)
            .and_then(|z| z.peek_min())
            .ok_or(Error::NotFound)?;
        self.stage(StagedOp::ZPopMin { bucket: bucket.to_vec() })?;
        Ok(popped)
    }

    pub fn zpop_max(&mut self, bucket: &[u8]) -> Result<(Vec<u8>, f64, Vec<u8>)> {
        let (scratch, _) = self.write_parts()?;
        let popped = scratch
            .zsets
            .get(bucket)
            .and_then(|z| z.peek_max())
            .ok_or(Error::NotFound)?;
        self.stage(StagedOp::ZPopMax { bucket: bucket.to_vec() })?;
        Ok(popped)
    }

    pub fn zremrangebyrank(&mut self, bucket: &[u8], start: i64, end: i64) -> Result<usize> {
        let removed = self
            .maps()?
            .zsets
            .get(bucket)
            .cloned()
            .map(|mut z| z.rem_range_by_rank(start, end))
            .unwrap_or(0);
        self.stage(StagedOp::ZRemRangeByRank {
            bucket: bucket.to_vec(),
            start,
            end,
        })?;
        Ok(removed)
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if let Some(Mode::Write { staged, tx_id, .. }) = self.mode.take() {
            if !staged.is_empty() {
                debug!(
                    "tx {} dropped with {} staged op(s) uncommitted; discarding",
                    tx_id,
                    staged.len()
                );
            }
        }
    }
}
