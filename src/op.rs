//! The closed set of mutating operations (§6.1): how each is framed as a
//! `Record` on the wire, and how it is replayed against in-memory state,
//! whether that's a live commit or a recovery pass over the log.

use std::collections::HashMap;
use std::convert::TryInto;

use crate::ds::{ListState, SetState, ZSetState};
use crate::error::{Error, Result};
use crate::index::{BucketIndex, IndexEntry};
use crate::location::Location;
use crate::record::{DataStructure, Flag, Record};

pub(crate) type KvBuckets = HashMap<Vec<u8>, BucketIndex>;
pub(crate) type ListBuckets = HashMap<Vec<u8>, HashMap<Vec<u8>, ListState>>;
pub(crate) type SetBuckets = HashMap<Vec<u8>, HashMap<Vec<u8>, SetState>>;
pub(crate) type ZSetBuckets = HashMap<Vec<u8>, ZSetState>;

/// The four data-structure namespaces, kept separately so one (bucket, key)
/// pair can address a kv entry, a list, and a set independently; a zset has
/// no extra key dimension of its own, since the bucket itself is the sorted
/// set and `key` addresses a member within it.
#[derive(Default, Clone)]
pub(crate) struct Maps {
    pub kv: KvBuckets,
    pub lists: ListBuckets,
    pub sets: SetBuckets,
    pub zsets: ZSetBuckets,
}

impl Maps {
    pub fn new() -> Self {
        Self::default()
    }
}

fn list_mut<'a>(lists: &'a mut ListBuckets, bucket: &[u8], key: &[u8]) -> &'a mut ListState {
    lists
        .entry(bucket.to_vec())
        .or_default()
        .entry(key.to_vec())
        .or_default()
}

fn set_mut<'a>(sets: &'a mut SetBuckets, bucket: &[u8], key: &[u8]) -> &'a mut SetState {
    sets.entry(bucket.to_vec())
        .or_default()
        .entry(key.to_vec())
        .or_default()
}

fn zset_mut<'a>(zsets: &'a mut ZSetBuckets, bucket: &[u8]) -> &'a mut ZSetState {
    zsets.entry(bucket.to_vec()).or_default()
}

/// One staged mutation, queued on a write transaction and later both applied
/// to in-memory state and framed as a logged `Record`.
#[derive(Debug, Clone)]
pub(crate) enum StagedOp {
    Put { bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8>, ttl: u32 },
    Delete { bucket: Vec<u8>, key: Vec<u8> },
    RPush { bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8> },
    LPush { bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8> },
    LPop { bucket: Vec<u8>, key: Vec<u8> },
    RPop { bucket: Vec<u8>, key: Vec<u8> },
    LRem { bucket: Vec<u8>, key: Vec<u8>, count: i64, value: Vec<u8> },
    LSet { bucket: Vec<u8>, key: Vec<u8>, index: i64, value: Vec<u8> },
    LTrim { bucket: Vec<u8>, key: Vec<u8>, start: i64, end: i64 },
    SAdd { bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8> },
    SRem { bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8> },
    SPop { bucket: Vec<u8>, key: Vec<u8> },
    SMove {
        src_bucket: Vec<u8>,
        src_key: Vec<u8>,
        dst_bucket: Vec<u8>,
        dst_key: Vec<u8>,
        value: Vec<u8>,
    },
    /// `key` is the sorted set's member-key; the bucket itself is the sorted set.
    ZAdd { bucket: Vec<u8>, key: Vec<u8>, score: f64, value: Vec<u8> },
    ZRem { bucket: Vec<u8>, key: Vec<u8> },
    ZPopMin { bucket: Vec<u8> },
    ZPopMax { bucket: Vec<u8> },
    ZRemRangeByRank { bucket: Vec<u8>, start: i64, end: i64 },
}

fn encode_i64(v: i64) -> [u8; 8] {
    v.to_le_bytes()
}

fn decode_i64(buf: &[u8]) -> i64 {
    i64::from_le_bytes(buf.try_into().unwrap())
}

impl StagedOp {
    /// Frame this op as the wire record that will represent it in the log.
    /// `committed` is set by the caller once the whole group's trailer is known.
    pub fn to_record(&self, tx_id: u64, timestamp: u64, committed: bool) -> Record {
        let (bucket, key, value, ttl, flag, ds) = match self {
            StagedOp::Put { bucket, key, value, ttl } => {
                (bucket.clone(), key.clone(), value.clone(), *ttl, Flag::Put, DataStructure::Kv)
            }
            StagedOp::Delete { bucket, key } => {
                (bucket.clone(), key.clone(), Vec::new(), 0, Flag::Delete, DataStructure::Kv)
            }
            StagedOp::RPush { bucket, key, value } => {
                (bucket.clone(), key.clone(), value.clone(), 0, Flag::ListRPush, DataStructure::List)
            }
            StagedOp::LPush { bucket, key, value } => {
                (bucket.clone(), key.clone(), value.clone(), 0, Flag::ListLPush, DataStructure::List)
            }
            StagedOp::LPop { bucket, key } => {
                (bucket.clone(), key.clone(), Vec::new(), 0, Flag::ListLPop, DataStructure::List)
            }
            StagedOp::RPop { bucket, key } => {
                (bucket.clone(), key.clone(), Vec::new(), 0, Flag::ListRPop, DataStructure::List)
            }
            StagedOp::LRem { bucket, key, count, value } => {
                let mut v = encode_i64(*count).to_vec();
                v.extend_from_slice(value);
                (bucket.clone(), key.clone(), v, 0, Flag::ListLRem, DataStructure::List)
            }
            StagedOp::LSet { bucket, key, index, value } => {
                let mut v = encode_i64(*index).to_vec();
                v.extend_from_slice(value);
                (bucket.clone(), key.clone(), v, 0, Flag::ListLSet, DataStructure::List)
            }
            StagedOp::LTrim { bucket, key, start, end } => {
                let mut v = encode_i64(*start).to_vec();
                v.extend_from_slice(&encode_i64(*end));
                (bucket.clone(), key.clone(), v, 0, Flag::ListLTrim, DataStructure::List)
            }
            StagedOp::SAdd { bucket, key, value } => {
                (bucket.clone(), key.clone(), value.clone(), 0, Flag::SetAdd, DataStructure::Set)
            }
            StagedOp::SRem { bucket, key, value } => {
                (bucket.clone(), key.clone(), value.clone(), 0, Flag::SetRem, DataStructure::Set)
            }
            StagedOp::SPop { bucket, key } => {
                (bucket.clone(), key.clone(), Vec::new(), 0, Flag::SetPop, DataStructure::Set)
            }
            StagedOp::SMove { src_bucket, src_key, dst_bucket, dst_key, value } => {
                let mut v = (dst_bucket.len() as u32).to_le_bytes().to_vec();
                v.extend_from_slice(dst_bucket);
                v.extend_from_slice(&(dst_key.len() as u32).to_le_bytes());
                v.extend_from_slice(dst_key);
                v.extend_from_slice(value);
                (src_bucket.clone(), src_key.clone(), v, 0, Flag::SetMove, DataStructure::Set)
            }
            StagedOp::ZAdd { bucket, key, score, value } => {
                let mut v = score.to_bits().to_le_bytes().to_vec();
                v.extend_from_slice(value);
                (bucket.clone(), key.clone(), v, 0, Flag::ZSetAdd, DataStructure::ZSet)
            }
            StagedOp::ZRem { bucket, key } => {
                (bucket.clone(), key.clone(), Vec::new(), 0, Flag::ZSetRem, DataStructure::ZSet)
            }
            StagedOp::ZPopMin { bucket } => {
                (bucket.clone(), Vec::new(), Vec::new(), 0, Flag::ZSetPopMin, DataStructure::ZSet)
            }
            StagedOp::ZPopMax { bucket } => {
                (bucket.clone(), Vec::new(), Vec::new(), 0, Flag::ZSetPopMax, DataStructure::ZSet)
            }
            StagedOp::ZRemRangeByRank { bucket, start, end } => {
                let mut v = encode_i64(*start).to_vec();
                v.extend_from_slice(&encode_i64(*end));
                (bucket.clone(), Vec::new(), v, 0, Flag::ZSetRemRangeByRank, DataStructure::ZSet)
            }
        };
        Record {
            bucket,
            key,
            value,
            timestamp,
            tx_id,
            ttl,
            flag: flag as u16,
            ds: ds as u16,
            committed,
        }
    }

    /// Reconstruct the op a logged record represents, for recovery replay.
    pub fn from_record(rec: &Record) -> Result<StagedOp> {
        let flag = Flag::from_u16(rec.flag).ok_or(Error::Corrupted)?;
        Ok(match flag {
            Flag::Put => StagedOp::Put {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
                value: rec.value.clone(),
                ttl: rec.ttl,
            },
            Flag::Delete => StagedOp::Delete {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
            },
            Flag::ListRPush => StagedOp::RPush {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
                value: rec.value.clone(),
            },
            Flag::ListLPush => StagedOp::LPush {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
                value: rec.value.clone(),
            },
            Flag::ListLPop => StagedOp::LPop {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
            },
            Flag::ListRPop => StagedOp::RPop {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
            },
            Flag::ListLRem => {
                if rec.value.len() < 8 {
                    return Err(Error::Corrupted);
                }
                StagedOp::LRem {
                    bucket: rec.bucket.clone(),
                    key: rec.key.clone(),
                    count: decode_i64(&rec.value[0..8]),
                    value: rec.value[8..].to_vec(),
                }
            }
            Flag::ListLSet => {
                if rec.value.len() < 8 {
                    return Err(Error::Corrupted);
                }
                StagedOp::LSet {
                    bucket: rec.bucket.clone(),
                    key: rec.key.clone(),
                    index: decode_i64(&rec.value[0..8]),
                    value: rec.value[8..].to_vec(),
                }
            }
            Flag::ListLTrim => {
                if rec.value.len() < 16 {
                    return Err(Error::Corrupted);
                }
                StagedOp::LTrim {
                    bucket: rec.bucket.clone(),
                    key: rec.key.clone(),
                    start: decode_i64(&rec.value[0..8]),
                    end: decode_i64(&rec.value[8..16]),
                }
            }
            Flag::SetAdd => StagedOp::SAdd {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
                value: rec.value.clone(),
            },
            Flag::SetRem => StagedOp::SRem {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
                value: rec.value.clone(),
            },
            Flag::SetPop => StagedOp::SPop {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
            },
            Flag::SetMove => {
                if rec.value.len() < 4 {
                    return Err(Error::Corrupted);
                }
                let dst_bucket_len = u32::from_le_bytes(rec.value[0..4].try_into().unwrap()) as usize;
                let rest = &rec.value[4..];
                if rest.len() < dst_bucket_len + 4 {
                    return Err(Error::Corrupted);
                }
                let dst_bucket = rest[..dst_bucket_len].to_vec();
                let rest = &rest[dst_bucket_len..];
                let dst_key_len = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
                let rest = &rest[4..];
                if rest.len() < dst_key_len {
                    return Err(Error::Corrupted);
                }
                let dst_key = rest[..dst_key_len].to_vec();
                let value = rest[dst_key_len..].to_vec();
                StagedOp::SMove {
                    src_bucket: rec.bucket.clone(),
                    src_key: rec.key.clone(),
                    dst_bucket,
                    dst_key,
                    value,
                }
            }
            Flag::ZSetAdd => {
                if rec.value.len() < 8 {
                    return Err(Error::Corrupted);
                }
                let score = f64::from_bits(u64::from_le_bytes(rec.value[0..8].try_into().unwrap()));
                StagedOp::ZAdd {
                    bucket: rec.bucket.clone(),
                    key: rec.key.clone(),
                    score,
                    value: rec.value[8..].to_vec(),
                }
            }
            Flag::ZSetRem => StagedOp::ZRem {
                bucket: rec.bucket.clone(),
                key: rec.key.clone(),
            },
            Flag::ZSetPopMin => StagedOp::ZPopMin {
                bucket: rec.bucket.clone(),
            },
            Flag::ZSetPopMax => StagedOp::ZPopMax {
                bucket: rec.bucket.clone(),
            },
            Flag::ZSetRemRangeByRank => {
                if rec.value.len() < 16 {
                    return Err(Error::Corrupted);
                }
                StagedOp::ZRemRangeByRank {
                    bucket: rec.bucket.clone(),
                    start: decode_i64(&rec.value[0..8]),
                    end: decode_i64(&rec.value[8..16]),
                }
            }
        })
    }

    /// Apply this op's effect to in-memory state. `location`/`timestamp` come
    /// from the (real or placeholder) record that carries it; `cache_value`
    /// controls whether the primary index retains the value inline (`RamCache`)
    /// or defers to the log on read (`Mmap`).
    pub fn apply(&self, maps: &mut Maps, location: Location, timestamp: u64, cache_value: bool) {
        match self {
            StagedOp::Put { bucket, key, value, ttl } => {
                let entry = IndexEntry {
                    location,
                    timestamp,
                    ttl: *ttl,
                    cached_value: if cache_value { Some(value.clone()) } else { None },
                };
                maps.kv.entry(bucket.clone()).or_default().put(key.clone(), entry);
            }
            StagedOp::Delete { bucket, key } => {
                if let Some(b) = maps.kv.get_mut(bucket) {
                    b.delete(key);
                }
            }
            StagedOp::RPush { bucket, key, value } => {
                list_mut(&mut maps.lists, bucket, key).rpush(value.clone());
            }
            StagedOp::LPush { bucket, key, value } => {
                list_mut(&mut maps.lists, bucket, key).lpush(value.clone());
            }
            StagedOp::LPop { bucket, key } => {
                let _ = list_mut(&mut maps.lists, bucket, key).lpop();
            }
            StagedOp::RPop { bucket, key } => {
                let _ = list_mut(&mut maps.lists, bucket, key).rpop();
            }
            StagedOp::LRem { bucket, key, count, value } => {
                list_mut(&mut maps.lists, bucket, key).lrem(*count, value);
            }
            StagedOp::LSet { bucket, key, index, value } => {
                let _ = list_mut(&mut maps.lists, bucket, key).lset(*index, value.clone());
            }
            StagedOp::LTrim { bucket, key, start, end } => {
                list_mut(&mut maps.lists, bucket, key).ltrim(*start, *end);
            }
            StagedOp::SAdd { bucket, key, value } => {
                set_mut(&mut maps.sets, bucket, key).add(value.clone());
            }
            StagedOp::SRem { bucket, key, value } => {
                set_mut(&mut maps.sets, bucket, key).remove(value);
            }
            StagedOp::SPop { bucket, key } => {
                let _ = set_mut(&mut maps.sets, bucket, key).pop();
            }
            StagedOp::SMove { src_bucket, src_key, dst_bucket, dst_key, value } => {
                set_mut(&mut maps.sets, src_bucket, src_key).remove(value);
                set_mut(&mut maps.sets, dst_bucket, dst_key).add(value.clone());
            }
            StagedOp::ZAdd { bucket, key, score, value } => {
                zset_mut(&mut maps.zsets, bucket).add(key.clone(), *score, value.clone());
            }
            StagedOp::ZRem { bucket, key } => {
                zset_mut(&mut maps.zsets, bucket).rem(key);
            }
            StagedOp::ZPopMin { bucket } => {
                let _ = zset_mut(&mut maps.zsets, bucket).pop_min();
            }
            StagedOp::ZPopMax { bucket } => {
                let _ = zset_mut(&mut maps.zsets, bucket).pop_max();
            }
            StagedOp::ZRemRangeByRank { bucket, start, end } => {
                zset_mut(&mut maps.zsets, bucket).rem_range_by_rank(*start, *end);
            }
        }
    }
}
