//! On-disk record framing: header, key, value, checksum.
//!
//! Layout (all little-endian, fixed-width header): `crc32(4) timestamp(8) tx_id(8)
//! key_size(4) value_size(4) flag(2) ttl(4) bucket_size(4) ds(2) status(2)`,
//! followed by `bucket || key || value`. The crc32 covers everything after itself.

use std::convert::TryInto;

use crate::error::{Error, Result};

/// Bytes occupied by the fixed header, before `bucket || key || value`.
pub const HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 4 + 2 + 4 + 4 + 2 + 2;

/// Operation tag carried by a record. The set is closed and stable (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Flag {
    Put = 0,
    Delete = 1,
    ListRPush = 2,
    ListLPush = 3,
    ListLPop = 4,
    ListRPop = 5,
    ListLRem = 6,
    ListLSet = 7,
    ListLTrim = 8,
    SetAdd = 16,
    SetRem = 17,
    SetPop = 18,
    SetMove = 19,
    ZSetAdd = 32,
    ZSetRem = 33,
    ZSetPopMin = 34,
    ZSetPopMax = 35,
    ZSetRemRangeByRank = 36,
}

impl Flag {
    pub fn from_u16(v: u16) -> Option<Flag> {
        use Flag::*;
        Some(match v {
            0 => Put,
            1 => Delete,
            2 => ListRPush,
            3 => ListLPush,
            4 => ListLPop,
            5 => ListRPop,
            6 => ListLRem,
            7 => ListLSet,
            8 => ListLTrim,
            16 => SetAdd,
            17 => SetRem,
            18 => SetPop,
            19 => SetMove,
            32 => ZSetAdd,
            33 => ZSetRem,
            34 => ZSetPopMin,
            35 => ZSetPopMax,
            36 => ZSetRemRangeByRank,
            _ => return None,
        })
    }
}

/// Which logical structure a record's flag applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DataStructure {
    Kv = 0,
    List = 1,
    Set = 2,
    ZSet = 3,
}

impl DataStructure {
    pub fn from_u16(v: u16) -> Option<DataStructure> {
        Some(match v {
            0 => DataStructure::Kv,
            1 => DataStructure::List,
            2 => DataStructure::Set,
            3 => DataStructure::ZSet,
            _ => return None,
        })
    }
}

/// A single framed log entry, decoded or about to be encoded.
#[derive(Debug, Clone)]
pub struct Record {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub tx_id: u64,
    pub ttl: u32,
    pub flag: u16,
    pub ds: u16,
    /// `true` once this is the trailer record of its transaction group.
    pub committed: bool,
}

impl Record {
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.bucket.len() + self.key.len() + self.value.len()
    }

    /// Serialize into a freshly allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&[0u8; 4]); // crc32 placeholder, filled in below
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.tx_id.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.flag.to_le_bytes());
        buf.extend_from_slice(&self.ttl.to_le_bytes());
        buf.extend_from_slice(&(self.bucket.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.ds.to_le_bytes());
        buf.extend_from_slice(&(self.committed as u16).to_le_bytes());
        buf.extend_from_slice(&self.bucket);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[4..]);
        let crc = hasher.finalize();
        buf[0..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a record out of `buf`. Any inconsistency (short buffer, length fields
    /// that overrun `buf`, or a crc mismatch) is reported as `Corrupted` — recovery
    /// treats that uniformly as "this and everything after it in the segment is gone".
    pub fn decode(buf: &[u8]) -> Result<Record> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corrupted);
        }
        let crc = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let timestamp = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let tx_id = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let key_size = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
        let value_size = u32::from_le_bytes(buf[24..28].try_into().unwrap()) as usize;
        let flag = u16::from_le_bytes(buf[28..30].try_into().unwrap());
        let ttl = u32::from_le_bytes(buf[30..34].try_into().unwrap());
        let bucket_size = u32::from_le_bytes(buf[34..38].try_into().unwrap()) as usize;
        let ds = u16::from_le_bytes(buf[38..40].try_into().unwrap());
        let status = u16::from_le_bytes(buf[40..42].try_into().unwrap());

        let body_len = bucket_size
            .checked_add(key_size)
            .and_then(|n| n.checked_add(value_size))
            .ok_or(Error::Corrupted)?;
        let total_len = HEADER_SIZE.checked_add(body_len).ok_or(Error::Corrupted)?;
        if buf.len() < total_len {
            return Err(Error::Corrupted);
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[4..total_len]);
        if hasher.finalize() != crc {
            return Err(Error::Corrupted);
        }

        let bucket = buf[HEADER_SIZE..HEADER_SIZE + bucket_size].to_vec();
        let key_start = HEADER_SIZE + bucket_size;
        let key = buf[key_start..key_start + key_size].to_vec();
        let value_start = key_start + key_size;
        let value = buf[value_start..value_start + value_size].to_vec();

        Ok(Record {
            bucket,
            key,
            value,
            timestamp,
            tx_id,
            ttl,
            flag,
            ds,
            committed: status == 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            bucket: b"users".to_vec(),
            key: b"user_001".to_vec(),
            value: b"alice".to_vec(),
            timestamp: 123_456_789,
            tx_id: 7,
            ttl: 0,
            flag: Flag::Put as u16,
            ds: DataStructure::Kv as u16,
            committed: true,
        }
    }

    #[test]
    fn round_trips() {
        let rec = sample();
        let buf = rec.encode();
        let decoded = Record::decode(&buf).unwrap();
        assert_eq!(decoded.bucket, rec.bucket);
        assert_eq!(decoded.key, rec.key);
        assert_eq!(decoded.value, rec.value);
        assert_eq!(decoded.timestamp, rec.timestamp);
        assert_eq!(decoded.tx_id, rec.tx_id);
        assert_eq!(decoded.flag, rec.flag);
        assert!(decoded.committed);
    }

    #[test]
    fn detects_corruption() {
        let rec = sample();
        let mut buf = rec.encode();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(Record::decode(&buf), Err(Error::Corrupted)));
    }

    #[test]
    fn detects_short_buffer() {
        let rec = sample();
        let buf = rec.encode();
        assert!(matches!(
            Record::decode(&buf[..HEADER_SIZE]),
            Err(Error::Corrupted)
        ));
    }

    #[test]
    fn flag_round_trips_through_u16() {
        for f in [
            Flag::Put,
            Flag::Delete,
            Flag::ListRPush,
            Flag::SetMove,
            Flag::ZSetRemRangeByRank,
        ] {
            assert_eq!(Flag::from_u16(f as u16), Some(f));
        }
        assert!(Flag::from_u16(9999).is_none());
    }
}
