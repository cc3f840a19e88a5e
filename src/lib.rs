//! An embeddable, persistent, transactional key/value store built on a
//! Bitcask-style append-only log: every write lands in a segment file, a
//! fully in-memory index maps keys to their location, and recovery replays
//! the log from scratch on open.
//!
//! ```no_run
//! use nutkv::{Db, Options};
//!
//! let db = Db::open(Options::new("/tmp/nutkv-demo"))?;
//! let mut tx = db.begin(true)?;
//! tx.put(b"default", b"hello", b"world", 0)?;
//! tx.commit()?;
//!
//! let tx = db.begin(false)?;
//! assert_eq!(tx.get(b"default", b"hello")?, b"world");
//! # Ok::<(), nutkv::Error>(())
//! ```

mod backup;
mod clock;
mod core;
mod ds;
mod error;
mod index;
mod location;
mod log_manager;
mod merge;
mod op;
mod options;
mod record;
mod recovery;
mod segment;
mod tx;

pub use ds::zset::ScoreRangeOpts;
pub use error::{Error, Result};
pub use options::{EntryIdxMode, Options, StartFileLoadingMode};
pub use tx::Tx;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use core::Core;
use log_manager::LogManager;

/// An open database directory. Cheap to share (`&Db`) across threads: reads
/// run concurrently, writes serialize through one internal `RwLock`.
pub struct Db {
    opts: Options,
    core: RwLock<Core>,
    tx_counter: AtomicU64,
    lock_path: PathBuf,
}

impl Db {
    /// Open (and, if empty, initialize) the database directory named by
    /// `opts`. Replays the log to rebuild every index before returning.
    /// Fails with `AlreadyOpen` if another live `Db` already holds this
    /// directory's lock file.
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.dir)?;

        let lock_path = opts.dir.join(".lock");
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|_| Error::AlreadyOpen)?;

        match Self::open_locked(opts, lock_path.clone()) {
            Ok(db) => Ok(db),
            Err(e) => {
                let _ = std::fs::remove_file(&lock_path);
                Err(e)
            }
        }
    }

    fn open_locked(opts: Options, lock_path: PathBuf) -> Result<Self> {
        let mut log = LogManager::open(&opts.dir, opts.segment_size, opts.sync_enable)?;
        let cache = opts.entry_idx_mode == EntryIdxMode::RamCache;
        let (maps, max_tx_id) = recovery::scan(&mut log, cache)?;

        if opts.start_file_loading_mode == StartFileLoadingMode::FullRead {
            for id in log.segment_ids() {
                if let Some(seg) = log.segment(id) {
                    // Touch every page once so the OS faults it into the cache now
                    // rather than on the first real read.
                    let mut checksum: u8 = 0;
                    for b in seg.live_bytes() {
                        checksum ^= *b;
                    }
                    let _ = checksum;
                }
            }
        }

        Ok(Self {
            opts,
            core: RwLock::new(Core { log, maps }),
            tx_counter: AtomicU64::new(max_tx_id),
            lock_path,
        })
    }

    /// Begin a transaction, blocking until the store's lock is available.
    /// `write = false` opens a read-only snapshot; `write = true` opens a
    /// transaction whose writes are staged and visible to itself (read your
    /// own writes) until `commit` or `rollback`.
    pub fn begin(&self, write: bool) -> Result<Tx<'_>> {
        if write {
            let guard = self.core.write().unwrap_or_else(|e| e.into_inner());
            let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Tx::new_write(self, guard, tx_id))
        } else {
            let guard = self.core.read().unwrap_or_else(|e| e.into_inner());
            Ok(Tx::new_read(self, guard))
        }
    }

    /// Like `begin`, but returns `Err(Error::WouldBlock)` instead of blocking
    /// if the lock isn't immediately available.
    pub fn try_begin(&self, write: bool) -> Result<Tx<'_>> {
        if write {
            let guard = self.core.try_write().map_err(|_| Error::WouldBlock)?;
            let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Tx::new_write(self, guard, tx_id))
        } else {
            let guard = self.core.try_read().map_err(|_| Error::WouldBlock)?;
            Ok(Tx::new_read(self, guard))
        }
    }

    /// Compact the log: rewrite every bucket's live state into a fresh segment
    /// chain and retire the old generations. Blocks out all other readers and
    /// writers for the duration (§4.7).
    pub fn merge(&self) -> Result<()> {
        let mut guard = self.core.write().unwrap_or_else(|e| e.into_inner());
        merge::merge(&mut guard, &self.opts)
    }

    /// Copy every live segment file into `dest`, which is created if needed.
    /// Takes the store's read lock for the duration so the copy is coherent
    /// with some single point in time.
    pub fn backup<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let guard = self.core.read().unwrap_or_else(|e| e.into_inner());
        backup::backup(&guard, dest.as_ref())
    }

    pub(crate) fn next_timestamp(&self) -> u64 {
        clock::now_nanos()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}
