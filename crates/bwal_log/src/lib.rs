//! A block-level write-ahead log.
//!
//! Provides crash-safe, atomic multi-block updates to an underlying
//! block-addressable device on behalf of a filesystem. Multiple
//! concurrent filesystem operations (each a *transaction*) may modify
//! blocks in a shared buffer cache; the log guarantees that, after any
//! crash, the on-disk state reflects either all or none of the writes of
//! every completed transaction group.
//!
//! A caller brackets each operation with [`Log::begin_op`]/[`Log::end_op`]
//! (or the convenience [`Log::do_op`]). Between them it reads blocks
//! through the buffer cache, mutates them, and calls [`Log::write`] to
//! enlist each modified block. When the last operation in a batch ends,
//! the commit engine runs while new `begin_op` calls are blocked; after
//! commit, admission resumes.
//!
//! On-disk log format:
//!
//! ```text
//! header block, containing block #s for block A, B, C, ...
//! block A
//! block B
//! block C
//! ...
//! ```
//!
//! The buffer cache, block device, filesystem layers above, and
//! superblock parser are all external collaborators reached only through
//! the [`bwal_block_cache::BlockDevice`]/[`bwal_types::LogGeometry`]
//! traits and [`mutex_api::Mutex`]/[`sync::CondVar`]; this crate owns only
//! the log subsystem itself.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod commit;
mod error;
mod header;
pub mod sync;

use alloc::boxed::Box;

use bwal_block_cache::{BlockData, BlockDevice, BlockIoCache, BlockGuard, BufferList};
use bwal_params::MAX_OP_BLOCKS;
use bwal_types::{BlockNo, DeviceNo, LogGeometry};
use mutex_api::Mutex;

pub use error::FatalIoError;
pub use header::LogHeader;
pub use sync::CondVar;

struct LogData {
    /// Number of transactions currently between `begin_op` and `end_op`.
    outstanding: usize,

    /// The in-memory header, owned by whichever transaction (or commit)
    /// currently may mutate it.
    ///
    /// `None` exactly when a commit is in flight (spec §3's `committing`
    /// flag): `end_op` takes the header out of this slot before running
    /// `commit`, and puts it back afterward.
    header: Option<Box<LogHeader>>,
}

/// The write-ahead log.
///
/// Generic over the host's mutex (`DataMutex`), wait channel (`Cond`), and
/// the buffer cache's own generics (`Device`, `BufferListMutex`,
/// `BlockDataMutex`, `BLOCK_SIZE`) — none of which this crate owns (spec
/// §1's "out of scope" list). A filesystem embeds one `Log` per device and
/// is responsible for giving every caller access to the same instance,
/// typically through a process-wide singleton built with the `once_init`
/// crate, naming its own concrete `Device`/mutex types.
pub struct Log<'cache, Device, BufferListMutex, BlockDataMutex, DataMutex, Cond, const BLOCK_SIZE: usize>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    DataMutex: Mutex<Data = LogData>,
    Cond: CondVar<DataMutex>,
{
    dev: DeviceNo,
    start: u32,
    size: u32,
    cache: &'cache BlockIoCache<Device, BufferListMutex>,
    data: DataMutex,
    cond: Cond,
}

impl<'cache, Device, BufferListMutex, BlockDataMutex, DataMutex, Cond, const BLOCK_SIZE: usize>
    Log<'cache, Device, BufferListMutex, BlockDataMutex, DataMutex, Cond, BLOCK_SIZE>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    DataMutex: Mutex<Data = LogData>,
    Cond: CondVar<DataMutex>,
{
    /// Loads the log geometry, then runs recovery exactly once (spec
    /// §4.1) before returning. `cache` must already be initialized and
    /// dedicated to `dev`.
    pub fn new(dev: DeviceNo, geometry: &impl LogGeometry, cache: &'cache BlockIoCache<Device, BufferListMutex>) -> Self {
        let start = geometry.log_start();
        let size = geometry.log_len();
        assert!(size >= 1, "write-ahead log: log region must contain a header block");

        let mut head = Box::new(LogHeader::new());
        commit::recover_from_log(cache, start, &mut head);

        Self {
            dev,
            start,
            size,
            cache,
            data: DataMutex::new(LogData {
                outstanding: 0,
                header: Some(Box::new(LogHeader::new())),
            }),
            cond: Cond::new(),
        }
    }

    pub fn dev(&self) -> DeviceNo {
        self.dev
    }

    /// Admits a transaction (spec §4.2). Blocks until the reservation
    /// fits: either a commit is currently running, or admitting this
    /// caller could overflow the log's capacity once every outstanding
    /// transaction writes up to `MAXOPBLOCKS` blocks.
    pub fn begin_op(&self) {
        let mut data = self.data.lock();
        loop {
            let Some(header) = &data.header else {
                // A commit is in flight; wait for it to finish.
                data = self.cond.wait(data);
                continue;
            };
            if header.len() + (data.outstanding + 1) * MAX_OP_BLOCKS > self.capacity() {
                // This op might exhaust log space; wait for a commit.
                data = self.cond.wait(data);
                continue;
            }
            data.outstanding += 1;
            break;
        }
    }

    /// Ends a transaction (spec §4.3). If this was the last outstanding
    /// transaction, runs the commit engine inline, without holding the
    /// lock (commit performs disk I/O and may suspend).
    pub fn end_op(&self) {
        let mut to_commit = None;

        let mut data = self.data.lock();
        data.outstanding = data
            .outstanding
            .checked_sub(1)
            .expect("write-ahead log: end_op called without a matching begin_op");
        assert!(data.header.is_some(), "write-ahead log: end_op called while a commit is in flight");
        if data.outstanding == 0 {
            to_commit = data.header.take();
        } else {
            // begin_op() may be waiting for log space, and decrementing
            // outstanding has decreased the amount of reserved space.
            self.cond.notify_all();
        }
        drop(data);

        if let Some(mut head) = to_commit {
            commit::commit(self.cache, self.start, &mut head);
            let mut data = self.data.lock();
            debug_assert!(data.header.is_none());
            data.header = Some(head);
            self.cond.notify_all();
        }
    }

    /// Runs `f` inside a `begin_op`/`end_op` bracket.
    pub fn do_op<T>(&self, f: impl FnOnce() -> T) -> T {
        self.begin_op();
        let result = f();
        self.end_op();
        result
    }

    /// Enlists a modified buffer in the current transaction (spec §4.4).
    ///
    /// `buf` must already be locked by the caller and hold the updated
    /// data; `buf` is pinned on first enlistment only (absorption: a
    /// repeated write to the same block within one group collapses to a
    /// single log slot) and stays pinned until install completes.
    ///
    /// # Panics
    ///
    /// Panics if called outside a `begin_op`/`end_op` bracket, or if the
    /// transaction has already logged `LOGSIZE` (or `size - 1`) distinct
    /// blocks.
    pub fn write(&self, buf: &mut BlockGuard<'_, '_, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true>) {
        let mut data = self.data.lock();
        let header = data
            .header
            .as_mut()
            .expect("write-ahead log: log_write called while a commit is in flight");
        assert!(
            header.len() < self.capacity() && header.len() < (self.size - 1) as usize,
            "write-ahead log: transaction exceeds log capacity"
        );
        assert!(data.outstanding > 0, "write-ahead log: log_write called outside a transaction");

        let block = BlockNo::new(u32::try_from(buf.index()).expect("block index overflows u32"));
        match header.position(block) {
            Some(_) => {}
            None => {
                // SAFETY: paired with the `unpin` performed by
                // `install_trans` once this block's home write lands.
                unsafe {
                    buf.pin();
                }
                header.push(block);
            }
        }
    }

    fn capacity(&self) -> usize {
        bwal_params::LOG_SIZE
    }
}
