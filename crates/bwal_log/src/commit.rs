//! Recovery and the four-phase commit protocol (spec §4.1, §4.5).
//!
//! Every write here is synchronous: `BlockGuard::write` is assumed not to
//! return until the block is durable (spec §9, "Synchronous writes"). Any
//! I/O failure is fatal and turns into a panic via
//! [`crate::error::expect_durable`] — there is no partial-retry path.

use bwal_block_cache::{BlockData, BlockDevice, BlockIoCache, BufferList};
use mutex_api::Mutex;

use crate::{error::expect_durable, header::LogHeader};

fn read_head<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>(
    cache: &BlockIoCache<Device, BufferListMutex>,
    start: u32,
    head: &mut LogHeader,
) where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    let mut handle = cache.get(start as usize);
    let guard = expect_durable(handle.lock().read().map_err(|(_, e)| e));
    head.copy_from(guard.data());
}

/// Writes the in-memory header to disk. This is the true commit point
/// (spec §4.5 Phase 2): once this write completes, the transaction is
/// durable and recovery will install it.
fn write_head<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>(
    cache: &BlockIoCache<Device, BufferListMutex>,
    start: u32,
    head: &LogHeader,
) where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    let mut handle = cache.get(start as usize);
    let mut guard = handle.lock().zeroed();
    guard.data_mut::<LogHeader>().copy_from(head);
    expect_durable(guard.write());
}

/// Phase 1: copies each logged home block into its log slot.
fn write_log<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>(
    cache: &BlockIoCache<Device, BufferListMutex>,
    start: u32,
    head: &LogHeader,
) where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    for (tail, bn) in head.entries().enumerate() {
        let mut from_handle = cache.get(bn.as_index());
        let from_guard = expect_durable(from_handle.lock().read().map_err(|(_, e)| e));
        let mut to_handle = cache.get(start as usize + tail + 1);
        let mut to_guard = to_handle.lock().set_data(from_guard.bytes());
        expect_durable(to_guard.write());
    }
}

/// Phase 3 (or, with `recovering = true`, the sole pass recovery makes):
/// copies each log slot back to its home location.
///
/// When not recovering, each home block is unpinned immediately after its
/// own write lands, per block rather than in a batch, so the cache can
/// reclaim buffers as soon as they are safely committed (spec §4.5).
fn install_trans<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>(
    cache: &BlockIoCache<Device, BufferListMutex>,
    start: u32,
    head: &LogHeader,
    recovering: bool,
) where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    for (tail, bn) in head.entries().enumerate() {
        let mut from_handle = cache.get(start as usize + tail + 1);
        let from_guard = expect_durable(from_handle.lock().read().map_err(|(_, e)| e));
        let mut to_handle = cache.get(bn.as_index());
        let mut to_guard = to_handle.lock().set_data(from_guard.bytes());
        expect_durable(to_guard.write());
        if !recovering {
            unsafe {
                assert!(
                    to_guard.pin_count() > 2,
                    "write-ahead log: home block was not pinned before install"
                );
                to_guard.unpin();
            }
        }
    }
}

/// Runs the recovery algorithm unconditionally at startup (spec §4.1).
///
/// If the previous boot committed (wrote the header with `n > 0`) before
/// crashing, this completes the commit by installing every logged block.
/// If the header had `n = 0`, this is a no-op beyond clearing it again.
/// Buffers are not pinned during recovery: the previous boot's pins do
/// not survive a restart.
pub(crate) fn recover_from_log<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>(
    cache: &BlockIoCache<Device, BufferListMutex>,
    start: u32,
    head: &mut LogHeader,
) where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    read_head(cache, start, head);
    install_trans(cache, start, head, true);
    head.clear();
    write_head(cache, start, head);
}

/// Runs the four-phase commit protocol (spec §4.5). A no-op if nothing
/// was logged.
pub(crate) fn commit<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>(
    cache: &BlockIoCache<Device, BufferListMutex>,
    start: u32,
    head: &mut LogHeader,
) where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    if head.len() == 0 {
        return;
    }
    write_log(cache, start, head); // Phase 1
    write_head(cache, start, head); // Phase 2 -- the commit point
    install_trans(cache, start, head, false); // Phase 3
    head.clear();
    write_head(cache, start, head); // Phase 4 -- erase the transaction
}
