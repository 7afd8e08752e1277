//! A generic, pinnable cache for block I/O.
//!
//! This is not the write-ahead log itself — the log (`bwal_log`) treats a
//! buffer cache as an external collaborator, reached only through
//! `bread`/`bwrite`/`brelse`/`bpin`/`bunpin`-shaped operations. This crate
//! supplies one concrete, host-independent implementation of that
//! collaborator so the log can be exercised and tested end to end.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use dataview::{Pod, PodMethods as _};
use mutex_api::Mutex;

/// A block-addressable device.
pub trait BlockDevice<const BLOCK_SIZE: usize> {
    type Error;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
}

/// A buffer cache for block I/O.
pub struct BlockIoCache<Device, BufferListMutex> {
    device: Device,

    /// All buffers, ordered by how recently each was used.
    ///
    /// `buffers[0]` is most recent, `buffers.last()` is least.
    buffers: BufferListMutex,
}

pub struct BufferList<BlockDataMutex>(Vec<Arc<Block<BlockDataMutex>>>);

/// A block buffer.
struct Block<BlockDataMutex> {
    /// Block index.
    index: usize,

    /// Block data.
    data: BlockDataMutex,
}

pub struct BlockHandle<'a, Device, BufferListMutex, BlockDataMutex>
where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
{
    index: usize,
    cache: &'a BlockIoCache<Device, BufferListMutex>,
    block: Arc<Block<BlockDataMutex>>,
}

/// A reference to a block buffer, typestated on whether its data is known
/// to be valid (`VALID`) or has not yet been read (`!VALID`).
pub struct BlockGuard<
    'a,
    'b,
    Device,
    BufferListMutex,
    BlockDataMutex,
    const BLOCK_SIZE: usize,
    const VALID: bool,
> where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>> + 'b,
{
    index: usize,
    cache: &'a BlockIoCache<Device, BufferListMutex>,
    block: Arc<Block<BlockDataMutex>>,
    data: BlockDataMutex::Guard<'b>,
}

/// A block's cached data.
pub struct BlockData<const BLOCK_SIZE: usize> {
    index: usize,
    valid: bool,
    data: Box<[u8; BLOCK_SIZE]>,
}

impl<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>
    BlockIoCache<Device, BufferListMutex>
where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    pub fn new(device: Device) -> Self {
        Self {
            device,
            buffers: BufferListMutex::new(BufferList(Vec::new())),
        }
    }

    /// Initializes the cache with `num_block` buffers.
    ///
    /// # Panics
    ///
    /// Panics if `num_block` is 0 or the cache is already initialized.
    pub fn init(&self, num_block: usize) {
        assert!(num_block > 0);
        let mut buffers = self.buffers.lock();
        assert!(buffers.0.is_empty());

        buffers.0.extend((0..num_block).map(|_| {
            Arc::new(Block {
                index: usize::MAX,
                data: BlockDataMutex::new(BlockData {
                    index: usize::MAX,
                    valid: false,
                    data: Box::new([0; BLOCK_SIZE]),
                }),
            })
        }));
    }

    /// Returns a handle to the buffer for `index`.
    ///
    /// If the block is already cached, returns a reference to it.
    /// Otherwise recycles the least recently used unused buffer.
    /// Returns `None` if every buffer is in use.
    ///
    /// # Panics
    ///
    /// Panics if the cache is not initialized.
    pub fn try_get(
        &self,
        index: usize,
    ) -> Option<BlockHandle<'_, Device, BufferListMutex, BlockDataMutex>> {
        let mut buffers = self.buffers.lock();
        assert!(!buffers.0.is_empty());

        if let Some(buf) = buffers.0.iter().find(|b| b.index == index) {
            // NOTE: `buf.valid` may be `false` here.
            return Some(BlockHandle {
                index,
                cache: self,
                block: Arc::clone(buf),
            });
        }

        // Not cached: recycle the least recently used unused buffer.
        if let Some(buf) = buffers.0.iter_mut().rev().find_map(|buf| {
            let buf_content = Arc::get_mut(buf)?;
            buf_content.index = index;
            Some(buf)
        }) {
            return Some(BlockHandle {
                index,
                cache: self,
                block: Arc::clone(buf),
            });
        }

        None
    }

    /// Like [`Self::try_get`], but panics instead of returning `None` when
    /// every buffer is in use.
    pub fn get(&self, index: usize) -> BlockHandle<'_, Device, BufferListMutex, BlockDataMutex> {
        match self.try_get(index) {
            Some(buf) => buf,
            None => panic!("block buffer exhausted"),
        }
    }
}

impl<Device, BufferListMutex, BlockDataMutex> Drop
    for BlockHandle<'_, Device, BufferListMutex, BlockDataMutex>
where
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
{
    fn drop(&mut self) {
        let mut buffers = self.cache.buffers.lock();
        let Some(pos) = buffers.0.iter().position(|buf| buf.index == self.index) else {
            return;
        };
        let buf = buffers.0.remove(pos);
        buffers.0.insert(0, buf);
    }
}

impl<'a, Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>
    BlockHandle<'a, Device, BufferListMutex, BlockDataMutex>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>> + 'a,
{
    pub fn index(&self) -> usize {
        self.index
    }

    /// Suppresses eviction of this block until a matching [`Self::unpin`].
    ///
    /// # Safety
    ///
    /// Every `pin` must be paired with exactly one later `unpin` along
    /// every code path.
    pub unsafe fn pin(&self) {
        unsafe {
            Arc::increment_strong_count(&self.block);
        }
    }

    /// # Safety
    ///
    /// Must be paired with an earlier [`Self::pin`] that has not yet been
    /// unpinned.
    pub unsafe fn unpin(&self) {
        unsafe {
            Arc::decrement_strong_count(&self.block);
        }
    }

    pub fn lock<'b>(
        &'b mut self,
    ) -> BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, false> {
        let mut data = self.block.data.lock();

        if data.index != self.index {
            // The slot was recycled for a different block since we last saw it.
            data.index = self.index;
            data.valid = false;
        }

        BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data,
        }
    }
}

impl<'a, 'b, Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize, const VALID: bool>
    BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, VALID>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>> + 'a,
{
    pub fn index(&self) -> usize {
        self.index
    }

    /// Reads the block from disk if the cached data is not already valid.
    pub fn read(
        mut self,
    ) -> Result<
        BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true>,
        (Self, Device::Error),
    > {
        if !self.data.valid {
            if let Err(e) = self.cache.device.read(self.index, &mut self.data.data) {
                return Err((self, e));
            }
            self.data.valid = true;
        }

        Ok(BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data: self.data,
        })
    }

    /// Overwrites the whole block with `data`, without reading it first.
    pub fn set_data(
        mut self,
        data: &[u8],
    ) -> BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true> {
        self.data.valid = true;
        self.data.data.copy_from_slice(data);
        BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data: self.data,
        }
    }

    /// Fills the whole block with zero, without reading it first.
    pub fn zeroed(
        mut self,
    ) -> BlockGuard<'a, 'b, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true> {
        self.data.valid = true;
        self.data.data.fill(0);
        BlockGuard {
            index: self.index,
            cache: self.cache,
            block: Arc::clone(&self.block),
            data: self.data,
        }
    }

    /// # Safety
    ///
    /// See [`BlockHandle::pin`].
    pub unsafe fn pin(&self) {
        unsafe {
            Arc::increment_strong_count(&self.block);
        }
    }

    /// # Safety
    ///
    /// See [`BlockHandle::unpin`].
    pub unsafe fn unpin(&self) {
        unsafe {
            Arc::decrement_strong_count(&self.block);
        }
    }

    /// The number of outstanding references to this block, including pins.
    pub fn pin_count(&self) -> usize {
        Arc::strong_count(&self.block)
    }
}

impl<Device, BufferListMutex, BlockDataMutex, const BLOCK_SIZE: usize>
    BlockGuard<'_, '_, Device, BufferListMutex, BlockDataMutex, BLOCK_SIZE, true>
where
    Device: BlockDevice<BLOCK_SIZE>,
    BufferListMutex: Mutex<Data = BufferList<BlockDataMutex>>,
    BlockDataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
{
    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data.data
    }

    pub fn data<T>(&self) -> &T
    where
        T: Pod,
    {
        self.bytes().as_data_view().get(0)
    }

    pub fn data_mut<T>(&mut self) -> &mut T
    where
        T: Pod,
    {
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }

    /// Writes the block to disk.
    ///
    /// # Panics
    ///
    /// Panics if the cached data is not valid.
    pub fn write(&mut self) -> Result<(), Device::Error> {
        assert!(self.data.valid);
        self.cache.device.write(self.index, self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::{
        convert::Infallible,
        ops::{Deref, DerefMut},
    };
    use std::sync::Arc as StdArc;

    const BLOCK_SIZE: usize = 512;

    struct StdMutex<T>(std::sync::Mutex<T>);
    struct StdMutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> mutex_api::Mutex for StdMutex<T> {
        type Data = T;

        type Guard<'a>
            = StdMutexGuard<'a, T>
        where
            Self: 'a;

        fn new(data: Self::Data) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            StdMutexGuard(self.0.lock().unwrap())
        }
    }

    impl<T> Deref for StdMutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<T> DerefMut for StdMutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }

    #[derive(Clone)]
    struct MockDevice {
        data: Vec<StdArc<StdMutex<MockData>>>,
    }

    struct MockData {
        data: [u8; BLOCK_SIZE],
        read: usize,
        write: usize,
    }

    type BlockIoCache = super::BlockIoCache<MockDevice, StdMutex<BufferList>>;
    type BufferList = super::BufferList<StdMutex<BlockData>>;
    type BlockData = super::BlockData<BLOCK_SIZE>;

    impl MockDevice {
        fn new(size: usize) -> Self {
            Self {
                data: (0..size)
                    .map(|_| {
                        StdArc::new(StdMutex::new(MockData {
                            data: [0; BLOCK_SIZE],
                            read: 0,
                            write: 0,
                        }))
                    })
                    .collect(),
            }
        }
    }

    impl BlockDevice<BLOCK_SIZE> for MockDevice {
        type Error = Infallible;

        fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            let mut mock = self.data[index].lock();
            mock.0.read += 1;
            data.copy_from_slice(&mock.0.data);
            Ok(())
        }

        fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            let mut mock = self.data[index].lock();
            mock.0.write += 1;
            mock.0.data.copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn init_creates_requested_buffer_count() {
        let device = MockDevice::new(10);
        let cache = BlockIoCache::new(device);
        cache.init(5);
        assert_eq!(cache.buffers.lock().0.len(), 5);
    }

    #[test]
    #[should_panic]
    fn init_zero_buffers_panics() {
        let device = MockDevice::new(10);
        let cache = BlockIoCache::new(device);
        cache.init(0);
    }

    #[test]
    fn get_does_not_touch_the_device() {
        let device = MockDevice::new(10);
        let cache = BlockIoCache::new(device.clone());
        cache.init(5);

        let block = cache.get(0);
        assert_eq!(block.index(), 0);
        assert_eq!(device.data[0].lock().0.read, 0);
        assert_eq!(device.data[0].lock().0.write, 0);
    }

    #[test]
    fn read_is_cached_across_handles() {
        let device = MockDevice::new(10);
        let cache = BlockIoCache::new(device.clone());
        cache.init(5);

        {
            let mut block = cache.get(0);
            let Ok(mut block) = block.lock().read();
            block.bytes_mut().copy_from_slice(&[1; BLOCK_SIZE]);
            block.write().unwrap();
        }
        {
            let mut block = cache.get(0);
            let Ok(block) = block.lock().read();
            assert_eq!(block.bytes(), &[1; BLOCK_SIZE]);
        }

        assert_eq!(device.data[0].lock().0.read, 1);
        assert_eq!(device.data[0].lock().0.write, 1);
    }

    #[test]
    fn exhausted_cache_panics_on_get() {
        let device = MockDevice::new(10);
        let cache = BlockIoCache::new(device);
        cache.init(1);

        {
            let _block1 = cache.get(0);
            assert!(cache.try_get(1).is_none());
        }

        let _block2 = cache.get(1);
    }

    #[test]
    fn least_recently_used_buffer_is_recycled() {
        let device = MockDevice::new(10);
        let cache = BlockIoCache::new(device.clone());
        cache.init(5);

        for i in 0..10 {
            let mut block = cache.get(i);
            let Ok(_block) = block.lock().read();
        }
        // cache: 9 -> 8 -> 7 -> 6 -> 5

        for i in 0..10 {
            assert_eq!(device.data[i].lock().0.read, 1);
        }

        let mut block = cache.get(0);
        let Ok(block) = block.lock().read(); // 0 is not cached, evicts 5
        assert_eq!(device.data[0].lock().0.read, 2);
        drop(block);

        let mut block = cache.get(8);
        let Ok(block) = block.lock().read(); // 8 is still cached
        assert_eq!(device.data[8].lock().0.read, 1);
        drop(block);
    }

    #[test]
    fn pinned_buffer_survives_eviction_pressure() {
        let device = MockDevice::new(10);
        let cache = BlockIoCache::new(device.clone());
        cache.init(5);

        for i in 0..10 {
            let mut block = cache.get(i);
            let Ok(_block) = block.lock().read();
        }
        // cache: 9 -> 8 -> 7 -> 6 -> 5
        let mut block = cache.get(5);
        unsafe {
            block.pin();
        }
        let Ok(block) = block.lock().read();
        drop(block);

        for i in 0..10 {
            let mut block = cache.get(i);
            let Ok(_block) = block.lock().read();
        }

        for i in 0..10 {
            let n = if i == 5 { 1 } else { 2 };
            assert_eq!(device.data[i].lock().0.read, n);
        }
    }
}
