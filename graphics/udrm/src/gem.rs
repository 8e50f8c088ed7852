//! GEM (Graphics Execution Manager) buffer objects
//!
//! udrm never owns display memory of its own. Buffer objects are plain
//! system-memory allocations handed out by a [`BufferStore`]; sessions refer
//! to them through per-session handles kept in a [`GemTable`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Allocation granularity of the buffer store
pub const PAGE_SIZE: usize = 4096;

const PAGE_SHIFT: u32 = 12;

struct StoreInner {
    next_id: AtomicU32,
    live: AtomicUsize,
}

/// Buffer allocator shared by all devices of a node
#[derive(Clone)]
pub struct BufferStore {
    inner: Arc<StoreInner>,
}

impl Default for BufferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                next_id: AtomicU32::new(1),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate a zeroed buffer object of at least `size` bytes
    pub fn allocate(&self, size: usize) -> Result<Arc<BufferObject>> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let size = page_align(size).ok_or(Error::InvalidArgument)?;

        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory)?;
        pixels.resize(size, 0);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.live.fetch_add(1, Ordering::AcqRel);

        Ok(Arc::new(BufferObject {
            id,
            size,
            pixels: spin::RwLock::new(pixels),
            store: self.inner.clone(),
        }))
    }

    /// Allocate a dumb scanout buffer
    pub fn create_dumb(
        &self,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> Result<(Arc<BufferObject>, DumbLayout)> {
        let layout = DumbLayout::new(width, height, bpp)?;
        let bo = self.allocate(layout.size)?;
        Ok((bo, layout))
    }

    /// Buffer objects allocated and not yet freed
    pub fn live_objects(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }
}

fn page_align(size: usize) -> Option<usize> {
    Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

/// Pitch and size of a dumb buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbLayout {
    /// Bytes per row
    pub pitch: u32,
    /// Total size, page aligned
    pub size: usize,
}

impl DumbLayout {
    pub fn new(width: u32, height: u32, bpp: u32) -> Result<Self> {
        if width == 0 || height == 0 || bpp == 0 {
            return Err(Error::InvalidArgument);
        }

        let cpp = bpp.div_ceil(8);
        let pitch = cpp.checked_mul(width).ok_or(Error::InvalidArgument)?;
        let size = (pitch as usize)
            .checked_mul(height as usize)
            .and_then(page_align)
            .ok_or(Error::InvalidArgument)?;

        Ok(Self { pitch, size })
    }
}

/// System-memory buffer object
pub struct BufferObject {
    id: u32,
    size: usize,
    pixels: spin::RwLock<Vec<u8>>,
    store: Arc<StoreInner>,
}

impl BufferObject {
    /// Store-wide unique id
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Fake offset a client passes to mmap to reach this object
    pub fn mmap_offset(&self) -> u64 {
        (self.id as u64) << PAGE_SHIFT
    }

    /// Copy `data` into the object at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(Error::InvalidArgument)?;
        let mut pixels = self.pixels.write();
        pixels
            .get_mut(offset..end)
            .ok_or(Error::InvalidArgument)?
            .copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes out of the object starting at `offset`
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(out.len()).ok_or(Error::InvalidArgument)?;
        let pixels = self.pixels.read();
        out.copy_from_slice(pixels.get(offset..end).ok_or(Error::InvalidArgument)?);
        Ok(())
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        self.store.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl core::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

/// Per-session handle table
pub struct GemTable {
    objects: HashMap<u32, Arc<BufferObject>>,
    next_handle: u32,
}

impl Default for GemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GemTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Publish `bo` under a fresh non-zero handle
    ///
    /// Handles still in the table are skipped once the counter wraps.
    pub fn insert(&mut self, bo: Arc<BufferObject>) -> Result<u32> {
        let objects = &self.objects;
        let handle = next_free(&mut self.next_handle, objects.len(), |h| {
            objects.contains_key(&h)
        })?;
        self.objects.insert(handle, bo);
        Ok(handle)
    }

    pub fn get(&self, handle: u32) -> Option<Arc<BufferObject>> {
        self.objects.get(&handle).cloned()
    }

    pub fn remove(&mut self, handle: u32) -> Option<Arc<BufferObject>> {
        self.objects.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drop every handle
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

/// Take the first non-zero id from `*next` on that is not `in_use`
fn next_free(next: &mut u32, live: usize, in_use: impl Fn(u32) -> bool) -> Result<u32> {
    if live >= u32::MAX as usize {
        return Err(Error::OutOfMemory);
    }

    loop {
        let id = *next;
        *next = next.wrapping_add(1).max(1);
        if !in_use(id) {
            return Ok(id);
        }
    }
}

/// Non-zero ids that stay reserved until released
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: u32,
    live: HashSet<u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            live: HashSet::new(),
        }
    }

    pub fn alloc(&mut self) -> Result<u32> {
        let live = &self.live;
        let id = next_free(&mut self.next, live.len(), |id| live.contains(&id))?;
        self.live.insert(id);
        Ok(id)
    }

    pub fn release(&mut self, id: u32) {
        self.live.remove(&id);
    }

    #[cfg(test)]
    pub fn skip_to(&mut self, next: u32) {
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dumb_layout() {
        let layout = DumbLayout::new(800, 600, 32).unwrap();
        assert_eq!(layout.pitch, 3200);
        assert_eq!(layout.size, 3200 * 600);

        // 24 bpp rounds to 3 bytes per pixel, size rounds up to a page
        let layout = DumbLayout::new(130, 7, 24).unwrap();
        assert_eq!(layout.pitch, 390);
        assert_eq!(layout.size, PAGE_SIZE);

        assert_eq!(DumbLayout::new(0, 600, 32), Err(Error::InvalidArgument));
        assert_eq!(DumbLayout::new(800, 600, 0), Err(Error::InvalidArgument));
        assert_eq!(
            DumbLayout::new(u32::MAX, 2, 32),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_store_tracks_live_objects() {
        let store = BufferStore::new();
        let (a, _) = store.create_dumb(128, 128, 32).unwrap();
        let (b, _) = store.create_dumb(128, 128, 32).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.mmap_offset(), b.mmap_offset());
        assert_eq!(store.live_objects(), 2);

        let extra = a.clone();
        drop(a);
        assert_eq!(store.live_objects(), 2);
        drop(extra);
        drop(b);
        assert_eq!(store.live_objects(), 0);
    }

    #[test]
    fn test_read_write_bounds() {
        let store = BufferStore::new();
        let bo = store.allocate(16).unwrap();
        assert_eq!(bo.size(), PAGE_SIZE);

        bo.write(8, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 6];
        bo.read(6, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 4]);

        assert_eq!(bo.write(PAGE_SIZE - 2, &[0; 4]), Err(Error::InvalidArgument));
        assert_eq!(bo.read(usize::MAX, &mut out), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_gem_table_handles() {
        let store = BufferStore::new();
        let mut table = GemTable::new();

        let h1 = table.insert(store.allocate(1).unwrap()).unwrap();
        let h2 = table.insert(store.allocate(1).unwrap()).unwrap();
        assert_ne!(h1, 0);
        assert_ne!(h1, h2);
        assert_eq!(table.len(), 2);

        assert!(table.remove(h1).is_some());
        assert!(table.get(h1).is_none());
        assert!(table.get(h2).is_some());

        table.clear();
        assert!(table.is_empty());
        assert_eq!(store.live_objects(), 0);
    }

    #[test]
    fn test_gem_handles_skip_live_entries_after_wrap() {
        let store = BufferStore::new();
        let mut table = GemTable::new();

        let first = store.allocate(1).unwrap();
        assert_eq!(table.insert(first.clone()).unwrap(), 1);
        table.next_handle = u32::MAX;
        assert_eq!(table.insert(store.allocate(1).unwrap()).unwrap(), u32::MAX);

        // Wraps past 0 and the live handle 1
        assert_eq!(table.insert(store.allocate(1).unwrap()).unwrap(), 2);
        assert_eq!(table.len(), 3);
        assert!(Arc::ptr_eq(&table.get(1).unwrap(), &first));
    }

    #[test]
    fn test_id_allocator_reuses_released_ids() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc().unwrap(), 1);
        assert_eq!(ids.alloc().unwrap(), 2);

        ids.skip_to(u32::MAX);
        assert_eq!(ids.alloc().unwrap(), u32::MAX);
        assert_eq!(ids.alloc().unwrap(), 3);

        ids.release(1);
        ids.skip_to(1);
        assert_eq!(ids.alloc().unwrap(), 1);
        assert_eq!(ids.alloc().unwrap(), 4);
    }

    #[test]
    fn test_exhausted_ids() {
        let mut next = 7;
        assert_eq!(
            next_free(&mut next, u32::MAX as usize, |_| false),
            Err(Error::OutOfMemory)
        );
        assert_eq!(next, 7);
    }
}
