//! Upload heap
//!
//! Per-context linear allocator of host-visible staging memory. Pages are
//! borrowed from the device-wide [`UploadPageManager`] and returned through the
//! release queues at the end of every frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::foundation::align::align_up;
use crate::foundation::logging::{debug, error, info};
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::native::{NativeDevice, NativeObject};
use crate::render::vulkan::release_queue::StaleResource;

/// A host-visible staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPage {
    /// Buffer usable as a transfer source
    pub buffer: vk::Buffer,
    /// Persistently mapped memory backing `buffer`
    pub memory: vk::DeviceMemory,
    /// Size in bytes
    pub size: vk::DeviceSize,
}

/// Device-wide pool of upload pages, bucketed by page size
pub struct UploadPageManager {
    device: Arc<dyn NativeDevice>,
    free_pages: Mutex<HashMap<vk::DeviceSize, Vec<UploadPage>>>,
    page_count: AtomicUsize,
}

impl UploadPageManager {
    /// Create an empty pool
    pub fn new(device: Arc<dyn NativeDevice>) -> Self {
        Self {
            device,
            free_pages: Mutex::new(HashMap::new()),
            page_count: AtomicUsize::new(0),
        }
    }

    /// Reuse a free page of exactly `size` bytes or create a new one
    pub fn acquire(&self, size: vk::DeviceSize) -> VulkanResult<UploadPage> {
        if let Some(page) = self.free_pages.lock().get_mut(&size).and_then(Vec::pop) {
            return Ok(page);
        }

        let (buffer, memory) = self.device.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        self.page_count.fetch_add(1, Ordering::Relaxed);
        debug!("Created {} byte upload page", size);
        Ok(UploadPage { buffer, memory, size })
    }

    /// Return a page the GPU no longer uses
    pub fn recycle(&self, page: UploadPage) {
        self.free_pages.lock().entry(page.size).or_default().push(page);
    }

    /// Wrap `page` into a release-queue entry that recycles it
    pub fn stale_page(self: &Arc<Self>, page: UploadPage) -> Arc<StaleResource> {
        let manager = Arc::clone(self);
        StaleResource::new(move || manager.recycle(page))
    }

    /// Number of pages created so far
    pub fn page_count(&self) -> usize {
        self.page_count.load(Ordering::Relaxed)
    }

    /// Number of pages ready for reuse
    pub fn free_page_count(&self) -> usize {
        self.free_pages.lock().values().map(Vec::len).sum()
    }
}

impl Drop for UploadPageManager {
    fn drop(&mut self) {
        let free_pages = std::mem::take(self.free_pages.get_mut());
        let free_count: usize = free_pages.values().map(Vec::len).sum();
        if free_count != self.page_count() {
            error!(
                "{} upload page(s) were not returned to the page manager",
                self.page_count() - free_count
            );
        }
        for page in free_pages.into_values().flatten() {
            self.device.destroy(NativeObject::Buffer {
                buffer: page.buffer,
                memory: page.memory,
            });
        }
    }
}

/// Staging memory handed out by [`UploadHeap::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocation {
    /// Buffer to copy from
    pub buffer: vk::Buffer,
    /// Memory to write the data into
    pub memory: vk::DeviceMemory,
    /// Aligned offset of the allocation within `buffer`
    pub offset: vk::DeviceSize,
    /// Requested size
    pub size: vk::DeviceSize,
}

#[derive(Debug, Default)]
struct CurrentPage {
    page: Option<UploadPage>,
    offset: vk::DeviceSize,
}

/// Per-context upload heap
pub struct UploadHeap {
    device: Arc<RenderDevice>,
    name: String,
    page_size: vk::DeviceSize,
    pages: Vec<UploadPage>,
    current: CurrentPage,

    frame_size: vk::DeviceSize,
    peak_frame_size: vk::DeviceSize,
    allocated_size: vk::DeviceSize,
    peak_allocated_size: vk::DeviceSize,
}

impl UploadHeap {
    /// Create an empty heap that borrows pages of `page_size` bytes
    pub fn new(device: Arc<RenderDevice>, name: impl Into<String>, page_size: vk::DeviceSize) -> Self {
        Self {
            device,
            name: name.into(),
            page_size,
            pages: Vec::new(),
            current: CurrentPage::default(),
            frame_size: 0,
            peak_frame_size: 0,
            allocated_size: 0,
            peak_allocated_size: 0,
        }
    }

    /// Allocate `size` bytes whose offset is a multiple of `alignment` (a power of two).
    ///
    /// Requests of half a page or more get a page of their own.
    pub fn allocate(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> VulkanResult<UploadAllocation> {
        debug_assert!(alignment.is_power_of_two(), "alignment ({alignment}) must be a power of two");

        let allocation = if size >= self.page_size / 2 {
            let page = self.acquire_page(size)?;
            UploadAllocation {
                buffer: page.buffer,
                memory: page.memory,
                offset: 0,
                size,
            }
        } else {
            let page = match self.current.page {
                Some(page) if align_up(self.current.offset, alignment) + size <= page.size => page,
                _ => {
                    let page = self.acquire_page(self.page_size)?;
                    self.current = CurrentPage {
                        page: Some(page),
                        offset: 0,
                    };
                    page
                }
            };

            let offset = align_up(self.current.offset, alignment);
            self.current.offset = offset + size;
            UploadAllocation {
                buffer: page.buffer,
                memory: page.memory,
                offset,
                size,
            }
        };

        self.frame_size += size;
        self.peak_frame_size = self.peak_frame_size.max(self.frame_size);
        Ok(allocation)
    }

    fn acquire_page(&mut self, size: vk::DeviceSize) -> VulkanResult<UploadPage> {
        let page = self.device.upload_page_manager().acquire(size)?;
        self.pages.push(page);
        self.allocated_size += page.size;
        self.peak_allocated_size = self.peak_allocated_size.max(self.allocated_size);
        Ok(page)
    }

    /// Hand every page used this frame to the release queues of `queue_mask`
    pub fn release_allocated_pages(&mut self, queue_mask: u64) {
        let manager = self.device.upload_page_manager();
        for page in self.pages.drain(..) {
            self.device
                .safe_release_device_object(manager.stale_page(page), queue_mask);
        }

        self.current = CurrentPage::default();
        self.frame_size = 0;
        self.allocated_size = 0;
    }

    /// Number of pages borrowed during the current frame
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Bytes requested during the current frame
    pub fn frame_size(&self) -> vk::DeviceSize {
        self.frame_size
    }

    /// Largest per-frame request total so far
    pub fn peak_frame_size(&self) -> vk::DeviceSize {
        self.peak_frame_size
    }
}

impl Drop for UploadHeap {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            error!("{}: {} page(s) were never released", self.name, self.pages.len());
        }
        info!(
            "{} peak used/allocated frame size: {} / {} bytes ({} page(s))",
            self.name,
            self.peak_frame_size,
            self.peak_allocated_size,
            self.peak_allocated_size / self.page_size.max(1)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineVkConfig;
    use crate::render::vulkan::mock::MockDevice;

    const PAGE_SIZE: u64 = 4096;

    fn test_device() -> (Arc<MockDevice>, Arc<RenderDevice>) {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();
        (native, device)
    }

    #[test]
    fn test_offsets_respect_alignment() {
        let (_native, device) = test_device();
        let mut heap = UploadHeap::new(device, "test upload heap", PAGE_SIZE);

        for (size, alignment) in [(3, 1), (5, 4), (17, 16), (1, 256), (100, 64), (7, 8)] {
            let allocation = heap.allocate(size, alignment).unwrap();
            assert_eq!(allocation.offset % alignment, 0, "size {size} alignment {alignment}");
            assert_eq!(allocation.size, size);
        }
        assert_eq!(heap.page_count(), 1);
        heap.release_allocated_pages(1);
    }

    #[test]
    fn test_new_page_when_current_is_full() {
        let (_native, device) = test_device();
        let mut heap = UploadHeap::new(device, "test upload heap", PAGE_SIZE);

        let first = heap.allocate(1500, 4).unwrap();
        let second = heap.allocate(1500, 4).unwrap();
        let third = heap.allocate(1500, 4).unwrap();

        assert_eq!(first.buffer, second.buffer);
        assert_eq!(second.offset, 1500);
        assert_ne!(third.buffer, first.buffer);
        assert_eq!(third.offset, 0);
        assert_eq!(heap.page_count(), 2);
        heap.release_allocated_pages(1);
    }

    #[test]
    fn test_large_request_gets_dedicated_page() {
        let (_native, device) = test_device();
        let mut heap = UploadHeap::new(device.clone(), "test upload heap", PAGE_SIZE);

        let small = heap.allocate(16, 4).unwrap();
        let large = heap.allocate(PAGE_SIZE / 2, 4).unwrap();
        let after = heap.allocate(16, 4).unwrap();

        assert_ne!(large.buffer, small.buffer);
        assert_eq!(large.offset, 0);
        // The dedicated page does not replace the current page
        assert_eq!(after.buffer, small.buffer);
        assert_eq!(heap.frame_size(), 16 + PAGE_SIZE / 2 + 16);
        heap.release_allocated_pages(1);
    }

    #[test]
    fn test_released_pages_are_reused_after_fence() {
        let (native, device) = test_device();
        let mut heap = UploadHeap::new(device.clone(), "test upload heap", PAGE_SIZE);

        heap.allocate(64, 4).unwrap();
        heap.release_allocated_pages(1);
        assert_eq!(device.upload_page_manager().free_page_count(), 0);

        native.hold_fences(true);
        device.flush_stale_resources(0).unwrap();
        device.purge_release_queues(false);
        assert_eq!(device.upload_page_manager().free_page_count(), 0);

        native.complete_all();
        device.purge_release_queues(false);
        assert_eq!(device.upload_page_manager().free_page_count(), 1);

        heap.allocate(64, 4).unwrap();
        assert_eq!(device.upload_page_manager().page_count(), 1);
        heap.release_allocated_pages(1);
    }
}
