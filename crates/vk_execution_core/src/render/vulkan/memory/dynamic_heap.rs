//! Dynamic heap
//!
//! One host-visible buffer per device is split into master blocks by
//! [`DynamicMemoryManager`]. Each device context owns a [`DynamicHeap`] that
//! bump-allocates dynamic buffer contents from its master blocks and returns
//! them through the release queues when the frame ends.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::Mutex;

use crate::core::config::MASTER_BLOCK_ALIGNMENT;
use crate::foundation::align::align_up;
use crate::foundation::logging::{error, info, warn};
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::{VulkanError, VulkanResult};
use crate::render::vulkan::native::{NativeDevice, NativeObject};
use crate::render::vulkan::release_queue::StaleResource;

const RETRY_SLEEP: Duration = Duration::from_millis(1);
const MAX_RETRY_DURATION: Duration = Duration::from_millis(60);

/// Region of the dynamic buffer owned by one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterBlock {
    /// Offset of the block start, before any alignment padding
    pub unaligned_offset: u64,
    /// Size including padding
    pub size: u64,
}

/// First-fit allocator over a linear range with coalescing frees
#[derive(Debug)]
struct FreeListAllocator {
    free: BTreeMap<u64, u64>,
    size: u64,
    used: u64,
}

impl FreeListAllocator {
    fn new(size: u64) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self { free, size, used: 0 }
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> Option<MasterBlock> {
        let (offset, len, aligned) = self.free.iter().find_map(|(&offset, &len)| {
            let aligned = align_up(offset, alignment);
            (aligned + size <= offset + len).then_some((offset, len, aligned))
        })?;

        self.free.remove(&offset);
        let block = MasterBlock {
            unaligned_offset: offset,
            size: aligned - offset + size,
        };
        if block.size < len {
            self.free.insert(offset + block.size, len - block.size);
        }
        self.used += block.size;
        Some(block)
    }

    fn free(&mut self, block: MasterBlock) {
        let mut offset = block.unaligned_offset;
        let mut size = block.size;
        self.used -= block.size;

        if let Some((&prev_offset, &prev_size)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            size += next_size;
        }
        self.free.insert(offset, size);
    }
}

/// Device-wide owner of the dynamic buffer
pub struct DynamicMemoryManager {
    device: Arc<dyn NativeDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    default_alignment: u64,
    allocator: Mutex<FreeListAllocator>,
    peak_used: AtomicU64,
    master_block_count: AtomicUsize,
}

impl DynamicMemoryManager {
    /// Create the dynamic buffer. `size` must be a multiple of the master block alignment.
    pub fn new(device: Arc<dyn NativeDevice>, size: u64) -> VulkanResult<Self> {
        if size % MASTER_BLOCK_ALIGNMENT != 0 {
            return Err(VulkanError::InvalidConfig(format!(
                "Dynamic heap size ({size}) is not a multiple of the master block alignment ({MASTER_BLOCK_ALIGNMENT})"
            )));
        }

        let (buffer, memory) = device.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDIRECT_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let default_alignment = device.limits().max_buffer_offset_alignment();
        info!("GPU dynamic heap created. Total buffer size: {} KiB", size >> 10);

        Ok(Self {
            device,
            buffer,
            memory,
            default_alignment,
            allocator: Mutex::new(FreeListAllocator::new(size)),
            peak_used: AtomicU64::new(0),
            master_block_count: AtomicUsize::new(0),
        })
    }

    /// Dynamic buffer handle
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Memory backing the dynamic buffer
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Total size of the dynamic buffer
    pub fn size(&self) -> u64 {
        self.allocator.lock().size
    }

    /// Bytes currently held by master blocks
    pub fn used_size(&self) -> u64 {
        self.allocator.lock().used
    }

    /// Alignment satisfying every buffer offset requirement of the device
    pub fn default_alignment(&self) -> u64 {
        self.default_alignment
    }

    /// Number of master blocks that have not been freed
    pub fn master_block_count(&self) -> usize {
        self.master_block_count.load(Ordering::Relaxed)
    }

    /// Allocate a master block without waiting for the GPU.
    ///
    /// Zero alignment means the master block alignment.
    pub fn try_allocate_master_block(&self, size: u64, alignment: u64) -> Option<MasterBlock> {
        let alignment = alignment.max(MASTER_BLOCK_ALIGNMENT);
        let mut allocator = self.allocator.lock();
        let block = allocator.allocate(align_up(size, MASTER_BLOCK_ALIGNMENT), alignment)?;
        self.peak_used.fetch_max(allocator.used, Ordering::Relaxed);
        self.master_block_count.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    /// Allocate a master block, waiting for the GPU to retire older blocks if the heap is full.
    ///
    /// Purges the release queues for a short while, then idles the GPU as a
    /// last resort before failing.
    pub fn allocate_master_block(&self, device: &RenderDevice, size: u64, alignment: u64) -> VulkanResult<MasterBlock> {
        let total = self.size();
        if size > total {
            error!(
                "Requested dynamic allocation size {size} exceeds maximum dynamic memory size {total}. \
                 The app should increase dynamic heap size."
            );
            return Err(VulkanError::OutOfMemory { requested: size });
        }

        if let Some(block) = self.try_allocate_master_block(size, alignment) {
            return Ok(block);
        }

        let start = Instant::now();
        let mut sleep_iterations = 0u32;
        while start.elapsed() < MAX_RETRY_DURATION {
            device.purge_release_queues(false);
            if let Some(block) = self.try_allocate_master_block(size, alignment) {
                if sleep_iterations == 0 {
                    warn!("Space in dynamic heap is almost exhausted forcing mid-frame shrinkage");
                } else {
                    warn!(
                        "Space in dynamic heap is almost exhausted. Allocation forced wait time of {:.1} ms",
                        start.elapsed().as_secs_f64() * 1000.0
                    );
                }
                return Ok(block);
            }
            thread::sleep(RETRY_SLEEP);
            sleep_iterations += 1;
        }

        device.idle_gpu()?;
        match self.try_allocate_master_block(size, alignment) {
            Some(block) => {
                warn!("Space in dynamic heap is almost exhausted. Allocation forced idling the GPU");
                Ok(block)
            }
            None => {
                error!(
                    "Space in dynamic heap is exhausted! After idling for {:.1} ms still no space is available. \
                     Increase the dynamic heap size or optimize dynamic resource usage",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                Err(VulkanError::OutOfMemory { requested: size })
            }
        }
    }

    /// Return a master block to the free list
    pub fn free_master_block(&self, block: MasterBlock) {
        self.allocator.lock().free(block);
        self.master_block_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Wrap `block` into a release-queue entry that frees it
    pub fn stale_master_block(self: &Arc<Self>, block: MasterBlock) -> Arc<StaleResource> {
        let manager = Arc::clone(self);
        StaleResource::new(move || manager.free_master_block(block))
    }
}

impl Drop for DynamicMemoryManager {
    fn drop(&mut self) {
        if self.master_block_count() != 0 {
            error!(
                "{} dynamic master block(s) have not been returned to the manager",
                self.master_block_count()
            );
        }
        let size = self.allocator.get_mut().size;
        let peak = self.peak_used.load(Ordering::Relaxed);
        info!(
            "Dynamic memory manager usage stats: total size {} KiB, peak allocated size {} KiB, peak utilization {:.1}%",
            size >> 10,
            peak >> 10,
            peak as f64 / size.max(1) as f64 * 100.0
        );
        self.device.destroy(NativeObject::Buffer {
            buffer: self.buffer,
            memory: self.memory,
        });
    }
}

/// Memory handed out by [`DynamicHeap::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicAllocation {
    /// The device-wide dynamic buffer
    pub buffer: vk::Buffer,
    /// Memory backing `buffer`
    pub memory: vk::DeviceMemory,
    /// Aligned offset within `buffer`
    pub offset: u64,
    /// Requested size
    pub size: u64,
}

/// Per-context linear allocator over borrowed master blocks
pub struct DynamicHeap {
    device: Arc<RenderDevice>,
    name: String,
    master_block_size: u64,
    master_blocks: Vec<MasterBlock>,
    current_offset: Option<u64>,
    available_size: u64,

    used_size: u64,
    aligned_size: u64,
    allocated_size: u64,
    peak_used_size: u64,
    peak_aligned_size: u64,
    peak_allocated_size: u64,
}

impl DynamicHeap {
    /// Create a heap that borrows master blocks of `master_block_size` bytes
    pub fn new(device: Arc<RenderDevice>, name: impl Into<String>, master_block_size: u64) -> Self {
        Self {
            device,
            name: name.into(),
            master_block_size,
            master_blocks: Vec::new(),
            current_offset: None,
            available_size: 0,
            used_size: 0,
            aligned_size: 0,
            allocated_size: 0,
            peak_used_size: 0,
            peak_aligned_size: 0,
            peak_allocated_size: 0,
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    ///
    /// Zero alignment means the device's largest buffer offset alignment.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> VulkanResult<DynamicAllocation> {
        let manager = Arc::clone(self.device.dynamic_memory_manager());
        let alignment = if alignment == 0 {
            manager.default_alignment()
        } else {
            alignment
        };
        debug_assert!(alignment.is_power_of_two(), "alignment ({alignment}) must be a power of two");

        let (offset, aligned_size) = if size > self.master_block_size / 2 {
            let block = manager.allocate_master_block(&self.device, size, alignment)?;
            self.track_master_block(block);
            (align_up(block.unaligned_offset, alignment), block.size)
        } else {
            let fits = self
                .current_offset
                .is_some_and(|current| align_up(current, alignment) - current + size <= self.available_size);
            if !fits {
                let block = manager.allocate_master_block(&self.device, self.master_block_size, 0)?;
                self.track_master_block(block);
                self.current_offset = Some(block.unaligned_offset);
                self.available_size = block.size;
            }

            let current = self.current_offset.unwrap_or_default();
            let offset = align_up(current, alignment);
            let aligned_size = offset - current + size;
            if aligned_size > self.available_size {
                return Err(VulkanError::OutOfMemory { requested: size });
            }
            self.available_size -= aligned_size;
            self.current_offset = Some(current + aligned_size);
            (offset, aligned_size)
        };

        self.used_size += size;
        self.aligned_size += aligned_size;
        self.peak_used_size = self.peak_used_size.max(self.used_size);
        self.peak_aligned_size = self.peak_aligned_size.max(self.aligned_size);

        Ok(DynamicAllocation {
            buffer: manager.buffer(),
            memory: manager.memory(),
            offset,
            size,
        })
    }

    fn track_master_block(&mut self, block: MasterBlock) {
        self.allocated_size += block.size;
        self.peak_allocated_size = self.peak_allocated_size.max(self.allocated_size);
        self.master_blocks.push(block);
    }

    /// Hand every master block used this frame to the release queues of `queue_mask`
    pub fn release_master_blocks(&mut self, queue_mask: u64) {
        let manager = self.device.dynamic_memory_manager();
        for block in self.master_blocks.drain(..) {
            self.device
                .safe_release_device_object(manager.stale_master_block(block), queue_mask);
        }

        self.current_offset = None;
        self.available_size = 0;
        self.used_size = 0;
        self.aligned_size = 0;
        self.allocated_size = 0;
    }

    /// Number of master blocks borrowed during the current frame
    pub fn master_block_count(&self) -> usize {
        self.master_blocks.len()
    }

    /// Bytes requested during the current frame
    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    /// Largest per-frame request total so far
    pub fn peak_used_size(&self) -> u64 {
        self.peak_used_size
    }
}

impl Drop for DynamicHeap {
    fn drop(&mut self) {
        if !self.master_blocks.is_empty() {
            error!(
                "{}: {} master block(s) have not been returned to the dynamic memory manager",
                self.name,
                self.master_blocks.len()
            );
        }
        info!(
            "{} usage stats: peak used/aligned/allocated size {} / {} / {} bytes ({} page(s)). \
             Peak efficiency (used/aligned): {:.1}%",
            self.name,
            self.peak_used_size,
            self.peak_aligned_size,
            self.peak_allocated_size,
            self.peak_allocated_size / self.master_block_size.max(1),
            self.peak_used_size as f64 / self.peak_aligned_size.max(1) as f64 * 100.0
        );
    }
}
