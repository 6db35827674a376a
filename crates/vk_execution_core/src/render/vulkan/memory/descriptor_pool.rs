//! Descriptor pool management
//!
//! - [`DescriptorPoolManager`] hands out reset descriptor pools and takes them back.
//! - [`DescriptorSetAllocator`] allocates long-lived sets that are freed one by one.
//! - [`DynamicDescriptorSetAllocator`] is owned by a device context and allocates
//!   sets that live for one frame. Its pools go back to the manager at frame end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::core::DescriptorPoolSize;
use crate::foundation::logging::{debug, error, info};
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::{VulkanError, VulkanResult};
use crate::render::vulkan::native::{NativeDevice, NativeObject};
use crate::render::vulkan::release_queue::StaleResource;

fn is_pool_exhausted(err: &VulkanError) -> bool {
    matches!(
        err,
        VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)
    )
}

/// Device-wide recycler of native descriptor pools
pub struct DescriptorPoolManager {
    device: Arc<dyn NativeDevice>,
    name: String,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    free_pools: Mutex<VecDeque<vk::DescriptorPool>>,
    allocated_pools: AtomicUsize,
}

impl DescriptorPoolManager {
    /// Create a manager whose pools hold the given descriptor counts
    pub fn new(device: Arc<dyn NativeDevice>, name: impl Into<String>, size: &DescriptorPoolSize) -> Self {
        Self {
            device,
            name: name.into(),
            pool_sizes: size.to_vk_pool_sizes(),
            max_sets: size.max_descriptor_sets,
            free_pools: Mutex::new(VecDeque::new()),
            allocated_pools: AtomicUsize::new(0),
        }
    }

    /// Reuse a free pool or create a new one
    pub fn get_pool(&self) -> VulkanResult<vk::DescriptorPool> {
        let pool = match self.free_pools.lock().pop_front() {
            Some(pool) => pool,
            None => {
                let pool = self.device.create_descriptor_pool(&self.pool_sizes, self.max_sets, false)?;
                debug!("{}: created descriptor pool {:?}", self.name, pool);
                pool
            }
        };
        self.allocated_pools.fetch_add(1, Ordering::Relaxed);
        Ok(pool)
    }

    /// Reset `pool` and make it available again. Only call once the GPU is done with it.
    pub fn free_pool(&self, pool: vk::DescriptorPool) {
        self.allocated_pools.fetch_sub(1, Ordering::Relaxed);
        match self.device.reset_descriptor_pool(pool) {
            Ok(()) => self.free_pools.lock().push_back(pool),
            Err(err) => {
                error!("{}: failed to reset descriptor pool: {err}", self.name);
                self.device.destroy(NativeObject::DescriptorPool(pool));
            }
        }
    }

    /// Wrap `pool` into a release-queue entry that frees it
    pub fn stale_pool(self: &Arc<Self>, pool: vk::DescriptorPool) -> Arc<StaleResource> {
        let manager = Arc::clone(self);
        StaleResource::new(move || manager.free_pool(pool))
    }

    /// Number of pools currently handed out
    pub fn allocated_pool_count(&self) -> usize {
        self.allocated_pools.load(Ordering::Relaxed)
    }

    /// Number of pools ready for reuse
    pub fn free_pool_count(&self) -> usize {
        self.free_pools.lock().len()
    }
}

impl Drop for DescriptorPoolManager {
    fn drop(&mut self) {
        if self.allocated_pool_count() != 0 {
            error!(
                "{}: {} descriptor pool(s) have not been returned",
                self.name,
                self.allocated_pool_count()
            );
        }
        for pool in self.free_pools.get_mut().drain(..) {
            self.device.destroy(NativeObject::DescriptorPool(pool));
        }
    }
}

/// Descriptor set together with the pool it must be freed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSetAllocation {
    /// Descriptor set
    pub set: vk::DescriptorSet,
    /// Owning pool
    pub pool: vk::DescriptorPool,
}

/// Allocator of long-lived descriptor sets
pub struct DescriptorSetAllocator {
    device: Arc<dyn NativeDevice>,
    name: String,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    pools: Mutex<Vec<vk::DescriptorPool>>,
    allocated_sets: AtomicUsize,
}

impl DescriptorSetAllocator {
    /// Create an allocator whose pools hold the given descriptor counts
    pub fn new(device: Arc<dyn NativeDevice>, name: impl Into<String>, size: &DescriptorPoolSize) -> Self {
        Self {
            device,
            name: name.into(),
            pool_sizes: size.to_vk_pool_sizes(),
            max_sets: size.max_descriptor_sets,
            pools: Mutex::new(Vec::new()),
            allocated_sets: AtomicUsize::new(0),
        }
    }

    /// Allocate a set with the given layout, growing the pool list when every pool is full
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> VulkanResult<DescriptorSetAllocation> {
        let mut pools = self.pools.lock();

        // Newest pools are the most likely to have room
        for &pool in pools.iter().rev() {
            match self.device.allocate_descriptor_set(pool, layout) {
                Ok(set) => {
                    self.allocated_sets.fetch_add(1, Ordering::Relaxed);
                    return Ok(DescriptorSetAllocation { set, pool });
                }
                Err(err) if is_pool_exhausted(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        let pool = self.device.create_descriptor_pool(&self.pool_sizes, self.max_sets, true)?;
        pools.push(pool);
        info!("{}: allocated descriptor pool #{}", self.name, pools.len());

        let set = self.device.allocate_descriptor_set(pool, layout)?;
        self.allocated_sets.fetch_add(1, Ordering::Relaxed);
        Ok(DescriptorSetAllocation { set, pool })
    }

    /// Free a set. Only call once the GPU is done with it.
    pub fn free(&self, allocation: DescriptorSetAllocation) {
        self.device.free_descriptor_set(allocation.pool, allocation.set);
        self.allocated_sets.fetch_sub(1, Ordering::Relaxed);
    }

    /// Wrap `allocation` into a release-queue entry that frees it
    pub fn stale_set(self: &Arc<Self>, allocation: DescriptorSetAllocation) -> Arc<StaleResource> {
        let allocator = Arc::clone(self);
        StaleResource::new(move || allocator.free(allocation))
    }

    /// Number of sets not yet freed
    pub fn allocated_set_count(&self) -> usize {
        self.allocated_sets.load(Ordering::Relaxed)
    }
}

impl Drop for DescriptorSetAllocator {
    fn drop(&mut self) {
        if self.allocated_set_count() != 0 {
            error!(
                "{}: {} descriptor set(s) have not been released",
                self.name,
                self.allocated_set_count()
            );
        }
        for pool in self.pools.get_mut().drain(..) {
            self.device.destroy(NativeObject::DescriptorPool(pool));
        }
    }
}

/// Per-context allocator of single-frame descriptor sets
pub struct DynamicDescriptorSetAllocator {
    device: Arc<RenderDevice>,
    name: String,
    pools: Vec<vk::DescriptorPool>,
    peak_pool_count: usize,
}

impl DynamicDescriptorSetAllocator {
    /// Create an allocator that borrows pools from the device's dynamic pool manager
    pub fn new(device: Arc<RenderDevice>, name: impl Into<String>) -> Self {
        Self {
            device,
            name: name.into(),
            pools: Vec::new(),
            peak_pool_count: 0,
        }
    }

    /// Allocate a set from the current pool, taking a fresh pool when it is exhausted
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        let native = self.device.native();
        if let Some(&pool) = self.pools.last() {
            match native.allocate_descriptor_set(pool, layout) {
                Ok(set) => return Ok(set),
                Err(err) if is_pool_exhausted(&err) => {}
                Err(err) => return Err(err),
            }
        }

        let pool = self.device.dynamic_descriptor_pools().get_pool()?;
        self.pools.push(pool);
        self.peak_pool_count = self.peak_pool_count.max(self.pools.len());
        native.allocate_descriptor_set(pool, layout)
    }

    /// Hand every pool used this frame to the release queues of `queue_mask`
    pub fn release_pools(&mut self, queue_mask: u64) {
        let manager = self.device.dynamic_descriptor_pools();
        for pool in self.pools.drain(..) {
            self.device.safe_release_device_object(manager.stale_pool(pool), queue_mask);
        }
    }

    /// Number of pools borrowed during the current frame
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

impl Drop for DynamicDescriptorSetAllocator {
    fn drop(&mut self) {
        if !self.pools.is_empty() {
            error!("{}: {} pool(s) have not been released", self.name, self.pools.len());
        }
        info!("{} peak descriptor pool count: {}", self.name, self.peak_pool_count);
    }
}
