//! Render device
//!
//! [`RenderDevice`] owns everything shared by device contexts:
//!
//! - hardware queues with their fence timelines and release queues
//! - render pass and framebuffer caches
//! - upload page, dynamic memory and descriptor pool managers
//!
//! Contexts and resources hold an `Arc<RenderDevice>`. Objects they release go
//! through [`RenderDevice::safe_release_device_object`] and are destroyed or
//! recycled once every queue that may reference them has moved past the
//! submission that used them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::commands::{CommandBuffer, CommandBufferPool};
use super::error::{VulkanError, VulkanResult};
use super::framebuffer::{FramebufferCache, FramebufferCacheKey};
use super::memory::{DescriptorPoolManager, DescriptorSetAllocator, DynamicMemoryManager, UploadPageManager};
use super::native::{DeviceLimits, NativeDevice, NativeObject, SubmitBatch};
use super::release_queue::{ReleaseQueue, StaleResource};
use super::render_pass::{RenderPassCache, RenderPassCacheKey};
use super::sync::{FencePool, FenceTimeline, FenceValue};
use crate::core::EngineVkConfig;
use crate::foundation::logging::{debug, error, info};

/// Hardware queue with its own fence timeline
pub struct CommandQueue {
    device: Arc<dyn NativeDevice>,
    queue_index: u32,
    queue_family_index: u32,
    fence_pool: Arc<FencePool>,
    timeline: FenceTimeline,
    next_fence_value: Mutex<FenceValue>,
}

impl CommandQueue {
    /// Wrap the native queue `queue_index`
    pub fn new(
        device: Arc<dyn NativeDevice>,
        queue_index: u32,
        queue_family_index: u32,
        fence_pool: Arc<FencePool>,
    ) -> Self {
        let timeline = FenceTimeline::new(Arc::clone(&device), Arc::clone(&fence_pool));
        Self {
            device,
            queue_index,
            queue_family_index,
            fence_pool,
            timeline,
            next_fence_value: Mutex::new(FenceValue::new(1)),
        }
    }

    /// Index of the native queue
    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    /// Queue family of the native queue
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Value the next submission will signal
    pub fn next_fence_value(&self) -> FenceValue {
        *self.next_fence_value.lock()
    }

    /// Poll the queue timeline
    pub fn completed_fence_value(&self) -> FenceValue {
        self.timeline.get_completed_value()
    }

    /// Timeline of this queue
    pub fn timeline(&self) -> &FenceTimeline {
        &self.timeline
    }

    /// Submit `batch` and return the fence value that marks its completion
    pub fn submit(&self, batch: &SubmitBatch) -> VulkanResult<FenceValue> {
        let mut next = self.next_fence_value.lock();
        let fence = self.fence_pool.get_fence()?;
        if let Err(err) = self.device.queue_submit(self.queue_index, batch, fence) {
            self.fence_pool.dispose_fence(fence);
            return Err(err);
        }

        let value = *next;
        *next = value.next();
        self.timeline.add_pending(value, fence);
        Ok(value)
    }

    /// Make `fence` reach `value` once everything submitted so far completes
    pub fn signal_fence(&self, fence: &FenceTimeline, value: FenceValue) -> VulkanResult<()> {
        let _next = self.next_fence_value.lock();
        let native_fence = self.fence_pool.get_fence()?;
        if let Err(err) = self.device.queue_submit(self.queue_index, &SubmitBatch::default(), native_fence) {
            self.fence_pool.dispose_fence(native_fence);
            return Err(err);
        }
        fence.add_pending(value, native_fence);
        Ok(())
    }

    /// Block until the queue drains and return the fence value now considered complete
    pub fn wait_for_idle(&self) -> VulkanResult<FenceValue> {
        let mut next = self.next_fence_value.lock();
        let value = *next;
        *next = value.next();

        self.device.queue_wait_idle(self.queue_index)?;
        self.timeline.wait(FenceValue::MAX)?;
        self.timeline.reset(value)?;
        Ok(value)
    }
}

struct QueueSlot {
    queue: CommandQueue,
    release_queue: ReleaseQueue,
    next_cmd_buffer_number: Mutex<u64>,
    transient_pool: Arc<CommandBufferPool>,
}

/// Device-wide state shared by every context
pub struct RenderDevice {
    native: Arc<dyn NativeDevice>,
    config: EngineVkConfig,
    queues: Vec<QueueSlot>,
    fence_pool: Arc<FencePool>,
    render_pass_cache: RenderPassCache,
    framebuffer_cache: FramebufferCache,
    upload_pages: Arc<UploadPageManager>,
    dynamic_memory: Arc<DynamicMemoryManager>,
    main_descriptor_sets: Arc<DescriptorSetAllocator>,
    dynamic_descriptor_pools: Arc<DescriptorPoolManager>,
    next_resource_id: AtomicU64,
}

impl RenderDevice {
    /// Create a device with a single queue from family 0
    pub fn new(native: Arc<dyn NativeDevice>, config: EngineVkConfig) -> VulkanResult<Arc<Self>> {
        Self::with_queues(native, config, &[0])
    }

    /// Create a device with one command queue per entry of `queue_family_indices`
    pub fn with_queues(
        native: Arc<dyn NativeDevice>,
        config: EngineVkConfig,
        queue_family_indices: &[u32],
    ) -> VulkanResult<Arc<Self>> {
        config.validate().map_err(VulkanError::InvalidConfig)?;
        if queue_family_indices.is_empty() || queue_family_indices.len() > 64 {
            return Err(VulkanError::InitializationFailed(format!(
                "Unsupported number of command queues: {}",
                queue_family_indices.len()
            )));
        }

        let fence_pool = Arc::new(FencePool::new(Arc::clone(&native)));
        let queues = queue_family_indices
            .iter()
            .enumerate()
            .map(|(index, &family)| {
                let transient_pool = CommandBufferPool::new(
                    Arc::clone(&native),
                    family,
                    vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    format!("Transient command pool (queue {index})"),
                )?;
                Ok(QueueSlot {
                    queue: CommandQueue::new(Arc::clone(&native), index as u32, family, Arc::clone(&fence_pool)),
                    release_queue: ReleaseQueue::new(),
                    next_cmd_buffer_number: Mutex::new(0),
                    transient_pool: Arc::new(transient_pool),
                })
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        let device = Self {
            render_pass_cache: RenderPassCache::new(Arc::clone(&native)),
            framebuffer_cache: FramebufferCache::new(Arc::clone(&native)),
            upload_pages: Arc::new(UploadPageManager::new(Arc::clone(&native))),
            dynamic_memory: Arc::new(DynamicMemoryManager::new(Arc::clone(&native), config.dynamic_heap_size)?),
            main_descriptor_sets: Arc::new(DescriptorSetAllocator::new(
                Arc::clone(&native),
                "Main descriptor pool",
                &config.main_descriptor_pool_size,
            )),
            dynamic_descriptor_pools: Arc::new(DescriptorPoolManager::new(
                Arc::clone(&native),
                "Dynamic descriptor pool",
                &config.dynamic_descriptor_pool_size,
            )),
            native,
            config,
            queues,
            fence_pool,
            next_resource_id: AtomicU64::new(1),
        };
        info!("Render device created with {} command queue(s)", device.queues.len());
        Ok(Arc::new(device))
    }

    /// Native device
    pub fn native(&self) -> &Arc<dyn NativeDevice> {
        &self.native
    }

    /// Device limits
    pub fn limits(&self) -> &DeviceLimits {
        self.native.limits()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineVkConfig {
        &self.config
    }

    /// Number of command queues
    pub fn command_queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Mask with one bit set per command queue
    pub fn command_queue_mask(&self) -> u64 {
        if self.queues.len() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.queues.len()) - 1
        }
    }

    /// Command queue `queue_index`
    pub fn command_queue(&self, queue_index: usize) -> &CommandQueue {
        &self.queues[queue_index].queue
    }

    /// Unique identifier for a new resource
    pub fn allocate_resource_id(&self) -> u64 {
        self.next_resource_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a client fence
    pub fn create_fence(&self) -> Arc<FenceTimeline> {
        Arc::new(FenceTimeline::new(Arc::clone(&self.native), Arc::clone(&self.fence_pool)))
    }

    /// Implicit render pass cache
    pub fn render_pass_cache(&self) -> &RenderPassCache {
        &self.render_pass_cache
    }

    /// Get or create the render pass for `key`
    pub fn get_render_pass(&self, key: &RenderPassCacheKey) -> VulkanResult<vk::RenderPass> {
        self.render_pass_cache.get_render_pass(key)
    }

    /// Get or create the framebuffer for `key`
    pub fn get_framebuffer(
        &self,
        key: &FramebufferCacheKey,
        width: u32,
        height: u32,
        layers: u32,
    ) -> VulkanResult<vk::Framebuffer> {
        self.framebuffer_cache.get_framebuffer(key, width, height, layers)
    }

    /// Framebuffer cache
    pub fn framebuffer_cache(&self) -> &FramebufferCache {
        &self.framebuffer_cache
    }

    /// Evict and release every framebuffer referencing `view`
    pub fn on_destroy_image_view(&self, view: vk::ImageView) {
        for evicted in self.framebuffer_cache.on_destroy_image_view(view) {
            self.safe_release_native_object(NativeObject::Framebuffer(evicted.framebuffer), evicted.command_queue_mask);
        }
    }

    /// Evict and release every framebuffer created for `render_pass`
    pub fn on_destroy_render_pass(&self, render_pass: vk::RenderPass) {
        for evicted in self.framebuffer_cache.on_destroy_render_pass(render_pass) {
            self.safe_release_native_object(NativeObject::Framebuffer(evicted.framebuffer), evicted.command_queue_mask);
        }
    }

    /// Upload page manager
    pub fn upload_page_manager(&self) -> &Arc<UploadPageManager> {
        &self.upload_pages
    }

    /// Dynamic memory manager
    pub fn dynamic_memory_manager(&self) -> &Arc<DynamicMemoryManager> {
        &self.dynamic_memory
    }

    /// Allocator of long-lived descriptor sets
    pub fn main_descriptor_sets(&self) -> &Arc<DescriptorSetAllocator> {
        &self.main_descriptor_sets
    }

    /// Manager of per-frame descriptor pools
    pub fn dynamic_descriptor_pools(&self) -> &Arc<DescriptorPoolManager> {
        &self.dynamic_descriptor_pools
    }

    /// Submit a command buffer batch.
    ///
    /// Returns the number assigned to the submission and its fence value. Stale
    /// resources released before the submission move to the release queue, then
    /// every fence in `signal_fences` is signaled after the batch.
    pub fn submit_command_buffer(
        &self,
        queue_index: usize,
        batch: &SubmitBatch,
        signal_fences: &[(FenceValue, Arc<FenceTimeline>)],
    ) -> VulkanResult<(u64, FenceValue)> {
        let slot = &self.queues[queue_index];
        let (cmd_buffer_number, fence_value) = {
            let mut next_number = slot.next_cmd_buffer_number.lock();
            let fence_value = slot.queue.submit(batch)?;
            let number = *next_number;
            *next_number += 1;
            (number, fence_value)
        };

        slot.release_queue.discard_stale_resources(cmd_buffer_number, fence_value);

        for (value, fence) in signal_fences {
            slot.queue.signal_fence(fence, *value)?;
        }
        Ok((cmd_buffer_number, fence_value))
    }

    /// Submit a batch from the immediate context and purge the release queue
    pub fn execute_command_buffer(
        &self,
        queue_index: usize,
        batch: &SubmitBatch,
        signal_fences: &[(FenceValue, Arc<FenceTimeline>)],
    ) -> VulkanResult<FenceValue> {
        let (_, fence_value) = self.submit_command_buffer(queue_index, batch, signal_fences)?;
        self.purge_release_queue(queue_index, false);
        Ok(fence_value)
    }

    /// Record and submit a one-shot command buffer.
    ///
    /// Transient submissions do not count as command buffers, so they never
    /// move stale resources into the release queue.
    pub fn execute_transient(
        &self,
        queue_index: usize,
        record: impl FnOnce(&mut CommandBuffer),
    ) -> VulkanResult<FenceValue> {
        let slot = &self.queues[queue_index];
        let handle = slot.transient_pool.allocate()?;

        let mut command_buffer = CommandBuffer::new(Arc::clone(&self.native));
        command_buffer.set_handle(handle);
        record(&mut command_buffer);
        command_buffer.end_command_buffer()?;
        command_buffer.reset();

        let batch = SubmitBatch {
            command_buffers: vec![handle],
            ..SubmitBatch::default()
        };
        let fence_value = match slot.queue.submit(&batch) {
            Ok(value) => value,
            Err(err) => {
                slot.transient_pool.recycle(handle);
                return Err(err);
            }
        };
        slot.release_queue
            .discard_resource(slot.transient_pool.stale_command_buffer(handle), fence_value);
        Ok(fence_value)
    }

    /// Release `resource` once every queue in `queue_mask` has finished the
    /// command buffers that may reference it
    pub fn safe_release_device_object(&self, resource: Arc<StaleResource>, queue_mask: u64) {
        let mut mask = queue_mask & self.command_queue_mask();
        while mask != 0 {
            let queue_index = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            let slot = &self.queues[queue_index];
            let next_number = *slot.next_cmd_buffer_number.lock();
            slot.release_queue.safe_release_resource(Arc::clone(&resource), next_number);
        }
        // An empty mask releases right here
    }

    /// Destroy a native object once the queues in `queue_mask` are done with it
    pub fn safe_release_native_object(&self, object: NativeObject, queue_mask: u64) {
        self.safe_release_device_object(StaleResource::native(Arc::clone(&self.native), object), queue_mask);
    }

    /// Release `resource` once queue `queue_index` completes `fence_value`
    pub fn discard_resource(&self, queue_index: usize, resource: Arc<StaleResource>, fence_value: FenceValue) {
        self.queues[queue_index].release_queue.discard_resource(resource, fence_value);
    }

    /// Release everything the GPU has finished with on one queue.
    ///
    /// `force` releases every pending entry regardless of fence state.
    pub fn purge_release_queue(&self, queue_index: usize, force: bool) -> usize {
        let slot = &self.queues[queue_index];
        let completed = if force {
            FenceValue::MAX
        } else {
            slot.queue.completed_fence_value()
        };
        slot.release_queue.purge(completed)
    }

    /// Purge the release queues of every command queue
    pub fn purge_release_queues(&self, force: bool) -> usize {
        (0..self.queues.len())
            .map(|queue_index| self.purge_release_queue(queue_index, force))
            .sum()
    }

    /// Block until a queue drains, optionally releasing everything it referenced
    pub fn idle_command_queue(&self, queue_index: usize, release_resources: bool) -> VulkanResult<()> {
        let slot = &self.queues[queue_index];
        let (cmd_buffer_number, fence_value) = {
            let mut next_number = slot.next_cmd_buffer_number.lock();
            let number = *next_number;
            *next_number += 1;
            (number, slot.queue.wait_for_idle()?)
        };

        if release_resources {
            // Everything released before the idle is now safe to destroy
            slot.release_queue.discard_stale_resources(cmd_buffer_number, fence_value);
            slot.release_queue.purge(slot.queue.completed_fence_value());
        }
        Ok(())
    }

    /// Idle every queue and the device, then release everything
    pub fn idle_gpu(&self) -> VulkanResult<()> {
        for queue_index in 0..self.queues.len() {
            self.idle_command_queue(queue_index, true)?;
        }
        self.native.device_wait_idle()?;
        self.purge_release_queues(false);
        Ok(())
    }

    /// Submit an empty batch so stale resources get a fence value, then purge
    pub fn flush_stale_resources(&self, queue_index: usize) -> VulkanResult<()> {
        self.submit_command_buffer(queue_index, &SubmitBatch::default(), &[])?;
        self.purge_release_queue(queue_index, false);
        Ok(())
    }

    /// Number of resources waiting in the release queues of `queue_index`
    pub fn pending_release_count(&self, queue_index: usize) -> usize {
        let release_queue = &self.queues[queue_index].release_queue;
        release_queue.stale_count() + release_queue.pending_count()
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        for render_pass in self.render_pass_cache.take_all() {
            self.on_destroy_render_pass(render_pass);
            self.safe_release_native_object(NativeObject::RenderPass(render_pass), self.command_queue_mask());
        }

        if let Err(err) = self.idle_gpu() {
            error!("Failed to idle the GPU while destroying the render device: {err}");
        }
        let forced = self.purge_release_queues(true);
        if forced > 0 {
            error!("{forced} resource(s) were released without GPU completion");
        }
        debug!("Render device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vulkan::mock::MockDevice;
    use std::sync::atomic::AtomicUsize;

    fn counting_resource(counter: &Arc<AtomicUsize>) -> Arc<StaleResource> {
        let counter = Arc::clone(counter);
        StaleResource::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fence_values_increase_per_submission() {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();

        let (first_number, first) = device.submit_command_buffer(0, &SubmitBatch::default(), &[]).unwrap();
        let (second_number, second) = device.submit_command_buffer(0, &SubmitBatch::default(), &[]).unwrap();
        assert!(second > first);
        assert_eq!(second_number, first_number + 1);
        assert_eq!(native.submissions().len(), 2);
    }

    #[test]
    fn test_released_object_waits_for_submission_and_fence() {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        native.hold_fences(true);

        device.safe_release_device_object(counting_resource(&released), 1);
        device.purge_release_queues(false);
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let fence_value = device.execute_command_buffer(0, &SubmitBatch::default(), &[]).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert!(device.command_queue(0).completed_fence_value() < fence_value);

        native.complete_all();
        device.purge_release_queues(false);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_object_shared_across_queues_released_by_last_queue() {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::with_queues(native.clone(), EngineVkConfig::default(), &[0, 1]).unwrap();
        let released = Arc::new(AtomicUsize::new(0));

        device.safe_release_device_object(counting_resource(&released), 0b11);
        device.flush_stale_resources(0).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        device.flush_stale_resources(1).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mask_outside_device_queues_is_ignored() {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native, EngineVkConfig::default()).unwrap();
        let released = Arc::new(AtomicUsize::new(0));

        device.safe_release_device_object(counting_resource(&released), 0b10);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(device.pending_release_count(0), 0);
    }

    #[test]
    fn test_idle_gpu_releases_everything() {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        native.hold_fences(true);

        device.submit_command_buffer(0, &SubmitBatch::default(), &[]).unwrap();
        device.safe_release_device_object(counting_resource(&released), 1);
        device.idle_gpu().unwrap();

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(device.command_queue(0).timeline().pending_count(), 0);
        assert!(device.command_queue(0).completed_fence_value() >= FenceValue::new(2));
    }

    #[test]
    fn test_client_fence_signaled_after_submission() {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();
        let fence = device.create_fence();
        native.hold_fences(true);

        device
            .submit_command_buffer(0, &SubmitBatch::default(), &[(FenceValue::new(5), Arc::clone(&fence))])
            .unwrap();
        assert_eq!(fence.get_completed_value(), FenceValue::ZERO);

        native.complete_all();
        assert_eq!(fence.get_completed_value(), FenceValue::new(5));
    }

    #[test]
    fn test_transient_submission_keeps_stale_resources() {
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();
        let released = Arc::new(AtomicUsize::new(0));

        device.safe_release_device_object(counting_resource(&released), 1);
        device
            .execute_transient(0, |command_buffer| command_buffer.dispatch(1, 1, 1))
            .unwrap();
        device.purge_release_queues(false);

        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(native.count_commands(|c| matches!(c, super::super::native::Command::Dispatch { .. })), 1);
        device.flush_stale_resources(0).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let native = Arc::new(MockDevice::new());
        let config = EngineVkConfig::default().with_dynamic_heap(1000, 500);
        assert!(matches!(
            RenderDevice::new(native, config),
            Err(VulkanError::InvalidConfig(_))
        ));
    }
}
