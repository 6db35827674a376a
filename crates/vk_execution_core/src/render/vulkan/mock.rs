//! Recording device used by unit tests
//!
//! Handles are generated from a counter. Commands and submissions are kept in
//! order so tests can assert on what the core recorded. Fences are signaled on
//! submit unless `hold_fences` is set, which models a GPU that falls behind.

#![allow(dead_code, missing_docs)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::error::{VulkanError, VulkanResult};
use super::native::{
    Command, DescriptorWrite, DeviceLimits, FramebufferDesc, ImageCreateDesc, ImageViewDesc, NativeDevice,
    NativeObject, RenderPassDesc, SubmitBatch,
};

#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub queue_index: u32,
    pub batch: SubmitBatch,
    pub fence: vk::Fence,
}

#[derive(Default)]
struct DescriptorPoolRecord {
    max_sets: u32,
    allocated: u32,
}

pub struct MockDevice {
    limits: DeviceLimits,
    next_handle: AtomicU64,
    hold_fences: AtomicBool,
    fences: Mutex<HashMap<u64, bool>>,
    commands: Mutex<Vec<(vk::CommandBuffer, Command)>>,
    submissions: Mutex<Vec<SubmitRecord>>,
    memory: Mutex<HashMap<u64, Vec<u8>>>,
    descriptor_pools: Mutex<HashMap<u64, DescriptorPoolRecord>>,
    descriptor_writes: Mutex<Vec<(vk::DescriptorSet, DescriptorWrite)>>,
    render_passes: Mutex<Vec<RenderPassDesc>>,
    framebuffers: Mutex<Vec<FramebufferDesc>>,
    destroyed: Mutex<Vec<NativeObject>>,
    freed_descriptor_sets: Mutex<Vec<vk::DescriptorSet>>,
    command_buffers_allocated: AtomicU64,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            next_handle: AtomicU64::new(0x1000),
            hold_fences: AtomicBool::new(false),
            fences: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            memory: Mutex::new(HashMap::new()),
            descriptor_pools: Mutex::new(HashMap::new()),
            descriptor_writes: Mutex::new(Vec::new()),
            render_passes: Mutex::new(Vec::new()),
            framebuffers: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            freed_descriptor_sets: Mutex::new(Vec::new()),
            command_buffers_allocated: AtomicU64::new(0),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Keep submitted fences unsignaled until [`Self::complete_all`]
    pub fn hold_fences(&self, hold: bool) {
        self.hold_fences.store(hold, Ordering::SeqCst);
    }

    /// Signal every submitted fence
    pub fn complete_all(&self) {
        for signaled in self.fences.lock().values_mut() {
            *signaled = true;
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().iter().map(|(_, command)| command.clone()).collect()
    }

    pub fn commands_for(&self, command_buffer: vk::CommandBuffer) -> Vec<Command> {
        self.commands
            .lock()
            .iter()
            .filter(|(cb, _)| *cb == command_buffer)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().clear();
    }

    /// Forget recorded commands, submissions and command buffer allocations
    pub fn clear_history(&self) {
        self.commands.lock().clear();
        self.submissions.lock().clear();
        self.command_buffers_allocated.store(0, Ordering::Relaxed);
    }

    pub fn count_commands(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.lock().iter().filter(|(_, command)| predicate(command)).count()
    }

    pub fn image_barriers(&self) -> Vec<super::native::ImageBarrier> {
        self.commands
            .lock()
            .iter()
            .filter_map(|(_, command)| match command {
                Command::PipelineBarrier(barrier) => Some(barrier.image_barriers.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn buffer_barriers(&self) -> Vec<super::native::BufferBarrier> {
        self.commands
            .lock()
            .iter()
            .filter_map(|(_, command)| match command {
                Command::PipelineBarrier(barrier) => Some(barrier.buffer_barriers.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.submissions.lock().clone()
    }

    pub fn render_pass_count(&self) -> usize {
        self.render_passes.lock().len()
    }

    pub fn framebuffer_descs(&self) -> Vec<FramebufferDesc> {
        self.framebuffers.lock().clone()
    }

    pub fn destroyed(&self) -> Vec<NativeObject> {
        self.destroyed.lock().clone()
    }

    pub fn descriptor_writes(&self) -> Vec<(vk::DescriptorSet, DescriptorWrite)> {
        self.descriptor_writes.lock().clone()
    }

    pub fn freed_descriptor_sets(&self) -> Vec<vk::DescriptorSet> {
        self.freed_descriptor_sets.lock().clone()
    }

    pub fn descriptor_sets_in_use(&self, pool: vk::DescriptorPool) -> u32 {
        self.descriptor_pools.lock().get(&pool.as_raw()).map_or(0, |record| record.allocated)
    }

    pub fn command_buffers_allocated(&self) -> u64 {
        self.command_buffers_allocated.load(Ordering::Relaxed)
    }

    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.memory.lock().get(&memory.as_raw()).cloned().unwrap_or_default()
    }
}

impl NativeDevice for MockDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let fence = vk::Fence::from_raw(self.next_raw());
        self.fences.lock().insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VulkanResult<bool> {
        self.fences
            .lock()
            .get(&fence.as_raw())
            .copied()
            .ok_or(VulkanError::ResourceNotFound { id: fence.as_raw() })
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VulkanResult<()> {
        // The simulated GPU catches up with whatever the host waits on
        self.fences.lock().insert(fence.as_raw(), true);
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> VulkanResult<()> {
        self.fences.lock().insert(fence.as_raw(), false);
        Ok(())
    }

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VulkanResult<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(self.next_raw()))
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VulkanResult<vk::CommandBuffer> {
        self.command_buffers_allocated.fetch_add(1, Ordering::Relaxed);
        Ok(vk::CommandBuffer::from_raw(self.next_raw()))
    }

    fn reset_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VulkanResult<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        self.commands.lock().push((command_buffer, command.clone()));
    }

    fn queue_submit(&self, queue_index: u32, batch: &SubmitBatch, fence: vk::Fence) -> VulkanResult<()> {
        if fence != vk::Fence::null() {
            let signaled = !self.hold_fences.load(Ordering::SeqCst);
            self.fences.lock().insert(fence.as_raw(), signaled);
        }
        self.submissions.lock().push(SubmitRecord { queue_index, batch: batch.clone(), fence });
        Ok(())
    }

    fn queue_wait_idle(&self, _queue_index: u32) -> VulkanResult<()> {
        self.complete_all();
        Ok(())
    }

    fn device_wait_idle(&self) -> VulkanResult<()> {
        self.complete_all();
        Ok(())
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VulkanResult<vk::RenderPass> {
        self.render_passes.lock().push(desc.clone());
        Ok(vk::RenderPass::from_raw(self.next_raw()))
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> VulkanResult<vk::Framebuffer> {
        self.framebuffers.lock().push(desc.clone());
        Ok(vk::Framebuffer::from_raw(self.next_raw()))
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _memory_properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<(vk::Buffer, vk::DeviceMemory)> {
        let buffer = vk::Buffer::from_raw(self.next_raw());
        let memory = vk::DeviceMemory::from_raw(self.next_raw());
        let len = usize::try_from(size).map_err(|_| VulkanError::OutOfMemory { requested: size })?;
        self.memory.lock().insert(memory.as_raw(), vec![0; len]);
        Ok((buffer, memory))
    }

    fn create_image(&self, _desc: &ImageCreateDesc) -> VulkanResult<(vk::Image, vk::DeviceMemory)> {
        Ok((vk::Image::from_raw(self.next_raw()), vk::DeviceMemory::from_raw(self.next_raw())))
    }

    fn create_image_view(&self, _desc: &ImageViewDesc) -> VulkanResult<vk::ImageView> {
        Ok(vk::ImageView::from_raw(self.next_raw()))
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        _allow_free: bool,
    ) -> VulkanResult<vk::DescriptorPool> {
        let pool = vk::DescriptorPool::from_raw(self.next_raw());
        self.descriptor_pools
            .lock()
            .insert(pool.as_raw(), DescriptorPoolRecord { max_sets, allocated: 0 });
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()> {
        if let Some(record) = self.descriptor_pools.lock().get_mut(&pool.as_raw()) {
            record.allocated = 0;
        }
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet> {
        let mut pools = self.descriptor_pools.lock();
        let record = pools
            .get_mut(&pool.as_raw())
            .ok_or(VulkanError::ResourceNotFound { id: pool.as_raw() })?;
        if record.allocated >= record.max_sets {
            return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        record.allocated += 1;
        Ok(vk::DescriptorSet::from_raw(self.next_raw()))
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Some(record) = self.descriptor_pools.lock().get_mut(&pool.as_raw()) {
            record.allocated = record.allocated.saturating_sub(1);
        }
        self.freed_descriptor_sets.lock().push(set);
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.descriptor_writes.lock().extend(writes.iter().map(|write| (set, *write)));
    }

    fn create_query_pool(
        &self,
        _query_type: vk::QueryType,
        _query_count: u32,
        _statistics: vk::QueryPipelineStatisticFlags,
    ) -> VulkanResult<vk::QueryPool> {
        Ok(vk::QueryPool::from_raw(self.next_raw()))
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let mut heaps = self.memory.lock();
        let bytes = heaps
            .get_mut(&memory.as_raw())
            .ok_or(VulkanError::ResourceNotFound { id: memory.as_raw() })?;
        let start = usize::try_from(offset).map_err(|_| VulkanError::invalid_operation("offset overflow"))?;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(VulkanError::invalid_operation("write past the end of mapped memory"));
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &mut [u8]) -> VulkanResult<()> {
        let heaps = self.memory.lock();
        let bytes = heaps
            .get(&memory.as_raw())
            .ok_or(VulkanError::ResourceNotFound { id: memory.as_raw() })?;
        let start = usize::try_from(offset).map_err(|_| VulkanError::invalid_operation("offset overflow"))?;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(VulkanError::invalid_operation("read past the end of mapped memory"));
        }
        data.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn destroy(&self, object: NativeObject) {
        self.destroyed.lock().push(object);
    }
}
