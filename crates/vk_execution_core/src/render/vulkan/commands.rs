//! Command buffer management
//!
//! [`CommandBufferPool`] recycles native command buffers across threads.
//! [`CommandBuffer`] wraps the buffer a context is currently recording. It
//! caches bound state to skip redundant binds and batches barriers. Pending
//! barriers are emitted as a single `vkCmdPipelineBarrier` right before the
//! next command that is not a barrier.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::error::VulkanResult;
use super::native::{
    BufferBarrier, ClearValue, Command, ImageBarrier, MemoryBarrier, NativeDevice, NativeObject, PipelineBarrier,
};
use super::release_queue::StaleResource;
use super::state::{destination_stages, image_layout_to_access_flags, source_stages};
use crate::foundation::logging::{debug, error};

/// Command pool wrapper that hands out ready-to-record command buffers
pub struct CommandBufferPool {
    device: Arc<dyn NativeDevice>,
    command_pool: vk::CommandPool,
    free: Mutex<VecDeque<vk::CommandBuffer>>,
    allocated: AtomicU32,
    name: String,
}

impl CommandBufferPool {
    /// Create a new command pool
    pub fn new(
        device: Arc<dyn NativeDevice>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
        name: impl Into<String>,
    ) -> VulkanResult<Self> {
        let command_pool = device.create_command_pool(queue_family_index, flags)?;
        Ok(Self {
            device,
            command_pool,
            free: Mutex::new(VecDeque::new()),
            allocated: AtomicU32::new(0),
            name: name.into(),
        })
    }

    /// Get a command buffer in the recording state.
    ///
    /// Reuses a recycled buffer when one is available, otherwise allocates a new one.
    pub fn allocate(&self) -> VulkanResult<vk::CommandBuffer> {
        let recycled = self.free.lock().pop_front();
        let command_buffer = match recycled {
            Some(command_buffer) => {
                self.device.reset_command_buffer(command_buffer)?;
                command_buffer
            }
            None => {
                let command_buffer = self.device.allocate_command_buffer(self.command_pool)?;
                self.allocated.fetch_add(1, Ordering::Relaxed);
                command_buffer
            }
        };

        self.device
            .begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(command_buffer)
    }

    /// Make a buffer available for reuse. Only call once the GPU is done with it.
    pub fn recycle(&self, command_buffer: vk::CommandBuffer) {
        self.free.lock().push_back(command_buffer);
    }

    /// Wrap `command_buffer` into a release-queue entry that recycles it into this pool
    pub fn stale_command_buffer(self: &Arc<Self>, command_buffer: vk::CommandBuffer) -> Arc<StaleResource> {
        let pool = Arc::clone(self);
        StaleResource::new(move || pool.recycle(command_buffer))
    }

    /// Number of native buffers allocated from this pool so far
    pub fn allocated_count(&self) -> u32 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of buffers ready for reuse
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        let allocated = self.allocated_count() as usize;
        let free = self.free.get_mut().len();
        match allocated.checked_sub(free) {
            Some(0) => {}
            Some(outstanding) => {
                error!("{}: {} command buffer(s) were not returned to the pool", self.name, outstanding);
            }
            None => {
                error!(
                    "{}: {} command buffer(s) were returned but only {} were allocated",
                    self.name, free, allocated
                );
            }
        }
        debug!("{}: destroying pool with {} command buffer(s)", self.name, self.allocated_count());
        // Destroying the pool frees all of its buffers
        self.device.destroy(NativeObject::CommandPool(self.command_pool));
    }
}

/// Bound state of the command buffer being recorded
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBufferState {
    /// Render pass currently begun, null outside a pass
    pub render_pass: vk::RenderPass,
    /// Framebuffer of the current pass
    pub framebuffer: vk::Framebuffer,
    /// Width of the current framebuffer
    pub framebuffer_width: u32,
    /// Height of the current framebuffer
    pub framebuffer_height: u32,
    /// Bound graphics pipeline
    pub graphics_pipeline: vk::Pipeline,
    /// Bound compute pipeline
    pub compute_pipeline: vk::Pipeline,
    /// Bound index buffer
    pub index_buffer: vk::Buffer,
    /// Offset of the bound index buffer
    pub index_buffer_offset: vk::DeviceSize,
    /// Type of the bound index buffer
    pub index_type: Option<vk::IndexType>,
    /// Bit per query type begun inside the current render pass
    pub inside_pass_queries: u32,
    /// Bit per query type begun outside of any render pass
    pub outside_pass_queries: u32,
}

impl CommandBufferState {
    /// Whether a render pass is currently begun
    pub fn inside_render_pass(&self) -> bool {
        self.render_pass != vk::RenderPass::null()
    }
}

/// Recording wrapper around the command buffer owned by a device context
pub struct CommandBuffer {
    device: Arc<dyn NativeDevice>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
    pending: PipelineBarrier,
    enabled_shader_stages: vk::PipelineStageFlags,
}

impl CommandBuffer {
    /// Create a wrapper with no native buffer attached
    pub fn new(device: Arc<dyn NativeDevice>) -> Self {
        let enabled_shader_stages = device.limits().enabled_graphics_shader_stages;
        Self {
            device,
            handle: vk::CommandBuffer::null(),
            state: CommandBufferState::default(),
            pending: PipelineBarrier::default(),
            enabled_shader_stages,
        }
    }

    /// Native handle, null when nothing is being recorded
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Whether a native buffer is attached
    pub fn is_recording(&self) -> bool {
        self.handle != vk::CommandBuffer::null()
    }

    /// Attach a native buffer that is already in the recording state
    pub fn set_handle(&mut self, handle: vk::CommandBuffer) {
        debug_assert!(!self.is_recording(), "a command buffer is already attached");
        self.handle = handle;
    }

    /// Cached bound state
    pub fn state(&self) -> &CommandBufferState {
        &self.state
    }

    /// Number of barriers waiting to be flushed
    pub fn pending_barrier_count(&self) -> usize {
        self.pending.barrier_count()
    }

    /// Detach the native buffer and forget all cached state
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            error!("{} pending barrier(s) are discarded", self.pending.barrier_count());
        }
        self.handle = vk::CommandBuffer::null();
        self.state = CommandBufferState::default();
        self.pending = PipelineBarrier::default();
    }

    fn record(&self, command: Command) {
        debug_assert!(self.is_recording(), "no command buffer attached");
        self.device.record(self.handle, &command);
    }

    /// Emit every pending barrier as one pipeline barrier
    pub fn flush_barriers(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let barrier = std::mem::take(&mut self.pending);
        if self.state.inside_render_pass() {
            error!(
                "Dropping {} barrier(s) recorded inside an active render pass",
                barrier.barrier_count()
            );
            return;
        }
        self.record(Command::PipelineBarrier(barrier));
    }

    /// Queue an image layout transition
    pub fn transition_image_layout(
        &mut self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        subresource_range: vk::ImageSubresourceRange,
    ) {
        if self.state.inside_render_pass() {
            error!("Image layout transitions are not allowed inside a render pass");
            return;
        }

        let src_access = image_layout_to_access_flags(old_layout, false);
        let dst_access = image_layout_to_access_flags(new_layout, true);
        self.pending.src_stages |= source_stages(src_access, Some(old_layout), self.enabled_shader_stages);
        self.pending.dst_stages |= destination_stages(dst_access, Some(new_layout), self.enabled_shader_stages);
        self.pending.image_barriers.push(ImageBarrier {
            image,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            subresource_range,
        });
    }

    /// Queue a whole-buffer memory barrier
    pub fn buffer_memory_barrier(&mut self, buffer: vk::Buffer, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) {
        if self.state.inside_render_pass() {
            error!("Buffer barriers are not allowed inside a render pass");
            return;
        }

        self.pending.src_stages |= source_stages(src_access, None, self.enabled_shader_stages);
        self.pending.dst_stages |= destination_stages(dst_access, None, self.enabled_shader_stages);
        self.pending.buffer_barriers.push(BufferBarrier {
            buffer,
            src_access,
            dst_access,
        });
    }

    /// Queue a global memory barrier
    pub fn memory_barrier(&mut self, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) {
        self.pending.src_stages |= source_stages(src_access, None, self.enabled_shader_stages);
        self.pending.dst_stages |= destination_stages(dst_access, None, self.enabled_shader_stages);
        self.pending.memory_barriers.push(MemoryBarrier { src_access, dst_access });
    }

    /// Begin a render pass covering the whole framebuffer
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        width: u32,
        height: u32,
        clear_values: Vec<ClearValue>,
    ) {
        debug_assert!(!self.state.inside_render_pass(), "a render pass is already active");
        self.flush_barriers();
        self.record(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            },
            clear_values,
        });
        self.state.render_pass = render_pass;
        self.state.framebuffer = framebuffer;
        self.state.framebuffer_width = width;
        self.state.framebuffer_height = height;
    }

    /// End the active render pass
    pub fn end_render_pass(&mut self) {
        debug_assert!(self.state.inside_render_pass(), "no render pass is active");
        debug_assert!(
            self.state.inside_pass_queries == 0,
            "queries begun inside the pass must end before the pass"
        );
        self.record(Command::EndRenderPass);
        self.state.render_pass = vk::RenderPass::null();
        self.state.framebuffer = vk::Framebuffer::null();
        self.state.framebuffer_width = 0;
        self.state.framebuffer_height = 0;
    }

    /// Flush barriers and end recording
    pub fn end_command_buffer(&mut self) -> VulkanResult<()> {
        self.flush_barriers();
        self.device.end_command_buffer(self.handle)
    }

    /// Bind a graphics pipeline unless it is already bound
    pub fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        if self.state.graphics_pipeline != pipeline {
            self.record(Command::BindPipeline {
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            });
            self.state.graphics_pipeline = pipeline;
        }
    }

    /// Bind a compute pipeline unless it is already bound
    pub fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) {
        if self.state.compute_pipeline != pipeline {
            self.record(Command::BindPipeline {
                bind_point: vk::PipelineBindPoint::COMPUTE,
                pipeline,
            });
            self.state.compute_pipeline = pipeline;
        }
    }

    /// Bind descriptor sets
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    ) {
        self.record(Command::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets,
            dynamic_offsets,
        });
    }

    /// Bind vertex buffers
    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: Vec<vk::Buffer>, offsets: Vec<vk::DeviceSize>) {
        self.record(Command::BindVertexBuffers {
            first_binding,
            buffers,
            offsets,
        });
    }

    /// Bind an index buffer unless the same binding is already active
    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        if self.state.index_buffer != buffer
            || self.state.index_buffer_offset != offset
            || self.state.index_type != Some(index_type)
        {
            self.record(Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            });
            self.state.index_buffer = buffer;
            self.state.index_buffer_offset = offset;
            self.state.index_type = Some(index_type);
        }
    }

    /// Set viewports
    pub fn set_viewports(&mut self, first: u32, viewports: Vec<vk::Viewport>) {
        self.record(Command::SetViewports { first, viewports });
    }

    /// Set scissor rectangles
    pub fn set_scissors(&mut self, first: u32, scissors: Vec<vk::Rect2D>) {
        self.record(Command::SetScissors { first, scissors });
    }

    /// Set stencil reference for both faces
    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.record(Command::SetStencilReference(reference));
    }

    /// Set blend constants
    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.record(Command::SetBlendConstants(constants));
    }

    /// Non-indexed draw. Must be inside a render pass.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        debug_assert!(self.state.inside_render_pass(), "draw outside of a render pass");
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    /// Indexed draw. Must be inside a render pass.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        debug_assert!(self.state.inside_render_pass(), "draw outside of a render pass");
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    /// Indirect draw
    pub fn draw_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        self.record(Command::DrawIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
    }

    /// Indexed indirect draw
    pub fn draw_indexed_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        self.record(Command::DrawIndexedIndirect {
            buffer,
            offset,
            draw_count,
            stride,
        });
    }

    /// Compute dispatch. Must be outside of a render pass.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.flush_barriers();
        self.record(Command::Dispatch { x, y, z });
    }

    /// Indirect compute dispatch
    pub fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        self.flush_barriers();
        self.record(Command::DispatchIndirect { buffer, offset });
    }

    /// Buffer to buffer copy
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: Vec<vk::BufferCopy>) {
        self.flush_barriers();
        self.record(Command::CopyBuffer { src, dst, regions });
    }

    /// Buffer to image copy
    pub fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    ) {
        self.flush_barriers();
        self.record(Command::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions,
        });
    }

    /// Image to image copy
    pub fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    ) {
        self.flush_barriers();
        self.record(Command::CopyImage {
            src,
            src_layout,
            dst,
            dst_layout,
            regions,
        });
    }

    /// Multisample resolve
    pub fn resolve_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageResolve>,
    ) {
        self.flush_barriers();
        self.record(Command::ResolveImage {
            src,
            src_layout,
            dst,
            dst_layout,
            regions,
        });
    }

    /// Clear a color image outside of a render pass
    pub fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
        range: vk::ImageSubresourceRange,
    ) {
        self.flush_barriers();
        self.record(Command::ClearColorImage {
            image,
            layout,
            color,
            range,
        });
    }

    /// Clear a depth/stencil image outside of a render pass
    pub fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        depth: f32,
        stencil: u32,
        range: vk::ImageSubresourceRange,
    ) {
        self.flush_barriers();
        self.record(Command::ClearDepthStencilImage {
            image,
            layout,
            depth,
            stencil,
            range,
        });
    }

    /// Clear one attachment of the active render pass
    pub fn clear_attachment(
        &mut self,
        aspect_mask: vk::ImageAspectFlags,
        color_attachment: u32,
        value: ClearValue,
        rect: vk::ClearRect,
    ) {
        debug_assert!(self.state.inside_render_pass(), "attachments can only be cleared inside a render pass");
        self.record(Command::ClearAttachment {
            aspect_mask,
            color_attachment,
            value,
            rect,
        });
    }

    /// Reset queries before reuse
    pub fn reset_query_pool(&mut self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        self.flush_barriers();
        self.record(Command::ResetQueryPool {
            pool,
            first_query,
            query_count,
        });
    }

    /// Begin a query and remember its type bit
    pub fn begin_query(&mut self, pool: vk::QueryPool, query: u32, flags: vk::QueryControlFlags, type_bit: u32) {
        self.flush_barriers();
        self.record(Command::BeginQuery { pool, query, flags });
        if self.state.inside_render_pass() {
            self.state.inside_pass_queries |= type_bit;
        } else {
            self.state.outside_pass_queries |= type_bit;
        }
    }

    /// End a query and clear its type bit
    pub fn end_query(&mut self, pool: vk::QueryPool, query: u32, type_bit: u32) {
        self.record(Command::EndQuery { pool, query });
        if self.state.outside_pass_queries & type_bit != 0 {
            self.state.outside_pass_queries &= !type_bit;
        } else {
            self.state.inside_pass_queries &= !type_bit;
        }
    }

    /// Write a timestamp
    pub fn write_timestamp(&mut self, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32) {
        self.flush_barriers();
        self.record(Command::WriteTimestamp { stage, pool, query });
    }
}
