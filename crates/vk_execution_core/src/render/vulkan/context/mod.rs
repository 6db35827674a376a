//! Device contexts
//!
//! A [`DeviceContext`] records rendering, compute and transfer commands into
//! one command buffer at a time. Immediate contexts are bound to a command
//! queue and submit their work on [`DeviceContext::flush`]. Deferred contexts
//! record into command lists that an immediate context executes later.
//!
//! The context owns the frame-scoped allocators (upload heap, dynamic heap and
//! dynamic descriptor pools). Everything they hand out during a frame stays
//! valid until [`DeviceContext::finish_frame`] returns it through the release
//! queues of every queue the context's work was submitted to.
//!
//! Commands are split across a few files:
//!
//! - `state`: resource state transitions
//! - `commit`: pipelines, bindings, render targets, draws and dispatches
//! - `transfer`: buffer and texture updates, copies and mapping
//! - `submit`: flushing, command lists, fences, frames and queries

mod commit;
mod state;
mod submit;
mod transfer;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use ash::vk;

use crate::foundation::logging::{debug, error, warn};
use crate::render::vulkan::commands::{CommandBuffer, CommandBufferPool};
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::memory::{DynamicAllocation, DynamicDescriptorSetAllocator, DynamicHeap, UploadHeap};
use crate::render::vulkan::release_queue::StaleResource;
use crate::render::vulkan::resources::texture::BufferToTextureCopyInfo;
use crate::render::vulkan::resources::{BufferVk, PipelineState, QueryManager, TextureView};
use crate::render::vulkan::sync::{FenceTimeline, FenceValue};

pub use commit::{
    BeginRenderPassAttribs, ClearDepthStencilFlags, DrawAttribs, DrawIndexedAttribs, DrawIndirectAttribs,
    RenderPassAttachment, Viewport, MAX_BUFFER_SLOTS,
};
pub use state::{StateTransitionDesc, TransitionResource, TransitionType};
pub use submit::CommandList;
pub use transfer::{CopyTextureAttribs, MappedTextureSubresource, ResolveTextureSubresourceAttribs};

/// Bookkeeping of the commands recorded into the current command buffer
#[derive(Debug, Clone, Copy, Default)]
struct ContextState {
    /// Commands recorded since the last flush
    num_commands: u32,
    /// Whether the bound vertex streams have been committed
    vbs_up_to_date: bool,
}

/// Descriptor sets of the last committed shader resource binding
#[derive(Clone)]
struct DescriptorSetBindInfo {
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
    first_set: u32,
    sets: Vec<vk::DescriptorSet>,
    /// Buffers whose dynamic offsets are passed at bind time
    dynamic_buffers: Vec<Arc<BufferVk>>,
    /// Some of `dynamic_buffers` live in the dynamic heap and move on every map
    dynamic_buffers_present: bool,
    bound: bool,
}

/// Vertex buffer bound to an input slot
#[derive(Clone, Default)]
struct VertexStream {
    buffer: Option<Arc<BufferVk>>,
    offset: u64,
}

/// Explicit render pass begun by [`DeviceContext::begin_render_pass`]
struct ActiveRenderPass {
    attachments: Vec<RenderPassAttachment>,
}

/// Texture subresource mapped by [`DeviceContext::map_texture_subresource`]
#[derive(Debug, Clone, Copy)]
struct MappedTexture {
    copy_info: BufferToTextureCopyInfo,
    allocation: DynamicAllocation,
}

/// Records commands for a device
pub struct DeviceContext {
    device: Arc<RenderDevice>,
    id: u64,
    name: String,
    deferred: bool,
    queue_index: usize,

    command_pool: Arc<CommandBufferPool>,
    command_buffer: CommandBuffer,
    state: ContextState,
    num_commands_to_flush: u32,

    pipeline: Option<Arc<PipelineState>>,
    bind_info: Option<DescriptorSetBindInfo>,
    vertex_streams: Vec<VertexStream>,
    index_buffer: Option<Arc<BufferVk>>,
    index_buffer_offset: u64,
    viewports: Vec<Viewport>,
    scissor_rects: Vec<vk::Rect2D>,
    stencil_ref: u32,
    blend_factors: [f32; 4],

    render_targets: Vec<Arc<TextureView>>,
    depth_stencil: Option<Arc<TextureView>>,
    framebuffer_width: u32,
    framebuffer_height: u32,
    vk_render_pass: vk::RenderPass,
    vk_framebuffer: vk::Framebuffer,
    active_render_pass: Option<ActiveRenderPass>,

    wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    signal_semaphores: Vec<vk::Semaphore>,
    pending_fences: Vec<(FenceValue, Arc<FenceTimeline>)>,

    active_queries: u32,
    query_manager: Option<Arc<QueryManager>>,

    upload_heap: UploadHeap,
    dynamic_heap: DynamicHeap,
    dynamic_descriptors: DynamicDescriptorSetAllocator,

    mapped_textures: HashMap<(u64, u32, u32), MappedTexture>,
    submitted_queue_mask: Arc<AtomicU64>,
}

impl DeviceContext {
    /// Create a context submitting to command queue `queue_index`
    pub fn new_immediate(device: &Arc<RenderDevice>, queue_index: usize) -> VulkanResult<Self> {
        let name = format!("Immediate context {queue_index}");
        let query_manager = QueryManager::new(device, queue_index)?;
        let mut context = Self::new(device, name, false, queue_index)?;
        context.query_manager = Some(query_manager);
        Ok(context)
    }

    /// Create a context recording command lists
    pub fn new_deferred(device: &Arc<RenderDevice>) -> VulkanResult<Self> {
        let id = device.allocate_resource_id();
        let mut context = Self::new(device, format!("Deferred context {id}"), true, 0)?;
        // Deferred contexts never flush on their own
        context.num_commands_to_flush = u32::MAX;
        Ok(context)
    }

    fn new(device: &Arc<RenderDevice>, name: String, deferred: bool, queue_index: usize) -> VulkanResult<Self> {
        let config = device.config();
        let queue_family_index = device.command_queue(queue_index).queue_family_index();
        let command_pool = Arc::new(CommandBufferPool::new(
            Arc::clone(device.native()),
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            format!("{name} command pool"),
        )?);
        debug!("Created {name}");
        Ok(Self {
            id: device.allocate_resource_id(),
            deferred,
            queue_index,
            command_pool,
            command_buffer: CommandBuffer::new(Arc::clone(device.native())),
            state: ContextState::default(),
            num_commands_to_flush: config.num_commands_to_flush_cmd_buffer,
            pipeline: None,
            bind_info: None,
            vertex_streams: Vec::new(),
            index_buffer: None,
            index_buffer_offset: 0,
            viewports: Vec::new(),
            scissor_rects: Vec::new(),
            stencil_ref: 0,
            blend_factors: [1.0; 4],
            render_targets: Vec::new(),
            depth_stencil: None,
            framebuffer_width: 0,
            framebuffer_height: 0,
            vk_render_pass: vk::RenderPass::null(),
            vk_framebuffer: vk::Framebuffer::null(),
            active_render_pass: None,
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            pending_fences: Vec::new(),
            active_queries: 0,
            query_manager: None,
            upload_heap: UploadHeap::new(
                Arc::clone(device),
                format!("{name} upload heap"),
                config.upload_heap_page_size,
            ),
            dynamic_heap: DynamicHeap::new(
                Arc::clone(device),
                format!("{name} dynamic heap"),
                config.dynamic_heap_page_size,
            ),
            dynamic_descriptors: DynamicDescriptorSetAllocator::new(
                Arc::clone(device),
                format!("{name} dynamic descriptors"),
            ),
            mapped_textures: HashMap::new(),
            submitted_queue_mask: Arc::new(AtomicU64::new(0)),
            device: Arc::clone(device),
            name,
        })
    }

    /// Device the context records for
    pub fn device(&self) -> &Arc<RenderDevice> {
        &self.device
    }

    /// Device-unique id, also the key of per-context dynamic allocations
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the context records command lists
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Command queue an immediate context submits to
    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    /// Commands recorded since the last flush
    pub fn num_commands(&self) -> u32 {
        self.state.num_commands
    }

    /// Native command buffer being recorded, if any
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    /// Pool the context allocates command buffers from
    pub fn command_pool(&self) -> &Arc<CommandBufferPool> {
        &self.command_pool
    }

    /// Query manager of an immediate context
    pub fn query_manager(&self) -> Option<&Arc<QueryManager>> {
        self.query_manager.as_ref()
    }

    /// Pipeline bound by [`Self::set_pipeline_state`]
    pub fn pipeline_state(&self) -> Option<&Arc<PipelineState>> {
        self.pipeline.as_ref()
    }

    /// Number of queries begun and not yet ended
    pub fn active_query_count(&self) -> u32 {
        self.active_queries
    }

    /// Whether an explicit render pass is active
    pub fn is_render_pass_active(&self) -> bool {
        self.active_render_pass.is_some()
    }

    /// Upload heap of the context
    pub fn upload_heap(&self) -> &UploadHeap {
        &self.upload_heap
    }

    /// Dynamic heap of the context
    pub fn dynamic_heap(&self) -> &DynamicHeap {
        &self.dynamic_heap
    }

    /// Dynamic descriptor set allocator of the context
    pub fn dynamic_descriptors(&self) -> &DynamicDescriptorSetAllocator {
        &self.dynamic_descriptors
    }

    /// Make sure a command buffer is being recorded
    fn ensure_command_buffer(&mut self) -> VulkanResult<()> {
        if !self.command_buffer.is_recording() {
            let handle = self.command_pool.allocate()?;
            self.command_buffer.set_handle(handle);
        }
        Ok(())
    }

    /// End the implicit render pass before a command that must run outside of
    /// one. Returns false when an explicit render pass is active.
    fn ensure_outside_render_pass(&mut self, operation: &str) -> bool {
        if self.active_render_pass.is_some() {
            error!("{operation} is not allowed inside an active render pass");
            return false;
        }
        if self.command_buffer.state().inside_render_pass() {
            self.command_buffer.end_render_pass();
        }
        true
    }

    /// Forget everything bound to the context.
    ///
    /// Call this when native state was changed behind the context's back.
    pub fn invalidate_state(&mut self) {
        if self.state.num_commands != 0 {
            warn!(
                "Invalidating state of '{}' with {} outstanding command(s). Flush the context or finish the \
                 command list first",
                self.name, self.state.num_commands
            );
        }
        if self.command_buffer.state().inside_render_pass() {
            self.command_buffer.end_render_pass();
        }
        self.state = ContextState::default();
        self.pipeline = None;
        self.bind_info = None;
        self.vertex_streams.clear();
        self.index_buffer = None;
        self.index_buffer_offset = 0;
        self.render_targets.clear();
        self.depth_stencil = None;
        self.framebuffer_width = 0;
        self.framebuffer_height = 0;
        self.vk_render_pass = vk::RenderPass::null();
        self.vk_framebuffer = vk::Framebuffer::null();
        self.active_render_pass = None;
    }

    /// Return a command buffer that was never submitted straight to the pool
    fn recycle_unsubmitted_command_buffer(&mut self) {
        if self.command_buffer.is_recording() {
            let handle = self.command_buffer.handle();
            self.command_buffer.reset();
            self.command_pool.recycle(handle);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if self.state.num_commands != 0 {
            if self.deferred {
                error!(
                    "{} command(s) of '{}' are lost. Call finish_command_list() before destroying the context",
                    self.state.num_commands, self.name
                );
            } else {
                error!(
                    "{} command(s) of '{}' have not been flushed and will be submitted now",
                    self.state.num_commands, self.name
                );
            }
        }
        if !self.deferred {
            if let Err(err) = self.flush() {
                error!("Failed to flush '{}' on destruction: {err}", self.name);
            }
        }
        self.finish_frame();
        self.recycle_unsubmitted_command_buffer();

        // Command buffers of this pool may still be executing
        let pool = Arc::clone(&self.command_pool);
        self.device
            .safe_release_device_object(StaleResource::new(move || drop(pool)), !0);

        if let Err(err) = self.device.idle_gpu() {
            error!("Failed to idle the GPU while destroying '{}': {err}", self.name);
        }
        debug!("Destroyed {}", self.name);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineVkConfig;
    use crate::render::vulkan::mock::MockDevice;
    use crate::render::vulkan::resources::test_support::test_device;

    #[test]
    fn test_immediate_context_has_query_manager() {
        let (_native, device) = test_device();
        let immediate = DeviceContext::new_immediate(&device, 0).unwrap();
        let deferred = DeviceContext::new_deferred(&device).unwrap();

        assert!(!immediate.is_deferred());
        assert!(immediate.query_manager().is_some());
        assert!(deferred.is_deferred());
        assert!(deferred.query_manager().is_none());
        assert_ne!(immediate.id(), deferred.id());
    }

    #[test]
    fn test_command_buffer_is_allocated_lazily() {
        let (native, device) = test_device();
        let mut context = test_support::immediate_context(&native, &device);
        assert!(!context.command_buffer().is_recording());
        assert_eq!(native.command_buffers_allocated(), 0);

        context.set_stencil_ref(3).unwrap();
        assert!(context.command_buffer().is_recording());
        assert_eq!(native.command_buffers_allocated(), 1);
    }

    #[test]
    fn test_invalidate_state_unbinds_everything() {
        let (_native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (color, depth) = test_support::targets(&device);
        let pipeline = test_support::graphics_pipeline(&device, &[vk::Format::R8G8B8A8_UNORM], vk::Format::D32_SFLOAT);
        context.set_pipeline_state(&pipeline).unwrap();
        context
            .set_render_targets(&[color], Some(depth), Default::default())
            .unwrap();

        context.invalidate_state();
        assert!(context.pipeline_state().is_none());
        assert!(context.render_targets.is_empty());
        assert_eq!(context.vk_framebuffer, vk::Framebuffer::null());
    }

    #[test]
    fn test_drop_returns_command_pool_through_release_queue() {
        crate::foundation::logging::init_for_tests();
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();
        let pool;
        {
            let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
            context.set_blend_factors([0.5; 4]).unwrap();
            pool = context.command_pool().handle();
        }
        // Dropping idles the GPU, which purges the release queues
        assert!(native
            .destroyed()
            .iter()
            .any(|object| matches!(object, crate::render::vulkan::native::NativeObject::CommandPool(p) if *p == pool)));
    }
}
