//! Native device seam
//!
//! Every Vulkan call made by the execution core goes through [`NativeDevice`].
//! [`super::ash_device::AshDevice`] implements it on top of `ash`. Command
//! recording is expressed as a [`Command`] value so that a device implementation
//! only has to translate one enum into `vkCmd*` calls.

use ash::vk;

use super::error::VulkanResult;

/// Physical device limits and enabled features the core depends on
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    /// `minUniformBufferOffsetAlignment`
    pub min_uniform_buffer_offset_alignment: u64,
    /// `minTexelBufferOffsetAlignment`
    pub min_texel_buffer_offset_alignment: u64,
    /// `minStorageBufferOffsetAlignment`
    pub min_storage_buffer_offset_alignment: u64,
    /// `optimalBufferCopyOffsetAlignment`
    pub optimal_buffer_copy_offset_alignment: u64,
    /// `optimalBufferCopyRowPitchAlignment`
    pub optimal_buffer_copy_row_pitch_alignment: u64,
    /// Graphics shader stages enabled on the logical device
    pub enabled_graphics_shader_stages: vk::PipelineStageFlags,
    /// `occlusionQueryPrecise` feature
    pub occlusion_query_precise: bool,
    /// `pipelineStatisticsQuery` feature
    pub pipeline_statistics_query: bool,
}

impl DeviceLimits {
    /// Alignment that satisfies uniform, texel and storage buffer offsets at once
    pub fn max_buffer_offset_alignment(&self) -> u64 {
        self.min_uniform_buffer_offset_alignment
            .max(self.min_texel_buffer_offset_alignment)
            .max(self.min_storage_buffer_offset_alignment)
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            min_texel_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
            optimal_buffer_copy_offset_alignment: 1,
            optimal_buffer_copy_row_pitch_alignment: 1,
            enabled_graphics_shader_stages: vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            occlusion_query_precise: true,
            pipeline_statistics_query: true,
        }
    }
}

/// Image memory barrier without any pointer chains
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    /// Image being transitioned
    pub image: vk::Image,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Accesses that must complete before the barrier
    pub src_access: vk::AccessFlags,
    /// Accesses that wait for the barrier
    pub dst_access: vk::AccessFlags,
    /// Affected subresources
    pub subresource_range: vk::ImageSubresourceRange,
}

/// Whole-buffer memory barrier
#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier {
    /// Buffer being transitioned
    pub buffer: vk::Buffer,
    /// Accesses that must complete before the barrier
    pub src_access: vk::AccessFlags,
    /// Accesses that wait for the barrier
    pub dst_access: vk::AccessFlags,
}

/// Global memory barrier
#[derive(Debug, Clone, Copy)]
pub struct MemoryBarrier {
    /// Accesses that must complete before the barrier
    pub src_access: vk::AccessFlags,
    /// Accesses that wait for the barrier
    pub dst_access: vk::AccessFlags,
}

/// One `vkCmdPipelineBarrier` call
#[derive(Debug, Clone, Default)]
pub struct PipelineBarrier {
    /// Source stage mask
    pub src_stages: vk::PipelineStageFlags,
    /// Destination stage mask
    pub dst_stages: vk::PipelineStageFlags,
    /// Global memory barriers
    pub memory_barriers: Vec<MemoryBarrier>,
    /// Buffer barriers
    pub buffer_barriers: Vec<BufferBarrier>,
    /// Image barriers
    pub image_barriers: Vec<ImageBarrier>,
}

impl PipelineBarrier {
    /// Total number of barriers in this call
    pub fn barrier_count(&self) -> usize {
        self.memory_barriers.len() + self.buffer_barriers.len() + self.image_barriers.len()
    }

    /// Whether the call carries no barriers at all
    pub fn is_empty(&self) -> bool {
        self.barrier_count() == 0
    }
}

/// Clear value for an attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// RGBA float color
    Color([f32; 4]),
    /// Depth and stencil values
    DepthStencil {
        /// Depth value
        depth: f32,
        /// Stencil value
        stencil: u32,
    },
}

/// Recorded command. Each variant maps to exactly one `vkCmd*` call.
#[derive(Debug, Clone)]
pub enum Command {
    /// `vkCmdPipelineBarrier`
    PipelineBarrier(PipelineBarrier),
    /// `vkCmdBeginRenderPass` with inline contents
    BeginRenderPass {
        /// Render pass
        render_pass: vk::RenderPass,
        /// Framebuffer compatible with `render_pass`
        framebuffer: vk::Framebuffer,
        /// Render area
        render_area: vk::Rect2D,
        /// One value per attachment with a CLEAR load op
        clear_values: Vec<ClearValue>,
    },
    /// `vkCmdEndRenderPass`
    EndRenderPass,
    /// `vkCmdBindPipeline`
    BindPipeline {
        /// Graphics or compute
        bind_point: vk::PipelineBindPoint,
        /// Pipeline
        pipeline: vk::Pipeline,
    },
    /// `vkCmdBindVertexBuffers`
    BindVertexBuffers {
        /// First binding slot
        first_binding: u32,
        /// Buffers
        buffers: Vec<vk::Buffer>,
        /// Byte offsets
        offsets: Vec<vk::DeviceSize>,
    },
    /// `vkCmdBindIndexBuffer`
    BindIndexBuffer {
        /// Buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Index type
        index_type: vk::IndexType,
    },
    /// `vkCmdBindDescriptorSets`
    BindDescriptorSets {
        /// Graphics or compute
        bind_point: vk::PipelineBindPoint,
        /// Pipeline layout
        layout: vk::PipelineLayout,
        /// First set index
        first_set: u32,
        /// Sets
        sets: Vec<vk::DescriptorSet>,
        /// Offsets of dynamic buffers
        dynamic_offsets: Vec<u32>,
    },
    /// `vkCmdSetViewport`
    SetViewports {
        /// First viewport
        first: u32,
        /// Viewports
        viewports: Vec<vk::Viewport>,
    },
    /// `vkCmdSetScissor`
    SetScissors {
        /// First scissor
        first: u32,
        /// Scissor rectangles
        scissors: Vec<vk::Rect2D>,
    },
    /// `vkCmdSetStencilReference` for both faces
    SetStencilReference(u32),
    /// `vkCmdSetBlendConstants`
    SetBlendConstants([f32; 4]),
    /// `vkCmdDraw`
    Draw {
        /// Vertex count
        vertex_count: u32,
        /// Instance count
        instance_count: u32,
        /// First vertex
        first_vertex: u32,
        /// First instance
        first_instance: u32,
    },
    /// `vkCmdDrawIndexed`
    DrawIndexed {
        /// Index count
        index_count: u32,
        /// Instance count
        instance_count: u32,
        /// First index
        first_index: u32,
        /// Value added to each index
        vertex_offset: i32,
        /// First instance
        first_instance: u32,
    },
    /// `vkCmdDrawIndirect`
    DrawIndirect {
        /// Argument buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Number of draws
        draw_count: u32,
        /// Stride between argument records
        stride: u32,
    },
    /// `vkCmdDrawIndexedIndirect`
    DrawIndexedIndirect {
        /// Argument buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Number of draws
        draw_count: u32,
        /// Stride between argument records
        stride: u32,
    },
    /// `vkCmdDispatch`
    Dispatch {
        /// Group count X
        x: u32,
        /// Group count Y
        y: u32,
        /// Group count Z
        z: u32,
    },
    /// `vkCmdDispatchIndirect`
    DispatchIndirect {
        /// Argument buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
    },
    /// `vkCmdCopyBuffer`
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Copy regions
        regions: Vec<vk::BufferCopy>,
    },
    /// `vkCmdCopyBufferToImage`
    CopyBufferToImage {
        /// Source buffer
        src: vk::Buffer,
        /// Destination image
        dst: vk::Image,
        /// Destination layout
        dst_layout: vk::ImageLayout,
        /// Copy regions
        regions: Vec<vk::BufferImageCopy>,
    },
    /// `vkCmdCopyImage`
    CopyImage {
        /// Source image
        src: vk::Image,
        /// Source layout
        src_layout: vk::ImageLayout,
        /// Destination image
        dst: vk::Image,
        /// Destination layout
        dst_layout: vk::ImageLayout,
        /// Copy regions
        regions: Vec<vk::ImageCopy>,
    },
    /// `vkCmdResolveImage`
    ResolveImage {
        /// Multisampled source
        src: vk::Image,
        /// Source layout
        src_layout: vk::ImageLayout,
        /// Single-sampled destination
        dst: vk::Image,
        /// Destination layout
        dst_layout: vk::ImageLayout,
        /// Resolve regions
        regions: Vec<vk::ImageResolve>,
    },
    /// `vkCmdClearColorImage`
    ClearColorImage {
        /// Image
        image: vk::Image,
        /// Current layout
        layout: vk::ImageLayout,
        /// RGBA color
        color: [f32; 4],
        /// Cleared subresources
        range: vk::ImageSubresourceRange,
    },
    /// `vkCmdClearDepthStencilImage`
    ClearDepthStencilImage {
        /// Image
        image: vk::Image,
        /// Current layout
        layout: vk::ImageLayout,
        /// Depth value
        depth: f32,
        /// Stencil value
        stencil: u32,
        /// Cleared subresources
        range: vk::ImageSubresourceRange,
    },
    /// `vkCmdClearAttachments` for a single attachment
    ClearAttachment {
        /// Aspect being cleared
        aspect_mask: vk::ImageAspectFlags,
        /// Color attachment index (ignored for depth/stencil)
        color_attachment: u32,
        /// Clear value
        value: ClearValue,
        /// Cleared area
        rect: vk::ClearRect,
    },
    /// `vkCmdResetQueryPool`
    ResetQueryPool {
        /// Query pool
        pool: vk::QueryPool,
        /// First query
        first_query: u32,
        /// Query count
        query_count: u32,
    },
    /// `vkCmdBeginQuery`
    BeginQuery {
        /// Query pool
        pool: vk::QueryPool,
        /// Query index
        query: u32,
        /// Control flags
        flags: vk::QueryControlFlags,
    },
    /// `vkCmdEndQuery`
    EndQuery {
        /// Query pool
        pool: vk::QueryPool,
        /// Query index
        query: u32,
    },
    /// `vkCmdWriteTimestamp`
    WriteTimestamp {
        /// Stage at which the timestamp is written
        stage: vk::PipelineStageFlags,
        /// Query pool
        pool: vk::QueryPool,
        /// Query index
        query: u32,
    },
}

/// Attachment of a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    /// Attachment format
    pub format: vk::Format,
    /// Sample count
    pub samples: vk::SampleCountFlags,
    /// Color/depth load op
    pub load_op: vk::AttachmentLoadOp,
    /// Color/depth store op
    pub store_op: vk::AttachmentStoreOp,
    /// Stencil load op
    pub stencil_load_op: vk::AttachmentLoadOp,
    /// Stencil store op
    pub stencil_store_op: vk::AttachmentStoreOp,
    /// Layout at pass begin
    pub initial_layout: vk::ImageLayout,
    /// Layout at pass end
    pub final_layout: vk::ImageLayout,
}

/// Single-subpass render pass description
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    /// Attachments, depth first when present
    pub attachments: Vec<AttachmentDesc>,
    /// Color attachment references of the subpass
    pub color_references: Vec<vk::AttachmentReference>,
    /// Depth/stencil reference of the subpass
    pub depth_reference: Option<vk::AttachmentReference>,
}

/// Framebuffer description
#[derive(Debug, Clone)]
pub struct FramebufferDesc {
    /// Compatible render pass
    pub render_pass: vk::RenderPass,
    /// Views in attachment order
    pub attachments: Vec<vk::ImageView>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Layer count
    pub layers: u32,
}

/// Image creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ImageCreateDesc {
    /// 1D/2D/3D
    pub image_type: vk::ImageType,
    /// Texel format
    pub format: vk::Format,
    /// Size of mip 0
    pub extent: vk::Extent3D,
    /// Mip levels
    pub mip_levels: u32,
    /// Array layers
    pub array_layers: u32,
    /// Sample count
    pub samples: vk::SampleCountFlags,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Creation flags
    pub flags: vk::ImageCreateFlags,
}

/// Image view creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    /// Viewed image
    pub image: vk::Image,
    /// View type
    pub view_type: vk::ImageViewType,
    /// View format
    pub format: vk::Format,
    /// Viewed subresources
    pub subresource_range: vk::ImageSubresourceRange,
}

/// One descriptor update
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    /// Uniform or storage buffer (static or dynamic)
    Buffer {
        /// Binding index
        binding: u32,
        /// Descriptor type
        ty: vk::DescriptorType,
        /// Buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Byte range
        range: vk::DeviceSize,
    },
    /// Uniform or storage texel buffer
    TexelBuffer {
        /// Binding index
        binding: u32,
        /// Descriptor type
        ty: vk::DescriptorType,
        /// Buffer view
        view: vk::BufferView,
    },
    /// Sampled image, storage image or input attachment
    Image {
        /// Binding index
        binding: u32,
        /// Descriptor type
        ty: vk::DescriptorType,
        /// Image view
        view: vk::ImageView,
        /// Layout the image is in when accessed
        layout: vk::ImageLayout,
    },
    /// Separate sampler
    Sampler {
        /// Binding index
        binding: u32,
        /// Sampler
        sampler: vk::Sampler,
    },
}

/// Queue submission batch
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    /// Semaphores to wait on with their stage masks
    pub wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    /// Command buffers to execute
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Semaphores signaled on completion
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// Native object owned by the core and destroyed through [`NativeDevice::destroy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeObject {
    /// Buffer with its dedicated memory
    Buffer {
        /// Buffer handle
        buffer: vk::Buffer,
        /// Backing memory
        memory: vk::DeviceMemory,
    },
    /// Image with its dedicated memory
    Image {
        /// Image handle
        image: vk::Image,
        /// Backing memory
        memory: vk::DeviceMemory,
    },
    /// Image view
    ImageView(vk::ImageView),
    /// Render pass
    RenderPass(vk::RenderPass),
    /// Framebuffer
    Framebuffer(vk::Framebuffer),
    /// Command pool together with all of its buffers
    CommandPool(vk::CommandPool),
    /// Descriptor pool together with all of its sets
    DescriptorPool(vk::DescriptorPool),
    /// Query pool
    QueryPool(vk::QueryPool),
    /// Fence
    Fence(vk::Fence),
}

/// Vulkan entry points used by the execution core
pub trait NativeDevice: Send + Sync {
    /// Device limits
    fn limits(&self) -> &DeviceLimits;

    /// Create a fence
    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence>;
    /// Non-blocking signaled check
    fn get_fence_status(&self, fence: vk::Fence) -> VulkanResult<bool>;
    /// Block until the fence is signaled
    fn wait_for_fence(&self, fence: vk::Fence) -> VulkanResult<()>;
    /// Return the fence to the unsignaled state
    fn reset_fence(&self, fence: vk::Fence) -> VulkanResult<()>;

    /// Create a command pool for a queue family
    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VulkanResult<vk::CommandPool>;
    /// Allocate one primary command buffer
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VulkanResult<vk::CommandBuffer>;
    /// Reset a command buffer to the initial state
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()>;
    /// Begin recording
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VulkanResult<()>;
    /// End recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()>;
    /// Record one command
    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command);

    /// Submit a batch to the queue with the given index
    fn queue_submit(&self, queue_index: u32, batch: &SubmitBatch, fence: vk::Fence) -> VulkanResult<()>;
    /// Block until the queue is idle
    fn queue_wait_idle(&self, queue_index: u32) -> VulkanResult<()>;
    /// Block until the whole device is idle
    fn device_wait_idle(&self) -> VulkanResult<()>;

    /// Create a render pass
    fn create_render_pass(&self, desc: &RenderPassDesc) -> VulkanResult<vk::RenderPass>;
    /// Create a framebuffer
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> VulkanResult<vk::Framebuffer>;
    /// Create a buffer bound to dedicated memory with the requested properties
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<(vk::Buffer, vk::DeviceMemory)>;
    /// Create a device-local image bound to dedicated memory
    fn create_image(&self, desc: &ImageCreateDesc) -> VulkanResult<(vk::Image, vk::DeviceMemory)>;
    /// Create an image view
    fn create_image_view(&self, desc: &ImageViewDesc) -> VulkanResult<vk::ImageView>;

    /// Create a descriptor pool. `allow_free` enables freeing individual sets.
    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        allow_free: bool,
    ) -> VulkanResult<vk::DescriptorPool>;
    /// Free every set allocated from the pool
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()>;
    /// Allocate one set. Fails with `ERROR_OUT_OF_POOL_MEMORY` when the pool is exhausted.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet>;
    /// Return one set to a pool created with `allow_free`
    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet);
    /// Write descriptors into a set
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    /// Create a query pool
    fn create_query_pool(
        &self,
        query_type: vk::QueryType,
        query_count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> VulkanResult<vk::QueryPool>;

    /// Copy `data` into host-visible memory at `offset`
    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()>;
    /// Copy host-visible memory at `offset` into `data`
    fn read_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &mut [u8]) -> VulkanResult<()>;

    /// Destroy an object owned by the core
    fn destroy(&self, object: NativeObject);
}
