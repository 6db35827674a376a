//! [`NativeDevice`] implementation over `ash`
//!
//! Host-visible memory is allocated host-coherent and stays mapped for its
//! whole lifetime, so `write_memory`/`read_memory` are plain copies.

use std::collections::HashMap;

use ash::{vk, Device, Instance};
use parking_lot::Mutex;

use super::error::{VulkanError, VulkanResult};
use super::native::{
    ClearValue, Command, DescriptorWrite, DeviceLimits, FramebufferDesc, ImageCreateDesc, ImageViewDesc, NativeDevice,
    NativeObject, RenderPassDesc, SubmitBatch,
};
use crate::foundation::logging::{debug, error};

/// Persistently mapped allocation. The pointer is kept as an address so the
/// device stays `Send + Sync`.
#[derive(Debug, Clone, Copy)]
struct MappedMemory {
    address: usize,
    size: vk::DeviceSize,
}

/// Logical device plus the queues the execution core submits to
pub struct AshDevice {
    device: Device,
    queues: Vec<vk::Queue>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    mapped: Mutex<HashMap<vk::DeviceMemory, MappedMemory>>,
}

impl AshDevice {
    /// Wrap a logical device.
    ///
    /// `queues[i]` is the native queue of command queue `i`. `enabled_features`
    /// are the features the logical device was created with.
    pub fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        device: Device,
        queues: Vec<vk::Queue>,
        enabled_features: &vk::PhysicalDeviceFeatures,
    ) -> Self {
        let (properties, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
            )
        };
        let device_limits = properties.limits;

        let mut stages = vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER;
        if enabled_features.geometry_shader == vk::TRUE {
            stages |= vk::PipelineStageFlags::GEOMETRY_SHADER;
        }
        if enabled_features.tessellation_shader == vk::TRUE {
            stages |= vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER
                | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
        }

        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: device_limits.min_uniform_buffer_offset_alignment,
            min_texel_buffer_offset_alignment: device_limits.min_texel_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: device_limits.min_storage_buffer_offset_alignment,
            optimal_buffer_copy_offset_alignment: device_limits.optimal_buffer_copy_offset_alignment,
            optimal_buffer_copy_row_pitch_alignment: device_limits.optimal_buffer_copy_row_pitch_alignment,
            enabled_graphics_shader_stages: stages,
            occlusion_query_precise: enabled_features.occlusion_query_precise == vk::TRUE,
            pipeline_statistics_query: enabled_features.pipeline_statistics_query == vk::TRUE,
        };
        debug!("Wrapped logical device with {} queue(s): {limits:?}", queues.len());

        Self {
            device,
            queues,
            memory_properties,
            limits,
            mapped: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped logical device
    pub fn raw(&self) -> &Device {
        &self.device
    }

    fn find_memory_type(&self, type_filter: u32, properties: vk::MemoryPropertyFlags) -> VulkanResult<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            if (type_filter & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
            {
                return Ok(i);
            }
        }
        Err(VulkanError::NoSuitableMemoryType)
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<vk::DeviceMemory> {
        let memory_type_index = self.find_memory_type(requirements.memory_type_bits, properties)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(|err| match err {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                VulkanError::OutOfMemory {
                    requested: requirements.size,
                }
            }
            other => VulkanError::Api(other),
        })
    }

    fn mapping(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, len: usize) -> VulkanResult<usize> {
        let mapped = self
            .mapped
            .lock()
            .get(&memory)
            .copied()
            .ok_or_else(|| VulkanError::invalid_operation("memory is not host visible"))?;
        if offset + len as u64 > mapped.size {
            return Err(VulkanError::invalid_operation(format!(
                "access of {len} bytes at offset {offset} exceeds mapped size {}",
                mapped.size
            )));
        }
        Ok(mapped.address + offset as usize)
    }
}

fn vk_clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

impl NativeDevice for AshDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_fence(&self, signaled: bool) -> VulkanResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }.map_err(VulkanError::Api)
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VulkanResult<bool> {
        unsafe { self.device.get_fence_status(fence) }.map_err(VulkanError::Api)
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VulkanResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }.map_err(VulkanError::Api)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VulkanResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.map_err(VulkanError::Api)
    }

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VulkanResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(flags);
        unsafe { self.device.create_command_pool(&info, None) }.map_err(VulkanError::Api)
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VulkanResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }.map_err(VulkanError::Api)?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::invalid_operation("command buffer allocation returned nothing"))
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .map_err(VulkanError::Api)
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VulkanResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(command_buffer, &info) }.map_err(VulkanError::Api)
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }.map_err(VulkanError::Api)
    }

    fn record(&self, cb: vk::CommandBuffer, command: &Command) {
        let device = &self.device;
        unsafe {
            match command {
                Command::PipelineBarrier(barrier) => {
                    let memory_barriers: Vec<_> = barrier
                        .memory_barriers
                        .iter()
                        .map(|b| {
                            vk::MemoryBarrier::builder()
                                .src_access_mask(b.src_access)
                                .dst_access_mask(b.dst_access)
                                .build()
                        })
                        .collect();
                    let buffer_barriers: Vec<_> = barrier
                        .buffer_barriers
                        .iter()
                        .map(|b| {
                            vk::BufferMemoryBarrier::builder()
                                .src_access_mask(b.src_access)
                                .dst_access_mask(b.dst_access)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .buffer(b.buffer)
                                .offset(0)
                                .size(vk::WHOLE_SIZE)
                                .build()
                        })
                        .collect();
                    let image_barriers: Vec<_> = barrier
                        .image_barriers
                        .iter()
                        .map(|b| {
                            vk::ImageMemoryBarrier::builder()
                                .src_access_mask(b.src_access)
                                .dst_access_mask(b.dst_access)
                                .old_layout(b.old_layout)
                                .new_layout(b.new_layout)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .image(b.image)
                                .subresource_range(b.subresource_range)
                                .build()
                        })
                        .collect();
                    device.cmd_pipeline_barrier(
                        cb,
                        barrier.src_stages,
                        barrier.dst_stages,
                        vk::DependencyFlags::empty(),
                        &memory_barriers,
                        &buffer_barriers,
                        &image_barriers,
                    );
                }
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    render_area,
                    clear_values,
                } => {
                    let clear_values: Vec<_> = clear_values.iter().copied().map(vk_clear_value).collect();
                    let info = vk::RenderPassBeginInfo::builder()
                        .render_pass(*render_pass)
                        .framebuffer(*framebuffer)
                        .render_area(*render_area)
                        .clear_values(&clear_values);
                    device.cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(cb),
                Command::BindPipeline { bind_point, pipeline } => device.cmd_bind_pipeline(cb, *bind_point, *pipeline),
                Command::BindVertexBuffers {
                    first_binding,
                    buffers,
                    offsets,
                } => device.cmd_bind_vertex_buffers(cb, *first_binding, buffers, offsets),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cb, *buffer, *offset, *index_type),
                Command::BindDescriptorSets {
                    bind_point,
                    layout,
                    first_set,
                    sets,
                    dynamic_offsets,
                } => device.cmd_bind_descriptor_sets(cb, *bind_point, *layout, *first_set, sets, dynamic_offsets),
                Command::SetViewports { first, viewports } => device.cmd_set_viewport(cb, *first, viewports),
                Command::SetScissors { first, scissors } => device.cmd_set_scissor(cb, *first, scissors),
                Command::SetStencilReference(reference) => {
                    device.cmd_set_stencil_reference(cb, vk::StencilFaceFlags::FRONT_AND_BACK, *reference);
                }
                Command::SetBlendConstants(constants) => device.cmd_set_blend_constants(cb, constants),
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(cb, *vertex_count, *instance_count, *first_vertex, *first_instance),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cb,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                ),
                Command::DrawIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => device.cmd_draw_indirect(cb, *buffer, *offset, *draw_count, *stride),
                Command::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => device.cmd_draw_indexed_indirect(cb, *buffer, *offset, *draw_count, *stride),
                Command::Dispatch { x, y, z } => device.cmd_dispatch(cb, *x, *y, *z),
                Command::DispatchIndirect { buffer, offset } => device.cmd_dispatch_indirect(cb, *buffer, *offset),
                Command::CopyBuffer { src, dst, regions } => device.cmd_copy_buffer(cb, *src, *dst, regions),
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => device.cmd_copy_buffer_to_image(cb, *src, *dst, *dst_layout, regions),
                Command::CopyImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                } => device.cmd_copy_image(cb, *src, *src_layout, *dst, *dst_layout, regions),
                Command::ResolveImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                } => device.cmd_resolve_image(cb, *src, *src_layout, *dst, *dst_layout, regions),
                Command::ClearColorImage {
                    image,
                    layout,
                    color,
                    range,
                } => device.cmd_clear_color_image(
                    cb,
                    *image,
                    *layout,
                    &vk::ClearColorValue { float32: *color },
                    std::slice::from_ref(range),
                ),
                Command::ClearDepthStencilImage {
                    image,
                    layout,
                    depth,
                    stencil,
                    range,
                } => device.cmd_clear_depth_stencil_image(
                    cb,
                    *image,
                    *layout,
                    &vk::ClearDepthStencilValue {
                        depth: *depth,
                        stencil: *stencil,
                    },
                    std::slice::from_ref(range),
                ),
                Command::ClearAttachment {
                    aspect_mask,
                    color_attachment,
                    value,
                    rect,
                } => device.cmd_clear_attachments(
                    cb,
                    &[vk::ClearAttachment {
                        aspect_mask: *aspect_mask,
                        color_attachment: *color_attachment,
                        clear_value: vk_clear_value(*value),
                    }],
                    std::slice::from_ref(rect),
                ),
                Command::ResetQueryPool {
                    pool,
                    first_query,
                    query_count,
                } => device.cmd_reset_query_pool(cb, *pool, *first_query, *query_count),
                Command::BeginQuery { pool, query, flags } => device.cmd_begin_query(cb, *pool, *query, *flags),
                Command::EndQuery { pool, query } => device.cmd_end_query(cb, *pool, *query),
                Command::WriteTimestamp { stage, pool, query } => device.cmd_write_timestamp(cb, *stage, *pool, *query),
            }
        }
    }

    fn queue_submit(&self, queue_index: u32, batch: &SubmitBatch, fence: vk::Fence) -> VulkanResult<()> {
        let queue = *self
            .queues
            .get(queue_index as usize)
            .ok_or_else(|| VulkanError::invalid_operation(format!("queue {queue_index} does not exist")))?;
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = batch.wait_semaphores.iter().copied().unzip();
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&batch.command_buffers)
            .signal_semaphores(&batch.signal_semaphores);
        unsafe { self.device.queue_submit(queue, &[info.build()], fence) }.map_err(VulkanError::Api)
    }

    fn queue_wait_idle(&self, queue_index: u32) -> VulkanResult<()> {
        let queue = *self
            .queues
            .get(queue_index as usize)
            .ok_or_else(|| VulkanError::invalid_operation(format!("queue {queue_index} does not exist")))?;
        unsafe { self.device.queue_wait_idle(queue) }.map_err(VulkanError::Api)
    }

    fn device_wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(VulkanError::Api)
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VulkanResult<vk::RenderPass> {
        let attachments: Vec<_> = desc
            .attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::builder()
                    .format(a.format)
                    .samples(a.samples)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(a.stencil_load_op)
                    .stencil_store_op(a.stencil_store_op)
                    .initial_layout(a.initial_layout)
                    .final_layout(a.final_layout)
                    .build()
            })
            .collect();
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&desc.color_references);
        if let Some(depth_reference) = desc.depth_reference.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_reference);
        }
        let subpasses = [subpass.build()];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses);
        unsafe { self.device.create_render_pass(&info, None) }.map_err(VulkanError::Api)
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> VulkanResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(desc.render_pass)
            .attachments(&desc.attachments)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers);
        unsafe { self.device.create_framebuffer(&info, None) }.map_err(VulkanError::Api)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<(vk::Buffer, vk::DeviceMemory)> {
        let host_visible = memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let properties = if host_visible {
            memory_properties | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            memory_properties
        };

        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(VulkanError::Api)?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory = match self.allocate_memory(requirements, properties) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let bound = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }.map_err(VulkanError::Api);
        let mapped = bound.and_then(|()| {
            if !host_visible {
                return Ok(());
            }
            let pointer = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            }
            .map_err(VulkanError::Api)?;
            self.mapped.lock().insert(
                memory,
                MappedMemory {
                    address: pointer as usize,
                    size,
                },
            );
            Ok(())
        });
        if let Err(err) = mapped {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(err);
        }
        Ok((buffer, memory))
    }

    fn create_image(&self, desc: &ImageCreateDesc) -> VulkanResult<(vk::Image, vk::DeviceMemory)> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .flags(desc.flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }.map_err(VulkanError::Api)?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = match self.allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };
        if let Err(err) = unsafe { self.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(err));
        }
        Ok((image, memory))
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> VulkanResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(desc.subresource_range);
        unsafe { self.device.create_image_view(&info, None) }.map_err(VulkanError::Api)
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
        allow_free: bool,
    ) -> VulkanResult<vk::DescriptorPool> {
        let flags = if allow_free {
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(max_sets)
            .flags(flags);
        unsafe { self.device.create_descriptor_pool(&info, None) }.map_err(VulkanError::Api)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(VulkanError::Api)
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }.map_err(VulkanError::Api)?;
        sets.into_iter()
            .next()
            .ok_or_else(|| VulkanError::invalid_operation("descriptor set allocation returned nothing"))
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Err(err) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            error!("Failed to free descriptor set: {err:?}");
        }
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        // Infos must outlive the write structs pointing at them
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut texel_views = Vec::new();
        for write in writes {
            match *write {
                DescriptorWrite::Buffer {
                    buffer, offset, range, ..
                } => buffer_infos.push(vk::DescriptorBufferInfo { buffer, offset, range }),
                DescriptorWrite::TexelBuffer { view, .. } => texel_views.push(view),
                DescriptorWrite::Image { view, layout, .. } => image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: layout,
                }),
                DescriptorWrite::Sampler { sampler, .. } => image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }),
            }
        }

        let (mut next_buffer, mut next_image, mut next_texel) = (0, 0, 0);
        let vk_writes: Vec<_> = writes
            .iter()
            .map(|write| {
                let builder = vk::WriteDescriptorSet::builder().dst_set(set);
                match *write {
                    DescriptorWrite::Buffer { binding, ty, .. } => {
                        next_buffer += 1;
                        builder
                            .dst_binding(binding)
                            .descriptor_type(ty)
                            .buffer_info(&buffer_infos[next_buffer - 1..next_buffer])
                            .build()
                    }
                    DescriptorWrite::TexelBuffer { binding, ty, .. } => {
                        next_texel += 1;
                        builder
                            .dst_binding(binding)
                            .descriptor_type(ty)
                            .texel_buffer_view(&texel_views[next_texel - 1..next_texel])
                            .build()
                    }
                    DescriptorWrite::Image { binding, ty, .. } => {
                        next_image += 1;
                        builder
                            .dst_binding(binding)
                            .descriptor_type(ty)
                            .image_info(&image_infos[next_image - 1..next_image])
                            .build()
                    }
                    DescriptorWrite::Sampler { binding, .. } => {
                        next_image += 1;
                        builder
                            .dst_binding(binding)
                            .descriptor_type(vk::DescriptorType::SAMPLER)
                            .image_info(&image_infos[next_image - 1..next_image])
                            .build()
                    }
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_query_pool(
        &self,
        query_type: vk::QueryType,
        query_count: u32,
        statistics: vk::QueryPipelineStatisticFlags,
    ) -> VulkanResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(query_type)
            .query_count(query_count)
            .pipeline_statistics(statistics);
        unsafe { self.device.create_query_pool(&info, None) }.map_err(VulkanError::Api)
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let address = self.mapping(memory, offset, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len()) };
        Ok(())
    }

    fn read_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, data: &mut [u8]) -> VulkanResult<()> {
        let address = self.mapping(memory, offset, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(address as *const u8, data.as_mut_ptr(), data.len()) };
        Ok(())
    }

    fn destroy(&self, object: NativeObject) {
        let device = &self.device;
        unsafe {
            match object {
                NativeObject::Buffer { buffer, memory } => {
                    if self.mapped.lock().remove(&memory).is_some() {
                        device.unmap_memory(memory);
                    }
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                }
                NativeObject::Image { image, memory } => {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                NativeObject::ImageView(view) => device.destroy_image_view(view, None),
                NativeObject::RenderPass(render_pass) => device.destroy_render_pass(render_pass, None),
                NativeObject::Framebuffer(framebuffer) => device.destroy_framebuffer(framebuffer, None),
                NativeObject::CommandPool(pool) => device.destroy_command_pool(pool, None),
                NativeObject::DescriptorPool(pool) => device.destroy_descriptor_pool(pool, None),
                NativeObject::QueryPool(pool) => device.destroy_query_pool(pool, None),
                NativeObject::Fence(fence) => device.destroy_fence(fence, None),
            }
        }
    }
}
