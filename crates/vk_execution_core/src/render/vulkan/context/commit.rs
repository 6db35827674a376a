//! Pipeline, binding and render target state, draws, dispatches and clears

use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;

use super::{ActiveRenderPass, DescriptorSetBindInfo, DeviceContext, VertexStream};
use crate::foundation::logging::{error, warn};
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::format::has_stencil;
use crate::render::vulkan::framebuffer::FramebufferCacheKey;
use crate::render::vulkan::native::ClearValue;
use crate::render::vulkan::render_pass::{RenderPassCacheKey, MAX_RENDER_TARGETS};
use crate::render::vulkan::resources::{
    BindFlags, BufferVk, PipelineState, ShaderResourceBinding, StateTransitionMode, Stateful, TextureView,
    TextureViewType, TextureVk, Usage,
};
use crate::render::vulkan::state::ResourceState;

/// Vertex input slots a context can bind
pub const MAX_BUFFER_SLOTS: usize = 32;

/// Viewport in framebuffer coordinates, origin at the top left corner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Left edge
    pub top_left_x: f32,
    /// Top edge
    pub top_left_y: f32,
    /// Width
    pub width: f32,
    /// Height
    pub height: f32,
    /// Near depth
    pub min_depth: f32,
    /// Far depth
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering a `width` x `height` target
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            top_left_x: 0.0,
            top_left_y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    fn to_vk(self) -> vk::Viewport {
        // Negative height flips Y (VK_KHR_maintenance1)
        vk::Viewport {
            x: self.top_left_x,
            y: self.top_left_y + self.height,
            width: self.width,
            height: -self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }
}

/// Non-indexed draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawAttribs {
    /// Vertices per instance
    pub num_vertices: u32,
    /// Instances
    pub num_instances: u32,
    /// First vertex
    pub start_vertex: u32,
    /// First instance
    pub first_instance: u32,
}

impl DrawAttribs {
    /// Single instance of `num_vertices` vertices
    pub fn new(num_vertices: u32) -> Self {
        Self {
            num_vertices,
            num_instances: 1,
            start_vertex: 0,
            first_instance: 0,
        }
    }
}

/// Indexed draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndexedAttribs {
    /// Indices per instance
    pub num_indices: u32,
    /// Type of the bound index buffer
    pub index_type: vk::IndexType,
    /// Instances
    pub num_instances: u32,
    /// First index
    pub first_index: u32,
    /// Value added to each index
    pub base_vertex: i32,
    /// First instance
    pub first_instance: u32,
}

impl DrawIndexedAttribs {
    /// Single instance of `num_indices` indices
    pub fn new(num_indices: u32, index_type: vk::IndexType) -> Self {
        Self {
            num_indices,
            index_type,
            num_instances: 1,
            first_index: 0,
            base_vertex: 0,
            first_instance: 0,
        }
    }
}

/// Draw with arguments read from a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndirectAttribs {
    /// Byte offset of the first argument record
    pub offset: u64,
    /// Number of argument records
    pub draw_count: u32,
    /// Stride between records
    pub stride: u32,
    /// How the argument buffer is brought into `INDIRECT_ARGUMENT`
    pub transition_mode: StateTransitionMode,
}

impl Default for DrawIndirectAttribs {
    fn default() -> Self {
        Self {
            offset: 0,
            draw_count: 1,
            stride: 0,
            transition_mode: StateTransitionMode::Transition,
        }
    }
}

bitflags! {
    /// Planes cleared by [`DeviceContext::clear_depth_stencil`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClearDepthStencilFlags: u8 {
        /// Depth plane
        const DEPTH   = 0x01;
        /// Stencil plane
        const STENCIL = 0x02;
    }
}

/// Attachment of an explicit render pass
#[derive(Clone)]
pub struct RenderPassAttachment {
    /// Attached texture
    pub texture: Arc<TextureVk>,
    /// State the pass expects at begin
    pub initial_state: ResourceState,
    /// State the pass leaves the texture in
    pub final_state: ResourceState,
}

/// Parameters of [`DeviceContext::begin_render_pass`]
#[derive(Clone)]
pub struct BeginRenderPassAttribs {
    /// Render pass
    pub render_pass: vk::RenderPass,
    /// Framebuffer compatible with `render_pass`
    pub framebuffer: vk::Framebuffer,
    /// Framebuffer width
    pub width: u32,
    /// Framebuffer height
    pub height: u32,
    /// Attachments in framebuffer order
    pub attachments: Vec<RenderPassAttachment>,
    /// One value per attachment with a CLEAR load op
    pub clear_values: Vec<ClearValue>,
    /// How attachments are brought into their initial states
    pub transition_mode: StateTransitionMode,
}

fn view_format(view: &TextureView) -> vk::Format {
    view.desc().format.unwrap_or_else(|| view.texture().format())
}

impl DeviceContext {
    pub(super) fn should_auto_flush(&self) -> bool {
        !self.deferred
            && self.state.num_commands >= self.num_commands_to_flush
            && self.active_render_pass.is_none()
            && self.active_queries == 0
    }

    /// Bind a pipeline. Dynamic state is re-committed when needed.
    pub fn set_pipeline_state(&mut self, pipeline: &Arc<PipelineState>) -> VulkanResult<()> {
        if self.pipeline.as_ref().map_or(false, |bound| bound.id() == pipeline.id()) {
            return Ok(());
        }
        if self.should_auto_flush() {
            self.flush()?;
        }

        let old = self.pipeline.take();
        let commit_states = old.as_ref().map_or(true, |old| old.is_compute());
        let old_scissor_enabled = old.as_ref().map_or(false, |old| old.scissor_enabled());

        self.ensure_command_buffer()?;
        if pipeline.is_compute() {
            self.command_buffer.bind_compute_pipeline(pipeline.pipeline());
        } else {
            self.command_buffer.bind_graphics_pipeline(pipeline.pipeline());
            if commit_states {
                self.command_buffer.set_stencil_reference(self.stencil_ref);
                self.command_buffer.set_blend_constants(self.blend_factors);
                self.commit_viewports()?;
            }
            if pipeline.scissor_enabled() && (commit_states || !old_scissor_enabled) {
                self.commit_scissor_rects()?;
            }
        }

        self.bind_info = None;
        self.pipeline = Some(Arc::clone(pipeline));
        Ok(())
    }

    /// Bring the resources of `srb` into their required states and bind its
    /// descriptor sets. Sets with dynamic offsets are bound at the next draw
    /// or dispatch.
    pub fn commit_shader_resources(
        &mut self,
        srb: &ShaderResourceBinding,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        for binding in srb.bindings() {
            if let (Some(required), Some((resource, range))) = (binding.required_state(), binding.barrierable()) {
                self.transition_or_verify(resource, mode, required, range)?;
            }
        }

        let pipeline = srb.pipeline();
        let mut sets = Vec::with_capacity(2);
        if let Some(set) = srb.static_set() {
            sets.push(set);
        }
        if let Some(layout) = pipeline.dynamic_set_layout() {
            let set = self.dynamic_descriptors.allocate(layout)?;
            self.device.native().update_descriptor_set(set, &srb.dynamic_writes());
            sets.push(set);
        }
        if sets.is_empty() {
            self.bind_info = None;
            return Ok(());
        }

        let dynamic_buffers = srb.dynamic_offset_buffers();
        let mut info = DescriptorSetBindInfo {
            bind_point: pipeline.bind_point(),
            layout: pipeline.layout(),
            first_set: if srb.static_set().is_some() { 0 } else { 1 },
            sets,
            dynamic_buffers_present: dynamic_buffers.iter().any(|buffer| buffer.is_suballocated()),
            dynamic_buffers,
            bound: false,
        };

        self.ensure_command_buffer()?;
        if info.dynamic_buffers.is_empty() {
            self.command_buffer
                .bind_descriptor_sets(info.bind_point, info.layout, info.first_set, info.sets.clone(), Vec::new());
            info.bound = true;
        }
        self.bind_info = Some(info);
        Ok(())
    }

    /// Bind committed sets whose dynamic offsets may have moved
    fn bind_descriptor_sets_with_dynamic_offsets(&mut self) {
        let context_id = self.id;
        let Some(info) = self.bind_info.as_mut() else {
            return;
        };
        if info.bound && !info.dynamic_buffers_present {
            return;
        }
        let offsets = info
            .dynamic_buffers
            .iter()
            .map(|buffer| buffer.dynamic_offset(context_id) as u32)
            .collect();
        self.command_buffer
            .bind_descriptor_sets(info.bind_point, info.layout, info.first_set, info.sets.clone(), offsets);
        info.bound = true;
    }

    /// Bind vertex buffers to consecutive slots starting at `start_slot`.
    ///
    /// `reset` unbinds every slot first.
    pub fn set_vertex_buffers(
        &mut self,
        start_slot: u32,
        buffers: &[Arc<BufferVk>],
        offsets: &[u64],
        mode: StateTransitionMode,
        reset: bool,
    ) -> VulkanResult<()> {
        let end = start_slot as usize + buffers.len();
        if end > MAX_BUFFER_SLOTS {
            error!("Vertex buffer slots {start_slot}..{end} exceed the limit of {MAX_BUFFER_SLOTS}");
            return Ok(());
        }
        if reset {
            self.vertex_streams.clear();
        }
        if self.vertex_streams.len() < end {
            self.vertex_streams.resize(end, VertexStream::default());
        }

        for (slot, buffer) in (start_slot as usize..).zip(buffers) {
            if !buffer.bind_flags().contains(BindFlags::VERTEX_BUFFER) {
                error!("Buffer '{}' bound to slot {slot} was not created as a vertex buffer", buffer.name());
                continue;
            }
            self.transition_or_verify(buffer.as_ref(), mode, ResourceState::VERTEX_BUFFER, None)?;
            self.vertex_streams[slot] = VertexStream {
                buffer: Some(Arc::clone(buffer)),
                offset: offsets.get(slot - start_slot as usize).copied().unwrap_or(0),
            };
        }
        self.state.vbs_up_to_date = false;
        Ok(())
    }

    fn commit_vertex_buffers(&mut self) {
        let mut buffers = Vec::with_capacity(self.vertex_streams.len());
        let mut offsets = Vec::with_capacity(self.vertex_streams.len());
        let mut dynamic_present = false;
        for stream in &self.vertex_streams {
            match &stream.buffer {
                Some(buffer) => {
                    dynamic_present |= buffer.desc().usage == Usage::Dynamic;
                    buffers.push(buffer.vk_buffer());
                    offsets.push(stream.offset + buffer.dynamic_offset(self.id));
                }
                None => {
                    // Unused slots still need a valid buffer
                    buffers.push(self.device.dynamic_memory_manager().buffer());
                    offsets.push(0);
                }
            }
        }
        if !buffers.is_empty() {
            self.command_buffer.bind_vertex_buffers(0, buffers, offsets);
        }
        // Dynamic buffers move on every map
        self.state.vbs_up_to_date = !dynamic_present;
    }

    /// Bind the index buffer used by indexed draws
    pub fn set_index_buffer(
        &mut self,
        buffer: Option<Arc<BufferVk>>,
        offset: u64,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        if let Some(buffer) = &buffer {
            if !buffer.bind_flags().contains(BindFlags::INDEX_BUFFER) {
                error!("Buffer '{}' was not created as an index buffer", buffer.name());
                return Ok(());
            }
            self.transition_or_verify(buffer.as_ref(), mode, ResourceState::INDEX_BUFFER, None)?;
        }
        self.index_buffer = buffer;
        self.index_buffer_offset = offset;
        Ok(())
    }

    fn commit_index_buffer(&mut self, index_type: vk::IndexType) -> bool {
        let Some(buffer) = &self.index_buffer else {
            error!("An indexed draw was issued without a bound index buffer");
            return false;
        };
        let offset = self.index_buffer_offset + buffer.dynamic_offset(self.id);
        self.command_buffer.bind_index_buffer(buffer.vk_buffer(), offset, index_type);
        true
    }

    /// Set viewports. An empty slice sets one viewport covering the render
    /// target, `rt_width` x `rt_height` or the bound framebuffer when zero.
    pub fn set_viewports(&mut self, viewports: &[Viewport], rt_width: u32, rt_height: u32) -> VulkanResult<()> {
        if viewports.is_empty() {
            let (width, height) = if rt_width == 0 || rt_height == 0 {
                (self.framebuffer_width, self.framebuffer_height)
            } else {
                (rt_width, rt_height)
            };
            self.viewports.clear();
            if width != 0 && height != 0 {
                self.viewports.push(Viewport::new(width as f32, height as f32));
            }
        } else {
            self.viewports = viewports.to_vec();
        }
        self.commit_viewports()
    }

    fn commit_viewports(&mut self) -> VulkanResult<()> {
        if self.viewports.is_empty() {
            return Ok(());
        }
        self.ensure_command_buffer()?;
        let viewports = self.viewports.iter().map(|viewport| viewport.to_vk()).collect();
        self.command_buffer.set_viewports(0, viewports);
        Ok(())
    }

    /// Set scissor rectangles, committed while the pipeline enables scissoring
    pub fn set_scissor_rects(&mut self, rects: &[vk::Rect2D]) -> VulkanResult<()> {
        self.scissor_rects = rects.to_vec();
        if self.pipeline.as_ref().map_or(false, |pipeline| pipeline.scissor_enabled()) {
            self.commit_scissor_rects()?;
        }
        Ok(())
    }

    fn commit_scissor_rects(&mut self) -> VulkanResult<()> {
        if self.scissor_rects.is_empty() {
            return Ok(());
        }
        self.ensure_command_buffer()?;
        self.command_buffer.set_scissors(0, self.scissor_rects.clone());
        Ok(())
    }

    /// Set the stencil reference value
    pub fn set_stencil_ref(&mut self, stencil_ref: u32) -> VulkanResult<()> {
        if self.stencil_ref != stencil_ref {
            self.stencil_ref = stencil_ref;
            self.ensure_command_buffer()?;
            self.command_buffer.set_stencil_reference(stencil_ref);
        }
        Ok(())
    }

    /// Set the blend constants
    pub fn set_blend_factors(&mut self, blend_factors: [f32; 4]) -> VulkanResult<()> {
        if self.blend_factors != blend_factors {
            self.blend_factors = blend_factors;
            self.ensure_command_buffer()?;
            self.command_buffer.set_blend_constants(blend_factors);
        }
        Ok(())
    }

    /// Bind render targets. The render pass is begun lazily by the next draw
    /// or clear.
    pub fn set_render_targets(
        &mut self,
        render_targets: &[Arc<TextureView>],
        depth_stencil: Option<Arc<TextureView>>,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        if self.active_render_pass.is_some() {
            error!("Render targets can't be set inside an active render pass");
            return Ok(());
        }
        if render_targets.len() > MAX_RENDER_TARGETS {
            error!(
                "{} render targets were given but at most {MAX_RENDER_TARGETS} can be bound",
                render_targets.len()
            );
            return Ok(());
        }
        if let Some(view) = render_targets
            .iter()
            .find(|view| view.view_type() != TextureViewType::RenderTarget)
        {
            error!("View of '{}' is not a render target view", view.texture().name());
            return Ok(());
        }
        if let Some(view) = depth_stencil
            .as_ref()
            .filter(|view| view.view_type() != TextureViewType::DepthStencil)
        {
            error!("View of '{}' is not a depth-stencil view", view.texture().name());
            return Ok(());
        }

        let changed = self.render_targets.len() != render_targets.len()
            || self
                .render_targets
                .iter()
                .zip(render_targets)
                .any(|(bound, view)| bound.handle() != view.handle())
            || self.depth_stencil.as_ref().map(|view| view.handle())
                != depth_stencil.as_ref().map(|view| view.handle());

        if changed {
            self.render_targets = render_targets.to_vec();
            self.depth_stencil = depth_stencil;
            self.create_render_pass_and_framebuffer()?;
        }

        self.set_viewports(&[], 0, 0)?;
        self.transition_render_targets(mode)
    }

    fn create_render_pass_and_framebuffer(&mut self) -> VulkanResult<()> {
        let Some(first) = self.depth_stencil.as_ref().or_else(|| self.render_targets.first()) else {
            self.vk_render_pass = vk::RenderPass::null();
            self.vk_framebuffer = vk::Framebuffer::null();
            self.framebuffer_width = 0;
            self.framebuffer_height = 0;
            return Ok(());
        };
        let extent = first.extent();
        let slices = first.desc().num_slices;
        let sample_count = first.texture().desc().sample_count as u8;

        let rtv_formats: Vec<vk::Format> = self.render_targets.iter().map(|view| view_format(view)).collect();
        let dsv_format = self
            .depth_stencil
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |view| view_format(view));
        let render_pass = self
            .device
            .get_render_pass(&RenderPassCacheKey::new(&rtv_formats, dsv_format, sample_count))?;

        let mut key = FramebufferCacheKey {
            render_pass,
            num_render_targets: self.render_targets.len() as u32,
            dsv: self
                .depth_stencil
                .as_ref()
                .map_or(vk::ImageView::null(), |view| view.handle()),
            command_queue_mask: u64::MAX,
            ..FramebufferCacheKey::default()
        };
        for (slot, view) in key.rtvs.iter_mut().zip(&self.render_targets) {
            *slot = view.handle();
        }
        let framebuffer = self.device.get_framebuffer(&key, extent.width, extent.height, slices)?;

        self.vk_render_pass = render_pass;
        self.vk_framebuffer = framebuffer;
        self.framebuffer_width = extent.width;
        self.framebuffer_height = extent.height;
        Ok(())
    }

    fn transition_render_targets(&mut self, mode: StateTransitionMode) -> VulkanResult<()> {
        let mut targets: Vec<(Arc<TextureVk>, ResourceState)> = Vec::with_capacity(self.render_targets.len() + 1);
        if let Some(view) = &self.depth_stencil {
            targets.push((Arc::clone(view.texture()), ResourceState::DEPTH_WRITE));
        }
        for view in &self.render_targets {
            targets.push((Arc::clone(view.texture()), ResourceState::RENDER_TARGET));
        }
        for (texture, state) in targets {
            self.transition_or_verify(texture.as_ref(), mode, state, None)?;
        }
        Ok(())
    }

    /// Unbind every render target, ending the implicit render pass
    pub fn reset_render_targets(&mut self) {
        if self.active_render_pass.is_some() {
            error!("Render targets can't be reset inside an active render pass");
            return;
        }
        self.render_targets.clear();
        self.depth_stencil = None;
        self.vk_render_pass = vk::RenderPass::null();
        self.vk_framebuffer = vk::Framebuffer::null();
        self.framebuffer_width = 0;
        self.framebuffer_height = 0;
        if self.command_buffer.state().inside_render_pass() {
            self.command_buffer.end_render_pass();
        }
    }

    /// Begin the implicit render pass of the bound render targets unless it
    /// is already active
    fn commit_render_pass_and_framebuffer(&mut self) -> VulkanResult<()> {
        if self.command_buffer.state().framebuffer == self.vk_framebuffer {
            return Ok(());
        }
        if self.command_buffer.state().inside_render_pass() {
            self.command_buffer.end_render_pass();
        }
        if self.vk_framebuffer != vk::Framebuffer::null() {
            #[cfg(debug_assertions)]
            self.transition_render_targets(StateTransitionMode::Verify)?;
            self.ensure_command_buffer()?;
            self.command_buffer.begin_render_pass(
                self.vk_render_pass,
                self.vk_framebuffer,
                self.framebuffer_width,
                self.framebuffer_height,
                Vec::new(),
            );
        }
        Ok(())
    }

    /// Begin an explicit render pass
    pub fn begin_render_pass(&mut self, attribs: BeginRenderPassAttribs) -> VulkanResult<()> {
        if self.active_render_pass.is_some() {
            error!("A render pass is already active. End it before beginning a new one");
            return Ok(());
        }
        self.reset_render_targets();
        for attachment in &attribs.attachments {
            if attachment.initial_state.is_known() {
                self.transition_or_verify(
                    attachment.texture.as_ref(),
                    attribs.transition_mode,
                    attachment.initial_state,
                    None,
                )?;
            }
        }

        self.ensure_command_buffer()?;
        self.vk_render_pass = attribs.render_pass;
        self.vk_framebuffer = attribs.framebuffer;
        self.framebuffer_width = attribs.width;
        self.framebuffer_height = attribs.height;
        self.command_buffer.begin_render_pass(
            attribs.render_pass,
            attribs.framebuffer,
            attribs.width,
            attribs.height,
            attribs.clear_values,
        );
        self.active_render_pass = Some(ActiveRenderPass {
            attachments: attribs.attachments,
        });
        self.set_viewports(&[], attribs.width, attribs.height)
    }

    /// End the explicit render pass. Attachments take their final states.
    pub fn end_render_pass(&mut self) -> VulkanResult<()> {
        let Some(pass) = self.active_render_pass.take() else {
            error!("There is no active render pass to end");
            return Ok(());
        };
        if self.command_buffer.state().inside_render_pass() {
            self.command_buffer.end_render_pass();
        }
        for attachment in pass.attachments {
            if attachment.final_state.is_known() {
                attachment.texture.set_state(attachment.final_state);
            }
        }
        self.reset_render_targets();
        if self.should_auto_flush() {
            self.flush()?;
        }
        Ok(())
    }

    fn prepare_for_draw(&mut self) -> VulkanResult<bool> {
        let Some(pipeline) = &self.pipeline else {
            error!("No pipeline state is bound");
            return Ok(false);
        };
        if pipeline.is_compute() {
            error!("Pipeline '{}' is a compute pipeline and can't be used for draws", pipeline.name());
            return Ok(false);
        }
        if self.vk_framebuffer == vk::Framebuffer::null() {
            error!("Draw command was issued without render targets or an active render pass");
            return Ok(false);
        }

        self.ensure_command_buffer()?;
        if !self.state.vbs_up_to_date {
            self.commit_vertex_buffers();
        }
        self.bind_descriptor_sets_with_dynamic_offsets();
        if self.active_render_pass.is_none() {
            self.commit_render_pass_and_framebuffer()?;
        }
        Ok(true)
    }

    /// Draw non-indexed primitives
    pub fn draw(&mut self, attribs: &DrawAttribs) -> VulkanResult<()> {
        if !self.prepare_for_draw()? {
            return Ok(());
        }
        self.command_buffer.draw(
            attribs.num_vertices,
            attribs.num_instances,
            attribs.start_vertex,
            attribs.first_instance,
        );
        self.state.num_commands += 1;
        Ok(())
    }

    /// Draw indexed primitives
    pub fn draw_indexed(&mut self, attribs: &DrawIndexedAttribs) -> VulkanResult<()> {
        if !self.prepare_for_draw()? || !self.commit_index_buffer(attribs.index_type) {
            return Ok(());
        }
        self.command_buffer.draw_indexed(
            attribs.num_indices,
            attribs.num_instances,
            attribs.first_index,
            attribs.base_vertex,
            attribs.first_instance,
        );
        self.state.num_commands += 1;
        Ok(())
    }

    /// Draw with arguments read from `args`
    pub fn draw_indirect(&mut self, attribs: &DrawIndirectAttribs, args: &BufferVk) -> VulkanResult<()> {
        // The argument barrier has to be recorded before the pass begins
        self.transition_or_verify(args, attribs.transition_mode, ResourceState::INDIRECT_ARGUMENT, None)?;
        if !self.prepare_for_draw()? {
            return Ok(());
        }
        self.command_buffer.draw_indirect(
            args.vk_buffer(),
            args.dynamic_offset(self.id) + attribs.offset,
            attribs.draw_count,
            attribs.stride,
        );
        self.state.num_commands += 1;
        Ok(())
    }

    /// Draw indexed primitives with arguments read from `args`
    pub fn draw_indexed_indirect(
        &mut self,
        attribs: &DrawIndirectAttribs,
        index_type: vk::IndexType,
        args: &BufferVk,
    ) -> VulkanResult<()> {
        self.transition_or_verify(args, attribs.transition_mode, ResourceState::INDIRECT_ARGUMENT, None)?;
        if !self.prepare_for_draw()? || !self.commit_index_buffer(index_type) {
            return Ok(());
        }
        self.command_buffer.draw_indexed_indirect(
            args.vk_buffer(),
            args.dynamic_offset(self.id) + attribs.offset,
            attribs.draw_count,
            attribs.stride,
        );
        self.state.num_commands += 1;
        Ok(())
    }

    fn prepare_for_dispatch(&mut self) -> VulkanResult<bool> {
        match &self.pipeline {
            Some(pipeline) if pipeline.is_compute() => {}
            Some(pipeline) => {
                error!("Pipeline '{}' is not a compute pipeline", pipeline.name());
                return Ok(false);
            }
            None => {
                error!("No pipeline state is bound");
                return Ok(false);
            }
        }
        self.ensure_command_buffer()?;
        if !self.ensure_outside_render_pass("Dispatch") {
            return Ok(false);
        }
        self.bind_descriptor_sets_with_dynamic_offsets();
        Ok(true)
    }

    /// Dispatch compute work groups
    pub fn dispatch_compute(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) -> VulkanResult<()> {
        if !self.prepare_for_dispatch()? {
            return Ok(());
        }
        self.command_buffer.dispatch(group_count_x, group_count_y, group_count_z);
        self.state.num_commands += 1;
        Ok(())
    }

    /// Dispatch with group counts read from `args`
    pub fn dispatch_compute_indirect(
        &mut self,
        args: &BufferVk,
        offset: u64,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        self.transition_or_verify(args, mode, ResourceState::INDIRECT_ARGUMENT, None)?;
        if !self.prepare_for_dispatch()? {
            return Ok(());
        }
        self.command_buffer
            .dispatch_indirect(args.vk_buffer(), args.dynamic_offset(self.id) + offset);
        self.state.num_commands += 1;
        Ok(())
    }

    fn full_clear_rect(&self, layer_count: u32) -> vk::ClearRect {
        vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: self.framebuffer_width,
                    height: self.framebuffer_height,
                },
            },
            base_array_layer: 0,
            layer_count,
        }
    }

    /// Clear a render target view.
    ///
    /// Bound targets are cleared inside the render pass, others with a
    /// transfer clear.
    pub fn clear_render_target(
        &mut self,
        view: &Arc<TextureView>,
        color: [f32; 4],
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        if view.view_type() != TextureViewType::RenderTarget {
            error!("View of '{}' passed to clear_render_target is not a render target view", view.texture().name());
            return Ok(());
        }
        self.ensure_command_buffer()?;

        let attachment = self
            .render_targets
            .iter()
            .position(|bound| bound.handle() == view.handle());
        if let Some(index) = attachment {
            if self.active_render_pass.is_none() {
                self.transition_render_targets(mode)?;
                self.commit_render_pass_and_framebuffer()?;
            }
            let rect = self.full_clear_rect(view.desc().num_slices);
            self.command_buffer.clear_attachment(
                vk::ImageAspectFlags::COLOR,
                index as u32,
                ClearValue::Color(color),
                rect,
            );
        } else {
            if !self.ensure_outside_render_pass("Clearing a render target that is not bound") {
                return Ok(());
            }
            let texture = Arc::clone(view.texture());
            let range = view.subresource_range();
            self.transition_or_verify(texture.as_ref(), mode, ResourceState::COPY_DEST, Some(range))?;
            self.command_buffer.clear_color_image(
                texture.vk_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                color,
                range,
            );
        }
        self.state.num_commands += 1;
        Ok(())
    }

    /// Clear the depth and/or stencil planes of a depth-stencil view
    pub fn clear_depth_stencil(
        &mut self,
        view: &Arc<TextureView>,
        flags: ClearDepthStencilFlags,
        depth: f32,
        stencil: u32,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        if view.view_type() != TextureViewType::DepthStencil {
            error!("View of '{}' passed to clear_depth_stencil is not a depth-stencil view", view.texture().name());
            return Ok(());
        }
        let mut aspect = vk::ImageAspectFlags::empty();
        if flags.contains(ClearDepthStencilFlags::DEPTH) {
            aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if flags.contains(ClearDepthStencilFlags::STENCIL) {
            if has_stencil(view_format(view)) {
                aspect |= vk::ImageAspectFlags::STENCIL;
            } else {
                warn!("Stencil clear of '{}' ignored: the format has no stencil", view.texture().name());
            }
        }
        if aspect.is_empty() {
            return Ok(());
        }
        self.ensure_command_buffer()?;

        let bound = self
            .depth_stencil
            .as_ref()
            .map_or(false, |bound| bound.handle() == view.handle());
        if bound {
            if self.active_render_pass.is_none() {
                self.transition_render_targets(mode)?;
                self.commit_render_pass_and_framebuffer()?;
            }
            let rect = self.full_clear_rect(view.desc().num_slices);
            self.command_buffer.clear_attachment(
                aspect,
                vk::ATTACHMENT_UNUSED,
                ClearValue::DepthStencil { depth, stencil },
                rect,
            );
        } else {
            if !self.ensure_outside_render_pass("Clearing a depth-stencil view that is not bound") {
                return Ok(());
            }
            let texture = Arc::clone(view.texture());
            let range = vk::ImageSubresourceRange {
                aspect_mask: aspect,
                ..view.subresource_range()
            };
            self.transition_or_verify(texture.as_ref(), mode, ResourceState::COPY_DEST, Some(range))?;
            self.command_buffer.clear_depth_stencil_image(
                texture.vk_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                depth,
                stencil,
                range,
            );
        }
        self.state.num_commands += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{compute_pipeline, graphics_pipeline, immediate_context, targets};
    use super::*;
    use crate::core::EngineVkConfig;
    use crate::render::vulkan::device::RenderDevice;
    use crate::render::vulkan::mock::MockDevice;
    use crate::render::vulkan::native::Command;
    use crate::render::vulkan::resources::test_support::{render_target, test_device};
    use crate::render::vulkan::resources::{
        BufferDesc, GraphicsPipelineDesc, MapFlags, MapType, PipelineKind, PipelineStateDesc, ResourceBinding,
        TextureViewDesc,
    };
    use ash::vk::Handle;

    const COLOR: vk::Format = vk::Format::R8G8B8A8_UNORM;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    fn count(native: &MockDevice, predicate: impl Fn(&Command) -> bool) -> usize {
        native.count_commands(predicate)
    }

    #[test]
    fn test_draw_begins_one_render_pass_per_flush() {
        let (native, device) = test_device();
        let mut context = immediate_context(&native, &device);
        let (color, depth) = targets(&device);
        let pipeline = graphics_pipeline(&device, &[COLOR], DEPTH);

        context.set_pipeline_state(&pipeline).unwrap();
        context
            .set_render_targets(&[Arc::clone(&color)], Some(Arc::clone(&depth)), StateTransitionMode::Transition)
            .unwrap();
        context.draw(&DrawAttribs::new(3)).unwrap();
        context.draw(&DrawAttribs::new(6)).unwrap();
        let first_fence = device.command_queue(0).next_fence_value();
        context.flush().unwrap();

        assert_eq!(count(&native, |c| matches!(c, Command::BeginRenderPass { .. })), 1);
        assert_eq!(count(&native, |c| matches!(c, Command::EndRenderPass)), 1);
        assert_eq!(count(&native, |c| matches!(c, Command::Draw { .. })), 2);
        let barriers = native.image_barriers();
        let color_barriers: Vec<_> = barriers.iter().filter(|b| b.image == color.texture().vk_image()).collect();
        assert_eq!(color_barriers.len(), 1);
        assert_eq!(color_barriers[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_barriers: Vec<_> = barriers.iter().filter(|b| b.image == depth.texture().vk_image()).collect();
        assert_eq!(depth_barriers.len(), 1);
        assert_eq!(depth_barriers[0].new_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(barriers.len(), 2);
        assert_eq!(color.texture().state(), ResourceState::RENDER_TARGET);
        assert_eq!(depth.texture().state(), ResourceState::DEPTH_WRITE);

        // Targets stay bound across the flush and the pass restarts
        context.set_pipeline_state(&pipeline).unwrap();
        context.draw(&DrawAttribs::new(3)).unwrap();
        context.flush().unwrap();
        assert_eq!(count(&native, |c| matches!(c, Command::BeginRenderPass { .. })), 2);
        assert_eq!(native.image_barriers().len(), 2);
        assert!(device.command_queue(0).next_fence_value() > first_fence);
        assert_eq!(native.submissions().len(), 2);
    }

    #[test]
    fn test_draw_without_render_targets_records_nothing() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let pipeline = graphics_pipeline(&device, &[COLOR], vk::Format::UNDEFINED);
        context.set_pipeline_state(&pipeline).unwrap();
        context.draw(&DrawAttribs::new(3)).unwrap();

        assert_eq!(context.num_commands(), 0);
        assert_eq!(count(&native, |c| matches!(c, Command::Draw { .. })), 0);
    }

    #[test]
    fn test_auto_flush_at_threshold() {
        crate::foundation::logging::init_for_tests();
        let native = Arc::new(MockDevice::new());
        let device =
            RenderDevice::new(native.clone(), EngineVkConfig::default().with_num_commands_to_flush(2)).unwrap();
        let mut context = immediate_context(&native, &device);
        let (color, _depth) = targets(&device);
        let opaque = graphics_pipeline(&device, &[COLOR], vk::Format::UNDEFINED);
        let compute = compute_pipeline(&device);

        context.set_pipeline_state(&opaque).unwrap();
        context
            .set_render_targets(&[color], None, StateTransitionMode::Transition)
            .unwrap();
        context.draw(&DrawAttribs::new(3)).unwrap();
        context.set_pipeline_state(&compute).unwrap();
        assert!(native.submissions().is_empty());

        context.dispatch_compute(1, 1, 1).unwrap();
        context.set_pipeline_state(&opaque).unwrap();
        assert_eq!(native.submissions().len(), 1);
        assert_eq!(context.num_commands(), 0);
    }

    #[test]
    fn test_viewport_is_flipped() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (color, _depth) = targets(&device);
        context
            .set_render_targets(&[color], None, StateTransitionMode::Transition)
            .unwrap();

        let viewports: Vec<vk::Viewport> = native
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::SetViewports { viewports, .. } => Some(viewports),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(viewports.len(), 1);
        assert_eq!(viewports[0].y, 64.0);
        assert_eq!(viewports[0].height, -64.0);
        assert_eq!(viewports[0].width, 64.0);
    }

    #[test]
    fn test_scissors_follow_pipeline() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let plain = graphics_pipeline(&device, &[COLOR], vk::Format::UNDEFINED);
        let scissored = PipelineState::new(
            &device,
            PipelineStateDesc {
                name: "ui".into(),
                kind: PipelineKind::Graphics(GraphicsPipelineDesc {
                    rtv_formats: vec![COLOR],
                    scissor_enable: true,
                    ..GraphicsPipelineDesc::default()
                }),
                pipeline: vk::Pipeline::from_raw(0x500),
                ..plain.desc().clone()
            },
        );
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 4, y: 4 },
            extent: vk::Extent2D { width: 8, height: 8 },
        };

        context.set_pipeline_state(&plain).unwrap();
        context.set_scissor_rects(&[rect]).unwrap();
        assert_eq!(count(&native, |c| matches!(c, Command::SetScissors { .. })), 0);

        context.set_pipeline_state(&scissored).unwrap();
        assert_eq!(count(&native, |c| matches!(c, Command::SetScissors { .. })), 1);
    }

    #[test]
    fn test_dispatch_ends_implicit_render_pass() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (color, _depth) = targets(&device);
        context
            .set_pipeline_state(&graphics_pipeline(&device, &[COLOR], vk::Format::UNDEFINED))
            .unwrap();
        context
            .set_render_targets(&[color], None, StateTransitionMode::Transition)
            .unwrap();
        context.draw(&DrawAttribs::new(3)).unwrap();
        context.set_pipeline_state(&compute_pipeline(&device)).unwrap();
        context.dispatch_compute(8, 8, 1).unwrap();

        let commands = native.commands();
        let end = commands.iter().position(|c| matches!(c, Command::EndRenderPass)).unwrap();
        let dispatch = commands.iter().position(|c| matches!(c, Command::Dispatch { .. })).unwrap();
        assert!(end < dispatch);
        assert!(!context.command_buffer().state().inside_render_pass());
    }

    #[test]
    fn test_clear_bound_and_unbound_targets() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (color, _depth) = targets(&device);
        let other = render_target(&device, "other", COLOR)
            .create_view(TextureViewDesc::new(TextureViewType::RenderTarget))
            .unwrap();

        context
            .set_render_targets(&[Arc::clone(&color)], None, StateTransitionMode::Transition)
            .unwrap();
        context
            .clear_render_target(&color, [0.0, 0.0, 0.0, 1.0], StateTransitionMode::Transition)
            .unwrap();
        assert_eq!(count(&native, |c| matches!(c, Command::ClearAttachment { color_attachment: 0, .. })), 1);

        context
            .clear_render_target(&other, [1.0; 4], StateTransitionMode::Transition)
            .unwrap();
        assert_eq!(count(&native, |c| matches!(c, Command::ClearColorImage { .. })), 1);
        assert_eq!(other.texture().state(), ResourceState::COPY_DEST);
        assert!(!context.command_buffer().state().inside_render_pass());
        assert_eq!(context.num_commands(), 2);
    }

    #[test]
    fn test_clear_bound_depth_uses_unused_attachment() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (_color, depth) = targets(&device);
        context
            .set_render_targets(&[], Some(Arc::clone(&depth)), StateTransitionMode::Transition)
            .unwrap();
        context
            .clear_depth_stencil(
                &depth,
                ClearDepthStencilFlags::DEPTH | ClearDepthStencilFlags::STENCIL,
                1.0,
                0,
                StateTransitionMode::Transition,
            )
            .unwrap();

        let cleared = native.commands().into_iter().find_map(|c| match c {
            Command::ClearAttachment {
                aspect_mask,
                color_attachment,
                ..
            } => Some((aspect_mask, color_attachment)),
            _ => None,
        });
        // D32 has no stencil plane
        assert_eq!(cleared, Some((vk::ImageAspectFlags::DEPTH, vk::ATTACHMENT_UNUSED)));
    }

    #[test]
    fn test_dynamic_offsets_are_rebound_after_remap() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (color, _depth) = targets(&device);
        let pipeline = PipelineState::new(
            &device,
            PipelineStateDesc {
                dynamic_set_layout: Some(vk::DescriptorSetLayout::from_raw(0x600)),
                ..graphics_pipeline(&device, &[COLOR], vk::Format::UNDEFINED).desc().clone()
            },
        );
        let constants = BufferVk::new(
            &device,
            BufferDesc::new("constants", 64, BindFlags::UNIFORM_BUFFER, Usage::Dynamic),
            None,
        )
        .unwrap();
        let mut srb = ShaderResourceBinding::new(&device, &pipeline).unwrap();
        srb.set_dynamic(0, ResourceBinding::UniformBuffer(Arc::clone(&constants)));

        context.set_pipeline_state(&pipeline).unwrap();
        context
            .set_render_targets(&[color], None, StateTransitionMode::Transition)
            .unwrap();
        let first = context
            .map_buffer(&constants, MapType::Write, MapFlags::DISCARD)
            .unwrap()
            .unwrap();
        context.commit_shader_resources(&srb, StateTransitionMode::Transition).unwrap();
        context.draw(&DrawAttribs::new(3)).unwrap();
        let second = context
            .map_buffer(&constants, MapType::Write, MapFlags::DISCARD)
            .unwrap()
            .unwrap();
        context.draw(&DrawAttribs::new(3)).unwrap();

        let offsets: Vec<Vec<u32>> = native
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::BindDescriptorSets { dynamic_offsets, .. } => Some(dynamic_offsets),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![vec![first.offset() as u32], vec![second.offset() as u32]]);
        assert_ne!(first.offset(), second.offset());
    }

    #[test]
    fn test_vertex_and_index_buffers_bound_at_draw() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (color, _depth) = targets(&device);
        let vertices = BufferVk::new(
            &device,
            BufferDesc::new("vertices", 1024, BindFlags::VERTEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();
        let indices = BufferVk::new(
            &device,
            BufferDesc::new("indices", 512, BindFlags::INDEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();

        context
            .set_pipeline_state(&graphics_pipeline(&device, &[COLOR], vk::Format::UNDEFINED))
            .unwrap();
        context
            .set_render_targets(&[color], None, StateTransitionMode::Transition)
            .unwrap();
        context
            .set_vertex_buffers(0, &[Arc::clone(&vertices)], &[16], StateTransitionMode::Transition, true)
            .unwrap();
        context
            .set_index_buffer(Some(Arc::clone(&indices)), 8, StateTransitionMode::Transition)
            .unwrap();
        context
            .draw_indexed(&DrawIndexedAttribs::new(36, vk::IndexType::UINT16))
            .unwrap();

        assert_eq!(vertices.state(), ResourceState::VERTEX_BUFFER);
        assert_eq!(indices.state(), ResourceState::INDEX_BUFFER);
        assert!(native.commands().iter().any(|c| matches!(
            c,
            Command::BindVertexBuffers { offsets, .. } if offsets == &vec![16]
        )));
        assert!(native.commands().iter().any(|c| matches!(
            c,
            Command::BindIndexBuffer { offset: 8, index_type: vk::IndexType::UINT16, .. }
        )));
        assert_eq!(count(&native, |c| matches!(c, Command::DrawIndexed { index_count: 36, .. })), 1);
    }

    #[test]
    fn test_explicit_render_pass_sets_final_states() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let texture = render_target(&device, "gbuffer", COLOR);

        context
            .begin_render_pass(BeginRenderPassAttribs {
                render_pass: vk::RenderPass::from_raw(0x700),
                framebuffer: vk::Framebuffer::from_raw(0x800),
                width: 64,
                height: 64,
                attachments: vec![RenderPassAttachment {
                    texture: Arc::clone(&texture),
                    initial_state: ResourceState::RENDER_TARGET,
                    final_state: ResourceState::SHADER_RESOURCE,
                }],
                clear_values: vec![ClearValue::Color([0.0; 4])],
                transition_mode: StateTransitionMode::Transition,
            })
            .unwrap();
        assert!(context.is_render_pass_active());

        // Transitions are refused while the pass is active
        context
            .transition_texture_state(&texture, ResourceState::UNKNOWN, ResourceState::COPY_SOURCE, true, None)
            .unwrap();
        assert_eq!(texture.state(), ResourceState::RENDER_TARGET);

        context.end_render_pass().unwrap();
        assert!(!context.is_render_pass_active());
        assert_eq!(texture.state(), ResourceState::SHADER_RESOURCE);
        assert_eq!(count(&native, |c| matches!(c, Command::EndRenderPass)), 1);
    }
}
