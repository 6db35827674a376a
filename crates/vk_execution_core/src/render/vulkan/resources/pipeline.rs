//! Pipeline state objects
//!
//! Pipelines and their layouts are built outside of the execution core. A
//! [`PipelineState`] only carries the native handles together with what the
//! context needs to bind them and to check render target compatibility.

use std::sync::Arc;

use ash::vk;

use crate::render::vulkan::device::RenderDevice;

/// Output signature of a graphics pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsPipelineDesc {
    /// Color attachment formats
    pub rtv_formats: Vec<vk::Format>,
    /// Depth-stencil format, `UNDEFINED` when there is none
    pub dsv_format: vk::Format,
    /// Samples per pixel
    pub sample_count: u8,
    /// Whether the rasterizer applies the context's scissor rectangles
    pub scissor_enable: bool,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            rtv_formats: Vec::new(),
            dsv_format: vk::Format::UNDEFINED,
            sample_count: 1,
            scissor_enable: false,
        }
    }
}

/// Graphics or compute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineKind {
    /// Rasterization pipeline
    Graphics(GraphicsPipelineDesc),
    /// Compute pipeline
    Compute,
}

/// Pipeline state creation parameters
#[derive(Debug, Clone)]
pub struct PipelineStateDesc {
    /// Debug name
    pub name: String,
    /// Pipeline kind
    pub kind: PipelineKind,
    /// Native pipeline
    pub pipeline: vk::Pipeline,
    /// Native pipeline layout
    pub layout: vk::PipelineLayout,
    /// Layout of set 0, written once per binding object
    pub static_set_layout: Option<vk::DescriptorSetLayout>,
    /// Layout of set 1, written at every commit
    pub dynamic_set_layout: Option<vk::DescriptorSetLayout>,
}

/// Pipeline state object
#[derive(Debug)]
pub struct PipelineState {
    desc: PipelineStateDesc,
    id: u64,
}

impl PipelineState {
    /// Wrap native pipeline handles
    pub fn new(device: &RenderDevice, desc: PipelineStateDesc) -> Arc<Self> {
        Arc::new(Self {
            id: device.allocate_resource_id(),
            desc,
        })
    }

    /// Creation parameters
    pub fn desc(&self) -> &PipelineStateDesc {
        &self.desc
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Device-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this is a compute pipeline
    pub fn is_compute(&self) -> bool {
        matches!(self.desc.kind, PipelineKind::Compute)
    }

    /// Output signature of a graphics pipeline
    pub fn graphics(&self) -> Option<&GraphicsPipelineDesc> {
        match &self.desc.kind {
            PipelineKind::Graphics(graphics) => Some(graphics),
            PipelineKind::Compute => None,
        }
    }

    /// Bind point of the pipeline
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.desc.kind {
            PipelineKind::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }

    /// Native pipeline
    pub fn pipeline(&self) -> vk::Pipeline {
        self.desc.pipeline
    }

    /// Native pipeline layout
    pub fn layout(&self) -> vk::PipelineLayout {
        self.desc.layout
    }

    /// Whether scissor rectangles must be committed for this pipeline
    pub fn scissor_enabled(&self) -> bool {
        self.graphics().map_or(false, |graphics| graphics.scissor_enable)
    }

    /// Layout of the static set
    pub fn static_set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.desc.static_set_layout
    }

    /// Layout of the dynamic set
    pub fn dynamic_set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.desc.dynamic_set_layout
    }

    /// Whether the pipeline uses any descriptor set
    pub fn has_descriptor_sets(&self) -> bool {
        self.desc.static_set_layout.is_some() || self.desc.dynamic_set_layout.is_some()
    }
}
