//! Shader resource bindings
//!
//! Every descriptor a pipeline reads is described by a [`ResourceBinding`].
//! The variant decides the state the resource must be in and the descriptor
//! written for it. Set 0 holds static bindings written once, set 1 holds
//! dynamic bindings written each time the binding object is committed.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use super::{Barrierable, BufferVk, PipelineState, TextureView};
use crate::foundation::logging::{error, warn};
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::memory::DescriptorSetAllocation;
use crate::render::vulkan::native::DescriptorWrite;
use crate::render::vulkan::state::{resource_state_to_image_layout, ResourceState};

/// Resource bound to one descriptor
#[derive(Clone)]
pub enum ResourceBinding {
    /// Uniform buffer, always bound with a dynamic offset
    UniformBuffer(Arc<BufferVk>),
    /// Storage buffer
    StorageBuffer {
        /// Bound buffer
        buffer: Arc<BufferVk>,
        /// Whether shaders write to it
        writable: bool,
    },
    /// Read-only formatted buffer
    UniformTexelBuffer {
        /// Bound buffer
        buffer: Arc<BufferVk>,
        /// Buffer view
        view: vk::BufferView,
    },
    /// Read-write formatted buffer
    StorageTexelBuffer {
        /// Bound buffer
        buffer: Arc<BufferVk>,
        /// Buffer view
        view: vk::BufferView,
    },
    /// Sampled texture
    SampledImage(Arc<TextureView>),
    /// Read-write texture
    StorageImage(Arc<TextureView>),
    /// Subpass input
    InputAttachment(Arc<TextureView>),
    /// Separate sampler
    Sampler(vk::Sampler),
    /// Atomic counters have no Vulkan descriptor
    AtomicCounter,
}

impl ResourceBinding {
    /// State the bound resource must be in when the pipeline runs
    pub fn required_state(&self) -> Option<ResourceState> {
        match self {
            Self::UniformBuffer(_) => Some(ResourceState::CONSTANT_BUFFER),
            Self::StorageBuffer { writable: true, .. } => Some(ResourceState::UNORDERED_ACCESS),
            Self::StorageBuffer { writable: false, .. } => Some(ResourceState::SHADER_RESOURCE),
            Self::UniformTexelBuffer { .. } => Some(ResourceState::SHADER_RESOURCE),
            Self::StorageTexelBuffer { .. } => Some(ResourceState::UNORDERED_ACCESS),
            Self::SampledImage(_) => Some(ResourceState::SHADER_RESOURCE),
            Self::StorageImage(_) => Some(ResourceState::UNORDERED_ACCESS),
            Self::InputAttachment(_) => Some(ResourceState::INPUT_ATTACHMENT),
            Self::Sampler(_) | Self::AtomicCounter => None,
        }
    }

    /// Descriptor type written for the binding
    pub fn descriptor_type(&self) -> Option<vk::DescriptorType> {
        match self {
            Self::UniformBuffer(_) => Some(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
            Self::StorageBuffer { .. } => Some(vk::DescriptorType::STORAGE_BUFFER),
            Self::UniformTexelBuffer { .. } => Some(vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
            Self::StorageTexelBuffer { .. } => Some(vk::DescriptorType::STORAGE_TEXEL_BUFFER),
            Self::SampledImage(_) => Some(vk::DescriptorType::SAMPLED_IMAGE),
            Self::StorageImage(_) => Some(vk::DescriptorType::STORAGE_IMAGE),
            Self::InputAttachment(_) => Some(vk::DescriptorType::INPUT_ATTACHMENT),
            Self::Sampler(_) => Some(vk::DescriptorType::SAMPLER),
            Self::AtomicCounter => None,
        }
    }

    /// Resource whose state the binding depends on, with the subresources it covers
    pub(crate) fn barrierable(&self) -> Option<(&dyn Barrierable, Option<vk::ImageSubresourceRange>)> {
        match self {
            Self::UniformBuffer(buffer)
            | Self::StorageBuffer { buffer, .. }
            | Self::UniformTexelBuffer { buffer, .. }
            | Self::StorageTexelBuffer { buffer, .. } => Some((buffer.as_ref() as &dyn Barrierable, None)),
            Self::SampledImage(view) | Self::StorageImage(view) | Self::InputAttachment(view) => {
                Some((view.texture().as_ref() as &dyn Barrierable, Some(view.subresource_range())))
            }
            Self::Sampler(_) | Self::AtomicCounter => None,
        }
    }

    fn descriptor_write(&self, binding: u32) -> Option<DescriptorWrite> {
        let ty = self.descriptor_type()?;
        let write = match self {
            Self::UniformBuffer(buffer) | Self::StorageBuffer { buffer, .. } => DescriptorWrite::Buffer {
                binding,
                ty,
                buffer: buffer.vk_buffer(),
                offset: 0,
                range: buffer.size(),
            },
            Self::UniformTexelBuffer { view, .. } | Self::StorageTexelBuffer { view, .. } => {
                DescriptorWrite::TexelBuffer { binding, ty, view: *view }
            }
            Self::SampledImage(view) | Self::StorageImage(view) | Self::InputAttachment(view) => {
                let state = self.required_state().unwrap_or(ResourceState::SHADER_RESOURCE);
                DescriptorWrite::Image {
                    binding,
                    ty,
                    view: view.handle(),
                    layout: resource_state_to_image_layout(state, false),
                }
            }
            Self::Sampler(sampler) => DescriptorWrite::Sampler {
                binding,
                sampler: *sampler,
            },
            Self::AtomicCounter => return None,
        };
        Some(write)
    }
}

/// Resources bound to the descriptor sets of one pipeline
pub struct ShaderResourceBinding {
    device: Arc<RenderDevice>,
    pipeline: Arc<PipelineState>,
    static_set: Option<DescriptorSetAllocation>,
    static_bindings: BTreeMap<u32, ResourceBinding>,
    dynamic_bindings: BTreeMap<u32, ResourceBinding>,
}

impl ShaderResourceBinding {
    /// Create a binding object, allocating the static set of `pipeline`
    pub fn new(device: &Arc<RenderDevice>, pipeline: &Arc<PipelineState>) -> VulkanResult<Self> {
        let static_set = match pipeline.static_set_layout() {
            Some(layout) => Some(device.main_descriptor_sets().allocate(layout)?),
            None => None,
        };
        Ok(Self {
            device: Arc::clone(device),
            pipeline: Arc::clone(pipeline),
            static_set,
            static_bindings: BTreeMap::new(),
            dynamic_bindings: BTreeMap::new(),
        })
    }

    /// Pipeline the bindings were created for
    pub fn pipeline(&self) -> &Arc<PipelineState> {
        &self.pipeline
    }

    /// Native static set
    pub fn static_set(&self) -> Option<vk::DescriptorSet> {
        self.static_set.map(|allocation| allocation.set)
    }

    /// Bind a resource to set 0 and write its descriptor right away
    pub fn set_static(&mut self, binding: u32, resource: ResourceBinding) {
        let Some(allocation) = self.static_set else {
            error!("Pipeline '{}' has no static descriptor set", self.pipeline.name());
            return;
        };
        match resource.descriptor_write(binding) {
            Some(write) => self.device.native().update_descriptor_set(allocation.set, &[write]),
            None => warn!("Binding {binding} of '{}' has no descriptor to write", self.pipeline.name()),
        }
        self.static_bindings.insert(binding, resource);
    }

    /// Bind a resource to set 1. Its descriptor is written at commit time.
    pub fn set_dynamic(&mut self, binding: u32, resource: ResourceBinding) {
        if self.pipeline.dynamic_set_layout().is_none() {
            error!("Pipeline '{}' has no dynamic descriptor set", self.pipeline.name());
            return;
        }
        self.dynamic_bindings.insert(binding, resource);
    }

    /// Every bound resource, set 0 first
    pub fn bindings(&self) -> impl Iterator<Item = &ResourceBinding> {
        self.static_bindings.values().chain(self.dynamic_bindings.values())
    }

    /// Whether anything is bound to set 1
    pub fn has_dynamic_bindings(&self) -> bool {
        !self.dynamic_bindings.is_empty()
    }

    /// Descriptors of set 1
    pub(crate) fn dynamic_writes(&self) -> Vec<DescriptorWrite> {
        self.dynamic_bindings
            .iter()
            .filter_map(|(&binding, resource)| resource.descriptor_write(binding))
            .collect()
    }

    /// Buffers bound with a dynamic offset, in the set and binding order
    /// `vkCmdBindDescriptorSets` expects the offsets in
    pub(crate) fn dynamic_offset_buffers(&self) -> Vec<Arc<BufferVk>> {
        self.bindings()
            .filter_map(|resource| match resource {
                ResourceBinding::UniformBuffer(buffer) => Some(Arc::clone(buffer)),
                _ => None,
            })
            .collect()
    }
}

impl Drop for ShaderResourceBinding {
    fn drop(&mut self) {
        if let Some(allocation) = self.static_set.take() {
            let stale = self.device.main_descriptor_sets().stale_set(allocation);
            self.device.safe_release_device_object(stale, self.device.command_queue_mask());
        }
    }
}
