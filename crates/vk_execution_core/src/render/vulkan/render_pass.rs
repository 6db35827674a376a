//! Render pass cache
//!
//! Render passes are keyed purely by their attachment signature: formats, sample
//! count and per-attachment load/store ops. Every set of render targets with a
//! matching signature shares one native pass. Implicit passes load and store
//! every attachment. Cached passes live until the device is destroyed.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::error::VulkanResult;
use super::native::{AttachmentDesc, NativeDevice, RenderPassDesc};
use super::state::{resource_state_to_image_layout, ResourceState};
use crate::foundation::logging::debug;

/// Maximum number of simultaneously bound render targets
pub const MAX_RENDER_TARGETS: usize = 8;

/// Load and store operations of one attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentOps {
    /// What happens to the contents when the pass begins
    pub load: vk::AttachmentLoadOp,
    /// What happens to the contents when the pass ends
    pub store: vk::AttachmentStoreOp,
}

impl AttachmentOps {
    /// Preserve contents across the pass, as implicit passes do
    pub const LOAD_STORE: Self = Self {
        load: vk::AttachmentLoadOp::LOAD,
        store: vk::AttachmentStoreOp::STORE,
    };
}

impl Default for AttachmentOps {
    fn default() -> Self {
        Self::LOAD_STORE
    }
}

/// Structural description of a single-subpass render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassCacheKey {
    /// Number of color attachments
    pub num_render_targets: u8,
    /// Samples per pixel
    pub sample_count: u8,
    /// Color formats, `UNDEFINED` past `num_render_targets`
    pub rtv_formats: [vk::Format; MAX_RENDER_TARGETS],
    /// Depth-stencil format, `UNDEFINED` when there is no depth attachment
    pub dsv_format: vk::Format,
    /// Color attachment ops, `LOAD_STORE` past `num_render_targets`
    pub rtv_ops: [AttachmentOps; MAX_RENDER_TARGETS],
    /// Depth and stencil ops
    pub dsv_ops: AttachmentOps,
}

impl Default for RenderPassCacheKey {
    fn default() -> Self {
        Self {
            num_render_targets: 0,
            sample_count: 1,
            rtv_formats: [vk::Format::UNDEFINED; MAX_RENDER_TARGETS],
            dsv_format: vk::Format::UNDEFINED,
            rtv_ops: [AttachmentOps::LOAD_STORE; MAX_RENDER_TARGETS],
            dsv_ops: AttachmentOps::LOAD_STORE,
        }
    }
}

impl RenderPassCacheKey {
    /// Build a key from render target and depth formats. Every attachment loads and stores.
    pub fn new(rtv_formats: &[vk::Format], dsv_format: vk::Format, sample_count: u8) -> Self {
        let mut key = Self {
            num_render_targets: rtv_formats.len().min(MAX_RENDER_TARGETS) as u8,
            sample_count,
            dsv_format,
            ..Self::default()
        };
        for (slot, format) in key.rtv_formats.iter_mut().zip(rtv_formats) {
            *slot = *format;
        }
        key
    }

    /// Replace the ops of color attachment `slot`. Slots past the bound targets are ignored.
    #[must_use]
    pub fn with_color_ops(mut self, slot: usize, ops: AttachmentOps) -> Self {
        if slot < usize::from(self.num_render_targets) {
            self.rtv_ops[slot] = ops;
        }
        self
    }

    /// Replace the ops of the depth-stencil attachment
    #[must_use]
    pub fn with_depth_ops(mut self, ops: AttachmentOps) -> Self {
        if self.dsv_format != vk::Format::UNDEFINED {
            self.dsv_ops = ops;
        }
        self
    }

    /// Whether the key describes no attachments at all
    pub fn is_empty(&self) -> bool {
        self.num_render_targets == 0 && self.dsv_format == vk::Format::UNDEFINED
    }

    fn samples(&self) -> vk::SampleCountFlags {
        vk::SampleCountFlags::from_raw(u32::from(self.sample_count.max(1)))
    }

    /// Native description of the single-subpass pass this key stands for.
    ///
    /// The depth attachment comes first, followed by color attachments in slot order.
    pub fn to_render_pass_desc(&self) -> RenderPassDesc {
        let samples = self.samples();
        let mut desc = RenderPassDesc::default();

        if self.dsv_format != vk::Format::UNDEFINED {
            let layout = resource_state_to_image_layout(ResourceState::DEPTH_WRITE, true);
            desc.attachments.push(AttachmentDesc {
                format: self.dsv_format,
                samples,
                load_op: self.dsv_ops.load,
                store_op: self.dsv_ops.store,
                stencil_load_op: self.dsv_ops.load,
                stencil_store_op: self.dsv_ops.store,
                initial_layout: layout,
                final_layout: layout,
            });
            desc.depth_reference = Some(vk::AttachmentReference {
                attachment: 0,
                layout,
            });
        }

        let layout = resource_state_to_image_layout(ResourceState::RENDER_TARGET, true);
        let count = usize::from(self.num_render_targets);
        for (format, ops) in self.rtv_formats[..count].iter().zip(&self.rtv_ops[..count]) {
            let attachment = desc.attachments.len() as u32;
            desc.attachments.push(AttachmentDesc {
                format: *format,
                samples,
                load_op: ops.load,
                store_op: ops.store,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: layout,
                final_layout: layout,
            });
            desc.color_references.push(vk::AttachmentReference { attachment, layout });
        }

        desc
    }
}

/// Lookup-or-create cache of render passes
pub struct RenderPassCache {
    device: Arc<dyn NativeDevice>,
    cache: Mutex<HashMap<RenderPassCacheKey, vk::RenderPass>>,
}

impl RenderPassCache {
    /// Create an empty cache
    pub fn new(device: Arc<dyn NativeDevice>) -> Self {
        Self {
            device,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get the render pass for `key`, creating it on first use
    pub fn get_render_pass(&self, key: &RenderPassCacheKey) -> VulkanResult<vk::RenderPass> {
        let mut cache = self.cache.lock();
        if let Some(render_pass) = cache.get(key) {
            return Ok(*render_pass);
        }

        let render_pass = self.device.create_render_pass(&key.to_render_pass_desc())?;
        debug!(
            "Created implicit render pass {:?} ({} RT(s), depth {:?}, {}x MS)",
            render_pass, key.num_render_targets, key.dsv_format, key.sample_count
        );
        cache.insert(*key, render_pass);
        Ok(render_pass)
    }

    /// Number of cached passes
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the cache holds no passes
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Remove every cached pass and hand the handles to the caller for destruction
    pub fn take_all(&self) -> Vec<vk::RenderPass> {
        self.cache.lock().drain().map(|(_, render_pass)| render_pass).collect()
    }
}
