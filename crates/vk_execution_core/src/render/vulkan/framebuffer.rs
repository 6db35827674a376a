//! Framebuffer cache
//!
//! Framebuffers are keyed by the concrete views they bind. Reverse maps from
//! views and render passes to keys let the cache evict every framebuffer that
//! references an object being destroyed. Eviction hands the framebuffers back to
//! the caller, which releases them through the release queues of the queues the
//! framebuffer may have been used on.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::error::VulkanResult;
use super::native::{FramebufferDesc, NativeDevice, NativeObject};
use super::render_pass::MAX_RENDER_TARGETS;
use crate::foundation::logging::{debug, warn};

/// Identity of a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferCacheKey {
    /// Compatible render pass
    pub render_pass: vk::RenderPass,
    /// Number of color views
    pub num_render_targets: u32,
    /// Depth-stencil view, null when absent
    pub dsv: vk::ImageView,
    /// Color views, null past `num_render_targets`
    pub rtvs: [vk::ImageView; MAX_RENDER_TARGETS],
    /// Queues the framebuffer may be used on
    pub command_queue_mask: u64,
}

impl Default for FramebufferCacheKey {
    fn default() -> Self {
        Self {
            render_pass: vk::RenderPass::null(),
            num_render_targets: 0,
            dsv: vk::ImageView::null(),
            rtvs: [vk::ImageView::null(); MAX_RENDER_TARGETS],
            command_queue_mask: u64::MAX,
        }
    }
}

impl FramebufferCacheKey {
    fn views(&self) -> impl Iterator<Item = vk::ImageView> + '_ {
        std::iter::once(self.dsv)
            .chain(self.rtvs[..self.num_render_targets as usize].iter().copied())
            .filter(|view| *view != vk::ImageView::null())
    }

    fn attachments(&self) -> Vec<vk::ImageView> {
        let mut attachments = Vec::with_capacity(1 + self.num_render_targets as usize);
        if self.dsv != vk::ImageView::null() {
            attachments.push(self.dsv);
        }
        attachments.extend_from_slice(&self.rtvs[..self.num_render_targets as usize]);
        attachments
    }
}

/// A framebuffer removed from the cache, with the queues it must be released on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictedFramebuffer {
    /// Native handle
    pub framebuffer: vk::Framebuffer,
    /// Queue mask from the cache key
    pub command_queue_mask: u64,
}

#[derive(Default)]
struct FramebufferCacheInner {
    cache: HashMap<FramebufferCacheKey, vk::Framebuffer>,
    view_to_keys: HashMap<vk::ImageView, Vec<FramebufferCacheKey>>,
    pass_to_keys: HashMap<vk::RenderPass, Vec<FramebufferCacheKey>>,
}

impl FramebufferCacheInner {
    fn evict(&mut self, keys: Vec<FramebufferCacheKey>) -> Vec<EvictedFramebuffer> {
        // Several views of one key share the framebuffer; the first eviction wins
        keys.into_iter()
            .filter_map(|key| {
                let framebuffer = self.cache.remove(&key)?;
                self.forget(&key);
                Some(EvictedFramebuffer {
                    framebuffer,
                    command_queue_mask: key.command_queue_mask,
                })
            })
            .collect()
    }

    /// Drop `key` from the reverse maps, removing lists that become empty
    fn forget(&mut self, key: &FramebufferCacheKey) {
        remove_key(&mut self.pass_to_keys, key.render_pass, key);
        for view in key.views() {
            remove_key(&mut self.view_to_keys, view, key);
        }
    }
}

fn remove_key<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Vec<FramebufferCacheKey>>,
    owner: K,
    key: &FramebufferCacheKey,
) {
    if let Some(keys) = map.get_mut(&owner) {
        keys.retain(|k| k != key);
        if keys.is_empty() {
            map.remove(&owner);
        }
    }
}

/// Lookup-or-create cache of framebuffers
pub struct FramebufferCache {
    device: Arc<dyn NativeDevice>,
    inner: Mutex<FramebufferCacheInner>,
}

impl FramebufferCache {
    /// Create an empty cache
    pub fn new(device: Arc<dyn NativeDevice>) -> Self {
        Self {
            device,
            inner: Mutex::new(FramebufferCacheInner::default()),
        }
    }

    /// Get the framebuffer for `key`, creating it on first use
    pub fn get_framebuffer(
        &self,
        key: &FramebufferCacheKey,
        width: u32,
        height: u32,
        layers: u32,
    ) -> VulkanResult<vk::Framebuffer> {
        let mut inner = self.inner.lock();
        if let Some(framebuffer) = inner.cache.get(key) {
            return Ok(*framebuffer);
        }

        let framebuffer = self.device.create_framebuffer(&FramebufferDesc {
            render_pass: key.render_pass,
            attachments: key.attachments(),
            width,
            height,
            layers,
        })?;

        inner.cache.insert(*key, framebuffer);
        inner.pass_to_keys.entry(key.render_pass).or_default().push(*key);
        for view in key.views() {
            inner.view_to_keys.entry(view).or_default().push(*key);
        }
        Ok(framebuffer)
    }

    /// Evict every framebuffer that references `view`
    pub fn on_destroy_image_view(&self, view: vk::ImageView) -> Vec<EvictedFramebuffer> {
        let mut inner = self.inner.lock();
        let keys = inner.view_to_keys.remove(&view).unwrap_or_default();
        let evicted = inner.evict(keys);
        if !evicted.is_empty() {
            debug!("Evicted {} framebuffer(s) referencing view {:?}", evicted.len(), view);
        }
        evicted
    }

    /// Evict every framebuffer created for `render_pass`
    pub fn on_destroy_render_pass(&self, render_pass: vk::RenderPass) -> Vec<EvictedFramebuffer> {
        let mut inner = self.inner.lock();
        let keys = inner.pass_to_keys.remove(&render_pass).unwrap_or_default();
        inner.evict(keys)
    }

    /// Number of cached framebuffers
    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Whether no framebuffer is cached
    pub fn is_empty(&self) -> bool {
        self.inner.lock().cache.is_empty()
    }

    #[cfg(test)]
    fn reverse_map_sizes(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.view_to_keys.len(), inner.pass_to_keys.len())
    }
}

impl Drop for FramebufferCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.cache.is_empty() {
            warn!(
                "{} framebuffer(s) still cached at teardown; all image views must be released first",
                inner.cache.len()
            );
        }
        for (_, framebuffer) in inner.cache.drain() {
            self.device.destroy(NativeObject::Framebuffer(framebuffer));
        }
    }
}
