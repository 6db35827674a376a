//! Submission, command lists, fences, frames and queries

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;

use super::{ContextState, DeviceContext};
use crate::foundation::logging::{debug, error, warn};
use crate::render::vulkan::commands::CommandBufferPool;
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::native::SubmitBatch;
use crate::render::vulkan::resources::{Query, QueryType};
use crate::render::vulkan::sync::{FenceTimeline, FenceValue};

/// Commands recorded by a deferred context, ready to be executed by an
/// immediate context
pub struct CommandList {
    handle: vk::CommandBuffer,
    pool: Arc<CommandBufferPool>,
    submitted_queue_mask: Arc<AtomicU64>,
    executed: bool,
}

impl CommandList {
    /// Native command buffer holding the commands
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if !self.executed {
            warn!("Command list was dropped without being executed");
            // Never submitted, so the GPU can't be using it
            self.pool.recycle(self.handle);
        }
    }
}

impl DeviceContext {
    /// Submit everything recorded so far to the command queue.
    ///
    /// Submits even when nothing was recorded so stale resources released
    /// since the last submission get a fence value.
    pub fn flush(&mut self) -> VulkanResult<()> {
        if self.deferred {
            error!("Flush is not allowed on deferred context '{}'", self.name);
            return Ok(());
        }
        if self.active_queries != 0 {
            error!(
                "Flushing '{}' with {} active query(ies). Queries must be ended before the flush",
                self.name, self.active_queries
            );
        }
        if self.active_render_pass.is_some() {
            error!("Flushing '{}' inside an active render pass", self.name);
        }

        let mut batch = SubmitBatch::default();
        if self.command_buffer.is_recording() {
            if self.command_buffer.state().inside_render_pass() {
                self.command_buffer.end_render_pass();
            }
            if let Some(manager) = &self.query_manager {
                self.state.num_commands += manager.reset_stale_queries(&mut self.command_buffer);
            }
            if self.state.num_commands != 0 || self.command_buffer.pending_barrier_count() != 0 {
                if let Err(err) = self.command_buffer.end_command_buffer() {
                    self.recycle_unsubmitted_command_buffer();
                    self.reset_after_submit();
                    return Err(err);
                }
                batch.command_buffers.push(self.command_buffer.handle());
            }
        }
        batch.wait_semaphores = mem::take(&mut self.wait_semaphores);
        batch.signal_semaphores = mem::take(&mut self.signal_semaphores);
        let fences = mem::take(&mut self.pending_fences);

        let submitted = self.device.execute_command_buffer(self.queue_index, &batch, &fences);
        let fence_value = match submitted {
            Ok(value) => value,
            Err(err) => {
                error!("Failed to submit '{}': {err}", self.name);
                self.recycle_unsubmitted_command_buffer();
                self.reset_after_submit();
                return Err(err);
            }
        };

        if let Some(&handle) = batch.command_buffers.first() {
            self.command_buffer.reset();
            self.device.discard_resource(
                self.queue_index,
                self.command_pool.stale_command_buffer(handle),
                fence_value,
            );
        }
        debug!(
            "'{}' submitted {} command(s) with fence value {fence_value}",
            self.name, self.state.num_commands
        );
        self.reset_after_submit();
        Ok(())
    }

    /// Bindings survive a submission, but nothing is bound in the next
    /// command buffer
    fn reset_after_submit(&mut self) {
        self.state = ContextState::default();
        self.bind_info = None;
        self.pipeline = None;
        self.active_render_pass = None;
        self.active_queries = 0;
    }

    /// Close the command buffer of a deferred context into a [`CommandList`]
    pub fn finish_command_list(&mut self) -> VulkanResult<Option<CommandList>> {
        if !self.deferred {
            error!("Only deferred contexts can finish command lists, '{}' is immediate", self.name);
            return Ok(None);
        }
        if self.active_render_pass.is_some() {
            error!("Finishing command list of '{}' inside an active render pass", self.name);
        }
        self.ensure_command_buffer()?;
        if self.command_buffer.state().inside_render_pass() {
            self.command_buffer.end_render_pass();
        }
        if let Err(err) = self.command_buffer.end_command_buffer() {
            self.recycle_unsubmitted_command_buffer();
            return Err(err);
        }

        let handle = self.command_buffer.handle();
        self.command_buffer.reset();
        let list = CommandList {
            handle,
            pool: Arc::clone(&self.command_pool),
            submitted_queue_mask: Arc::clone(&self.submitted_queue_mask),
            executed: false,
        };
        debug!("'{}' finished a command list with {} command(s)", self.name, self.state.num_commands);

        self.state.num_commands = 0;
        self.invalidate_state();
        Ok(Some(list))
    }

    /// Submit a command list recorded by a deferred context.
    ///
    /// Everything recorded on this context so far is flushed first. The list's
    /// command buffer returns to the deferred context's pool once the GPU is
    /// done with it.
    pub fn execute_command_list(&mut self, mut list: CommandList) -> VulkanResult<()> {
        if self.deferred {
            error!("Command lists can only be executed by immediate contexts, '{}' is deferred", self.name);
            return Ok(());
        }
        self.flush()?;
        // The list may have left any state bound
        self.invalidate_state();

        let batch = SubmitBatch {
            command_buffers: vec![list.handle],
            ..SubmitBatch::default()
        };
        let fence_value = self.device.execute_command_buffer(self.queue_index, &batch, &[])?;
        list.executed = true;
        list.submitted_queue_mask
            .fetch_or(1 << self.queue_index, Ordering::AcqRel);
        self.device.discard_resource(
            self.queue_index,
            list.pool.stale_command_buffer(list.handle),
            fence_value,
        );
        Ok(())
    }

    /// Wait on `semaphore` at `stage` before the next submission
    pub fn add_wait_semaphore(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push((semaphore, stage));
    }

    /// Signal `semaphore` when the next submission completes
    pub fn add_signal_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.signal_semaphores.push(semaphore);
    }

    /// Set `fence` to `value` once the GPU completes the next submission
    pub fn signal_fence(&mut self, fence: &Arc<FenceTimeline>, value: FenceValue) {
        if self.deferred {
            error!("Fences can't be signaled by deferred context '{}'", self.name);
            return;
        }
        self.pending_fences.push((value, Arc::clone(fence)));
    }

    /// Block until `fence` reaches `value`, flushing the context first when
    /// `flush_context` is set
    pub fn wait_for_fence(&mut self, fence: &FenceTimeline, value: FenceValue, flush_context: bool) -> VulkanResult<()> {
        if self.deferred {
            error!("Deferred context '{}' can't wait for fences", self.name);
            return Ok(());
        }
        if flush_context {
            self.flush()?;
        }
        fence.wait(value)
    }

    /// Flush and block until the command queue drains
    pub fn wait_for_idle(&mut self) -> VulkanResult<()> {
        if self.deferred {
            error!("Deferred context '{}' can't wait for idle", self.name);
            return Ok(());
        }
        self.flush()?;
        self.device.idle_command_queue(self.queue_index, true)
    }

    /// Return every frame-scoped allocation to the device.
    ///
    /// Dynamic buffer contents and mapped memory handed out during the frame
    /// must not be used after this call.
    pub fn finish_frame(&mut self) {
        if self.state.num_commands != 0 {
            if self.deferred {
                error!(
                    "'{}' has {} recorded command(s) at the end of the frame. Finish the command list first",
                    self.name, self.state.num_commands
                );
            } else {
                error!(
                    "'{}' has {} unflushed command(s) at the end of the frame. Flush the context first",
                    self.name, self.state.num_commands
                );
            }
        }
        if self.active_queries != 0 {
            error!("'{}' has {} active query(ies) at the end of the frame", self.name, self.active_queries);
        }
        if self.active_render_pass.is_some() {
            error!("'{}' is inside an active render pass at the end of the frame", self.name);
        }
        if !self.mapped_textures.is_empty() {
            error!(
                "{} texture subresource(s) of '{}' are still mapped at the end of the frame",
                self.mapped_textures.len(),
                self.name
            );
            self.mapped_textures.clear();
        }

        let queue_mask = if self.deferred {
            // Queues the frame's command lists were executed on
            self.submitted_queue_mask.swap(0, Ordering::AcqRel)
        } else {
            1 << self.queue_index
        };
        self.upload_heap.release_allocated_pages(queue_mask);
        self.dynamic_heap.release_master_blocks(queue_mask);
        self.dynamic_descriptors.release_pools(queue_mask);
    }

    /// Begin `query`. Timestamp queries are only ended.
    pub fn begin_query(&mut self, query: &mut Query) -> VulkanResult<()> {
        if self.query_manager.is_none() {
            error!("Queries are not supported by deferred context '{}'", self.name);
            return Ok(());
        }
        let query_type = query.query_type();
        if query_type == QueryType::Timestamp {
            error!("Timestamp queries are never begun. Call end_query() instead");
            return Ok(());
        }
        let type_bit = query_type.type_bit();
        let state = self.command_buffer.state();
        if (state.inside_pass_queries | state.outside_pass_queries) & type_bit != 0 {
            error!("Another {query_type:?} query is already active in '{}'", self.name);
            return Ok(());
        }

        self.ensure_command_buffer()?;
        if !query.on_begin() {
            return Ok(());
        }
        let (Some(pool), Some(index)) = (query.pool(), query.index(0)) else {
            return Ok(());
        };

        if query_type == QueryType::Duration {
            self.command_buffer
                .write_timestamp(vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, index);
        } else {
            let flags = if query_type == QueryType::Occlusion && self.device.limits().occlusion_query_precise {
                vk::QueryControlFlags::PRECISE
            } else {
                vk::QueryControlFlags::empty()
            };
            self.command_buffer.begin_query(pool, index, flags, type_bit);
            self.active_queries += 1;
        }
        self.state.num_commands += 1;
        Ok(())
    }

    /// End `query`. The result becomes available once the submission holding
    /// the end command completes.
    pub fn end_query(&mut self, query: &mut Query) -> VulkanResult<()> {
        if self.query_manager.is_none() {
            error!("Queries are not supported by deferred context '{}'", self.name);
            return Ok(());
        }
        self.ensure_command_buffer()?;
        let fence_value = self.device.command_queue(self.queue_index).next_fence_value();
        if !query.on_end(fence_value) {
            return Ok(());
        }

        let query_type = query.query_type();
        let Some(pool) = query.pool() else {
            return Ok(());
        };
        match query_type {
            QueryType::Timestamp | QueryType::Duration => {
                let slot = if query_type == QueryType::Duration { 1 } else { 0 };
                if let Some(index) = query.index(slot) {
                    self.command_buffer
                        .write_timestamp(vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, index);
                }
            }
            _ => {
                if let Some(index) = query.index(0) {
                    self.command_buffer.end_query(pool, index, query_type.type_bit());
                    self.active_queries = self.active_queries.saturating_sub(1);
                }
            }
        }
        self.state.num_commands += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::immediate_context;
    use super::*;
    use crate::render::vulkan::native::Command;
    use crate::render::vulkan::resources::test_support::test_device;
    use crate::render::vulkan::resources::{BindFlags, BufferDesc, BufferVk, StateTransitionMode, Usage};

    #[test]
    fn test_empty_flush_still_submits() {
        let (native, device) = test_device();
        let mut context = immediate_context(&native, &device);
        let before = device.command_queue(0).next_fence_value();

        context.flush().unwrap();
        context.flush().unwrap();

        let submissions = native.submissions();
        assert_eq!(submissions.len(), 2);
        assert!(submissions.iter().all(|s| s.batch.command_buffers.is_empty()));
        assert!(device.command_queue(0).next_fence_value() > before);
        assert!(!context.command_buffer().is_recording());
    }

    #[test]
    fn test_flush_passes_semaphores_and_signals_fences() {
        use ash::vk::Handle;

        let (native, device) = test_device();
        let mut context = immediate_context(&native, &device);
        let fence = device.create_fence();
        let wait = vk::Semaphore::from_raw(0x51);
        let signal = vk::Semaphore::from_raw(0x52);

        context.add_wait_semaphore(wait, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        context.add_signal_semaphore(signal);
        context.signal_fence(&fence, FenceValue::new(5));
        context.flush().unwrap();

        let batch = &native.submissions()[0].batch;
        assert_eq!(batch.wait_semaphores, vec![(wait, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)]);
        assert_eq!(batch.signal_semaphores, vec![signal]);

        context.wait_for_fence(&fence, FenceValue::new(5), false).unwrap();
        assert!(fence.is_signaled(FenceValue::new(5)));

        // Fence signals are empty submissions of their own, semaphores are consumed
        assert_eq!(native.submissions().len(), 2);
        context.flush().unwrap();
        assert!(native.submissions().last().unwrap().batch.wait_semaphores.is_empty());
    }

    #[test]
    fn test_command_buffer_returns_to_pool_after_fence() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("vertices", 64, BindFlags::VERTEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();
        native.hold_fences(true);
        context
            .update_buffer(&buffer, 0, &[1u8; 64], StateTransitionMode::Transition)
            .unwrap();
        context.flush().unwrap();
        assert_eq!(native.submissions()[0].batch.command_buffers.len(), 1);

        assert_eq!(context.command_pool().free_count(), 0);
        native.complete_all();
        device.purge_release_queue(0, false);
        assert_eq!(context.command_pool().free_count(), 1);
    }

    #[test]
    fn test_command_list_is_disposed_at_immediate_fence() {
        let (native, device) = test_device();
        let mut immediate = immediate_context(&native, &device);
        let mut deferred = DeviceContext::new_deferred(&device).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("instances", 64, BindFlags::VERTEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();

        deferred
            .update_buffer(&buffer, 0, &[3u8; 64], StateTransitionMode::Transition)
            .unwrap();
        let list = deferred.finish_command_list().unwrap().unwrap();
        let handle = list.handle();
        assert_eq!(deferred.num_commands(), 0);
        assert!(native.submissions().is_empty());

        native.hold_fences(true);
        immediate.execute_command_list(list).unwrap();

        let submissions = native.submissions();
        assert_eq!(submissions.last().unwrap().batch.command_buffers, vec![handle]);
        assert_eq!(deferred.submitted_queue_mask.load(Ordering::Acquire), 1);

        // Nothing comes back before the immediate context's fence completes
        assert_eq!(deferred.command_pool().free_count(), 0);
        native.complete_all();
        device.purge_release_queue(0, false);
        assert_eq!(deferred.command_pool().free_count(), 1);

        deferred.finish_frame();
        assert_eq!(deferred.submitted_queue_mask.load(Ordering::Acquire), 0);
        assert_eq!(deferred.upload_heap().page_count(), 0);
    }

    #[test]
    fn test_deferred_context_does_not_flush() {
        let (native, device) = test_device();
        let mut deferred = DeviceContext::new_deferred(&device).unwrap();
        deferred.set_stencil_ref(2).unwrap();
        deferred.flush().unwrap();
        assert!(native.submissions().is_empty());
        assert!(deferred.command_buffer().is_recording());
        deferred.finish_command_list().unwrap();
    }

    #[test]
    fn test_unexecuted_command_list_is_recycled() {
        let (_native, device) = test_device();
        let mut deferred = DeviceContext::new_deferred(&device).unwrap();
        deferred.set_stencil_ref(4).unwrap();
        let list = deferred.finish_command_list().unwrap().unwrap();
        drop(list);
        assert_eq!(deferred.command_pool().free_count(), 1);
    }

    #[test]
    fn test_query_commands() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let manager = Arc::clone(context.query_manager().unwrap());

        let mut occlusion = Query::new(&manager, QueryType::Occlusion);
        context.begin_query(&mut occlusion).unwrap();
        assert_eq!(context.active_query_count(), 1);

        // Only one query of a type may be active at a time
        let mut overlapping = Query::new(&manager, QueryType::Occlusion);
        context.begin_query(&mut overlapping).unwrap();
        assert_eq!(context.active_query_count(), 1);

        context.end_query(&mut occlusion).unwrap();
        assert_eq!(context.active_query_count(), 0);

        let mut duration = Query::new(&manager, QueryType::Duration);
        context.begin_query(&mut duration).unwrap();
        context.end_query(&mut duration).unwrap();

        let mut timestamp = Query::new(&manager, QueryType::Timestamp);
        context.begin_query(&mut timestamp).unwrap();
        context.end_query(&mut timestamp).unwrap();

        let commands = native.commands_for(context.command_buffer().handle());
        let begin = commands
            .iter()
            .find_map(|c| match c {
                Command::BeginQuery { flags, .. } => Some(*flags),
                _ => None,
            })
            .unwrap();
        assert_eq!(begin, vk::QueryControlFlags::PRECISE);
        assert_eq!(
            commands.iter().filter(|c| matches!(c, Command::EndQuery { .. })).count(),
            1
        );
        assert_eq!(
            commands.iter().filter(|c| matches!(c, Command::WriteTimestamp { .. })).count(),
            3
        );
        assert_eq!(
            duration.end_fence_value(),
            device.command_queue(0).next_fence_value()
        );
        context.flush().unwrap();
    }

    #[test]
    fn test_discarded_queries_are_reset_at_flush() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let manager = Arc::clone(context.query_manager().unwrap());

        let mut query = Query::new(&manager, QueryType::Timestamp);
        context.end_query(&mut query).unwrap();
        // Re-ending a timestamp discards the previous index
        context.end_query(&mut query).unwrap();
        native.clear_commands();

        context.flush().unwrap();
        assert_eq!(native.count_commands(|c| matches!(c, Command::ResetQueryPool { .. })), 1);
    }

    #[test]
    fn test_finish_frame_releases_upload_pages() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("indices", 64, BindFlags::INDEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();
        context
            .update_buffer(&buffer, 0, &[9u8; 64], StateTransitionMode::Transition)
            .unwrap();
        assert_eq!(context.upload_heap().page_count(), 1);

        native.hold_fences(true);
        context.finish_frame();
        assert_eq!(context.upload_heap().page_count(), 0);
        // Released pages wait for the next submission on the queue
        assert!(device.pending_release_count(0) > 0);

        context.flush().unwrap();
        native.complete_all();
        device.purge_release_queue(0, false);
        assert_eq!(device.pending_release_count(0), 0);
    }
}
