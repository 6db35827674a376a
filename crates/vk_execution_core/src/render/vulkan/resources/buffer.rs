//! Buffers
//!
//! A [`BufferVk`] either owns a native buffer bound to dedicated memory or, for
//! dynamic buffers that are never written by shaders, has no backing object at
//! all. Such buffers live in the dynamic heap of whichever context mapped them
//! last, so each context keeps its own allocation.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use parking_lot::Mutex;

use super::{Barrierable, BindFlags, CpuAccess, Mappable, ResourceStateCell, Stateful, Usage};
use crate::foundation::logging::{debug, error};
use crate::render::vulkan::commands::CommandBuffer;
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::{VulkanError, VulkanResult};
use crate::render::vulkan::memory::DynamicAllocation;
use crate::render::vulkan::native::{NativeDevice, NativeObject};
use crate::render::vulkan::state::{buffer_needs_barrier, resource_state_to_access_flags, ResourceState};

/// Buffer creation parameters
#[derive(Debug, Clone, Default)]
pub struct BufferDesc {
    /// Debug name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Allowed bindings
    pub bind_flags: BindFlags,
    /// Update frequency
    pub usage: Usage,
    /// CPU access of staging buffers
    pub cpu_access: CpuAccess,
}

impl BufferDesc {
    /// Describe a buffer with no CPU access
    pub fn new(name: impl Into<String>, size: u64, bind_flags: BindFlags, usage: Usage) -> Self {
        let cpu_access = if usage == Usage::Dynamic {
            CpuAccess::WRITE
        } else {
            CpuAccess::empty()
        };
        Self {
            name: name.into(),
            size,
            bind_flags,
            usage,
            cpu_access,
        }
    }
}

fn vk_usage_flags(bind_flags: BindFlags) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
        usage |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if bind_flags.contains(BindFlags::SHADER_RESOURCE) {
        usage |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if bind_flags.contains(BindFlags::VERTEX_BUFFER) {
        usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if bind_flags.contains(BindFlags::INDEX_BUFFER) {
        usage |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if bind_flags.contains(BindFlags::INDIRECT_DRAW_ARGS) {
        usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if bind_flags.contains(BindFlags::UNIFORM_BUFFER) {
        usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    usage
}

/// GPU buffer
pub struct BufferVk {
    device: Arc<RenderDevice>,
    desc: BufferDesc,
    id: u64,
    state: ResourceStateCell,
    native: Option<(vk::Buffer, vk::DeviceMemory)>,
    dynamic_alignment: u64,
    dynamic_allocations: Mutex<HashMap<u64, DynamicAllocation>>,
}

impl BufferVk {
    /// Create a buffer, optionally filled with `initial_data`.
    ///
    /// Device-local buffers are filled through a staging buffer copied on a
    /// transient command buffer of queue 0.
    pub fn new(device: &Arc<RenderDevice>, desc: BufferDesc, initial_data: Option<&[u8]>) -> VulkanResult<Arc<Self>> {
        let initial_data = initial_data.filter(|data| !data.is_empty());
        if desc.size == 0 {
            return Err(VulkanError::invalid_operation(format!("buffer '{}' has zero size", desc.name)));
        }
        if initial_data.map_or(false, |data| data.len() as u64 > desc.size) {
            return Err(VulkanError::invalid_operation(format!(
                "initial data does not fit into buffer '{}'",
                desc.name
            )));
        }
        match desc.usage {
            Usage::Immutable if initial_data.is_none() => {
                return Err(VulkanError::invalid_operation(format!(
                    "immutable buffer '{}' must be initialized at creation",
                    desc.name
                )));
            }
            Usage::Dynamic if initial_data.is_some() => {
                return Err(VulkanError::invalid_operation(format!(
                    "dynamic buffer '{}' cannot be initialized at creation",
                    desc.name
                )));
            }
            Usage::Staging if !desc.bind_flags.is_empty() => {
                return Err(VulkanError::invalid_operation(format!(
                    "staging buffer '{}' cannot have bind flags",
                    desc.name
                )));
            }
            _ => {}
        }

        let limits = *device.limits();
        let usage_flags = vk_usage_flags(desc.bind_flags);

        // Transfer offsets must be multiples of 4
        let mut dynamic_alignment = limits.optimal_buffer_copy_offset_alignment.max(4);
        if desc
            .bind_flags
            .intersects(BindFlags::UNORDERED_ACCESS | BindFlags::SHADER_RESOURCE)
        {
            dynamic_alignment = dynamic_alignment
                .max(limits.min_texel_buffer_offset_alignment)
                .max(limits.min_storage_buffer_offset_alignment);
        }
        if desc.bind_flags.contains(BindFlags::UNIFORM_BUFFER) {
            dynamic_alignment = dynamic_alignment.max(limits.min_uniform_buffer_offset_alignment);
        }

        let suballocated = desc.usage == Usage::Dynamic
            && !usage_flags
                .intersects(vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER);

        let (native, state) = if suballocated {
            let state = ResourceState::VERTEX_BUFFER
                | ResourceState::INDEX_BUFFER
                | ResourceState::CONSTANT_BUFFER
                | ResourceState::SHADER_RESOURCE
                | ResourceState::COPY_SOURCE
                | ResourceState::INDIRECT_ARGUMENT;
            (None, state)
        } else {
            let (buffer, memory, state) = Self::create_backing(device, &desc, usage_flags, initial_data)?;
            (Some((buffer, memory)), state)
        };

        debug!(
            "Created buffer '{}' ({} bytes, {:?}{})",
            desc.name,
            desc.size,
            desc.usage,
            if suballocated { ", suballocated" } else { "" }
        );

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            id: device.allocate_resource_id(),
            desc,
            state: ResourceStateCell::new(state),
            native,
            dynamic_alignment,
            dynamic_allocations: Mutex::new(HashMap::new()),
        }))
    }

    fn create_backing(
        device: &Arc<RenderDevice>,
        desc: &BufferDesc,
        usage_flags: vk::BufferUsageFlags,
        initial_data: Option<&[u8]>,
    ) -> VulkanResult<(vk::Buffer, vk::DeviceMemory, ResourceState)> {
        let native = device.native();
        let memory_properties = match desc.usage {
            Usage::Staging => {
                let mut properties = vk::MemoryPropertyFlags::HOST_VISIBLE;
                if desc.cpu_access.contains(CpuAccess::READ) {
                    properties |= vk::MemoryPropertyFlags::HOST_CACHED;
                }
                if desc.cpu_access.contains(CpuAccess::WRITE) {
                    properties |= vk::MemoryPropertyFlags::HOST_COHERENT;
                }
                properties
            }
            Usage::Immutable | Usage::Default | Usage::Dynamic => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };

        let (buffer, memory) = native.create_buffer(desc.size, usage_flags, memory_properties)?;
        let Some(data) = initial_data else {
            return Ok((buffer, memory, ResourceState::UNDEFINED));
        };

        let initialized = if memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            native.write_memory(memory, 0, data).map(|()| ResourceState::UNDEFINED)
        } else {
            Self::upload_through_staging(device, desc, buffer, data)
        };

        match initialized {
            Ok(state) => Ok((buffer, memory, state)),
            Err(err) => {
                native.destroy(NativeObject::Buffer { buffer, memory });
                Err(err)
            }
        }
    }

    fn upload_through_staging(
        device: &Arc<RenderDevice>,
        desc: &BufferDesc,
        buffer: vk::Buffer,
        data: &[u8],
    ) -> VulkanResult<ResourceState> {
        let native = device.native();
        let (staging, staging_memory) = native.create_buffer(
            desc.size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let staging_object = NativeObject::Buffer {
            buffer: staging,
            memory: staging_memory,
        };

        if let Err(err) = native.write_memory(staging_memory, 0, data) {
            native.destroy(staging_object);
            return Err(err);
        }

        let size = desc.size;
        let copy_state = ResourceState::COPY_DEST;
        let submitted = device.execute_transient(0, |command_buffer| {
            command_buffer.buffer_memory_barrier(staging, vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_READ);
            command_buffer.buffer_memory_barrier(
                buffer,
                vk::AccessFlags::empty(),
                resource_state_to_access_flags(copy_state),
            );
            command_buffer.copy_buffer(
                staging,
                buffer,
                vec![vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            );
        });

        // Released after the next command buffer submitted to queue 0 completes
        device.safe_release_native_object(staging_object, 1);
        submitted.map(|_| copy_state)
    }

    /// Creation parameters
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Device-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Allowed bindings
    pub fn bind_flags(&self) -> BindFlags {
        self.desc.bind_flags
    }

    /// Whether the buffer lives in the dynamic heap with no backing object
    pub fn is_suballocated(&self) -> bool {
        self.native.is_none()
    }

    /// Alignment of dynamic allocations made for this buffer
    pub fn dynamic_alignment(&self) -> u64 {
        self.dynamic_alignment
    }

    /// Native buffer to bind. Suballocated buffers resolve to the device-wide dynamic buffer.
    pub fn vk_buffer(&self) -> vk::Buffer {
        match self.native {
            Some((buffer, _)) => buffer,
            None => self.device.dynamic_memory_manager().buffer(),
        }
    }

    /// Memory bound to the backing buffer
    pub fn vk_memory(&self) -> Option<vk::DeviceMemory> {
        self.native.map(|(_, memory)| memory)
    }

    /// Offset to add to every access made by context `context_id`
    pub fn dynamic_offset(&self, context_id: u64) -> u64 {
        if self.native.is_some() {
            return 0;
        }
        match self.dynamic_allocations.lock().get(&context_id) {
            Some(allocation) => allocation.offset,
            None => {
                error!(
                    "Dynamic buffer '{}' has not been mapped before its first use in context {}",
                    self.desc.name, context_id
                );
                0
            }
        }
    }

    /// Last dynamic allocation made for context `context_id`
    pub fn dynamic_allocation(&self, context_id: u64) -> Option<DynamicAllocation> {
        self.dynamic_allocations.lock().get(&context_id).copied()
    }

    /// Remember the dynamic allocation of context `context_id`
    pub fn set_dynamic_allocation(&self, context_id: u64, allocation: DynamicAllocation) {
        self.dynamic_allocations.lock().insert(context_id, allocation);
    }
}

impl Stateful for BufferVk {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn state(&self) -> ResourceState {
        self.state.get()
    }

    fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    fn check_state(&self, state: ResourceState) -> bool {
        self.state().contains(state)
    }
}

impl Barrierable for BufferVk {
    fn needs_barrier(&self, old: ResourceState, new: ResourceState) -> bool {
        buffer_needs_barrier(old, new)
    }

    fn record_barrier(
        &self,
        command_buffer: &mut CommandBuffer,
        old: ResourceState,
        new: ResourceState,
        _range: Option<vk::ImageSubresourceRange>,
    ) {
        let Some((buffer, _)) = self.native else {
            error!("Cannot transition suballocated buffer '{}'", self.desc.name);
            return;
        };
        command_buffer.buffer_memory_barrier(
            buffer,
            resource_state_to_access_flags(old),
            resource_state_to_access_flags(new),
        );
    }
}

impl Mappable for BufferVk {
    fn usage(&self) -> Usage {
        self.desc.usage
    }

    fn cpu_access(&self) -> CpuAccess {
        self.desc.cpu_access
    }
}

impl Drop for BufferVk {
    fn drop(&mut self) {
        if let Some((buffer, memory)) = self.native.take() {
            self.device
                .safe_release_native_object(NativeObject::Buffer { buffer, memory }, self.device.command_queue_mask());
        }
    }
}

/// CPU view of mapped memory.
///
/// Valid until the end of the frame it was mapped in.
pub struct MappedRange {
    device: Arc<dyn NativeDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    offset: u64,
    size: u64,
}

impl MappedRange {
    pub(crate) fn new(
        device: Arc<dyn NativeDevice>,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Self {
        Self {
            device,
            buffer,
            memory,
            offset,
            size,
        }
    }

    /// Buffer the range lives in
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Offset of the range within [`Self::buffer`]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_bounds(&self, offset: u64, len: usize) -> VulkanResult<()> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(VulkanError::invalid_operation(format!(
                "access of {len} bytes at offset {offset} exceeds the {} byte mapped range",
                self.size
            )));
        }
        Ok(())
    }

    /// Copy `data` to `offset` bytes into the range
    pub fn write(&self, offset: u64, data: &[u8]) -> VulkanResult<()> {
        self.check_bounds(offset, data.len())?;
        self.device.write_memory(self.memory, self.offset + offset, data)
    }

    /// Copy plain-old-data values to `offset` bytes into the range
    pub fn write_pod<T: Pod>(&self, offset: u64, values: &[T]) -> VulkanResult<()> {
        self.write(offset, bytemuck::cast_slice(values))
    }

    /// Copy `offset` bytes into the range out to `data`
    pub fn read(&self, offset: u64, data: &mut [u8]) -> VulkanResult<()> {
        self.check_bounds(offset, data.len())?;
        self.device.read_memory(self.memory, self.offset + offset, data)
    }
}
