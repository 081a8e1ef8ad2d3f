//! Bind set layouts and bind sets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use once_cell::sync::OnceCell;

use crate::buffer::Buffer;
use crate::deleter::DescriptorPoolHandle;
use crate::descriptor::{DescriptorSetAllocation, DescriptorSetAllocator};
use crate::device::DeviceShared;
use crate::error::{validation_error, Error};
use crate::queue::CommandRecordContext;
use crate::sampler::Sampler;
use crate::texture::{image_layout, TextureView};
use crate::types::{BufferUsage, QueueType, ShaderStages, TextureUsage};

/// The kind of resource a binding slot accepts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BindingType {
    SampledTexture,
    StorageTexture,
    ReadOnlyStorageTexture,
    UniformBuffer,
    StorageBuffer,
    ReadOnlyStorageBuffer,
    Sampler,
    CombinedTextureSampler,
}

pub(crate) fn vk_descriptor_type(
    binding_type: BindingType,
    has_dynamic_offset: bool,
) -> vk::DescriptorType {
    match binding_type {
        BindingType::SampledTexture => vk::DescriptorType::SAMPLED_IMAGE,
        BindingType::StorageTexture | BindingType::ReadOnlyStorageTexture => {
            vk::DescriptorType::STORAGE_IMAGE
        }
        BindingType::UniformBuffer => {
            if has_dynamic_offset {
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            } else {
                vk::DescriptorType::UNIFORM_BUFFER
            }
        }
        BindingType::StorageBuffer | BindingType::ReadOnlyStorageBuffer => {
            if has_dynamic_offset {
                vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
            } else {
                vk::DescriptorType::STORAGE_BUFFER
            }
        }
        BindingType::Sampler => vk::DescriptorType::SAMPLER,
        BindingType::CombinedTextureSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

pub(crate) fn vk_shader_stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::TESSELLATION_CONTROL) {
        flags |= vk::ShaderStageFlags::TESSELLATION_CONTROL;
    }
    if stages.contains(ShaderStages::TESSELLATION_EVALUATION) {
        flags |= vk::ShaderStageFlags::TESSELLATION_EVALUATION;
    }
    if stages.contains(ShaderStages::GEOMETRY) {
        flags |= vk::ShaderStageFlags::GEOMETRY;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

/// One binding slot of a bind set layout.
#[derive(Copy, Clone, Debug)]
pub struct BindSetLayoutEntry {
    pub binding: u32,
    pub array_element_count: u32,
    pub visibility: ShaderStages,
    pub binding_type: BindingType,
    pub has_dynamic_offset: bool,
}

#[derive(Clone, Debug)]
pub struct BindSetLayoutDesc<'a> {
    pub label: &'a str,
    pub entries: &'a [BindSetLayoutEntry],
}

/// An ordered collection of binding slots, backing descriptor-set allocation
/// for every bind set created against it.
pub struct BindSetLayout {
    device: Arc<DeviceShared>,
    label: String,
    handle: vk::DescriptorSetLayout,
    entries: Vec<BindSetLayoutEntry>,
    allocator: OnceCell<Arc<DescriptorSetAllocator>>,
}

impl BindSetLayout {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &BindSetLayoutDesc,
    ) -> Result<Arc<BindSetLayout>, Error> {
        device.check_not_lost()?;

        // Deduplicate by binding number, keeping the first occurrence.
        let mut entries: Vec<BindSetLayoutEntry> = Vec::with_capacity(desc.entries.len());
        for entry in desc.entries {
            if entries.iter().any(|e| e.binding == entry.binding) {
                return Err(validation_error!(
                    "bind set layout `{}`: duplicate binding {}",
                    desc.label,
                    entry.binding
                ));
            }
            entries.push(*entry);
        }
        entries.sort_by_key(|e| e.binding);

        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|entry| vk::DescriptorSetLayoutBinding {
                binding: entry.binding,
                descriptor_type: vk_descriptor_type(entry.binding_type, entry.has_dynamic_offset),
                descriptor_count: entry.array_element_count.max(1),
                stage_flags: vk_shader_stage_flags(entry.visibility),
                ..Default::default()
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo {
            binding_count: vk_bindings.len() as u32,
            p_bindings: vk_bindings.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe { device.raw.create_descriptor_set_layout(&create_info, None)? };
        device.set_debug_name(
            vk::ObjectType::DESCRIPTOR_SET_LAYOUT,
            vk::Handle::as_raw(handle),
            desc.label,
        );

        Ok(Arc::new(BindSetLayout {
            device: device.clone(),
            label: desc.label.to_string(),
            handle,
            entries,
            allocator: OnceCell::new(),
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn entries(&self) -> &[BindSetLayoutEntry] {
        &self.entries
    }

    pub(crate) fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub(crate) fn entry_for_binding(&self, binding: u32) -> Option<&BindSetLayoutEntry> {
        self.entries.iter().find(|e| e.binding == binding)
    }

    /// Number of dynamic-offset bindings, in binding order.
    pub(crate) fn dynamic_offset_count(&self) -> usize {
        self.entries.iter().filter(|e| e.has_dynamic_offset).count()
    }

    /// The descriptor-set allocator for this layout, created on first need.
    pub(crate) fn descriptor_allocator(&self) -> &Arc<DescriptorSetAllocator> {
        self.allocator.get_or_init(|| {
            let mut descriptor_count_per_type = HashMap::new();
            for entry in &self.entries {
                let ty = vk_descriptor_type(entry.binding_type, entry.has_dynamic_offset);
                *descriptor_count_per_type.entry(ty).or_insert(0) +=
                    entry.array_element_count.max(1);
            }
            Arc::new(DescriptorSetAllocator::new(descriptor_count_per_type))
        })
    }
}

impl Drop for BindSetLayout {
    fn drop(&mut self) {
        // The layout handle is not referenced by in-flight work, but the
        // descriptor pools may be, by any queue that ever bound a set from
        // this layout. Refcount each pool across those queues; the last one
        // to pass its pending serial destroys it.
        if let Some(allocator) = self.allocator.get() {
            let mut pools = Vec::new();
            allocator.retire_pools(|pool| pools.push(pool));
            for pool in pools {
                let entry = Arc::new(DescriptorPoolHandle { handle: pool });
                let mut enqueued = false;
                for queue_type in [QueueType::Graphics, QueueType::Compute] {
                    if !allocator.used_in_queue(queue_type) {
                        continue;
                    }
                    if let Some(queue) = self.device.queue_shared(queue_type) {
                        queue
                            .deleter
                            .lock()
                            .unwrap()
                            .delete_shared_descriptor_pool_when_unused(
                                queue.pending_submit_serial(),
                                entry.clone(),
                            );
                        enqueued = true;
                    }
                }
                if !enqueued {
                    if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
                        queue
                            .deleter
                            .lock()
                            .unwrap()
                            .delete_shared_descriptor_pool_when_unused(
                                queue.pending_submit_serial(),
                                entry,
                            );
                    }
                }
            }
        }
        unsafe {
            self.device.raw.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

impl std::fmt::Debug for BindSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BindSetLayout")
            .field("label", &self.label)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A resource bound into one slot of a bind set.
#[derive(Clone, Debug)]
pub enum BindingResource {
    Buffer {
        buffer: Arc<Buffer>,
        offset: u64,
        /// Bound range in bytes; `vk::WHOLE_SIZE` binds to the end.
        size: u64,
    },
    TextureView(Arc<TextureView>),
    Sampler(Arc<Sampler>),
    CombinedTextureSampler {
        view: Arc<TextureView>,
        sampler: Arc<Sampler>,
    },
}

#[derive(Clone, Debug)]
pub struct BindSetEntry {
    pub binding: u32,
    pub array_element: u32,
    pub resource: BindingResource,
}

#[derive(Clone, Debug)]
pub struct BindSetDesc<'a> {
    pub label: &'a str,
    pub layout: &'a Arc<BindSetLayout>,
    pub entries: &'a [BindSetEntry],
}

/// A group of shader resources bound together as one descriptor set.
pub struct BindSet {
    device: Arc<DeviceShared>,
    label: String,
    layout: Arc<BindSetLayout>,
    entries: Vec<BindSetEntry>,
    set: vk::DescriptorSet,
    allocation: Mutex<Option<DescriptorSetAllocation>>,
    /// Which queues the set was bound on (graphics, compute); drives where
    /// the deallocation must wait.
    used_in_queues: [AtomicBool; 2],
}

impl BindSet {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &BindSetDesc,
    ) -> Result<Arc<BindSet>, Error> {
        device.check_not_lost()?;
        let layout = desc.layout;

        for entry in desc.entries {
            let layout_entry = layout.entry_for_binding(entry.binding).ok_or_else(|| {
                validation_error!(
                    "bind set `{}`: binding {} does not exist in the layout",
                    desc.label,
                    entry.binding
                )
            })?;
            let matches = matches!(
                (&entry.resource, layout_entry.binding_type),
                (
                    BindingResource::Buffer { .. },
                    BindingType::UniformBuffer
                        | BindingType::StorageBuffer
                        | BindingType::ReadOnlyStorageBuffer
                ) | (
                    BindingResource::TextureView(_),
                    BindingType::SampledTexture
                        | BindingType::StorageTexture
                        | BindingType::ReadOnlyStorageTexture
                ) | (BindingResource::Sampler(_), BindingType::Sampler)
                    | (
                        BindingResource::CombinedTextureSampler { .. },
                        BindingType::CombinedTextureSampler
                    )
            );
            if !matches {
                return Err(validation_error!(
                    "bind set `{}`: resource kind does not match binding {} ({:?})",
                    desc.label,
                    entry.binding,
                    layout_entry.binding_type
                ));
            }
        }

        let allocation = layout
            .descriptor_allocator()
            .allocate(device, layout.handle())?;
        let set = allocation.set;

        // Write every binding. The info vectors are sized up front so the
        // pointers stored in the writes stay valid.
        let count = desc.entries.len();
        let mut buffer_infos = vec![vk::DescriptorBufferInfo::default(); count];
        let mut image_infos = vec![vk::DescriptorImageInfo::default(); count];
        let mut writes = Vec::with_capacity(count);
        for (i, entry) in desc.entries.iter().enumerate() {
            let layout_entry = layout.entry_for_binding(entry.binding).unwrap();
            let mut write = vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: entry.binding,
                dst_array_element: entry.array_element,
                descriptor_count: 1,
                descriptor_type: vk_descriptor_type(
                    layout_entry.binding_type,
                    layout_entry.has_dynamic_offset,
                ),
                ..Default::default()
            };
            match &entry.resource {
                BindingResource::Buffer {
                    buffer,
                    offset,
                    size,
                } => {
                    buffer_infos[i] = vk::DescriptorBufferInfo {
                        buffer: buffer.handle(),
                        offset: *offset,
                        range: *size,
                    };
                    write.p_buffer_info = &buffer_infos[i];
                }
                BindingResource::TextureView(view) => {
                    let layout = match layout_entry.binding_type {
                        BindingType::SampledTexture => {
                            image_layout(TextureUsage::SAMPLED_BINDING, view.format())
                        }
                        _ => vk::ImageLayout::GENERAL,
                    };
                    image_infos[i] = vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view.handle(),
                        image_layout: layout,
                    };
                    write.p_image_info = &image_infos[i];
                }
                BindingResource::Sampler(sampler) => {
                    image_infos[i] = vk::DescriptorImageInfo {
                        sampler: sampler.handle(),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    };
                    write.p_image_info = &image_infos[i];
                }
                BindingResource::CombinedTextureSampler { view, sampler } => {
                    image_infos[i] = vk::DescriptorImageInfo {
                        sampler: sampler.handle(),
                        image_view: view.handle(),
                        image_layout: image_layout(TextureUsage::SAMPLED_BINDING, view.format()),
                    };
                    write.p_image_info = &image_infos[i];
                }
            }
            writes.push(write);
        }
        unsafe {
            device.raw.update_descriptor_sets(&writes, &[]);
        }

        Ok(Arc::new(BindSet {
            device: device.clone(),
            label: desc.label.to_string(),
            layout: layout.clone(),
            entries: desc.entries.to_vec(),
            set,
            allocation: Mutex::new(Some(allocation)),
            used_in_queues: Default::default(),
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn layout(&self) -> &Arc<BindSetLayout> {
        &self.layout
    }

    pub(crate) fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    pub(crate) fn mark_used_in_queue(&self, queue_type: QueueType) {
        debug_assert!(queue_type != QueueType::Transfer);
        self.used_in_queues[queue_type.index()].store(true, Ordering::Relaxed);
    }

    fn is_used_in_queue(&self, queue_type: QueueType) -> bool {
        self.used_in_queues[queue_type.index()].load(Ordering::Relaxed)
    }

    /// Transitions every bound resource into its binding usage on `queue`.
    pub(crate) fn track_resources(&self, queue: QueueType, ctx: &mut CommandRecordContext) {
        for entry in &self.entries {
            let layout_entry = self.layout.entry_for_binding(entry.binding).unwrap();
            let visibility = layout_entry.visibility;
            match (&entry.resource, layout_entry.binding_type) {
                (BindingResource::Buffer { buffer, .. }, binding_type) => {
                    let usage = match binding_type {
                        BindingType::UniformBuffer => BufferUsage::UNIFORM,
                        BindingType::StorageBuffer => BufferUsage::STORAGE,
                        BindingType::ReadOnlyStorageBuffer => BufferUsage::READ_ONLY_STORAGE,
                        _ => unreachable!(),
                    };
                    buffer.track_usage(queue, ctx, usage, visibility);
                }
                (BindingResource::TextureView(view), binding_type)
                | (BindingResource::CombinedTextureSampler { view, .. }, binding_type) => {
                    let usage = match binding_type {
                        BindingType::SampledTexture | BindingType::CombinedTextureSampler => {
                            TextureUsage::SAMPLED_BINDING
                        }
                        BindingType::StorageTexture => TextureUsage::STORAGE_BINDING,
                        BindingType::ReadOnlyStorageTexture => TextureUsage::READ_ONLY_STORAGE,
                        _ => unreachable!(),
                    };
                    view.texture().track_usage(
                        queue,
                        ctx,
                        usage,
                        visibility,
                        &view.subresource_range(),
                    );
                }
                (BindingResource::Sampler(_), _) => {}
            }
        }
    }

    pub fn destroy(&self) {
        if let Some(allocation) = self.allocation.lock().unwrap().take() {
            self.layout.descriptor_allocator().deallocate(
                &self.device,
                allocation,
                self.is_used_in_queue(QueueType::Graphics),
                self.is_used_in_queue(QueueType::Compute),
            );
        }
    }
}

impl Drop for BindSet {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for BindSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BindSet").field("label", &self.label).finish()
    }
}
