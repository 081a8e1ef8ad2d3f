//! Pooled allocation and serial-aware recycling of descriptor sets.
//!
//! Each bind set layout owns one allocator. Pools are sized so that a fixed
//! number of sets fits; every set of a pool is allocated up front and handed
//! out through a per-pool free list. Descriptor sets bound into command lists
//! cannot be reused until every queue that consumed them has caught up, so
//! deallocations are parked on per-queue serial queues first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::device::DeviceShared;
use crate::error::Error;
use crate::serial_queue::SerialQueue;
use crate::types::QueueType;

// Not a real GPU limit, but used to bound valid usage of the API: there should
// never be more bindings than the per-stage maxima, for each stage.
const MAX_SAMPLED_TEXTURES_PER_SHADER_STAGE: u32 = 16;
const MAX_SAMPLERS_PER_SHADER_STAGE: u32 = 16;
const MAX_STORAGE_BUFFERS_PER_SHADER_STAGE: u32 = 8;
const MAX_STORAGE_TEXTURES_PER_SHADER_STAGE: u32 = 8;
const MAX_UNIFORM_BUFFERS_PER_SHADER_STAGE: u32 = 12;
const NUM_STAGES: u32 = 3;

pub(crate) const MAX_BINDINGS_PER_PIPELINE_LAYOUT: u32 = NUM_STAGES
    * (MAX_SAMPLED_TEXTURES_PER_SHADER_STAGE
        + MAX_SAMPLERS_PER_SHADER_STAGE
        + MAX_STORAGE_BUFFERS_PER_SHADER_STAGE
        + MAX_STORAGE_TEXTURES_PER_SHADER_STAGE
        + MAX_UNIFORM_BUFFERS_PER_SHADER_STAGE);

const MAX_DESCRIPTORS_PER_POOL: u32 = 512;

/// Number of whole sets that fit in one pool for a layout with
/// `total_descriptor_count` descriptors per set.
pub(crate) fn sets_per_pool(total_descriptor_count: u32) -> u32 {
    assert!(total_descriptor_count > 0);
    assert!(total_descriptor_count <= MAX_BINDINGS_PER_PIPELINE_LAYOUT);
    MAX_DESCRIPTORS_PER_POOL / total_descriptor_count
}

/// One descriptor set handed out by the allocator, with enough information to
/// give it back.
#[derive(Debug)]
pub(crate) struct DescriptorSetAllocation {
    pub set: vk::DescriptorSet,
    pool_index: usize,
    set_index: u32,
}

struct DescriptorPool {
    raw: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    free_set_indices: Vec<u32>,
}

struct Deallocation {
    pool_index: usize,
    set_index: u32,
    ref_queue_count: AtomicU32,
}

struct PendingDeallocations {
    queue: SerialQueue<Arc<Deallocation>>,
    last_serial: u64,
}

impl Default for PendingDeallocations {
    fn default() -> Self {
        PendingDeallocations {
            queue: SerialQueue::new(),
            last_serial: 0,
        }
    }
}

struct AllocatorState {
    pools: Vec<DescriptorPool>,
    /// Indices of pools with at least one free set, used as a stack.
    available_pool_indices: Vec<usize>,
    /// Deallocations parked per queue (graphics, compute).
    pending: [PendingDeallocations; 2],
    /// Set once the pools were handed off for deferred destruction; late
    /// deallocations have nothing left to restore into.
    retired: bool,
}

pub(crate) struct DescriptorSetAllocator {
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    sets_per_pool: u32,
    /// Which queues ever consumed sets from this allocator (graphics,
    /// compute); pool retirement must wait on each of them.
    used_in_queues: [AtomicBool; 2],
    state: Mutex<AllocatorState>,
}

impl DescriptorSetAllocator {
    pub(crate) fn new(
        descriptor_count_per_type: HashMap<vk::DescriptorType, u32>,
    ) -> DescriptorSetAllocator {
        let mut total_descriptor_count = 0;
        let mut pool_sizes = Vec::with_capacity(descriptor_count_per_type.len());
        for (&ty, &count) in descriptor_count_per_type.iter() {
            assert!(count > 0);
            total_descriptor_count += count;
            pool_sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            });
        }

        let sets_per_pool = sets_per_pool(total_descriptor_count);
        assert!(sets_per_pool > 0);
        for pool_size in pool_sizes.iter_mut() {
            pool_size.descriptor_count *= sets_per_pool;
        }

        DescriptorSetAllocator {
            pool_sizes,
            sets_per_pool,
            used_in_queues: Default::default(),
            state: Mutex::new(AllocatorState {
                pools: Vec::new(),
                available_pool_indices: Vec::new(),
                pending: Default::default(),
                retired: false,
            }),
        }
    }

    /// Whether any set from this allocator was ever bound on `queue_type`.
    pub(crate) fn used_in_queue(&self, queue_type: QueueType) -> bool {
        debug_assert!(queue_type.index() < 2);
        self.used_in_queues[queue_type.index()].load(Ordering::Relaxed)
    }

    pub(crate) fn allocate(
        &self,
        device: &DeviceShared,
        layout: vk::DescriptorSetLayout,
    ) -> Result<DescriptorSetAllocation, Error> {
        let mut state = self.state.lock().unwrap();

        if state.available_pool_indices.is_empty() {
            self.allocate_pool(device, layout, &mut state)?;
        }

        let pool_index = *state.available_pool_indices.last().unwrap();
        let (set, set_index, pool_exhausted) = {
            let pool = &mut state.pools[pool_index];
            debug_assert!(!pool.free_set_indices.is_empty());
            let set_index = pool.free_set_indices.pop().unwrap();
            (
                pool.sets[set_index as usize],
                set_index,
                pool.free_set_indices.is_empty(),
            )
        };
        if pool_exhausted {
            state.available_pool_indices.pop();
        }

        Ok(DescriptorSetAllocation {
            set,
            pool_index,
            set_index,
        })
    }

    fn allocate_pool(
        &self,
        device: &DeviceShared,
        layout: vk::DescriptorSetLayout,
        state: &mut AllocatorState,
    ) -> Result<(), Error> {
        let create_info = vk::DescriptorPoolCreateInfo {
            max_sets: self.sets_per_pool,
            pool_size_count: self.pool_sizes.len() as u32,
            p_pool_sizes: self.pool_sizes.as_ptr(),
            ..Default::default()
        };
        let raw = unsafe { device.raw.create_descriptor_pool(&create_info, None)? };

        // Allocate every set of the pool once; they are recycled through the
        // free list afterwards.
        let layouts = vec![layout; self.sets_per_pool as usize];
        let allocate_info = vk::DescriptorSetAllocateInfo {
            descriptor_pool: raw,
            descriptor_set_count: self.sets_per_pool,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = match unsafe { device.raw.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => sets,
            Err(err) => {
                // No command references the pool yet, destroy it immediately.
                unsafe { device.raw.destroy_descriptor_pool(raw, None) };
                return Err(err.into());
            }
        };

        let free_set_indices = (0..self.sets_per_pool).rev().collect();
        state.available_pool_indices.push(state.pools.len());
        state.pools.push(DescriptorPool {
            raw,
            sets,
            free_set_indices,
        });
        Ok(())
    }

    /// Parks a deallocation until every queue the set was bound on has passed
    /// its current pending serial. A set never bound anywhere is restored to
    /// the free list immediately.
    pub(crate) fn deallocate(
        self: &Arc<Self>,
        device: &DeviceShared,
        allocation: DescriptorSetAllocation,
        used_in_graphics: bool,
        used_in_compute: bool,
    ) {
        debug_assert!(allocation.set != vk::DescriptorSet::null());

        if used_in_graphics {
            self.used_in_queues[QueueType::Graphics.index()].store(true, Ordering::Relaxed);
        }
        if used_in_compute {
            self.used_in_queues[QueueType::Compute.index()].store(true, Ordering::Relaxed);
        }

        // The Vulkan spec says the set may be consumed any time between host
        // execution of the bind and the end of the draw/dispatch, so it can't
        // be reused right away.
        let deallocation = Arc::new(Deallocation {
            pool_index: allocation.pool_index,
            set_index: allocation.set_index,
            ref_queue_count: AtomicU32::new(0),
        });

        // Queues to notify once the state lock is released.
        let mut enqueue_on: Vec<QueueType> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let mut park = |queue_type: QueueType, state: &mut AllocatorState| {
                let queue = match device.queue_shared(queue_type) {
                    Some(queue) => queue,
                    None => return,
                };
                deallocation.ref_queue_count.fetch_add(1, Ordering::Relaxed);
                let serial = queue.pending_submit_serial();
                let pending = &mut state.pending[queue_type.index()];
                pending.queue.push(serial, deallocation.clone());
                if pending.last_serial != serial {
                    pending.last_serial = serial;
                    enqueue_on.push(queue_type);
                }
            };

            if used_in_graphics {
                park(QueueType::Graphics, &mut state);
            }
            if used_in_compute {
                park(QueueType::Compute, &mut state);
            }

            if deallocation.ref_queue_count.load(Ordering::Relaxed) == 0 {
                restore_free_index(&mut state, deallocation.pool_index, deallocation.set_index);
            }
        }

        for queue_type in enqueue_on {
            if let Some(queue) = device.queue_shared(queue_type) {
                queue.enqueue_deferred_deallocation(self.clone());
            }
        }
    }

    /// Completes deallocations parked on `queue_type` up to `completed_serial`.
    pub(crate) fn finish_deallocation(&self, queue_type: QueueType, completed_serial: u64) {
        let mut state = self.state.lock().unwrap();
        let drained = state.pending[queue_type.index()]
            .queue
            .drain_up_to(completed_serial);
        for deallocation in drained {
            if deallocation.ref_queue_count.fetch_sub(1, Ordering::Relaxed) == 1 {
                restore_free_index(&mut state, deallocation.pool_index, deallocation.set_index);
            }
        }
    }

    /// Hands every pool to `f` for deferred destruction and empties the
    /// allocator. Called when the owning layout dies; deallocations that are
    /// still parked on queue serials find nothing left to restore.
    pub(crate) fn retire_pools(&self, mut f: impl FnMut(vk::DescriptorPool)) {
        let mut state = self.state.lock().unwrap();
        state.retired = true;
        state.available_pool_indices.clear();
        for pool in state.pools.drain(..) {
            f(pool.raw);
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_count(&self) -> usize {
        self.state.lock().unwrap().pools.len()
    }
}

fn restore_free_index(state: &mut AllocatorState, pool_index: usize, set_index: u32) {
    if state.retired {
        return;
    }
    let pool = &mut state.pools[pool_index];
    if pool.free_set_indices.is_empty() {
        state.available_pool_indices.push(pool_index);
    }
    pool.free_set_indices.push(set_index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_capacity_scales_with_layout_size() {
        assert_eq!(sets_per_pool(1), 512);
        assert_eq!(sets_per_pool(4), 128);
        assert_eq!(sets_per_pool(5), 102);
        assert_eq!(sets_per_pool(100), 5);
    }

    #[test]
    #[should_panic]
    fn zero_descriptor_layout_is_rejected() {
        sets_per_pool(0);
    }
}
