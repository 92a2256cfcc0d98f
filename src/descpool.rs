// Descriptor set allocation
//
// Layouts carry a summary of what a compatible pool must provide, and
// the auto pool groups its vulkan pools into categories scored against
// those requirements. Categories grow in fixed batches and die when
// their last set is freed.

#![allow(dead_code)]

use ash::vk;

use crate::{Result, SquallError};

/// Minimum compatibility for reusing an existing pool category.
const CATEGORY_MINIMUM_COMPATIBILITY: f64 = 0.75;
/// Sets per category; pool sizes are binding amounts times this.
const ALLOCATION_BATCH_SIZE: u32 = 256;
/// Descriptor type indices we track. Covers the core descriptor types.
const DESCRIPTOR_TYPE_COUNT: usize = 16;

/// What a descriptor pool must provide to serve a layout: a bitset of
/// descriptor types present and per-type binding counts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct DescriptorPoolRequirements {
    type_bits: u64,
    binding_amounts: [u32; DESCRIPTOR_TYPE_COUNT],
}

impl DescriptorPoolRequirements {
    pub fn from_bindings(bindings: &[vk::DescriptorSetLayoutBinding]) -> Self {
        let mut ret = Self::default();
        for b in bindings {
            let ty = b.descriptor_type.as_raw() as usize;
            debug_assert!(ty < DESCRIPTOR_TYPE_COUNT);
            ret.type_bits |= 1u64 << ty;
            ret.binding_amounts[ty] += b.descriptor_count.max(1);
        }
        ret
    }

    /// Compatibility of this requirement set against `other`, in
    /// [0, 1]. Zero when our types are not a subset of the other's,
    /// otherwise the average min/max ratio of the non-zero binding
    /// amounts scaled by the ratio of used type counts.
    pub fn compatibility_with(&self, other: &DescriptorPoolRequirements) -> f64 {
        if self.type_bits & other.type_bits != self.type_bits {
            return 0.0;
        }

        let mut compatibility = 0.0;
        let mut counted = 0u32;
        for i in 0..DESCRIPTOR_TYPE_COUNT {
            let a = self.binding_amounts[i];
            if a == 0 {
                continue;
            }
            let b = other.binding_amounts[i];
            debug_assert!(b != 0);
            compatibility += f64::from(a.min(b)) / f64::from(a.max(b));
            counted += 1;
        }
        if counted == 0 {
            return 0.0;
        }

        let mut ac = self.type_bits.count_ones();
        let mut bc = other.type_bits.count_ones();
        if ac > bc {
            std::mem::swap(&mut ac, &mut bc);
        }

        compatibility /= f64::from(counted);
        compatibility *= f64::from(ac) / f64::from(bc);
        debug_assert!((0.0..=1.0).contains(&compatibility));
        compatibility
    }

    fn pool_sizes(&self, batch: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes = Vec::new();
        for i in 0..DESCRIPTOR_TYPE_COUNT {
            let amount = self.binding_amounts[i];
            if amount != 0 {
                sizes.push(
                    vk::DescriptorPoolSize::builder()
                        .ty(vk::DescriptorType::from_raw(i as i32))
                        .descriptor_count(amount * batch)
                        .build(),
                );
            }
        }
        sizes
    }
}

/// A vulkan descriptor set layout together with its pool requirements.
pub(crate) struct DescriptorSetLayout {
    dsl_layout: vk::DescriptorSetLayout,
    dsl_requirements: DescriptorPoolRequirements,
}

impl DescriptorSetLayout {
    pub fn new(
        dev: &ash::Device,
        bindings: &[vk::DescriptorSetLayoutBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<Self> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(flags)
            .bindings(bindings);
        let layout = unsafe {
            dev.create_descriptor_set_layout(&info, None)
                .map_err(SquallError::from_vk)?
        };
        Ok(Self {
            dsl_layout: layout,
            dsl_requirements: DescriptorPoolRequirements::from_bindings(bindings),
        })
    }

    pub fn vk_layout(&self) -> vk::DescriptorSetLayout {
        self.dsl_layout
    }

    pub fn requirements(&self) -> &DescriptorPoolRequirements {
        &self.dsl_requirements
    }

    pub fn destroy(&self, dev: &ash::Device) {
        unsafe { dev.destroy_descriptor_set_layout(self.dsl_layout, None) };
    }
}

/// A descriptor set handed out by a `DescriptorAutoPool`. Freed by
/// handing it back to the same pool.
#[derive(Default)]
pub(crate) struct PoolDescriptorSet {
    pds_set: vk::DescriptorSet,
    pds_parent_pool: vk::DescriptorPool,
    pds_allocated: bool,
}

impl PoolDescriptorSet {
    pub fn set(&self) -> vk::DescriptorSet {
        self.pds_set
    }

    pub fn is_allocated(&self) -> bool {
        self.pds_allocated
    }
}

struct PoolCategory {
    pool: vk::DescriptorPool,
    requirements: DescriptorPoolRequirements,
    counter: u32,
    is_full: bool,
}

/// Categorized descriptor pool factory. Single threaded; every worker
/// thread owns one and the shared one on the device side sits behind a
/// mutex.
pub(crate) struct DescriptorAutoPool {
    dap_dev: ash::Device,
    dap_categories: Vec<PoolCategory>,
}

impl DescriptorAutoPool {
    pub fn new(dev: ash::Device) -> Self {
        Self {
            dap_dev: dev,
            dap_categories: Vec::new(),
        }
    }

    /// Allocate a descriptor set for `layout`.
    ///
    /// Non-full categories are tried from most to least compatible;
    /// out-of-pool failures mark a category full and move on. If no
    /// category serves, a new one sized from the layout requirements
    /// is created and tried once more.
    pub fn allocate_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayout,
    ) -> Result<PoolDescriptorSet> {
        let requirements = *layout.requirements();

        let mut candidates: Vec<(f64, usize)> = self
            .dap_categories
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_full)
            .filter_map(|(i, c)| {
                let score = requirements.compatibility_with(&c.requirements);
                if score >= CATEGORY_MINIMUM_COMPATIBILITY {
                    Some((score, i))
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

        for (_, index) in candidates {
            match self.try_allocate_from(index, layout.vk_layout()) {
                Ok(set) => return Ok(set),
                Err(full) if full => self.dap_categories[index].is_full = true,
                Err(_) => return Err(SquallError::DESCRIPTOR_ALLOC_FAILED),
            }
        }

        // No serving category, create a fresh one.
        let sizes = requirements.pool_sizes(ALLOCATION_BATCH_SIZE);
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(ALLOCATION_BATCH_SIZE)
            .pool_sizes(&sizes);
        let pool = unsafe {
            self.dap_dev
                .create_descriptor_pool(&info, None)
                .map_err(SquallError::from_vk)?
        };
        self.dap_categories.push(PoolCategory {
            pool,
            requirements,
            counter: 0,
            is_full: false,
        });

        let index = self.dap_categories.len() - 1;
        self.try_allocate_from(index, layout.vk_layout())
            .map_err(|_| SquallError::DESCRIPTOR_ALLOC_FAILED)
    }

    /// Err(true) means the pool reported itself out of space.
    fn try_allocate_from(
        &mut self,
        category_index: usize,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<PoolDescriptorSet, bool> {
        let category = &mut self.dap_categories[category_index];
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(category.pool)
            .set_layouts(&layouts)
            .build();

        match unsafe { self.dap_dev.allocate_descriptor_sets(&info) } {
            Ok(sets) => {
                category.counter += 1;
                Ok(PoolDescriptorSet {
                    pds_set: sets[0],
                    pds_parent_pool: category.pool,
                    pds_allocated: true,
                })
            }
            Err(vk::Result::ERROR_FRAGMENTED_POOL)
            | Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(true),
            Err(_) => Err(false),
        }
    }

    /// Return a set to its category. The category is un-marked full,
    /// and destroyed entirely once its live counter reaches zero.
    pub fn free_descriptor_set(&mut self, set: &mut PoolDescriptorSet) {
        if !set.pds_allocated {
            return;
        }
        set.pds_allocated = false;

        if let Some(pos) = self
            .dap_categories
            .iter()
            .position(|c| c.pool == set.pds_parent_pool)
        {
            unsafe {
                let _ = self
                    .dap_dev
                    .free_descriptor_sets(set.pds_parent_pool, &[set.pds_set]);
            }
            let category = &mut self.dap_categories[pos];
            category.counter -= 1;
            category.is_full = false;
            if category.counter == 0 {
                unsafe { self.dap_dev.destroy_descriptor_pool(category.pool, None) };
                self.dap_categories.remove(pos);
            }
        }
        set.pds_set = vk::DescriptorSet::null();
        set.pds_parent_pool = vk::DescriptorPool::null();
    }

    /// Explicit destructor.
    pub fn destroy(&mut self) {
        for c in self.dap_categories.drain(..) {
            unsafe { self.dap_dev.destroy_descriptor_pool(c.pool, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(ty: vk::DescriptorType, count: u32) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(ty)
            .descriptor_count(count)
            .build()
    }

    #[test]
    fn identical_requirements_score_one() {
        let reqs = DescriptorPoolRequirements::from_bindings(&[
            binding(vk::DescriptorType::STORAGE_BUFFER, 1),
            binding(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
        ]);
        assert!((reqs.compatibility_with(&reqs) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_type_scores_zero() {
        let a = DescriptorPoolRequirements::from_bindings(&[binding(
            vk::DescriptorType::STORAGE_BUFFER,
            1,
        )]);
        let b = DescriptorPoolRequirements::from_bindings(&[binding(
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
        )]);
        assert_eq!(a.compatibility_with(&b), 0.0);
    }

    #[test]
    fn subset_is_scaled_by_type_count_ratio() {
        let small = DescriptorPoolRequirements::from_bindings(&[binding(
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
        )]);
        let big = DescriptorPoolRequirements::from_bindings(&[
            binding(vk::DescriptorType::UNIFORM_BUFFER, 1),
            binding(vk::DescriptorType::SAMPLER, 1),
        ]);
        // One matching type at ratio 1.0, scaled by 1/2 used types.
        assert!((small.compatibility_with(&big) - 0.5).abs() < 1e-9);
        // The reverse direction is not a subset.
        assert_eq!(big.compatibility_with(&small), 0.0);
    }

    #[test]
    fn binding_amount_ratio_is_averaged() {
        let a = DescriptorPoolRequirements::from_bindings(&[binding(
            vk::DescriptorType::STORAGE_BUFFER,
            2,
        )]);
        let b = DescriptorPoolRequirements::from_bindings(&[binding(
            vk::DescriptorType::STORAGE_BUFFER,
            4,
        )]);
        assert!((a.compatibility_with(&b) - 0.5).abs() < 1e-9);
    }
}
