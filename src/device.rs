// The GPU context
//
// Selects a physical device, creates the logical device with the
// resolved queues, and holds the pieces every subsystem shares: the
// memory pool, the descriptor layouts, the shared descriptor auto
// pool, the pipeline cache and the default sampler.

use ash::extensions::khr;
use ash::vk;

use std::sync::Mutex;

use crate::descpool::{DescriptorAutoPool, DescriptorSetLayout};
use crate::instance::VulkanContext;
use crate::memory::{CompleteBuffer, DeviceMemoryPool};
use crate::pipeline::PipelineCache;
use crate::queue::{DeviceQueueResolver, ResolvedQueue};
use crate::sampler::SamplerData;
use crate::{Multisamples, Result, SquallError};

/// The descriptor set layouts every pipeline is built against.
pub(crate) struct DescriptorLayouts {
    /// Set 0, the per-window frame data uniform.
    pub frame_data: DescriptorSetLayout,
    /// Sets 1/2/3/6, storage buffer blocks from the mesh buffer.
    pub storage: DescriptorSetLayout,
    /// Set 4, a sampler plus its border color uniform.
    pub sampler: DescriptorSetLayout,
    /// Set 5, the sampled array texture.
    pub texture: DescriptorSetLayout,
    /// Blur input, pushed with the push descriptor extension.
    pub blur_texture: DescriptorSetLayout,
}

impl DescriptorLayouts {
    fn create(dev: &ash::Device) -> Result<Self> {
        let frame_data = DescriptorSetLayout::new(
            dev,
            &[vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .build()],
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?;
        let storage = DescriptorSetLayout::new(
            dev,
            &[vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build()],
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?;
        let sampler = DescriptorSetLayout::new(
            dev,
            &[
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build(),
            ],
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?;
        let texture = DescriptorSetLayout::new(
            dev,
            &[vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build()],
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )?;
        let blur_texture = DescriptorSetLayout::new(
            dev,
            &[vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build()],
            vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR,
        )?;

        Ok(Self {
            frame_data,
            storage,
            sampler,
            texture,
            blur_texture,
        })
    }

    fn destroy(&self, dev: &ash::Device) {
        self.frame_data.destroy(dev);
        self.storage.destroy(dev);
        self.sampler.destroy(dev);
        self.texture.destroy(dev);
        self.blur_texture.destroy(dev);
    }
}

/// The four queues the renderer runs on, in the priority order they
/// were requested with.
pub(crate) struct DeviceQueues {
    pub primary_render: ResolvedQueue,
    pub secondary_render: ResolvedQueue,
    pub primary_compute: ResolvedQueue,
    pub primary_transfer: ResolvedQueue,
}

/// Rank a physical device; bigger is better. Discrete GPUs beat
/// integrated ones, ties break on total device-local heap size.
pub(crate) fn score_physical_device(
    properties: &vk::PhysicalDeviceProperties,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> u64 {
    let type_weight: u64 = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        _ => 1,
    };

    let mut device_local: u64 = 0;
    for i in 0..memory_properties.memory_heap_count as usize {
        let heap = memory_properties.memory_heaps[i];
        if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            device_local += heap.size;
        }
    }

    // Heap sizes stay well under 2^40, so the type weight dominates.
    type_weight << 50 | device_local >> 10
}

/// Destroys the logical device strictly after every other field of
/// `Device` has dropped.
struct DeviceOwner(ash::Device);

impl Drop for DeviceOwner {
    fn drop(&mut self) {
        unsafe {
            let _ = self.0.device_wait_idle();
            self.0.destroy_device(None);
        }
    }
}

/// Everything resident on the chosen GPU. Shared by `Arc` between the
/// instance, windows, render targets and the loader threads.
pub(crate) struct Device {
    pub d_dev: ash::Device,
    pub d_pdev: vk::PhysicalDevice,
    pub d_properties: vk::PhysicalDeviceProperties,
    pub d_memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub d_features: vk::PhysicalDeviceFeatures,
    pub d_queues: DeviceQueues,
    pub d_memory_pool: DeviceMemoryPool,
    pub d_layouts: DescriptorLayouts,
    /// The shared auto pool. Worker threads own their private pools,
    /// anything on the device side goes through this one.
    pub d_descpool: Mutex<DescriptorAutoPool>,
    pub d_pipelines: PipelineCache,
    pub d_push_descriptor_loader: khr::PushDescriptor,
    d_default_sampler: vk::Sampler,
    d_default_sampler_data: Mutex<CompleteBuffer>,
    _d_owner: DeviceOwner,
    /// Keeps the vulkan instance alive until after the logical device
    /// is destroyed.
    _d_context: std::sync::Arc<VulkanContext>,
}

impl Device {
    /// Pick the best scoring physical device.
    pub fn select_physical_device(inst: &ash::Instance) -> Result<vk::PhysicalDevice> {
        let pdevs = unsafe {
            inst.enumerate_physical_devices()
                .map_err(SquallError::from_vk)?
        };

        let mut best: Option<(u64, vk::PhysicalDevice)> = None;
        for pdev in pdevs {
            let properties = unsafe { inst.get_physical_device_properties(pdev) };
            let memory_properties =
                unsafe { inst.get_physical_device_memory_properties(pdev) };
            let score = score_physical_device(&properties, &memory_properties);
            log::info!(
                "physical device {:?} scored {}",
                unsafe { std::ffi::CStr::from_ptr(properties.device_name.as_ptr()) },
                score
            );
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, pdev));
            }
        }
        best.map(|(_, p)| p).ok_or(SquallError::NO_SUITABLE_GPU)
    }

    pub fn new(context: std::sync::Arc<VulkanContext>, pdev: vk::PhysicalDevice) -> Result<Device> {
        // ash handles are cheap fn-pointer tables; clone so `context`
        // can move into the returned struct.
        let inst = context.instance().clone();
        let inst = &inst;
        let properties = unsafe { inst.get_physical_device_properties(pdev) };
        let memory_properties = unsafe { inst.get_physical_device_memory_properties(pdev) };
        let features = unsafe { inst.get_physical_device_features(pdev) };

        // Queue requests in interest order: primary render, secondary
        // render, primary compute, primary transfer.
        let requests = [
            (vk::QueueFlags::GRAPHICS, 1.0),
            (vk::QueueFlags::GRAPHICS, 0.2),
            (vk::QueueFlags::COMPUTE, 0.9),
            (vk::QueueFlags::TRANSFER, 0.5),
        ];
        let resolver = DeviceQueueResolver::new(inst, pdev, &requests)?;

        let extensions = [
            khr::Swapchain::name().as_ptr(),
            khr::PushDescriptor::name().as_ptr(),
        ];
        let enabled_features = vk::PhysicalDeviceFeatures::builder()
            .fill_mode_non_solid(features.fill_mode_non_solid != 0)
            .wide_lines(features.wide_lines != 0)
            .large_points(features.large_points != 0)
            .sampler_anisotropy(features.sampler_anisotropy != 0)
            .build();

        let queue_infos = resolver.device_queue_create_infos();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&enabled_features);

        let dev = unsafe {
            inst.create_device(pdev, &device_info, None)
                .map_err(SquallError::from_vk)?
        };
        let owner = DeviceOwner(dev.clone());

        let queues = resolver.get_queues(&dev);
        let queues = DeviceQueues {
            primary_render: queues[0].clone(),
            secondary_render: queues[1].clone(),
            primary_compute: queues[2].clone(),
            primary_transfer: queues[3].clone(),
        };

        let memory_pool = DeviceMemoryPool::new(inst, pdev, dev.clone());
        let layouts = DescriptorLayouts::create(&dev)?;
        let pipelines = PipelineCache::new(dev.clone(), &layouts)?;
        let push_descriptor_loader = khr::PushDescriptor::new(inst, &dev);

        // The default sampler: linear filtering, repeat addressing,
        // used whenever a draw does not name a sampler.
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let default_sampler = unsafe {
            dev.create_sampler(&sampler_info, None)
                .map_err(SquallError::from_vk)?
        };

        let default_sampler_data = memory_pool.create_complete_host_buffer_with_data(
            &[SamplerData::default()],
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;

        Ok(Device {
            d_dev: dev,
            d_pdev: pdev,
            d_properties: properties,
            d_memory_properties: memory_properties,
            d_features: features,
            d_queues: queues,
            d_memory_pool: memory_pool,
            d_layouts: layouts,
            d_descpool: Mutex::new(DescriptorAutoPool::new(owner.0.clone())),
            d_pipelines: pipelines,
            d_push_descriptor_loader: push_descriptor_loader,
            d_default_sampler: default_sampler,
            d_default_sampler_data: Mutex::new(default_sampler_data),
            _d_owner: owner,
            _d_context: context,
        })
    }

    pub fn default_sampler(&self) -> vk::Sampler {
        self.d_default_sampler
    }

    pub fn default_sampler_data_buffer(&self) -> vk::Buffer {
        self.d_default_sampler_data.lock().unwrap().buffer
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.d_properties.limits
    }

    /// The sample counts color framebuffers support on this device.
    pub fn supported_multisampling(&self) -> Multisamples {
        Multisamples::from_vk(self.d_properties.limits.framebuffer_color_sample_counts)
    }

    /// The largest single supported sample count.
    pub fn maximum_multisampling(&self) -> Multisamples {
        let supported = self.supported_multisampling();
        let mut best = Multisamples::S1;
        for s in [
            Multisamples::S64,
            Multisamples::S32,
            Multisamples::S16,
            Multisamples::S8,
            Multisamples::S4,
            Multisamples::S2,
        ]
        .iter()
        {
            if supported.contains(*s) {
                best = *s;
                break;
            }
        }
        best
    }

    pub fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family);
        unsafe {
            self.d_dev
                .create_command_pool(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe {
            self.d_dev
                .allocate_command_buffers(&info)
                .map_err(SquallError::from_vk)
        }
    }

    pub fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe {
            self.d_dev
                .create_fence(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe {
            self.d_dev
                .create_semaphore(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.d_dev.device_wait_idle();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.wait_idle();
        unsafe {
            self.d_dev.destroy_sampler(self.d_default_sampler, None);
        }
        self.d_memory_pool
            .free_complete_buffer(&mut self.d_default_sampler_data.lock().unwrap());
        self.d_descpool.lock().unwrap().destroy();
        self.d_pipelines.destroy();
        self.d_layouts.destroy(&self.d_dev);
        // The memory pool and finally the logical device itself fall
        // out of scope after this body.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(device_type: vk::PhysicalDeviceType) -> vk::PhysicalDeviceProperties {
        let mut p = vk::PhysicalDeviceProperties::default();
        p.device_type = device_type;
        p
    }

    fn mem(heap_size: u64) -> vk::PhysicalDeviceMemoryProperties {
        let mut m = vk::PhysicalDeviceMemoryProperties::default();
        m.memory_heap_count = 1;
        m.memory_heaps[0] = vk::MemoryHeap {
            size: heap_size,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        m
    }

    #[test]
    fn discrete_beats_integrated_regardless_of_memory() {
        let discrete = score_physical_device(
            &props(vk::PhysicalDeviceType::DISCRETE_GPU),
            &mem(1 << 30),
        );
        let integrated = score_physical_device(
            &props(vk::PhysicalDeviceType::INTEGRATED_GPU),
            &mem(1 << 36),
        );
        assert!(discrete > integrated);
    }

    #[test]
    fn same_type_ties_break_on_heap_size() {
        let small = score_physical_device(
            &props(vk::PhysicalDeviceType::DISCRETE_GPU),
            &mem(1 << 30),
        );
        let large = score_physical_device(
            &props(vk::PhysicalDeviceType::DISCRETE_GPU),
            &mem(1 << 33),
        );
        assert!(large > small);
    }
}
