// Texture resources
//
// An array texture loaded from image files (one per layer) or from
// raw pixel vectors. The load task runs on a loader thread: it
// uploads pixels to a staging buffer, records a transfer, per-mip
// blits and queue family ownership transfers, submits across the
// transfer and render queues and leaves a fence behind. The resource
// reports Loaded only once that fence is seen signaled, after which a
// cleanup task destroys the transient load state.

use ash::vk;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use crate::memory::{CompleteBuffer, CompleteImage};
use crate::mesh::Color8;
use crate::resource::{ManagerRef, Resource, ResourceCommon, ResourceStatus, ThreadLoaderResource};
use crate::window::Texture;

static TEXTURE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_texture_id() -> u64 {
    TEXTURE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Mip chain extents: halve until both axes reach one, clamping each
/// axis at one. The level count equals floor(log2(max(w, h))) + 1.
pub(crate) fn mip_chain(extent: vk::Extent2D) -> Vec<vk::Extent2D> {
    let mut levels = vec![extent];
    let mut last = extent;
    while last.width > 1 || last.height > 1 {
        last = vk::Extent2D {
            width: (last.width / 2).max(1),
            height: (last.height / 2).max(1),
        };
        levels.push(last);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_counts_match_log2() {
        // floor(log2(max(w, h))) + 1 levels, extents clamped at one.
        let chain = mip_chain(vk::Extent2D {
            width: 256,
            height: 256,
        });
        assert_eq!(chain.len(), 9);

        let chain = mip_chain(vk::Extent2D {
            width: 8,
            height: 2,
        });
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[2], vk::Extent2D { width: 2, height: 1 });
        assert_eq!(chain[3], vk::Extent2D { width: 1, height: 1 });

        let chain = mip_chain(vk::Extent2D {
            width: 1,
            height: 1,
        });
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn mip_chain_is_monotonically_shrinking() {
        let chain = mip_chain(vk::Extent2D {
            width: 500,
            height: 300,
        });
        for w in chain.windows(2) {
            assert!(w[1].width <= w[0].width);
            assert!(w[1].height <= w[0].height);
            assert!(w[1].width >= 1 && w[1].height >= 1);
        }
    }
}

enum TextureSource {
    Files(Vec<PathBuf>),
    Pixels {
        size: (u32, u32),
        layers: Vec<Vec<Color8>>,
    },
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadStage {
    Pending,
    /// GPU work submitted, waiting on the completion fence.
    Submitted,
    Complete,
    Failed,
}

struct TextureState {
    stage: LoadStage,
    extent: vk::Extent2D,
    layer_count: u32,
    mip_levels: u32,
    image: Option<CompleteImage>,
    staging: Option<CompleteBuffer>,
    transfer_cbuf: vk::CommandBuffer,
    secondary_render_cbuf: vk::CommandBuffer,
    primary_render_cbuf: vk::CommandBuffer,
    transfer_semaphore: vk::Semaphore,
    blit_semaphore: vk::Semaphore,
    complete_fence: vk::Fence,
    descriptor_set: crate::descpool::PoolDescriptorSet,
    cleanup_scheduled: bool,
}

impl Default for TextureState {
    fn default() -> Self {
        TextureState {
            stage: LoadStage::Pending,
            extent: vk::Extent2D::default(),
            layer_count: 0,
            mip_levels: 0,
            image: None,
            staging: None,
            transfer_cbuf: vk::CommandBuffer::null(),
            secondary_render_cbuf: vk::CommandBuffer::null(),
            primary_render_cbuf: vk::CommandBuffer::null(),
            transfer_semaphore: vk::Semaphore::null(),
            blit_semaphore: vk::Semaphore::null(),
            complete_fence: vk::Fence::null(),
            descriptor_set: Default::default(),
            cleanup_scheduled: false,
        }
    }
}

pub struct TextureResource {
    tr_common: ResourceCommon,
    tr_manager: ManagerRef,
    tr_id: u64,
    /// Weak self reference so the fence poll can hand the resource to
    /// a cleanup task.
    tr_self: Mutex<Weak<TextureResource>>,
    tr_source: Mutex<TextureSource>,
    tr_state: Mutex<TextureState>,
}

impl TextureResource {
    pub(crate) fn from_files(
        manager: ManagerRef,
        loader_thread: usize,
        paths: Vec<PathBuf>,
    ) -> Self {
        TextureResource {
            tr_common: ResourceCommon::new(loader_thread, false, paths.clone()),
            tr_manager: manager,
            tr_id: next_texture_id(),
            tr_self: Mutex::new(Weak::new()),
            tr_source: Mutex::new(TextureSource::Files(paths)),
            tr_state: Mutex::new(TextureState::default()),
        }
    }

    pub(crate) fn from_pixels(
        manager: ManagerRef,
        loader_thread: usize,
        size: (u32, u32),
        layers: Vec<Vec<Color8>>,
        is_subresource: bool,
    ) -> Self {
        TextureResource {
            tr_common: ResourceCommon::new(loader_thread, is_subresource, Vec::new()),
            tr_manager: manager,
            tr_id: next_texture_id(),
            tr_self: Mutex::new(Weak::new()),
            tr_source: Mutex::new(TextureSource::Pixels { size, layers }),
            tr_state: Mutex::new(TextureState::default()),
        }
    }

    pub(crate) fn set_self(&self, weak: Weak<TextureResource>) {
        *self.tr_self.lock().unwrap() = weak;
    }

    /// Extent of one array layer. Zero until loaded.
    pub fn size(&self) -> (u32, u32) {
        let state = self.tr_state.lock().unwrap();
        (state.extent.width, state.extent.height)
    }

    pub fn layer_count(&self) -> u32 {
        self.tr_state.lock().unwrap().layer_count
    }

    pub fn mip_level_count(&self) -> u32 {
        self.tr_state.lock().unwrap().mip_levels
    }

    /// Decode every source layer into RGBA8 pixels of one shared
    /// extent.
    fn gather_pixels(&self) -> Option<(vk::Extent2D, Vec<Vec<u8>>)> {
        let source = {
            let mut source = self.tr_source.lock().unwrap();
            std::mem::replace(&mut *source, TextureSource::Consumed)
        };

        match source {
            TextureSource::Files(paths) => {
                let mut extent = None;
                let mut layers = Vec::with_capacity(paths.len());
                for path in paths.iter() {
                    let decoded = match image::open(path) {
                        Ok(i) => i.to_rgba8(),
                        Err(e) => {
                            log::warn!("could not decode {:?}: {}", path, e);
                            return None;
                        }
                    };
                    let dims = decoded.dimensions();
                    match extent {
                        None => extent = Some(dims),
                        Some(existing) if existing != dims => {
                            log::warn!(
                                "texture layer {:?} extent {:?} does not match {:?}",
                                path,
                                dims,
                                existing
                            );
                            return None;
                        }
                        Some(_) => (),
                    }
                    layers.push(decoded.into_raw());
                }
                let (width, height) = extent?;
                Some((vk::Extent2D { width, height }, layers))
            }
            TextureSource::Pixels { size, layers } => {
                let expected = (size.0 * size.1) as usize;
                if layers.iter().any(|l| l.len() != expected) {
                    return None;
                }
                let raw = layers
                    .into_iter()
                    .map(|layer| {
                        let mut bytes = Vec::with_capacity(layer.len() * 4);
                        for texel in layer {
                            bytes.extend_from_slice(&[texel.r, texel.g, texel.b, texel.a]);
                        }
                        bytes
                    })
                    .collect();
                Some((
                    vk::Extent2D {
                        width: size.0,
                        height: size.1,
                    },
                    raw,
                ))
            }
            TextureSource::Consumed => None,
        }
    }

    fn full_range(mip_levels: u32, layer_count: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(mip_levels)
            .base_array_layer(0)
            .layer_count(layer_count)
            .build()
    }

    /// Write the same ownership transfer barrier into a releasing and
    /// an acquiring command buffer.
    fn record_family_transfer(
        dev: &ash::Device,
        release_cbuf: vk::CommandBuffer,
        acquire_cbuf: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        src_family: u32,
        dst_family: u32,
        range: vk::ImageSubresourceRange,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_WRITE | vk::AccessFlags::MEMORY_READ)
            .old_layout(layout)
            .new_layout(layout)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(image)
            .subresource_range(range)
            .build();
        for cbuf in [release_cbuf, acquire_cbuf].iter() {
            unsafe {
                dev.cmd_pipeline_barrier(
                    *cbuf,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        }
    }

    fn load_inner(&self, tlr: &mut ThreadLoaderResource) -> Option<()> {
        let dev = tlr.device().clone();
        let vk_dev = dev.d_dev.clone();

        let primary_render_family = dev.d_queues.primary_render.queue_family_index();
        let secondary_render_family = dev.d_queues.secondary_render.queue_family_index();
        let transfer_family = dev.d_queues.primary_transfer.queue_family_index();
        let primary_render_needed = secondary_render_family != primary_render_family;

        // 1. Pixels for every layer, one shared extent.
        let (extent, layers) = self.gather_pixels()?;
        let layer_count = layers.len() as u32;
        let layer_byte_size = (extent.width * extent.height * 4) as vk::DeviceSize;

        // 2. Staging buffer holding all layers back to back.
        let staging_info = vk::BufferCreateInfo::builder()
            .size(layer_byte_size * layer_count as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let mut staging = dev
            .d_memory_pool
            .create_complete_buffer(
                &staging_info,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                None,
            )
            .ok()?;
        for (i, layer) in layers.iter().enumerate() {
            if staging
                .memory
                .upload_at(
                    &vk_dev,
                    i as vk::DeviceSize * layer_byte_size,
                    layer.as_slice(),
                )
                .is_err()
            {
                dev.d_memory_pool.free_complete_buffer(&mut staging);
                return None;
            }
        }

        // 3. Mip chain and the device image.
        let mips = mip_chain(extent);
        let mip_levels = mips.len() as u32;

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build();
        let view_info = vk::ImageViewCreateInfo::builder()
            .view_type(vk::ImageViewType::TYPE_2D_ARRAY)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(Self::full_range(mip_levels, layer_count))
            .build();

        let image = match dev.d_memory_pool.create_complete_image(
            &image_info,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(view_info),
        ) {
            Ok(i) => i,
            Err(_) => {
                dev.d_memory_pool.free_complete_buffer(&mut staging);
                return None;
            }
        };

        {
            let mut state = self.tr_state.lock().unwrap();
            state.extent = extent;
            state.layer_count = layer_count;
            state.mip_levels = mip_levels;
            state.image = Some(image);
            state.staging = Some(staging);
        }

        // 4. Command buffers from the thread's pools; the primary
        // render one only when the two render families differ.
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .build();

        let transfer_cbuf = dev
            .allocate_command_buffers(tlr.primary_transfer_pool(), 1)
            .ok()?[0];
        let secondary_cbuf = dev
            .allocate_command_buffers(tlr.secondary_render_pool(), 1)
            .ok()?[0];
        let primary_cbuf = if primary_render_needed {
            dev.allocate_command_buffers(tlr.primary_render_pool(), 1)
                .ok()?[0]
        } else {
            vk::CommandBuffer::null()
        };
        {
            let mut state = self.tr_state.lock().unwrap();
            state.transfer_cbuf = transfer_cbuf;
            state.secondary_render_cbuf = secondary_cbuf;
            state.primary_render_cbuf = primary_cbuf;
        }

        unsafe {
            vk_dev.begin_command_buffer(transfer_cbuf, &begin_info).ok()?;
            vk_dev
                .begin_command_buffer(secondary_cbuf, &begin_info)
                .ok()?;
            if primary_render_needed {
                vk_dev.begin_command_buffer(primary_cbuf, &begin_info).ok()?;
            }
        }

        let (image_handle, staging_handle) = {
            let state = self.tr_state.lock().unwrap();
            (
                state.image.as_ref().unwrap().image,
                state.staging.as_ref().unwrap().buffer,
            )
        };
        let range = Self::full_range(mip_levels, layer_count);

        // 5. Transfer: undefined → TRANSFER_DST for all mips and
        // layers, then copy mip 0 of every layer from staging.
        unsafe {
            let to_transfer_dst = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image_handle)
                .subresource_range(range)
                .build();
            vk_dev.cmd_pipeline_barrier(
                transfer_cbuf,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer_dst],
            );

            let copies: Vec<vk::BufferImageCopy> = (0..layer_count)
                .map(|layer| {
                    vk::BufferImageCopy::builder()
                        .buffer_offset(layer as vk::DeviceSize * layer_byte_size)
                        .buffer_row_length(0)
                        .buffer_image_height(0)
                        .image_subresource(
                            vk::ImageSubresourceLayers::builder()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .mip_level(0)
                                .base_array_layer(layer)
                                .layer_count(1)
                                .build(),
                        )
                        .image_extent(vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        })
                        .build()
                })
                .collect();
            vk_dev.cmd_copy_buffer_to_image(
                transfer_cbuf,
                staging_handle,
                image_handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &copies,
            );
        }

        // Hand the image from the transfer family to the secondary
        // render family if they differ.
        if transfer_family != secondary_render_family {
            Self::record_family_transfer(
                &vk_dev,
                transfer_cbuf,
                secondary_cbuf,
                image_handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                transfer_family,
                secondary_render_family,
                range,
            );
        }

        // 6. Mip generation on the secondary render queue: blit each
        // level from the previous one, transitioning levels along.
        unsafe {
            for level in 1..mip_levels {
                let src_level = level - 1;
                let src_extent = mips[src_level as usize];
                let dst_extent = mips[level as usize];
                let src_range = vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(src_level)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(layer_count)
                    .build();

                let to_src = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                    .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image_handle)
                    .subresource_range(src_range)
                    .build();
                vk_dev.cmd_pipeline_barrier(
                    secondary_cbuf,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_src],
                );

                let blit = vk::ImageBlit::builder()
                    .src_subresource(
                        vk::ImageSubresourceLayers::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(src_level)
                            .base_array_layer(0)
                            .layer_count(layer_count)
                            .build(),
                    )
                    .src_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: src_extent.width as i32,
                            y: src_extent.height as i32,
                            z: 1,
                        },
                    ])
                    .dst_subresource(
                        vk::ImageSubresourceLayers::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(level)
                            .base_array_layer(0)
                            .layer_count(layer_count)
                            .build(),
                    )
                    .dst_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: dst_extent.width as i32,
                            y: dst_extent.height as i32,
                            z: 1,
                        },
                    ])
                    .build();
                vk_dev.cmd_blit_image(
                    secondary_cbuf,
                    image_handle,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image_handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );

                // 7. The source level is final now, make it readable
                // from shaders.
                let to_shader = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::MEMORY_READ)
                    .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                    .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image_handle)
                    .subresource_range(src_range)
                    .build();
                vk_dev.cmd_pipeline_barrier(
                    secondary_cbuf,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_shader],
                );
            }

            // The last level never became a blit source.
            let last_range = vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(mip_levels - 1)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(layer_count)
                .build();
            let last_to_shader = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image_handle)
                .subresource_range(last_range)
                .build();
            vk_dev.cmd_pipeline_barrier(
                secondary_cbuf,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[last_to_shader],
            );
        }

        // Final ownership transfer to the primary render family.
        if primary_render_needed {
            Self::record_family_transfer(
                &vk_dev,
                secondary_cbuf,
                primary_cbuf,
                image_handle,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                secondary_render_family,
                primary_render_family,
                range,
            );
        }

        // Synchronization primitives for the submission chain. They
        // go into the state right away so the failure path can tear
        // them down.
        let transfer_semaphore = dev.create_semaphore().ok()?;
        {
            self.tr_state.lock().unwrap().transfer_semaphore = transfer_semaphore;
        }
        let blit_semaphore = if primary_render_needed {
            let s = dev.create_semaphore().ok()?;
            self.tr_state.lock().unwrap().blit_semaphore = s;
            s
        } else {
            vk::Semaphore::null()
        };
        let complete_fence = dev.create_fence(false).ok()?;
        {
            self.tr_state.lock().unwrap().complete_fence = complete_fence;
        }

        // 8. End and submit: transfer → secondary render → optional
        // primary render, chained by semaphores, fence at the end.
        unsafe {
            vk_dev.end_command_buffer(transfer_cbuf).ok()?;
            vk_dev.end_command_buffer(secondary_cbuf).ok()?;
            if primary_render_needed {
                vk_dev.end_command_buffer(primary_cbuf).ok()?;
            }
        }

        {
            let cbufs = [transfer_cbuf];
            let signals = [transfer_semaphore];
            let submit = vk::SubmitInfo::builder()
                .command_buffers(&cbufs)
                .signal_semaphores(&signals)
                .build();
            dev.d_queues
                .primary_transfer
                .submit(&vk_dev, &[submit], vk::Fence::null())
                .ok()?;
        }
        {
            let cbufs = [secondary_cbuf];
            let waits = [transfer_semaphore];
            let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
            let signals = [blit_semaphore];
            let mut builder = vk::SubmitInfo::builder()
                .command_buffers(&cbufs)
                .wait_semaphores(&waits)
                .wait_dst_stage_mask(&stages);
            if primary_render_needed {
                builder = builder.signal_semaphores(&signals);
            }
            let fence = if primary_render_needed {
                vk::Fence::null()
            } else {
                complete_fence
            };
            dev.d_queues
                .secondary_render
                .submit(&vk_dev, &[builder.build()], fence)
                .ok()?;
        }
        if primary_render_needed {
            let cbufs = [primary_cbuf];
            let waits = [blit_semaphore];
            let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
            let submit = vk::SubmitInfo::builder()
                .command_buffers(&cbufs)
                .wait_semaphores(&waits)
                .wait_dst_stage_mask(&stages)
                .build();
            dev.d_queues
                .primary_render
                .submit(&vk_dev, &[submit], complete_fence)
                .ok()?;
        }

        // 9. The descriptor set shaders will sample through.
        let mut descriptor_set = tlr
            .descpool()
            .allocate_descriptor_set(&dev.d_layouts.texture)
            .ok()?;
        {
            let state = self.tr_state.lock().unwrap();
            let image_info = [vk::DescriptorImageInfo::builder()
                .image_view(state.image.as_ref().unwrap().view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build()];
            let writes = [vk::WriteDescriptorSet::builder()
                .dst_set(descriptor_set.set())
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_info)
                .build()];
            unsafe { vk_dev.update_descriptor_sets(&writes, &[]) };
        }

        {
            let mut state = self.tr_state.lock().unwrap();
            state.descriptor_set = std::mem::take(&mut descriptor_set);
            state.stage = LoadStage::Submitted;
        }
        Some(())
    }

    /// Free the transient load state: command buffers, semaphores,
    /// the fence and the staging buffer. Must run on the owning
    /// loader thread since the command pools live there.
    fn destroy_load_state(state: &mut TextureState, tlr: &mut ThreadLoaderResource) {
        let dev = tlr.device().clone();
        unsafe {
            if state.transfer_cbuf != vk::CommandBuffer::null() {
                dev.d_dev
                    .free_command_buffers(tlr.primary_transfer_pool(), &[state.transfer_cbuf]);
                state.transfer_cbuf = vk::CommandBuffer::null();
            }
            if state.secondary_render_cbuf != vk::CommandBuffer::null() {
                dev.d_dev.free_command_buffers(
                    tlr.secondary_render_pool(),
                    &[state.secondary_render_cbuf],
                );
                state.secondary_render_cbuf = vk::CommandBuffer::null();
            }
            if state.primary_render_cbuf != vk::CommandBuffer::null() {
                dev.d_dev
                    .free_command_buffers(tlr.primary_render_pool(), &[state.primary_render_cbuf]);
                state.primary_render_cbuf = vk::CommandBuffer::null();
            }
            if state.transfer_semaphore != vk::Semaphore::null() {
                dev.d_dev.destroy_semaphore(state.transfer_semaphore, None);
                state.transfer_semaphore = vk::Semaphore::null();
            }
            if state.blit_semaphore != vk::Semaphore::null() {
                dev.d_dev.destroy_semaphore(state.blit_semaphore, None);
                state.blit_semaphore = vk::Semaphore::null();
            }
            if state.complete_fence != vk::Fence::null() {
                dev.d_dev.destroy_fence(state.complete_fence, None);
                state.complete_fence = vk::Fence::null();
            }
        }
        if let Some(mut staging) = state.staging.take() {
            dev.d_memory_pool.free_complete_buffer(&mut staging);
        }
    }
}

impl Resource for TextureResource {
    fn common(&self) -> &ResourceCommon {
        &self.tr_common
    }

    fn status(&self) -> ResourceStatus {
        if !self.tr_common.load_fence().is_set() {
            return ResourceStatus::Undetermined;
        }
        if !self.tr_common.load_ok() {
            return ResourceStatus::FailedToLoad;
        }

        let mut state = self.tr_state.lock().unwrap();
        match state.stage {
            LoadStage::Complete => ResourceStatus::Loaded,
            LoadStage::Failed => ResourceStatus::FailedToLoad,
            LoadStage::Pending => ResourceStatus::Undetermined,
            LoadStage::Submitted => {
                let manager = match self.tr_manager.upgrade() {
                    Some(m) => m,
                    None => return ResourceStatus::Unavailable,
                };
                let dev = manager.device();
                match unsafe { dev.d_dev.get_fence_status(state.complete_fence) } {
                    Ok(true) => {
                        state.stage = LoadStage::Complete;
                        if !state.cleanup_scheduled {
                            state.cleanup_scheduled = true;
                            // The transient load state can go now; its
                            // command pools live on the loader thread.
                            if let Some(strong) = self.tr_self.lock().unwrap().upgrade() {
                                let loader = self.tr_common.loader_thread();
                                manager.schedule_cleanup(loader, move |tlr| {
                                    let mut state = strong.tr_state.lock().unwrap();
                                    TextureResource::destroy_load_state(&mut state, tlr);
                                });
                            }
                        }
                        ResourceStatus::Loaded
                    }
                    Ok(false) => ResourceStatus::Undetermined,
                    Err(_) => {
                        state.stage = LoadStage::Failed;
                        ResourceStatus::FailedToLoad
                    }
                }
            }
        }
    }

    fn mt_load(&self, tlr: &mut ThreadLoaderResource) -> bool {
        match self.load_inner(tlr) {
            Some(()) => true,
            None => {
                // Anything already submitted must settle before the
                // partial objects can be destroyed.
                tlr.device().wait_idle();
                let mut state = self.tr_state.lock().unwrap();
                state.stage = LoadStage::Failed;
                Self::destroy_load_state(&mut state, tlr);
                if let Some(mut image) = state.image.take() {
                    tlr.device().d_memory_pool.free_complete_image(&mut image);
                }
                false
            }
        }
    }

    fn mt_unload(&self, tlr: &mut ThreadLoaderResource) {
        let dev = tlr.device().clone();
        // Frames referencing this texture may still be in flight.
        dev.wait_idle();

        let mut state = self.tr_state.lock().unwrap();
        Self::destroy_load_state(&mut state, tlr);
        if state.descriptor_set.is_allocated() {
            let mut set = std::mem::take(&mut state.descriptor_set);
            tlr.descpool().free_descriptor_set(&mut set);
        }
        if let Some(mut image) = state.image.take() {
            dev.d_memory_pool.free_complete_image(&mut image);
        }
    }
}

impl Texture for TextureResource {
    fn texture_id(&self) -> u64 {
        self.tr_id
    }

    fn image_view(&self) -> vk::ImageView {
        self.tr_state
            .lock()
            .unwrap()
            .image
            .as_ref()
            .map(|i| i.view)
            .unwrap_or_else(vk::ImageView::null)
    }

    fn texture_layer_count(&self) -> u32 {
        self.layer_count()
    }

    fn is_available(&self) -> bool {
        self.status() == ResourceStatus::Loaded
    }

    fn as_render_target(&self) -> Option<&crate::render_target::RenderTargetTexture> {
        None
    }
}
