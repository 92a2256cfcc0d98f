// Render target textures
//
// An off-screen equivalent of a window: the same draw API records
// into an owned image that can later be sampled like any texture.
// Targets are swap buffered so the CPU can record frame k+1 while the
// GPU still renders frame k. Submission is deferred: a recorded frame
// is only handed to the GPU when a window (or another target) that
// samples it reaches its own end_render, which chains the semaphores.

use ash::vk;

use std::sync::{Arc, Mutex, Weak};

use crate::device::Device;
use crate::memory::{CompleteBuffer, CompleteImage};
use crate::mesh::{Mesh, MeshType, Vertex};
use crate::mesh_buffer::MeshBuffer;
use crate::pipeline::{
    push_constant_bytes, select_shader_program, GraphicsBlurPushConstants,
    GraphicsPipelineSettings, GraphicsPushConstants, ShaderProgramId,
    DESCRIPTOR_SET_SAMPLER, DESCRIPTOR_SET_TEXTURE, DESCRIPTOR_SET_TRANSFORMATION,
    DESCRIPTOR_SET_WINDOW_FRAME_DATA,
};
use crate::resource::texture::{next_texture_id, TextureResource};
use crate::sampler::Sampler;
use crate::window::{CoordinateSpace, Texture};
use crate::{Multisamples, Result, SquallError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurType {
    Box,
    Gaussian,
}

pub struct RenderTargetTextureCreateInfo {
    pub size: (u32, u32),
    pub coordinate_space: CoordinateSpace,
    pub samples: Multisamples,
    /// Creates the intermediate image and framebuffers the separable
    /// blur pass needs.
    pub enable_blur: bool,
    /// Backing images to cycle through; two allow CPU/GPU pipelining.
    pub swap_buffer_count: u32,
}

impl Default for RenderTargetTextureCreateInfo {
    fn default() -> Self {
        RenderTargetTextureCreateInfo {
            size: (512, 512),
            coordinate_space: CoordinateSpace::TexelSpaceCentered,
            samples: Multisamples::S1,
            enable_blur: false,
            swap_buffer_count: 2,
        }
    }
}

const RENDER_TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Idle,
    /// Commands recorded, submission deferred until someone samples
    /// this frame.
    Recorded,
    /// On the GPU; the render-done semaphore may still be unconsumed.
    Submitted,
}

struct SwapBuffer {
    color: CompleteImage,
    msaa: Option<CompleteImage>,
    blur_intermediate: Option<CompleteImage>,
    framebuffer: vk::Framebuffer,
    blur_framebuffer_a: vk::Framebuffer,
    blur_framebuffer_b: vk::Framebuffer,
    render_cbuf: vk::CommandBuffer,
    transfer_cbuf: vk::CommandBuffer,
    transfer_semaphore: vk::Semaphore,
    render_done_semaphore: vk::Semaphore,
    render_done_fence: vk::Fence,
    state: BufferState,
    /// Targets this buffer's frame samples.
    dependencies: Vec<Arc<RenderTargetTexture>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextRenderCall {
    Begin,
    End,
}

struct RtInner {
    buffers: Vec<SwapBuffer>,
    /// Buffer currently being recorded.
    current: usize,
    /// Buffer holding the most recently finished frame; sampling uses
    /// this one.
    sampled: usize,
    next_call: NextRenderCall,
    mesh_buffer: MeshBuffer,
    frame_data_buffer: CompleteBuffer,
    frame_data_descriptor: crate::descpool::PoolDescriptorSet,
    transformation_buffer: CompleteBuffer,
    transformation_descriptor: crate::descpool::PoolDescriptorSet,
    previous_pipeline: Option<GraphicsPipelineSettings>,
    previous_sampler: Option<u64>,
    previous_texture: Option<u64>,
    previous_line_width: f32,
    sampler_descriptors: std::collections::HashMap<u64, crate::descpool::PoolDescriptorSet>,
    texture_descriptors: std::collections::HashMap<u64, crate::descpool::PoolDescriptorSet>,
}

pub struct RenderTargetTexture {
    rt_dev: Arc<Device>,
    rt_id: u64,
    rt_self: Mutex<Weak<RenderTargetTexture>>,
    rt_extent: vk::Extent2D,
    rt_samples: vk::SampleCountFlags,
    rt_coordinate_space: CoordinateSpace,
    rt_blur_enabled: bool,
    rt_render_pass: vk::RenderPass,
    rt_blur_pass: vk::RenderPass,
    rt_command_pool: vk::CommandPool,
    rt_default_texture: Arc<TextureResource>,
    rt_inner: Mutex<RtInner>,
}

impl RenderTargetTexture {
    pub(crate) fn new(
        dev: Arc<Device>,
        default_texture: Arc<TextureResource>,
        info: &RenderTargetTextureCreateInfo,
    ) -> Result<RenderTargetTexture> {
        if info.size.0 == 0 || info.size.1 == 0 || info.swap_buffer_count == 0 {
            return Err(SquallError::INVALID_CREATE_INFO);
        }
        let mut samples = info.samples;
        if !dev.supported_multisampling().contains(samples) {
            log::warn!("render target multisample count unsupported, disabling");
            samples = Multisamples::S1;
        }
        let samples = samples.to_vk();
        let extent = vk::Extent2D {
            width: info.size.0,
            height: info.size.1,
        };

        let render_pass = Self::create_render_pass(&dev, samples)?;
        let blur_pass = Self::create_blur_pass(&dev)?;
        let command_pool = dev.create_command_pool(
            dev.d_queues.primary_render.queue_family_index(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        // Fixed per-target data shared by all swap buffers.
        let frame_data = info.coordinate_space.frame_data(extent);
        let frame_data_buffer = dev.d_memory_pool.create_complete_host_buffer_with_data(
            &[frame_data],
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;
        let identity: [[f32; 4]; 4] = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let transformation_buffer = dev.d_memory_pool.create_complete_host_buffer_with_data(
            &[identity],
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;

        let (frame_data_descriptor, transformation_descriptor) = {
            let mut pool = dev.d_descpool.lock().unwrap();
            let fd = pool.allocate_descriptor_set(&dev.d_layouts.frame_data)?;
            let td = pool.allocate_descriptor_set(&dev.d_layouts.storage)?;
            (fd, td)
        };
        {
            let fd_info = [vk::DescriptorBufferInfo::builder()
                .buffer(frame_data_buffer.buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE)
                .build()];
            let td_info = [vk::DescriptorBufferInfo::builder()
                .buffer(transformation_buffer.buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE)
                .build()];
            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(frame_data_descriptor.set())
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&fd_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(transformation_descriptor.set())
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&td_info)
                    .build(),
            ];
            unsafe { dev.d_dev.update_descriptor_sets(&writes, &[]) };
        }

        let mut buffers = Vec::with_capacity(info.swap_buffer_count as usize);
        for _ in 0..info.swap_buffer_count {
            buffers.push(Self::create_swap_buffer(
                &dev,
                extent,
                samples,
                info.enable_blur,
                render_pass,
                blur_pass,
                command_pool,
            )?);
        }

        Ok(RenderTargetTexture {
            rt_dev: dev.clone(),
            rt_id: next_texture_id(),
            rt_self: Mutex::new(Weak::new()),
            rt_extent: extent,
            rt_samples: samples,
            rt_coordinate_space: info.coordinate_space,
            rt_blur_enabled: info.enable_blur,
            rt_render_pass: render_pass,
            rt_blur_pass: blur_pass,
            rt_command_pool: command_pool,
            rt_default_texture: default_texture,
            rt_inner: Mutex::new(RtInner {
                // begin_render advances first, so recording starts on
                // buffer zero.
                current: buffers.len() - 1,
                buffers,
                sampled: 0,
                next_call: NextRenderCall::Begin,
                mesh_buffer: MeshBuffer::new(dev),
                frame_data_buffer,
                frame_data_descriptor,
                transformation_buffer,
                transformation_descriptor,
                previous_pipeline: None,
                previous_sampler: None,
                previous_texture: None,
                previous_line_width: 1.0,
                sampler_descriptors: std::collections::HashMap::new(),
                texture_descriptors: std::collections::HashMap::new(),
            }),
        })
    }

    pub(crate) fn set_self(&self, weak: Weak<RenderTargetTexture>) {
        *self.rt_self.lock().unwrap() = weak;
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<RenderTargetTexture>> {
        self.rt_self.lock().unwrap().upgrade()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.rt_extent.width, self.rt_extent.height)
    }

    fn create_render_pass(dev: &Device, samples: vk::SampleCountFlags) -> Result<vk::RenderPass> {
        let multisampled = samples != vk::SampleCountFlags::TYPE_1;
        let mut attachments = Vec::new();
        if multisampled {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(RENDER_TARGET_FORMAT)
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(RENDER_TARGET_FORMAT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(if multisampled {
                    vk::AttachmentLoadOp::DONT_CARE
                } else {
                    vk::AttachmentLoadOp::CLEAR
                })
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                // Sampled by whoever depends on this target.
                .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build(),
        );

        let (color_ref, resolve_ref);
        if multisampled {
            color_ref = [vk::AttachmentReference::builder()
                .attachment(0)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .build()];
            resolve_ref = [vk::AttachmentReference::builder()
                .attachment(1)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .build()];
        } else {
            color_ref = [vk::AttachmentReference::builder()
                .attachment(0)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .build()];
            resolve_ref = [vk::AttachmentReference::default()];
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref);
        if multisampled {
            subpass = subpass.resolve_attachments(&resolve_ref);
        }
        let subpasses = [subpass.build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses);
        unsafe {
            dev.d_dev
                .create_render_pass(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    /// Single sampled pass used for both separable blur directions,
    /// the attachment ends up sampleable.
    fn create_blur_pass(dev: &Device) -> Result<vk::RenderPass> {
        let attachments = [vk::AttachmentDescription::builder()
            .format(RENDER_TARGET_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .build()];
        let color_ref = [vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build()];
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref)
            .build()];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses);
        unsafe {
            dev.d_dev
                .create_render_pass(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    fn create_image(
        dev: &Device,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
    ) -> Result<CompleteImage> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(RENDER_TARGET_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build();
        let view_info = vk::ImageViewCreateInfo::builder()
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(RENDER_TARGET_FORMAT)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .build();
        dev.d_memory_pool.create_complete_image(
            &image_info,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(view_info),
        )
    }

    fn create_swap_buffer(
        dev: &Arc<Device>,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        enable_blur: bool,
        render_pass: vk::RenderPass,
        blur_pass: vk::RenderPass,
        command_pool: vk::CommandPool,
    ) -> Result<SwapBuffer> {
        let multisampled = samples != vk::SampleCountFlags::TYPE_1;

        let color = Self::create_image(
            dev,
            extent,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        )?;
        let msaa = if multisampled {
            Some(Self::create_image(
                dev,
                extent,
                samples,
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            )?)
        } else {
            None
        };
        let blur_intermediate = if enable_blur {
            Some(Self::create_image(
                dev,
                extent,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            )?)
        } else {
            None
        };

        let attachments: Vec<vk::ImageView> = match msaa.as_ref() {
            Some(m) => vec![m.view, color.view],
            None => vec![color.view],
        };
        let fb_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe {
            dev.d_dev
                .create_framebuffer(&fb_info, None)
                .map_err(SquallError::from_vk)?
        };

        let (blur_framebuffer_a, blur_framebuffer_b) = if let Some(intermediate) =
            blur_intermediate.as_ref()
        {
            let a_attachments = [intermediate.view];
            let a_info = vk::FramebufferCreateInfo::builder()
                .render_pass(blur_pass)
                .attachments(&a_attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let b_attachments = [color.view];
            let b_info = vk::FramebufferCreateInfo::builder()
                .render_pass(blur_pass)
                .attachments(&b_attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            unsafe {
                (
                    dev.d_dev
                        .create_framebuffer(&a_info, None)
                        .map_err(SquallError::from_vk)?,
                    dev.d_dev
                        .create_framebuffer(&b_info, None)
                        .map_err(SquallError::from_vk)?,
                )
            }
        } else {
            (vk::Framebuffer::null(), vk::Framebuffer::null())
        };

        let cbufs = dev.allocate_command_buffers(command_pool, 2)?;

        Ok(SwapBuffer {
            color,
            msaa,
            blur_intermediate,
            framebuffer,
            blur_framebuffer_a,
            blur_framebuffer_b,
            render_cbuf: cbufs[0],
            transfer_cbuf: cbufs[1],
            transfer_semaphore: dev.create_semaphore()?,
            render_done_semaphore: dev.create_semaphore()?,
            render_done_fence: dev.create_fence(false)?,
            state: BufferState::Idle,
            dependencies: Vec::new(),
        })
    }

    /// Begin recording a frame into the next swap buffer. Blocks on
    /// that buffer's fence when the GPU still owns it.
    pub fn begin_render(&self) -> Result<()> {
        let dev = self.rt_dev.clone();
        let mut inner = self.rt_inner.lock().unwrap();
        if inner.next_call != NextRenderCall::Begin {
            return Err(SquallError::ALREADY_RECORDING);
        }

        let next = (inner.current + 1) % inner.buffers.len();
        {
            let buffer = &mut inner.buffers[next];
            if buffer.state == BufferState::Submitted {
                unsafe {
                    dev.d_dev
                        .wait_for_fences(&[buffer.render_done_fence], true, u64::MAX)
                        .map_err(SquallError::from_vk)?;
                    dev.d_dev
                        .reset_fences(&[buffer.render_done_fence])
                        .map_err(SquallError::from_vk)?;
                }
            }
            buffer.state = BufferState::Idle;
            buffer.dependencies.clear();
        }
        inner.current = next;

        let extent = self.rt_extent;
        let cbuf = inner.buffers[next].render_cbuf;
        let framebuffer = inner.buffers[next].framebuffer;
        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.d_dev
                .begin_command_buffer(cbuf, &begin)
                .map_err(SquallError::from_vk)?;
            dev.d_dev.cmd_set_viewport(
                cbuf,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            dev.d_dev.cmd_set_scissor(
                cbuf,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );
            dev.d_dev.cmd_set_line_width(cbuf, 1.0);

            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 0.0],
                    },
                },
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 0.0],
                    },
                },
            ];
            let pass_begin = vk::RenderPassBeginInfo::builder()
                .render_pass(self.rt_render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);
            dev.d_dev
                .cmd_begin_render_pass(cbuf, &pass_begin, vk::SubpassContents::INLINE);

            let layout = dev.d_pipelines.primary_layout();
            dev.d_dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                DESCRIPTOR_SET_WINDOW_FRAME_DATA,
                &[inner.frame_data_descriptor.set()],
                &[],
            );
            dev.d_dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                DESCRIPTOR_SET_TRANSFORMATION,
                &[inner.transformation_descriptor.set()],
                &[],
            );
        }

        inner.previous_pipeline = None;
        inner.previous_sampler = None;
        inner.previous_texture = None;
        inner.previous_line_width = 1.0;
        inner.next_call = NextRenderCall::End;
        Ok(())
    }

    /// Draw into the current frame. Mirrors the window draw path.
    pub fn draw_mesh(
        &self,
        mesh: &Mesh,
        texture: Option<&dyn Texture>,
        sampler: Option<&Sampler>,
    ) -> Result<()> {
        self.draw_internal(
            mesh.mesh_type,
            &mesh.indices,
            &mesh.vertices,
            &mesh.texture_layer_weights,
            texture,
            sampler,
            mesh.line_width,
        )
    }

    pub fn draw_triangle_list(
        &self,
        filled: bool,
        indices: &[u32],
        vertices: &[Vertex],
        texture_layer_weights: &[f32],
        texture: Option<&dyn Texture>,
        sampler: Option<&Sampler>,
    ) -> Result<()> {
        let mesh_type = if filled {
            MeshType::TriangleFilled
        } else {
            MeshType::TriangleWireframe
        };
        self.draw_internal(
            mesh_type,
            indices,
            vertices,
            texture_layer_weights,
            texture,
            sampler,
            1.0,
        )
    }

    fn draw_internal(
        &self,
        mesh_type: MeshType,
        indices: &[u32],
        vertices: &[Vertex],
        weights: &[f32],
        texture: Option<&dyn Texture>,
        sampler: Option<&Sampler>,
        line_width: f32,
    ) -> Result<()> {
        use ash::vk::Handle;

        let dev = self.rt_dev.clone();

        // Resolve the texture before taking our own lock: a target
        // may sample itself (its previously finished frame), and
        // image_view() of a render target takes that target's lock.
        // Unusable textures fall back to the default.
        let texture_binding = match texture {
            Some(t) if t.is_available() => {
                let view = t.image_view();
                let dep = t.as_render_target().and_then(|rt| rt.self_arc());
                (view.as_raw(), view, dep)
            }
            _ => {
                let view = self.rt_default_texture.image_view();
                (view.as_raw(), view, None)
            }
        };

        let mut inner = self.rt_inner.lock().unwrap();
        if inner.next_call != NextRenderCall::End {
            return Err(SquallError::NOT_RECORDING);
        }
        if vertices.is_empty() {
            return Ok(());
        }
        let inner = &mut *inner;

        let cbuf = inner.buffers[inner.current].render_cbuf;
        let layout = dev.d_pipelines.primary_layout();

        let (topology, polygon_mode, vpp) = match mesh_type {
            MeshType::TriangleFilled => {
                (vk::PrimitiveTopology::TRIANGLE_LIST, vk::PolygonMode::FILL, 3)
            }
            MeshType::TriangleWireframe => {
                (vk::PrimitiveTopology::TRIANGLE_LIST, vk::PolygonMode::LINE, 3)
            }
            MeshType::Line => (vk::PrimitiveTopology::LINE_LIST, vk::PolygonMode::FILL, 2),
            MeshType::Point => (vk::PrimitiveTopology::POINT_LIST, vk::PolygonMode::FILL, 1),
        };
        let multitextured = !weights.is_empty();
        let uv_border = sampler.map(|s| s.uses_border_color()).unwrap_or(false);
        let settings = GraphicsPipelineSettings {
            pipeline_layout: layout,
            render_pass: self.rt_render_pass,
            primitive_topology: topology,
            polygon_mode,
            shader_program: select_shader_program(multitextured, uv_border, vpp),
            samples: self.rt_samples,
            enable_blending: true,
        };

        if inner.previous_pipeline != Some(settings) {
            let pipeline = dev.d_pipelines.get_graphics_pipeline(&settings)?;
            unsafe {
                dev.d_dev
                    .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
            }
            inner.previous_pipeline = Some(settings);
        }

        let sampler_key = sampler.map(|s| s.id()).unwrap_or(0);
        if inner.previous_sampler != Some(sampler_key) {
            let set = Self::sampler_descriptor(
                &dev,
                &mut inner.sampler_descriptors,
                sampler,
            )?;
            unsafe {
                dev.d_dev.cmd_bind_descriptor_sets(
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    DESCRIPTOR_SET_SAMPLER,
                    &[set],
                    &[],
                );
            }
            inner.previous_sampler = Some(sampler_key);
        }

        let (key, view, dep) = texture_binding;
        // Keyed by the image view so a render target's swap buffers
        // each get their own cached set.
        if inner.previous_texture != Some(key) {
            let set =
                Self::texture_descriptor(&dev, &mut inner.texture_descriptors, key, view)?;
            unsafe {
                dev.d_dev.cmd_bind_descriptor_sets(
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    DESCRIPTOR_SET_TEXTURE,
                    &[set],
                    &[],
                );
            }
            inner.previous_texture = Some(key);
        }
        // Sampling another render target chains its frame before
        // ours. Sampling our own previous frame needs no chain, the
        // swap buffer fence already orders it.
        if let Some(strong) = dep {
            if strong.rt_id != self.rt_id {
                let deps = &mut inner.buffers[inner.current].dependencies;
                if !deps.iter().any(|d| d.rt_id == strong.rt_id) {
                    deps.push(strong);
                }
            }
        }

        if mesh_type == MeshType::Line && line_width != inner.previous_line_width {
            unsafe { dev.d_dev.cmd_set_line_width(cbuf, line_width) };
            inner.previous_line_width = line_width;
        }

        let location = inner
            .mesh_buffer
            .cmd_push_mesh(cbuf, indices, vertices, weights)?;
        let constants = GraphicsPushConstants {
            transformation_offset: 0,
            index_offset: location.index_offset,
            index_count: location.index_count,
            vertex_offset: location.vertex_offset,
            texture_layer_weight_offset: location.texture_layer_weight_offset,
            texture_layer_weight_count: (weights.len() / vertices.len()) as u32,
        };
        unsafe {
            dev.d_dev.cmd_push_constants(
                cbuf,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                push_constant_bytes(&constants),
            );
            if mesh_type == MeshType::Point {
                dev.d_dev
                    .cmd_draw(cbuf, location.vertex_count, 1, location.vertex_offset, 0);
            } else {
                dev.d_dev.cmd_draw_indexed(
                    cbuf,
                    location.index_count,
                    1,
                    location.index_offset,
                    location.vertex_offset as i32,
                    0,
                );
            }
        }
        Ok(())
    }

    fn sampler_descriptor(
        dev: &Arc<Device>,
        cache: &mut std::collections::HashMap<u64, crate::descpool::PoolDescriptorSet>,
        sampler: Option<&Sampler>,
    ) -> Result<vk::DescriptorSet> {
        let key = sampler.map(|s| s.id()).unwrap_or(0);
        if let Some(set) = cache.get(&key) {
            return Ok(set.set());
        }
        let mut set = dev
            .d_descpool
            .lock()
            .unwrap()
            .allocate_descriptor_set(&dev.d_layouts.sampler)?;
        let (vk_sampler, data_buffer) = match sampler {
            Some(s) => (s.vk_sampler(), s.data_buffer()),
            None => (dev.default_sampler(), dev.default_sampler_data_buffer()),
        };
        let sampler_info = [vk::DescriptorImageInfo::builder().sampler(vk_sampler).build()];
        let buffer_info = [vk::DescriptorBufferInfo::builder()
            .buffer(data_buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build()];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set.set())
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&sampler_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set.set())
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build(),
        ];
        unsafe { dev.d_dev.update_descriptor_sets(&writes, &[]) };
        let handle = set.set();
        cache.insert(key, std::mem::take(&mut set));
        Ok(handle)
    }

    fn texture_descriptor(
        dev: &Arc<Device>,
        cache: &mut std::collections::HashMap<u64, crate::descpool::PoolDescriptorSet>,
        key: u64,
        view: vk::ImageView,
    ) -> Result<vk::DescriptorSet> {
        if let Some(set) = cache.get(&key) {
            return Ok(set.set());
        }
        let mut set = dev
            .d_descpool
            .lock()
            .unwrap()
            .allocate_descriptor_set(&dev.d_layouts.texture)?;
        let image_info = [vk::DescriptorImageInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(set.set())
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info)
            .build()];
        unsafe { dev.d_dev.update_descriptor_sets(&writes, &[]) };
        let handle = set.set();
        cache.insert(key, std::mem::take(&mut set));
        Ok(handle)
    }

    /// Record one fullscreen blur pass.
    fn record_blur_pass(
        &self,
        cbuf: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        source_view: vk::ImageView,
        program: ShaderProgramId,
        constants: &GraphicsBlurPushConstants,
    ) -> Result<()> {
        let dev = &self.rt_dev;
        let layout = dev.d_pipelines.blur_layout();

        let settings = GraphicsPipelineSettings {
            pipeline_layout: layout,
            render_pass: self.rt_blur_pass,
            primitive_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            shader_program: program,
            samples: vk::SampleCountFlags::TYPE_1,
            enable_blending: false,
        };
        let pipeline = dev.d_pipelines.get_graphics_pipeline(&settings)?;

        unsafe {
            let pass_begin = vk::RenderPassBeginInfo::builder()
                .render_pass(self.rt_blur_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.rt_extent,
                });
            dev.d_dev
                .cmd_begin_render_pass(cbuf, &pass_begin, vk::SubpassContents::INLINE);
            dev.d_dev
                .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);

            // The source image rides in on a push descriptor, no pool
            // allocation needed for a transient binding like this.
            let image_info = [vk::DescriptorImageInfo::builder()
                .sampler(dev.default_sampler())
                .image_view(source_view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build()];
            let writes = [vk::WriteDescriptorSet::builder()
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info)
                .build()];
            dev.d_push_descriptor_loader.cmd_push_descriptor_set(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &writes,
            );

            dev.d_dev.cmd_push_constants(
                cbuf,
                layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                push_constant_bytes(constants),
            );
            dev.d_dev.cmd_draw(cbuf, 3, 1, 0, 0);
            dev.d_dev.cmd_end_render_pass(cbuf);
        }
        Ok(())
    }

    /// Finish recording the frame. With `blur` set, a horizontal and
    /// a vertical blur pass run over the result before it becomes
    /// sampleable. Submission is deferred to `commit_render`.
    pub fn end_render(&self, blur: Option<(BlurType, f32)>) -> Result<()> {
        let dev = self.rt_dev.clone();
        let mut inner = self.rt_inner.lock().unwrap();
        if inner.next_call != NextRenderCall::End {
            return Err(SquallError::NOT_RECORDING);
        }
        inner.next_call = NextRenderCall::Begin;
        let inner = &mut *inner;

        let current = inner.current;
        let cbuf = inner.buffers[current].render_cbuf;
        unsafe {
            dev.d_dev.cmd_end_render_pass(cbuf);
        }

        if let Some((blur_type, sigma)) = blur {
            if !self.rt_blur_enabled {
                return Err(SquallError::INVALID);
            }
            let sigma = sigma.max(0.01);
            let coefficient = 1.0 / ((2.0 * std::f32::consts::PI).sqrt() * sigma);
            let exponentiation = (-0.5 / (sigma * sigma)).exp();
            let constants = GraphicsBlurPushConstants {
                blur_info: [sigma, 1.0, coefficient, exponentiation],
                pixel_size: [
                    1.0 / self.rt_extent.width as f32,
                    1.0 / self.rt_extent.height as f32,
                ],
            };
            let (horizontal, vertical) = match blur_type {
                BlurType::Box => (
                    ShaderProgramId::RenderTargetBoxBlurHorizontal,
                    ShaderProgramId::RenderTargetBoxBlurVertical,
                ),
                BlurType::Gaussian => (
                    ShaderProgramId::RenderTargetGaussianBlurHorizontal,
                    ShaderProgramId::RenderTargetGaussianBlurVertical,
                ),
            };

            let buffer = &inner.buffers[current];
            let intermediate_view = buffer
                .blur_intermediate
                .as_ref()
                .map(|i| i.view)
                .ok_or(SquallError::INVALID)?;
            let color_view = buffer.color.view;
            let fb_a = buffer.blur_framebuffer_a;
            let fb_b = buffer.blur_framebuffer_b;

            self.record_blur_pass(cbuf, fb_a, color_view, horizontal, &constants)?;
            self.record_blur_pass(cbuf, fb_b, intermediate_view, vertical, &constants)?;
        }

        unsafe {
            dev.d_dev
                .end_command_buffer(cbuf)
                .map_err(SquallError::from_vk)?;
        }

        // The previous frame shares this target's mesh buffer; its
        // staging reads must be done before we overwrite them below.
        let previous = (current + inner.buffers.len() - 1) % inner.buffers.len();
        if previous != current && inner.buffers[previous].state == BufferState::Submitted {
            unsafe {
                dev.d_dev
                    .wait_for_fences(&[inner.buffers[previous].render_done_fence], true, u64::MAX)
                    .map_err(SquallError::from_vk)?;
                dev.d_dev
                    .reset_fences(&[inner.buffers[previous].render_done_fence])
                    .map_err(SquallError::from_vk)?;
            }
            inner.buffers[previous].state = BufferState::Idle;
        }

        // Mesh data goes into the transfer command buffer, submitted
        // ahead of the render at commit time.
        let transfer_cbuf = inner.buffers[current].transfer_cbuf;
        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.d_dev
                .begin_command_buffer(transfer_cbuf, &begin)
                .map_err(SquallError::from_vk)?;
        }
        inner.mesh_buffer.cmd_upload_to_gpu(transfer_cbuf)?;
        unsafe {
            dev.d_dev
                .end_command_buffer(transfer_cbuf)
                .map_err(SquallError::from_vk)?;
        }

        inner.buffers[current].state = BufferState::Recorded;
        inner.sampled = current;
        Ok(())
    }

    /// Submit the sampled buffer's recorded frame if it has not been
    /// submitted yet, committing its own dependencies first. Returns
    /// the semaphore the caller must wait on, or None when the
    /// content is already on the GPU.
    ///
    /// `visiting` carries the chain of targets currently being
    /// committed; finding ourselves in it means the dependency graph
    /// has a cycle.
    pub(crate) fn commit_render(&self, visiting: &mut Vec<u64>) -> Result<Option<vk::Semaphore>> {
        if visiting.contains(&self.rt_id) {
            log::error!("render target textures depend on each other in a cycle");
            return Err(SquallError::RENDER_TARGET_CYCLE);
        }
        visiting.push(self.rt_id);

        let result = self.commit_render_inner(visiting);
        visiting.pop();
        result
    }

    fn commit_render_inner(&self, visiting: &mut Vec<u64>) -> Result<Option<vk::Semaphore>> {
        let dev = self.rt_dev.clone();

        // Collect this frame's own dependencies before locking so
        // nested commits do not deadlock on our mutex.
        let (sampled, dependencies) = {
            let inner = self.rt_inner.lock().unwrap();
            let sampled = inner.sampled;
            if inner.buffers[sampled].state != BufferState::Recorded {
                return Ok(None);
            }
            (sampled, inner.buffers[sampled].dependencies.clone())
        };

        let mut wait_semaphores = Vec::new();
        let mut wait_stages = Vec::new();
        for dep in dependencies.iter() {
            if let Some(semaphore) = dep.commit_render(visiting)? {
                wait_semaphores.push(semaphore);
                wait_stages.push(vk::PipelineStageFlags::FRAGMENT_SHADER);
            }
        }

        let mut inner = self.rt_inner.lock().unwrap();
        let buffer = &mut inner.buffers[sampled];
        if buffer.state != BufferState::Recorded {
            return Ok(None);
        }

        let transfer_cbufs = [buffer.transfer_cbuf];
        let transfer_signals = [buffer.transfer_semaphore];
        let render_cbufs = [buffer.render_cbuf];
        let render_signals = [buffer.render_done_semaphore];

        wait_semaphores.insert(0, buffer.transfer_semaphore);
        wait_stages.insert(
            0,
            vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::VERTEX_SHADER,
        );

        let submits = [
            vk::SubmitInfo::builder()
                .command_buffers(&transfer_cbufs)
                .signal_semaphores(&transfer_signals)
                .build(),
            vk::SubmitInfo::builder()
                .command_buffers(&render_cbufs)
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .signal_semaphores(&render_signals)
                .build(),
        ];
        dev.d_queues
            .primary_render
            .submit(&dev.d_dev, &submits, buffer.render_done_fence)?;

        buffer.state = BufferState::Submitted;
        Ok(Some(buffer.render_done_semaphore))
    }
}

impl Texture for RenderTargetTexture {
    fn texture_id(&self) -> u64 {
        self.rt_id
    }

    fn image_view(&self) -> vk::ImageView {
        let inner = self.rt_inner.lock().unwrap();
        inner.buffers[inner.sampled].color.view
    }

    fn texture_layer_count(&self) -> u32 {
        1
    }

    fn is_available(&self) -> bool {
        true
    }

    fn as_render_target(&self) -> Option<&RenderTargetTexture> {
        Some(self)
    }
}

impl Drop for RenderTargetTexture {
    fn drop(&mut self) {
        let dev = self.rt_dev.clone();
        dev.wait_idle();

        let mut inner = self.rt_inner.lock().unwrap();
        inner.mesh_buffer.destroy();

        {
            let mut pool = dev.d_descpool.lock().unwrap();
            for (_, mut set) in inner.sampler_descriptors.drain() {
                pool.free_descriptor_set(&mut set);
            }
            for (_, mut set) in inner.texture_descriptors.drain() {
                pool.free_descriptor_set(&mut set);
            }
            pool.free_descriptor_set(&mut inner.frame_data_descriptor);
            pool.free_descriptor_set(&mut inner.transformation_descriptor);
        }
        dev.d_memory_pool
            .free_complete_buffer(&mut inner.frame_data_buffer);
        dev.d_memory_pool
            .free_complete_buffer(&mut inner.transformation_buffer);

        unsafe {
            for buffer in inner.buffers.iter_mut() {
                dev.d_dev.destroy_framebuffer(buffer.framebuffer, None);
                if buffer.blur_framebuffer_a != vk::Framebuffer::null() {
                    dev.d_dev.destroy_framebuffer(buffer.blur_framebuffer_a, None);
                    dev.d_dev.destroy_framebuffer(buffer.blur_framebuffer_b, None);
                }
                dev.d_dev.destroy_semaphore(buffer.transfer_semaphore, None);
                dev.d_dev
                    .destroy_semaphore(buffer.render_done_semaphore, None);
                dev.d_dev.destroy_fence(buffer.render_done_fence, None);
                dev.d_memory_pool.free_complete_image(&mut buffer.color);
                if let Some(mut m) = buffer.msaa.take() {
                    dev.d_memory_pool.free_complete_image(&mut m);
                }
                if let Some(mut b) = buffer.blur_intermediate.take() {
                    dev.d_memory_pool.free_complete_image(&mut b);
                }
            }
            dev.d_dev.destroy_command_pool(self.rt_command_pool, None);
            dev.d_dev.destroy_render_pass(self.rt_render_pass, None);
            dev.d_dev.destroy_render_pass(self.rt_blur_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_create_info_is_double_buffered() {
        let info = RenderTargetTextureCreateInfo::default();
        assert_eq!(info.swap_buffer_count, 2);
        assert_eq!(info.samples, Multisamples::S1);
    }
}
