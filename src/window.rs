// Window and per-frame pipeline
//
// Each window owns its surface, swapchain, render pass, per-image
// command buffers and synchronization, a mesh buffer, and the cached
// sampler/texture descriptor sets. Draw calls record into the command
// buffer of the acquired swapchain image; end_render uploads the mesh
// buffer, chains the transfer and render submissions and presents.
//
// Synchronizing the previous frame is deferred until the next
// end_render so the CPU can record while the GPU draws.

use ash::extensions::khr;
use ash::vk;

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::device::Device;
use crate::memory::{CompleteBuffer, CompleteImage};
use crate::mesh::{Mesh, MeshType, Vertex};
use crate::mesh_buffer::MeshBuffer;
use crate::pipeline::{
    push_constant_bytes, select_shader_program, GraphicsPipelineSettings, GraphicsPushConstants,
    WindowFrameData, DESCRIPTOR_SET_SAMPLER, DESCRIPTOR_SET_TEXTURE,
    DESCRIPTOR_SET_TRANSFORMATION, DESCRIPTOR_SET_WINDOW_FRAME_DATA,
};
use crate::platform::{EventRegistry, WindowSystem};
use crate::render_target::RenderTargetTexture;
use crate::resource::texture::TextureResource;
use crate::sampler::Sampler;
use crate::{Multisamples, Result, SquallError};

/// Cached descriptor sets older than this are evicted at frame end.
const DESCRIPTOR_CACHE_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(10);

/// Anything a draw call can sample: loaded texture resources and
/// render target textures.
pub trait Texture {
    fn texture_id(&self) -> u64;
    fn image_view(&self) -> vk::ImageView;
    fn texture_layer_count(&self) -> u32;
    fn is_available(&self) -> bool;
    /// The render target behind this texture, when there is one, so
    /// frames can track cross-target dependencies.
    fn as_render_target(&self) -> Option<&RenderTargetTexture>;
}

/// How vertex positions map to window pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSpace {
    /// Origin top left, one unit per texel.
    TexelSpace,
    /// Origin at the window center, one unit per texel.
    TexelSpaceCentered,
    /// Origin top left, window spans 0..1 on both axes.
    NormalizedSpace,
    /// Origin centered, the shorter axis spans -1..1, aspect ratio
    /// preserved.
    NormalizedSpaceCentered,
    /// Raw device coordinates, -1..1 both axes.
    LinearSpace,
}

impl CoordinateSpace {
    pub(crate) fn frame_data(self, extent: vk::Extent2D) -> WindowFrameData {
        let w = extent.width.max(1) as f32;
        let h = extent.height.max(1) as f32;
        match self {
            CoordinateSpace::TexelSpace => WindowFrameData {
                multiplier: [2.0 / w, 2.0 / h],
                offset: [-1.0, -1.0],
            },
            CoordinateSpace::TexelSpaceCentered => WindowFrameData {
                multiplier: [2.0 / w, 2.0 / h],
                offset: [0.0, 0.0],
            },
            CoordinateSpace::NormalizedSpace => WindowFrameData {
                multiplier: [2.0, 2.0],
                offset: [-1.0, -1.0],
            },
            CoordinateSpace::NormalizedSpaceCentered => {
                let shorter = w.min(h);
                WindowFrameData {
                    multiplier: [shorter / w, shorter / h],
                    offset: [0.0, 0.0],
                }
            }
            CoordinateSpace::LinearSpace => WindowFrameData {
                multiplier: [1.0, 1.0],
                offset: [0.0, 0.0],
            },
        }
    }
}

/// Events delivered to a window's event handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowEvent {
    CloseRequested,
    Resized(u32, u32),
    FocusChanged(bool),
    Iconified(bool),
    Key { scancode: i32, pressed: bool },
    MouseButton { button: u8, pressed: bool },
    CursorMoved(f64, f64),
    Scroll(f32, f32),
}

/// Caller supplied handler object; default methods ignore everything.
pub trait WindowEventHandler {
    fn close_requested(&mut self) {}
    fn size_changed(&mut self, _new_size: (u32, u32)) {}
    fn focus_changed(&mut self, _focused: bool) {}
    fn iconified(&mut self, _iconified: bool) {}
    fn key_event(&mut self, _scancode: i32, _pressed: bool) {}
    fn mouse_button_event(&mut self, _button: u8, _pressed: bool) {}
    fn cursor_moved(&mut self, _position: (f64, f64)) {}
    fn scrolled(&mut self, _delta: (f32, f32)) {}
}

pub struct WindowCreateInfo {
    pub size: (u32, u32),
    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
    pub coordinate_space: CoordinateSpace,
    pub resizeable: bool,
    pub visible: bool,
    pub decorated: bool,
    pub focused: bool,
    pub maximized: bool,
    pub transparent_framebuffer: bool,
    /// 0 renders windowed; N selects monitor N-1 for fullscreen.
    pub fullscreen_monitor: u32,
    pub fullscreen_refresh_rate: u32,
    pub vsync: bool,
    pub samples: Multisamples,
    pub title: String,
    pub event_handler: Option<Box<dyn WindowEventHandler>>,
}

impl Default for WindowCreateInfo {
    fn default() -> Self {
        WindowCreateInfo {
            size: (800, 600),
            min_size: (32, 32),
            max_size: (0, 0),
            coordinate_space: CoordinateSpace::TexelSpaceCentered,
            resizeable: true,
            visible: true,
            decorated: true,
            focused: true,
            maximized: false,
            transparent_framebuffer: false,
            fullscreen_monitor: 0,
            fullscreen_refresh_rate: 0,
            vsync: true,
            samples: Multisamples::S1,
            title: String::new(),
            event_handler: None,
        }
    }
}

/// Swapchain image count by vsync policy, before surface clamping.
pub(crate) fn desired_swapchain_image_count(vsync: bool) -> u32 {
    if vsync {
        2
    } else {
        3
    }
}

/// Clamp a desired image count into what the surface allows.
pub(crate) fn clamp_swapchain_image_count(
    desired: u32,
    caps: &vk::SurfaceCapabilitiesKHR,
) -> u32 {
    let mut count = desired.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextRenderCall {
    Begin,
    End,
}

struct TimedDescriptorSet {
    set: crate::descpool::PoolDescriptorSet,
    last_access: Instant,
}

/// A render target texture this frame samples, and therefore must
/// wait on.
pub(crate) struct RttDependency {
    pub render_target: Arc<RenderTargetTexture>,
}

pub struct Window {
    w_dev: Arc<Device>,
    w_system: Rc<WindowSystem>,
    w_registry: EventRegistry,
    w_sdl_window: sdl2::video::Window,
    w_id: u32,

    w_surface_loader: khr::Surface,
    w_swapchain_loader: khr::Swapchain,
    w_surface: vk::SurfaceKHR,
    w_surface_format: vk::SurfaceFormatKHR,
    w_surface_caps: vk::SurfaceCapabilitiesKHR,
    w_present_mode: vk::PresentModeKHR,
    w_extent: vk::Extent2D,
    w_samples: vk::SampleCountFlags,
    w_coordinate_space: CoordinateSpace,
    w_vsync: bool,

    w_swapchain: vk::SwapchainKHR,
    w_images: Vec<vk::Image>,
    w_views: Vec<vk::ImageView>,
    w_render_pass: vk::RenderPass,
    w_framebuffers: Vec<vk::Framebuffer>,
    w_msaa_targets: Vec<CompleteImage>,

    w_command_pool: vk::CommandPool,
    w_render_cbufs: Vec<vk::CommandBuffer>,
    w_transfer_cbuf: vk::CommandBuffer,

    w_acquire_fence: vk::Fence,
    w_submit_to_present_semaphores: Vec<vk::Semaphore>,
    w_render_done_fences: Vec<vk::Fence>,
    w_transfer_semaphore: vk::Semaphore,

    w_next_image: u32,
    w_previous_image: u32,
    w_previous_frame_pending: bool,
    w_next_call: NextRenderCall,
    w_should_reconstruct: bool,
    w_should_close: bool,

    w_frame_data_staging: CompleteBuffer,
    w_frame_data_device: CompleteBuffer,
    w_frame_data_descriptor: crate::descpool::PoolDescriptorSet,
    w_transformation_buffer: CompleteBuffer,
    w_transformation_descriptor: crate::descpool::PoolDescriptorSet,

    w_mesh_buffer: MeshBuffer,
    w_default_texture: Arc<TextureResource>,

    w_previous_pipeline: Option<GraphicsPipelineSettings>,
    w_previous_sampler: Option<u64>,
    w_previous_texture: Option<u64>,
    w_previous_line_width: f32,
    w_sampler_descriptors: HashMap<u64, TimedDescriptorSet>,
    w_texture_descriptors: HashMap<u64, TimedDescriptorSet>,

    /// Per swapchain image: render targets that frame samples.
    w_rtt_dependencies: Vec<Vec<RttDependency>>,

    w_event_handler: Option<Box<dyn WindowEventHandler>>,
}

impl Window {
    pub(crate) fn new(
        dev: Arc<Device>,
        system: Rc<WindowSystem>,
        entry: &ash::Entry,
        vk_instance: &ash::Instance,
        default_texture: Arc<TextureResource>,
        mut info: WindowCreateInfo,
    ) -> Result<Window> {
        let sdl_window = system.create_window(&info)?;
        let window_id = sdl_window.id();

        let surface_loader = khr::Surface::new(entry, vk_instance);
        let swapchain_loader = khr::Swapchain::new(vk_instance, &dev.d_dev);

        let surface = {
            use ash::vk::Handle;
            let raw = sdl_window
                .vulkan_create_surface(vk_instance.handle().as_raw() as usize)
                .map_err(|e| {
                    log::error!("could not create a window surface: {}", e);
                    SquallError::WINDOW_SYSTEM_ERROR
                })?;
            vk::SurfaceKHR::from_raw(raw)
        };

        // The surface must be presentable on the primary render
        // queue's family.
        let render_family = dev.d_queues.primary_render.queue_family_index();
        let presentable = unsafe {
            surface_loader
                .get_physical_device_surface_support(dev.d_pdev, render_family, surface)
                .unwrap_or(false)
        };
        if !presentable {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(SquallError::NO_SUITABLE_GPU);
        }

        let surface_caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(dev.d_pdev, surface)
                .map_err(SquallError::from_vk)?
        };
        let surface_format = Self::select_surface_format(&surface_loader, &dev, surface)?;
        let present_mode =
            Self::select_present_mode(&surface_loader, &dev, surface, info.vsync)?;

        // Clamp the requested sample count against device support.
        let supported = dev.supported_multisampling();
        if !supported.contains(info.samples) {
            log::warn!(
                "multisample count {:?} not supported, falling back to no multisampling",
                info.samples
            );
            info.samples = Multisamples::S1;
        }
        let samples = info.samples.to_vk();

        let extent = Self::drawable_extent(&sdl_window, &surface_caps);
        let render_pass =
            Self::create_render_pass(&dev, surface_format.format, samples)?;

        let command_pool = dev.create_command_pool(
            render_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        let frame_data = info.coordinate_space.frame_data(extent);
        let frame_data_staging = dev.d_memory_pool.create_complete_host_buffer_with_data(
            &[frame_data],
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        let frame_data_device = {
            let buffer_info = vk::BufferCreateInfo::builder()
                .size(std::mem::size_of::<WindowFrameData>() as vk::DeviceSize)
                .usage(
                    vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                )
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .build();
            dev.d_memory_pool.create_complete_buffer(
                &buffer_info,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                None,
            )?
        };

        // One identity matrix; draw calls reference it through
        // transformation offset zero, callers compose transforms on
        // their side.
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
            let mut fd = pool.allocate_descriptor_set(&dev.d_layouts.frame_data)?;
            let td = match pool.allocate_descriptor_set(&dev.d_layouts.storage) {
                Ok(t) => t,
                Err(e) => {
                    pool.free_descriptor_set(&mut fd);
                    return Err(e);
                }
            };
            (fd, td)
        };
        {
            let fd_info = [vk::DescriptorBufferInfo::builder()
                .buffer(frame_data_device.buffer)
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

        let acquire_fence = dev.create_fence(false)?;
        let transfer_semaphore = dev.create_semaphore()?;
        let transfer_cbuf = dev.allocate_command_buffers(command_pool, 1)?[0];

        let registry = system.registry();
        let mesh_buffer = MeshBuffer::new(dev.clone());

        let mut window = Window {
            w_dev: dev,
            w_system: system,
            w_registry: registry,
            w_sdl_window: sdl_window,
            w_id: window_id,
            w_surface_loader: surface_loader,
            w_swapchain_loader: swapchain_loader,
            w_surface: surface,
            w_surface_format: surface_format,
            w_surface_caps: surface_caps,
            w_present_mode: present_mode,
            w_extent: extent,
            w_samples: samples,
            w_coordinate_space: info.coordinate_space,
            w_vsync: info.vsync,
            w_swapchain: vk::SwapchainKHR::null(),
            w_images: Vec::new(),
            w_views: Vec::new(),
            w_render_pass: render_pass,
            w_framebuffers: Vec::new(),
            w_msaa_targets: Vec::new(),
            w_command_pool: command_pool,
            w_render_cbufs: Vec::new(),
            w_transfer_cbuf: transfer_cbuf,
            w_acquire_fence: acquire_fence,
            w_submit_to_present_semaphores: Vec::new(),
            w_render_done_fences: Vec::new(),
            w_transfer_semaphore: transfer_semaphore,
            w_next_image: 0,
            w_previous_image: 0,
            w_previous_frame_pending: false,
            w_next_call: NextRenderCall::Begin,
            w_should_reconstruct: false,
            w_should_close: false,
            w_frame_data_staging: frame_data_staging,
            w_frame_data_device: frame_data_device,
            w_frame_data_descriptor: frame_data_descriptor,
            w_transformation_buffer: transformation_buffer,
            w_transformation_descriptor: transformation_descriptor,
            w_mesh_buffer: mesh_buffer,
            w_default_texture: default_texture,
            w_previous_pipeline: None,
            w_previous_sampler: None,
            w_previous_texture: None,
            w_previous_line_width: 1.0,
            w_sampler_descriptors: HashMap::new(),
            w_texture_descriptors: HashMap::new(),
            w_rtt_dependencies: Vec::new(),
            w_event_handler: info.event_handler.take(),
        };
        // From here on the Drop impl owns cleanup, including the
        // event registration.
        window.w_system.register_window(window_id);
        window.recreate_swapchain()?;
        Ok(window)
    }

    fn select_surface_format(
        loader: &khr::Surface,
        dev: &Device,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            loader
                .get_physical_device_surface_formats(dev.d_pdev, surface)
                .map_err(SquallError::from_vk)?
        };
        if formats.is_empty() {
            return Err(SquallError::NO_SUITABLE_GPU);
        }
        Ok(formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .copied()
            .unwrap_or(formats[0]))
    }

    fn select_present_mode(
        loader: &khr::Surface,
        dev: &Device,
        surface: vk::SurfaceKHR,
        vsync: bool,
    ) -> Result<vk::PresentModeKHR> {
        let modes = unsafe {
            loader
                .get_physical_device_surface_present_modes(dev.d_pdev, surface)
                .map_err(SquallError::from_vk)?
        };
        if vsync {
            // FIFO is always available.
            return Ok(vk::PresentModeKHR::FIFO);
        }
        for preferred in [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ]
        .iter()
        {
            if modes.contains(preferred) {
                return Ok(*preferred);
            }
        }
        Ok(vk::PresentModeKHR::FIFO)
    }

    fn drawable_extent(
        window: &sdl2::video::Window,
        caps: &vk::SurfaceCapabilitiesKHR,
    ) -> vk::Extent2D {
        if caps.current_extent.width != u32::MAX {
            return caps.current_extent;
        }
        let (w, h) = window.vulkan_drawable_size();
        vk::Extent2D {
            width: w
                .max(caps.min_image_extent.width)
                .min(caps.max_image_extent.width),
            height: h
                .max(caps.min_image_extent.height)
                .min(caps.max_image_extent.height),
        }
    }

    fn create_render_pass(
        dev: &Device,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<vk::RenderPass> {
        let multisampled = samples != vk::SampleCountFlags::TYPE_1;

        let mut attachments = vec![];
        if multisampled {
            // Attachment 0 is the multisampled color target, the
            // swapchain image becomes the resolve destination.
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .build(),
            );
        } else {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .build(),
            );
        }

        let color_ref = [vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build()];
        let resolve_ref = [vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build()];

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_ref);
        if multisampled {
            subpass = subpass.resolve_attachments(&resolve_ref);
        }
        let subpasses = [subpass.build()];

        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        unsafe {
            dev.d_dev
                .create_render_pass(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    /// (Re)create the swapchain and everything sized to it. Resources
    /// whose count did not change are reused.
    fn recreate_swapchain(&mut self) -> Result<()> {
        let dev = self.w_dev.clone();
        dev.wait_idle();

        self.w_surface_caps = unsafe {
            self.w_surface_loader
                .get_physical_device_surface_capabilities(dev.d_pdev, self.w_surface)
                .map_err(SquallError::from_vk)?
        };
        self.w_extent = Self::drawable_extent(&self.w_sdl_window, &self.w_surface_caps);

        let image_count = clamp_swapchain_image_count(
            desired_swapchain_image_count(self.w_vsync),
            &self.w_surface_caps,
        );

        let transform = if self
            .w_surface_caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            self.w_surface_caps.current_transform
        };

        let old_swapchain = self.w_swapchain;
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.w_surface)
            .min_image_count(image_count)
            .image_format(self.w_surface_format.format)
            .image_color_space(self.w_surface_format.color_space)
            .image_extent(self.w_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.w_present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        self.w_swapchain = unsafe {
            self.w_swapchain_loader
                .create_swapchain(&info, None)
                .map_err(SquallError::from_vk)?
        };
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.w_swapchain_loader.destroy_swapchain(old_swapchain, None);
            }
        }

        // Tear down image-count dependent resources.
        unsafe {
            for fb in self.w_framebuffers.drain(..) {
                dev.d_dev.destroy_framebuffer(fb, None);
            }
            for view in self.w_views.drain(..) {
                dev.d_dev.destroy_image_view(view, None);
            }
        }
        for mut target in self.w_msaa_targets.drain(..) {
            dev.d_memory_pool.free_complete_image(&mut target);
        }

        self.w_images = unsafe {
            self.w_swapchain_loader
                .get_swapchain_images(self.w_swapchain)
                .map_err(SquallError::from_vk)?
        };
        let actual_count = self.w_images.len();

        for image in self.w_images.iter() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.w_surface_format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1)
                        .build(),
                );
            let view = unsafe {
                dev.d_dev
                    .create_image_view(&view_info, None)
                    .map_err(SquallError::from_vk)?
            };
            self.w_views.push(view);
        }

        if self.w_samples != vk::SampleCountFlags::TYPE_1 {
            for _ in 0..actual_count {
                let image_info = vk::ImageCreateInfo::builder()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(self.w_surface_format.format)
                    .extent(vk::Extent3D {
                        width: self.w_extent.width,
                        height: self.w_extent.height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(self.w_samples)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(
                        vk::ImageUsageFlags::COLOR_ATTACHMENT
                            | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .build();
                let view_info = vk::ImageViewCreateInfo::builder()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.w_surface_format.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .level_count(1)
                            .layer_count(1)
                            .build(),
                    )
                    .build();
                let target = dev.d_memory_pool.create_complete_image(
                    &image_info,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    Some(view_info),
                )?;
                self.w_msaa_targets.push(target);
            }
        }

        for i in 0..actual_count {
            let attachments: Vec<vk::ImageView> =
                if self.w_samples != vk::SampleCountFlags::TYPE_1 {
                    vec![self.w_msaa_targets[i].view, self.w_views[i]]
                } else {
                    vec![self.w_views[i]]
                };
            let fb_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.w_render_pass)
                .attachments(&attachments)
                .width(self.w_extent.width)
                .height(self.w_extent.height)
                .layers(1);
            let fb = unsafe {
                dev.d_dev
                    .create_framebuffer(&fb_info, None)
                    .map_err(SquallError::from_vk)?
            };
            self.w_framebuffers.push(fb);
        }

        // Command buffers and per-image synchronization only change
        // when the image count does.
        if self.w_render_cbufs.len() != actual_count {
            if !self.w_render_cbufs.is_empty() {
                unsafe {
                    dev.d_dev
                        .free_command_buffers(self.w_command_pool, &self.w_render_cbufs);
                }
            }
            self.w_render_cbufs =
                dev.allocate_command_buffers(self.w_command_pool, actual_count as u32)?;
        }

        if self.w_submit_to_present_semaphores.len() != actual_count
            || self.w_render_done_fences.len() != actual_count
        {
            unsafe {
                for s in self.w_submit_to_present_semaphores.drain(..) {
                    dev.d_dev.destroy_semaphore(s, None);
                }
                for f in self.w_render_done_fences.drain(..) {
                    dev.d_dev.destroy_fence(f, None);
                }
            }
            for _ in 0..actual_count {
                self.w_submit_to_present_semaphores
                    .push(dev.create_semaphore()?);
                self.w_render_done_fences.push(dev.create_fence(false)?);
            }
            self.w_previous_frame_pending = false;
        }

        self.w_rtt_dependencies = (0..actual_count).map(|_| Vec::new()).collect();

        // The coordinate scaling depends on the extent.
        let frame_data = self.w_coordinate_space.frame_data(self.w_extent);
        self.w_frame_data_staging
            .memory
            .upload(&dev.d_dev, &[frame_data])?;

        self.w_should_reconstruct = false;
        Ok(())
    }

    /// Acquire the next swapchain image. Out-of-date swapchains are
    /// recreated and the acquire retried exactly once.
    fn acquire_image(&mut self, retried: bool) -> Result<()> {
        let result = unsafe {
            self.w_swapchain_loader.acquire_next_image(
                self.w_swapchain,
                u64::MAX,
                vk::Semaphore::null(),
                self.w_acquire_fence,
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                self.w_next_image = index;
                if suboptimal {
                    self.w_should_reconstruct = true;
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                if retried {
                    log::warn!("cannot acquire a swapchain image after retry");
                    return Err(SquallError::OUT_OF_DATE);
                }
                self.recreate_swapchain()?;
                return self.acquire_image(true);
            }
            Err(e) => return Err(SquallError::from_vk(e)),
        }

        unsafe {
            self.w_dev
                .d_dev
                .wait_for_fences(&[self.w_acquire_fence], true, u64::MAX)
                .map_err(SquallError::from_vk)?;
            self.w_dev
                .d_dev
                .reset_fences(&[self.w_acquire_fence])
                .map_err(SquallError::from_vk)?;
        }
        Ok(())
    }

    /// Wait for the previous frame's render-done fence if it has not
    /// been waited on yet.
    fn synchronize_previous_frame(&mut self) -> Result<()> {
        if !self.w_previous_frame_pending {
            return Ok(());
        }
        let fence = self.w_render_done_fences[self.w_previous_image as usize];
        unsafe {
            self.w_dev
                .d_dev
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(SquallError::from_vk)?;
            self.w_dev
                .d_dev
                .reset_fences(&[fence])
                .map_err(SquallError::from_vk)?;
        }
        self.w_previous_frame_pending = false;
        Ok(())
    }

    /// Start recording a frame. Returns an error when the frame must
    /// be skipped; the caller may retry next tick.
    pub fn begin_render(&mut self) -> Result<()> {
        if self.w_next_call != NextRenderCall::Begin {
            log::warn!("begin_render called twice in a row");
            return Err(SquallError::ALREADY_RECORDING);
        }

        if self.w_should_reconstruct {
            self.recreate_swapchain()?;
        }

        self.acquire_image(false)?;

        // Acquire can legally hand back the image we just rendered
        // to; in that case its command buffer may still be executing.
        if self.w_next_image == self.w_previous_image {
            self.synchronize_previous_frame()?;
        }

        let cbuf = self.w_render_cbufs[self.w_next_image as usize];
        let dev = &self.w_dev.d_dev;
        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            dev.begin_command_buffer(cbuf, &begin)
                .map_err(SquallError::from_vk)?;

            dev.cmd_set_viewport(
                cbuf,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: self.w_extent.width as f32,
                    height: self.w_extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            dev.cmd_set_scissor(
                cbuf,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.w_extent,
                }],
            );
            dev.cmd_set_line_width(cbuf, 1.0);

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 0.0],
                },
            }];
            let pass_begin = vk::RenderPassBeginInfo::builder()
                .render_pass(self.w_render_pass)
                .framebuffer(self.w_framebuffers[self.w_next_image as usize])
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.w_extent,
                })
                .clear_values(&clear_values);
            dev.cmd_begin_render_pass(cbuf, &pass_begin, vk::SubpassContents::INLINE);

            // Fixed sets for the whole frame: frame data and the
            // transformation table.
            let layout = self.w_dev.d_pipelines.primary_layout();
            dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                DESCRIPTOR_SET_WINDOW_FRAME_DATA,
                &[self.w_frame_data_descriptor.set()],
                &[],
            );
            dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                DESCRIPTOR_SET_TRANSFORMATION,
                &[self.w_transformation_descriptor.set()],
                &[],
            );
        }

        self.w_rtt_dependencies[self.w_next_image as usize].clear();
        self.w_next_call = NextRenderCall::End;
        Ok(())
    }

    /// Descriptor set for `sampler`, creating and caching it on first
    /// use. `None` means the default sampler under key zero.
    fn sampler_descriptor(&mut self, sampler: Option<&Sampler>) -> Result<vk::DescriptorSet> {
        let dev = self.w_dev.clone();
        let key = sampler.map(|s| s.id()).unwrap_or(0);

        if let Some(cached) = self.w_sampler_descriptors.get_mut(&key) {
            cached.last_access = Instant::now();
            return Ok(cached.set.set());
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
        self.w_sampler_descriptors.insert(
            key,
            TimedDescriptorSet {
                set: std::mem::take(&mut set),
                last_access: Instant::now(),
            },
        );
        Ok(handle)
    }

    /// Descriptor set for a texture view, cached per texture id.
    fn texture_descriptor(&mut self, id: u64, view: vk::ImageView) -> Result<vk::DescriptorSet> {
        let dev = self.w_dev.clone();

        if let Some(cached) = self.w_texture_descriptors.get_mut(&id) {
            cached.last_access = Instant::now();
            return Ok(cached.set.set());
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
        self.w_texture_descriptors.insert(
            id,
            TimedDescriptorSet {
                set: std::mem::take(&mut set),
                last_access: Instant::now(),
            },
        );
        Ok(handle)
    }

    fn drop_aged_descriptors(&mut self) {
        let now = Instant::now();
        let dev = self.w_dev.clone();
        let mut pool = dev.d_descpool.lock().unwrap();
        for cache in [
            &mut self.w_sampler_descriptors,
            &mut self.w_texture_descriptors,
        ]
        .iter_mut()
        {
            cache.retain(|_, entry| {
                if now.duration_since(entry.last_access) > DESCRIPTOR_CACHE_MAX_AGE {
                    pool.free_descriptor_set(&mut entry.set);
                    false
                } else {
                    true
                }
            });
        }
    }

    /// The draw call workhorse: pipeline/sampler/texture rebinds when
    /// they differ from the previous draw, mesh push, then the draw
    /// command.
    fn draw_internal(
        &mut self,
        mesh_type: MeshType,
        indices: &[u32],
        vertices: &[Vertex],
        weights: &[f32],
        texture: Option<&dyn Texture>,
        sampler: Option<&Sampler>,
        line_width: f32,
    ) -> Result<()> {
        if self.w_next_call != NextRenderCall::End {
            return Err(SquallError::NOT_RECORDING);
        }
        if vertices.is_empty() {
            return Ok(());
        }

        let dev = self.w_dev.clone();
        let cbuf = self.w_render_cbufs[self.w_next_image as usize];
        let layout = dev.d_pipelines.primary_layout();

        let (topology, polygon_mode, vertices_per_primitive) = match mesh_type {
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
        let uv_border_color = sampler.map(|s| s.uses_border_color()).unwrap_or(false);
        let settings = GraphicsPipelineSettings {
            pipeline_layout: layout,
            render_pass: self.w_render_pass,
            primitive_topology: topology,
            polygon_mode,
            shader_program: select_shader_program(
                multitextured,
                uv_border_color,
                vertices_per_primitive,
            ),
            samples: self.w_samples,
            enable_blending: true,
        };

        // 1. Pipeline.
        if self.w_previous_pipeline != Some(settings) {
            let pipeline = dev.d_pipelines.get_graphics_pipeline(&settings)?;
            unsafe {
                dev.d_dev
                    .cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
            }
            self.w_previous_pipeline = Some(settings);
        }

        // 2. Sampler.
        let sampler_key = sampler.map(|s| s.id()).unwrap_or(0);
        if self.w_previous_sampler != Some(sampler_key) {
            let set = self.sampler_descriptor(sampler)?;
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
            self.w_previous_sampler = Some(sampler_key);
        }

        // 3. Texture; unusable ones fall back to the default. The
        // cache keys by image view so a render target's swap buffers
        // each get their own cached set.
        use ash::vk::Handle;
        let default_texture = self.w_default_texture.clone();
        let bound_texture: &dyn Texture = match texture {
            Some(t) if t.is_available() => t,
            _ => default_texture.as_ref(),
        };
        let bound_view = bound_texture.image_view();
        let texture_key = bound_view.as_raw();
        if self.w_previous_texture != Some(texture_key) {
            let set = self.texture_descriptor(texture_key, bound_view)?;
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
            self.w_previous_texture = Some(texture_key);
        }

        // 4. Line width, only meaningful for line typed meshes.
        if mesh_type == MeshType::Line && line_width != self.w_previous_line_width {
            unsafe { dev.d_dev.cmd_set_line_width(cbuf, line_width) };
            self.w_previous_line_width = line_width;
        }

        // 5. Push the mesh and draw.
        let location = self
            .w_mesh_buffer
            .cmd_push_mesh(cbuf, indices, vertices, weights)?;
        let constants = GraphicsPushConstants {
            transformation_offset: 0,
            index_offset: location.index_offset,
            index_count: location.index_count,
            vertex_offset: location.vertex_offset,
            texture_layer_weight_offset: location.texture_layer_weight_offset,
            texture_layer_weight_count: if vertices.is_empty() {
                0
            } else {
                (weights.len() / vertices.len()) as u32
            },
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

        // 6. Sampling a render target makes this frame depend on it.
        if let Some(rt) = bound_texture.as_render_target() {
            if let Some(strong) = rt.self_arc() {
                let deps = &mut self.w_rtt_dependencies[self.w_next_image as usize];
                if !deps
                    .iter()
                    .any(|d| d.render_target.texture_id() == strong.texture_id())
                {
                    deps.push(RttDependency {
                        render_target: strong,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn draw_triangle_list(
        &mut self,
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
            self.w_previous_line_width,
        )
    }

    pub fn draw_line_list(
        &mut self,
        indices: &[u32],
        vertices: &[Vertex],
        texture_layer_weights: &[f32],
        texture: Option<&dyn Texture>,
        sampler: Option<&Sampler>,
        line_width: f32,
    ) -> Result<()> {
        self.draw_internal(
            MeshType::Line,
            indices,
            vertices,
            texture_layer_weights,
            texture,
            sampler,
            line_width,
        )
    }

    pub fn draw_point_list(
        &mut self,
        vertices: &[Vertex],
        texture_layer_weights: &[f32],
        texture: Option<&dyn Texture>,
        sampler: Option<&Sampler>,
    ) -> Result<()> {
        self.draw_internal(
            MeshType::Point,
            &[],
            vertices,
            texture_layer_weights,
            texture,
            sampler,
            self.w_previous_line_width,
        )
    }

    pub fn draw_mesh(
        &mut self,
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

    /// Finish the frame: upload mesh data, submit transfer then
    /// render with the semaphore chain, and present.
    pub fn end_render(&mut self) -> Result<()> {
        if self.w_next_call != NextRenderCall::End {
            log::warn!("end_render called twice in a row");
            return Err(SquallError::NOT_RECORDING);
        }
        self.w_next_call = NextRenderCall::Begin;

        let dev = self.w_dev.clone();
        let vk_dev = &dev.d_dev;
        let image = self.w_next_image as usize;
        let render_cbuf = self.w_render_cbufs[image];

        // 1. Close the render pass and the frame's command buffer.
        unsafe {
            vk_dev.cmd_end_render_pass(render_cbuf);
            vk_dev
                .end_command_buffer(render_cbuf)
                .map_err(SquallError::from_vk)?;
        }

        // 2. Previous frame must be out of the transfer command
        // buffer before we re-record it.
        self.synchronize_previous_frame()?;

        // 3. Transfer command buffer: frame data and mesh contents.
        unsafe {
            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            vk_dev
                .begin_command_buffer(self.w_transfer_cbuf, &begin)
                .map_err(SquallError::from_vk)?;
            vk_dev.cmd_copy_buffer(
                self.w_transfer_cbuf,
                self.w_frame_data_staging.buffer,
                self.w_frame_data_device.buffer,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: std::mem::size_of::<WindowFrameData>() as vk::DeviceSize,
                }],
            );
        }
        self.w_mesh_buffer.cmd_upload_to_gpu(self.w_transfer_cbuf)?;
        unsafe {
            vk_dev
                .end_command_buffer(self.w_transfer_cbuf)
                .map_err(SquallError::from_vk)?;
        }

        // 4. Commit the render targets this frame samples; their
        // semaphores join the render submission's wait list.
        let mut wait_semaphores = vec![self.w_transfer_semaphore];
        let mut wait_stages = vec![
            vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::VERTEX_SHADER,
        ];
        {
            let mut visiting = Vec::new();
            for dep in self.w_rtt_dependencies[image].iter() {
                if let Some(semaphore) = dep.render_target.commit_render(&mut visiting)? {
                    wait_semaphores.push(semaphore);
                    wait_stages.push(vk::PipelineStageFlags::FRAGMENT_SHADER);
                }
            }
        }

        let transfer_cbufs = [self.w_transfer_cbuf];
        let transfer_signals = [self.w_transfer_semaphore];
        let render_cbufs = [render_cbuf];
        let render_signals = [self.w_submit_to_present_semaphores[image]];

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
        dev.d_queues.primary_render.submit(
            vk_dev,
            &submits,
            self.w_render_done_fences[image],
        )?;

        // 5. Present, waiting on the render submission.
        let swapchains = [self.w_swapchain];
        let image_indices = [self.w_next_image];
        let present_waits = [self.w_submit_to_present_semaphores[image]];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&present_waits)
            .swapchains(&swapchains)
            .image_indices(&image_indices)
            .build();
        match dev
            .d_queues
            .primary_render
            .present(&self.w_swapchain_loader, &present_info)
        {
            Ok(suboptimal) => {
                if suboptimal {
                    self.w_should_reconstruct = true;
                }
            }
            Err(SquallError::OUT_OF_DATE) => self.w_should_reconstruct = true,
            Err(e) => {
                self.w_previous_image = self.w_next_image;
                self.w_previous_frame_pending = true;
                return Err(e);
            }
        }

        // 6. Frame bookkeeping.
        self.w_previous_image = self.w_next_image;
        self.w_previous_frame_pending = true;
        self.w_previous_pipeline = None;
        self.w_previous_sampler = None;
        self.w_previous_texture = None;
        self.w_previous_line_width = 1.0;
        self.drop_aged_descriptors();
        self.poll_events();

        Ok(())
    }

    /// Drain this window's event queue into its handler.
    pub fn poll_events(&mut self) {
        let events: VecDeque<WindowEvent> = {
            let mut registry = self.w_registry.lock().unwrap();
            match registry.get_mut(&self.w_id) {
                Some(queue) => std::mem::take(queue),
                None => return,
            }
        };

        for event in events {
            match event {
                WindowEvent::CloseRequested => self.w_should_close = true,
                WindowEvent::Resized(..) => self.w_should_reconstruct = true,
                _ => (),
            }
            if let Some(handler) = self.w_event_handler.as_mut() {
                match event {
                    WindowEvent::CloseRequested => handler.close_requested(),
                    WindowEvent::Resized(w, h) => handler.size_changed((w, h)),
                    WindowEvent::FocusChanged(f) => handler.focus_changed(f),
                    WindowEvent::Iconified(i) => handler.iconified(i),
                    WindowEvent::Key { scancode, pressed } => {
                        handler.key_event(scancode, pressed)
                    }
                    WindowEvent::MouseButton { button, pressed } => {
                        handler.mouse_button_event(button, pressed)
                    }
                    WindowEvent::CursorMoved(x, y) => handler.cursor_moved((x, y)),
                    WindowEvent::Scroll(x, y) => handler.scrolled((x, y)),
                }
            }
        }
    }

    pub fn should_close(&self) -> bool {
        self.w_should_close
    }

    pub fn close(&mut self) {
        self.w_should_close = true;
    }

    pub fn size(&self) -> (u32, u32) {
        (self.w_extent.width, self.w_extent.height)
    }

    pub fn set_size(&mut self, size: (u32, u32)) {
        let _ = self.w_sdl_window.set_size(size.0, size.1);
        self.w_should_reconstruct = true;
    }

    pub fn title(&self) -> &str {
        self.w_sdl_window.title()
    }

    pub fn set_title(&mut self, title: &str) {
        let _ = self.w_sdl_window.set_title(title);
    }

    pub fn position(&self) -> (i32, i32) {
        self.w_sdl_window.position()
    }

    pub fn set_position(&mut self, position: (i32, i32)) {
        use sdl2::video::WindowPos;
        self.w_sdl_window.set_position(
            WindowPos::Positioned(position.0),
            WindowPos::Positioned(position.1),
        );
    }

    pub fn show(&mut self) {
        self.w_sdl_window.show();
    }

    pub fn hide(&mut self) {
        self.w_sdl_window.hide();
    }

    pub fn iconify(&mut self, iconified: bool) {
        if iconified {
            self.w_sdl_window.minimize();
        } else {
            self.w_sdl_window.restore();
        }
    }

    /// Switch to fullscreen on `monitor` (None returns to windowed
    /// mode). The swapchain follows on the next begin_render.
    pub fn set_fullscreen(
        &mut self,
        monitor: Option<&crate::platform::Monitor>,
        refresh_rate: u32,
    ) -> Result<()> {
        use sdl2::video::FullscreenType;

        match monitor {
            Some(m) => {
                let position = m.position();
                self.set_position(position);
                if refresh_rate > 0 {
                    let size = self.size();
                    let mode = sdl2::video::DisplayMode::new(
                        sdl2::pixels::PixelFormatEnum::Unknown,
                        size.0 as i32,
                        size.1 as i32,
                        refresh_rate as i32,
                    );
                    let _ = self.w_sdl_window.set_display_mode(mode);
                }
                self.w_sdl_window
                    .set_fullscreen(FullscreenType::True)
                    .map_err(|e| {
                        log::warn!("could not switch to fullscreen: {}", e);
                        SquallError::WINDOW_SYSTEM_ERROR
                    })?;
            }
            None => {
                self.w_sdl_window
                    .set_fullscreen(FullscreenType::Off)
                    .map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;
            }
        }
        self.w_should_reconstruct = true;
        Ok(())
    }

    pub fn is_fullscreen(&self) -> bool {
        self.w_sdl_window.fullscreen_state() != sdl2::video::FullscreenType::Off
    }

    /// Assign a hardware cursor while it hovers this window.
    pub fn set_cursor(&self, cursor: &crate::platform::Cursor) {
        cursor.sdl_cursor().set();
    }

    pub fn samples(&self) -> Multisamples {
        Multisamples::from_vk(self.w_samples)
    }

    pub(crate) fn window_id(&self) -> u32 {
        self.w_id
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        let dev = self.w_dev.clone();
        dev.wait_idle();

        self.w_mesh_buffer.destroy();

        {
            let mut pool = dev.d_descpool.lock().unwrap();
            for (_, mut entry) in self.w_sampler_descriptors.drain() {
                pool.free_descriptor_set(&mut entry.set);
            }
            for (_, mut entry) in self.w_texture_descriptors.drain() {
                pool.free_descriptor_set(&mut entry.set);
            }
            pool.free_descriptor_set(&mut self.w_frame_data_descriptor);
            pool.free_descriptor_set(&mut self.w_transformation_descriptor);
        }

        dev.d_memory_pool
            .free_complete_buffer(&mut self.w_frame_data_staging);
        dev.d_memory_pool
            .free_complete_buffer(&mut self.w_frame_data_device);
        dev.d_memory_pool
            .free_complete_buffer(&mut self.w_transformation_buffer);

        unsafe {
            for fb in self.w_framebuffers.drain(..) {
                dev.d_dev.destroy_framebuffer(fb, None);
            }
            for view in self.w_views.drain(..) {
                dev.d_dev.destroy_image_view(view, None);
            }
            for mut target in self.w_msaa_targets.drain(..) {
                dev.d_memory_pool.free_complete_image(&mut target);
            }
            for s in self.w_submit_to_present_semaphores.drain(..) {
                dev.d_dev.destroy_semaphore(s, None);
            }
            for f in self.w_render_done_fences.drain(..) {
                dev.d_dev.destroy_fence(f, None);
            }
            dev.d_dev.destroy_semaphore(self.w_transfer_semaphore, None);
            dev.d_dev.destroy_fence(self.w_acquire_fence, None);
            dev.d_dev.destroy_command_pool(self.w_command_pool, None);
            dev.d_dev.destroy_render_pass(self.w_render_pass, None);
            if self.w_swapchain != vk::SwapchainKHR::null() {
                self.w_swapchain_loader
                    .destroy_swapchain(self.w_swapchain, None);
            }
            self.w_surface_loader.destroy_surface(self.w_surface, None);
        }

        self.w_system.forget_window(self.w_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_count_follows_vsync_policy() {
        assert_eq!(desired_swapchain_image_count(true), 2);
        assert_eq!(desired_swapchain_image_count(false), 3);
    }

    #[test]
    fn image_count_clamps_to_surface_caps() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.min_image_count = 3;
        caps.max_image_count = 4;
        assert_eq!(clamp_swapchain_image_count(2, &caps), 3);
        assert_eq!(clamp_swapchain_image_count(8, &caps), 4);

        // A zero max means unbounded.
        caps.min_image_count = 2;
        caps.max_image_count = 0;
        assert_eq!(clamp_swapchain_image_count(3, &caps), 3);
    }

    #[test]
    fn texel_space_maps_pixels_to_clip_space() {
        let fd = CoordinateSpace::TexelSpace.frame_data(vk::Extent2D {
            width: 800,
            height: 600,
        });
        // Pixel (0, 0) lands at the top left corner.
        assert_eq!(fd.offset, [-1.0, -1.0]);
        // Pixel (800, 600) lands at the bottom right corner.
        assert!((800.0 * fd.multiplier[0] + fd.offset[0] - 1.0).abs() < 1e-6);
        assert!((600.0 * fd.multiplier[1] + fd.offset[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn centered_normalized_space_preserves_aspect() {
        let fd = CoordinateSpace::NormalizedSpaceCentered.frame_data(vk::Extent2D {
            width: 800,
            height: 600,
        });
        // One unit along x and y must cover the same number of
        // pixels: multiplier.x * w == multiplier.y * h.
        let px_x = fd.multiplier[0] * 800.0;
        let px_y = fd.multiplier[1] * 600.0;
        assert!((px_x - px_y).abs() < 1e-6);
    }
}
