// The squall instance
//
// Owns the vulkan context, the chosen device, the resource loading
// machinery and the window system collaborators, and exposes the
// public API. The thread that creates the instance becomes the
// creator thread; window system facing operations must stay on it.

use ash::extensions::ext;
use ash::vk;

use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::mesh::Color8;
use crate::platform::{
    Cursor, Gamepad, GamepadConnectionEvent, GamepadEventFn, GamepadState, Monitor,
    MonitorUpdateFn, WindowSystem, INSTANCE_COUNT,
};
use crate::render_target::{RenderTargetTexture, RenderTargetTextureCreateInfo};
use crate::resource::texture::TextureResource;
use crate::resource::{Resource, ResourceManager, ResourceStatus};
use crate::sampler::{Sampler, SamplerCreateInfo};
use crate::window::{Window, WindowCreateInfo};
use crate::{Multisamples, ReportFn, ReportSeverity, Result, SquallError};

/// Semantic version triple used in the create info.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Version {
        Version {
            major,
            minor,
            patch,
        }
    }

    fn to_vk(self) -> u32 {
        vk::make_api_version(0, self.major, self.minor, self.patch)
    }
}

pub struct InstanceCreateInfo {
    pub application_name: String,
    pub application_version: Version,
    pub engine_name: String,
    pub engine_version: Version,
    /// Receives every report; when absent reports land in the log.
    pub report_callback: Option<ReportFn>,
    /// Worker threads for resource loading; zero selects the system
    /// thread count.
    pub resource_loader_thread_count: u32,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        InstanceCreateInfo {
            application_name: String::new(),
            application_version: Version::default(),
            engine_name: String::new(),
            engine_version: Version::default(),
            report_callback: None,
            resource_loader_thread_count: 0,
        }
    }
}

/// The raw vulkan context. Held by `Arc` from both the instance and
/// the device so it is destroyed strictly after the logical device.
pub(crate) struct VulkanContext {
    vc_entry: ash::Entry,
    vc_instance: ash::Instance,
    vc_debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.vc_entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.vc_instance
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.vc_debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.vc_instance.destroy_instance(None);
        }
    }
}

/// Forwards validation layer output into our log.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::error!("[VK][{:?}][{:?}] {:?}", message_severity, message_types, message);
    vk::FALSE
}

fn gamepad_from_index(index: u32) -> Option<Gamepad> {
    Some(match index {
        0 => Gamepad::Gamepad1,
        1 => Gamepad::Gamepad2,
        2 => Gamepad::Gamepad3,
        3 => Gamepad::Gamepad4,
        4 => Gamepad::Gamepad5,
        5 => Gamepad::Gamepad6,
        6 => Gamepad::Gamepad7,
        7 => Gamepad::Gamepad8,
        _ => return None,
    })
}

pub struct Instance {
    i_context: Arc<VulkanContext>,
    i_system: Rc<WindowSystem>,
    i_dev: Arc<Device>,
    i_resource_manager: Arc<ResourceManager>,
    i_default_texture: Arc<TextureResource>,
    /// The report callback, invoked under this mutex so loader
    /// threads never interleave messages.
    i_report: Mutex<Option<ReportFn>>,
    i_monitor_callback: RefCell<Option<MonitorUpdateFn>>,
    i_gamepad_callback: RefCell<Option<GamepadEventFn>>,
    i_creator_thread: std::thread::ThreadId,
    i_dead: Cell<bool>,
}

impl Instance {
    /// Build the instance: vulkan context, device, loader pool and
    /// the window system. The calling thread becomes the creator
    /// thread.
    pub fn new(create_info: InstanceCreateInfo) -> Result<Instance> {
        {
            let mut count = INSTANCE_COUNT.lock().unwrap();
            *count += 1;
        }

        let result = Self::new_inner(create_info);
        if result.is_err() {
            let mut count = INSTANCE_COUNT.lock().unwrap();
            *count -= 1;
        }
        result
    }

    fn new_inner(create_info: InstanceCreateInfo) -> Result<Instance> {
        let system = Rc::new(WindowSystem::new()?);

        let entry = ash::Entry::linked();

        let application_name =
            CString::new(create_info.application_name.as_str()).unwrap_or_default();
        let engine_name = CString::new(create_info.engine_name.as_str()).unwrap_or_default();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&application_name)
            .application_version(create_info.application_version.to_vk())
            .engine_name(&engine_name)
            .engine_version(create_info.engine_version.to_vk())
            .api_version(vk::API_VERSION_1_1);

        let mut extension_names = system.required_instance_extensions()?;
        #[cfg(debug_assertions)]
        extension_names.push(ext::DebugUtils::name().to_owned());
        let extension_pointers: Vec<*const i8> =
            extension_names.iter().map(|n| n.as_ptr()).collect();

        let layer_names: Vec<CString> = vec![
            #[cfg(debug_assertions)]
            CString::new("VK_LAYER_KHRONOS_validation").unwrap(),
        ];
        let layer_pointers: Vec<*const i8> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_pointers)
            .enabled_extension_names(&extension_pointers);

        let vk_instance = unsafe {
            entry
                .create_instance(&instance_info, None)
                .map_err(|e| {
                    log::error!("vulkan instance creation failed: {:?}", e);
                    SquallError::VK_ERROR
                })?
        };

        #[cfg(debug_assertions)]
        let debug = {
            let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let loader = ext::DebugUtils::new(&entry, &vk_instance);
            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&debug_info, None)
                    .unwrap_or_else(|_| vk::DebugUtilsMessengerEXT::null())
            };
            Some((loader, messenger))
        };
        #[cfg(not(debug_assertions))]
        let debug = None;

        let context = Arc::new(VulkanContext {
            vc_entry: entry,
            vc_instance: vk_instance,
            vc_debug: debug,
        });

        let pdev = Device::select_physical_device(context.instance())?;
        let dev = Arc::new(Device::new(context.clone(), pdev)?);

        let loader_threads = match create_info.resource_loader_thread_count {
            0 | u32::MAX => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            n => n as usize,
        };
        let resource_manager = ResourceManager::new(dev.clone(), loader_threads)?;

        // The 1x1 white default texture every untextured draw binds.
        // Draws may come in right away, so block until it is usable.
        let default_texture = resource_manager
            .create_texture((1, 1), vec![vec![Color8::new(255, 255, 255, 255)]])?;
        if default_texture.wait_until_loaded(None) != ResourceStatus::Loaded {
            return Err(SquallError::RESOURCE_LOAD_FAILED);
        }

        Ok(Instance {
            i_context: context,
            i_system: system,
            i_dev: dev,
            i_resource_manager: resource_manager,
            i_default_texture: default_texture,
            i_report: Mutex::new(create_info.report_callback),
            i_monitor_callback: RefCell::new(None),
            i_gamepad_callback: RefCell::new(None),
            i_creator_thread: std::thread::current().id(),
            i_dead: Cell::new(false),
        })
    }

    /// True if called on the thread that created this instance.
    pub fn is_this_thread_creator_thread(&self) -> bool {
        std::thread::current().id() == self.i_creator_thread
    }

    fn assert_creator_thread(&self, operation: &str) {
        if !self.is_this_thread_creator_thread() {
            self.report(
                ReportSeverity::Warning,
                &format!("{} must be called from the instance's creator thread", operation),
            );
            debug_assert!(false, "main thread only operation called off thread");
        }
    }

    /// Deliver a report through the callback, serialized so messages
    /// from loader threads never interleave. Critical severities mark
    /// the instance dead.
    pub fn report(&self, severity: ReportSeverity, message: &str) {
        let callback = self.i_report.lock().unwrap();
        match callback.as_ref() {
            Some(cb) => cb(severity, message),
            None => match severity {
                ReportSeverity::None | ReportSeverity::Verbose => {
                    log::debug!("{}", message)
                }
                ReportSeverity::Info => log::info!("{}", message),
                ReportSeverity::PerformanceWarning | ReportSeverity::Warning => {
                    log::warn!("{}", message)
                }
                _ => log::error!("{}", message),
            },
        }
        if severity >= ReportSeverity::CriticalError {
            self.i_dead.set(true);
        }
    }

    /// Pump window system events and dispatch instance level
    /// callbacks. Returns true while any window remains open and the
    /// instance is healthy; the caller's main loop should spin on
    /// this.
    pub fn run(&self) -> bool {
        self.assert_creator_thread("run");

        let results = self.i_system.pump_events();
        if results.monitors_changed {
            if let Some(cb) = self.i_monitor_callback.borrow().as_ref() {
                cb();
            }
        }
        for (index, event, name) in results.gamepad_events {
            if let (Some(gamepad), Some(cb)) = (
                gamepad_from_index(index),
                self.i_gamepad_callback.borrow().as_ref(),
            ) {
                cb(gamepad, event, &name);
            }
        }

        !self.i_dead.get() && self.i_system.open_window_count() > 0
    }

    pub fn get_monitors(&self) -> Vec<Monitor> {
        self.assert_creator_thread("get_monitors");
        self.i_system.monitors()
    }

    pub fn get_primary_monitor(&self) -> Option<Monitor> {
        self.i_system.primary_monitor()
    }

    pub fn set_monitor_update_callback(&self, callback: Option<MonitorUpdateFn>) {
        self.assert_creator_thread("set_monitor_update_callback");
        *self.i_monitor_callback.borrow_mut() = callback;
    }

    pub fn create_cursor(&self, path: &Path, hot_spot: (i32, i32)) -> Result<Cursor> {
        self.assert_creator_thread("create_cursor");
        self.i_system.create_cursor_from_file(path, hot_spot)
    }

    pub fn create_cursor_from_pixels(
        &self,
        pixels: &[u8],
        size: (u32, u32),
        hot_spot: (i32, i32),
    ) -> Result<Cursor> {
        self.assert_creator_thread("create_cursor");
        self.i_system.create_cursor_from_pixels(pixels, size, hot_spot)
    }

    pub fn destroy_cursor(&self, cursor: Cursor) {
        self.assert_creator_thread("destroy_cursor");
        drop(cursor);
    }

    pub fn is_gamepad_present(&self, gamepad: Gamepad) -> bool {
        self.assert_creator_thread("is_gamepad_present");
        self.i_system.is_gamepad_present(gamepad)
    }

    pub fn get_gamepad_name(&self, gamepad: Gamepad) -> String {
        self.assert_creator_thread("get_gamepad_name");
        self.i_system.gamepad_name(gamepad)
    }

    pub fn query_gamepad_state(&self, gamepad: Gamepad) -> GamepadState {
        self.assert_creator_thread("query_gamepad_state");
        self.i_system.query_gamepad_state(gamepad)
    }

    pub fn set_gamepad_event_callback(&self, callback: Option<GamepadEventFn>) {
        self.assert_creator_thread("set_gamepad_event_callback");
        *self.i_gamepad_callback.borrow_mut() = callback;
    }

    /// Open a window. The returned object owns its swapchain and
    /// recording state; hand it back to `destroy_output_window` (or
    /// just drop it) when done. Windows, render targets and samplers
    /// must not outlive the instance that created them.
    pub fn create_output_window(&self, create_info: WindowCreateInfo) -> Result<Window> {
        self.assert_creator_thread("create_output_window");
        let window = Window::new(
            self.i_dev.clone(),
            self.i_system.clone(),
            self.i_context.entry(),
            self.i_context.instance(),
            self.i_default_texture.clone(),
            create_info,
        );
        if let Err(e) = &window {
            self.report(
                ReportSeverity::NonCriticalError,
                &format!("could not create an output window: {}", e),
            );
        }
        window
    }

    pub fn destroy_output_window(&self, window: Window) {
        self.assert_creator_thread("destroy_output_window");
        drop(window);
    }

    /// Create an off-screen render target texture.
    pub fn create_render_target_texture(
        &self,
        create_info: RenderTargetTextureCreateInfo,
    ) -> Result<Arc<RenderTargetTexture>> {
        self.assert_creator_thread("create_render_target_texture");
        let target = Arc::new(RenderTargetTexture::new(
            self.i_dev.clone(),
            self.i_default_texture.clone(),
            &create_info,
        )?);
        target.set_self(Arc::downgrade(&target));
        Ok(target)
    }

    pub fn destroy_render_target_texture(&self, target: Arc<RenderTargetTexture>) {
        self.assert_creator_thread("destroy_render_target_texture");
        drop(target);
    }

    pub fn create_sampler(&self, create_info: &SamplerCreateInfo) -> Result<Arc<Sampler>> {
        self.assert_creator_thread("create_sampler");
        Ok(Arc::new(Sampler::new(self.i_dev.clone(), create_info)?))
    }

    pub fn destroy_sampler(&self, sampler: Arc<Sampler>) {
        self.assert_creator_thread("destroy_sampler");
        drop(sampler);
    }

    /// The largest multisample count draw targets support.
    pub fn get_maximum_supported_multisampling(&self) -> Multisamples {
        self.i_dev.maximum_multisampling()
    }

    /// Every multisample count draw targets support.
    pub fn get_all_supported_multisampling(&self) -> Multisamples {
        self.i_dev.supported_multisampling()
    }

    pub fn get_resource_manager(&self) -> &Arc<ResourceManager> {
        &self.i_resource_manager
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // Resources drain before the device goes away.
        self.i_resource_manager.destroy();
        self.i_dev.wait_idle();

        let mut count = INSTANCE_COUNT.lock().unwrap();
        *count -= 1;
    }
}
