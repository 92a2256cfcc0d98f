// The Squall 2D renderer
//
// A Vulkan rendering library for drawing 2D content into windows
// and off-screen render targets. The Instance object owns the GPU
// context, all windows, and the resource loading machinery.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

mod descpool;
mod device;
mod instance;
mod memory;
mod mesh;
mod mesh_buffer;
mod pipeline;
mod platform;
mod queue;
mod render_target;
mod resource;
mod sampler;
mod thread_pool;
mod window;

pub use cgmath;

pub use instance::{Instance, InstanceCreateInfo, Version};
pub use mesh::{rectangle_mesh, text_mesh, Color, Color8, Mesh, MeshType, Rect2, Vertex};
pub use platform::{
    Cursor, Gamepad, GamepadConnectionEvent, GamepadEventFn, GamepadState, Monitor,
    MonitorUpdateFn, MonitorVideoMode,
};
pub use render_target::{BlurType, RenderTargetTexture, RenderTargetTextureCreateInfo};
pub use resource::font::{FontCreateInfo, FontResource, GlyphInfo};
pub use resource::texture::TextureResource;
pub use resource::{Resource, ResourceManager, ResourceStatus};
pub use sampler::{Sampler, SamplerAddressMode, SamplerCreateInfo, SamplerFilter};
pub use window::{
    CoordinateSpace, Texture, Window, WindowCreateInfo, WindowEvent, WindowEventHandler,
};

use ash::vk;

pub type Result<T> = std::result::Result<T, SquallError>;

/// Error variants reported by squall calls.
///
/// Per-frame recoverable conditions (`OUT_OF_DATE`) are separated from
/// conditions that end the instance (`DEVICE_LOST`). Anything coming
/// straight from a failed Vulkan entry point that we don't special case
/// maps to `VK_ERROR`.
#[allow(non_camel_case_types)]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquallError {
    #[error("Could not find a suitable GPU")]
    NO_SUITABLE_GPU,
    #[error("The device is out of memory")]
    OUT_OF_DEVICE_MEMORY,
    #[error("The GPU context was lost")]
    DEVICE_LOST,
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("Invalid create info")]
    INVALID_CREATE_INFO,
    #[error("Invalid operation")]
    INVALID,
    #[error("Operation called outside of begin_render/end_render")]
    NOT_RECORDING,
    #[error("begin_render was called while a frame was already recording")]
    ALREADY_RECORDING,
    #[error("Could not allocate a descriptor set")]
    DESCRIPTOR_ALLOC_FAILED,
    #[error("Resource failed to load")]
    RESOURCE_LOAD_FAILED,
    #[error("Resource is not loaded yet")]
    RESOURCE_NOT_LOADED,
    #[error("Could not compile a shader program")]
    SHADER_COMPILE_FAILED,
    #[error("Render target textures depend on each other in a cycle")]
    RENDER_TARGET_CYCLE,
    #[error("The window system reported an error")]
    WINDOW_SYSTEM_ERROR,
    #[error("Unhandled vulkan error")]
    VK_ERROR,
}

impl SquallError {
    /// Fold a raw Vulkan result into our error set.
    pub(crate) fn from_vk(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => SquallError::OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => SquallError::OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_DEVICE_LOST => SquallError::DEVICE_LOST,
            vk::Result::ERROR_OUT_OF_DATE_KHR => SquallError::OUT_OF_DATE,
            vk::Result::TIMEOUT => SquallError::TIMEOUT,
            _ => SquallError::VK_ERROR,
        }
    }
}

/// Nature and severity of a report delivered through the report callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportSeverity {
    /// Not a valid severity, used to detect uninitialized values.
    None,
    /// Everything, usually too much information.
    Verbose,
    Info,
    /// Serious bottleneck somewhere, worth checking out.
    PerformanceWarning,
    /// A resource failed to load, rendering continues with visual defects.
    Warning,
    /// One operation failed, the caller may retry.
    NonCriticalError,
    /// The instance cannot continue.
    CriticalError,
    /// The GPU reset. Lifecycle-wise the same as a critical error but
    /// distinguishable for telemetry.
    DeviceLost,
}

/// Caller supplied report callback. Invoked under the instance's report
/// mutex so messages from concurrent loader threads never interleave.
pub type ReportFn = Box<dyn Fn(ReportSeverity, &str) + Send + Sync>;

bitflags! {
    /// Multisample counts. A draw target uses exactly one of these,
    /// queries can return a set of all supported counts.
    pub struct Multisamples: u32 {
        const S1  = 0b0000001;
        const S2  = 0b0000010;
        const S4  = 0b0000100;
        const S8  = 0b0001000;
        const S16 = 0b0010000;
        const S32 = 0b0100000;
        const S64 = 0b1000000;
    }
}

impl Multisamples {
    pub(crate) fn to_vk(self) -> vk::SampleCountFlags {
        vk::SampleCountFlags::from_raw(self.bits())
    }

    pub(crate) fn from_vk(flags: vk::SampleCountFlags) -> Multisamples {
        Multisamples::from_bits_truncate(flags.as_raw())
    }
}

impl Default for Multisamples {
    fn default() -> Self {
        Multisamples::S1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multisamples_match_vulkan_bits() {
        assert_eq!(Multisamples::S1.to_vk(), vk::SampleCountFlags::TYPE_1);
        assert_eq!(Multisamples::S8.to_vk(), vk::SampleCountFlags::TYPE_8);
        assert_eq!(Multisamples::S64.to_vk(), vk::SampleCountFlags::TYPE_64);
        let set = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4;
        assert_eq!(
            Multisamples::from_vk(set),
            Multisamples::S1 | Multisamples::S4
        );
    }

    #[test]
    fn vulkan_errors_fold_into_ours() {
        assert_eq!(
            SquallError::from_vk(vk::Result::ERROR_OUT_OF_DATE_KHR),
            SquallError::OUT_OF_DATE
        );
        assert_eq!(
            SquallError::from_vk(vk::Result::ERROR_DEVICE_LOST),
            SquallError::DEVICE_LOST
        );
        assert_eq!(
            SquallError::from_vk(vk::Result::ERROR_INITIALIZATION_FAILED),
            SquallError::VK_ERROR
        );
    }
}
