// Samplers
//
// A sampler is the vulkan object plus a small uniform buffer holding
// its border color, written once at creation. Windows cache one
// descriptor set per sampler, keyed by the sampler's id.

use ash::vk;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::memory::CompleteBuffer;
use crate::mesh::Color;
use crate::{Result, SquallError};

static SAMPLER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

impl SamplerFilter {
    fn to_vk(self) -> vk::Filter {
        match self {
            SamplerFilter::Nearest => vk::Filter::NEAREST,
            SamplerFilter::Linear => vk::Filter::LINEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    /// Texels outside [0, 1] resolve to the border color. Draws using
    /// such a sampler switch to the UV border color shader programs.
    ClampToBorder,
}

impl SamplerAddressMode {
    fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerCreateInfo {
    pub minification_filter: SamplerFilter,
    pub magnification_filter: SamplerFilter,
    pub mipmap_enable: bool,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub border_color: Color,
    pub anisotropy_enable: bool,
    pub mipmap_max_anisotropy: f32,
    pub mipmap_level_of_detail_bias: f32,
    pub mipmap_min_level_of_detail: f32,
    pub mipmap_max_level_of_detail: f32,
}

impl Default for SamplerCreateInfo {
    fn default() -> Self {
        SamplerCreateInfo {
            minification_filter: SamplerFilter::Linear,
            magnification_filter: SamplerFilter::Linear,
            mipmap_enable: true,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            border_color: Color::TRANSPARENT,
            anisotropy_enable: true,
            mipmap_max_anisotropy: 16.0,
            mipmap_level_of_detail_bias: 0.0,
            mipmap_min_level_of_detail: 0.0,
            mipmap_max_level_of_detail: 128.0,
        }
    }
}

/// Contents of the per-sampler uniform the fragment shaders read.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SamplerData {
    pub border_color: [f32; 4],
}

impl Default for SamplerData {
    fn default() -> Self {
        SamplerData {
            border_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

/// A texture sampler. Created from the instance, shared with windows
/// by `Arc`.
pub struct Sampler {
    s_dev: Arc<Device>,
    s_id: u64,
    s_sampler: vk::Sampler,
    s_data_buffer: Mutex<CompleteBuffer>,
    s_uses_border_color: bool,
}

impl Sampler {
    pub(crate) fn new(dev: Arc<Device>, info: &SamplerCreateInfo) -> Result<Sampler> {
        if info.anisotropy_enable && info.mipmap_max_anisotropy < 1.0 {
            return Err(SquallError::INVALID_CREATE_INFO);
        }

        let anisotropy_supported = dev.d_features.sampler_anisotropy != 0;
        let max_anisotropy = info
            .mipmap_max_anisotropy
            .min(dev.limits().max_sampler_anisotropy);

        let vk_info = vk::SamplerCreateInfo::builder()
            .mag_filter(info.magnification_filter.to_vk())
            .min_filter(info.minification_filter.to_vk())
            .mipmap_mode(if info.mipmap_enable {
                vk::SamplerMipmapMode::LINEAR
            } else {
                vk::SamplerMipmapMode::NEAREST
            })
            .address_mode_u(info.address_mode_u.to_vk())
            .address_mode_v(info.address_mode_v.to_vk())
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .mip_lod_bias(info.mipmap_level_of_detail_bias)
            .anisotropy_enable(info.anisotropy_enable && anisotropy_supported)
            .max_anisotropy(max_anisotropy)
            .min_lod(info.mipmap_min_level_of_detail)
            .max_lod(if info.mipmap_enable {
                info.mipmap_max_level_of_detail
            } else {
                0.25
            })
            // The fixed vulkan border colors never match the caller's;
            // the shader applies the uniform's color instead.
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);

        let sampler = unsafe {
            dev.d_dev
                .create_sampler(&vk_info, None)
                .map_err(SquallError::from_vk)?
        };

        let data = SamplerData {
            border_color: [
                info.border_color.r,
                info.border_color.g,
                info.border_color.b,
                info.border_color.a,
            ],
        };
        let data_buffer = match dev
            .d_memory_pool
            .create_complete_host_buffer_with_data(&[data], vk::BufferUsageFlags::UNIFORM_BUFFER)
        {
            Ok(b) => b,
            Err(e) => {
                unsafe { dev.d_dev.destroy_sampler(sampler, None) };
                return Err(e);
            }
        };

        let uses_border_color = info.address_mode_u == SamplerAddressMode::ClampToBorder
            || info.address_mode_v == SamplerAddressMode::ClampToBorder;

        Ok(Sampler {
            s_dev: dev,
            s_id: SAMPLER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            s_sampler: sampler,
            s_data_buffer: Mutex::new(data_buffer),
            s_uses_border_color: uses_border_color,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.s_id
    }

    pub(crate) fn vk_sampler(&self) -> vk::Sampler {
        self.s_sampler
    }

    pub(crate) fn data_buffer(&self) -> vk::Buffer {
        self.s_data_buffer.lock().unwrap().buffer
    }

    pub(crate) fn uses_border_color(&self) -> bool {
        self.s_uses_border_color
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.s_dev.wait_idle();
        unsafe {
            self.s_dev.d_dev.destroy_sampler(self.s_sampler, None);
        }
        self.s_dev
            .d_memory_pool
            .free_complete_buffer(&mut self.s_data_buffer.lock().unwrap());
    }
}
