// Shader program table and graphics pipeline cache
//
// GLSL sources are embedded and compiled to SPIR-V at instance
// creation. Pipelines are cached by a totally ordered settings key so
// a draw call only pays for pipeline creation the first time a new
// state combination shows up.

#![allow(dead_code)]

use ash::vk;
use ash::vk::Handle;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::device::DescriptorLayouts;
use crate::{Result, SquallError};

// Descriptor set allocation indices shared by the shaders and the
// binding code.
pub(crate) const DESCRIPTOR_SET_WINDOW_FRAME_DATA: u32 = 0;
pub(crate) const DESCRIPTOR_SET_TRANSFORMATION: u32 = 1;
pub(crate) const DESCRIPTOR_SET_INDEX_BUFFER: u32 = 2;
pub(crate) const DESCRIPTOR_SET_VERTEX_BUFFER: u32 = 3;
pub(crate) const DESCRIPTOR_SET_SAMPLER: u32 = 4;
pub(crate) const DESCRIPTOR_SET_TEXTURE: u32 = 5;
pub(crate) const DESCRIPTOR_SET_TEXTURE_LAYER_WEIGHTS: u32 = 6;

/// Push constants of every mesh drawing pipeline. Offsets returned by
/// the mesh buffer are embedded here per draw.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GraphicsPushConstants {
    pub transformation_offset: u32,
    pub index_offset: u32,
    pub index_count: u32,
    pub vertex_offset: u32,
    pub texture_layer_weight_offset: u32,
    pub texture_layer_weight_count: u32,
}

/// Push constants of the blur pipelines.
///
/// blur_info packs sigma, the precomputed normalizer, the initial
/// incremental coefficient and the initial natural exponentiation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GraphicsBlurPushConstants {
    pub blur_info: [f32; 4],
    pub pixel_size: [f32; 2],
}

/// Window frame data uniform: coordinate space scaling applied to
/// every vertex.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WindowFrameData {
    pub multiplier: [f32; 2],
    pub offset: [f32; 2],
}

pub(crate) fn push_constant_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Identifies a vertex+fragment module pair in the shader table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum ShaderProgramId {
    SingleTextured,
    SingleTexturedUvBorderColor,
    MultitexturedTriangle,
    MultitexturedLine,
    MultitexturedPoint,
    MultitexturedTriangleUvBorderColor,
    MultitexturedLineUvBorderColor,
    MultitexturedPointUvBorderColor,
    RenderTargetBoxBlurHorizontal,
    RenderTargetBoxBlurVertical,
    RenderTargetGaussianBlurHorizontal,
    RenderTargetGaussianBlurVertical,
}

impl ShaderProgramId {
    pub fn is_blur(self) -> bool {
        matches!(
            self,
            ShaderProgramId::RenderTargetBoxBlurHorizontal
                | ShaderProgramId::RenderTargetBoxBlurVertical
                | ShaderProgramId::RenderTargetGaussianBlurHorizontal
                | ShaderProgramId::RenderTargetGaussianBlurVertical
        )
    }
}

/// Pick the mesh shader program for a draw.
pub(crate) fn select_shader_program(
    multitextured: bool,
    uv_border_color: bool,
    vertices_per_primitive: u32,
) -> ShaderProgramId {
    if !multitextured {
        return if uv_border_color {
            ShaderProgramId::SingleTexturedUvBorderColor
        } else {
            ShaderProgramId::SingleTextured
        };
    }
    match (vertices_per_primitive, uv_border_color) {
        (3, false) => ShaderProgramId::MultitexturedTriangle,
        (2, false) => ShaderProgramId::MultitexturedLine,
        (1, false) => ShaderProgramId::MultitexturedPoint,
        (3, true) => ShaderProgramId::MultitexturedTriangleUvBorderColor,
        (2, true) => ShaderProgramId::MultitexturedLineUvBorderColor,
        (_, true) => ShaderProgramId::MultitexturedPointUvBorderColor,
        _ => ShaderProgramId::MultitexturedPoint,
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ShaderProgram {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
}

/// Everything that keys a graphics pipeline. Total ordering is the
/// lexicographic compare of the raw field values so the cache can live
/// in a BTreeMap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GraphicsPipelineSettings {
    pub pipeline_layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub primitive_topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub shader_program: ShaderProgramId,
    pub samples: vk::SampleCountFlags,
    pub enable_blending: bool,
}

impl GraphicsPipelineSettings {
    fn key(&self) -> (u64, u64, i32, i32, ShaderProgramId, u32, bool) {
        (
            self.pipeline_layout.as_raw(),
            self.render_pass.as_raw(),
            self.primitive_topology.as_raw(),
            self.polygon_mode.as_raw(),
            self.shader_program,
            self.samples.as_raw(),
            self.enable_blending,
        )
    }
}

impl PartialOrd for GraphicsPipelineSettings {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GraphicsPipelineSettings {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

struct ShaderVariant {
    id: ShaderProgramId,
    vertex_source: &'static str,
    fragment_source: &'static str,
    vertex_name: &'static str,
    fragment_name: &'static str,
    defines: &'static [&'static str],
}

const MESH_VERT: &str = include_str!("shaders/mesh.vert");
const MESH_FRAG: &str = include_str!("shaders/mesh.frag");
const BLUR_VERT: &str = include_str!("shaders/blur.vert");
const BLUR_FRAG: &str = include_str!("shaders/blur.frag");

const SHADER_VARIANTS: &[ShaderVariant] = &[
    ShaderVariant {
        id: ShaderProgramId::SingleTextured,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &[],
    },
    ShaderVariant {
        id: ShaderProgramId::SingleTexturedUvBorderColor,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &["UV_BORDER_COLOR"],
    },
    ShaderVariant {
        id: ShaderProgramId::MultitexturedTriangle,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &["MULTITEXTURED", "VERTICES_PER_PRIMITIVE=3"],
    },
    ShaderVariant {
        id: ShaderProgramId::MultitexturedLine,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &["MULTITEXTURED", "VERTICES_PER_PRIMITIVE=2"],
    },
    ShaderVariant {
        id: ShaderProgramId::MultitexturedPoint,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &["MULTITEXTURED", "VERTICES_PER_PRIMITIVE=1"],
    },
    ShaderVariant {
        id: ShaderProgramId::MultitexturedTriangleUvBorderColor,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &["MULTITEXTURED", "VERTICES_PER_PRIMITIVE=3", "UV_BORDER_COLOR"],
    },
    ShaderVariant {
        id: ShaderProgramId::MultitexturedLineUvBorderColor,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &["MULTITEXTURED", "VERTICES_PER_PRIMITIVE=2", "UV_BORDER_COLOR"],
    },
    ShaderVariant {
        id: ShaderProgramId::MultitexturedPointUvBorderColor,
        vertex_source: MESH_VERT,
        fragment_source: MESH_FRAG,
        vertex_name: "mesh.vert",
        fragment_name: "mesh.frag",
        defines: &["MULTITEXTURED", "VERTICES_PER_PRIMITIVE=1", "UV_BORDER_COLOR"],
    },
    ShaderVariant {
        id: ShaderProgramId::RenderTargetBoxBlurHorizontal,
        vertex_source: BLUR_VERT,
        fragment_source: BLUR_FRAG,
        vertex_name: "blur.vert",
        fragment_name: "blur.frag",
        defines: &["HORIZONTAL"],
    },
    ShaderVariant {
        id: ShaderProgramId::RenderTargetBoxBlurVertical,
        vertex_source: BLUR_VERT,
        fragment_source: BLUR_FRAG,
        vertex_name: "blur.vert",
        fragment_name: "blur.frag",
        defines: &["VERTICAL"],
    },
    ShaderVariant {
        id: ShaderProgramId::RenderTargetGaussianBlurHorizontal,
        vertex_source: BLUR_VERT,
        fragment_source: BLUR_FRAG,
        vertex_name: "blur.vert",
        fragment_name: "blur.frag",
        defines: &["GAUSSIAN", "HORIZONTAL"],
    },
    ShaderVariant {
        id: ShaderProgramId::RenderTargetGaussianBlurVertical,
        vertex_source: BLUR_VERT,
        fragment_source: BLUR_FRAG,
        vertex_name: "blur.vert",
        fragment_name: "blur.frag",
        defines: &["GAUSSIAN", "VERTICAL"],
    },
];

/// Owns the shader module table, the pipeline layouts, the vulkan
/// pipeline cache and the settings→pipeline map. Shared read-mostly;
/// the map mutates under its own lock on a cache miss.
pub(crate) struct PipelineCache {
    pc_dev: ash::Device,
    pc_vk_cache: vk::PipelineCache,
    pc_programs: HashMap<ShaderProgramId, ShaderProgram>,
    pc_pipelines: Mutex<BTreeMap<GraphicsPipelineSettings, vk::Pipeline>>,
    pc_primary_layout: vk::PipelineLayout,
    pc_blur_layout: vk::PipelineLayout,
}

impl PipelineCache {
    pub fn new(dev: ash::Device, layouts: &DescriptorLayouts) -> Result<Self> {
        let vk_cache = unsafe {
            dev.create_pipeline_cache(&vk::PipelineCacheCreateInfo::builder(), None)
                .map_err(SquallError::from_vk)?
        };

        let primary_layout = Self::create_primary_layout(&dev, layouts)?;
        let blur_layout = Self::create_blur_layout(&dev, layouts)?;
        let programs = match Self::compile_programs(&dev) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    dev.destroy_pipeline_layout(primary_layout, None);
                    dev.destroy_pipeline_layout(blur_layout, None);
                    dev.destroy_pipeline_cache(vk_cache, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            pc_dev: dev,
            pc_vk_cache: vk_cache,
            pc_programs: programs,
            pc_pipelines: Mutex::new(BTreeMap::new()),
            pc_primary_layout: primary_layout,
            pc_blur_layout: blur_layout,
        })
    }

    pub fn primary_layout(&self) -> vk::PipelineLayout {
        self.pc_primary_layout
    }

    pub fn blur_layout(&self) -> vk::PipelineLayout {
        self.pc_blur_layout
    }

    fn create_primary_layout(
        dev: &ash::Device,
        layouts: &DescriptorLayouts,
    ) -> Result<vk::PipelineLayout> {
        let set_layouts = [
            layouts.frame_data.vk_layout(),     // set 0
            layouts.storage.vk_layout(),        // set 1, transformations
            layouts.storage.vk_layout(),        // set 2, index ssbo
            layouts.storage.vk_layout(),        // set 3, vertex ssbo
            layouts.sampler.vk_layout(),        // set 4
            layouts.texture.vk_layout(),        // set 5
            layouts.storage.vk_layout(),        // set 6, layer weights
        ];
        let push_ranges = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<GraphicsPushConstants>() as u32)
            .build()];
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        unsafe {
            dev.create_pipeline_layout(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    fn create_blur_layout(
        dev: &ash::Device,
        layouts: &DescriptorLayouts,
    ) -> Result<vk::PipelineLayout> {
        let set_layouts = [layouts.blur_texture.vk_layout()];
        let push_ranges = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<GraphicsBlurPushConstants>() as u32)
            .build()];
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        unsafe {
            dev.create_pipeline_layout(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    fn compile_programs(dev: &ash::Device) -> Result<HashMap<ShaderProgramId, ShaderProgram>> {
        let compiler = shaderc::Compiler::new().ok_or(SquallError::SHADER_COMPILE_FAILED)?;
        let mut programs = HashMap::new();

        for variant in SHADER_VARIANTS {
            let mut options =
                shaderc::CompileOptions::new().ok_or(SquallError::SHADER_COMPILE_FAILED)?;
            for define in variant.defines {
                match define.split_once('=') {
                    Some((name, value)) => options.add_macro_definition(name, Some(value)),
                    None => options.add_macro_definition(define, None),
                }
            }

            let vertex = Self::compile_module(
                dev,
                &compiler,
                &options,
                variant.vertex_source,
                variant.vertex_name,
                shaderc::ShaderKind::Vertex,
            )?;
            let fragment = Self::compile_module(
                dev,
                &compiler,
                &options,
                variant.fragment_source,
                variant.fragment_name,
                shaderc::ShaderKind::Fragment,
            )?;
            programs.insert(variant.id, ShaderProgram { vertex, fragment });
        }
        Ok(programs)
    }

    fn compile_module(
        dev: &ash::Device,
        compiler: &shaderc::Compiler,
        options: &shaderc::CompileOptions,
        source: &str,
        name: &str,
        kind: shaderc::ShaderKind,
    ) -> Result<vk::ShaderModule> {
        let artifact = compiler
            .compile_into_spirv(source, kind, name, "main", Some(options))
            .map_err(|e| {
                log::error!("shader {} failed to compile: {}", name, e);
                SquallError::SHADER_COMPILE_FAILED
            })?;
        let info = vk::ShaderModuleCreateInfo::builder().code(artifact.as_binary());
        unsafe {
            dev.create_shader_module(&info, None)
                .map_err(SquallError::from_vk)
        }
    }

    pub fn shader_program(&self, id: ShaderProgramId) -> ShaderProgram {
        self.pc_programs[&id]
    }

    /// Cache lookup; a miss creates the pipeline with the standard 2D
    /// state set.
    pub fn get_graphics_pipeline(
        &self,
        settings: &GraphicsPipelineSettings,
    ) -> Result<vk::Pipeline> {
        {
            let map = self.pc_pipelines.lock().unwrap();
            if let Some(p) = map.get(settings) {
                return Ok(*p);
            }
        }

        let pipeline = self.create_graphics_pipeline(settings)?;
        let mut map = self.pc_pipelines.lock().unwrap();
        // Another thread may have raced us here; keep the first one.
        Ok(*map.entry(*settings).or_insert(pipeline))
    }

    fn create_graphics_pipeline(
        &self,
        settings: &GraphicsPipelineSettings,
    ) -> Result<vk::Pipeline> {
        let program = self.shader_program(settings.shader_program);
        let entry = std::ffi::CString::new("main").unwrap();

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(program.vertex)
                .name(&entry)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(program.fragment)
                .name(&entry)
                .build(),
        ];

        // All geometry is fetched from storage buffers, so the vertex
        // input interface stays empty.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder().build();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(settings.primitive_topology)
            .build();

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(settings.polygon_mode)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::from_raw(settings.samples.as_raw()))
            .build();

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(settings.enable_blending)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(
                vk::ColorComponentFlags::R
                    | vk::ColorComponentFlags::G
                    | vk::ColorComponentFlags::B
                    | vk::ColorComponentFlags::A,
            )
            .build()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments)
            .build();

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::LINE_WIDTH,
        ];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(settings.pipeline_layout)
            .render_pass(settings.render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            self.pc_dev
                .create_graphics_pipelines(self.pc_vk_cache, &[info], None)
                .map_err(|(_, e)| SquallError::from_vk(e))?
        };
        Ok(pipelines[0])
    }

    /// Explicit destructor, called while the device is idle.
    pub fn destroy(&self) {
        unsafe {
            for (_, pipeline) in self.pc_pipelines.lock().unwrap().iter() {
                self.pc_dev.destroy_pipeline(*pipeline, None);
            }
            for program in self.pc_programs.values() {
                self.pc_dev.destroy_shader_module(program.vertex, None);
                self.pc_dev.destroy_shader_module(program.fragment, None);
            }
            self.pc_dev
                .destroy_pipeline_layout(self.pc_primary_layout, None);
            self.pc_dev.destroy_pipeline_layout(self.pc_blur_layout, None);
            self.pc_dev.destroy_pipeline_cache(self.pc_vk_cache, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(program: ShaderProgramId, blending: bool) -> GraphicsPipelineSettings {
        GraphicsPipelineSettings {
            pipeline_layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            primitive_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            shader_program: program,
            samples: vk::SampleCountFlags::TYPE_1,
            enable_blending: blending,
        }
    }

    #[test]
    fn settings_ordering_is_total_and_consistent() {
        let a = settings(ShaderProgramId::SingleTextured, false);
        let b = settings(ShaderProgramId::SingleTextured, true);
        let c = settings(ShaderProgramId::MultitexturedLine, false);
        assert!(a < b);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
        // Keys are usable in a BTreeMap.
        let mut map = BTreeMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        map.insert(c, 3);
        assert_eq!(map.len(), 3);
        assert_eq!(map[&a], 1);
    }

    #[test]
    fn program_selection_matches_draw_parameters() {
        assert_eq!(
            select_shader_program(false, false, 3),
            ShaderProgramId::SingleTextured
        );
        assert_eq!(
            select_shader_program(false, true, 2),
            ShaderProgramId::SingleTexturedUvBorderColor
        );
        assert_eq!(
            select_shader_program(true, false, 2),
            ShaderProgramId::MultitexturedLine
        );
        assert_eq!(
            select_shader_program(true, true, 1),
            ShaderProgramId::MultitexturedPointUvBorderColor
        );
    }

    #[test]
    fn push_constant_sizes_match_shader_interface() {
        assert_eq!(std::mem::size_of::<GraphicsPushConstants>(), 24);
        assert_eq!(std::mem::size_of::<GraphicsBlurPushConstants>(), 24);
        assert_eq!(std::mem::size_of::<WindowFrameData>(), 16);
    }
}
