//! 图形管线
//!
//! sky 与 mesh 两条管线针对 dynamic rendering 的附件格式构建，
//! swapchain generation 变化时整体重建。shader module 由外部加载后移交。

use ash::vk;
use veyra_gfx::foundation::device::GfxDevice;

use crate::render_scene::RenderVertex;
use crate::shader_layout::SkyPush;

/// 外部加载好的 shader module 集合
///
/// 所有权随 Renderer：管线重建需要反复使用，shutdown 时统一销毁。
pub struct RenderShaderModules {
    pub sky_vs: vk::ShaderModule,
    pub sky_fs: vk::ShaderModule,
    pub mesh_vs: vk::ShaderModule,
    pub mesh_fs: vk::ShaderModule,
    pub cull_cs: vk::ShaderModule,
}

impl RenderShaderModules {
    pub fn destroy(self, device: &GfxDevice) {
        unsafe {
            device.destroy_shader_module(self.sky_vs, None);
            device.destroy_shader_module(self.sky_fs, None);
            device.destroy_shader_module(self.mesh_vs, None);
            device.destroy_shader_module(self.mesh_fs, None);
            device.destroy_shader_module(self.cull_cs, None);
        }
    }
}

/// sky + mesh 图形管线
pub struct RenderPipelines {
    sky_layout: vk::PipelineLayout,
    sky_pipeline: vk::Pipeline,
    mesh_layout: vk::PipelineLayout,
    mesh_pipeline: vk::Pipeline,
}

// 创建与销毁
impl RenderPipelines {
    pub fn new(
        device: &GfxDevice,
        color_format: vk::Format,
        depth_format: vk::Format,
        frame_set_layout: vk::DescriptorSetLayout,
        material_set_layout: vk::DescriptorSetLayout,
        shaders: &RenderShaderModules,
    ) -> Self {
        let (sky_layout, sky_pipeline) = Self::create_sky(device, color_format, shaders);
        let (mesh_layout, mesh_pipeline) =
            Self::create_mesh(device, color_format, depth_format, frame_set_layout, material_set_layout, shaders);
        Self { sky_layout, sky_pipeline, mesh_layout, mesh_pipeline }
    }

    pub fn destroy(self, device: &GfxDevice) {
        unsafe {
            device.destroy_pipeline(self.sky_pipeline, None);
            device.destroy_pipeline_layout(self.sky_layout, None);
            device.destroy_pipeline(self.mesh_pipeline, None);
            device.destroy_pipeline_layout(self.mesh_layout, None);
        }
    }
}

// 创建过程
impl RenderPipelines {
    fn create_sky(
        device: &GfxDevice,
        color_format: vk::Format,
        shaders: &RenderShaderModules,
    ) -> (vk::PipelineLayout, vk::Pipeline) {
        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<SkyPush>() as u32)];
        let layout = unsafe {
            device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&push_ranges),
                    None,
                )
                .unwrap()
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(shaders.sky_vs)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(shaders.sky_fs)
                .name(c"main"),
        ];

        // fullscreen triangle，无 vertex input，不参与深度
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [color_format];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipeline = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_ci], None)
                .map_err(|(_, e)| e)
                .unwrap()[0]
        };
        device.set_object_debug_name(pipeline, "Pipeline::sky");
        (layout, pipeline)
    }

    fn create_mesh(
        device: &GfxDevice,
        color_format: vk::Format,
        depth_format: vk::Format,
        frame_set_layout: vk::DescriptorSetLayout,
        material_set_layout: vk::DescriptorSetLayout,
        shaders: &RenderShaderModules,
    ) -> (vk::PipelineLayout, vk::Pipeline) {
        let set_layouts = [frame_set_layout, material_set_layout];
        let layout = unsafe {
            device
                .create_pipeline_layout(&vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts), None)
                .unwrap()
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(shaders.mesh_vs)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(shaders.mesh_fs)
                .name(c"main"),
        ];

        let vertex_bindings = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<RenderVertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let vertex_attrs = [
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(RenderVertex, pos) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(RenderVertex, nrm) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(RenderVertex, uv) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(3)
                .binding(0)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(std::mem::offset_of!(RenderVertex, tangent) as u32),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attrs);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipeline = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_ci], None)
                .map_err(|(_, e)| e)
                .unwrap()[0]
        };
        device.set_object_debug_name(pipeline, "Pipeline::mesh");
        (layout, pipeline)
    }
}

// getters
impl RenderPipelines {
    #[inline]
    pub fn sky_layout(&self) -> vk::PipelineLayout {
        self.sky_layout
    }

    #[inline]
    pub fn sky_pipeline(&self) -> vk::Pipeline {
        self.sky_pipeline
    }

    #[inline]
    pub fn mesh_layout(&self) -> vk::PipelineLayout {
        self.mesh_layout
    }

    #[inline]
    pub fn mesh_pipeline(&self) -> vk::Pipeline {
        self.mesh_pipeline
    }
}
