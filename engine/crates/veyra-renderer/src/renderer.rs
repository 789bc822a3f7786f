//! 帧组装
//!
//! 每帧把场景快照变成 cull/sky/opaque 三个 pass 的声明并交给 render graph。
//! GPU-driven 关闭时走 host 剔除 + 逐 draw 提交的回退路径，视觉输出一致。

use std::cell::Cell;

use ash::vk;
use glam::{Vec2, Vec4};
use itertools::Itertools;
use veyra_gfx::commands::command_buffer::GfxCommandBuffer;
use veyra_gfx::foundation::device::GfxDevice;
use veyra_gfx::frame::FIF_COUNT;
use veyra_gfx::frame::frame_ctx::GfxFrameContext;
use veyra_gfx::resources::buffer::GfxBuffer;
use veyra_render_graph::{RenderGraph, RgBufferUse, RgPassKind};

use crate::culling::GpuCullingStage;
use crate::frustum::{FrustumPlanes, transform_aabb};
use crate::pipelines::{RenderPipelines, RenderShaderModules};
use crate::render_scene::{DrawItem, RenderMesh, RenderScene};
use crate::shader_layout::{
    BIND_BASE_COLOR, BIND_CAMERA, BIND_LIGHT, BIND_MATERIAL, BIND_METAL_ROUGH, BIND_NORMAL, BIND_TRANSFORMS,
    CameraData, INDIRECT_COMMAND_STRIDE, LightData, MaterialData, SkyPush,
};

/// per-slot transform SSBO 的容量（transform 数），超出部分截断
pub const MAX_TRANSFORMS: usize = 4096;

/// 已上传的共享几何数据（vertex/index buffer 所有权在资产层）
///
/// 各 mesh 是共享 buffer 中的区段，indirect 命令通过
/// first_index/vertex_offset 寻址，一次绑定覆盖所有 mesh。
pub struct RenderGeometry {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub meshes: Vec<RenderMesh>,
}

/// 材质纹理绑定（纹理与 sampler 所有权在资产层）
pub struct RenderMaterialBindings {
    pub base_color: (vk::ImageView, vk::Sampler),
    pub normal: (vk::ImageView, vk::Sampler),
    pub metal_rough: (vk::ImageView, vk::Sampler),
}

/// host 回退路径：有效性过滤 + host 视锥剔除 + 稳定排序
///
/// 排序键 (material, mesh, transform) 以减少 pipeline / 资源重绑。
pub fn collect_host_visible(scene: &RenderScene, meshes: &[RenderMesh]) -> Vec<DrawItem> {
    let view_proj = scene.camera.proj * scene.camera.view;
    let frustum = FrustumPlanes::from_view_proj(&view_proj);

    let mut visible = scene
        .draws
        .iter()
        .copied()
        .filter(|draw| {
            (draw.mesh_id as usize) < meshes.len() && (draw.transform_index as usize) < scene.transforms.len()
        })
        .filter(|draw| {
            let mesh = &meshes[draw.mesh_id as usize];
            let (wmin, wmax) =
                transform_aabb(&scene.transforms[draw.transform_index as usize], mesh.bounds_min, mesh.bounds_max);
            frustum.intersects_aabb(wmin, wmax)
        })
        .collect_vec();
    visible.sort_by_key(|draw| (draw.material_id, draw.mesh_id, draw.transform_index));
    visible
}

/// 每个 ring slot 的帧资源
struct RendererFrameResources {
    frame_set: vk::DescriptorSet,
    camera_ubo: GfxBuffer,
    light_ubo: GfxBuffer,
    transform_ssbo: GfxBuffer,
}

/// 渲染器
///
/// 持有帧资源、材质集、管线与 GPU 剔除阶段；
/// 管线在 swapchain generation 变化时重建。
pub struct Renderer {
    frame_set_layout: vk::DescriptorSetLayout,
    frame_pool: vk::DescriptorPool,
    material_set_layout: vk::DescriptorSetLayout,
    material_pool: vk::DescriptorPool,
    material_set: vk::DescriptorSet,
    material_ubo: GfxBuffer,

    frames: [RendererFrameResources; FIF_COUNT],

    shaders: RenderShaderModules,
    pipelines: Option<RenderPipelines>,
    last_swapchain_gen: u64,

    culling: GpuCullingStage,
    geometry: RenderGeometry,

    base_color_factor: Vec4,
    metallic_roughness_factor: Vec2,

    gpu_driven: bool,
}

// 创建与销毁
impl Renderer {
    pub fn new(
        ctx: &GfxFrameContext,
        shaders: RenderShaderModules,
        geometry: RenderGeometry,
        materials: &RenderMaterialBindings,
    ) -> Self {
        let device = ctx.device();

        let (frame_set_layout, frame_pool, frames) = Self::create_frame_resources(device);
        let (material_set_layout, material_pool, material_set, material_ubo) =
            Self::create_material_resources(device, materials);

        let transform_buffers = std::array::from_fn(|fi| frames[fi].transform_ssbo.vk_buffer());
        let culling = GpuCullingStage::new(device, shaders.cull_cs, &geometry.meshes, transform_buffers);

        Self {
            frame_set_layout,
            frame_pool,
            material_set_layout,
            material_pool,
            material_set,
            material_ubo,
            frames,
            shaders,
            pipelines: None,
            last_swapchain_gen: u64::MAX,
            culling,
            geometry,
            base_color_factor: Vec4::ONE,
            metallic_roughness_factor: Vec2::ONE,
            gpu_driven: true,
        }
    }

    pub fn destroy(self, device: &GfxDevice) {
        if let Some(pipelines) = self.pipelines {
            pipelines.destroy(device);
        }
        self.culling.destroy(device);
        self.shaders.destroy(device);

        unsafe {
            device.destroy_descriptor_pool(self.frame_pool, None);
            device.destroy_descriptor_set_layout(self.frame_set_layout, None);
            device.destroy_descriptor_pool(self.material_pool, None);
            device.destroy_descriptor_set_layout(self.material_set_layout, None);
        }

        self.material_ubo.destroy(device);
        for frame in self.frames {
            frame.camera_ubo.destroy(device);
            frame.light_ubo.destroy(device);
            frame.transform_ssbo.destroy(device);
        }
    }
}

// 创建过程
impl Renderer {
    fn create_frame_resources(
        device: &GfxDevice,
    ) -> (vk::DescriptorSetLayout, vk::DescriptorPool, [RendererFrameResources; FIF_COUNT]) {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(BIND_CAMERA)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BIND_LIGHT)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BIND_TRANSFORMS)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX),
        ];
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
                .unwrap()
        };

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(FIF_COUNT as u32 * 2),
            vk::DescriptorPoolSize::default().ty(vk::DescriptorType::STORAGE_BUFFER).descriptor_count(FIF_COUNT as u32),
        ];
        let pool = unsafe {
            device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default().max_sets(FIF_COUNT as u32).pool_sizes(&pool_sizes),
                    None,
                )
                .unwrap()
        };

        let frames = std::array::from_fn(|fi| {
            let camera_ubo = GfxBuffer::new(
                device,
                std::mem::size_of::<CameraData>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                true,
                format!("camera-{fi}"),
            );
            let light_ubo = GfxBuffer::new(
                device,
                std::mem::size_of::<LightData>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                true,
                format!("light-{fi}"),
            );
            let transform_ssbo = GfxBuffer::new(
                device,
                (std::mem::size_of::<glam::Mat4>() * MAX_TRANSFORMS) as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                true,
                format!("transforms-{fi}"),
            );

            let set_layouts = [set_layout];
            let frame_set = unsafe {
                device
                    .allocate_descriptor_sets(
                        &vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&set_layouts),
                    )
                    .unwrap()[0]
            };

            let camera_info = [vk::DescriptorBufferInfo::default()
                .buffer(camera_ubo.vk_buffer())
                .range(std::mem::size_of::<CameraData>() as vk::DeviceSize)];
            let light_info = [vk::DescriptorBufferInfo::default()
                .buffer(light_ubo.vk_buffer())
                .range(std::mem::size_of::<LightData>() as vk::DeviceSize)];
            let transforms_info =
                [vk::DescriptorBufferInfo::default().buffer(transform_ssbo.vk_buffer()).range(vk::WHOLE_SIZE)];
            let writes = [
                vk::WriteDescriptorSet {
                    dst_set: frame_set,
                    dst_binding: BIND_CAMERA,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: camera_info.as_ptr(),
                    ..Default::default()
                },
                vk::WriteDescriptorSet {
                    dst_set: frame_set,
                    dst_binding: BIND_LIGHT,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: light_info.as_ptr(),
                    ..Default::default()
                },
                vk::WriteDescriptorSet {
                    dst_set: frame_set,
                    dst_binding: BIND_TRANSFORMS,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                    p_buffer_info: transforms_info.as_ptr(),
                    ..Default::default()
                },
            ];
            unsafe {
                device.update_descriptor_sets(&writes, &[]);
            }

            RendererFrameResources { frame_set, camera_ubo, light_ubo, transform_ssbo }
        });

        (set_layout, pool, frames)
    }

    fn create_material_resources(
        device: &GfxDevice,
        materials: &RenderMaterialBindings,
    ) -> (vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet, GfxBuffer) {
        let sampler_binding = |binding: u32| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
        };
        let bindings = [
            sampler_binding(BIND_BASE_COLOR),
            sampler_binding(BIND_NORMAL),
            sampler_binding(BIND_METAL_ROUGH),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BIND_MATERIAL)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
                .unwrap()
        };

        let pool_sizes = [
            vk::DescriptorPoolSize::default().ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER).descriptor_count(3),
            vk::DescriptorPoolSize::default().ty(vk::DescriptorType::UNIFORM_BUFFER).descriptor_count(1),
        ];
        let pool = unsafe {
            device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default().max_sets(1).pool_sizes(&pool_sizes),
                    None,
                )
                .unwrap()
        };

        let set_layouts = [set_layout];
        let material_set = unsafe {
            device
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&set_layouts),
                )
                .unwrap()[0]
        };

        let material_ubo = GfxBuffer::new(
            device,
            std::mem::size_of::<MaterialData>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            true,
            "material",
        );

        let image_info = |(view, sampler): (vk::ImageView, vk::Sampler)| {
            [vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
        };
        let base_color_info = image_info(materials.base_color);
        let normal_info = image_info(materials.normal);
        let metal_rough_info = image_info(materials.metal_rough);
        let material_info = [vk::DescriptorBufferInfo::default()
            .buffer(material_ubo.vk_buffer())
            .range(std::mem::size_of::<MaterialData>() as vk::DeviceSize)];

        let sampler_write = |binding: u32, info: &[vk::DescriptorImageInfo]| {
            vk::WriteDescriptorSet {
                dst_set: material_set,
                dst_binding: binding,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: info.as_ptr(),
                ..Default::default()
            }
        };
        let writes = [
            sampler_write(BIND_BASE_COLOR, &base_color_info),
            sampler_write(BIND_NORMAL, &normal_info),
            sampler_write(BIND_METAL_ROUGH, &metal_rough_info),
            vk::WriteDescriptorSet {
                dst_set: material_set,
                dst_binding: BIND_MATERIAL,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: material_info.as_ptr(),
                ..Default::default()
            },
        ];
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }

        (set_layout, pool, material_set, material_ubo)
    }
}

// 帧绘制
impl Renderer {
    /// 切换 GPU-driven 剔除与 host 回退路径
    #[inline]
    pub fn set_gpu_driven(&mut self, enabled: bool) {
        self.gpu_driven = enabled;
    }

    /// 因有效性检查被跳过的 draw 总数（诊断用）
    #[inline]
    pub fn skipped_draw_count(&self) -> u64 {
        self.culling.skipped_draw_count()
    }

    pub fn draw_frame(&mut self, ctx: &GfxFrameContext, scene: &RenderScene) {
        let _span = tracy_client::span!("Renderer::draw_frame");

        if self.last_swapchain_gen != ctx.swapchain_generation() {
            if let Some(old) = self.pipelines.take() {
                old.destroy(ctx.device());
            }
            self.pipelines = Some(RenderPipelines::new(
                ctx.device(),
                ctx.color_format(),
                ctx.depth_format(),
                self.frame_set_layout,
                self.material_set_layout,
                &self.shaders,
            ));
            self.last_swapchain_gen = ctx.swapchain_generation();
        }

        let Some(mut graph) = RenderGraph::begin(ctx) else {
            return;
        };

        let fi = ctx.frame_index();
        let extent = ctx.swapchain_extent();
        let aspect = if extent.height > 0 { extent.width as f32 / extent.height as f32 } else { 1.0 };

        // viewport/scissor 是 dynamic state，先于所有 pass 录制一次
        let cmd = GfxCommandBuffer::new(ctx.device(), graph.cmd());
        cmd.set_viewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        cmd.set_scissor(vk::Rect2D { offset: vk::Offset2D::default(), extent });

        let camera = &scene.camera;
        self.frames[fi].camera_ubo.write_pod(&CameraData {
            view: camera.view,
            proj: camera.proj,
            cam_pos: camera.position,
            _pad0: 0.0,
        });
        self.frames[fi].light_ubo.write_pod(&LightData {
            light_dir: scene.sun.direction,
            light_intensity: scene.sun.intensity,
            light_color: scene.sun.color,
            exposure: scene.exposure,
        });
        self.material_ubo.write_pod(&MaterialData {
            base_color_factor: self.base_color_factor,
            metallic_roughness_factor: self.metallic_roughness_factor,
            _pad0: Vec2::ZERO,
        });
        let transform_count = scene.transforms.len().min(MAX_TRANSFORMS);
        if transform_count > 0 {
            self.frames[fi].transform_ssbo.write_slice(&scene.transforms[..transform_count], 0);
        }

        let backbuffer = graph.backbuffer();
        let depth = graph.depth();
        let indirect_handle = graph.import_buffer(self.culling.indirect_buffer(fi));
        let count_handle = graph.import_buffer(self.culling.draw_count_buffer(fi));

        // cull pass 的执行结果经由 Cell 流到 opaque pass；
        // 增长后 indirect buffer 会被换新，draw 参数必须取 dispatch 之后的值
        let visible_draws = Cell::new(0u32);
        let draw_capacity = Cell::new(self.culling.capacity(fi));
        let indirect_buffer = Cell::new(self.culling.indirect_buffer(fi));
        let count_buffer = Cell::new(self.culling.draw_count_buffer(fi));

        let culling = &mut self.culling;
        let geometry = &self.geometry;
        let pipelines = self.pipelines.as_ref().unwrap();
        let frame_set = self.frames[fi].frame_set;
        let material_set = self.material_set;
        let gpu_driven = self.gpu_driven;

        let color_clear = vk::ClearValue { color: vk::ClearColorValue { float32: [0.05, 0.06, 0.08, 1.0] } };
        let depth_clear = vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } };

        graph.add_pass(
            "cull",
            RgPassKind::Compute,
            |builder| {
                builder.write_buffer(indirect_handle, RgBufferUse::Storage);
                builder.write_buffer(count_handle, RgBufferUse::Storage);
            },
            |cmd| {
                if gpu_driven {
                    visible_draws.set(culling.record(ctx, cmd, scene, &geometry.meshes));
                    draw_capacity.set(culling.capacity(fi));
                    indirect_buffer.set(culling.indirect_buffer(fi));
                    count_buffer.set(culling.draw_count_buffer(fi));
                }
            },
        );

        graph.add_pass(
            "sky",
            RgPassKind::Graphics,
            |builder| {
                builder.color_attachment(
                    backbuffer,
                    vk::AttachmentLoadOp::CLEAR,
                    vk::AttachmentStoreOp::STORE,
                    Some(color_clear),
                );
            },
            |cmd| {
                cmd.bind_graphics_pipeline(pipelines.sky_pipeline());

                let push = SkyPush {
                    cam_forward: camera.forward,
                    tan_half_fov: (camera.fov_radians * 0.5).tan(),
                    cam_right: camera.right,
                    aspect,
                    cam_up: camera.up,
                    time: scene.time_seconds,
                    sun_dir: scene.sun.direction,
                    _pad0: 0.0,
                };
                cmd.push_constants(
                    pipelines.sky_layout(),
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );
                cmd.draw(3, 1, 0, 0);
            },
        );

        graph.add_pass(
            "opaque",
            RgPassKind::Graphics,
            |builder| {
                builder.color_attachment(backbuffer, vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::STORE, None);
                builder.depth_attachment(
                    depth,
                    vk::AttachmentLoadOp::CLEAR,
                    vk::AttachmentStoreOp::DONT_CARE,
                    Some(depth_clear),
                );
                builder.read_buffer(indirect_handle, RgBufferUse::Indirect);
                builder.read_buffer(count_handle, RgBufferUse::Indirect);
            },
            |cmd| {
                cmd.bind_graphics_pipeline(pipelines.mesh_pipeline());
                cmd.bind_vertex_buffers(0, &[geometry.vertex_buffer], &[0]);
                cmd.bind_index_buffer(geometry.index_buffer, 0, vk::IndexType::UINT32);
                cmd.bind_descriptor_sets(
                    vk::PipelineBindPoint::GRAPHICS,
                    pipelines.mesh_layout(),
                    0,
                    &[frame_set, material_set],
                );

                if gpu_driven {
                    // draw 数由 device 侧计数值约束，host 不回读
                    if visible_draws.get() > 0 {
                        cmd.draw_indexed_indirect_count(
                            indirect_buffer.get(),
                            0,
                            count_buffer.get(),
                            0,
                            draw_capacity.get(),
                            INDIRECT_COMMAND_STRIDE,
                        );
                    }
                    return;
                }

                for draw in collect_host_visible(scene, &geometry.meshes) {
                    let mesh = &geometry.meshes[draw.mesh_id as usize];
                    cmd.draw_indexed(mesh.index_count, 1, mesh.first_index, mesh.vertex_offset, draw.transform_index);
                }
            },
        );

        graph.execute();
        graph.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_scene::RenderCameraData;
    use glam::{Mat4, Vec3};

    fn test_camera() -> RenderCameraData {
        RenderCameraData {
            view: Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y),
            proj: Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0),
            ..Default::default()
        }
    }

    fn test_mesh() -> RenderMesh {
        RenderMesh {
            index_count: 36,
            first_index: 0,
            vertex_offset: 0,
            bounds_min: Vec3::splat(-0.5),
            bounds_max: Vec3::splat(0.5),
        }
    }

    #[test]
    fn host_path_culls_and_sorts_by_material_mesh_transform() {
        let mut scene = RenderScene::new();
        scene.camera = test_camera();
        scene.transforms = vec![
            Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)),
            Mat4::from_translation(Vec3::new(1.0, 0.0, -8.0)),
            Mat4::from_translation(Vec3::new(1000.0, 0.0, -5.0)), // 视锥外
        ];
        scene.draws = vec![
            DrawItem { mesh_id: 0, material_id: 1, transform_index: 1, ..Default::default() },
            DrawItem { mesh_id: 0, material_id: 0, transform_index: 0, ..Default::default() },
            DrawItem { mesh_id: 0, material_id: 1, transform_index: 0, ..Default::default() },
            DrawItem { mesh_id: 0, material_id: 0, transform_index: 2, ..Default::default() }, // 被剔除
        ];
        let meshes = vec![test_mesh()];

        let visible = collect_host_visible(&scene, &meshes);
        let keys = visible.iter().map(|d| (d.material_id, d.transform_index)).collect_vec();
        assert_eq!(keys, vec![(0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn host_path_skips_invalid_references() {
        let mut scene = RenderScene::new();
        scene.camera = test_camera();
        scene.transforms = vec![Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0))];
        scene.draws = vec![
            DrawItem { mesh_id: 3, material_id: 0, transform_index: 0, ..Default::default() }, // mesh 越界
            DrawItem { mesh_id: 0, material_id: 0, transform_index: 7, ..Default::default() }, // transform 越界
            DrawItem { mesh_id: 0, material_id: 0, transform_index: 0, ..Default::default() },
        ];
        let meshes = vec![test_mesh()];

        let visible = collect_host_visible(&scene, &meshes);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].transform_index, 0);
    }
}
