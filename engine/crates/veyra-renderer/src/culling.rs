//! GPU-driven 视锥剔除
//!
//! host 侧只做有效性预过滤和平面提取；可见性判定、indirect 命令压实
//! 与计数全部在 compute dispatch 中完成，后续 indirect draw 由
//! device 侧的计数值约束，host 不做任何回读。

use ash::vk;
use veyra_gfx::commands::barrier::GfxBufferBarrier;
use veyra_gfx::commands::command_buffer::GfxCommandBuffer;
use veyra_gfx::foundation::device::GfxDevice;
use veyra_gfx::frame::FIF_COUNT;
use veyra_gfx::frame::frame_ctx::GfxFrameContext;
use veyra_gfx::resources::buffer::GfxBuffer;

use crate::frustum::FrustumPlanes;
use crate::render_scene::{RenderMesh, RenderScene};
use crate::shader_layout::{
    CULL_BIND_CANDIDATES, CULL_BIND_DRAW_COUNT, CULL_BIND_INDIRECT_CMDS, CULL_BIND_MESH_DATA, CULL_BIND_PLANES,
    CULL_BIND_TRANSFORMS, CullCandidate, CullPush, CullingPlanes, INDIRECT_COMMAND_STRIDE, MeshCullData,
};

/// compute shader 的 local_size_x，与 frustum_cull.comp 保持一致
pub const CULL_WORKGROUP_SIZE: u32 = 64;

/// indirect/candidate 缓冲的初始容量（draw 数）
pub const INITIAL_MAX_DRAWS: u32 = 1024;

/// ceil(candidate_count / workgroup size)
#[inline]
pub fn dispatch_group_count(candidate_count: u32) -> u32 {
    candidate_count.div_ceil(CULL_WORKGROUP_SIZE)
}

/// 几何倍增的容量策略
#[inline]
pub fn grown_capacity(needed: u32, current: u32) -> u32 {
    needed.max(current.saturating_mul(2))
}

/// host 侧预过滤：mesh id 与 transform index 都有效的 draw 才成为候选
///
/// GPU 阶段只做视锥测试，不重复有效性检查。
/// 返回 (候选列表, 被跳过的 draw 数)。
pub fn collect_candidates(scene: &RenderScene, mesh_count: usize) -> (Vec<CullCandidate>, u32) {
    let mut candidates = Vec::with_capacity(scene.draws.len());
    let mut skipped = 0u32;
    for draw in &scene.draws {
        if draw.mesh_id as usize >= mesh_count || draw.transform_index as usize >= scene.transforms.len() {
            skipped += 1;
            continue;
        }
        candidates.push(CullCandidate { transform_index: draw.transform_index, mesh_index: draw.mesh_id });
    }
    (candidates, skipped)
}

/// 每个 ring slot 的剔除资源
struct CullSlotResources {
    planes_ubo: GfxBuffer,
    candidate_ssbo: GfxBuffer,
    indirect_buffer: GfxBuffer,
    draw_count_buffer: GfxBuffer,

    /// candidate/indirect 缓冲当前能容纳的 draw 数
    capacity: u32,
    desc_set: vk::DescriptorSet,
}

/// GPU 剔除阶段
///
/// 持有 compute pipeline、mesh 剔除数据和 per-slot 的剔除缓冲。
pub struct GpuCullingStage {
    set_layout: vk::DescriptorSetLayout,
    desc_pool: vk::DescriptorPool,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    /// 每个 mesh 的 local AABB 与 index 区段，构建一次
    mesh_data_ssbo: GfxBuffer,
    /// renderer 的 per-slot transform SSBO（binding 0）
    transform_buffers: [vk::Buffer; FIF_COUNT],

    slots: [CullSlotResources; FIF_COUNT],

    skipped_draws: u64,
}

// 创建与销毁
impl GpuCullingStage {
    /// cull_shader 的所有权仍归调用方
    pub fn new(
        device: &GfxDevice,
        cull_shader: vk::ShaderModule,
        meshes: &[RenderMesh],
        transform_buffers: [vk::Buffer; FIF_COUNT],
    ) -> Self {
        let mesh_data_ssbo = Self::create_mesh_data(device, meshes);

        let bindings = [
            Self::storage_binding(CULL_BIND_TRANSFORMS),
            Self::storage_binding(CULL_BIND_CANDIDATES),
            vk::DescriptorSetLayoutBinding::default()
                .binding(CULL_BIND_PLANES)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            Self::storage_binding(CULL_BIND_MESH_DATA),
            Self::storage_binding(CULL_BIND_INDIRECT_CMDS),
            Self::storage_binding(CULL_BIND_DRAW_COUNT),
        ];
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
                .unwrap()
        };

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(FIF_COUNT as u32 * 5),
            vk::DescriptorPoolSize::default().ty(vk::DescriptorType::UNIFORM_BUFFER).descriptor_count(FIF_COUNT as u32),
        ];
        let desc_pool = unsafe {
            device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default().max_sets(FIF_COUNT as u32).pool_sizes(&pool_sizes),
                    None,
                )
                .unwrap()
        };

        let slots = std::array::from_fn(|fi| {
            let planes_ubo = GfxBuffer::new(
                device,
                std::mem::size_of::<CullingPlanes>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                true,
                format!("cull-planes-{fi}"),
            );
            let candidate_ssbo = GfxBuffer::new(
                device,
                std::mem::size_of::<CullCandidate>() as vk::DeviceSize * INITIAL_MAX_DRAWS as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                true,
                format!("cull-candidates-{fi}"),
            );
            let indirect_buffer = GfxBuffer::new(
                device,
                INDIRECT_COMMAND_STRIDE as vk::DeviceSize * INITIAL_MAX_DRAWS as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST,
                false,
                format!("cull-indirect-{fi}"),
            );
            let draw_count_buffer = GfxBuffer::new(
                device,
                std::mem::size_of::<u32>() as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST,
                false,
                format!("cull-draw-count-{fi}"),
            );

            let set_layouts = [set_layout];
            let desc_set = unsafe {
                device
                    .allocate_descriptor_sets(
                        &vk::DescriptorSetAllocateInfo::default().descriptor_pool(desc_pool).set_layouts(&set_layouts),
                    )
                    .unwrap()[0]
            };

            CullSlotResources {
                planes_ubo,
                candidate_ssbo,
                indirect_buffer,
                draw_count_buffer,
                capacity: INITIAL_MAX_DRAWS,
                desc_set,
            }
        });

        for (fi, slot) in slots.iter().enumerate() {
            Self::write_slot_descriptors(device, slot, transform_buffers[fi], mesh_data_ssbo.vk_buffer());
        }

        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<CullPush>() as u32)];
        let set_layouts = [set_layout];
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default()
                        .set_layouts(&set_layouts)
                        .push_constant_ranges(&push_ranges),
                    None,
                )
                .unwrap()
        };

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(cull_shader)
            .name(c"main");
        let pipeline_ci = vk::ComputePipelineCreateInfo::default().stage(stage_info).layout(pipeline_layout);
        let pipeline = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_ci], None)
                .map_err(|(_, e)| e)
                .unwrap()[0]
        };
        device.set_object_debug_name(pipeline, "Pipeline::frustum-cull");

        Self {
            set_layout,
            desc_pool,
            pipeline_layout,
            pipeline,
            mesh_data_ssbo,
            transform_buffers,
            slots,
            skipped_draws: 0,
        }
    }

    pub fn destroy(self, device: &GfxDevice) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.desc_pool, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
        self.mesh_data_ssbo.destroy(device);
        for slot in self.slots {
            slot.planes_ubo.destroy(device);
            slot.candidate_ssbo.destroy(device);
            slot.indirect_buffer.destroy(device);
            slot.draw_count_buffer.destroy(device);
        }
    }
}

// 创建辅助
impl GpuCullingStage {
    fn storage_binding(binding: u32) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
    }

    fn create_mesh_data(device: &GfxDevice, meshes: &[RenderMesh]) -> GfxBuffer {
        let mesh_data: Vec<MeshCullData> = meshes
            .iter()
            .map(|mesh| MeshCullData {
                bounds_min: mesh.bounds_min,
                index_count: mesh.index_count,
                bounds_max: mesh.bounds_max,
                first_index: mesh.first_index,
                vertex_offset: mesh.vertex_offset,
                _pad0: [0; 3],
            })
            .collect();

        // 空 mesh 表也保留一个占位元素，避免零尺寸 buffer
        let element_count = mesh_data.len().max(1);
        let buffer = GfxBuffer::new(
            device,
            (std::mem::size_of::<MeshCullData>() * element_count) as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            true,
            "cull-mesh-data",
        );
        if !mesh_data.is_empty() {
            buffer.write_slice(&mesh_data, 0);
        }
        buffer
    }

    fn write_slot_descriptors(
        device: &GfxDevice,
        slot: &CullSlotResources,
        transforms: vk::Buffer,
        mesh_data: vk::Buffer,
    ) {
        let transforms_info =
            [vk::DescriptorBufferInfo::default().buffer(transforms).offset(0).range(vk::WHOLE_SIZE)];
        let candidates_info =
            [vk::DescriptorBufferInfo::default().buffer(slot.candidate_ssbo.vk_buffer()).range(vk::WHOLE_SIZE)];
        let planes_info = [vk::DescriptorBufferInfo::default()
            .buffer(slot.planes_ubo.vk_buffer())
            .range(std::mem::size_of::<CullingPlanes>() as vk::DeviceSize)];
        let mesh_data_info = [vk::DescriptorBufferInfo::default().buffer(mesh_data).range(vk::WHOLE_SIZE)];
        let indirect_info =
            [vk::DescriptorBufferInfo::default().buffer(slot.indirect_buffer.vk_buffer()).range(vk::WHOLE_SIZE)];
        let count_info = [vk::DescriptorBufferInfo::default()
            .buffer(slot.draw_count_buffer.vk_buffer())
            .range(std::mem::size_of::<u32>() as vk::DeviceSize)];

        let storage_write = |binding: u32, info: &[vk::DescriptorBufferInfo]| {
            vk::WriteDescriptorSet {
                dst_set: slot.desc_set,
                dst_binding: binding,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                p_buffer_info: info.as_ptr(),
                ..Default::default()
            }
        };

        let writes = [
            storage_write(CULL_BIND_TRANSFORMS, &transforms_info),
            storage_write(CULL_BIND_CANDIDATES, &candidates_info),
            vk::WriteDescriptorSet {
                dst_set: slot.desc_set,
                dst_binding: CULL_BIND_PLANES,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: planes_info.as_ptr(),
                ..Default::default()
            },
            storage_write(CULL_BIND_MESH_DATA, &mesh_data_info),
            storage_write(CULL_BIND_INDIRECT_CMDS, &indirect_info),
            storage_write(CULL_BIND_DRAW_COUNT, &count_info),
        ];
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }
}

// 录制
impl GpuCullingStage {
    /// 录制本帧的剔除 dispatch，返回候选 draw 数
    ///
    /// 后续的 indirect draw 以 capacity 为 max-draws 上限，
    /// 实际数量由 device 侧计数值约束。
    pub fn record(
        &mut self,
        ctx: &GfxFrameContext,
        cmd: &GfxCommandBuffer,
        scene: &RenderScene,
        meshes: &[RenderMesh],
    ) -> u32 {
        let _span = tracy_client::span!("GpuCullingStage::record");

        if scene.draws.is_empty() {
            return 0;
        }

        let (candidates, skipped) = collect_candidates(scene, meshes.len());
        if skipped > 0 {
            self.skipped_draws += skipped as u64;
            log::debug!("culling skipped {skipped} malformed draws");
        }
        let candidate_count = candidates.len() as u32;
        if candidate_count == 0 {
            return 0;
        }

        let device = ctx.device();
        let fi = ctx.frame_index();

        // 容量不足时几何倍增；旧缓冲延迟销毁，descriptor 在 dispatch 前重写
        if candidate_count > self.slots[fi].capacity {
            let new_capacity = grown_capacity(candidate_count, self.slots[fi].capacity);
            log::info!("culling buffers for slot {fi} grow: {} -> {new_capacity}", self.slots[fi].capacity);

            let new_candidates = GfxBuffer::new(
                device,
                std::mem::size_of::<CullCandidate>() as vk::DeviceSize * new_capacity as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                true,
                format!("cull-candidates-{fi}"),
            );
            let new_indirect = GfxBuffer::new(
                device,
                INDIRECT_COMMAND_STRIDE as vk::DeviceSize * new_capacity as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::INDIRECT_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST,
                false,
                format!("cull-indirect-{fi}"),
            );

            let old_candidates = std::mem::replace(&mut self.slots[fi].candidate_ssbo, new_candidates);
            let old_indirect = std::mem::replace(&mut self.slots[fi].indirect_buffer, new_indirect);
            ctx.frame_deletion_queue().push(move |device| {
                old_candidates.destroy(device);
                old_indirect.destroy(device);
            });

            self.slots[fi].capacity = new_capacity;
            let mesh_data = self.mesh_data_ssbo.vk_buffer();
            Self::write_slot_descriptors(device, &self.slots[fi], self.transform_buffers[fi], mesh_data);
        }

        let slot = &self.slots[fi];
        slot.candidate_ssbo.write_slice(&candidates, 0);

        let view_proj = scene.camera.proj * scene.camera.view;
        let frustum = FrustumPlanes::from_view_proj(&view_proj);
        slot.planes_ubo.write_pod(&CullingPlanes { planes: frustum.planes });

        // 计数缓冲先清零再被 shader 原子递增，中间需要 transfer → compute 的 barrier
        cmd.fill_buffer(slot.draw_count_buffer.vk_buffer(), 0, std::mem::size_of::<u32>() as vk::DeviceSize, 0);
        let mut barriers = vec![
            GfxBufferBarrier::new()
                .buffer(slot.draw_count_buffer.vk_buffer(), 0, vk::WHOLE_SIZE)
                .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                .dst_mask(
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
                ),
        ];
        if !device.indirect_count_supported() {
            // capped indirect 路径会执行整个 [0, capacity) 区间，残留命令必须清零
            cmd.fill_buffer(
                slot.indirect_buffer.vk_buffer(),
                0,
                INDIRECT_COMMAND_STRIDE as vk::DeviceSize * slot.capacity as vk::DeviceSize,
                0,
            );
            barriers.push(
                GfxBufferBarrier::new()
                    .buffer(slot.indirect_buffer.vk_buffer(), 0, vk::WHOLE_SIZE)
                    .src_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                    .dst_mask(
                        vk::PipelineStageFlags2::COMPUTE_SHADER,
                        vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
                    ),
            );
        }
        cmd.pipeline_barrier2(&[], &barriers);

        cmd.bind_compute_pipeline(self.pipeline);
        cmd.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, self.pipeline_layout, 0, &[slot.desc_set]);
        cmd.push_constants(
            self.pipeline_layout,
            vk::ShaderStageFlags::COMPUTE,
            0,
            bytemuck::bytes_of(&CullPush { candidate_count }),
        );
        cmd.dispatch(dispatch_group_count(candidate_count), 1, 1);

        candidate_count
    }
}

// getters
impl GpuCullingStage {
    #[inline]
    pub fn indirect_buffer(&self, slot: usize) -> vk::Buffer {
        self.slots[slot].indirect_buffer.vk_buffer()
    }

    #[inline]
    pub fn draw_count_buffer(&self, slot: usize) -> vk::Buffer {
        self.slots[slot].draw_count_buffer.vk_buffer()
    }

    #[inline]
    pub fn capacity(&self, slot: usize) -> u32 {
        self.slots[slot].capacity
    }

    /// 因 mesh id / transform index 越界而被跳过的 draw 总数（诊断用）
    #[inline]
    pub fn skipped_draw_count(&self) -> u64 {
        self.skipped_draws
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_scene::DrawItem;
    use glam::{Mat4, Vec3};

    #[test]
    fn group_count_is_ceil_division() {
        assert_eq!(dispatch_group_count(1200), 19);
        assert_eq!(dispatch_group_count(64), 1);
        assert_eq!(dispatch_group_count(65), 2);
        assert_eq!(dispatch_group_count(1), 1);
        assert_eq!(dispatch_group_count(0), 0);
    }

    #[test]
    fn capacity_doubles_geometrically() {
        assert_eq!(grown_capacity(1500, 1024), 2048);
        assert_eq!(grown_capacity(2049, 2048), 4096);
        // 需求超过双倍时直接取需求值
        assert_eq!(grown_capacity(5000, 1024), 5000);
    }

    fn test_scene(draws: Vec<DrawItem>, transform_count: usize) -> RenderScene {
        let mut scene = RenderScene::new();
        scene.transforms = vec![Mat4::IDENTITY; transform_count];
        scene.draws = draws;
        scene
    }

    fn test_mesh() -> RenderMesh {
        RenderMesh {
            index_count: 36,
            first_index: 0,
            vertex_offset: 0,
            bounds_min: Vec3::splat(-1.0),
            bounds_max: Vec3::splat(1.0),
        }
    }

    #[test]
    fn prefilter_skips_invalid_draws_and_counts_them() {
        veyra_crate_tools::init_log::try_init_log();

        let scene = test_scene(
            vec![
                DrawItem { mesh_id: 0, transform_index: 1, ..Default::default() },
                DrawItem { mesh_id: 5, transform_index: 0, ..Default::default() }, // mesh 越界
                DrawItem { mesh_id: 1, transform_index: 9, ..Default::default() }, // transform 越界
                DrawItem { mesh_id: 1, transform_index: 2, ..Default::default() },
            ],
            3,
        );
        let meshes = vec![test_mesh(), test_mesh()];

        let (candidates, skipped) = collect_candidates(&scene, meshes.len());
        assert_eq!(skipped, 2);
        assert_eq!(
            candidates,
            vec![
                CullCandidate { transform_index: 1, mesh_index: 0 },
                CullCandidate { transform_index: 2, mesh_index: 1 },
            ]
        );
    }

    #[test]
    fn prefilter_of_valid_scene_keeps_everything() {
        let draws = (0..1200).map(|i| DrawItem { mesh_id: 0, transform_index: i % 4, ..Default::default() }).collect();
        let scene = test_scene(draws, 4);

        let (candidates, skipped) = collect_candidates(&scene, 1);
        assert_eq!(skipped, 0);
        assert_eq!(candidates.len(), 1200);
        assert_eq!(dispatch_group_count(candidates.len() as u32), 19);
    }
}
