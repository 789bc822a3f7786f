//! Shader 接口定义
//!
//! set/binding 编号与 POD 记录必须和 `shader/` 下的 GLSL 声明保持一致。
//! 所有上传结构 derive bytemuck::Pod，经由映射内存整块拷贝。

use ash::vk;
use glam::{Mat4, Vec2, Vec3, Vec4};

pub const SET_FRAME: u32 = 0;
pub const SET_MATERIAL: u32 = 1;

pub const BIND_CAMERA: u32 = 0;
pub const BIND_LIGHT: u32 = 1;
pub const BIND_TRANSFORMS: u32 = 2;

pub const BIND_BASE_COLOR: u32 = 0;
pub const BIND_NORMAL: u32 = 1;
pub const BIND_METAL_ROUGH: u32 = 2;
pub const BIND_MATERIAL: u32 = 3;

// culling set（见 shader/culling/frustum_cull.comp）
pub const CULL_BIND_TRANSFORMS: u32 = 0;
pub const CULL_BIND_CANDIDATES: u32 = 1;
pub const CULL_BIND_PLANES: u32 = 2;
pub const CULL_BIND_MESH_DATA: u32 = 3;
pub const CULL_BIND_INDIRECT_CMDS: u32 = 4;
pub const CULL_BIND_DRAW_COUNT: u32 = 5;

/// frame set 的相机 UBO
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraData {
    pub view: Mat4,
    pub proj: Mat4,
    pub cam_pos: Vec3,
    pub _pad0: f32,
}

/// frame set 的光照 UBO
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightData {
    pub light_dir: Vec3,
    pub light_intensity: f32,
    pub light_color: Vec3,
    pub exposure: f32,
}

/// material set 的材质系数 UBO
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialData {
    pub base_color_factor: Vec4,
    pub metallic_roughness_factor: Vec2,
    pub _pad0: Vec2,
}

/// sky pass 的 push constant
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SkyPush {
    pub cam_forward: Vec3,
    pub tan_half_fov: f32,
    pub cam_right: Vec3,
    pub aspect: f32,
    pub cam_up: Vec3,
    pub time: f32,
    pub sun_dir: Vec3,
    pub _pad0: f32,
}

/// culling dispatch 的视锥体平面 UBO
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CullingPlanes {
    pub planes: [Vec4; 6],
}

/// culling dispatch 的 push constant
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CullPush {
    pub candidate_count: u32,
}

/// 每个 mesh 的剔除数据：local AABB 与 index 区段
///
/// 与 compute shader 里的 std430 结构逐字段对齐（size = 48）。
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshCullData {
    pub bounds_min: Vec3,
    pub index_count: u32,
    pub bounds_max: Vec3,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub _pad0: [u32; 3],
}

/// host 预过滤后的候选 draw 记录
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CullCandidate {
    pub transform_index: u32,
    pub mesh_index: u32,
}

/// indirect 命令的 stride，culling shader 按此布局写入
pub const INDIRECT_COMMAND_STRIDE: u32 = std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_cull_data_matches_std430_layout() {
        assert_eq!(std::mem::size_of::<MeshCullData>(), 48);
        assert_eq!(std::mem::offset_of!(MeshCullData, index_count), 12);
        assert_eq!(std::mem::offset_of!(MeshCullData, bounds_max), 16);
        assert_eq!(std::mem::offset_of!(MeshCullData, first_index), 28);
        assert_eq!(std::mem::offset_of!(MeshCullData, vertex_offset), 32);
    }

    #[test]
    fn cull_candidate_stride_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<CullCandidate>(), 8);
    }

    #[test]
    fn indirect_command_stride_is_twenty_bytes() {
        assert_eq!(INDIRECT_COMMAND_STRIDE, 20);
    }

    #[test]
    fn sky_push_fits_in_push_constant_budget() {
        assert_eq!(std::mem::size_of::<SkyPush>(), 64);
    }
}
