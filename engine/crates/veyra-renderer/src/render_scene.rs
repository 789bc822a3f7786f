//! 渲染场景数据
//!
//! 游戏层每帧填充的纯数据快照，不持有任何 GPU 资源。

use glam::{Mat4, Vec2, Vec3, Vec4};

/// 相机数据
#[derive(Clone, Copy)]
pub struct RenderCameraData {
    pub view: Mat4,
    pub proj: Mat4,
    pub position: Vec3,

    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    pub fov_radians: f32,
    pub aspect: f32,
}

impl Default for RenderCameraData {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            position: Vec3::ZERO,
            forward: Vec3::NEG_Z,
            right: Vec3::X,
            up: Vec3::Y,
            fov_radians: 1.0,
            aspect: 1.0,
        }
    }
}

/// 一次 draw 的声明
///
/// mesh_id 索引 mesh 表，transform_index 索引 transform 表；
/// 越界的 draw 在消费时被静默跳过（并计数），不会使帧失败。
#[derive(Clone, Copy, Debug)]
pub struct DrawItem {
    pub mesh_id: u32,
    pub material_id: u32,
    pub transform_index: u32,

    pub base_color_factor: Vec4,
    pub metallic_roughness_factor: Vec2,
}

impl Default for DrawItem {
    fn default() -> Self {
        Self {
            mesh_id: 0,
            material_id: 0,
            transform_index: 0,
            base_color_factor: Vec4::ONE,
            metallic_roughness_factor: Vec2::ONE,
        }
    }
}

/// 方向光
#[derive(Clone, Copy)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub intensity: f32,
    pub color: Vec3,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(0.3, 0.8, 0.2),
            intensity: 6.0,
            color: Vec3::new(1.0, 0.98, 0.92),
        }
    }
}

/// 每帧的场景快照
#[derive(Default)]
pub struct RenderScene {
    pub camera: RenderCameraData,
    pub sun: DirectionalLight,
    pub exposure: f32,
    pub time_seconds: f32,

    pub transforms: Vec<Mat4>,
    pub draws: Vec<DrawItem>,
}

impl RenderScene {
    pub fn new() -> Self {
        Self { exposure: 1.0, ..Default::default() }
    }

    pub fn clear(&mut self) {
        self.transforms.clear();
        self.draws.clear();
    }
}

/// 已上传到共享 vertex/index buffer 的一个 mesh 区段
///
/// 资产层负责上传；渲染层只消费句柄与范围。
#[derive(Clone, Copy)]
pub struct RenderMesh {
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,

    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

/// mesh 顶点布局（与 mesh.vert 的 attribute 对应）
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RenderVertex {
    pub pos: Vec3,
    pub nrm: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}
