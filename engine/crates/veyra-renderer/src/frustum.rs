//! 视锥体数学
//!
//! 平面从 view-projection 矩阵按行提取（Gribb-Hartmann），法线归一化；
//! AABB 测试取法线方向的正极值角点（positive vertex）。

use glam::{Mat4, Vec3, Vec4};

/// 视锥体的 6 个半空间平面：left/right/bottom/top/near/far
///
/// 平面形式 ax + by + cz + d = 0，(a, b, c) 已归一化；
/// 点在正侧（含平面上）表示在视锥体内侧。
#[derive(Clone, Copy, Debug)]
pub struct FrustumPlanes {
    pub planes: [Vec4; 6],
}

impl FrustumPlanes {
    /// 每帧 host 侧提取一次（6 次行组合，开销可忽略）
    pub fn from_view_proj(view_proj: &Mat4) -> Self {
        let row = |idx: usize| {
            Vec4::new(view_proj.col(0)[idx], view_proj.col(1)[idx], view_proj.col(2)[idx], view_proj.col(3)[idx])
        };
        let row0 = row(0);
        let row1 = row(1);
        let row2 = row(2);
        let row3 = row(3);

        let mut planes = [
            row3 + row0, // left
            row3 - row0, // right
            row3 + row1, // bottom
            row3 - row1, // top
            row3 + row2, // near
            row3 - row2, // far
        ];
        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 0.0 {
                *plane /= len;
            }
        }
        Self { planes }
    }

    /// AABB 与视锥体是否相交
    ///
    /// 对每个平面取 AABB 在法线方向的正极值角点；
    /// 该角点在某个平面负侧，整个盒子就在视锥体外。
    pub fn intersects_aabb(&self, bmin: Vec3, bmax: Vec3) -> bool {
        for plane in &self.planes {
            let n = plane.truncate();
            let p = Vec3::new(
                if n.x >= 0.0 { bmax.x } else { bmin.x },
                if n.y >= 0.0 { bmax.y } else { bmin.y },
                if n.z >= 0.0 { bmax.z } else { bmin.z },
            );
            if n.dot(p) + plane.w < 0.0 {
                return false;
            }
        }
        true
    }
}

/// local AABB 的 8 个角点变换到世界空间后重组为轴对齐盒
///
/// 不是球近似：非均匀缩放下球测试会产生假阴性。
pub fn transform_aabb(m: &Mat4, in_min: Vec3, in_max: Vec3) -> (Vec3, Vec3) {
    let corners = [
        Vec3::new(in_min.x, in_min.y, in_min.z),
        Vec3::new(in_max.x, in_min.y, in_min.z),
        Vec3::new(in_min.x, in_max.y, in_min.z),
        Vec3::new(in_max.x, in_max.y, in_min.z),
        Vec3::new(in_min.x, in_min.y, in_max.z),
        Vec3::new(in_max.x, in_min.y, in_max.z),
        Vec3::new(in_min.x, in_max.y, in_max.z),
        Vec3::new(in_max.x, in_max.y, in_max.z),
    ];

    let mut out_min = m.transform_point3(corners[0]);
    let mut out_max = out_min;
    for corner in &corners[1..] {
        let p = m.transform_point3(*corner);
        out_min = out_min.min(p);
        out_max = out_max.max(p);
    }
    (out_min, out_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 原点、朝 -Z、fov 90°、aspect 1、near 0.1、far 100
    fn test_frustum() -> FrustumPlanes {
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        FrustumPlanes::from_view_proj(&(proj * view))
    }

    fn unit_box(center: Vec3) -> (Vec3, Vec3) {
        (center - Vec3::splat(0.5), center + Vec3::splat(0.5))
    }

    #[test]
    fn box_in_front_of_camera_is_visible() {
        let fr = test_frustum();
        let (bmin, bmax) = unit_box(Vec3::new(0.0, 0.0, -5.0));
        assert!(fr.intersects_aabb(bmin, bmax));
    }

    #[test]
    fn box_beyond_far_plane_is_culled() {
        let fr = test_frustum();
        let (bmin, bmax) = unit_box(Vec3::new(0.0, 0.0, 105.0));
        assert!(!fr.intersects_aabb(bmin, bmax));

        let (bmin, bmax) = unit_box(Vec3::new(0.0, 0.0, -105.0));
        assert!(!fr.intersects_aabb(bmin, bmax));
    }

    #[test]
    fn box_outside_side_planes_is_culled() {
        let fr = test_frustum();
        let (bmin, bmax) = unit_box(Vec3::new(1000.0, 0.0, -5.0));
        assert!(!fr.intersects_aabb(bmin, bmax));
    }

    #[test]
    fn box_straddling_all_planes_is_visible() {
        let fr = test_frustum();
        // 跨越整个视锥体的大盒子
        assert!(fr.intersects_aabb(Vec3::splat(-500.0), Vec3::splat(500.0)));
    }

    #[test]
    fn plane_normals_are_normalized() {
        let fr = test_frustum();
        for plane in &fr.planes {
            let len = plane.truncate().length();
            assert!((len - 1.0).abs() < 1e-5, "plane normal length = {len}");
        }
    }

    #[test]
    fn transform_aabb_applies_translation() {
        let m = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let (out_min, out_max) = transform_aabb(&m, Vec3::splat(-1.0), Vec3::splat(1.0));
        assert_eq!(out_min, Vec3::new(9.0, -1.0, -1.0));
        assert_eq!(out_max, Vec3::new(11.0, 1.0, 1.0));
    }

    #[test]
    fn transform_aabb_recombines_rotated_corners() {
        // 绕 Z 旋转 45°，单位盒的包围盒膨胀到 ±√2/2 * 2
        let m = Mat4::from_rotation_z(std::f32::consts::FRAC_PI_4);
        let (out_min, out_max) = transform_aabb(&m, Vec3::splat(-1.0), Vec3::splat(1.0));
        let expected = std::f32::consts::SQRT_2;
        assert!((out_max.x - expected).abs() < 1e-5);
        assert!((out_max.y - expected).abs() < 1e-5);
        assert!((out_min.x + expected).abs() < 1e-5);
        // z 不受影响
        assert!((out_max.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn non_uniform_scale_is_exact() {
        let m = Mat4::from_scale(Vec3::new(3.0, 1.0, 0.5));
        let (out_min, out_max) = transform_aabb(&m, Vec3::splat(-1.0), Vec3::splat(1.0));
        assert_eq!(out_min, Vec3::new(-3.0, -1.0, -0.5));
        assert_eq!(out_max, Vec3::new(3.0, 1.0, 0.5));
    }
}
