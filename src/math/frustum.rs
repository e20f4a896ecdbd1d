//! View frustum for brick culling
//!
//! Planes are taken from the rows of a view-projection matrix built for
//! wgpu clip space, where depth runs from 0 at the near plane to 1 at the
//! far plane. Normals point into the frustum.

use crate::core::types::{Mat4, Vec3, Vec4};
use super::aabb::Aabb;

/// Plane `normal . p + distance = 0`, normal of unit length.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Plane from the coefficients of a clip-space inequality, normalized.
    fn from_coefficients(c: Vec4) -> Self {
        let normal = c.truncate();
        let inv_len = normal.length_recip();
        Self::new(normal * inv_len, c.w * inv_len)
    }

    /// Signed distance, positive on the inner side
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Six inward-facing planes: near, far, left, right, top, bottom.
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    planes: [Plane; 6],
}

impl Frustum {
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let (x, y, z, w) = (vp.row(0), vp.row(1), vp.row(2), vp.row(3));
        // 0 <= z_clip <= w_clip, -w_clip <= x_clip, y_clip <= w_clip
        let planes = [z, w - z, w + x, w - x, w - y, w + y].map(Plane::from_coefficients);
        Self { planes }
    }

    pub fn planes(&self) -> &[Plane; 6] {
        &self.planes
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.distance_to_point(point) >= 0.0)
    }

    /// Conservative box test: false only if the box lies entirely outside
    /// one plane. Boxes near frustum corners may pass while invisible.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.distance_to_point(aabb.corner_toward(plane.normal)) >= 0.0)
    }
}
