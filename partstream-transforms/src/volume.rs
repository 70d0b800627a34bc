//! Culling volumes: point containment and signed distance to a surface

use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use partstream_core::Aabb;
use serde::{Deserialize, Serialize};

/// A closed region of space used to cull particles.
///
/// Volumes are immutable once built and shared between the render and
/// viewport chains of the same object.
pub trait CullingVolume: Send + Sync + fmt::Debug {
    /// Check if a point is inside
    fn contains(&self, point: Vec3) -> bool;

    /// Signed distance to the boundary (negative inside) and the outward
    /// normal of the nearest boundary point
    fn surface(&self, point: Vec3) -> (f32, Vec3);

    /// World-space bounds of the inside
    fn bounds(&self) -> Aabb;
}

/// Ball around a center
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    /// Center point
    pub center: Vec3,
    /// Radius
    pub radius: f32,
}

impl CullingVolume for Sphere {
    fn contains(&self, point: Vec3) -> bool {
        point.distance_squared(self.center) <= self.radius * self.radius
    }

    fn surface(&self, point: Vec3) -> (f32, Vec3) {
        let offset = point - self.center;
        let normal = offset.try_normalize().unwrap_or(Vec3::Z);
        (offset.length() - self.radius, normal)
    }

    fn bounds(&self) -> Aabb {
        Aabb::new(self.center - Vec3::splat(self.radius), self.center + Vec3::splat(self.radius))
    }
}

/// Axis-aligned box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxVolume {
    /// Corners of the box
    pub extent: Aabb,
}

impl CullingVolume for BoxVolume {
    fn contains(&self, point: Vec3) -> bool {
        self.extent.contains(point)
    }

    fn surface(&self, point: Vec3) -> (f32, Vec3) {
        let center = self.extent.center();
        let half = (self.extent.max - self.extent.min) * 0.5;
        let offset = point - center;
        let q = offset.abs() - half;

        if q.max_element() > 0.0 {
            let nearest = point.clamp(self.extent.min, self.extent.max);
            let outside = q.max(Vec3::ZERO).length();
            return (outside, (point - nearest).try_normalize().unwrap_or(Vec3::Z));
        }

        // Inside: the closest face is along the axis with the largest q
        let axis = if q.x >= q.y && q.x >= q.z {
            Vec3::X
        } else if q.y >= q.z {
            Vec3::Y
        } else {
            Vec3::Z
        };
        let sign = if offset.dot(axis) < 0.0 { -1.0 } else { 1.0 };
        (q.max_element(), axis * sign)
    }

    fn bounds(&self) -> Aabb {
        self.extent
    }
}

/// Everything on the back side of a plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfSpace {
    /// Any point on the plane
    pub point: Vec3,
    /// Outward normal; the inside is where it points away from
    pub normal: Vec3,
}

impl CullingVolume for HalfSpace {
    fn contains(&self, point: Vec3) -> bool {
        (point - self.point).dot(self.normal) <= 0.0
    }

    fn surface(&self, point: Vec3) -> (f32, Vec3) {
        let normal = self.normal.try_normalize().unwrap_or(Vec3::Z);
        ((point - self.point).dot(normal), normal)
    }

    fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::NEG_INFINITY, Vec3::INFINITY)
    }
}

/// Union of several volumes
#[derive(Debug, Clone, Default)]
pub struct VolumeUnion {
    /// Volumes whose insides are combined
    pub members: Vec<Arc<dyn CullingVolume>>,
}

impl CullingVolume for VolumeUnion {
    fn contains(&self, point: Vec3) -> bool {
        self.members.iter().any(|m| m.contains(point))
    }

    fn surface(&self, point: Vec3) -> (f32, Vec3) {
        self.members
            .iter()
            .map(|m| m.surface(point))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .unwrap_or((f32::INFINITY, Vec3::ZERO))
    }

    fn bounds(&self) -> Aabb {
        self.members.iter().fold(Aabb::EMPTY, |acc, m| acc.union(&m.bounds()))
    }
}

/// Serializable description of a culling volume, as found in settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum VolumeSpec {
    Sphere { center: Vec3, radius: f32 },
    Box { min: Vec3, max: Vec3 },
    HalfSpace { point: Vec3, normal: Vec3 },
    Union { members: Vec<VolumeSpec> },
}

impl VolumeSpec {
    /// Build the volume this spec describes
    pub fn build(&self) -> Arc<dyn CullingVolume> {
        match self {
            VolumeSpec::Sphere { center, radius } => Arc::new(Sphere {
                center: *center,
                radius: *radius,
            }),
            VolumeSpec::Box { min, max } => Arc::new(BoxVolume {
                extent: Aabb::new(min.min(*max), max.max(*min)),
            }),
            VolumeSpec::HalfSpace { point, normal } => Arc::new(HalfSpace {
                point: *point,
                normal: *normal,
            }),
            VolumeSpec::Union { members } => Arc::new(VolumeUnion {
                members: members.iter().map(VolumeSpec::build).collect(),
            }),
        }
    }
}
