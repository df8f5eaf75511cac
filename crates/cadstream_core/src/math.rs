//! Geometry helpers shared by the tree and the attach prioritizer

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundingBox {
    /// Empty (inverted) box
    pub const EMPTY: Self = Self {
        min: [f32::MAX, f32::MAX, f32::MAX],
        max: [f32::MIN, f32::MIN, f32::MIN],
    };

    /// Create from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.to_array(),
            max: max.to_array(),
        }
    }

    /// Minimum corner
    #[inline]
    pub fn min(&self) -> Vec3 {
        Vec3::from_array(self.min)
    }

    /// Maximum corner
    #[inline]
    pub fn max(&self) -> Vec3 {
        Vec3::from_array(self.max)
    }

    /// Check if the box contains no volume
    pub fn is_empty(&self) -> bool {
        self.min[0] > self.max[0] || self.min[1] > self.max[1] || self.min[2] > self.max[2]
    }

    /// Center point
    pub fn center(&self) -> Vec3 {
        (self.min() + self.max()) * 0.5
    }

    /// Grow to include another box
    pub fn merge(&self, other: &BoundingBox) -> BoundingBox {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        BoundingBox::new(self.min().min(other.min()), self.max().max(other.max()))
    }

    /// The eight corners
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min(), self.max());
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Transform by a matrix, returning the enclosing axis-aligned box
    pub fn transform(&self, matrix: &Mat4) -> BoundingBox {
        if self.is_empty() {
            return *self;
        }
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for corner in self.corners() {
            let p = matrix.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        BoundingBox::new(min, max)
    }

    /// Fraction of the viewport covered by the projected box
    ///
    /// Boxes straddling the near plane count as full-screen, boxes fully
    /// behind the camera count as zero.
    pub fn projected_fraction(&self, view_projection: &Mat4) -> f32 {
        if self.is_empty() {
            return 0.0;
        }

        let mut behind = 0;
        let mut lo = [f32::MAX; 2];
        let mut hi = [f32::MIN; 2];
        for corner in self.corners() {
            let clip: Vec4 = *view_projection * corner.extend(1.0);
            if clip.w <= f32::EPSILON {
                behind += 1;
                continue;
            }
            let ndc = [clip.x / clip.w, clip.y / clip.w];
            for axis in 0..2 {
                lo[axis] = lo[axis].min(ndc[axis]);
                hi[axis] = hi[axis].max(ndc[axis]);
            }
        }

        if behind == 8 {
            return 0.0;
        }
        if behind > 0 {
            return 1.0;
        }

        let width = (hi[0].clamp(-1.0, 1.0) - lo[0].clamp(-1.0, 1.0)).max(0.0);
        let height = (hi[1].clamp(-1.0, 1.0) - lo[1].clamp(-1.0, 1.0)).max(0.0);
        (width * height) / 4.0
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Column-major 4x4 matrix in the flat form used by structure records
pub type MatrixArray = [f32; 16];

/// Convert a flat record matrix into a glam matrix
pub fn matrix_from_array(values: &MatrixArray) -> Mat4 {
    Mat4::from_cols_array(values)
}

/// Convert a glam matrix into the flat record form
pub fn matrix_to_array(matrix: &Mat4) -> MatrixArray {
    matrix.to_cols_array()
}
