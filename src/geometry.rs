//! AABBs, planes and view frustums used by the tile selector.

use glam::{DMat3, DMat4, DVec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb3 {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb3 {
    pub fn from_point(p: DVec3) -> Self {
        Self { min: p, max: p }
    }

    pub fn add(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn bounding(points: &[DVec3]) -> Self {
        let mut it = points.iter();
        let first = *it.next().expect("bounding() needs at least one point");
        let mut bb = Self::from_point(first);
        for &p in it {
            bb.add(p);
        }
        bb
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> DVec3 {
        (self.max - self.min) * 0.5
    }

    pub fn intersects(&self, other: &Aabb3) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Squared distance from `v` to the closest point of the box (0 if inside).
    pub fn dist_sq(&self, v: DVec3) -> f64 {
        let clamped = v.clamp(self.min, self.max);
        (clamped - v).length_squared()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub n: DVec3,
    pub d: f64,
}

impl Plane {
    /// Signed-distance (Cobb/Gribb) classification against an AABB:
    /// `1` if entirely in front of the plane, `-1` if entirely behind, `0` if it straddles.
    pub fn classify(&self, box_: &Aabb3) -> i32 {
        let c = box_.center();
        let e = box_.extent();
        let r = (e.x * self.n.x).abs() + (e.y * self.n.y).abs() + (e.z * self.n.z).abs();
        let s = self.n.dot(c) - self.d;
        if s > r {
            1
        } else if s < -r {
            -1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

pub const PLANE_LEFT: usize = 0;
pub const PLANE_RIGHT: usize = 1;
pub const PLANE_DOWN: usize = 2;
pub const PLANE_UP: usize = 3;
pub const PLANE_NEAR: usize = 4;
pub const PLANE_FAR: usize = 5;

/// Gribb-Hartmann plane extraction from a view-projection matrix.
pub fn camera_frustum(m: DMat4) -> Frustum {
    let r0 = DVec3::new(m.x_axis.x, m.y_axis.x, m.z_axis.x);
    let r1 = DVec3::new(m.x_axis.y, m.y_axis.y, m.z_axis.y);
    let r2 = DVec3::new(m.x_axis.z, m.y_axis.z, m.z_axis.z);
    let r3 = DVec3::new(m.x_axis.w, m.y_axis.w, m.z_axis.w);
    let w0 = m.w_axis.x;
    let w1 = m.w_axis.y;
    let w2 = m.w_axis.z;
    let w3 = m.w_axis.w;

    let mut make = |n: DVec3, d: f64| -> Plane {
        let r = 1.0 / n.length();
        Plane {
            n: -n * r,
            d: d * r,
        }
    };

    let planes = [
        make(r3 + r0, w3 + w0), // left
        make(r3 - r0, w3 - w0), // right
        make(r3 + r1, w3 + w1), // down
        make(r3 - r1, w3 - w1), // up
        make(r3 + r2, w3 + w2), // near
        make(r3 - r2, w3 - w2), // far
    ];
    Frustum { planes }
}

/// Bounding box of the frustum's 8 corners, by intersecting triples of planes.
pub fn frustum_aabb(frust: &Frustum) -> Aabb3 {
    let solve = |a: &Plane, b: &Plane, c: &Plane| -> DVec3 {
        let m = DMat3::from_cols(a.n, b.n, c.n).transpose();
        let rhs = DVec3::new(a.d, b.d, c.d);
        m.inverse() * rhs
    };

    let far = &frust.planes[PLANE_FAR];
    let near = &frust.planes[PLANE_NEAR];

    let corners_far = [
        solve(
            &frust.planes[PLANE_LEFT],
            &frust.planes[PLANE_DOWN],
            far,
        ),
        solve(
            &frust.planes[PLANE_RIGHT],
            &frust.planes[PLANE_DOWN],
            far,
        ),
        solve(&frust.planes[PLANE_LEFT], &frust.planes[PLANE_UP], far),
        solve(&frust.planes[PLANE_RIGHT], &frust.planes[PLANE_UP], far),
    ];

    let back = far.n * (far.d + near.d);
    let corners_near: Vec<DVec3> = corners_far.iter().map(|&p| p - back).collect();

    let mut pts = corners_far.to_vec();
    pts.extend(corners_near);
    Aabb3::bounding(&pts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_center_box_straddles_origin_plane() {
        let plane = Plane {
            n: DVec3::X,
            d: 0.0,
        };
        let box_ = Aabb3 {
            min: DVec3::new(-1.0, -1.0, -1.0),
            max: DVec3::new(1.0, 1.0, 1.0),
        };
        assert_eq!(plane.classify(&box_), 0);
    }

    #[test]
    fn classify_box_entirely_in_front() {
        let plane = Plane {
            n: DVec3::X,
            d: 0.0,
        };
        let box_ = Aabb3 {
            min: DVec3::new(5.0, -1.0, -1.0),
            max: DVec3::new(6.0, 1.0, 1.0),
        };
        assert_eq!(plane.classify(&box_), 1);
    }

    #[test]
    fn classify_box_entirely_behind() {
        let plane = Plane {
            n: DVec3::X,
            d: 0.0,
        };
        let box_ = Aabb3 {
            min: DVec3::new(-6.0, -1.0, -1.0),
            max: DVec3::new(-5.0, 1.0, 1.0),
        };
        assert_eq!(plane.classify(&box_), -1);
    }

    #[test]
    fn dist_sq_zero_when_inside() {
        let box_ = Aabb3 {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        };
        assert_eq!(box_.dist_sq(DVec3::new(0.5, 0.5, 0.5)), 0.0);
    }

    #[test]
    fn bounding_covers_all_points() {
        let pts = [
            DVec3::new(1.0, -2.0, 3.0),
            DVec3::new(-1.0, 5.0, -3.0),
            DVec3::new(0.0, 0.0, 0.0),
        ];
        let bb = Aabb3::bounding(&pts);
        for p in pts {
            assert!(bb.dist_sq(p) < 1e-12);
        }
    }
}
