//! Cube-sphere projection: mapping a world-space direction to a `(face, uv)`
//! pair on one of six cube faces, and back.

use glam::DVec2;
use glam::DVec3;

/// Selects the cube face whose unit axis has the largest dot product with `v`.
/// Faces are `{+x,+y,+z,-x,-y,-z}` indexed `0..6`; ties favor the later face.
pub fn cube_face(v: DVec3) -> u8 {
    let c = [v.x, v.y, v.z, -v.x, -v.y, -v.z];
    let mut best = 0usize;
    let mut best_val = c[0];
    for (i, &val) in c.iter().enumerate().skip(1) {
        if val >= best_val {
            best_val = val;
            best = i;
        }
    }
    best as u8
}

/// Rotate a world-space vector into face-local `(right, up, forward)` axes.
pub fn world_to_face(v: DVec3, face: u8) -> DVec3 {
    match face {
        0 => DVec3::new(v.y, v.z, v.x),
        1 => DVec3::new(-v.x, v.z, v.y),
        2 => DVec3::new(v.y, -v.x, v.z),
        3 => DVec3::new(v.y, -v.z, -v.x),
        4 => DVec3::new(v.x, v.z, -v.y),
        5 => DVec3::new(v.y, v.x, -v.z),
        _ => unreachable!("face index out of range: {face}"),
    }
}

/// Inverse of [`world_to_face`].
pub fn face_to_world(v: DVec3, face: u8) -> DVec3 {
    match face {
        0 => DVec3::new(v.z, v.x, v.y),
        1 => DVec3::new(-v.x, v.z, v.y),
        2 => DVec3::new(-v.y, v.x, v.z),
        3 => DVec3::new(-v.z, v.x, -v.y),
        4 => DVec3::new(v.x, -v.z, v.y),
        5 => DVec3::new(v.y, v.x, -v.z),
        _ => unreachable!("face index out of range: {face}"),
    }
}

/// Gnomonic projection of a face-local-frame point onto the face's `[0,1]²` rectangle.
pub fn gnomic_proj_cube_face(p: DVec3, face: u8) -> DVec2 {
    let p = world_to_face(p, face);
    let z = f64::copysign(p.z.abs().max(1e-14), p.z);
    let (x, y) = (p.x / z, p.y / z);
    DVec2::new(0.5 * (1.0 + x), 0.5 * (1.0 + y))
}

/// World-space direction (not necessarily unit) on the sphere → `(face, uv)`.
pub fn globe_to_cube(p: DVec3) -> (u8, DVec2) {
    let face = cube_face(p);
    let uv = gnomic_proj_cube_face(p, face);
    (face, uv)
}

/// `(face, uv)` on the unit cube face → unit-sphere direction.
pub fn cube_to_globe(face: u8, uv: DVec2) -> DVec3 {
    let c = DVec3::new(2.0 * uv.x - 1.0, 2.0 * uv.y - 1.0, 1.0);
    face_to_world(c, face).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_to_globe_globe_to_cube_roundtrip() {
        let dirs = [
            DVec3::new(1.0, 0.3, -0.2),
            DVec3::new(-0.5, 1.0, 0.1),
            DVec3::new(0.2, -0.1, 1.0),
            DVec3::new(-1.0, -0.4, 0.6),
            DVec3::new(0.1, -1.0, 0.3),
            DVec3::new(0.4, 0.2, -1.0),
        ];
        for d in dirs {
            let n = d.normalize();
            let (face, uv) = globe_to_cube(n);
            let back = cube_to_globe(face, uv);
            assert!(
                (back - n).length() < 1e-9,
                "face={face} uv={uv:?} back={back:?} n={n:?}"
            );
        }
    }

    #[test]
    fn face_to_world_inverts_world_to_face() {
        let v = DVec3::new(0.2, -0.7, 0.5);
        for face in 0u8..6 {
            let f = world_to_face(v, face);
            let back = face_to_world(f, face);
            assert!((back - v).length() < 1e-12, "face={face}");
        }
    }

    #[test]
    fn cube_face_picks_dominant_axis() {
        assert_eq!(cube_face(DVec3::new(1.0, 0.0, 0.0)), 0);
        assert_eq!(cube_face(DVec3::new(0.0, 1.0, 0.0)), 1);
        assert_eq!(cube_face(DVec3::new(0.0, 0.0, 1.0)), 2);
        assert_eq!(cube_face(DVec3::new(-1.0, 0.0, 0.0)), 3);
        assert_eq!(cube_face(DVec3::new(0.0, -1.0, 0.0)), 4);
        assert_eq!(cube_face(DVec3::new(0.0, 0.0, -1.0)), 5);
    }
}
