//! Tile selector: a recursive per-cube-face quadtree traversal that picks the
//! set of tiles a camera needs this frame, ordered by screen error and
//! truncated to a hard tile-count budget.
//!
//! Each candidate tile's world-space AABB is built from five (or, at the
//! cube-face root, nine) elevation-sampled corner/edge points, then inflated
//! by the min/max tree's conservative bound for that tile's whole subtree —
//! so a coarse ancestor's box is never tighter than what its still-unloaded
//! descendants could contain.

use glam::DVec3;
use rayon::prelude::*;

use crate::config::{CUBE_FACES, MAX_TILES, MAX_ZOOM};
use crate::data_source::DataSource;
use crate::geometry::{frustum_aabb, Aabb3, Frustum, PLANE_FAR};
use crate::minmax_tree::MinMaxTree;
use crate::morton::morton_u64_to_rect_f64;
use crate::projection::cube_to_globe;
use crate::tile_code::{TileCode, QUADRANTS};

/// Scales a tile's distance-squared before comparing against its screen
/// area, making the error metric behave like `area / (scale * dist)^2`
/// rather than a raw, very large `area / dist^2` ratio.
const TILE_SCALE_FACTOR: f64 = 32.0;
const MIN_DIST_SQ: f64 = 1e-6;

/// Solid-angle-ish screen factor of a tile at `zoom`: one sixth of the unit
/// sphere's solid angle (`4*pi/6`), halved at each successive zoom level.
fn tile_factor(zoom: u8) -> f64 {
    (4.0 * std::f64::consts::PI / 6.0) * 4f64.powi(-(zoom as i32))
}

/// World-space AABB for `code`, elevation-sampled at its corners (plus
/// mid-edges at the cube-face root) and inflated by the subtree's min/max
/// bound from `tree`.
pub fn tile_box(source: &dyn DataSource, tree: &MinMaxTree, code: TileCode) -> Aabb3 {
    let rect = morton_u64_to_rect_f64(code.idx, code.zoom);
    let mut uvs = vec![rect.ll(), rect.lr(), rect.ul(), rect.ur(), rect.mid()];
    if code.zoom == 0 {
        uvs.push((rect.ll() + rect.lr()) * 0.5);
        uvs.push((rect.lr() + rect.ur()) * 0.5);
        uvs.push((rect.ur() + rect.ul()) * 0.5);
        uvs.push((rect.ul() + rect.ll()) * 0.5);
    }

    let bounds = tree.minmax(code);
    let mut points = Vec::with_capacity(uvs.len() * 3);
    for uv in uvs {
        let dir = cube_to_globe(code.face, uv);
        let elev = source.sample(uv, code.face) as f64;
        points.push((1.0 + elev) * dir);
        points.push((1.0 + bounds.min as f64) * dir);
        points.push((1.0 + bounds.max as f64) * dir);
    }
    Aabb3::bounding(&points)
}

/// Recursive quadtree descent for one node. Returns `true` if `code` or one
/// of its descendants was emitted into `out`.
fn select_rec(
    source: &dyn DataSource,
    tree: &MinMaxTree,
    frustum: &Frustum,
    frustum_box: &Aabb3,
    origin: DVec3,
    resolution: f64,
    code: TileCode,
    out: &mut Vec<(TileCode, f64)>,
) -> bool {
    if code.zoom > MAX_ZOOM {
        return false;
    }

    let box_ = tile_box(source, tree, code);
    if !box_.intersects(frustum_box) {
        return false;
    }
    if frustum.planes.iter().any(|p| p.classify(&box_) < 0) {
        return false;
    }

    let dist_sq = box_.dist_sq(origin);
    let d_min_sq = (TILE_SCALE_FACTOR * dist_sq).max(MIN_DIST_SQ);
    let area = tile_factor(code.zoom);

    if area / d_min_sq < resolution {
        out.push((code, dist_sq));
        return true;
    }

    let mut any_child_emitted = false;
    for q in QUADRANTS {
        let child = code.refine(q);
        if select_rec(source, tree, frustum, frustum_box, origin, resolution, child, out) {
            any_child_emitted = true;
        }
    }

    if !any_child_emitted {
        out.push((code, dist_sq));
    }
    true
}

/// Select tiles for all six cube faces in parallel, unsorted and
/// untruncated — mirrors the shape of the original's per-face traversal,
/// where sorting and the `MAX_TILES` cutoff happen at the call site.
pub fn select(
    source: &dyn DataSource,
    tree: &MinMaxTree,
    frustum: &Frustum,
    origin: DVec3,
    resolution: f64,
) -> Vec<(TileCode, f64)> {
    let frustum_box = frustum_aabb(frustum);
    (0..CUBE_FACES)
        .into_par_iter()
        .map(|face| {
            let mut out = Vec::new();
            select_rec(
                source,
                tree,
                frustum,
                &frustum_box,
                origin,
                resolution,
                TileCode::new(face, 0, 0),
                &mut out,
            );
            out
        })
        .flatten()
        .collect()
}

/// Pushes the frustum's far plane out to the planet's horizon, so tiles just
/// beyond the geometric horizon (but still visible along a grazing ray) are
/// not culled by an unadjusted far plane sized for a flat scene.
pub fn apply_horizon_clip(frustum: &mut Frustum, camera_pos: DVec3, source: &dyn DataSource) {
    let r_min = 1.0 + source.min() as f64;
    let r_max = 1.0 + source.max() as f64;
    let r_horizon = (camera_pos.dot(camera_pos) - r_min * r_min).max(0.0).sqrt();
    let r_horizon_max = (r_max * r_max - r_min * r_min).max(0.0).sqrt();

    let far = &mut frustum.planes[PLANE_FAR];
    far.d = far.n.dot(camera_pos) + r_horizon + r_horizon_max;
}

/// Convenience entry point: apply the horizon clip, run [`select`], sort by
/// ascending distance, and truncate to `MAX_TILES`. Nothing else needs the
/// untruncated, unsorted list, so this is the call most callers want.
pub fn select_and_truncate(
    source: &dyn DataSource,
    tree: &MinMaxTree,
    frustum: &mut Frustum,
    camera_pos: DVec3,
    resolution: f64,
) -> Vec<TileCode> {
    apply_horizon_clip(frustum, camera_pos, source);
    let mut tiles = select(source, tree, frustum, camera_pos, resolution);
    tiles.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    tiles.truncate(MAX_TILES);
    tiles.into_iter().map(|(code, _)| code).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::SyntheticDataSource;
    use crate::geometry::camera_frustum;
    use crate::minmax_tree::MinMax;
    use glam::{DMat4, DVec3};

    fn looking_at_origin(distance: f64) -> (DVec3, Frustum) {
        let eye = DVec3::new(0.0, 0.0, distance);
        let view = DMat4::look_at_rh(eye, DVec3::ZERO, DVec3::Y);
        let proj = DMat4::perspective_rh(1.0, 1.0, 0.01, distance * 4.0);
        (eye, camera_frustum(proj * view))
    }

    #[test]
    fn tile_box_contains_face_center_direction() {
        let source = SyntheticDataSource::new(1);
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let code = TileCode::new(2, 0, 0);
        let box_ = tile_box(&source, &tree, code);
        let center_dir = cube_to_globe(2, glam::dvec2(0.5, 0.5));
        assert!(box_.dist_sq(center_dir) < 0.1);
    }

    #[test]
    fn select_emits_at_least_one_tile_when_camera_faces_planet() {
        let source = SyntheticDataSource::new(1);
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let (eye, frustum) = looking_at_origin(5.0);
        let tiles = select(&source, &tree, &frustum, eye, 1e-4);
        assert!(!tiles.is_empty(), "camera facing the planet should see tiles");
    }

    #[test]
    fn select_returns_nothing_when_frustum_faces_away() {
        let source = SyntheticDataSource::new(1);
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let eye = DVec3::new(0.0, 0.0, 5.0);
        let view = DMat4::look_at_rh(eye, DVec3::new(0.0, 0.0, 10.0), DVec3::Y);
        let proj = DMat4::perspective_rh(1.0, 1.0, 0.01, 20.0);
        let frustum = camera_frustum(proj * view);
        let tiles = select(&source, &tree, &frustum, eye, 1e-4);
        assert!(tiles.is_empty(), "camera facing away from the planet should see nothing");
    }

    #[test]
    fn coarser_resolution_threshold_selects_fewer_or_equal_tiles() {
        let source = SyntheticDataSource::new(1);
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let (eye, frustum) = looking_at_origin(5.0);
        let fine = select(&source, &tree, &frustum, eye, 1e-6).len();
        let coarse = select(&source, &tree, &frustum, eye, 1e-2).len();
        assert!(coarse <= fine);
    }

    #[test]
    fn select_and_truncate_never_exceeds_max_tiles() {
        let source = SyntheticDataSource::new(1);
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let (eye, mut frustum) = looking_at_origin(2.0);
        let tiles = select_and_truncate(&source, &tree, &mut frustum, eye, 1e-8);
        assert!(tiles.len() <= MAX_TILES);
    }

    #[test]
    fn horizon_clip_pushes_far_plane_outward_for_distant_camera() {
        let source = SyntheticDataSource::new(1);
        let (eye, mut frustum) = looking_at_origin(10.0);
        let before = frustum.planes[PLANE_FAR].d;
        apply_horizon_clip(&mut frustum, eye, &source);
        assert!(frustum.planes[PLANE_FAR].d >= before - 1e-9);
    }
}
