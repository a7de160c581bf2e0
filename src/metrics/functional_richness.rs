//! FRic: convex-hull volume in 3-D trait space
//!
//! The hull itself comes from parry. Before building it the point set is
//! checked for degeneracy (fewer than 4 distinct points, all collinear or
//! all coplanar), which leaves FRic undefined for that community.

use crate::errors::GeometryError;
use parry3d_f64::math::Point;
use parry3d_f64::na::Vector3;
use parry3d_f64::transformation::try_convex_hull;

/// Relative tolerance for the collinear/coplanar checks.
const DEGENERACY_TOL: f64 = 1e-9;

fn to_vector(p: &[f64; 3]) -> Vector3<f64> {
    Vector3::new(p[0], p[1], p[2])
}

/// Drop exact duplicates, keeping first occurrence.
fn distinct(points: &[[f64; 3]]) -> Vec<[f64; 3]> {
    let mut out: Vec<[f64; 3]> = Vec::with_capacity(points.len());
    for p in points {
        if !out.contains(p) {
            out.push(*p);
        }
    }
    out
}

/// Fail unless the points span three dimensions.
///
/// Picks a far point from the first, then the point farthest from that
/// line, then the point farthest from that plane; each distance must clear
/// a tolerance scaled by the extent of the cloud.
fn check_full_rank(points: &[[f64; 3]]) -> Result<(), GeometryError> {
    let origin = to_vector(&points[0]);
    let offsets: Vec<Vector3<f64>> = points.iter().map(|p| to_vector(p) - origin).collect();

    let (axis, extent) = offsets
        .iter()
        .map(|v| (*v, v.norm()))
        .fold((Vector3::zeros(), 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });
    if extent == 0.0 || !extent.is_finite() {
        return Err(GeometryError::TooFewPoints { needed: 4, found: 1 });
    }
    let tol = DEGENERACY_TOL * extent;
    let axis = axis / extent;

    let (off_line, line_dist) = offsets
        .iter()
        .map(|v| {
            let perp = v - axis * v.dot(&axis);
            (perp, perp.norm())
        })
        .fold((Vector3::zeros(), 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });
    if line_dist <= tol {
        return Err(GeometryError::Coplanar);
    }

    let normal = axis.cross(&(off_line / line_dist));
    let plane_dist = offsets
        .iter()
        .map(|v| v.dot(&normal).abs())
        .fold(0.0, f64::max);
    if plane_dist <= tol {
        return Err(GeometryError::Coplanar);
    }
    Ok(())
}

/// Volume of the convex hull of `points`.
pub fn convex_hull_volume(points: &[[f64; 3]]) -> Result<f64, GeometryError> {
    let unique = distinct(points);
    if unique.len() < 4 {
        return Err(GeometryError::TooFewPoints { needed: 4, found: unique.len() });
    }
    check_full_rank(&unique)?;

    let cloud: Vec<Point<f64>> = unique.iter().map(|p| Point::new(p[0], p[1], p[2])).collect();
    let (vertices, faces) = try_convex_hull(&cloud).map_err(|_| GeometryError::HullFailed)?;
    if vertices.len() < 4 || faces.is_empty() {
        return Err(GeometryError::HullFailed);
    }

    // Sum of signed tetrahedra from the vertex centroid to each face
    let centroid = vertices.iter().fold(Vector3::zeros(), |acc, v| acc + v.coords) / vertices.len() as f64;
    let six_volume: f64 = faces
        .iter()
        .map(|[a, b, c]| {
            let a = vertices[*a as usize].coords - centroid;
            let b = vertices[*b as usize].coords - centroid;
            let c = vertices[*c as usize].coords - centroid;
            a.dot(&b.cross(&c))
        })
        .sum();

    let volume = six_volume.abs() / 6.0;
    if volume.is_finite() && volume > 0.0 {
        Ok(volume)
    } else {
        Err(GeometryError::HullFailed)
    }
}
