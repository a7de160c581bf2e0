//! mnnd: mean nearest-neighbour distance in trait space

use crate::errors::GeometryError;

fn euclidean(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Mean over species of the distance to the nearest co-occurring species.
///
/// Distances of zero (identical trait vectors) are not neighbours; a
/// community needs two distinct points.
pub fn mean_nearest_neighbour_distance(points: &[[f64; 3]]) -> Result<f64, GeometryError> {
    if points.len() < 2 {
        return Err(GeometryError::TooFewPoints { needed: 2, found: points.len() });
    }

    let mut total = 0.0;
    for (k, a) in points.iter().enumerate() {
        let nearest = points
            .iter()
            .enumerate()
            .filter(|(l, _)| *l != k)
            .map(|(_, b)| euclidean(a, b))
            .filter(|d| *d > 0.0)
            .fold(f64::INFINITY, f64::min);
        if !nearest.is_finite() {
            return Err(GeometryError::TooFewPoints { needed: 2, found: 1 });
        }
        total += nearest;
    }

    Ok(total / points.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_two_species_equals_distance() {
        let points = [[0.0, 0.0, 0.0], [1.0, 2.0, 2.0]];
        assert_relative_eq!(mean_nearest_neighbour_distance(&points).unwrap(), 3.0);
    }

    #[test]
    fn test_mean_over_species() {
        // Nearest distances: 1, 1, 2
        let points = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [3.0, 0.0, 0.0]];
        assert_relative_eq!(mean_nearest_neighbour_distance(&points).unwrap(), 4.0 / 3.0);
    }

    #[test]
    fn test_duplicates_use_next_positive_distance() {
        let points = [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 4.0, 0.0]];
        assert_relative_eq!(mean_nearest_neighbour_distance(&points).unwrap(), 4.0);
    }

    #[test]
    fn test_undefined_cases() {
        assert!(mean_nearest_neighbour_distance(&[[1.0, 1.0, 1.0]]).is_err());
        assert!(mean_nearest_neighbour_distance(&[[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]).is_err());
    }
}
