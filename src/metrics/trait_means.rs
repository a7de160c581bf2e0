//! Community-weighted trait means (unweighted over present species)

use crate::data::{TraitTable, N_TRAITS};

/// Mean of each trait over the given species; `None` for an empty community.
pub fn community_trait_means(present: &[usize], traits: &TraitTable) -> Option<[f64; N_TRAITS]> {
    if present.is_empty() {
        return None;
    }
    let mut sums = [0.0; N_TRAITS];
    for &k in present {
        for (t, value) in traits.point(k).iter().enumerate() {
            sums[t] += value;
        }
    }
    let n = present.len() as f64;
    Some(sums.map(|s| s / n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_means_over_present_species() {
        let traits = TraitTable::new(
            vec!["a".into(), "b".into(), "c".into()],
            array![[1.0, 0.0, -1.0], [3.0, 2.0, -3.0], [100.0, 100.0, 100.0]],
        )
        .unwrap();

        let means = community_trait_means(&[0, 1], &traits).unwrap();
        assert_relative_eq!(means[0], 2.0);
        assert_relative_eq!(means[1], 1.0);
        assert_relative_eq!(means[2], -2.0);
        assert_eq!(community_trait_means(&[], &traits), None);
    }
}
