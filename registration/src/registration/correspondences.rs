use rayon::prelude::*;

use cloudreg_core::{Error, Result};
use cloudreg_spatial::NearestNeighborSearch;

/// A putative match between a source and a target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub target: usize,
    pub source: usize,
    /// Squared feature-space distance at matching time.
    pub distance: f64,
}

/// Match every source feature to its nearest target feature.
///
/// # Arguments
///
/// * `target_features`, `source_features` - Descriptors, indexed like their clouds
/// * `target_index` - Nearest-neighbor index over `target_features`
/// * `source_index` - Index over `source_features`; required by the reciprocal check
/// * `reciprocal_check` - Keep a match only if the source feature is also the
///   nearest source feature of its target feature
/// * `num_threads` - Worker threads, 0 for the ambient pool
///
/// # Returns
///
/// Correspondences in ascending source order.
pub fn find_correspondences<const D: usize>(
    target_features: &[[f64; D]],
    source_features: &[[f64; D]],
    target_index: &dyn NearestNeighborSearch<D>,
    source_index: Option<&dyn NearestNeighborSearch<D>>,
    reciprocal_check: bool,
    num_threads: usize,
) -> Result<Vec<Correspondence>> {
    let all: Vec<usize> = (0..source_features.len()).collect();
    match_sources(
        &all,
        target_features,
        source_features,
        target_index,
        source_index,
        reciprocal_check,
        num_threads,
    )
}

/// [`find_correspondences`] restricted to the given source indices.
pub(crate) fn match_sources<const D: usize>(
    source_indices: &[usize],
    target_features: &[[f64; D]],
    source_features: &[[f64; D]],
    target_index: &dyn NearestNeighborSearch<D>,
    source_index: Option<&dyn NearestNeighborSearch<D>>,
    reciprocal_check: bool,
    num_threads: usize,
) -> Result<Vec<Correspondence>> {
    let reciprocal_index = match (reciprocal_check, source_index) {
        (false, _) => None,
        (true, Some(index)) => Some(index),
        (true, None) => return Err(Error::MissingAttribute("source feature index")),
    };

    let matches: Vec<Option<Correspondence>> = cloudreg_core::runtime::install(num_threads, || {
        source_indices
            .par_iter()
            .map(|&i| {
                let nn = target_index.nearest(&source_features[i])?;
                if let Some(index) = reciprocal_index {
                    let back = index.nearest(&target_features[nn.index])?;
                    if back.index != i {
                        return None;
                    }
                }
                Some(Correspondence {
                    target: nn.index,
                    source: i,
                    distance: nn.sq_dist,
                })
            })
            .collect()
    });

    let correspondences: Vec<Correspondence> = matches.into_iter().flatten().collect();
    tracing::debug!(
        num_queries = source_indices.len(),
        num_correspondences = correspondences.len(),
        reciprocal_check,
        "matched features"
    );
    Ok(correspondences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudreg_spatial::KdTree;

    #[test]
    fn test_reciprocal_check_filters_many_to_one() {
        let target = vec![[0.0, 0.0], [10.0, 0.0]];
        let source = vec![[0.1, 0.0], [0.2, 0.0], [9.0, 0.0]];
        let target_tree = KdTree::new(target.clone());
        let source_tree = KdTree::new(source.clone());

        let plain = find_correspondences(&target, &source, &target_tree, None, false, 1).unwrap();
        assert_eq!(plain.len(), 3);
        assert_eq!(plain[1].target, 0);

        let mutual =
            find_correspondences(&target, &source, &target_tree, Some(&source_tree), true, 1).unwrap();
        let pairs: Vec<_> = mutual.iter().map(|c| (c.source, c.target)).collect();
        assert_eq!(pairs, vec![(0, 0), (2, 1)]);
        assert!((mutual[1].distance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reciprocal_without_source_index() {
        let target = vec![[0.0; 3]];
        let tree = KdTree::new(target.clone());
        let err = find_correspondences(&target, &target, &tree, None, true, 1).unwrap_err();
        assert!(matches!(err, Error::MissingAttribute(_)));
    }

    #[test]
    fn test_empty_target() {
        let tree = KdTree::<3>::new(Vec::new());
        let result = find_correspondences(&[], &[[1.0; 3]], &tree, None, false, 1).unwrap();
        assert!(result.is_empty());
    }
}
