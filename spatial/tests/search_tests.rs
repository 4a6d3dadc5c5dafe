use cloudreg_spatial::{
    batch_knn_search, brute_force_knn, KdTree, LshParams, MultiProbeLsh, NearestNeighborSearch,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_points<const D: usize>(rng: &mut StdRng, n: usize, extent: f64) -> Vec<[f64; D]> {
    (0..n)
        .map(|_| std::array::from_fn(|_| rng.gen_range(-extent..extent)))
        .collect()
}

#[test]
fn test_kdtree_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(42);
    let points = random_points::<3>(&mut rng, 1000, 10.0);
    let tree = KdTree::new(points.clone());

    for _ in 0..200 {
        let query: [f64; 3] = std::array::from_fn(|_| rng.gen_range(-12.0..12.0));
        for k in [1, 5, 17] {
            let result = tree.knn_search(&query, k);
            let expected = brute_force_knn(&points, &query, k);
            assert_eq!(result, expected);
        }
    }
}

#[test]
fn test_kdtree_knn_properties() {
    let mut rng = StdRng::seed_from_u64(3);
    let points = random_points::<3>(&mut rng, 500, 5.0);
    let tree = KdTree::new(points.clone());

    let query = [0.5, -0.25, 1.0];
    let small = tree.knn_search(&query, 5);
    let large = tree.knn_search(&query, 20);

    assert_eq!(small.len(), 5);
    assert_eq!(large.len(), 20);
    assert!(large.windows(2).all(|w| w[0].sq_dist <= w[1].sq_dist));
    assert_eq!(&large[..5], &small[..]);
}

#[test]
fn test_kdtree_radius_search_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(9);
    let points = random_points::<3>(&mut rng, 800, 4.0);
    let tree = KdTree::new(points.clone());

    let query = [0.0, 1.0, -1.0];
    let radius = 1.5;
    let mut found: Vec<usize> = tree.radius_search(&query, radius).iter().map(|n| n.index).collect();
    found.sort();

    let expected: Vec<usize> = brute_force_knn(&points, &query, points.len())
        .into_iter()
        .filter(|n| n.sq_dist <= radius * radius)
        .map(|n| n.index)
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(found, expected);
}

#[test]
fn test_kdtree_high_dimensional() {
    let mut rng = StdRng::seed_from_u64(11);
    let points = random_points::<33>(&mut rng, 400, 1.0);
    let tree = KdTree::new(points.clone());
    for i in (0..400).step_by(37) {
        let result = tree.knn_search(&points[i], 3);
        assert_eq!(result, brute_force_knn(&points, &points[i], 3));
        assert_eq!(result[0].index, i);
    }
}

#[test]
fn test_lsh_recall_on_near_duplicates() {
    let mut rng = StdRng::seed_from_u64(1234);
    let features: Vec<[f64; 33]> = (0..2000)
        .map(|_| std::array::from_fn(|_| rng.gen_range(0.0..1.0)))
        .collect();
    let lsh = MultiProbeLsh::create_tables(&features, &LshParams::default(), &mut rng).unwrap();

    let num_queries = 200;
    let mut hits = 0;
    for i in 0..num_queries {
        let target = i * 10;
        let query: [f64; 33] =
            std::array::from_fn(|d| features[target][d] + rng.gen_range(-0.01..0.01));
        let exact = brute_force_knn(&features, &query, 1);
        let approx = lsh.knn_search(&query, 1);
        if approx.first().map(|n| n.index) == Some(exact[0].index) {
            hits += 1;
        }
    }

    let recall = hits as f64 / num_queries as f64;
    assert!(recall >= 0.9, "recall {recall} below 0.9");
}

#[test]
fn test_lsh_is_reproducible_for_seed() {
    let mut rng = StdRng::seed_from_u64(5);
    let features = random_points::<16>(&mut rng, 500, 1.0);
    let query = features[17];

    let params = LshParams {
        num_threads: 3,
        ..LshParams::default()
    };
    let a = MultiProbeLsh::create_tables(&features, &params, &mut StdRng::seed_from_u64(99)).unwrap();
    let b = MultiProbeLsh::create_tables(&features, &LshParams::default(), &mut StdRng::seed_from_u64(99))
        .unwrap();
    assert_eq!(a.knn_search(&query, 10), b.knn_search(&query, 10));
}

#[test]
fn test_batch_search_through_trait_object() {
    let mut rng = StdRng::seed_from_u64(21);
    let points = random_points::<3>(&mut rng, 300, 2.0);
    let tree = KdTree::new(points.clone());
    let index: &dyn NearestNeighborSearch<3> = &tree;

    let results = batch_knn_search(index, &points[..50], 4, 2);
    assert_eq!(results.len(), 50);
    for (i, neighbors) in results.iter().enumerate() {
        assert_eq!(neighbors.len(), 4);
        assert_eq!(neighbors[0].index, i);
    }
}
