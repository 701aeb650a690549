//! Cosine-similarity nearest neighbors.
//!
//! [`SimilaritySearch`] is a full linear scan: every query reads every
//! embedded vector, O(R·D). That is fine for a few thousand records. A
//! different index can be put behind [`VectorSource`] or in place of
//! `SimilaritySearch` without changing callers.

use crate::error::{EmbedStoreError, Result};
use crate::store::Store;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Something that can hand out stored vectors.
pub trait VectorSource {
    /// Every embedded `(id, vector)` pair.
    fn fetch_all(&self) -> Result<Vec<(i64, Vec<f32>)>>;

    /// The vector for one id, if embedded.
    fn vector(&self, id: i64) -> Result<Option<Vec<f32>>>;

    /// Established dimension, if any.
    fn dimension(&self) -> Result<Option<usize>>;
}

impl VectorSource for Store {
    fn fetch_all(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        Self::fetch_all(self)
    }

    fn vector(&self, id: i64) -> Result<Option<Vec<f32>>> {
        Self::vector(self, id)
    }

    fn dimension(&self) -> Result<Option<usize>> {
        Self::dimension(self)
    }
}

/// One ranked match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    /// Record id.
    pub id: i64,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Cosine similarity of two equal-length vectors.
///
/// Returns 0 when either norm is zero or the result is not finite. Callers
/// check lengths; extra elements of the longer slice are ignored.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Descending score, then ascending id.
fn rank(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.score.total_cmp(&a.score).then(a.id.cmp(&b.id))
}

/// Every stored vector must have length `dim`.
fn check_stored(all: &[(i64, Vec<f32>)], dim: usize) -> Result<()> {
    match all.iter().find(|(_, v)| v.len() != dim) {
        Some((id, v)) => Err(EmbedStoreError::DimensionMismatch {
            id: Some(*id),
            expected: dim,
            actual: v.len(),
        }),
        None => Ok(()),
    }
}

/// The `n` best candidates for `query`, skipping `exclude_ids`.
fn rank_against(
    query: &[f32],
    all: &[(i64, Vec<f32>)],
    n: usize,
    exclude_ids: &HashSet<i64>,
) -> Vec<Neighbor> {
    let mut scored: Vec<Neighbor> = all
        .iter()
        .filter(|(id, _)| !exclude_ids.contains(id))
        .map(|(id, vector)| Neighbor {
            id: *id,
            score: cosine_similarity(query, vector),
        })
        .collect();
    scored.sort_by(rank);
    scored.truncate(n);
    scored
}

/// All vectors of `source` with the dimension they must share.
fn load_checked<S: VectorSource>(source: &S) -> Result<(Vec<(i64, Vec<f32>)>, usize)> {
    let all = source.fetch_all()?;
    let Some((_, first)) = all.first() else {
        return Err(EmbedStoreError::EmptyStore);
    };
    let dim = source.dimension()?.unwrap_or(first.len());
    check_stored(&all, dim)?;
    Ok((all, dim))
}

/// Linear-scan nearest-neighbor search over a [`VectorSource`].
#[derive(Debug)]
pub struct SimilaritySearch<'a, S: VectorSource> {
    /// Where vectors come from.
    source: &'a S,
}

impl<'a, S: VectorSource> SimilaritySearch<'a, S> {
    /// Search over `source`.
    pub const fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// The `n` stored vectors most similar to `query`, skipping
    /// `exclude_ids`. Ties go to the smaller id.
    pub fn top_n(
        &self,
        query: &[f32],
        n: usize,
        exclude_ids: &HashSet<i64>,
    ) -> Result<Vec<Neighbor>> {
        let (all, dim) = load_checked(self.source)?;
        if query.len() != dim {
            return Err(EmbedStoreError::DimensionMismatch {
                id: None,
                expected: dim,
                actual: query.len(),
            });
        }

        let scored = rank_against(query, &all, n, exclude_ids);

        debug!(
            candidates = all.len(),
            returned = scored.len(),
            "similarity scan"
        );
        Ok(scored)
    }

    /// Neighbors of a stored record, never including the record itself.
    pub fn top_n_for_existing(&self, target_id: i64, n: usize) -> Result<Vec<Neighbor>> {
        let query = self
            .source
            .vector(target_id)?
            .ok_or(EmbedStoreError::NotFound(target_id))?;
        self.top_n(&query, n, &HashSet::from([target_id]))
    }
}

/// The `n` nearest neighbors of every vector in `source`, by id.
pub fn neighbor_lists<S: VectorSource>(source: &S, n: usize) -> Result<BTreeMap<i64, Vec<i64>>> {
    let (all, _) = load_checked(source)?;
    Ok(all
        .iter()
        .map(|(id, vector)| {
            let ids = rank_against(vector, &all, n, &HashSet::from([*id]))
                .into_iter()
                .map(|nb| nb.id)
                .collect();
            (*id, ids)
        })
        .collect())
}

/// Recompute and cache the `n` nearest neighbors of every embedded record.
///
/// Vectors are read once and all lists are written in one transaction.
pub fn refresh_neighbor_cache(store: &Store, n: usize) -> Result<usize> {
    let lists = neighbor_lists(store, n)?;
    let written = store.write_neighbor_lists(&lists)?;
    info!(records = written, n, "refreshed neighbor cache");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;

    /// In-memory source for tests.
    struct Fixed(Vec<(i64, Vec<f32>)>);

    impl VectorSource for Fixed {
        fn fetch_all(&self) -> Result<Vec<(i64, Vec<f32>)>> {
            Ok(self.0.clone())
        }

        fn vector(&self, id: i64) -> Result<Option<Vec<f32>>> {
            Ok(self.0.iter().find(|(i, _)| *i == id).map(|(_, v)| v.clone()))
        }

        fn dimension(&self) -> Result<Option<usize>> {
            Ok(self.0.first().map(|(_, v)| v.len()))
        }
    }

    fn sample() -> Fixed {
        Fixed(vec![
            (1, vec![1.0, 0.0]),
            (2, vec![0.0, 1.0]),
            (3, vec![0.9, 0.1]),
        ])
    }

    #[test]
    fn test_cosine_basics() {
        let v = [0.3, -1.2, 4.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&v, &[0.0, 0.0, 0.0]).abs() < f32::EPSILON);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_top_n_scenario() {
        let source = sample();
        let search = SimilaritySearch::new(&source);
        let result = search.top_n(&[1.0, 0.0], 2, &HashSet::new()).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, 1);
        assert!((result[0].score - 1.0).abs() < 1e-6);
        assert_eq!(result[1].id, 3);
        assert!((result[1].score - 0.9939).abs() < 1e-3);
    }

    #[test]
    fn test_result_length_and_order() {
        let source = sample();
        let search = SimilaritySearch::new(&source);

        let all = search.top_n(&[0.5, 0.5], 10, &HashSet::new()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));

        let excluded = search
            .top_n(&[0.5, 0.5], 10, &HashSet::from([1, 2]))
            .unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].id, 3);

        assert!(search.top_n(&[0.5, 0.5], 0, &HashSet::new()).unwrap().is_empty());
    }

    #[test]
    fn test_ties_broken_by_id() {
        let source = Fixed(vec![
            (5, vec![1.0, 1.0]),
            (2, vec![2.0, 2.0]),
            (9, vec![3.0, 3.0]),
        ]);
        let search = SimilaritySearch::new(&source);
        let ids: Vec<i64> = search
            .top_n(&[1.0, 1.0], 3, &HashSet::new())
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_existing_excludes_self() {
        let source = sample();
        let search = SimilaritySearch::new(&source);
        let result = search.top_n_for_existing(1, 5).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|n| n.id != 1));
        assert_eq!(result[0].id, 3);
    }

    #[test]
    fn test_errors() {
        let empty = Fixed(Vec::new());
        assert!(matches!(
            SimilaritySearch::new(&empty).top_n(&[1.0], 3, &HashSet::new()),
            Err(EmbedStoreError::EmptyStore)
        ));

        let source = sample();
        let search = SimilaritySearch::new(&source);
        assert!(matches!(
            search.top_n(&[1.0, 0.0, 0.0], 3, &HashSet::new()),
            Err(EmbedStoreError::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            })
        ));
        assert!(matches!(
            search.top_n_for_existing(42, 3),
            Err(EmbedStoreError::NotFound(42))
        ));
    }

    #[test]
    fn test_refresh_neighbor_cache() {
        let table = TableConfig {
            neighbors_column: Some("related".into()),
            ..TableConfig::default()
        };
        let store = Store::open_in_memory(table).unwrap();
        for id in 1..=4 {
            store.insert_record(id, &["x"]).unwrap();
        }
        store
            .write_vectors(&BTreeMap::from([
                (1, vec![1.0, 0.0]),
                (2, vec![0.0, 1.0]),
                (3, vec![0.9, 0.1]),
            ]))
            .unwrap();

        assert_eq!(refresh_neighbor_cache(&store, 1).unwrap(), 3);
        assert_eq!(store.neighbors(1).unwrap(), Some(vec![3]));
        assert_eq!(store.neighbors(3).unwrap(), Some(vec![1]));
        assert_eq!(store.neighbors(4).unwrap(), None);

        let search = SimilaritySearch::new(&store);
        let live: Vec<i64> = search
            .top_n_for_existing(2, 1)
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(store.neighbors(2).unwrap(), Some(live));
    }

    #[test]
    fn test_mixed_lengths_are_rejected() {
        let source = Fixed(vec![(1, vec![1.0, 0.0, 5.0]), (2, vec![1.0, 0.0])]);
        let search = SimilaritySearch::new(&source);
        assert!(matches!(
            search.top_n(&[1.0, 0.0, 5.0], 2, &HashSet::new()),
            Err(EmbedStoreError::DimensionMismatch {
                id: Some(2),
                expected: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            search.top_n(&[1.0, 0.0], 2, &HashSet::new()),
            Err(EmbedStoreError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            neighbor_lists(&source, 1),
            Err(EmbedStoreError::DimensionMismatch { id: Some(2), .. })
        ));
    }

    #[test]
    fn test_neighbor_lists_match_top_n() {
        let source = sample();
        let lists = neighbor_lists(&source, 2).unwrap();
        let search = SimilaritySearch::new(&source);
        for (id, ids) in &lists {
            let live: Vec<i64> = search
                .top_n_for_existing(*id, 2)
                .unwrap()
                .iter()
                .map(|n| n.id)
                .collect();
            assert_eq!(ids, &live);
        }
        assert!(matches!(
            neighbor_lists(&Fixed(Vec::new()), 2),
            Err(EmbedStoreError::EmptyStore)
        ));
    }
}
