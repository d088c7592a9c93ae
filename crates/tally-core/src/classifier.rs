//! k-nearest-neighbor face classifier over raw sample pixels.
//!
//! The model is a snapshot of the enrollment store at training time. It is
//! never refreshed behind the caller's back: after enrolling new faces, call
//! [`KnnClassifier::load`] again to pick them up.

use crate::storage::{EnrollmentSource, StorageError};
use crate::types::{FaceSample, Identity, FEATURE_LEN};
use ndarray::{Array2, ArrayView1};
use std::collections::BTreeMap;
use thiserror::Error;

/// Neighbors consulted per prediction.
pub const DEFAULT_K: usize = 5;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("no enrollment data yet — register a face first")]
    NoEnrollmentData,
    #[error("training data mismatch: {0}")]
    Shape(String),
    #[error("loading training data: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ClassifierError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NoEnrollmentData => ClassifierError::NoEnrollmentData,
            other => ClassifierError::Storage(other),
        }
    }
}

/// Co-indexed labels and feature rows: `labels[i]` names row `i` of `features`.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    labels: Vec<Identity>,
    features: Array2<f32>,
}

impl TrainingSet {
    pub fn new(labels: Vec<Identity>, features: Array2<f32>) -> Result<Self, ClassifierError> {
        if labels.len() != features.nrows() {
            return Err(ClassifierError::Shape(format!(
                "{} labels for {} feature rows",
                labels.len(),
                features.nrows()
            )));
        }
        if features.ncols() != FEATURE_LEN {
            return Err(ClassifierError::Shape(format!(
                "feature rows have {} values, expected {FEATURE_LEN}",
                features.ncols()
            )));
        }
        Ok(Self { labels, features })
    }

    /// Build a training set from labelled samples.
    pub fn from_samples<'a, I>(pairs: I) -> Result<Self, ClassifierError>
    where
        I: IntoIterator<Item = (&'a str, &'a FaceSample)>,
    {
        let mut labels = Vec::new();
        let mut flat = Vec::new();
        for (label, sample) in pairs {
            labels.push(label.to_string());
            flat.extend(sample.as_bytes().iter().map(|&p| p as f32));
        }
        let features = Array2::from_shape_vec((labels.len(), FEATURE_LEN), flat)
            .map_err(|e| ClassifierError::Shape(e.to_string()))?;
        Self::new(labels, features)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[Identity] {
        &self.labels
    }
}

/// Majority-vote k-NN classifier with Euclidean distance.
#[derive(Debug, Clone)]
pub struct KnnClassifier {
    labels: Vec<Identity>,
    features: Array2<f32>,
    k: usize,
}

impl KnnClassifier {
    /// Read the full enrollment store and fit a model with k = 5.
    pub fn load(source: &dyn EnrollmentSource) -> Result<Self, ClassifierError> {
        let set = source.load_for_training()?;
        let model = Self::fit(set)?;
        tracing::info!(
            samples = model.labels.len(),
            identities = model.identities().len(),
            "classifier trained"
        );
        Ok(model)
    }

    pub fn fit(set: TrainingSet) -> Result<Self, ClassifierError> {
        Self::fit_with_k(set, DEFAULT_K)
    }

    pub fn fit_with_k(set: TrainingSet, k: usize) -> Result<Self, ClassifierError> {
        if set.is_empty() {
            return Err(ClassifierError::NoEnrollmentData);
        }
        if k == 0 {
            return Err(ClassifierError::Shape("k must be at least 1".into()));
        }
        Ok(Self {
            labels: set.labels,
            features: set.features,
            k,
        })
    }

    /// Classify a face sample.
    pub fn predict(&self, sample: &FaceSample) -> Identity {
        let probe: Vec<f32> = sample.features();
        self.predict_features(ArrayView1::from(&probe[..]))
    }

    /// Classify a flattened feature vector of length [`FEATURE_LEN`].
    ///
    /// Votes among the k nearest rows (fewer if fewer are enrolled). Ties in the
    /// vote go to the lexicographically smallest label.
    pub fn predict_features(&self, probe: ArrayView1<f32>) -> Identity {
        let mut neighbors: Vec<(f32, usize)> = self
            .features
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let dist: f32 = row
                    .iter()
                    .zip(probe.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                (dist, i)
            })
            .collect();
        neighbors.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
        for &(_, idx) in neighbors.iter().take(self.k) {
            *votes.entry(self.labels[idx].as_str()).or_default() += 1;
        }

        let mut best: Option<(&str, usize)> = None;
        for (label, count) in votes {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((label, count));
            }
        }
        best.map(|(label, _)| label.to_string()).unwrap_or_default()
    }

    /// Distinct enrolled identities, sorted.
    pub fn identities(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_sample(value: u8) -> FaceSample {
        FaceSample::from_raw(vec![value; FEATURE_LEN]).unwrap()
    }

    struct FixedSource(Option<TrainingSet>);

    impl EnrollmentSource for FixedSource {
        fn load_for_training(&self) -> Result<TrainingSet, StorageError> {
            self.0.clone().ok_or(StorageError::NoEnrollmentData)
        }
    }

    fn two_person_set() -> TrainingSet {
        let alice: Vec<FaceSample> = (0..5).map(|i| uniform_sample(10 + i)).collect();
        let bob: Vec<FaceSample> = (0..5).map(|i| uniform_sample(200 + i)).collect();
        TrainingSet::from_samples(
            alice
                .iter()
                .map(|s| ("Alice", s))
                .chain(bob.iter().map(|s| ("Bob", s))),
        )
        .unwrap()
    }

    #[test]
    fn test_exact_sample_recall() {
        let model = KnnClassifier::fit(two_person_set()).unwrap();
        assert_eq!(model.predict(&uniform_sample(12)), "Alice");
        assert_eq!(model.predict(&uniform_sample(203)), "Bob");
    }

    #[test]
    fn test_nearest_cluster_wins() {
        let model = KnnClassifier::fit(two_person_set()).unwrap();
        assert_eq!(model.predict(&uniform_sample(60)), "Alice");
        assert_eq!(model.predict(&uniform_sample(150)), "Bob");
    }

    #[test]
    fn test_majority_beats_single_closest() {
        // One "Carol" row sits exactly on the probe, but four of the five
        // nearest neighbors belong to Dave.
        let carol = uniform_sample(100);
        let dave: Vec<FaceSample> = (0..4).map(|i| uniform_sample(102 + i)).collect();
        let set = TrainingSet::from_samples(
            std::iter::once(("Carol", &carol)).chain(dave.iter().map(|s| ("Dave", s))),
        )
        .unwrap();
        let model = KnnClassifier::fit(set).unwrap();
        assert_eq!(model.predict(&uniform_sample(100)), "Dave");
    }

    #[test]
    fn test_vote_tie_prefers_smallest_label() {
        let a = uniform_sample(50);
        let b = uniform_sample(52);
        let set = TrainingSet::from_samples([("zed", &a), ("amy", &b)]).unwrap();
        let model = KnnClassifier::fit(set).unwrap();
        assert_eq!(model.predict(&uniform_sample(50)), "amy");
    }

    #[test]
    fn test_fewer_samples_than_k() {
        let only = uniform_sample(7);
        let model = KnnClassifier::fit(TrainingSet::from_samples([("Solo", &only)]).unwrap()).unwrap();
        assert_eq!(model.predict(&uniform_sample(250)), "Solo");
    }

    #[test]
    fn test_load_without_enrollment() {
        let err = KnnClassifier::load(&FixedSource(None)).unwrap_err();
        assert!(matches!(err, ClassifierError::NoEnrollmentData));
    }

    #[test]
    fn test_load_reflects_source_snapshot() {
        let model = KnnClassifier::load(&FixedSource(Some(two_person_set()))).unwrap();
        assert_eq!(model.sample_count(), 10);
        assert_eq!(model.identities(), vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_training_set_shape_mismatch() {
        let features = Array2::<f32>::zeros((2, FEATURE_LEN));
        let err = TrainingSet::new(vec!["a".into()], features).unwrap_err();
        assert!(matches!(err, ClassifierError::Shape(_)));

        let narrow = Array2::<f32>::zeros((1, 3));
        assert!(TrainingSet::new(vec!["a".into()], narrow).is_err());
    }

    #[test]
    fn test_from_samples_rows_follow_labels() {
        let low = uniform_sample(3);
        let high = uniform_sample(240);
        let set = TrainingSet::from_samples([("Low", &low), ("High", &high), ("Low", &low)]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.features.nrows(), set.labels().len());
        assert_eq!(set.features.ncols(), FEATURE_LEN);
        assert_eq!(set.features[[1, 0]], 240.0);
        assert_eq!(set.features[[2, FEATURE_LEN - 1]], 3.0);
        assert_eq!(set.labels(), ["Low", "High", "Low"]);
    }

    #[test]
    fn test_fit_empty_set() {
        let empty = TrainingSet::from_samples(std::iter::empty()).unwrap();
        assert!(matches!(
            KnnClassifier::fit(empty).unwrap_err(),
            ClassifierError::NoEnrollmentData
        ));
    }
}
