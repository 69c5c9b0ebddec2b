//! Testing utilities: synthetic datasets for unit and integration tests.
//!
//! Each generator returns a [`RawDataset`] whose column 0 is the label and
//! whose remaining columns are the features, ready for
//! [`crate::cache::build_cache`].

use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::cache::{RawColumn, RawDataset};

/// Regression dataset: the label is a linear combination of numerical
/// features plus symmetric noise.
pub fn synthetic_regression(
    num_examples: usize,
    num_features: usize,
    seed: u64,
    noise: f32,
) -> RawDataset {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut features: Vec<Vec<f32>> = vec![Vec::with_capacity(num_examples); num_features];
    let mut labels = Vec::with_capacity(num_examples);

    for _ in 0..num_examples {
        let mut label = 0.0f32;
        for (idx, feature) in features.iter_mut().enumerate() {
            let value: f32 = rng.gen_range(-1.0..1.0);
            feature.push(value);
            label += value * (idx + 1) as f32;
        }
        label += noise * (rng.gen_range(-1.0f32..1.0) + rng.gen_range(-1.0f32..1.0)) / 2.0;
        labels.push(label);
    }

    let mut columns = vec![RawColumn::Numerical(labels)];
    columns.extend(features.into_iter().map(RawColumn::Numerical));
    RawDataset { columns }
}

/// Binary classification dataset: the class is the sign of a linear score
/// over the features.
pub fn synthetic_binary(num_examples: usize, num_features: usize, seed: u64) -> RawDataset {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut features: Vec<Vec<f32>> = vec![Vec::with_capacity(num_examples); num_features];
    let mut labels = Vec::with_capacity(num_examples);

    for _ in 0..num_examples {
        let mut score = 0.0f32;
        for feature in features.iter_mut() {
            let value: f32 = rng.gen_range(-1.0..1.0);
            feature.push(value);
            score += value;
        }
        labels.push((score > 0.0) as u16);
    }

    let mut columns = vec![RawColumn::Categorical {
        values: labels,
        num_values: 2,
    }];
    columns.extend(features.into_iter().map(RawColumn::Numerical));
    RawDataset { columns }
}

/// Multiclass dataset: examples cluster around one center per class.
pub fn synthetic_multiclass(
    num_examples: usize,
    num_features: usize,
    num_classes: u32,
    seed: u64,
) -> RawDataset {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut features: Vec<Vec<f32>> = vec![Vec::with_capacity(num_examples); num_features];
    let mut labels = Vec::with_capacity(num_examples);

    for example in 0..num_examples {
        let class = (example % num_classes as usize) as u16;
        labels.push(class);
        for feature in features.iter_mut() {
            let center = class as f32 * 2.0;
            feature.push(center + rng.gen_range(-0.5..0.5));
        }
    }

    let mut columns = vec![RawColumn::Categorical {
        values: labels,
        num_values: num_classes,
    }];
    columns.extend(features.into_iter().map(RawColumn::Numerical));
    RawDataset { columns }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regression_shape() {
        let dataset = synthetic_regression(50, 3, 1, 0.1);
        assert_eq!(dataset.columns.len(), 4);
        assert_eq!(dataset.num_examples(), 50);
    }

    #[test]
    fn binary_labels_are_two_valued() {
        let dataset = synthetic_binary(64, 2, 2);
        let RawColumn::Categorical { values, num_values } = &dataset.columns[0] else {
            panic!("label should be categorical");
        };
        assert_eq!(*num_values, 2);
        assert!(values.iter().all(|&c| c < 2));
        assert!(values.iter().any(|&c| c == 0));
        assert!(values.iter().any(|&c| c == 1));
    }

    #[test]
    fn multiclass_covers_every_class() {
        let dataset = synthetic_multiclass(30, 2, 3, 3);
        let RawColumn::Categorical { values, .. } = &dataset.columns[0] else {
            panic!("label should be categorical");
        };
        for class in 0..3u16 {
            assert!(values.contains(&class));
        }
    }
}
