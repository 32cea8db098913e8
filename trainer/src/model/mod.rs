mod linear_split;

pub use linear_split::LinearSplit;

use bridge::Bridge;
use ndarray::{Array1, Array2};
use serde_json::Value;

use crate::{Result, TrainerError, data::Example};

/// A model trained jointly by both parties.
///
/// The runner opens an iteration before every call to `step` and commits it
/// afterwards, so implementations only exchange their named values.
#[async_trait::async_trait]
pub trait Model: Send {
    /// Runs one training step on `batch`, exchanging values with the peer
    /// through `bridge`.
    ///
    /// # Arguments
    /// * `bridge` - The channel to the peer, with an open iteration.
    /// * `batch` - This party's side of the examples of the step.
    ///
    /// # Returns
    /// The statistics of the step, the loss only being known to the party
    /// holding the labels.
    async fn step(&mut self, bridge: &Bridge, batch: &Batch) -> Result<StepStats>;

    /// The serializable state of the model.
    fn state(&self) -> Result<Value>;

    /// Replaces the state of the model with one previously returned by `state`.
    fn restore(&mut self, state: Value) -> Result<()>;
}

/// The statistics of a single training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub loss: Option<f32>,
    pub examples: usize,
}

/// A run of consecutive examples of a data block.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ids: Vec<u64>,
    pub features: Array2<f32>,
    pub labels: Option<Array1<f32>>,
}

impl Batch {
    /// Stacks `examples` into a batch.
    ///
    /// # Returns
    /// The batch, or an error if the examples have different amounts of
    /// features or only some of them are labeled.
    pub fn from_examples(examples: &[Example]) -> Result<Self> {
        let width = examples.first().map_or(0, |e| e.features.len());
        let mut ids = Vec::with_capacity(examples.len());
        let mut flat = Vec::with_capacity(examples.len() * width);
        let mut labels = Vec::with_capacity(examples.len());

        for example in examples {
            if example.features.len() != width {
                return Err(TrainerError::SizeMismatch {
                    what: "example features",
                    got: example.features.len(),
                    expected: width,
                });
            }

            ids.push(example.example_id);
            flat.extend_from_slice(&example.features);
            labels.extend(example.label);
        }

        let labels = match labels.len() {
            0 => None,
            n if n == examples.len() => Some(Array1::from(labels)),
            _ => return Err(TrainerError::MissingLabels),
        };

        Ok(Self {
            ids,
            features: Array2::from_shape_vec((examples.len(), width), flat)?,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(example_id: u64, features: Vec<f32>, label: Option<f32>) -> Example {
        Example {
            example_id,
            features,
            label,
        }
    }

    #[test]
    fn stacks_examples_row_by_row() {
        let batch = Batch::from_examples(&[
            example(3, vec![1.0, 2.0], Some(0.5)),
            example(4, vec![3.0, 4.0], Some(1.5)),
        ])
        .unwrap();

        assert_eq!(batch.ids, vec![3, 4]);
        assert_eq!(batch.features.shape(), &[2, 2]);
        assert_eq!(batch.features[[1, 0]], 3.0);
        assert_eq!(batch.labels.unwrap().to_vec(), vec![0.5, 1.5]);
    }

    #[test]
    fn unlabeled_examples_have_no_labels() {
        let batch = Batch::from_examples(&[example(0, vec![1.0], None)]).unwrap();
        assert!(batch.labels.is_none());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn ragged_or_partially_labeled_examples_are_rejected() {
        let ragged = [example(0, vec![1.0], None), example(1, vec![1.0, 2.0], None)];
        assert!(matches!(
            Batch::from_examples(&ragged),
            Err(TrainerError::SizeMismatch { got: 2, expected: 1, .. })
        ));

        let partial = [example(0, vec![1.0], Some(1.0)), example(1, vec![1.0], None)];
        assert!(matches!(
            Batch::from_examples(&partial),
            Err(TrainerError::MissingLabels)
        ));
    }
}
