use bridge::{Bridge, Role};
use comms::{AnyPayload, Tensor};
use log::debug;
use ndarray::{Array1, Ix1};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Batch, Model, StepStats};
use crate::{Result, TrainerError};

const EXAMPLE_IDS: &str = "example_ids";
const EMBEDDING: &str = "embedding";
const GRADIENT: &str = "gradient";

#[derive(Debug, Serialize, Deserialize)]
struct LinearState {
    role: Role,
    weights: Option<Vec<f32>>,
    bias: f32,
}

/// A linear regression whose features are split between both parties.
///
/// The follower sends `x_f · w_f` for every example of the batch, the leader
/// adds it to `x_l · w_l + b`, computes the mean squared error against its
/// labels and sends back the gradient of the loss with respect to the
/// follower's contribution.
#[derive(Debug, Clone)]
pub struct LinearSplit {
    role: Role,
    learning_rate: f32,
    weights: Option<Array1<f32>>,
    bias: f32,
}

impl LinearSplit {
    /// Creates a new `LinearSplit`, its weights are zeroed on the first batch.
    pub fn new(role: Role, learning_rate: f32) -> Self {
        Self {
            role,
            learning_rate,
            weights: None,
            bias: 0.0,
        }
    }

    pub fn weights(&self) -> Option<&Array1<f32>> {
        self.weights.as_ref()
    }

    pub fn bias(&self) -> f32 {
        self.bias
    }

    fn weights_for(&mut self, batch: &Batch) -> Result<&mut Array1<f32>> {
        let width = batch.features.ncols();
        let weights = self.weights.get_or_insert_with(|| Array1::zeros(width));

        if weights.len() != width {
            return Err(TrainerError::SizeMismatch {
                what: "model weights",
                got: width,
                expected: weights.len(),
            });
        }

        Ok(weights)
    }

    fn apply_gradient(&mut self, batch: &Batch, grad: &Array1<f32>) -> Result<()> {
        let lr = self.learning_rate;
        let grad_w = batch.features.t().dot(grad);
        self.weights_for(batch)?.scaled_add(-lr, &grad_w);

        if self.role == Role::Leader {
            self.bias -= lr * grad.sum();
        }

        Ok(())
    }

    async fn lead(&mut self, bridge: &Bridge, batch: &Batch) -> Result<StepStats> {
        let labels = batch.labels.as_ref().ok_or(TrainerError::MissingLabels)?;

        let ids = AnyPayload::pack(EXAMPLE_IDS, &batch.ids)?;
        bridge.send_any_current(EXAMPLE_IDS, ids).await?;

        let embedding = vector(bridge.receive_current(EMBEDDING).await?, batch.len(), EMBEDDING)?;

        let bias = self.bias;
        let pred = batch.features.dot(&*self.weights_for(batch)?) + &embedding + bias;
        let residual = pred - labels;
        let n = batch.len().max(1) as f32;
        let loss = residual.mapv(|r| r * r).sum() / n;

        // d loss / d pred, which is also d loss / d embedding.
        let grad = residual * (2.0 / n);
        bridge
            .send_current(GRADIENT, Tensor::vector(grad.to_vec()))
            .await?;

        self.apply_gradient(batch, &grad)?;
        debug!("leader step loss: {loss}");

        Ok(StepStats {
            loss: Some(loss),
            examples: batch.len(),
        })
    }

    async fn follow(&mut self, bridge: &Bridge, batch: &Batch) -> Result<StepStats> {
        let ids: Vec<u64> = bridge
            .receive_any_current(EXAMPLE_IDS)
            .await?
            .unpack(EXAMPLE_IDS)?;

        if ids != batch.ids {
            let iter_id = bridge.current_iter_id().unwrap_or_else(|| bridge.next_iter_id());
            return Err(TrainerError::Misaligned { iter_id });
        }

        let embedding = batch.features.dot(&*self.weights_for(batch)?);
        bridge
            .send_current(EMBEDDING, Tensor::vector(embedding.to_vec()))
            .await?;

        let grad = vector(bridge.receive_current(GRADIENT).await?, batch.len(), GRADIENT)?;
        self.apply_gradient(batch, &grad)?;

        Ok(StepStats {
            loss: None,
            examples: batch.len(),
        })
    }
}

fn vector(tensor: Tensor, expected: usize, what: &'static str) -> Result<Array1<f32>> {
    if tensor.len() != expected {
        return Err(TrainerError::SizeMismatch {
            what,
            got: tensor.len(),
            expected,
        });
    }

    Ok(tensor.into_array().into_dimensionality::<Ix1>()?)
}

#[async_trait::async_trait]
impl Model for LinearSplit {
    async fn step(&mut self, bridge: &Bridge, batch: &Batch) -> Result<StepStats> {
        match self.role {
            Role::Leader => self.lead(bridge, batch).await,
            Role::Follower => self.follow(bridge, batch).await,
        }
    }

    fn state(&self) -> Result<Value> {
        let state = LinearState {
            role: self.role,
            weights: self.weights.as_ref().map(|w| w.to_vec()),
            bias: self.bias,
        };

        Ok(serde_json::to_value(state)?)
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        let state: LinearState = serde_json::from_value(state)?;

        if state.role != self.role {
            return Err(TrainerError::ModelRole {
                expected: self.role,
                found: state.role,
            });
        }

        self.weights = state.weights.map(Array1::from);
        self.bias = state.bias;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_survives_a_restore() {
        let mut model = LinearSplit::new(Role::Leader, 0.1);
        model.weights = Some(Array1::from(vec![0.5, -1.0]));
        model.bias = 0.25;

        let mut restored = LinearSplit::new(Role::Leader, 0.1);
        restored.restore(model.state().unwrap()).unwrap();
        assert_eq!(restored.weights().unwrap().to_vec(), vec![0.5, -1.0]);
        assert_eq!(restored.bias(), 0.25);
    }

    #[test]
    fn restore_refuses_the_other_role() {
        let leader = LinearSplit::new(Role::Leader, 0.1);
        let mut follower = LinearSplit::new(Role::Follower, 0.1);
        assert!(follower.restore(leader.state().unwrap()).is_err());
    }

    #[test]
    fn follower_never_moves_the_bias() {
        let batch = Batch::from_examples(&[crate::data::Example {
            example_id: 0,
            features: vec![2.0],
            label: None,
        }])
        .unwrap();

        let mut model = LinearSplit::new(Role::Follower, 0.5);
        model.apply_gradient(&batch, &Array1::from(vec![1.0])).unwrap();

        assert_eq!(model.weights().unwrap().to_vec(), vec![-1.0]);
        assert_eq!(model.bias(), 0.0);
    }
}
