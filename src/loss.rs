//! Sparse autoencoder loss functions
//!
//! A loss computes a per-item value of shape `(batch,)` from the source
//! activations, learned activations and reconstruction. Losses compose through
//! [`LossReducer`], which sums its components and logs each one separately.

use anyhow::Result;
use candle_core::{Tensor, D};

use crate::metrics::MetricLog;

/// How per-item losses are reduced to a scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossReduction {
    #[default]
    Mean,
    Sum,
}

/// A loss over one batch
pub trait LossFn {
    /// Name used in metric logs
    fn log_name(&self) -> &'static str;

    /// Per-item loss, shape (batch,)
    ///
    /// * `source` - Source activations (batch, n_input_features)
    /// * `learned` - Learned activations (batch, n_learned_features)
    /// * `decoded` - Reconstructions (batch, n_input_features)
    fn forward(&self, source: &Tensor, learned: &Tensor, decoded: &Tensor) -> Result<Tensor>;

    /// Batch loss as a scalar tensor
    fn batch_loss(
        &self,
        source: &Tensor,
        learned: &Tensor,
        decoded: &Tensor,
        reduction: LossReduction,
    ) -> Result<Tensor> {
        let per_item = self.forward(source, learned, decoded)?;
        let reduced = match reduction {
            LossReduction::Mean => per_item.mean_all()?,
            LossReduction::Sum => per_item.sum_all()?,
        };
        Ok(reduced)
    }

    /// Mean batch loss plus its log entries
    fn scalar_loss_with_log(
        &self,
        source: &Tensor,
        learned: &Tensor,
        decoded: &Tensor,
    ) -> Result<(Tensor, MetricLog)> {
        let loss = self.batch_loss(source, learned, decoded, LossReduction::Mean)?;
        let value: f32 = loss.to_scalar()?;
        Ok((loss, vec![(self.log_name().to_string(), f64::from(value))]))
    }
}

/// Mean squared reconstruction error, averaged over input features
#[derive(Debug, Clone, Copy, Default)]
pub struct MseReconstructionLoss;

impl LossFn for MseReconstructionLoss {
    fn log_name(&self) -> &'static str {
        "mse_reconstruction_loss"
    }

    fn forward(&self, source: &Tensor, _learned: &Tensor, decoded: &Tensor) -> Result<Tensor> {
        Ok((source - decoded)?.sqr()?.mean(D::Minus1)?)
    }
}

/// L1 penalty on learned activations
#[derive(Debug, Clone, Copy)]
pub struct LearnedActivationsL1Loss {
    pub l1_coefficient: f64,
}

impl LearnedActivationsL1Loss {
    pub fn new(l1_coefficient: f64) -> Self {
        Self { l1_coefficient }
    }
}

impl LossFn for LearnedActivationsL1Loss {
    fn log_name(&self) -> &'static str {
        "learned_activations_l1_loss"
    }

    fn forward(&self, _source: &Tensor, learned: &Tensor, _decoded: &Tensor) -> Result<Tensor> {
        let l1 = learned.abs()?.sum(D::Minus1)?;
        Ok((l1 * self.l1_coefficient)?)
    }
}

/// Sum of several losses
#[derive(Default)]
pub struct LossReducer {
    components: Vec<Box<dyn LossFn>>,
}

impl LossReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard SAE objective: reconstruction MSE + L1 sparsity penalty
    pub fn standard(l1_coefficient: f64) -> Self {
        Self::new()
            .with(MseReconstructionLoss)
            .with(LearnedActivationsL1Loss::new(l1_coefficient))
    }

    pub fn with<L: LossFn + 'static>(mut self, loss: L) -> Self {
        self.components.push(Box::new(loss));
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl LossFn for LossReducer {
    fn log_name(&self) -> &'static str {
        "total_loss"
    }

    fn forward(&self, source: &Tensor, learned: &Tensor, decoded: &Tensor) -> Result<Tensor> {
        let (first, rest) = self
            .components
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("LossReducer has no component losses"))?;
        let mut total = first.forward(source, learned, decoded)?;
        for loss in rest {
            total = (&total + loss.forward(source, learned, decoded)?)?;
        }
        Ok(total)
    }

    fn scalar_loss_with_log(
        &self,
        source: &Tensor,
        learned: &Tensor,
        decoded: &Tensor,
    ) -> Result<(Tensor, MetricLog)> {
        anyhow::ensure!(!self.is_empty(), "LossReducer has no component losses");

        let mut log = MetricLog::with_capacity(self.components.len() + 1);
        let mut total: Option<Tensor> = None;
        for loss in &self.components {
            let (component, component_log) = loss.scalar_loss_with_log(source, learned, decoded)?;
            log.extend(component_log);
            total = Some(match total {
                Some(acc) => (acc + component)?,
                None => component,
            });
        }

        let total = total.ok_or_else(|| anyhow::anyhow!("LossReducer has no component losses"))?;
        let value: f32 = total.to_scalar()?;
        log.push((self.log_name().to_string(), f64::from(value)));
        Ok((total, log))
    }
}
