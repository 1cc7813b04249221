//! Dead-neuron resampling
//!
//! Over the course of training, a subset of autoencoder neurons stops firing
//! on any input. Resampling these "dead" neurons (Bricken et al., *Towards
//! Monosemanticity*) re-initialises their encoder and decoder parameters
//! from inputs the autoencoder currently reconstructs poorly, which increases
//! the number of interpretable features and reduces total loss.
//!
//! An [`ActivationResampler`] only *computes* the new parameters and returns
//! them as [`ParameterUpdateResults`]. Applying them is the caller's job, via
//! [`SparseAutoencoder::update_dead_neuron_parameters`]; afterwards the
//! optimizer must be reset, as its Adam moments refer to the old weights.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::activation_store::TensorActivationStore;
use crate::autoencoder::SparseAutoencoder;
use crate::error::ResampleError;
use crate::loss::LossFn;

/// Default number of stored inputs scored when resampling
pub const DEFAULT_RESAMPLE_INPUTS: usize = 819_200;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// New parameters for the neurons found dead by a resampling pass
#[derive(Debug, Clone)]
pub struct ParameterUpdateResults {
    /// Dead neuron indices, U32 shape (n_dead,)
    pub dead_neuron_indices: Tensor,
    /// Replacement encoder rows, shape (n_dead, n_input_features)
    pub dead_encoder_weight_updates: Tensor,
    /// Replacement encoder biases, shape (n_dead,)
    pub dead_encoder_bias_updates: Tensor,
    /// Replacement decoder columns, shape (n_input_features, n_dead)
    pub dead_decoder_weight_updates: Tensor,
}

impl ParameterUpdateResults {
    pub fn new(
        dead_neuron_indices: Tensor,
        dead_encoder_weight_updates: Tensor,
        dead_encoder_bias_updates: Tensor,
        dead_decoder_weight_updates: Tensor,
    ) -> Self {
        Self {
            dead_neuron_indices,
            dead_encoder_weight_updates,
            dead_encoder_bias_updates,
            dead_decoder_weight_updates,
        }
    }

    /// An update that changes nothing
    pub fn empty(n_input_features: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            dead_neuron_indices: Tensor::zeros(0, DType::U32, device)?,
            dead_encoder_weight_updates: Tensor::zeros((0, n_input_features), DType::F32, device)?,
            dead_encoder_bias_updates: Tensor::zeros(0, DType::F32, device)?,
            dead_decoder_weight_updates: Tensor::zeros((n_input_features, 0), DType::F32, device)?,
        })
    }

    /// Number of neurons being resampled
    pub fn n_dead(&self) -> Result<usize> {
        Ok(self.dead_neuron_indices.dim(0)?)
    }

    pub fn is_empty(&self) -> bool {
        self.dead_neuron_indices.elem_count() == 0
    }
}

/// How many times each learned neuron fired across observed batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeuronActivity {
    counts: Vec<u64>,
}

impl NeuronActivity {
    /// All-zero activity for `n_neurons` neurons
    pub fn zeros(n_neurons: usize) -> Self {
        Self {
            counts: vec![0; n_neurons],
        }
    }

    pub fn from_counts(counts: Vec<u64>) -> Self {
        Self { counts }
    }

    /// Add one batch of learned activations, shape (batch, n_neurons)
    pub fn accumulate(&mut self, learned_activations: &Tensor) -> Result<()> {
        let (_, width) = learned_activations.dims2()?;
        anyhow::ensure!(
            width == self.counts.len(),
            "Activation width {width} doesn't match tracked neurons {}",
            self.counts.len()
        );
        // Same non-zero test as the L0 norm; integer sums stay exact
        let fired: Vec<u32> = learned_activations
            .ne(&learned_activations.zeros_like()?)?
            .to_dtype(DType::U32)?
            .sum(0)?
            .to_vec1()?;
        for (count, batch_count) in self.counts.iter_mut().zip(fired) {
            *count += u64::from(batch_count);
        }
        Ok(())
    }

    /// Indices of neurons that never fired
    pub fn dead_neurons(&self) -> Vec<u32> {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == 0)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn n_neurons(&self) -> usize {
        self.counts.len()
    }

    /// Counts as an F32 tensor, shape (n_neurons,)
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let values: Vec<f32> = self.counts.iter().map(|&c| c as f32).collect();
        Ok(Tensor::from_vec(values, self.counts.len(), device)?)
    }
}

/// Number of stored inputs a resampling pass will score.
///
/// `num_inputs` is capped at the store size, then rounded down to a multiple
/// of `train_batch_size`. Zero usable inputs is an error.
pub fn resample_input_count(
    num_inputs: usize,
    train_batch_size: usize,
    store_len: usize,
) -> Result<usize> {
    let insufficient = || ResampleError::InsufficientInputs {
        num_inputs,
        store_len,
        batch_size: train_batch_size,
    };
    if train_batch_size == 0 {
        return Err(insufficient().into());
    }
    let capped = num_inputs.min(store_len);
    let count = capped - capped % train_batch_size;
    if count == 0 {
        return Err(insufficient().into());
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Resampler contract
// ---------------------------------------------------------------------------

/// Computes replacement parameters for dead neurons.
///
/// Implementors override [`resample_dead_neurons`](Self::resample_dead_neurons);
/// the provided body only reports that no algorithm is available.
pub trait ActivationResampler {
    /// Resample dead neurons.
    ///
    /// # Arguments
    /// * `neuron_activity` - Number of times each neuron fired
    /// * `activation_store` - Stored source activations to sample from
    /// * `autoencoder` - Model whose dead neurons are resampled (not modified)
    /// * `loss_fn` - Loss used to score how badly each input is reconstructed
    /// * `train_batch_size` - Batch size, also used while scoring inputs
    /// * `num_inputs` - Inputs to score (usually [`DEFAULT_RESAMPLE_INPUTS`]),
    ///   see [`resample_input_count`]
    ///
    /// The optimizer must be reset after applying the returned updates.
    fn resample_dead_neurons(
        &mut self,
        neuron_activity: &NeuronActivity,
        activation_store: &TensorActivationStore,
        autoencoder: &SparseAutoencoder,
        loss_fn: &dyn LossFn,
        train_batch_size: usize,
        num_inputs: usize,
    ) -> Result<ParameterUpdateResults> {
        let _ = (
            neuron_activity,
            activation_store,
            autoencoder,
            loss_fn,
            train_batch_size,
            num_inputs,
        );
        Err(ResampleError::NotImplemented {
            resampler: std::any::type_name::<Self>(),
        }
        .into())
    }
}

// ---------------------------------------------------------------------------
// Loss-weighted resampling
// ---------------------------------------------------------------------------

/// Resamples dead neurons towards high-loss inputs.
///
/// ```text
/// p(x)        ∝ loss(x)^2                      over the scored inputs
/// x_i         ~ p  (one draw per dead neuron, with replacement)
/// W_dec[:, i] = x_i / ||x_i||
/// W_enc[i, :] = x_i / ||x_i|| * scale * mean_alive ||W_enc[j, :]||
/// b_enc[i]    = 0
/// ```
pub struct LossWeightedResampler {
    /// Multiplier on the mean alive encoder norm for new encoder rows
    pub encoder_weight_scale: f64,
    rng: StdRng,
}

impl LossWeightedResampler {
    pub fn new(seed: u64) -> Self {
        Self {
            encoder_weight_scale: 0.2,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_encoder_weight_scale(mut self, scale: f64) -> Self {
        self.encoder_weight_scale = scale;
        self
    }

    /// Per-input loss over the first `n_inputs` stored activations, shape (n_inputs,)
    fn compute_input_losses(
        &self,
        inputs: &Tensor,
        autoencoder: &SparseAutoencoder,
        loss_fn: &dyn LossFn,
        batch_size: usize,
    ) -> Result<Tensor> {
        let n_inputs = inputs.dim(0)?;
        let mut losses = Vec::with_capacity(n_inputs / batch_size);
        for start in (0..n_inputs).step_by(batch_size) {
            let batch = inputs.narrow(0, start, batch_size)?;
            let (learned, decoded) = autoencoder.forward(&batch)?;
            let loss = loss_fn.forward(&batch, &learned, &decoded)?.detach();
            losses.push(loss);
        }
        Ok(Tensor::cat(&losses, 0)?)
    }

    /// Draw `n_samples` input indices with probability proportional to loss²
    fn sample_input_indices(&mut self, losses: &Tensor, n_samples: usize) -> Result<Vec<u32>> {
        let weights: Vec<f32> = losses
            .sqr()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|w| if w.is_finite() { w } else { 0.0 })
            .collect();
        let n_inputs = weights.len();

        let indices = match WeightedIndex::new(&weights) {
            Ok(dist) => (0..n_samples)
                .map(|_| dist.sample(&mut self.rng) as u32)
                .collect(),
            Err(err) => {
                warn!("Loss-weighted sampling unavailable ({err}); sampling uniformly");
                (0..n_samples)
                    .map(|_| self.rng.gen_range(0..n_inputs) as u32)
                    .collect()
            }
        };
        Ok(indices)
    }

    /// Mean L2 norm of encoder rows for neurons that are still alive
    fn mean_alive_encoder_norm(
        autoencoder: &SparseAutoencoder,
        activity: &NeuronActivity,
    ) -> Result<f64> {
        let norms: Vec<f32> = autoencoder
            .encoder_weight()
            .sqr()?
            .sum(D::Minus1)?
            .sqrt()?
            .to_vec1()?;
        let alive: Vec<f64> = norms
            .iter()
            .zip(activity.counts())
            .filter(|(_, &c)| c > 0)
            .map(|(&n, _)| f64::from(n))
            .collect();
        if alive.is_empty() {
            return Ok(1.0);
        }
        Ok(alive.iter().sum::<f64>() / alive.len() as f64)
    }
}

impl ActivationResampler for LossWeightedResampler {
    fn resample_dead_neurons(
        &mut self,
        neuron_activity: &NeuronActivity,
        activation_store: &TensorActivationStore,
        autoencoder: &SparseAutoencoder,
        loss_fn: &dyn LossFn,
        train_batch_size: usize,
        num_inputs: usize,
    ) -> Result<ParameterUpdateResults> {
        let n_in = autoencoder.config().n_input_features;
        let n_learned = autoencoder.config().n_learned_features;
        let device = autoencoder.device();

        if neuron_activity.n_neurons() != n_learned {
            return Err(ResampleError::ActivityMismatch {
                activity: neuron_activity.n_neurons(),
                learned: n_learned,
            }
            .into());
        }

        let dead = neuron_activity.dead_neurons();
        if dead.is_empty() {
            debug!("No dead neurons to resample");
            return ParameterUpdateResults::empty(n_in, device);
        }
        let n_dead = dead.len();

        let n_inputs = resample_input_count(num_inputs, train_batch_size, activation_store.len())?;
        info!("Resampling {n_dead}/{n_learned} dead neurons using {n_inputs} inputs");

        let inputs = activation_store
            .first_n(n_inputs)?
            .to_device(device)
            .context("Failed to move resampling inputs to autoencoder device")?;
        let losses = self.compute_input_losses(&inputs, autoencoder, loss_fn, train_batch_size)?;
        let sampled = self.sample_input_indices(&losses, n_dead)?;

        let sampled_ids = Tensor::from_vec(sampled, n_dead, device)?;
        let sampled_inputs = inputs.index_select(&sampled_ids, 0)?; // [n_dead, n_in]
        let norms = sampled_inputs
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .sqrt()?
            .clamp(1e-8f32, f32::MAX)?;
        let unit_inputs = sampled_inputs.broadcast_div(&norms)?;

        let alive_norm = Self::mean_alive_encoder_norm(autoencoder, neuron_activity)?;
        let encoder_updates = (&unit_inputs * (alive_norm * self.encoder_weight_scale))?;
        let decoder_updates = unit_inputs.t()?.contiguous()?;

        Ok(ParameterUpdateResults {
            dead_neuron_indices: Tensor::from_vec(dead, n_dead, device)?,
            dead_encoder_weight_updates: encoder_updates,
            dead_encoder_bias_updates: Tensor::zeros(n_dead, DType::F32, device)?,
            dead_decoder_weight_updates: decoder_updates,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
