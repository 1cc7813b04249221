//! Sparse autoencoder model
//!
//! ```text
//! Encode:  learned = ReLU((x - b_tied) @ W_enc^T + b_enc)
//! Decode:  x_hat   = learned @ W_dec^T + b_tied
//! ```
//!
//! Decoder columns (one per learned feature) are kept at unit L2 norm; the
//! training loop calls [`SparseAutoencoder::normalize_decoder`] after every
//! optimizer step. Parameters are candle `Var`s so they can be handed to an
//! optimizer and overwritten in place by dead-neuron resampling.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var, D};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::activation_store::TensorActivationStore;
use crate::resampler::ParameterUpdateResults;

const TIED_BIAS: &str = "tied_bias";
const ENCODER_WEIGHT: &str = "encoder.weight";
const ENCODER_BIAS: &str = "encoder.bias";
const DECODER_WEIGHT: &str = "decoder.weight";

/// Autoencoder dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseAutoencoderConfig {
    /// Width of the source activations
    pub n_input_features: usize,
    /// Number of learned features (dictionary size)
    pub n_learned_features: usize,
}

/// Single-layer sparse autoencoder with a tied pre-encoder/post-decoder bias
pub struct SparseAutoencoder {
    config: SparseAutoencoderConfig,
    tied_bias: Var,      // [n_input]
    encoder_weight: Var, // [n_learned, n_input]
    encoder_bias: Var,   // [n_learned]
    decoder_weight: Var, // [n_input, n_learned]
    device: Device,
}

impl SparseAutoencoder {
    /// Create a freshly initialised autoencoder on `device`
    pub fn new(config: SparseAutoencoderConfig, device: &Device) -> Result<Self> {
        let n_in = config.n_input_features;
        let n_learned = config.n_learned_features;
        anyhow::ensure!(
            n_in > 0 && n_learned > 0,
            "Autoencoder dimensions must be non-zero, got {n_in} -> {n_learned}"
        );

        let bound = 1.0 / (n_in as f32).sqrt();
        let encoder_weight = Tensor::rand(-bound, bound, (n_learned, n_in), device)?;
        let decoder_weight = Tensor::randn(0f32, 1.0, (n_in, n_learned), device)?;

        let model = Self {
            config,
            tied_bias: Var::zeros(n_in, DType::F32, device)?,
            encoder_weight: Var::from_tensor(&encoder_weight)?,
            encoder_bias: Var::zeros(n_learned, DType::F32, device)?,
            decoder_weight: Var::from_tensor(&decoder_weight)?,
            device: device.clone(),
        };
        model.normalize_decoder()?;

        info!("Sparse autoencoder: {n_in} -> {n_learned} features");
        Ok(model)
    }

    pub fn config(&self) -> &SparseAutoencoderConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tied_bias(&self) -> &Tensor {
        self.tied_bias.as_tensor()
    }

    pub fn encoder_weight(&self) -> &Tensor {
        self.encoder_weight.as_tensor()
    }

    pub fn encoder_bias(&self) -> &Tensor {
        self.encoder_bias.as_tensor()
    }

    pub fn decoder_weight(&self) -> &Tensor {
        self.decoder_weight.as_tensor()
    }

    /// Trainable parameters, for building an optimizer
    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.tied_bias.clone(),
            self.encoder_weight.clone(),
            self.encoder_bias.clone(),
            self.decoder_weight.clone(),
        ]
    }

    // --- Forward pass ---

    /// Learned activations for a batch, shape (batch, n_learned)
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let centered = x.broadcast_sub(self.tied_bias.as_tensor())?;
        let pre_acts = centered
            .matmul(&self.encoder_weight.as_tensor().t()?)?
            .broadcast_add(self.encoder_bias.as_tensor())?;
        Ok(pre_acts.relu()?)
    }

    /// Reconstruct inputs from learned activations, shape (batch, n_input)
    pub fn decode(&self, learned: &Tensor) -> Result<Tensor> {
        let decoded = learned
            .matmul(&self.decoder_weight.as_tensor().t()?)?
            .broadcast_add(self.tied_bias.as_tensor())?;
        Ok(decoded)
    }

    /// Run the full autoencoder, returning `(learned_activations, decoded_activations)`
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, width) = x.dims2()?;
        anyhow::ensure!(
            width == self.config.n_input_features,
            "Input width {width} doesn't match autoencoder input {}",
            self.config.n_input_features
        );
        let learned = self.encode(x)?;
        let decoded = self.decode(&learned)?;
        Ok((learned, decoded))
    }

    // --- Parameter maintenance ---

    /// Rescale every decoder column to unit L2 norm
    pub fn normalize_decoder(&self) -> Result<()> {
        let w = self.decoder_weight.as_tensor().detach();
        let norms = w.sqr()?.sum_keepdim(0)?.sqrt()?.clamp(1e-8f32, f32::MAX)?;
        self.decoder_weight.set(&w.broadcast_div(&norms)?)?;
        Ok(())
    }

    /// Overwrite the parameters of dead neurons with resampled values.
    ///
    /// Encoder rows, encoder bias entries and decoder columns at
    /// `dead_neuron_indices` are replaced; every other entry is untouched.
    /// The optimizer state for these parameters is stale afterwards and
    /// should be reset by the caller.
    pub fn update_dead_neuron_parameters(&self, updates: &ParameterUpdateResults) -> Result<()> {
        let n_dead = updates.n_dead()?;
        if n_dead == 0 {
            return Ok(());
        }
        let n_in = self.config.n_input_features;
        let n_learned = self.config.n_learned_features;

        let dead: Vec<u32> = updates
            .dead_neuron_indices
            .to_dtype(DType::U32)?
            .flatten_all()?
            .to_vec1()?;
        let mut unique = dead.clone();
        unique.sort_unstable();
        unique.dedup();
        anyhow::ensure!(
            unique.len() == dead.len(),
            "Dead neuron indices must be unique, got {dead:?}"
        );
        if let Some(&max_id) = unique.last() {
            anyhow::ensure!(
                (max_id as usize) < n_learned,
                "Dead neuron index {max_id} out of range ({n_learned} learned features)"
            );
        }
        anyhow::ensure!(
            updates.dead_encoder_weight_updates.dims() == [n_dead, n_in],
            "Encoder weight updates must be [{n_dead}, {n_in}], got {:?}",
            updates.dead_encoder_weight_updates.dims()
        );
        anyhow::ensure!(
            updates.dead_encoder_bias_updates.dims() == [n_dead],
            "Encoder bias updates must be [{n_dead}], got {:?}",
            updates.dead_encoder_bias_updates.dims()
        );
        anyhow::ensure!(
            updates.dead_decoder_weight_updates.dims() == [n_in, n_dead],
            "Decoder weight updates must be [{n_in}, {n_dead}], got {:?}",
            updates.dead_decoder_weight_updates.dims()
        );

        // index_add only accepts contiguous operands
        let ids = Tensor::from_vec(dead, n_dead, &self.device)?;
        let as_source = |t: &Tensor| -> Result<Tensor> {
            Ok(t.to_dtype(DType::F32)?
                .to_device(&self.device)?
                .contiguous()?)
        };

        // keep = 1 everywhere except the dead neurons
        let dead_mask = Tensor::zeros(n_learned, DType::F32, &self.device)?.index_add(
            &ids,
            &Tensor::ones(n_dead, DType::F32, &self.device)?,
            0,
        )?;
        let keep = dead_mask.affine(-1.0, 1.0)?;

        let enc_w = self.encoder_weight.as_tensor().detach();
        let enc_w_updates = as_source(&updates.dead_encoder_weight_updates)?;
        let scattered = enc_w.zeros_like()?.index_add(&ids, &enc_w_updates, 0)?;
        let new_enc_w = enc_w
            .broadcast_mul(&keep.unsqueeze(1)?)?
            .add(&scattered)?;
        self.encoder_weight.set(&new_enc_w)?;

        let enc_b = self.encoder_bias.as_tensor().detach();
        let enc_b_updates = as_source(&updates.dead_encoder_bias_updates)?;
        let scattered = enc_b.zeros_like()?.index_add(&ids, &enc_b_updates, 0)?;
        self.encoder_bias.set(&enc_b.mul(&keep)?.add(&scattered)?)?;

        let dec_w = self.decoder_weight.as_tensor().detach();
        let dec_w_updates = as_source(&updates.dead_decoder_weight_updates)?;
        let scattered = dec_w.zeros_like()?.index_add(&ids, &dec_w_updates, 1)?;
        let new_dec_w = dec_w
            .broadcast_mul(&keep.unsqueeze(0)?)?
            .add(&scattered)?;
        self.decoder_weight.set(&new_dec_w)?;

        debug!("Overwrote parameters for {n_dead} dead neurons");
        Ok(())
    }

    /// Set the tied bias to the geometric median of the stored activations.
    ///
    /// Uses Weiszfeld's algorithm, starting from the mean and stopping after
    /// `max_iterations` or once the estimate moves less than `1e-5`.
    pub fn initialize_tied_bias_to_geometric_median(
        &self,
        store: &TensorActivationStore,
        max_iterations: usize,
    ) -> Result<()> {
        anyhow::ensure!(
            store.n_neurons() == self.config.n_input_features,
            "Store width {} doesn't match autoencoder input {}",
            store.n_neurons(),
            self.config.n_input_features
        );
        let points = store.as_tensor()?.to_device(&self.device)?;
        let median = geometric_median(&points, max_iterations)?;
        self.tied_bias.set(&median)?;
        Ok(())
    }

    // --- Persistence ---

    /// Save parameters as a safetensors file
    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = [
            (TIED_BIAS, &self.tied_bias),
            (ENCODER_WEIGHT, &self.encoder_weight),
            (ENCODER_BIAS, &self.encoder_bias),
            (DECODER_WEIGHT, &self.decoder_weight),
        ]
        .into_iter()
        .map(|(name, var)| (name.to_string(), var.as_tensor().detach()))
        .collect();
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to save autoencoder to {}", path.display()))?;
        info!("Saved autoencoder to {}", path.display());
        Ok(())
    }

    /// Load parameters previously written by [`save`](Self::save)
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load autoencoder from {}", path.display()))?;
        let mut take = |name: &str| {
            tensors
                .remove(name)
                .ok_or_else(|| anyhow::anyhow!("Tensor '{name}' missing from {}", path.display()))
                .and_then(|t| Ok(t.to_dtype(DType::F32)?))
        };
        let tied_bias = take(TIED_BIAS)?;
        let encoder_weight = take(ENCODER_WEIGHT)?;
        let encoder_bias = take(ENCODER_BIAS)?;
        let decoder_weight = take(DECODER_WEIGHT)?;

        let (n_learned_features, n_input_features) = encoder_weight.dims2()?;
        anyhow::ensure!(
            decoder_weight.dims() == [n_input_features, n_learned_features]
                && tied_bias.dims() == [n_input_features]
                && encoder_bias.dims() == [n_learned_features],
            "Inconsistent autoencoder tensor shapes in {}",
            path.display()
        );

        Ok(Self {
            config: SparseAutoencoderConfig {
                n_input_features,
                n_learned_features,
            },
            tied_bias: Var::from_tensor(&tied_bias)?,
            encoder_weight: Var::from_tensor(&encoder_weight)?,
            encoder_bias: Var::from_tensor(&encoder_bias)?,
            decoder_weight: Var::from_tensor(&decoder_weight)?,
            device: device.clone(),
        })
    }
}

/// Weiszfeld iteration for the geometric median of the rows of `points`
fn geometric_median(points: &Tensor, max_iterations: usize) -> Result<Tensor> {
    let mut median = points.mean(0)?;
    for iteration in 0..max_iterations {
        let distances = points
            .broadcast_sub(&median)?
            .sqr()?
            .sum(D::Minus1)?
            .sqrt()?
            .clamp(1e-8f32, f32::MAX)?;
        let weights = distances.recip()?;
        let weight_sum = weights.sum_all()?;
        let next = points
            .broadcast_mul(&weights.unsqueeze(1)?)?
            .sum(0)?
            .broadcast_div(&weight_sum)?;

        let shift: f32 = (&next - &median)?.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
        median = next;
        if shift < 1e-5 {
            debug!("Geometric median converged after {} iterations", iteration + 1);
            break;
        }
    }
    Ok(median)
}
