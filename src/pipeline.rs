//! Training pipeline
//!
//! Coordinates batch sampling, the autoencoder forward pass, loss and
//! optimizer steps, periodic dead-neuron resampling and metric logging.

use std::path::Path;

use anyhow::{Context, Result};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::activation_store::TensorActivationStore;
use crate::autoencoder::SparseAutoencoder;
use crate::loss::LossFn;
use crate::metrics::{MetricLog, MetricsPipeline, TrainMetricData};
use crate::resampler::{
    resample_input_count, ActivationResampler, NeuronActivity, DEFAULT_RESAMPLE_INPUTS,
};

/// Configuration for a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Learned features per input feature
    pub expansion_factor: usize,
    /// Weight of the L1 sparsity penalty
    pub l1_coefficient: f64,
    pub learning_rate: f64,
    pub adam_beta_1: f64,
    pub adam_beta_2: f64,
    pub weight_decay: f64,
    pub train_batch_size: usize,
    /// Total optimizer steps
    pub n_steps: usize,
    /// Steps between resampling passes
    pub resample_interval: usize,
    /// Steps before each resample over which neuron activity is counted
    pub resample_window: usize,
    /// Upper bound on resampling passes per run
    pub max_resamples: usize,
    /// Stored inputs scored per resampling pass
    pub resample_num_inputs: usize,
    /// Steps between metric reports
    pub log_interval: usize,
    /// Random seed for batch sampling and resampling
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            expansion_factor: 4,
            l1_coefficient: 1e-3,
            learning_rate: 1e-3,
            adam_beta_1: 0.9,
            adam_beta_2: 0.999,
            weight_decay: 0.0,
            train_batch_size: 4096,
            n_steps: 10_000,
            resample_interval: 2_500,
            resample_window: 1_000,
            max_resamples: 4,
            resample_num_inputs: DEFAULT_RESAMPLE_INPUTS,
            log_interval: 100,
            seed: 42,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.expansion_factor > 0, "expansion_factor must be > 0");
        anyhow::ensure!(self.train_batch_size > 0, "train_batch_size must be > 0");
        anyhow::ensure!(self.log_interval > 0, "log_interval must be > 0");
        anyhow::ensure!(self.resample_interval > 0, "resample_interval must be > 0");
        anyhow::ensure!(
            self.resample_window <= self.resample_interval,
            "resample_window ({}) must not exceed resample_interval ({})",
            self.resample_window,
            self.resample_interval
        );
        Ok(())
    }

    fn adamw_params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.adam_beta_1,
            beta2: self.adam_beta_2,
            weight_decay: self.weight_decay,
            ..Default::default()
        }
    }
}

/// Results from a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainResults {
    /// Optimizer steps taken
    pub steps: usize,
    /// Total loss on the last batch
    pub final_loss: f64,
    /// Resampling passes that found dead neurons
    pub n_resamples: usize,
    /// Neurons resampled across all passes
    pub neurons_resampled: usize,
    /// Metric logs, one per reporting step
    pub history: Vec<(usize, MetricLog)>,
}

/// Main training runner
pub struct Pipeline {
    config: PipelineConfig,
    autoencoder: SparseAutoencoder,
    loss_fn: Box<dyn LossFn>,
    resampler: Box<dyn ActivationResampler>,
    metrics: MetricsPipeline,
}

impl Pipeline {
    pub fn new(
        autoencoder: SparseAutoencoder,
        loss_fn: Box<dyn LossFn>,
        resampler: Box<dyn ActivationResampler>,
        metrics: MetricsPipeline,
        config: PipelineConfig,
    ) -> Self {
        Self {
            config,
            autoencoder,
            loss_fn,
            resampler,
            metrics,
        }
    }

    pub fn autoencoder(&self) -> &SparseAutoencoder {
        &self.autoencoder
    }

    pub fn into_autoencoder(self) -> SparseAutoencoder {
        self.autoencoder
    }

    fn new_optimizer(&self) -> Result<AdamW> {
        Ok(AdamW::new(self.autoencoder.vars(), self.config.adamw_params())?)
    }

    /// Run the full training loop over `store`
    pub fn run(&mut self, store: &TensorActivationStore) -> Result<TrainResults> {
        self.config.validate()?;
        anyhow::ensure!(!store.is_empty(), "Cannot train on an empty activation store");
        let n_learned = self.autoencoder.config().n_learned_features;
        if self.config.max_resamples > 0 {
            // Fail before training rather than at the first resample
            resample_input_count(
                self.config.resample_num_inputs,
                self.config.train_batch_size,
                store.len(),
            )
            .context("Activation store too small to resample dead neurons")?;
        }

        info!("Starting SAE training");
        info!("Config: {:?}", self.config);

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut optimizer = self.new_optimizer()?;
        let mut activity = NeuronActivity::zeros(n_learned);

        let mut history = Vec::new();
        let mut final_loss = f64::NAN;
        let mut n_resamples = 0;
        let mut resample_attempts = 0;
        let mut neurons_resampled = 0;

        for step in 1..=self.config.n_steps {
            let batch = store
                .sample_batch(self.config.train_batch_size, &mut rng)?
                .to_device(self.autoencoder.device())?;
            let (learned, decoded) = self.autoencoder.forward(&batch)?;
            let (loss, loss_log) = self
                .loss_fn
                .scalar_loss_with_log(&batch, &learned, &decoded)?;
            optimizer.backward_step(&loss)?;
            self.autoencoder.normalize_decoder()?;

            final_loss = f64::from(loss.to_scalar::<f32>()?);

            // Position within the current resample interval, 1..=resample_interval
            let interval = self.config.resample_interval;
            let since_resample = (step - 1) % interval + 1;
            let in_window = since_resample > interval - self.config.resample_window;
            if in_window && resample_attempts < self.config.max_resamples {
                activity.accumulate(&learned)?;
            }

            if step % self.config.log_interval == 0 || step == self.config.n_steps {
                let data = TrainMetricData::new(batch, learned, decoded);
                let mut log = loss_log;
                log.extend(self.metrics.calculate_all(&data)?);
                self.metrics.report(step, &log);
                history.push((step, log));
            }

            if step % self.config.resample_interval == 0
                && resample_attempts < self.config.max_resamples
            {
                resample_attempts += 1;
                let updates = self.resampler.resample_dead_neurons(
                    &activity,
                    store,
                    &self.autoencoder,
                    self.loss_fn.as_ref(),
                    self.config.train_batch_size,
                    self.config.resample_num_inputs,
                )?;
                activity.reset();

                if updates.is_empty() {
                    debug!("Step {step}: no dead neurons");
                    continue;
                }
                let n_dead = updates.n_dead()?;
                self.autoencoder.update_dead_neuron_parameters(&updates)?;
                // Adam moments refer to the old parameters
                optimizer = self.new_optimizer()?;

                n_resamples += 1;
                neurons_resampled += n_dead;
                info!("Step {step}: resampled {n_dead} dead neurons, optimizer reset");
            }
        }

        info!(
            "Training finished: {} steps, final loss {final_loss:.5}, {neurons_resampled} neurons resampled",
            self.config.n_steps
        );

        Ok(TrainResults {
            steps: self.config.n_steps,
            final_loss,
            n_resamples,
            neurons_resampled,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoencoder::SparseAutoencoderConfig;
    use crate::error::ResampleError;
    use crate::loss::LossReducer;
    use crate::resampler::{LossWeightedResampler, ParameterUpdateResults};
    use candle_core::{DType, Device, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    type ResampleCalls = Rc<RefCell<Vec<(Vec<u64>, ParameterUpdateResults)>>>;

    /// Loss-weighted resampler that keeps the activity and updates of each call
    struct RecordingResampler {
        inner: LossWeightedResampler,
        calls: ResampleCalls,
    }

    impl ActivationResampler for RecordingResampler {
        fn resample_dead_neurons(
            &mut self,
            neuron_activity: &NeuronActivity,
            activation_store: &TensorActivationStore,
            autoencoder: &SparseAutoencoder,
            loss_fn: &dyn LossFn,
            train_batch_size: usize,
            num_inputs: usize,
        ) -> Result<ParameterUpdateResults> {
            let updates = self.inner.resample_dead_neurons(
                neuron_activity,
                activation_store,
                autoencoder,
                loss_fn,
                train_batch_size,
                num_inputs,
            )?;
            self.calls
                .borrow_mut()
                .push((neuron_activity.counts().to_vec(), updates.clone()));
            Ok(updates)
        }
    }

    /// Constant activations of width 4
    fn constant_store(n_rows: usize) -> TensorActivationStore {
        let device = Device::Cpu;
        let mut store = TensorActivationStore::new(n_rows, 4, &device);
        store
            .extend(&Tensor::ones((n_rows, 4), DType::F32, &device).unwrap())
            .unwrap();
        store
    }

    /// 4 -> 8 autoencoder whose neurons 0 and 1 can never fire
    fn model_with_dead_neurons() -> SparseAutoencoder {
        let device = Device::Cpu;
        let model = SparseAutoencoder::new(
            SparseAutoencoderConfig {
                n_input_features: 4,
                n_learned_features: 8,
            },
            &device,
        )
        .unwrap();
        let kill = ParameterUpdateResults::new(
            Tensor::new(&[0u32, 1], &device).unwrap(),
            Tensor::zeros((2, 4), DType::F32, &device).unwrap(),
            Tensor::new(&[-100f32, -100.0], &device).unwrap(),
            Tensor::full(0.5f32, (4, 2), &device).unwrap(),
        );
        model.update_dead_neuron_parameters(&kill).unwrap();
        model
    }

    fn recording_pipeline(config: PipelineConfig) -> (Pipeline, ResampleCalls) {
        let calls: ResampleCalls = Rc::default();
        let pipeline = Pipeline::new(
            model_with_dead_neurons(),
            Box::new(LossReducer::standard(1e-3)),
            Box::new(RecordingResampler {
                inner: LossWeightedResampler::new(3),
                calls: Rc::clone(&calls),
            }),
            MetricsPipeline::standard(),
            config,
        );
        (pipeline, calls)
    }

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.resample_num_inputs, 819_200);
        assert_eq!(config.seed, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = PipelineConfig {
            train_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            resample_window: 10,
            resample_interval: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_run_reduces_loss() {
        let device = Device::Cpu;
        let mut store = TensorActivationStore::new(256, 8, &device);
        store
            .extend(&Tensor::randn(0f32, 1.0, (256, 8), &device).unwrap())
            .unwrap();

        let autoencoder = SparseAutoencoder::new(
            SparseAutoencoderConfig {
                n_input_features: 8,
                n_learned_features: 32,
            },
            &device,
        )
        .unwrap();
        let config = PipelineConfig {
            train_batch_size: 32,
            n_steps: 200,
            learning_rate: 1e-2,
            log_interval: 10,
            resample_interval: 50,
            resample_window: 25,
            max_resamples: 2,
            resample_num_inputs: 128,
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(
            autoencoder,
            Box::new(LossReducer::standard(1e-3)),
            Box::new(LossWeightedResampler::new(0)),
            MetricsPipeline::standard(),
            config,
        );

        let results = pipeline.run(&store).unwrap();
        assert_eq!(results.steps, 200);
        assert_eq!(results.history.len(), 20);
        assert!(results.n_resamples <= 2);

        let first = results.history.first().unwrap();
        let last = results.history.last().unwrap();
        let total = |log: &MetricLog| {
            log.iter()
                .find(|(name, _)| name == "total_loss")
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert!(total(&last.1) < total(&first.1));
        assert!(last.1.iter().any(|(name, _)| name == "l0_norm"));
    }

    #[test]
    fn test_run_rejects_empty_store() {
        let device = Device::Cpu;
        let store = TensorActivationStore::new(16, 4, &device);
        let autoencoder = SparseAutoencoder::new(
            SparseAutoencoderConfig {
                n_input_features: 4,
                n_learned_features: 8,
            },
            &device,
        )
        .unwrap();
        let mut pipeline = Pipeline::new(
            autoencoder,
            Box::new(LossReducer::standard(1e-3)),
            Box::new(LossWeightedResampler::new(0)),
            MetricsPipeline::standard(),
            PipelineConfig::default(),
        );
        assert!(pipeline.run(&store).is_err());
    }

    #[test]
    fn test_resample_overwrites_dead_neurons() {
        let store = constant_store(64);
        let config = PipelineConfig {
            train_batch_size: 8,
            n_steps: 10,
            log_interval: 10,
            resample_interval: 10,
            resample_window: 5,
            max_resamples: 1,
            resample_num_inputs: 32,
            ..Default::default()
        };
        let (mut pipeline, calls) = recording_pipeline(config);
        let results = pipeline.run(&store).unwrap();

        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        let (counts, updates) = &calls[0];
        let dead: Vec<u32> = updates.dead_neuron_indices.to_vec1().unwrap();
        let expected_dead: Vec<u32> = (0..8u32).filter(|&i| counts[i as usize] == 0).collect();
        assert_eq!(dead, expected_dead);
        assert!(dead.contains(&0) && dead.contains(&1));

        assert_eq!(results.n_resamples, 1);
        assert_eq!(results.neurons_resampled, dead.len());

        // Resampling ran on the last step, so no optimizer step touched the new rows
        let model = pipeline.autoencoder();
        let enc: Vec<Vec<f32>> = model.encoder_weight().to_vec2().unwrap();
        let bias: Vec<f32> = model.encoder_bias().to_vec1().unwrap();
        let dec: Vec<Vec<f32>> = model.decoder_weight().to_vec2().unwrap();
        let enc_updates: Vec<Vec<f32>> = updates.dead_encoder_weight_updates.to_vec2().unwrap();
        let dec_updates: Vec<Vec<f32>> = updates.dead_decoder_weight_updates.to_vec2().unwrap();
        for (k, &neuron) in dead.iter().enumerate() {
            let neuron = neuron as usize;
            assert_eq!(enc[neuron], enc_updates[k]);
            assert_eq!(bias[neuron], 0.0);
            for input in 0..4 {
                assert_eq!(dec[input][neuron], dec_updates[input][k]);
            }
        }
    }

    #[test]
    fn test_activity_resets_between_resamples() {
        let store = constant_store(64);
        let config = PipelineConfig {
            train_batch_size: 8,
            n_steps: 30,
            log_interval: 10,
            resample_interval: 10,
            resample_window: 5,
            max_resamples: 3,
            resample_num_inputs: 32,
            ..Default::default()
        };
        let (mut pipeline, calls) = recording_pipeline(config);
        let results = pipeline.run(&store).unwrap();

        let calls = calls.borrow();
        assert_eq!(calls.len(), 3);
        // Each pass sees only its own window: 5 steps of 8 inputs
        for (counts, _) in calls.iter() {
            assert!(counts.iter().all(|&c| c <= 40), "counts = {counts:?}");
        }

        let non_empty: Vec<usize> = calls
            .iter()
            .map(|(_, u)| u.n_dead().unwrap())
            .filter(|&n| n > 0)
            .collect();
        assert!(results.n_resamples >= 1);
        assert_eq!(results.n_resamples, non_empty.len());
        assert_eq!(results.neurons_resampled, non_empty.iter().sum::<usize>());
    }

    #[test]
    fn test_run_rejects_store_smaller_than_batch() {
        let store = constant_store(10);
        let config = PipelineConfig {
            train_batch_size: 16,
            n_steps: 20,
            log_interval: 10,
            resample_interval: 10,
            resample_window: 5,
            resample_num_inputs: 64,
            ..Default::default()
        };
        let (mut pipeline, calls) = recording_pipeline(config.clone());
        let err = pipeline.run(&store).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ResampleError>(),
            Some(ResampleError::InsufficientInputs { store_len: 10, batch_size: 16, .. })
        ));
        // Rejected before any training step
        assert!(calls.borrow().is_empty());

        // Without resampling, sampling with replacement can still train
        let (mut pipeline, _) = recording_pipeline(PipelineConfig {
            max_resamples: 0,
            ..config
        });
        assert_eq!(pipeline.run(&store).unwrap().steps, 20);
    }
}
