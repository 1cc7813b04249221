// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_sign_loss)] // f32 counts→u64 when value is known positive
#![allow(clippy::similar_names)] // related variables like `enc_w`/`enc_b`
#![allow(clippy::module_name_repetitions)] // SparseAutoencoderConfig in autoencoder.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! SAE-rs: sparse autoencoder training for mechanistic interpretability
//!
//! Trains sparse autoencoders on language-model activations, resampling
//! dead neurons during training and tracking sparsity metrics.
//!
//! ## Architecture
//!
//! - `activation_store`: Fixed-capacity tensor store of source activations
//! - `autoencoder`: Sparse autoencoder with tied bias and unit-norm decoder
//! - `loss`: Pluggable loss functions (MSE reconstruction, L1 sparsity, reducer)
//! - `metrics`: Training metrics (L0 norm, feature density) and reporting pipeline
//! - `resampler`: Dead-neuron resampling contract and loss-weighted resampler
//! - `pipeline`: Training loop coordinating all of the above
//! - `error`: Typed store and resampler errors

pub mod activation_store;
pub mod autoencoder;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod pipeline;
pub mod resampler;

pub use activation_store::TensorActivationStore;
pub use autoencoder::{SparseAutoencoder, SparseAutoencoderConfig};
pub use error::{ResampleError, StoreError};
pub use loss::{LearnedActivationsL1Loss, LossFn, LossReducer, LossReduction, MseReconstructionLoss};
pub use metrics::{
    FeatureDensityMetric, L0NormMetric, MetricLog, MetricsPipeline, TrainMetric, TrainMetricData,
};
pub use pipeline::{Pipeline, PipelineConfig, TrainResults};
pub use resampler::{
    resample_input_count, ActivationResampler, LossWeightedResampler, NeuronActivity,
    ParameterUpdateResults, DEFAULT_RESAMPLE_INPUTS,
};
