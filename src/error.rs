//! Typed errors for the activation store and the resampler.
//!
//! Public APIs return `anyhow::Result`; these enums ride inside the
//! `anyhow::Error` so callers can `downcast_ref` when they need to branch.

use thiserror::Error;

/// Errors raised by [`TensorActivationStore`](crate::TensorActivationStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Activation store is full: {len} + {incoming} items exceeds capacity {max_items}")]
    Full {
        len: usize,
        incoming: usize,
        max_items: usize,
    },

    #[error("Activation width {got} does not match store width {expected}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Index {index} out of range (store holds {len} items)")]
    OutOfRange { index: usize, len: usize },

    #[error("Activation store is empty")]
    Empty,
}

/// Errors raised while resampling dead neurons.
#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("resample_dead_neurons is not implemented for {resampler}")]
    NotImplemented { resampler: &'static str },

    #[error(
        "Cannot resample with {num_inputs} inputs: store holds {store_len} items, \
         batch size is {batch_size}"
    )]
    InsufficientInputs {
        num_inputs: usize,
        store_len: usize,
        batch_size: usize,
    },

    #[error("Neuron activity covers {activity} neurons, autoencoder has {learned}")]
    ActivityMismatch { activity: usize, learned: usize },
}
