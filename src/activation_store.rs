//! Tensor-backed activation store
//!
//! Holds source-model activations as a list of `[n, n_neurons]` chunks on a
//! single device. Chunks are concatenated lazily when a contiguous view is
//! needed (sampling, resampling, shuffling) and the result is cached until the
//! next write, so appending stays cheap and training does not re-concatenate.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use safetensors::tensor::SafeTensors;
use tracing::{debug, info};

use crate::error::StoreError;

/// Fixed-capacity store of activation vectors
#[derive(Debug)]
pub struct TensorActivationStore {
    /// Stored chunks, each shape (n, n_neurons), F32
    chunks: Vec<Tensor>,
    /// Total rows across all chunks
    len: usize,
    max_items: usize,
    n_neurons: usize,
    device: Device,
    /// Concatenation of `chunks`, cleared on every write
    merged: OnceLock<Tensor>,
}

impl TensorActivationStore {
    /// Create an empty store for at most `max_items` vectors of width `n_neurons`
    pub fn new(max_items: usize, n_neurons: usize, device: &Device) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            max_items,
            n_neurons,
            device: device.clone(),
            merged: OnceLock::new(),
        }
    }

    /// Load a 2D activation tensor from a safetensors file.
    ///
    /// The tensor is converted to F32. `max_items` caps the store capacity; if
    /// the file holds more rows than that, only the first `max_items` are kept.
    pub fn from_safetensors(
        path: &Path,
        tensor_name: &str,
        max_items: Option<usize>,
        device: &Device,
    ) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read activation file {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;
        let view = st
            .tensor(tensor_name)
            .with_context(|| format!("Tensor '{tensor_name}' not found in {}", path.display()))?;
        let tensor = tensor_from_view(&view, device)?.to_dtype(DType::F32)?;

        let (n_items, n_neurons) = tensor.dims2().with_context(|| {
            format!(
                "Expected 2D activations [n_items, n_neurons], got {:?}",
                tensor.dims()
            )
        })?;
        let capacity = max_items.unwrap_or(n_items);
        let kept = n_items.min(capacity);

        let mut store = Self::new(capacity, n_neurons, device);
        store.extend(&tensor.narrow(0, 0, kept)?)?;
        info!(
            "Loaded {kept}/{n_items} activations of width {n_neurons} from {}",
            path.display()
        );
        Ok(store)
    }

    /// Append a batch of activations, shape (n, n_neurons)
    pub fn extend(&mut self, batch: &Tensor) -> Result<()> {
        let (incoming, width) = batch.dims2()?;
        if width != self.n_neurons {
            return Err(StoreError::ShapeMismatch {
                expected: self.n_neurons,
                got: width,
            }
            .into());
        }
        if self.len + incoming > self.max_items {
            return Err(StoreError::Full {
                len: self.len,
                incoming,
                max_items: self.max_items,
            }
            .into());
        }
        if incoming == 0 {
            return Ok(());
        }

        let chunk = batch.to_dtype(DType::F32)?.to_device(&self.device)?;
        self.chunks.push(chunk);
        self.merged.take();
        self.len += incoming;
        debug!("Store: +{incoming} items ({}/{})", self.len, self.max_items);
        Ok(())
    }

    /// Append a single activation vector, shape (n_neurons,)
    pub fn push(&mut self, item: &Tensor) -> Result<()> {
        self.extend(&item.unsqueeze(0)?)
    }

    /// Get a single activation vector, shape (n_neurons,)
    pub fn get(&self, index: usize) -> Result<Tensor> {
        if index >= self.len {
            return Err(StoreError::OutOfRange {
                index,
                len: self.len,
            }
            .into());
        }
        let mut offset = index;
        for chunk in &self.chunks {
            let rows = chunk.dim(0)?;
            if offset < rows {
                return Ok(chunk.get(offset)?);
            }
            offset -= rows;
        }
        Err(StoreError::OutOfRange {
            index,
            len: self.len,
        }
        .into())
    }

    /// All stored activations as one tensor, shape (len, n_neurons)
    pub fn as_tensor(&self) -> Result<Tensor> {
        if let Some(merged) = self.merged.get() {
            return Ok(merged.clone());
        }
        let merged = match self.chunks.as_slice() {
            [] => return Err(StoreError::Empty.into()),
            [single] => single.clone(),
            chunks => Tensor::cat(chunks, 0)?,
        };
        Ok(self.merged.get_or_init(|| merged).clone())
    }

    /// The first `n` stored activations, shape (n, n_neurons)
    pub fn first_n(&self, n: usize) -> Result<Tensor> {
        anyhow::ensure!(
            n <= self.len,
            "Requested {n} items but store holds {}",
            self.len
        );
        Ok(self.as_tensor()?.narrow(0, 0, n)?)
    }

    /// Sample a random batch (with replacement), shape (batch_size, n_neurons)
    pub fn sample_batch<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Result<Tensor> {
        if self.is_empty() {
            return Err(StoreError::Empty.into());
        }
        let ids: Vec<u32> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.len) as u32)
            .collect();
        let ids = Tensor::from_vec(ids, (batch_size,), &self.device)?;
        Ok(self.as_tensor()?.index_select(&ids, 0)?)
    }

    /// Shuffle stored rows in place (collapses chunks into one)
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        if self.len < 2 {
            return Ok(());
        }
        let mut order: Vec<u32> = (0..self.len as u32).collect();
        order.shuffle(rng);
        let ids = Tensor::from_vec(order, (self.len,), &self.device)?;
        let shuffled = self.as_tensor()?.index_select(&ids, 0)?;
        self.chunks = vec![shuffled];
        self.merged.take();
        Ok(())
    }

    /// Drop all stored activations, keeping capacity settings
    pub fn empty(&mut self) {
        self.chunks.clear();
        self.merged.take();
        self.len = 0;
    }

    /// Number of stored activation vectors
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of items the store accepts
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Width of each activation vector
    pub fn n_neurons(&self) -> usize {
        self.n_neurons
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported activation dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rows(n: usize, width: usize, start: f32) -> Tensor {
        let data: Vec<f32> = (0..n * width).map(|i| start + i as f32).collect();
        Tensor::from_vec(data, (n, width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_store_extend_and_get() {
        let mut store = TensorActivationStore::new(10, 3, &Device::Cpu);
        assert!(store.is_empty());

        store.extend(&rows(2, 3, 0.0)).unwrap();
        store.extend(&rows(3, 3, 100.0)).unwrap();
        assert_eq!(store.len(), 5);

        // Row 3 is the second row of the second chunk
        let item: Vec<f32> = store.get(3).unwrap().to_vec1().unwrap();
        assert_eq!(item, vec![103.0, 104.0, 105.0]);

        assert_eq!(store.as_tensor().unwrap().dims(), &[5, 3]);
        assert_eq!(store.first_n(4).unwrap().dims(), &[4, 3]);
        assert!(store.first_n(6).is_err());
    }

    #[test]
    fn test_store_rejects_overflow() {
        let mut store = TensorActivationStore::new(4, 3, &Device::Cpu);
        store.extend(&rows(3, 3, 0.0)).unwrap();

        let err = store.extend(&rows(2, 3, 0.0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Full { len: 3, incoming: 2, max_items: 4 })
        ));
        // Failed extend leaves the store untouched
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_store_rejects_wrong_width() {
        let mut store = TensorActivationStore::new(4, 3, &Device::Cpu);
        let err = store.extend(&rows(1, 5, 0.0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ShapeMismatch { expected: 3, got: 5 })
        ));
    }

    #[test]
    fn test_store_push_and_out_of_range() {
        let mut store = TensorActivationStore::new(4, 2, &Device::Cpu);
        let item = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        store.push(&item).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(1).is_err());
    }

    #[test]
    fn test_store_sample_and_shuffle() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut store = TensorActivationStore::new(16, 2, &Device::Cpu);
        store.extend(&rows(8, 2, 0.0)).unwrap();

        let batch = store.sample_batch(5, &mut rng).unwrap();
        assert_eq!(batch.dims(), &[5, 2]);

        let before: f32 = store.as_tensor().unwrap().sum_all().unwrap().to_scalar().unwrap();
        store.shuffle(&mut rng).unwrap();
        let after: f32 = store.as_tensor().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(store.len(), 8);
        assert!((before - after).abs() < 1e-3);

        store.empty();
        assert!(store.is_empty());
        assert!(store.sample_batch(1, &mut rng).is_err());
    }

    #[test]
    fn test_store_merges_chunks_once_per_write() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let mut store = TensorActivationStore::new(16, 2, &Device::Cpu);
        store.extend(&rows(2, 2, 0.0)).unwrap();
        store.extend(&rows(3, 2, 10.0)).unwrap();

        let merged = store.as_tensor().unwrap();
        assert_eq!(store.as_tensor().unwrap().id(), merged.id());
        store.sample_batch(4, &mut rng).unwrap();
        assert_eq!(store.as_tensor().unwrap().id(), merged.id());

        // A write invalidates the cached view
        store.extend(&rows(1, 2, 20.0)).unwrap();
        let grown = store.as_tensor().unwrap();
        assert_ne!(grown.id(), merged.id());
        assert_eq!(grown.dims(), &[6, 2]);
        let last: Vec<f32> = grown.get(5).unwrap().to_vec1().unwrap();
        assert_eq!(last, vec![20.0, 21.0]);

        store.empty();
        assert!(store.as_tensor().is_err());
    }
}
