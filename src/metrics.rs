//! Training metrics
//!
//! Each metric turns one batch of [`TrainMetricData`] into a [`MetricLog`]:
//! an ordered list of `(name, value)` pairs. The [`MetricsPipeline`] runs a
//! set of metrics per logging step and reports them as structured `tracing`
//! events.

use anyhow::Result;
use candle_core::{DType, Tensor};
use tracing::info;

/// Ordered `(name, value)` pairs produced by a metric or loss
pub type MetricLog = Vec<(String, f64)>;

/// Batch-level data handed to every training metric
#[derive(Debug, Clone)]
pub struct TrainMetricData {
    /// Source activations, shape (batch, n_input_features)
    pub input_activations: Tensor,
    /// Learned (feature) activations, shape (batch, n_learned_features)
    pub learned_activations: Tensor,
    /// Reconstructions, shape (batch, n_input_features)
    pub decoded_activations: Tensor,
}

impl TrainMetricData {
    pub fn new(
        input_activations: Tensor,
        learned_activations: Tensor,
        decoded_activations: Tensor,
    ) -> Self {
        Self {
            input_activations,
            learned_activations,
            decoded_activations,
        }
    }
}

/// A metric computed from one training batch
pub trait TrainMetric {
    /// Compute this metric's log entries for the batch
    fn calculate(&self, data: &TrainMetricData) -> Result<MetricLog>;
}

/// L0 (sparsity) norm: mean number of non-zero learned activations per example
#[derive(Debug, Clone, Copy, Default)]
pub struct L0NormMetric;

impl L0NormMetric {
    pub const LOG_NAME: &'static str = "l0_norm";
}

impl TrainMetric for L0NormMetric {
    fn calculate(&self, data: &TrainMetricData) -> Result<MetricLog> {
        let acts = &data.learned_activations;
        let (batch, _) = acts.dims2()?;

        let nonzero: f32 = acts
            .ne(&acts.zeros_like()?)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar()?;
        let value = f64::from(nonzero) / batch as f64;

        Ok(vec![(Self::LOG_NAME.to_string(), value)])
    }
}

/// Fraction of the batch on which each learned feature fires
#[derive(Debug, Clone, Copy)]
pub struct FeatureDensityMetric {
    /// Features firing on less than this fraction of inputs count as rare
    pub threshold: f64,
}

impl Default for FeatureDensityMetric {
    fn default() -> Self {
        Self { threshold: 1e-5 }
    }
}

impl FeatureDensityMetric {
    /// Per-feature firing fraction, one entry per learned feature
    pub fn densities(acts: &Tensor) -> Result<Vec<f32>> {
        let fired = acts.gt(&acts.zeros_like()?)?.to_dtype(DType::F32)?;
        Ok(fired.mean(0)?.to_vec1()?)
    }
}

impl TrainMetric for FeatureDensityMetric {
    fn calculate(&self, data: &TrainMetricData) -> Result<MetricLog> {
        let densities = Self::densities(&data.learned_activations)?;
        anyhow::ensure!(!densities.is_empty(), "No learned features to measure");

        let mean = densities.iter().map(|&d| f64::from(d)).sum::<f64>() / densities.len() as f64;
        let below = densities
            .iter()
            .filter(|&&d| f64::from(d) < self.threshold)
            .count();

        Ok(vec![
            ("feature_density/mean".to_string(), mean),
            ("feature_density/below_threshold".to_string(), below as f64),
        ])
    }
}

/// Ordered collection of metrics evaluated together
#[derive(Default)]
pub struct MetricsPipeline {
    metrics: Vec<Box<dyn TrainMetric>>,
}

impl MetricsPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline with the standard sparsity metrics (L0 norm, feature density)
    pub fn standard() -> Self {
        Self::new()
            .with(L0NormMetric)
            .with(FeatureDensityMetric::default())
    }

    /// Add a metric to the end of the pipeline
    pub fn with<M: TrainMetric + 'static>(mut self, metric: M) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Run every metric and concatenate their logs in order
    pub fn calculate_all(&self, data: &TrainMetricData) -> Result<MetricLog> {
        let mut log = MetricLog::new();
        for metric in &self.metrics {
            log.extend(metric.calculate(data)?);
        }
        Ok(log)
    }

    /// Emit a log as a single structured event
    pub fn report(&self, step: usize, log: &MetricLog) {
        let line = log
            .iter()
            .map(|(name, value)| format!("{name}={value:.5}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "sae_rs::metrics", step, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn data_with_learned(learned: Tensor) -> TrainMetricData {
        let (batch, _) = learned.dims2().unwrap();
        let inputs = Tensor::zeros((batch, 3), DType::F32, &Device::Cpu).unwrap();
        TrainMetricData::new(inputs.clone(), learned, inputs)
    }

    fn l0(learned: Tensor) -> f64 {
        let log = L0NormMetric.calculate(&data_with_learned(learned)).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "l0_norm");
        log[0].1
    }

    #[test]
    fn test_l0_all_zero() {
        let acts = Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(l0(acts), 0.0);
    }

    #[test]
    fn test_l0_all_nonzero_equals_width() {
        let acts = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();
        assert!((l0(acts) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_l0_averages_over_batch() {
        // Row 0 has 2 active features, row 1 has 1
        let acts = Tensor::new(&[[0.5f32, 0.0, 1.2], [0.0, 0.0, -3.0]], &Device::Cpu).unwrap();
        assert!((l0(acts) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_l0_bounded_by_width() {
        let acts = Tensor::randn(0f32, 1.0, (16, 32), &Device::Cpu)
            .unwrap()
            .relu()
            .unwrap();
        let value = l0(acts);
        assert!((0.0..=32.0).contains(&value));
    }

    #[test]
    fn test_l0_rejects_wrong_rank() {
        let acts = Tensor::zeros((8,), DType::F32, &Device::Cpu).unwrap();
        let data = TrainMetricData::new(acts.clone(), acts.clone(), acts);
        assert!(L0NormMetric.calculate(&data).is_err());
    }

    #[test]
    fn test_feature_density() {
        // Feature 0 fires on every row, feature 1 on half, feature 2 never
        let acts = Tensor::new(
            &[[1f32, 1.0, 0.0], [1.0, 0.0, 0.0], [2.0, 3.0, 0.0], [1.0, 0.0, 0.0]],
            &Device::Cpu,
        )
        .unwrap();
        let densities = FeatureDensityMetric::densities(&acts).unwrap();
        assert_eq!(densities, vec![1.0, 0.5, 0.0]);

        let log = FeatureDensityMetric::default()
            .calculate(&data_with_learned(acts))
            .unwrap();
        assert_eq!(log[0].0, "feature_density/mean");
        assert!((log[0].1 - 0.5).abs() < 1e-6);
        assert_eq!(log[1], ("feature_density/below_threshold".to_string(), 1.0));
    }

    #[test]
    fn test_pipeline_concatenates_in_order() {
        let pipeline = MetricsPipeline::standard();
        assert_eq!(pipeline.len(), 2);

        let acts = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let log = pipeline.calculate_all(&data_with_learned(acts)).unwrap();
        let names: Vec<&str> = log.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "l0_norm",
                "feature_density/mean",
                "feature_density/below_threshold"
            ]
        );
        pipeline.report(0, &log);
    }
}
