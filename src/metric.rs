use core::marker::PhantomData;

use burn::prelude::*;
use burn::tensor::ElementConversion;
use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::{Metric, MetricEntry, MetricMetadata, Numeric};

/// Smoothing constant guarding against empty unions.
const SMOOTH: f64 = 1.0;

/// The [IoU metric](IoUMetric) input type.
pub struct IoUInput<B: Backend> {
    /// Predicted mask probabilities, `[batch_size, 1, height, width]`.
    probabilities: Tensor<B, 4>,
    /// Ground truth masks, `[batch_size, height, width]`, values in {0, 1}.
    targets: Tensor<B, 3, Int>,
}

impl<B: Backend> IoUInput<B> {
    /// Creates the input.
    pub fn new(probabilities: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        Self {
            probabilities,
            targets,
        }
    }
}

/// Intersection-over-union metric for binary segmentation masks.
///
/// The plain variant computes a soft IoU over the raw probabilities; the
/// [thresholded](IoUMetric::thresholded) variant binarizes the predictions
/// first.
#[derive(Default)]
pub struct IoUMetric<B: Backend> {
    state: NumericMetricState,
    threshold: Option<f64>,
    _b: PhantomData<B>,
}

impl<B: Backend> IoUMetric<B> {
    /// Creates the metric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the metric with predictions binarized at 0.5.
    pub fn thresholded() -> Self {
        Self {
            threshold: Some(0.5),
            ..Self::default()
        }
    }
}

impl<B: Backend> Metric for IoUMetric<B> {
    type Input = IoUInput<B>;

    fn name(&self) -> String {
        match self.threshold {
            Some(threshold) => format!("IoU @ {threshold:.2}"),
            None => "IoU".to_string(),
        }
    }

    fn update(&mut self, input: &IoUInput<B>, _metadata: &MetricMetadata) -> MetricEntry {
        let [batch_size, _channels, height, width] = input.probabilities.dims();

        let predictions = input
            .probabilities
            .clone()
            .reshape([batch_size, height, width]);
        let predictions = match self.threshold {
            Some(threshold) => predictions.greater_elem(threshold).float(),
            None => predictions,
        };
        let targets = input.targets.clone().float();

        let intersection = (predictions.clone() * targets.clone())
            .sum()
            .into_scalar()
            .elem::<f64>();
        let predictions_sum = predictions.sum().into_scalar().elem::<f64>();
        let targets_sum = targets.sum().into_scalar().elem::<f64>();

        let union = predictions_sum + targets_sum - intersection;
        let iou = (intersection + SMOOTH) / (union + SMOOTH);

        self.state.update(
            iou,
            batch_size,
            FormatOptions::new(self.name()).precision(4),
        )
    }

    fn clear(&mut self) {
        self.state.reset()
    }
}

impl<B: Backend> Numeric for IoUMetric<B> {
    fn value(&self) -> f64 {
        self.state.value()
    }
}
