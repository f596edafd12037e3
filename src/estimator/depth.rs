//! Adaptive initial depth for newly created features.

use tracing::{debug, warn};

use super::config::DepthConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthAdaptation {
    Updated(f64),
    /// Median outside the configured range; initial depth left unchanged.
    OutOfRange(f64),
    NoSamples,
}

#[derive(Debug, Clone)]
pub struct AdaptiveDepth {
    init_z: f64,
    min_z: f64,
    max_z: f64,
    weight: f64,
}

impl AdaptiveDepth {
    pub fn new(config: &DepthConfig) -> Self {
        Self {
            init_z: config.init_z,
            min_z: config.min_z,
            max_z: config.max_z,
            weight: config.median_weight,
        }
    }

    /// Depth assigned to the next batch of new features.
    pub fn value(&self) -> f64 {
        self.init_z
    }

    /// Blend the median of `depths` into the initial depth.
    pub fn update(&mut self, mut depths: Vec<f64>) -> DepthAdaptation {
        let Some(median) = median(&mut depths) else {
            return DepthAdaptation::NoSamples;
        };
        if median < self.min_z || median > self.max_z {
            warn!(
                "[Depth] median depth {:.3} outside [{}, {}]; keeping {:.3}",
                median, self.min_z, self.max_z, self.init_z
            );
            return DepthAdaptation::OutOfRange(median);
        }
        self.init_z = (1.0 - self.weight) * self.init_z + self.weight * median;
        debug!("[Depth] median {:.3}, initial depth now {:.3}", median, self.init_z);
        DepthAdaptation::Updated(self.init_z)
    }
}

/// Upper median.
fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    Some(*m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> DepthConfig {
        DepthConfig {
            init_z: 2.0,
            min_z: 0.5,
            max_z: 10.0,
            median_weight: 0.5,
            min_feature_lifetime: 5,
        }
    }

    #[test]
    fn test_median_is_order_independent() {
        assert_eq!(median(&mut [5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(3.0));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn test_blends_median() {
        let mut depth = AdaptiveDepth::new(&config());
        let result = depth.update(vec![6.0, 4.0, 5.0]);

        assert_eq!(result, DepthAdaptation::Updated(3.5));
        assert_relative_eq!(depth.value(), 3.5);
    }

    #[test]
    fn test_out_of_range_median_is_ignored() {
        let mut depth = AdaptiveDepth::new(&config());

        assert_eq!(depth.update(vec![20.0, 30.0]), DepthAdaptation::OutOfRange(30.0));
        assert_eq!(depth.update(vec![0.1]), DepthAdaptation::OutOfRange(0.1));
        assert_eq!(depth.update(Vec::new()), DepthAdaptation::NoSamples);
        assert_relative_eq!(depth.value(), 2.0);
    }
}
