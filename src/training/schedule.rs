use std::f64::consts::PI;

/// Cosine annealing from `base` to `min` over `t_max` steps, stepped once per epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineAnnealing {
    base: f64,
    min: f64,
    t_max: usize,
}

impl CosineAnnealing {
    #[must_use]
    pub fn new(base: f64, min: f64, t_max: usize) -> Self {
        Self {
            base,
            min,
            t_max: t_max.max(1),
        }
    }

    /// Learning rate after `step` scheduler steps.
    #[must_use]
    pub fn lr_at(&self, step: usize) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let progress = step as f64 / self.t_max as f64;
        self.min + (self.base - self.min) * (1.0 + (PI * progress).cos()) / 2.0
    }
}
