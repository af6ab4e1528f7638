//! Learning Rate Scheduler Module
//!
//! Reduce-on-plateau: multiply the learning rate by a factor once the
//! monitored metric has stopped improving for `patience` epochs.

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;

/// Mode for plateau detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlateauMode {
    /// Metric should decrease (e.g., loss)
    Min,
    /// Metric should increase (e.g., accuracy)
    Max,
}

impl PlateauMode {
    /// Initial "best" value for this mode
    pub fn worst(self) -> f64 {
        match self {
            Self::Min => f64::INFINITY,
            Self::Max => f64::NEG_INFINITY,
        }
    }

    /// True if `metric` beats `best` by more than `min_delta`
    pub fn improves(self, metric: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Self::Min => metric < best - min_delta,
            Self::Max => metric > best + min_delta,
        }
    }
}

/// State for reduce-on-plateau scheduler
#[derive(Debug, Clone)]
pub struct ReduceOnPlateauState {
    best_metric: f64,
    epochs_without_improvement: usize,
    current_lr: f64,
    reduction_factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    mode: PlateauMode,
    last_reduced: bool,
}

impl ReduceOnPlateauState {
    pub fn new(initial_lr: f64, reduction_factor: f64, patience: usize, min_lr: f64, mode: PlateauMode) -> Self {
        Self {
            best_metric: mode.worst(),
            epochs_without_improvement: 0,
            current_lr: initial_lr,
            reduction_factor,
            patience,
            min_lr,
            min_delta: 0.0,
            mode,
            last_reduced: false,
        }
    }

    /// Monitor validation loss with the configured factor, patience and floor
    pub fn from_config(initial_lr: f64, config: &TrainingConfig) -> Self {
        Self::new(initial_lr, config.lr_factor, config.lr_patience, config.min_lr, PlateauMode::Min)
            .with_min_delta(config.min_delta)
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.max(0.0);
        self
    }

    /// Update the scheduler with a new metric value and return the new learning rate
    pub fn step(&mut self, metric: f64) -> f64 {
        self.last_reduced = false;

        if self.mode.improves(metric, self.best_metric, self.min_delta) {
            self.best_metric = metric;
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;

            if self.epochs_without_improvement >= self.patience {
                let new_lr = (self.current_lr * self.reduction_factor).max(self.min_lr);
                if new_lr < self.current_lr {
                    self.current_lr = new_lr;
                    self.last_reduced = true;
                }
                // Cooldown restarts even at the floor
                self.epochs_without_improvement = 0;
            }
        }

        self.current_lr
    }

    /// True if the last `step` lowered the rate
    pub fn lr_was_reduced(&self) -> bool {
        self.last_reduced
    }
}
