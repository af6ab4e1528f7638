//! Epoch-end callbacks for the fit loop
//!
//! - `EarlyStopping`: stop when val_loss stalls, remembering the best epoch
//! - `BestCheckpoint`: track the best val_accuracy across all phases

use serde::{Deserialize, Serialize};

use crate::training::scheduler::PlateauMode;

/// What the fit loop should do after an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopDecision {
    /// This epoch is the new best; snapshot the weights
    pub improved: bool,
    pub should_stop: bool,
}

/// Early stopping on a monitored metric
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    mode: PlateauMode,
    best_metric: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64, mode: PlateauMode) -> Self {
        Self {
            patience,
            min_delta: min_delta.max(0.0),
            mode,
            best_metric: mode.worst(),
            best_epoch: None,
            wait: 0,
        }
    }

    /// Monitor validation loss
    pub fn on_val_loss(patience: usize, min_delta: f64) -> Self {
        Self::new(patience, min_delta, PlateauMode::Min)
    }

    pub fn step(&mut self, epoch: usize, metric: f64) -> StopDecision {
        if self.mode.improves(metric, self.best_metric, self.min_delta) {
            self.best_metric = metric;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision {
                improved: true,
                should_stop: false,
            };
        }

        self.wait += 1;
        StopDecision {
            improved: false,
            should_stop: self.wait >= self.patience,
        }
    }

    pub fn best_metric(&self) -> f64 {
        self.best_metric
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}

/// Tracks the highest validation accuracy seen so far
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BestCheckpoint {
    pub best_accuracy: Option<f64>,
    pub best_epoch: Option<usize>,
}

impl BestCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `accuracy` is a new best and a checkpoint should be written
    pub fn update(&mut self, epoch: usize, accuracy: f64) -> bool {
        let improved = match self.best_accuracy {
            Some(best) => accuracy > best,
            None => true,
        };
        if improved {
            self.best_accuracy = Some(accuracy);
            self.best_epoch = Some(epoch);
        }
        improved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_patience() {
        let mut es = EarlyStopping::on_val_loss(2, 0.0);
        assert!(es.step(1, 1.0).improved);
        assert!(es.step(2, 0.8).improved);
        assert_eq!(
            es.step(3, 0.9),
            StopDecision { improved: false, should_stop: false }
        );
        assert!(es.step(4, 0.85).should_stop);
        assert_eq!(es.best_epoch(), Some(2));
        assert_eq!(es.best_metric(), 0.8);
    }

    #[test]
    fn test_improvement_resets_wait() {
        let mut es = EarlyStopping::on_val_loss(2, 0.0);
        es.step(1, 1.0);
        es.step(2, 1.1);
        assert!(es.step(3, 0.5).improved);
        assert!(!es.step(4, 0.6).should_stop);
    }

    #[test]
    fn test_nan_loss_never_improves() {
        let mut es = EarlyStopping::on_val_loss(1, 0.0);
        es.step(1, 1.0);
        assert!(es.step(2, f64::NAN).should_stop);
    }

    #[test]
    fn test_best_checkpoint() {
        let mut best = BestCheckpoint::new();
        assert!(best.update(1, 0.0));
        assert!(best.update(2, 0.5));
        assert!(!best.update(3, 0.5));
        assert!(!best.update(4, 0.4));
        assert!(best.update(5, 0.9));
        assert_eq!(best.best_epoch, Some(5));
        assert_eq!(best.best_accuracy, Some(0.9));
    }
}
