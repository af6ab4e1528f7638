//! Training: the fit loop, its callbacks and the staged pipeline

pub mod callbacks;
pub mod history;
pub mod pipeline;
pub mod scheduler;
pub mod trainer;

pub use callbacks::{BestCheckpoint, EarlyStopping, StopDecision};
pub use history::{EpochMetrics, TrainingHistory, TrainingPhase};
pub use pipeline::{run_pipeline, PipelineStage, TrainingOutcome};
pub use scheduler::{PlateauMode, ReduceOnPlateauState};
pub use trainer::{evaluate, run_phase, EvalOutput, FitData, PhaseSettings};
