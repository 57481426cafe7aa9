use std::fmt;

/// Phases of a cross-validation run that report progress. The outer loop
/// fits both models and tunes the kernel ridge alpha once per split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CvProgressStage {
    /// One unit per outer train/test split, counted across all repeats.
    OuterSplits,
}

impl CvProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::OuterSplits => "outer cross-validation splits",
        }
    }
}

impl fmt::Display for CvProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Receives split counts from `run_cv`: the number of outer splits before the
/// first fit, the running count after each split is scored, and a final call
/// once every split is done. All methods default to doing nothing.
pub trait CvProgressObserver {
    fn on_stage_start(&mut self, stage: CvProgressStage, total_splits: usize) {
        let _ = (stage, total_splits);
    }
    fn on_stage_advance(&mut self, stage: CvProgressStage, completed_splits: usize) {
        let _ = (stage, completed_splits);
    }
    fn on_stage_finish(&mut self, stage: CvProgressStage) {
        let _ = stage;
    }
}

/// Observer for library callers and tests that run cross-validation silently.
#[derive(Default)]
pub struct NoopCvProgress;

impl CvProgressObserver for NoopCvProgress {}
