#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod cohort;
pub mod compare;
pub mod crossval;
pub mod folds;
pub mod gap;
pub mod grid;
pub mod hyperparams;
pub mod progress;
pub mod regression;

#[path = "../shared/stats.rs"]
pub mod shared_stats;
#[path = "../shared/tables.rs"]
pub mod shared_tables;
#[path = "../shared/volume.rs"]
pub mod shared_volume;
pub mod shared {
    pub use super::shared_stats as stats;
    pub use super::shared_tables as tables;
    pub use super::shared_volume as volume;
}

#[path = "../interp/mod.rs"]
pub mod interp;
