//! Periodic refresh of the per-pod GPU memory gauges
//!
//! Each cycle lists pods, enumerates their container processes, queries the
//! GPU devices, attributes device processes to pods and publishes the result.

mod r#loop;


pub use r#loop::{
    CycleOutcome, CycleReport, RefreshConfig, RefreshLoop, RefreshLoopBuilder, RefreshState,
    RefreshStateHandle,
};
