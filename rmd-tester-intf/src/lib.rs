// Copyright (c) Facebook, Inc. and its affiliates.
pub mod args;
pub mod settings;

pub use args::{AffinityMode, Args};
pub use settings::{PolicyType, RmdSettings, Settings};

pub const WORKLOAD_PREFIX: &str = "WL";

/// Workload and class-of-service name for workload `index`.
pub fn workload_name(index: usize) -> String {
    format!("{}{}", WORKLOAD_PREFIX, index)
}
