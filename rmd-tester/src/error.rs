// Copyright (c) Facebook, Inc. and its affiliates.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RMD connection failed: {0}")]
    Connection(String),
    #[error("cacheway for {0:?} already exists")]
    DuplicateAllocation(String),
    #[error("failed to {op} {path:?} ({source})")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start {name} ({cause:#})")]
    Spawn { name: String, cause: anyhow::Error },
    #[error("failed to kill {name} ({cause:#})")]
    Kill { name: String, cause: anyhow::Error },
    #[error("affinity: {0}")]
    Affinity(String),
    #[error("workload index {index} out of range, {count} configured")]
    Index { index: usize, count: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
