//! Configuration for the ingestion and query paths
//!
//! Values come from environment variables with defaults; the CLI loads a
//! `.env` file first.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{PipelineError, Result};
use crate::ingestion::encoder::{DEFAULT_CAPACITY, DEFAULT_HEADROOM};

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

/// Batch Stream Publisher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Destination stream for every event.
    pub stream_name: String,

    /// Records per publish call.
    pub batch_size: usize,

    /// Partition count requested when the stream has to be created.
    pub min_partitions: u32,

    /// Encode buffer window in bytes.
    pub buffer_capacity: usize,

    pub buffer_headroom: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            stream_name: "events".to_string(),
            batch_size: 500,
            min_partitions: 1,
            buffer_capacity: DEFAULT_CAPACITY,
            buffer_headroom: DEFAULT_HEADROOM,
        }
    }
}

impl PublisherConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            stream_name: std::env::var("DATAPLANE_STREAM").unwrap_or(defaults.stream_name),
            batch_size: env_or("DATAPLANE_BATCH_SIZE", defaults.batch_size)?,
            min_partitions: env_or("DATAPLANE_MIN_PARTITIONS", defaults.min_partitions)?,
            buffer_capacity: env_or("DATAPLANE_BUFFER_CAPACITY", defaults.buffer_capacity)?,
            buffer_headroom: defaults.buffer_headroom,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be positive".to_string()));
        }
        if self.min_partitions == 0 {
            return Err(PipelineError::Config("min_partitions must be positive".to_string()));
        }
        if self.stream_name.is_empty() {
            return Err(PipelineError::Config("stream_name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Query Execution Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Queries allowed to run at once; the rest queue.
    pub max_concurrent_queries: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 16,
        }
    }
}

impl QueryConfig {
    pub fn from_env() -> Result<Self> {
        let max_concurrent_queries = env_or("DATAPLANE_MAX_QUERIES", Self::default().max_concurrent_queries)?;
        if max_concurrent_queries == 0 {
            return Err(PipelineError::Config(
                "DATAPLANE_MAX_QUERIES must be positive".to_string(),
            ));
        }
        Ok(Self {
            max_concurrent_queries,
        })
    }
}
