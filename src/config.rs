//! Shared runtime configuration
//!
//! Parsed from YAML with serde_yaml. Every field has a default, so an empty
//! document is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use std::hash::Hash;

use crate::chunked::{
    max_chunk_size, ChunkPrefix, ChunkReassembler, CorrelationId, WFIFO_CHUNK_SIZE, WFIFO_CLIENT_CHUNK_SIZE,
};
use crate::thread::{DEFAULT_STACK_SIZE, THREADS_MAX};

/// Transfers one connection may have open at once
pub const DEFAULT_MAX_PENDING_TRANSFERS: usize = 64;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonConfig {
    /// tracing EnvFilter directive, overridden by RUST_LOG
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub chunk: ChunkConfig,

    #[serde(default)]
    pub threads: ThreadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_inter_server_chunk_size")]
    pub inter_server_chunk_size: usize,

    #[serde(default = "default_client_chunk_size")]
    pub client_chunk_size: usize,

    /// Per-transfer payload cap; 0 disables it. Consumers with their own
    /// cap (emblem uploads take 65,000) set it per reassembler.
    #[serde(default)]
    pub max_assembled_size: usize,

    /// Open transfers per connection; 0 disables the limit
    #[serde(default = "default_max_pending_transfers")]
    pub max_pending_transfers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Table capacity including the main thread's slot
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// How long `destroy` waits for a worker to notice cancellation
    #[serde(default = "default_destroy_grace_ms")]
    pub destroy_grace_ms: u64,
}

// ============================================
// Default value functions
// ============================================

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_inter_server_chunk_size() -> usize {
    WFIFO_CHUNK_SIZE
}

fn default_client_chunk_size() -> usize {
    WFIFO_CLIENT_CHUNK_SIZE
}

fn default_max_pending_transfers() -> usize {
    DEFAULT_MAX_PENDING_TRANSFERS
}

fn default_max_threads() -> usize {
    THREADS_MAX
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_destroy_grace_ms() -> u64 {
    5000
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            inter_server_chunk_size: default_inter_server_chunk_size(),
            client_chunk_size: default_client_chunk_size(),
            max_assembled_size: 0,
            max_pending_transfers: default_max_pending_transfers(),
        }
    }
}

impl ChunkConfig {
    /// Size limit for reassembly, `None` when disabled.
    pub fn assembled_limit(&self) -> Option<usize> {
        (self.max_assembled_size > 0).then_some(self.max_assembled_size)
    }

    /// Open-transfer cap, `None` when disabled.
    pub fn pending_limit(&self) -> Option<usize> {
        (self.max_pending_transfers > 0).then_some(self.max_pending_transfers)
    }

    /// Reassembler carrying both configured limits.
    pub fn reassembler<P: ChunkPrefix + Copy + Eq + Hash>(&self) -> ChunkReassembler<P> {
        ChunkReassembler::with_limits(self.assembled_limit(), self.pending_limit())
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            stack_size: default_stack_size(),
            destroy_grace_ms: default_destroy_grace_ms(),
        }
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            chunk: ChunkConfig::default(),
            threads: ThreadConfig::default(),
        }
    }
}

impl CommonConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: CommonConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        // An empty document parses as null, not as an empty mapping
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: CommonConfig = serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let max_chunk = max_chunk_size::<CorrelationId>();

        for (name, size) in [
            ("inter_server_chunk_size", self.chunk.inter_server_chunk_size),
            ("client_chunk_size", self.chunk.client_chunk_size),
        ] {
            anyhow::ensure!(size > 0, "{} must be positive", name);
            anyhow::ensure!(
                size <= max_chunk,
                "{} too large: {} (max {})",
                name,
                size,
                max_chunk
            );
        }

        anyhow::ensure!(
            self.threads.max_threads >= 2,
            "max_threads must leave room for a worker: {}",
            self.threads.max_threads
        );
        anyhow::ensure!(
            self.threads.stack_size >= crate::thread::page_size(),
            "stack_size smaller than one page: {}",
            self.threads.stack_size
        );

        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self).context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}
