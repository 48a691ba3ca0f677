//! mmo_common - shared server runtime
//!
//! The layer every server process links: low-level concurrency primitives
//! and the chunked transfer protocol for payloads larger than one packet.

// ============================================
// Concurrency
// ============================================

/// Atomic facade, spinlock, mutex and condition variable
pub mod sync;
/// Fixed-capacity thread table
pub mod thread;

// ============================================
// Transfer
// ============================================

/// Chunked packet transfer (WFIFO_CHUNKED / RFIFO_CHUNKED)
pub mod chunked;
/// Per-connection FIFO buffers
pub mod session;
/// Async transport helpers
pub mod network;

// ============================================
// Ambient
// ============================================

/// Runtime configuration (YAML)
pub mod config;
/// Signals and logging setup
pub mod core;
