//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop (net/listener.rs):
//!     accept() fails
//!     → backoff.rs classifies the error (transient or fatal)
//!     → transient: sleep 1ms, 2ms, 4ms ... capped at 1s, then retry
//!     → fatal: serve loop ends and reports the error
//! ```
//!
//! # Design Decisions
//! - No jitter: a listener retries alone, there is no herd to spread
//! - Backoff resets after any successful accept

pub mod backoff;
