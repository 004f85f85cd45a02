//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → flags.rs (command-line overrides)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → Server::new
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod flags;
pub mod loader;
pub mod schema;
pub mod validation;

pub use flags::Flags;
pub use loader::{load_config, ConfigError};
pub use schema::{HttpConfig, ListenConfig, LoopbackConfig, ServerConfig};
pub use validation::{validate_config, ValidationError};
