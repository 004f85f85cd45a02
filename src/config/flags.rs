//! Command-line flags.

use std::path::PathBuf;

use clap::Parser;

use crate::config::loader::{read_config, ConfigError};
use crate::config::schema::ServerConfig;
use crate::config::validation::validate_config;

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "switchboard", version, about = "Runs the RPC and HTTP servers")]
pub struct Flags {
    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// External RPC listen address (empty disables).
    #[arg(long = "grpc.listen", value_name = "ADDR")]
    pub grpc_listen: Option<String>,

    /// External HTTP listen address (empty disables).
    #[arg(long = "http.listen", value_name = "ADDR")]
    pub http_listen: Option<String>,

    /// Internal RPC listen address (empty disables).
    #[arg(long = "internal.grpc.listen", value_name = "ADDR")]
    pub internal_grpc_listen: Option<String>,

    /// Internal HTTP listen address (empty disables).
    #[arg(long = "internal.http.listen", value_name = "ADDR")]
    pub internal_http_listen: Option<String>,
}

impl Flags {
    /// Read the configuration file (if any), apply flag overrides and validate.
    pub fn load(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => ServerConfig::default(),
        };
        self.apply(&mut config);
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn apply(&self, config: &mut ServerConfig) {
        let listen = &mut config.listen;
        let overrides = [
            (&self.grpc_listen, &mut listen.grpc),
            (&self.http_listen, &mut listen.http),
            (&self.internal_grpc_listen, &mut listen.internal_grpc),
            (&self.internal_http_listen, &mut listen.internal_http),
        ];
        for (flag, field) in overrides {
            if let Some(value) = flag {
                *field = value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let flags = Flags::try_parse_from([
            "switchboard",
            "--http.listen",
            "127.0.0.1:8081",
            "--internal.grpc.listen=",
        ])
        .unwrap();
        let config = flags.load().unwrap();
        assert_eq!(config.listen.http, "127.0.0.1:8081");
        assert_eq!(config.listen.internal_grpc, "");
        assert_eq!(config.listen.grpc, ":9090");
    }

    #[test]
    fn invalid_flag_values_fail_validation() {
        let flags = Flags::try_parse_from(["switchboard", "--grpc.listen", "nope"]).unwrap();
        assert!(matches!(flags.load(), Err(ConfigError::Validation(errors)) if errors.len() == 1));
    }
}
