//! Configuration validation.
//!
//! Serde handles syntax; this checks values. Every problem is reported, not
//! just the first.

use std::collections::HashMap;

use crate::config::schema::ServerConfig;
use crate::net::addr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listen.{field}: invalid address {address:?}: {reason}")]
    InvalidAddress {
        field: &'static str,
        address: String,
        reason: String,
    },

    #[error("listen.{field} and listen.{other} both resolve to {resolved}")]
    DuplicateAddress {
        field: &'static str,
        other: &'static str,
        resolved: String,
    },

    #[error("loopback.dial_timeout_ms must be greater than zero")]
    ZeroDialTimeout,
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashMap::new();

    for (field, address) in config.listen.entries() {
        if address.is_empty() {
            continue;
        }
        match addr::resolve(address) {
            Ok(resolved) => {
                if let Some(other) = seen.insert(resolved, field) {
                    errors.push(ValidationError::DuplicateAddress {
                        field,
                        other,
                        resolved: resolved.to_string(),
                    });
                }
            }
            Err(err) => errors.push(ValidationError::InvalidAddress {
                field,
                address: address.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    if config.loopback.dial_timeout_ms == 0 {
        errors.push(ValidationError::ZeroDialTimeout);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        validate_config(&ServerConfig::default()).unwrap();
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ServerConfig::default();
        config.listen.grpc = "127.0.0.1:7000".into();
        config.listen.http = "127.0.0.1:7000".into();
        config.listen.internal_grpc = "bogus".into();
        config.listen.internal_http = String::new();
        config.loopback.dial_timeout_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert_eq!(
            errors[0],
            ValidationError::DuplicateAddress {
                field: "http",
                other: "grpc",
                resolved: "127.0.0.1:7000".into(),
            }
        );
        assert!(matches!(
            &errors[1],
            ValidationError::InvalidAddress { field: "internal_grpc", .. }
        ));
        assert_eq!(errors[2], ValidationError::ZeroDialTimeout);
    }
}
