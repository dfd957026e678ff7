//! Concrete `SecretsProvider` implementations (spec §6).
//!
//! The trait itself lives in `spot_ast::secrets` since `Playbook` carries a
//! trait object of it; this module holds the two backends the core ships
//! with -- everything else (vault, cloud) is an external collaborator per
//! §1 "Explicitly out of scope".

use spot_ast::{SecretsError, SecretsProvider};
use std::collections::HashMap;

/// Looks up `std::env::var(key)`.
#[derive(Debug, Default)]
pub struct EnvSecrets;

impl SecretsProvider for EnvSecrets {
    fn get(&self, key: &str) -> Result<String, SecretsError> {
        std::env::var(key).map_err(|_| SecretsError(format!("secret {key} not set in environment")))
    }
}

/// `HashMap`-backed provider, primarily for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets(pub HashMap<String, String>);

impl SecretsProvider for StaticSecrets {
    fn get(&self, key: &str) -> Result<String, SecretsError> {
        self.0
            .get(key)
            .cloned()
            .ok_or_else(|| SecretsError(format!("secret {key} not found")))
    }
}
