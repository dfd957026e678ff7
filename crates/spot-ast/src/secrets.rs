//! The `SecretsProvider` collaborator (spec §6): a narrow, synchronous
//! `Get(key) -> (value, err)` contract. Backends (env, vault, cloud) live
//! outside this crate; only the trait object travels with a `Playbook`.

use std::fmt;

#[derive(Debug, Clone)]
pub struct SecretsError(pub String);

impl fmt::Display for SecretsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SecretsError {}

/// External secrets collaborator. Implementations are expected to be cheap
/// to call repeatedly; the loader calls `get` once per distinct declared key.
pub trait SecretsProvider: Send + Sync {
    fn get(&self, key: &str) -> Result<String, SecretsError>;
}
