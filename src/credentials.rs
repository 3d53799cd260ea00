//! Provider credentials.
//!
//! Credentials are read at run start from a [`CredentialSource`] and held
//! only in memory. [`ProviderCredentials`] redacts the secret in its
//! `Debug` output so it cannot leak through logs or error chains.

use std::fmt;

use thiserror::Error;

use crate::config::CredentialsConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("feed credentials are not configured")]
    NotConfigured,
    #[error("credential environment variable {0} is not set")]
    Missing(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub username: String,
    secret: String,
}

impl ProviderCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials for the feed provider.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> Result<ProviderCredentials, CredentialError>;
}

/// Reads credentials from two environment variables named in config.
#[derive(Debug, Clone)]
pub struct EnvCredentialSource {
    username_env: String,
    secret_env: String,
}

impl EnvCredentialSource {
    pub fn new(username_env: impl Into<String>, secret_env: impl Into<String>) -> Self {
        Self {
            username_env: username_env.into(),
            secret_env: secret_env.into(),
        }
    }

    pub fn from_config(config: &CredentialsConfig) -> Result<Self, CredentialError> {
        match (&config.username_env, &config.secret_env) {
            (Some(user), Some(secret)) => Ok(Self::new(user.clone(), secret.clone())),
            _ => Err(CredentialError::NotConfigured),
        }
    }
}

fn read_env(name: &str) -> Result<String, CredentialError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(CredentialError::Missing(name.to_string())),
    }
}

impl CredentialSource for EnvCredentialSource {
    fn credentials(&self) -> Result<ProviderCredentials, CredentialError> {
        Ok(ProviderCredentials::new(
            read_env(&self.username_env)?,
            read_env(&self.secret_env)?,
        ))
    }
}

/// Fixed credentials, for tests and embedding.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub ProviderCredentials);

impl CredentialSource for StaticCredentials {
    fn credentials(&self) -> Result<ProviderCredentials, CredentialError> {
        Ok(self.0.clone())
    }
}
