//! Environment configuration

use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::DEFAULT_BILLING_ACCOUNT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Which billing provider backs subscriptions
#[derive(Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// One Stripe secret key per billing account
    Stripe { accounts: BTreeMap<String, String> },
    /// In-memory provider for local development
    Mock,
}

impl std::fmt::Debug for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stripe { accounts } => {
                let names: Vec<&str> = accounts.keys().map(String::as_str).collect();
                write!(f, "Stripe {{ accounts: {:?}, secret_keys: [REDACTED] }}", names)
            }
            Self::Mock => write!(f, "Mock"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub provider: ProviderKind,
    /// Cron expression for provider reconciliation
    pub reconcile_cron: String,
    /// Cron expression for invariant checks
    pub invariant_cron: String,
    /// Cron expression for the billing cycle rollover pass
    pub rollover_cron: String,
}

/// Parse `account=key` pairs separated by commas
fn parse_account_keys(value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut accounts = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((account, key)) if !account.trim().is_empty() && !key.trim().is_empty() => {
                accounts.insert(account.trim().to_string(), key.trim().to_string());
            }
            _ => {
                return Err(ConfigError::Invalid {
                    key: "STRIPE_SECRET_KEYS",
                    message: "expected comma separated account=key pairs".to_string(),
                })
            }
        }
    }
    Ok(accounts)
}

impl Config {
    pub const DEFAULT_RECONCILE_CRON: &'static str = "0 */15 * * * *";
    pub const DEFAULT_INVARIANT_CRON: &'static str = "0 0 * * * *";
    pub const DEFAULT_ROLLOVER_CRON: &'static str = "0 0 2 * * *";

    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = var("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let database_max_connections = match var("DATABASE_MAX_CONNECTIONS") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                message: format!("'{}' is not a number", v),
            })?,
            None => 5,
        };

        let mut accounts = match var("STRIPE_SECRET_KEYS") {
            Some(v) => parse_account_keys(&v)?,
            None => BTreeMap::new(),
        };
        if let Some(secret_key) = var("STRIPE_SECRET_KEY").filter(|v| !v.is_empty()) {
            accounts.insert(DEFAULT_BILLING_ACCOUNT.to_string(), secret_key);
        }

        let provider = match var("BILLING_PROVIDER").as_deref() {
            Some("mock") => ProviderKind::Mock,
            Some("stripe") | None if !accounts.is_empty() => ProviderKind::Stripe { accounts },
            Some("stripe") | None => return Err(ConfigError::Missing("STRIPE_SECRET_KEY")),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "BILLING_PROVIDER",
                    message: format!("expected 'stripe' or 'mock', got '{}'", other),
                })
            }
        };

        Ok(Self {
            database_url,
            database_max_connections,
            provider,
            reconcile_cron: var("RECONCILE_CRON")
                .unwrap_or_else(|| Self::DEFAULT_RECONCILE_CRON.to_string()),
            invariant_cron: var("INVARIANT_CRON")
                .unwrap_or_else(|| Self::DEFAULT_INVARIANT_CRON.to_string()),
            rollover_cron: var("ROLLOVER_CRON")
                .unwrap_or_else(|| Self::DEFAULT_ROLLOVER_CRON.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_database_url_required() {
        let err = load(&[("BILLING_PROVIDER", "mock")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_stripe_is_default_provider() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/squarelet"),
            ("STRIPE_SECRET_KEY", "sk_test_123"),
        ])
        .unwrap();
        assert_eq!(
            config.provider,
            ProviderKind::Stripe {
                accounts: BTreeMap::from([("muckrock".to_string(), "sk_test_123".to_string())])
            }
        );
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.reconcile_cron, Config::DEFAULT_RECONCILE_CRON);
        assert_eq!(config.rollover_cron, Config::DEFAULT_ROLLOVER_CRON);
        assert!(!format!("{:?}", config).contains("sk_test_123"));
    }

    #[test]
    fn test_missing_stripe_key_is_an_error() {
        let err = load(&[("DATABASE_URL", "postgres://localhost/squarelet")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STRIPE_SECRET_KEY")));
    }

    #[test]
    fn test_mock_provider_and_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/squarelet"),
            ("BILLING_PROVIDER", "mock"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("RECONCILE_CRON", "0 0 * * * *"),
        ])
        .unwrap();
        assert_eq!(config.provider, ProviderKind::Mock);
        assert_eq!(config.database_max_connections, 12);
        assert_eq!(config.reconcile_cron, "0 0 * * * *");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[
            ("DATABASE_URL", "postgres://localhost/squarelet"),
            ("BILLING_PROVIDER", "mock"),
            ("DATABASE_MAX_CONNECTIONS", "many"),
        ])
        .is_err());
        assert!(load(&[
            ("DATABASE_URL", "postgres://localhost/squarelet"),
            ("BILLING_PROVIDER", "paypal"),
        ])
        .is_err());
    }

    #[test]
    fn test_secret_key_per_billing_account() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/squarelet"),
            ("STRIPE_SECRET_KEYS", "presspass=sk_test_press, muckrock=sk_test_old"),
            ("STRIPE_SECRET_KEY", "sk_test_muck"),
        ])
        .unwrap();
        let ProviderKind::Stripe { accounts } = &config.provider else {
            panic!("expected stripe provider");
        };
        assert_eq!(accounts.get("presspass").map(String::as_str), Some("sk_test_press"));
        assert_eq!(accounts.get("muckrock").map(String::as_str), Some("sk_test_muck"));

        let debug = format!("{:?}", config);
        assert!(debug.contains("presspass"));
        assert!(!debug.contains("sk_test_press"));

        assert!(load(&[
            ("DATABASE_URL", "postgres://localhost/squarelet"),
            ("STRIPE_SECRET_KEYS", "presspass"),
        ])
        .is_err());
    }
}
