use crate::config::{AccountsConfig, expand_home};

use super::{Account, AdapterError, Accounts};

/// Credentials file an agent config directory holds after login.
pub const CREDENTIALS_FILE: &str = ".credentials.json";

/// Accounts declared under `[accounts]` in `town.toml`.
#[derive(Debug, Clone)]
pub struct ConfigAccounts {
    config: AccountsConfig,
}

impl ConfigAccounts {
    pub const fn new(config: AccountsConfig) -> Self {
        Self { config }
    }
}

impl Accounts for ConfigAccounts {
    fn resolve(&self, handle: Option<&str>) -> anyhow::Result<Option<Account>> {
        let Some(handle) = handle.or(self.config.default.as_deref()) else {
            return Ok(None);
        };
        let cfg = self
            .config
            .handles
            .get(handle)
            .ok_or_else(|| AdapterError::UnknownAccount(handle.to_string()))?;
        let auth_token = cfg
            .auth_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        Ok(Some(Account {
            handle: handle.to_string(),
            config_dir: expand_home(&cfg.config_dir),
            auth_token,
            base_url: cfg.base_url.clone(),
        }))
    }

    fn validate(&self, account: &Account) -> anyhow::Result<()> {
        if account.auth_token.is_some() {
            return Ok(());
        }
        let invalid = |reason: String| AdapterError::InvalidCredentials {
            handle: account.handle.clone(),
            reason,
        };
        if !account.config_dir.is_dir() {
            return Err(invalid(format!(
                "config dir {} does not exist",
                account.config_dir.display()
            ))
            .into());
        }
        if !account.config_dir.join(CREDENTIALS_FILE).is_file() {
            return Err(invalid(format!(
                "no {CREDENTIALS_FILE} in {} and no auth token set; log in with this account first",
                account.config_dir.display()
            ))
            .into());
        }
        Ok(())
    }
}
