// =============================================================================
// Environment configuration
// =============================================================================
//
// Everything the process reads from its environment at boot. Credentials are
// resolved indirectly: the configuration names the variables that hold them,
// and only the resolved values live in memory. Nothing here is ever
// persisted.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Resolved environment configuration for one instance.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Identity subject the control channel is keyed by.
    pub identity_sub: String,
    /// Exchange this instance competes for the lease on.
    pub exchange_id: String,
    pub exchange_name: String,

    /// Backing cache service URL (empty = in-process cache).
    pub cache_url: Option<String>,
    /// SQLite database path for the persistent store.
    pub store_path: PathBuf,
    /// User settings blob path.
    pub settings_path: PathBuf,

    /// Outbound alert webhook; alerts are log-only when unset.
    pub webhook_url: Option<String>,
    /// Optional IP-geolocation lookup endpoint for the status payload.
    pub geolocation_url: Option<String>,

    /// Exchange API credentials, resolved from the variables named by
    /// `LIVERMORE_API_KEY_VAR` / `LIVERMORE_API_SECRET_VAR`.
    pub api_key: String,
    pub api_secret: String,
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl EnvConfig {
    /// Read the full configuration from the process environment.
    ///
    /// Only the identity subject and exchange id are required; everything
    /// else has a workable default so a bare `LIVERMORE_IDENTITY_SUB` +
    /// `LIVERMORE_EXCHANGE_ID` boots an instance.
    pub fn from_env() -> Result<Self> {
        let identity_sub = std::env::var("LIVERMORE_IDENTITY_SUB")
            .context("LIVERMORE_IDENTITY_SUB must be set")?;
        let exchange_id = std::env::var("LIVERMORE_EXCHANGE_ID")
            .context("LIVERMORE_EXCHANGE_ID must be set")?;
        let exchange_name =
            optional("LIVERMORE_EXCHANGE_NAME").unwrap_or_else(|| exchange_id.clone());

        let store_path = optional("LIVERMORE_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/livermore.db"));
        let settings_path = optional("LIVERMORE_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("user_settings.json"));

        // Credentials by name: the *_VAR variables say where to look.
        let api_key_var =
            optional("LIVERMORE_API_KEY_VAR").unwrap_or_else(|| "EXCHANGE_API_KEY".into());
        let api_secret_var =
            optional("LIVERMORE_API_SECRET_VAR").unwrap_or_else(|| "EXCHANGE_API_SECRET".into());
        let api_key = optional(&api_key_var).unwrap_or_default();
        let api_secret = optional(&api_secret_var).unwrap_or_default();

        Ok(Self {
            identity_sub,
            exchange_id,
            exchange_name,
            cache_url: optional("LIVERMORE_CACHE_URL"),
            store_path,
            settings_path,
            webhook_url: optional("LIVERMORE_WEBHOOK_URL"),
            geolocation_url: optional("LIVERMORE_GEOLOCATION_URL"),
            api_key,
            api_secret,
        })
    }
}
