// =============================================================================
// Persistent store seam
// =============================================================================
//
// Only alerts and the user settings blob are durable in this engine —
// candles and indicator values live exclusively in the cache.

pub mod sqlite;

use async_trait::async_trait;

use crate::settings::UserSettings;
use crate::types::AlertRecord;

#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Insert an immutable alert record; returns its id.
    async fn insert_alert(&self, record: &AlertRecord) -> anyhow::Result<String>;

    /// Load the settings blob for one identity, if it exists.
    async fn load_settings(&self, identity_sub: &str) -> anyhow::Result<Option<UserSettings>>;

    /// Upsert the settings blob for one identity.
    async fn save_settings(
        &self,
        identity_sub: &str,
        settings: &UserSettings,
    ) -> anyhow::Result<()>;
}
