//! OAuth token persistence (§6 "Persisted state layout (token store)").

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// The token record persisted between restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedTokens {
    /// Current access token.
    pub access_token: String,
    /// Current refresh token.
    pub refresh_token: String,
    /// Absolute expiry of `access_token`.
    pub expires_at: DateTime<Utc>,
    /// Scopes granted to `access_token`, if known at persist time.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

/// Persistence boundary for OAuth tokens. A real deployment's choice of storage (file, KV store,
/// secrets manager) implements this; [`JsonFileTokenStore`] is the reference implementation for a
/// local key/value file (§6).
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Load the persisted tokens, if any have ever been saved.
    async fn load(&self) -> anyhow::Result<Option<PersistedTokens>>;
    /// Persist tokens. Must flush before returning, so a crash immediately after does not lose a
    /// just-completed refresh (§6 "writes are flushed before acknowledging refresh success").
    async fn save(&self, tokens: &PersistedTokens) -> anyhow::Result<()>;
}

/// Stores tokens as a single JSON file on local disk.
pub struct JsonFileTokenStore {
    path: PathBuf,
}

impl JsonFileTokenStore {
    /// Create a store backed by `path`. The file is created on first [`Self::save`] if absent.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStore for JsonFileTokenStore {
    async fn load(&self) -> anyhow::Result<Option<PersistedTokens>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, tokens: &PersistedTokens) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(tokens)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_a_temp_file() {
        let path = std::env::temp_dir().join(format!("streamcore-token-store-test-{}.json", std::process::id()));
        let store = JsonFileTokenStore::new(path.clone());

        assert!(store.load().await.unwrap().is_none());

        let tokens = PersistedTokens {
            access_token: "at".to_owned(),
            refresh_token: "rt".to_owned(),
            expires_at: Utc::now(),
            scopes: Some(vec!["user:read:chat".to_owned()]),
        };
        store.save(&tokens).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "at");
        assert_eq!(loaded.scopes, Some(vec!["user:read:chat".to_owned()]));

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("json.tmp"));
    }
}
