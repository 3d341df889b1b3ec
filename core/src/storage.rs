//! Storage layer implementation (RocksDB)
//!
//! One JSON value per key:
//! - `voice:{guild}:{user}` → `VoiceSettings`
//! - `guild:{guild}` → `GuildSettings`
//! - `usage:{guild}` → `UsageRecord`
//!
//! Ledger writes are serialized through a single async lock so `add` is an
//! atomic read-modify-write across every session in the process.

use crate::ledger::{current_period_key, UsageLedger, UsageRecord};
use crate::settings::{GuildSettings, SettingsStore, VoiceSettings};
use crate::{GuildId, Result, UserId, VcReadError};
use async_trait::async_trait;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const USAGE_PREFIX: &str = "usage:";

fn voice_key(guild: &GuildId, user: &UserId) -> String {
    format!("voice:{guild}:{user}")
}

fn guild_key(guild: &GuildId) -> String {
    format!("guild:{guild}")
}

fn usage_key(guild: &GuildId) -> String {
    format!("{USAGE_PREFIX}{guild}")
}

/// Persistent storage using RocksDB
pub struct Storage {
    db: DB,
    ledger_lock: Mutex<()>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(|e| VcReadError::StorageError(e.to_string()))?;

        info!(target = "storage", "Storage initialized");
        Ok(Self {
            db,
            ledger_lock: Mutex::new(()),
        })
    }

    pub fn open_shared<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(path)?))
    }

    /// Store key-value pair
    pub fn put<K: AsRef<[u8]>, V: Serialize>(&self, key: K, value: &V) -> Result<()> {
        let serialized = serde_json::to_vec(value)?;
        self.db
            .put(key, serialized)
            .map_err(|e| VcReadError::StorageError(e.to_string()))
    }

    /// Get value by key
    pub fn get<K: AsRef<[u8]>, V: DeserializeOwned>(&self, key: K) -> Result<Option<V>> {
        match self.db.get(key) {
            Ok(Some(data)) => {
                let value = serde_json::from_slice(&data)?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(VcReadError::StorageError(e.to_string())),
        }
    }

    /// Delete key
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<()> {
        self.db
            .delete(key)
            .map_err(|e| VcReadError::StorageError(e.to_string()))
    }

    /// All values whose key starts with `prefix`
    fn scan_prefix<V: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, V)>> {
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in self.db.iterator(mode) {
            let (key, value) = item.map_err(|e| VcReadError::StorageError(e.to_string()))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8_lossy(&key).into_owned();
            out.push((key, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }
}

#[async_trait]
impl SettingsStore for Storage {
    async fn voice_settings(&self, guild: &GuildId, user: &UserId) -> Result<Option<VoiceSettings>> {
        self.get(voice_key(guild, user))
    }

    async fn set_voice_settings(
        &self,
        guild: &GuildId,
        user: &UserId,
        settings: VoiceSettings,
    ) -> Result<()> {
        self.put(voice_key(guild, user), &settings)
    }

    async fn guild_settings(&self, guild: &GuildId) -> Result<GuildSettings> {
        Ok(self.get(guild_key(guild))?.unwrap_or_default())
    }

    async fn set_guild_settings(&self, guild: &GuildId, settings: GuildSettings) -> Result<()> {
        self.put(guild_key(guild), &settings)
    }
}

#[async_trait]
impl UsageLedger for Storage {
    async fn get(&self, guild: &GuildId) -> Result<UsageRecord> {
        Ok(Storage::get(self, usage_key(guild))?
            .unwrap_or_else(|| UsageRecord::empty(current_period_key())))
    }

    async fn add(&self, guild: &GuildId, delta: f64) -> Result<UsageRecord> {
        let _guard = self.ledger_lock.lock().await;
        let key = usage_key(guild);
        let mut record: UsageRecord =
            Storage::get(self, &key)?.unwrap_or_else(|| UsageRecord::empty(current_period_key()));
        record.cost += delta;
        self.put(&key, &record)?;
        Ok(record)
    }

    async fn roll_over(&self, period: &str) -> Result<usize> {
        let _guard = self.ledger_lock.lock().await;
        let stale: Vec<(String, UsageRecord)> = self
            .scan_prefix::<UsageRecord>(USAGE_PREFIX)?
            .into_iter()
            .filter(|(_, record)| record.period_key != period)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let fresh = serde_json::to_vec(&UsageRecord::empty(period.to_string()))?;
        let mut batch = WriteBatch::default();
        for (key, _) in &stale {
            batch.put(key.as_bytes(), &fresh);
        }
        self.db
            .write(batch)
            .map_err(|e| VcReadError::StorageError(e.to_string()))?;

        info!(target = "storage", period = %period, reset = stale.len(), "Usage ledger rolled over");
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Engine;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_settings_survive_reopen() {
        let dir = tempdir().unwrap();
        let guild = "g1".to_string();
        let user = "u1".to_string();
        {
            let storage = Storage::new(dir.path()).unwrap();
            let mut voice = VoiceSettings::with_speaker(3);
            voice.engine = Engine::Fallback;
            storage.set_voice_settings(&guild, &user, voice).await.unwrap();

            let mut gs = GuildSettings::default();
            gs.active_speech = true;
            gs.dictionary.insert("gg".into(), "good game".into());
            storage.set_guild_settings(&guild, gs).await.unwrap();
        }

        let storage = Storage::new(dir.path()).unwrap();
        let voice = storage.voice_settings(&guild, &user).await.unwrap().unwrap();
        assert_eq!(voice.speaker_id, 3);
        assert_eq!(voice.engine, Engine::Fallback);
        let gs = storage.guild_settings(&guild).await.unwrap();
        assert!(gs.active_speech);
        assert_eq!(gs.dictionary.get("gg").map(String::as_str), Some("good game"));
    }

    #[tokio::test]
    async fn test_unknown_guild_gets_defaults() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let guild = "nobody".to_string();
        assert_eq!(storage.guild_settings(&guild).await.unwrap(), GuildSettings::default());
        assert_eq!(UsageLedger::get(&storage, &guild).await.unwrap().cost, 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_ledger_adds() {
        let dir = tempdir().unwrap();
        let storage = Storage::open_shared(dir.path()).unwrap();
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let storage = Arc::clone(&storage);
            tasks.push(tokio::spawn(async move {
                storage.add(&"g1".to_string(), 0.5).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let record = UsageLedger::get(storage.as_ref(), &"g1".to_string()).await.unwrap();
        assert_eq!(record.cost, 10.0);
    }

    #[tokio::test]
    async fn test_roll_over_leaves_other_keys_alone() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let guild = "g1".to_string();
        storage.add(&guild, 12.0).await.unwrap();
        storage
            .set_guild_settings(&guild, GuildSettings::default())
            .await
            .unwrap();

        assert_eq!(storage.roll_over("2999-01").await.unwrap(), 1);
        assert_eq!(storage.roll_over("2999-01").await.unwrap(), 0);

        let record = UsageLedger::get(&storage, &guild).await.unwrap();
        assert_eq!(record.cost, 0.0);
        assert_eq!(record.period_key, "2999-01");
        assert_eq!(storage.guild_settings(&guild).await.unwrap(), GuildSettings::default());
    }
}
