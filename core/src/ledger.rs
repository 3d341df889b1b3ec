//! Usage ledger: weighted characters spent per guild per billing period.
//!
//! `add` is an atomic read-modify-write per guild key and returns the new
//! total, so callers can detect threshold crossings without racing other
//! sessions. Period rollover is driven from outside via `roll_over`.

use crate::{GuildId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Billing period key (`YYYY-MM`, UTC)
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

pub fn current_period_key() -> String {
    period_key(Utc::now())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub cost: f64,
    pub period_key: String,
}

impl UsageRecord {
    pub fn empty(period_key: String) -> Self {
        Self {
            cost: 0.0,
            period_key,
        }
    }
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Current record; guilds never seen before start at zero in the current period
    async fn get(&self, guild: &GuildId) -> Result<UsageRecord>;

    /// Add `delta` and return the updated record
    async fn add(&self, guild: &GuildId, delta: f64) -> Result<UsageRecord>;

    /// Reset every record whose period differs from `period`; returns how many were reset
    async fn roll_over(&self, period: &str) -> Result<usize>;
}

/// In-memory implementation of UsageLedger.
#[derive(Default)]
pub struct InMemoryLedger {
    records: DashMap<GuildId, UsageRecord>,
}

impl InMemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl UsageLedger for InMemoryLedger {
    async fn get(&self, guild: &GuildId) -> Result<UsageRecord> {
        Ok(self
            .records
            .get(guild)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| UsageRecord::empty(current_period_key())))
    }

    async fn add(&self, guild: &GuildId, delta: f64) -> Result<UsageRecord> {
        let mut record = self
            .records
            .entry(guild.clone())
            .or_insert_with(|| UsageRecord::empty(current_period_key()));
        record.cost += delta;
        Ok(record.value().clone())
    }

    async fn roll_over(&self, period: &str) -> Result<usize> {
        let mut reset = 0;
        for mut entry in self.records.iter_mut() {
            if entry.period_key != period {
                *entry.value_mut() = UsageRecord::empty(period.to_string());
                reset += 1;
            }
        }
        if reset > 0 {
            info!(target = "ledger", period = %period, reset, "Usage ledger rolled over");
        }
        Ok(reset)
    }
}
