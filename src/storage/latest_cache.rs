use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{Fields, IndicatorSnapshot};

/// Key under which a symbol's snapshot is stored.
pub fn latest_key(symbol: &str) -> String {
    format!("latest:{symbol}")
}

/// Last-write-wins indicator snapshot per symbol.
#[async_trait]
pub trait LatestCache: Send + Sync {
    /// Replace the symbol's entry with `snapshot`.
    async fn set(&self, symbol: &str, snapshot: &IndicatorSnapshot) -> anyhow::Result<()>;

    async fn get(&self, symbol: &str) -> anyhow::Result<Option<IndicatorSnapshot>>;
}

/// In-process [`LatestCache`] holding the flat field map per key.
#[derive(Default)]
pub struct MemoryLatestCache {
    entries: RwLock<HashMap<String, Fields>>,
}

impl MemoryLatestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored fields, as a downstream reader would see them.
    pub fn raw(&self, symbol: &str) -> Option<Fields> {
        self.entries.read().get(&latest_key(symbol)).cloned()
    }
}

#[async_trait]
impl LatestCache for MemoryLatestCache {
    async fn set(&self, symbol: &str, snapshot: &IndicatorSnapshot) -> anyhow::Result<()> {
        self.entries
            .write()
            .insert(latest_key(symbol), snapshot.to_fields());
        Ok(())
    }

    async fn get(&self, symbol: &str) -> anyhow::Result<Option<IndicatorSnapshot>> {
        Ok(self
            .entries
            .read()
            .get(&latest_key(symbol))
            .map(|fields| IndicatorSnapshot::from_fields(symbol, fields)))
    }
}
