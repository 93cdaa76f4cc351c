//! Durability layer behind the session registry

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{PickupCode, Session};

/// Storage the registry loads from once and writes through on every change
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Load every persisted session; called once before first use
    async fn load(&self) -> Result<Vec<Session>>;

    /// Persist the latest version of a session
    async fn save(&self, session: &Session) -> Result<()>;

    /// Forget a destroyed session
    async fn remove(&self, code: &PickupCode) -> Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Volatile backend: the registry's own map is the only copy
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend;

impl MemoryBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<Session>> {
        Ok(Vec::new())
    }

    async fn save(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _code: &PickupCode) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
