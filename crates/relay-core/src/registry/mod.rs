//! Session Registry
//!
//! Keyed store of [`Session`] records with four operations: `create`, `get`,
//! `mutate` and `delete`. Each code owns its own async mutex, so mutations of
//! one session are linearized while distinct sessions never contend.
//!
//! The backend is loaded lazily before first use and written through after
//! every successful mutation.

pub mod backend;
pub mod file;

pub use backend::{MemoryBackend, SessionBackend};
pub use file::FileBackend;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::code::CodeGenerator;
use crate::errors::{RelayError, Result};
use crate::types::{ConnectionId, PickupCode, Session};

type SessionCell = Arc<Mutex<Session>>;

pub struct SessionRegistry {
    /// Active sessions, one lock per code
    sessions: DashMap<PickupCode, SessionCell>,
    backend: Arc<dyn SessionBackend>,
    codes: Arc<dyn CodeGenerator>,
    max_code_attempts: usize,
    loaded: OnceCell<()>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        codes: Arc<dyn CodeGenerator>,
        max_code_attempts: usize,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            backend,
            codes,
            max_code_attempts: max_code_attempts.max(1),
            loaded: OnceCell::new(),
        }
    }

    /// Volatile registry with the given code source
    pub fn in_memory(codes: Arc<dyn CodeGenerator>) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), codes, 64)
    }

    /// Load persisted sessions exactly once; concurrent callers wait for it
    async fn ensure_loaded(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                let restored = self.backend.load().await?;
                if !restored.is_empty() {
                    info!(
                        "Loaded {} sessions from {} backend",
                        restored.len(),
                        self.backend.name()
                    );
                }
                for session in restored {
                    self.sessions
                        .insert(session.code.clone(), Arc::new(Mutex::new(session)));
                }
                Ok::<(), RelayError>(())
            })
            .await
            .map(|_| ())
    }

    fn cell(&self, code: &PickupCode) -> Option<SessionCell> {
        self.sessions.get(code).map(|entry| entry.value().clone())
    }

    /// Whether `cell` is still the live entry for `code`
    fn is_current(&self, code: &PickupCode, cell: &SessionCell) -> bool {
        self.sessions
            .get(code)
            .map_or(false, |entry| Arc::ptr_eq(entry.value(), cell))
    }

    /// Allocate a fresh code and register a new session for `sender`
    pub async fn create(&self, sender: ConnectionId) -> Result<PickupCode> {
        self.ensure_loaded().await?;

        for attempt in 1..=self.max_code_attempts {
            let code = self.codes.generate();
            let cell: SessionCell = Arc::new(Mutex::new(Session::new(code.clone(), sender)));
            // Hold the new session's lock until it is persisted so no mutation
            // can be written to the backend ahead of the initial record.
            let guard = cell.clone().lock_owned().await;

            match self.sessions.entry(code.clone()) {
                Entry::Occupied(_) => {
                    debug!("Pickup code collision on attempt {}: {}", attempt, code);
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(cell.clone());
                }
            }

            if let Err(e) = self.backend.save(&guard).await {
                self.sessions.remove_if(&code, |_, current| Arc::ptr_eq(current, &cell));
                return Err(e);
            }
            return Ok(code);
        }

        Err(RelayError::CodeSpaceExhausted {
            attempts: self.max_code_attempts,
        })
    }

    /// Snapshot of a session
    pub async fn get(&self, code: &PickupCode) -> Result<Option<Session>> {
        self.ensure_loaded().await?;
        let Some(cell) = self.cell(code) else {
            return Ok(None);
        };
        let session = cell.lock().await;
        if !self.is_current(code, &cell) {
            return Ok(None);
        }
        Ok(Some(session.clone()))
    }

    /// Atomic read-modify-write of one session
    ///
    /// `f` works on a draft; if it fails the stored session is untouched. On
    /// success the activity timestamp is refreshed and the draft persisted.
    pub async fn mutate<F, R>(&self, code: &PickupCode, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        self.apply(code, f, true).await
    }

    /// Like [`mutate`](Self::mutate), without the backend write
    ///
    /// For per-chunk counters. They reach the backend with the next persisted
    /// mutation; restored sessions are purged at startup, so a lost counter
    /// is never read back.
    pub async fn mutate_volatile<F, R>(&self, code: &PickupCode, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        self.apply(code, f, false).await
    }

    async fn apply<F, R>(&self, code: &PickupCode, f: F, persist: bool) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        self.ensure_loaded().await?;
        let cell = self
            .cell(code)
            .ok_or_else(|| RelayError::InvalidCode(code.clone()))?;
        let mut session = cell.lock().await;
        if !self.is_current(code, &cell) {
            return Err(RelayError::InvalidCode(code.clone()));
        }

        let mut draft = session.clone();
        let output = f(&mut draft)?;
        draft.last_activity_at = Utc::now();
        if persist {
            self.backend.save(&draft).await?;
        }
        *session = draft;
        Ok(output)
    }

    /// Remove a session, returning its final state if it existed
    pub async fn delete(&self, code: &PickupCode) -> Result<Option<Session>> {
        self.ensure_loaded().await?;
        let Some(cell) = self.cell(code) else {
            return Ok(None);
        };
        let session = cell.lock().await;
        let removed = self
            .sessions
            .remove_if(code, |_, current| Arc::ptr_eq(current, &cell))
            .is_some();
        if !removed {
            return Ok(None);
        }
        self.backend.remove(code).await?;
        Ok(Some(session.clone()))
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Codes whose last activity is older than `cutoff`
    pub async fn idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<PickupCode>> {
        self.ensure_loaded().await?;
        let cells: Vec<(PickupCode, SessionCell)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut idle = Vec::new();
        for (code, cell) in cells {
            if cell.lock().await.is_idle_since(cutoff) {
                idle.push(code);
            }
        }
        Ok(idle)
    }

    /// Load the backend and return every restored session
    pub async fn recover(&self) -> Result<Vec<Session>> {
        self.ensure_loaded().await?;
        let cells: Vec<SessionCell> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut restored = Vec::with_capacity(cells.len());
        for cell in cells {
            restored.push(cell.lock().await.clone());
        }
        Ok(restored)
    }
}
