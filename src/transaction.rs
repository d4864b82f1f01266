//! Transaction lifecycle management for a single adapter.
//!
//! The manager keeps a stack of open frames. `with_tx` scopes acquisition:
//! begin on entry, commit on success, roll back on any failure including
//! cancellation. Nested `with_tx` maps to savepoints where the dialect
//! supports them, so an inner rollback preserves outer state.

use crate::adapters::{DatabaseAdapter, IsolationLevel, TxHandle};
use crate::error::{DbError, Result};
use crate::types::AbortSignal;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-connection transaction manager.
pub struct TransactionManager {
    adapter: Arc<dyn DatabaseAdapter>,
    frames: Mutex<Vec<TxHandle>>,
}

impl TransactionManager {
    #[must_use]
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            adapter,
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Open frame count (0 = no transaction).
    pub async fn depth(&self) -> usize {
        self.frames.lock().await.len()
    }

    /// Begin a new frame. The outermost call begins a transaction; nested
    /// calls create savepoints.
    pub async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<TxHandle> {
        if self.adapter.read_only() {
            return Err(DbError::ReadOnly("cannot begin on a read-only connection".into()));
        }
        let mut frames = self.frames.lock().await;
        if !frames.is_empty() && isolation.is_some() {
            return Err(DbError::TxState(
                "isolation level can only be set on the outermost transaction".into(),
            ));
        }
        let handle = self.adapter.begin_tx(isolation).await?;
        debug!(depth = handle.depth, savepoint = ?handle.savepoint, "transaction frame opened");
        frames.push(handle.clone());
        Ok(handle)
    }

    /// Commit the innermost frame. Committing out of order is a state error.
    pub async fn commit(&self, tx: &TxHandle) -> Result<()> {
        let mut frames = self.frames.lock().await;
        match frames.last() {
            Some(top) if top == tx => {}
            Some(_) => {
                return Err(DbError::TxState(
                    "commit does not match the innermost frame".into(),
                ))
            }
            None => return Err(DbError::TxState("no open transaction".into())),
        }
        self.adapter.commit(tx).await?;
        frames.pop();
        Ok(())
    }

    /// Roll back the innermost frame.
    pub async fn rollback(&self, tx: &TxHandle) -> Result<()> {
        let mut frames = self.frames.lock().await;
        match frames.last() {
            Some(top) if top == tx => {}
            Some(_) => {
                return Err(DbError::TxState(
                    "rollback does not match the innermost frame".into(),
                ))
            }
            None => return Err(DbError::TxState("no open transaction".into())),
        }
        self.adapter.rollback(tx).await?;
        frames.pop();
        Ok(())
    }

    /// Run `f` inside a transaction frame: commit on success, roll back on
    /// error or when the abort signal has tripped by the time `f` returns.
    pub async fn with_tx<T, F, Fut>(&self, signal: &AbortSignal, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.begin(None).await?;
        let outcome = f().await;
        let cancelled = signal.aborted();
        match outcome {
            Ok(value) if !cancelled => {
                self.commit(&handle).await?;
                Ok(value)
            }
            Ok(_) => {
                self.rollback(&handle).await?;
                Err(DbError::Cancelled)
            }
            Err(e) => {
                // Preserve the original failure even if rollback also fails.
                if let Err(rollback_err) = self.rollback(&handle).await {
                    debug!(error = %rollback_err, "rollback after failure also failed");
                }
                Err(e)
            }
        }
    }
}
