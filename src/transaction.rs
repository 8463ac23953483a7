//! Atomic batches of plugin operations.
//!
//! A [`Transaction`] is an ordered list of operation/rollback pairs. Either
//! every operation succeeds, or the completed ones are undone in reverse.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::LoadOptions;
use crate::error::{Error, Result};
use crate::lifecycle::PluginState;
use crate::manager::PluginManager;

type StepFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Progress of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    /// Not run yet.
    Pending,
    /// The operation succeeded and has not been undone.
    Completed,
    /// The operation failed; this failure aborted the commit.
    Failed(Error),
    /// The operation succeeded and was later undone.
    RolledBack,
    /// Undoing the operation failed.
    RollbackFailed(Error),
}

/// One operation with its compensating action.
pub struct TransactionStep {
    description: String,
    operation: StepFn,
    rollback: StepFn,
    status: StepStatus,
}

impl TransactionStep {
    /// What the step does.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current status.
    pub fn status(&self) -> &StepStatus {
        &self.status
    }
}

impl std::fmt::Debug for TransactionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStep")
            .field("description", &self.description)
            .field("status", &self.status)
            .finish()
    }
}

/// Report of a step after the transaction completed.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// What the step did.
    pub description: String,
    /// How it ended.
    pub status: StepStatus,
}

/// Summary of a finished transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    /// Transaction id.
    pub id: String,
    /// Every operation succeeded.
    pub committed: bool,
    /// Completed operations were undone.
    pub rolled_back: bool,
    /// Per-step reports in insertion order.
    pub steps: Vec<StepReport>,
}

/// Ordered operation/rollback pairs with all-or-nothing commit.
pub struct Transaction {
    id: String,
    steps: Vec<TransactionStep>,
    committed: bool,
    rolled_back: bool,
    manager: Option<Weak<PluginManager>>,
    active: Option<Arc<AtomicUsize>>,
}

impl Transaction {
    /// Create a transaction that only accepts generic operations.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            steps: Vec::new(),
            committed: false,
            rolled_back: false,
            manager: None,
            active: None,
        }
    }

    pub(crate) fn bound(manager: Weak<PluginManager>, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            id: Uuid::new_v4().to_string(),
            steps: Vec::new(),
            committed: false,
            rolled_back: false,
            manager: Some(manager),
            active: Some(active),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the commit succeeded.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Whether the transaction was rolled back.
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Whether neither commit nor rollback has finished.
    pub fn is_open(&self) -> bool {
        !self.committed && !self.rolled_back
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The steps in insertion order.
    pub fn steps(&self) -> &[TransactionStep] {
        &self.steps
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::state_error(format!(
                "transaction {} is already {}",
                self.id,
                if self.committed { "committed" } else { "rolled back" }
            )))
        }
    }

    fn manager(&self) -> Result<Arc<PluginManager>> {
        self.manager
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::state_error("transaction is not bound to a live plugin manager"))
    }

    /// Append an arbitrary operation and its rollback.
    pub fn add_operation<O, R>(&mut self, description: impl Into<String>, operation: O, rollback: R) -> Result<()>
    where
        O: FnMut() -> Result<()> + Send + 'static,
        R: FnMut() -> Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        self.steps.push(TransactionStep {
            description: description.into(),
            operation: Box::new(operation),
            rollback: Box::new(rollback),
            status: StepStatus::Pending,
        });
        Ok(())
    }

    /// Load a plugin; rollback force-unloads whatever the step loaded.
    pub fn add_load(&mut self, path: impl Into<PathBuf>, options: LoadOptions) -> Result<()> {
        self.push_load(path.into(), options).map(|_| ())
    }

    pub(crate) fn push_load(
        &mut self,
        path: PathBuf,
        options: LoadOptions,
    ) -> Result<Arc<Mutex<Option<String>>>> {
        self.ensure_open()?;
        let manager = Arc::downgrade(&self.manager()?);
        let loaded: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let op_manager = manager.clone();
        let op_loaded = loaded.clone();
        let op_path = path.clone();
        let rb_loaded = loaded.clone();

        self.add_operation(
            format!("load {}", path.display()),
            move || {
                let manager = upgrade(&op_manager)?;
                let id = manager.load_plugin(&op_path, options.clone())?;
                *op_loaded.lock() = Some(id);
                Ok(())
            },
            move || {
                let Some(id) = rb_loaded.lock().take() else {
                    return Ok(());
                };
                upgrade(&manager)?.unload_plugin(&id, true)
            },
        )?;
        Ok(loaded)
    }

    /// Unload a plugin; rollback loads it again from the same file.
    pub fn add_unload(&mut self, plugin_id: impl Into<String>, force: bool) -> Result<()> {
        self.ensure_open()?;
        let manager = Arc::downgrade(&self.manager()?);
        let plugin_id = plugin_id.into();
        let captured: Arc<Mutex<Option<(PathBuf, LoadOptions, PluginState)>>> =
            Arc::new(Mutex::new(None));

        let op_manager = manager.clone();
        let op_id = plugin_id.clone();
        let op_captured = captured.clone();

        self.add_operation(
            format!("unload {}", plugin_id),
            move || {
                let manager = upgrade(&op_manager)?;
                let info = manager.get_plugin_info(&op_id)?;
                let options = LoadOptions::new()
                    .with_dependency_check(false)
                    .with_initialize(false)
                    .with_hot_reload(info.hot_reload_enabled)
                    .with_configuration(info.configuration.clone());
                manager.unload_plugin(&op_id, force)?;
                *op_captured.lock() = Some((info.file_path, options, info.state));
                Ok(())
            },
            move || {
                let Some((path, options, state)) = captured.lock().take() else {
                    return Ok(());
                };
                let manager = upgrade(&manager)?;
                let id = manager.load_plugin(&path, options)?;
                replay_state(&manager, &id, state)
            },
        )
    }

    /// Reload a plugin; rollback reloads it again with its state preserved.
    pub fn add_reload(&mut self, plugin_id: impl Into<String>, preserve_state: bool) -> Result<()> {
        self.ensure_open()?;
        let manager = Arc::downgrade(&self.manager()?);
        let plugin_id = plugin_id.into();
        let op_manager = manager.clone();
        let op_id = plugin_id.clone();

        self.add_operation(
            format!("reload {}", plugin_id),
            move || upgrade(&op_manager)?.reload_plugin(&op_id, preserve_state),
            move || upgrade(&manager)?.reload_plugin(&plugin_id, true),
        )
    }

    /// Run every pending operation in order. On failure, undo the completed
    /// ones in reverse and return the error that aborted the commit.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let manager = self.manager.as_ref().and_then(Weak::upgrade);
        let _ops = manager.as_ref().map(|m| m.lock_operations());

        let start = self
            .steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)
            .unwrap_or(self.steps.len());

        for index in start..self.steps.len() {
            let step = &mut self.steps[index];
            match (step.operation)() {
                Ok(()) => step.status = StepStatus::Completed,
                Err(e) => {
                    tracing::warn!(
                        transaction = %self.id,
                        step = %step.description,
                        error = %e,
                        "transaction step failed, rolling back"
                    );
                    step.status = StepStatus::Failed(e.clone());
                    self.undo();
                    return Err(e);
                }
            }
        }

        self.committed = true;
        self.release();
        tracing::debug!(transaction = %self.id, steps = self.steps.len(), "transaction committed");
        Ok(())
    }

    /// Undo every completed operation in reverse.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.undo();
        Ok(())
    }

    fn undo(&mut self) {
        let manager = self.manager.as_ref().and_then(Weak::upgrade);
        let _ops = manager.as_ref().map(|m| m.lock_operations());
        for step in self.steps.iter_mut().rev() {
            if step.status != StepStatus::Completed {
                continue;
            }
            step.status = match (step.rollback)() {
                Ok(()) => StepStatus::RolledBack,
                Err(e) => {
                    tracing::error!(
                        transaction = %self.id,
                        step = %step.description,
                        error = %e,
                        "rollback step failed"
                    );
                    StepStatus::RollbackFailed(e)
                }
            };
        }
        self.rolled_back = true;
        self.release();
    }

    fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Report of every step.
    pub fn outcome(&self) -> TransactionOutcome {
        TransactionOutcome {
            id: self.id.clone(),
            committed: self.committed,
            rolled_back: self.rolled_back,
            steps: self
                .steps
                .iter()
                .map(|s| StepReport {
                    description: s.description.clone(),
                    status: s.status.clone(),
                })
                .collect(),
        }
    }
}

/// Walk a freshly loaded plugin back to the state it had before it was
/// unloaded.
fn replay_state(manager: &PluginManager, id: &str, state: PluginState) -> Result<()> {
    match state {
        PluginState::Running | PluginState::Reloading => manager.initialize_plugin(id),
        PluginState::Paused => {
            manager.initialize_plugin(id)?;
            manager.pause_plugin(id)
        }
        PluginState::Stopped | PluginState::Stopping => {
            manager.initialize_plugin(id)?;
            manager.stop_plugin(id)
        }
        _ => Ok(()),
    }
}

fn upgrade(manager: &Weak<PluginManager>) -> Result<Arc<PluginManager>> {
    manager
        .upgrade()
        .ok_or_else(|| Error::state_error("plugin manager was dropped"))
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_open() && self.steps.iter().any(|s| s.status == StepStatus::Completed) {
            self.undo();
        }
        self.release();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("steps", &self.steps.len())
            .field("committed", &self.committed)
            .field("rolled_back", &self.rolled_back)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, entry: &str) -> impl FnMut() -> Result<()> + Send + 'static {
        let log = log.clone();
        let entry = entry.to_string();
        move || {
            log.lock().push(entry.clone());
            Ok(())
        }
    }

    #[test]
    fn test_commit_runs_in_order() {
        let log = recorder();
        let mut tx = Transaction::new();
        tx.add_operation("a", push(&log, "do a"), push(&log, "undo a")).unwrap();
        tx.add_operation("b", push(&log, "do b"), push(&log, "undo b")).unwrap();

        tx.commit().unwrap();
        assert!(tx.is_committed());
        assert!(!tx.is_rolled_back());
        assert_eq!(*log.lock(), vec!["do a", "do b"]);
        assert!(tx.outcome().steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[test]
    fn test_failure_rolls_back_in_reverse() {
        let log = recorder();
        let mut tx = Transaction::new();
        tx.add_operation("a", push(&log, "do a"), push(&log, "undo a")).unwrap();
        tx.add_operation("b", push(&log, "do b"), push(&log, "undo b")).unwrap();
        tx.add_operation(
            "c",
            || Err(Error::load_failed("broken")),
            push(&log, "undo c"),
        )
        .unwrap();
        tx.add_operation("d", push(&log, "do d"), push(&log, "undo d")).unwrap();

        let err = tx.commit().unwrap_err();
        assert_eq!(err.code(), ErrorCode::LoadFailed);
        assert!(tx.is_rolled_back());
        assert!(!tx.is_committed());
        assert_eq!(*log.lock(), vec!["do a", "do b", "undo b", "undo a"]);

        let outcome = tx.outcome();
        assert_eq!(outcome.steps[0].status, StepStatus::RolledBack);
        assert!(matches!(outcome.steps[2].status, StepStatus::Failed(_)));
        assert_eq!(outcome.steps[3].status, StepStatus::Pending);
    }

    #[test]
    fn test_rollback_errors_do_not_stop_rollback() {
        let log = recorder();
        let mut tx = Transaction::new();
        tx.add_operation("a", push(&log, "do a"), push(&log, "undo a")).unwrap();
        tx.add_operation("b", push(&log, "do b"), || Err(Error::load_failed("stuck")))
            .unwrap();
        tx.add_operation("c", || Err(Error::load_failed("broken")), || Ok(()))
            .unwrap();

        assert!(tx.commit().is_err());
        assert!(tx.is_rolled_back());
        assert_eq!(log.lock().last().map(String::as_str), Some("undo a"));
        assert!(matches!(tx.outcome().steps[1].status, StepStatus::RollbackFailed(_)));
    }

    #[test]
    fn test_closed_transaction_rejects_changes() {
        let mut tx = Transaction::new();
        tx.commit().unwrap();

        let err = tx.add_operation("late", || Ok(()), || Ok(())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StateError);
        assert!(tx.rollback().is_err());
        assert!(tx.commit().is_err());

        let mut tx = Transaction::new();
        tx.rollback().unwrap();
        assert!(tx.is_rolled_back());
        assert!(tx.add_operation("late", || Ok(()), || Ok(())).is_err());
    }

    #[test]
    fn test_unbound_transaction_rejects_manager_steps() {
        let mut tx = Transaction::new();
        let err = tx.add_load("/p.plug", LoadOptions::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StateError);
        assert!(tx.is_empty());
    }

    #[test]
    fn test_active_count_released() {
        let active = Arc::new(AtomicUsize::new(0));
        {
            let tx = Transaction::bound(Weak::new(), active.clone());
            assert_eq!(active.load(Ordering::SeqCst), 1);
            drop(tx);
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);

        let mut tx = Transaction::bound(Weak::new(), active.clone());
        tx.commit().unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
