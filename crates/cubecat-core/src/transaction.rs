//! Transaction journal, commit and rollback.
//!
//! Every append runs inside a transaction: a journal directory under
//! the temporary directory records each intended mutation before it is
//! performed, with backups sufficient to restore the pre-transaction
//! state. The commit marker is the linearization point; once it exists
//! only cleanup remains, even across a process death.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dataset::Attrs;
use crate::error::{Error, Result};
use crate::fsutil::FileObj;
use crate::lock::{pid_alive, LockInfo, TargetLock};
use crate::processor::CancelToken;

pub const TXN_DIR_PREFIX: &str = "cubecat-txn-";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ACTIONS_FILE: &str = "actions.jsonl";
pub const COMMIT_FILE: &str = "__commit__";

/// Kind of work a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    /// The cube did not exist; rollback deletes it entirely
    Create,
    /// The cube is being extended; rollback restores the journal
    Append,
}

/// The transaction manifest, written before any mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: TxnKind,
    pub transaction_id: String,
    pub target_uri: String,
    /// Pre-transaction append-axis length, for `Append` transactions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_append_size: Option<u64>,
}

/// One journalled mutation, stored as a JSON line. Rollback applies the
/// inverses in reverse order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRecord {
    /// The path was created by this transaction
    Added {
        path: String,
        #[serde(default)]
        dir: bool,
    },
    /// The path existed and was overwritten; a copy is at `backup`
    Replaced { path: String, backup: String },
    /// The path existed and was deleted; a copy is at `backup`
    Deleted { path: String, backup: String },
}

/// A running transaction. Owns the journal and the target lock.
#[derive(Debug)]
pub struct Transaction {
    kind: TxnKind,
    target_dir: FileObj,
    txn_dir: Option<FileObj>,
    lock: Option<TargetLock>,
    finished: bool,
}

impl Transaction {
    /// Acquire the lock, create the journal directory and write the
    /// manifest. With `disable_rollback` no journal is kept at all.
    pub fn begin(
        kind: TxnKind,
        target_dir: &FileObj,
        temp_dir: &FileObj,
        lock_wait: Option<(Duration, Duration)>,
        disable_rollback: bool,
        pre_append_size: Option<u64>,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let lock = TargetLock::acquire(target_dir, lock_wait, cancel)?;
        Self::begin_locked(
            kind,
            target_dir,
            temp_dir,
            lock,
            disable_rollback,
            pre_append_size,
        )
    }

    /// Open a transaction under an already-held lock. Used when the
    /// caller has to inspect the target under the lock before knowing
    /// the transaction kind.
    pub fn begin_locked(
        kind: TxnKind,
        target_dir: &FileObj,
        temp_dir: &FileObj,
        mut lock: TargetLock,
        disable_rollback: bool,
        pre_append_size: Option<u64>,
    ) -> Result<Self> {
        let txn_dir = if disable_rollback {
            tracing::warn!(
                "Rollback is disabled; a failure will leave {} in an undefined state",
                target_dir.uri()
            );
            None
        } else {
            let transaction_id = Uuid::new_v4().to_string();
            let txn_dir = temp_dir.child(&format!("{TXN_DIR_PREFIX}{transaction_id}"));
            txn_dir.mkdir()?;
            txn_dir.child(MANIFEST_FILE).write_json(&Manifest {
                kind,
                transaction_id,
                target_uri: target_dir.uri().to_string(),
                pre_append_size,
            })?;
            txn_dir.child(ACTIONS_FILE).write(b"")?;
            lock.set_txn_dir(txn_dir.uri())?;
            tracing::debug!("Opened {kind:?} transaction at {}", txn_dir.uri());
            Some(txn_dir)
        };

        Ok(Self {
            kind,
            target_dir: target_dir.clone(),
            txn_dir,
            lock: Some(lock),
            finished: false,
        })
    }

    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    /// Record that `file` is about to be created.
    pub fn journal_added(&self, file: &FileObj, dir: bool) -> Result<()> {
        self.record(&ActionRecord::Added {
            path: file.path().to_string(),
            dir,
        })
    }

    /// Record that `file` is about to be overwritten, backing up its
    /// current content.
    ///
    /// On backends without atomic renames the record decomposes into a
    /// `Deleted` + `Added` pair, so rollback never depends on a
    /// replacement being atomic.
    pub fn journal_replace(&self, file: &FileObj) -> Result<()> {
        let Some(_) = &self.txn_dir else {
            return Ok(());
        };
        let backup = self.save_backup(file)?;
        if self.target_dir.fs().atomic_rename() {
            self.record(&ActionRecord::Replaced {
                path: file.path().to_string(),
                backup,
            })
        } else {
            self.record(&ActionRecord::Deleted {
                path: file.path().to_string(),
                backup,
            })?;
            self.record(&ActionRecord::Added {
                path: file.path().to_string(),
                dir: false,
            })
        }
    }

    /// Record that `file` is about to be deleted, backing it up. The
    /// caller performs the deletion.
    pub fn journal_delete(&self, file: &FileObj) -> Result<()> {
        let Some(_) = &self.txn_dir else {
            return Ok(());
        };
        let backup = self.save_backup(file)?;
        self.record(&ActionRecord::Deleted {
            path: file.path().to_string(),
            backup,
        })
    }

    fn save_backup(&self, file: &FileObj) -> Result<String> {
        let txn_dir = self.txn_dir.as_ref().expect("journalling enabled");
        let backup = Uuid::new_v4().to_string();
        let data = file.read()?;
        txn_dir.child(&backup).write(&data)?;
        Ok(backup)
    }

    fn record(&self, record: &ActionRecord) -> Result<()> {
        let Some(txn_dir) = &self.txn_dir else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(record)
            .map_err(|e| Error::internal(format!("cannot serialize journal record: {e}")))?;
        line.push(b'\n');
        txn_dir.child(ACTIONS_FILE).append(&line)
    }

    /// Write the commit marker, then clean up. After the marker exists
    /// the transaction is logically complete; cleanup failures are
    /// logged and the next run finishes them.
    pub fn commit(mut self) -> Result<()> {
        if let Some(txn_dir) = &self.txn_dir {
            txn_dir.child(COMMIT_FILE).write(b"")?;
            if let Err(e) = txn_dir.delete(true) {
                tracing::warn!("Failed to remove transaction directory: {e}");
            }
        }
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
        self.finished = true;
        Ok(())
    }

    /// Roll back every journalled mutation in reverse order, remove the
    /// journal and the lock, and return the original cause with any
    /// rollback failures attached as notes.
    pub fn rollback(mut self, cause: Error) -> Error {
        tracing::warn!("Rolling back transaction: {cause}");
        let mut notes = Vec::new();
        match self.txn_dir.take() {
            None => {
                tracing::warn!(
                    "Rollback is disabled; {} may be in an undefined state",
                    self.target_dir.uri()
                );
            }
            Some(txn_dir) => {
                notes = apply_rollback(&self.target_dir, &txn_dir, self.kind);
                if let Err(e) = txn_dir.delete_if_exists(true) {
                    notes.push(format!("failed to remove transaction directory: {e}"));
                }
            }
        }
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
        self.finished = true;
        for note in &notes {
            tracing::warn!("Rollback: {note}");
        }
        cause.with_notes(notes)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Reached on unwind; explicit error paths go through rollback().
        tracing::warn!("Transaction dropped without commit; rolling back");
        if let Some(txn_dir) = self.txn_dir.take() {
            apply_rollback(&self.target_dir, &txn_dir, self.kind);
            let _ = txn_dir.delete_if_exists(true);
        }
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

/// Apply the journal of `txn_dir` to restore the target's
/// pre-transaction state. Idempotent: missing paths and already
/// restored backups are not errors. Returns failure notes.
fn apply_rollback(target_dir: &FileObj, txn_dir: &FileObj, kind: TxnKind) -> Vec<String> {
    let mut notes = Vec::new();
    let records = match read_actions(txn_dir) {
        Ok(records) => records,
        Err(e) => {
            notes.push(format!("cannot read journal: {e}"));
            Vec::new()
        }
    };

    for record in records.iter().rev() {
        let result = match record {
            ActionRecord::Added { path, dir } => target_dir
                .at_path(path)
                .delete_if_exists(*dir)
                .map(|_| ()),
            ActionRecord::Replaced { path, backup } | ActionRecord::Deleted { path, backup } => {
                restore_backup(target_dir, txn_dir, path, backup)
            }
        };
        if let Err(e) = result {
            notes.push(format!("rollback of {record:?} failed: {e}"));
        }
    }

    if kind == TxnKind::Create {
        if let Err(e) = target_dir.delete_if_exists(true) {
            notes.push(format!("failed to delete created target: {e}"));
        }
    }
    notes
}

fn restore_backup(
    target_dir: &FileObj,
    txn_dir: &FileObj,
    path: &str,
    backup: &str,
) -> Result<()> {
    let backup_file = txn_dir.child(backup);
    if !backup_file.exists()? {
        // Already restored, or the crash happened before the backup
        // blob was written; either way there is nothing to do.
        return Ok(());
    }
    let data = backup_file.read()?;
    target_dir.at_path(path).write(&data)
}

/// Read the journal, skipping partially written trailing lines.
fn read_actions(txn_dir: &FileObj) -> Result<Vec<ActionRecord>> {
    let file = txn_dir.child(ACTIONS_FILE);
    if !file.exists()? {
        return Ok(Vec::new());
    }
    let text = file.read_to_string()?;
    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    "{}:{}: skipping malformed journal record: {e}",
                    file.uri(),
                    line_no + 1
                );
            }
        }
    }
    Ok(records)
}

/// Detect and resolve a transaction left behind by a dead writer.
///
/// A lock held by a live process (or by any process on another host) is
/// never touched; the caller keeps seeing `TargetLocked`. When the
/// owning process is provably dead on this host, a journal without a
/// commit marker is rolled back and one with a marker is cleaned up,
/// after which the lock is removed. Returns whether anything was done.
pub fn recover_interrupted(
    target_dir: &FileObj,
    temp_storage_options: Option<&Attrs>,
) -> Result<bool> {
    let Some(info) = TargetLock::read_info(target_dir)? else {
        return Ok(false);
    };
    let local = info.host == current_hostname();
    if !local || pid_alive(info.pid) {
        return Ok(false);
    }

    tracing::warn!(
        "Found lock of dead process {} on {}; recovering",
        info.pid,
        target_dir.uri()
    );

    if let Some(txn_dir_uri) = &info.txn_dir {
        let txn_dir = FileObj::new(txn_dir_uri, temp_storage_options)?;
        if txn_dir.exists()? {
            let committed = txn_dir.child(COMMIT_FILE).exists()?;
            if committed {
                tracing::info!("Transaction {} was committed; cleaning up", txn_dir.uri());
            } else {
                let manifest: Option<Manifest> = txn_dir
                    .child(MANIFEST_FILE)
                    .exists()?
                    .then(|| txn_dir.child(MANIFEST_FILE).read_json())
                    .transpose()
                    .unwrap_or_default();
                let kind = match &manifest {
                    Some(manifest) => {
                        if manifest.target_uri != target_dir.uri() {
                            tracing::warn!(
                                "Journal targets {}, expected {}",
                                manifest.target_uri,
                                target_dir.uri()
                            );
                        }
                        manifest.kind
                    }
                    None => TxnKind::Append,
                };
                tracing::warn!("Rolling back interrupted transaction {}", txn_dir.uri());
                for note in apply_rollback(target_dir, &txn_dir, kind) {
                    tracing::warn!("Recovery: {note}");
                }
            }
            txn_dir.delete_if_exists(true)?;
        }
    }

    TargetLock::lock_file(target_dir).delete_if_exists(false)?;
    Ok(true)
}

fn current_hostname() -> String {
    LockInfo::for_current_process().host
}
