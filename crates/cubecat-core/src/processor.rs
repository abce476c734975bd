//! The outermost coordinator: per-slice lock → validate → journal →
//! append → commit, with startup recovery and `force_new` handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::append;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsutil::FileObj;
use crate::lock::TargetLock;
use crate::slice::{self, SliceHandle};
use crate::transaction;

/// Cooperative cancellation flag, checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Drives the processing of a slice sequence against one target cube.
#[derive(Debug)]
pub struct Processor {
    config: Config,
    target_dir: FileObj,
    temp_dir: FileObj,
    cancel: CancelToken,
}

impl Processor {
    pub fn new(config: Config) -> Result<Self> {
        let mut target_dir =
            FileObj::new(&config.target_dir, config.target_storage_options.as_ref())?;

        // Surface a missing parent directory as an explicit precondition
        // instead of a late I/O error at lock-acquisition time. Only
        // meaningful on the local filesystem, where directories exist
        // independently of their content.
        if target_dir.fs().protocol() == "file" {
            let parent = target_dir.parent()?;
            if !parent.path().is_empty() && !parent.exists()? {
                return Err(Error::config(format!(
                    "parent directory of target {:?} does not exist",
                    target_dir.uri()
                )));
            }
        }

        let mut temp_dir = FileObj::new(
            &config.temp_dir_uri(),
            config.temp_storage_options.as_ref(),
        )?;

        if config.dry_run {
            tracing::info!("Dry run: no files will be created, changed, or deleted");
            target_dir = target_dir.into_dry_run();
            temp_dir = temp_dir.into_dry_run();
        }

        Ok(Self {
            config,
            target_dir,
            temp_dir,
            cancel: CancelToken::default(),
        })
    }

    /// Token that cancels this processor from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target_dir(&self) -> &FileObj {
        &self.target_dir
    }

    /// Process the slices in order. Each slice is one independent
    /// transaction; on failure the failing slice index is reported and
    /// already committed slices remain valid. An empty sequence leaves
    /// the cube and filesystem unchanged.
    pub fn process_slices<I>(&self, slices: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<SliceHandle>,
    {
        transaction::recover_interrupted(
            &self.target_dir,
            self.config.temp_storage_options.as_ref(),
        )?;

        if self.config.force_new {
            self.force_new()?;
        }

        for (index, handle) in slices.into_iter().enumerate() {
            self.cancel.check()?;
            let started = Instant::now();
            if let Err(e) = self.process_slice(handle.into(), index) {
                tracing::error!("Processing of slice #{index} failed: {e}");
                return Err(e);
            }
            if self.config.profiling.enabled() {
                tracing::info!(
                    "Slice #{index} processed in {:.3} s",
                    started.elapsed().as_secs_f64()
                );
            }
        }
        Ok(())
    }

    fn process_slice(&self, handle: SliceHandle, index: usize) -> Result<()> {
        let acquired = slice::acquire(&self.config, &self.temp_dir, handle, index, &self.cancel)?;
        append::process_dataset(
            &self.config,
            &self.target_dir,
            &self.temp_dir,
            acquired.dataset(),
            &self.cancel,
        )
    }

    /// Destroy an existing cube and its lock before processing starts.
    /// The deletion runs under a freshly acquired lock and is not
    /// journalled.
    fn force_new(&self) -> Result<()> {
        let lock_file = TargetLock::lock_file(&self.target_dir);
        if lock_file.delete_if_exists(false)? {
            tracing::warn!("Removed existing lock {} (force_new)", lock_file.uri());
        }
        let lock = TargetLock::acquire(&self.target_dir, None, &self.cancel)?;
        if self.target_dir.exists()? {
            tracing::warn!(
                "Deleting existing cube {} (force_new)",
                self.target_dir.uri()
            );
            self.target_dir.delete(true)?;
        }
        lock.release();
        Ok(())
    }
}

/// Process a sequence of slice handles with the given configuration.
///
/// This is the programmatic entry point; the CLI is a thin wrapper
/// around it.
pub fn process_slices<I>(slices: I, config: Config) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<SliceHandle>,
{
    Processor::new(config)?.process_slices(slices)
}
