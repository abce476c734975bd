//! Slice acquisition: turning slice handles into open datasets.
//!
//! A handle is a URI, an in-memory dataset, or a user-provided source.
//! Acquisition returns a guard whose drop runs the source's `close()`
//! and removes any temporary store, on every control-flow exit.

pub mod poller;

use std::fmt;

use crate::config::Config;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::fsutil::FileObj;
use crate::processor::CancelToken;
use crate::slice::poller::{poll, PollOutcome};
use crate::zarr;

/// A disposable source for one slice dataset.
///
/// `open` is called exactly once, `close` is guaranteed to run exactly
/// once afterwards regardless of success, failure or cancellation.
pub trait SliceSource: Send {
    fn open(&mut self) -> Result<Dataset>;
    fn close(&mut self);
}

/// One element of the slice sequence fed to the processor.
pub enum SliceHandle {
    /// Path or URI of a stored slice
    Uri(String),
    /// An in-memory dataset
    Dataset(Box<Dataset>),
    /// A user-provided source with scoped lifetime
    Source(Box<dyn SliceSource>),
}

impl fmt::Debug for SliceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceHandle::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            SliceHandle::Dataset(_) => f.write_str("Dataset(..)"),
            SliceHandle::Source(_) => f.write_str("Source(..)"),
        }
    }
}

impl From<&str> for SliceHandle {
    fn from(uri: &str) -> Self {
        SliceHandle::Uri(uri.to_string())
    }
}

impl From<String> for SliceHandle {
    fn from(uri: String) -> Self {
        SliceHandle::Uri(uri)
    }
}

impl From<Dataset> for SliceHandle {
    fn from(dataset: Dataset) -> Self {
        SliceHandle::Dataset(Box::new(dataset))
    }
}

impl From<Box<dyn SliceSource>> for SliceHandle {
    fn from(source: Box<dyn SliceSource>) -> Self {
        SliceHandle::Source(source)
    }
}

enum Cleanup {
    None,
    TempStore(FileObj),
    Source(Box<dyn SliceSource>),
}

/// An open slice dataset plus the cleanup owed when it goes away.
pub struct AcquiredSlice {
    dataset: Option<Dataset>,
    cleanup: Cleanup,
}

impl fmt::Debug for AcquiredSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredSlice")
            .field("dataset", &self.dataset)
            .finish()
    }
}

impl AcquiredSlice {
    pub fn dataset(&self) -> &Dataset {
        self.dataset.as_ref().expect("dataset present until drop")
    }
}

impl Drop for AcquiredSlice {
    fn drop(&mut self) {
        self.dataset = None;
        match &mut self.cleanup {
            Cleanup::None => {}
            Cleanup::TempStore(dir) => {
                tracing::info!("Removing temporary slice store {}", dir.uri());
                if let Err(e) = dir.delete_if_exists(true) {
                    tracing::warn!("Failed to remove temporary slice store: {e}");
                }
            }
            Cleanup::Source(source) => source.close(),
        }
    }
}

/// Resolve a slice handle into an open dataset.
pub fn acquire(
    config: &Config,
    temp_dir: &FileObj,
    handle: SliceHandle,
    slice_index: usize,
    cancel: &CancelToken,
) -> Result<AcquiredSlice> {
    match handle {
        SliceHandle::Uri(uri) => {
            tracing::info!("Opening slice dataset from {uri}");
            let file = FileObj::new(&uri, config.slice_storage_options.as_ref())?;
            check_slice_format(config, &uri)?;
            let dataset = wait_for_slice(config, &file, cancel)?;
            Ok(AcquiredSlice {
                dataset: Some(dataset),
                cleanup: Cleanup::None,
            })
        }
        SliceHandle::Dataset(dataset) => {
            if config.persist_mem_slices && !config.dry_run {
                let store = temp_dir.child(&format!("cubecat-slice-{slice_index}.zarr"));
                tracing::info!(
                    "Persisting in-memory slice dataset #{slice_index} to {}",
                    store.uri()
                );
                zarr::write::write_dataset(&store, &dataset)?;
                let reopened = zarr::read::open_dataset(&store)?;
                Ok(AcquiredSlice {
                    dataset: Some(reopened),
                    cleanup: Cleanup::TempStore(store),
                })
            } else {
                tracing::info!("Processing in-memory slice dataset #{slice_index}");
                Ok(AcquiredSlice {
                    dataset: Some(*dataset),
                    cleanup: Cleanup::None,
                })
            }
        }
        SliceHandle::Source(mut source) => {
            tracing::info!("Opening slice dataset #{slice_index} from source");
            match source.open() {
                Ok(dataset) => Ok(AcquiredSlice {
                    dataset: Some(dataset),
                    cleanup: Cleanup::Source(source),
                }),
                Err(e) => {
                    source.close();
                    Err(e)
                }
            }
        }
    }
}

/// Only the chunked array format is readable; anything else must be
/// converted upstream.
fn check_slice_format(config: &Config, uri: &str) -> Result<()> {
    let looks_like_zarr = uri.trim_end_matches('/').ends_with(".zarr");
    if looks_like_zarr || config.slice_engine.as_deref() == Some("zarr") {
        Ok(())
    } else {
        Err(Error::config(format!(
            "cannot determine the format of slice {uri:?}; \
             set 'slice_engine' to \"zarr\" or use a .zarr path"
        )))
    }
}

/// Open a stored slice, polling for availability when configured.
///
/// Polling distinguishes an absent store (keep polling) from a present
/// but unreadable one (fail immediately).
fn wait_for_slice(config: &Config, file: &FileObj, cancel: &CancelToken) -> Result<Dataset> {
    let Some((interval, timeout)) = config.polling() else {
        if !file.exists()? {
            return Err(Error::io(
                "open",
                file.uri(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "slice does not exist"),
            ));
        }
        return zarr::read::open_dataset(file);
    };

    let outcome = poll(interval, timeout, cancel, || {
        if !file.exists()? {
            tracing::debug!("Slice {} not ready, retrying", file.uri());
            return Ok(None);
        }
        zarr::read::open_dataset(file).map(Some)
    })?;
    match outcome {
        PollOutcome::Ready(dataset) => Ok(dataset),
        PollOutcome::TimedOut => Err(Error::SliceUnavailable(file.uri().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Array, DataType, Variable};

    fn test_config(polling: serde_json::Value, persist: bool) -> Config {
        Config::from_value(serde_json::json!({
            "target_dir": "memory://slice-tests/t.cube",
            "append_dim": "t",
            "slice_polling": polling,
            "persist_mem_slices": persist,
        }))
        .unwrap()
    }

    fn sample_dataset() -> Dataset {
        let mut ds = Dataset::new();
        ds.add_variable(
            "t",
            Variable::new(
                vec!["t".to_string()],
                Array::from_vec(vec![1], vec![0i64]).unwrap(),
            ),
        )
        .unwrap();
        ds.add_variable(
            "v",
            Variable::new(
                vec!["t".to_string(), "x".to_string()],
                Array::filled(DataType::Float32, vec![1, 4], 2.5),
            ),
        )
        .unwrap();
        ds
    }

    fn unique_dir(tag: &str) -> FileObj {
        FileObj::new(
            format!("memory://slice-tests/{}-{}", tag, uuid::Uuid::new_v4()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_acquire_memory_slice() {
        let config = test_config(serde_json::json!(false), false);
        let temp = unique_dir("mem");
        let acquired = acquire(
            &config,
            &temp,
            sample_dataset().into(),
            0,
            &CancelToken::default(),
        )
        .unwrap();
        assert!(acquired.dataset().variables.contains_key("v"));
    }

    #[test]
    fn test_acquire_persists_memory_slice() {
        let config = test_config(serde_json::json!(false), true);
        let temp = unique_dir("persist");
        let store = temp.child("cubecat-slice-3.zarr");
        {
            let acquired = acquire(
                &config,
                &temp,
                sample_dataset().into(),
                3,
                &CancelToken::default(),
            )
            .unwrap();
            assert!(store.exists().unwrap());
            let v = &acquired.dataset().variables["v"];
            assert_eq!(v.array.shape(), &[1, 4]);
        }
        // Temporary store removed on drop
        assert!(!store.exists().unwrap());
    }

    #[test]
    fn test_acquire_uri_slice() {
        let config = test_config(serde_json::json!(false), false);
        let temp = unique_dir("uri");
        let store = temp.child("s0.zarr");
        zarr::write::write_dataset(&store, &sample_dataset()).unwrap();

        let acquired = acquire(
            &config,
            &temp,
            SliceHandle::Uri(store.uri().to_string()),
            0,
            &CancelToken::default(),
        )
        .unwrap();
        let v = &acquired.dataset().variables["v"];
        assert_eq!(v.array.to_f64_vec(), vec![2.5; 4]);
    }

    #[test]
    fn test_acquire_missing_uri_without_polling() {
        let config = test_config(serde_json::json!(false), false);
        let temp = unique_dir("missing");
        let err = acquire(
            &config,
            &temp,
            SliceHandle::Uri(temp.child("absent.zarr").uri().to_string()),
            0,
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_acquire_polling_times_out() {
        let config = test_config(
            serde_json::json!({"interval": 0.01, "timeout": 0.05}),
            false,
        );
        let temp = unique_dir("timeout");
        let err = acquire(
            &config,
            &temp,
            SliceHandle::Uri(temp.child("never.zarr").uri().to_string()),
            0,
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SliceUnavailable(_)));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let config = test_config(serde_json::json!(false), false);
        let temp = unique_dir("format");
        let err = acquire(
            &config,
            &temp,
            SliceHandle::Uri(temp.child("s0.nc").uri().to_string()),
            0,
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    struct CountingSource {
        dataset: Option<Dataset>,
        closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
        fail: bool,
    }

    impl SliceSource for CountingSource {
        fn open(&mut self) -> Result<Dataset> {
            if self.fail {
                return Err(Error::config("source failed"));
            }
            Ok(self.dataset.take().expect("opened once"))
        }

        fn close(&mut self) {
            self.closed
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_source_closed_on_success_and_failure() {
        let config = test_config(serde_json::json!(false), false);
        let temp = unique_dir("source");

        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let source = Box::new(CountingSource {
            dataset: Some(sample_dataset()),
            closed: closed.clone(),
            fail: false,
        });
        {
            let acquired = acquire(
                &config,
                &temp,
                SliceHandle::Source(source),
                0,
                &CancelToken::default(),
            )
            .unwrap();
            assert!(acquired.dataset().variables.contains_key("t"));
            assert!(!closed.load(std::sync::atomic::Ordering::SeqCst));
        }
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));

        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let source = Box::new(CountingSource {
            dataset: None,
            closed: closed.clone(),
            fail: true,
        });
        let err = acquire(
            &config,
            &temp,
            SliceHandle::Source(source),
            0,
            &CancelToken::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
