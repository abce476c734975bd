//! cubecat-core: Embeddable engine for transactional slice appends to
//! chunked array cubes.
//!
//! A **cube** is a persisted chunked multi-dimensional dataset that
//! grows along one **append dimension**. Each supplied **slice**
//! contributes exactly one chunk's worth along that dimension and is
//! integrated in a crash-safe transaction: either it is fully appended,
//! or the cube is restored to its previous state.
//!
//! # Quick Start
//!
//! ```no_run
//! use cubecat_core::{process_slices, Config};
//!
//! fn main() -> cubecat_core::Result<()> {
//!     let config = Config::from_value(serde_json::json!({
//!         "target_dir": "/data/sst.cube",
//!         "append_dim": "time",
//!     }))?;
//!     process_slices(["/data/sst-2024-01.zarr", "/data/sst-2024-02.zarr"], config)
//! }
//! ```
//!
//! For lower-level access, use the individual modules directly.

pub mod append;
pub mod attrs;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod processor;
pub mod schema;
pub mod slice;
pub mod transaction;
pub mod zarr;

// Re-export commonly used types
pub use config::{AppendStep, AttrsUpdateMode, Config, ConfigDefaults, SlicePolling};
pub use dataset::{Array, Attrs, DataType, Dataset, Encoding, Variable};
pub use error::{Error, Result};
pub use fsutil::FileObj;
pub use processor::{process_slices, CancelToken, Processor};
pub use schema::{CubeSchema, CubeState, VariableSchema};
pub use slice::{SliceHandle, SliceSource};
