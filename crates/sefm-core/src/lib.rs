//! # sefm-core
//!
//! Spin-echo fieldmap pairing and BIDS sidecar correction.
//!
//! A session often carries several redundant AP/PA spin-echo fieldmap pairs.
//! This crate picks the pair that best represents the session's average
//! distortion field and rewrites the dataset's JSON sidecars so that only that
//! pair is marked for use and every timing/direction field downstream tools
//! need is present and consistent.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sefm_core::{DatasetIndex, FslTools, PipelineConfig, SessionDriver, ToolPaths};
//!
//! let config = PipelineConfig {
//!     tools: ToolPaths::new("/usr/local/fsl"),
//!     ..PipelineConfig::default()
//! };
//! let tools = FslTools::new(config.tools.clone());
//! let mut index = DatasetIndex::scan("/data/bids".as_ref()).unwrap();
//!
//! let report = SessionDriver::new(&config, &tools).run(&mut index);
//! println!("{} session(s) failed", report.failed().count());
//! ```
//!
//! ## Architecture
//!
//! Index → Splitter → Selector (Registrar + η²) → Corrections → Report
//!
//! - [`bids`]: typed queries over the dataset, [`DatasetIndex`] scans it.
//! - [`splitter`]: breaks a concatenated `dir-both` fieldmap into AP and PA.
//! - [`selector`]: registers, averages, scores and chooses the best pair.
//! - [`registrar`]: the boundary to FSL ([`FslTools`]).
//! - [`sidecar`] and [`corrections`]: scoped JSON edits and derived rules.
//! - [`driver`]: runs every session and collects a [`RunReport`].

pub mod bids;
pub mod config;
pub mod corrections;
pub mod driver;
pub mod error;
pub mod manufacturer;
pub mod nifti_io;
pub mod registrar;
pub mod selector;
pub mod sidecar;
pub mod splitter;
pub mod volume;
pub mod workdir;

pub use bids::{BidsFile, BidsIndex, BidsQuery, Category, DatasetIndex, Polarity, Session};
pub use config::{PipelineConfig, ToolPaths};
pub use corrections::{CorrectionReport, correct_dataset, correct_session};
pub use driver::{REPORT_FILE, RunReport, SessionDriver, SessionReport};
pub use error::{Result, SefmError};
pub use manufacturer::{ManufacturerEntry, ManufacturerTable, TimingConstants};
pub use nifti_io::Volume;
pub use registrar::{FieldmapTools, FslTools, Registrar};
pub use selector::{Pair, PairScore, PairSelector, Selection, select_best};
pub use sidecar::{SetOutcome, Sidecar, get_field, remove_field, set_field};
pub use splitter::{FieldmapSplitter, SplitOutcome, SplitStage};
pub use volume::{eta_squared, eta_squared_files, voxelwise_mean};
pub use workdir::{ActiveWorkdirs, WorkDir};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
