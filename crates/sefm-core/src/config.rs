//! Pipeline configuration.
//!
//! [`PipelineConfig`] carries everything a run needs: where the FSL tools
//! live, where session work directories go, the participant filter and the
//! manufacturer constants table. Defaults cover the common case. An optional
//! TOML file can fill in any of it, and the CLI applies its flags on top.
//!
//! ```toml
//! [tools]
//! fsl_dir = "/opt/fsl"
//! identity_matrix = "/opt/fsl/etc/flirtsch/ident.mat"
//!
//! [run]
//! temp_dir = "/scratch/sefm"
//! debug = false
//! participant_label = ["01", "02"]
//!
//! [[manufacturer]]
//! manufacturer = "Siemens"
//! categories = ["dwi"]
//! effective_echo_spacing = 0.000689998
//! total_readout_time = 0.0959097
//! ```
//!
//! A `[[manufacturer]]` section replaces the whole built-in table.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SefmError};
use crate::manufacturer::{ManufacturerEntry, ManufacturerTable};

// ---------------------------------------------------------------------------
// Tool paths
// ---------------------------------------------------------------------------

/// Locations of the external imaging tools.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPaths {
    /// FSL installation directory (`$FSLDIR`).
    pub fsl_dir: PathBuf,
    /// 4x4 identity transform for grid resampling. `None` means the
    /// installation's `etc/flirtsch/ident.mat`, or a generated one if that is
    /// missing too.
    pub identity_matrix: Option<PathBuf>,
}

impl ToolPaths {
    pub fn new(fsl_dir: impl Into<PathBuf>) -> Self {
        Self {
            fsl_dir: fsl_dir.into(),
            identity_matrix: None,
        }
    }

    /// Directory holding the executables: `<fsl_dir>/bin` when it exists,
    /// otherwise `fsl_dir` itself.
    pub fn bin_dir(&self) -> PathBuf {
        let bin = self.fsl_dir.join("bin");
        if bin.is_dir() { bin } else { self.fsl_dir.clone() }
    }

    /// Full path of one FSL executable.
    pub fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir().join(name)
    }

    /// Identity matrix to use, if one exists on disk.
    pub fn identity_matrix(&self) -> Option<PathBuf> {
        let candidate = self
            .identity_matrix
            .clone()
            .unwrap_or_else(|| self.fsl_dir.join("etc").join("flirtsch").join("ident.mat"));
        candidate.is_file().then_some(candidate)
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self::new("/usr/local/fsl")
    }
}

// ---------------------------------------------------------------------------
// Pipeline config
// ---------------------------------------------------------------------------

/// Configuration for one `run` over a dataset.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tools: ToolPaths,
    /// Base directory for session work dirs. `None` puts each work dir in
    /// the session's `fmap` directory.
    pub temp_dir: Option<PathBuf>,
    /// Keep intermediate volumes for inspection.
    pub debug: bool,
    /// Subject labels to process (without the `sub-` prefix). `None` = all.
    pub participants: Option<Vec<String>>,
    pub manufacturers: ManufacturerTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            temp_dir: None,
            debug: false,
            participants: None,
            manufacturers: ManufacturerTable::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    tools: FileTools,
    run: FileRun,
    manufacturer: Option<Vec<ManufacturerEntry>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileTools {
    fsl_dir: Option<PathBuf>,
    identity_matrix: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileRun {
    temp_dir: Option<PathBuf>,
    debug: Option<bool>,
    participant_label: Option<Vec<String>>,
}

impl PipelineConfig {
    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| SefmError::Config(e.to_string()))?;
        let mut config = Self::default();
        if let Some(dir) = file.tools.fsl_dir {
            config.tools.fsl_dir = dir;
        }
        config.tools.identity_matrix = file.tools.identity_matrix;
        config.temp_dir = file.run.temp_dir;
        config.debug = file.run.debug.unwrap_or(false);
        config.participants = file
            .run
            .participant_label
            .map(|labels| labels.iter().map(|l| normalize_participant(l)).collect());
        if let Some(entries) = file.manufacturer {
            config.manufacturers = ManufacturerTable::new(entries);
        }
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SefmError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Replace the participant filter. Labels may carry the `sub-` prefix.
    pub fn with_participants<S: AsRef<str>>(mut self, labels: &[S]) -> Self {
        if !labels.is_empty() {
            self.participants = Some(
                labels
                    .iter()
                    .map(|l| normalize_participant(l.as_ref()))
                    .collect(),
            );
        }
        self
    }
}

/// `sub-01` and `01` name the same participant.
pub fn normalize_participant(label: &str) -> String {
    label.strip_prefix("sub-").unwrap_or(label).to_string()
}
