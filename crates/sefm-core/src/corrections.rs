//! Derived sidecar corrections.
//!
//! Each rule works on an open [`Sidecar`] and is idempotent: running it on an
//! already corrected file changes nothing. [`correct_sidecar`] applies the
//! rules that fit a file's category in one read-modify-write;
//! [`correct_session`] and [`correct_dataset`] drive it over a session or a
//! whole dataset, skipping (and logging) sidecars that are not valid JSON.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::bids::{self, BidsIndex, BidsQuery, Category, Polarity, Session};
use crate::error::{Result, SefmError};
use crate::manufacturer::{Lookup, ManufacturerTable};
use crate::sidecar::{SetOutcome, Sidecar};

const TOTAL_READOUT_TIME: &str = "TotalReadoutTime";
const EFFECTIVE_ECHO_SPACING: &str = "EffectiveEchoSpacing";
const RECON_MATRIX_PE: &str = "ReconMatrixPE";
const DWELL_TIME: &str = "DwellTime";
const INTENDED_FOR: &str = "IntendedFor";
const SLICE_TIMING: &str = "SliceTiming";
const PE_DIRECTION: &str = "PhaseEncodingDirection";
const PE_AXIS: &str = "PhaseEncodingAxis";

// ---------------------------------------------------------------------------
// Readout time
// ---------------------------------------------------------------------------

/// What [`derive_total_readout_time`] found.
#[derive(Debug, Clone, PartialEq)]
pub enum Readout {
    /// `TotalReadoutTime` was already set.
    Present,
    Derived(f64),
    /// Source fields needed for the derivation, by name.
    Missing(Vec<&'static str>),
}

/// Both sources of the readout-time derivation are present as numbers.
fn readout_derivable(sidecar: &Sidecar) -> bool {
    sidecar.get_f64(EFFECTIVE_ECHO_SPACING).is_some() && sidecar.get_f64(RECON_MATRIX_PE).is_some()
}

/// `TotalReadoutTime = EffectiveEchoSpacing * (ReconMatrixPE - 1)` when the
/// field is absent and both sources are present. Nothing is fabricated when a
/// source is missing; each missing one is reported.
pub fn derive_total_readout_time(sidecar: &mut Sidecar) -> Readout {
    if sidecar.contains(TOTAL_READOUT_TIME) {
        return Readout::Present;
    }
    let spacing = sidecar.get_f64(EFFECTIVE_ECHO_SPACING);
    let matrix = sidecar.get_f64(RECON_MATRIX_PE);
    match (spacing, matrix) {
        (Some(spacing), Some(matrix)) => {
            let trt = spacing * (matrix - 1.0);
            sidecar.set(TOTAL_READOUT_TIME, trt);
            Readout::Derived(trt)
        }
        _ => {
            let mut missing = Vec::new();
            if spacing.is_none() {
                missing.push(EFFECTIVE_ECHO_SPACING);
            }
            if matrix.is_none() {
                missing.push(RECON_MATRIX_PE);
            }
            for field in &missing {
                log::warn!(
                    "Cannot derive {TOTAL_READOUT_TIME} for {}: {field} is missing",
                    sidecar.path().display()
                );
            }
            Readout::Missing(missing)
        }
    }
}

// ---------------------------------------------------------------------------
// IntendedFor
// ---------------------------------------------------------------------------

static SESSION_PATH: OnceLock<Regex> = OnceLock::new();

fn session_path() -> &'static Regex {
    SESSION_PATH.get_or_init(|| {
        Regex::new(r".*(ses-.*_ses-.+)").expect("session path regex must compile")
    })
}

/// Strip any machine-specific prefix from one `IntendedFor` entry, keeping
/// the path from the session folder on. Entries without a session-scoped
/// file name come back unchanged.
pub fn normalize_intended_path(entry: &str) -> String {
    session_path().replace(entry, "$1").into_owned()
}

/// Normalize every `IntendedFor` entry. A bare string is treated as a
/// one-element list and is written back as a list. Returns whether the
/// sidecar changed.
pub fn normalize_intended_for(sidecar: &mut Sidecar) -> bool {
    let entries: Vec<String> = match sidecar.get(INTENDED_FOR) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => return false,
    };
    let normalized: Vec<Value> = entries
        .iter()
        .map(|e| Value::String(normalize_intended_path(e)))
        .collect();
    sidecar.set(INTENDED_FOR, Value::Array(normalized)) != SetOutcome::Unchanged
}

// ---------------------------------------------------------------------------
// SliceTiming, phase encoding
// ---------------------------------------------------------------------------

/// Functional sidecars must not carry `SliceTiming`.
pub fn remove_slice_timing(sidecar: &mut Sidecar) -> bool {
    sidecar.remove(SLICE_TIMING)
}

/// Fill whichever of `PhaseEncodingAxis` / `PhaseEncodingDirection` is
/// missing from the other. The axis never carries the `-` polarity marker,
/// and a direction of `NA` (a superseded concatenated fieldmap) yields no
/// axis.
pub fn reconcile_phase_encoding(sidecar: &mut Sidecar) -> bool {
    let axis = sidecar.get_str(PE_AXIS).map(str::to_string);
    let direction = sidecar.get_str(PE_DIRECTION).map(str::to_string);
    match (axis, direction) {
        (Some(axis), None) => {
            sidecar.set(PE_DIRECTION, axis);
            true
        }
        (None, Some(direction)) if direction != "NA" => {
            sidecar.set(PE_AXIS, direction.trim_end_matches('-').to_string());
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Manufacturer constants
// ---------------------------------------------------------------------------

/// Look a vendor field up in the sidecar itself, then in the metadata it
/// inherits from higher-level JSON files.
fn vendor_field(sidecar: &Sidecar, inherited: &Map<String, Value>, name: &str) -> Option<String> {
    sidecar
        .get_str(name)
        .or_else(|| inherited.get(name).and_then(Value::as_str))
        .map(str::to_string)
}

/// Fill vendor timing constants for `category`. `Manufacturer` and
/// `SoftwareVersions` are read from the sidecar, falling back to `inherited`;
/// writes only ever go to the sidecar. A constant is only written when the
/// field is absent, and `TotalReadoutTime` only when it cannot be derived
/// from the file's own `EffectiveEchoSpacing` and `ReconMatrixPE`. Returns
/// the names of the fields written.
pub fn apply_manufacturer_constants(
    sidecar: &mut Sidecar,
    table: &ManufacturerTable,
    category: Category,
    inherited: &Map<String, Value>,
) -> Vec<&'static str> {
    let Some(manufacturer) = vendor_field(sidecar, inherited, "Manufacturer") else {
        log::debug!("No Manufacturer for {}", sidecar.path().display());
        return Vec::new();
    };
    let software = vendor_field(sidecar, inherited, "SoftwareVersions");
    let constants = match table.lookup(&manufacturer, software.as_deref(), category) {
        Lookup::Found(c) => c.clone(),
        Lookup::NotApplicable => {
            log::debug!(
                "No {category} timing constants for {manufacturer} {} in {}",
                software.as_deref().unwrap_or("(any version)"),
                sidecar.path().display()
            );
            return Vec::new();
        }
        Lookup::UnknownManufacturer => {
            log::warn!(
                "Unrecognized manufacturer {manufacturer:?} in {}; timing fields left unset",
                sidecar.path().display()
            );
            return Vec::new();
        }
    };

    let derivable = readout_derivable(sidecar);
    let mut written = Vec::new();
    if let Some(v) = constants.effective_echo_spacing {
        if !sidecar.contains(EFFECTIVE_ECHO_SPACING) {
            sidecar.set(EFFECTIVE_ECHO_SPACING, v);
            written.push(EFFECTIVE_ECHO_SPACING);
        }
    }
    if let Some(v) = constants.total_readout_time {
        if !sidecar.contains(TOTAL_READOUT_TIME) && !derivable {
            sidecar.set(TOTAL_READOUT_TIME, v);
            written.push(TOTAL_READOUT_TIME);
        }
    }
    if let Some(v) = constants.dwell_time {
        if !sidecar.contains(DWELL_TIME) {
            sidecar.set(DWELL_TIME, v);
            written.push(DWELL_TIME);
        }
    }
    written
}

// ---------------------------------------------------------------------------
// Per-file and batch drivers
// ---------------------------------------------------------------------------

/// Vendor table plus the metadata a sidecar inherits, for
/// [`apply_manufacturer_constants`].
#[derive(Debug, Clone, Copy)]
pub struct VendorContext<'a> {
    pub table: &'a ManufacturerTable,
    pub inherited: &'a Map<String, Value>,
}

/// Apply every rule that fits `category` to one sidecar. Manufacturer
/// constants are only filled when a vendor context is given. Returns whether
/// the file changed.
pub fn correct_sidecar(
    path: &Path,
    category: Category,
    vendor: Option<VendorContext<'_>>,
) -> Result<bool> {
    Sidecar::edit(path, |s| {
        if let Some(vendor) = vendor {
            apply_manufacturer_constants(s, vendor.table, category, vendor.inherited);
        }
        reconcile_phase_encoding(s);
        match category {
            Category::Fmap => {
                derive_total_readout_time(s);
                normalize_intended_for(s);
            }
            Category::Func => {
                derive_total_readout_time(s);
                remove_slice_timing(s);
            }
            Category::Dwi => {
                if readout_derivable(s) {
                    derive_total_readout_time(s);
                }
            }
            Category::Anat => {}
        }
        Ok(s.is_dirty())
    })
}

/// Tally of a correction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrectionReport {
    pub examined: usize,
    pub changed: usize,
    /// Sidecars that could not be parsed.
    pub skipped: Vec<PathBuf>,
}

impl CorrectionReport {
    /// Run one file through `correct_sidecar`, recording the result. A
    /// malformed sidecar is logged and skipped; other errors propagate.
    fn apply(
        &mut self,
        path: &Path,
        category: Category,
        vendor: Option<VendorContext<'_>>,
    ) -> Result<()> {
        self.examined += 1;
        match correct_sidecar(path, category, vendor) {
            Ok(true) => self.changed += 1,
            Ok(false) => {}
            Err(SefmError::MalformedSidecar { path, reason }) => {
                log::warn!("Skipping malformed sidecar {}: {reason}", path.display());
                self.skipped.push(path);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Correct every sidecar of one session, manufacturer constants included.
/// The vendor lookup sees each file's inherited metadata.
pub fn correct_session(
    index: &dyn BidsIndex,
    session: &Session,
    table: &ManufacturerTable,
) -> Result<CorrectionReport> {
    let mut report = CorrectionReport::default();
    for category in Category::ALL {
        let files = index.query(&BidsQuery::for_session(session).category(category));
        for file in files {
            if file.sidecar_path.is_file() {
                let vendor = VendorContext {
                    table,
                    inherited: &file.metadata,
                };
                report.apply(&file.sidecar_path, category, Some(vendor))?;
            }
        }
    }
    Ok(report)
}

/// Walk every `.json` under `root` and apply the derived rules (readout
/// time, `IntendedFor` normalization, `SliceTiming` removal, phase-encoding
/// reconciliation). Files outside a datatype directory are not touched.
pub fn correct_dataset(root: &Path) -> Result<CorrectionReport> {
    if !root.is_dir() {
        return Err(SefmError::Config(format!(
            "BIDS directory not found: {}",
            root.display()
        )));
    }
    let mut report = CorrectionReport::default();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !bids::is_ignored(e));
    for entry in walker {
        let entry = entry.map_err(|e| SefmError::Io(e.into()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|e| e != "json") {
            continue;
        }
        let Some(category) = Category::of_path(path) else {
            continue;
        };
        report.apply(path, category, None)?;
    }
    log::info!(
        "Corrected {} of {} sidecars under {}",
        report.changed,
        report.examined,
        root.display()
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// DWI fieldmaps
// ---------------------------------------------------------------------------

/// Point the session's AP diffusion fieldmap at every diffusion run and mark
/// a PA diffusion fieldmap, if any, as unused. Missing or malformed sidecars
/// are logged and skipped. Returns the number of fieldmap sidecars edited.
pub fn link_dwi_fieldmaps(index: &dyn BidsIndex, session: &Session) -> Result<usize> {
    let dwi_runs: Vec<Value> = index
        .query(
            &BidsQuery::for_session(session)
                .category(Category::Dwi)
                .suffix("dwi"),
        )
        .iter()
        .map(|f| Value::String(f.subject_relative()))
        .collect();

    let mut edited = 0;
    for polarity in [Polarity::AP, Polarity::PA] {
        let fieldmaps = index.query(
            &BidsQuery::for_session(session)
                .category(Category::Fmap)
                .acquisition("dwi")
                .direction(polarity.as_str()),
        );
        for fmap in fieldmaps {
            if !fmap.sidecar_path.is_file() {
                log::warn!("No sidecar for {}", fmap.path.display());
                continue;
            }
            let intended = match polarity {
                Polarity::AP => dwi_runs.clone(),
                Polarity::PA => Vec::new(),
            };
            let result = Sidecar::edit(&fmap.sidecar_path, |s| {
                s.set(INTENDED_FOR, Value::Array(intended));
                s.set(PE_DIRECTION, polarity.phase_encoding_direction());
                Ok(())
            });
            match result {
                Ok(()) => edited += 1,
                Err(e) if !e.is_session_fatal() => {
                    log::warn!("Skipping {}: {e}", fmap.sidecar_path.display());
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(edited)
}
