//! Running the pipeline over a dataset.
//!
//! [`SessionDriver`] walks the (subject, session) pairs of a dataset and runs
//! the stages of each session in order:
//!
//! 1. split concatenated fieldmaps and merge the new files into the index,
//! 2. pair, register, score and select the functional fieldmaps,
//! 3. link the diffusion fieldmaps,
//! 4. correct every sidecar of the session.
//!
//! A failing session is recorded and the driver moves on. The outcome of the
//! whole run is a [`RunReport`], written as `sefm_report.json`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::bids::{BidsIndex, BidsQuery, Category, Polarity, Session};
use crate::config::PipelineConfig;
use crate::corrections::{self, CorrectionReport};
use crate::error::Result;
use crate::registrar::{FieldmapTools, Registrar};
use crate::selector::{self, PairSelector, Selection};
use crate::splitter::FieldmapSplitter;
use crate::workdir::{ActiveWorkdirs, WorkDir};

/// Default file name of the run report.
pub const REPORT_FILE: &str = "sefm_report.json";

// ---------------------------------------------------------------------------
// Report records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub index: usize,
    pub ap: String,
    pub pa: String,
    pub eta_ap: f64,
    pub eta_pa: f64,
    pub score: f64,
}

/// What happened to one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub subject: String,
    pub session: Option<String>,
    pub succeeded: bool,
    pub error: Option<String>,
    /// Images created by splitting a concatenated fieldmap.
    pub split_created: Vec<String>,
    pub pairs: Vec<PairReport>,
    pub selected: Option<usize>,
    pub intended_for: Vec<String>,
    /// Fieldmap sidecars left untouched because they were missing or malformed.
    pub skipped_sidecars: Vec<PathBuf>,
    pub dwi_fieldmaps_linked: usize,
    pub corrections: Option<CorrectionReport>,
    /// Work dir left on disk in debug mode.
    pub kept_workdir: Option<PathBuf>,
}

impl SessionReport {
    pub fn new(session: &Session) -> Self {
        Self {
            subject: session.subject.clone(),
            session: session.session.clone(),
            succeeded: false,
            error: None,
            split_created: Vec::new(),
            pairs: Vec::new(),
            selected: None,
            intended_for: Vec::new(),
            skipped_sidecars: Vec::new(),
            dwi_fieldmaps_linked: 0,
            corrections: None,
            kept_workdir: None,
        }
    }

    pub fn key(&self) -> Session {
        Session::new(self.subject.clone(), self.session.as_deref())
    }

    fn record_selection(&mut self, selection: &Selection) {
        self.selected = Some(selection.index);
        self.pairs = selection
            .pairs
            .iter()
            .zip(&selection.scores)
            .map(|(pair, score)| PairReport {
                index: pair.index,
                ap: pair.ap.relative.display().to_string(),
                pa: pair.pa.relative.display().to_string(),
                eta_ap: score.eta_ap,
                eta_pa: score.eta_pa,
                score: score.min(),
            })
            .collect();
    }
}

/// Metadata for one `run`, written to `sefm_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub version: u32,
    pub id: String,
    pub dataset: PathBuf,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub sefm_version: String,
    pub sessions: Vec<SessionReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions.iter().filter(|s| s.succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions.iter().filter(|s| !s.succeeded)
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    /// Write the report as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Runs every session of a dataset with one set of tools.
pub struct SessionDriver<'a, T: Registrar + FieldmapTools + ?Sized> {
    config: &'a PipelineConfig,
    tools: &'a T,
    workdirs: ActiveWorkdirs,
}

impl<'a, T: Registrar + FieldmapTools + ?Sized> SessionDriver<'a, T> {
    pub fn new(config: &'a PipelineConfig, tools: &'a T) -> Self {
        Self {
            config,
            tools,
            workdirs: ActiveWorkdirs::new(),
        }
    }

    /// Share a work dir registry, e.g. with an interrupt handler.
    pub fn with_workdirs(mut self, workdirs: ActiveWorkdirs) -> Self {
        self.workdirs = workdirs;
        self
    }

    /// Process every selected session. Never fails as a whole; per-session
    /// errors end up in the report.
    pub fn run(&self, index: &mut dyn BidsIndex) -> RunReport {
        let started_at = SystemTime::now();
        let started = Instant::now();
        let sessions = index.sessions(self.config.participants.as_deref());
        log::info!(
            "Processing {} session(s) under {}",
            sessions.len(),
            index.root().display()
        );

        let mut reports = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let mut report = SessionReport::new(session);
            match self.process_session(index, session, &mut report) {
                Ok(()) => {
                    report.succeeded = true;
                    log::info!("{session}: done");
                }
                Err(e) => {
                    log::error!("{session}: {e}");
                    report.error = Some(e.to_string());
                }
            }
            reports.push(report);
        }

        RunReport {
            version: 1,
            id: Uuid::new_v4().to_string(),
            dataset: index.root().to_path_buf(),
            started_at: format_iso8601(started_at),
            ended_at: format_iso8601(SystemTime::now()),
            duration_ms: started.elapsed().as_millis() as u64,
            sefm_version: crate::VERSION.to_string(),
            sessions: reports,
        }
    }

    fn workdir_base(&self, index: &dyn BidsIndex, session: &Session) -> PathBuf {
        if let Some(base) = &self.config.temp_dir {
            return base.clone();
        }
        let mut dir = index.root().join(format!("sub-{}", session.subject));
        if let Some(ses) = &session.session {
            dir.push(format!("ses-{ses}"));
        }
        dir.join(Category::Fmap.dir_name())
    }

    fn open_workdir(&self, index: &dyn BidsIndex, session: &Session) -> Result<WorkDir> {
        WorkDir::create(
            &self.workdir_base(index, session),
            session,
            self.config.debug,
            &self.workdirs,
        )
    }

    /// Run all stages for one session, filling `report` as they complete.
    pub fn process_session(
        &self,
        index: &mut dyn BidsIndex,
        session: &Session,
        report: &mut SessionReport,
    ) -> Result<()> {
        let mut workdir = None;

        if !FieldmapSplitter::<T>::detect(index, session).is_empty() {
            let wd = self.open_workdir(index, session)?;
            let outcome = FieldmapSplitter::new(self.tools).run(index, session, wd.path())?;
            index.register(&outcome.created)?;
            report.split_created = outcome
                .created
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            workdir = Some(wd);
        }

        let fieldmaps = |polarity: Polarity| {
            index.query(
                &BidsQuery::for_session(session)
                    .category(Category::Fmap)
                    .acquisition("func")
                    .direction(polarity.as_str())
                    .suffix("epi"),
            )
        };
        let pairs = selector::pair_fieldmaps(fieldmaps(Polarity::AP), fieldmaps(Polarity::PA))?;
        log::info!("{session}: {} fieldmap pair(s)", pairs.len());

        let wd = match workdir {
            Some(wd) => wd,
            None => self.open_workdir(index, session)?,
        };
        let pair_selector = PairSelector::new(self.tools);
        let selection = pair_selector.select(pairs, wd.path())?;
        report.record_selection(&selection);

        let intended_for = intended_for(index, session);
        report.skipped_sidecars = pair_selector.apply(&selection, &intended_for)?;
        report.intended_for = intended_for;
        report.kept_workdir = wd.finish()?;

        report.dwi_fieldmaps_linked = corrections::link_dwi_fieldmaps(index, session)?;
        report.corrections = Some(corrections::correct_session(
            index,
            session,
            &self.config.manufacturers,
        )?);
        Ok(())
    }
}

/// `IntendedFor` targets of the selected pair: the session's anatomical
/// images, then its functional images, as subject-relative paths.
pub fn intended_for(index: &dyn BidsIndex, session: &Session) -> Vec<String> {
    [Category::Anat, Category::Func]
        .into_iter()
        .flat_map(|category| index.query(&BidsQuery::for_session(session).category(category)))
        .map(|file| file.subject_relative())
        .collect()
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// `2026-02-15T01:30:00Z`
fn format_iso8601(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::DatasetIndex;
    use std::fs;

    #[test]
    fn test_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(20_499), (2026, 2, 15));
    }

    #[test]
    fn test_format_iso8601() {
        let t = UNIX_EPOCH + Duration::from_secs(20_499 * 86_400 + 5400);
        assert_eq!(format_iso8601(t), "2026-02-15T01:30:00Z");
    }

    #[test]
    fn test_intended_for_lists_anat_then_func() {
        let tmp = tempfile::tempdir().unwrap();
        for rel in [
            "sub-01/func/sub-01_task-rest_bold.nii.gz",
            "sub-01/anat/sub-01_T1w.nii.gz",
            "sub-01/fmap/sub-01_acq-func_dir-AP_epi.nii.gz",
        ] {
            let p = tmp.path().join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, b"").unwrap();
        }
        let index = DatasetIndex::scan(tmp.path()).unwrap();
        assert_eq!(
            intended_for(&index, &Session::new("01", None)),
            vec!["anat/sub-01_T1w.nii.gz", "func/sub-01_task-rest_bold.nii.gz"]
        );
    }

    #[test]
    fn test_report_failure_tally() {
        let ok = SessionReport {
            succeeded: true,
            ..SessionReport::new(&Session::new("01", None))
        };
        let bad = SessionReport::new(&Session::new("02", Some("B")));
        let report = RunReport {
            version: 1,
            id: Uuid::new_v4().to_string(),
            dataset: PathBuf::from("/data"),
            started_at: String::new(),
            ended_at: String::new(),
            duration_ms: 0,
            sefm_version: crate::VERSION.to_string(),
            sessions: vec![ok, bad],
        };
        assert!(report.has_failures());
        assert_eq!(report.succeeded().count(), 1);
        assert_eq!(report.failed().next().unwrap().key(), Session::new("02", Some("B")));

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(REPORT_FILE);
        report.write(&path).unwrap();
        let back: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back["sessions"][1]["session"], "B");
        assert_eq!(back["sessions"][0]["succeeded"], true);
    }
}
