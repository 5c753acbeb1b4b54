//! Splitting concatenated AP/PA fieldmaps.
//!
//! Some acquisitions store both polarities in one two-volume series
//! (`acq-func_dir-both_epi`). Before pair selection such a file is split into
//! a `dir-AP` and a `dir-PA` image, volume 0 is flipped along y, both are
//! resampled onto the session's first functional image, and the sidecar is
//! duplicated for the new files. The original stays on disk but its sidecar
//! is marked unusable (`PhaseEncodingDirection = "NA"`, `IntendedFor = []`).
//!
//! The caller gets back the paths it created and merges them into its index.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::bids::{sidecar_for, BidsFile, BidsIndex, BidsQuery, Category, Polarity, Session};
use crate::error::{Result, SefmError};
use crate::registrar::FieldmapTools;
use crate::sidecar::Sidecar;

/// Progress through one concatenated fieldmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStage {
    Detect,
    Split,
    Reorient,
    Realign,
    SidecarDuplicate,
    Done,
}

impl SplitStage {
    pub fn next(self) -> Self {
        match self {
            Self::Detect => Self::Split,
            Self::Split => Self::Reorient,
            Self::Reorient => Self::Realign,
            Self::Realign => Self::SidecarDuplicate,
            Self::SidecarDuplicate | Self::Done => Self::Done,
        }
    }
}

impl fmt::Display for SplitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detect => "detect",
            Self::Split => "split",
            Self::Reorient => "reorient",
            Self::Realign => "realign",
            Self::SidecarDuplicate => "sidecar-duplicate",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Images created by a split, AP before PA for each source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitOutcome {
    pub created: Vec<PathBuf>,
}

impl SplitOutcome {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}

/// Output image path for one polarity: `dir-both_` becomes `dir-AP_` or `dir-PA_`.
pub fn split_output_path(concatenated: &Path, polarity: Polarity) -> PathBuf {
    let name = concatenated
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let renamed = name.replace("dir-both_", &format!("dir-{}_", polarity.as_str()));
    concatenated.with_file_name(renamed)
}

pub struct FieldmapSplitter<'a, T: FieldmapTools + ?Sized> {
    tools: &'a T,
    stage: SplitStage,
}

impl<'a, T: FieldmapTools + ?Sized> FieldmapSplitter<'a, T> {
    pub fn new(tools: &'a T) -> Self {
        Self {
            tools,
            stage: SplitStage::Detect,
        }
    }

    /// Last stage reached.
    pub fn stage(&self) -> SplitStage {
        self.stage
    }

    fn advance(&mut self, file: &BidsFile) {
        let next = self.stage.next();
        log::debug!("{}: {} -> {}", file.file_name(), self.stage, next);
        self.stage = next;
    }

    /// Concatenated fieldmaps of a session.
    pub fn detect(index: &dyn BidsIndex, session: &Session) -> Vec<BidsFile> {
        index.query(
            &BidsQuery::for_session(session)
                .category(Category::Fmap)
                .acquisition("func")
                .direction("both"),
        )
    }

    /// Split every concatenated fieldmap of `session`. Intermediate volumes
    /// are written under `scratch`. A session without one is a no-op.
    pub fn run(
        &mut self,
        index: &dyn BidsIndex,
        session: &Session,
        scratch: &Path,
    ) -> Result<SplitOutcome> {
        let concatenated = Self::detect(index, session);
        let mut outcome = SplitOutcome::default();
        if concatenated.is_empty() {
            self.stage = SplitStage::Done;
            return Ok(outcome);
        }

        let reference = index
            .query(
                &BidsQuery::for_session(session)
                    .category(Category::Func)
                    .suffix("bold"),
            )
            .into_iter()
            .next()
            .ok_or_else(|| SefmError::MissingFunctionalReference {
                subject: session.subject.clone(),
            })?;

        for (i, file) in concatenated.iter().enumerate() {
            self.stage = SplitStage::Detect;
            let prefix = scratch.join(format!("split_{i}_vol"));
            let created = self.split_one(file, &reference.path, &prefix)?;
            outcome.created.extend(created);
        }
        Ok(outcome)
    }

    fn split_one(&mut self, file: &BidsFile, reference: &Path, prefix: &Path) -> Result<[PathBuf; 2]> {
        log::info!("Splitting concatenated fieldmap {}", file.relative.display());
        self.advance(file);

        let volumes = self.tools.split_volumes(&file.path, prefix)?;
        if volumes.len() < 2 {
            return Err(SefmError::SplitFailed {
                path: file.path.clone(),
                found: volumes.len(),
            });
        }
        self.advance(file);

        self.tools.reorient_flip_y(&volumes[0])?;
        self.advance(file);

        let ap = split_output_path(&file.path, Polarity::AP);
        let pa = split_output_path(&file.path, Polarity::PA);
        self.tools.resample_to_grid(&volumes[0], reference, &ap)?;
        self.tools.resample_to_grid(&volumes[1], reference, &pa)?;
        self.advance(file);

        for (image, polarity) in [(&ap, Polarity::AP), (&pa, Polarity::PA)] {
            let target = sidecar_for(image);
            if file.sidecar_path.is_file() {
                std::fs::copy(&file.sidecar_path, &target)?;
            } else {
                std::fs::write(&target, "{}")?;
            }
            Sidecar::edit(&target, |s| {
                s.set("PhaseEncodingDirection", polarity.phase_encoding_direction());
                Ok(())
            })?;
        }
        if file.sidecar_path.is_file() {
            Sidecar::edit(&file.sidecar_path, |s| {
                s.set("PhaseEncodingDirection", "NA");
                s.set("IntendedFor", Value::Array(Vec::new()));
                Ok(())
            })?;
        }
        self.advance(file);

        Ok([ap, pa])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::DatasetIndex;
    use crate::sidecar::get_field;
    use serde_json::json;
    use std::cell::RefCell;
    use std::fs;

    /// Records calls and fakes outputs with plain files.
    struct FakeTools {
        volumes: usize,
        calls: RefCell<Vec<String>>,
    }

    impl FakeTools {
        fn new(volumes: usize) -> Self {
            Self {
                volumes,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl FieldmapTools for FakeTools {
        fn split_volumes(&self, _input: &Path, out_prefix: &Path) -> Result<Vec<PathBuf>> {
            self.calls.borrow_mut().push("split".into());
            let outs: Vec<PathBuf> = (0..self.volumes)
                .map(|i| PathBuf::from(format!("{}{i:04}.nii.gz", out_prefix.display())))
                .collect();
            for p in &outs {
                fs::write(p, b"vol")?;
            }
            Ok(outs)
        }

        fn reorient_flip_y(&self, path: &Path) -> Result<()> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            self.calls.borrow_mut().push(format!("flip {name}"));
            Ok(())
        }

        fn resample_to_grid(&self, input: &Path, _reference: &Path, out: &Path) -> Result<()> {
            self.calls.borrow_mut().push("resample".into());
            fs::copy(input, out)?;
            Ok(())
        }
    }

    fn touch(root: &Path, rel: &str, json: Option<&str>) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        if let Some(j) = json {
            fs::write(sidecar_for(&path), j).unwrap();
        }
        path
    }

    const BOTH: &str = "sub-01/ses-A/fmap/sub-01_ses-A_acq-func_dir-both_epi.nii.gz";

    #[test]
    fn test_stage_order() {
        let mut stage = SplitStage::Detect;
        let mut seen = vec![stage];
        while stage != SplitStage::Done {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                SplitStage::Detect,
                SplitStage::Split,
                SplitStage::Reorient,
                SplitStage::Realign,
                SplitStage::SidecarDuplicate,
                SplitStage::Done
            ]
        );
    }

    #[test]
    fn test_split_output_path() {
        let p = Path::new("/d/sub-01/fmap/sub-01_acq-func_dir-both_epi.nii.gz");
        assert_eq!(
            split_output_path(p, Polarity::PA),
            Path::new("/d/sub-01/fmap/sub-01_acq-func_dir-PA_epi.nii.gz")
        );
    }

    #[test]
    fn test_no_concatenated_fieldmap_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), "sub-01/ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz", None);
        let index = DatasetIndex::scan(tmp.path()).unwrap();
        let tools = FakeTools::new(2);
        let mut splitter = FieldmapSplitter::new(&tools);
        let outcome = splitter
            .run(&index, &Session::new("01", Some("A")), tmp.path())
            .unwrap();
        assert!(outcome.is_empty());
        assert!(tools.calls.borrow().is_empty());
    }

    #[test]
    fn test_split_creates_pair_and_marks_original() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let root = tmp.path();
        touch(root, "sub-01/ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz", None);
        let both = touch(
            root,
            BOTH,
            Some(r#"{"TotalReadoutTime": 0.05, "IntendedFor": ["x"]}"#),
        );
        let index = DatasetIndex::scan(root).unwrap();
        let tools = FakeTools::new(2);
        let mut splitter = FieldmapSplitter::new(&tools);

        let outcome = splitter
            .run(&index, &Session::new("01", Some("A")), scratch.path())
            .unwrap();
        assert_eq!(splitter.stage(), SplitStage::Done);

        let ap = split_output_path(&both, Polarity::AP);
        let pa = split_output_path(&both, Polarity::PA);
        assert_eq!(outcome.created, vec![ap.clone(), pa.clone()]);
        assert!(ap.is_file() && pa.is_file());
        assert_eq!(
            *tools.calls.borrow(),
            vec!["split", "flip split_0_vol0000.nii.gz", "resample", "resample"]
        );

        assert_eq!(get_field(&sidecar_for(&ap), "PhaseEncodingDirection").unwrap(), Some(json!("j-")));
        assert_eq!(get_field(&sidecar_for(&pa), "PhaseEncodingDirection").unwrap(), Some(json!("j")));
        assert_eq!(get_field(&sidecar_for(&pa), "TotalReadoutTime").unwrap(), Some(json!(0.05)));

        let original = sidecar_for(&both);
        assert_eq!(get_field(&original, "PhaseEncodingDirection").unwrap(), Some(json!("NA")));
        assert_eq!(get_field(&original, "IntendedFor").unwrap(), Some(json!([])));
    }

    #[test]
    fn test_missing_functional_reference() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path(), BOTH, Some("{}"));
        let index = DatasetIndex::scan(tmp.path()).unwrap();
        let tools = FakeTools::new(2);
        let err = FieldmapSplitter::new(&tools)
            .run(&index, &Session::new("01", Some("A")), tmp.path())
            .unwrap_err();
        assert!(matches!(err, SefmError::MissingFunctionalReference { ref subject } if subject == "01"));
        assert!(tools.calls.borrow().is_empty());
    }

    #[test]
    fn test_single_volume_split_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        touch(tmp.path(), "sub-01/ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz", None);
        touch(tmp.path(), BOTH, Some("{}"));
        let index = DatasetIndex::scan(tmp.path()).unwrap();
        let tools = FakeTools::new(1);
        let mut splitter = FieldmapSplitter::new(&tools);
        let err = splitter
            .run(&index, &Session::new("01", Some("A")), scratch.path())
            .unwrap_err();
        assert!(matches!(err, SefmError::SplitFailed { found: 1, .. }));
        assert_eq!(splitter.stage(), SplitStage::Split);
    }
}
