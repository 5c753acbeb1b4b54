//! Typed access to a BIDS dataset.
//!
//! The engine only needs a narrow view of the dataset: "give me the fmap
//! images of this session with `acq-func` and `dir-AP`", plus merged sidecar
//! metadata for each hit. [`BidsIndex`] is that contract; [`DatasetIndex`] is
//! a filesystem implementation that scans
//! `sub-*/[ses-*/]{anat,func,dwi,fmap}/` once and answers queries from memory.
//!
//! Structural changes (new files from splitting a concatenated fieldmap) are
//! merged with [`BidsIndex::register`] instead of rescanning.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, SefmError};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// BIDS datatype directory an image lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Anat,
    Func,
    Dwi,
    Fmap,
}

impl Category {
    pub const ALL: [Category; 4] = [Self::Anat, Self::Func, Self::Dwi, Self::Fmap];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Anat => "anat",
            Self::Func => "func",
            Self::Dwi => "dwi",
            Self::Fmap => "fmap",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.dir_name() == name)
    }

    /// Category of a file from its parent directory name.
    pub fn of_path(path: &Path) -> Option<Self> {
        path.parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .and_then(Self::from_dir_name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Phase-encoding polarity of a spin-echo fieldmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    AP,
    PA,
}

impl Polarity {
    /// Value of the `dir-` entity.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AP => "AP",
            Self::PA => "PA",
        }
    }

    /// `PhaseEncodingDirection` written to sidecars of this polarity.
    pub fn phase_encoding_direction(self) -> &'static str {
        match self {
            Self::AP => "j-",
            Self::PA => "j",
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scan visit: the key that scopes every lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Session {
    pub subject: String,
    pub session: Option<String>,
}

impl Session {
    pub fn new(subject: impl Into<String>, session: Option<&str>) -> Self {
        Self {
            subject: subject.into(),
            session: session.map(str::to_string),
        }
    }

    /// Filesystem-safe label, e.g. `sub-01_ses-baseline`.
    pub fn label(&self) -> String {
        match &self.session {
            Some(ses) => format!("sub-{}_ses-{}", self.subject, ses),
            None => format!("sub-{}", self.subject),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session {
            Some(ses) => write!(f, "sub-{}/ses-{}", self.subject, ses),
            None => write!(f, "sub-{}", self.subject),
        }
    }
}

// ---------------------------------------------------------------------------
// Query / result records
// ---------------------------------------------------------------------------

/// Filter over indexed images. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct BidsQuery {
    pub subject: Option<String>,
    pub session: Option<String>,
    pub category: Option<Category>,
    pub acquisition: Option<String>,
    pub direction: Option<String>,
    pub suffix: Option<String>,
}

impl BidsQuery {
    /// All images of one session.
    pub fn for_session(session: &Session) -> Self {
        Self {
            subject: Some(session.subject.clone()),
            session: session.session.clone(),
            ..Default::default()
        }
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn acquisition(mut self, acq: &str) -> Self {
        self.acquisition = Some(acq.to_string());
        self
    }

    pub fn direction(mut self, dir: &str) -> Self {
        self.direction = Some(dir.to_string());
        self
    }

    pub fn suffix(mut self, suffix: &str) -> Self {
        self.suffix = Some(suffix.to_string());
        self
    }

    fn matches(&self, file: &BidsFile) -> bool {
        fn eq(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().is_none_or(|w| have == Some(w))
        }
        eq(&self.subject, Some(file.subject.as_str()))
            && eq(&self.session, file.session.as_deref())
            && self.category.is_none_or(|c| c == file.category)
            && eq(&self.acquisition, file.entity("acq"))
            && eq(&self.direction, file.entity("dir"))
            && eq(&self.suffix, Some(file.suffix.as_str()))
    }
}

/// One indexed image and its sidecar.
#[derive(Debug, Clone)]
pub struct BidsFile {
    pub path: PathBuf,
    pub sidecar_path: PathBuf,
    /// Path relative to the dataset root, e.g. `sub-01/ses-A/func/...nii.gz`.
    pub relative: PathBuf,
    pub subject: String,
    pub session: Option<String>,
    pub category: Category,
    pub entities: BTreeMap<String, String>,
    pub suffix: String,
    pub extension: String,
    /// Inherited dataset-level JSON merged with the file's own sidecar.
    pub metadata: Map<String, Value>,
}

impl BidsFile {
    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }

    /// Path relative to the subject directory, the form BIDS expects in
    /// `IntendedFor` (e.g. `ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz`).
    pub fn subject_relative(&self) -> String {
        let mut parts = self.relative.components();
        parts.next();
        parts
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Split a BIDS file name into (entities, suffix, extension).
///
/// `sub-01_acq-func_dir-AP_epi.nii.gz` →
/// `({sub: 01, acq: func, dir: AP}, "epi", ".nii.gz")`.
pub fn parse_file_name(name: &str) -> Option<(BTreeMap<String, String>, String, String)> {
    let dot = name.find('.')?;
    let (stem, extension) = name.split_at(dot);
    let mut parts: Vec<&str> = stem.split('_').collect();
    let suffix = parts.pop()?;
    if suffix.contains('-') {
        return None;
    }
    let mut entities = BTreeMap::new();
    for part in parts {
        let (key, value) = part.split_once('-')?;
        entities.insert(key.to_string(), value.to_string());
    }
    Some((entities, suffix.to_string(), extension.to_string()))
}

/// Sidecar path for an image: same stem, `.json` extension.
pub fn sidecar_for(image: &Path) -> PathBuf {
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match name.find('.') {
        Some(dot) => &name[..dot],
        None => name.as_str(),
    };
    image.with_file_name(format!("{stem}.json"))
}

// ---------------------------------------------------------------------------
// Index contract
// ---------------------------------------------------------------------------

/// Read side of a BIDS dataset, plus explicit merging of new files.
pub trait BidsIndex {
    /// Dataset root directory.
    fn root(&self) -> &Path;

    /// Every (subject, session) pair, optionally restricted to the given
    /// subject labels (without the `sub-` prefix). Sorted.
    fn sessions(&self, subjects: Option<&[String]>) -> Vec<Session>;

    /// Images matching `query`, sorted by path.
    fn query(&self, query: &BidsQuery) -> Vec<BidsFile>;

    /// Merge newly created image files into the index.
    fn register(&mut self, images: &[PathBuf]) -> Result<()>;
}

const IMAGE_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

/// In-memory index built from one scan of a dataset directory.
pub struct DatasetIndex {
    root: PathBuf,
    files: Vec<BidsFile>,
}

impl DatasetIndex {
    /// Scan `root` for images under `sub-*/[ses-*/]<datatype>/`.
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(SefmError::Config(format!(
                "BIDS directory not found: {}",
                root.display()
            )));
        }
        let mut index = Self {
            root: root.to_path_buf(),
            files: Vec::new(),
        };

        let walker = WalkDir::new(root)
            .max_depth(4)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored(e));
        let mut images = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| SefmError::Io(e.into()))?;
            if entry.depth() >= 3 && entry.file_type().is_file() && is_image(entry.path()) {
                images.push(entry.into_path());
            }
        }
        index.register(&images)?;
        log::debug!(
            "Indexed {} image(s) under {}",
            index.files.len(),
            root.display()
        );
        Ok(index)
    }

    /// Number of indexed images.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn describe(&self, image: &Path) -> Result<Option<BidsFile>> {
        let Some(category) = Category::of_path(image) else {
            return Ok(None);
        };
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some((entities, suffix, extension)) = parse_file_name(&name) else {
            log::debug!("Skipping non-BIDS file name {name}");
            return Ok(None);
        };
        let Some(subject) = entities.get("sub").cloned() else {
            return Ok(None);
        };
        let session = entities.get("ses").cloned();
        let relative = image
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| image.to_path_buf());
        let sidecar_path = sidecar_for(image);
        let metadata = self.merged_metadata(image, &entities, &suffix, &sidecar_path);

        Ok(Some(BidsFile {
            path: image.to_path_buf(),
            sidecar_path,
            relative,
            subject,
            session,
            category,
            entities,
            suffix,
            extension,
            metadata,
        }))
    }

    /// Merge inherited JSON (dataset root, then subject, then session
    /// directory) with the file's own sidecar. Deeper files win.
    fn merged_metadata(
        &self,
        image: &Path,
        entities: &BTreeMap<String, String>,
        suffix: &str,
        sidecar: &Path,
    ) -> Map<String, Value> {
        let mut merged = Map::new();
        let mut levels = vec![self.root.clone()];
        if let Some(sub) = entities.get("sub") {
            let sub_dir = self.root.join(format!("sub-{sub}"));
            if let Some(ses) = entities.get("ses") {
                levels.push(sub_dir.clone());
                levels.push(sub_dir.join(format!("ses-{ses}")));
            } else {
                levels.push(sub_dir);
            }
        }

        for dir in levels {
            for candidate in inherited_sidecars(&dir, entities, suffix) {
                if candidate != sidecar {
                    merge_json_file(&mut merged, &candidate);
                }
            }
        }
        if sidecar.is_file() {
            merge_json_file(&mut merged, sidecar);
        } else {
            log::debug!("No sidecar for {}", image.display());
        }
        merged
    }
}

impl BidsIndex for DatasetIndex {
    fn root(&self) -> &Path {
        &self.root
    }

    fn sessions(&self, subjects: Option<&[String]>) -> Vec<Session> {
        let set: BTreeSet<Session> = self
            .files
            .iter()
            .filter(|f| subjects.is_none_or(|s| s.iter().any(|id| id == &f.subject)))
            .map(|f| Session::new(f.subject.clone(), f.session.as_deref()))
            .collect();
        set.into_iter().collect()
    }

    fn query(&self, query: &BidsQuery) -> Vec<BidsFile> {
        self.files
            .iter()
            .filter(|f| query.matches(f))
            .cloned()
            .collect()
    }

    fn register(&mut self, images: &[PathBuf]) -> Result<()> {
        for image in images {
            if let Some(file) = self.describe(image)? {
                self.files.retain(|f| f.path != file.path);
                self.files.push(file);
            }
        }
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(())
    }
}

pub(crate) fn is_ignored(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return true;
    }
    if entry.file_type().is_dir() {
        return match entry.depth() {
            1 => !name.starts_with("sub-"),
            2 => !(name.starts_with("ses-") || Category::from_dir_name(&name).is_some()),
            3 => Category::from_dir_name(&name).is_none(),
            _ => false,
        };
    }
    false
}

fn is_image(path: &Path) -> bool {
    let name = path.to_string_lossy();
    IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// JSON files directly in `dir` whose entities are a subset of `entities`
/// and whose suffix matches. Sorted so fewer entities (more general) come first.
fn inherited_sidecars(
    dir: &Path,
    entities: &BTreeMap<String, String>,
    suffix: &str,
) -> Vec<PathBuf> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    for entry in read.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((ents, sfx, ext)) = parse_file_name(&name) else {
            continue;
        };
        if ext != ".json" || sfx != suffix {
            continue;
        }
        if ents.iter().all(|(k, v)| entities.get(k) == Some(v)) {
            found.push((ents.len(), path));
        }
    }
    found.sort();
    found.into_iter().map(|(_, p)| p).collect()
}

fn merge_json_file(into: &mut Map<String, Value>, path: &Path) {
    let parsed = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<Map<String, Value>>(&s).ok());
    match parsed {
        Some(obj) => into.extend(obj),
        None => log::warn!("Skipping unreadable sidecar {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str, json: Option<&str>) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        if let Some(j) = json {
            fs::write(sidecar_for(&path), j).unwrap();
        }
    }

    fn dataset() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("dataset_description.json"), "{}").unwrap();
        fs::write(
            root.join("task-rest_bold.json"),
            r#"{"RepetitionTime": 0.8, "Manufacturer": "Siemens"}"#,
        )
        .unwrap();
        touch(root, "sub-01/ses-A/anat/sub-01_ses-A_T1w.nii.gz", Some("{}"));
        touch(
            root,
            "sub-01/ses-A/func/sub-01_ses-A_task-rest_bold.nii.gz",
            Some(r#"{"Manufacturer": "GE"}"#),
        );
        touch(
            root,
            "sub-01/ses-A/fmap/sub-01_ses-A_acq-func_dir-AP_run-01_epi.nii.gz",
            Some("{}"),
        );
        touch(
            root,
            "sub-01/ses-A/fmap/sub-01_ses-A_acq-func_dir-PA_run-01_epi.nii.gz",
            Some("{}"),
        );
        touch(root, "sub-02/anat/sub-02_T1w.nii.gz", None);
        touch(root, "derivatives/sub-01/anat/sub-01_T1w.nii.gz", None);
        tmp
    }

    // -----------------------------------------------------------------------
    // File name parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_file_name() {
        let (ents, suffix, ext) =
            parse_file_name("sub-01_ses-A_acq-func_dir-AP_run-02_epi.nii.gz").unwrap();
        assert_eq!(ents["sub"], "01");
        assert_eq!(ents["dir"], "AP");
        assert_eq!(ents["run"], "02");
        assert_eq!(suffix, "epi");
        assert_eq!(ext, ".nii.gz");
    }

    #[test]
    fn test_parse_file_name_rejects_non_bids() {
        assert!(parse_file_name("vol0000.nii.gz").is_some_and(|(e, _, _)| e.is_empty()));
        assert!(parse_file_name("README").is_none());
        assert!(parse_file_name("sub-01_bad-.nii").is_none());
    }

    #[test]
    fn test_sidecar_for() {
        assert_eq!(
            sidecar_for(Path::new("/d/fmap/sub-01_dir-AP_epi.nii.gz")),
            PathBuf::from("/d/fmap/sub-01_dir-AP_epi.json")
        );
    }

    // -----------------------------------------------------------------------
    // DatasetIndex
    // -----------------------------------------------------------------------

    #[test]
    fn test_scan_finds_sessions() {
        let tmp = dataset();
        let index = DatasetIndex::scan(tmp.path()).unwrap();
        assert_eq!(index.len(), 5);
        let sessions = index.sessions(None);
        assert_eq!(
            sessions,
            vec![Session::new("01", Some("A")), Session::new("02", None)]
        );
        let only = index.sessions(Some(&["02".to_string()]));
        assert_eq!(only, vec![Session::new("02", None)]);
    }

    #[test]
    fn test_query_filters_by_entities() {
        let tmp = dataset();
        let index = DatasetIndex::scan(tmp.path()).unwrap();
        let ses = Session::new("01", Some("A"));
        let ap = index.query(
            &BidsQuery::for_session(&ses)
                .category(Category::Fmap)
                .acquisition("func")
                .direction("AP"),
        );
        assert_eq!(ap.len(), 1);
        assert_eq!(ap[0].entity("run"), Some("01"));
        assert_eq!(
            ap[0].subject_relative(),
            "ses-A/fmap/sub-01_ses-A_acq-func_dir-AP_run-01_epi.nii.gz"
        );
    }

    #[test]
    fn test_metadata_inherits_and_file_level_wins() {
        let tmp = dataset();
        let index = DatasetIndex::scan(tmp.path()).unwrap();
        let ses = Session::new("01", Some("A"));
        let func = index.query(&BidsQuery::for_session(&ses).category(Category::Func));
        assert_eq!(func.len(), 1);
        assert_eq!(func[0].metadata["RepetitionTime"], 0.8);
        assert_eq!(func[0].metadata["Manufacturer"], "GE");
    }

    #[test]
    fn test_register_adds_new_files() {
        let tmp = dataset();
        let mut index = DatasetIndex::scan(tmp.path()).unwrap();
        let rel = "sub-01/ses-A/fmap/sub-01_ses-A_acq-func_dir-AP_run-02_epi.nii.gz";
        touch(tmp.path(), rel, Some("{}"));
        index.register(&[tmp.path().join(rel)]).unwrap();
        index.register(&[tmp.path().join(rel)]).unwrap();
        let ses = Session::new("01", Some("A"));
        let ap = index.query(&BidsQuery::for_session(&ses).direction("AP"));
        assert_eq!(ap.len(), 2);
    }

    #[test]
    fn test_scan_missing_root_is_config_error() {
        assert!(matches!(
            DatasetIndex::scan(Path::new("/definitely/not/here")),
            Err(SefmError::Config(_))
        ));
    }
}
