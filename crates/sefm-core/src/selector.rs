//! Choosing the best of several redundant fieldmap pairs.
//!
//! Every image of a polarity is rigidly registered onto the first-acquired
//! image of that polarity, the registered images are averaged, and each image
//! is scored with η² against its own polarity mean. A pair scores the worse
//! (minimum) of its two members and the best-scoring pair wins, earliest
//! acquisition first on ties. Afterwards every fieldmap sidecar gets its
//! `PhaseEncodingDirection`, and only the winning pair keeps an `IntendedFor`
//! list.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::bids::{BidsFile, Polarity};
use crate::error::{Result, SefmError};
use crate::nifti_io;
use crate::registrar::Registrar;
use crate::sidecar::Sidecar;
use crate::volume;

/// AP and PA fieldmaps at the same acquisition index.
#[derive(Debug, Clone)]
pub struct Pair {
    pub index: usize,
    pub ap: BidsFile,
    pub pa: BidsFile,
}

impl Pair {
    pub fn image(&self, polarity: Polarity) -> &BidsFile {
        match polarity {
            Polarity::AP => &self.ap,
            Polarity::PA => &self.pa,
        }
    }
}

/// η² of both members of a pair against their polarity means.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairScore {
    pub eta_ap: f64,
    pub eta_pa: f64,
}

impl PairScore {
    /// The pair's score: its weaker member.
    pub fn min(&self) -> f64 {
        self.eta_ap.min(self.eta_pa)
    }
}

/// Outcome of pair selection for one session.
#[derive(Debug, Clone)]
pub struct Selection {
    pub index: usize,
    pub pairs: Vec<Pair>,
    pub scores: Vec<PairScore>,
}

// ---------------------------------------------------------------------------
// Ordering and pairing
// ---------------------------------------------------------------------------

fn series_number(file: &BidsFile) -> Option<i64> {
    let v = file.metadata.get("SeriesNumber")?;
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

/// Orders `Some` before `None`.
fn present_first<T: Ord>(value: Option<T>) -> (bool, Option<T>) {
    (value.is_none(), value)
}

type AcquisitionKey<'a> = (
    (bool, Option<i64>),
    (bool, Option<&'a str>),
    (bool, Option<u32>),
    &'a Path,
);

fn acquisition_key(file: &BidsFile) -> AcquisitionKey<'_> {
    (
        present_first(series_number(file)),
        present_first(file.metadata.get("AcquisitionTime").and_then(Value::as_str)),
        present_first(file.entity("run").and_then(|r| r.parse().ok())),
        file.path.as_path(),
    )
}

/// Sort fieldmaps into acquisition order: `SeriesNumber`, then
/// `AcquisitionTime`, then the `run` entity, then path. Files missing a key
/// sort after the files that have it.
pub fn sort_by_acquisition(files: &mut [BidsFile]) {
    files.sort_by(|a, b| acquisition_key(a).cmp(&acquisition_key(b)));
}

/// Build index-aligned pairs. Fails before touching the filesystem when the
/// polarity counts differ or are zero.
pub fn pair_fieldmaps(mut ap: Vec<BidsFile>, mut pa: Vec<BidsFile>) -> Result<Vec<Pair>> {
    if ap.len() != pa.len() {
        return Err(SefmError::MismatchedPolarityCount {
            ap: ap.len(),
            pa: pa.len(),
        });
    }
    if ap.is_empty() {
        return Err(SefmError::EmptyPolarity { polarity: "AP" });
    }
    sort_by_acquisition(&mut ap);
    sort_by_acquisition(&mut pa);
    Ok(ap
        .into_iter()
        .zip(pa)
        .enumerate()
        .map(|(index, (ap, pa))| Pair { index, ap, pa })
        .collect())
}

/// Index of the maximum score; the first one wins ties.
pub fn select_best(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score.partial_cmp(&top) != Some(Ordering::Greater) => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Registers, scores and selects fieldmap pairs with a given registrar.
pub struct PairSelector<'a, R: Registrar + ?Sized> {
    registrar: &'a R,
}

impl<'a, R: Registrar + ?Sized> PairSelector<'a, R> {
    pub fn new(registrar: &'a R) -> Self {
        Self { registrar }
    }

    /// Register one polarity onto its first image, average, and score each
    /// registered image against the mean. Intermediates go to `workdir` as
    /// `init_<POL>_reg_<i>.nii.gz` and `<POL>_mean.nii.gz`.
    fn score_polarity(&self, pairs: &[Pair], polarity: Polarity, workdir: &Path) -> Result<Vec<f64>> {
        let fixed = &pairs[0].image(polarity).path;
        let mut registered: Vec<PathBuf> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let out = workdir.join(format!("init_{polarity}_reg_{}.nii.gz", pair.index));
            log::debug!(
                "Registering {} onto {} ({})",
                pair.image(polarity).file_name(),
                fixed.display(),
                self.registrar.name()
            );
            self.registrar
                .rigid_register(&pair.image(polarity).path, fixed, &out)?;
            registered.push(out);
        }

        let mean_path = workdir.join(format!("{polarity}_mean.nii.gz"));
        self.registrar.voxelwise_mean(&registered, &mean_path)?;
        let mean = nifti_io::read_volume(&mean_path)?;

        registered
            .iter()
            .map(|path| volume::eta_squared(&mean, &nifti_io::read_volume(path)?))
            .collect()
    }

    /// Score every pair.
    pub fn score(&self, pairs: &[Pair], workdir: &Path) -> Result<Vec<PairScore>> {
        if pairs.is_empty() {
            return Err(SefmError::EmptyPolarity { polarity: "AP" });
        }
        let ap = self.score_polarity(pairs, Polarity::AP, workdir)?;
        let pa = self.score_polarity(pairs, Polarity::PA, workdir)?;
        Ok(ap
            .into_iter()
            .zip(pa)
            .map(|(eta_ap, eta_pa)| PairScore { eta_ap, eta_pa })
            .collect())
    }

    /// Score the pairs and pick the best one. No sidecar is modified.
    pub fn select(&self, pairs: Vec<Pair>, workdir: &Path) -> Result<Selection> {
        let scores = self.score(&pairs, workdir)?;
        for (pair, score) in pairs.iter().zip(&scores) {
            log::info!(
                "Pair {} ({} / {}): eta AP {:.6}, PA {:.6}",
                pair.index,
                pair.ap.file_name(),
                pair.pa.file_name(),
                score.eta_ap,
                score.eta_pa
            );
        }
        let minima: Vec<f64> = scores.iter().map(PairScore::min).collect();
        let index = select_best(&minima).ok_or(SefmError::EmptyPolarity { polarity: "AP" })?;
        log::info!(
            "Selected pair {index} ({}) with min eta {:.6}",
            pairs[index].ap.file_name(),
            minima[index]
        );
        Ok(Selection {
            index,
            pairs,
            scores,
        })
    }

    /// Write the selection into the fieldmap sidecars: phase-encoding
    /// direction on every pair, `intended_for` on the selected pair and an
    /// empty `IntendedFor` everywhere else.
    ///
    /// A missing or malformed sidecar is logged and skipped; the others are
    /// still written. Returns the skipped sidecar paths.
    pub fn apply(&self, selection: &Selection, intended_for: &[String]) -> Result<Vec<PathBuf>> {
        let mut skipped = Vec::new();
        for pair in &selection.pairs {
            let targets: Vec<Value> = if pair.index == selection.index {
                intended_for.iter().cloned().map(Value::String).collect()
            } else {
                Vec::new()
            };
            for polarity in [Polarity::PA, Polarity::AP] {
                let path = &pair.image(polarity).sidecar_path;
                if !path.is_file() {
                    log::warn!("No sidecar for {}; skipping", pair.image(polarity).path.display());
                    skipped.push(path.clone());
                    continue;
                }
                let edited = Sidecar::edit(path, |s| {
                    s.set("PhaseEncodingDirection", polarity.phase_encoding_direction());
                    s.set("IntendedFor", Value::Array(targets.clone()));
                    Ok(())
                });
                match edited {
                    Ok(()) => {}
                    Err(e) if !e.is_session_fatal() => {
                        log::warn!("Skipping {}: {e}", path.display());
                        skipped.push(path.clone());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::{parse_file_name, sidecar_for, Category};
    use serde_json::{json, Map};

    fn fmap(name: &str, metadata: Value) -> BidsFile {
        let path = PathBuf::from("/data/sub-01/fmap").join(name);
        let (entities, suffix, extension) = parse_file_name(name).unwrap();
        let metadata: Map<String, Value> = match metadata {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        BidsFile {
            sidecar_path: sidecar_for(&path),
            relative: PathBuf::from("sub-01/fmap").join(name),
            path,
            subject: "01".to_string(),
            session: None,
            category: Category::Fmap,
            entities,
            suffix,
            extension,
            metadata,
        }
    }

    // -----------------------------------------------------------------------
    // select_best
    // -----------------------------------------------------------------------

    #[test]
    fn test_select_best_first_max_wins() {
        assert_eq!(select_best(&[0.8, 0.91, 0.91]), Some(1));
        assert_eq!(select_best(&[0.5]), Some(0));
        assert_eq!(select_best(&[0.9, 0.2, 0.9]), Some(0));
        assert_eq!(select_best(&[-0.4, -0.1, -0.3]), Some(1));
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn test_pair_score_is_maximin() {
        let scores = [
            PairScore { eta_ap: 0.99, eta_pa: 0.80 },
            PairScore { eta_ap: 0.91, eta_pa: 0.92 },
            PairScore { eta_ap: 0.95, eta_pa: 0.91 },
        ];
        let minima: Vec<f64> = scores.iter().map(PairScore::min).collect();
        assert_eq!(minima, vec![0.80, 0.91, 0.91]);
        assert_eq!(select_best(&minima), Some(1));
    }

    // -----------------------------------------------------------------------
    // Pairing
    // -----------------------------------------------------------------------

    #[test]
    fn test_pair_fieldmaps_mismatch_and_empty() {
        let ap: Vec<_> = (1..=3)
            .map(|r| fmap(&format!("sub-01_dir-AP_run-{r}_epi.nii.gz"), json!({})))
            .collect();
        let pa: Vec<_> = (1..=2)
            .map(|r| fmap(&format!("sub-01_dir-PA_run-{r}_epi.nii.gz"), json!({})))
            .collect();
        assert!(matches!(
            pair_fieldmaps(ap, pa),
            Err(SefmError::MismatchedPolarityCount { ap: 3, pa: 2 })
        ));
        assert!(matches!(
            pair_fieldmaps(Vec::new(), Vec::new()),
            Err(SefmError::EmptyPolarity { .. })
        ));
    }

    #[test]
    fn test_acquisition_order_prefers_series_number() {
        let mut files = vec![
            fmap("sub-01_dir-AP_run-1_epi.nii.gz", json!({"SeriesNumber": 12})),
            fmap("sub-01_dir-AP_run-2_epi.nii.gz", json!({"SeriesNumber": 4})),
            fmap("sub-01_dir-AP_run-10_epi.nii.gz", json!({"SeriesNumber": 8})),
        ];
        sort_by_acquisition(&mut files);
        let runs: Vec<_> = files.iter().map(|f| f.entity("run").unwrap()).collect();
        assert_eq!(runs, vec!["2", "10", "1"]);
    }

    #[test]
    fn test_acquisition_order_falls_back_to_numeric_run() {
        let mut files = vec![
            fmap("sub-01_dir-PA_run-10_epi.nii.gz", json!({})),
            fmap("sub-01_dir-PA_run-2_epi.nii.gz", json!({})),
            fmap("sub-01_dir-PA_run-1_epi.nii.gz", json!({})),
        ];
        sort_by_acquisition(&mut files);
        let runs: Vec<_> = files.iter().map(|f| f.entity("run").unwrap()).collect();
        assert_eq!(runs, vec!["1", "2", "10"]);
    }

    #[test]
    fn test_acquisition_order_puts_missing_series_number_last() {
        let mut files = vec![
            fmap("sub-01_dir-AP_run-1_epi.nii.gz", json!({})),
            fmap("sub-01_dir-AP_run-2_epi.nii.gz", json!({"SeriesNumber": 9})),
            fmap("sub-01_dir-AP_run-3_epi.nii.gz", json!({"SeriesNumber": 7})),
        ];
        sort_by_acquisition(&mut files);
        let runs: Vec<_> = files.iter().map(|f| f.entity("run").unwrap()).collect();
        assert_eq!(runs, vec!["3", "2", "1"]);
    }

    #[test]
    fn test_pairs_are_index_aligned() {
        let ap = vec![
            fmap("sub-01_dir-AP_run-2_epi.nii.gz", json!({})),
            fmap("sub-01_dir-AP_run-1_epi.nii.gz", json!({})),
        ];
        let pa = vec![
            fmap("sub-01_dir-PA_run-1_epi.nii.gz", json!({})),
            fmap("sub-01_dir-PA_run-2_epi.nii.gz", json!({})),
        ];
        let pairs = pair_fieldmaps(ap, pa).unwrap();
        assert_eq!(pairs.len(), 2);
        for pair in &pairs {
            assert_eq!(pair.ap.entity("run"), pair.pa.entity("run"));
        }
        assert_eq!(pairs[0].ap.entity("run"), Some("1"));
    }
    // -----------------------------------------------------------------------
    // Applying a selection
    // -----------------------------------------------------------------------

    struct Unused;

    impl Registrar for Unused {
        fn rigid_register(&self, _moving: &Path, _fixed: &Path, _out: &Path) -> Result<()> {
            unreachable!("apply does not register")
        }
    }

    fn fmap_at(dir: &Path, name: &str, sidecar: Option<&str>) -> BidsFile {
        let mut file = fmap(name, json!({}));
        file.path = dir.join(name);
        file.sidecar_path = sidecar_for(&file.path);
        if let Some(text) = sidecar {
            std::fs::write(&file.sidecar_path, text).unwrap();
        }
        file
    }

    #[test]
    fn test_apply_skips_broken_sidecars_and_writes_the_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let pairs = vec![
            Pair {
                index: 0,
                ap: fmap_at(dir, "sub-01_dir-AP_run-1_epi.nii.gz", Some("{ broken")),
                pa: fmap_at(dir, "sub-01_dir-PA_run-1_epi.nii.gz", None),
            },
            Pair {
                index: 1,
                ap: fmap_at(dir, "sub-01_dir-AP_run-2_epi.nii.gz", Some("{}")),
                pa: fmap_at(dir, "sub-01_dir-PA_run-2_epi.nii.gz", Some("{}")),
            },
        ];
        let selection = Selection {
            index: 1,
            pairs,
            scores: vec![PairScore { eta_ap: 0.5, eta_pa: 0.5 }; 2],
        };

        let skipped = PairSelector::new(&Unused)
            .apply(&selection, &["func/sub-01_task-rest_bold.nii.gz".to_string()])
            .unwrap();
        assert_eq!(
            skipped,
            vec![
                dir.join("sub-01_dir-PA_run-1_epi.json"),
                dir.join("sub-01_dir-AP_run-1_epi.json"),
            ]
        );
        assert_eq!(
            std::fs::read_to_string(dir.join("sub-01_dir-AP_run-1_epi.json")).unwrap(),
            "{ broken"
        );

        let selected = crate::sidecar::Sidecar::open(&dir.join("sub-01_dir-AP_run-2_epi.json")).unwrap();
        assert_eq!(selected.get_str("PhaseEncodingDirection"), Some("j-"));
        assert_eq!(
            selected.get("IntendedFor"),
            Some(&json!(["func/sub-01_task-rest_bold.nii.gz"]))
        );
    }
}
