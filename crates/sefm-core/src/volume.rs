//! Voxelwise arithmetic and the eta-squared similarity statistic.
//!
//! η² compares an image against a reference (here, the mean of all aligned
//! fieldmaps of one polarity). It reaches 1 for identical images and falls as
//! the voxelwise disagreement grows relative to the pooled variance.
//!
//! The sums below are accumulated in a fixed order (reference term first,
//! voxels in logical `[x, y, z]` order) so that repeated runs on the same
//! inputs give the same bits.

use std::path::Path;

use crate::error::{Result, SefmError};
use crate::nifti_io::{self, Volume};

fn check_shape(expected: &Volume, actual: &Volume) -> Result<()> {
    if expected.shape() != actual.shape() {
        return Err(SefmError::ShapeMismatch {
            expected: expected.shape().to_vec(),
            actual: actual.shape().to_vec(),
        });
    }
    Ok(())
}

/// Scalar mean over every voxel.
fn mean(volume: &Volume) -> f64 {
    let mut sum = 0.0;
    for &v in volume.iter() {
        sum += v;
    }
    sum / volume.len() as f64
}

/// Eta-squared of `candidate` against `reference`.
///
/// ```text
/// grand         = (mean(ref) + mean(cand)) / 2
/// within[v]     = (ref[v] + cand[v]) / 2
/// ss_within     = Σ (ref[v] - within[v])² + Σ (cand[v] - within[v])²
/// ss_total      = Σ (ref[v] - grand)²     + Σ (cand[v] - grand)²
/// η²            = 1 - ss_within / ss_total
/// ```
///
/// Returns [`SefmError::DegenerateVolume`] when `ss_total` is zero.
pub fn eta_squared(reference: &Volume, candidate: &Volume) -> Result<f64> {
    check_shape(reference, candidate)?;

    let mean_ref = mean(reference);
    let mean_cand = mean(candidate);
    let grand = (mean_ref + mean_cand) / 2.0;

    let mut ss_within_ref = 0.0;
    let mut ss_total_ref = 0.0;
    for (&r, &c) in reference.iter().zip(candidate.iter()) {
        let within = (r + c) / 2.0;
        ss_within_ref += (r - within) * (r - within);
        ss_total_ref += (r - grand) * (r - grand);
    }

    let mut ss_within_cand = 0.0;
    let mut ss_total_cand = 0.0;
    for (&r, &c) in reference.iter().zip(candidate.iter()) {
        let within = (r + c) / 2.0;
        ss_within_cand += (c - within) * (c - within);
        ss_total_cand += (c - grand) * (c - grand);
    }

    let ss_within = ss_within_ref + ss_within_cand;
    let ss_total = ss_total_ref + ss_total_cand;
    if ss_total == 0.0 {
        return Err(SefmError::DegenerateVolume);
    }
    Ok(1.0 - ss_within / ss_total)
}

/// Elementwise arithmetic mean of an ordered sequence of volumes.
pub fn voxelwise_mean(volumes: &[Volume]) -> Result<Volume> {
    let first = volumes.first().ok_or(SefmError::EmptyInput)?;
    let mut sum = first.clone();
    for vol in &volumes[1..] {
        check_shape(first, vol)?;
        sum += vol;
    }
    sum /= volumes.len() as f64;
    Ok(sum)
}

/// Load two volume files and score `candidate` against `reference`.
pub fn eta_squared_files(reference: &Path, candidate: &Path) -> Result<f64> {
    let reference = nifti_io::read_volume(reference)?;
    let candidate = nifti_io::read_volume(candidate)?;
    eta_squared(&reference, &candidate)
}
