//! NIfTI file I/O.
//!
//! Reads `.nii` / `.nii.gz` files into `ndarray` arrays indexed `[x, y, z]`
//! (or `[x, y, z, t]`), and writes arrays back out, optionally copying the
//! geometry of a reference header. Gzip is chosen by the `nifti` writer from
//! the output file extension.

use std::path::Path;

use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::error::{Result, SefmError};

/// A single 3-D image volume.
pub type Volume = Array3<f64>;

fn nifti_err(path: &Path, e: impl std::fmt::Display) -> SefmError {
    SefmError::Nifti {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn read_array(path: &Path) -> Result<(NiftiHeader, ArrayD<f64>)> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_err(path, e))?;
    let header = obj.header().clone();
    let array = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| nifti_err(path, e))?;
    Ok((header, array))
}

/// Load a 3-D volume.
///
/// A 4-D file with a single timepoint is accepted and squeezed; anything with
/// more timepoints is rejected.
pub fn read_volume(path: &Path) -> Result<Volume> {
    let (_, array) = read_array(path)?;
    match array.ndim() {
        3 => array
            .into_dimensionality::<Ix3>()
            .map_err(|e| nifti_err(path, e)),
        4 if array.shape()[3] == 1 => array
            .index_axis_move(Axis(3), 0)
            .into_dimensionality::<Ix3>()
            .map_err(|e| nifti_err(path, e)),
        n => Err(nifti_err(
            path,
            format!("expected a 3-D volume, got {n}-D with shape {:?}", array.shape()),
        )),
    }
}

/// Load a 4-D series. A 3-D file is returned as a series of length one.
pub fn read_series(path: &Path) -> Result<Array4<f64>> {
    let (_, array) = read_array(path)?;
    match array.ndim() {
        3 => array
            .insert_axis(Axis(3))
            .into_dimensionality::<Ix4>()
            .map_err(|e| nifti_err(path, e)),
        4 => array
            .into_dimensionality::<Ix4>()
            .map_err(|e| nifti_err(path, e)),
        n => Err(nifti_err(path, format!("expected 3-D or 4-D data, got {n}-D"))),
    }
}

/// Read only the header of a NIfTI file.
pub fn read_header(path: &Path) -> Result<NiftiHeader> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_err(path, e))?;
    Ok(obj.header().clone())
}

/// Write a 3-D volume. When `reference` is given its geometry (pixdim,
/// qform/sform) is copied into the output header.
pub fn write_volume(path: &Path, volume: &Volume, reference: Option<&NiftiHeader>) -> Result<()> {
    let options = WriterOptions::new(path);
    let options = match reference {
        Some(header) => options.reference_header(header),
        None => options,
    };
    options.write_nifti(volume).map_err(|e| nifti_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_write_then_read_volume_preserves_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vol.nii.gz");
        let vol = Array::from_shape_fn((3, 4, 2), |(x, y, z)| (x + 10 * y + 100 * z) as f64);

        write_volume(&path, &vol, None).unwrap();
        let back = read_volume(&path).unwrap();

        assert_eq!(back.shape(), &[3, 4, 2]);
        assert_eq!(back[[2, 3, 1]], 132.0);
        assert_eq!(back[[0, 1, 0]], 10.0);
    }

    #[test]
    fn test_read_series_promotes_3d() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vol.nii");
        let vol = Array3::<f64>::ones((2, 2, 2));
        write_volume(&path, &vol, None).unwrap();

        let series = read_series(&path).unwrap();
        assert_eq!(series.shape(), &[2, 2, 2, 1]);
    }

    #[test]
    fn test_read_missing_file_is_nifti_error() {
        let err = read_volume(Path::new("/nonexistent/vol.nii.gz")).unwrap_err();
        assert!(matches!(err, SefmError::Nifti { .. }));
    }
}
