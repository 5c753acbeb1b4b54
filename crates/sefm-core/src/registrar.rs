//! Boundary to the external imaging tools.
//!
//! Two traits describe what the pipeline needs from a registration package:
//! [`Registrar`] (rigid alignment and averaging, used by pair selection) and
//! [`FieldmapTools`] (split/flip/resample, used when a concatenated fieldmap
//! has to be broken apart). [`FslTools`] implements both by shelling out to
//! FSL. Tests substitute an in-process implementation.
//!
//! Tool locations come from [`ToolPaths`]; nothing is read from the ambient
//! process environment. Each child process gets `FSLDIR` and
//! `FSLOUTPUTTYPE=NIFTI_GZ` set explicitly.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::ToolPaths;
use crate::error::{Result, SefmError};
use crate::nifti_io;
use crate::volume;

/// Rigid registration and averaging of fieldmap volumes.
pub trait Registrar {
    /// Short name for log messages.
    fn name(&self) -> &str {
        "registrar"
    }

    /// Align `moving` onto `fixed` with a 6-DOF rigid transform and write the
    /// result to `out` on `fixed`'s grid. Inputs are never modified.
    fn rigid_register(&self, moving: &Path, fixed: &Path, out: &Path) -> Result<()>;

    /// Voxelwise mean of `inputs`, written to `out` with the geometry of the
    /// first input.
    fn voxelwise_mean(&self, inputs: &[PathBuf], out: &Path) -> Result<()> {
        let first = inputs.first().ok_or(SefmError::EmptyInput)?;
        let header = nifti_io::read_header(first)?;
        let volumes = inputs
            .iter()
            .map(|p| nifti_io::read_volume(p))
            .collect::<Result<Vec<_>>>()?;
        let mean = volume::voxelwise_mean(&volumes)?;
        nifti_io::write_volume(out, &mean, Some(&header))
    }
}

/// Operations for splitting a two-volume concatenated fieldmap.
pub trait FieldmapTools {
    /// Split a 4-D series along time. Outputs are named `<out_prefix>NNNN`
    /// plus the image extension, returned in volume order.
    fn split_volumes(&self, input: &Path, out_prefix: &Path) -> Result<Vec<PathBuf>>;

    /// Flip the second voxel axis in place (`x -y z`).
    fn reorient_flip_y(&self, path: &Path) -> Result<()>;

    /// Resample `input` onto `reference`'s grid with an identity transform.
    fn resample_to_grid(&self, input: &Path, reference: &Path, out: &Path) -> Result<()>;
}

// ---------------------------------------------------------------------------
// FSL implementation
// ---------------------------------------------------------------------------

const IDENTITY_MATRIX: &str = "1 0 0 0\n0 1 0 0\n0 0 1 0\n0 0 0 1\n";

/// FSL-backed [`Registrar`] and [`FieldmapTools`].
#[derive(Debug, Clone)]
pub struct FslTools {
    paths: ToolPaths,
}

impl FslTools {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    /// Whether `flirt` is present where the configuration says FSL lives.
    pub fn is_available(&self) -> bool {
        self.paths.tool("flirt").is_file()
    }

    /// Run one FSL tool to completion. A non-zero exit, or a failure to start
    /// the process at all, becomes [`SefmError::ToolFailed`].
    fn run(&self, tool: &str, args: &[&OsStr]) -> Result<()> {
        let program = self.paths.tool(tool);
        log::debug!("{} {:?}", program.display(), args);
        let output = Command::new(&program)
            .args(args)
            .env("FSLDIR", &self.paths.fsl_dir)
            .env("FSLOUTPUTTYPE", "NIFTI_GZ")
            .output()
            .map_err(|e| SefmError::ToolFailed {
                tool: tool.to_string(),
                status: "not started".to_string(),
                stderr: format!("{}: {e}", program.display()),
            })?;
        if !output.status.success() {
            return Err(SefmError::ToolFailed {
                tool: tool.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Configured identity matrix, or one written next to `input` (the
    /// split volumes live in the session work dir).
    fn identity_matrix_for(&self, input: &Path) -> Result<PathBuf> {
        if let Some(path) = self.paths.identity_matrix() {
            return Ok(path);
        }
        let dir = input.parent().unwrap_or_else(|| Path::new("."));
        let path = dir.join("identity.mat");
        if !path.is_file() {
            std::fs::write(&path, IDENTITY_MATRIX)?;
        }
        Ok(path)
    }
}

impl Registrar for FslTools {
    fn name(&self) -> &str {
        "fsl"
    }

    fn rigid_register(&self, moving: &Path, fixed: &Path, out: &Path) -> Result<()> {
        self.run(
            "flirt",
            &[
                OsStr::new("-in"),
                moving.as_os_str(),
                OsStr::new("-ref"),
                fixed.as_os_str(),
                OsStr::new("-dof"),
                OsStr::new("6"),
                OsStr::new("-out"),
                out.as_os_str(),
            ],
        )
    }

    fn voxelwise_mean(&self, inputs: &[PathBuf], out: &Path) -> Result<()> {
        let (first, rest) = inputs.split_first().ok_or(SefmError::EmptyInput)?;
        let mut args: Vec<&OsStr> = vec![first.as_os_str()];
        for input in rest {
            args.push(OsStr::new("-add"));
            args.push(input.as_os_str());
        }
        args.push(out.as_os_str());
        self.run("fslmaths", &args)?;

        let count = inputs.len().to_string();
        self.run(
            "fslmaths",
            &[
                out.as_os_str(),
                OsStr::new("-div"),
                OsStr::new(&count),
                out.as_os_str(),
            ],
        )
    }
}

impl FieldmapTools for FslTools {
    fn split_volumes(&self, input: &Path, out_prefix: &Path) -> Result<Vec<PathBuf>> {
        self.run(
            "fslsplit",
            &[input.as_os_str(), out_prefix.as_os_str(), OsStr::new("-t")],
        )?;
        split_outputs(out_prefix)
    }

    fn reorient_flip_y(&self, path: &Path) -> Result<()> {
        self.run(
            "fslswapdim",
            &[
                path.as_os_str(),
                OsStr::new("x"),
                OsStr::new("-y"),
                OsStr::new("z"),
                path.as_os_str(),
            ],
        )
    }

    fn resample_to_grid(&self, input: &Path, reference: &Path, out: &Path) -> Result<()> {
        let identity = self.identity_matrix_for(input)?;
        self.run(
            "flirt",
            &[
                OsStr::new("-in"),
                input.as_os_str(),
                OsStr::new("-ref"),
                reference.as_os_str(),
                OsStr::new("-applyxfm"),
                OsStr::new("-init"),
                identity.as_os_str(),
                OsStr::new("-interp"),
                OsStr::new("spline"),
                OsStr::new("-out"),
                out.as_os_str(),
            ],
        )
    }
}

/// Files produced by a split: `<prefix>0000.nii.gz`, `<prefix>0001.nii.gz`, ...
/// in volume order.
pub fn split_outputs(out_prefix: &Path) -> Result<Vec<PathBuf>> {
    let dir = out_prefix.parent().unwrap_or_else(|| Path::new("."));
    let stem = out_prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(rest) = name.strip_prefix(&stem) else {
            continue;
        };
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let ext = &rest[digits.len()..];
        if !digits.is_empty() && (ext == ".nii.gz" || ext == ".nii") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}
