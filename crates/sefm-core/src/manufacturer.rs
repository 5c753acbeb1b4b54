//! Scanner-vendor timing constants.
//!
//! Some vendors do not export `EffectiveEchoSpacing`, `TotalReadoutTime` or
//! `DwellTime` in a usable form. When a sidecar lacks them and they cannot be
//! derived, fixed per-vendor values are filled in from this table. The
//! built-in defaults are site calibration values; deployments can replace the
//! whole table from the `[[manufacturer]]` section of the TOML config.

use serde::{Deserialize, Serialize};

use crate::bids::Category;

/// Timing values for one (vendor, software, category) combination.
/// Unset fields are left alone on the sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingConstants {
    #[serde(default)]
    pub effective_echo_spacing: Option<f64>,
    #[serde(default)]
    pub total_readout_time: Option<f64>,
    #[serde(default)]
    pub dwell_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManufacturerEntry {
    /// Matched as a substring of the sidecar's `Manufacturer`.
    pub manufacturer: String,
    /// Matched as a substring of `SoftwareVersions`; `None` matches any.
    #[serde(default)]
    pub software_versions: Option<String>,
    pub categories: Vec<Category>,
    #[serde(flatten)]
    pub constants: TimingConstants,
}

/// Result of a table lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a TimingConstants),
    /// Vendor known, but nothing applies to this category/software version.
    NotApplicable,
    UnknownManufacturer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManufacturerTable {
    entries: Vec<ManufacturerEntry>,
}

fn entry(
    manufacturer: &str,
    software_versions: Option<&str>,
    categories: &[Category],
    effective_echo_spacing: Option<f64>,
    total_readout_time: Option<f64>,
    dwell_time: Option<f64>,
) -> ManufacturerEntry {
    ManufacturerEntry {
        manufacturer: manufacturer.to_string(),
        software_versions: software_versions.map(str::to_string),
        categories: categories.to_vec(),
        constants: TimingConstants {
            effective_echo_spacing,
            total_readout_time,
            dwell_time,
        },
    }
}

impl Default for ManufacturerTable {
    fn default() -> Self {
        use Category::*;
        Self::new(vec![
            entry("Philips", None, &[Anat], None, None, Some(0.00062771)),
            entry("Philips", None, &[Func, Fmap], Some(0.00062771), None, None),
            entry("Philips", None, &[Dwi], Some(0.00062771), Some(0.08976), None),
            entry("GE", None, &[Anat], None, None, Some(0.000536)),
            entry("GE", None, &[Fmap], Some(0.000536), None, None),
            entry("GE", Some("DV26"), &[Func], Some(0.000556), None, None),
            entry("GE", Some("DV26"), &[Dwi], Some(0.000768), Some(0.106752), None),
            entry("GE", Some("DV25"), &[Dwi], Some(0.000752), Some(0.104528), None),
            entry("Siemens", None, &[Anat], None, None, Some(0.00051001152626)),
            entry("Siemens", None, &[Func, Fmap], Some(0.000510012), None, None),
            entry("Siemens", None, &[Dwi], Some(0.000689998), Some(0.0959097), None),
        ])
    }
}

impl ManufacturerTable {
    pub fn new(entries: Vec<ManufacturerEntry>) -> Self {
        Self { entries }
    }

    /// Find the constants for a file.
    ///
    /// An entry with a matching `software_versions` wins over a generic entry
    /// for the same vendor and category.
    pub fn lookup(
        &self,
        manufacturer: &str,
        software_versions: Option<&str>,
        category: Category,
    ) -> Lookup<'_> {
        let vendor: Vec<&ManufacturerEntry> = self
            .entries
            .iter()
            .filter(|e| manufacturer.contains(e.manufacturer.as_str()))
            .collect();
        if vendor.is_empty() {
            return Lookup::UnknownManufacturer;
        }

        let applicable = vendor.into_iter().filter(|e| e.categories.contains(&category));
        let mut generic = None;
        for e in applicable {
            match (&e.software_versions, software_versions) {
                (Some(want), Some(have)) if have.contains(want.as_str()) => {
                    return Lookup::Found(&e.constants);
                }
                (None, _) if generic.is_none() => generic = Some(&e.constants),
                _ => {}
            }
        }
        generic.map_or(Lookup::NotApplicable, Lookup::Found)
    }
}
