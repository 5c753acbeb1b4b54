//! `sefm correct`: apply the derived sidecar rules across a whole dataset.

use std::path::Path;

use super::fail;

pub fn run(bids_dir: &Path) {
    let report = sefm_core::correct_dataset(bids_dir)
        .unwrap_or_else(|e| fail("correction failed", e));

    println!("Sidecars examined: {}", report.examined);
    println!("Sidecars changed:  {}", report.changed);
    if !report.skipped.is_empty() {
        println!("Skipped (malformed JSON):");
        for path in &report.skipped {
            println!("  {}", path.display());
        }
    }
}
