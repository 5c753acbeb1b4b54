//! Score a candidate fieldmap against a reference with eta-squared.
//!
//! Run: cargo run --example score_pair -- <reference.nii.gz> <candidate.nii.gz>

use std::path::PathBuf;

use sefm_core::eta_squared_files;

fn main() {
    let args: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    let [reference, candidate] = args.as_slice() else {
        eprintln!("usage: score_pair <reference> <candidate>");
        std::process::exit(2);
    };

    match eta_squared_files(reference, candidate) {
        Ok(eta) => {
            println!("reference: {}", reference.display());
            println!("candidate: {}", candidate.display());
            println!("eta^2:     {eta:.6}");
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
