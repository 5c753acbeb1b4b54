//! `sefm eta`: similarity of two volumes.

use std::path::Path;

use super::fail;

pub fn run(reference: &Path, candidate: &Path) {
    match sefm_core::eta_squared_files(reference, candidate) {
        Ok(eta) => println!("{eta}"),
        Err(e) => fail("cannot compute eta-squared", e),
    }
}
