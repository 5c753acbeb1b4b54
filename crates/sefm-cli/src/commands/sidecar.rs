//! `sefm sidecar get|set|remove`: single-field sidecar edits.

use std::path::Path;

use sefm_core::sidecar;

use super::{fail, parse_value};

pub fn get(json: &Path, field: &str) {
    match sidecar::get_field(json, field) {
        Ok(Some(value)) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{text}"),
            Err(e) => fail("cannot format value", e),
        },
        Ok(None) => {
            eprintln!("{field} is not set in {}", json.display());
            std::process::exit(1);
        }
        Err(e) => fail(&json.display().to_string(), e),
    }
}

pub fn set(json: &Path, field: &str, raw: &str) {
    match sidecar::set_field(json, field, parse_value(raw)) {
        Ok(outcome) => println!("{field}: {outcome}"),
        Err(e) => fail(&json.display().to_string(), e),
    }
}

pub fn remove(json: &Path, field: &str) {
    match sidecar::remove_field(json, field) {
        Ok(true) => println!("{field}: removed"),
        Ok(false) => println!("{field}: not present"),
        Err(e) => fail(&json.display().to_string(), e),
    }
}
