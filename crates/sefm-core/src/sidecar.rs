//! JSON sidecar editing.
//!
//! Every change to a sidecar goes through [`Sidecar`]: open the file, mutate
//! the in-memory object, flush. Flushing writes a temporary file next to the
//! target and renames it over the original, so a failed edit never leaves a
//! half-written sidecar behind. Field order is preserved and output uses the
//! 4-space indentation the rest of the dataset tooling writes.
//!
//! Field writes are logged: `info` for a new field, `warn` when an existing
//! value is replaced with a different one, `debug` when nothing changed.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, SefmError};

/// What [`Sidecar::set`] did to the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

impl fmt::Display for SetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inserted => write!(f, "inserted"),
            Self::Replaced => write!(f, "replaced"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// An open sidecar: the JSON object of one file plus a dirty flag.
#[derive(Debug)]
pub struct Sidecar {
    path: PathBuf,
    fields: Map<String, Value>,
    dirty: bool,
}

impl Sidecar {
    /// Read and parse a sidecar. The top level must be a JSON object.
    pub fn open(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text).map_err(|e| SefmError::MalformedSidecar {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let Value::Object(fields) = value else {
            return Err(SefmError::MalformedSidecar {
                path: path.to_path_buf(),
                reason: "top-level value is not an object".to_string(),
            });
        };
        Ok(Self {
            path: path.to_path_buf(),
            fields,
            dirty: false,
        })
    }

    /// Open `path`, run `f` on it, and flush if anything changed.
    ///
    /// If `f` returns an error the file on disk is left untouched.
    pub fn edit<T>(path: &Path, f: impl FnOnce(&mut Sidecar) -> Result<T>) -> Result<T> {
        let mut sidecar = Self::open(path)?;
        let out = f(&mut sidecar)?;
        sidecar.flush()?;
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Set a field, logging whether it was new or replaced a different value.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> SetOutcome {
        let value = value.into();
        let outcome = match self.fields.get(name) {
            Some(old) if *old == value => {
                log::debug!("{name} already {value} in {}", self.path.display());
                return SetOutcome::Unchanged;
            }
            Some(old) => {
                log::warn!(
                    "Replacing {name}: {old} with {value} in {}",
                    self.path.display()
                );
                SetOutcome::Replaced
            }
            None => {
                log::info!("Inserting {name}: {value} in {}", self.path.display());
                SetOutcome::Inserted
            }
        };
        self.fields.insert(name.to_string(), value);
        self.dirty = true;
        outcome
    }

    /// Remove a field. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        if self.fields.shift_remove(name).is_some() {
            log::info!("Removed {name} from {}", self.path.display());
            self.dirty = true;
            true
        } else {
            false
        }
    }

    /// Write pending changes atomically. No-op when nothing changed.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(to_pretty_json(&self.fields)?.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| SefmError::Io(e.error))?;
        self.dirty = false;
        Ok(())
    }
}

/// Serialize with 4-space indentation.
pub fn to_pretty_json(fields: &Map<String, Value>) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    fields.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ---------------------------------------------------------------------------
// One-shot primitives
// ---------------------------------------------------------------------------

/// Read one field. `Ok(None)` when the field is absent.
pub fn get_field(path: &Path, name: &str) -> Result<Option<Value>> {
    let sidecar = Sidecar::open(path)?;
    Ok(sidecar.get(name).cloned())
}

/// Set one field and flush.
pub fn set_field(path: &Path, name: &str, value: impl Into<Value>) -> Result<SetOutcome> {
    Sidecar::edit(path, |s| Ok(s.set(name, value)))
}

/// Remove one field and flush. Returns whether it was present.
pub fn remove_field(path: &Path, name: &str) -> Result<bool> {
    Sidecar::edit(path, |s| Ok(s.remove(name)))
}
