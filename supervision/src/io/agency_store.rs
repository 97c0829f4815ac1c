//! Agency tree load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::core::invariants::validate_invariants;
use crate::core::snapshot::Snapshot;
use crate::io::config::write_atomic;

const AGENCY_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/agency.schema.json"
));

/// Load and validate an agency tree from disk (schema + invariants).
pub fn load_agency(path: &Path) -> Result<Value> {
    let root = read_agency(path)?;
    validate_invariants_of(&root)?;
    Ok(root)
}

/// Load an agency tree checking only its schema.
///
/// Used by `check`, which reports invariant violations itself.
pub fn read_agency(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read agency {}", path.display()))?;
    let root: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse agency {}", path.display()))?;
    validate_schema(&root)?;
    Ok(root)
}

/// Write the tree with stable pretty formatting.
pub fn write_agency(path: &Path, root: &Value) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(root).context("serialize agency")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn validate_schema(root: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(AGENCY_SCHEMA).context("parse agency schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(root) {
        let messages = compiled
            .iter_errors(root)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "agency schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_invariants_of(root: &Value) -> Result<()> {
    let errors = validate_invariants(&Snapshot::new(root.clone()));
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("agency invariants failed: {}", errors.join("; ")))
}
