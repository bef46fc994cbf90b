//! # Document Reader
//!
//! Splits a byte buffer into YAML documents and decodes each one with
//! strict key checking. The first document is the root DAG; every
//! following document becomes a local sub-DAG and must carry an explicit
//! `name`. Empty documents between `---` separators are skipped silently,
//! in root and sub-DAG positions alike.

use serde::Deserialize;
use serde_yaml::Value;

use crate::def::{ensure_known_keys, DagDef, DAG_KEYS};
use crate::errors::{BuildError, ErrorList};

/// Parsed documents of one YAML buffer: the root definition plus the
/// local sub-DAG definitions in their original order.
#[derive(Debug, Default)]
pub struct Documents {
    pub root: DagDef,
    pub locals: Vec<DagDef>,
}

/// Decode a (possibly multi-document) YAML buffer.
pub fn parse_documents(input: &[u8]) -> Result<Documents, ErrorList> {
    let mut errors = ErrorList::new();
    let mut defs: Vec<DagDef> = Vec::new();

    for (index, doc) in serde_yaml::Deserializer::from_slice(input).enumerate() {
        let value = match Value::deserialize(doc) {
            Ok(v) => v,
            Err(e) => {
                errors.push(document_field(index), BuildError::Yaml(e));
                continue;
            }
        };
        if value.is_null() {
            continue;
        }
        match decode_document(&value) {
            Ok(def) => defs.push(def),
            Err(e) => errors.push(document_field(defs.len()), e),
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    if defs.is_empty() {
        let mut errors = ErrorList::new();
        errors.push("", BuildError::InvalidValue("empty document".to_string()));
        return Err(errors);
    }

    let mut iter = defs.into_iter();
    let root = iter.next().unwrap_or_default();
    let locals: Vec<DagDef> = iter.collect();

    // Sub-DAG documents must be addressable by name; duplicates would
    // shadow each other in the LocalDAGs map.
    let mut seen: Vec<&str> = Vec::new();
    for (i, local) in locals.iter().enumerate() {
        match local.name.as_deref() {
            None | Some("") => errors.push(
                document_field(i + 1),
                BuildError::InvalidValue("sub-DAG document must have a name".to_string()),
            ),
            Some(name) if seen.contains(&name) => errors.push(
                document_field(i + 1),
                BuildError::InvalidValue(format!("duplicate sub-DAG name: {}", name)),
            ),
            Some(name) => seen.push(name),
        }
    }

    if errors.is_empty() {
        Ok(Documents { root, locals })
    } else {
        Err(errors)
    }
}

/// Decode a single document value into a raw definition, rejecting
/// unknown keys first so the error names the offending keys.
pub fn decode_document(value: &Value) -> Result<DagDef, BuildError> {
    let mapping = value.as_mapping().ok_or_else(|| {
        BuildError::InvalidValue("document root must be a mapping".to_string())
    })?;
    ensure_known_keys(mapping, DAG_KEYS)?;
    Ok(serde_yaml::from_value(value.clone())?)
}

fn document_field(index: usize) -> String {
    if index == 0 {
        String::new()
    } else {
        format!("document[{}]", index)
    }
}

// ============================================================================
// TESTS
// ============================================================================
