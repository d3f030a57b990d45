//! Upload validation gate.
//!
//! Pure checks run before a file may enter the queue pipeline. Nothing in
//! here touches the network or the filesystem.

mod schema;

use serde_json::Value;
use thiserror::Error;

use crate::model::FileKind;

pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_DEPTH: usize = 10;
pub const EXPECTED_EXTENSION: &str = ".json";
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "text/json",
    "text/plain",
    "application/octet-stream",
];

const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const MAX_SANITIZED_STEM: usize = 100;

/// Reason a file was refused. The message is shown to the user verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Basic properties of an uploaded file.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content_type: Option<String>,
    pub size: u64,
}

/// Full validation: basic checks, depth check, then the kind schema.
///
/// `declared` selects the schema; without it the kind is classified from
/// the fields present in `body`.
pub fn validate(
    file: &UploadedFile,
    body: &Value,
    declared: Option<FileKind>,
) -> Result<FileKind, ValidationError> {
    check_basic(file)?;

    if nesting_depth(body, MAX_DEPTH) > MAX_DEPTH {
        return Err(ValidationError::new(format!(
            "File structure is nested too deeply (maximum depth is {MAX_DEPTH})"
        )));
    }

    let kind = match declared {
        Some(kind) => kind,
        None => classify(body)?,
    };

    match kind {
        FileKind::Pra => schema::check_pra(body)?,
        FileKind::Spawngear => schema::check_spawngear(body)?,
        FileKind::Spawner => schema::check_spawner(body)?,
    }

    Ok(kind)
}

/// Extension, content type, size and filename checks, in that order.
pub fn check_basic(file: &UploadedFile) -> Result<(), ValidationError> {
    if !file.name.to_ascii_lowercase().ends_with(EXPECTED_EXTENSION) {
        return Err(ValidationError::new(format!(
            "Only {EXPECTED_EXTENSION} files are accepted"
        )));
    }

    let content_type = file
        .content_type
        .as_deref()
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(ValidationError::new(format!(
            "Unsupported content type: {content_type}"
        )));
    }

    if file.size > MAX_FILE_SIZE {
        return Err(ValidationError::new(format!(
            "File is too large ({} bytes, maximum is {} bytes)",
            file.size, MAX_FILE_SIZE
        )));
    }

    check_filename(&file.name)
}

fn check_filename(name: &str) -> Result<(), ValidationError> {
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(ValidationError::new("Filename contains path traversal sequences"));
    }
    if name.chars().any(char::is_control) {
        return Err(ValidationError::new("Filename contains control characters"));
    }
    if name.contains(FORBIDDEN_CHARS) {
        return Err(ValidationError::new("Filename contains forbidden characters"));
    }
    if name.starts_with(['.', ' ']) || name.ends_with(['.', ' ']) {
        return Err(ValidationError::new(
            "Filename must not start or end with a dot or space",
        ));
    }
    Ok(())
}

/// Nesting depth of `value`; objects and arrays add one level each.
///
/// Stops descending once `limit` is exceeded, so the result is at most
/// `limit + 1` and the walk is bounded by the limit, not by the input.
pub fn nesting_depth(value: &Value, limit: usize) -> usize {
    fn walk(value: &Value, level: usize, limit: usize) -> usize {
        let children: Box<dyn Iterator<Item = &Value>> = match value {
            Value::Array(items) => Box::new(items.iter()),
            Value::Object(map) => Box::new(map.values()),
            _ => return level,
        };
        let here = level + 1;
        if here > limit {
            return here;
        }
        let mut deepest = here;
        for child in children {
            deepest = deepest.max(walk(child, here, limit));
            if deepest > limit {
                break;
            }
        }
        deepest
    }
    walk(value, 0, limit)
}

/// Infer the file kind from field presence.
///
/// Precedence: restricted-area fields, then loot-preset fields, then the
/// generic spawner shape. Anything else is refused rather than guessed.
pub fn classify(body: &Value) -> Result<FileKind, ValidationError> {
    if let Some(obj) = body.as_object() {
        if schema::PRA_MARKERS.iter().any(|k| obj.contains_key(*k)) {
            return Ok(FileKind::Pra);
        }
        if schema::SPAWNGEAR_MARKERS.iter().any(|k| obj.contains_key(*k)) {
            return Ok(FileKind::Spawngear);
        }
    }
    if schema::is_spawner_shape(body) {
        return Ok(FileKind::Spawner);
    }
    Err(ValidationError::new(
        "Unrecognised file shape: expected a restricted area, spawn gear or spawner file",
    ))
}

/// Display/storage name: `[A-Za-z0-9_-]` only, stem capped at 100 chars.
pub fn sanitize_filename(name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SANITIZED_STEM)
        .collect();
    format!("{cleaned}{ext}")
}
