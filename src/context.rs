//! Loading context sources into a [`ContextSet`].
//!
//! Two source shapes are understood:
//!
//! * structured JSON: `{"contexts": ["...", ...]}`, or the older
//!   `{"documents": [{"content": "..."}, ...]}` layout;
//! * tabular CSV/TSV, where the first column of every data row is a context.
//!
//! Every context must be non-empty. Errors name the 0-based position of the
//! offending record within its collection (header row excluded).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::ContextSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextFormat {
    StructuredArray,
    Tabular {
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_has_header")]
        has_header: bool,
    },
}

/// Where the contexts of a run were read from, kept in the run header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextSource {
    /// Listed directly by the caller.
    Inline,
    /// A document passed in the request body.
    Document { format: ContextFormat },
    /// A file read from the server's filesystem.
    File { path: PathBuf, format: ContextFormat },
}

fn default_delimiter() -> char {
    ','
}

fn default_has_header() -> bool {
    true
}

impl ContextFormat {
    pub fn csv() -> Self {
        Self::Tabular {
            delimiter: ',',
            has_header: true,
        }
    }

    pub fn tsv() -> Self {
        Self::Tabular {
            delimiter: '\t',
            has_header: true,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Self::StructuredArray),
            "csv" => Ok(Self::csv()),
            "tsv" => Ok(Self::tsv()),
            "" => Err(EngineError::UnsupportedFormat(format!(
                "{} has no file extension",
                path.display()
            ))),
            other => Err(EngineError::UnsupportedFormat(format!(".{}", other))),
        }
    }
}

pub fn load_contexts<R: Read>(reader: R, format: ContextFormat) -> Result<ContextSet> {
    let contexts = match format {
        ContextFormat::StructuredArray => parse_structured(reader)?,
        ContextFormat::Tabular {
            delimiter,
            has_header,
        } => parse_tabular(reader, delimiter, has_header)?,
    };
    debug!(count = contexts.len(), ?format, "Parsed context source");
    Ok(ContextSet::new(contexts))
}

pub fn load_str(input: &str, format: ContextFormat) -> Result<ContextSet> {
    load_contexts(input.as_bytes(), format)
}

/// Build a set from contexts supplied directly, e.g. inline in a request.
pub fn from_strings(contexts: Vec<String>) -> Result<ContextSet> {
    for (index, ctx) in contexts.iter().enumerate() {
        non_empty(index, ctx)?;
    }
    Ok(ContextSet::new(contexts))
}

/// Load a context file, detecting the format from its extension unless one
/// is given.
pub async fn load_path(path: &Path, format: Option<ContextFormat>) -> Result<ContextSet> {
    let format = match format {
        Some(f) => f,
        None => ContextFormat::from_path(path)?,
    };
    let data = tokio::fs::read(path).await?;
    let set = tokio::task::spawn_blocking(move || load_contexts(data.as_slice(), format))
        .await
        .map_err(|e| EngineError::InvalidDocument(format!("context parser panicked: {}", e)))??;
    info!(
        "Loaded {} contexts from {} (digest {})",
        set.len(),
        path.display(),
        &set.digest()[..12]
    );
    Ok(set)
}

fn parse_structured<R: Read>(reader: R) -> Result<Vec<String>> {
    let root: Value = serde_json::from_reader(reader)
        .map_err(|e| EngineError::InvalidDocument(format!("invalid JSON: {}", e)))?;
    let obj = root
        .as_object()
        .ok_or_else(|| EngineError::InvalidDocument("JSON root must be an object".into()))?;

    if let Some(contexts) = obj.get("contexts") {
        let arr = contexts
            .as_array()
            .ok_or_else(|| EngineError::InvalidDocument("'contexts' must be an array".into()))?;
        return arr
            .iter()
            .enumerate()
            .map(|(index, v)| match v.as_str() {
                Some(s) => non_empty(index, s),
                None => Err(EngineError::MalformedInput {
                    index,
                    message: format!("expected a string, found {}", json_kind(v)),
                }),
            })
            .collect();
    }

    if let Some(documents) = obj.get("documents") {
        let arr = documents
            .as_array()
            .ok_or_else(|| EngineError::InvalidDocument("'documents' must be an array".into()))?;
        return arr
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let content = doc
                    .as_object()
                    .ok_or_else(|| EngineError::MalformedInput {
                        index,
                        message: "document must be an object".into(),
                    })?
                    .get("content")
                    .ok_or_else(|| EngineError::MalformedInput {
                        index,
                        message: "document missing 'content' field".into(),
                    })?;
                match content.as_str() {
                    Some(s) => non_empty(index, s),
                    None => Err(EngineError::MalformedInput {
                        index,
                        message: "'content' must be a string".into(),
                    }),
                }
            })
            .collect();
    }

    Err(EngineError::InvalidDocument(
        "expected {\"contexts\": [...]} or {\"documents\": [{\"content\": ...}]}".into(),
    ))
}

fn parse_tabular<R: Read>(reader: R, delimiter: char, has_header: bool) -> Result<Vec<String>> {
    if !delimiter.is_ascii() {
        return Err(EngineError::UnsupportedFormat(format!(
            "delimiter {:?} is not ASCII",
            delimiter
        )));
    }
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(has_header)
        .flexible(true)
        .from_reader(reader);

    let mut contexts = Vec::new();
    for (index, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| EngineError::MalformedInput {
            index,
            message: e.to_string(),
        })?;
        let first = record.get(0).unwrap_or("");
        contexts.push(non_empty(index, first)?);
    }
    Ok(contexts)
}

fn non_empty(index: usize, s: &str) -> Result<String> {
    if s.trim().is_empty() {
        return Err(EngineError::MalformedInput {
            index,
            message: "context is empty".into(),
        });
    }
    Ok(s.to_string())
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
