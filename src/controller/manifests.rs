//! Loading of the declarative object templates under the resources directory
//!
//! Every `.yaml`/`.yml` file may hold several `---` separated documents. A
//! document that fails to parse is reported without dropping its siblings.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use kube::api::DynamicObject;
use thiserror::Error;
use tracing::debug;

use crate::error::Result;

/// One document of a manifest file that could not be turned into an object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentParseError {
    /// Zero based position of the document in its file
    pub index: usize,
    pub cause: String,
}

impl fmt::Display for DocumentParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "document {}: {}", self.index, self.cause)
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("failed to parse {} document(s) in {file}: {}", .documents.len(), join(.documents))]
pub struct ManifestParseError {
    pub file: String,
    pub documents: Vec<DocumentParseError>,
}

fn join(documents: &[DocumentParseError]) -> String {
    documents
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Objects parsed from one file plus the documents that were rejected
#[derive(Debug, Default)]
pub struct ParsedManifest {
    pub objects: Vec<DynamicObject>,
    pub error: Option<ManifestParseError>,
}

/// Split a multi-document YAML string on `---` lines
fn split_documents(contents: &str) -> Vec<String> {
    let mut documents = vec![String::new()];
    for line in contents.lines() {
        if line.trim_end() == "---" {
            documents.push(String::new());
        } else if let Some(current) = documents.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }
    documents
}

fn is_blank(document: &str) -> bool {
    document
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#'))
}

fn parse_document(document: &str) -> std::result::Result<DynamicObject, String> {
    let value: serde_json::Value = serde_yaml::from_str(document).map_err(|e| e.to_string())?;

    for (pointer, field) in [
        ("/apiVersion", "apiVersion"),
        ("/kind", "kind"),
        ("/metadata/name", "metadata.name"),
    ] {
        let present = value
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !present {
            return Err(format!("missing {field}"));
        }
    }

    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Parse every document in `contents`, keeping the good ones
pub fn parse_documents(file: &str, contents: &str) -> ParsedManifest {
    let mut parsed = ParsedManifest::default();
    let mut failures = Vec::new();

    for (index, document) in split_documents(contents).iter().enumerate() {
        if is_blank(document) {
            continue;
        }
        match parse_document(document) {
            Ok(object) => parsed.objects.push(object),
            Err(cause) => failures.push(DocumentParseError { index, cause }),
        }
    }

    if !failures.is_empty() {
        parsed.error = Some(ManifestParseError {
            file: file.to_string(),
            documents: failures,
        });
    }
    parsed
}

pub fn load_file(path: &Path) -> Result<ParsedManifest> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_documents(&path.display().to_string(), &contents))
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Manifest files under `dir`, sorted so objects are applied in a stable order
pub fn list_manifest_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if is_manifest(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    debug!("Found {} manifest files under {}", files.len(), dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_DOCUMENTS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: first
data:
  key: value
---
apiVersion: v1
kind: ConfigMap
metadata: [this is: not, valid
---
# trailing comment
apiVersion: v1
kind: ServiceAccount
metadata:
  name: third
"#;

    #[test]
    fn test_partial_parse_keeps_valid_documents() {
        let parsed = parse_documents("three.yaml", THREE_DOCUMENTS);

        let names: Vec<_> = parsed
            .objects
            .iter()
            .map(|o| o.metadata.name.clone().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["first", "third"]);

        let error = parsed.error.expect("one document should fail");
        assert_eq!(error.file, "three.yaml");
        assert_eq!(error.documents.len(), 1);
        assert_eq!(error.documents[0].index, 1);
    }

    #[test]
    fn test_blank_documents_are_skipped() {
        let parsed = parse_documents("blank.yaml", "---\n# only a comment\n---\n\n");
        assert!(parsed.objects.is_empty());
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_document_without_name_is_rejected() {
        let parsed = parse_documents("noname.yaml", "apiVersion: v1\nkind: ConfigMap\n");
        let error = parsed.error.unwrap();
        assert_eq!(error.documents[0].cause, "missing metadata.name");
    }

    #[test]
    fn test_list_manifest_files_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("b.yaml"), "").unwrap();
        fs::write(dir.path().join("a.yml"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(nested.join("c.yaml"), "").unwrap();

        let flat = list_manifest_files(dir.path(), false).unwrap();
        assert_eq!(flat.len(), 2);
        assert!(flat[0].ends_with("a.yml"));

        let all = list_manifest_files(dir.path(), true).unwrap();
        assert_eq!(all.len(), 3);
    }
}
