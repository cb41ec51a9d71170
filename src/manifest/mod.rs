//! Build manifest scanning
//!
//! The build manifest is a YAML document. Before submission, every local
//! file it references must be uploaded into the build context. References
//! live under the top-level `content.add_files` list and, for manifests
//! with a quality-managed partition, under `qm.content.add_files`.
//!
//! Each candidate entry must carry both a destination `path` and a
//! `source_path`; entries missing either field are skipped. Every accepted
//! source path is validated immediately: a traversal segment, the root
//! path, or an absolute path outside the allow-list fails the whole scan
//! before any upload is attempted.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde_yaml::Value;

/// A `(path, source_path)` pair: upload the local `source_path` into the
/// build context at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    /// Destination path inside the build context.
    pub path: String,
    /// Local file to upload.
    pub source_path: PathBuf,
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.path, self.source_path.display())
    }
}

/// Errors from manifest scanning and source validation.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsafe source path {path:?}: {reason}")]
    UnsafePath { path: String, reason: String },

    #[error("local file {0} referenced by the manifest does not exist")]
    MissingSource(PathBuf),
}

/// Extract all local file references from raw manifest text.
///
/// Returns the union of valid entries from `content.add_files` and
/// `qm.content.add_files`, in document order (`content` first), duplicates
/// preserved. Fails on the first unsafe source path.
///
/// `allowed_roots` is the allow-list for absolute source paths; when it is
/// empty, every absolute path is rejected.
pub fn scan_file_references(
    manifest: &str,
    allowed_roots: &[PathBuf],
) -> Result<Vec<FileReference>, ManifestError> {
    let doc: Value = serde_yaml::from_str(manifest)?;

    let mut references = Vec::new();
    collect_add_files(doc.get("content"), allowed_roots, &mut references)?;
    let qm_content = doc.get("qm").and_then(|qm| qm.get("content"));
    collect_add_files(qm_content, allowed_roots, &mut references)?;

    Ok(references)
}

/// Verify that every referenced source file exists locally.
///
/// Runs before any network call so a bad reference never produces a
/// half-submitted build.
pub fn verify_sources(references: &[FileReference]) -> Result<(), ManifestError> {
    for reference in references {
        if !reference.source_path.exists() {
            return Err(ManifestError::MissingSource(reference.source_path.clone()));
        }
    }
    Ok(())
}

fn collect_add_files(
    content: Option<&Value>,
    allowed_roots: &[PathBuf],
    out: &mut Vec<FileReference>,
) -> Result<(), ManifestError> {
    let Some(entries) = content
        .and_then(|c| c.get("add_files"))
        .and_then(Value::as_sequence)
    else {
        return Ok(());
    };

    for entry in entries {
        let path = entry.get("path").and_then(Value::as_str);
        let source_path = entry.get("source_path").and_then(Value::as_str);
        let (Some(path), Some(source_path)) = (path, source_path) else {
            continue;
        };
        validate_source_path(source_path, allowed_roots)?;
        out.push(FileReference {
            path: path.to_string(),
            source_path: PathBuf::from(source_path),
        });
    }

    Ok(())
}

/// Check one source path against the safety rules.
pub fn validate_source_path(path: &str, allowed_roots: &[PathBuf]) -> Result<(), ManifestError> {
    let unsafe_path = |reason: &str| ManifestError::UnsafePath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(unsafe_path("path is empty"));
    }

    let source = Path::new(path);
    if source.parent().is_none() {
        return Err(unsafe_path("path is a filesystem root"));
    }

    if source
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(unsafe_path("path contains a parent-directory segment"));
    }

    if source.is_absolute() && !allowed_roots.iter().any(|root| source.starts_with(root)) {
        return Err(unsafe_path(
            "absolute path is outside the allowed source roots",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: demo
content:
  add_files:
    - path: /etc/motd
      source_path: ./files/motd
    - path: /usr/share/app/init.bin
      source_path: ./assets/init.bin
qm:
  content:
    add_files:
      - path: /etc/qm.conf
        source_path: ./files/qm.conf
"#;

    #[test]
    fn test_scan_unions_content_and_qm_in_document_order() {
        let refs = scan_file_references(MANIFEST, &[]).unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].path, "/etc/motd");
        assert_eq!(refs[1].source_path, PathBuf::from("./assets/init.bin"));
        assert_eq!(refs[2].path, "/etc/qm.conf");
    }

    #[test]
    fn test_scan_skips_entries_missing_a_field() {
        let manifest = r#"
content:
  add_files:
    - path: /etc/a
    - source_path: ./b
    - path: /etc/c
      source_path: ./c
"#;
        let refs = scan_file_references(manifest, &[]).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].path, "/etc/c");
    }

    #[test]
    fn test_scan_keeps_duplicate_entries() {
        let manifest = r#"
content:
  add_files:
    - path: /etc/a
      source_path: ./a
    - path: /etc/a
      source_path: ./a
"#;
        let refs = scan_file_references(manifest, &[]).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0], refs[1]);
    }

    #[test]
    fn test_scan_without_add_files_is_empty() {
        let refs = scan_file_references("name: demo\ncontent: {}\n", &[]).unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn test_traversal_segment_fails_the_scan() {
        let manifest = r#"
content:
  add_files:
    - path: /etc/ok
      source_path: ./files/ok
    - path: /etc/evil
      source_path: ../../etc/shadow
"#;
        let err = scan_file_references(manifest, &[]).unwrap_err();
        assert!(matches!(err, ManifestError::UnsafePath { .. }));
        assert!(err.to_string().contains("../../etc/shadow"));
    }

    #[test]
    fn test_absolute_path_rejected_with_empty_allowlist() {
        let err = validate_source_path("/srv/data/blob.img", &[]).unwrap_err();
        assert!(err.to_string().contains("allowed source roots"));
    }

    #[test]
    fn test_absolute_path_accepted_under_allowed_root() {
        let roots = vec![PathBuf::from("/srv/data")];
        validate_source_path("/srv/data/blob.img", &roots).unwrap();
    }

    #[test]
    fn test_root_and_empty_paths_rejected() {
        assert!(validate_source_path("", &[]).is_err());
        assert!(validate_source_path("/", &[PathBuf::from("/")]).is_err());
    }

    #[test]
    fn test_verify_sources_names_the_missing_file() {
        let refs = vec![FileReference {
            path: "/usr/share/app/init.bin".to_string(),
            source_path: PathBuf::from("./assets/init.bin"),
        }];
        let err = verify_sources(&refs).unwrap_err();
        assert!(err.to_string().contains("./assets/init.bin"));
    }
}
