//! Attachment files: MIME → extension table and the writer that places
//! `<uuid>-attachment.<ext>` files into the results directory.

use crate::error::{Result, TraceError};
use crate::model::Attachment;
use std::fs;
use std::path::{Path, PathBuf};

/// MIME type of a browser trace archive
pub const TRACE_MIME: &str = "application/vnd.tach.trace+zip";
/// Network captures are HAR documents
pub const NETWORK_MIME: &str = "application/json";

/// File extension for an attachment MIME type
pub fn extension_for(mime: &str) -> &'static str {
    match mime {
        "text/plain" => "txt",
        "application/json" => "json",
        "text/html" => "html",
        "text/csv" => "csv",
        "text/xml" | "application/xml" => "xml",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        TRACE_MIME => "zip",
        m if m.starts_with("text/") => "txt",
        _ => "bin",
    }
}

/// Writes attachment payloads into the results directory
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_source(mime: &str) -> String {
        format!("{}-attachment.{}", uuid::Uuid::new_v4(), extension_for(mime))
    }

    /// Write `bytes` as a new attachment file
    pub fn write_bytes(&self, name: &str, mime: &str, bytes: &[u8]) -> Result<Attachment> {
        let source = Self::next_source(mime);
        fs::write(self.dir.join(&source), bytes)?;
        Ok(Attachment {
            name: name.to_string(),
            source,
            mime: mime.to_string(),
        })
    }

    /// Copy a collaborator-produced file into the results directory.
    ///
    /// Missing or empty files are rejected: a result must never reference
    /// an artifact that was not fully written.
    pub fn copy_file(&self, name: &str, mime: &str, path: &Path) -> Result<Attachment> {
        let meta = fs::metadata(path).map_err(|_| TraceError::artifact(path, "file not found"))?;
        if meta.len() == 0 {
            return Err(TraceError::artifact(path, "file is empty"));
        }
        let source = Self::next_source(mime);
        fs::copy(path, self.dir.join(&source))?;
        Ok(Attachment {
            name: name.to_string(),
            source,
            mime: mime.to_string(),
        })
    }
}

/// Re-indent a JSON body for display. Bodies that do not parse are
/// returned unchanged.
pub fn pretty_json(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_string()),
        Err(_) => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extension_table() {
        assert_eq!(extension_for("text/plain"), "txt");
        assert_eq!(extension_for("application/json"), "json");
        assert_eq!(extension_for("text/html"), "html");
        assert_eq!(extension_for("text/csv"), "csv");
        assert_eq!(extension_for("text/xml"), "xml");
        assert_eq!(extension_for("text/markdown"), "txt");
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/gif"), "gif");
        assert_eq!(extension_for("image/svg+xml"), "svg");
        assert_eq!(extension_for("application/pdf"), "pdf");
        assert_eq!(extension_for("video/webm"), "webm");
        assert_eq!(extension_for("video/mp4"), "mp4");
        assert_eq!(extension_for(TRACE_MIME), "zip");
        assert_eq!(extension_for("application/octet-stream"), "bin");
    }

    #[test]
    fn test_write_bytes_names_file_by_extension() {
        let temp = TempDir::new().unwrap();
        let store = AttachmentStore::new(temp.path());

        let att = store.write_bytes("page", "image/png", b"\x89PNG").unwrap();
        assert_eq!(att.name, "page");
        assert_eq!(att.mime, "image/png");
        assert!(att.source.ends_with("-attachment.png"));
        assert_eq!(fs::read(temp.path().join(&att.source)).unwrap(), b"\x89PNG");
    }

    #[test]
    fn test_copy_file_rejects_empty_artifact() {
        let temp = TempDir::new().unwrap();
        let store = AttachmentStore::new(temp.path());
        let empty = temp.path().join("trace.zip");
        fs::write(&empty, b"").unwrap();

        let err = store.copy_file("trace", TRACE_MIME, &empty).unwrap_err();
        assert!(matches!(err, TraceError::Artifact { .. }));

        let missing = temp.path().join("missing.har");
        assert!(store.copy_file("network", NETWORK_MIME, &missing).is_err());
    }

    #[test]
    fn test_copy_file_copies_content() {
        let temp = TempDir::new().unwrap();
        let store = AttachmentStore::new(temp.path());
        let trace = temp.path().join("trace.zip");
        fs::write(&trace, b"PK\x03\x04").unwrap();

        let att = store.copy_file("trace", TRACE_MIME, &trace).unwrap();
        assert!(att.source.ends_with(".zip"));
        assert_eq!(fs::read(temp.path().join(att.source)).unwrap(), b"PK\x03\x04");
    }

    #[test]
    fn test_pretty_json() {
        let pretty = pretty_json(r#"{"a":1,"b":[true]}"#);
        assert!(pretty.contains("\n  \"a\": 1"));

        assert_eq!(pretty_json("not json"), "not json");
    }
}
