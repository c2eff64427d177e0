//! Core types for codepad: the replicated text handle, the editing-surface
//! model contract, and the read-only document catalog record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod collab;
pub mod editor;

pub use collab::{ChangeOp, TextError, TextHandle};
pub use editor::{
    ContentChange, ContentChangedEvent, ContentListener, EditorModel, ListenerId, Position,
    Range, TextEdit, TextModel,
};

/// Content given to documents created without any.
pub const DEFAULT_CONTENT: &str = "// Start coding...\n";

/// Language assigned when the catalog omits one.
pub const DEFAULT_LANGUAGE: &str = "javascript";

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// Errors raised while decoding catalog records.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid document record: {0}")]
    InvalidRecord(#[from] serde_json::Error),
    #[error("document record has an empty id")]
    MissingId,
}

/// A document as the catalog backend describes it.
///
/// Read-only at this layer: merged content is never written back.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: impl Into<String>, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            language: language.into(),
            content: DEFAULT_CONTENT.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Decode a single record as returned by `GET /documents/{id}/`.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let doc: Document = serde_json::from_str(json)?;
        if doc.id.trim().is_empty() {
            return Err(CatalogError::MissingId);
        }
        Ok(doc)
    }

    /// Decode the record list returned by `GET /documents/`.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>, CatalogError> {
        let docs: Vec<Document> = serde_json::from_str(json)?;
        if docs.iter().any(|d| d.id.trim().is_empty()) {
            return Err(CatalogError::MissingId);
        }
        Ok(docs)
    }

    /// Known prior content to seed a fresh replicated text with, if any.
    pub fn initial_content(&self) -> Option<&str> {
        if self.content.is_empty() {
            None
        } else {
            Some(&self.content)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"{
        "id": "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b",
        "title": "scratch.js",
        "content": "console.log(1);\n",
        "language": "javascript",
        "created_at": "2024-03-01T10:00:00.000000Z",
        "updated_at": "2024-03-02T11:30:00.123456Z",
        "owner": {"id": 1, "username": "alice", "email": "a@example.com"},
        "collaborators": []
    }"#;

    #[test]
    fn test_document_creation() {
        let doc = Document::new("notes", "rust");
        assert_eq!(doc.title, "notes");
        assert_eq!(doc.language, "rust");
        assert_eq!(doc.content, DEFAULT_CONTENT);
        assert!(Uuid::parse_str(&doc.id).is_ok());
    }

    #[test]
    fn test_from_json_ignores_unknown_fields() {
        let doc = Document::from_json(RECORD).unwrap();
        assert_eq!(doc.title, "scratch.js");
        assert_eq!(doc.content, "console.log(1);\n");
        assert!(doc.updated_at > doc.created_at);
    }

    #[test]
    fn test_from_json_defaults() {
        let json = r#"{"id":"d1","title":"t","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#;
        let doc = Document::from_json(json).unwrap();
        assert_eq!(doc.language, DEFAULT_LANGUAGE);
        assert!(doc.content.is_empty());
        assert_eq!(doc.initial_content(), None);
    }

    #[test]
    fn test_from_json_rejects_empty_id() {
        let json = r#"{"id":"  ","title":"t","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(Document::from_json(json), Err(CatalogError::MissingId)));
        assert!(matches!(
            Document::from_json("{not json"),
            Err(CatalogError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_list_from_json() {
        let json = format!("[{RECORD}, {RECORD}]");
        let docs = Document::list_from_json(&json).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_initial_content() {
        let doc = Document::new("a", "go").with_content("package main\n");
        assert_eq!(doc.initial_content(), Some("package main\n"));
    }
}
