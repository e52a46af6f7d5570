//! In-memory backends for tests and local runs.
//!
//! A sheets document is a JSON object mapping range names to values; the
//! whole object is returned when no range is given. Drive files are JSON
//! objects carrying at least `id` and `name`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{BackendError, BackendResult, DriveBackend, SheetsBackend};

/// Sheets backend backed by a concurrent map of documents.
#[derive(Debug, Default)]
pub struct MemorySheets {
    docs: DashMap<String, Map<String, Value>>,
}

impl MemorySheets {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document under a fixed id.
    pub fn insert_document(&self, doc_id: impl Into<String>, ranges: Map<String, Value>) {
        self.docs.insert(doc_id.into(), ranges);
    }

    fn missing(doc_id: &str) -> BackendError {
        BackendError::new(format!("document not found: {doc_id}"))
    }
}

#[async_trait]
impl SheetsBackend for MemorySheets {
    async fn get(&self, doc_id: &str, range: Option<&str>) -> BackendResult<Value> {
        let doc = self.docs.get(doc_id).ok_or_else(|| Self::missing(doc_id))?;
        Ok(match range {
            Some(range) => doc.get(range).cloned().unwrap_or(Value::Null),
            None => Value::Object(doc.clone()),
        })
    }

    async fn update(&self, doc_id: &str, range: &str, values: Value) -> BackendResult<Value> {
        let mut doc = self
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| Self::missing(doc_id))?;
        let cells = values.as_array().map_or(1, Vec::len);
        doc.insert(range.to_owned(), values);
        Ok(json!({ "documentId": doc_id, "updatedRange": range, "updatedCells": cells }))
    }

    async fn create(&self, properties: Value) -> BackendResult<String> {
        let id = Uuid::new_v4().to_string();
        let mut doc = Map::new();
        doc.insert("properties".into(), properties);
        self.docs.insert(id.clone(), doc);
        Ok(id)
    }

    async fn batch_get(&self, doc_id: &str, ranges: &[String]) -> BackendResult<Vec<Value>> {
        let doc = self.docs.get(doc_id).ok_or_else(|| Self::missing(doc_id))?;
        Ok(ranges
            .iter()
            .map(|r| doc.get(r).cloned().unwrap_or(Value::Null))
            .collect())
    }

    async fn batch_update(&self, doc_id: &str, requests: Vec<Value>) -> BackendResult<Vec<Value>> {
        let mut doc = self
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| Self::missing(doc_id))?;
        let mut replies = Vec::with_capacity(requests.len());
        for request in requests {
            let range = request
                .get("range")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::new("batch update request needs a string 'range'"))?
                .to_owned();
            let values = request.get("values").cloned().unwrap_or(Value::Null);
            doc.insert(range.clone(), values);
            replies.push(json!({ "updatedRange": range }));
        }
        Ok(replies)
    }
}

/// Drive backend backed by a concurrent map of files.
#[derive(Debug, Default)]
pub struct MemoryDrive {
    files: DashMap<String, Map<String, Value>>,
}

impl MemoryDrive {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(file_id: &str) -> BackendError {
        BackendError::new(format!("file not found: {file_id}"))
    }
}

#[async_trait]
impl DriveBackend for MemoryDrive {
    async fn get(&self, file_id: &str) -> BackendResult<Value> {
        self.files
            .get(file_id)
            .map(|f| Value::Object(f.clone()))
            .ok_or_else(|| Self::missing(file_id))
    }

    async fn list(&self, query: Option<&str>) -> BackendResult<Vec<Value>> {
        let mut files: Vec<Map<String, Value>> = self
            .files
            .iter()
            .filter(|f| {
                query.is_none_or(|q| {
                    f.get("name")
                        .and_then(Value::as_str)
                        .is_some_and(|name| name.contains(q))
                })
            })
            .map(|f| f.value().clone())
            .collect();
        files.sort_by(|a, b| {
            let name = |m: &Map<String, Value>| {
                m.get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            };
            name(a).cmp(&name(b))
        });
        Ok(files.into_iter().map(Value::Object).collect())
    }

    async fn create(&self, file: Value) -> BackendResult<String> {
        let Value::Object(mut file) = file else {
            return Err(BackendError::new("file must be an object"));
        };
        let id = Uuid::new_v4().to_string();
        file.insert("id".into(), Value::String(id.clone()));
        file.entry("name").or_insert_with(|| Value::String(id.clone()));
        self.files.insert(id.clone(), file);
        Ok(id)
    }

    async fn update(&self, file_id: &str, patch: Value) -> BackendResult<Value> {
        let Value::Object(patch) = patch else {
            return Err(BackendError::new("patch must be an object"));
        };
        let mut file = self
            .files
            .get_mut(file_id)
            .ok_or_else(|| Self::missing(file_id))?;
        for (key, value) in patch {
            if key != "id" {
                file.insert(key, value);
            }
        }
        Ok(Value::Object(file.clone()))
    }

    async fn delete(&self, file_id: &str) -> BackendResult<()> {
        self.files
            .remove(file_id)
            .map(|_| ())
            .ok_or_else(|| Self::missing(file_id))
    }
}
