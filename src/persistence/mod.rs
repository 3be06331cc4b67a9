//! Document persistence
//!
//! Collections of JSON documents keyed by `<collection>Id`. Inserting a
//! document without an id assigns a fresh UUID; inserting one with an id
//! merges it into the stored document.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::{PoolHandle, SqliteDocumentStore};

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// A stored JSON object
pub type Document = Map<String, Value>;

/// Name of the id field of a collection: `greeting` → `greetingId`
pub fn id_field(collection: &str) -> String {
    format!("{}Id", collection)
}

/// Whether every criteria key is present in `document` with an equal value
pub fn matches(document: &Document, criteria: &Document) -> bool {
    criteria
        .iter()
        .all(|(key, expected)| document.get(key) == Some(expected))
}

/// Ensure the id field is set, returning the id
pub fn assign_id(collection: &str, document: &mut Document) -> String {
    let field = id_field(collection);
    match document.get(&field).and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = Uuid::new_v4().to_string();
            document.insert(field, Value::String(id.clone()));
            id
        }
    }
}

/// Trait for document backends
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or merge a document, returning it as stored
    async fn insert(&self, collection: &str, document: Document) -> Result<Document>;

    /// Documents whose fields equal every criteria entry
    async fn find(&self, collection: &str, criteria: &Document) -> Result<Vec<Document>>;

    async fn count(&self, collection: &str, criteria: &Document) -> Result<usize>;

    /// Remove matching documents, returning how many were removed
    async fn remove(&self, collection: &str, criteria: &Document) -> Result<usize>;
}

/// In-memory documents (for testing or ephemeral use)
pub struct InMemoryDocuments {
    collections: tokio::sync::RwLock<HashMap<String, Vec<Document>>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self {
            collections: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDocuments {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocuments {
    async fn insert(&self, collection: &str, mut document: Document) -> Result<Document> {
        let field = id_field(collection);
        let id = assign_id(collection, &mut document);

        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        let existing = documents
            .iter_mut()
            .find(|d| d.get(&field).and_then(Value::as_str) == Some(id.as_str()));

        match existing {
            Some(stored) => {
                stored.extend(document);
                Ok(stored.clone())
            }
            None => {
                documents.push(document.clone());
                Ok(document)
            }
        }
    }

    async fn find(&self, collection: &str, criteria: &Document) -> Result<Vec<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|d| matches(d, criteria))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str, criteria: &Document) -> Result<usize> {
        Ok(self.find(collection, criteria).await?.len())
    }

    async fn remove(&self, collection: &str, criteria: &Document) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = documents.len();
        documents.retain(|d| !matches(d, criteria));
        Ok(before - documents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_id() {
        let store = InMemoryDocuments::new();
        let stored = store
            .insert("greeting", doc(json!({"greeterId": "a", "greeteeId": "b"})))
            .await
            .unwrap();

        let id = stored.get("greetingId").and_then(Value::as_str).unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(store.count("greeting", &Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_with_id_merges() {
        let store = InMemoryDocuments::new();
        store
            .insert("human", doc(json!({"humanId": "h1", "name": "ann", "age": 30})))
            .await
            .unwrap();
        let merged = store
            .insert("human", doc(json!({"humanId": "h1", "age": 31})))
            .await
            .unwrap();

        assert_eq!(merged.get("name"), Some(&json!("ann")));
        assert_eq!(merged.get("age"), Some(&json!(31)));
        assert_eq!(store.count("human", &Document::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_and_remove_by_criteria() {
        let store = InMemoryDocuments::new();
        for kind in ["human", "robot", "human"] {
            store
                .insert("greeting", doc(json!({"greeterType": kind})))
                .await
                .unwrap();
        }

        let humans = store
            .find("greeting", &doc(json!({"greeterType": "human"})))
            .await
            .unwrap();
        assert_eq!(humans.len(), 2);

        let removed = store
            .remove("greeting", &doc(json!({"greeterType": "human"})))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count("greeting", &Document::new()).await.unwrap(), 1);
        assert!(store.find("missing", &Document::new()).await.unwrap().is_empty());
    }
}
