use crate::{
    errors::{Result, SandboxError},
    notebook::FileDescriptor,
    orchestrator::{DocumentStore, SavedDocument},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Document and file registry kept in memory, optionally mirrored to a
/// directory as one `<id>.json` file per document.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, SavedDocument>>,
    files: RwLock<HashMap<String, Vec<FileDescriptor>>>,
    directory: Option<PathBuf>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_directory(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        info!("[STORE] Persisting documents under {}", directory.display());
        Ok(Self {
            directory: Some(directory),
            ..Self::default()
        })
    }

    /// Attach a file to a conversation. Re-registering the same source replaces it.
    pub async fn register_file(&self, chat_id: &str, file: FileDescriptor) {
        let mut files = self.files.write().await;
        let list = files.entry(chat_id.to_string()).or_default();
        list.retain(|f| !f.same_source(&file));
        debug!("[STORE] Registered {} for chat {}", file.file_name, chat_id);
        list.push(file);
    }

    pub async fn document(&self, id: &str) -> Option<SavedDocument> {
        if let Some(document) = self.documents.read().await.get(id) {
            return Some(document.clone());
        }
        let path = self.document_path(id).ok()??;
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    fn document_path(&self, id: &str) -> Result<Option<PathBuf>> {
        let Some(directory) = &self.directory else {
            return Ok(None);
        };
        if id.is_empty() || Path::new(id).components().count() != 1 || id.contains("..") {
            return Err(SandboxError::Persistence(format!("invalid document id '{}'", id)));
        }
        Ok(Some(directory.join(format!("{}.json", id))))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn save_document(&self, document: SavedDocument) -> Result<()> {
        if let Some(path) = self.document_path(&document.id)? {
            let json = serde_json::to_vec_pretty(&document)?;
            tokio::fs::write(&path, json)
                .await
                .map_err(|e| SandboxError::Persistence(format!("{}: {}", path.display(), e)))?;
        }
        debug!(
            "[STORE] Saved document {} for conversation {}",
            document.id, document.conversation_id
        );
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document);
        Ok(())
    }

    async fn file_metadata_by_chat_id(&self, chat_id: &str) -> Result<Vec<FileDescriptor>> {
        Ok(self
            .files
            .read()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }
}
