use async_trait::async_trait;
use companion_engine_abi::{now_unix_ms, StoryEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{most_recent_first, StoreError, StoryStore, VisionStore};

const VISION_DOC_VERSION: u64 = 1;
const VISION_DIR: &str = "vision";
const STORY_DIR: &str = "story";

/// File name for a session. Session ids are caller-supplied, so they are hex
/// encoded rather than trusted as path components.
fn session_file_name(session_id: &str, extension: &str) -> String {
    format!("{}.{extension}", hex::encode(session_id.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VisionDocument {
    version: u64,
    session_id: String,
    tick: u64,
    updated_at: i64,
    snapshot: JsonValue,
}

/// One JSON document per session under `<root>/vision/`.
#[derive(Debug, Clone)]
pub struct FileVisionStore {
    root: PathBuf,
    vision_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileVisionStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let vision_dir = root.join(VISION_DIR);
        Self {
            root,
            vision_dir,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.vision_dir.join(session_file_name(session_id, "json"))
    }

    async fn read_document(&self, session_id: &str) -> Result<Option<VisionDocument>, StoreError> {
        let data = match fs::read(self.snapshot_path(session_id)).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let document: VisionDocument = serde_json::from_slice(&data)?;
        if document.version != VISION_DOC_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: VISION_DOC_VERSION,
                found: document.version,
            });
        }
        Ok(Some(document))
    }

    /// Tick recorded with the stored snapshot.
    pub async fn tick_of(&self, session_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .read_document(session_id)
            .await?
            .map(|document| document.tick))
    }
}

#[async_trait]
impl VisionStore for FileVisionStore {
    async fn load(&self, session_id: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self
            .read_document(session_id)
            .await?
            .map(|document| document.snapshot))
    }

    async fn save(
        &self,
        session_id: &str,
        snapshot: &JsonValue,
        tick: u64,
    ) -> Result<(), StoreError> {
        let document = VisionDocument {
            version: VISION_DOC_VERSION,
            session_id: session_id.to_string(),
            tick,
            updated_at: now_unix_ms(),
            snapshot: snapshot.clone(),
        };
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.vision_dir).await?;
        write_json_atomic(&document, &self.snapshot_path(session_id)).await
    }
}

/// One JSON line per story event under `<root>/story/`.
#[derive(Debug, Clone)]
pub struct FileStoryStore {
    root: PathBuf,
    story_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileStoryStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let story_dir = root.join(STORY_DIR);
        Self {
            root,
            story_dir,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self, session_id: &str) -> PathBuf {
        self.story_dir.join(session_file_name(session_id, "jsonl"))
    }
}

#[async_trait]
impl StoryStore for FileStoryStore {
    async fn load_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoryEvent>, StoreError> {
        let path = self.log_path(session_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        let mut skipped = 0usize;
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<StoryEvent>(line) {
                Ok(event) => events.push(event),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(
                session_id,
                skipped,
                path = %path.display(),
                "skipped unreadable story log lines"
            );
        }
        Ok(most_recent_first(events, limit))
    }

    async fn append(&self, session_id: &str, event: &StoryEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.story_dir).await?;
        let path = self.log_path(session_id);
        if ends_without_newline(&path).await? {
            line.insert(0, '\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// True when a previous write was torn and left an unterminated last line.
async fn ends_without_newline(path: &Path) -> Result<bool, StoreError> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(io::SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

async fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data).await?;
    fs::rename(tmp, path).await?;
    Ok(())
}
