use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use waggle_core::{Position, RoleTemplate, WaggleError, WaggleResult};

/// Durable key-value persistence for position records and role templates.
///
/// `load_*` of a missing key returns `Ok(None)`; a record that exists but
/// cannot be parsed surfaces as a hard error so corruption is never masked
/// as absence.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn save_position(&self, position: &Position) -> WaggleResult<()>;
    async fn load_position(&self, id: &str) -> WaggleResult<Option<Position>>;
    async fn load_all_positions(&self) -> WaggleResult<Vec<Position>>;
    async fn delete_position(&self, id: &str) -> WaggleResult<()>;

    async fn save_template(&self, template: &RoleTemplate) -> WaggleResult<()>;
    async fn load_template(&self, name: &str) -> WaggleResult<Option<RoleTemplate>>;
    async fn load_all_templates(&self) -> WaggleResult<Vec<RoleTemplate>>;
    async fn delete_template(&self, name: &str) -> WaggleResult<()>;
}

/// File-based store: one JSON document per position under `positions/` and
/// per template under `templates/`.
///
/// Writes go through a temp file and an atomic rename so a crash can never
/// leave a truncated record behind.
pub struct FilePositionStore {
    positions_dir: PathBuf,
    templates_dir: PathBuf,
}

impl FilePositionStore {
    pub async fn new(dir: impl Into<PathBuf>) -> WaggleResult<Self> {
        let dir = dir.into();
        let positions_dir = dir.join("positions");
        let templates_dir = dir.join("templates");
        tokio::fs::create_dir_all(&positions_dir).await?;
        tokio::fs::create_dir_all(&templates_dir).await?;
        Ok(Self {
            positions_dir,
            templates_dir,
        })
    }

    fn position_path(&self, id: &str) -> PathBuf {
        self.positions_dir.join(format!("{id}.json"))
    }

    fn template_path(&self, name: &str) -> PathBuf {
        self.templates_dir.join(format!("{name}.json"))
    }
}

/// Keys become file names, so restrict them to a filesystem-safe alphabet.
pub fn validate_key(key: &str) -> WaggleResult<()> {
    if key.is_empty() {
        return Err(WaggleError::Store("empty identifier".to_string()));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WaggleError::Store(format!(
            "identifier '{key}' contains characters unsafe for file names"
        )));
    }
    Ok(())
}

async fn write_atomic(path: &Path, contents: &str) -> WaggleResult<()> {
    // The temp name is unique per write: concurrent saves of the same record
    // must not share a temp file, or one rename pulls it out from under the
    // other and fails spuriously.
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    what: &str,
) -> WaggleResult<Option<T>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_str(&data).map_err(|e| {
        WaggleError::Store(format!("corrupt {what} record at {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn save_position(&self, position: &Position) -> WaggleResult<()> {
        validate_key(&position.id)?;
        let json = serde_json::to_string_pretty(position)?;
        write_atomic(&self.position_path(&position.id), &json).await
    }

    async fn load_position(&self, id: &str) -> WaggleResult<Option<Position>> {
        validate_key(id)?;
        read_json(&self.position_path(id), "position").await
    }

    async fn load_all_positions(&self) -> WaggleResult<Vec<Position>> {
        let mut positions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.positions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(position) = read_json::<Position>(&path, "position").await? {
                positions.push(position);
            }
        }
        positions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(positions)
    }

    async fn delete_position(&self, id: &str) -> WaggleResult<()> {
        validate_key(id)?;
        let path = self.position_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_template(&self, template: &RoleTemplate) -> WaggleResult<()> {
        validate_key(&template.name)?;
        let json = serde_json::to_string_pretty(template)?;
        write_atomic(&self.template_path(&template.name), &json).await
    }

    async fn load_template(&self, name: &str) -> WaggleResult<Option<RoleTemplate>> {
        validate_key(name)?;
        read_json(&self.template_path(name), "template").await
    }

    async fn load_all_templates(&self) -> WaggleResult<Vec<RoleTemplate>> {
        let mut templates = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.templates_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(template) = read_json::<RoleTemplate>(&path, "template").await? {
                templates.push(template);
            }
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn delete_template(&self, name: &str) -> WaggleResult<()> {
        validate_key(name)?;
        let path = self.template_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use waggle_core::TaskSpec;

    async fn temp_store() -> (tempfile::TempDir, FilePositionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_load_position() {
        let (_dir, store) = temp_store().await;
        let mut pos = Position::new("worker-1", "reviewer");
        pos.task_queue
            .push(waggle_core::Task::new(TaskSpec::new("a", "worker-1", "review")));
        store.save_position(&pos).await.unwrap();

        let loaded = store.load_position("worker-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "worker-1");
        assert_eq!(loaded.template_name, "reviewer");
        assert_eq!(loaded.task_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (_dir, store) = temp_store().await;
        assert!(store.load_position("nope").await.unwrap().is_none());
        assert!(store.load_template("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_hard_error() {
        let (dir, store) = temp_store().await;
        let path = dir.path().join("positions").join("broken.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = store.load_position("broken").await.err().unwrap();
        assert!(matches!(err, WaggleError::Store(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_delete_position_is_idempotent() {
        let (_dir, store) = temp_store().await;
        let pos = Position::new("worker-1", "reviewer");
        store.save_position(&pos).await.unwrap();
        store.delete_position("worker-1").await.unwrap();
        assert!(store.load_position("worker-1").await.unwrap().is_none());
        // Deleting again is fine.
        store.delete_position("worker-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_load_all_positions_sorted() {
        let (_dir, store) = temp_store().await;
        store
            .save_position(&Position::new("b-pos", "reviewer"))
            .await
            .unwrap();
        store
            .save_position(&Position::new("a-pos", "reviewer"))
            .await
            .unwrap();
        let all = store.load_all_positions().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a-pos");
        assert_eq!(all[1].id, "b-pos");
    }

    #[tokio::test]
    async fn test_template_roundtrip() {
        let (_dir, store) = temp_store().await;
        let template = RoleTemplate {
            name: "reviewer".to_string(),
            description: "Reviews things".to_string(),
            system_prompt: "You review.".to_string(),
            model: "claude-sonnet".to_string(),
            max_turns: 10,
            timeout_secs: Some(120),
        };
        store.save_template(&template).await.unwrap();
        let loaded = store.load_template("reviewer").await.unwrap().unwrap();
        assert_eq!(loaded.timeout_secs, Some(120));
        assert_eq!(store.load_all_templates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsafe_keys_rejected() {
        let (_dir, store) = temp_store().await;
        assert!(store.load_position("../escape").await.is_err());
        assert!(store.load_position("").await.is_err());
        assert!(store.load_position("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_saves_of_one_record_all_succeed() {
        let (dir, store) = temp_store().await;
        let store = std::sync::Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .save_position(&Position::new("worker-1", "reviewer"))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(store.load_position("worker-1").await.unwrap().is_some());
        // Every temp file was renamed away; only the record remains.
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path().join("positions")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["worker-1.json"]);
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let (dir, store) = temp_store().await;
        store
            .save_position(&Position::new("worker-1", "reviewer"))
            .await
            .unwrap();
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path().join("positions")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["worker-1.json"]);
    }
}
