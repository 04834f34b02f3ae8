//! Where automation definitions come from.
//!
//! Definitions are typed [`Automation`] values; serde deserialisation is the
//! structural validation. Cross-automation checks (route clashes, cron
//! syntax, providers) happen when the registry is built.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use db::DbPool;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::models::Automation;

#[async_trait]
pub trait AutomationSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Automation>, EngineError>;
}

/// A fixed set, mostly for tests and embedding.
pub struct StaticSource(pub Vec<Automation>);

#[async_trait]
impl AutomationSource for StaticSource {
    async fn load(&self) -> Result<Vec<Automation>, EngineError> {
        Ok(self.0.clone())
    }
}

/// A JSON file holding one automation or an array of them, or a directory
/// of such files (`*.json`, read in name order).
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AutomationSource for FileSource {
    async fn load(&self) -> Result<Vec<Automation>, EngineError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| source_error(&self.path, e))?;

        let files = if metadata.is_dir() {
            let mut entries = tokio::fs::read_dir(&self.path)
                .await
                .map_err(|e| source_error(&self.path, e))?;
            let mut files = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| source_error(&self.path, e))?
            {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    files.push(path);
                }
            }
            files.sort();
            files
        } else {
            vec![self.path.clone()]
        };

        let mut automations = Vec::new();
        for file in files {
            let content = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| source_error(&file, e))?;
            let parsed = parse_definitions(&content).map_err(|e| source_error(&file, e))?;
            debug!(file = %file.display(), count = parsed.len(), "loaded automation file");
            automations.extend(parsed);
        }

        info!(path = %self.path.display(), count = automations.len(), "automations loaded");
        Ok(automations)
    }
}

/// One definition object or an array of them.
pub fn parse_definitions(content: &str) -> Result<Vec<Automation>, serde_json::Error> {
    match serde_json::from_str::<Value>(content)? {
        Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

fn source_error(path: &Path, err: impl std::fmt::Display) -> EngineError {
    EngineError::Source(format!("{}: {err}", path.display()))
}

/// The `automations` table.
pub struct PgSource {
    pool: DbPool,
}

impl PgSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutomationSource for PgSource {
    async fn load(&self) -> Result<Vec<Automation>, EngineError> {
        let rows = db::repository::automations::list_automations(&self.pool)
            .await
            .map_err(|e| EngineError::Source(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row.definition).map_err(|e| {
                    EngineError::InvalidAutomation {
                        automation_id: row.id,
                        message: e.to_string(),
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(id: &str, path: &str) -> Value {
        json!({
            "id": id,
            "name": id,
            "trigger": { "type": "http-post", "path": path },
            "actions": []
        })
    }

    #[test]
    fn parses_single_and_array() {
        let one = parse_definitions(&definition("a", "/a").to_string()).unwrap();
        assert_eq!(one.len(), 1);

        let many = json!([definition("a", "/a"), definition("b", "/b")]).to_string();
        assert_eq!(parse_definitions(&many).unwrap().len(), 2);

        assert!(parse_definitions(r#"{"id":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn loads_directory_in_name_order() {
        let dir = std::env::temp_dir().join(format!("automations-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("b.json"), definition("second", "/b").to_string())
            .await
            .unwrap();
        tokio::fs::write(
            dir.join("a.json"),
            json!([definition("first", "/a")]).to_string(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("notes.txt"), "ignored").await.unwrap();

        let loaded = FileSource::new(&dir).load().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let err = FileSource::new("/definitely/not/here.json")
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Source(_)));
    }
}
