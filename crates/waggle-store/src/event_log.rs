use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use waggle_core::{Event, EventFilter, WaggleResult};

/// Append-only event persistence: one newline-delimited JSON file per UTC
/// calendar day, named `events-YYYY-MM-DD.jsonl`.
///
/// There is no index; historical queries scan every segment in filename
/// order, which is also chronological order.
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    pub async fn new(dir: impl Into<PathBuf>) -> WaggleResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn segment_path(&self, event: &Event) -> PathBuf {
        self.dir
            .join(format!("events-{}.jsonl", event.timestamp.format("%Y-%m-%d")))
    }

    /// Durably append one event. Failure here is fatal for the emit in
    /// progress: downstream consumers assume the log is complete.
    pub async fn append(&self, event: &Event) -> WaggleResult<()> {
        let line = serde_json::to_string(event)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.segment_path(event))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Replay persisted events, oldest first.
    ///
    /// Each line is parsed independently; malformed lines are skipped with a
    /// warning rather than failing the whole read. The filter's set fields
    /// are ANDed, and `limit` keeps only the last N matches.
    pub async fn history(&self, filter: &EventFilter) -> WaggleResult<Vec<Event>> {
        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("events-") && name.ends_with(".jsonl") {
                segments.push(entry.path());
            }
        }
        segments.sort();

        let mut events = Vec::new();
        for segment in segments {
            let data = tokio::fs::read_to_string(&segment).await?;
            for line in data.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => {
                        if filter.matches(&event) {
                            events.push(event);
                        }
                    }
                    Err(e) => {
                        warn!(segment = %segment.display(), error = %e, "skipping malformed event line");
                    }
                }
            }
        }

        if let Some(limit) = filter.limit {
            if events.len() > limit {
                events.drain(..events.len() - limit);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use waggle_core::Event;

    async fn temp_log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).await.unwrap();
        (dir, log)
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let (_dir, log) = temp_log().await;
        let event = Event::new("task.created", "a", Some("b".to_string()), json!({"x": 1}));
        log.append(&event).await.unwrap();

        let events = log.history(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
        assert_eq!(events[0].payload, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_segment_named_by_day() {
        let (dir, log) = temp_log().await;
        let event = Event::new("task.created", "a", None, json!({}));
        log.append(&event).await.unwrap();

        let expected = format!("events-{}.jsonl", event.timestamp.format("%Y-%m-%d"));
        assert!(dir.path().join(expected).exists());
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let (dir, log) = temp_log().await;
        let event = Event::new("task.created", "a", None, json!({}));
        log.append(&event).await.unwrap();

        let segment = dir
            .path()
            .join(format!("events-{}.jsonl", event.timestamp.format("%Y-%m-%d")));
        let mut contents = tokio::fs::read_to_string(&segment).await.unwrap();
        contents.push_str("this is not json\n");
        tokio::fs::write(&segment, contents).await.unwrap();
        let later = Event::new("task.completed", "a", None, json!({}));
        log.append(&later).await.unwrap();

        let events = log.history(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (_dir, log) = temp_log().await;
        for i in 0..5 {
            log.append(&Event::new("task.created", "a", None, json!({ "i": i })))
                .await
                .unwrap();
        }
        let filter = EventFilter {
            event_type: Some("task.created".to_string()),
            ..Default::default()
        };
        let first = log.history(&filter).await.unwrap();
        let second = log.history(&filter).await.unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(
            first.iter().map(|e| e.id).collect::<Vec<_>>(),
            second.iter().map(|e| e.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_filter_and_limit() {
        let (_dir, log) = temp_log().await;
        for i in 0..4 {
            log.append(&Event::new("task.completed", "a", None, json!({ "i": i })))
                .await
                .unwrap();
        }
        log.append(&Event::new("task.failed", "b", None, json!({})))
            .await
            .unwrap();

        let filter = EventFilter {
            event_type: Some("task.completed".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let events = log.history(&filter).await.unwrap();
        assert_eq!(events.len(), 2);
        // Last two matching events, in order.
        assert_eq!(events[0].payload, json!({"i": 2}));
        assert_eq!(events[1].payload, json!({"i": 3}));
    }
}
