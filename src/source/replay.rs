//! Replay Event Source
//!
//! Feeds a recorded JSON-lines capture (one `StreamEvent` per line) through
//! the reconciler. Used by the `replay` CLI command and for offline debugging.

use super::{EventSource, EventStream};
use crate::core::{MessageEvent, MessageId, ResumeCursor, SessionId, StreamEvent};
use crate::error::SourceError;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};

pub struct ReplayEventSource {
    path: PathBuf,
}

impl ReplayEventSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_lines(&self) -> Result<Vec<String>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceError::Fatal(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

/// Parse recorded lines; malformed lines surface as protocol errors in place
pub fn parse_lines(lines: &[String]) -> Vec<Result<StreamEvent, SourceError>> {
    lines
        .iter()
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str::<StreamEvent>(line)
                .map_err(|e| SourceError::Protocol(format!("line {}: {}", index + 1, e)))
        })
        .collect()
}

#[async_trait]
impl EventSource for ReplayEventSource {
    async fn open(
        &self,
        session_id: &SessionId,
        cursor: Option<ResumeCursor>,
    ) -> Result<EventStream, SourceError> {
        let lines = self.read_lines().await?;
        let skip = cursor
            .and_then(|c| c.token)
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0);

        let mut events = parse_lines(&lines);
        let saw_backfill_marker = events
            .iter()
            .any(|e| matches!(e, Ok(StreamEvent::BackfillComplete { .. })));
        if !saw_backfill_marker {
            events.push(Ok(StreamEvent::BackfillComplete {
                resume_token: Some(lines.len().to_string()),
            }));
        }

        tracing::info!(
            "[ReplayEventSource] Replaying {} events from {} into session '{}'",
            events.len().saturating_sub(skip),
            self.path.display(),
            session_id
        );

        let events: Vec<_> = events.into_iter().skip(skip).collect();
        Ok(futures::stream::iter(events).boxed())
    }

    async fn resync(
        &self,
        _session_id: &SessionId,
        _message_ids: &[MessageId],
    ) -> Result<Vec<MessageEvent>, SourceError> {
        // A capture holds no state beyond what it already replayed
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_replay_appends_backfill_marker() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"type":"message","message_id":"m1","sequence_number":1,"revision":1,"kind":"delta","text":"hi"}"#,
                "\n\n",
                r#"{"type":"message","message_id":"m1","sequence_number":1,"revision":2,"kind":"complete"}"#,
                "\n",
            ),
        )
        .unwrap();

        let source = ReplayEventSource::new(&path);
        let events: Vec<_> = source.open(&"s1".into(), None).await.unwrap().collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[2],
            Ok(StreamEvent::BackfillComplete { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_line_is_protocol_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let source = ReplayEventSource::new(&path);
        let events: Vec<_> = source.open(&"s1".into(), None).await.unwrap().collect().await;
        assert!(matches!(events[0], Err(SourceError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let source = ReplayEventSource::new("/nonexistent/events.jsonl");
        let result = source.open(&"s1".into(), None).await;
        assert!(matches!(result, Err(SourceError::Fatal(_))));
    }
}
