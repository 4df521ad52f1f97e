use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ArtifactError;
use crate::session::{RunStatus, Stage, TransitionEvent};

/// A single line in the audit JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// One executed stage.
    Transition {
        session_id: Uuid,
        stage: Stage,
        timestamp: DateTime<Utc>,
        summary: String,
    },
    /// The run reached a terminal status.
    Outcome {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
        status: RunStatus,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_image: Option<PathBuf>,
    },
}

impl AuditRecord {
    pub fn transition(session_id: Uuid, event: &TransitionEvent) -> Self {
        AuditRecord::Transition {
            session_id,
            stage: event.stage,
            timestamp: event.timestamp,
            summary: event.summary.clone(),
        }
    }

    pub fn outcome(
        session_id: Uuid,
        status: RunStatus,
        reason: impl Into<String>,
        output_image: Option<PathBuf>,
    ) -> Self {
        AuditRecord::Outcome {
            session_id,
            timestamp: Utc::now(),
            status,
            reason: reason.into(),
            output_image,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            AuditRecord::Transition { session_id, .. } | AuditRecord::Outcome { session_id, .. } => {
                *session_id
            }
        }
    }
}

/// Append-only writer. Each record is flushed as soon as it is written.
pub struct AuditWriter {
    file: std::fs::File,
}

impl AuditWriter {
    pub fn create(path: &Path) -> Result<Self, ArtifactError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn write_record(&mut self, record: &AuditRecord) -> Result<(), ArtifactError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Replays an audit file.
pub struct AuditReader;

impl AuditReader {
    pub fn read_all(path: &Path) -> Result<Vec<AuditRecord>, ArtifactError> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord =
                serde_json::from_str(&line).map_err(|source| ArtifactError::MalformedRecord {
                    line: idx + 1,
                    source,
                })?;
            records.push(record);
        }

        Ok(records)
    }

    /// Records belonging to one session, in file order.
    pub fn read_session(path: &Path, session_id: Uuid) -> Result<Vec<AuditRecord>, ArtifactError> {
        Ok(Self::read_all(path)?
            .into_iter()
            .filter(|r| r.session_id() == session_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_are_appended_and_replayed_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let id = Uuid::new_v4();

        let mut writer = AuditWriter::create(&path).unwrap();
        writer
            .write_record(&AuditRecord::transition(
                id,
                &TransitionEvent::new(Stage::Analyze, "scene described"),
            ))
            .unwrap();
        writer
            .write_record(&AuditRecord::transition(
                id,
                &TransitionEvent::new(Stage::Plan, "2 steps"),
            ))
            .unwrap();
        writer
            .write_record(&AuditRecord::outcome(
                id,
                RunStatus::Succeeded,
                "verified",
                Some(PathBuf::from("/out/edited_1.png")),
            ))
            .unwrap();
        drop(writer);

        let records = AuditReader::read_all(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(
            records[0],
            AuditRecord::Transition {
                stage: Stage::Analyze,
                ..
            }
        ));
        assert!(matches!(
            records[2],
            AuditRecord::Outcome {
                status: RunStatus::Succeeded,
                ..
            }
        ));
    }

    #[test]
    fn reopening_appends_instead_of_truncating() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs").join("audit.jsonl");
        let event = TransitionEvent::new(Stage::Verify, "ok");

        for _ in 0..2 {
            let mut writer = AuditWriter::create(&path).unwrap();
            writer
                .write_record(&AuditRecord::transition(Uuid::new_v4(), &event))
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|l| l.contains("\"kind\":\"transition\"")));
    }

    #[test]
    fn read_session_filters_by_id() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let event = TransitionEvent::new(Stage::Execute, "exit 0");

        let mut writer = AuditWriter::create(&path).unwrap();
        writer.write_record(&AuditRecord::transition(a, &event)).unwrap();
        writer.write_record(&AuditRecord::transition(b, &event)).unwrap();
        writer.write_record(&AuditRecord::transition(a, &event)).unwrap();
        drop(writer);

        assert_eq!(AuditReader::read_session(&path, a).unwrap().len(), 2);
        assert_eq!(AuditReader::read_session(&path, b).unwrap().len(), 1);
    }

    #[test]
    fn blank_lines_are_skipped_and_garbage_reports_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.jsonl");
        std::fs::write(&path, "\n\n").unwrap();
        assert!(AuditReader::read_all(&path).unwrap().is_empty());

        std::fs::write(&path, "\n{not json}\n").unwrap();
        let err = AuditReader::read_all(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::MalformedRecord { line: 2, .. }));
    }
}
