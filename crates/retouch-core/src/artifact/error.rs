use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed audit record at line {line}: {source}")]
    MalformedRecord {
        line: usize,
        source: serde_json::Error,
    },
}
