use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("metadata configuration: {0}")]
    Config(String),

    /// A state precondition did not hold, e.g. a second active sweep.
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("internal: {0}")]
    Internal(String),

    /// Some chunks of an object are absent, pending or being deleted.
    /// Nothing was committed.
    #[error(
        "object {nar_hash} references {} unavailable chunks: {}",
        .missing_chunks.len(),
        sample(.missing_chunks)
    )]
    MissingChunks {
        nar_hash: String,
        missing_chunks: Vec<String>,
    },
}

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

fn sample(hashes: &[String]) -> String {
    const SHOWN: usize = 3;
    let head = hashes.iter().take(SHOWN).map(String::as_str).collect::<Vec<_>>().join(", ");
    match hashes.len().saturating_sub(SHOWN) {
        0 => head,
        rest => format!("{head}, +{rest}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing(n: usize) -> MetadataError {
        MetadataError::MissingChunks {
            nar_hash: "sha256:abc".into(),
            missing_chunks: (0..n).map(|i| format!("c{i}")).collect(),
        }
    }

    #[test]
    fn test_missing_chunks_lists_a_few() {
        assert_eq!(
            missing(2).to_string(),
            "object sha256:abc references 2 unavailable chunks: c0, c1"
        );
        assert_eq!(
            missing(5).to_string(),
            "object sha256:abc references 5 unavailable chunks: c0, c1, c2, +2"
        );
    }
}
