use thiserror::Error;

/// A failed generation request against the completion endpoint.
///
/// All variants are transient per-request failures: the engine records the
/// affected branch as empty and keeps going. The factory itself never
/// retries; retry policy lives in the engine so that backoff is uniform
/// across the forward and backward phases.
#[derive(Debug, Error)]
pub enum GenerationFailure {
    /// The endpoint was unreachable, returned a non-2xx status, or the
    /// request timed out.
    #[error("transport error: {0}")]
    Transport(String),
    /// The endpoint rejected the request with a rate limit.
    #[error("endpoint rate-limited the request")]
    RateLimited,
    /// The response body could not be decoded, or it carried fewer
    /// completions than requested.
    #[error("malformed endpoint response: {0}")]
    MalformedResponse(String),
}

impl GenerationFailure {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited)
    }
}

/// A forward completion that does not conform to the structural contract
/// the task expects (e.g. a missing region end marker).
#[derive(Debug, Error)]
#[error("unparseable forward sample: {0}")]
pub struct TaskParseError(pub String);

/// Why one backward branch ended up with no samples.
#[derive(Debug, Error)]
pub enum BranchFailure {
    #[error(transparent)]
    Generation(#[from] GenerationFailure),
    #[error(transparent)]
    Parse(#[from] TaskParseError),
}

/// Archive I/O failures. These are fatal: a run that cannot read its input
/// or append to its output aborts, leaving any partial output on disk for
/// inspection.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read archive {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode record at {path}:{line}: {source}")]
    Decode {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write archive {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GenerationFailure::Transport("connection refused".to_string()).is_transient());
        assert!(GenerationFailure::RateLimited.is_transient());
        assert!(!GenerationFailure::MalformedResponse("bad json".to_string()).is_transient());
    }

    #[test]
    fn test_branch_failure_wraps_both_sources() {
        let from_generation: BranchFailure = GenerationFailure::RateLimited.into();
        assert!(matches!(from_generation, BranchFailure::Generation(_)));

        let from_parse: BranchFailure =
            TaskParseError("missing end marker".to_string()).into();
        assert!(matches!(from_parse, BranchFailure::Parse(_)));
    }
}
