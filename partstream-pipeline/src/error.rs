//! Errors surfaced by chain assembly

use partstream_core::{Error, ErrorKind};

/// Error type for loader evaluation
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Missing or unreadable input
    #[error("Source error: {0}")]
    Source(String),

    /// A requested channel could not be produced
    #[error("Schema error: {0}")]
    Schema(String),

    /// The evaluation was cancelled
    #[error("Evaluation cancelled")]
    Cancelled,

    /// Host settings could not be converted
    #[error("Settings error: {0}")]
    Settings(#[from] serde_json::Error),

    /// General error
    #[error("{0}")]
    Other(#[from] Error),
}

impl PipelineError {
    /// Sort a stream error into the loader's categories
    pub fn classify(error: Error) -> Self {
        match error.kind() {
            ErrorKind::Cancelled => PipelineError::Cancelled,
            ErrorKind::Source => PipelineError::Source(error.to_string()),
            ErrorKind::Schema => PipelineError::Schema(error.to_string()),
            ErrorKind::Consistency | ErrorKind::Usage => PipelineError::Other(error),
        }
    }

    /// Whether this is a cancellation rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert!(PipelineError::classify(Error::Cancelled).is_cancelled());
        assert!(matches!(
            PipelineError::classify(Error::ChannelMissing("Color".into())),
            PipelineError::Schema(_)
        ));
        assert!(matches!(
            PipelineError::classify(Error::unreadable("a.prt", "gone")),
            PipelineError::Source(_)
        ));
        assert!(matches!(
            PipelineError::classify(Error::Consistency("counts".into())),
            PipelineError::Other(_)
        ));
    }
}
