use std::time::Duration;

use thiserror::Error;

/// Errors that abort the handling of a compile request.
///
/// A build that runs but exits non-zero is *not* an error, it's reported as
/// an unsuccessful [crate::CompileResult].
#[derive(Debug, Error)]
pub enum Error {
    /// A client-supplied name would resolve to a location outside the workspace.
    #[error("path escapes the workspace: {0}")]
    PathTraversal(String),

    #[error("recipe not found: {0}")]
    RecipeNotFound(String),

    /// The toolchain could not be started at all.
    #[error("unable to run toolchain {program}: {source}")]
    Toolchain {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build did not finish within {}s and was killed", .0.as_secs())]
    BuildTimeout(Duration),

    #[error("build artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(value: reqwest_middleware::Error) -> Self {
        Error::Upload(value.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Upload(value.to_string())
    }
}
