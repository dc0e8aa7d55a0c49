use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A CompileRequest describes one build job submitted by a client: the
/// recipe to build with, the source files to place into the workspace, and
/// optionally where to forward the produced artifact to.
///
/// It only lives for the duration of one HTTP request.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    /// Name of the recipe inside the recipe directory.
    /// If empty, the recipe is inferred from the file extensions.
    #[serde(rename = "makefile", default)]
    pub recipe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    /// Base URL of the server the artifact is uploaded to.
    /// An empty string is treated the same as an absent field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_server: Option<String>,
    #[serde(default)]
    pub files: Vec<CompileFile>,
}

impl CompileRequest {
    /// Returns the session id sent by the client, or a freshly generated one
    /// if it's missing or empty.
    pub fn session_id_or_generate(&self) -> String {
        match self.session_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    /// Returns the upload destination, if one was requested.
    pub fn upload_server(&self) -> Option<&str> {
        self.upload_server.as_deref().filter(|s| !s.is_empty())
    }
}

/// A single source file, relative to the workspace root.
#[derive(Default, Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompileFile {
    pub name: String,
    pub content: String,
}

impl CompileFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Names ending in `/` or `/.` denote a directory, not a file.
    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/') || self.name.ends_with("/.")
    }
}

/// The outcome of running the toolchain, as returned to the client.
#[derive(Default, Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompileResult {
    pub success: bool,
    pub output: String,
}
