use std::path::PathBuf;

use tracing::{debug, info, instrument, Span};

use crate::{
    builder::Builder, recipe::infer_recipe, sandbox::write_files, upload::Uploader,
    workspace::Workspace, CompileRequest, CompileResult, Error,
};

/// Handles compile requests end to end.
///
/// Every request gets its own [Workspace], the submitted files are written
/// into it, the toolchain is run, and if requested, the artifact is uploaded.
/// The workspace is removed afterwards, no matter at which step the request
/// failed.
pub struct CompileService {
    scratch_dir: PathBuf,
    builder: Builder,
    uploader: Uploader,
    artifact_name: String,
}

impl CompileService {
    pub fn new(
        scratch_dir: PathBuf,
        builder: Builder,
        uploader: Uploader,
        artifact_name: String,
    ) -> Self {
        Self {
            scratch_dir,
            builder,
            uploader,
            artifact_name,
        }
    }

    #[instrument(
        skip_all,
        fields(
            session_id = tracing::field::Empty,
            recipe = tracing::field::Empty,
            workspace = tracing::field::Empty,
            files.len = request.files.len()
        ),
        err
    )]
    pub async fn compile(&self, request: CompileRequest) -> Result<CompileResult, Error> {
        let span = Span::current();

        let session_id = request.session_id_or_generate();
        span.record("session_id", session_id.as_str());

        let destination = request.upload_server().map(str::to_string);
        let experiment_id = request.experiment_id.clone().unwrap_or_default();

        let recipe = if request.recipe.is_empty() {
            infer_recipe(&request.files)
                .ok_or_else(|| Error::RecipeNotFound("unable to infer recipe from files".into()))?
                .to_string()
        } else {
            request.recipe.clone()
        };
        span.record("recipe", recipe.as_str());

        let workspace = Workspace::create(&self.scratch_dir)?;
        span.record("workspace", tracing::field::debug(workspace.path()));

        let root = workspace.path().to_path_buf();
        let files = request.files;
        tokio::task::spawn_blocking(move || write_files(&files, &root))
            .await
            .map_err(std::io::Error::other)??;

        let result = self.builder.build(workspace.path(), &recipe).await?;

        // The artifact is forwarded whatever the build outcome was. A failed
        // build usually leaves no artifact, which fails the request.
        if let Some(destination) = destination {
            self.uploader
                .upload(
                    &workspace.path().join(&self.artifact_name),
                    &destination,
                    &session_id,
                    &experiment_id,
                )
                .await?;
            debug!("uploaded artifact");
        }

        info!(success = result.success, "compile request finished");

        workspace.destroy();
        Ok(result)
    }
}
