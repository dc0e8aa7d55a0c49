use std::{path::PathBuf, time::Duration};

use crate::{
    builder::Builder, recipe::RecipeStore, upload::Uploader, workspace::Workspace, CompileService,
    Error,
};

/// Command line / environment options configuring a [CompileService].
#[derive(clap::Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Directory holding the build recipes clients can choose from.
    #[arg(long, env, default_value = "makefiles")]
    pub recipe_dir: PathBuf,

    /// Directory containing the toolchain, passed to every build as
    /// TOOLCHAIN_DIR.
    #[arg(long, env, default_value = "toolchains")]
    pub toolchain_dir: PathBuf,

    /// Directory below which the per-request workspaces are created.
    #[arg(long, env, default_value = "tmp")]
    pub scratch_dir: PathBuf,

    /// The make program invoked in each workspace.
    #[arg(long, env, default_value = "make")]
    pub make_program: PathBuf,

    /// Seconds after which a running build is killed.
    #[arg(long, env, default_value_t = 120)]
    pub build_timeout: u64,

    /// Number of builds allowed to run at the same time.
    #[arg(long, env, default_value_t = 4)]
    pub max_concurrent_builds: usize,

    /// File forwarded to the upload server after a successful build,
    /// relative to the workspace.
    #[arg(long, env, default_value = "main.hex")]
    pub artifact_name: String,

    /// Seconds an upload to the storage server may take.
    #[arg(long, env, default_value_t = 2)]
    pub upload_timeout: u64,

    /// Bearer token sent along with uploads.
    #[arg(long, env, hide_env_values = true)]
    pub upload_token: Option<String>,
}

impl ServiceArgs {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout)
    }
}

impl TryFrom<ServiceArgs> for CompileService {
    type Error = Error;

    fn try_from(args: ServiceArgs) -> Result<Self, Self::Error> {
        Workspace::remove_stale(&args.scratch_dir)?;

        let builder = Builder::new(
            RecipeStore::new(&args.recipe_dir),
            args.toolchain_dir.clone(),
            args.make_program.clone(),
            args.build_timeout(),
            args.max_concurrent_builds,
        );
        let uploader = Uploader::new(args.upload_timeout(), args.upload_token.clone())?;

        Ok(CompileService::new(
            args.scratch_dir,
            builder,
            uploader,
            args.artifact_name,
        ))
    }
}
