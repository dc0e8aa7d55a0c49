use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};
use tokio_stream::{wrappers::SplitStream, StreamExt};
use tracing::{debug, instrument, warn, Span};

use crate::{recipe::RecipeStore, CompileResult, Error};

/// The make target invoked in the workspace.
const MAKE_TARGET: &str = "all";

/// How long output is still collected after the toolchain exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs the external toolchain in a workspace.
///
/// The named recipe is copied into the workspace and the make program is run
/// against it, with the workspace as its working directory. Standard output
/// and standard error are captured into a single log.
/// The outcome of the build is solely determined by the exit status.
pub struct Builder {
    recipes: RecipeStore,
    toolchain_dir: PathBuf,
    make_program: PathBuf,
    timeout: Duration,

    // semaphore to track number of concurrently running builds.
    concurrent_builds: tokio::sync::Semaphore,
}

impl Builder {
    pub fn new(
        recipes: RecipeStore,
        toolchain_dir: PathBuf,
        make_program: PathBuf,
        timeout: Duration,
        max_concurrent_builds: usize,
    ) -> Self {
        Self {
            recipes,
            toolchain_dir,
            make_program,
            timeout,
            concurrent_builds: tokio::sync::Semaphore::new(max_concurrent_builds.max(1)),
        }
    }

    /// Installs `recipe` into `workspace` and runs the toolchain.
    ///
    /// A build that exits non-zero is returned as an unsuccessful
    /// [CompileResult], not as an error. Builds exceeding the configured
    /// timeout get their whole process group killed.
    #[instrument(skip(self), fields(build.exit_code = tracing::field::Empty), err)]
    pub async fn build(&self, workspace: &Path, recipe: &str) -> Result<CompileResult, Error> {
        self.recipes.install(recipe, workspace)?;

        let _permit = self
            .concurrent_builds
            .acquire()
            .await
            .map_err(std::io::Error::other)?;

        let mut child = self.spawn_make(workspace)?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

        let run = async {
            let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'))
                .merge(SplitStream::new(BufReader::new(stderr).split(b'\n')));

            let mut output = Vec::new();
            let mut output_closed = false;

            let status = loop {
                tokio::select! {
                    line = lines.next(), if !output_closed => match line {
                        Some(line) => push_line(&mut output, line?),
                        None => output_closed = true,
                    },
                    status = child.wait() => break status?,
                }
            };

            // Background processes the toolchain left behind may still hold
            // the pipes open.
            kill_process_group(pid);

            let drain = async {
                while let Some(line) = lines.next().await {
                    push_line(&mut output, line?);
                }
                Ok::<_, std::io::Error>(())
            };
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await {
                Ok(result) => result?,
                Err(_) => warn!("build output still open after the toolchain exited, truncating"),
            }

            Ok::<_, std::io::Error>((status, output))
        };

        let outcome = tokio::time::timeout(self.timeout, run).await;

        let (status, output) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout=?self.timeout, pid=?pid, "build timed out, killing");
                kill_process_group(pid);
                if let Err(e) = child.kill().await {
                    warn!(err=%e, "failed to kill build process");
                }
                return Err(Error::BuildTimeout(self.timeout));
            }
        };

        let output = String::from_utf8_lossy(&output).into_owned();

        if let Some(code) = status.code() {
            Span::current().record("build.exit_code", code);
        }

        if status.success() {
            debug!("build succeeded");
        } else {
            warn!(exit_code=%status, "build failed");
        }

        Ok(CompileResult {
            success: status.success(),
            output,
        })
    }

    /// Starts the make program in `workspace`, as the leader of a new process
    /// group.
    fn spawn_make(&self, workspace: &Path) -> Result<Child, Error> {
        let toolchain_error = |source| Error::Toolchain {
            program: self.make_program.display().to_string(),
            source,
        };

        // The child runs in another working directory, so relative paths need
        // to be resolved here. Bare program names are left to PATH lookup.
        let program = if self.make_program.components().count() > 1 {
            std::path::absolute(&self.make_program).map_err(toolchain_error)?
        } else {
            self.make_program.clone()
        };

        let mut toolchain_arg = OsString::from("TOOLCHAIN_DIR=");
        toolchain_arg.push(std::path::absolute(&self.toolchain_dir).map_err(toolchain_error)?);

        let mut command = Command::new(&program);
        command
            .arg(MAKE_TARGET)
            .arg(toolchain_arg)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        debug!(program=?program, workspace=?workspace, "spawning toolchain");

        command.spawn().map_err(toolchain_error)
    }
}

fn push_line(output: &mut Vec<u8>, line: Vec<u8>) {
    output.extend_from_slice(&line);
    output.push(b'\n');
}

/// SIGKILLs the process group led by the toolchain process, taking down
/// everything it spawned.
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(err=%e, pid, "failed to kill process group"),
    }
}
