//! The trusted directory holding build recipes (makefiles).
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::{
    sandbox::{clean_relative_path, ensure_contained},
    CompileFile, Error,
};

/// Name the recipe is installed as inside the workspace.
pub const RECIPE_FILE_NAME: &str = "Makefile";

/// Recipes picked when a request doesn't name one, keyed by the extension of
/// the first file that has one of them.
const RECIPES_BY_EXTENSION: &[(&str, &str)] = &[
    ("c", "avr-gcc"),
    ("h", "avr-gcc"),
    ("cpp", "arduino"),
    ("logic", "elws"),
    ("vhd", "vhdl"),
];

#[derive(Debug, Clone)]
pub struct RecipeStore {
    dir: PathBuf,
}

impl RecipeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolves a client-supplied recipe name to a file inside the recipe
    /// directory. Names are subject to the same containment rules as files
    /// written into a workspace.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, Error> {
        let relative = clean_relative_path(name)?;

        let root = self.dir.canonicalize().map_err(|e| {
            warn!(err=%e, recipe_dir=?self.dir, "unable to open recipe directory");
            Error::RecipeNotFound(name.to_string())
        })?;

        let candidate = root.join(relative);
        if std::fs::symlink_metadata(&candidate).is_err() {
            return Err(Error::RecipeNotFound(name.to_string()));
        }

        let path = ensure_contained(&root, &candidate, name)?;
        if !path.is_file() {
            return Err(Error::RecipeNotFound(name.to_string()));
        }

        Ok(path)
    }

    /// Copies the named recipe into the workspace, as [RECIPE_FILE_NAME].
    #[instrument(skip(self), err)]
    pub fn install(&self, name: &str, workspace: &Path) -> Result<PathBuf, Error> {
        let source = self.resolve(name)?;
        let destination = workspace.join(RECIPE_FILE_NAME);

        debug!(source=?source, destination=?destination, "installing recipe");
        std::fs::copy(&source, &destination)?;

        Ok(destination)
    }
}

/// Picks a recipe based on the extension of the first file having a known one.
pub fn infer_recipe(files: &[CompileFile]) -> Option<&'static str> {
    files.iter().filter(|f| !f.is_directory()).find_map(|f| {
        let extension = Path::new(&f.name).extension()?.to_str()?;
        RECIPES_BY_EXTENSION
            .iter()
            .find(|(ext, _)| *ext == extension)
            .map(|(_, recipe)| *recipe)
    })
}
