//! Resolution of client-supplied names inside a directory, and writing the
//! submitted files into a workspace.
//!
//! Every name is first checked lexically, then resolved component by
//! component below the canonical root. Existing components are canonicalized
//! (resolving symlinks) and compared against the canonical root, so neither
//! `..`, absolute paths nor symlinks can point a write outside of it.
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::{CompileFile, Error};

/// Checks `name` is a relative path without any `..`, root or prefix
/// components, and returns it with all `.` components removed.
pub fn clean_relative_path(name: &str) -> Result<PathBuf, Error> {
    let mut clean = PathBuf::new();

    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(name.to_string()));
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(Error::PathTraversal(name.to_string()));
    }

    Ok(clean)
}

/// Canonicalizes `path` and ensures it is located below `root`, which needs
/// to be canonical already.
/// Paths that can't be canonicalized (dangling symlinks, loops) are rejected
/// as well.
pub fn ensure_contained(root: &Path, path: &Path, name: &str) -> Result<PathBuf, Error> {
    let canonical = path.canonicalize().map_err(|e| {
        warn!(err=%e, path=?path, "unable to canonicalize path");
        Error::PathTraversal(name.to_string())
    })?;

    // Path::starts_with compares whole components, so /tmp/ws-a is not
    // considered to be inside /tmp/ws.
    if !canonical.starts_with(root) {
        warn!(path=?path, resolved=?canonical, root=?root, "path resolves outside of root");
        return Err(Error::PathTraversal(name.to_string()));
    }

    Ok(canonical)
}

/// Resolves `name` below the canonical `root`, creating all missing parent
/// directories on the way.
/// The returned path is not guaranteed to exist. If it does exist and is a
/// symlink, its target is inside `root`.
pub fn resolve_in_workspace(root: &Path, name: &str) -> Result<PathBuf, Error> {
    let relative = clean_relative_path(name)?;

    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component);

        if components.peek().is_none() {
            break;
        }

        match std::fs::symlink_metadata(&current) {
            Ok(_) => current = ensure_contained(root, &current, name)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir(&current)?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    match std::fs::symlink_metadata(&current) {
        Ok(metadata) if metadata.file_type().is_symlink() => ensure_contained(root, &current, name),
        _ => Ok(current),
    }
}

/// Writes all files into the workspace at `root`, in order.
///
/// All names are validated before the first write, so a request containing
/// an invalid name leaves the workspace untouched. Existing files are
/// overwritten. Any failure aborts the remaining writes.
#[instrument(skip(files), fields(files.len = files.len()), err)]
pub fn write_files(files: &[CompileFile], root: &Path) -> Result<(), Error> {
    for file in files {
        clean_relative_path(&file.name)?;
    }

    for file in files {
        let path = resolve_in_workspace(root, &file.name)?;

        if file.is_directory() {
            debug!(path=?path, "creating directory");
            std::fs::create_dir_all(&path)?;
            continue;
        }

        debug!(path=?path, size=file.content.len(), "writing file");
        std::fs::write(&path, file.content.as_bytes())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use rstest::rstest;
    use tempfile::TempDir;

    use super::{clean_relative_path, resolve_in_workspace, write_files};
    use crate::{CompileFile, Error};

    fn canonical_tempdir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().canonicalize().unwrap();
        (dir, path)
    }

    #[rstest]
    #[case::simple("main.c", Some("main.c"))]
    #[case::nested("src/lib/util.c", Some("src/lib/util.c"))]
    #[case::curdir("./src/./main.c", Some("src/main.c"))]
    #[case::trailing_slash("src/", Some("src"))]
    #[case::dir_marker("src/.", Some("src"))]
    #[case::parent("../main.c", None)]
    #[case::parent_nested("src/../../etc/passwd", None)]
    #[case::parent_inside("src/../main.c", None)]
    #[case::absolute("/etc/passwd", None)]
    #[case::empty("", None)]
    #[case::only_curdir(".", None)]
    fn test_clean_relative_path(#[case] name: &str, #[case] expected: Option<&str>) {
        match expected {
            Some(exp) => assert_eq!(
                Path::new(exp),
                clean_relative_path(name).expect("must succeed")
            ),
            None => assert!(matches!(
                clean_relative_path(name),
                Err(Error::PathTraversal(_))
            )),
        }
    }

    #[test]
    fn writes_content_verbatim() {
        let (_dir, root) = canonical_tempdir();
        let content = "int main(){return 0;}\r\n// ünïcödé\n";

        write_files(
            &[
                CompileFile::new("main.c", content),
                CompileFile::new("lib/deep/util.h", "#pragma once"),
            ],
            &root,
        )
        .expect("must succeed");

        assert_eq!(
            content.as_bytes(),
            std::fs::read(root.join("main.c")).unwrap()
        );
        assert_eq!(
            "#pragma once",
            std::fs::read_to_string(root.join("lib/deep/util.h")).unwrap()
        );
    }

    #[test]
    fn overwrites_existing_files() {
        let (_dir, root) = canonical_tempdir();

        write_files(
            &[
                CompileFile::new("main.c", "first"),
                CompileFile::new("main.c", "second"),
            ],
            &root,
        )
        .expect("must succeed");

        assert_eq!("second", std::fs::read_to_string(root.join("main.c")).unwrap());
    }

    #[test]
    fn creates_directory_entries() {
        let (_dir, root) = canonical_tempdir();

        write_files(&[CompileFile::new("sketch/.", "")], &root).expect("must succeed");

        assert!(root.join("sketch").is_dir());
    }

    #[rstest]
    #[case::parent("../../etc/passwd")]
    #[case::absolute("/tmp/evil")]
    fn rejects_traversal_and_writes_nothing(#[case] name: &str) {
        let (_dir, root) = canonical_tempdir();

        let err = write_files(
            &[
                CompileFile::new("main.c", "ok"),
                CompileFile::new(name, "x"),
            ],
            &root,
        )
        .expect_err("must fail");

        assert!(matches!(err, Error::PathTraversal(_)));
        assert_eq!(0, std::fs::read_dir(&root).unwrap().count());
    }

    #[test]
    fn rejects_symlinked_directory_escape() {
        let (_outside_dir, outside) = canonical_tempdir();
        let (_dir, root) = canonical_tempdir();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let err = write_files(&[CompileFile::new("link/evil.c", "x")], &root)
            .expect_err("must fail");

        assert!(matches!(err, Error::PathTraversal(_)));
        assert_eq!(0, std::fs::read_dir(&outside).unwrap().count());
    }

    #[test]
    fn rejects_symlinked_file_escape() {
        let (_outside_dir, outside) = canonical_tempdir();
        let target = outside.join("passwd");
        std::fs::write(&target, "original").unwrap();

        let (_dir, root) = canonical_tempdir();
        std::os::unix::fs::symlink(&target, root.join("main.c")).unwrap();

        let err =
            write_files(&[CompileFile::new("main.c", "x")], &root).expect_err("must fail");

        assert!(matches!(err, Error::PathTraversal(_)));
        assert_eq!("original", std::fs::read_to_string(&target).unwrap());
    }

    #[test]
    fn allows_symlinks_staying_inside() {
        let (_dir, root) = canonical_tempdir();
        std::fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

        let path = resolve_in_workspace(&root, "alias/main.c").expect("must succeed");

        assert_eq!(root.join("real/main.c"), path);
    }

    #[test]
    fn sibling_with_common_prefix_is_outside() {
        let (_parent_dir, parent) = canonical_tempdir();
        let root = parent.join("ws");
        let sibling = parent.join("ws-other");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&sibling).unwrap();
        std::os::unix::fs::symlink(&sibling, root.join("link")).unwrap();

        assert!(matches!(
            resolve_in_workspace(&root, "link/main.c"),
            Err(Error::PathTraversal(_))
        ));
    }
}
