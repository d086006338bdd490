//! The project filesystem: every path the engine reads or writes is
//! expressed relative to the project root, and all build outputs live under
//! `buck-out/`:
//!
//! - `buck-out/bin/<base>/<name>__/` - per-rule scratch space;
//! - `buck-out/gen/<base>/` - official outputs referenceable by other rules;
//! - `buck-out/annotation/<base>/__<name>_gen__/` - generated sources;
//! - `buck-out/bin/<base>/.<name>/METADATA` - per-rule sidecar metadata.
//!
//! Keeping paths project-relative is what makes cached artifacts portable
//! across checkouts. `clean` removes `buck-out` and nothing else.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::BuildError;

use kiln_target::BuildTarget;

pub const OUTPUT_DIR: &str = "buck-out";

#[derive(Debug, Clone)]
pub struct ProjectFilesystem {
    root: PathBuf,
}

impl ProjectFilesystem {
    pub fn new<P: Into<PathBuf>>(root: P) -> ProjectFilesystem {
        ProjectFilesystem { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a project-relative path to an absolute one.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Scratch directory for intermediate files of a rule.
    pub fn scratch_dir(&self, target: &BuildTarget) -> PathBuf {
        under(&[OUTPUT_DIR, "bin"], target.base_path())
            .join(format!("{}__", target.flavored_name()))
    }

    /// Directory holding a rule's official outputs.
    pub fn gen_dir(&self, target: &BuildTarget) -> PathBuf {
        under(&[OUTPUT_DIR, "gen"], target.base_path())
    }

    pub fn gen_path(&self, target: &BuildTarget, file_name: &str) -> PathBuf {
        self.gen_dir(target).join(file_name)
    }

    /// Output directory for annotation-processor style generated sources.
    pub fn annotation_dir(&self, target: &BuildTarget) -> PathBuf {
        under(&[OUTPUT_DIR, "annotation"], target.base_path())
            .join(format!("__{}_gen__", target.flavored_name()))
    }

    /// The sidecar metadata file recording a rule's key, outputs and
    /// recorded metadata from its last successful build.
    pub fn metadata_path(&self, target: &BuildTarget) -> PathBuf {
        under(&[OUTPUT_DIR, "bin"], target.base_path())
            .join(format!(".{}", target.flavored_name()))
            .join("METADATA")
    }

    pub fn create_dirs(&self, relative: &Path) -> Result<(), BuildError> {
        fs::create_dir_all(self.resolve(relative))
            .map_err(|e| BuildError::file_system(relative, e))
    }

    pub fn write_file(&self, relative: &Path, contents: &[u8]) -> Result<(), BuildError> {
        if let Some(parent) = relative.parent() {
            self.create_dirs(parent)?;
        }
        fs::write(self.resolve(relative), contents)
            .map_err(|e| BuildError::file_system(relative, e))
    }

    pub fn read_file(&self, relative: &Path) -> Result<Vec<u8>, BuildError> {
        fs::read(self.resolve(relative)).map_err(|e| BuildError::file_system(relative, e))
    }

    pub fn exists(&self, relative: &Path) -> bool {
        self.resolve(relative).exists()
    }

    /// Deletes all build outputs. Only `buck-out` is touched.
    pub fn clean(&self) -> Result<(), BuildError> {
        let out = self.root.join(OUTPUT_DIR);
        match fs::remove_dir_all(&out) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::file_system(PathBuf::from(OUTPUT_DIR), e)),
        }
    }
}

fn under(dirs: &[&str], base_path: &str) -> PathBuf {
    let mut path = PathBuf::new();
    for dir in dirs {
        path.push(dir);
    }
    if !base_path.is_empty() {
        path.push(base_path);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(s: &str) -> BuildTarget {
        BuildTarget::parse(s).unwrap()
    }

    #[test]
    fn layout() {
        let fs = ProjectFilesystem::new("/repo");
        let t = target("//java/com/example:lib");
        assert_eq!(fs.scratch_dir(&t), PathBuf::from("buck-out/bin/java/com/example/lib__"));
        assert_eq!(
            fs.gen_path(&t, "lib.jar"),
            PathBuf::from("buck-out/gen/java/com/example/lib.jar")
        );
        assert_eq!(
            fs.annotation_dir(&t),
            PathBuf::from("buck-out/annotation/java/com/example/__lib_gen__")
        );
        assert_eq!(
            fs.metadata_path(&t),
            PathBuf::from("buck-out/bin/java/com/example/.lib/METADATA")
        );
    }

    #[test]
    fn flavored_rules_get_their_own_directories() {
        let fs = ProjectFilesystem::new("/repo");
        let t = target("//app:binary#dex");
        assert_eq!(fs.scratch_dir(&t), PathBuf::from("buck-out/bin/app/binary#dex__"));
        assert_ne!(fs.metadata_path(&t), fs.metadata_path(&t.unflavored()));
    }

    #[test]
    fn root_package_has_no_empty_segment() {
        let fs = ProjectFilesystem::new("/repo");
        let t = target("//:a");
        assert_eq!(fs.scratch_dir(&t), PathBuf::from("buck-out/bin/a__"));
    }

    #[test]
    fn clean_removes_only_buck_out() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("buck-out/gen")).unwrap();
        fs::write(dir.path().join("buck-out/gen/a.jar"), b"x").unwrap();
        fs::write(dir.path().join("A.java"), b"class A {}").unwrap();

        let project = ProjectFilesystem::new(dir.path());
        project.clean().unwrap();
        assert!(!dir.path().join("buck-out").exists());
        assert!(dir.path().join("A.java").exists());
        // Cleaning an already-clean tree is fine.
        project.clean().unwrap();
    }
}
