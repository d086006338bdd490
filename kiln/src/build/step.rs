//! Build steps: the single side-effecting units of work a rule's buildable
//! yields.
//!
//! A step has a short name for reporting, a description (for shell steps,
//! the command line it runs), and an integer exit code. Steps of one rule
//! run strictly sequentially; the runner stops at the first non-zero code.
//! External tools (javac, dx, aapt, ...) are invoked through [`ShellStep`];
//! everything kiln can do itself is a native step so that builds do not
//! depend on a shell.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use log::debug;
use walkdir::WalkDir;
use xz2::write::XzEncoder;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::project::ProjectFilesystem;

/// Ambient state for step execution. Steps resolve their project-relative
/// paths through the filesystem handle.
pub struct ExecutionContext {
    pub project: Arc<ProjectFilesystem>,
    pub verbose: bool,
}

/// The result of running one step. Any non-zero exit code fails the
/// owning rule; native steps fold I/O errors into code 1 with the error
/// text as stderr.
#[derive(Debug)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub stderr: String,
}

impl StepOutcome {
    pub fn success() -> StepOutcome {
        StepOutcome { exit_code: 0, stderr: String::new() }
    }

    pub fn failure(exit_code: i32, stderr: String) -> StepOutcome {
        StepOutcome { exit_code, stderr }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

fn outcome_of(result: io::Result<()>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::success(),
        Err(e) => StepOutcome::failure(1, e.to_string()),
    }
}

pub trait Step: Send + Sync {
    fn short_name(&self) -> &str;
    fn description(&self) -> String;
    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome;
}

/// Runs an external command from the project root, capturing stderr.
pub struct ShellStep {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ShellStep {
    pub fn new(name: &str, program: &Path, args: Vec<String>) -> ShellStep {
        ShellStep { name: name.to_owned(), program: program.to_path_buf(), args, env: vec![] }
    }

    pub fn with_env(mut self, key: &str, value: String) -> ShellStep {
        self.env.push((key.to_owned(), value));
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Step for ShellStep {
    fn short_name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        debug!("running: {}", self.description());
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(ctx.project.root());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        match command.output() {
            Ok(output) => StepOutcome {
                exit_code: output.status.code().unwrap_or(1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => StepOutcome::failure(
                1,
                format!("failed to spawn {}: {}", self.program.display(), e),
            ),
        }
    }
}

pub struct MkdirStep {
    path: PathBuf,
}

impl MkdirStep {
    pub fn new(path: PathBuf) -> MkdirStep {
        MkdirStep { path }
    }
}

impl Step for MkdirStep {
    fn short_name(&self) -> &str {
        "mkdir"
    }

    fn description(&self) -> String {
        format!("mkdir -p {}", self.path.display())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        outcome_of(fs::create_dir_all(ctx.project.resolve(&self.path)))
    }
}

/// Removes a file or directory tree; a missing path is not an error.
pub struct RemovePathStep {
    path: PathBuf,
}

impl RemovePathStep {
    pub fn new(path: PathBuf) -> RemovePathStep {
        RemovePathStep { path }
    }
}

impl Step for RemovePathStep {
    fn short_name(&self) -> &str {
        "rm"
    }

    fn description(&self) -> String {
        format!("rm -rf {}", self.path.display())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let full = ctx.project.resolve(&self.path);
        let result = if full.is_dir() {
            fs::remove_dir_all(&full)
        } else {
            match fs::remove_file(&full) {
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        outcome_of(result)
    }
}

pub struct WriteFileStep {
    dest: PathBuf,
    contents: Vec<u8>,
}

impl WriteFileStep {
    pub fn new(dest: PathBuf, contents: Vec<u8>) -> WriteFileStep {
        WriteFileStep { dest, contents }
    }
}

impl Step for WriteFileStep {
    fn short_name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> String {
        format!("write {} ({} bytes)", self.dest.display(), self.contents.len())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let full = ctx.project.resolve(&self.dest);
        let result = (|| -> io::Result<()> {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, &self.contents)
        })();
        outcome_of(result)
    }
}

pub struct CopyStep {
    src: PathBuf,
    dest: PathBuf,
}

impl CopyStep {
    pub fn new(src: PathBuf, dest: PathBuf) -> CopyStep {
        CopyStep { src, dest }
    }
}

impl Step for CopyStep {
    fn short_name(&self) -> &str {
        "cp"
    }

    fn description(&self) -> String {
        format!("cp {} {}", self.src.display(), self.dest.display())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let src = ctx.project.resolve(&self.src);
        let dest = ctx.project.resolve(&self.dest);
        let result = (|| -> io::Result<()> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest).map(|_| ())
        })();
        outcome_of(result)
    }
}

/// Materializes a tree of symlinks, e.g. a C++ header symlink tree mapping
/// include names onto source headers.
pub struct SymlinkTreeStep {
    root: PathBuf,
    links: Vec<(PathBuf, PathBuf)>,
}

impl SymlinkTreeStep {
    /// `links` maps link names under `root` to project-relative targets.
    pub fn new(root: PathBuf, links: Vec<(PathBuf, PathBuf)>) -> SymlinkTreeStep {
        SymlinkTreeStep { root, links }
    }
}

impl Step for SymlinkTreeStep {
    fn short_name(&self) -> &str {
        "symlink_tree"
    }

    fn description(&self) -> String {
        format!("link {} entries under {}", self.links.len(), self.root.display())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let result = (|| -> io::Result<()> {
            for (link, target) in &self.links {
                let link_path = ctx.project.resolve(&self.root.join(link));
                if let Some(parent) = link_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                if link_path.exists() {
                    fs::remove_file(&link_path)?;
                }
                let target_path = ctx.project.resolve(target);
                make_link(&target_path, &link_path)?;
            }
            Ok(())
        })();
        outcome_of(result)
    }
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    fs::copy(target, link).map(|_| ())
}

/// Archives a directory into a zip (a jar, when the directory holds
/// classes). Entries are written in sorted order with fixed timestamps so
/// the output is byte-stable for identical inputs.
pub struct ZipDirectoryStep {
    name: String,
    src_dir: PathBuf,
    dest: PathBuf,
    stored: bool,
}

impl ZipDirectoryStep {
    pub fn jar(src_dir: PathBuf, dest: PathBuf) -> ZipDirectoryStep {
        ZipDirectoryStep { name: "jar".to_owned(), src_dir, dest, stored: false }
    }

    pub fn stored(src_dir: PathBuf, dest: PathBuf) -> ZipDirectoryStep {
        ZipDirectoryStep { name: "zip".to_owned(), src_dir, dest, stored: true }
    }
}

impl Step for ZipDirectoryStep {
    fn short_name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("zip {} -> {}", self.src_dir.display(), self.dest.display())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let src = ctx.project.resolve(&self.src_dir);
        let dest = ctx.project.resolve(&self.dest);
        let stored = self.stored;
        let result = (move || -> Result<(), ZipOrIoError> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let method = if stored {
                CompressionMethod::Stored
            } else {
                CompressionMethod::Deflated
            };
            let options = FileOptions::default().compression_method(method);

            let mut entries: Vec<PathBuf> = WalkDir::new(&src)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().to_path_buf())
                .collect();
            entries.sort();

            let mut writer = ZipWriter::new(File::create(&dest)?);
            for path in entries {
                let name = path
                    .strip_prefix(&src)
                    .expect("walkdir yields paths under its root")
                    .to_string_lossy()
                    .replace('\\', "/");
                writer.start_file(name, options)?;
                let mut file = File::open(&path)?;
                io::copy(&mut file, &mut writer)?;
            }
            writer.finish()?;
            Ok(())
        })();
        outcome_of(flatten_zip(result))
    }
}

/// Rewrites a zip's entries with a different compression method. Used to
/// repack dex jars as `STORED` before distribution: stored entries can be
/// mmapped directly by old Android releases.
pub struct RepackZipStep {
    src: PathBuf,
    dest: PathBuf,
}

impl RepackZipStep {
    pub fn stored(src: PathBuf, dest: PathBuf) -> RepackZipStep {
        RepackZipStep { src, dest }
    }
}

impl Step for RepackZipStep {
    fn short_name(&self) -> &str {
        "repack"
    }

    fn description(&self) -> String {
        format!("repack {} -> {} (stored)", self.src.display(), self.dest.display())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let src = ctx.project.resolve(&self.src);
        let dest = ctx.project.resolve(&self.dest);
        let result = (move || -> Result<(), ZipOrIoError> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut archive = ZipArchive::new(File::open(&src)?)?;
            let mut writer = ZipWriter::new(File::create(&dest)?);
            let options =
                FileOptions::default().compression_method(CompressionMethod::Stored);
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i)?;
                if entry.is_dir() {
                    continue;
                }
                let name = entry.name().to_owned();
                writer.start_file(name, options)?;
                let mut contents = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut contents)?;
                writer.write_all(&contents)?;
            }
            writer.finish()?;
            Ok(())
        })();
        outcome_of(flatten_zip(result))
    }
}

/// Compresses a file with xz, producing `<dest>`.
pub struct XzStep {
    src: PathBuf,
    dest: PathBuf,
}

impl XzStep {
    pub fn new(src: PathBuf, dest: PathBuf) -> XzStep {
        XzStep { src, dest }
    }
}

impl Step for XzStep {
    fn short_name(&self) -> &str {
        "xz"
    }

    fn description(&self) -> String {
        format!("xz {} -> {}", self.src.display(), self.dest.display())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let src = ctx.project.resolve(&self.src);
        let dest = ctx.project.resolve(&self.dest);
        let result = (move || -> io::Result<()> {
            let mut input = File::open(&src)?;
            let mut encoder = XzEncoder::new(File::create(&dest)?, 6);
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
            Ok(())
        })();
        outcome_of(result)
    }
}

fn flatten_zip(result: Result<(), ZipOrIoError>) -> io::Result<()> {
    result.map_err(|e| match e {
        ZipOrIoError::Io(e) => e,
        ZipOrIoError::Zip(e) => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
    })
}

enum ZipOrIoError {
    Io(io::Error),
    Zip(zip::result::ZipError),
}

impl From<io::Error> for ZipOrIoError {
    fn from(e: io::Error) -> Self {
        ZipOrIoError::Io(e)
    }
}

impl From<zip::result::ZipError> for ZipOrIoError {
    fn from(e: zip::result::ZipError) -> Self {
        ZipOrIoError::Zip(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &Path) -> ExecutionContext {
        ExecutionContext { project: Arc::new(ProjectFilesystem::new(dir)), verbose: false }
    }

    #[test]
    fn write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let write = WriteFileStep::new(PathBuf::from("out/gen/a.txt"), b"hello".to_vec());
        assert!(write.execute(&ctx).is_success());
        assert_eq!(fs::read(dir.path().join("out/gen/a.txt")).unwrap(), b"hello");

        let rm = RemovePathStep::new(PathBuf::from("out"));
        assert!(rm.execute(&ctx).is_success());
        assert!(!dir.path().join("out").exists());
        // Removing again is fine.
        assert!(rm.execute(&ctx).is_success());
    }

    #[test]
    fn shell_step_captures_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let ok = ShellStep::new("true", Path::new("true"), vec![]);
        assert_eq!(ok.execute(&ctx).exit_code, 0);
        let fail = ShellStep::new("false", Path::new("false"), vec![]);
        assert_eq!(fail.execute(&ctx).exit_code, 1);
        let missing = ShellStep::new("nope", Path::new("/nonexistent/tool"), vec![]);
        let outcome = missing.execute(&ctx);
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.stderr.contains("failed to spawn"));
    }

    #[test]
    fn zip_directory_is_deterministic_and_repack_stores() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("classes/com")).unwrap();
        fs::write(dir.path().join("classes/com/B.class"), b"bee").unwrap();
        fs::write(dir.path().join("classes/com/A.class"), b"ayy").unwrap();
        let ctx = ctx(dir.path());

        let step = ZipDirectoryStep::jar(PathBuf::from("classes"), PathBuf::from("out/a.jar"));
        assert!(step.execute(&ctx).is_success());
        let first = fs::read(dir.path().join("out/a.jar")).unwrap();
        assert!(step.execute(&ctx).is_success());
        assert_eq!(first, fs::read(dir.path().join("out/a.jar")).unwrap());

        let repack =
            RepackZipStep::stored(PathBuf::from("out/a.jar"), PathBuf::from("out/a-stored.jar"));
        assert!(repack.execute(&ctx).is_success());

        let mut archive =
            ZipArchive::new(File::open(dir.path().join("out/a-stored.jar")).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        for i in 0..archive.len() {
            let entry = archive.by_index(i).unwrap();
            assert_eq!(entry.compression(), CompressionMethod::Stored);
        }
        // Entries come out sorted by name.
        let names: Vec<String> =
            (0..2).map(|i| archive.by_index(i).unwrap().name().to_owned()).collect();
        assert_eq!(names, vec!["com/A.class", "com/B.class"]);
    }

    #[test]
    fn xz_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data.jar"), vec![42u8; 4096]).unwrap();
        let ctx = ctx(dir.path());
        let step = XzStep::new(PathBuf::from("data.jar"), PathBuf::from("data.jar.xz"));
        assert!(step.execute(&ctx).is_success());

        let mut decoder =
            xz2::read::XzDecoder::new(File::open(dir.path().join("data.jar.xz")).unwrap());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![42u8; 4096]);
    }
}
