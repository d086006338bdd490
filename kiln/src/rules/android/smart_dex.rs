//! Smart dexing: skip re-running `dx` when the inputs to a dex output are
//! unchanged.
//!
//! Each `(inputs -> dex output)` pair gets a combined hash of its input
//! contents, persisted in a sidecar `<output>.hash`. When the sidecar
//! matches the freshly computed hash, no `dx` step is emitted at all.
//! Output shapes are recognized by extension: `.dex`, `.dex.jar`, and
//! `.dex.jar.xz`, where the `.xz` case expands into the composite
//! sequence dx, repack (stored), remove the raw jar, xz.

use std::io;
use std::path::{Path, PathBuf};

use kiln_hash::Sha1HashCode;

use crate::build::step::{
    RemovePathStep, RepackZipStep, ShellStep, Step, WriteFileStep, XzStep,
};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexOutputShape {
    Dex,
    DexJar,
    DexJarXz,
}

impl DexOutputShape {
    pub fn of(output: &Path) -> DexOutputShape {
        let name = output.to_string_lossy();
        if name.ends_with(".dex.jar.xz") {
            DexOutputShape::DexJarXz
        } else if name.ends_with(".dex.jar") {
            DexOutputShape::DexJar
        } else {
            DexOutputShape::Dex
        }
    }
}

/// The hash of all input contents, order-independent (inputs are sorted
/// by path before hashing).
pub fn combined_input_hash(
    project_root: &Path,
    inputs: &[PathBuf],
) -> io::Result<Sha1HashCode> {
    let mut sorted: Vec<&PathBuf> = inputs.iter().collect();
    sorted.sort();
    let mut bytes = Vec::new();
    for input in sorted {
        bytes.extend_from_slice(input.to_string_lossy().as_bytes());
        bytes.push(0);
        let contents = std::fs::read(project_root.join(input))?;
        bytes.extend_from_slice(Sha1HashCode::of_bytes(&contents).as_bytes());
        bytes.push(0);
    }
    Ok(Sha1HashCode::of_bytes(&bytes))
}

pub fn hash_sidecar_path(output: &Path) -> PathBuf {
    PathBuf::from(format!("{}.hash", output.display()))
}

/// The `dx` invocation contract.
pub fn dx_step(config: &Config, output: &Path, inputs: &[PathBuf]) -> ShellStep {
    let mut args = vec![
        "--dex".to_owned(),
        format!("--output={}", output.display()),
    ];
    for input in inputs {
        args.push(input.to_string_lossy().into_owned());
    }
    ShellStep::new("dx", &config.tools.dx, args)
}

/// Emits the steps that produce `output` from `inputs`, or no steps at
/// all when the recorded sidecar hash matches the current inputs.
pub fn dex_steps(
    config: &Config,
    project_root: &Path,
    inputs: &[PathBuf],
    output: &Path,
    scratch_dir: &Path,
) -> io::Result<Vec<Box<dyn Step>>> {
    let combined = combined_input_hash(project_root, inputs)?;
    let sidecar = hash_sidecar_path(output);

    let recorded = std::fs::read_to_string(project_root.join(&sidecar)).ok();
    if recorded.as_deref() == Some(combined.to_hex().as_str())
        && project_root.join(output).exists()
    {
        return Ok(vec![]);
    }

    let mut steps: Vec<Box<dyn Step>> = vec![];
    match DexOutputShape::of(output) {
        DexOutputShape::Dex | DexOutputShape::DexJar => {
            steps.push(Box::new(dx_step(config, output, inputs)));
        }
        DexOutputShape::DexJarXz => {
            let raw = scratch_dir.join("raw.dex.jar");
            let jar = {
                let name = output.to_string_lossy();
                PathBuf::from(name.trim_end_matches(".xz").to_owned())
            };
            steps.push(Box::new(dx_step(config, &raw, inputs)));
            steps.push(Box::new(RepackZipStep::stored(raw.clone(), jar.clone())));
            steps.push(Box::new(RemovePathStep::new(raw)));
            steps.push(Box::new(XzStep::new(jar, output.to_path_buf())));
        }
    }
    steps.push(Box::new(WriteFileStep::new(sidecar, combined.to_hex().into_bytes())));
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn shapes() {
        assert_eq!(DexOutputShape::of(Path::new("classes.dex")), DexOutputShape::Dex);
        assert_eq!(
            DexOutputShape::of(Path::new("secondary-1.dex.jar")),
            DexOutputShape::DexJar
        );
        assert_eq!(
            DexOutputShape::of(Path::new("secondary-1.dex.jar.xz")),
            DexOutputShape::DexJarXz
        );
    }

    #[test]
    fn matching_sidecar_skips_dx() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("input.jar"), b"jar bytes").unwrap();
        fs::write(dir.path().join("out.dex.jar"), b"dexed").unwrap();
        let inputs = vec![PathBuf::from("input.jar")];
        let output = PathBuf::from("out.dex.jar");

        let config = Config::default();
        // First planning pass emits dx plus the sidecar write.
        let steps =
            dex_steps(&config, dir.path(), &inputs, &output, Path::new("scratch")).unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.short_name()).collect();
        assert_eq!(names, vec!["dx", "write_file"]);

        // Record the sidecar as the dx run would have left it.
        let combined = combined_input_hash(dir.path(), &inputs).unwrap();
        fs::write(dir.path().join("out.dex.jar.hash"), combined.to_hex()).unwrap();
        let steps =
            dex_steps(&config, dir.path(), &inputs, &output, Path::new("scratch")).unwrap();
        assert!(steps.is_empty());

        // Touching the input invalidates the sidecar.
        fs::write(dir.path().join("input.jar"), b"different jar bytes").unwrap();
        let steps =
            dex_steps(&config, dir.path(), &inputs, &output, Path::new("scratch")).unwrap();
        assert!(!steps.is_empty());
    }

    #[test]
    fn xz_shape_expands_to_the_composite_sequence() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("input.jar"), b"jar bytes").unwrap();
        let config = Config::default();
        let steps = dex_steps(
            &config,
            dir.path(),
            &[PathBuf::from("input.jar")],
            Path::new("secondary-1.dex.jar.xz"),
            Path::new("scratch"),
        )
        .unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.short_name()).collect();
        assert_eq!(names, vec!["dx", "repack", "rm", "xz", "write_file"]);
    }
}
