//! Packing and unpacking of cache artifacts as gzipped tarballs.
//!
//! Every archive carries a manifest entry recording the stored output paths
//! and the rule's string metadata. Unpacking stages the tree into a
//! temporary directory inside the project root first, so that a truncated
//! or corrupt archive never leaves partial outputs behind.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_derive::{Deserialize, Serialize};

use crate::CacheError;

const MANIFEST_ENTRY: &str = "__metadata__.json";

#[derive(Serialize, Deserialize)]
struct Manifest {
    metadata: HashMap<String, String>,
    paths: Vec<PathBuf>,
}

pub(crate) struct ArchivePayload {
    pub metadata: HashMap<String, String>,
    pub paths: Vec<PathBuf>,
}

pub(crate) fn pack(
    project_root: &Path,
    paths: &[PathBuf],
    metadata: &HashMap<String, String>,
) -> Result<Vec<u8>, CacheError> {
    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(gz);

    let manifest = Manifest { metadata: metadata.clone(), paths: paths.to_vec() };
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, MANIFEST_ENTRY, &manifest_bytes[..])?;

    for path in paths {
        let full = project_root.join(path);
        if full.is_dir() {
            builder.append_dir_all(path, &full)?;
        } else {
            builder.append_path_with_name(&full, path)?;
        }
    }

    let gz = builder.into_inner()?;
    Ok(gz.finish()?)
}

pub(crate) fn unpack<R: Read>(reader: R, project_root: &Path) -> Result<ArchivePayload, CacheError> {
    let staging = tempfile::Builder::new()
        .prefix(".kiln-fetch-")
        .tempdir_in(project_root)?;

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut manifest: Option<Manifest> = None;
    let mut staged_files: Vec<PathBuf> = vec![];

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path == Path::new(MANIFEST_ENTRY) {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            manifest = Some(serde_json::from_slice(&buf)?);
            continue;
        }
        if !entry.unpack_in(staging.path())? {
            return Err(CacheError::MalformedArchive(format!(
                "entry '{}' escapes the output tree",
                path.display()
            )));
        }
        if !entry.header().entry_type().is_dir() {
            staged_files.push(path);
        }
    }

    let manifest = manifest
        .ok_or_else(|| CacheError::MalformedArchive("missing manifest entry".to_owned()))?;

    // Everything is staged; move the files into place. If a move fails we
    // remove what was already placed so a partial fetch reads as a miss.
    let mut moved: Vec<PathBuf> = vec![];
    for path in &staged_files {
        let result = place(staging.path(), project_root, path);
        if let Err(e) = result {
            for placed in &moved {
                let _ = fs::remove_file(project_root.join(placed));
            }
            return Err(e);
        }
        moved.push(path.clone());
    }

    Ok(ArchivePayload { metadata: manifest.metadata, paths: manifest.paths })
}

fn place(staging: &Path, project_root: &Path, path: &Path) -> Result<(), CacheError> {
    let dest = project_root.join(path);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if dest.exists() {
        let _ = fs::remove_file(&dest);
    }
    fs::rename(staging.join(path), &dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_preserves_bytes_and_metadata() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("buck-out/gen/app")).unwrap();
        fs::write(src.path().join("buck-out/gen/app/app.jar"), b"\x50\x4b jar bytes").unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("linearalloc".to_owned(), "2048".to_owned());

        let paths = vec![PathBuf::from("buck-out/gen/app/app.jar")];
        let archive = pack(src.path(), &paths, &metadata).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let payload = unpack(Cursor::new(archive), dest.path()).unwrap();
        assert_eq!(payload.metadata, metadata);
        assert_eq!(payload.paths, paths);
        assert_eq!(
            fs::read(dest.path().join("buck-out/gen/app/app.jar")).unwrap(),
            b"\x50\x4b jar bytes"
        );
    }

    #[test]
    fn directories_are_archived_recursively() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("out/classes/com")).unwrap();
        fs::write(src.path().join("out/classes/com/A.class"), b"a").unwrap();
        fs::write(src.path().join("out/classes/com/B.class"), b"b").unwrap();

        let archive =
            pack(src.path(), &[PathBuf::from("out/classes")], &HashMap::new()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack(Cursor::new(archive), dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("out/classes/com/A.class")).unwrap(), b"a");
        assert_eq!(fs::read(dest.path().join("out/classes/com/B.class")).unwrap(), b"b");
    }

    #[test]
    fn truncated_archive_is_an_error_and_leaves_nothing() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("big.txt"), vec![7u8; 64 * 1024]).unwrap();
        let archive =
            pack(src.path(), &[PathBuf::from("big.txt")], &HashMap::new()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let truncated = &archive[..archive.len() / 2];
        assert!(unpack(Cursor::new(truncated.to_vec()), dest.path()).is_err());
        assert!(!dest.path().join("big.txt").exists());
        // The staging directory is cleaned up as well.
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }
}
