//! Dex splitting: grouping pre-dexed inputs into a primary dex plus
//! numbered secondary dex jars, bounded by the Dalvik linear-alloc budget.
//!
//! Bucketing is deterministic: inputs are ordered by their first contained
//! class name, primary-dex membership is decided by class-name patterns
//! (or an explicit classes file), and secondary buckets fill greedily up
//! to the hard limit. Secondary jars land in the APK at
//! `assets/secondary-program-dex-jars/secondary-<N>.dex.jar`, stored
//! uncompressed, with an adjacent `metadata.txt` naming each jar, its
//! SHA-1 and its first class.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use regex::RegexSet;
use zip::ZipArchive;

use kiln_hash::Sha1HashCode;
use kiln_target::BuildTarget;

use crate::build::step::{ExecutionContext, Step, StepOutcome};
use crate::errors::BuildError;

pub const SECONDARY_DEX_JAR_DIR: &str = "assets/secondary-program-dex-jars";
pub const SECONDARY_DEX_METADATA: &str = "metadata.txt";

/// Linear-alloc bookkeeping charged per class on top of its byte size.
const PER_CLASS_OVERHEAD: u64 = 112;

/// One pre-dexed input to bucketing.
#[derive(Debug, Clone)]
pub struct DexInput {
    pub owner: BuildTarget,
    pub dex_jar: PathBuf,
    pub linear_alloc: u64,
    /// Sorted names of the classes contained in the jar.
    pub classes: Vec<String>,
}

impl DexInput {
    pub fn first_class(&self) -> Option<&str> {
        self.classes.first().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct SplitDexBuckets {
    pub primary: Vec<DexInput>,
    pub secondary: Vec<Vec<DexInput>>,
}

impl SplitDexBuckets {
    /// The first class of secondary bucket `n`, recorded in metadata.txt
    /// so the runtime can binary-search which dex holds a class.
    pub fn secondary_first_class(&self, n: usize) -> Option<&str> {
        self.secondary.get(n).and_then(|bucket| {
            bucket.iter().filter_map(|input| input.first_class()).min()
        })
    }
}

/// Groups inputs into primary and secondary dexes.
pub fn bucket(
    mut inputs: Vec<DexInput>,
    linear_alloc_hard_limit: u64,
    primary_patterns: &RegexSet,
    primary_classes: Option<&HashSet<String>>,
) -> Result<SplitDexBuckets, BuildError> {
    // Deterministic processing order: by first contained class, ties by
    // owner target.
    inputs.sort_by(|a, b| {
        let a_key = (a.first_class().unwrap_or(""), &a.owner);
        let b_key = (b.first_class().unwrap_or(""), &b.owner);
        a_key.cmp(&b_key)
    });

    let mut buckets = SplitDexBuckets::default();
    let mut current: Vec<DexInput> = vec![];
    let mut current_weight: u64 = 0;

    for input in inputs {
        if input.linear_alloc > linear_alloc_hard_limit {
            return Err(BuildError::UserInput(format!(
                "{} requires {} bytes of linear alloc, more than the hard limit of {}",
                input.owner, input.linear_alloc, linear_alloc_hard_limit
            )));
        }

        let is_primary = input.classes.iter().any(|class| {
            primary_patterns.is_match(class)
                || primary_classes.map_or(false, |set| set.contains(class))
        });
        if is_primary {
            buckets.primary.push(input);
            continue;
        }

        if current_weight + input.linear_alloc > linear_alloc_hard_limit
            && !current.is_empty()
        {
            buckets.secondary.push(std::mem::take(&mut current));
            current_weight = 0;
        }
        current_weight += input.linear_alloc;
        current.push(input);
    }
    if !current.is_empty() {
        buckets.secondary.push(current);
    }
    Ok(buckets)
}

/// Lists the classes contained in a dex jar, sorted.
pub fn classes_in_jar(jar: &Path) -> io::Result<Vec<String>> {
    let mut archive = ZipArchive::new(File::open(jar)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut classes = vec![];
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if let Some(stripped) = entry.name().strip_suffix(".class") {
            classes.push(stripped.replace('/', "."));
        }
    }
    classes.sort();
    Ok(classes)
}

/// Estimates the Dalvik linear-alloc footprint of a dexable input: per
/// class, its byte size plus a fixed bookkeeping overhead. A plain file
/// (already a `.dex`) is charged its whole size.
pub fn estimate_linear_alloc(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    match ZipArchive::new(file) {
        Ok(mut archive) => {
            let mut total = 0;
            for i in 0..archive.len() {
                let entry = archive
                    .by_index(i)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                if entry.name().ends_with(".class") || entry.name().ends_with(".dex") {
                    total += entry.size() + PER_CLASS_OVERHEAD;
                }
            }
            Ok(total)
        }
        Err(_) => Ok(std::fs::metadata(path)?.len()),
    }
}

/// Writes `metadata.txt` next to the secondary dex jars: one line per
/// jar, `<filename> <sha1> <first_class_in_dex>`, in numeric order.
pub struct SecondaryDexMetadataStep {
    /// `(project-relative jar, first class)` in numeric order of `<N>`.
    entries: Vec<(PathBuf, String)>,
    output: PathBuf,
}

impl SecondaryDexMetadataStep {
    pub fn new(entries: Vec<(PathBuf, String)>, output: PathBuf) -> SecondaryDexMetadataStep {
        SecondaryDexMetadataStep { entries, output }
    }
}

impl Step for SecondaryDexMetadataStep {
    fn short_name(&self) -> &str {
        "secondary_dex_metadata"
    }

    fn description(&self) -> String {
        format!("write {} ({} secondary dexes)", self.output.display(), self.entries.len())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let result = (|| -> io::Result<()> {
            let mut lines = String::new();
            for (jar, first_class) in &self.entries {
                let mut file = File::open(ctx.project.resolve(jar))?;
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                let sha1 = Sha1HashCode::of_bytes(&bytes);
                let file_name = jar
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                lines.push_str(&format!("{} {} {}\n", file_name, sha1.to_hex(), first_class));
            }
            let full = ctx.project.resolve(&self.output);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(full, lines)
        })();
        match result {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::failure(1, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(owner: &str, first_class: &str, linear_alloc: u64) -> DexInput {
        DexInput {
            owner: BuildTarget::parse(owner).unwrap(),
            dex_jar: PathBuf::from(format!("{}.dex.jar", first_class)),
            linear_alloc,
            classes: vec![first_class.to_owned()],
        }
    }

    fn no_patterns() -> RegexSet {
        RegexSet::new(Vec::<&str>::new()).unwrap()
    }

    #[test]
    fn greedy_bucketing_respects_the_hard_limit() {
        let buckets = bucket(
            vec![
                input("//a:a", "com.a.A", 60),
                input("//b:b", "com.b.B", 50),
                input("//c:c", "com.c.C", 60),
            ],
            100,
            &no_patterns(),
            None,
        )
        .unwrap();
        assert!(buckets.primary.is_empty());
        // Sorted by class: A(60), B(50), C(60) -> [A], [B], wait: A=60,
        // B pushes the bucket to 110 > 100 so B starts bucket 2, C joins
        // nothing (50+60=110 > 100) and starts bucket 3.
        assert_eq!(buckets.secondary.len(), 3);
        assert_eq!(buckets.secondary_first_class(0), Some("com.a.A"));
        assert_eq!(buckets.secondary_first_class(1), Some("com.b.B"));
        assert_eq!(buckets.secondary_first_class(2), Some("com.c.C"));
    }

    #[test]
    fn small_inputs_share_a_bucket() {
        let buckets = bucket(
            vec![input("//a:a", "com.a.A", 30), input("//b:b", "com.b.B", 30)],
            100,
            &no_patterns(),
            None,
        )
        .unwrap();
        assert_eq!(buckets.secondary.len(), 1);
        assert_eq!(buckets.secondary[0].len(), 2);
    }

    #[test]
    fn primary_patterns_override_bucket_assignment() {
        let patterns = RegexSet::new(&["^com\\.app\\."]).unwrap();
        let buckets = bucket(
            vec![input("//app:main", "com.app.Main", 30), input("//lib:b", "com.b.B", 30)],
            100,
            &patterns,
            None,
        )
        .unwrap();
        assert_eq!(buckets.primary.len(), 1);
        assert_eq!(buckets.primary[0].owner, BuildTarget::parse("//app:main").unwrap());
        assert_eq!(buckets.secondary.len(), 1);
    }

    #[test]
    fn explicit_primary_classes_file_overrides_too() {
        let mut classes = HashSet::new();
        classes.insert("com.b.B".to_owned());
        let buckets = bucket(
            vec![input("//a:a", "com.a.A", 30), input("//b:b", "com.b.B", 30)],
            100,
            &no_patterns(),
            Some(&classes),
        )
        .unwrap();
        assert_eq!(buckets.primary.len(), 1);
        assert_eq!(buckets.primary[0].owner, BuildTarget::parse("//b:b").unwrap());
    }

    #[test]
    fn oversized_input_is_a_user_error() {
        let err = bucket(vec![input("//a:a", "com.a.A", 200)], 100, &no_patterns(), None)
            .unwrap_err();
        assert!(err.user_message().contains("linear alloc"));
    }

    #[test]
    fn bucketing_is_deterministic_across_input_order() {
        let a = vec![
            input("//a:a", "com.a.A", 40),
            input("//b:b", "com.b.B", 40),
            input("//c:c", "com.c.C", 40),
        ];
        let mut b = a.clone();
        b.reverse();
        let first = bucket(a, 100, &no_patterns(), None).unwrap();
        let second = bucket(b, 100, &no_patterns(), None).unwrap();
        assert_eq!(first.secondary.len(), second.secondary.len());
        for (x, y) in first.secondary.iter().zip(second.secondary.iter()) {
            let xs: Vec<_> = x.iter().map(|i| i.owner.clone()).collect();
            let ys: Vec<_> = y.iter().map(|i| i.owner.clone()).collect();
            assert_eq!(xs, ys);
        }
    }
}
