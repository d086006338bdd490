//! Per-project configuration, read once at startup from `.buckconfig` and
//! the environment and threaded as a single handle into the scheduler.
//!
//! `.buckconfig` is a small INI-style file:
//!
//! ```text
//! [build]
//!     threads = 4
//! [cache]
//!     dir = .kiln-cache
//!     http_url = http://cache.example.com/
//! [tools]
//!     javac = /opt/jdk/bin/javac
//! [cxx]
//!     default_platform = linux-x86_64
//! [test]
//!     use_results_cache = true
//! [alias]
//!     app = //apps/myapp:app
//! ```
//!
//! Tool locations can also be overridden through `KILN_<TOOL>` environment
//! variables (e.g. `KILN_DX`), which take precedence over the file. The
//! environment is consulted exactly once, when the config is loaded.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::trace;

use crate::errors::BuildError;

pub const CONFIG_FILE: &str = ".buckconfig";

/// External tool locations. Step implementations are external
/// collaborators; kiln only needs to know how to invoke them and how to
/// identify them inside rule keys.
#[derive(Debug, Clone)]
pub struct Tools {
    pub java: PathBuf,
    pub javac: PathBuf,
    pub dx: PathBuf,
    pub aapt: PathBuf,
    pub proguard: PathBuf,
    pub apkbuilder: PathBuf,
    pub zipalign: PathBuf,
    pub adb: PathBuf,
    pub cc: PathBuf,
    pub ar: PathBuf,
}

impl Default for Tools {
    fn default() -> Tools {
        Tools {
            java: PathBuf::from("java"),
            javac: PathBuf::from("javac"),
            dx: PathBuf::from("dx"),
            aapt: PathBuf::from("aapt"),
            proguard: PathBuf::from("proguard"),
            apkbuilder: PathBuf::from("apkbuilder"),
            zipalign: PathBuf::from("zipalign"),
            adb: PathBuf::from("adb"),
            cc: PathBuf::from("cc"),
            ar: PathBuf::from("ar"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Local archive directory, if a local cache is configured.
    pub dir: Option<PathBuf>,
    /// Remote HTTP cache base URL.
    pub http_url: Option<String>,
    pub http_timeout_secs: u64,
    /// A read-only cache is consulted but never written.
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub num_threads: usize,
    pub cache: CacheConfig,
    pub tools: Tools,
    pub default_cxx_platform: Option<String>,
    pub use_test_results_cache: bool,
    /// Raw alias table; aliases are resolved against the target graph by
    /// the command layer.
    pub aliases: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_threads: num_cpus::get(),
            cache: CacheConfig { http_timeout_secs: 10, ..CacheConfig::default() },
            tools: Tools::default(),
            default_cxx_platform: None,
            use_test_results_cache: true,
            aliases: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads `.buckconfig` from the project root if present, then applies
    /// environment overrides. Missing file means defaults.
    pub fn load(project_root: &Path) -> Result<Config, BuildError> {
        let mut config = Config::default();
        let path = project_root.join(CONFIG_FILE);
        if path.exists() {
            let text = fs::read_to_string(&path)
                .map_err(|e| BuildError::file_system(CONFIG_FILE, e))?;
            config.apply_ini(&parse_ini(&text))?;
        }
        config.apply_env(|name| env::var(name).ok());
        Ok(config)
    }

    fn apply_ini(&mut self, sections: &IniSections) -> Result<(), BuildError> {
        if let Some(value) = lookup(sections, "build", "threads") {
            self.num_threads = value.parse().map_err(|_| {
                BuildError::UserInput(format!("[build] threads must be a number, got '{}'", value))
            })?;
            if self.num_threads == 0 {
                return Err(BuildError::UserInput(
                    "[build] threads must be at least 1".to_owned(),
                ));
            }
        }

        if let Some(value) = lookup(sections, "cache", "dir") {
            self.cache.dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(sections, "cache", "http_url") {
            self.cache.http_url = Some(value.to_owned());
        }
        if let Some(value) = lookup(sections, "cache", "http_timeout_seconds") {
            self.cache.http_timeout_secs = value.parse().map_err(|_| {
                BuildError::UserInput(format!(
                    "[cache] http_timeout_seconds must be a number, got '{}'",
                    value
                ))
            })?;
        }
        if let Some(value) = lookup(sections, "cache", "mode") {
            self.cache.read_only = value == "readonly";
        }

        if let Some(v) = lookup(sections, "tools", "java") {
            self.tools.java = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "javac") {
            self.tools.javac = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "dx") {
            self.tools.dx = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "aapt") {
            self.tools.aapt = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "proguard") {
            self.tools.proguard = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "apkbuilder") {
            self.tools.apkbuilder = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "zipalign") {
            self.tools.zipalign = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "adb") {
            self.tools.adb = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "cc") {
            self.tools.cc = PathBuf::from(v);
        }
        if let Some(v) = lookup(sections, "tools", "ar") {
            self.tools.ar = PathBuf::from(v);
        }

        if let Some(v) = lookup(sections, "cxx", "default_platform") {
            self.default_cxx_platform = Some(v.to_owned());
        }
        if let Some(v) = lookup(sections, "test", "use_results_cache") {
            self.use_test_results_cache = v == "true" || v == "1";
        }

        if let Some(aliases) = sections.get("alias") {
            for (name, value) in aliases {
                self.aliases.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        for (name, slot) in vec![
            ("KILN_JAVA", &mut self.tools.java),
            ("KILN_JAVAC", &mut self.tools.javac),
            ("KILN_DX", &mut self.tools.dx),
            ("KILN_AAPT", &mut self.tools.aapt),
            ("KILN_PROGUARD", &mut self.tools.proguard),
            ("KILN_APKBUILDER", &mut self.tools.apkbuilder),
            ("KILN_ZIPALIGN", &mut self.tools.zipalign),
            ("KILN_ADB", &mut self.tools.adb),
            ("KILN_CC", &mut self.tools.cc),
            ("KILN_AR", &mut self.tools.ar),
        ] {
            if let Some(value) = get(name) {
                trace!("tool override from environment: {}={}", name, value);
                *slot = PathBuf::from(value);
            }
        }
    }

    /// The string identifying a tool inside rule keys. Changing the
    /// configured tool changes every key that uses it.
    pub fn tool_fingerprint(&self, tool: &Path) -> String {
        tool.to_string_lossy().into_owned()
    }
}

type IniSections = HashMap<String, Vec<(String, String)>>;

fn lookup<'a>(sections: &'a IniSections, section: &str, key: &str) -> Option<&'a str> {
    sections.get(section).and_then(|entries| {
        // Last assignment wins, as in the original.
        entries.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    })
}

fn parse_ini(text: &str) -> IniSections {
    let mut sections: IniSections = HashMap::new();
    let mut current = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current = line[1..line.len() - 1].trim().to_owned();
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim().to_owned();
            let value = line[eq + 1..].trim().to_owned();
            sections.entry(current.clone()).or_default().push((key, value));
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_aliases() {
        let sections = parse_ini(
            "# a comment\n\
             [build]\n  threads = 3\n\
             [cxx]\n  default_platform = linux-x86_64\n\
             [tools]\n  javac = /opt/jdk/bin/javac\n\
             [test]\n  use_results_cache = false\n\
             [alias]\n  app = //apps/myapp:app\n",
        );
        let mut config = Config::default();
        config.apply_ini(&sections).unwrap();
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.default_cxx_platform.as_deref(), Some("linux-x86_64"));
        assert_eq!(config.tools.javac, PathBuf::from("/opt/jdk/bin/javac"));
        assert!(!config.use_test_results_cache);
        assert_eq!(config.aliases.get("app").map(String::as_str), Some("//apps/myapp:app"));
    }

    #[test]
    fn last_assignment_wins() {
        let sections = parse_ini("[build]\nthreads = 2\nthreads = 5\n");
        let mut config = Config::default();
        config.apply_ini(&sections).unwrap();
        assert_eq!(config.num_threads, 5);
    }

    #[test]
    fn env_overrides_file() {
        let sections = parse_ini("[tools]\ndx = /sdk/dx\n");
        let mut config = Config::default();
        config.apply_ini(&sections).unwrap();
        config.apply_env(|name| {
            if name == "KILN_DX" {
                Some("/custom/dx".to_owned())
            } else {
                None
            }
        });
        assert_eq!(config.tools.dx, PathBuf::from("/custom/dx"));
    }

    #[test]
    fn bad_thread_count_is_a_user_error() {
        let sections = parse_ini("[build]\nthreads = many\n");
        let mut config = Config::default();
        assert!(matches!(config.apply_ini(&sections), Err(BuildError::UserInput(_))));
    }
}
