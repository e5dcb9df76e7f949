use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

const PROJECT_FILE: &str = "site.yaml";

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Project {
    #[serde(default)]
    content_directory: Option<PathBuf>,

    #[serde(default)]
    static_directory: Option<PathBuf>,

    #[serde(default)]
    output_directory: Option<PathBuf>,
}

/// Where a site's files live. Relative directories in `site.yaml` are
/// relative to the site root.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Absolute layout references (`/layout/base.html`) resolve against this
    /// directory.
    pub root_directory: PathBuf,
    pub content_directory: PathBuf,
    pub static_directory: PathBuf,
    pub output_directory: PathBuf,
}

impl Config {
    /// Loads the configuration for the site rooted at `dir`. `site.yaml` is
    /// optional; `output_directory`, when given, overrides the file.
    pub fn from_directory(dir: &Path, output_directory: Option<&Path>) -> Result<Config> {
        let path = dir.join(PROJECT_FILE);
        let project = if path.exists() {
            match serde_yaml::from_reader(open(&path, "project")?) {
                Ok(project) => project,
                Err(e) => return Err(anyhow!("Loading configuration: {}", e)),
            }
        } else {
            Project::default()
        };

        let resolve = |configured: Option<PathBuf>, default: &str| match configured {
            Some(p) => dir.join(p),
            None => dir.join(default),
        };
        Ok(Config {
            root_directory: dir.to_owned(),
            content_directory: resolve(project.content_directory, "content"),
            static_directory: resolve(project.static_directory, "static"),
            output_directory: match output_directory {
                Some(out) => out.to_owned(),
                None => resolve(project.output_directory, "_site"),
            },
        })
    }
}

fn open(path: &Path, kind: &str) -> Result<File> {
    match File::open(path) {
        Err(e) => Err(anyhow!("Opening {} file `{}`: {}", kind, path.display(), e)),
        Ok(file) => Ok(file),
    }
}
