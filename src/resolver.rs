//! Resolves layout references to [`Layout`] definitions.
//!
//! A layout file may name its own parent in its front matter, so resolving
//! one reference loads the whole chain. Definitions are cached per file for
//! the lifetime of the [`Resolver`], which is meant to live for one build
//! pass; a new pass starts from a new resolver.

use crate::frontmatter;
use crate::page::PageMetadata;
use crate::template::{self, Layout};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub struct Resolver {
    root: PathBuf,
    cache: HashMap<PathBuf, Arc<Layout>>,
    base: Arc<Layout>,
    reads: usize,
}

impl Resolver {
    /// Creates a resolver for the site at `root`. References starting with
    /// `/` resolve against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Resolver {
        Resolver {
            root: root.into(),
            cache: HashMap::new(),
            base: Arc::new(Layout::base()),
            reads: 0,
        }
    }

    /// The number of layout files read from disk so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the definition of the layout chain starting at `reference`.
    /// Relative references resolve against `referrer_dir`; the empty
    /// reference is the base layout.
    pub fn resolve(&mut self, reference: &str, referrer_dir: &Path) -> Result<Arc<Layout>> {
        let mut in_progress = HashSet::new();
        self.resolve_in(reference, referrer_dir, &mut in_progress)
    }

    fn resolve_in(
        &mut self,
        reference: &str,
        referrer_dir: &Path,
        in_progress: &mut HashSet<PathBuf>,
    ) -> Result<Arc<Layout>> {
        if reference.is_empty() {
            return Ok(Arc::clone(&self.base));
        }
        let path = self.file_path(reference, referrer_dir);
        if let Some(layout) = self.cache.get(&path) {
            return Ok(Arc::clone(layout));
        }
        if !in_progress.insert(path.clone()) {
            return Err(Error::Recursive {
                path: path.display().to_string(),
            });
        }
        let loaded = self.load(&path, in_progress);
        in_progress.remove(&path);

        let layout = Arc::new(loaded?);
        self.cache.insert(path, Arc::clone(&layout));
        Ok(layout)
    }

    fn load(&mut self, path: &Path, in_progress: &mut HashSet<PathBuf>) -> Result<Layout> {
        let display = path.display().to_string();
        let io_error = |source: io::Error| match source.kind() {
            io::ErrorKind::NotFound => Error::NotFound {
                path: display.clone(),
            },
            _ => Error::Io {
                path: display.clone(),
                source,
            },
        };

        self.reads += 1;
        let mut data = fs::read(path).map_err(io_error)?;
        let mod_time = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(io_error)?;
        let meta: PageMetadata = frontmatter::extract(&display, &mut data)?
            .map(|front| front.value)
            .unwrap_or_default();

        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        let parent = self.resolve_in(&meta.layout, &dir, in_progress)?;

        let text = String::from_utf8(data).map_err(|_| Error::Encoding {
            path: display.clone(),
        })?;
        Ok(Layout::parse(&display, &text, mod_time, &parent)?)
    }

    fn file_path(&self, reference: &str, referrer_dir: &Path) -> PathBuf {
        match reference.strip_prefix('/') {
            Some(rest) => clean(&self.root.join(rest)),
            None => clean(&referrer_dir.join(reference)),
        }
    }
}

/// Removes `.` components and folds `..` into the preceding component
/// without touching the file system.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{path}: file not found")]
    NotFound { path: String },

    #[error("{path}: recursive layouts")]
    Recursive { path: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path}: layout is not valid UTF-8")]
    Encoding { path: String },

    #[error(transparent)]
    FrontMatter(#[from] frontmatter::Error),

    #[error(transparent)]
    Template(#[from] template::Error),
}
