//! Visits the files of a site in an order that lets pages query the pages
//! beneath them.
//!
//! Static files are visited first and keep their names. Content files are
//! pages and are renamed:
//!
//! | File                 | URL path     |
//! |----------------------|--------------|
//! | `dir/index.html`     | `/dir/`      |
//! | `dir/name.index.html`| `/dir/name`  |
//! | `dir/name.html`      | `/dir/name/` |
//!
//! Within a content directory, subdirectories are visited first, then plain
//! pages, then `*.index.html` pages, then `index.html`. A page that fails is
//! reported once per distinct message and left out; the walk goes on.

use crate::process::Processor;
use crate::resource::Resource;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use tracing::{debug, error};
use walkdir::{DirEntry, WalkDir};

const INDEX: &str = "index.html";
const INDEX_SUFFIX: &str = ".index.html";
const PAGE_SUFFIX: &str = ".html";

/// Walks `static_dir` and then `content_dir`, handing every resource to
/// `visit`. Missing directories are skipped. Returns the number of
/// resources visited.
pub fn walk<V>(static_dir: &Path, content_dir: &Path, processor: &mut Processor, visit: V) -> Result<usize>
where
    V: FnMut(Resource) -> Result<()>,
{
    let mut walker = Walker {
        processor,
        visit,
        seen: HashSet::new(),
        reported: Vec::new(),
        failed: 0,
        visited: 0,
    };
    walker.visit_directory(static_dir, "", false)?;
    walker.visit_directory(content_dir, "", true)?;

    if walker.failed > 0 {
        return Err(Error::Failed {
            failed: walker.failed,
            reported: walker.reported,
        });
    }
    Ok(walker.visited)
}

struct Walker<'p, V> {
    processor: &'p mut Processor,
    visit: V,
    seen: HashSet<String>,
    reported: Vec<String>,
    failed: usize,
    visited: usize,
}

impl<V> Walker<'_, V>
where
    V: FnMut(Resource) -> Result<()>,
{
    fn visit_directory(&mut self, dir: &Path, url_dir: &str, is_page_dir: bool) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }

        let mut pages = Vec::new();
        let mut index_pages = Vec::new();
        let mut index_page = None;

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ".DS_Store" {
                continue;
            }
            if entry.file_type().is_dir() {
                self.visit_directory(entry.path(), &format!("{}/{}", url_dir, name), is_page_dir)?;
                continue;
            }

            if !is_page_dir {
                let path = if name == INDEX {
                    format!("{}/", url_dir)
                } else {
                    format!("{}/{}", url_dir, name)
                };
                let resource = resource(&entry, path)?;
                self.visit_file(resource)?;
                continue;
            }

            // Pages wait until the subdirectories are done.
            if name == INDEX {
                index_page = Some(resource(&entry, format!("{}/", url_dir))?);
            } else if let Some(stem) = name.strip_suffix(INDEX_SUFFIX) {
                index_pages.push(resource(&entry, format!("{}/{}", url_dir, stem))?);
            } else if let Some(stem) = name.strip_suffix(PAGE_SUFFIX) {
                pages.push(resource(&entry, format!("{}/{}/", url_dir, stem))?);
            } else {
                debug!("skipping {}: not a page", entry.path().display());
            }
        }

        pages.extend(index_pages);
        pages.extend(index_page);
        for mut page in pages {
            match self.processor.process(&mut page) {
                Ok(()) => self.visit_file(page)?,
                Err(err) => self.report(err.to_string()),
            }
        }
        Ok(())
    }

    fn visit_file(&mut self, resource: Resource) -> Result<()> {
        debug!("file {} -> {}", resource.file_path.display(), resource.path);
        self.visited += 1;
        (self.visit)(resource)
    }

    fn report(&mut self, message: String) {
        self.failed += 1;
        if self.seen.insert(message.clone()) {
            error!("{}", message);
            self.reported.push(message);
        }
    }
}

fn resource(entry: &DirEntry, path: String) -> Result<Resource> {
    let metadata = entry.metadata()?;
    let mod_time = metadata.modified().map_err(|source| Error::Io {
        path: entry.path().display().to_string(),
        source,
    })?;
    Ok(Resource::new(
        path,
        entry.path().to_path_buf(),
        mod_time,
        metadata.len(),
    ))
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Some pages failed; each distinct message was logged once.
    #[error("{failed} page(s) failed to build")]
    Failed { failed: usize, reported: Vec<String> },
}
