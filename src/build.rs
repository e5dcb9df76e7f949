//! Exports [`Site`], which runs build passes over a site directory, and the
//! [`build_site`] function which performs one pass and writes the result to
//! the output directory: rendered pages, copied static files and redirect
//! stubs.

use crate::config::Config;
use crate::process::Processor;
use crate::registry::Registry;
use crate::resource::Resource;
use crate::walk::{self, walk};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// A site and the pages of its most recent build pass.
pub struct Site {
    config: Config,
    registry: Arc<Registry>,
}

impl Site {
    pub fn new(config: Config) -> Site {
        Site {
            config,
            registry: Arc::new(Registry::new()),
        }
    }

    /// The pages of the last completed pass. Safe to query while another pass
    /// is running.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs one build pass with fresh layout and page caches, handing every
    /// resource to `visit`. Once the walk is over the pass's pages replace
    /// the live registry, including when some pages failed. Returns the
    /// number of resources visited.
    pub fn build<V>(&self, visit: V) -> Result<usize>
    where
        V: FnMut(Resource) -> walk::Result<()>,
    {
        let pass = Arc::new(Registry::new());
        let mut processor = Processor::new(&self.config, Arc::clone(&pass));
        let result = walk(
            &self.config.static_directory,
            &self.config.content_directory,
            &mut processor,
            visit,
        );
        if let Ok(_) | Err(walk::Error::Failed { .. }) = &result {
            info!(
                "built {} pages, {} layout reads",
                pass.len(),
                processor.resolver().reads()
            );
            self.registry.replace_with(&pass);
        }
        Ok(result?)
    }
}

/// Builds the site described by `config` into its output directory, which is
/// deleted first. Returns the number of files written.
pub fn build_site(config: Config) -> Result<usize> {
    // Blow away the old output so stale pages don't linger.
    rmdir(&config.output_directory)?;

    let output_directory = config.output_directory.clone();
    let site = Site::new(config);
    let written = site.build(|resource| write_resource(&output_directory, &resource))?;
    info!("wrote {} files to {}", written, output_directory.display());
    Ok(written)
}

/// Runs a build pass without writing anything, reporting page errors.
pub fn check_site(config: Config) -> Result<usize> {
    Site::new(config).build(|_| Ok(()))
}

fn write_resource(output_directory: &Path, resource: &Resource) -> walk::Result<()> {
    let path = resource.output_path(output_directory);
    let io_error = |source| walk::Error::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    match (&resource.redirect, &resource.data) {
        (Some(target), _) => fs::write(&path, redirect_page(target)).map_err(io_error),
        (None, Some(data)) => fs::write(&path, data).map_err(io_error),
        (None, None) => fs::copy(&resource.file_path, &path)
            .map(|_| ())
            .map_err(io_error),
    }
}

fn redirect_page(target: &str) -> String {
    let target = html_escape::encode_double_quoted_attribute(target);
    format!(
        "<!DOCTYPE html>\n<meta http-equiv=\"refresh\" content=\"0; url={0}\">\n<link rel=\"canonical\" href=\"{0}\">\n",
        target
    )
}

fn rmdir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(x) => Ok(x),
        Err(e) => match e.kind() {
            std::io::ErrorKind::NotFound => Ok(()),
            _ => Err(Error::Clean {
                path: dir.to_owned(),
                source: e,
            }),
        },
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for building a site.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when walking the site fails or some of its pages fail.
    #[error(transparent)]
    Walk(#[from] walk::Error),

    /// Returned for I/O problems while cleaning the output directory.
    #[error("Cleaning directory '{}': {source}", path.display())]
    Clean {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
