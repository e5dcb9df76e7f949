//! A file of the built site, either rendered in memory or copied from disk.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Clone, Debug)]
pub struct Resource {
    /// URL path with a leading slash. Paths ending in `/` are directory
    /// indexes.
    pub path: String,

    /// The source file on disk.
    pub file_path: PathBuf,

    /// Aggregate modification time of the resource and its dependencies.
    pub mod_time: SystemTime,

    /// Size in bytes.
    pub size: u64,

    /// Rendered bytes. When `None` the resource is the source file itself.
    pub data: Option<Vec<u8>>,

    /// Redirect to this path when set.
    pub redirect: Option<String>,
}

impl Resource {
    pub fn new(path: String, file_path: PathBuf, mod_time: SystemTime, size: u64) -> Resource {
        Resource {
            path,
            file_path,
            mod_time,
            size,
            data: None,
            redirect: None,
        }
    }

    /// Returns where the resource is written under `output_dir`. Directory
    /// paths get an `index.html`.
    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        let mut relative = self.path.trim_start_matches('/').to_owned();
        if relative.is_empty() || relative.ends_with('/') {
            relative.push_str("index.html");
        }
        output_dir.join(relative)
    }
}
