//! An index of built pages that pages under construction may query.
//!
//! Pages are keyed by their final output path. A page that overrode its path
//! with `set path=…` or front matter stays reachable under the path it was
//! discovered at through an alias.

use crate::page::Page;
use glob::{MatchOptions, Pattern};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Default)]
struct Index {
    pages: HashMap<String, Arc<Page>>,
    aliases: HashMap<String, String>,
}

/// Concurrent page index. Readers take a shared lock; inserts and whole-index
/// replacement take an exclusive one.
#[derive(Default)]
pub struct Registry {
    index: RwLock<Index>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Indexes `page` under `page.meta.path`, replacing any earlier page with
    /// that path, and aliases its discovery path when the two differ.
    pub fn insert(&self, page: Page) -> Arc<Page> {
        let page = Arc::new(page);
        let mut index = self.index.write();
        let path = page.meta.path.clone();
        if page.source_path != path {
            index.aliases.insert(page.source_path.clone(), path.clone());
        }
        index.pages.insert(path, Arc::clone(&page));
        page
    }

    /// Returns the page with the final or discovery path `path`.
    pub fn lookup(&self, path: &str) -> Option<Arc<Page>> {
        let index = self.index.read();
        if let Some(page) = index.pages.get(path) {
            return Some(Arc::clone(page));
        }
        let target = index.aliases.get(path)?;
        index.pages.get(target).cloned()
    }

    /// Returns the pages whose final or discovery path matches the shell
    /// pattern, in no particular order. `*` does not match `/`.
    pub fn glob_match(&self, pattern: &str) -> Result<Vec<Arc<Page>>> {
        let pattern = Pattern::new(pattern).map_err(|err| Error::Pattern {
            pattern: pattern.to_owned(),
            message: err.msg.to_owned(),
        })?;
        let index = self.index.read();
        Ok(index
            .pages
            .values()
            .filter(|page| {
                pattern.matches_with(&page.meta.path, MATCH_OPTIONS)
                    || pattern.matches_with(&page.source_path, MATCH_OPTIONS)
            })
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.index.read().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves every entry of `other` into this registry, dropping the current
    /// entries and leaving `other` empty. Readers observe either the old
    /// index or the new one.
    pub fn replace_with(&self, other: &Registry) {
        let next = std::mem::take(&mut *other.index.write());
        *self.index.write() = next;
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },
}
