//! The library code for the `sitesmith` static site builder. A site is a
//! directory holding `static/` files, which are copied as they are, and
//! `content/` pages, which are rendered. The architecture can be generally
//! broken down into three steps:
//!
//! 1. Walking the site in dependency order ([`crate::walk`])
//! 2. Processing each page ([`crate::process`])
//! 3. Writing the results to disk ([`crate::build`])
//!
//! Of the three, the second step is the more involved. A page is HTML with
//! optional YAML front matter ([`crate::frontmatter`]) and embedded `<% %>`
//! commands ([`crate::action`]). Commands set page metadata or expand blocks
//! of the page's layout. Layouts are templates which may extend a parent
//! layout and override some of its blocks ([`crate::resolver`],
//! [`crate::template`]). While executing, templates can call helpers
//! ([`crate::funcs`]) that read the command's arguments, include other files
//! and query the pages built so far ([`crate::registry`]).
//!
//! Directories are visited before the pages beside them and `index.html` is
//! visited last, so an index page can list the pages beneath it.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

pub mod action;
pub mod build;
pub mod config;
pub mod frontmatter;
pub mod funcs;
pub mod page;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod resource;
pub mod template;
pub mod walk;
