//! Turns one content file into a rendered page.
//!
//! The file's front matter is decoded first, then its action stream is
//! replayed in order:
//!
//! * literal text is copied to the page body;
//! * `<%set name=value …%>` amends the page metadata (`title`, `subtitle`,
//!   `created`, `updated`, `layout`, `path`, `redirect`) and emits nothing;
//! * `<%t:NAME arg=value …%>` executes the block `NAME` of the page's layout
//!   and copies its output to the body.
//!
//! When the stream ends the accumulated body becomes `.Content` for the
//! layout's main body, or is the page itself when the layout chain has none.
//! The page is then registered so that later pages can query it.

use crate::action::{self, Action, Command, LocationContext};
use crate::config::Config;
use crate::frontmatter;
use crate::funcs::{self, ActionContext, Scope};
use crate::page::{Page, PageMetadata};
use crate::registry::Registry;
use crate::resolver::{self, Resolver};
use crate::resource::Resource;
use crate::template::{self, Layout};
use chrono::{DateTime, FixedOffset};
use gtmpl_value::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

const BLOCK_PREFIX: &str = "t:";

/// Processes the pages of one build pass. Layout definitions are cached for
/// the lifetime of the processor.
pub struct Processor {
    root: PathBuf,
    content_dir: PathBuf,
    static_dir: PathBuf,
    resolver: Resolver,
    registry: Arc<Registry>,
}

/// Mutable state of one page while its actions are replayed.
struct PageState {
    meta: PageMetadata,
    layout: Arc<Layout>,
    redirect: Option<String>,
}

impl Processor {
    /// Creates a processor for the site described by `config`. Built pages
    /// are inserted into `registry`.
    pub fn new(config: &Config, registry: Arc<Registry>) -> Processor {
        Processor {
            root: config.root_directory.clone(),
            content_dir: config.content_directory.clone(),
            static_dir: config.static_directory.clone(),
            resolver: Resolver::new(config.root_directory.clone()),
            registry,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Renders the page at `resource.file_path`, discovered under
    /// `resource.path`. On success the resource holds the rendered bytes,
    /// its final path and its aggregate modification time, and the page is
    /// registered. On failure the resource is left untouched.
    pub fn process(&mut self, resource: &mut Resource) -> Result<()> {
        let display = resource.file_path.display().to_string();
        let mut data = fs::read(&resource.file_path).map_err(|source| Error::Io {
            path: display.clone(),
            source,
        })?;
        let (mut meta, layout_offset) = match frontmatter::extract::<PageMetadata>(&display, &mut data)? {
            Some(front) => {
                let offset = front.offset("Layout");
                (front.value, offset)
            }
            None => (PageMetadata::default(), None),
        };
        if meta.path.is_empty() {
            meta.path = resource.path.clone();
        }
        let (actions, lc) = action::parse(data, &display)?;

        let file_dir = resource
            .file_path
            .parent()
            .unwrap_or(&self.root)
            .to_path_buf();
        let layout = self
            .resolver
            .resolve(&meta.layout, &file_dir)
            .map_err(|err| match layout_offset {
                Some(offset) => relocate(err, lc.location(offset)),
                None => Error::Layout(err),
            })?;
        let mut state = PageState {
            meta,
            layout,
            redirect: None,
        };

        let scope = Rc::new(
            Scope::new(
                self.root.clone(),
                file_dir.clone(),
                self.url_dir(&file_dir),
                Arc::clone(&self.registry),
            )
            .with_trees(vec![self.static_dir.clone(), self.content_dir.clone()]),
        );

        let mut body: Vec<u8> = Vec::new();
        let mut after_set = false;
        for action in &actions {
            match action {
                Action::Text(span) => {
                    let mut text = lc.text(span);
                    if std::mem::take(&mut after_set) {
                        text = text
                            .strip_prefix(b"\r\n")
                            .or_else(|| text.strip_prefix(b"\n"))
                            .unwrap_or(text);
                    }
                    body.extend_from_slice(text);
                }
                Action::Command(command) if command.name == "set" => {
                    self.set(command, &lc, &file_dir, &mut state)?;
                    after_set = true;
                }
                Action::Command(command) => {
                    after_set = false;
                    let name = command.name.strip_prefix(BLOCK_PREFIX).ok_or_else(|| {
                        located(command.location(&lc), format!("unknown command {:?}", command.name))
                    })?;
                    let out = execute_block(name, command, &lc, &state, &scope)?;
                    body.extend_from_slice(out.as_bytes());
                }
            }
        }

        let mut body = if state.layout.has_main() {
            let content = String::from_utf8(body).map_err(|_| Error::Encoding {
                path: display.clone(),
            })?;
            let mut fields = state.meta.fields();
            fields.insert("Content".to_owned(), Value::String(content));
            scope.set_action(None);
            state
                .layout
                .instantiate(Rc::clone(&scope))
                .render(Value::Object(fields))
                .map_err(|source| Error::Render {
                    path: display.clone(),
                    source,
                })?
                .into_bytes()
        } else {
            body
        };
        let end = body
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        body.truncate(end);
        body.push(b'\n');

        let mut mod_time = resource.mod_time;
        for t in [state.layout.mod_time(), scope.mod_time()].iter().flatten() {
            mod_time = mod_time.max(*t);
        }

        debug!(
            "page {} -> {} ({} bytes)",
            resource.path,
            state.meta.path,
            body.len()
        );
        self.registry.insert(Page {
            meta: state.meta.clone(),
            source_path: resource.path.clone(),
            mod_time,
        });
        resource.path = state.meta.path;
        resource.mod_time = mod_time;
        resource.size = body.len() as u64;
        resource.data = Some(body);
        resource.redirect = state.redirect;
        Ok(())
    }

    /// Applies the arguments of a `set` action. Arguments are applied in
    /// name order.
    fn set(&mut self, command: &Command, lc: &LocationContext, file_dir: &Path, state: &mut PageState) -> Result<()> {
        let mut names: Vec<&String> = command.args.keys().collect();
        names.sort();
        for name in names {
            let value = &command.args[name];
            match name.as_str() {
                "title" => state.meta.title = value.text.clone(),
                "subtitle" => state.meta.subtitle = value.text.clone(),
                "created" => state.meta.created = Some(parse_time(&value.text, value.location(lc))?),
                // updated= sets Created, not Updated.
                "updated" => state.meta.created = Some(parse_time(&value.text, value.location(lc))?),
                "path" => state.meta.path = value.text.clone(),
                "redirect" => state.redirect = Some(value.text.clone()),
                "layout" => {
                    state.layout = self
                        .resolver
                        .resolve(&value.text, file_dir)
                        .map_err(|err| relocate(err, value.location(lc)))?;
                    state.meta.layout = value.text.clone();
                }
                _ => {
                    return Err(located(
                        value.location(lc),
                        format!("unknown argument {:?}", name),
                    ))
                }
            }
        }
        Ok(())
    }

    /// The URL directory of pages in `file_dir`, with leading and trailing
    /// slashes.
    fn url_dir(&self, file_dir: &Path) -> String {
        let mut dir = String::from("/");
        if let Ok(relative) = file_dir.strip_prefix(&self.content_dir) {
            for component in relative.components() {
                dir.push_str(&component.as_os_str().to_string_lossy());
                dir.push('/');
            }
        }
        dir
    }
}

fn execute_block(
    name: &str,
    command: &Command,
    lc: &LocationContext,
    state: &PageState,
    scope: &Rc<Scope>,
) -> Result<String> {
    let location = command.location(lc);
    if state.meta.layout.is_empty() {
        return Err(located(
            location,
            format!("{} requires a layout; set one first", command.name),
        ));
    }
    if !state.layout.has_block(name) {
        return Err(located(
            location,
            format!(
                "template block {:?} not found in {}",
                name,
                state.layout.path()
            ),
        ));
    }

    let context = ActionContext::new(command.clone(), lc.clone());
    let mut fields = state.meta.fields();
    fields.insert("Args".to_owned(), context.args_value());
    scope.set_action(Some(context));
    let result = state
        .layout
        .instantiate(Rc::clone(scope))
        .execute_block(name, Value::Object(fields));
    scope.set_action(None);

    result.map_err(|err| match err {
        template::Error::Func(err) => Error::Func(err),
        err => located(location, err.to_string()),
    })
}

fn parse_time(text: &str, location: String) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map_err(|err| located(location, format!("invalid time {:?}: {}", text, err)))
}

/// Moves a missing or recursive layout error to the reference that named
/// it. Errors inside the layout files themselves keep their own locations.
fn relocate(err: resolver::Error, location: String) -> Error {
    match err {
        resolver::Error::NotFound { path } => located(location, format!("layout {} not found", path)),
        resolver::Error::Recursive { path } => {
            located(location, format!("recursive layouts through {}", path))
        }
        err => Error::Layout(err),
    }
}

fn located(location: String, message: String) -> Error {
    Error::Located { location, message }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    FrontMatter(#[from] frontmatter::Error),

    #[error(transparent)]
    Action(#[from] action::Error),

    /// A layout file of the page's chain is broken. Reported without the
    /// page's path, so pages sharing the layout report the same error.
    #[error(transparent)]
    Layout(resolver::Error),

    /// An error at a specific action or argument of the page.
    #[error("{location}: {message}")]
    Located { location: String, message: String },

    /// A helper failed while executing a block.
    #[error(transparent)]
    Func(#[from] funcs::Error),

    /// The layout's main body failed to execute.
    #[error("{path}: {source}")]
    Render {
        path: String,
        #[source]
        source: template::Error,
    },

    #[error("{path}: page is not valid UTF-8")]
    Encoding { path: String },
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn site(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, text) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        dir
    }

    fn processor(dir: &TempDir) -> Processor {
        Processor::new(
            &Config::from_directory(dir.path(), None).unwrap(),
            Arc::new(Registry::new()),
        )
    }

    fn resource(dir: &TempDir, name: &str, path: &str) -> Resource {
        Resource::new(
            path.to_owned(),
            dir.path().join("content").join(name),
            SystemTime::UNIX_EPOCH,
            0,
        )
    }

    fn display(dir: &TempDir, name: &str) -> String {
        dir.path().join("content").join(name).display().to_string()
    }

    fn process_err(files: &[(&str, &str)]) -> (String, String) {
        let dir = site(files);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "p.html", "/p/");
        let err = p.process(&mut r).unwrap_err();
        (err.to_string(), display(&dir, "p.html"))
    }

    fn text(r: &Resource) -> &str {
        std::str::from_utf8(r.data.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn test_named_block_in_text() -> Result<()> {
        let dir = site(&[
            (
                "content/p.html",
                "first line\n<%set title=\"Hi\" layout=\"base.html\"%>\n<%t:body%>\nsecond line\n",
            ),
            ("content/base.html", "{{define \"body\"}}Title: {{.Title}}{{end}}"),
        ]);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "p.html", "/p/");
        p.process(&mut r)?;

        assert_eq!(text(&r), "first line\nTitle: Hi\nsecond line\n");
        assert_eq!(r.size, text(&r).len() as u64);
        let page = p.registry().lookup("/p/").expect("registered");
        assert_eq!(page.meta.title, "Hi");
        Ok(())
    }

    #[test]
    fn test_layout_main_body() -> Result<()> {
        let dir = site(&[
            (
                "content/p.html",
                "---\nTitle: Hello\nLayout: /layout/base.html\n---\n<p>body</p>\n\n\n",
            ),
            (
                "layout/base.html",
                "<h1>{{.Title}}</h1>\n{{.Content}}{{template \"footer\" .}}\n{{define \"footer\"}}<footer>{{.Path}}</footer>{{end}}",
            ),
        ]);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "p.html", "/p/");
        p.process(&mut r)?;
        // The masked front matter stays in the content as blank lines.
        let out = text(&r);
        assert!(out.starts_with("<h1>Hello</h1>\n   \n"), "{:?}", out);
        assert!(out.ends_with("\n<p>body</p>\n\n\n<footer>/p/</footer>\n"), "{:?}", out);
        assert_eq!(out.lines().filter(|l| l.trim().is_empty()).count(), 6);
        Ok(())
    }

    #[test]
    fn test_block_arguments() -> Result<()> {
        let dir = site(&[
            (
                "content/p.html",
                "<%set layout=\"/layout/l.html\"%>\n<%t:img src=\"a.png\" alt=\"a &amp; b\"%>",
            ),
            (
                "layout/l.html",
                "{{define \"img\"}}<img src=\"{{arg \"src\"}}\" alt=\"{{.Args.alt}}\" width={{argIntOr \"width\" 100}}>{{end}}",
            ),
        ]);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "p.html", "/p/");
        p.process(&mut r)?;
        assert_eq!(text(&r), "<img src=\"a.png\" alt=\"a & b\" width=100>\n");
        Ok(())
    }

    #[test]
    fn test_unknown_argument() {
        let (msg, path) = process_err(&[("content/p.html", "x\n<%set bogus=\"x\"%>")]);
        assert_eq!(msg, format!("{}:2:13: unknown argument \"bogus\"", path));
    }

    #[test]
    fn test_required_argument() {
        let (msg, path) = process_err(&[
            ("content/p.html", "<%set layout=\"l.html\"%>\n<%t:b%>"),
            ("content/l.html", "{{define \"b\"}}{{arg \"src\"}}{{end}}"),
        ]);
        assert_eq!(
            msg,
            format!("{}:2:3: required argument not found: src", path)
        );
    }

    #[test]
    fn test_unknown_command() {
        let (msg, path) = process_err(&[("content/p.html", "<%include x=1%>")]);
        assert_eq!(msg, format!("{}:1:2: unknown command \"include\"", path));
    }

    #[test]
    fn test_block_without_layout() {
        let (msg, path) = process_err(&[("content/p.html", "<%t:body%>")]);
        assert_eq!(
            msg,
            format!("{}:1:2: t:body requires a layout; set one first", path)
        );
    }

    #[test]
    fn test_unknown_block() {
        let (msg, path) = process_err(&[
            ("content/p.html", "<%set layout=\"l.html\"%><%t:nope%>"),
            ("content/l.html", "{{define \"b\"}}{{end}}"),
        ]);
        assert!(
            msg.starts_with(&format!("{}:1:25: template block \"nope\" not found in ", path)),
            "{}",
            msg
        );
    }

    #[test]
    fn test_invalid_time() {
        let (msg, path) = process_err(&[("content/p.html", "<%set created=\"yesterday\"%>")]);
        assert!(
            msg.starts_with(&format!("{}:1:14: invalid time \"yesterday\"", path)),
            "{}",
            msg
        );
    }

    #[test]
    fn test_missing_layout_is_located_at_argument() {
        let (msg, path) = process_err(&[("content/p.html", "\n\n<%set layout=\"gone.html\"%>")]);
        assert!(
            msg.starts_with(&format!("{}:3:14: layout ", path)),
            "{}",
            msg
        );
        assert!(msg.ends_with("gone.html not found"), "{}", msg);
    }

    #[test]
    fn test_recursive_layout_is_located_at_argument() {
        let (msg, path) = process_err(&[
            ("content/p.html", "\n\n<%set layout=\"/layout/a.html\"%>"),
            ("layout/a.html", "---\nLayout: b.html\n---\nA"),
            ("layout/b.html", "---\nLayout: a.html\n---\nB"),
        ]);
        assert!(
            msg.starts_with(&format!("{}:3:14: recursive layouts through ", path)),
            "{}",
            msg
        );
        assert!(msg.ends_with("a.html"), "{}", msg);
    }

    #[test]
    fn test_missing_front_matter_layout() {
        let (msg, path) = process_err(&[("content/p.html", "---\nLayout: /layout/gone.html\n---\n")]);
        assert!(msg.starts_with(&format!("{}:2:9: layout ", path)), "{}", msg);
        assert!(msg.ends_with("gone.html not found"), "{}", msg);
    }

    #[test]
    fn test_recursive_front_matter_layout() {
        let (msg, path) = process_err(&[
            (
                "content/p.html",
                "---\nTitle: Loop\nLayout:  /layout/self.html\n---\n",
            ),
            ("layout/self.html", "---\nLayout: self.html\n---\n"),
        ]);
        assert!(
            msg.starts_with(&format!("{}:3:10: recursive layouts through ", path)),
            "{}",
            msg
        );
    }

    #[test]
    fn test_syntax_error_after_front_matter_keeps_line() {
        let (msg, path) = process_err(&[("content/p.html", "---\nTitle: x\n---\n<%1%>")]);
        assert!(msg.starts_with(&format!("{}:4:3: ", path)), "{}", msg);
    }

    #[test]
    fn test_updated_sets_created() -> Result<()> {
        let dir = site(&[(
            "content/p.html",
            "<%set updated=\"2021-04-16T10:00:00Z\"%>x",
        )]);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "p.html", "/p/");
        p.process(&mut r)?;
        let page = p.registry().lookup("/p/").expect("registered");
        assert_eq!(
            page.meta.created,
            Some(DateTime::parse_from_rfc3339("2021-04-16T10:00:00Z").unwrap())
        );
        assert!(page.meta.updated.is_none());
        Ok(())
    }

    #[test]
    fn test_path_override_and_redirect() -> Result<()> {
        let dir = site(&[(
            "content/old.html",
            "<%set path=\"/new/\" redirect=\"/elsewhere/\"%>moved",
        )]);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "old.html", "/old/");
        p.process(&mut r)?;

        assert_eq!(r.path, "/new/");
        assert_eq!(r.redirect.as_deref(), Some("/elsewhere/"));
        let by_new = p.registry().lookup("/new/").expect("final path");
        let by_old = p.registry().lookup("/old/").expect("discovery path");
        assert!(Arc::ptr_eq(&by_new, &by_old));
        assert_eq!(by_new.source_path, "/old/");
        Ok(())
    }

    #[test]
    fn test_mod_time_includes_layout_and_queries() -> Result<()> {
        let dir = site(&[
            ("content/a.html", "A"),
            ("content/p.html", "<%set layout=\"l.html\"%><%t:b%>"),
            (
                "content/l.html",
                "{{define \"b\"}}{{with readPage \"a/\"}}{{.Title}}{{end}}{{end}}",
            ),
        ]);
        let mut p = processor(&dir);

        let mut a = resource(&dir, "a.html", "/a/");
        a.mod_time = SystemTime::UNIX_EPOCH + Duration::from_secs(4_000_000_000);
        p.process(&mut a)?;

        let mut r = resource(&dir, "p.html", "/p/");
        p.process(&mut r)?;
        assert_eq!(r.mod_time, a.mod_time);
        assert_eq!(p.resolver().reads(), 1);
        Ok(())
    }

    #[test]
    fn test_glob_lists_static_and_content_files() -> Result<()> {
        let dir = site(&[
            ("static/img/a.png", ""),
            ("static/img/b.jpg", ""),
            ("content/img/c.png", ""),
            ("content/p.html", "<%set layout=\"/layout/l.html\"%><%t:b%>"),
            (
                "layout/l.html",
                "{{define \"b\"}}[{{range glob \"/img/*.png\"}}{{.}};{{end}}]{{end}}",
            ),
        ]);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "p.html", "/p/");
        p.process(&mut r)?;
        assert_eq!(text(&r), "[/img/a.png;/img/c.png;]\n");
        Ok(())
    }

    #[test]
    fn test_failed_page_is_not_registered() {
        let dir = site(&[("content/p.html", "<%bogus%>")]);
        let mut p = processor(&dir);
        let mut r = resource(&dir, "p.html", "/p/");
        assert!(p.process(&mut r).is_err());
        assert!(r.data.is_none());
        assert!(p.registry().lookup("/p/").is_none());
    }

    #[test]
    fn test_url_dir() {
        let dir = site(&[]);
        let p = processor(&dir);
        assert_eq!(p.url_dir(&dir.path().join("content")), "/");
        assert_eq!(p.url_dir(&dir.path().join("content/blog/2021")), "/blog/2021/");
    }
}
