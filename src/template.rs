//! Adapts Go-style text templates ([`gtmpl`]) to inheritable layouts.
//!
//! A layout file holds `{{define "name"}}…{{end}}` blocks and an optional main
//! body. A [`Layout`] is the definition of a whole inheritance chain: the
//! source text of every block visible to the chain (a child's blocks override
//! its ancestors') and the main body of the nearest layout that has one.
//!
//! `gtmpl` templates cannot be cloned and their helper functions are plain
//! function pointers, so a definition never holds a parsed template. Instead
//! [`Layout::instantiate`] pairs the definition with a per-page
//! [`Scope`](crate::funcs::Scope), and every execution of the resulting
//! [`Instance`] parses a fresh template and runs it with the scope bound.

use crate::funcs::{self, Scope};
use gtmpl::Template;
use gtmpl_value::Value;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

/// The definition of a layout chain. Cheap to share; never executed directly.
#[derive(Clone, Debug, Default)]
pub struct Layout {
    path: String,
    blocks: BTreeMap<String, Arc<str>>,
    main: Option<Arc<str>>,
    mod_time: Option<SystemTime>,
}

impl Layout {
    /// The layout used by pages that name none: no blocks, no main body and
    /// no modification time.
    pub fn base() -> Layout {
        Layout::default()
    }

    /// Builds the definition for the layout file at `path` on top of its
    /// `parent` chain. The text is parsed on its own first so syntax errors
    /// point at this file.
    pub fn parse(path: &str, text: &str, mod_time: SystemTime, parent: &Layout) -> Result<Layout> {
        let mut template = Template::default();
        funcs::register(&mut template);
        template.parse(text).map_err(|message| Error::Parse {
            path: path.to_owned(),
            message,
        })?;

        let split = split(path, text)?;
        let mut blocks = parent.blocks.clone();
        blocks.extend(split.blocks);
        Ok(Layout {
            path: path.to_owned(),
            blocks,
            main: split.main.or_else(|| parent.main.clone()),
            mod_time: Some(parent.mod_time.map_or(mod_time, |t| t.max(mod_time))),
        })
    }

    /// The file this definition was loaded from; empty for the base layout.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The latest modification time of any file in the chain.
    pub fn mod_time(&self) -> Option<SystemTime> {
        self.mod_time
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    /// Reports whether some layout in the chain has a non-empty main body.
    pub fn has_main(&self) -> bool {
        self.main.is_some()
    }

    /// Returns an execution-ready instance bound to `scope`.
    pub fn instantiate(&self, scope: Rc<Scope>) -> Instance<'_> {
        Instance {
            layout: self,
            scope,
        }
    }
}

/// A layout bound to the helper scope of one page.
pub struct Instance<'a> {
    layout: &'a Layout,
    scope: Rc<Scope>,
}

impl Instance<'_> {
    /// Executes the named block with `data` as dot.
    pub fn execute_block(&self, name: &str, data: Value) -> Result<String> {
        self.run(&format!("{{{{template {:?} .}}}}", name), data)
    }

    /// Executes the chain's main body with `data` as dot.
    pub fn render(&self, data: Value) -> Result<String> {
        let main = self.layout.main.clone().unwrap_or_else(|| Arc::from(""));
        self.run(&main, data)
    }

    fn run(&self, body: &str, data: Value) -> Result<String> {
        let mut source = String::new();
        for block in self.layout.blocks.values() {
            source.push_str(block);
        }
        source.push_str(body);

        let mut template = Template::default();
        funcs::register(&mut template);
        template.parse(&source).map_err(|message| Error::Parse {
            path: self.layout.path.clone(),
            message,
        })?;
        let context = gtmpl::Context::from(data).map_err(|message| Error::Execute { message })?;

        let _bound = funcs::bind(Rc::clone(&self.scope));
        let mut out: Vec<u8> = Vec::new();
        if let Err(message) = template.execute(&mut out, &context) {
            return Err(match self.scope.take_error() {
                Some(err) => Error::Func(err),
                None => Error::Execute { message },
            });
        }
        String::from_utf8(out).map_err(|_| Error::Encoding {
            path: self.layout.path.clone(),
        })
    }
}

/// A layout file taken apart into its named blocks and its main body. `main`
/// is `None` when, outside of blocks, the file holds only whitespace and
/// comments.
#[derive(Debug)]
struct Split {
    blocks: Vec<(String, Arc<str>)>,
    main: Option<Arc<str>>,
}

fn split(path: &str, text: &str) -> Result<Split> {
    let bytes = text.as_bytes();
    let mut blocks = Vec::new();
    let mut main = String::with_capacity(text.len());
    let mut significant = false;
    let mut depth = 0usize;
    let mut define: Option<(String, usize)> = None;
    let mut copied = 0;
    let mut trim_next = false;
    let mut pos = 0;

    while let Some(i) = find(&bytes[pos..], b"{{") {
        let start = pos + i;
        if define.is_none() && !text[pos..start].trim().is_empty() {
            significant = true;
        }
        let action = scan_action(path, text, start)?;
        let inner = action.inner;
        let end = action.end;
        pos = end;

        if inner.starts_with("/*") {
            continue;
        }
        let keyword = inner
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
            .unwrap_or("");
        match keyword {
            "define" => {
                if depth > 0 {
                    return Err(syntax(path, text, start, "nested define"));
                }
                let name = define_name(&inner["define".len()..]).ok_or_else(|| {
                    syntax(path, text, start, "define: expected quoted template name")
                })?;
                push_main(&mut main, &text[copied..start], trim_next, action.trim_left);
                define = Some((name, start));
                depth = 1;
            }
            "if" | "range" | "with" | "block" => {
                depth += 1;
                significant |= define.is_none();
            }
            "end" => {
                if depth == 0 {
                    return Err(syntax(path, text, start, "unexpected {{end}}"));
                }
                depth -= 1;
                if depth == 0 {
                    if let Some((name, block_start)) = define.take() {
                        let block = &text[block_start..end];
                        blocks.push((name, Arc::from(block)));
                        // Keep line breaks so the main body's lines stay put.
                        let breaks: String = block.chars().filter(|&c| c == '\n').collect();
                        if action.trim_right && !breaks.is_empty() {
                            main.push_str(&format!("{{{{/*{}*/}}}}", breaks));
                        } else {
                            main.push_str(&breaks);
                        }
                        trim_next = action.trim_right;
                        copied = end;
                    }
                }
            }
            _ => significant |= define.is_none(),
        }
    }

    if let Some((name, block_start)) = define {
        return Err(syntax(
            path,
            text,
            block_start,
            &format!("unterminated define {:?}", name),
        ));
    }
    if !text[pos..].trim().is_empty() {
        significant = true;
    }
    push_main(&mut main, &text[copied..], trim_next, false);

    Ok(Split {
        blocks,
        main: if significant {
            Some(Arc::from(main))
        } else {
            None
        },
    })
}

/// Appends main-body text that sat between removed blocks, applying the trim
/// markers of the actions on either side of it.
fn push_main(main: &mut String, text: &str, trim_start: bool, trim_end: bool) {
    let text = if trim_start { text.trim_start() } else { text };
    if trim_end {
        main.push_str(text.trim_end());
        let kept = main.trim_end().len();
        main.truncate(kept);
    } else {
        main.push_str(text);
    }
}

/// One `{{…}}` action found by [`scan_action`].
struct ScannedAction<'t> {
    /// Text between the delimiters with trim markers and surrounding space
    /// removed.
    inner: &'t str,
    /// Offset following the closing `}}`.
    end: usize,
    trim_left: bool,
    trim_right: bool,
}

/// Scans the action starting at `start` (which holds `{{`).
fn scan_action<'t>(path: &str, text: &'t str, start: usize) -> Result<ScannedAction<'t>> {
    let bytes = text.as_bytes();
    let mut i = start + 2;
    while i < bytes.len() {
        match bytes[i] {
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                let (inner, trim_left, trim_right) = trim_markers(&text[start + 2..i]);
                return Ok(ScannedAction {
                    inner,
                    end: i + 2,
                    trim_left,
                    trim_right,
                });
            }
            q @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != q {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'`' => {
                i = match find(&bytes[i + 1..], b"`") {
                    Some(n) => i + 1 + n + 1,
                    None => bytes.len(),
                };
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = match find(&bytes[i + 2..], b"*/") {
                    Some(n) => i + 2 + n + 2,
                    None => bytes.len(),
                };
            }
            _ => i += 1,
        }
    }
    Err(syntax(path, text, start, "unclosed action"))
}

fn trim_markers(inner: &str) -> (&str, bool, bool) {
    let mut inner = inner;
    let mut left = false;
    let mut right = false;
    if let Some(rest) = inner.strip_prefix('-') {
        if rest.starts_with(char::is_whitespace) {
            inner = rest;
            left = true;
        }
    }
    if let Some(rest) = inner.strip_suffix('-') {
        if rest.ends_with(char::is_whitespace) {
            inner = rest;
            right = true;
        }
    }
    (inner.trim(), left, right)
}

/// Reads the quoted template name following `define`.
fn define_name(rest: &str) -> Option<String> {
    let rest = rest.trim_start();
    if let Some(raw) = rest.strip_prefix('`') {
        return raw.find('`').map(|end| raw[..end].to_owned());
    }
    let quoted = rest.strip_prefix('"')?;
    let mut name = String::new();
    let mut chars = quoted.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(name),
            '\\' => name.push(chars.next()?),
            c => name.push(c),
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn syntax(path: &str, text: &str, offset: usize, message: &str) -> Error {
    Error::Syntax {
        path: path.to_owned(),
        line: 1 + text[..offset].matches('\n').count(),
        message: message.to_owned(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The block structure of a layout file is malformed.
    #[error("{path}:{line}: {message}")]
    Syntax {
        path: String,
        line: usize,
        message: String,
    },

    /// The template engine rejected a layout's text.
    #[error("{path}: {message}")]
    Parse { path: String, message: String },

    /// The template engine failed while executing; no helper recorded an
    /// error of its own.
    #[error("{message}")]
    Execute { message: String },

    /// A helper function failed; its error is reported in place of the
    /// engine's.
    #[error(transparent)]
    Func(#[from] funcs::Error),

    #[error("{path}: template output is not valid UTF-8")]
    Encoding { path: String },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::Registry;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn scope() -> Rc<Scope> {
        Rc::new(Scope::new(
            PathBuf::from("."),
            PathBuf::from("."),
            "/".to_owned(),
            Arc::new(Registry::new()),
        ))
    }

    fn page(title: &str) -> Value {
        let mut m = HashMap::new();
        m.insert("Title".to_owned(), Value::String(title.to_owned()));
        Value::Object(m)
    }

    #[test]
    fn test_split_blocks_and_main() -> Result<()> {
        let text = "{{define \"head\"}}<title>{{.Title}}</title>{{end}}\n\
                    <html>\n{{template \"head\" .}}\n</html>\n";
        let split = split("l.html", text)?;
        assert_eq!(split.blocks.len(), 1);
        assert_eq!(split.blocks[0].0, "head");
        assert_eq!(
            &*split.blocks[0].1,
            "{{define \"head\"}}<title>{{.Title}}</title>{{end}}"
        );
        let main = split.main.expect("main body");
        assert_eq!(&*main, "\n<html>\n{{template \"head\" .}}\n</html>\n");
        Ok(())
    }

    #[test]
    fn test_split_nested_control_inside_define() -> Result<()> {
        let text = "{{- define `list` -}}\n\
                    {{range .Items}}{{if .}}x{{else}}y{{end}}{{end}}\n\
                    {{- end}}\n";
        let split = split("l.html", text)?;
        assert_eq!(split.blocks.len(), 1);
        assert_eq!(split.blocks[0].0, "list");
        assert!(split.main.is_none());
        Ok(())
    }

    #[test]
    fn test_split_comments_and_space_are_empty_main() -> Result<()> {
        let text = "\n{{/* shared blocks */}}\n{{define \"a\"}}A{{end}}\n  \n";
        let split = split("l.html", text)?;
        assert!(split.main.is_none());
        Ok(())
    }

    #[test]
    fn test_split_literal_braces_in_string() -> Result<()> {
        let text = "{{define \"a\"}}{{print \"}}\" }}{{end}}";
        let split = split("l.html", text)?;
        assert_eq!(&*split.blocks[0].1, text);
        Ok(())
    }

    #[test]
    fn test_split_define_without_space() -> Result<()> {
        let split = split("l.html", "{{define\"x\"}}y{{end}}main")?;
        assert_eq!(split.blocks[0].0, "x");
        assert_eq!(split.main.as_deref(), Some("main"));
        Ok(())
    }

    #[test]
    fn test_split_applies_trim_markers_to_main() -> Result<()> {
        let text = "<p>\n  {{- define \"a\"}}A\n{{end -}}\n  </p>";
        let split = split("l.html", text)?;
        assert_eq!(split.main.as_deref(), Some("<p>{{/*\n*/}}</p>"));

        let layout = Layout::parse("l.html", text, SystemTime::UNIX_EPOCH, &Layout::base())?;
        assert_eq!(layout.instantiate(scope()).render(page("x"))?, "<p></p>");
        Ok(())
    }

    #[test]
    fn test_split_errors() {
        let cases = [
            ("a\n{{define \"x\"}}b", "l.html:2: unterminated define \"x\""),
            ("{{end}}", "l.html:1: unexpected {{end}}"),
            (
                "{{define \"x\"}}\n{{define \"y\"}}{{end}}{{end}}",
                "l.html:2: nested define",
            ),
            ("a\n\n{{.Title", "l.html:3: unclosed action"),
        ];
        for (text, expected) in cases.iter() {
            match split("l.html", text) {
                Err(err) => assert_eq!(&err.to_string(), expected),
                Ok(split) => panic!("expected error for {:?}, got {:?}", text, split),
            }
        }
    }

    #[test]
    fn test_child_overrides_block_and_inherits_main() -> Result<()> {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(50);
        let base = Layout::parse(
            "base.html",
            "{{define \"body\"}}base{{end}}[{{template \"body\" .}}]",
            t0,
            &Layout::base(),
        )?;
        let child = Layout::parse("child.html", "{{define \"body\"}}child{{end}}\n", t1, &base)?;

        assert!(child.has_main());
        assert!(child.has_block("body"));
        assert_eq!(child.mod_time(), Some(t0));

        let scope = scope();
        let out = child.instantiate(Rc::clone(&scope)).render(page("x"))?;
        assert_eq!(out, "[child]");
        let out = base.instantiate(scope).render(page("x"))?;
        assert_eq!(out, "[base]");
        Ok(())
    }

    #[test]
    fn test_execute_block() -> Result<()> {
        let layout = Layout::parse(
            "base.html",
            "{{define \"body\"}}Title: {{.Title}}{{end}}",
            SystemTime::UNIX_EPOCH,
            &Layout::base(),
        )?;
        assert!(!layout.has_main());
        let out = layout.instantiate(scope()).execute_block("body", page("Hi"))?;
        assert_eq!(out, "Title: Hi");
        Ok(())
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = Layout::parse(
            "bad.html",
            "{{if .Title}}",
            SystemTime::UNIX_EPOCH,
            &Layout::base(),
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("bad.html: "), "{}", err);
    }
}
