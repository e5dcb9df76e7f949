//! Helper functions available to every layout, and the per-page [`Scope`]
//! they run in.
//!
//! `gtmpl` helpers are plain function pointers, so they cannot capture the
//! page being built. The page's scope is instead bound to the current thread
//! for the duration of one template execution ([`bind`]); helpers fetch it
//! from there. A helper that fails records its error in the scope, so the
//! caller can report it in place of the engine's wrapped message.

use crate::action::{Command, LocationContext};
use crate::registry::Registry;
use gtmpl::Template;
use gtmpl_value::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

type Func = fn(&[Value]) -> std::result::Result<Value, String>;

const FUNCS: &[(&str, Func)] = &[
    ("makeSlice", make_slice),
    ("dict", dict),
    ("timeNow", time_now),
    ("arg", arg),
    ("argOr", arg_or),
    ("argInt", arg_int),
    ("argIntOr", arg_int_or),
    ("include", include),
    ("includeHTML", include),
    ("includeHTMLAttr", include),
    ("includeCSS", include),
    ("includeJS", include),
    ("includeJSStr", include),
    ("readJSON", read_json),
    ("readPage", read_page),
    ("readPages", read_pages),
    ("glob", glob),
    ("pathBase", path_base),
    ("pathDir", path_dir),
    ("pathJoin", path_join),
    ("stringTrimPrefix", string_trim_prefix),
    ("stringTrimSuffix", string_trim_suffix),
    ("stringTrimSpace", string_trim_space),
    ("stringReplaceAll", string_replace_all),
    ("scratchSet", scratch_set),
    ("scratchGet", scratch_get),
    ("scratchHas", scratch_has),
    ("scratchDelete", scratch_delete),
    ("scratchAppend", scratch_append),
];

/// Registers every helper with `template`. Must happen before parsing, since
/// the engine rejects calls to unknown functions.
pub fn register(template: &mut Template) {
    for (name, func) in FUNCS {
        template.add_func(name, *func);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Scope>>> = RefCell::new(None);
}

/// Binds `scope` to the current thread until the returned guard is dropped.
/// The previous binding, if any, is restored on drop.
pub fn bind(scope: Rc<Scope>) -> Bound {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(scope));
    Bound { previous }
}

pub struct Bound {
    previous: Option<Rc<Scope>>,
}

impl Drop for Bound {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// The arguments of the `t:` action currently executing a block, with the
/// source they came from.
#[derive(Clone, Debug)]
pub struct ActionContext {
    command: Command,
    lc: LocationContext,
}

impl ActionContext {
    pub fn new(command: Command, lc: LocationContext) -> ActionContext {
        ActionContext { command, lc }
    }

    pub fn location(&self) -> String {
        self.command.location(&self.lc)
    }

    /// Returns the text of argument `name`, failing at the action's location
    /// when it is absent.
    pub fn get_required_str(&self, name: &str) -> Result<&str> {
        match self.command.args.get(name) {
            Some(value) => Ok(&value.text),
            None => Err(Error::RequiredArgument {
                location: self.location(),
                name: name.to_owned(),
            }),
        }
    }

    pub fn get_str_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.command
            .args
            .get(name)
            .map_or(default, |value| value.text.as_str())
    }

    pub fn get_required_int(&self, name: &str) -> Result<i64> {
        self.get_required_str(name)?;
        self.get_int_or(name, 0)
    }

    /// Returns argument `name` parsed as an integer, or `default` when it is
    /// absent. A malformed value fails at the value's location.
    pub fn get_int_or(&self, name: &str, default: i64) -> Result<i64> {
        match self.command.args.get(name) {
            None => Ok(default),
            Some(value) => value.text.trim().parse().map_err(|_| Error::InvalidInt {
                location: value.location(&self.lc),
                text: value.text.clone(),
            }),
        }
    }

    /// The arguments as an object mapping each name to its text.
    pub fn args_value(&self) -> Value {
        Value::Object(
            self.command
                .args
                .iter()
                .map(|(name, value)| (name.clone(), Value::String(value.text.clone())))
                .collect(),
        )
    }
}

/// Everything helpers may know about the page being built.
pub struct Scope {
    root: PathBuf,
    file_dir: PathBuf,
    url_dir: String,
    trees: Vec<PathBuf>,
    registry: Arc<Registry>,
    mod_time: Cell<Option<SystemTime>>,
    action: RefCell<Option<ActionContext>>,
    error: RefCell<Option<Error>>,
    scratch: RefCell<HashMap<String, Value>>,
}

impl Scope {
    /// Creates the scope for a page whose file lives in `file_dir` and whose
    /// URL lives under `url_dir` (which ends in `/`). Absolute file references
    /// resolve against the site `root`.
    pub fn new(root: PathBuf, file_dir: PathBuf, url_dir: String, registry: Arc<Registry>) -> Scope {
        Scope {
            root,
            file_dir,
            url_dir,
            trees: Vec::new(),
            registry,
            mod_time: Cell::new(None),
            action: RefCell::new(None),
            error: RefCell::new(None),
            scratch: RefCell::new(HashMap::new()),
        }
    }

    /// Sets the directories `glob` searches. Each is the root of the site's
    /// URL space.
    pub fn with_trees(mut self, trees: Vec<PathBuf>) -> Scope {
        self.trees = trees;
        self
    }

    /// Sets the action whose arguments the `arg*` helpers read.
    pub fn set_action(&self, action: Option<ActionContext>) {
        *self.action.borrow_mut() = action;
    }

    /// The latest modification time of anything helpers have read.
    pub fn mod_time(&self) -> Option<SystemTime> {
        self.mod_time.get()
    }

    /// Removes and returns the first error recorded by a helper.
    pub fn take_error(&self) -> Option<Error> {
        self.error.borrow_mut().take()
    }

    fn touch(&self, t: SystemTime) {
        let latest = self.mod_time.get().map_or(t, |m| m.max(t));
        self.mod_time.set(Some(latest));
    }

    fn touch_file(&self, path: &Path) {
        if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
            self.touch(modified);
        }
    }

    fn record(&self, err: Error) {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn locate(&self, err: Error) -> Error {
        match (err, &*self.action.borrow()) {
            (Error::Helper { func, message }, Some(action)) => Error::Call {
                location: action.location(),
                func,
                message,
            },
            (err, _) => err,
        }
    }

    fn with_action<T>(&self, func: &'static str, f: impl FnOnce(&ActionContext) -> Result<T>) -> Result<T> {
        match &*self.action.borrow() {
            Some(action) => f(action),
            None => Err(fail(func, "no action in progress")),
        }
    }

    /// Resolves a page reference: absolute as given, otherwise against the
    /// page's URL directory. A trailing `/` is kept.
    fn url_path(&self, reference: &str) -> String {
        let joined = if reference.starts_with('/') {
            clean(reference)
        } else {
            clean(&format!("{}{}", self.url_dir, reference))
        };
        if reference.ends_with('/') && !joined.ends_with('/') {
            joined + "/"
        } else {
            joined
        }
    }

    fn file_path(&self, reference: &str) -> PathBuf {
        match reference.strip_prefix('/') {
            Some(rest) => self.root.join(rest),
            None => self.file_dir.join(reference),
        }
    }
}

/// Runs the body of helper `func` against the bound scope, recording any
/// failure in the scope.
fn call(
    func: &'static str,
    f: impl FnOnce(&Scope) -> Result<Value>,
) -> std::result::Result<Value, String> {
    let scope = match CURRENT.with(|current| current.borrow().clone()) {
        Some(scope) => scope,
        None => return Err(format!("{}: called outside of a page", func)),
    };
    f(&scope).map_err(|err| {
        let err = scope.locate(err);
        let message = err.to_string();
        scope.record(err);
        message
    })
}

fn fail(func: &'static str, message: impl Into<String>) -> Error {
    Error::Helper {
        func,
        message: message.into(),
    }
}

fn string_at(func: &'static str, args: &[Value], i: usize) -> Result<String> {
    match args.get(i) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(fail(
            func,
            format!("argument {} must be a string, got {:?}", i + 1, other),
        )),
        None => Err(fail(func, format!("missing argument {}", i + 1))),
    }
}

fn int_at(func: &'static str, args: &[Value], i: usize) -> Result<i64> {
    match args.get(i) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| fail(func, format!("argument {} must be an integer", i + 1))),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| fail(func, format!("argument {} must be an integer", i + 1))),
        Some(other) => Err(fail(
            func,
            format!("argument {} must be an integer, got {:?}", i + 1, other),
        )),
        None => Err(fail(func, format!("missing argument {}", i + 1))),
    }
}

fn arg(args: &[Value]) -> std::result::Result<Value, String> {
    call("arg", |scope| {
        let name = string_at("arg", args, 0)?;
        scope.with_action("arg", |action| {
            action
                .get_required_str(&name)
                .map(|text| Value::String(text.to_owned()))
        })
    })
}

fn arg_or(args: &[Value]) -> std::result::Result<Value, String> {
    call("argOr", |scope| {
        let name = string_at("argOr", args, 0)?;
        let default = string_at("argOr", args, 1)?;
        scope.with_action("argOr", |action| {
            Ok(Value::String(action.get_str_or(&name, &default).to_owned()))
        })
    })
}

fn arg_int(args: &[Value]) -> std::result::Result<Value, String> {
    call("argInt", |scope| {
        let name = string_at("argInt", args, 0)?;
        scope.with_action("argInt", |action| action.get_required_int(&name).map(Value::from))
    })
}

fn arg_int_or(args: &[Value]) -> std::result::Result<Value, String> {
    call("argIntOr", |scope| {
        let name = string_at("argIntOr", args, 0)?;
        let default = int_at("argIntOr", args, 1)?;
        scope.with_action("argIntOr", |action| {
            action.get_int_or(&name, default).map(Value::from)
        })
    })
}

fn include(args: &[Value]) -> std::result::Result<Value, String> {
    call("include", |scope| {
        let reference = string_at("include", args, 0)?;
        let path = scope.file_path(&reference);
        let text = std::fs::read_to_string(&path)
            .map_err(|err| fail("include", format!("{}: {}", path.display(), err)))?;
        scope.touch_file(&path);
        Ok(Value::String(text))
    })
}

fn read_json(args: &[Value]) -> std::result::Result<Value, String> {
    call("readJSON", |scope| {
        let reference = string_at("readJSON", args, 0)?;
        let path = scope.file_path(&reference);
        let file = std::fs::File::open(&path)
            .map_err(|err| fail("readJSON", format!("{}: {}", path.display(), err)))?;
        scope.touch_file(&path);
        let json: serde_json::Value = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|err| fail("readJSON", format!("{}: {}", path.display(), err)))?;
        Ok(json_to_value(&json))
    })
}

fn json_to_value(v: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match v {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(a) => Value::Array(a.iter().map(json_to_value).collect()),
        Json::Object(m) => Value::Object(
            m.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

fn make_slice(args: &[Value]) -> std::result::Result<Value, String> {
    Ok(Value::Array(args.to_vec()))
}

/// Builds an object from alternating keys and values.
fn dict(args: &[Value]) -> std::result::Result<Value, String> {
    call("dict", |_| {
        if args.len() % 2 != 0 {
            return Err(fail("dict", "must have even number of arguments"));
        }
        let mut m = HashMap::new();
        for pair in args.chunks(2) {
            match &pair[0] {
                Value::String(key) => {
                    m.insert(key.clone(), pair[1].clone());
                }
                other => return Err(fail("dict", format!("key {:?} is not a string", other))),
            }
        }
        Ok(Value::Object(m))
    })
}

fn time_now(_: &[Value]) -> std::result::Result<Value, String> {
    Ok(Value::String(
        chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    ))
}

fn read_page(args: &[Value]) -> std::result::Result<Value, String> {
    call("readPage", |scope| {
        let path = scope.url_path(&string_at("readPage", args, 0)?);
        let page = scope
            .registry
            .lookup(&path)
            .ok_or_else(|| fail("readPage", format!("no page at {}", path)))?;
        scope.touch(page.mod_time);
        Ok(Value::from(&*page))
    })
}

fn read_pages(args: &[Value]) -> std::result::Result<Value, String> {
    call("readPages", |scope| {
        let pattern = scope.url_path(&string_at("readPages", args, 0)?);
        let mut pages = scope
            .registry
            .glob_match(&pattern)
            .map_err(|err| fail("readPages", err.to_string()))?;
        pages.sort_by(|a, b| a.meta.path.cmp(&b.meta.path));

        for i in 1..args.len() {
            let option = string_at("readPages", args, i)?;
            match option.as_str() {
                "sort:-Created" => pages.sort_by(|a, b| b.meta.created.cmp(&a.meta.created)),
                "sort:Path" => pages.sort_by(|a, b| a.meta.path.cmp(&b.meta.path)),
                _ => match option.strip_prefix("limit:") {
                    Some(n) => {
                        let n: usize = n
                            .parse()
                            .map_err(|_| fail("readPages", format!("invalid limit {:?}", n)))?;
                        pages.truncate(n);
                    }
                    None => return Err(fail("readPages", format!("invalid option {:?}", option))),
                },
            }
        }

        for page in &pages {
            scope.touch(page.mod_time);
        }
        Ok(Value::Array(
            pages.iter().map(|page| Value::from(&**page)).collect(),
        ))
    })
}

/// Lists the files matching a URL pattern in every tree of the scope, as
/// URL paths. Relative patterns yield paths relative to the page's URL
/// directory.
fn glob(args: &[Value]) -> std::result::Result<Value, String> {
    call("glob", |scope| {
        let reference = string_at("glob", args, 0)?;
        let pattern = scope.url_path(&reference);
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let mut paths = BTreeSet::new();
        for tree in &scope.trees {
            let tree_pattern = format!(
                "{}{}",
                glob::Pattern::escape(&tree.to_string_lossy()),
                pattern
            );
            let entries = glob::glob_with(&tree_pattern, options)
                .map_err(|err| fail("glob", format!("invalid pattern {:?}: {}", reference, err.msg)))?;
            for entry in entries {
                let file = entry.map_err(|err| fail("glob", err.to_string()))?;
                let relative = match file.strip_prefix(tree) {
                    Ok(relative) => relative,
                    Err(_) => continue,
                };
                scope.touch_file(&file);
                let mut url = String::new();
                for component in relative.components() {
                    url.push('/');
                    url.push_str(&component.as_os_str().to_string_lossy());
                }
                paths.insert(url);
            }
        }

        let paths = paths.into_iter().map(|url| {
            if reference.starts_with('/') {
                url
            } else {
                url.strip_prefix(scope.url_dir.as_str())
                    .map(str::to_owned)
                    .unwrap_or(url)
            }
        });
        Ok(Value::Array(paths.map(Value::String).collect()))
    })
}

fn path_base(args: &[Value]) -> std::result::Result<Value, String> {
    call("pathBase", |_| Ok(Value::String(base(&string_at("pathBase", args, 0)?))))
}

fn path_dir(args: &[Value]) -> std::result::Result<Value, String> {
    call("pathDir", |_| Ok(Value::String(dir(&string_at("pathDir", args, 0)?))))
}

fn path_join(args: &[Value]) -> std::result::Result<Value, String> {
    call("pathJoin", |_| {
        let parts = (0..args.len())
            .map(|i| string_at("pathJoin", args, i))
            .collect::<Result<Vec<String>>>()?;
        Ok(Value::String(join(&parts)))
    })
}

fn string_trim_prefix(args: &[Value]) -> std::result::Result<Value, String> {
    call("stringTrimPrefix", |_| {
        let s = string_at("stringTrimPrefix", args, 0)?;
        let prefix = string_at("stringTrimPrefix", args, 1)?;
        Ok(Value::String(
            s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_owned(),
        ))
    })
}

fn string_trim_suffix(args: &[Value]) -> std::result::Result<Value, String> {
    call("stringTrimSuffix", |_| {
        let s = string_at("stringTrimSuffix", args, 0)?;
        let suffix = string_at("stringTrimSuffix", args, 1)?;
        Ok(Value::String(
            s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_owned(),
        ))
    })
}

fn string_trim_space(args: &[Value]) -> std::result::Result<Value, String> {
    call("stringTrimSpace", |_| {
        Ok(Value::String(
            string_at("stringTrimSpace", args, 0)?.trim().to_owned(),
        ))
    })
}

fn string_replace_all(args: &[Value]) -> std::result::Result<Value, String> {
    call("stringReplaceAll", |_| {
        let s = string_at("stringReplaceAll", args, 0)?;
        let old = string_at("stringReplaceAll", args, 1)?;
        let new = string_at("stringReplaceAll", args, 2)?;
        Ok(Value::String(s.replace(old.as_str(), &new)))
    })
}

fn scratch_set(args: &[Value]) -> std::result::Result<Value, String> {
    call("scratchSet", |scope| {
        let key = string_at("scratchSet", args, 0)?;
        let value = args
            .get(1)
            .cloned()
            .ok_or_else(|| fail("scratchSet", "missing value"))?;
        scope.scratch.borrow_mut().insert(key, value);
        Ok(Value::String(String::new()))
    })
}

fn scratch_get(args: &[Value]) -> std::result::Result<Value, String> {
    call("scratchGet", |scope| {
        let key = string_at("scratchGet", args, 0)?;
        Ok(scope
            .scratch
            .borrow()
            .get(&key)
            .cloned()
            .unwrap_or(Value::Nil))
    })
}

fn scratch_has(args: &[Value]) -> std::result::Result<Value, String> {
    call("scratchHas", |scope| {
        let key = string_at("scratchHas", args, 0)?;
        Ok(Value::Bool(scope.scratch.borrow().contains_key(&key)))
    })
}

fn scratch_delete(args: &[Value]) -> std::result::Result<Value, String> {
    call("scratchDelete", |scope| {
        let key = string_at("scratchDelete", args, 0)?;
        scope.scratch.borrow_mut().remove(&key);
        Ok(Value::String(String::new()))
    })
}

fn scratch_append(args: &[Value]) -> std::result::Result<Value, String> {
    call("scratchAppend", |scope| {
        let key = string_at("scratchAppend", args, 0)?;
        let value = args
            .get(1)
            .cloned()
            .ok_or_else(|| fail("scratchAppend", "missing value"))?;
        let mut scratch = scope.scratch.borrow_mut();
        match scratch.get_mut(&key) {
            None => {
                scratch.insert(key, Value::Array(vec![value]));
            }
            Some(Value::Array(values)) => values.push(value),
            Some(_) => {
                return Err(fail(
                    "scratchAppend",
                    format!("value for {:?} is not a list", key),
                ))
            }
        }
        Ok(Value::String(String::new()))
    })
}

/// Returns the shortest slash-separated path equivalent to `p`, processing
/// `.` and `..` lexically. The empty path cleans to `.`.
pub fn clean(p: &str) -> String {
    let rooted = p.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            part => parts.push(part),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

/// Returns the last element of `p`, ignoring trailing slashes.
pub fn base(p: &str) -> String {
    if p.is_empty() {
        return ".".to_owned();
    }
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_owned();
    }
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_owned(),
        None => trimmed.to_owned(),
    }
}

/// Returns all but the last element of `p`, cleaned.
pub fn dir(p: &str) -> String {
    match p.rfind('/') {
        Some(i) => clean(&p[..i + 1]),
        None => ".".to_owned(),
    }
}

/// Joins the non-empty elements with slashes and cleans the result. Joining
/// nothing but empty elements yields the empty string.
pub fn join<S: AsRef<str>>(parts: &[S]) -> String {
    let parts: Vec<&str> = parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        clean(&parts.join("/"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("{location}: required argument not found: {name}")]
    RequiredArgument { location: String, name: String },

    #[error("{location}: invalid integer {text:?}")]
    InvalidInt { location: String, text: String },

    /// A helper failed while a `t:` action was executing.
    #[error("{location}: {func}: {message}")]
    Call {
        location: String,
        func: &'static str,
        message: String,
    },

    #[error("{func}: {message}")]
    Helper { func: &'static str, message: String },
}
