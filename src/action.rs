//! Parses the action language embedded in page files.
//!
//! An action consists of `<%`, optional whitespace, an action name, zero or
//! more arguments, optional whitespace and a `%>`. Everything outside of
//! actions is literal text.
//!
//! * An action name is a letter followed by zero or more letters, digits,
//!   `-`, `:` or `_`.
//! * An argument is whitespace, an argument name, and an optional value
//!   clause. Argument names follow the action name grammar except that they
//!   may also start with `_`.
//! * A value clause is optional whitespace, `=`, optional whitespace and a
//!   value. A value is single-quoted, double-quoted, or unquoted. An
//!   unquoted value is a non-empty run of characters excluding whitespace,
//!   `"`, `'`, `` ` ``, `=` and any character of either delimiter.
//!
//! Values are unescaped using HTML rules. Every action and value records the
//! byte offset at which it starts; offsets are resolved to `path:line:col`
//! through the [`LocationContext`] returned alongside the actions.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

const LEFT_DELIM: &str = "<%";
const RIGHT_DELIM: &str = "%>";

/// One parsed unit of a page: literal text or a named command.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// A span of literal bytes in the source buffer, emitted verbatim.
    Text(Range<usize>),

    /// A named, argument-bearing instruction.
    Command(Command),
}

/// Argument name to value. Duplicate names in the source overwrite earlier
/// ones.
pub type Args = HashMap<String, ArgumentValue>;

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Args,
    pos: usize,
}

impl Command {
    /// Returns the `path:line:col` location of the command name.
    pub fn location(&self, lc: &LocationContext) -> String {
        lc.location(self.pos)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentValue {
    /// The HTML-unescaped value.
    pub text: String,
    pos: usize,
}

impl ArgumentValue {
    /// Returns the `path:line:col` location of the value.
    pub fn location(&self, lc: &LocationContext) -> String {
        lc.location(self.pos)
    }
}

/// The original source of a parsed file. Locations are computed on demand
/// against these bytes, so the context is shared rather than copied into each
/// action.
#[derive(Clone, Debug)]
pub struct LocationContext {
    path: Arc<str>,
    input: Arc<[u8]>,
}

impl LocationContext {
    pub fn new(path: &str, input: Arc<[u8]>) -> LocationContext {
        LocationContext {
            path: Arc::from(path),
            input,
        }
    }

    /// Returns the bytes of a [`Action::Text`] span.
    pub fn text(&self, span: &Range<usize>) -> &[u8] {
        &self.input[span.clone()]
    }

    /// Resolves a byte offset to `path:line:col`. The column is the distance
    /// from the preceding newline; on the first line it is the raw offset.
    pub fn location(&self, pos: usize) -> String {
        let before = &self.input[..pos.min(self.input.len())];
        let col = match before.iter().rposition(|&b| b == b'\n') {
            Some(nl) => pos - nl,
            None => pos,
        };
        let line = 1 + before.iter().filter(|&&b| b == b'\n').count();
        format!("{}:{}:{}", self.path, line, col)
    }
}

/// Parses `input` into actions. On failure no actions are returned; the error
/// carries the location of the malformed construct.
pub fn parse(
    input: impl Into<Arc<[u8]>>,
    path: &str,
) -> Result<(Vec<Action>, LocationContext)> {
    let lc = LocationContext::new(path, input.into());
    let actions = Scanner::new(&lc).scan()?;
    Ok((actions, lc))
}

struct Scanner<'a> {
    lc: &'a LocationContext,
    input: &'a [u8],
    pos: usize,
    left_delim: &'static [u8],
    right_delim: &'static [u8],
    unquote_terminators: Vec<char>,
}

impl<'a> Scanner<'a> {
    fn new(lc: &'a LocationContext) -> Scanner<'a> {
        let mut unquote_terminators: Vec<char> = " \t\r\n\"'`=".chars().collect();
        for c in LEFT_DELIM.chars().chain(RIGHT_DELIM.chars()) {
            if !unquote_terminators.contains(&c) {
                unquote_terminators.push(c);
            }
        }
        Scanner {
            lc,
            input: &lc.input,
            pos: 0,
            left_delim: LEFT_DELIM.as_bytes(),
            right_delim: RIGHT_DELIM.as_bytes(),
            unquote_terminators,
        }
    }

    fn error(&self, pos: usize, message: String) -> Error {
        Error::Syntax {
            location: self.lc.location(pos),
            message,
        }
    }

    fn rest(&self) -> &'a [u8] {
        let input = self.input;
        &input[self.pos..]
    }

    fn scan(&mut self) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        loop {
            let (span, more) = self.scan_text();
            if !span.is_empty() {
                actions.push(Action::Text(span));
            }
            if !more {
                return Ok(actions);
            }
            actions.push(Action::Command(self.scan_command()?));
        }
    }

    /// Scans literal text up to the next left delimiter or EOF. Returns the
    /// text span and whether a delimiter was found.
    fn scan_text(&mut self) -> (Range<usize>, bool) {
        let start = self.pos;
        match find(self.rest(), self.left_delim) {
            None => {
                self.pos = self.input.len();
                (start..self.pos, false)
            }
            Some(i) => {
                self.pos += i + self.left_delim.len();
                (start..start + i, true)
            }
        }
    }

    /// Skips ASCII whitespace and reports whether any was skipped.
    fn skip_space(&mut self) -> bool {
        let skipped = self
            .rest()
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
            .count();
        self.pos += skipped;
        skipped > 0
    }

    fn at_right_delim(&mut self) -> bool {
        if self.rest().starts_with(self.right_delim) {
            self.pos += self.right_delim.len();
            true
        } else {
            false
        }
    }

    fn scan_command(&mut self) -> Result<Command> {
        self.skip_space();
        let pos = self.pos;
        let name = self.scan_identifier(is_name_start, "action name")?;
        let mut args = Args::new();

        loop {
            let arg = match self.scan_argument_name()? {
                Some(arg) => arg,
                None => break,
            };
            if self.scan_equal()? {
                break;
            }
            let (pos, text) = self.scan_argument_value()?;
            args.insert(arg, ArgumentValue { text, pos });
        }

        Ok(Command { name, args, pos })
    }

    fn scan_identifier(&mut self, is_start: fn(char) -> bool, what: &str) -> Result<String> {
        match decode_char(self.rest()) {
            Some((c, _)) if is_start(c) => {}
            found => {
                return Err(self.error(
                    self.pos,
                    format!("expected start of {}, found {}", what, describe(found)),
                ))
            }
        }
        let start = self.pos;
        while let Some((c, w)) = decode_char(self.rest()) {
            if !is_name(c) {
                break;
            }
            self.pos += w;
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    /// Returns the next argument name, or `None` when the right delimiter
    /// ends the command.
    fn scan_argument_name(&mut self) -> Result<Option<String>> {
        let pos = self.pos;
        let skipped = self.skip_space();

        if self.at_right_delim() {
            return Ok(None);
        }
        if self.pos >= self.input.len() {
            return Err(self.error(pos, "reached EOF looking for argument name".to_owned()));
        }
        if !skipped {
            return Err(self.error(
                pos,
                "expected space before start of argument name".to_owned(),
            ));
        }
        self.scan_identifier(is_argument_name_start, "argument name")
            .map(Some)
    }

    /// Consumes `=`. Returns true if the right delimiter was found instead,
    /// which ends the command.
    fn scan_equal(&mut self) -> Result<bool> {
        let pos = self.pos;
        self.skip_space();

        if self.at_right_delim() {
            return Ok(true);
        }
        match decode_char(self.rest()) {
            None => Err(self.error(pos, "reached EOF looking for =".to_owned())),
            Some(('=', _)) => {
                self.pos += 1;
                Ok(false)
            }
            found => Err(self.error(pos, format!("expected =, found {}", describe(found)))),
        }
    }

    /// Returns the offset of the value (after leading whitespace) and its
    /// unescaped text.
    fn scan_argument_value(&mut self) -> Result<(usize, String)> {
        let pos = self.pos;
        self.skip_space();
        let start = self.pos;

        let raw = match self.rest().first() {
            None => {
                return Err(self.error(pos, "reached EOF looking for argument value".to_owned()))
            }
            Some(&q) if q == b'\'' || q == b'"' => self.scan_quoted_value(q)?,
            Some(_) => self.scan_unquoted_value()?,
        };
        Ok((start, html_escape::decode_html_entities(&raw).into_owned()))
    }

    fn scan_quoted_value(&mut self, quote: u8) -> Result<String> {
        let pos = self.pos;
        self.pos += 1;
        match self.rest().iter().position(|&b| b == quote) {
            None => Err(self.error(
                pos,
                format!("reached EOF looking for close quote {}", quote as char),
            )),
            Some(i) => {
                let value = String::from_utf8_lossy(&self.rest()[..i]).into_owned();
                self.pos += i + 1;
                Ok(value)
            }
        }
    }

    fn scan_unquoted_value(&mut self) -> Result<String> {
        let mut i = self.pos;
        while let Some((c, w)) = decode_char(&self.input[i..]) {
            if self.unquote_terminators.contains(&c) {
                if i == self.pos {
                    return Err(self.error(
                        self.pos,
                        format!("expected value following =, found {}", c),
                    ));
                }
                let value = String::from_utf8_lossy(&self.input[self.pos..i]).into_owned();
                self.pos = i;
                return Ok(value);
            }
            i += w;
        }
        Err(self.error(self.pos, "reached EOF looking for end of value".to_owned()))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decodes the character at the start of `input`. Invalid UTF-8 decodes as
/// U+FFFD with a width of one byte.
fn decode_char(input: &[u8]) -> Option<(char, usize)> {
    let first = *input.first()?;
    let width = match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => return Some((char::REPLACEMENT_CHARACTER, 1)),
    };
    match input.get(..width).map(std::str::from_utf8) {
        Some(Ok(s)) => s.chars().next().map(|c| (c, width)),
        _ => Some((char::REPLACEMENT_CHARACTER, 1)),
    }
}

fn describe(found: Option<(char, usize)>) -> String {
    match found {
        Some((c, _)) => c.to_string(),
        None => "EOF".to_owned(),
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic()
}

fn is_argument_name_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_name(c: char) -> bool {
    c == '-' || c == ':' || c == '_' || c.is_alphabetic() || c.is_numeric()
}

pub type Result<T> = std::result::Result<T, Error>;

/// A malformed action. Parsing stops at the first one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{location}: {message}")]
    Syntax { location: String, message: String },
}

#[cfg(test)]
mod test {
    use super::*;

    fn render(actions: &[Action], lc: &LocationContext) -> Vec<String> {
        actions
            .iter()
            .map(|action| match action {
                Action::Text(span) => {
                    format!("{:?}", String::from_utf8_lossy(lc.text(span)))
                }
                Action::Command(cmd) => {
                    let mut names: Vec<&String> = cmd.args.keys().collect();
                    names.sort();
                    let mut out = format!("{}:{}", cmd.location(lc), cmd.name);
                    for name in names {
                        let v = &cmd.args[name];
                        out.push_str(&format!(" {}:{}={:?}", v.location(lc), name, v.text));
                    }
                    out
                }
            })
            .collect()
    }

    fn parse_str(input: &str) -> Result<Vec<String>> {
        let (actions, lc) = parse(input.as_bytes().to_vec(), "x")?;
        Ok(render(&actions, &lc))
    }

    fn error_str(input: &str) -> String {
        match parse(input.as_bytes().to_vec(), "x") {
            Ok((actions, _)) => panic!("expected error, got {:?}", actions),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn test_parse_text_and_commands() -> Result<()> {
        let doc = "this is the first line\nand the second line\n<%a \nfoo=\"bar\"%>\n<% b quux='b'  %>\nand the fourth line\n";
        assert_eq!(
            parse_str(doc)?,
            vec![
                r#""this is the first line\nand the second line\n""#.to_owned(),
                r#"x:3:3:a x:4:5:foo="bar""#.to_owned(),
                r#""\n""#.to_owned(),
                r#"x:5:4:b x:5:11:quux="b""#.to_owned(),
                r#""\nand the fourth line\n""#.to_owned(),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_text_only() -> Result<()> {
        assert_eq!(parse_str("no actions here")?, vec![r#""no actions here""#]);
        assert!(parse_str("")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_adjacent_commands_drop_empty_text() -> Result<()> {
        assert_eq!(parse_str("<%a%><%b%>")?, vec!["x:1:2:a", "x:1:7:b"]);
        Ok(())
    }

    #[test]
    fn test_first_line_column_is_raw_offset() {
        let lc = LocationContext::new("p", Arc::from(&b"abc\ndef"[..]));
        assert_eq!(lc.location(0), "p:1:0");
        assert_eq!(lc.location(2), "p:1:2");
        assert_eq!(lc.location(5), "p:2:2");
    }

    #[test]
    fn test_values_are_html_unescaped() -> Result<()> {
        assert_eq!(
            parse_str(r#"<%a foo="a &amp; b" bar='&lt;x&gt;' baz=&quot;q%>"#)?,
            vec![r#"x:1:2:a x:1:24:bar="<x>" x:1:40:baz="\"q" x:1:8:foo="a & b""#]
        );
        Ok(())
    }

    #[test]
    fn test_unquoted_value_stops_at_delimiter_characters() -> Result<()> {
        assert_eq!(
            parse_str("<%a n=12%>")?,
            vec![r#"x:1:2:a x:1:6:n="12""#]
        );
        assert_eq!(
            parse_str("<%a n=1 m = two %>")?,
            vec![r#"x:1:2:a x:1:12:m="two" x:1:6:n="1""#]
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_arguments_last_wins() -> Result<()> {
        assert_eq!(
            parse_str(r#"<%a k="1" k="2"%>"#)?,
            vec![r#"x:1:2:a x:1:12:k="2""#]
        );
        Ok(())
    }

    #[test]
    fn test_argument_without_value_ends_command() -> Result<()> {
        assert_eq!(parse_str("<%a flag%>rest")?, vec!["x:1:2:a", r#""rest""#]);
        Ok(())
    }

    #[test]
    fn test_names_allow_punctuation() -> Result<()> {
        assert_eq!(
            parse_str("<%t:side-bar_2 _x=1 a:b-c=2%>")?,
            vec![r#"x:1:2:t:side-bar_2 x:1:18:_x="1" x:1:26:a:b-c="2""#]
        );
        Ok(())
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(
            error_str("<% 1a %>"),
            "x:1:3: expected start of action name, found 1"
        );
        assert_eq!(
            error_str("<%a foo=\"x\"bar=1%>"),
            "x:1:11: expected space before start of argument name"
        );
        assert_eq!(error_str("<%a foo bar%>"), "x:1:7: expected =, found b");
        assert_eq!(
            error_str("<%a foo==1%>"),
            "x:1:8: expected value following =, found ="
        );
        assert_eq!(
            error_str("line\n<%a\nfoo="),
            "x:3:5: reached EOF looking for argument value"
        );
        assert_eq!(
            error_str("<%a foo='x%>"),
            "x:1:8: reached EOF looking for close quote '"
        );
        assert_eq!(
            error_str("<%a foo=x"),
            "x:1:8: reached EOF looking for end of value"
        );
        assert_eq!(
            error_str("<%a"),
            "x:1:3: reached EOF looking for argument name"
        );
        assert_eq!(
            error_str("<%"),
            "x:1:2: expected start of action name, found EOF"
        );
    }
}
