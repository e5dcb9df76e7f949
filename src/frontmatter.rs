//! Detects, decodes and masks the YAML front matter at the start of a file.
//!
//! Front matter is fenced by `---` lines. The opening fence may be preceded by
//! whitespace; the closing fence is a line holding only `---`:
//!
//! ```text
//! ---
//! Title: Hello, world!
//! Layout: /layout/base.html
//! ---
//! <p>Body</p>
//! ```
//!
//! The byte offset of each top-level key's value is kept, so callers can
//! point errors about a value at the line it came from.
//!
//! After a successful decode every byte of the front matter except line breaks
//! is overwritten with a space, so the remaining body keeps its original line
//! numbers for later error reporting.

use serde::de::DeserializeOwned;

const FENCE: &[u8] = b"---";

/// Byte offsets of a front matter block within a file.
struct Fences {
    /// Start of the YAML text (first byte after the opening fence line).
    yaml_start: usize,

    /// End of the YAML text (start of the closing fence line).
    yaml_stop: usize,

    /// End of the closing fence, excluding its line break.
    end: usize,
}

fn find_fences(data: &[u8]) -> Option<Fences> {
    let open = data.iter().position(|b| !b.is_ascii_whitespace())?;
    if !data[open..].starts_with(FENCE) {
        return None;
    }
    let yaml_start = line_end(data, open + FENCE.len())?;

    let mut line_start = yaml_start;
    while line_start < data.len() {
        let next = data[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(data.len(), |i| line_start + i);
        let line = &data[line_start..next];
        if trim_end(line) == FENCE {
            return Some(Fences {
                yaml_start,
                yaml_stop: line_start,
                end: line_start + trim_end(line).len(),
            });
        }
        line_start = next + 1;
    }
    None
}

/// Returns the offset following the line break that ends the line at `pos`,
/// provided the rest of that line is blank.
fn line_end(data: &[u8], pos: usize) -> Option<usize> {
    for (i, &b) in data[pos..].iter().enumerate() {
        match b {
            b'\n' => return Some(pos + i + 1),
            b' ' | b'\t' | b'\r' => {}
            _ => return None,
        }
    }
    None
}

fn trim_end(line: &[u8]) -> &[u8] {
    let n = line
        .iter()
        .rev()
        .take_while(|b| matches!(b, b' ' | b'\t' | b'\r'))
        .count();
    &line[..line.len() - n]
}

/// Decoded front matter.
#[derive(Debug)]
pub struct FrontMatter<T> {
    pub value: T,
    keys: Vec<(String, usize)>,
}

impl<T> FrontMatter<T> {
    /// Returns the offset within the file of the value of top-level `key`,
    /// or of the key itself when its value is on a later line.
    pub fn offset(&self, key: &str) -> Option<usize> {
        self.keys
            .iter()
            .find(|(name, _)| name == key)
            .map(|&(_, offset)| offset)
    }
}

/// Records the top-level `key: value` lines of the YAML between `start` and
/// `stop`.
fn key_offsets(data: &[u8], start: usize, stop: usize) -> Vec<(String, usize)> {
    let mut keys = Vec::new();
    let mut line_start = start;
    while line_start < stop {
        let next = data[line_start..stop]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(stop, |i| line_start + i);
        let line = &data[line_start..next];
        let top_level = matches!(line.first(), Some(&b) if !b.is_ascii_whitespace() && b != b'#' && b != b'-');
        if let (true, Some(colon)) = (top_level, line.iter().position(|&b| b == b':')) {
            let key = String::from_utf8_lossy(&line[..colon]).trim().to_owned();
            let rest = &line[colon + 1..];
            let space = rest.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
            let offset = if trim_end(&rest[space..]).is_empty() {
                line_start
            } else {
                line_start + colon + 1 + space
            };
            keys.push((key, offset));
        }
        line_start = next + 1;
    }
    keys
}

/// Decodes the front matter of `data` into `T`, then masks it in place.
/// Returns `None`, leaving `data` untouched, when there is no front matter.
pub fn extract<T: DeserializeOwned>(path: &str, data: &mut [u8]) -> Result<Option<FrontMatter<T>>> {
    let fences = match find_fences(data) {
        None => return Ok(None),
        Some(fences) => fences,
    };

    let yaml = &data[fences.yaml_start..fences.yaml_stop];
    let decoded = if yaml.iter().all(|b| b.is_ascii_whitespace()) {
        serde_yaml::from_str::<T>("{}")
    } else {
        serde_yaml::from_slice::<T>(yaml)
    };
    let value = decoded.map_err(|err| {
        let offset = fences.yaml_start + err.location().map_or(0, |l| l.index());
        let mut message = err.to_string();
        if let Some(i) = message.rfind(" at line ") {
            message.truncate(i);
        }
        Error::Decode {
            path: path.to_owned(),
            line: line_of(data, offset),
            message,
        }
    })?;

    let keys = key_offsets(data, fences.yaml_start, fences.yaml_stop);
    for b in &mut data[..fences.end] {
        if *b != b'\n' {
            *b = b' ';
        }
    }
    Ok(Some(FrontMatter { value, keys }))
}

fn line_of(data: &[u8], offset: usize) -> usize {
    1 + data[..offset.min(data.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returned when front matter is present but cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{path}:{line}: {message}")]
    Decode {
        path: String,
        line: usize,
        message: String,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::PageMetadata;

    #[test]
    fn test_no_front_matter() -> Result<()> {
        let mut data = b"<p>hello</p>\n---\n".to_vec();
        let meta: Option<FrontMatter<PageMetadata>> = extract("p.html", &mut data)?;
        assert!(meta.is_none());
        assert_eq!(data, b"<p>hello</p>\n---\n");
        Ok(())
    }

    #[test]
    fn test_unterminated_front_matter_is_body() -> Result<()> {
        let mut data = b"---\nTitle: x\n".to_vec();
        let meta: Option<FrontMatter<PageMetadata>> = extract("p.html", &mut data)?;
        assert!(meta.is_none());
        Ok(())
    }

    #[test]
    fn test_decode_and_mask() -> Result<()> {
        let input = "\n---\nTitle: Hello\nLayout: base.html\n---  \nbody\n";
        let mut data = input.as_bytes().to_vec();
        let meta: PageMetadata = extract("p.html", &mut data)?.expect("front matter").value;
        assert_eq!(meta.title, "Hello");
        assert_eq!(meta.layout, "base.html");

        let masked = String::from_utf8(data).unwrap();
        assert_eq!(masked.len(), input.len());
        assert_eq!(masked.lines().count(), input.lines().count());
        assert!(masked.ends_with("\nbody\n"));
        assert!(masked.lines().take(5).all(|l| l.trim().is_empty()));
        Ok(())
    }

    #[test]
    fn test_empty_front_matter() -> Result<()> {
        let mut data = b"---\n---\nbody".to_vec();
        let meta: PageMetadata = extract("p.html", &mut data)?.expect("front matter").value;
        assert_eq!(meta, PageMetadata::default());
        assert_eq!(data, b"   \n   \nbody");
        Ok(())
    }

    #[test]
    fn test_key_offsets() -> Result<()> {
        let input = "---\nTitle: Hello\nParams:\n  Layout: nested\n# Layout: comment\nLayout:   base.html\n---\n";
        let mut data = input.as_bytes().to_vec();
        let front: FrontMatter<PageMetadata> = extract("p.html", &mut data)?.expect("front matter");
        assert_eq!(front.offset("Title"), Some(input.find("Hello").unwrap()));
        assert_eq!(front.offset("Params"), Some(input.find("Params").unwrap()));
        assert_eq!(front.offset("Layout"), Some(input.find("base.html").unwrap()));
        assert_eq!(front.offset("Subtitle"), None);
        Ok(())
    }

    #[test]
    fn test_unknown_field_reports_line() {
        let mut data = b"---\nTitle: x\nBogus: y\n---\nbody\n".to_vec();
        let err = extract::<PageMetadata>("p.html", &mut data).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("p.html:3: "), "{}", msg);
        assert!(msg.contains("Bogus"), "{}", msg);
        assert!(data.starts_with(b"---\n"), "data must not be masked on error");
    }
}
