//! Defines [`PageMetadata`], the per-page record decoded from front matter
//! and amended by `set` actions, and [`Page`], the record kept in the
//! [`crate::registry::Registry`] once a page is built. Both convert into
//! [`Value`]s for templating.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use gtmpl_value::Value;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

/// Page front matter. Unknown keys are rejected when decoding.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PageMetadata {
    /// The page's title.
    #[serde(default, rename = "Title")]
    pub title: String,

    /// The page's subtitle.
    #[serde(default, rename = "Subtitle")]
    pub subtitle: String,

    /// The page creation time.
    #[serde(default, rename = "Created")]
    pub created: Option<DateTime<FixedOffset>>,

    /// The time the page was last updated.
    #[serde(default, rename = "Updated")]
    pub updated: Option<DateTime<FixedOffset>>,

    /// Reference to the layout applied to this page, or empty for none.
    /// Relative references resolve against the page's directory.
    #[serde(default, rename = "Layout")]
    pub layout: String,

    /// The final output path. Empty in front matter means "keep the path the
    /// page was discovered under".
    #[serde(default, rename = "Path")]
    pub path: String,

    /// Arbitrary data for use by layouts.
    #[serde(default, rename = "Params")]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl PageMetadata {
    /// Returns the fields layouts see for a page: `Title`, `Subtitle`,
    /// `Created`, `Updated`, `Layout`, `Path` and `Params`. Unset times are
    /// [`Value::Nil`].
    pub fn fields(&self) -> HashMap<String, Value> {
        let mut m: HashMap<String, Value> = HashMap::new();
        m.insert("Title".to_owned(), Value::String(self.title.clone()));
        m.insert("Subtitle".to_owned(), Value::String(self.subtitle.clone()));
        m.insert("Created".to_owned(), time_value(&self.created));
        m.insert("Updated".to_owned(), time_value(&self.updated));
        m.insert("Layout".to_owned(), Value::String(self.layout.clone()));
        m.insert("Path".to_owned(), Value::String(self.path.clone()));
        m.insert(
            "Params".to_owned(),
            Value::Map(
                self.params
                    .iter()
                    .map(|(k, v)| (k.clone(), yaml_to_value(v)))
                    .collect(),
            ),
        );
        m
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields())
    }
}

fn time_value(t: &Option<DateTime<FixedOffset>>) -> Value {
    match t {
        Some(t) => Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        None => Value::Nil,
    }
}

/// Converts decoded YAML into a template value. Mapping keys that are not
/// strings are dropped.
pub fn yaml_to_value(v: &serde_yaml::Value) -> Value {
    use serde_yaml::Value as Yaml;
    match v {
        Yaml::Null => Value::Nil,
        Yaml::Bool(b) => Value::Bool(*b),
        Yaml::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().unwrap_or_default()),
        },
        Yaml::String(s) => Value::String(s.clone()),
        Yaml::Sequence(seq) => Value::Array(seq.iter().map(yaml_to_value).collect()),
        Yaml::Mapping(m) => Value::Map(
            m.iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_owned(), yaml_to_value(v))))
                .collect(),
        ),
    }
}

/// A built page as seen by other pages through the registry.
#[derive(Clone, Debug)]
pub struct Page {
    /// Metadata after front matter and `set` actions were applied.
    /// `meta.path` is the final output path.
    pub meta: PageMetadata,

    /// The path the page was discovered under. Differs from `meta.path` when
    /// the page overrode its path.
    pub source_path: String,

    /// Aggregate modification time of the page and everything it depends on.
    pub mod_time: SystemTime,
}

impl From<&Page> for Value {
    /// Converts a [`Page`] into the same value layouts see for the page being
    /// rendered, minus its content.
    fn from(p: &Page) -> Value {
        p.meta.to_value()
    }
}
