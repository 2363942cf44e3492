//! Classification of readings into named sizes.
//!
//! A [`Classifier`] maps a reading to the nearest entry of a fixed set. The provided
//! [`LookupTable`] loads that set from JSON records of the form
//! `{ "reading": 159, "name": "1/16" }`, either as a list or as an object keyed by any
//! string. Readings may be integers or numeric strings. Keyed documents are read in
//! document order, so ties and duplicates resolve the same way as in a list.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AppResult;

/// A reading matched to a table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Table reading the value was matched to
    pub key: i64,
    /// Name of that entry
    pub label: String,
}

/// Maps readings onto a discrete label set.
pub trait Classifier: Send + Sync {
    /// Nearest classification for `value`, or `None` if there is nothing to match.
    fn classify(&self, value: i64) -> Option<Classification>;
}

/// Nearest-key lookup table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupTable {
    /// Entries in table order; readings are unique
    entries: Vec<(i64, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReadingField {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct LookupRecord {
    reading: ReadingField,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupDocument {
    List(Vec<LookupRecord>),
    Keyed(#[serde(deserialize_with = "records_in_document_order")] Vec<LookupRecord>),
}

/// Collect the values of a keyed document in the order they appear; keys are ignored.
fn records_in_document_order<'de, D>(deserializer: D) -> Result<Vec<LookupRecord>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{IgnoredAny, MapAccess, Visitor};

    struct KeyedVisitor;

    impl<'de> Visitor<'de> for KeyedVisitor {
        type Value = Vec<LookupRecord>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an object of lookup records")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut records = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((IgnoredAny, record)) = map.next_entry::<IgnoredAny, LookupRecord>()? {
                records.push(record);
            }
            Ok(records)
        }
    }

    deserializer.deserialize_map(KeyedVisitor)
}

impl LookupTable {
    /// Build a table from `(reading, name)` pairs. A repeated reading keeps the later name.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (reading, name) in entries {
            table.insert(reading, name.into());
        }
        table
    }

    /// Parse a JSON lookup document.
    pub fn from_json_str(json: &str) -> AppResult<Self> {
        let records = match serde_json::from_str::<LookupDocument>(json)? {
            LookupDocument::List(records) => records,
            LookupDocument::Keyed(records) => records,
        };

        let mut table = Self::default();
        for record in records {
            match parse_reading_field(&record.reading) {
                Some(reading) => table.insert(reading, record.name),
                None => warn!(name = %record.name, "Skipping lookup entry with non-numeric reading"),
            }
        }

        debug!(entries = table.len(), "Lookup table parsed");
        Ok(table)
    }

    /// Load a JSON lookup document from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in table order.
    pub fn entries(&self) -> impl Iterator<Item = (i64, &str)> {
        self.entries.iter().map(|(reading, name)| (*reading, name.as_str()))
    }

    fn insert(&mut self, reading: i64, name: String) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == reading) {
            Some(entry) => entry.1 = name,
            None => self.entries.push((reading, name)),
        }
    }
}

impl Classifier for LookupTable {
    fn classify(&self, value: i64) -> Option<Classification> {
        // Strict comparison keeps the earlier entry on ties
        let mut best: Option<&(i64, String)> = None;
        for entry in &self.entries {
            let closer = match best {
                None => true,
                Some((key, _)) => entry.0.abs_diff(value) < key.abs_diff(value),
            };
            if closer {
                best = Some(entry);
            }
        }

        best.map(|(key, label)| Classification {
            key: *key,
            label: label.clone(),
        })
    }
}

/// Integer value of a reading field; numeric strings are parsed leniently.
fn parse_reading_field(field: &ReadingField) -> Option<i64> {
    match field {
        ReadingField::Int(value) => Some(*value),
        ReadingField::Float(value) if value.is_finite() => Some(value.trunc() as i64),
        ReadingField::Float(_) => None,
        ReadingField::Text(text) => crate::measurement::parse_reading(text),
    }
}
