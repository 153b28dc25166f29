use crate::config::FALLBACK_ELEMENT_IDS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One CSV record: headers in file order, every value as text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: impl Into<String>, value: impl Into<String>) {
        self.cells.push((header.into(), value.into()));
    }

    /// Raw cell value. `None` means the column does not exist; an existing
    /// but blank cell is `Some("")`.
    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(h, _)| h.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            cells: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSource {
    /// Built from the live element listing
    Remote,
    /// Static table; ids may not match the target install
    Fallback,
}

/// Field name to element id, fixed for the duration of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    ids: HashMap<String, u64>,
    source: MappingSource,
}

impl FieldMapping {
    pub fn new(source: MappingSource) -> Self {
        Self {
            ids: HashMap::new(),
            source,
        }
    }

    pub fn fallback() -> Self {
        let mut mapping = Self::new(MappingSource::Fallback);
        for (name, id) in FALLBACK_ELEMENT_IDS {
            mapping.insert(*name, *id);
        }
        mapping
    }

    /// Later inserts for the same name replace earlier ones.
    pub fn insert(&mut self, name: impl Into<String>, id: u64) {
        self.ids.insert(name.into(), id);
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.ids.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ids.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn source(&self) -> MappingSource {
        self.source
    }

    pub fn is_verified(&self) -> bool {
        self.source == MappingSource::Remote
    }

    /// Entries sorted by name, for display
    pub fn sorted(&self) -> Vec<(&str, u64)> {
        let mut entries: Vec<_> = self.ids.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        entries.sort_unstable();
        entries
    }
}

/// One entry of the remote `elements` listing. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementRecord {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ElementRef {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementText {
    pub element: ElementRef,
    pub text: String,
    pub html: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub name: String,
}

/// Body of one item-creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemPayload {
    pub public: bool,
    pub element_texts: Vec<ElementText>,
    pub tags: Vec<Tag>,
    // Absent rather than `[]` when the row has no usable URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_urls: Option<Vec<String>>,
}

/// The part of a 201 response we care about
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedItem {
    #[serde(default)]
    pub id: Option<u64>,
}
