//! NetStorage `list` / `dir` XML response bodies.

use serde::Deserialize;

use super::{Entry, EntryKind, ListPage, OriginError};

#[derive(Debug, Deserialize)]
struct ListDocument {
    #[serde(rename = "file", default)]
    files: Vec<XmlEntry>,
    #[serde(default)]
    resume: Option<XmlResume>,
}

#[derive(Debug, Deserialize)]
struct StatDocument {
    #[serde(rename = "file", default)]
    files: Vec<XmlEntry>,
}

#[derive(Debug, Deserialize)]
struct XmlEntry {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct XmlResume {
    #[serde(rename = "@start")]
    start: String,
}

impl From<XmlEntry> for Entry {
    fn from(e: XmlEntry) -> Self {
        Entry {
            kind: EntryKind::parse(&e.kind),
            name: e.name,
        }
    }
}

pub(crate) fn parse_list(path: &str, body: &str) -> Result<ListPage, OriginError> {
    let doc: ListDocument = quick_xml::de::from_str(body).map_err(|e| OriginError::Malformed {
        action: "list",
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    let resume = doc
        .resume
        .map(|r| r.start)
        .filter(|start| !start.trim().is_empty());

    Ok(ListPage {
        resume,
        entries: doc.files.into_iter().map(Entry::from).collect(),
    })
}

pub(crate) fn parse_dir(path: &str, body: &str) -> Result<Vec<Entry>, OriginError> {
    let doc: StatDocument = quick_xml::de::from_str(body).map_err(|e| OriginError::Malformed {
        action: "dir",
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    Ok(doc.files.into_iter().map(Entry::from).collect())
}
