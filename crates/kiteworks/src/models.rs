use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Server timestamps look like `2024-03-01T10:00:00+0000`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Ids are strings on current servers and integers on old ones.
fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Option::<Id>::deserialize(deserializer)? {
        Some(Id::Text(s)) => s,
        Some(Id::Number(n)) => n.to_string(),
        None => String::new(),
    })
}

/// Paging metadata that accompanies `data` arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
}

/// One page of results with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Entry type as reported in folder listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "d")]
    Folder,
    #[serde(rename = "f")]
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    #[serde(deserialize_with = "id")]
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "id")]
    pub parent_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub modified: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub permalink: String,
}

impl Folder {
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.modified)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(deserialize_with = "id")]
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "id")]
    pub parent_id: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub modified: String,
    #[serde(default)]
    pub client_modified: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub permalink: String,
}

impl File {
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.modified)
    }

    /// Modification time reported by the uploading client, if any.
    pub fn client_modified_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.client_modified)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(deserialize_with = "id")]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "id")]
    pub base_dir_id: String,
    #[serde(default, deserialize_with = "id")]
    pub mydir_id: String,
    #[serde(default)]
    pub user_type_id: i64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// A listing entry: enough to tell folders from files.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Entry {
    #[serde(rename = "type", default)]
    pub kind: EntryKind,
}
