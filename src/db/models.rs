use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A feed post as the backend serves it and as the cache stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: i64,
    pub author_id: i64,
    pub author: String,
    pub content: String,
    #[serde(rename = "published", with = "chrono::serde::ts_seconds")]
    pub published_at: DateTime<Utc>,
    pub liked_by_me: bool,
    #[serde(rename = "likes", default)]
    pub like_count: u32,
    #[serde(default)]
    pub author_avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub owned_by_me: bool,
}

impl Post {
    /// Position in the canonical feed order, `(published_at desc, id desc)`.
    pub fn order_key(&self) -> (i64, i64) {
        (self.published_at.timestamp(), self.id)
    }

    /// Placeholders stand in for posts the server has not confirmed yet.
    pub fn is_placeholder(&self) -> bool {
        self.id <= 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentKind {
    #[serde(rename = "IMAGE")]
    Image,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "IMAGE",
        }
    }
}

impl ToSql for AttachmentKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AttachmentKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "IMAGE" => Ok(AttachmentKind::Image),
            other => Err(FromSqlError::Other(
                format!("unknown attachment kind: {other}").into(),
            )),
        }
    }
}

/// Paging direction relative to the cached window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Toward older posts.
    Before,
    /// Toward newer posts.
    After,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Before => "before",
            Direction::After => "after",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Direction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Direction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "before" => Ok(Direction::Before),
            "after" => Ok(Direction::After),
            other => Err(FromSqlError::Other(
                format!("unknown direction: {other}").into(),
            )),
        }
    }
}

/// Bookmark for the next page in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKey {
    pub direction: Direction,
    pub anchor_id: i64,
}

impl RemoteKey {
    pub fn new(direction: Direction, anchor_id: i64) -> Self {
        Self {
            direction,
            anchor_id,
        }
    }
}

/// Server reference to an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
}
