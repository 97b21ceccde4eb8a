//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row` selected with the owning query module's `COLS` list.
//! Child collections (credits, artwork, subtitles) are separate rows keyed
//! by `item_id`, never embedded in [`Item`].

use std::collections::BTreeMap;
use std::str::FromStr;

use rk_core::{
    ArtworkId, ArtworkKind, CreditRole, HistoryEventId, ItemId, JobId, JobKind, JobStatus,
    JobTarget, LibraryId, MatchStatus, SubtitleId,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Parse a text column through `FromStr`.
fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Parse a JSON text column, falling back to the type's default.
fn json_col<T: serde::de::DeserializeOwned + Default>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    Ok(serde_json::from_str(&s).unwrap_or_default())
}

/// Sort key derived from a display title: lowercase, leading article
/// dropped.
pub fn sort_title(title: &str) -> String {
    let lower = title.trim().to_lowercase();
    for article in ["the ", "a ", "an "] {
        if let Some(rest) = lower.strip_prefix(article) {
            return rest.trim_start().to_string();
        }
    }
    lower
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
    pub root_path: String,
    pub created_at: String,
}

impl Library {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: LibraryId::new(row.get(0)?),
            name: row.get(1)?,
            root_path: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewLibrary {
    pub name: String,
    pub root_path: String,
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A durable library item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub library_id: LibraryId,
    pub file_path: String,
    pub title: String,
    pub sort_title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub runtime_minutes: Option<i32>,
    pub overview: Option<String>,
    pub genres: Vec<String>,
    pub match_status: MatchStatus,
    pub external_ids: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Item {
    /// Build from a row selected as:
    /// id, library_id, file_path, title, sort_title, original_title, year,
    /// runtime_minutes, overview, genres, match_status, external_ids,
    /// created_at, updated_at
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: ItemId::new(row.get(0)?),
            library_id: LibraryId::new(row.get(1)?),
            file_path: row.get(2)?,
            title: row.get(3)?,
            sort_title: row.get(4)?,
            original_title: row.get(5)?,
            year: row.get(6)?,
            runtime_minutes: row.get(7)?,
            overview: row.get(8)?,
            genres: json_col(row, 9)?,
            match_status: parse_col(row, 10)?,
            external_ids: json_col(row, 11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    /// Set the display title and keep the sort key in step.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.sort_title = sort_title(&self.title);
    }
}

/// Fields known when a scan first discovers a file.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub library_id: LibraryId,
    pub file_path: String,
    pub title: String,
    pub year: Option<i32>,
}

/// Optional filter applied to both `count` and windowed listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemFilter {
    pub match_status: Option<MatchStatus>,
    /// Case-insensitive substring of the title.
    pub title_contains: Option<String>,
}

impl ItemFilter {
    pub fn is_empty(&self) -> bool {
        self.match_status.is_none() && self.title_contains.is_none()
    }
}

// ---------------------------------------------------------------------------
// Credit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub id: i64,
    pub item_id: ItemId,
    pub name: String,
    pub role: CreditRole,
    /// Character name for cast, job title for crew.
    pub part: Option<String>,
    pub ordinal: i32,
}

impl Credit {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_id: ItemId::new(row.get(1)?),
            name: row.get(2)?,
            role: parse_col(row, 3)?,
            part: row.get(4)?,
            ordinal: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCredit {
    pub item_id: ItemId,
    pub name: String,
    pub role: CreditRole,
    pub part: Option<String>,
    pub ordinal: i32,
}

// ---------------------------------------------------------------------------
// Artwork
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artwork {
    pub id: ArtworkId,
    pub item_id: ItemId,
    pub kind: ArtworkKind,
    pub url: String,
    pub local_path: Option<String>,
    pub content_hash: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub provider: Option<String>,
    pub created_at: String,
}

impl Artwork {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: ArtworkId::new(row.get(0)?),
            item_id: ItemId::new(row.get(1)?),
            kind: parse_col(row, 2)?,
            url: row.get(3)?,
            local_path: row.get(4)?,
            content_hash: row.get(5)?,
            width: row.get(6)?,
            height: row.get(7)?,
            provider: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewArtwork {
    pub item_id: ItemId,
    pub kind: ArtworkKind,
    pub url: String,
    pub local_path: Option<String>,
    pub content_hash: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub provider: Option<String>,
}

// ---------------------------------------------------------------------------
// Subtitle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtitle {
    pub id: SubtitleId,
    pub item_id: ItemId,
    pub language: String,
    pub format: String,
    pub url: String,
    pub local_path: Option<String>,
    pub provider: Option<String>,
    pub created_at: String,
}

impl Subtitle {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: SubtitleId::new(row.get(0)?),
            item_id: ItemId::new(row.get(1)?),
            language: row.get(2)?,
            format: row.get(3)?,
            url: row.get(4)?,
            local_path: row.get(5)?,
            provider: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewSubtitle {
    pub item_id: ItemId,
    pub language: String,
    pub format: String,
    pub url: String,
    pub local_path: Option<String>,
    pub provider: Option<String>,
}

// ---------------------------------------------------------------------------
// HistoryEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: HistoryEventId,
    /// `None` once the item has been removed.
    pub item_id: Option<ItemId>,
    pub job_id: Option<JobId>,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: String,
}

impl HistoryEvent {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let job_id: Option<String> = row.get(2)?;
        let job_id = match job_id {
            Some(s) => Some(s.parse::<JobId>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?),
            None => None,
        };
        Ok(Self {
            id: HistoryEventId::new(row.get(0)?),
            item_id: row.get::<_, Option<i64>>(1)?.map(ItemId::new),
            job_id,
            action: row.get(3)?,
            detail: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewHistoryEvent {
    pub item_id: Option<ItemId>,
    pub job_id: Option<JobId>,
    pub action: String,
    pub detail: Option<String>,
}

impl NewHistoryEvent {
    pub fn new(item_id: ItemId, job_id: Option<JobId>, action: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id),
            job_id,
            action: action.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// Persisted mirror of a background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub target: JobTarget,
    /// JSON-encoded job payload.
    pub payload: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    /// JSON-encoded result of a successful run.
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

impl JobRecord {
    /// Build from a row selected as all columns in table order.
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let kind: JobKind = parse_col(row, 1)?;
        Ok(Self {
            id: parse_col(row, 0)?,
            kind,
            target: JobTarget::for_kind(kind, row.get(2)?),
            payload: row.get(3)?,
            status: parse_col(row, 4)?,
            attempt_count: row.get(5)?,
            max_attempts: row.get(6)?,
            error: row.get(7)?,
            result: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            finished_at: row.get(11)?,
        })
    }
}

// ---------------------------------------------------------------------------
// CacheRow
// ---------------------------------------------------------------------------

/// A row of the on-disk provider cache. Times are Unix milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub hit_count: u64,
}

impl CacheRow {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            created_at_ms: row.get(2)?,
            expires_at_ms: row.get(3)?,
            hit_count: row.get::<_, i64>(4)?.max(0) as u64,
        })
    }
}
