//! Library-domain enums: job kinds and states, match status, sort keys,
//! artwork kinds.
//!
//! All enums serialize in snake_case and implement `Display` and `FromStr`
//! manually so the same strings are used in the database and in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::ids::{ItemId, LibraryId};

/// Implement `Display`/`FromStr` for a fieldless enum from a string table.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// The canonical string form (as stored in the database).
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(Error::Validation(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// Kind of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Scan,
    Match,
    ArtworkFetch,
    SubtitleFetch,
}

string_enum!(JobKind {
    Scan => "scan",
    Match => "match",
    ArtworkFetch => "artwork_fetch",
    SubtitleFetch => "subtitle_fetch",
});

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Job state machine: `Queued -> Running -> {Succeeded | Failed | Cancelled}`,
/// with `Running -> Queued` once per retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

string_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Queued)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

// ---------------------------------------------------------------------------
// JobTarget
// ---------------------------------------------------------------------------

/// What a job operates on. Scans target a library; everything else targets
/// a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum JobTarget {
    Library(LibraryId),
    Item(ItemId),
}

impl JobTarget {
    /// Raw id stored in the `jobs.target_id` column.
    pub fn raw_id(&self) -> i64 {
        match self {
            JobTarget::Library(id) => id.get(),
            JobTarget::Item(id) => id.get(),
        }
    }

    pub fn item(&self) -> Option<ItemId> {
        match self {
            JobTarget::Item(id) => Some(*id),
            JobTarget::Library(_) => None,
        }
    }

    /// Rebuild a target from the job kind and raw column value.
    pub fn for_kind(kind: JobKind, raw: i64) -> Self {
        match kind {
            JobKind::Scan => JobTarget::Library(LibraryId::new(raw)),
            _ => JobTarget::Item(ItemId::new(raw)),
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Library(id) => write!(f, "library:{id}"),
            JobTarget::Item(id) => write!(f, "item:{id}"),
        }
    }
}

impl From<ItemId> for JobTarget {
    fn from(id: ItemId) -> Self {
        JobTarget::Item(id)
    }
}

impl From<LibraryId> for JobTarget {
    fn from(id: LibraryId) -> Self {
        JobTarget::Library(id)
    }
}

// ---------------------------------------------------------------------------
// MatchStatus
// ---------------------------------------------------------------------------

/// How far an item got in provider matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Unmatched,
    Matched,
}

string_enum!(MatchStatus {
    Unmatched => "unmatched",
    Matched => "matched",
});

// ---------------------------------------------------------------------------
// SortKey
// ---------------------------------------------------------------------------

/// Ordering of a paginated library listing. Every ordering ends with the item
/// id so pages tile without gaps or overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Title,
    Year,
    Added,
}

string_enum!(SortKey {
    Title => "title",
    Year => "year",
    Added => "added",
});

// ---------------------------------------------------------------------------
// ArtworkKind
// ---------------------------------------------------------------------------

/// Type of item artwork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtworkKind {
    Poster,
    Backdrop,
    Logo,
    Thumb,
}

string_enum!(ArtworkKind {
    Poster => "poster",
    Backdrop => "backdrop",
    Logo => "logo",
    Thumb => "thumb",
});

// ---------------------------------------------------------------------------
// CreditRole
// ---------------------------------------------------------------------------

/// Whether a credited person appears on screen or behind the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditRole {
    Cast,
    Crew,
}

string_enum!(CreditRole {
    Cast => "cast",
    Crew => "crew",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_display_and_parse() {
        assert_eq!(JobKind::ArtworkFetch.to_string(), "artwork_fetch");
        assert_eq!("subtitle_fetch".parse::<JobKind>().unwrap(), JobKind::SubtitleFetch);
        assert!("rescan".parse::<JobKind>().is_err());
    }

    #[test]
    fn job_kind_serde_matches_display() {
        let json = serde_json::to_string(&JobKind::ArtworkFetch).unwrap();
        assert_eq!(json, r#""artwork_fetch""#);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn job_target_raw_roundtrip() {
        let t = JobTarget::Item(ItemId::new(42));
        assert_eq!(t.raw_id(), 42);
        assert_eq!(JobTarget::for_kind(JobKind::Match, 42), t);
        assert_eq!(
            JobTarget::for_kind(JobKind::Scan, 3),
            JobTarget::Library(LibraryId::new(3))
        );
        assert_eq!(t.to_string(), "item:42");
    }

    #[test]
    fn match_status_default_unmatched() {
        assert_eq!(MatchStatus::default(), MatchStatus::Unmatched);
        assert_eq!("matched".parse::<MatchStatus>().unwrap(), MatchStatus::Matched);
    }

    #[test]
    fn sort_key_parse() {
        assert_eq!("year".parse::<SortKey>().unwrap(), SortKey::Year);
        assert_eq!(SortKey::default(), SortKey::Title);
    }

    #[test]
    fn artwork_kinds_collect_into_ordered_set() {
        let kinds: std::collections::BTreeSet<ArtworkKind> = [
            ArtworkKind::Thumb,
            ArtworkKind::Poster,
            ArtworkKind::Backdrop,
            ArtworkKind::Poster,
        ]
        .into_iter()
        .collect();
        assert_eq!(
            kinds.into_iter().collect::<Vec<_>>(),
            vec![ArtworkKind::Poster, ArtworkKind::Backdrop, ArtworkKind::Thumb]
        );
    }
}
