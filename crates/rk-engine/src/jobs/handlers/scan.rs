//! Scan: walk a library root and create items for media files the library
//! does not know yet.
//!
//! A scan only ever adds items. Files that disappeared keep their items
//! until they are removed explicitly.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use rk_core::events::EventPayload;
use rk_core::{Error, ItemId, JobKind, JobTarget, LibraryId, Result};
use rk_db::models::{HistoryEvent, Item, NewHistoryEvent, NewItem};
use rk_db::queries;
use serde::Serialize;
use walkdir::WalkDir;

use crate::jobs::{JobContext, JobPayload};

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[._\s]+").expect("separator regex"));

static YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s(\[])((?:19|20)\d{2})(?:$|[\s)\]])").expect("year regex")
});

static QUALITY_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|\s)(?:480p|576p|720p|1080p|2160p|4k|blu-?ray|web-?dl|webrip|hdtv|dvdrip|x26[45]|h26[45]|hevc|remux)(?:\s|$)",
    )
    .expect("quality tag regex")
});

/// Suffixes of files still being written by a downloader.
const PARTIAL_SUFFIXES: [&str; 4] = [".part", ".aria2", ".crdownload", ".tmp"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddedItem {
    pub id: ItemId,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanOutcome {
    pub files_found: u64,
    pub items_added: u64,
    pub added: Vec<AddedItem>,
}

pub(super) async fn run(job: &JobContext) -> Result<ScanOutcome> {
    let JobTarget::Library(library_id) = job.target() else {
        return Err(Error::Validation("scan jobs target a library".into()));
    };

    let library = job
        .read(move |conn| {
            queries::libraries::get_library(conn, library_id)?
                .ok_or_else(|| Error::not_found("library", library_id))
        })
        .await?;

    let root = library.root_path.clone();
    let extensions = job.engine().config.scan.extensions.clone();
    let files = tokio::task::spawn_blocking(move || discover(Path::new(&root), &extensions))
        .await
        .map_err(|e| Error::Internal(format!("scan task failed: {e}")))??;

    let known = job
        .read(move |conn| queries::items::list_file_paths(conn, library_id))
        .await?;

    let files_found = files.len() as u64;
    let new_items: Vec<NewItem> = files
        .into_iter()
        .filter(|path| !known.contains(path))
        .map(|file_path| {
            let (title, year) = title_from_path(&file_path);
            NewItem {
                library_id,
                file_path,
                title,
                year,
            }
        })
        .collect();

    tracing::info!(
        library_id = %library_id,
        root = %library.root_path,
        files_found,
        new = new_items.len(),
        "Scanned library"
    );

    let outcome = if new_items.is_empty() {
        job.checkpoint()?;
        ScanOutcome {
            files_found,
            ..Default::default()
        }
    } else {
        let job_id = job.id();
        job.commit(move |uow| {
            let items = uow.repository::<Item>();
            let history = uow.repository::<HistoryEvent>();
            let mut added = Vec::with_capacity(new_items.len());
            for new in &new_items {
                let item = items.create(new)?;
                history.create(
                    &NewHistoryEvent::new(item.id, Some(job_id), "added")
                        .with_detail(item.file_path.clone()),
                )?;
                added.push(AddedItem {
                    id: item.id,
                    title: item.title,
                });
            }
            Ok(ScanOutcome {
                files_found,
                items_added: added.len() as u64,
                added,
            })
        })
        .await?
    };

    publish(job, library_id, &outcome);
    Ok(outcome)
}

/// Announce committed additions and queue follow-up matching.
fn publish(job: &JobContext, library_id: LibraryId, outcome: &ScanOutcome) {
    let ctx = job.engine();

    if !outcome.added.is_empty() {
        ctx.view.invalidate_library(library_id);
    }

    for item in &outcome.added {
        ctx.events.broadcast(
            EventPayload::ItemAdded {
                item_id: item.id,
                library_id,
                title: item.title.clone(),
            },
        );
    }

    ctx.events.broadcast(
        EventPayload::LibraryScanComplete {
            library_id,
            files_found: outcome.files_found,
            items_added: outcome.items_added,
        },
    );

    if ctx.config.workers.auto_match_on_scan {
        for item in &outcome.added {
            if let Err(e) = ctx
                .queue
                .submit(JobKind::Match, item.id.into(), JobPayload::default())
            {
                tracing::warn!(item_id = %item.id, error = %e, "Failed to queue match for new item");
            }
        }
    }
}

/// Media files under `root`, sorted by path.
fn discover(root: &Path, extensions: &[String]) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(Error::not_found("library root", root.display()));
    }

    let mut files: Vec<String> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable path during scan");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_media_file(e.path(), extensions))
        .map(|e| e.path().to_string_lossy().into_owned())
        .collect();

    files.sort();
    Ok(files)
}

fn is_media_file(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    if PARTIAL_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
}

/// Guess a display title and release year from a file name such as
/// `The.Matrix.1999.1080p.BluRay.mkv` or `Heat (1995).mkv`.
pub(crate) fn title_from_path(path: &str) -> (String, Option<i32>) {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned = SEPARATORS.replace_all(&stem, " ");
    let cleaned = cleaned.trim();

    // The last year with a title before it wins, so "Blade Runner 2049
    // (2017)" keeps 2049 in the title.
    let by_year = YEAR
        .captures_iter(cleaned)
        .filter_map(|caps| {
            let year = caps.get(1)?;
            let title = tidy(&cleaned[..year.start()]);
            (!title.is_empty()).then(|| (title, year.as_str().parse().ok()))
        })
        .last();
    if let Some(found) = by_year {
        return found;
    }

    if let Some(tag) = QUALITY_TAG.find(cleaned) {
        let title = tidy(&cleaned[..tag.start()]);
        if !title.is_empty() {
            return (title, None);
        }
    }

    let title = tidy(cleaned);
    if title.is_empty() {
        (stem, None)
    } else {
        (title, None)
    }
}

fn tidy(s: &str) -> String {
    s.trim_end_matches([' ', '-', '(', '['])
        .trim()
        .to_string()
}
