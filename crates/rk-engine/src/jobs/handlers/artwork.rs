//! ArtworkFetch: download an item's artwork and record it.
//!
//! Rows of every artwork kind the provider returned are replaced; kinds it
//! did not return are left alone. An image the host no longer has is
//! skipped rather than failing the job. Files of replaced rows are deleted
//! after the commit; files of an attempt that never commits are deleted
//! when it ends.

use std::collections::BTreeSet;
use std::path::PathBuf;

use rk_cache::QueryParams;
use rk_core::{ArtworkKind, Error, FailureKind, ItemId, Result};
use rk_db::models::{Artwork, HistoryEvent, Item, NewArtwork, NewHistoryEvent};
use rk_db::queries;
use serde::Serialize;

use crate::jobs::JobContext;
use crate::provider::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtworkOutcome {
    pub item_id: ItemId,
    pub stored: usize,
    pub skipped: usize,
    pub kinds: Vec<ArtworkKind>,
}

pub(super) async fn run(job: &JobContext) -> Result<ArtworkOutcome> {
    let item_id = job.item_target()?;
    let item = job
        .read(move |conn| {
            queries::items::get_item(conn, item_id)?.ok_or_else(|| Error::not_found("item", item_id))
        })
        .await?;

    let provider = job.provider()?;
    let metadata = job.lookup(&provider, &artwork_query(&item)).await?;

    let mut written = Vec::new();
    match store_and_commit(job, item_id, &provider, &metadata, &mut written).await {
        Ok((outcome, replaced)) => {
            job.discard_assets(item_id, replaced).await;
            Ok(outcome)
        }
        Err(e) => {
            job.discard_assets(item_id, written).await;
            Err(e)
        }
    }
}

/// Download every artwork, then swap the rows in one commit. Files this
/// attempt created are pushed onto `written`; on success the files of the
/// replaced rows are returned.
async fn store_and_commit(
    job: &JobContext,
    item_id: ItemId,
    provider: &str,
    metadata: &Metadata,
    written: &mut Vec<PathBuf>,
) -> Result<(ArtworkOutcome, Vec<PathBuf>)> {
    let mut rows = Vec::with_capacity(metadata.artwork.len());
    let mut skipped = 0;
    for art in &metadata.artwork {
        let bytes = match job.fetch_asset(&art.url).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == FailureKind::NotFound => {
                tracing::warn!(item_id = %item_id, url = %art.url, "Artwork missing on host, skipping");
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        let stored = job.store_asset(item_id, &art.url, &bytes).await?;
        if stored.created {
            written.push(stored.path.clone());
        }
        rows.push(NewArtwork {
            item_id,
            kind: art.kind,
            url: art.url.clone(),
            local_path: Some(stored.path.to_string_lossy().into_owned()),
            content_hash: Some(stored.content_hash),
            width: art.width,
            height: art.height,
            provider: Some(provider.to_string()),
        });
    }

    let kinds: Vec<ArtworkKind> = rows
        .iter()
        .map(|r| r.kind)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let replaced_kinds = kinds.clone();
    let replaced = job
        .read(move |conn| {
            Ok(queries::artwork::list_artwork(conn, item_id)?
                .into_iter()
                .filter(|a| replaced_kinds.contains(&a.kind))
                .filter_map(|a| a.local_path.map(PathBuf::from))
                .collect::<Vec<_>>())
        })
        .await?;

    let job_id = job.id();
    let outcome = job
        .commit(move |uow| {
            let artwork = uow.repository::<Artwork>();
            for kind in &kinds {
                artwork.delete_kind(item_id, *kind)?;
            }
            for row in &rows {
                artwork.create(row)?;
            }
            uow.repository::<HistoryEvent>().create(
                &NewHistoryEvent::new(item_id, Some(job_id), "artwork_fetched")
                    .with_detail(format!("{} stored, {skipped} skipped", rows.len())),
            )?;
            Ok(ArtworkOutcome {
                item_id,
                stored: rows.len(),
                skipped,
                kinds,
            })
        })
        .await?;
    Ok((outcome, replaced))
}

fn artwork_query(item: &Item) -> QueryParams {
    let mut query = QueryParams::new()
        .with("scope", "artwork")
        .with("title", item.title.clone());
    if let Some(year) = item.year {
        query.insert("year", year.to_string());
    }
    for (source, id) in &item.external_ids {
        query.insert(format!("id.{source}"), id.clone());
    }
    query
}
