//! SubtitleFetch: download subtitles in one language and record them.
//!
//! Files of the replaced rows are deleted after the commit.

use std::path::PathBuf;

use rk_cache::QueryParams;
use rk_core::{Error, ItemId, Result};
use rk_db::models::{HistoryEvent, Item, NewHistoryEvent, NewSubtitle, Subtitle};
use rk_db::queries;
use serde::Serialize;

use crate::jobs::JobContext;
use crate::provider::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleOutcome {
    pub item_id: ItemId,
    pub language: String,
    pub stored: usize,
}

pub(super) async fn run(job: &JobContext) -> Result<SubtitleOutcome> {
    let item_id = job.item_target()?;
    let language = job
        .payload()
        .language
        .clone()
        .unwrap_or_else(|| job.engine().config.providers.subtitle_language.clone())
        .trim()
        .to_lowercase();
    if language.is_empty() {
        return Err(Error::Validation("subtitle language is empty".into()));
    }

    let item = job
        .read(move |conn| {
            queries::items::get_item(conn, item_id)?.ok_or_else(|| Error::not_found("item", item_id))
        })
        .await?;

    let provider = job.provider()?;
    let metadata = job
        .lookup(&provider, &subtitle_query(&item, &language))
        .await?;

    let mut written = Vec::new();
    match store_and_commit(job, item_id, &provider, &language, &metadata, &mut written).await {
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

async fn store_and_commit(
    job: &JobContext,
    item_id: ItemId,
    provider: &str,
    language: &str,
    metadata: &Metadata,
    written: &mut Vec<PathBuf>,
) -> Result<(SubtitleOutcome, Vec<PathBuf>)> {
    let mut rows = Vec::new();
    for sub in metadata
        .subtitles
        .iter()
        .filter(|s| s.language.eq_ignore_ascii_case(language))
    {
        let bytes = job.fetch_asset(&sub.url).await?;
        let stored = job.store_asset(item_id, &sub.url, &bytes).await?;
        if stored.created {
            written.push(stored.path.clone());
        }
        rows.push(NewSubtitle {
            item_id,
            language: language.to_string(),
            format: sub.format.to_lowercase(),
            url: sub.url.clone(),
            local_path: Some(stored.path.to_string_lossy().into_owned()),
            provider: Some(provider.to_string()),
        });
    }

    if rows.is_empty() {
        return Err(Error::not_found("subtitles", format!("{language} for item {item_id}")));
    }

    let previous_language = language.to_string();
    let replaced = job
        .read(move |conn| {
            Ok(queries::subtitles::list_subtitles(conn, item_id)?
                .into_iter()
                .filter(|s| s.language == previous_language)
                .filter_map(|s| s.local_path.map(PathBuf::from))
                .collect::<Vec<_>>())
        })
        .await?;

    let job_id = job.id();
    let language = language.to_string();
    let outcome = job
        .commit(move |uow| {
            let subtitles = uow.repository::<Subtitle>();
            subtitles.delete_language(item_id, &language)?;
            for row in &rows {
                subtitles.create(row)?;
            }
            uow.repository::<HistoryEvent>().create(
                &NewHistoryEvent::new(item_id, Some(job_id), "subtitles_fetched")
                    .with_detail(format!("{} {language}", rows.len())),
            )?;
            Ok(SubtitleOutcome {
                item_id,
                language,
                stored: rows.len(),
            })
        })
        .await?;
    Ok((outcome, replaced))
}

fn subtitle_query(item: &Item, language: &str) -> QueryParams {
    let mut query = QueryParams::new()
        .with("scope", "subtitles")
        .with("language", language)
        .with("title", item.title.clone());
    if let Some(year) = item.year {
        query.insert("year", year.to_string());
    }
    for (source, id) in &item.external_ids {
        query.insert(format!("id.{source}"), id.clone());
    }
    query
}
