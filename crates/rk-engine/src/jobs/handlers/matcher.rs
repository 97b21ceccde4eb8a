//! Match: look an item up with a metadata provider and apply the answer.

use rk_cache::QueryParams;
use rk_core::events::EventPayload;
use rk_core::{CreditRole, Error, ItemId, MatchStatus, Result};
use rk_db::models::{Credit, HistoryEvent, Item, NewCredit, NewHistoryEvent};
use rk_db::queries;
use serde::Serialize;

use crate::jobs::JobContext;
use crate::provider::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub item_id: ItemId,
    pub provider: String,
    pub title: String,
    pub year: Option<i32>,
    pub credits: usize,
}

pub(super) async fn run(job: &JobContext) -> Result<MatchOutcome> {
    let item_id = job.item_target()?;
    let item = job
        .read(move |conn| {
            queries::items::get_item(conn, item_id)?.ok_or_else(|| Error::not_found("item", item_id))
        })
        .await?;

    let provider = job.provider()?;
    let query = match_query(&item);
    let metadata = job.lookup(&provider, &query).await?;
    if metadata.title.trim().is_empty() {
        return Err(Error::not_found("metadata", &query));
    }

    let job_id = job.id();
    let outcome = job
        .commit(move |uow| {
            let items = uow.repository::<Item>();
            let mut item = items.get(item_id)?;
            apply(&mut item, &metadata);
            items.update(&item)?;

            let credits = uow
                .repository::<Credit>()
                .replace_for_item(item_id, &credits_for(item_id, &metadata))?;

            uow.repository::<HistoryEvent>().create(
                &NewHistoryEvent::new(item_id, Some(job_id), "matched")
                    .with_detail(format!("{provider}: {}", item.title)),
            )?;

            Ok(MatchOutcome {
                item_id,
                provider,
                title: item.title,
                year: item.year,
                credits,
            })
        })
        .await?;

    let ctx = job.engine();
    ctx.view.invalidate_library(item.library_id);
    ctx.events
        .broadcast(EventPayload::ItemUpdated { item_id });

    tracing::info!(item_id = %item_id, title = %outcome.title, provider = %outcome.provider, "Matched item");
    Ok(outcome)
}

fn match_query(item: &Item) -> QueryParams {
    let mut query = QueryParams::new()
        .with("scope", "match")
        .with("title", item.title.clone());
    if let Some(year) = item.year {
        query.insert("year", year.to_string());
    }
    query
}

/// Overwrite item fields with what the provider knows. Fields the provider
/// left empty keep their current values.
fn apply(item: &mut Item, metadata: &Metadata) {
    item.set_title(metadata.title.trim());
    if metadata.original_title.is_some() {
        item.original_title.clone_from(&metadata.original_title);
    }
    item.year = metadata.year.or(item.year);
    item.runtime_minutes = metadata.runtime_minutes.or(item.runtime_minutes);
    if metadata.overview.is_some() {
        item.overview.clone_from(&metadata.overview);
    }
    if !metadata.genres.is_empty() {
        item.genres.clone_from(&metadata.genres);
    }
    item.external_ids.extend(
        metadata
            .external_ids
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone())),
    );
    item.match_status = MatchStatus::Matched;
}

/// Cast first, then crew, each in provider order.
fn credits_for(item_id: ItemId, metadata: &Metadata) -> Vec<NewCredit> {
    let cast = metadata.cast.iter().map(|c| (CreditRole::Cast, c));
    let crew = metadata.crew.iter().map(|c| (CreditRole::Crew, c));
    cast.chain(crew)
        .enumerate()
        .map(|(ordinal, (role, credit))| NewCredit {
            item_id,
            name: credit.name.clone(),
            role,
            part: credit.part.clone(),
            ordinal: ordinal as i32,
        })
        .collect()
}
