//! Integration tests for job submission, retries, cancellation and the
//! match/artwork/subtitle handlers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{DownCache, StubProvider, TestHarness};
use rk_core::config::CacheBackend;
use rk_core::events::EventPayload;
use rk_core::{ArtworkKind, Error, JobKind, JobStatus, MatchStatus, SortKey};
use rk_db::queries;
use rk_engine::{CreditRef, JobPayload, Metadata, ProviderError};

fn heat() -> Metadata {
    Metadata {
        title: "Heat".into(),
        year: Some(1995),
        runtime_minutes: Some(170),
        cast: vec![
            CreditRef {
                name: "Al Pacino".into(),
                part: Some("Vincent Hanna".into()),
            },
            CreditRef {
                name: "Robert De Niro".into(),
                part: Some("Neil McCauley".into()),
            },
        ],
        crew: vec![CreditRef {
            name: "Michael Mann".into(),
            part: Some("Director".into()),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn match_updates_item_and_caches_provider_answer() {
    let h = TestHarness::with_config(|c| c.cache.backend = CacheBackend::OnDisk);
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat 1995 remux"]);
    h.provider.answer("heat 1995 remux", heat());
    h.engine.start().unwrap();

    // Materialize the view before the match so the test sees invalidation.
    let before = h.engine.window(lib.id, 0, 10, SortKey::Title).await.unwrap();
    assert_eq!(before[0].title, "heat 1995 remux");

    let job = h
        .engine
        .submit(JobKind::Match, ids[0], JobPayload::default())
        .unwrap();
    h.wait_for(job, JobStatus::Succeeded).await;

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(queries::cache_entries::count(&h.conn()).unwrap(), 1);

    let item = h.engine.get_item(ids[0]).await.unwrap();
    assert_eq!(item.title, "Heat");
    assert_eq!(item.year, Some(1995));
    assert_eq!(item.match_status, MatchStatus::Matched);

    let credits = h.engine.credits(ids[0]).await.unwrap();
    assert_eq!(credits.len(), 3);
    let history = h.engine.history(ids[0]).await.unwrap();
    assert!(history.iter().any(|e| e.action == "matched"));

    let after = h.engine.window(lib.id, 0, 10, SortKey::Title).await.unwrap();
    assert_eq!(after[0].title, "Heat");

    let snap = h.engine.job(job).unwrap();
    assert_eq!(snap.attempt_count, 1);
    assert_eq!(snap.result.as_ref().unwrap()["title"], "Heat");

    // Same query again is served from the cache.
    let again = h
        .engine
        .submit(JobKind::Match, ids[0], JobPayload::default())
        .unwrap();
    assert_ne!(again, job);
    h.wait_for(again, JobStatus::Succeeded).await;
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.engine.metrics().snapshot().cache_hits, 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn force_refresh_bypasses_cache() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.provider.answer("heat", heat());
    h.engine.start().unwrap();

    let first = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.wait_for(first, JobStatus::Succeeded).await;

    let second = h
        .engine
        .submit(JobKind::Match, ids[0], JobPayload::default().refreshed())
        .unwrap();
    h.wait_for(second, JobStatus::Succeeded).await;
    assert_eq!(h.provider.calls(), 2);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn job_transitions_are_broadcast_in_order() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    let mut rx = h.engine.events().subscribe();
    h.engine.start().unwrap();

    let job = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.wait_for(job, JobStatus::Succeeded).await;

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EventPayload::JobStatusChanged { job_id, from, to, .. } = event.payload {
            if job_id == job {
                seen.push((from, to));
            }
        }
    }
    assert_eq!(
        seen,
        vec![
            (None, JobStatus::Queued),
            (Some(JobStatus::Queued), JobStatus::Running),
            (Some(JobStatus::Running), JobStatus::Succeeded),
        ]
    );

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_artwork_jobs_respect_pool_bound() {
    let h = TestHarness::with_config(|c| c.workers.workers = Some(8));
    let lib = h.library("bulk").await;
    let titles: Vec<String> = (0..1000).map(|i| format!("film {i:04}")).collect();
    let refs: Vec<&str> = titles.iter().map(String::as_str).collect();
    let ids = h.add_items(lib.id, &refs);
    h.engine.start().unwrap();
    assert_eq!(h.engine.pool_size(), 8);

    let jobs: Vec<_> = ids
        .iter()
        .map(|id| {
            h.engine
                .submit(JobKind::ArtworkFetch, *id, JobPayload::default())
                .unwrap()
        })
        .collect();
    h.idle().await;

    let metrics = h.engine.metrics().snapshot();
    assert!(metrics.peak_running <= 8, "peak {}", metrics.peak_running);
    assert!(metrics.peak_running >= 1);
    assert_eq!(metrics.jobs_succeeded, 1000);

    for job in &jobs {
        assert_eq!(h.engine.status(*job).unwrap(), JobStatus::Succeeded);
    }

    let art = h.engine.artwork(ids[17]).await.unwrap();
    assert_eq!(art.len(), 1);
    assert_eq!(art[0].kind, ArtworkKind::Poster);
    assert!(std::path::Path::new(art[0].local_path.as_deref().unwrap()).exists());
    assert_eq!(h.fetcher.fetched(), 1000);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_submissions_coalesce() {
    let h = TestHarness::with(|_| {}, StubProvider::held("stub"), None);
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.engine.start().unwrap();

    let first = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.provider.entered().await;
    let second = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    assert_eq!(first, second);

    // A different kind for the same item is its own job.
    let art = h
        .engine
        .submit(JobKind::ArtworkFetch, ids[0], JobPayload::default())
        .unwrap();
    assert_ne!(art, first);

    h.provider.release(2);
    h.idle().await;

    assert_eq!(h.engine.status(first).unwrap(), JobStatus::Succeeded);
    assert_eq!(h.engine.metrics().snapshot().jobs_coalesced, 1);

    // Once the first job is terminal a new submission gets a new job.
    h.provider.release(1);
    let third = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    assert_ne!(third, first);
    h.wait_for(third, JobStatus::Succeeded).await;

    h.engine.shutdown().await;
}

#[tokio::test]
async fn retryable_failures_stop_at_max_attempts() {
    let h = TestHarness::with_config(|c| c.workers.max_attempts = 3);
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.provider.fail_next(
        std::iter::repeat_with(|| ProviderError::Unavailable("503".into())).take(5),
    );
    h.engine.start().unwrap();

    let job = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.wait_for(job, JobStatus::Failed).await;

    let snap = h.engine.job(job).unwrap();
    assert_eq!(snap.attempt_count, 3);
    assert!(snap.error.as_deref().unwrap().contains("503"));
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(h.engine.metrics().snapshot().jobs_retried, 2);

    let item = h.engine.get_item(ids[0]).await.unwrap();
    assert_eq!(item.match_status, MatchStatus::Unmatched);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn transient_failure_then_success() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.provider.answer("heat", heat());
    h.provider.fail_next([
        ProviderError::RateLimited {
            retry_after: Some(Duration::from_millis(10)),
        },
        ProviderError::Unavailable("timeout".into()),
    ]);
    h.engine.start().unwrap();

    let job = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.wait_for(job, JobStatus::Succeeded).await;

    assert_eq!(h.engine.job(job).unwrap().attempt_count, 3);
    assert_eq!(h.engine.get_item(ids[0]).await.unwrap().title, "Heat");

    h.engine.shutdown().await;
}

#[tokio::test]
async fn terminal_failure_is_not_retried() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["unknown thing"]);
    h.provider
        .fail_next([ProviderError::NotFound("unknown thing".into())]);
    h.engine.start().unwrap();

    let job = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.wait_for(job, JobStatus::Failed).await;

    assert_eq!(h.engine.job(job).unwrap().attempt_count, 1);
    assert_eq!(h.provider.calls(), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn cancelled_running_job_never_commits() {
    let h = TestHarness::with(|_| {}, StubProvider::held("stub"), None);
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.engine.start().unwrap();

    let job = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.provider.entered().await;
    assert_eq!(h.engine.status(job).unwrap(), JobStatus::Running);

    assert!(h.engine.cancel(job).await.unwrap());
    h.provider.release(1);
    h.wait_for(job, JobStatus::Cancelled).await;

    let item = h.engine.get_item(ids[0]).await.unwrap();
    assert_eq!(item.match_status, MatchStatus::Unmatched);
    assert_eq!(item.title, "heat");
    assert!(h.engine.credits(ids[0]).await.unwrap().is_empty());
    assert!(h.engine.history(ids[0]).await.unwrap().is_empty());

    // Terminal jobs cannot be cancelled again.
    assert!(!h.engine.cancel(job).await.unwrap());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn cancel_after_success_is_refused() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.engine.start().unwrap();

    let job = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
    h.wait_for(job, JobStatus::Succeeded).await;
    assert!(!h.engine.cancel(job).await.unwrap());
    assert_eq!(
        h.engine.get_item(ids[0]).await.unwrap().match_status,
        MatchStatus::Matched
    );

    h.engine.shutdown().await;
}

#[tokio::test]
async fn unreachable_cache_degrades_to_direct_calls() {
    let h = TestHarness::with(|_| {}, StubProvider::new("stub"), Some(Arc::new(DownCache)));
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.provider.answer("heat", heat());
    h.engine.start().unwrap();

    for _ in 0..2 {
        let job = h.engine.submit(JobKind::Match, ids[0], JobPayload::default()).unwrap();
        h.wait_for(job, JobStatus::Succeeded).await;
    }

    assert_eq!(h.provider.calls(), 2);
    let metrics = h.engine.metrics().snapshot();
    assert!(metrics.cache_errors >= 2);
    assert_eq!(metrics.cache_hits, 0);
    assert_matches!(h.engine.sweep_cache().await, Err(Error::CacheUnavailable(_)));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn subtitle_job_keeps_requested_language_only() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["amelie"]);
    h.engine.start().unwrap();

    let job = h
        .engine
        .submit(
            JobKind::SubtitleFetch,
            ids[0],
            JobPayload::default().with_language("FR"),
        )
        .unwrap();
    h.wait_for(job, JobStatus::Succeeded).await;

    let subs = h.engine.subtitles(ids[0]).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].language, "fr");
    assert_eq!(subs[0].format, "srt");

    // A language the provider has nothing for fails without retrying.
    let none = h
        .engine
        .submit(
            JobKind::SubtitleFetch,
            ids[0],
            JobPayload::default().with_language("de"),
        )
        .unwrap();
    h.wait_for(none, JobStatus::Failed).await;
    assert_eq!(h.engine.job(none).unwrap().attempt_count, 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn artwork_missing_on_host_is_skipped() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    let mut md = heat();
    md.artwork = vec![
        rk_engine::ArtworkRef {
            kind: ArtworkKind::Poster,
            url: "https://img.example/heat/poster.jpg".into(),
            width: None,
            height: None,
        },
        rk_engine::ArtworkRef {
            kind: ArtworkKind::Backdrop,
            url: "https://img.example/heat/missing.jpg".into(),
            width: None,
            height: None,
        },
    ];
    h.provider.answer("heat", md);
    h.engine.start().unwrap();

    let job = h
        .engine
        .submit(JobKind::ArtworkFetch, ids[0], JobPayload::default())
        .unwrap();
    h.wait_for(job, JobStatus::Succeeded).await;

    let result = h.engine.job(job).unwrap().result.unwrap();
    assert_eq!(result["stored"], 1);
    assert_eq!(result["skipped"], 1);
    assert_eq!(h.engine.artwork(ids[0]).await.unwrap().len(), 1);

    h.engine.shutdown().await;
}

fn poster(url: &str) -> rk_engine::ArtworkRef {
    rk_engine::ArtworkRef {
        kind: ArtworkKind::Poster,
        url: url.into(),
        width: None,
        height: None,
    }
}

#[tokio::test]
async fn replaced_artwork_file_is_deleted() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    let mut md = heat();
    md.artwork = vec![poster("https://img.example/heat/v1.jpg")];
    h.provider.answer("heat", md.clone());
    h.engine.start().unwrap();

    let first = h
        .engine
        .submit(JobKind::ArtworkFetch, ids[0], JobPayload::default())
        .unwrap();
    h.wait_for(first, JobStatus::Succeeded).await;
    let old = h.asset_files(ids[0]);
    assert_eq!(old.len(), 1);

    md.artwork = vec![poster("https://img.example/heat/v2.jpg")];
    h.provider.answer("heat", md);
    let second = h
        .engine
        .submit(JobKind::ArtworkFetch, ids[0], JobPayload::default().refreshed())
        .unwrap();
    h.wait_for(second, JobStatus::Succeeded).await;

    let now = h.asset_files(ids[0]);
    assert_eq!(now.len(), 1);
    assert_ne!(now, old);
    let art = h.engine.artwork(ids[0]).await.unwrap();
    assert_eq!(art.len(), 1);
    assert_eq!(
        art[0].local_path.as_deref(),
        Some(now[0].to_string_lossy().as_ref())
    );

    h.engine.shutdown().await;
}

#[tokio::test]
async fn failed_artwork_job_leaves_no_files() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    let mut md = heat();
    md.artwork = vec![
        poster("https://img.example/heat/poster.jpg"),
        rk_engine::ArtworkRef {
            kind: ArtworkKind::Backdrop,
            url: "https://img.example/heat/broken.jpg".into(),
            width: None,
            height: None,
        },
    ];
    h.provider.answer("heat", md);
    h.engine.start().unwrap();

    let job = h
        .engine
        .submit(JobKind::ArtworkFetch, ids[0], JobPayload::default())
        .unwrap();
    h.wait_for(job, JobStatus::Failed).await;

    assert_eq!(h.fetcher.fetched(), 1);
    assert!(h.engine.artwork(ids[0]).await.unwrap().is_empty());
    assert!(h.asset_files(ids[0]).is_empty());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn submit_rejects_bad_targets() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);

    assert_matches!(
        h.engine.submit(JobKind::Scan, ids[0], JobPayload::default()),
        Err(Error::Validation(_))
    );
    assert_matches!(
        h.engine.submit(JobKind::Match, lib.id, JobPayload::default()),
        Err(Error::Validation(_))
    );
    assert_matches!(
        h.engine
            .submit(JobKind::Match, rk_core::ItemId::new(9_999), JobPayload::default()),
        Err(Error::NotFound { .. })
    );
}

#[tokio::test]
async fn configured_tmdb_provider_matches_items() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search/movie"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": [{"id": 949}]})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movie/949"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 949,
            "title": "Heat",
            "release_date": "1995-12-15",
            "credits": {"cast": [{"name": "Al Pacino", "character": "Vincent Hanna"}], "crew": []}
        })))
        .mount(&server)
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    let mut config = TestHarness::config(&dir);
    config.providers.primary = None;
    config.providers.tmdb = Some(rk_core::config::TmdbConfig {
        api_key: "secret".into(),
        base_url: server.uri(),
        ..Default::default()
    });
    let db = rk_db::init_pool(&config.database).unwrap();
    let engine = rk_engine::Engine::builder(config)
        .db(db.clone())
        .asset_fetcher(Arc::new(common::StubFetcher::default()))
        .build()
        .unwrap();

    let root = dir.path().join("films");
    std::fs::create_dir_all(&root).unwrap();
    let lib = engine
        .create_library("films", &root.to_string_lossy())
        .await
        .unwrap();
    let item = {
        let conn = rk_db::get_conn(&db).unwrap();
        queries::items::create_item(
            &conn,
            &rk_db::models::NewItem {
                library_id: lib.id,
                file_path: root.join("heat.mkv").to_string_lossy().into_owned(),
                title: "heat".into(),
                year: Some(1995),
            },
        )
        .unwrap()
        .id
    };
    engine.start().unwrap();

    let job = engine.submit(JobKind::Match, item, JobPayload::default()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), engine.wait_idle())
        .await
        .unwrap();
    assert_eq!(engine.status(job).unwrap(), JobStatus::Succeeded);

    let matched = engine.get_item(item).await.unwrap();
    assert_eq!(matched.title, "Heat");
    assert_eq!(matched.match_status, MatchStatus::Matched);
    assert_eq!(matched.external_ids.get("tmdb").map(String::as_str), Some("949"));

    engine.shutdown().await;
}

#[tokio::test]
async fn unknown_provider_fails_job() {
    let h = TestHarness::new();
    let lib = h.library("films").await;
    let ids = h.add_items(lib.id, &["heat"]);
    h.engine.start().unwrap();

    let job = h
        .engine
        .submit(
            JobKind::Match,
            ids[0],
            JobPayload::default().with_provider("nowhere"),
        )
        .unwrap();
    h.wait_for(job, JobStatus::Failed).await;
    assert!(h
        .engine
        .job(job)
        .unwrap()
        .error
        .unwrap()
        .contains("unknown provider"));

    h.engine.shutdown().await;
}
