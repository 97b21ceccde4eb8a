//! TMDB (The Movie Database) metadata provider.
//!
//! Implements [`MetadataProvider`] against the TMDB v3 REST API. A query
//! carrying `id.tmdb` goes straight to the movie detail; otherwise the title
//! (and year, when known) is searched first and the top hit is used. Credits
//! and images come back in the same detail request.
//!
//! Rate limiting and retries are not done here: the gateway throttles every
//! provider and the job queue retries what [`ProviderError::is_retryable`]
//! allows.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rk_cache::QueryParams;
use rk_core::config::TmdbConfig;
use rk_core::{ArtworkKind, Error};
use serde::Deserialize;

use crate::provider::{ArtworkRef, CreditRef, Metadata, MetadataProvider, ProviderError};

/// Cast entries kept per title.
const MAX_CAST: usize = 20;
/// Crew jobs worth recording.
const CREW_JOBS: [&str; 4] = ["Director", "Screenplay", "Writer", "Original Music Composer"];

// ---------------------------------------------------------------------------
// TMDB API response types (private)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct MovieDetail {
    id: u64,
    title: Option<String>,
    original_title: Option<String>,
    overview: Option<String>,
    release_date: Option<String>,
    runtime: Option<i32>,
    #[serde(default)]
    genres: Vec<Genre>,
    imdb_id: Option<String>,
    credits: Option<Credits>,
    images: Option<Images>,
}

#[derive(Debug, Deserialize)]
struct Genre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Credits {
    #[serde(default)]
    cast: Vec<CastMember>,
    #[serde(default)]
    crew: Vec<CrewMember>,
}

#[derive(Debug, Deserialize)]
struct CastMember {
    name: String,
    character: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CrewMember {
    name: String,
    job: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Images {
    posters: Vec<Image>,
    backdrops: Vec<Image>,
    logos: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct Image {
    file_path: String,
    width: Option<i32>,
    height: Option<i32>,
    #[serde(default)]
    vote_average: f64,
}

// ---------------------------------------------------------------------------
// Provider implementation
// ---------------------------------------------------------------------------

#[cfg_attr(test, derive(Debug))]
pub struct TmdbProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    image_base_url: String,
    language: String,
}

impl TmdbProvider {
    pub fn new(config: &TmdbConfig) -> rk_core::Result<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| Error::Validation("providers.tmdb has no api_key".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("reelkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            image_base_url: config.image_base_url.trim_end_matches('/').to_string(),
            language: config.language.clone(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str()), ("language", self.language.as_str())])
            .query(params)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("TMDB request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            tracing::debug!(path, status = %status, "TMDB request rejected");
            return Err(status_error(status, retry_after, path));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("TMDB response unreadable: {e}")))
    }

    async fn search(&self, title: &str, year: Option<&str>) -> Result<u64, ProviderError> {
        let mut params = vec![("query", title)];
        if let Some(year) = year {
            params.push(("year", year));
        }
        let found: SearchResponse = self.get("/search/movie", &params).await?;
        found
            .results
            .first()
            .map(|r| r.id)
            .ok_or_else(|| ProviderError::NotFound(format!("no TMDB movie titled {title:?}")))
    }

    async fn detail(&self, id: &str) -> Result<MovieDetail, ProviderError> {
        self.get(
            &format!("/movie/{id}"),
            &[
                ("append_to_response", "credits,images"),
                ("include_image_language", "en,null"),
            ],
        )
        .await
    }

    fn metadata_from(&self, detail: MovieDetail) -> Metadata {
        let mut metadata = Metadata {
            title: detail.title.unwrap_or_default(),
            original_title: detail.original_title,
            year: detail
                .release_date
                .as_deref()
                .and_then(|d| d.get(..4))
                .and_then(|y| y.parse().ok()),
            runtime_minutes: detail.runtime.filter(|r| *r > 0),
            overview: detail.overview.filter(|o| !o.is_empty()),
            genres: detail.genres.into_iter().map(|g| g.name).collect(),
            ..Default::default()
        };

        metadata
            .external_ids
            .insert("tmdb".into(), detail.id.to_string());
        if let Some(imdb) = detail.imdb_id.filter(|i| !i.is_empty()) {
            metadata.external_ids.insert("imdb".into(), imdb);
        }

        if let Some(credits) = detail.credits {
            metadata.cast = credits
                .cast
                .into_iter()
                .take(MAX_CAST)
                .map(|c| CreditRef {
                    name: c.name,
                    part: c.character.filter(|p| !p.is_empty()),
                })
                .collect();
            metadata.crew = credits
                .crew
                .into_iter()
                .filter(|c| c.job.as_deref().is_some_and(|j| CREW_JOBS.contains(&j)))
                .map(|c| CreditRef {
                    name: c.name,
                    part: c.job,
                })
                .collect();
        }

        let images = detail.images.unwrap_or_default();
        for (kind, list) in [
            (ArtworkKind::Poster, images.posters),
            (ArtworkKind::Backdrop, images.backdrops),
            (ArtworkKind::Logo, images.logos),
        ] {
            if let Some(best) = list
                .into_iter()
                .max_by(|a, b| a.vote_average.total_cmp(&b.vote_average))
            {
                metadata.artwork.push(ArtworkRef {
                    kind,
                    url: format!("{}{}", self.image_base_url, best.file_path),
                    width: best.width,
                    height: best.height,
                });
            }
        }

        metadata
    }
}

#[async_trait]
impl MetadataProvider for TmdbProvider {
    fn name(&self) -> &str {
        "tmdb"
    }

    async fn lookup(&self, query: &QueryParams) -> Result<Metadata, ProviderError> {
        if query.get("scope") == Some("subtitles") {
            return Err(ProviderError::NotFound("TMDB does not serve subtitles".into()));
        }

        let id = match query.get("id.tmdb") {
            Some(id) => id.to_string(),
            None => {
                let title = query
                    .get("title")
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| ProviderError::InvalidQuery("query has no title".into()))?;
                self.search(title, query.get("year")).await?.to_string()
            }
        };

        let detail = self.detail(&id).await?;
        Ok(self.metadata_from(detail))
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, path: &str) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(format!("TMDB has nothing at {path}")),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED => ProviderError::InvalidQuery("TMDB rejected the API key".into()),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            ProviderError::Unavailable(format!("TMDB returned {s}"))
        }
        s => ProviderError::InvalidQuery(format!("TMDB returned {s} for {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> TmdbProvider {
        TmdbProvider::new(&TmdbConfig {
            api_key: "secret".into(),
            base_url: server.uri(),
            image_base_url: "https://img.test/t/p/original".into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn heat_detail() -> serde_json::Value {
        serde_json::json!({
            "id": 949,
            "title": "Heat",
            "original_title": "Heat",
            "overview": "Obsessive master thief Neil McCauley...",
            "release_date": "1995-12-15",
            "runtime": 170,
            "genres": [{"id": 28, "name": "Action"}, {"id": 80, "name": "Crime"}],
            "imdb_id": "tt0113277",
            "credits": {
                "cast": [
                    {"name": "Al Pacino", "character": "Lt. Vincent Hanna"},
                    {"name": "Robert De Niro", "character": "Neil McCauley"}
                ],
                "crew": [
                    {"name": "Michael Mann", "job": "Director"},
                    {"name": "Art Linson", "job": "Producer"}
                ]
            },
            "images": {
                "posters": [
                    {"file_path": "/low.jpg", "width": 500, "height": 750, "vote_average": 4.1},
                    {"file_path": "/best.jpg", "width": 1000, "height": 1500, "vote_average": 5.6}
                ],
                "backdrops": [
                    {"file_path": "/bd.jpg", "width": 1920, "height": 1080, "vote_average": 5.0}
                ],
                "logos": []
            }
        })
    }

    async fn by_title(tmdb: &TmdbProvider, title: &str) -> Result<Metadata, ProviderError> {
        tmdb.lookup(&QueryParams::new().with("title", title)).await
    }

    #[tokio::test]
    async fn title_lookup_searches_then_fetches_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .and(query_param("query", "Heat"))
            .and(query_param("year", "1995"))
            .and(query_param("api_key", "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": [{"id": 949}]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/movie/949"))
            .respond_with(ResponseTemplate::new(200).set_body_json(heat_detail()))
            .expect(1)
            .mount(&server)
            .await;

        let query = QueryParams::new().with("title", "Heat").with("year", "1995");
        let md = provider(&server).lookup(&query).await.unwrap();

        assert_eq!(md.title, "Heat");
        assert_eq!(md.year, Some(1995));
        assert_eq!(md.runtime_minutes, Some(170));
        assert_eq!(md.genres, vec!["Action", "Crime"]);
        assert_eq!(md.external_ids.get("tmdb").map(String::as_str), Some("949"));
        assert_eq!(md.external_ids.get("imdb").map(String::as_str), Some("tt0113277"));
        assert_eq!(md.cast.len(), 2);
        assert_eq!(md.cast[1].part.as_deref(), Some("Neil McCauley"));
        assert_eq!(md.crew.len(), 1);
        assert_eq!(md.crew[0].name, "Michael Mann");

        assert_eq!(md.artwork.len(), 2);
        assert_eq!(md.artwork[0].kind, ArtworkKind::Poster);
        assert_eq!(md.artwork[0].url, "https://img.test/t/p/original/best.jpg");
        assert_eq!(md.artwork[1].kind, ArtworkKind::Backdrop);
    }

    #[tokio::test]
    async fn known_id_skips_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/movie/949"))
            .respond_with(ResponseTemplate::new(200).set_body_json(heat_detail()))
            .mount(&server)
            .await;

        let query = QueryParams::new()
            .with("scope", "artwork")
            .with("title", "Heat")
            .with("id.tmdb", "949");
        let md = provider(&server).lookup(&query).await.unwrap();
        assert_eq!(md.artwork.len(), 2);
    }

    #[tokio::test]
    async fn errors_map_onto_provider_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .and(query_param("query", "Nothing"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .and(query_param("query", "Busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .and(query_param("query", "Down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let tmdb = provider(&server);
        assert_matches!(by_title(&tmdb, "Nothing").await, Err(ProviderError::NotFound(_)));
        assert_eq!(
            by_title(&tmdb, "Busy").await,
            Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            })
        );
        assert_matches!(by_title(&tmdb, "Down").await, Err(ProviderError::Unavailable(_)));
        assert_matches!(by_title(&tmdb, "  ").await, Err(ProviderError::InvalidQuery(_)));

        let subtitles = QueryParams::new()
            .with("scope", "subtitles")
            .with("title", "Heat");
        assert_matches!(tmdb.lookup(&subtitles).await, Err(ProviderError::NotFound(_)));
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = TmdbConfig {
            api_key: "  ".into(),
            ..Default::default()
        };
        if std::env::var("TMDB_API_KEY").is_err() {
            assert_matches!(TmdbProvider::new(&config), Err(Error::Validation(_)));
        }
    }
}
