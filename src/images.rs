//! Batch lookup of Wikipedia page thumbnails for every titled QID.

use crate::data::{self, LoadError};
use indexmap::IndexMap;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const WIKIPEDIA_API: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_THUMB_SIZE: u32 = 500;
const PROGRESS_EVERY: usize = 1000;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Wikipedia API still failing after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Capped exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries are logged at `warn` on the first one and every `warn_every`
    /// after that, at `debug` otherwise.
    pub warn_every: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            warn_every: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn should_warn(&self, attempt: u32) -> bool {
        self.warn_every <= 1 || attempt % self.warn_every == 1
    }
}

/// Reads `(qid, title)` pairs from a `qid, title, image, abstract` mapping.
/// QIDs without a title cannot be looked up and are left out.
pub fn read_title_list(path: &Path) -> Result<Vec<(String, String)>, LoadError> {
    info!(path = %path.display(), "Reading Wikipedia mapping file");
    Ok(data::read_info_tsv(path)?
        .into_iter()
        .filter(|(_, info)| !info.title.is_empty())
        .map(|(qid, info)| (qid, info.title))
        .collect())
}

/// Distinct titles of one API request, each with the QIDs that share it.
#[derive(Debug, Default, Clone)]
pub struct TitleBatch {
    titles: IndexMap<String, Vec<String>>,
}

impl TitleBatch {
    pub fn push(&mut self, qid: impl Into<String>, title: impl Into<String>) {
        self.titles
            .entry(title.into())
            .or_default()
            .push(qid.into());
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> + '_ {
        self.titles.keys().map(String::as_str)
    }

    pub fn joined_titles(&self) -> String {
        self.titles().collect::<Vec<_>>().join("|")
    }

    fn take(&mut self) -> TitleBatch {
        std::mem::take(self)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageImagesResponse {
    #[serde(default)]
    pub query: PageImagesQuery,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageImagesQuery {
    #[serde(default)]
    pub normalized: Vec<Normalized>,
    #[serde(default)]
    pub pages: Vec<PageImage>,
}

#[derive(Debug, Deserialize)]
pub struct Normalized {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct PageImage {
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
pub struct Thumbnail {
    pub source: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// `(qid, thumbnail url)`; the url is empty for pages without an image.
    pub urls: Vec<(String, String)>,
    /// Titles the API answer could not be matched with.
    pub errors: Vec<String>,
}

/// Matches the pages of an API answer back to the QIDs of the batch.
pub fn resolve_batch(mut batch: TitleBatch, response: PageImagesResponse) -> BatchOutcome {
    // Several requested spellings may normalize to the same page.
    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
    for n in response.query.normalized {
        aliases.entry(n.to).or_default().push(n.from);
    }
    let mut outcome = BatchOutcome::default();
    for page in response.query.pages {
        let thumbnail = page.thumbnail.map(|t| t.source).unwrap_or_default();
        let mut requested = aliases.remove(&page.title).unwrap_or_default();
        requested.push(page.title.clone());
        let mut matched = false;
        for title in &requested {
            if let Some(qids) = batch.titles.shift_remove(title) {
                matched = true;
                let urls = qids.into_iter().map(|qid| (qid, thumbnail.clone()));
                outcome.urls.extend(urls);
            }
        }
        if !matched {
            warn!(title = %page.title, "Result title could not be mapped to query");
            outcome.errors.push(page.title);
        }
    }
    if !batch.is_empty() {
        let pending: Vec<&str> = batch.titles().collect();
        warn!(titles = ?pending, "Not all query titles could be mapped to a result");
        outcome.errors.extend(batch.titles.into_keys());
    }
    outcome
}

pub struct ThumbnailClient {
    http: reqwest::Client,
    endpoint: String,
    thumb_size: u32,
    retry: RetryPolicy,
}

impl ThumbnailClient {
    pub fn new(
        endpoint: impl Into<String>,
        thumb_size: u32,
        retry: RetryPolicy,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            thumb_size,
            retry,
        })
    }

    async fn request(&self, titles: &str) -> Result<PageImagesResponse, reqwest::Error> {
        let thumb_size = self.thumb_size.to_string();
        self.http
            .get(&self.endpoint)
            .query(&[
                ("action", "query"),
                ("prop", "pageimages"),
                ("titles", titles),
                ("pithumbsize", thumb_size.as_str()),
                ("format", "json"),
                ("formatversion", "2"),
                ("pilicense", "any"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Queries one batch, retrying according to the policy.
    pub async fn fetch_batch(&self, batch: &TitleBatch) -> Result<PageImagesResponse, FetchError> {
        let titles = batch.joined_titles();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request(&titles).await {
                Ok(response) => return Ok(response),
                Err(source) if attempt >= self.retry.max_attempts => {
                    return Err(FetchError::Exhausted {
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    if self.retry.should_warn(attempt) {
                        warn!(attempt, %err, "Cannot reach Wikipedia API");
                    } else {
                        debug!(attempt, %err, "Cannot reach Wikipedia API");
                    }
                    tokio::time::sleep(self.retry.jittered(attempt)).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: usize,
    pub endpoint: String,
    pub thumb_size: u32,
    pub retry: RetryPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            endpoint: WIKIPEDIA_API.to_string(),
            thumb_size: DEFAULT_THUMB_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub qids: usize,
    pub urls: usize,
    pub errors: usize,
    pub batches: usize,
}

/// `images.tsv` records its failures in `images.err`.
pub fn error_file_path(output: &Path) -> PathBuf {
    output.with_extension("err")
}

struct Sinks {
    output: BufWriter<File>,
    errors: BufWriter<File>,
    output_path: PathBuf,
    error_path: PathBuf,
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> FetchError + '_ {
    move |source| FetchError::Write {
        path: path.to_path_buf(),
        source,
    }
}

fn create_sink(path: &Path) -> Result<BufWriter<File>, FetchError> {
    let file = File::create(path).map_err(write_error(path))?;
    Ok(BufWriter::new(file))
}

impl Sinks {
    fn create(output: &Path) -> Result<Self, FetchError> {
        let error_path = error_file_path(output);
        Ok(Self {
            output: create_sink(output)?,
            errors: create_sink(&error_path)?,
            output_path: output.to_path_buf(),
            error_path,
        })
    }

    fn record(&mut self, outcome: &BatchOutcome) -> Result<(), FetchError> {
        for title in &outcome.errors {
            let line = writeln!(self.errors, "{title}");
            line.map_err(write_error(&self.error_path))?;
        }
        for (qid, url) in &outcome.urls {
            let row = data::write_pair_tsv(&mut self.output, qid, url);
            row.map_err(write_error(&self.output_path))?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), FetchError> {
        self.output.flush().map_err(write_error(&self.output_path))?;
        self.errors.flush().map_err(write_error(&self.error_path))
    }
}

async fn run_batch(
    client: &ThumbnailClient,
    batch: TitleBatch,
    sinks: &mut Sinks,
    stats: &mut FetchStats,
) -> Result<(), FetchError> {
    stats.batches += 1;
    let outcome = match client.fetch_batch(&batch).await {
        Ok(response) => resolve_batch(batch, response),
        Err(err @ FetchError::Exhausted { .. }) => {
            warn!(%err, titles = batch.len(), "Giving up on batch");
            BatchOutcome {
                urls: Vec::new(),
                errors: batch.titles().map(str::to_string).collect(),
            }
        }
        Err(err) => return Err(err),
    };
    stats.urls += outcome.urls.len();
    stats.errors += outcome.errors.len();
    sinks.record(&outcome)
}

/// Looks up a thumbnail for every `(qid, title)` pair and writes `qid, url`
/// lines to `output`. Titles that could not be resolved go to the `.err`
/// side file.
pub async fn fetch_image_mapping(
    titles: Vec<(String, String)>,
    output: &Path,
    options: &FetchOptions,
) -> Result<FetchStats, FetchError> {
    let client = ThumbnailClient::new(
        &options.endpoint,
        options.thumb_size,
        options.retry.clone(),
    )?;
    let batch_size = options.batch_size.max(1);
    let mut sinks = Sinks::create(output)?;
    info!(path = %output.display(), "Querying Wikipedia API for thumbnails");

    let start = Instant::now();
    let mut stats = FetchStats::default();
    let mut batch = TitleBatch::default();
    for (qid, title) in titles {
        batch.push(qid, title);
        if batch.len() == batch_size {
            run_batch(&client, batch.take(), &mut sinks, &mut stats).await?;
        }
        stats.qids += 1;
        if stats.qids % PROGRESS_EVERY == 0 {
            info!(
                qids = stats.qids,
                elapsed = ?start.elapsed(),
                "Thumbnail lookup progress"
            );
        }
    }
    if !batch.is_empty() {
        run_batch(&client, batch, &mut sinks, &mut stats).await?;
    }
    sinks.finish()?;
    info!(
        qids = stats.qids,
        urls = stats.urls,
        errors = stats.errors,
        batches = stats.batches,
        "Done"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(pairs: &[(&str, &str)]) -> TitleBatch {
        let mut batch = TitleBatch::default();
        for (qid, title) in pairs {
            batch.push(*qid, *title);
        }
        batch
    }

    #[test]
    fn delay_grows_exponentially_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(200), Duration::from_secs(60));
    }

    #[test]
    fn warns_on_first_and_every_hundredth_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_warn(1));
        assert!(!policy.should_warn(2));
        assert!(policy.should_warn(101));
    }

    #[test]
    fn shared_titles_are_requested_once() {
        let batch = batch(&[("Q1", "Paris"), ("Q2", "Paris"), ("Q3", "Ulm")]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.joined_titles(), "Paris|Ulm");
    }

    #[test]
    fn resolve_maps_pages_back_to_qids() {
        let response: PageImagesResponse = serde_json::from_value(json!({
            "query": {
                "pages": [
                    {"title": "Paris", "thumbnail": {"source": "http://img/paris.jpg"}},
                    {"title": "Ulm"}
                ]
            }
        }))
        .unwrap();
        let outcome = resolve_batch(
            batch(&[("Q1", "Paris"), ("Q2", "Paris"), ("Q3", "Ulm")]),
            response,
        );
        assert_eq!(
            outcome.urls,
            vec![
                ("Q1".to_string(), "http://img/paris.jpg".to_string()),
                ("Q2".to_string(), "http://img/paris.jpg".to_string()),
                ("Q3".to_string(), String::new()),
            ]
        );
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn resolve_follows_title_normalization() {
        let response: PageImagesResponse = serde_json::from_value(json!({
            "query": {
                "normalized": [{"from": "bar_film", "to": "Bar film"}],
                "pages": [{"title": "Bar film", "thumbnail": {"source": "http://img/b.png"}}]
            }
        }))
        .unwrap();
        let outcome = resolve_batch(batch(&[("Q9", "bar_film")]), response);
        assert_eq!(
            outcome.urls,
            vec![("Q9".to_string(), "http://img/b.png".to_string())]
        );
    }

    #[test]
    fn spellings_of_one_page_all_resolve() {
        let response: PageImagesResponse = serde_json::from_value(json!({
            "query": {
                "normalized": [
                    {"from": "bar_film", "to": "Bar film"},
                    {"from": "bar film", "to": "Bar film"}
                ],
                "pages": [{"title": "Bar film", "thumbnail": {"source": "http://img/b.png"}}]
            }
        }))
        .unwrap();
        let titles = batch(&[
            ("Q1", "bar_film"),
            ("Q2", "bar film"),
            ("Q3", "Bar film"),
        ]);
        let outcome = resolve_batch(titles, response);
        let qids: Vec<&str> = outcome.urls.iter().map(|u| u.0.as_str()).collect();
        assert_eq!(qids, ["Q1", "Q2", "Q3"]);
        let image = "http://img/b.png";
        assert!(outcome.urls.iter().all(|(_, url)| url == image));
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn unmatched_titles_are_errors() {
        let response: PageImagesResponse = serde_json::from_value(json!({
            "query": {"pages": [{"title": "Surprise"}]}
        }))
        .unwrap();
        let outcome = resolve_batch(batch(&[("Q1", "Asked")]), response);
        assert!(outcome.urls.is_empty());
        assert_eq!(
            outcome.errors,
            vec!["Surprise".to_string(), "Asked".to_string()]
        );
    }

    #[test]
    fn error_file_replaces_extension() {
        assert_eq!(
            error_file_path(Path::new("/tmp/qid_to_image.tsv")),
            PathBuf::from("/tmp/qid_to_image.err")
        );
    }

    #[test]
    fn title_list_skips_untitled_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.tsv");
        std::fs::write(&path, "Q1\tParis\t\t\nQ2\t\thttp://img\t\nQ3\tUlm\t\t\n").unwrap();
        let titles = read_title_list(&path).unwrap();
        assert_eq!(
            titles,
            vec![
                ("Q1".to_string(), "Paris".to_string()),
                ("Q3".to_string(), "Ulm".to_string())
            ]
        );
    }
}
