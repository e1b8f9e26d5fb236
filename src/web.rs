use crate::aqqu::{AnswerPayload, AqquResponse, answer_lists, interpretation_strings};
use crate::backend::{BackendClient, BackendEndpoint, ProxyError};
use crate::mentions::strip_entity_mentions;
use crate::qac::{QacPayload, QacResponse, augment_results};
use crate::{EntityIndex, LoadError};
use askama::Html as HtmlEscaper;
use askama::{MarkupDisplay, Template};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};

type SharedState = Arc<AppState>;
type SafeJson = MarkupDisplay<HtmlEscaper, String>;

pub const AQQU_UNREACHABLE: &str = "No connection to Aqqu API";
pub const NO_ANSWERS: &str = "No answers found";

pub struct AppState {
    pub index: EntityIndex,
    pub aqqu: BackendClient,
    pub qac: BackendClient,
    pub static_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Directory served under `/static`.
    pub static_dir: PathBuf,
    pub aqqu: BackendEndpoint,
    pub qac: BackendEndpoint,
    pub backend_timeout: Option<Duration>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0u16; 8], 8080)),
            data_dir: PathBuf::from("data"),
            static_dir: PathBuf::from("static"),
            aqqu: BackendEndpoint::new("titan.informatik.privat", 8300),
            qac: BackendEndpoint::new("nkaba.informatik.privat", 8181),
            backend_timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Backend(#[from] ProxyError),
}

impl AppState {
    pub fn new(index: EntityIndex, config: &WebConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            index,
            aqqu: BackendClient::new("Aqqu API", config.aqqu.clone(), config.backend_timeout)?,
            qac: BackendClient::new("QAC API", config.qac.clone(), config.backend_timeout)?,
            static_dir: config.static_dir.clone(),
        })
    }
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let index = EntityIndex::load(&config.data_dir)?;
    let state = Arc::new(AppState::new(index, &config)?);
    let router = build_router(state);
    info!(
        addr = %config.addr,
        data_dir = %config.data_dir.display(),
        static_dir = %config.static_dir.display(),
        aqqu = %config.aqqu,
        qac = %config.qac,
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

fn build_router(state: SharedState) -> Router {
    let assets = ServeDir::new(&state.static_dir);
    Router::new()
        .route("/", get(home))
        .route("/api/answer", get(api_answer))
        .route("/qac", get(qac))
        .route("/tooltip", get(tooltip))
        .route("/healthz", get(health))
        .nest_service("/static", assets)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Debug, Deserialize)]
struct AnswerParams {
    q: Option<String>,
    qids: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QacParams {
    q: Option<String>,
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TooltipParams {
    qid: Option<String>,
}

/// An entity the user picked from a completion, as linked on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EntityLink {
    qid: String,
    title: String,
    url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AnswerPage {
    question: String,
    entities: Vec<EntityLink>,
    interpretations: Vec<String>,
    answers: Vec<Vec<AnswerPayload>>,
    error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TooltipPayload {
    title: String,
    image: String,
    #[serde(rename = "abstract")]
    abstract_text: String,
}

fn entity_links(index: &EntityIndex, qids: Option<&str>) -> Vec<EntityLink> {
    qids.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|qid| !qid.is_empty())
        .map(|qid| {
            let info = index.info_by_qid(qid);
            EntityLink {
                qid: qid.to_string(),
                title: info.title.clone(),
                url: info.url().unwrap_or_default(),
            }
        })
        .collect()
}

async fn answer_question(
    state: &AppState,
    question: &str,
    qids: Option<&str>,
) -> Result<AnswerPage, ApiError> {
    let mut page = AnswerPage {
        question: question.to_string(),
        entities: entity_links(&state.index, qids),
        ..AnswerPage::default()
    };
    let stripped = strip_entity_mentions(question);
    match state.aqqu.fetch::<AqquResponse>(&stripped).await {
        Ok(response) => {
            page.interpretations = interpretation_strings(&response);
            page.answers = answer_lists(&response, &state.index);
            if page.answers.is_empty() {
                page.error = NO_ANSWERS.to_string();
            }
        }
        Err(err) if err.is_unavailable() => {
            page.error = AQQU_UNREACHABLE.to_string();
        }
        Err(err) => {
            warn!(%err, "Rejecting malformed Aqqu reply");
            return Err(ApiError::bad_gateway(err.to_string()));
        }
    }
    Ok(page)
}

fn question_param(params: &AnswerParams) -> Option<&str> {
    params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
}

async fn home(
    State(state): State<SharedState>,
    Query(params): Query<AnswerParams>,
) -> Response {
    let Some(question) = question_param(&params) else {
        return Html(render_page(&AnswerPage::default())).into_response();
    };
    match answer_question(&state, question, params.qids.as_deref()).await {
        Ok(page) => Html(render_page(&page)).into_response(),
        Err(err) => (err.status, Html(render_error_page(&err.message))).into_response(),
    }
}

async fn api_answer(
    State(state): State<SharedState>,
    Query(params): Query<AnswerParams>,
) -> Result<Json<AnswerPage>, ApiError> {
    let question = question_param(&params)
        .ok_or_else(|| ApiError::bad_request("Query parameter `q` is required"))?;
    let page = answer_question(&state, question, params.qids.as_deref()).await?;
    Ok(Json(page))
}

async fn qac(
    State(state): State<SharedState>,
    Query(params): Query<QacParams>,
) -> Result<Json<QacPayload>, ApiError> {
    let prefix = params
        .q
        .ok_or_else(|| ApiError::bad_request("Query parameter `q` is required"))?;
    let results = match state.qac.fetch::<QacResponse>(&prefix).await {
        Ok(response) => augment_results(&state.index, response),
        Err(err) if err.is_unavailable() => Vec::new(),
        Err(err) => {
            warn!(%err, "Rejecting malformed QAC reply");
            return Err(ApiError::bad_gateway(err.to_string()));
        }
    };
    Ok(Json(QacPayload {
        results,
        timestamp: params.t,
    }))
}

async fn tooltip(
    State(state): State<SharedState>,
    Query(params): Query<TooltipParams>,
) -> Result<Json<TooltipPayload>, ApiError> {
    let qid = params
        .qid
        .ok_or_else(|| ApiError::bad_request("Query parameter `qid` is required"))?;
    let info = state.index.info_by_qid(&qid);
    Ok(Json(TooltipPayload {
        title: info.title.clone(),
        image: info.image.clone(),
        abstract_text: info.abstract_text.clone(),
    }))
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "aqqu-frontend",
        "entities": state.index.len(),
    }))
}

/// JSON embedded in a `<script>` block must not close the element early.
fn script_json(value: &impl Serialize) -> SafeJson {
    let text = serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace("</", "<\\/");
    MarkupDisplay::new_safe(text, HtmlEscaper)
}

struct CandidateView<'a> {
    interpretation: &'a str,
    answers: &'a [AnswerPayload],
}

fn render_page(page: &AnswerPage) -> String {
    let candidates = page
        .answers
        .iter()
        .enumerate()
        .map(|(i, answers)| CandidateView {
            interpretation: page.interpretations.get(i).map_or("", String::as_str),
            answers,
        })
        .collect();
    let template = IndexTemplate {
        page,
        candidates,
        qids: page
            .entities
            .iter()
            .map(|e| e.qid.as_str())
            .collect::<Vec<_>>()
            .join(","),
        page_json: script_json(page),
        version: env!("CARGO_PKG_VERSION"),
    };
    template
        .render()
        .unwrap_or_else(|err| render_error_page(&err.to_string()))
}

fn render_error_page(message: &str) -> String {
    let message = MarkupDisplay::new_unsafe(message, HtmlEscaper).to_string();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Aqqu • Error</title>
    <link rel="stylesheet" href="static/style.css">
  </head>
  <body>
    <main class="page">
      <h1>Something went wrong</h1>
      <p class="error">{message}</p>
      <a href="./">Back to the question form</a>
    </main>
  </body>
</html>"#
    )
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Aqqu{% if !page.question.is_empty() %} • {{ page.question }}{% endif %}</title>
    <link rel="stylesheet" href="static/style.css">
  </head>
  <body>
    <main class="page">
      <header>
        <p class="eyebrow">Aqqu question answering v{{ version }}</p>
        <h1>Ask a question about the world</h1>
      </header>

      <form id="question-form" action="./" method="get" autocomplete="off">
        <input id="question" name="q" type="text" value="{{ page.question }}" placeholder="who directed pulp fiction" autofocus>
        <input id="qids" name="qids" type="hidden" value="{{ qids }}">
        <button type="submit">Ask</button>
        <div id="completions" class="completions"></div>
      </form>
      <div id="tooltip" class="tooltip"><img class="img" alt=""><p class="abstract"></p></div>

      {% if page.entities.len() > 0 %}
      <section class="entities">
        {% for entity in page.entities %}
        {% if entity.url.is_empty() %}
        <span class="entity" data-qid="{{ entity.qid }}">{{ entity.qid }}</span>
        {% else %}
        <a class="entity" data-qid="{{ entity.qid }}" href="{{ entity.url }}">{{ entity.title }}</a>
        {% endif %}
        {% endfor %}
      </section>
      {% endif %}

      {% if !page.error.is_empty() %}
      <p class="error">{{ page.error }}</p>
      {% endif %}

      {% if candidates.len() > 0 %}
      <ol class="candidates">
        {% for candidate in candidates %}
        <li>
          <p class="interpretation">{{ candidate.interpretation }}</p>
          <ul class="answers">
            {% for answer in candidate.answers %}
            <li class="answer">
              {% if !answer.image.is_empty() %}<img src="{{ answer.image }}" alt="">{% endif %}
              {% if answer.url.is_empty() %}
              <span class="name">{{ answer.name }}</span>
              {% else %}
              <a class="name" href="{{ answer.url }}">{{ answer.name }}</a>
              {% endif %}
              {% if !answer.abstract_text.is_empty() %}<p class="abstract">{{ answer.abstract_text }}</p>{% endif %}
            </li>
            {% endfor %}
          </ul>
        </li>
        {% endfor %}
      </ol>
      {% endif %}
    </main>
    <script id="page-data" type="application/json">{{ page_json }}</script>
    <script src="static/app.js"></script>
  </body>
</html>"#,
    ext = "html"
)]
struct IndexTemplate<'a> {
    page: &'a AnswerPage,
    candidates: Vec<CandidateView<'a>>,
    qids: String,
    page_json: SafeJson,
    version: &'static str,
}
