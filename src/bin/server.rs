//! HTTP server wiring the two streaming protocols onto the query pipeline.
//! Plain tokio HTTP handling, no web framework.

use anyhow::Context;
use clap::Parser;
use datapilot::config::RunConfig;
use datapilot::events::EventSink;
use datapilot::llm::{ChatModel, LlmClient};
use datapilot::observability::execution_log::ExecutionLogStore;
use datapilot::pipeline::{QueryPipeline, QueryRequest};
use datapilot::search::{DatasetSearch, HttpDatasetSearch};
use datapilot::sql_exec::{HttpSqlExecutor, SqlExecutor};
use datapilot::stream::native::NativeSseAdapter;
use datapilot::stream::openai::{
    CompletionCollector, OpenAiStreamAdapter, DONE_SENTINEL,
};
use datapilot::stream::translator::{
    ChunkMessage, ChunkType, EventTranslator, Role, StructuredChatStreamChunk,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "datapilot-server", about = "Natural-language analytics API server")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
}

struct AppState {
    llm: Arc<LlmClient>,
    search: Arc<dyn DatasetSearch>,
    executor: Arc<dyn SqlExecutor>,
    config: RunConfig,
    log_store: Arc<ExecutionLogStore>,
}

impl AppState {
    /// Build a pipeline for one request, honoring a per-request model.
    fn pipeline(&self, model: Option<&str>) -> anyhow::Result<QueryPipeline> {
        let llm: Arc<dyn ChatModel> = match model {
            Some(model) if model != self.llm.model() => {
                Arc::new(LlmClient::from_env(model.to_string())?)
            }
            _ => self.llm.clone(),
        };
        Ok(QueryPipeline::new(
            llm,
            Arc::clone(&self.search),
            Arc::clone(&self.executor),
            self.config.clone(),
        )
        .with_log_store(Arc::clone(&self.log_store)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = RunConfig::from_env();
    let llm = Arc::new(
        LlmClient::from_env(config.default_model.clone()).context("LLM client setup failed")?,
    );
    let search_url =
        std::env::var("SEARCH_SERVICE_URL").context("SEARCH_SERVICE_URL not set")?;
    let sql_url = std::env::var("SQL_SERVICE_URL").context("SQL_SERVICE_URL not set")?;

    let state = Arc::new(AppState {
        llm,
        search: Arc::new(HttpDatasetSearch::new(search_url)),
        executor: Arc::new(HttpSqlExecutor::new(sql_url)),
        config,
        log_store: Arc::new(ExecutionLogStore::default()),
    });

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.addr))?;
    info!("Listening on {}", args.addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                warn!("Connection from {} failed: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
    let request = read_request(&mut stream).await?;
    let Some((method, path, body)) = parse_request(&request) else {
        return respond(&mut stream, 400, "application/json", b"{\"error\":\"bad request\"}").await;
    };

    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => {
            respond(&mut stream, 200, "application/json", b"{\"status\":\"ok\"}").await
        }
        ("GET", "/api/logs") => {
            let json = state.log_store.export_json();
            respond(&mut stream, 200, "application/json", json.as_bytes()).await
        }
        ("POST", "/api/chat/stream") => handle_native_stream(stream, state, &body).await,
        ("POST", "/v1/chat/completions") => handle_openai(stream, state, &body).await,
        _ => respond(&mut stream, 404, "application/json", b"{\"error\":\"not found\"}").await,
    }
}

#[derive(Debug, Deserialize)]
struct NativeChatRequest {
    question: String,
    #[serde(default)]
    project_ids: Option<Vec<String>>,
    #[serde(default)]
    dataset_ids: Option<Vec<String>>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    history: Vec<HistoryTurn>,
}

#[derive(Debug, Deserialize)]
struct HistoryTurn {
    role: String,
    content: String,
}

async fn handle_native_stream(
    mut stream: TcpStream,
    state: Arc<AppState>,
    body: &str,
) -> anyhow::Result<()> {
    let request: NativeChatRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            let message = format!("{{\"error\":\"invalid body: {}\"}}", e);
            return respond(&mut stream, 400, "application/json", message.as_bytes()).await;
        }
    };

    let pipeline = state.pipeline(request.model.as_deref())?;
    let query = QueryRequest {
        question: request.question,
        history: request
            .history
            .into_iter()
            .map(|t| (t.role, t.content))
            .collect(),
        project_ids: request.project_ids,
        dataset_ids: request.dataset_ids,
        model: request.model,
    };

    let (sink, mut rx) = EventSink::channel();
    let run = tokio::spawn(async move { pipeline.run(query, sink).await });

    let trace_id = uuid::Uuid::new_v4().to_string();
    let adapter = NativeSseAdapter::new(request.chat_id, Some(trace_id));
    let mut translator = EventTranslator::new();

    stream.write_all(sse_headers().as_bytes()).await?;
    while let Some(event) = rx.recv().await {
        for chunk in translator.translate(&event) {
            if let Some(frame) = adapter.frame(&chunk) {
                stream.write_all(frame.as_bytes()).await?;
                stream.flush().await?;
            }
        }
    }
    // Native protocol: stream ends by closing, no sentinel.
    if let Err(e) = run.await {
        error!("Run task failed: {}", e);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct OpenAiChatRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<OpenAiMessage>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

async fn handle_openai(
    mut stream: TcpStream,
    state: Arc<AppState>,
    body: &str,
) -> anyhow::Result<()> {
    let request: OpenAiChatRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            let message = format!("{{\"error\":\"invalid body: {}\"}}", e);
            return respond(&mut stream, 400, "application/json", message.as_bytes()).await;
        }
    };

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.default_model.clone());

    // The question is the last user turn; anything else is a terminal run
    // error answered apologetically through the normal protocol.
    let last_is_user = request
        .messages
        .last()
        .map(|m| m.role == "user")
        .unwrap_or(false);
    if !last_is_user {
        let apology =
            "I can only answer when the last message is a question from you. Please send your \
             question as the final message.";
        if request.stream {
            let mut adapter = OpenAiStreamAdapter::new(&model);
            stream.write_all(sse_headers().as_bytes()).await?;
            if let Some(delta) = adapter.on_chunk(&ai_chunk(apology)) {
                stream
                    .write_all(OpenAiStreamAdapter::sse_frame(&delta).as_bytes())
                    .await?;
            }
            stream
                .write_all(OpenAiStreamAdapter::sse_frame(&adapter.finish()).as_bytes())
                .await?;
            stream.write_all(DONE_SENTINEL.as_bytes()).await?;
            return Ok(());
        }
        let mut collector = CompletionCollector::new(&model);
        collector.on_chunk(&ai_chunk(apology));
        let completion = serde_json::to_string(&collector.into_completion())?;
        return respond(&mut stream, 200, "application/json", completion.as_bytes()).await;
    }

    let question = request
        .messages
        .last()
        .and_then(|m| m.content.clone())
        .unwrap_or_default();
    let history: Vec<(String, String)> = request.messages[..request.messages.len() - 1]
        .iter()
        .filter_map(|m| m.content.clone().map(|c| (m.role.clone(), c)))
        .collect();

    let pipeline = state.pipeline(request.model.as_deref())?;
    let query = QueryRequest {
        question,
        history,
        project_ids: None,
        dataset_ids: None,
        model: request.model.clone(),
    };

    let (sink, mut rx) = EventSink::channel();
    let run = tokio::spawn(async move { pipeline.run(query, sink).await });
    let mut translator = EventTranslator::new();

    if request.stream {
        let mut adapter = OpenAiStreamAdapter::new(&model);
        stream.write_all(sse_headers().as_bytes()).await?;
        while let Some(event) = rx.recv().await {
            for chunk in translator.translate(&event) {
                if let Some(delta) = adapter.on_chunk(&chunk) {
                    stream
                        .write_all(OpenAiStreamAdapter::sse_frame(&delta).as_bytes())
                        .await?;
                    stream.flush().await?;
                }
            }
        }
        stream
            .write_all(OpenAiStreamAdapter::sse_frame(&adapter.finish()).as_bytes())
            .await?;
        stream.write_all(DONE_SENTINEL.as_bytes()).await?;
        if let Err(e) = run.await {
            error!("Run task failed: {}", e);
        }
        return Ok(());
    }

    let mut collector = CompletionCollector::new(&model);
    while let Some(event) = rx.recv().await {
        for chunk in translator.translate(&event) {
            collector.on_chunk(&chunk);
        }
    }
    if let Err(e) = run.await {
        error!("Run task failed: {}", e);
    }
    let completion = serde_json::to_string(&collector.into_completion())?;
    respond(&mut stream, 200, "application/json", completion.as_bytes()).await
}

fn ai_chunk(content: &str) -> StructuredChatStreamChunk {
    StructuredChatStreamChunk {
        message: ChunkMessage {
            role: Some(Role::Ai),
            content: content.to_string(),
            chunk_type: ChunkType::Stream,
            category: None,
            tool_name: None,
        },
        datasets_used: None,
        generated_sql_query: None,
        error: None,
    }
}

/// Read one HTTP request: headers plus a content-length-delimited body.
async fn read_request(stream: &mut TcpStream) -> anyhow::Result<String> {
    use tokio::time::{timeout, Duration};

    let mut buffer = Vec::new();
    let mut temp = [0u8; 8192];

    timeout(Duration::from_secs(10), async {
        loop {
            let n = stream.read(&mut temp).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&temp[..n]);
            if let Ok(s) = std::str::from_utf8(&buffer) {
                if let Some(headers_end) = s.find("\r\n\r\n") {
                    let body_len = extract_content_length(s).unwrap_or(0);
                    if buffer.len() >= headers_end + 4 + body_len {
                        break;
                    }
                }
            }
            if buffer.len() > 1_000_000 {
                anyhow::bail!("Request too large");
            }
        }
        Ok(())
    })
    .await
    .context("Request read timeout")??;

    Ok(String::from_utf8(buffer)?)
}

fn extract_content_length(request: &str) -> Option<usize> {
    request
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse().ok())
}

fn parse_request(request: &str) -> Option<(String, String, String)> {
    let mut lines = request.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let body = request
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    Some((method, path, body))
}

fn sse_headers() -> String {
    "HTTP/1.1 200 OK\r\n\
     Content-Type: text/event-stream\r\n\
     Cache-Control: no-cache\r\n\
     Connection: close\r\n\
     Access-Control-Allow-Origin: *\r\n\r\n"
        .to_string()
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> anyhow::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let headers = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    stream.write_all(headers.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}
