//! HTTP shell for the GTFS insight engine.
//!
//! Thin I/O layer over the library: upload a feed, ask questions, pick a
//! model, watch the diagnostic feed. Plain HTTP over tokio, one task per
//! connection, the diagnostic feed as a server-sent event stream.

use clap::Parser;
use gtfs_insight::llm::{AnthropicBackend, GroqBackend};
use gtfs_insight::{
    AnswerRequest, BackendRegistry, DatasetStore, EventBus, PipelineConfig, QueryOrchestrator,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "gtfs-insight-server")]
#[command(about = "Natural-language question answering over a GTFS feed")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "BIND_ADDR")]
    bind: String,

    /// SQLite database file for the ingested dataset
    #[arg(long, default_value = "gtfs.db", env = "GTFS_DB")]
    db: PathBuf,

    /// Maximum query-correction retries per question
    #[arg(long, default_value_t = 2, env = "REPAIR_LIMIT")]
    repair_limit: u32,
}

struct AppState {
    store: Arc<DatasetStore>,
    registry: Arc<BackendRegistry>,
    orchestrator: QueryOrchestrator,
    events: EventBus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let events = EventBus::default();
    let store = Arc::new(DatasetStore::open(&args.db, events.clone())?);

    let mut registry = BackendRegistry::new();
    match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) => registry.register(
            "anthropic",
            Arc::new(AnthropicBackend::new(key)),
            vec!["claude-3-5-sonnet-20240620".to_string()],
        ),
        Err(_) => warn!("ANTHROPIC_API_KEY not set; anthropic backend unavailable"),
    }
    match std::env::var("GROQ_API_KEY") {
        Ok(key) => registry.register(
            "groq",
            Arc::new(GroqBackend::new(key)),
            vec![
                "llama-3.1-70b-versatile".to_string(),
                "llama-3.1-405b-reasoning".to_string(),
            ],
        ),
        Err(_) => warn!("GROQ_API_KEY not set; groq backend unavailable"),
    }
    let registry = Arc::new(registry);

    let orchestrator = QueryOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        events.clone(),
        PipelineConfig {
            repair_limit: args.repair_limit,
        },
    );

    let state = Arc::new(AppState {
        store,
        registry,
        orchestrator,
        events,
    });

    let listener = TcpListener::bind(&args.bind).await?;
    info!("listening on {}", args.bind);

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                error!("connection from {} failed: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) -> std::io::Result<()> {
    use tokio::time::{timeout, Duration};

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    let read_result = timeout(Duration::from_secs(10), async {
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
            if let Some(headers_end) = find_headers_end(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..headers_end]);
                match content_length(&headers) {
                    Some(len) if buffer.len() >= headers_end + len => break,
                    Some(_) => continue,
                    None => break,
                }
            }
            // Refuse unbounded uploads.
            if buffer.len() > 64 * 1024 * 1024 {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    if read_result.is_err() {
        warn!("request read timeout");
        return Ok(());
    }
    read_result.unwrap()?;

    let Some(headers_end) = find_headers_end(&buffer) else {
        return write_response(&mut stream, 400, "application/json", b"{\"error\":\"bad request\"}").await;
    };
    let head = String::from_utf8_lossy(&buffer[..headers_end]).to_string();
    let body = &buffer[headers_end..];

    let mut parts = head.lines().next().unwrap_or("").split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    info!("{} {}", method, path);

    match (method, path) {
        ("POST", "/upload") => handle_upload(&mut stream, &state, body).await,
        ("POST", "/chat") => handle_chat(&mut stream, &state, body).await,
        ("POST", "/query") => handle_query(&mut stream, &state, body).await,
        ("GET", "/get_available_models") => handle_models(&mut stream, &state).await,
        ("POST", "/select_model") => handle_select_model(&mut stream, &state, body).await,
        ("GET", "/events") => handle_events(&mut stream, &state).await,
        ("OPTIONS", _) => write_response(&mut stream, 204, "text/plain", b"").await,
        _ => {
            write_response(&mut stream, 404, "application/json", b"{\"error\":\"not found\"}").await
        }
    }
}

async fn handle_upload(
    stream: &mut TcpStream,
    state: &AppState,
    body: &[u8],
) -> std::io::Result<()> {
    if body.is_empty() {
        return write_json(stream, 400, &serde_json::json!({"error": "empty upload"})).await;
    }
    match state.store.ingest(body) {
        Ok(report) => {
            let payload = serde_json::json!({
                "status": "ok",
                "tables_loaded": report.tables_loaded,
                "row_counts": report.row_counts,
                "skipped": report.skipped,
            });
            write_json(stream, 200, &payload).await
        }
        Err(e) => write_json(stream, 400, &serde_json::json!({"error": e.to_string()})).await,
    }
}

async fn handle_chat(
    stream: &mut TcpStream,
    state: &AppState,
    body: &[u8],
) -> std::io::Result<()> {
    let request: AnswerRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return write_json(stream, 400, &serde_json::json!({"error": e.to_string()})).await
        }
    };
    let outcome = state.orchestrator.answer(&request).await;
    let payload = match outcome {
        gtfs_insight::PipelineOutcome::Success {
            columns,
            rows,
            summary,
            query,
            ..
        } => serde_json::json!({
            "columns": columns,
            "rows": rows,
            "summary": summary,
            "query": query,
        }),
        gtfs_insight::PipelineOutcome::Failed {
            stage,
            message,
            last_query,
            ..
        } => serde_json::json!({
            "error": { "stage": stage, "message": message, "last_query": last_query },
        }),
    };
    write_json(stream, 200, &payload).await
}

#[derive(Deserialize)]
struct RawQuery {
    query: String,
}

async fn handle_query(
    stream: &mut TcpStream,
    state: &AppState,
    body: &[u8],
) -> std::io::Result<()> {
    let request: RawQuery = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return write_json(stream, 400, &serde_json::json!({"error": e.to_string()})).await
        }
    };
    match state.store.execute(&request.query) {
        Ok(rows) => write_json(stream, 200, &serde_json::to_value(&rows).unwrap_or_default()).await,
        Err(e) => write_json(stream, 400, &serde_json::json!({"error": e.to_string()})).await,
    }
}

async fn handle_models(stream: &mut TcpStream, state: &AppState) -> std::io::Result<()> {
    let listing = state.registry.list_available();
    write_json(stream, 200, &serde_json::to_value(&listing).unwrap_or_default()).await
}

#[derive(Deserialize)]
struct SelectModel {
    provider: String,
    model: String,
}

async fn handle_select_model(
    stream: &mut TcpStream,
    state: &AppState,
    body: &[u8],
) -> std::io::Result<()> {
    let request: SelectModel = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return write_json(stream, 400, &serde_json::json!({"error": e.to_string()})).await
        }
    };
    match state.registry.set_active(&request.provider, &request.model) {
        Ok(()) => write_json(stream, 200, &serde_json::json!({"status": "ok"})).await,
        Err(e) => write_json(stream, 404, &serde_json::json!({"error": e.to_string()})).await,
    }
}

/// Server-sent event stream of diagnostic events, one `data:` frame each,
/// written as they are broadcast. A disconnected observer just drops off.
async fn handle_events(stream: &mut TcpStream, state: &AppState) -> std::io::Result<()> {
    let headers = "HTTP/1.1 200 OK\r\n\
                   Content-Type: text/event-stream\r\n\
                   Cache-Control: no-cache\r\n\
                   Access-Control-Allow-Origin: *\r\n\
                   Connection: keep-alive\r\n\r\n";
    stream.write_all(headers.as_bytes()).await?;
    stream.flush().await?;

    let mut rx = state.events.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                let frame = format!("data: {}\n\n", json);
                if stream.write_all(frame.as_bytes()).await.is_err() {
                    break; // observer went away
                }
                stream.flush().await?;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                let frame = format!("data: {{\"dropped\": {}}}\n\n", n);
                if stream.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                stream.flush().await?;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

fn content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

async fn write_json(
    stream: &mut TcpStream,
    status: u16,
    payload: &serde_json::Value,
) -> std::io::Result<()> {
    let body = payload.to_string();
    write_response(stream, status, "application/json", body.as_bytes()).await
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let headers = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    stream.write_all(headers.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}
