use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use ragpipe::ingest::IngestReport;
use ragpipe::server::{
    DeleteResponse, DocumentResponse, ErrorBody, IngestRequest, QueryRequest, QueryResponse,
    SearchResponse, StreamHeader, StreamToken,
};
use ragpipe::{DocumentId, Metadata, SearchFilter};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use reqwest_eventsource::{Event, RequestBuilderExt};

#[derive(Parser, Debug)]
#[command(
    name = "ragpipe",
    about = "Ingest documents into and ask questions of a running ragpipe-server"
)]
struct RagCli {
    /// Base URL of the ragpipe server
    #[arg(long, env = "RAGPIPE_URL", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Bearer token presented to the server
    #[arg(long, env = "RAGPIPE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a UTF-8 text file
    Ingest {
        /// File to read
        file: PathBuf,
        /// Source reference stored with the document (defaults to the file path)
        #[arg(long)]
        source_ref: Option<String>,
        /// Metadata entries as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_meta)]
        metadata: Vec<(String, String)>,
    },
    /// Ask a question
    Ask {
        /// Question text
        question: String,
        /// Number of chunks to retrieve
        #[arg(long)]
        top_k: Option<usize>,
        /// Embedding model partition to search
        #[arg(long)]
        model_version: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
        /// Print tokens as they arrive
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// List the chunks closest to a query without generating an answer
    Search {
        /// Query text
        query: String,
        /// Number of chunks to return
        #[arg(long)]
        top_k: Option<usize>,
        /// Embedding model partition to search
        #[arg(long)]
        model_version: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show a document and its chunks
    Show {
        /// Document id
        id: String,
    },
    /// Delete a document and everything derived from it
    Delete {
        /// Document id
        id: String,
    },
}

/// Retrieval restrictions shared by `ask` and `search`.
#[derive(Args, Debug)]
struct FilterArgs {
    /// Only retrieve chunks of this document
    #[arg(long)]
    document: Option<String>,
    /// Required document metadata as key=value, repeatable
    #[arg(long = "where", value_parser = parse_meta)]
    metadata: Vec<(String, String)>,
}

impl FilterArgs {
    fn into_filter(self) -> Result<SearchFilter> {
        let document_id = self
            .document
            .map(|raw| {
                raw.parse::<DocumentId>()
                    .map_err(|_| anyhow!("invalid document id {raw}"))
            })
            .transpose()?;
        Ok(SearchFilter {
            document_id,
            metadata: self.metadata.into_iter().collect(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RagCli::parse();
    let client = build_client(cli.token.as_deref())?;
    let base = cli.server.trim_end_matches('/').to_string();

    match cli.command {
        Command::Ingest {
            file,
            source_ref,
            metadata,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let request = IngestRequest {
                source_ref: source_ref.unwrap_or_else(|| file.display().to_string()),
                text,
                metadata: metadata.into_iter().collect::<Metadata>(),
            };
            let resp = send(client.post(format!("{base}/v1/documents")).json(&request)).await?;
            let report: IngestReport = resp.json().await.context("failed to parse ingest response")?;
            println!(
                "Ingested document {} ({} chunks)",
                report.document_id,
                report.chunk_ids.len()
            );
        }
        Command::Ask {
            question,
            top_k,
            model_version,
            filter,
            stream,
        } => {
            let request = QueryRequest {
                query: question,
                top_k,
                model_version,
                filter: filter.into_filter()?,
            };
            if stream {
                ask_streaming(&client, &base, &request).await?;
            } else {
                let resp = send(client.post(format!("{base}/v1/query")).json(&request)).await?;
                let parsed: QueryResponse = resp.json().await.context("failed to parse answer")?;
                println!("{}\n", parsed.answer.trim());
                print_citations(&parsed.citations);
                println!(
                    "\nRetrieved top-{} from {} in {} ms using {}{}",
                    parsed.meta.top_k,
                    parsed.meta.embedding_model,
                    parsed.meta.took_ms,
                    parsed.meta.generation_model,
                    if parsed.meta.no_context {
                        " (no context found)"
                    } else {
                        ""
                    }
                );
            }
        }
        Command::Search {
            query,
            top_k,
            model_version,
            filter,
        } => {
            let request = QueryRequest {
                query,
                top_k,
                model_version,
                filter: filter.into_filter()?,
            };
            let resp = send(client.post(format!("{base}/v1/search")).json(&request)).await?;
            let parsed: SearchResponse = resp.json().await.context("failed to parse search results")?;
            if parsed.hits.is_empty() {
                println!("No matching chunks");
            }
            for (rank, hit) in parsed.hits.iter().enumerate() {
                println!(
                    "---\n{}. [^{}] score {:.3} (document {})\n{}",
                    rank + 1,
                    hit.chunk_id,
                    hit.score,
                    hit.document_id,
                    hit.text.trim()
                );
            }
            println!(
                "\nSearched top-{} in {} in {} ms",
                parsed.meta.top_k, parsed.meta.embedding_model, parsed.meta.took_ms
            );
        }
        Command::Show { id } => {
            let resp = send(client.get(format!("{base}/v1/documents/{id}"))).await?;
            let parsed: DocumentResponse = resp.json().await.context("failed to parse document")?;
            println!(
                "Document {} from {} ({} chunks, checksum {:08x})",
                parsed.document.id,
                parsed.document.source_ref,
                parsed.chunks.len(),
                parsed.document.checksum
            );
            for (key, value) in &parsed.document.metadata {
                println!("  {key}: {value}");
            }
            for chunk in &parsed.chunks {
                println!(
                    "---\n#{} {} ({} tokens)\n{}",
                    chunk.ordinal,
                    chunk.id,
                    chunk.token_count,
                    chunk.text.trim()
                );
            }
        }
        Command::Delete { id } => {
            let resp = send(client.delete(format!("{base}/v1/documents/{id}"))).await?;
            let parsed: DeleteResponse = resp.json().await.context("failed to parse delete response")?;
            println!(
                "Deleted document {} ({} chunks)",
                parsed.document_id,
                parsed.deleted_chunks.len()
            );
        }
    }
    Ok(())
}

async fn ask_streaming(client: &Client, base: &str, request: &QueryRequest) -> Result<()> {
    let mut source = client
        .post(format!("{base}/v1/query/stream"))
        .json(request)
        .eventsource()
        .map_err(|err| anyhow!("cannot stream request: {err}"))?;
    source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

    let mut citations = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => {}
            Ok(Event::Message(message)) => match message.event.as_str() {
                "citations" => {
                    let header: StreamHeader = serde_json::from_str(&message.data)
                        .context("failed to parse citations event")?;
                    citations = header.citations;
                }
                "token" => {
                    let token: StreamToken =
                        serde_json::from_str(&message.data).context("failed to parse token")?;
                    print!("{}", token.text);
                    stdout.flush().ok();
                }
                "error" => {
                    source.close();
                    let body: ErrorBody = serde_json::from_str(&message.data)
                        .unwrap_or_else(|_| ErrorBody {
                            message: message.data.clone(),
                            kind: "unknown".into(),
                        });
                    bail!("answer failed ({}): {}", body.kind, body.message);
                }
                "done" => {
                    source.close();
                    break;
                }
                _ => {}
            },
            Err(reqwest_eventsource::Error::StreamEnded) => break,
            Err(reqwest_eventsource::Error::InvalidStatusCode(status, resp)) => {
                let body = resp.text().await.unwrap_or_default();
                bail!("server returned {status}: {}", error_message(&body));
            }
            Err(err) => {
                source.close();
                return Err(anyhow!("stream failed: {err}"));
            }
        }
    }
    println!("\n");
    print_citations(&citations);
    Ok(())
}

fn build_client(token: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).context("invalid token")?,
        );
    }
    Client::builder()
        .default_headers(headers)
        .build()
        .context("failed to build HTTP client")
}

async fn send(request: RequestBuilder) -> Result<Response> {
    let resp = request.send().await.context("failed to reach ragpipe server")?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        bail!("server returned {}: {}", status, error_message(&body));
    }
    Ok(resp)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|err| err.message)
        .unwrap_or_else(|_| body.to_string())
}

fn print_citations(citations: &[ragpipe::ChunkId]) {
    if citations.is_empty() {
        println!("Citations: none");
        return;
    }
    println!("Citations:");
    for chunk_id in citations {
        println!("  [^{chunk_id}]");
    }
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw}"))?;
    if key.trim().is_empty() {
        return Err("metadata key must not be empty".into());
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}
