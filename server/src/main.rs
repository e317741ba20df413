use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use story_graph_server::config::{self, GraphBackend};
use story_graph_server::graph::{SledStoryGraph, StoryGraph};
use story_graph_server::http::{build_router, AccessPolicy, AppState};
use story_graph_server::interactions::InteractionLog;
use story_graph_server::llm::MistralClient;
use story_graph_server::neo4j::Neo4jStoryGraph;
use story_graph_server::story::StoryService;

#[derive(Parser, Debug)]
#[command(name = "story-graph-server", version, about = "Branching story server backed by a graph store and an LLM")]
struct Cli {
	/// Bind address for the HTTP and WebSocket server
	#[arg(long)]
	bind: Option<SocketAddr>,

	/// Data directory root
	#[arg(long)]
	data_dir: Option<String>,

	/// Graph store backend
	#[arg(long, value_enum)]
	graph_backend: Option<GraphBackend>,

	/// Directory served as the browser client
	#[arg(long)]
	static_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	init_tracing();
	let mut cfg = config::Config::load()?;
	let cli = Cli::parse();

	if let Some(bind) = cli.bind { cfg.bind = bind; }
	if let Some(dir) = cli.data_dir { cfg.data_dir = dir; }
	if let Some(backend) = cli.graph_backend { cfg.graph_backend = backend; }
	if let Some(dir) = cli.static_dir { cfg.static_dir = dir; }
	cfg.validate()?;
	if cfg.llm.api_key.is_empty() {
		warn!("MISTRAL_API_KEY is not set; story generation will fail");
	}

	let dirs = ensure_data_dirs(&cfg.data_dir)?;
	let db = sled::open(dirs.warm.join("kv")).context("open sled store")?;

	let graph: Arc<dyn StoryGraph> = match (cfg.graph_backend, cfg.neo4j.as_ref()) {
		(GraphBackend::Neo4j, Some(neo)) => Arc::new(Neo4jStoryGraph::connect(neo).await?),
		_ => Arc::new(SledStoryGraph::open(db.clone())?),
	};
	info!(backend = ?cfg.graph_backend, "Graph store ready");

	let llm = Arc::new(MistralClient::new(&cfg.llm)?);
	let json_dir = if cfg.store_interaction_json { Some(dirs.json) } else { None };
	let interactions = InteractionLog::open(&db, json_dir)?;

	let story = Arc::new(StoryService::new(graph.clone(), llm, interactions.clone()));
	let state = Arc::new(AppState {
		start_time: Instant::now(),
		story,
		interactions,
		access: AccessPolicy::new(cfg.api_key.as_deref(), &cfg.blocked_paths),
	});

	let static_dir = if cfg.static_dir.is_dir() {
		Some(cfg.static_dir.clone())
	} else {
		warn!(dir = %cfg.static_dir.display(), "static directory missing; browser client disabled");
		None
	};
	let app = build_router(state, static_dir);

	let listener = tokio::net::TcpListener::bind(cfg.bind).await.with_context(|| format!("bind {}", cfg.bind))?;
	info!(bind = %cfg.bind, "Starting HTTP server");
	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("server error")?;

	info!("Shutdown signal received");
	graph.close().await?;
	db.flush_async().await?;
	Ok(())
}

fn init_tracing() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
	tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

struct DataDirs { warm: PathBuf, json: PathBuf }

fn ensure_data_dirs(root: &str) -> Result<DataDirs> {
	use std::fs;
	let root = PathBuf::from(root);
	let warm = root.join("warm");
	let json = root.join("interactions");
	fs::create_dir_all(&warm)?;
	fs::create_dir_all(&json)?;
	Ok(DataDirs { warm, json })
}

async fn shutdown_signal() {
	let _ = signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cli_only_overrides_with_explicit_flags() {
		// Environment values belong to Config::load, which applies PORT precedence.
		std::env::set_var("HTTP_BIND", "0.0.0.0:9999");
		let cli = Cli::try_parse_from(["story-graph-server"]).unwrap();
		assert!(cli.bind.is_none());
		assert!(cli.data_dir.is_none());
		assert!(cli.graph_backend.is_none());

		let cli = Cli::try_parse_from(["story-graph-server", "--bind", "127.0.0.1:7000", "--graph-backend", "neo4j"]).unwrap();
		assert_eq!(cli.bind, Some("127.0.0.1:7000".parse().unwrap()));
		assert_eq!(cli.graph_backend, Some(GraphBackend::Neo4j));
	}
}
