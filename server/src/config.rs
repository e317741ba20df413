use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const DEFAULT_MISTRAL_MODEL: &str = "mistral-small-latest";

/// Paths that scanners probe; answered with 403 before routing.
pub const DEFAULT_BLOCKED_PATHS: &[&str] = &[
	"/.env",
	"/.git/config",
	"/wp-login.php",
	"/wp-admin",
	"/xmlrpc.php",
	"/phpmyadmin",
	"/admin.php",
	"/config.php",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GraphBackend {
	Sled,
	Neo4j,
}

impl std::str::FromStr for GraphBackend {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" | "sled" => Ok(GraphBackend::Sled),
			"neo4j" => Ok(GraphBackend::Neo4j),
			other => bail!("unknown GRAPH_BACKEND '{}'", other),
		}
	}
}

#[derive(Debug, Clone)]
pub struct Neo4jConfig {
	pub uri: String,
	pub username: String,
	pub password: String,
}

impl Neo4jConfig {
	/// Bare hosts get the secure routing scheme; explicit schemes pass through.
	pub fn connection_uri(&self) -> String {
		if self.uri.contains("://") { self.uri.clone() } else { format!("neo4j+s://{}", self.uri) }
	}
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
	pub api_key: String,
	pub model: String,
	pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	pub data_dir: String,
	pub static_dir: PathBuf,
	pub graph_backend: GraphBackend,
	pub neo4j: Option<Neo4jConfig>,
	pub llm: LlmConfig,
	pub api_key: Option<String>,
	pub blocked_paths: Vec<String>,
	pub store_interaction_json: bool,
}

impl Config {
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		Self::from_lookup(|k| std::env::var(k).ok())
	}

	pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
		let non_empty = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

		let port = non_empty("PORT").and_then(|p| p.parse::<u16>().ok());
		let bind = if let Some(p) = port { format!("127.0.0.1:{}", p) } else { non_empty("HTTP_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()) };
		let bind: SocketAddr = bind.parse().with_context(|| format!("invalid bind address '{}'", bind))?;
		let data_dir = non_empty("DATA_DIR").unwrap_or_else(|| "./data".to_string());
		let static_dir = PathBuf::from(non_empty("STATIC_DIR").unwrap_or_else(|| "./static".to_string()));
		let graph_backend: GraphBackend = non_empty("GRAPH_BACKEND").unwrap_or_default().parse()?;

		let neo4j = match (non_empty("GRAPH_DB_URI"), non_empty("GRAPH_DB_USERNAME"), non_empty("GRAPH_DB_PASSWORD")) {
			(Some(uri), Some(username), Some(password)) => Some(Neo4jConfig { uri, username, password }),
			_ => None,
		};

		let llm = LlmConfig {
			api_key: non_empty("MISTRAL_API_KEY").unwrap_or_default(),
			model: non_empty("MISTRAL_MODEL").unwrap_or_else(|| DEFAULT_MISTRAL_MODEL.to_string()),
			base_url: non_empty("MISTRAL_BASE_URL").unwrap_or_else(|| DEFAULT_MISTRAL_BASE_URL.to_string()),
		};

		let blocked_paths = match non_empty("BLOCKED_PATHS") {
			Some(list) => list.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect(),
			None => DEFAULT_BLOCKED_PATHS.iter().map(|p| p.to_string()).collect(),
		};

		let store_interaction_json = non_empty("STORE_INTERACTION_JSON")
			.map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false);

		Ok(Self {
			bind,
			data_dir,
			static_dir,
			graph_backend,
			neo4j,
			llm,
			api_key: non_empty("API_KEY"),
			blocked_paths,
			store_interaction_json,
		})
	}

	/// Fails fast when the selected backend cannot be reached with what was configured.
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.graph_backend == GraphBackend::Neo4j && self.neo4j.is_none() {
			bail!("GRAPH_BACKEND=neo4j requires GRAPH_DB_URI, GRAPH_DB_USERNAME and GRAPH_DB_PASSWORD");
		}
		Ok(())
	}
}
