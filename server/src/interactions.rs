use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::graph::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
	pub id: u64,
	pub input: String,
	pub output: String,
	pub model: String,
	pub created_at: i64,
}

/// Append-only record of prompts sent to the model and what came back.
#[derive(Clone)]
pub struct InteractionLog {
	db: sled::Db,
	tree: sled::Tree,
	json_dir: Option<PathBuf>,
}

impl InteractionLog {
	pub fn open(db: &sled::Db, json_dir: Option<PathBuf>) -> Result<Self> {
		if let Some(dir) = json_dir.as_ref() {
			std::fs::create_dir_all(dir)?;
		}
		Ok(Self { db: db.clone(), tree: db.open_tree("llm_interactions")?, json_dir })
	}

	pub fn record(&self, input: &str, output: &str, model: &str) -> Result<u64> {
		let id = self.db.generate_id()?;
		let rec = Interaction { id, input: input.to_string(), output: output.to_string(), model: model.to_string(), created_at: now_ms() };
		let bytes = serde_json::to_vec(&rec)?;
		self.tree.insert(id.to_be_bytes(), bytes.as_slice())?;
		if let Some(dir) = self.json_dir.as_ref() {
			let path = dir.join(format!("llm_interaction_{}_{}.json", rec.created_at, id));
			std::fs::write(path, &bytes)?;
		}
		Ok(id)
	}

	pub fn get(&self, id: u64) -> Result<Option<Interaction>> {
		match self.tree.get(id.to_be_bytes())? {
			Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
			None => Ok(None),
		}
	}

	/// Newest first.
	pub fn recent(&self, limit: usize) -> Result<Vec<Interaction>> {
		let mut out = Vec::new();
		for kv in self.tree.iter().rev().take(limit) {
			let (_, v) = kv?;
			out.push(serde_json::from_slice(&v)?);
		}
		Ok(out)
	}
}
