use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type NodeId = i64;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
	#[error("story not found: {0}")]
	StoryNotFound(String),

	#[error("node not found: {0}")]
	NodeNotFound(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
	Choice,
	Response,
}

impl EdgeKind {
	pub fn relation(self) -> &'static str {
		match self {
			EdgeKind::Choice => "CHOICE",
			EdgeKind::Response => "RESPONSE",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceEdge {
	pub choice_text: String,
	pub next_node_id: NodeId,
}

/// Persistence for stories, their nodes and the edges between nodes.
#[async_trait]
pub trait StoryGraph: Send + Sync {
	async fn create_story(&self, story_id: &str) -> Result<()>;

	/// Appends a node to the story and returns its store-assigned id.
	async fn create_node(&self, story_id: &str, content: &str, is_choice_point: bool) -> Result<NodeId>;

	async fn create_edge(&self, from: NodeId, to: NodeId, kind: EdgeKind, text: &str) -> Result<()>;

	/// Outgoing `Choice` edges of a node, oldest first.
	async fn get_choices(&self, node_id: NodeId) -> Result<Vec<ChoiceEdge>>;

	/// All node contents of the story joined by newlines in creation order.
	async fn get_story_context(&self, story_id: &str) -> Result<String>;

	async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNode {
	pub id: NodeId,
	pub story_id: String,
	pub content: String,
	pub is_choice_point: bool,
	pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEdge {
	src: NodeId,
	dst: NodeId,
	relation: String,
	text: String,
	created_at: i64,
}

pub(crate) fn now_ms() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

fn node_key(id: NodeId) -> String {
	format!("Node::{}", id)
}

fn membership_key(story_id: &str, id: NodeId) -> Vec<u8> {
	let mut key = format!("{}::", story_id).into_bytes();
	key.extend_from_slice(&(id as u64).to_be_bytes());
	key
}

/// Embedded graph kept in sled trees.
///
/// Node ids come from `generate_id`, so a membership scan in key order is creation order.
#[derive(Clone)]
pub struct SledStoryGraph {
	db: sled::Db,
	stories: sled::Tree,
	nodes: sled::Tree,
	membership: sled::Tree,
	edges: sled::Tree,
}

impl SledStoryGraph {
	pub fn open(db: sled::Db) -> Result<Self> {
		Ok(Self {
			stories: db.open_tree("story_stories")?,
			nodes: db.open_tree("story_nodes")?,
			membership: db.open_tree("story_membership")?,
			edges: db.open_tree("story_edges")?,
			db,
		})
	}

	pub fn get_node(&self, id: NodeId) -> Result<Option<StoredNode>> {
		match self.nodes.get((id as u64).to_be_bytes())? {
			Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
			None => Ok(None),
		}
	}

	/// Nodes of a story in creation order.
	pub fn story_nodes(&self, story_id: &str) -> Result<Vec<StoredNode>> {
		let prefix = format!("{}::", story_id);
		let mut out = Vec::new();
		for kv in self.membership.scan_prefix(prefix.as_bytes()) {
			let (k, _) = kv?;
			let raw: [u8; 8] = match k[prefix.len()..].try_into() {
				Ok(b) => b,
				Err(_) => continue,
			};
			if let Some(node) = self.get_node(u64::from_be_bytes(raw) as NodeId)? {
				out.push(node);
			}
		}
		Ok(out)
	}
}

#[async_trait]
impl StoryGraph for SledStoryGraph {
	async fn create_story(&self, story_id: &str) -> Result<()> {
		let val = serde_json::json!({ "type": "Story", "id": story_id, "created_at": now_ms() });
		self.stories.insert(story_id.as_bytes(), serde_json::to_vec(&val)?)?;
		Ok(())
	}

	async fn create_node(&self, story_id: &str, content: &str, is_choice_point: bool) -> Result<NodeId> {
		if !self.stories.contains_key(story_id.as_bytes())? {
			return Err(GraphError::StoryNotFound(story_id.to_string()).into());
		}
		let id = self.db.generate_id()? as NodeId;
		let node = StoredNode { id, story_id: story_id.to_string(), content: content.to_string(), is_choice_point, created_at: now_ms() };
		self.nodes.insert((id as u64).to_be_bytes(), serde_json::to_vec(&node)?)?;
		self.membership.insert(membership_key(story_id, id), &[])?;
		Ok(id)
	}

	async fn create_edge(&self, from: NodeId, to: NodeId, kind: EdgeKind, text: &str) -> Result<()> {
		for id in [from, to] {
			if !self.nodes.contains_key((id as u64).to_be_bytes())? {
				return Err(GraphError::NodeNotFound(id).into());
			}
		}
		// Edge keys are not unique per (src, dst, relation); a sequence suffix keeps repeats.
		let seq = self.db.generate_id()?;
		let key = format!("{}->{}::{}::{:020}", node_key(from), node_key(to), kind.relation(), seq);
		let edge = StoredEdge { src: from, dst: to, relation: kind.relation().to_string(), text: text.to_string(), created_at: now_ms() };
		self.edges.insert(key.as_bytes(), serde_json::to_vec(&edge)?)?;
		Ok(())
	}

	async fn get_choices(&self, node_id: NodeId) -> Result<Vec<ChoiceEdge>> {
		let prefix = format!("{}->", node_key(node_id));
		let mut edges: Vec<(u64, ChoiceEdge)> = Vec::new();
		for kv in self.edges.scan_prefix(prefix.as_bytes()) {
			let (k, v) = kv?;
			let edge: StoredEdge = serde_json::from_slice(&v)?;
			if edge.relation != EdgeKind::Choice.relation() {
				continue;
			}
			let seq = String::from_utf8_lossy(&k).rsplit("::").next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
			edges.push((seq, ChoiceEdge { choice_text: edge.text, next_node_id: edge.dst }));
		}
		edges.sort_by_key(|(seq, _)| *seq);
		Ok(edges.into_iter().map(|(_, e)| e).collect())
	}

	async fn get_story_context(&self, story_id: &str) -> Result<String> {
		let contents: Vec<String> = self.story_nodes(story_id)?.into_iter().map(|n| n.content).collect();
		Ok(contents.join("\n"))
	}

	async fn close(&self) -> Result<()> {
		self.db.flush_async().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn graph() -> (tempfile::TempDir, SledStoryGraph) {
		let dir = tempfile::tempdir().unwrap();
		let db = sled::open(dir.path().join("kv")).unwrap();
		(dir, SledStoryGraph::open(db).unwrap())
	}

	#[tokio::test]
	async fn node_ids_increase_and_context_keeps_creation_order() {
		let (_dir, g) = graph();
		g.create_story("s1").await.unwrap();
		let a = g.create_node("s1", "first", true).await.unwrap();
		let b = g.create_node("s1", "second", false).await.unwrap();
		let c = g.create_node("s1", "third", true).await.unwrap();
		assert!(a < b && b < c);
		assert_eq!(g.get_story_context("s1").await.unwrap(), "first\nsecond\nthird");
		let node = g.get_node(b).unwrap().unwrap();
		assert_eq!(node.story_id, "s1");
		assert!(!node.is_choice_point);
	}

	#[tokio::test]
	async fn context_is_isolated_per_story() {
		let (_dir, g) = graph();
		g.create_story("a").await.unwrap();
		g.create_story("ab").await.unwrap();
		g.create_node("a", "in a", true).await.unwrap();
		g.create_node("ab", "in ab", true).await.unwrap();
		assert_eq!(g.get_story_context("a").await.unwrap(), "in a");
		assert_eq!(g.get_story_context("ab").await.unwrap(), "in ab");
		assert_eq!(g.get_story_context("missing").await.unwrap(), "");
	}

	#[tokio::test]
	async fn creating_node_in_unknown_story_fails() {
		let (_dir, g) = graph();
		let err = g.create_node("nope", "x", true).await.unwrap_err();
		assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::StoryNotFound(s)) if s == "nope"));
	}

	#[tokio::test]
	async fn edges_require_existing_nodes() {
		let (_dir, g) = graph();
		g.create_story("s").await.unwrap();
		let a = g.create_node("s", "a", true).await.unwrap();
		let err = g.create_edge(a, a + 1000, EdgeKind::Choice, "go").await.unwrap_err();
		assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::NodeNotFound(id)) if *id == a + 1000));
	}

	#[tokio::test]
	async fn get_choices_lists_only_choice_edges_in_order() {
		let (_dir, g) = graph();
		g.create_story("s").await.unwrap();
		let root = g.create_node("s", "root", true).await.unwrap();
		let left = g.create_node("s", "left", true).await.unwrap();
		let right = g.create_node("s", "right", true).await.unwrap();
		let reply = g.create_node("s", "reply", false).await.unwrap();
		g.create_edge(root, right, EdgeKind::Choice, "go right").await.unwrap();
		g.create_edge(root, left, EdgeKind::Choice, "go left").await.unwrap();
		g.create_edge(root, reply, EdgeKind::Response, "continuation").await.unwrap();
		// same pair twice is kept, not overwritten
		g.create_edge(root, left, EdgeKind::Choice, "go left again").await.unwrap();

		let choices = g.get_choices(root).await.unwrap();
		let texts: Vec<&str> = choices.iter().map(|c| c.choice_text.as_str()).collect();
		assert_eq!(texts, vec!["go right", "go left", "go left again"]);
		assert_eq!(choices[0].next_node_id, right);
		assert!(g.get_choices(left).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn node_id_prefix_does_not_leak_edges() {
		let (_dir, g) = graph();
		g.create_story("s").await.unwrap();
		let mut ids = Vec::new();
		for i in 0..12 {
			ids.push(g.create_node("s", &format!("n{}", i), true).await.unwrap());
		}
		g.create_edge(ids[11], ids[0], EdgeKind::Choice, "from eleven").await.unwrap();
		let first = ids[1];
		assert!(g.get_choices(first).await.unwrap().iter().all(|c| c.choice_text != "from eleven"));
		g.close().await.unwrap();
	}
}
