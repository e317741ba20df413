//! Neo4j-backed story graph.
//!
//! Every operation is one parameterized Cypher statement run through `neo4rs`.
//! Node ids are the database's own `id(n)`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::info;

use crate::config::Neo4jConfig;
use crate::graph::{now_ms, ChoiceEdge, EdgeKind, GraphError, NodeId, StoryGraph};

const CREATE_STORY: &str = "CREATE (s:Story {id: $story_id}) RETURN s.id AS id";

const CREATE_NODE: &str = "MATCH (s:Story {id: $story_id}) \
     CREATE (n:Node {content: $content, is_choice_point: $is_choice_point, created_at: $created_at}) \
     CREATE (s)-[:HAS_NODE]->(n) RETURN id(n) AS node_id";

const CREATE_CHOICE_EDGE: &str = "OPTIONAL MATCH (from:Node) WHERE id(from) = $from_node_id \
     OPTIONAL MATCH (to:Node) WHERE id(to) = $to_node_id \
     FOREACH (ok IN CASE WHEN from IS NOT NULL AND to IS NOT NULL THEN [1] ELSE [] END | \
     CREATE (from)-[:CHOICE {text: $text, created_at: $created_at}]->(to)) \
     RETURN from IS NOT NULL AS from_found, to IS NOT NULL AS to_found";

const CREATE_RESPONSE_EDGE: &str = "OPTIONAL MATCH (from:Node) WHERE id(from) = $from_node_id \
     OPTIONAL MATCH (to:Node) WHERE id(to) = $to_node_id \
     FOREACH (ok IN CASE WHEN from IS NOT NULL AND to IS NOT NULL THEN [1] ELSE [] END | \
     CREATE (from)-[:RESPONSE {text: $text, created_at: $created_at}]->(to)) \
     RETURN from IS NOT NULL AS from_found, to IS NOT NULL AS to_found";

const GET_CHOICES: &str = "MATCH (n:Node)-[r:CHOICE]->(m:Node) WHERE id(n) = $node_id \
     RETURN r.text AS choice, id(m) AS next_node_id ORDER BY r.created_at, id(r)";

const GET_CONTEXT: &str = "MATCH (s:Story {id: $story_id})-[:HAS_NODE]->(n:Node) \
     WITH n ORDER BY n.created_at, id(n) RETURN collect(n.content) AS context";

const ENSURE_STORY_INDEX: &str = "CREATE INDEX story_id IF NOT EXISTS FOR (s:Story) ON (s.id)";

pub struct Neo4jStoryGraph {
    graph: Graph,
}

impl Neo4jStoryGraph {
    pub async fn connect(cfg: &Neo4jConfig) -> Result<Self> {
        let uri = cfg.connection_uri();
        let graph = Graph::new(&uri, &cfg.username, &cfg.password)
            .await
            .with_context(|| format!("connect to neo4j at {}", uri))?;
        graph.run(query(ENSURE_STORY_INDEX)).await.context("ensure story index")?;
        info!(%uri, "Connected to neo4j");
        Ok(Self { graph })
    }
}

fn edge_statement(kind: EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Choice => CREATE_CHOICE_EDGE,
        EdgeKind::Response => CREATE_RESPONSE_EDGE,
    }
}

/// The first endpoint of an edge that does not exist, `from` before `to`.
fn missing_endpoint(from: NodeId, to: NodeId, from_found: bool, to_found: bool) -> Option<NodeId> {
    if !from_found {
        Some(from)
    } else if !to_found {
        Some(to)
    } else {
        None
    }
}

#[async_trait]
impl StoryGraph for Neo4jStoryGraph {
    async fn create_story(&self, story_id: &str) -> Result<()> {
        self.graph.run(query(CREATE_STORY).param("story_id", story_id)).await?;
        Ok(())
    }

    async fn create_node(&self, story_id: &str, content: &str, is_choice_point: bool) -> Result<NodeId> {
        let q = query(CREATE_NODE)
            .param("story_id", story_id)
            .param("content", content)
            .param("is_choice_point", is_choice_point)
            .param("created_at", now_ms());
        let mut rows = self.graph.execute(q).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>("node_id")?),
            None => Err(GraphError::StoryNotFound(story_id.to_string()).into()),
        }
    }

    async fn create_edge(&self, from: NodeId, to: NodeId, kind: EdgeKind, text: &str) -> Result<()> {
        let q = query(edge_statement(kind))
            .param("from_node_id", from)
            .param("to_node_id", to)
            .param("text", text)
            .param("created_at", now_ms());
        let mut rows = self.graph.execute(q).await?;
        let (from_found, to_found) = match rows.next().await? {
            Some(row) => (row.get::<bool>("from_found")?, row.get::<bool>("to_found")?),
            None => (false, false),
        };
        match missing_endpoint(from, to, from_found, to_found) {
            Some(id) => Err(GraphError::NodeNotFound(id).into()),
            None => Ok(()),
        }
    }

    async fn get_choices(&self, node_id: NodeId) -> Result<Vec<ChoiceEdge>> {
        let mut rows = self.graph.execute(query(GET_CHOICES).param("node_id", node_id)).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(ChoiceEdge { choice_text: row.get::<String>("choice")?, next_node_id: row.get::<i64>("next_node_id")? });
        }
        Ok(out)
    }

    async fn get_story_context(&self, story_id: &str) -> Result<String> {
        let mut rows = self.graph.execute(query(GET_CONTEXT).param("story_id", story_id)).await?;
        let contents: Vec<String> = match rows.next().await? {
            Some(row) => row.get::<Vec<String>>("context")?,
            None => Vec::new(),
        };
        Ok(contents.join("\n"))
    }

    async fn close(&self) -> Result<()> {
        // neo4rs releases pooled connections on drop
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_kind_selects_relationship_type() {
        assert!(edge_statement(EdgeKind::Choice).contains("[r:CHOICE"));
        assert!(edge_statement(EdgeKind::Response).contains("[r:RESPONSE"));
    }

    #[test]
    fn edge_errors_name_the_missing_endpoint() {
        assert_eq!(missing_endpoint(1, 2, true, true), None);
        assert_eq!(missing_endpoint(1, 2, false, true), Some(1));
        assert_eq!(missing_endpoint(1, 2, true, false), Some(2));
        assert_eq!(missing_endpoint(1, 2, false, false), Some(1));
    }

    #[test]
    fn context_query_orders_by_creation() {
        assert!(GET_CONTEXT.contains("ORDER BY n.created_at"));
        assert!(GET_CONTEXT.contains("collect(n.content)"));
    }

    /// Runs against a live server: `NEO4J_TEST_URI=bolt://localhost:7687 cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn live_round_trip() {
        let Ok(uri) = std::env::var("NEO4J_TEST_URI") else { return };
        let cfg = Neo4jConfig {
            uri,
            username: std::env::var("NEO4J_TEST_USER").unwrap_or_else(|_| "neo4j".into()),
            password: std::env::var("NEO4J_TEST_PASSWORD").unwrap_or_else(|_| "password".into()),
        };
        let g = Neo4jStoryGraph::connect(&cfg).await.unwrap();
        let story = uuid::Uuid::new_v4().to_string();
        g.create_story(&story).await.unwrap();
        let a = g.create_node(&story, "one", true).await.unwrap();
        let b = g.create_node(&story, "two", true).await.unwrap();
        g.create_edge(a, b, EdgeKind::Choice, "onward").await.unwrap();
        assert_eq!(g.get_story_context(&story).await.unwrap(), "one\ntwo");
        let choices = g.get_choices(a).await.unwrap();
        assert_eq!(choices, vec![ChoiceEdge { choice_text: "onward".into(), next_node_id: b }]);
        assert!(g.create_node("no-such-story", "x", true).await.is_err());
        let err = g.create_edge(a, i64::MAX, EdgeKind::Choice, "nowhere").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::NodeNotFound(id)) if *id == i64::MAX));
    }
}
