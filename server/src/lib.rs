pub mod config;
pub mod error;
pub mod graph;
pub mod http;
pub mod interactions;
pub mod llm;
pub mod neo4j;
pub mod prompts;
pub mod realtime;
pub mod sse;
pub mod story;

#[cfg(test)]
mod testing;
