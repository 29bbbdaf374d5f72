// src/output/mod.rs
//! Output handling for visited domain nodes and the final graph dump.

use anyhow::Result;
use async_trait::async_trait;

use crate::graph::DomainNode;

pub mod json;
pub mod text;

pub use text::TextOutput;

/// Sink for visited nodes, driven serially by the crawler's output stage.
#[async_trait]
pub trait OutputHandler: Send {
    /// Emit one visited node.
    async fn emit_node(&mut self, node: &DomainNode) -> Result<()>;

    /// Flush any buffered output once the crawl is done.
    async fn flush(&mut self) -> Result<()>;
}

/// Discards per-node output; used in JSON mode where the graph is emitted
/// once at the end.
pub struct SilentOutput;

#[async_trait]
impl OutputHandler for SilentOutput {
    async fn emit_node(&mut self, _node: &DomainNode) -> Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
