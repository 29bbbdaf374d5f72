// src/output/json.rs
//! End-of-run JSON dump of the whole graph, in the shape the web UI reads.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::io::Write;

use crate::config::CrawlConfig;
use crate::graph::CertGraph;

/// Scan metadata embedded in the JSON output under the `certgraph` key.
pub fn graph_metadata(config: &CrawlConfig, command: &str) -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "scan_date": chrono::Utc::now().to_rfc3339(),
        "command": command,
        "options": {
            "parallel": config.parallel,
            "driver": config.driver,
            "depth": config.max_depth,
            "ct_subdomains": config.ct_subdomains,
            "ct_expired": config.ct_expired,
            "sanscap": config.sans_cap,
            "cdn": config.cdn,
            "timeout": config.timeout.as_secs(),
            "regex": config.regex.as_ref().map(|r| r.as_str()).unwrap_or(""),
        },
    })
}

/// Serialize the graph with its metadata as pretty-printed JSON.
pub fn write_graph<W: Write>(mut writer: W, graph: &CertGraph, metadata: Value) -> Result<()> {
    let mut map = graph.generate_map();
    map["certgraph"] = metadata;
    serde_json::to_writer_pretty(&mut writer, &map).context("failed to serialize graph")?;
    writeln!(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DomainNode;

    #[test]
    fn test_metadata_records_options() {
        let config = CrawlConfig {
            driver: "http,crtsh".to_string(),
            ..Default::default()
        };
        let meta = graph_metadata(&config, "sangraph example.com");

        assert_eq!(meta["command"], "sangraph example.com");
        assert_eq!(meta["options"]["driver"], "http,crtsh");
        assert_eq!(meta["options"]["parallel"], 10);
        assert_eq!(meta["options"]["sanscap"], 80);
        assert_eq!(meta["options"]["regex"], "");
        assert_eq!(meta["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_write_graph_shape() {
        let graph = CertGraph::new();
        graph.reserve_domain("example.com", 0);
        graph.add_domain(DomainNode::new("example.com", 0));

        let config = CrawlConfig::default();
        let mut buf = Vec::new();
        write_graph(&mut buf, &graph, graph_metadata(&config, "sangraph")).unwrap();

        let parsed: Value = serde_json::from_slice(&buf).unwrap();
        assert!(parsed["nodes"].is_array());
        assert!(parsed["links"].is_array());
        assert_eq!(parsed["numDomains"], 1);
        assert_eq!(parsed["depth"], 0);
        assert!(parsed["certgraph"]["scan_date"].is_string());
    }
}
