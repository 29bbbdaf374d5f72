// src/config.rs
//! Immutable crawl configuration, derived from the CLI once and shared with
//! the engine and drivers.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Per-operation deadline for driver and DNS work.
    pub timeout: Duration,
    /// Maximum BFS depth; candidates beyond it are dropped before admission.
    pub max_depth: u32,
    /// Number of concurrent driver queries.
    pub parallel: usize,
    /// Driver selection string: one name or a comma list.
    pub driver: String,
    /// Emit tab-separated per-node detail lines.
    pub details: bool,
    /// Suppress per-node output and dump the graph as JSON at the end.
    pub print_json: bool,
    /// Directory discovered certificates are saved into as PEM files.
    pub save_path: Option<PathBuf>,
    /// Include CDN certificates during neighbor expansion.
    pub cdn: bool,
    /// CT drivers include sub-domains in their queries.
    pub ct_subdomains: bool,
    /// CT drivers include expired certificates.
    pub ct_expired: bool,
    /// Skip certificates spanning more than this many apex domains
    /// (0 = unlimited).
    pub sans_cap: usize,
    /// Check each visited domain's apex for DNS records.
    pub check_dns: bool,
    /// Also enqueue the apex of every discovered domain.
    pub apex: bool,
    /// Refresh the public suffix list before crawling.
    pub update_psl: bool,
    /// Only admit domains matching this pattern.
    pub regex: Option<Regex>,
    /// Censys API credentials, required by the censys driver.
    pub censys_app_id: Option<String>,
    pub censys_secret: Option<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        CrawlConfig {
            timeout: Duration::from_secs(10),
            max_depth: 5,
            parallel: 10,
            driver: "http".to_string(),
            details: false,
            print_json: false,
            save_path: None,
            cdn: false,
            ct_subdomains: false,
            ct_expired: false,
            sans_cap: 80,
            check_dns: false,
            apex: false,
            update_psl: false,
            regex: None,
            censys_app_id: None,
            censys_secret: None,
        }
    }
}
