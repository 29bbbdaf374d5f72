// src/cli.rs
use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::config::CrawlConfig;
use crate::driver;

/// sangraph: crawl the graph of domains connected through certificate
/// Subject Alternative Names.
///
/// Starting from one or more seed domains, certificates are fetched through
/// the selected driver(s) and their SANs become new domains to visit, up to
/// the configured depth.
#[derive(Parser, Debug, Clone)]
#[command(name = "sangraph")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // ===== Crawl shape =====
    /// Maximum BFS depth
    #[arg(short = 'd', long = "depth", default_value_t = 5)]
    pub depth: u32,

    /// Number of domains to query in parallel
    #[arg(short = 'p', long = "parallel", default_value_t = 10)]
    pub parallel: usize,

    /// Per-operation timeout in seconds
    #[arg(short = 't', long = "timeout", default_value_t = 10)]
    pub timeout: u64,

    /// Driver(s) to use; a comma list merges several drivers
    #[arg(long = "driver", default_value = "http")]
    pub driver: String,

    // ===== Neighbor expansion policy =====
    /// Include certificates from CDNs during neighbor expansion
    #[arg(long = "cdn")]
    pub cdn: bool,

    /// Skip certificates with more than N distinct apex domains (0 = unlimited)
    #[arg(long = "sanscap", default_value_t = 80)]
    pub sanscap: usize,

    /// For every discovered domain, also crawl its apex domain
    #[arg(long = "apex")]
    pub apex: bool,

    /// Only crawl domains matching this regular expression
    #[arg(long = "regex")]
    pub regex: Option<String>,

    // ===== CT driver options =====
    /// Include sub-domains in certificate transparency searches
    #[arg(long = "ct-subdomains")]
    pub ct_subdomains: bool,

    /// Include expired certificates in certificate transparency searches
    #[arg(long = "ct-expired")]
    pub ct_expired: bool,

    /// Censys API AppID (censys driver)
    #[arg(long = "censys-appid", env = "CENSYS_APP_ID", hide_env_values = true)]
    pub censys_appid: Option<String>,

    /// Censys API secret (censys driver)
    #[arg(long = "censys-secret", env = "CENSYS_SECRET", hide_env_values = true)]
    pub censys_secret: Option<String>,

    // ===== Output =====
    /// Print tab-separated details about the domains crawled
    #[arg(long = "details")]
    pub details: bool,

    /// Print the graph as JSON, usable by the web UI
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Save discovered certificates into this directory as PEM files
    #[arg(long = "save")]
    pub save: Option<PathBuf>,

    // ===== DNS =====
    /// Check for DNS records to determine whether domains are registered
    #[arg(long = "dns")]
    pub dns: bool,

    /// Update the public suffix list from the network before crawling
    #[arg(long = "updatepsl")]
    pub updatepsl: bool,

    // ===== Misc =====
    /// Serve the graph visualization UI on this address:port and exit
    #[arg(long = "serve")]
    pub serve: Option<String>,

    /// Verbose logging (set log level to debug)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Seed domains, as bare names or URLs
    pub domains: Vec<String>,
}

impl Cli {
    /// Validate flag combinations; violations are fatal configuration errors.
    pub fn validate(&self) -> Result<()> {
        if self.parallel < 1 {
            anyhow::bail!("--parallel must be a positive number of workers");
        }
        if let Some(pattern) = &self.regex {
            Regex::new(pattern).with_context(|| format!("invalid --regex {pattern:?}"))?;
        }
        for name in self.driver.split(',') {
            let name = name.trim();
            if !driver::DRIVERS.contains(&name) {
                anyhow::bail!(
                    "unknown driver name: {name} (expected one of {})",
                    driver::DRIVERS.join(", ")
                );
            }
        }
        Ok(())
    }

    /// Determine log level based on the verbose flag.
    pub fn log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Build the immutable crawl configuration.
    pub fn to_config(&self) -> Result<CrawlConfig> {
        let regex = match &self.regex {
            Some(pattern) => {
                Some(Regex::new(pattern).with_context(|| format!("invalid --regex {pattern:?}"))?)
            }
            None => None,
        };
        Ok(CrawlConfig {
            timeout: Duration::from_secs(self.timeout),
            max_depth: self.depth,
            parallel: self.parallel,
            driver: self.driver.clone(),
            details: self.details,
            print_json: self.json,
            save_path: self.save.clone(),
            cdn: self.cdn,
            ct_subdomains: self.ct_subdomains,
            ct_expired: self.ct_expired,
            sans_cap: self.sanscap,
            check_dns: self.dns,
            apex: self.apex,
            update_psl: self.updatepsl,
            regex,
            censys_app_id: self.censys_appid.clone(),
            censys_secret: self.censys_secret.clone(),
        })
    }

    /// Normalized seed domains: lowercased, cleaned of URL decoration.
    pub fn seeds(&self) -> Vec<String> {
        self.domains
            .iter()
            .map(|d| clean_input(&d.to_lowercase()))
            .filter(|d| !d.is_empty())
            .collect()
    }
}

/// Normalize seed input: strip a trailing dot and, for URLs, extract the
/// hostname. Unparseable input is returned as-is.
pub fn clean_input(host: &str) -> String {
    let host = host.trim().trim_end_matches('.');
    match Url::parse(host) {
        Ok(url) => match url.host_str() {
            Some(hostname) => hostname.to_string(),
            None => host.to_string(),
        },
        Err(_) => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["sangraph", "example.com"]);
        assert_eq!(cli.depth, 5);
        assert_eq!(cli.parallel, 10);
        assert_eq!(cli.timeout, 10);
        assert_eq!(cli.driver, "http");
        assert_eq!(cli.sanscap, 80);
        assert!(!cli.cdn);
        assert!(!cli.json);
        assert_eq!(cli.domains, vec!["example.com"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_zero_parallel_invalid() {
        let cli = Cli::parse_from(["sangraph", "--parallel", "0", "example.com"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_bad_regex_invalid() {
        let cli = Cli::parse_from(["sangraph", "--regex", "([", "example.com"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_unknown_driver_invalid() {
        let cli = Cli::parse_from(["sangraph", "--driver", "gopher", "example.com"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_driver_comma_list_valid() {
        let cli = Cli::parse_from(["sangraph", "--driver", "http,crtsh", "example.com"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_no_domains_is_valid() {
        let cli = Cli::parse_from(["sangraph"]);
        assert!(cli.validate().is_ok());
        assert!(cli.seeds().is_empty());
    }

    #[test]
    fn test_to_config() {
        let cli = Cli::parse_from([
            "sangraph",
            "--depth",
            "2",
            "--timeout",
            "3",
            "--sanscap",
            "40",
            "--cdn",
            "--apex",
            "example.com",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.sans_cap, 40);
        assert!(config.cdn);
        assert!(config.apex);
    }

    #[test]
    fn test_seeds_are_normalized() {
        let cli = Cli::parse_from(["sangraph", "Example.COM.", "https://WWW.Example.org/path"]);
        assert_eq!(cli.seeds(), vec!["example.com", "www.example.org"]);
    }

    #[test]
    fn test_clean_input_bare_domain() {
        assert_eq!(clean_input("example.com"), "example.com");
        assert_eq!(clean_input("example.com."), "example.com");
    }

    #[test]
    fn test_clean_input_url() {
        assert_eq!(clean_input("https://example.com/a/b?c=d"), "example.com");
        assert_eq!(clean_input("http://user@example.org:8080"), "example.org");
    }

    #[test]
    fn test_log_level() {
        assert_eq!(Cli::parse_from(["sangraph"]).log_level(), "info");
        assert_eq!(Cli::parse_from(["sangraph", "-v"]).log_level(), "debug");
    }
}
