// src/main.rs
use clap::Parser;
use sangraph::cli::Cli;
use sangraph::config::CrawlConfig;
use sangraph::crawler::Crawler;
use sangraph::graph::CertGraph;
use sangraph::output::{json, OutputHandler, SilentOutput, TextOutput};
use sangraph::{dns, driver, web};
use std::io;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse and validate CLI arguments
    let cli = Cli::parse();
    cli.validate()?;

    // Initialize logging; node output goes to stdout, logs to stderr
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();

    // Serve-only mode: bring up the embedded UI and block
    if let Some(addr) = &cli.serve {
        return web::serve(addr).await;
    }

    let config = Arc::new(cli.to_config()?);

    if config.update_psl {
        dns::update_public_suffix_list(config.timeout).await?;
    }

    // Seed list: normalized domains, plus their apexes when requested
    let mut seeds = cli.seeds();
    if config.apex {
        let apexes: Vec<String> = seeds
            .iter()
            .filter_map(|seed| dns::apex_domain(seed).ok())
            .collect();
        seeds.extend(apexes);
    }

    if let Some(dir) = &config.save_path {
        std::fs::create_dir_all(dir)?;
    }

    let driver = driver::from_name(&config.driver, &config)?;
    tracing::info!("crawling with driver {}", driver.name());

    let graph = Arc::new(CertGraph::new());
    let output = make_output(&config);

    let crawler = Crawler::new(Arc::clone(&graph), driver, Arc::clone(&config));
    crawler.run(&seeds, output).await?;

    if config.print_json {
        let command = std::env::args().collect::<Vec<_>>().join(" ");
        json::write_graph(
            io::stdout(),
            &graph,
            json::graph_metadata(&config, &command),
        )?;
    }

    tracing::info!("found {} domains", graph.num_domains());
    tracing::info!("graph depth: {}", graph.max_depth());
    Ok(())
}

fn make_output(config: &CrawlConfig) -> Box<dyn OutputHandler> {
    if config.print_json {
        if config.details {
            // detail lines still wanted alongside JSON; keep stdout clean
            Box::new(TextOutput::stderr(true, config.check_dns))
        } else {
            Box::new(SilentOutput)
        }
    } else {
        Box::new(TextOutput::stdout(config.details, config.check_dns))
    }
}
