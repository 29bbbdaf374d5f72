// src/crawler.rs
//! The BFS engine: admits candidate domains, visits them through the driver
//! under bounded parallelism, and streams visited nodes to the output stage.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, warn};

use crate::config::CrawlConfig;
use crate::dns;
use crate::driver::Driver;
use crate::fingerprint::Fingerprint;
use crate::graph::{CertGraph, CertNode, DomainNode};
use crate::output::OutputHandler;

/// Breadth-first crawler over the certificate graph.
pub struct Crawler {
    graph: Arc<CertGraph>,
    driver: Arc<dyn Driver>,
    config: Arc<CrawlConfig>,
}

/// State shared between the admission loop and the workers.
struct Shared {
    graph: Arc<CertGraph>,
    driver: Arc<dyn Driver>,
    config: Arc<CrawlConfig>,
    /// Fingerprints a `query_cert` has been attempted for, successful or not.
    /// Guarantees at most one detail lookup per certificate per run.
    attempted_certs: Mutex<HashSet<Fingerprint>>,
    /// Caps concurrent driver queries at `parallel`.
    semaphore: Arc<Semaphore>,
    work: WorkTracker,
    input_tx: mpsc::Sender<DomainNode>,
    output_tx: mpsc::Sender<Arc<DomainNode>>,
}

impl Crawler {
    pub fn new(graph: Arc<CertGraph>, driver: Arc<dyn Driver>, config: Arc<CrawlConfig>) -> Self {
        Crawler {
            graph,
            driver,
            config,
        }
    }

    /// Crawl from the seed domains until the frontier is exhausted, feeding
    /// every visited node to `output` in emission order.
    pub async fn run(&self, seeds: &[String], output: Box<dyn OutputHandler>) -> Result<()> {
        let buffer = (self.config.parallel * 2).max(10);
        let (input_tx, input_rx) = mpsc::channel(buffer);
        let (output_tx, mut output_rx) = mpsc::channel::<Arc<DomainNode>>(buffer);

        let shared = Arc::new(Shared {
            graph: Arc::clone(&self.graph),
            driver: Arc::clone(&self.driver),
            config: Arc::clone(&self.config),
            attempted_certs: Mutex::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(self.config.parallel)),
            work: WorkTracker::new(),
            input_tx,
            output_tx,
        });

        // serial output stage
        let emitter = tokio::spawn(async move {
            let mut output = output;
            while let Some(node) = output_rx.recv().await {
                if let Err(e) = output.emit_node(&node).await {
                    warn!("output error: {e:#}");
                }
            }
            if let Err(e) = output.flush().await {
                warn!("output flush error: {e:#}");
            }
        });

        // hold one unit of work while seeding so the crawl cannot quiesce
        // before the seeds are queued
        shared.work.add(1);
        let admission = tokio::spawn(admission_loop(Arc::clone(&shared), input_rx));
        for seed in seeds {
            let mut node = DomainNode::new(seed, 0);
            node.root = true;
            enqueue(&shared, node).await;
        }
        shared.work.done();

        admission.await?;
        // the last sender clones die with `shared`; the emitter drains and
        // finishes once the channel closes
        drop(shared);
        emitter.await?;
        Ok(())
    }
}

/// Submit a candidate, accounting for it until a terminal path releases it.
async fn enqueue(shared: &Arc<Shared>, node: DomainNode) {
    shared.work.add(1);
    if shared.input_tx.send(node).await.is_err() {
        shared.work.done();
    }
}

/// Dequeue candidates, clamp depth, dedup against the graph, and spawn a
/// worker for every admitted domain.
async fn admission_loop(shared: Arc<Shared>, mut input_rx: mpsc::Receiver<DomainNode>) {
    loop {
        tokio::select! {
            _ = shared.work.wait_idle() => break,
            candidate = input_rx.recv() => {
                let Some(node) = candidate else { break };
                if node.depth > shared.config.max_depth {
                    debug!("max depth reached, skipping {}", node.domain);
                    shared.work.done();
                    continue;
                }
                if !shared.graph.reserve_domain(&node.domain, node.depth) {
                    shared.work.done();
                    continue;
                }
                tokio::spawn(visit(Arc::clone(&shared), node));
            }
        }
    }
}

/// Visit one admitted domain: query the driver, update the graph, emit the
/// node, and enqueue its neighbors.
async fn visit(shared: Arc<Shared>, mut node: DomainNode) {
    let Ok(_permit) = Arc::clone(&shared.semaphore).acquire_owned().await else {
        shared.work.done();
        return;
    };

    if let Some(regex) = &shared.config.regex {
        if !regex.is_match(&node.domain) {
            debug!("{} does not match the admission regex, skipping", node.domain);
            shared.work.done();
            return;
        }
    }

    if shared.config.check_dns {
        if let Err(e) = node.check_for_dns(shared.config.timeout).await {
            debug!("dns check for {} failed: {e:#}", node.domain);
        }
    }

    debug!("visiting {} at depth {}", node.domain, node.depth);
    let result = match tokio::time::timeout(
        shared.config.timeout,
        shared.driver.query_domain(&node.domain),
    )
    .await
    {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            debug!("query for {} failed: {e:#}", node.domain);
            None
        }
        Err(_) => {
            debug!("query for {} timed out", node.domain);
            None
        }
    };

    // a failed query still emits the node, with whatever status it carries
    let Some(result) = result else {
        let node = shared.graph.add_domain(node);
        let _ = shared.output_tx.send(node).await;
        shared.work.done();
        return;
    };

    let mut statuses = result.status();
    node.add_status_map(&mut statuses);
    node.add_related_domains(&result.related());

    // only the fingerprints keyed by the queried domain are authoritative
    let fingerprints = result.fingerprints().for_domain(&node.domain);
    for fp in &fingerprints {
        if shared.graph.get_cert(fp).is_none() {
            let first_attempt = shared.attempted_certs.lock().unwrap().insert(*fp);
            if first_attempt {
                match tokio::time::timeout(shared.config.timeout, result.query_cert(fp)).await {
                    Ok(Ok(cert)) => {
                        shared
                            .graph
                            .add_cert(CertNode::new(cert.fingerprint, cert.domains));
                    }
                    Ok(Err(e)) => {
                        debug!("certificate lookup for {} failed: {e:#}", fp.hex_string())
                    }
                    Err(_) => debug!("certificate lookup for {} timed out", fp.hex_string()),
                }
            }
        }
        if let Some(cert) = shared.graph.get_cert(fp) {
            for source in result.sources(&node.domain, fp) {
                cert.add_found(&source);
                node.add_cert_fingerprint(*fp, &source);
            }
        }
    }

    let node = shared.graph.add_domain(node);
    let _ = shared.output_tx.send(Arc::clone(&node)).await;

    let next_depth = node.depth.saturating_add(1);
    let neighbors =
        shared
            .graph
            .get_domain_neighbors(&node.domain, shared.config.cdn, shared.config.sans_cap);
    for neighbor in neighbors {
        enqueue(&shared, DomainNode::new(&neighbor, next_depth)).await;
        if shared.config.apex {
            if let Ok(apex) = dns::apex_domain(&neighbor) {
                enqueue(&shared, DomainNode::new(&apex, next_depth)).await;
            }
        }
    }

    shared.work.done();
}

/// Counts outstanding units of work and wakes waiters when the count hits
/// zero. Submission adds a unit, every terminal path releases it; zero with
/// an empty queue means the crawl is done.
struct WorkTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkTracker {
    fn new() -> Self {
        WorkTracker {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn add(&self, n: usize) {
        self.active.fetch_add(n, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register the waiter before checking, so a notification between
            // the check and the await cannot be lost
            notified.as_mut().enable();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}
