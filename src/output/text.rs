// src/output/text.rs
//! Plain and detail line output for visited domains.

use anyhow::Result;
use async_trait::async_trait;
use std::io::{self, Write};

use crate::dns;
use crate::graph::DomainNode;
use crate::output::OutputHandler;

/// Writes one line per visited domain: either the bare name or the
/// tab-separated detail form, plus a missing-apex notice when DNS checking
/// is enabled.
pub struct TextOutput {
    writer: Box<dyn Write + Send>,
    details: bool,
    check_dns: bool,
}

impl TextOutput {
    pub fn stdout(details: bool, check_dns: bool) -> Self {
        Self::to_writer(Box::new(io::stdout()), details, check_dns)
    }

    pub fn stderr(details: bool, check_dns: bool) -> Self {
        Self::to_writer(Box::new(io::stderr()), details, check_dns)
    }

    pub fn to_writer(writer: Box<dyn Write + Send>, details: bool, check_dns: bool) -> Self {
        TextOutput {
            writer,
            details,
            check_dns,
        }
    }
}

#[async_trait]
impl OutputHandler for TextOutput {
    async fn emit_node(&mut self, node: &DomainNode) -> Result<()> {
        if self.details {
            writeln!(self.writer, "{node}")?;
        } else {
            writeln!(self.writer, "{}", node.domain)?;
        }

        if self.check_dns && node.has_dns == Some(false) {
            let apex = dns::apex_domain(&node.domain).unwrap_or_else(|_| node.domain.clone());
            if self.details {
                writeln!(self.writer, "  no DNS records for apex domain: {apex}")?;
            } else {
                writeln!(self.writer, "  [NO DNS] {apex}")?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
