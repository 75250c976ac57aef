//! Handler dispatch keyed by domain suffix
//!
//! Patterns are kept as an ordered list; a query goes to the pattern that
//! matches the longest label-aligned suffix of its first question name.

use async_trait::async_trait;
use hickory_proto::op::Message;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dns::{servfail_reply, Handler, ResponseWriter};

const ROOT: &str = ".";

#[derive(Default)]
pub struct ServeMux {
    entries: Vec<(String, Arc<dyn Handler>)>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern` and every name below it.
    /// Registering the same pattern again replaces the earlier handler.
    pub fn handle(&mut self, pattern: &str, handler: Arc<dyn Handler>) {
        let pattern = normalize(pattern);
        match self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = handler,
            None => self.entries.push((pattern, handler)),
        }
    }

    /// Pick the handler for a name, most specific suffix first
    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        let name = normalize(name);
        let mut candidate = name.as_str();

        loop {
            if let Some((_, handler)) = self.entries.iter().find(|(p, _)| p == candidate) {
                return Some(handler);
            }
            if candidate == ROOT {
                return None;
            }
            candidate = match candidate.split_once('.') {
                Some((_, "")) | None => ROOT,
                Some((_, parent)) => parent,
            };
        }
    }
}

#[async_trait]
impl Handler for ServeMux {
    async fn serve_dns(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let name = request
            .queries()
            .first()
            .map(|q| q.name().to_string())
            .unwrap_or_else(|| ROOT.to_string());

        match self.lookup(&name) {
            Some(handler) => handler.serve_dns(writer, request).await,
            None => {
                debug!("No handler registered for {}", name);
                let response = servfail_reply(request);
                if let Err(e) = writer.write_msg(&response).await {
                    warn!(error = %e, peer = %writer.remote_addr(), "Failed to write DNS response");
                }
            }
        }
    }
}

/// Lower-case and fully qualify a name
fn normalize(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}
