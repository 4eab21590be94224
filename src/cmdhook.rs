//! Command webhook: `/`-prefixed chat commands are posted to a configured
//! target instead of being routed to their destination.
//!
//! Delivery is fire-and-forget: the shared HTTP client enforces a 1-second
//! timeout, the response body is discarded and transport errors are
//! swallowed. A message the hook accepted is suppressed either way.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use tracing::debug;

use crate::config::WebhookConfig;
use crate::jid;
use crate::xml::Element;

pub struct CmdHook {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl CmdHook {
    pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()?;
        Ok(Self { client, config })
    }

    /// Offer a message body to the hook. Returns `true` when the hook takes
    /// responsibility for it and normal delivery must be suppressed.
    pub async fn process_message(&self, from: &str, body: &str) -> bool {
        if self.config.target.is_empty() {
            return false;
        }
        let Some(cmd) = command_of(body) else {
            return false;
        };
        let Some(pid) = pid_of(from) else {
            return false;
        };

        let request = self
            .client
            .post(&self.config.target)
            .query(&[("pid", pid), ("cmd", cmd.as_str())])
            .header(AUTHORIZATION, &self.config.secret);
        match request.send().await {
            Ok(response) => {
                // Response content is irrelevant; drop it.
                let _ = response;
            }
            Err(e) => {
                debug!(error = %e, "webhook dispatch failed");
            }
        }
        true
    }
}

/// Extract the command text from a body: the inner `ChatMsg`'s `Msg` text,
/// only when it begins with `/`.
fn command_of(body: &str) -> Option<String> {
    let doc = Element::parse(body).ok()?;
    if doc.name.local != "ChatMsg" {
        return None;
    }
    let msg = doc.child("Msg").map(|c| c.text.as_str()).unwrap_or("");
    if !msg.starts_with('/') {
        return None;
    }
    Some(msg.to_string())
}

/// The persona id: the dot-separated field at index 1 of the sender's node.
fn pid_of(from: &str) -> Option<&str> {
    jid::node(from).split('.').nth(1)
}
