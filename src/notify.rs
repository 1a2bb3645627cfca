//! Best-effort failure notifications.
//!
//! Users can attach a webhook endpoint to their account
//! (`notify_config.webhook_url`); when one of their jobs fails terminally,
//! a short JSON payload is posted there. Delivery is fire-and-forget with a
//! per-endpoint minimum interval so a flapping task cannot flood anyone.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::User;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_INTERVAL: Duration = Duration::from_secs(15);

pub struct Notifier {
    client: reqwest::Client,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Notify the user's webhook about a failed job, if one is configured.
    /// Errors are logged, never surfaced.
    pub async fn notify_job_failure(&self, user: &User, task_type: &str, message: &str) {
        let Some(webhook) = user
            .notify_config
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .filter(|url| !url.is_empty())
        else {
            return;
        };

        if self.rate_limited(webhook) {
            tracing::debug!(user_id = user.id, "notification rate limited");
            return;
        }

        let text = build_failure_text(&user.account_no, &user.username, task_type, message);
        let body = serde_json::json!({"text": text});
        match self.client.post(webhook).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(user_id = user.id, "failure notification sent");
            }
            Ok(response) => {
                tracing::warn!(
                    user_id = user.id,
                    status = %response.status(),
                    "failure notification rejected"
                );
            }
            Err(err) => {
                tracing::warn!(user_id = user.id, "failure notification failed: {err}");
            }
        }
    }

    fn rate_limited(&self, webhook: &str) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap();
        let now = Instant::now();
        match last_sent.get(webhook) {
            Some(last) if now.duration_since(*last) < MIN_INTERVAL => true,
            _ => {
                last_sent.insert(webhook.to_string(), now);
                false
            }
        }
    }
}

fn build_failure_text(account_no: &str, username: &str, task_type: &str, message: &str) -> String {
    let mut text = format!("account: {account_no}\n");
    if !username.is_empty() {
        text.push_str(&format!("character: {username}\n"));
    }
    text.push_str(&format!("task: {task_type}\nresult: failed"));
    if !message.is_empty() {
        text.push_str(&format!("\ndetail: {message}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_text_includes_optional_fields() {
        let text = build_failure_text("acc-1", "hero", "bounty_hunt", "timed out");
        assert_eq!(
            text,
            "account: acc-1\ncharacter: hero\ntask: bounty_hunt\nresult: failed\ndetail: timed out"
        );

        let text = build_failure_text("acc-1", "", "bounty_hunt", "");
        assert_eq!(text, "account: acc-1\ntask: bounty_hunt\nresult: failed");
    }

    #[test]
    fn repeat_sends_to_same_endpoint_are_rate_limited() {
        let notifier = Notifier::new();
        assert!(!notifier.rate_limited("https://example.test/hook"));
        assert!(notifier.rate_limited("https://example.test/hook"));
        // A different endpoint has its own window.
        assert!(!notifier.rate_limited("https://example.test/other"));
    }
}
