//! Failure alerting. Alerts are fire-and-forget: a broken channel is logged
//! and never aborts the pipeline.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

/// One alert channel from the `alerting` config section.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AlerterConfig {
    Log,
    Slack { webhook_url: String },
}

#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, subject: &str, message: &str);
}

/// Writes alerts to the log stream. Always configured as the fallback.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, subject: &str, message: &str) {
        error!(subject, message, "Pipeline alert");
    }
}

/// Posts alerts to a Slack incoming webhook.
pub struct SlackAlerter {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackAlerter {
    pub fn new(webhook_url: String) -> Self {
        SlackAlerter {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Alerter for SlackAlerter {
    async fn send(&self, subject: &str, message: &str) {
        let payload = json!({ "text": format!("*{subject}*\n{message}") });
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "Slack alert was rejected");
            }
            Err(e) => {
                warn!(error = %e, "Slack alert could not be delivered");
            }
        }
    }
}

/// Fan-out over all configured channels.
pub struct AlertManager {
    alerters: Vec<Box<dyn Alerter>>,
}

impl AlertManager {
    pub fn from_config(configs: &[AlerterConfig]) -> Self {
        let mut alerters: Vec<Box<dyn Alerter>> = Vec::new();
        for config in configs {
            match config {
                AlerterConfig::Log => alerters.push(Box::new(LogAlerter)),
                AlerterConfig::Slack { webhook_url } => {
                    alerters.push(Box::new(SlackAlerter::new(webhook_url.clone())));
                }
            }
        }
        if alerters.is_empty() {
            alerters.push(Box::new(LogAlerter));
        }
        AlertManager { alerters }
    }

    pub async fn send(&self, subject: &str, message: &str) {
        for alerter in &self.alerters {
            alerter.send(subject, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_slack_alerter_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json_string(
                r#"{"text": "*load failed: jader*\nfetch failed: boom"}"#,
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let alerter = SlackAlerter::new(format!("{}/hook", server.uri()));
        alerter.send("load failed: jader", "fetch failed: boom").await;
    }

    #[tokio::test]
    async fn test_delivery_failures_are_swallowed() {
        // Nothing listens on this port; send must still return
        let alerter = SlackAlerter::new("http://127.0.0.1:9/hook".to_string());
        alerter.send("subject", "message").await;

        let manager = AlertManager::from_config(&[AlerterConfig::Slack {
            webhook_url: "http://127.0.0.1:9/hook".to_string(),
        }]);
        manager.send("subject", "message").await;
    }

    #[test]
    fn test_empty_config_falls_back_to_log() {
        let manager = AlertManager::from_config(&[]);
        assert_eq!(manager.alerters.len(), 1);
    }
}
