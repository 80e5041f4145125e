//! Built-in channel adapters

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use super::channel::{ChannelError, NotificationChannel};
use crate::alerts::{AlertNotification, Severity};

/// Writes a one-line summary to stdout
pub struct ConsoleChannel {
    name: String,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self::named("console")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn format(alert: &AlertNotification) -> String {
        let mut line = format!(
            "[{}] {} {}: {}",
            alert.severity.as_str().to_uppercase(),
            alert.created_at.to_rfc3339(),
            alert.rule_name,
            alert.message
        );
        if alert.escalation_count > 0 {
            line.push_str(&format!(" (escalation {})", alert.escalation_count));
        }
        line
    }
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertNotification) -> Result<(), ChannelError> {
        println!("{}", Self::format(alert));
        Ok(())
    }
}

/// Emits alerts as tracing events at a level matching their severity
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new() -> Self {
        Self {
            name: "log".to_string(),
        }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertNotification) -> Result<(), ChannelError> {
        match alert.severity {
            Severity::Info => tracing::info!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                escalation = alert.escalation_count,
                "Alert: {}",
                alert.message
            ),
            Severity::Warning => tracing::warn!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                escalation = alert.escalation_count,
                "Alert: {}",
                alert.message
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                severity = %alert.severity,
                escalation = alert.escalation_count,
                "Alert: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Appends one JSON document per alert to a file
pub struct JsonLinesChannel {
    name: String,
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            name: "jsonl".to_string(),
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NotificationChannel for JsonLinesChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertNotification) -> Result<(), ChannelError> {
        let mut line = serde_json::to_string(alert).map_err(|e| ChannelError::Send(e.to_string()))?;
        line.push('\n');

        // Keep concurrent writers from interleaving lines
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ChannelError::Send(format!("Failed to open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        file.flush().await.map_err(|e| ChannelError::Send(e.to_string()))?;
        Ok(())
    }

    fn is_available(&self) -> bool {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.is_dir(),
            _ => true,
        }
    }
}

/// Fans alerts out to in-process subscribers
pub struct BroadcastChannel {
    name: String,
    sender: broadcast::Sender<AlertNotification>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: "broadcast".to_string(),
            sender,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertNotification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationChannel for BroadcastChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertNotification) -> Result<(), ChannelError> {
        self.sender
            .send(alert.clone())
            .map(|_| ())
            .map_err(|_| ChannelError::Unavailable(self.name.clone()))
    }

    /// Unavailable while nobody is subscribed
    fn is_available(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

/// POSTs the alert as JSON to an HTTP endpoint
pub struct WebhookChannel {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: "webhook".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &AlertNotification) -> Result<(), ChannelError> {
        let mut request = self.client.post(&self.url).json(alert);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Send(format!("Failed to send webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChannelError::Send(format!(
                "Webhook returned status {}",
                response.status()
            )));
        }

        tracing::debug!(alert_id = %alert.id, url = %self.url, "Webhook notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::manager::tests::notification;

    #[tokio::test]
    async fn test_log_and_console_always_succeed() {
        let alert = notification();
        assert!(LogChannel::new().send(&alert).await.is_ok());
        assert!(ConsoleChannel::new().send(&alert).await.is_ok());
        assert!(ConsoleChannel::format(&alert).starts_with("[ERROR]"));
    }

    #[tokio::test]
    async fn test_json_lines_appends_one_document_per_alert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let channel = JsonLinesChannel::new(&path);
        assert!(channel.is_available());

        let alert = notification();
        channel.send(&alert).await.unwrap();
        channel.send(&alert).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AlertNotification = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.id, alert.id);
    }

    #[test]
    fn test_json_lines_unavailable_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let channel = JsonLinesChannel::new(dir.path().join("missing").join("alerts.jsonl"));
        assert!(!channel.is_available());
    }

    #[tokio::test]
    async fn test_broadcast_requires_subscriber() {
        let channel = BroadcastChannel::new(8);
        assert!(!channel.is_available());

        let mut rx = channel.subscribe();
        assert!(channel.is_available());
        let alert = notification();
        channel.send(&alert).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, alert.id);
    }

    #[tokio::test]
    async fn test_webhook_connection_failure_is_send_error() {
        let channel = WebhookChannel::new("http://127.0.0.1:9/hook").with_header("x-token", "t");
        let err = channel.send(&notification()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Send(_)));
    }
}
