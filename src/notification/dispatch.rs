use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::DispatcherConfig;
use crate::notification::{Notification, NotificationError, NotificationKind, Notifier};

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONTENT_LENGTH: usize = 2000;
const ASYNC_QUEUE_SIZE: usize = 256;

/// Settings for the HTTP notification dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Endpoint that accepts notification jobs.
    pub url: String,
    /// Bearer token.
    pub token: String,
    pub notify_fills: bool,
    pub notify_deposits: bool,
    pub notify_withdrawals: bool,
    pub notify_expiry: bool,
    pub notify_errors: bool,
}

impl DispatchSettings {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            notify_fills: true,
            notify_deposits: true,
            notify_withdrawals: true,
            notify_expiry: true,
            notify_errors: true,
        }
    }
}

impl From<&DispatcherConfig> for DispatchSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            url: config.url.clone().unwrap_or_default(),
            token: config.token.clone(),
            notify_fills: config.notify_fills,
            notify_deposits: config.notify_deposits,
            notify_withdrawals: config.notify_withdrawals,
            notify_expiry: config.notify_expiry,
            notify_errors: config.notify_errors,
        }
    }
}

/// DispatchNotifier posts notifications to the dispatcher service from a
/// background worker fed by a bounded queue.
pub struct DispatchNotifier {
    settings: DispatchSettings,
    http_client: reqwest::Client,
    sender: mpsc::Sender<Notification>,
}

impl DispatchNotifier {
    /// Creates the notifier and spawns its worker. Must be called inside a
    /// tokio runtime.
    pub fn new(settings: DispatchSettings) -> Result<Self, NotificationError> {
        if settings.url.is_empty() {
            return Err(NotificationError::Config("dispatcher url is required".into()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()?;

        let (sender, receiver) = mpsc::channel(ASYNC_QUEUE_SIZE);

        Self::spawn_worker(receiver, settings.clone(), http_client.clone());

        Ok(Self {
            settings,
            http_client,
            sender,
        })
    }

    fn spawn_worker(
        mut receiver: mpsc::Receiver<Notification>,
        settings: DispatchSettings,
        http_client: reqwest::Client,
    ) {
        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                if let Err(e) = Self::post(&http_client, &settings, &notification).await {
                    error!(
                        user_id = %notification.user_id,
                        kind = %notification.kind,
                        error = %e,
                        "Failed to dispatch notification"
                    );
                }
            }
            debug!("Notification worker stopped");
        });
    }

    async fn post(
        http_client: &reqwest::Client,
        settings: &DispatchSettings,
        notification: &Notification,
    ) -> Result<(), NotificationError> {
        let content = truncate(&notification.content, MAX_CONTENT_LENGTH);

        let payload = serde_json::json!({
            "user_id": notification.user_id,
            "title": notification.title,
            "content": content,
            "type": notification.kind,
            "created_at": notification.created_at.to_rfc3339(),
        });

        let mut request = http_client.post(&settings.url).json(&payload);
        if !settings.token.is_empty() {
            request = request.bearer_auth(&settings.token);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotificationError::Dispatcher { status, body });
        }

        Ok(())
    }
}

/// Cuts `text` to at most `max` bytes on a char boundary.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[async_trait::async_trait]
impl Notifier for DispatchNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        if !self.is_enabled(notification.kind) {
            return Ok(());
        }
        Self::post(&self.http_client, &self.settings, notification).await
    }

    fn enqueue(&self, notification: Notification) {
        if !self.is_enabled(notification.kind) {
            return;
        }

        if let Err(e) = self.sender.try_send(notification) {
            error!(error = %e, "Failed to queue notification");
        }
    }

    fn is_enabled(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::Fill => self.settings.notify_fills,
            NotificationKind::Deposit => self.settings.notify_deposits,
            NotificationKind::Withdrawal => self.settings.notify_withdrawals,
            NotificationKind::Expiry | NotificationKind::Refund => self.settings.notify_expiry,
            NotificationKind::Error => self.settings.notify_errors,
        }
    }

    async fn close(&self) -> Result<(), NotificationError> {
        // Give the worker time to drain what is queued.
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}
