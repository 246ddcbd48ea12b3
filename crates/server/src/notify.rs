use std::time::Duration;

use provisio_core::config::NotifierConfig;
use provisio_core::notify::{Notification, Notifier, NotifyError};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

/// Posts each notification as JSON to a webhook on a spawned task.
///
/// `notify` only schedules the delivery; transport failures are logged and never reach the
/// engine call that produced the notification.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<SecretString>,
}

impl WebhookNotifier {
    pub fn from_config(config: &NotifierConfig) -> Result<Option<Self>, reqwest::Error> {
        let Some(url) = config.webhook_url.clone() else {
            return Ok(None);
        };
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        Ok(Some(Self { client, url, token: config.webhook_token.clone() }))
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|error| NotifyError::Unavailable(error.to_string()))?;

        let client = self.client.clone();
        let url = self.url.clone();
        let token = self.token.clone();
        handle.spawn(async move {
            let mut request = client.post(&url).json(&notification);
            if let Some(token) = &token {
                request = request.bearer_auth(token.expose_secret());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        event_name = "allocation.notify.delivered",
                        correlation_id = %notification.correlation_id,
                        request_id = %notification.request_id,
                        event_id = %notification.event_id,
                        "webhook accepted notification"
                    );
                }
                Ok(response) => {
                    warn!(
                        event_name = "allocation.notify.failed",
                        correlation_id = %notification.correlation_id,
                        request_id = %notification.request_id,
                        status = %response.status(),
                        "webhook rejected notification"
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "allocation.notify.failed",
                        correlation_id = %notification.correlation_id,
                        request_id = %notification.request_id,
                        error = %error,
                        "webhook delivery failed"
                    );
                }
            }
        });

        Ok(())
    }
}
