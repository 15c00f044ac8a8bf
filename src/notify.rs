//! Operator notifications for the payment queue.
//!
//! Two modes:
//! 1. POST to a configured webhook URL (for DIY chat/email delivery)
//! 2. Log only (default)
//!
//! Delivery is fire-and-forget: callers spawn `send` and move on. A lost
//! notification costs an operator a refresh, never a customer a response.

use reqwest::Client;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    PaymentSubmitted {
        transaction_code: String,
        payment_method: String,
        phone: String,
        email: String,
        amount: Option<f64>,
    },
    PaymentResolved {
        transaction_code: String,
        outcome: String,
        operator: String,
        license_key: Option<String>,
    },
}

impl NotifyEvent {
    fn summary(&self) -> String {
        match self {
            NotifyEvent::PaymentSubmitted {
                transaction_code,
                payment_method,
                ..
            } => format!("payment claim {transaction_code} submitted via {payment_method}"),
            NotifyEvent::PaymentResolved {
                transaction_code,
                outcome,
                operator,
                ..
            } => format!("payment claim {transaction_code} {outcome} by {operator}"),
        }
    }
}

#[derive(Debug, Clone)]
enum NotifyMode {
    Webhook(String),
    Log,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    mode: NotifyMode,
    client: Client,
}

impl Notifier {
    pub fn from_config(webhook_url: Option<String>) -> Self {
        let mode = match webhook_url {
            Some(url) if !url.is_empty() => NotifyMode::Webhook(url),
            _ => NotifyMode::Log,
        };
        Self {
            mode,
            client: Client::new(),
        }
    }

    pub async fn send(&self, event: NotifyEvent) {
        match &self.mode {
            NotifyMode::Log => {
                tracing::info!("notification: {}", event.summary());
            }
            NotifyMode::Webhook(url) => {
                let result = self.client.post(url).json(&event).send().await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!("notification delivered: {}", event.summary());
                    }
                    Ok(response) => {
                        tracing::warn!(
                            "notification webhook returned {}: {}",
                            response.status(),
                            event.summary()
                        );
                    }
                    Err(e) => {
                        tracing::warn!("notification webhook failed: {e}: {}", event.summary());
                    }
                }
            }
        }
    }
}
