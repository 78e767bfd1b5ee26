//! Billing email notifications
//!
//! Sends human-facing billing emails (cancellation confirmation, payment
//! failure notice) through the platform's transactional email HTTP API.
//! Delivery failures never roll back a reconciliation write; the dispatcher
//! logs and continues. Unconfigured environments run with email disabled.

use serde_json::json;

use crate::error::{ReconcileError, ReconcileResult};

/// Connection settings for the email API.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_address: String,
}

/// Billing email sender.
#[derive(Clone)]
pub struct BillingEmailService {
    client: reqwest::Client,
    config: Option<EmailConfig>,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: Some(config),
        }
    }

    /// Build from `EMAIL_API_URL`, `EMAIL_API_KEY`, and `EMAIL_FROM`.
    /// Missing configuration disables sending.
    pub fn from_env() -> Self {
        let config = match (
            std::env::var("EMAIL_API_URL"),
            std::env::var("EMAIL_API_KEY"),
            std::env::var("EMAIL_FROM"),
        ) {
            (Ok(api_url), Ok(api_key), Ok(from_address)) => Some(EmailConfig {
                api_url,
                api_key,
                from_address,
            }),
            _ => {
                tracing::info!("Email API not configured - billing emails disabled");
                None
            }
        };

        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            config: None,
        }
    }

    /// Confirmation sent after a subscription transitions to canceled.
    pub async fn send_subscription_canceled(
        &self,
        to: &str,
        recipient_name: &str,
        plan_name: &str,
    ) -> ReconcileResult<()> {
        let subject = "Your subscription has been canceled";
        let body = format!(
            "Hi {},\n\nYour {} subscription has been canceled. You will retain \
             access until the end of the current billing period.\n\nIf this was \
             a mistake, you can resubscribe at any time from your billing page.",
            recipient_name, plan_name
        );

        self.deliver(to, subject, &body).await
    }

    /// Notice sent when an invoice payment fails.
    pub async fn send_payment_failed(
        &self,
        to: &str,
        recipient_name: &str,
        amount_cents: i64,
        currency: &str,
    ) -> ReconcileResult<()> {
        let subject = "Payment failed";
        let body = format!(
            "Hi {},\n\nWe were unable to collect a payment of {:.2} {}. Please \
             update your payment method to keep your service active.",
            recipient_name,
            amount_cents as f64 / 100.0,
            currency.to_uppercase()
        );

        self.deliver(to, subject, &body).await
    }

    async fn deliver(&self, to: &str, subject: &str, body: &str) -> ReconcileResult<()> {
        let Some(config) = &self.config else {
            tracing::debug!(to = %to, subject = %subject, "Email disabled, skipping send");
            return Ok(());
        };

        let response = self
            .client
            .post(&config.api_url)
            .bearer_auth(&config.api_key)
            .json(&json!({
                "from": config.from_address,
                "to": to,
                "subject": subject,
                "text": body,
            }))
            .send()
            .await
            .map_err(|e| ReconcileError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ReconcileError::Notification(format!(
                "email API returned {}",
                status
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Billing email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_service_is_a_no_op() {
        let service = BillingEmailService::disabled();
        let result = service
            .send_subscription_canceled("user@example.com", "Ada", "Pro")
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_email_request_shape() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer test_key")
            .match_body(mockito::Matcher::PartialJson(json!({
                "from": "billing@clientdeck.test",
                "to": "user@example.com",
                "subject": "Your subscription has been canceled",
            })))
            .with_status(200)
            .create_async()
            .await;

        let service = BillingEmailService::new(EmailConfig {
            api_url: format!("{}/emails", server.url()),
            api_key: "test_key".to_string(),
            from_address: "billing@clientdeck.test".to_string(),
        });

        service
            .send_subscription_canceled("user@example.com", "Ada", "Pro")
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_failure_surfaces_notification_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/emails")
            .with_status(500)
            .create_async()
            .await;

        let service = BillingEmailService::new(EmailConfig {
            api_url: format!("{}/emails", server.url()),
            api_key: "test_key".to_string(),
            from_address: "billing@clientdeck.test".to_string(),
        });

        let result = service
            .send_payment_failed("user@example.com", "Ada", 5000, "usd")
            .await;

        assert!(matches!(result, Err(ReconcileError::Notification(_))));
    }
}
