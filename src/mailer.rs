//! Delivery of onboarding links.
//!
//! Mail transport is external; the broker only needs somewhere to hand the
//! link.

use tracing::{debug, info};

use crate::Result;

/// Sends the sgID sign-up link to a prospective account holder.
#[async_trait::async_trait]
pub trait SignupMailer: Send + Sync {
    /// Deliver `link` to `recipient`.
    async fn send_signup_link(&self, recipient: &str, link: &str) -> Result<()>;
}

/// Logs the link instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait::async_trait]
impl SignupMailer for LogMailer {
    async fn send_signup_link(&self, recipient: &str, link: &str) -> Result<()> {
        info!(recipient = %recipient, action = "signup_email", "Signup link issued");
        debug!(recipient = %recipient, link = %link, "Signup link");
        Ok(())
    }
}
