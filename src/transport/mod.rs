//! Mail transport capability.
//!
//! The dispatcher talks to the outside world through [`MailTransport`]
//! only. Production uses [`SmtpMailTransport`]; tests inject their own
//! implementation to record messages or simulate failures.
//!
//! A transport performs one delivery attempt per call and never retries.
//! It may block for as long as the server takes; the dispatcher bounds
//! each call with the configured send timeout.

mod smtp;

pub use smtp::{SmtpMailTransport, build_message, classify_smtp_error};

use crate::compose::EmailMessage;
use crate::error::TransportError;
use async_trait::async_trait;

/// Delivers composed messages.
///
/// All recipients of a message are delivered in a single call.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver `message` to all its recipients.
    ///
    /// # Errors
    /// Returns a [`TransportError`] describing why delivery failed.
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError>;
}
