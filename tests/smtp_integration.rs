//! SMTP integration tests with Mailhog.
//!
//! These tests require a running Mailhog instance.
//!
//! # Running locally
//!
//! ```bash
//! # Start Mailhog with Docker
//! docker run -d -p 1025:1025 -p 8025:8025 mailhog/mailhog
//!
//! # Run the integration tests
//! TEST_SMTP_HOST=localhost TEST_SMTP_PORT=1025 cargo test --test smtp_integration -- --ignored
//! ```
//!
//! # Environment Variables
//!
//! - `TEST_SMTP_HOST`: SMTP server host (default: localhost)
//! - `TEST_SMTP_PORT`: SMTP server port (default: 1025)

use logmailer::{Config, Level, LogEvent, MailAppender};
use reqwest::Client;
use serde::Deserialize;
use serial_test::serial;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Mailhog API types
// =============================================================================

/// Response from Mailhog API v2 /messages endpoint.
#[derive(Debug, Deserialize)]
struct MailhogResponse {
    /// Total number of messages in inbox.
    total: u32,
    /// List of messages.
    items: Vec<MailhogMessage>,
}

/// A single message from Mailhog.
#[derive(Debug, Deserialize)]
struct MailhogMessage {
    /// Raw message content.
    #[serde(rename = "Content")]
    content: MailhogContent,
    /// SMTP envelope.
    #[serde(rename = "Raw")]
    raw: MailhogRaw,
}

/// Content section of a Mailhog message.
#[derive(Debug, Deserialize)]
struct MailhogContent {
    /// Headers as key-value pairs.
    #[serde(rename = "Headers")]
    headers: std::collections::HashMap<String, Vec<String>>,
    /// Message body.
    #[serde(rename = "Body")]
    body: String,
}

/// Envelope as received by Mailhog.
#[derive(Debug, Deserialize)]
struct MailhogRaw {
    #[serde(rename = "To")]
    to: Vec<String>,
}

impl MailhogMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.content
            .headers
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }
}

// =============================================================================
// Mailhog helper functions
// =============================================================================

/// Decode quoted-printable soft line breaks for assertion purposes.
fn decode_qp_soft_breaks(input: &str) -> String {
    input.replace("=\r\n", "").replace("=\n", "")
}

fn mailhog_api_url() -> String {
    let host = std::env::var("TEST_SMTP_HOST").unwrap_or_else(|_| "localhost".to_string());
    format!("http://{}:8025", host)
}

async fn get_mailhog_messages(client: &Client) -> Result<MailhogResponse, reqwest::Error> {
    let url = format!("{}/api/v2/messages", mailhog_api_url());
    client.get(&url).send().await?.json().await
}

async fn clear_mailhog_inbox(client: &Client) -> Result<(), reqwest::Error> {
    let url = format!("{}/api/v1/messages", mailhog_api_url());
    client.delete(&url).send().await?;
    Ok(())
}

/// Wait until Mailhog holds `count` messages (with timeout).
async fn wait_for_messages(
    client: &Client,
    count: u32,
    timeout: Duration,
) -> Result<Vec<MailhogMessage>, &'static str> {
    let start = std::time::Instant::now();
    loop {
        if start.elapsed() > timeout {
            return Err("Timeout waiting for messages in Mailhog");
        }

        match get_mailhog_messages(client).await {
            Ok(response) if response.total >= count => return Ok(response.items),
            Ok(_) => {}
            Err(e) => {
                eprintln!("Mailhog API error (retrying): {}", e);
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// =============================================================================
// Test helpers
// =============================================================================

/// Start an appender against Mailhog. `extra` is appended to the appender section.
fn mailhog_appender(extra: &str) -> MailAppender {
    let host = std::env::var("TEST_SMTP_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = std::env::var("TEST_SMTP_PORT")
        .unwrap_or_else(|_| "1025".to_string())
        .parse()
        .unwrap_or(1025);

    let yaml = format!(
        r#"
appender:
  smtp:
    host: {}
    port: {}
    tls: none
    hello_name: logmailer-test
  from: "Logmailer Test <logmailer-test@example.com>"
  subject: "[{{{{ level }}}}] {{{{ logger }}}}: {{{{ message }}}}"
{}
"#,
        host, port, extra
    );
    let config = Config::from_yaml(&yaml).expect("Invalid test configuration");
    MailAppender::from_config(&config.appender, Path::new(env!("CARGO_MANIFEST_DIR")))
        .expect("Failed to start appender for Mailhog")
}

// =============================================================================
// Integration tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires running Mailhog
#[serial]
async fn appender_delivers_buffered_events_to_mailhog() {
    let client = Client::new();
    clear_mailhog_inbox(&client)
        .await
        .expect("Failed to clear Mailhog inbox");

    let appender = mailhog_appender("  to: [recipient@example.com]\n  buffer_size: 3\n");
    for i in 1..=4 {
        appender
            .on_event(LogEvent::new(Level::Info, "app.db", format!("query {}", i)))
            .unwrap();
    }
    let handle = appender
        .on_event(LogEvent::new(Level::Error, "app.db", "connection lost"))
        .unwrap()
        .expect("Error event should trigger a send");

    let outcome = handle.wait(Duration::from_secs(10)).await.unwrap();
    assert!(outcome.success, "Send failed: {:?}", outcome.error);
    assert_eq!(outcome.events, 3);

    let messages = wait_for_messages(&client, 1, Duration::from_secs(5))
        .await
        .expect("Message not received in Mailhog");
    let message = &messages[0];

    assert!(
        message
            .header("From")
            .is_some_and(|f| f.contains("logmailer-test@example.com"))
    );
    assert_eq!(
        message.header("Subject"),
        Some("[ERROR] app.db: connection lost")
    );

    let body = decode_qp_soft_breaks(&message.content.body);
    assert!(!body.contains("query 2"), "Evicted event in body: {}", body);
    assert!(body.contains("query 3"));
    assert!(body.contains("query 4"));
    assert!(body.contains("connection lost"));

    tokio::task::spawn_blocking(move || appender.stop())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires running Mailhog
#[serial]
async fn appender_sends_one_message_to_every_recipient() {
    let client = Client::new();
    clear_mailhog_inbox(&client)
        .await
        .expect("Failed to clear Mailhog inbox");

    let appender = mailhog_appender(
        "  to: [\"first@example.com, second@example.com\"]\n  cc: [third@example.com]\n",
    );
    let handle = appender
        .on_event(LogEvent::new(Level::Error, "app", "boom"))
        .unwrap()
        .unwrap();
    let outcome = handle.wait(Duration::from_secs(10)).await.unwrap();
    assert!(outcome.success, "Send failed: {:?}", outcome.error);

    let messages = wait_for_messages(&client, 1, Duration::from_secs(5))
        .await
        .expect("Message not received in Mailhog");
    assert_eq!(messages.len(), 1);

    let envelope = &messages[0].raw.to;
    for rcpt in ["first@example.com", "second@example.com", "third@example.com"] {
        assert!(envelope.iter().any(|r| r == rcpt), "{} missing from {:?}", rcpt, envelope);
    }
    assert!(
        messages[0]
            .header("Cc")
            .is_some_and(|cc| cc.contains("third@example.com"))
    );

    tokio::task::spawn_blocking(move || appender.stop())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires running Mailhog
#[serial]
async fn appender_sends_multipart_alternative() {
    let client = Client::new();
    clear_mailhog_inbox(&client)
        .await
        .expect("Failed to clear Mailhog inbox");

    let appender = mailhog_appender(
        r#"  to: [recipient@example.com]
  layout:
    text: {}
    html:
      title: "Mailhog check"
"#,
    );
    let handle = appender
        .on_event(LogEvent::new(Level::Error, "app", "<script>alert(1)</script>"))
        .unwrap()
        .unwrap();
    let outcome = handle.wait(Duration::from_secs(10)).await.unwrap();
    assert!(outcome.success, "Send failed: {:?}", outcome.error);

    let messages = wait_for_messages(&client, 1, Duration::from_secs(5))
        .await
        .expect("Message not received in Mailhog");
    let message = &messages[0];

    assert!(
        message
            .header("Content-Type")
            .is_some_and(|ct| ct.starts_with("multipart/alternative"))
    );
    let body = decode_qp_soft_breaks(&message.content.body);
    assert!(body.contains("text/plain"));
    assert!(body.contains("text/html"));
    assert!(body.contains("&lt;script&gt;"));

    tokio::task::spawn_blocking(move || appender.stop())
        .await
        .unwrap();
}
