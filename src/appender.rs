//! The mail appender: the push interface of the pipeline.
//!
//! Every event goes into the cyclic buffer. Events accepted by the
//! trigger policy additionally hand a send to the dispatcher, which
//! mails the buffer contents as they are when the send starts.
//!
//! # Example
//!
//! ```ignore
//! use logmailer::{Config, LogEvent, Level, MailAppender};
//!
//! let config = Config::load(path)?;
//! let appender = MailAppender::from_config(&config.appender, config_dir)?;
//!
//! appender.on_event(LogEvent::new(Level::Info, "app", "starting"))?;
//! if let Some(handle) = appender.on_event(LogEvent::new(Level::Error, "app", "boom"))? {
//!     handle.wait_blocking(Duration::from_secs(30))?;
//! }
//! appender.stop();
//! ```

use crate::buffer::CyclicBuffer;
use crate::compose::Composer;
use crate::config::{AppenderConfig, RuntimeConfig};
use crate::dispatch::{
    self, DispatchSettings, DispatchState, Dispatcher, SendHandle, SharedBuffer, StatusEvent, lock,
};
use crate::error::{AppendError, ConfigError};
use crate::event::LogEvent;
use crate::transport::{MailTransport, SmtpMailTransport};
use crate::trigger::{self, TriggerPolicy};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Buffers log events and mails them when a trigger fires.
pub struct MailAppender {
    config: Arc<RuntimeConfig>,
    buffer: SharedBuffer,
    trigger: Arc<dyn TriggerPolicy>,
    dispatcher: Dispatcher,
    latest: Mutex<Option<SendHandle>>,
    stopped: AtomicBool,
}

impl MailAppender {
    /// Validate the configuration and start an appender delivering
    /// through `transport`.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` listing every configuration problem,
    /// or `ConfigError::Startup` if the worker cannot be spawned.
    pub fn start(
        config: &AppenderConfig,
        config_dir: &Path,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self, ConfigError> {
        let runtime = config.compile(config_dir)?;
        Self::start_compiled(runtime, transport)
    }

    /// Validate the configuration and start an appender delivering over SMTP.
    ///
    /// # Errors
    /// Same as [`MailAppender::start`].
    pub fn from_config(config: &AppenderConfig, config_dir: &Path) -> Result<Self, ConfigError> {
        let runtime = config.compile(config_dir)?;
        let transport = SmtpMailTransport::from_runtime(&runtime.smtp, runtime.send_timeout)?;
        Self::start_compiled(runtime, Arc::new(transport))
    }

    /// Start from an already validated configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if the layouts or the worker cannot be set up.
    pub fn start_compiled(
        config: RuntimeConfig,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self, ConfigError> {
        let buffer: SharedBuffer = Arc::new(Mutex::new(CyclicBuffer::new(config.buffer_size)?));
        let composer = Arc::new(Composer::from_runtime(&config)?);
        let trigger = trigger::from_config(&config.trigger);
        let dispatcher = Dispatcher::start(
            DispatchSettings::from_runtime(&config),
            Arc::clone(&buffer),
            composer,
            transport,
        )?;

        tracing::info!(
            host = %config.smtp.host,
            port = config.smtp.port,
            recipients = config.to.len() + config.cc.len() + config.bcc.len(),
            buffer_size = config.buffer_size,
            asynchronous = config.asynchronous,
            "Mail appender started"
        );

        Ok(Self {
            config: Arc::new(config),
            buffer,
            trigger,
            dispatcher,
            latest: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Push one event.
    ///
    /// Returns the handle of the send the event triggered, if any. In
    /// synchronous mode the call blocks until that send completes.
    ///
    /// # Errors
    /// Returns `AppendError::Stopped` after [`MailAppender::stop`], and
    /// `AppendError::Send` when a synchronous send fails.
    pub fn on_event(&self, event: LogEvent) -> Result<Option<SendHandle>, AppendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AppendError::Stopped);
        }

        let event = Arc::new(event);
        let buffered = {
            let mut buffer = lock(&self.buffer);
            if buffer.push(Arc::clone(&event)).is_some() {
                tracing::trace!("Buffer full, oldest event evicted");
            }
            buffer.len()
        };
        metrics::counter!("logmailer_events_total").increment(1);
        metrics::gauge!("logmailer_buffer_size").set(buffered as f64);

        if !self.trigger.should_trigger(&event) {
            return Ok(None);
        }

        tracing::debug!(
            level = %event.level,
            logger = %event.logger,
            buffered = buffered,
            "Event triggered a send"
        );
        metrics::counter!("logmailer_triggers_total").increment(1);

        if self.config.asynchronous {
            let handle = self.dispatcher.submit(event)?;
            *lock(&self.latest) = Some(handle.clone());
            return Ok(Some(handle));
        }

        // recorded before blocking so a failed send stays observable
        let handle = self.dispatcher.submit_exclusive(event)?;
        *lock(&self.latest) = Some(handle.clone());
        dispatch::settle(handle).map(Some)
    }

    /// Handle of the most recently triggered send.
    pub fn pending_send_handle(&self) -> Option<SendHandle> {
        lock(&self.latest).clone()
    }

    /// Receiver of send diagnostics.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.dispatcher.subscribe_status()
    }

    pub fn state(&self) -> DispatchState {
        self.dispatcher.state()
    }

    /// Number of events currently buffered.
    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Copy of the buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<LogEvent>> {
        lock(&self.buffer).snapshot()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Stop accepting events and shut the dispatcher down.
    ///
    /// Blocks for at most the configured shutdown grace period plus the
    /// time to join the worker. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping mail appender");
        self.dispatcher.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for MailAppender {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MailAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailAppender")
            .field("host", &self.config.smtp.host)
            .field("buffer_size", &self.config.buffer_size)
            .field("asynchronous", &self.config.asynchronous)
            .field("state", &self.state())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::TransportError;
    use crate::compose::EmailMessage;
    use crate::event::Level;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl MailTransport for CountingTransport {
        async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn appender_config(extra: &str) -> AppenderConfig {
        let yaml = format!(
            r#"
appender:
  smtp:
    host: localhost
    port: 1025
    tls: none
  from: logmailer@localhost
  to: [ops@example.com]
{}
"#,
            extra
        );
        Config::from_yaml(&yaml).unwrap().appender
    }

    #[test]
    fn start_rejects_invalid_configuration() {
        let mut config = appender_config("");
        config.to.clear();
        config.smtp.host.clear();

        let err = MailAppender::start(
            &config,
            Path::new("."),
            Arc::new(CountingTransport::default()),
        )
        .unwrap_err();
        match err {
            ConfigError::Invalid(errors) => assert_eq!(errors.len(), 2),
            e => panic!("Expected Invalid, got {:?}", e),
        }
    }

    #[test]
    fn from_config_builds_smtp_transport() {
        let appender = MailAppender::from_config(&appender_config(""), Path::new(".")).unwrap();
        assert_eq!(appender.state(), DispatchState::Idle);
        appender.stop();
    }

    #[test]
    fn non_triggering_events_only_fill_the_buffer() {
        let transport = Arc::new(CountingTransport::default());
        let appender = MailAppender::start(
            &appender_config("  buffer_size: 2\n"),
            Path::new("."),
            Arc::clone(&transport) as Arc<dyn MailTransport>,
        )
        .unwrap();

        for i in 0..3 {
            let handle = appender
                .on_event(LogEvent::new(Level::Info, "app", format!("e{}", i)))
                .unwrap();
            assert!(handle.is_none());
        }

        assert_eq!(appender.buffered(), 2);
        assert!(appender.pending_send_handle().is_none());
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn synchronous_mode_returns_completed_handle() {
        let transport = Arc::new(CountingTransport::default());
        let appender = MailAppender::start(
            &appender_config("  asynchronous: false\n"),
            Path::new("."),
            Arc::clone(&transport) as Arc<dyn MailTransport>,
        )
        .unwrap();

        let handle = appender
            .on_event(LogEvent::new(Level::Error, "app", "boom"))
            .unwrap()
            .unwrap();

        assert!(handle.is_done());
        assert_eq!(appender.state(), DispatchState::Idle);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(appender.pending_send_handle().unwrap().id(), handle.id());
    }

    #[test]
    fn events_after_stop_are_rejected() {
        let appender = MailAppender::start(
            &appender_config(""),
            Path::new("."),
            Arc::new(CountingTransport::default()),
        )
        .unwrap();

        appender.stop();
        appender.stop();

        let err = appender
            .on_event(LogEvent::new(Level::Error, "app", "late"))
            .unwrap_err();
        assert_eq!(err, AppendError::Stopped);
        assert!(appender.is_stopped());
    }

    #[test]
    fn latest_handle_tracks_most_recent_send() {
        let appender = MailAppender::start(
            &appender_config(""),
            Path::new("."),
            Arc::new(CountingTransport::default()),
        )
        .unwrap();

        let first = appender
            .on_event(LogEvent::new(Level::Error, "app", "one"))
            .unwrap()
            .unwrap();
        first.wait_blocking(Duration::from_secs(5)).unwrap();

        let second = appender
            .on_event(LogEvent::new(Level::Error, "app", "two"))
            .unwrap()
            .unwrap();

        assert_eq!(appender.pending_send_handle().unwrap().id(), second.id());
        second.wait_blocking(Duration::from_secs(5)).unwrap();
    }
}
