//! Email notification
//!
//! Three channels: run summaries, errors, and hazard detections, each with
//! its own recipient falling back to the default address. Notification
//! failures are logged and swallowed; a transfer run never fails because the
//! mail server is down.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{debug, error, warn};

use crate::config::NotificationsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Summary,
    Error,
    Hazard,
}

pub struct Notifier {
    config: NotificationsConfig,
}

impl Notifier {
    pub fn from_config(config: &NotificationsConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Whether a given channel would actually send anything.
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Summary => self.config.notify_summary,
            Channel::Error | Channel::Hazard => self.config.notify,
        }
    }

    fn recipient_for(&self, channel: Channel) -> Option<&str> {
        let specific = match channel {
            Channel::Summary => &self.config.recipient_email_summary,
            Channel::Error => &self.config.recipient_email_error,
            Channel::Hazard => &self.config.recipient_email_hazard,
        };
        specific
            .as_deref()
            .or(self.config.recipient_email.as_deref())
    }

    /// Send a message on a channel. Best-effort: failures are logged, never
    /// propagated.
    pub fn notify(&self, channel: Channel, subject: &str, body: &str) {
        if !self.channel_enabled(channel) {
            debug!(?channel, "Notification channel disabled; skipping");
            return;
        }
        let Some(recipient) = self.recipient_for(channel) else {
            warn!(?channel, "No recipient configured for channel; skipping");
            return;
        };

        if let Err(e) = self.send(recipient, subject, body) {
            error!(?channel, recipient, error = %format!("{e:#}"), "Failed to send notification");
        } else {
            debug!(?channel, recipient, subject, "Notification sent");
        }
    }

    fn send(&self, recipient: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let sender = self
            .config
            .sender_email
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no sender_email configured"))?;
        let server = self
            .config
            .smtp_server
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no smtp_server configured"))?;

        let message = Message::builder()
            .from(sender.parse::<Mailbox>()?)
            .to(recipient.parse::<Mailbox>()?)
            .subject(subject)
            .body(body.to_string())?;

        let mut builder = if self.config.use_tls {
            SmtpTransport::starttls_relay(server)?
        } else {
            SmtpTransport::builder_dangerous(server)
        };
        if let Some(port) = self.config.smtp_port {
            builder = builder.port(port);
        }
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        builder.build().send(&message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(notify: bool, notify_summary: bool) -> NotificationsConfig {
        NotificationsConfig {
            notify,
            notify_summary,
            recipient_email: Some("ops@example.org".into()),
            recipient_email_hazard: Some("security@example.org".into()),
            sender_email: Some("shuttle@example.org".into()),
            smtp_server: Some("mail.example.org".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_channel_gating() {
        let notifier = Notifier::from_config(&config_with(true, false));
        assert!(notifier.channel_enabled(Channel::Error));
        assert!(notifier.channel_enabled(Channel::Hazard));
        assert!(!notifier.channel_enabled(Channel::Summary));

        let notifier = Notifier::from_config(&config_with(false, true));
        assert!(!notifier.channel_enabled(Channel::Error));
        assert!(notifier.channel_enabled(Channel::Summary));
    }

    #[test]
    fn test_recipient_fallback() {
        let notifier = Notifier::from_config(&config_with(true, true));
        // Hazard has its own address; the others fall back to the default
        assert_eq!(
            notifier.recipient_for(Channel::Hazard),
            Some("security@example.org")
        );
        assert_eq!(
            notifier.recipient_for(Channel::Error),
            Some("ops@example.org")
        );
        assert_eq!(
            notifier.recipient_for(Channel::Summary),
            Some("ops@example.org")
        );
    }

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = Notifier::from_config(&NotificationsConfig::default());
        // Must not attempt any network traffic
        notifier.notify(Channel::Error, "subject", "body");
    }
}
