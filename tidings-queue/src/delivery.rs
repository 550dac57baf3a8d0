//! Delivery channels.
//!
//! A channel performs the side effect of a job: handing rendered content to
//! the outside world. Failures are classified by [`DeliveryError`]; the worker
//! turns them into retries or dead letters.

use crate::content::NotificationContent;
use crate::error::DeliveryError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Side-effecting sink for notification content.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Deliver one message.
    async fn send(&self, content: &NotificationContent) -> Result<(), DeliveryError>;

    /// Channel name for logging.
    fn name(&self) -> &'static str;
}

/// Mask the local part of an address, keeping its first and last character.
///
/// ```
/// use tidings_queue::delivery::mask_email;
///
/// assert_eq!(mask_email("jane@example.com"), "j**e@example.com");
/// assert_eq!(mask_email("jo@example.com"), "jo@example.com");
/// ```
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return email.to_string();
    };

    let chars: Vec<char> = local.chars().collect();
    if chars.len() <= 2 {
        return email.to_string();
    }

    let first = chars[0];
    let last = chars[chars.len() - 1];
    format!("{}{}{}@{}", first, "*".repeat(chars.len() - 2), last, domain)
}

/// Channel that only logs what it would have sent.
#[derive(Debug, Clone, Default)]
pub struct LogChannel {
    latency: Option<Duration>,
}

impl LogChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` on every send, to mimic a remote call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl DeliveryChannel for LogChannel {
    async fn send(&self, content: &NotificationContent) -> Result<(), DeliveryError> {
        info!(
            to = %mask_email(&content.recipient.email),
            subject = %content.subject,
            body = %content.body_text,
            html = content.body_html.is_some(),
            "Notification sent (log only)"
        );

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(feature = "smtp")]
pub use smtp::{SmtpChannel, SmtpSecurity, SmtpSettings};

#[cfg(feature = "smtp")]
mod smtp {
    use super::{DeliveryChannel, mask_email};
    use crate::config::ENV_PREFIX;
    use crate::content::NotificationContent;
    use crate::error::{ConfigError, DeliveryError};
    use async_trait::async_trait;
    use lettre::message::header::ContentType;
    use lettre::message::{Mailbox, MultiPart};
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
    use std::time::Duration;
    use tracing::{debug, info};

    /// SMTP security mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum SmtpSecurity {
        /// No encryption
        None,
        /// STARTTLS upgrade
        #[default]
        StartTls,
        /// Implicit TLS
        Tls,
    }

    impl SmtpSecurity {
        fn parse(s: &str) -> Option<Self> {
            match s.to_lowercase().as_str() {
                "none" => Some(Self::None),
                "starttls" => Some(Self::StartTls),
                "tls" => Some(Self::Tls),
                _ => None,
            }
        }
    }

    /// SMTP relay settings.
    #[derive(Debug, Clone)]
    pub struct SmtpSettings {
        pub host: String,
        pub port: u16,
        pub security: SmtpSecurity,
        pub username: Option<String>,
        pub password: Option<String>,
        /// Sender address, `Name <addr>` or bare address
        pub from: String,
        pub timeout: Duration,
    }

    impl SmtpSettings {
        pub fn new(host: impl Into<String>, from: impl Into<String>) -> Self {
            Self {
                host: host.into(),
                port: 587,
                security: SmtpSecurity::StartTls,
                username: None,
                password: None,
                from: from.into(),
                timeout: Duration::from_secs(30),
            }
        }

        pub fn credentials(
            mut self,
            username: impl Into<String>,
            password: impl Into<String>,
        ) -> Self {
            self.username = Some(username.into());
            self.password = Some(password.into());
            self
        }

        /// Read `TIDINGS_SMTP_*` variables; `None` when no host is set.
        pub fn from_env() -> Result<Option<Self>, ConfigError> {
            Self::from_vars(|key| std::env::var(key).ok())
        }

        pub(crate) fn from_vars<F>(lookup: F) -> Result<Option<Self>, ConfigError>
        where
            F: Fn(&str) -> Option<String>,
        {
            let var = |name: &str| lookup(&format!("{}_SMTP_{}", ENV_PREFIX, name));

            let Some(host) = var("HOST") else {
                return Ok(None);
            };
            let from = var("FROM").unwrap_or_else(|| format!("no-reply@{}", host));
            let mut settings = Self::new(host, from);

            if let Some(security) = var("SECURITY") {
                settings.security = SmtpSecurity::parse(&security).ok_or_else(|| {
                    ConfigError::Invalid(format!("unknown SMTP security mode: {}", security))
                })?;
                if settings.security == SmtpSecurity::Tls {
                    settings.port = 465;
                }
            }
            if let Some(port) = var("PORT") {
                settings.port = port
                    .parse()
                    .map_err(|_| ConfigError::Parse(format!("invalid SMTP port: {}", port)))?;
            }
            if let (Some(user), Some(pass)) = (var("USERNAME"), var("PASSWORD")) {
                settings = settings.credentials(user, pass);
            }
            Ok(Some(settings))
        }
    }

    /// Channel that sends mail through an SMTP relay.
    pub struct SmtpChannel {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from: Mailbox,
    }

    impl SmtpChannel {
        pub fn new(settings: &SmtpSettings) -> Result<Self, ConfigError> {
            let from: Mailbox = settings
                .from
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("invalid sender address: {}", e)))?;

            let mut builder = match settings.security {
                SmtpSecurity::None => {
                    AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
                }
                SmtpSecurity::StartTls => {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?
                }
                SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            };

            builder = builder
                .port(settings.port)
                .timeout(Some(settings.timeout));

            if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
                builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
            }

            info!(
                host = %settings.host,
                port = settings.port,
                security = ?settings.security,
                "SMTP channel initialized"
            );

            Ok(Self {
                transport: builder.build(),
                from,
            })
        }

        fn message(&self, content: &NotificationContent) -> Result<Message, DeliveryError> {
            let address: Address = content
                .recipient
                .email
                .parse()
                .map_err(|e: lettre::address::AddressError| DeliveryError::Rejected(e.to_string()))?;
            let to = Mailbox::new(Some(content.recipient.name.clone()), address);

            let builder = Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(content.subject.clone());

            let message = match &content.body_html {
                Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                    content.body_text.clone(),
                    html.clone(),
                )),
                None => builder
                    .header(ContentType::TEXT_PLAIN)
                    .body(content.body_text.clone()),
            };
            message.map_err(|e| DeliveryError::Rejected(e.to_string()))
        }
    }

    #[async_trait]
    impl DeliveryChannel for SmtpChannel {
        async fn send(&self, content: &NotificationContent) -> Result<(), DeliveryError> {
            let message = self.message(content)?;

            debug!(
                to = %mask_email(&content.recipient.email),
                subject = %content.subject,
                "Sending notification via SMTP"
            );

            self.transport.send(message).await.map_err(|e| {
                if e.is_permanent() {
                    DeliveryError::Rejected(e.to_string())
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "smtp"
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Recipient;

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("jane@example.com"), "j**e@example.com");
        assert_eq!(mask_email("abc@x.io"), "a*c@x.io");
        assert_eq!(mask_email("ab@x.io"), "ab@x.io");
        assert_eq!(mask_email("not-an-address"), "not-an-address");
    }

    #[tokio::test]
    async fn test_log_channel_succeeds() {
        let channel = LogChannel::new();
        let content = NotificationContent {
            recipient: Recipient::new("jane@example.com", "Jane"),
            subject: "Hi".to_string(),
            body_text: "Body".to_string(),
            body_html: None,
        };

        assert!(channel.send(&content).await.is_ok());
        assert_eq!(channel.name(), "log");
    }
}
