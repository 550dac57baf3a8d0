//! Notification content generation.
//!
//! Maps a [`NotificationPayload`] to the message that gets delivered. Custom
//! messages pass through verbatim; structured sign-in events are rendered
//! through built-in Handlebars templates. Rendering is pure: the same payload
//! always produces the same content.

use crate::error::{QueueError, QueueResult};
use crate::job::{NotificationPayload, Recipient, SignInDetails};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;

const SIGNIN_SUBJECT: &str = "New sign-in to your account";

const SIGNIN_TEXT: &str = "\
Hello {{name}},

Your account was just signed into.

Sign-in details:
------------------------------------
Email:    {{email}}
Provider: {{provider}}
Address:  {{origin}}
Client:   {{client}}
Time:     {{time}}
------------------------------------

If this was not you, contact us immediately.

Thank you";

const SIGNIN_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <style>
    body { font-family: Arial, sans-serif; line-height: 1.6; color: #333; }
    .container { max-width: 600px; margin: 0 auto; padding: 20px; }
    .info-box { background: #fff; padding: 20px; border-left: 4px solid #667eea; margin: 20px 0; }
    .info-label { font-weight: bold; width: 120px; color: #667eea; }
    .warning { background: #fff3cd; border-left: 4px solid #ffc107; padding: 15px; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Sign-in notification</h1>
    <p>Hello <strong>{{name}}</strong>,</p>
    <p>Your account was just signed into.</p>
    <div class="info-box">
      <div><span class="info-label">Email:</span> {{email}}</div>
      <div><span class="info-label">Provider:</span> {{provider}}</div>
      <div><span class="info-label">Address:</span> {{origin}}</div>
      <div><span class="info-label">Client:</span> {{client}}</div>
      <div><span class="info-label">Time:</span> {{time}}</div>
    </div>
    <div class="warning">
      <strong>Warning:</strong> If this was not you, contact us immediately.
    </div>
  </div>
</body>
</html>"#;

/// Client descriptor length kept in the plain-text body.
const TEXT_CLIENT_LIMIT: usize = 50;
/// Client descriptor length kept in the HTML body.
const HTML_CLIENT_LIMIT: usize = 80;

/// Message ready for a delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub recipient: Recipient,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

/// Renders notification content from job payloads.
pub struct ContentGenerator {
    text: Handlebars<'static>,
    html: Handlebars<'static>,
}

impl ContentGenerator {
    /// Create a generator with the built-in templates registered.
    pub fn new() -> QueueResult<Self> {
        let mut text = Handlebars::new();
        text.set_strict_mode(true);
        text.register_escape_fn(handlebars::no_escape);
        text.register_template_string("signin", SIGNIN_TEXT)
            .map_err(|e| QueueError::Content(e.to_string()))?;

        let mut html = Handlebars::new();
        html.set_strict_mode(true);
        html.register_template_string("signin", SIGNIN_HTML)
            .map_err(|e| QueueError::Content(e.to_string()))?;

        Ok(Self { text, html })
    }

    /// Produce the message for a payload.
    pub fn generate(&self, payload: &NotificationPayload) -> QueueResult<NotificationContent> {
        match payload {
            NotificationPayload::Custom(message) => Ok(NotificationContent {
                recipient: message.recipient.clone(),
                subject: message.subject.clone(),
                body_text: message.body.clone(),
                body_html: None,
            }),
            NotificationPayload::Structured(details) => self.sign_in(details),
        }
    }

    fn sign_in(&self, details: &SignInDetails) -> QueueResult<NotificationContent> {
        let time = details
            .occurred_at
            .format("%B %-d, %Y %H:%M UTC")
            .to_string();

        let mut context = json!({
            "name": details.recipient.name,
            "email": details.recipient.email,
            "provider": details.provider,
            "origin": details.origin_address,
            "time": time,
            "client": truncate(&details.client_descriptor, TEXT_CLIENT_LIMIT),
        });
        let body_text = self
            .text
            .render("signin", &context)
            .map_err(|e| QueueError::Content(e.to_string()))?;

        context["client"] = json!(truncate(&details.client_descriptor, HTML_CLIENT_LIMIT));
        let body_html = self
            .html
            .render("signin", &context)
            .map_err(|e| QueueError::Content(e.to_string()))?;

        Ok(NotificationContent {
            recipient: details.recipient.clone(),
            subject: SIGNIN_SUBJECT.to_string(),
            body_text,
            body_html: Some(body_html),
        })
    }
}

/// Keep at most `limit` characters, marking the cut with `...`.
fn truncate(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_string(),
    }
}
