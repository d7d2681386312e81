use std::path::Path;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use pdhunt_core::PipelineError;
use tracing::info;

use crate::config::SmtpSettings;

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str, attachment: Option<&Path>) -> Result<(), PipelineError>;
}

fn config_error(message: impl Into<String>) -> PipelineError {
    PipelineError::Configuration(message.into())
}

fn parse_mailbox(raw: &str, what: &str) -> Result<Mailbox, PipelineError> {
    raw.parse::<Mailbox>()
        .map_err(|err| config_error(format!("invalid {what} address '{raw}': {err}")))
}

/// Emails the text summary with the workbook attached.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpNotifier {
    /// Validates settings without touching the network.
    pub fn from_settings(settings: &SmtpSettings) -> Result<Self, PipelineError> {
        let host = settings
            .host
            .as_deref()
            .ok_or_else(|| config_error("PDHUNT_SMTP_HOST is not set"))?;
        let username = settings
            .username
            .as_deref()
            .ok_or_else(|| config_error("PDHUNT_SMTP_USERNAME is not set"))?;
        let password = settings
            .password
            .as_deref()
            .ok_or_else(|| config_error("PDHUNT_SMTP_PASSWORD is not set"))?;
        if settings.recipients.is_empty() {
            return Err(config_error("PDHUNT_REPORT_RECIPIENTS is empty"));
        }

        let from = parse_mailbox(settings.from.as_deref().unwrap_or(username), "sender")?;
        let to = settings
            .recipients
            .iter()
            .map(|r| parse_mailbox(r, "recipient"))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|err| config_error(format!("invalid SMTP host '{host}': {err}")))?
            .credentials(Credentials::new(username.to_string(), password.to_string()));
        if let Some(port) = settings.port {
            builder = builder.port(port);
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    pub fn recipients(&self) -> &[Mailbox] {
        &self.to
    }

    fn message(&self, subject: &str, body: &str, attachment: Option<(String, Vec<u8>)>) -> Result<Message, PipelineError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let text = SinglePart::plain(body.to_string());
        let built = match attachment {
            Some((name, bytes)) => {
                let content_type = ContentType::parse(XLSX_CONTENT_TYPE)
                    .map_err(|err| PipelineError::Notification(err.to_string()))?;
                builder.multipart(
                    MultiPart::mixed()
                        .singlepart(text)
                        .singlepart(Attachment::new(name).body(bytes, content_type)),
                )
            }
            None => builder.singlepart(text),
        };
        built.map_err(|err| PipelineError::Notification(format!("building message: {err}")))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, subject: &str, body: &str, attachment: Option<&Path>) -> Result<(), PipelineError> {
        let attachment = match attachment {
            Some(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|err| PipelineError::Notification(format!("reading {}: {err}", path.display())))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "report.xlsx".to_string());
                Some((name, bytes))
            }
            None => None,
        };
        let message = self.message(subject, body, attachment)?;
        self.transport
            .send(message)
            .await
            .map_err(|err| PipelineError::Notification(format!("smtp send failed: {err}")))?;
        info!(recipients = self.to.len(), "report emailed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SmtpSettings {
        SmtpSettings {
            host: Some("smtp.example.org".to_string()),
            port: Some(2525),
            username: Some("bot@example.org".to_string()),
            password: Some("app-password".to_string()),
            from: None,
            recipients: vec!["me@example.org".to_string(), "Advisor <adv@example.org>".to_string()],
        }
    }

    #[test]
    fn missing_credentials_are_configuration_errors() {
        for broken in [
            SmtpSettings { host: None, ..settings() },
            SmtpSettings { password: None, ..settings() },
            SmtpSettings { recipients: Vec::new(), ..settings() },
        ] {
            let err = SmtpNotifier::from_settings(&broken).err().expect("must fail");
            assert!(matches!(err, PipelineError::Configuration(_)), "{err}");
        }
    }

    #[test]
    fn bad_recipient_is_rejected() {
        let broken = SmtpSettings {
            recipients: vec!["not an address".to_string()],
            ..settings()
        };
        assert!(matches!(
            SmtpNotifier::from_settings(&broken),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn message_carries_summary_and_workbook() {
        let notifier = SmtpNotifier::from_settings(&settings()).unwrap();
        assert_eq!(notifier.recipients().len(), 2);
        let message = notifier
            .message(
                "Postdoc report",
                "Stored postings: 3",
                Some(("PostdocSearch_2026-03-02_090000.xlsx".to_string(), b"PK\x03\x04".to_vec())),
            )
            .unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(raw.contains("Subject: Postdoc report"));
        assert!(raw.contains("Stored postings: 3"));
        assert!(raw.contains("PostdocSearch_2026-03-02_090000.xlsx"));
        assert!(raw.contains("From: bot@example.org"));
    }
}
