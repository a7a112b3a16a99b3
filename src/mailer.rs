//! Mail Notification Module
//!
//! Fire-and-forget notifications for key creation and key retrieval events.
//! Delivery happens on a background thread so an unreachable mail agent never
//! delays an RPC reply; an incomplete mail configuration simply disables
//! notifications.

use crate::sysconfig::Sysconfig;
use anyhow::{anyhow, bail, Context, Result};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::thread;
use tracing::warn;

pub const SRV_CONF_MAIL_RECIPIENTS: &str = "EMAIL_RECIPIENTS";
pub const SRV_CONF_MAIL_FROM_ADDR: &str = "EMAIL_FROM_ADDRESS";
pub const SRV_CONF_MAIL_AGENT_AND_PORT: &str = "EMAIL_AGENT_AND_PORT";
pub const SRV_CONF_MAIL_AGENT_USERNAME: &str = "EMAIL_AGENT_USERNAME";
pub const SRV_CONF_MAIL_AGENT_PASSWORD: &str = "EMAIL_AGENT_PASSWORD";

/// Return true only if the address carries an at-sign.
pub fn is_mail_address_complete(addr: &str) -> bool {
    addr.contains('@')
}

/// Parameters for sending notification emails.
#[derive(Debug, Clone, Default)]
pub struct Mailer {
    /// Email addresses that receive notifications.
    pub recipients: Vec<String>,
    /// FROM address of the notifications.
    pub from_address: String,
    /// Address and port number of the mail transportation agent.
    pub agent_address_port: String,
    /// Optional username for plain authentication.
    pub auth_username: String,
    /// Optional password for plain authentication.
    pub auth_password: String,
}

impl Mailer {
    /// Read mail settings from keys in a sysconfig file.
    pub fn from_sysconfig(sysconf: &Sysconfig) -> Mailer {
        Mailer {
            recipients: sysconf.get_string_array(SRV_CONF_MAIL_RECIPIENTS),
            from_address: sysconf.get_string(SRV_CONF_MAIL_FROM_ADDR, ""),
            agent_address_port: sysconf.get_string(SRV_CONF_MAIL_AGENT_AND_PORT, ""),
            auth_username: sysconf.get_string(SRV_CONF_MAIL_AGENT_USERNAME, ""),
            auth_password: sysconf.get_string(SRV_CONF_MAIL_AGENT_PASSWORD, ""),
        }
    }

    /// Return an error unless all mandatory mail parameters are present and
    /// plausible.
    pub fn validate_config(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.recipients.is_empty() {
            problems.push("recipient address is empty".to_string());
        } else {
            for addr in &self.recipients {
                if !is_mail_address_complete(addr) {
                    problems.push(format!("recipient address \"{}\" must contain an at-sign", addr));
                }
            }
        }
        if self.from_address.is_empty() {
            problems.push("mail-from address is empty".to_string());
        } else if !is_mail_address_complete(&self.from_address) {
            problems.push(format!(
                "mail-from address \"{}\" must contain an at-sign",
                self.from_address
            ));
        }
        match self.agent_address_port.split_once(':') {
            None => problems.push(format!(
                "mail agent \"{}\" must contain address and port number",
                self.agent_address_port
            )),
            Some((_, port)) => {
                if port.parse::<u16>().is_err() {
                    problems.push(format!(
                        "failed to parse port number from \"{}\"",
                        self.agent_address_port
                    ));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            bail!("{}", problems.join("; "))
        }
    }

    /// Deliver an email to all recipients, blocking until the mail agent has
    /// taken it.
    pub fn send(&self, subject: &str, text: &str) -> Result<()> {
        if self.recipients.is_empty() {
            bail!("no recipient specified for mail \"{}\"", subject);
        }
        let (host, port) = self
            .agent_address_port
            .split_once(':')
            .ok_or_else(|| anyhow!("mail agent \"{}\" lacks a port", self.agent_address_port))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("failed to parse mail agent port from \"{}\"", self.agent_address_port))?;
        let mut message = Message::builder()
            .from(self.from_address.parse().context("failed to parse mail-from address")?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            message = message.to(recipient
                .parse()
                .with_context(|| format!("failed to parse recipient address \"{}\"", recipient))?);
        }
        let message = message.body(text.to_string()).context("failed to assemble mail")?;
        let mut transport = SmtpTransport::builder_dangerous(host).port(port);
        if !self.auth_username.is_empty() {
            transport = transport.credentials(Credentials::new(
                self.auth_username.clone(),
                self.auth_password.clone(),
            ));
        }
        transport
            .build()
            .send(&message)
            .with_context(|| format!("failed to deliver mail \"{}\"", subject))?;
        Ok(())
    }

    /// Deliver an email on a background thread; failures are only logged. A
    /// mailer with incomplete configuration sends nothing.
    pub fn send_in_background(&self, subject: &str, text: &str) {
        if self.validate_config().is_err() {
            return;
        }
        let mailer = self.clone();
        let subject = subject.to_string();
        let text = text.to_string();
        thread::spawn(move || {
            if let Err(err) = mailer.send(&subject, &text) {
                warn!("failed to send email notification \"{}\" - {:#}", subject, err);
            }
        });
    }
}
