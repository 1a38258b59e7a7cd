//! Message rendering for OTP delivery.

use lendo_core::service::ServiceName;
use serde::{Deserialize, Serialize};

/// Which flow requested the code; selects wording only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateType {
    Login,
    Registration,
    PasswordReset,
}

impl TemplateType {
    fn purpose(&self) -> &'static str {
        match self {
            TemplateType::Login => "login",
            TemplateType::Registration => "registration",
            TemplateType::PasswordReset => "password reset",
        }
    }
}

/// A rendered message; `subject` is ignored by the WhatsApp channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Render the OTP message for a channel.
pub fn render(
    template: TemplateType,
    channel: ServiceName,
    user_name: &str,
    code: &str,
) -> RenderedMessage {
    let purpose = template.purpose();
    match channel {
        ServiceName::Whatsapp => RenderedMessage {
            subject: String::new(),
            body: format!(
                "Hi {user_name}, your {purpose} verification code is *{code}*. \
                 It expires in 10 minutes. Do not share it with anyone."
            ),
        },
        ServiceName::Email => RenderedMessage {
            subject: format!("Your {purpose} verification code"),
            body: format!(
                "Hi {user_name},\n\n\
                 Your {purpose} verification code is {code}. It expires in \
                 10 minutes.\n\n\
                 If you did not request this code, you can ignore this email."
            ),
        },
    }
}
