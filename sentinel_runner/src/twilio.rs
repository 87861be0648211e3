// SMS notifications through the Twilio Messages API.

use factory_sentinel::core_modules::channels::{NotificationRoute, Notifier};
use factory_sentinel::error::ChannelError;
use futures::future::BoxFuture;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.twilio.com/2010-04-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_number: String,
}

impl TwilioCredentials {
    /// All four values must be present and non-blank, otherwise SMS stays off.
    pub fn from_parts(
        account_sid: Option<String>,
        auth_token: Option<String>,
        from_number: Option<String>,
        to_number: Option<String>,
    ) -> Option<Self> {
        let present = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Some(Self {
            account_sid: present(account_sid)?,
            auth_token: present(auth_token)?,
            from_number: present(from_number)?,
            to_number: present(to_number)?,
        })
    }

    pub fn route(&self) -> NotificationRoute {
        NotificationRoute {
            from: self.from_number.clone(),
            to: self.to_number.clone(),
        }
    }
}

pub struct TwilioNotifier {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
}

impl TwilioNotifier {
    pub fn new(credentials: &TwilioCredentials) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::Notification(format!("failed to build sms http client: {e}")))?;
        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            account_sid: credentials.account_sid.clone(),
            auth_token: credentials.auth_token.clone(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", self.api_base, self.account_sid)
    }
}

impl Notifier for TwilioNotifier {
    fn send<'a>(&'a self, body: &'a str, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.messages_url())
                .basic_auth(&self.account_sid, Some(&self.auth_token))
                .form(&[("Body", body), ("From", from), ("To", to)])
                .send()
                .await
                .map_err(|e| ChannelError::Notification(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(ChannelError::Notification(format!("HTTP {status}: {detail}")));
            }
            debug!(to = %to, "sms accepted");
            Ok(())
        })
    }
}
