// Seams for the two external alert channels. Both are best-effort: the
// dispatcher absorbs every `ChannelError` they return.

use crate::error::ChannelError;
use futures::future::BoxFuture;

/// Renders text as audible speech. Blocking; always called off the main loop.
pub trait Speaker: Send + Sync + 'static {
    fn speak(&self, text: &str) -> Result<(), ChannelError>;
}

/// An external notification transport such as SMS.
pub trait Notifier: Send + Sync {
    fn send<'a>(
        &'a self,
        body: &'a str,
        from: &'a str,
        to: &'a str,
    ) -> BoxFuture<'a, Result<(), ChannelError>>;
}

/// Sender and recipient identifiers for the notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRoute {
    pub from: String,
    pub to: String,
}
