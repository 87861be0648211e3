// THEORY:
// The `AlertDispatcher` turns a DANGER verdict into side effects on three
// independent channels, each with its own trigger policy:
//
// 1.  **Speech**: every DANGER verdict, no cooldown. Spawned on the blocking
//     pool and never awaited; errors and panics stay inside the task.
// 2.  **Incident log**: every DANGER verdict, no cooldown. One entry appended
//     to the State Store's history.
// 3.  **Notification** (SMS): optional, gated by a cooldown measured from the
//     last *confirmed* send. A failed send does not move the clock, so a
//     transport hiccup cannot silence the channel for a whole window.
//
// A failure on one channel never affects the others. SAFE verdicts produce no
// alert activity at all.

use crate::core_modules::channels::{NotificationRoute, Notifier, Speaker};
use crate::core_modules::state_store::{IncidentEntry, StateStore};
use crate::core_modules::verdict::Verdict;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_NOTIFICATION_COOLDOWN: Duration = Duration::from_secs(60);
/// Upper bound on one send; expiry counts as a failed send.
pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// The rate-limited external notification channel.
pub struct NotificationChannel {
    transport: Box<dyn Notifier>,
    route: NotificationRoute,
    cooldown: Duration,
    send_timeout: Duration,
    last_sent: Option<Instant>,
}

impl NotificationChannel {
    pub fn new(transport: Box<dyn Notifier>, route: NotificationRoute, cooldown: Duration) -> Self {
        Self {
            transport,
            route,
            cooldown,
            send_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            last_sent: None,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Time left before another send is allowed, if any.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_sent?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    async fn notify(&mut self, body: &str, now: Instant) -> NotificationOutcome {
        if let Some(remaining) = self.cooldown_remaining(now) {
            return NotificationOutcome::Suppressed { remaining };
        }
        let send = self.transport.send(body, &self.route.from, &self.route.to);
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(())) => {
                self.last_sent = Some(now);
                NotificationOutcome::Sent
            }
            Ok(Err(e)) => {
                warn!(error = %e, "notification send failed");
                NotificationOutcome::Failed
            }
            Err(_) => {
                warn!(timeout_secs = self.send_timeout.as_secs_f64(), "notification send timed out");
                NotificationOutcome::Failed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// No transport configured.
    Disabled,
    /// The verdict was SAFE.
    NotApplicable,
    Suppressed { remaining: Duration },
    Sent,
    Failed,
}

/// What the dispatcher did for one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub speech_spawned: bool,
    pub incident_logged: bool,
    pub notification: NotificationOutcome,
}

impl DispatchReport {
    fn quiet(notification: NotificationOutcome) -> Self {
        Self {
            speech_spawned: false,
            incident_logged: false,
            notification,
        }
    }
}

pub struct AlertDispatcher {
    speaker: Option<Arc<dyn Speaker>>,
    store: StateStore,
    notifications: Option<NotificationChannel>,
    location: String,
}

impl AlertDispatcher {
    pub fn new(store: StateStore, location: impl Into<String>) -> Self {
        Self {
            speaker: None,
            store,
            notifications: None,
            location: location.into(),
        }
    }

    pub fn with_speaker(mut self, speaker: Arc<dyn Speaker>) -> Self {
        self.speaker = Some(speaker);
        self
    }

    pub fn with_notifications(mut self, channel: NotificationChannel) -> Self {
        self.notifications = Some(channel);
        self
    }

    pub fn notifications(&self) -> Option<&NotificationChannel> {
        self.notifications.as_ref()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Fans a verdict out to the alert channels. `now` drives the
    /// notification cooldown.
    pub async fn dispatch(&mut self, verdict: &Verdict, now: Instant) -> DispatchReport {
        if !verdict.is_danger() {
            let notification = match self.notifications {
                Some(_) => NotificationOutcome::NotApplicable,
                None => NotificationOutcome::Disabled,
            };
            return DispatchReport::quiet(notification);
        }

        let issue = verdict.issue().unwrap_or(crate::core_modules::verdict::UNKNOWN_ISSUE);
        info!(issue = %issue, confidence = ?verdict.confidence(), "DANGER verdict");

        let speech_spawned = self.speak(issue);
        let incident_logged = self.log_incident(issue);
        let notification = match self.notifications.as_mut() {
            Some(channel) => {
                let body = format!("FACTORY ALERT: {issue} ({})", self.location);
                let outcome = channel.notify(&body, now).await;
                match outcome {
                    NotificationOutcome::Sent => info!("notification sent"),
                    NotificationOutcome::Suppressed { remaining } => {
                        debug!(remaining_secs = remaining.as_secs(), "notification suppressed by cooldown")
                    }
                    _ => {}
                }
                outcome
            }
            None => NotificationOutcome::Disabled,
        };

        DispatchReport {
            speech_spawned,
            incident_logged,
            notification,
        }
    }

    fn speak(&self, issue: &str) -> bool {
        let Some(speaker) = self.speaker.clone() else {
            return false;
        };
        let text = format!("Alert! Violation detected. {issue}");
        // Detached: the handle is dropped, so panics and errors end here.
        drop(tokio::task::spawn_blocking(move || {
            if let Err(e) = speaker.speak(&text) {
                debug!(error = %e, "speech alert dropped");
            }
        }));
        true
    }

    fn log_incident(&self, issue: &str) -> bool {
        let entry = IncidentEntry::now(issue, self.location.clone());
        match self.store.append_incident(&entry) {
            Ok(count) => {
                debug!(count, "incident recorded");
                true
            }
            Err(e) => {
                error!(error = %e, issue = %issue, "failed to record incident");
                false
            }
        }
    }
}
