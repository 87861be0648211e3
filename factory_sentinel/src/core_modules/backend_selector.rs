// THEORY:
// The `BackendSelector` isolates the volatility of classifier backends from
// the rest of the system. Backend names get deprecated, quotas run out and
// regions lose access; the selector turns all of that into automatic
// degradation instead of a hard failure.
//
// It is a small state machine over an ordered, fixed catalog:
//
//   Unvalidated --first use--> Active(0..N)   (first candidate that answers a probe)
//   Unvalidated --first use--> Exhausted      (nothing answered: fatal)
//   Active(i)   --backend error--> Active(i+1 mod N), same frame retried
//
// A single frame gets at most N attempts. Once a backend works, the pointer
// stays there, so later frames go straight to it without re-probing.
// The selector is the only owner and writer of the "current backend" pointer.

use crate::core_modules::classifier::{Classifier, PROBE_PROMPT};
use crate::error::{BackendError, ConfigurationError, SelectionError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Preference patterns applied to discovered backend names, best first.
pub const DEFAULT_PREFERENCES: &[&str] = &["gemini-2.0-flash", "gemini-1.5-flash", "gemini-1.5-pro"];

/// Names containing this marker rank after every other match of the same pattern.
const DEMOTED_MARKER: &str = "lite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCandidate {
    pub identifier: String,
    pub priority: usize,
}

/// The ordered list of candidate backends known at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCatalog {
    candidates: Vec<BackendCandidate>,
}

impl BackendCatalog {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let candidates = identifiers
            .into_iter()
            .map(Into::into)
            .map(|id: String| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .enumerate()
            .map(|(priority, identifier)| BackendCandidate { identifier, priority })
            .collect();
        Self { candidates }
    }

    /// Builds a catalog from the service's own list, ordered by `preferences`.
    /// Falls back to `fallback` when listing fails or yields nothing.
    pub async fn discover(classifier: &dyn Classifier, preferences: &[&str], fallback: BackendCatalog) -> Self {
        match classifier.list_backends().await {
            Ok(listed) => {
                let ranked = rank_by_preference(listed, preferences);
                if ranked.is_empty() {
                    warn!("backend discovery returned nothing, using static catalog");
                    fallback
                } else {
                    info!(count = ranked.len(), first = %ranked[0], "discovered backends");
                    BackendCatalog::new(ranked)
                }
            }
            Err(e) => {
                warn!(error = %e, "backend discovery failed, using static catalog");
                fallback
            }
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BackendCandidate> {
        self.candidates.get(index)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(|c| c.identifier.as_str())
    }
}

/// Strips a `models/` prefix and orders names matching a preference by that
/// preference. Every other name follows in listed order.
fn rank_by_preference(listed: Vec<String>, preferences: &[&str]) -> Vec<String> {
    let names: Vec<String> = listed
        .into_iter()
        .map(|name| name.trim().trim_start_matches("models/").to_string())
        .filter(|name| !name.is_empty())
        .collect();

    let mut matched: Vec<(usize, bool, usize, String)> = names
        .iter()
        .enumerate()
        .filter_map(|(position, name)| {
            preferences
                .iter()
                .position(|pattern| name.contains(pattern))
                .map(|rank| (rank, name.contains(DEMOTED_MARKER), position, name.clone()))
        })
        .collect();

    matched.sort();
    let mut ranked: Vec<String> = matched.into_iter().map(|(_, _, _, name)| name).collect();
    for name in names {
        if !ranked.contains(&name) {
            ranked.push(name);
        }
    }
    ranked
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Unvalidated,
    Active(usize),
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorStats {
    pub probe_failures: u64,
    pub failovers: u64,
    pub successes: u64,
}

/// A successful reply and the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub backend: String,
    pub reply: String,
}

pub struct BackendSelector {
    classifier: Arc<dyn Classifier>,
    catalog: BackendCatalog,
    state: SelectorState,
    probe_on_first_use: bool,
    call_timeout: Option<Duration>,
    stats: SelectorStats,
}

impl BackendSelector {
    pub fn new(classifier: Arc<dyn Classifier>, catalog: BackendCatalog) -> Self {
        Self {
            classifier,
            catalog,
            state: SelectorState::Unvalidated,
            probe_on_first_use: true,
            call_timeout: None,
            stats: SelectorStats::default(),
        }
    }

    /// When disabled, first use activates the first candidate without probing.
    pub fn with_probing(mut self, probe: bool) -> Self {
        self.probe_on_first_use = probe;
        self
    }

    /// Bounds every probe and classification call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn stats(&self) -> SelectorStats {
        self.stats
    }

    pub fn catalog(&self) -> &BackendCatalog {
        &self.catalog
    }

    pub fn current(&self) -> Option<&BackendCandidate> {
        match self.state {
            SelectorState::Active(i) => self.catalog.get(i),
            _ => None,
        }
    }

    /// Moves out of `Unvalidated`. Idempotent once validated.
    ///
    /// Probe failures are logged and counted, never raised. Finding no viable
    /// candidate moves the selector to `Exhausted` and is fatal.
    pub async fn initialize(&mut self) -> Result<&BackendCandidate, ConfigurationError> {
        match self.state {
            SelectorState::Active(i) => {
                return self.catalog.get(i).ok_or(ConfigurationError::EmptyCatalog);
            }
            SelectorState::Exhausted => {
                return Err(ConfigurationError::NoViableBackend { tried: self.catalog.len() });
            }
            SelectorState::Unvalidated => {}
        }

        if self.catalog.is_empty() {
            self.state = SelectorState::Exhausted;
            return Err(ConfigurationError::EmptyCatalog);
        }

        if !self.probe_on_first_use {
            self.state = SelectorState::Active(0);
            return self.catalog.get(0).ok_or(ConfigurationError::EmptyCatalog);
        }

        for index in 0..self.catalog.len() {
            let Some(candidate) = self.catalog.get(index) else { break };
            debug!(backend = %candidate.identifier, "probing backend");
            let outcome = bounded(self.call_timeout, self.classifier.probe(&candidate.identifier)).await;
            match outcome {
                Ok(()) => {
                    info!(backend = %candidate.identifier, "backend alive");
                    self.state = SelectorState::Active(index);
                    return self.catalog.get(index).ok_or(ConfigurationError::EmptyCatalog);
                }
                Err(e) => {
                    self.stats.probe_failures += 1;
                    warn!(backend = %candidate.identifier, error = %e, "backend probe failed");
                }
            }
        }

        self.state = SelectorState::Exhausted;
        Err(ConfigurationError::NoViableBackend { tried: self.catalog.len() })
    }

    /// Classifies one frame, failing over across the catalog.
    ///
    /// Each backend error advances the pointer and retries the same frame on
    /// the next candidate, for at most N attempts in total.
    pub async fn classify(&mut self, image_jpeg: &[u8], prompt: &str) -> Result<Classification, SelectionError> {
        self.initialize().await?;
        let SelectorState::Active(start) = self.state else {
            return Err(ConfigurationError::NoViableBackend { tried: self.catalog.len() }.into());
        };

        let attempts = self.catalog.len();
        let mut index = start;
        let mut last_error = BackendError::EmptyReply;

        for attempt in 1..=attempts {
            let Some(candidate) = self.catalog.get(index) else { break };
            let backend = candidate.identifier.clone();
            debug!(backend = %backend, attempt, "submitting frame");

            let outcome = bounded(self.call_timeout, self.classifier.classify(&backend, image_jpeg, prompt)).await;
            match outcome {
                Ok(reply) if reply.trim().is_empty() => {
                    last_error = BackendError::EmptyReply;
                    warn!(backend = %backend, "backend returned an empty reply");
                }
                Ok(reply) => {
                    self.state = SelectorState::Active(index);
                    self.stats.successes += 1;
                    return Ok(Classification { backend, reply });
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, "classification failed");
                    last_error = e;
                }
            }

            index = (index + 1) % attempts;
            self.state = SelectorState::Active(index);
            self.stats.failovers += 1;
            if let Some(next) = self.catalog.get(index) {
                if attempt < attempts {
                    info!(from = %backend, to = %next.identifier, "switching backend");
                }
            }
        }

        Err(SelectionError::Exhausted {
            attempts,
            last: last_error,
        })
    }
}

async fn bounded<T, F>(limit: Option<Duration>, call: F) -> Result<T, BackendError>
where
    F: std::future::Future<Output = Result<T, BackendError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(BackendError::Timeout(limit))),
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Answers only for backends in `alive`; records every call.
    struct ScriptedClassifier {
        alive: Mutex<HashSet<String>>,
        reply: String,
        calls: Mutex<Vec<String>>,
        probes: Mutex<Vec<String>>,
        listed: Option<Vec<String>>,
    }

    impl ScriptedClassifier {
        fn new(alive: &[&str]) -> Self {
            Self {
                alive: Mutex::new(alive.iter().map(|s| s.to_string()).collect()),
                reply: r#"{"status":"SAFE","confidence":98}"#.to_string(),
                calls: Mutex::new(Vec::new()),
                probes: Mutex::new(Vec::new()),
                listed: None,
            }
        }

        fn is_alive(&self, backend: &str) -> bool {
            self.alive.lock().unwrap().contains(backend)
        }

        fn kill(&self, backend: &str) {
            self.alive.lock().unwrap().remove(backend);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Classifier for ScriptedClassifier {
        fn classify<'a>(
            &'a self,
            backend: &'a str,
            _image_jpeg: &'a [u8],
            _prompt: &'a str,
        ) -> BoxFuture<'a, Result<String, BackendError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(backend.to_string());
                if self.is_alive(backend) {
                    Ok(self.reply.clone())
                } else {
                    Err(BackendError::NotFound(backend.to_string()))
                }
            })
        }

        fn probe<'a>(&'a self, backend: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
            Box::pin(async move {
                self.probes.lock().unwrap().push(backend.to_string());
                if self.is_alive(backend) {
                    Ok(())
                } else {
                    Err(BackendError::Quota(backend.to_string()))
                }
            })
        }

        fn list_backends(&self) -> BoxFuture<'_, Result<Vec<String>, BackendError>> {
            Box::pin(async move { self.listed.clone().ok_or(BackendError::Unsupported) })
        }
    }

    fn catalog() -> BackendCatalog {
        BackendCatalog::new(["alpha", "beta", "gamma"])
    }

    #[tokio::test]
    async fn probing_activates_first_responsive_backend() {
        let classifier = Arc::new(ScriptedClassifier::new(&["gamma"]));
        let mut selector = BackendSelector::new(classifier.clone(), catalog());

        let active = selector.initialize().await.unwrap().identifier.clone();

        assert_eq!(active, "gamma");
        assert_eq!(selector.state(), SelectorState::Active(2));
        assert_eq!(selector.stats().probe_failures, 2);
    }

    #[tokio::test]
    async fn no_viable_backend_is_fatal() {
        let classifier = Arc::new(ScriptedClassifier::new(&[]));
        let mut selector = BackendSelector::new(classifier, catalog());

        let err = selector.initialize().await.unwrap_err();

        assert!(matches!(err, ConfigurationError::NoViableBackend { tried: 3 }));
        assert_eq!(selector.state(), SelectorState::Exhausted);
        assert!(matches!(
            selector.classify(b"jpeg", "prompt").await,
            Err(SelectionError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn empty_catalog_is_fatal() {
        let classifier = Arc::new(ScriptedClassifier::new(&["alpha"]));
        let mut selector = BackendSelector::new(classifier, BackendCatalog::new(Vec::<String>::new()));
        assert!(matches!(selector.initialize().await, Err(ConfigurationError::EmptyCatalog)));
    }

    #[tokio::test]
    async fn failover_reaches_kth_backend_then_sticks() {
        let classifier = Arc::new(ScriptedClassifier::new(&["gamma"]));
        let mut selector = BackendSelector::new(classifier.clone(), catalog()).with_probing(false);

        let first = selector.classify(b"jpeg", "prompt").await.unwrap();
        assert_eq!(first.backend, "gamma");
        assert_eq!(classifier.calls(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(selector.state(), SelectorState::Active(2));

        selector.classify(b"jpeg", "prompt").await.unwrap();
        assert_eq!(classifier.calls(), vec!["alpha", "beta", "gamma", "gamma"]);
        assert_eq!(selector.stats().failovers, 2);
    }

    #[tokio::test]
    async fn failover_wraps_around_the_catalog() {
        let classifier = Arc::new(ScriptedClassifier::new(&["alpha", "beta", "gamma"]));
        let mut selector = BackendSelector::new(classifier.clone(), catalog()).with_probing(false);
        selector.classify(b"jpeg", "prompt").await.unwrap();

        // Move to gamma, then lose it: the next frame should wrap to alpha.
        classifier.kill("alpha");
        classifier.kill("beta");
        selector.classify(b"jpeg", "prompt").await.unwrap();
        assert_eq!(selector.current().unwrap().identifier, "gamma");

        classifier.alive.lock().unwrap().insert("alpha".into());
        classifier.kill("gamma");
        let reply = selector.classify(b"jpeg", "prompt").await.unwrap();
        assert_eq!(reply.backend, "alpha");
    }

    #[tokio::test]
    async fn all_backends_failing_gives_up_after_n_attempts() {
        let classifier = Arc::new(ScriptedClassifier::new(&["beta"]));
        let mut selector = BackendSelector::new(classifier.clone(), catalog());
        selector.initialize().await.unwrap();
        classifier.kill("beta");

        let err = selector.classify(b"jpeg", "prompt").await.unwrap_err();

        assert!(matches!(err, SelectionError::Exhausted { attempts: 3, .. }));
        assert_eq!(classifier.calls(), vec!["beta", "gamma", "alpha"]);
        assert_eq!(selector.state(), SelectorState::Active(1));
    }

    #[tokio::test]
    async fn probes_are_not_repeated_per_frame() {
        let classifier = Arc::new(ScriptedClassifier::new(&["beta"]));
        let mut selector = BackendSelector::new(classifier.clone(), catalog());
        for _ in 0..3 {
            selector.classify(b"jpeg", "prompt").await.unwrap();
        }
        assert_eq!(classifier.probes.lock().unwrap().len(), 2);
        assert_eq!(classifier.calls(), vec!["beta", "beta", "beta"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_times_out_and_fails_over() {
        struct Hanging;
        impl Classifier for Hanging {
            fn classify<'a>(
                &'a self,
                backend: &'a str,
                _image_jpeg: &'a [u8],
                _prompt: &'a str,
            ) -> BoxFuture<'a, Result<String, BackendError>> {
                Box::pin(async move {
                    if backend == "slow" {
                        futures::future::pending::<()>().await;
                    }
                    Ok(r#"{"status":"SAFE"}"#.to_string())
                })
            }
            fn probe<'a>(&'a self, _backend: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
                Box::pin(async { Ok(()) })
            }
        }

        let mut selector = BackendSelector::new(Arc::new(Hanging), BackendCatalog::new(["slow", "fast"]))
            .with_probing(false)
            .with_timeout(Duration::from_secs(5));

        let reply = selector.classify(b"jpeg", "prompt").await.unwrap();
        assert_eq!(reply.backend, "fast");
    }

    #[tokio::test]
    async fn discovery_orders_by_preference_and_falls_back() {
        let mut classifier = ScriptedClassifier::new(&[]);
        classifier.listed = Some(vec![
            "models/gemma-3-27b-it".into(),
            "models/gemini-1.5-flash-001".into(),
            "models/gemini-2.0-flash-lite".into(),
            "models/gemini-2.0-flash".into(),
        ]);
        let fallback = BackendCatalog::new(["static"]);

        let discovered = BackendCatalog::discover(&classifier, DEFAULT_PREFERENCES, fallback.clone()).await;
        let ids: Vec<&str> = discovered.identifiers().collect();
        assert_eq!(
            ids,
            vec!["gemini-2.0-flash", "gemini-2.0-flash-lite", "gemini-1.5-flash-001", "gemma-3-27b-it"]
        );

        classifier.listed = None;
        let discovered = BackendCatalog::discover(&classifier, DEFAULT_PREFERENCES, fallback.clone()).await;
        assert_eq!(discovered, fallback);
    }

    #[test]
    fn unmatched_listing_is_kept_as_last_resort() {
        let ranked = rank_by_preference(vec!["models/other-vision".into()], DEFAULT_PREFERENCES);
        assert_eq!(ranked, vec!["other-vision"]);
    }

    #[test]
    fn unmatched_names_follow_preferred_ones_in_listed_order() {
        let ranked = rank_by_preference(
            vec![
                "models/zeta-vision".into(),
                "models/gemini-1.5-pro-002".into(),
                "models/alpha-vision".into(),
            ],
            DEFAULT_PREFERENCES,
        );
        assert_eq!(ranked, vec!["gemini-1.5-pro-002", "zeta-vision", "alpha-vision"]);
    }

    #[test]
    fn catalog_assigns_priorities_in_order() {
        let catalog = BackendCatalog::new([" a ", "", "b"]);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(1), Some(&BackendCandidate { identifier: "b".into(), priority: 1 }));
    }
}
