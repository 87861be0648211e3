mod gemini;
mod speech;
mod twilio;
#[cfg(feature = "video")]
mod video;

use anyhow::Context;
use clap::Parser;
use factory_sentinel::config::{DEFAULT_BACKENDS, DEFAULT_LOCATION, SentinelConfig};
use factory_sentinel::core_modules::backend_selector::{BackendCatalog, BackendSelector, DEFAULT_PREFERENCES};
use factory_sentinel::core_modules::classifier::Classifier;
use factory_sentinel::core_modules::dispatcher::{AlertDispatcher, NotificationChannel};
use factory_sentinel::core_modules::frame_source::ImageSequenceSource;
use factory_sentinel::core_modules::state_store::StateStore;
use factory_sentinel::error::ConfigurationError;
use factory_sentinel::pipeline::{ControlHandle, PipelineConfig, SentinelPipeline};
use gemini::GeminiClassifier;
use speech::{CommandSpeaker, DEFAULT_SPEECH_COMMAND, DEFAULT_SPEECH_RATE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use twilio::{TwilioCredentials, TwilioNotifier};

#[derive(Parser, Debug)]
#[command(name = "sentinel_runner", version, about = "Watches a camera feed and raises safety alerts")]
struct Args {
    /// Directory of still frames, or (with the `video` feature) a video file
    /// or webcam index.
    source: String,

    #[arg(long, env = "SENTINEL_INTERVAL_SECS", default_value_t = 5.0)]
    interval_secs: f64,

    /// Defaults to the analysis interval.
    #[arg(long, env = "SENTINEL_CLASSIFY_TIMEOUT_SECS")]
    classify_timeout_secs: Option<f64>,

    #[arg(long, default_value_t = 33)]
    frame_period_ms: u64,

    #[arg(long, default_value_t = 60)]
    sms_cooldown_secs: u64,

    #[arg(long, env = "SENTINEL_LOCATION", default_value = DEFAULT_LOCATION)]
    location: String,

    #[arg(long, env = "SENTINEL_STATE_DIR", default_value = ".")]
    state_dir: PathBuf,

    /// Candidate backends in priority order.
    #[arg(long = "backend", env = "SENTINEL_BACKENDS", value_delimiter = ',')]
    backends: Vec<String>,

    /// Skip the startup liveness probe.
    #[arg(long)]
    no_probe: bool,

    /// Ask the service which backends exist instead of trusting the list.
    #[arg(long)]
    discover: bool,

    #[arg(long, env = "SENTINEL_SPEECH_COMMAND", default_value = DEFAULT_SPEECH_COMMAND)]
    speech_command: String,

    #[arg(long)]
    no_speech: bool,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    #[arg(long, env = "TWILIO_ACCOUNT_SID", hide_env_values = true)]
    twilio_account_sid: Option<String>,

    #[arg(long, env = "TWILIO_AUTH_TOKEN", hide_env_values = true)]
    twilio_auth_token: Option<String>,

    #[arg(long, env = "TWILIO_PHONE_NUMBER")]
    twilio_phone_number: Option<String>,

    #[arg(long, env = "MY_PHONE_NUMBER")]
    alert_phone_number: Option<String>,
}

impl Args {
    fn sentinel_config(&self) -> Result<SentinelConfig, ConfigurationError> {
        let analysis_interval = seconds("interval_secs", self.interval_secs)?;
        let classify_timeout = match self.classify_timeout_secs {
            Some(secs) => seconds("classify_timeout_secs", secs)?,
            None => analysis_interval,
        };
        let backends = if self.backends.is_empty() {
            DEFAULT_BACKENDS.iter().map(|s| s.to_string()).collect()
        } else {
            self.backends.clone()
        };

        let config = SentinelConfig {
            analysis_interval,
            classify_timeout,
            frame_period: Duration::from_millis(self.frame_period_ms),
            notification_cooldown: Duration::from_secs(self.sms_cooldown_secs),
            location: self.location.clone(),
            state_dir: self.state_dir.clone(),
            backends,
            probe_backends: !self.no_probe,
            discover_backends: self.discover,
            ..SentinelConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn api_key(&self) -> Result<&str, ConfigurationError> {
        self.gemini_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ConfigurationError::Missing("GEMINI_API_KEY"))
    }

    fn twilio(&self) -> Option<TwilioCredentials> {
        TwilioCredentials::from_parts(
            self.twilio_account_sid.clone(),
            self.twilio_auth_token.clone(),
            self.twilio_phone_number.clone(),
            self.alert_phone_number.clone(),
        )
    }
}

fn seconds(name: &'static str, secs: f64) -> Result<Duration, ConfigurationError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigurationError::Invalid {
        name,
        reason: format!("{secs}: {e}"),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // --- 1. Argument Parsing & Validation ---
    let args = Args::parse();
    let config = args.sentinel_config()?;
    let classifier: Arc<dyn Classifier> = Arc::new(GeminiClassifier::new(args.api_key()?));

    // --- 2. Backend Catalog ---
    let mut catalog = BackendCatalog::new(config.backends.iter().cloned());
    if config.discover_backends {
        catalog = BackendCatalog::discover(classifier.as_ref(), DEFAULT_PREFERENCES, catalog).await;
    }
    info!(backends = ?catalog.identifiers().collect::<Vec<_>>(), "backend catalog");
    let selector = BackendSelector::new(classifier, catalog)
        .with_probing(config.probe_backends)
        .with_timeout(config.classify_timeout);

    // --- 3. Alert Channels & Hand-off Store ---
    let store = StateStore::new(&config.state_dir);
    let mut dispatcher = AlertDispatcher::new(store.clone(), config.location.clone());
    if !args.no_speech {
        dispatcher = dispatcher.with_speaker(Arc::new(CommandSpeaker::new(
            args.speech_command.clone(),
            DEFAULT_SPEECH_RATE,
        )));
    }
    match args.twilio() {
        Some(credentials) => {
            dispatcher = dispatcher.with_notifications(NotificationChannel::new(
                Box::new(TwilioNotifier::new(&credentials)?),
                credentials.route(),
                config.notification_cooldown,
            ));
        }
        None => warn!("twilio credentials incomplete, sms alerts disabled"),
    }

    // --- 4. Shutdown Wiring ---
    let (control, shutdown) = ControlHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            control.stop();
        }
    });

    // --- 5. Main Processing Loop ---
    let source = Path::new(&args.source);
    let pipeline_config = PipelineConfig::from(&config);
    if source.is_dir() {
        let frames = ImageSequenceSource::open(source)
            .with_context(|| format!("opening frame directory {}", source.display()))?;
        let mut pipeline = SentinelPipeline::new(pipeline_config, frames, selector, dispatcher, store);
        return finish(pipeline.run(shutdown).await?);
    }

    run_video(&args.source, pipeline_config, selector, dispatcher, store, shutdown).await
}

#[cfg(feature = "video")]
async fn run_video(
    source: &str,
    config: PipelineConfig,
    selector: BackendSelector,
    dispatcher: AlertDispatcher,
    store: StateStore,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let video = video::VideoSource::open(source)?;
    let mut pipeline = SentinelPipeline::new(config, video, selector, dispatcher, store);
    finish(pipeline.run(shutdown).await?)
}

#[cfg(not(feature = "video"))]
async fn run_video(
    source: &str,
    _config: PipelineConfig,
    _selector: BackendSelector,
    _dispatcher: AlertDispatcher,
    _store: StateStore,
    _shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    anyhow::bail!("{source} is not a directory; rebuild with --features video to read video files or cameras")
}

fn finish(stats: factory_sentinel::pipeline::PipelineStats) -> anyhow::Result<()> {
    info!(
        submissions = stats.submissions,
        verdicts = stats.verdicts,
        dangers = stats.dangers,
        "processing complete"
    );
    Ok(())
}
