use anyhow::{Context, Result};
use greeter_core::{EuclideanMatcher, Identifier, OnnxExtractor, RegistryCache};
use greeter_hw::{Camera, CameraOptions};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod dispatch;
mod identify;
mod notifier;
mod sampler;
mod session;
mod station;
#[cfg(test)]
mod testing;

use config::Config;
use dbus_interface::{StationCommand, StationService, BUS_NAME, OBJECT_PATH};
use dispatch::NotificationDispatcher;
use identify::IdentificationWorker;
use sampler::{FrameSampler, FrameSource};
use session::VerificationSession;
use station::Station;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "greeterd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = config.camera_index,
        registry = %config.registry_path.display(),
        threshold = config.match_threshold,
        checks_per_second = config.checks_per_second,
        "configuration loaded"
    );

    let registry = greeter_core::open_registry(&config.registry_path)
        .with_context(|| format!("failed to open registry {}", config.registry_path.display()))?;
    let cache = RegistryCache::load(registry.as_ref()).context("failed to load identity registry")?;

    let options = CameraOptions {
        width: config.frame_width,
        height: config.frame_height,
        timeout: config.capture_timeout(),
    };
    let sampler = match Camera::open(config.camera_index, &options) {
        Ok(camera) => {
            tracing::info!(
                device = %camera.device_path,
                width = camera.width,
                height = camera.height,
                format = ?camera.pixel_format(),
                "camera opened"
            );
            FrameSampler::new(camera).with_max_age(config.max_frame_age())
        }
        Err(e) => {
            tracing::error!(error = %e, "camera unavailable; verification disabled");
            FrameSampler::unavailable()
        }
    };

    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let extractor = OnnxExtractor::load(&scrfd_path, &arcface_path)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    tracing::info!(scrfd = %scrfd_path, arcface = %arcface_path, "face models loaded");

    let identifier = Identifier::new(extractor, EuclideanMatcher, config.match_threshold)
        .with_downscale(config.downscale);
    let worker = IdentificationWorker::spawn(identifier, config.check_period())
        .context("failed to start identification worker")?;
    let dispatcher = NotificationDispatcher::spawn(notifier::from_config(
        &config.speech_command,
        &config.greeting,
    ))
    .context("failed to start notification worker")?;

    let station = Station::new(
        sampler,
        VerificationSession::new(config.check_period(), config.unknown_name.clone()),
        worker,
        registry,
        cache,
        dispatcher,
    )
    .with_max_session(config.max_session());

    let (tx, rx) = mpsc::channel::<StationCommand>(8);
    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, StationService::new(tx))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "greeterd ready");

    run(station, rx, &config).await;
    Ok(())
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Scheduler loop: capture timer, session check timer, operator commands.
/// Returns after Ctrl-C or when the control channel closes.
async fn run<S: FrameSource>(
    mut station: Station<S>,
    mut commands: mpsc::Receiver<StationCommand>,
    config: &Config,
) {
    let mut capture = ticker(config.capture_period());
    let mut check = ticker(config.check_period());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = capture.tick() => station.on_capture_tick(),
            _ = check.tick(), if station.session_running() => {
                station.on_check_tick();
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                handle(&mut station, command, &mut check);
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    tracing::info!("greeterd shutting down");
    station.shutdown();
}

fn handle<S: FrameSource>(station: &mut Station<S>, command: StationCommand, check: &mut Interval) {
    match command {
        StationCommand::Verify { reply } => {
            let outcome = station.verify().map_err(|e| e.to_string());
            if outcome.is_ok() {
                // First check runs on the next loop turn.
                check.reset_immediately();
            }
            let _ = reply.send(outcome);
        }
        StationCommand::Cancel { reply } => {
            let _ = reply.send(station.cancel());
        }
        StationCommand::Status { reply } => {
            let _ = reply.send(station.status().to_string());
        }
        StationCommand::Reload { reply } => {
            let outcome = station.reload().map_err(|e| {
                tracing::warn!(error = %e, "registry reload failed; keeping current snapshot");
                e.to_string()
            });
            if let Ok(count) = outcome {
                tracing::info!(identities = count, "registry reloaded");
            }
            let _ = reply.send(outcome);
        }
    }
}
