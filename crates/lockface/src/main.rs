use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lockface_core::analyzer::RECOGNIZER_MODEL;
use lockface_core::{ArcFaceExtractor, Gallery, GalleryTrainer, OnnxAnalyzer, SharedGallery, TrainError, Trainer};
use lockface_hw::{Camera, CaptureSession, V4lOpener};
use lockface_store::{FsStore, PhotoStore, UserRegistry};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod operator;
mod recognition;
mod registration;
mod services;
mod session_lock;
mod slot;
mod training;
mod unlock;

#[cfg(test)]
mod testing;

use config::Config;
use operator::{Operator, TerminalOperator};
use recognition::{RecognitionController, RecognitionOutcome};
use registration::{RegistrationController, RegistrationOutcome};
use services::{Services, SharedAnalyzer};
use session_lock::LogindLockSignal;
use slot::SessionSlot;
use training::TrainingWorker;
use unlock::{CommandUnlocker, LogindUnlocker, Unlocker};

/// Upper bound on waiting for a background retrain before exiting.
const TRAINING_EXIT_WAIT: Duration = Duration::from_secs(120);
/// Upper bound on waiting for the unlock attempt before exiting.
const UNLOCK_EXIT_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "lockface", about = "Unlock a locked desktop session by recognising your face")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face photos for a user and train the model
    Register {
        /// User name (one identity per name)
        name: String,
    },
    /// Watch the session lock and unlock it when a registered face appears
    Recognize,
    /// Delete a user and all their photos, then retrain
    Delete {
        name: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// List registered users and their photo counts
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Retrain the model from stored photos
    Train,
    /// List V4L2 capture devices
    Devices,
}

#[derive(Serialize)]
struct UserSummary {
    name: String,
    photos: usize,
}

/// Storage and model handles shared by every subcommand.
struct App {
    config: Config,
    store: Arc<FsStore>,
    gallery: SharedGallery,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let store = FsStore::open(config.users_dir(), config.retention_policy())
            .with_context(|| format!("failed to open photo store at {}", config.users_dir().display()))?;
        let gallery = Gallery::load(&config.gallery_path)
            .with_context(|| format!("failed to load gallery {}", config.gallery_path.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
            gallery: gallery.shared(),
        })
    }

    fn trainer(&self) -> Result<Arc<dyn Trainer>> {
        let extractor = ArcFaceExtractor::load(&self.config.model_dir.join(RECOGNIZER_MODEL))?;
        Ok(Arc::new(GalleryTrainer::new(
            self.store.clone(),
            self.store.clone(),
            Box::new(extractor),
            self.config.gallery_path.clone(),
            self.gallery.clone(),
        )))
    }

    fn services(&self, operator: Arc<dyn Operator>) -> Result<Services> {
        let analyzer = OnnxAnalyzer::load(
            &self.config.model_dir,
            self.gallery.clone(),
            self.config.distance_threshold,
        )
        .context("failed to load face models")?;
        let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(analyzer)));

        let opener = V4lOpener::new(
            self.config.camera_device.clone(),
            self.config.camera_width,
            self.config.camera_height,
        );
        let camera = Arc::new(CaptureSession::new(Arc::new(opener), self.config.capture_config()));

        Ok(Services {
            store: self.store.clone(),
            registry: self.store.clone(),
            camera,
            analyzer,
            training: TrainingWorker::new(self.trainer()?),
            operator,
            slot: SessionSlot::new(),
        })
    }

    fn unlocker(&self) -> Result<Arc<dyn Unlocker>> {
        match &self.config.unlock_command {
            Some(command) => {
                tracing::info!(command = %command, "unlocking via command");
                Ok(Arc::new(CommandUnlocker::from_command_line(command)?))
            }
            None => Ok(Arc::new(
                LogindUnlocker::connect().context("failed to connect to logind for unlocking")?,
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Register { name } => register(App::open(config)?, name).await,
        Commands::Recognize => recognize(App::open(config)?).await,
        Commands::Delete { name, yes } => delete(App::open(config)?, &name, yes),
        Commands::List { json } => list(&App::open(config)?, json),
        Commands::Train => train(&App::open(config)?),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} (driver {}, bus {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(())
        }
    }
}

async fn register(app: App, name: String) -> Result<()> {
    let operator: Arc<dyn Operator> = Arc::new(TerminalOperator::new());
    let services = app.services(operator)?;
    let camera = services.camera.clone();
    let controller = RegistrationController::new(services, app.config.photo_limits());
    let cancel = controller.cancel_handle();

    let mut run = tokio::task::spawn_blocking(move || controller.run(&name));
    let result = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; cancelling registration");
            cancel.store(true, Ordering::Release);
            camera.stop();
            match tokio::time::timeout(app.config.shutdown_timeout(), &mut run).await {
                Ok(result) => result?,
                Err(_) => force_exit("registration did not stop in time"),
            }
        }
    };

    match result? {
        RegistrationOutcome::Completed { user, photos } => println!("{user} registered with {photos} photos"),
        RegistrationOutcome::Cancelled { .. } => println!("Registration cancelled"),
    }
    shutdown_camera(&camera, app.config.shutdown_timeout());
    Ok(())
}

async fn recognize(app: App) -> Result<()> {
    if app.gallery.read().is_empty() {
        bail!("no trained model yet; run `lockface register <name>` first");
    }

    let operator: Arc<dyn Operator> = Arc::new(TerminalOperator::new());
    let services = app.services(operator)?;
    let camera = services.camera.clone();
    let training = services.training.clone();
    let lock = Arc::new(LogindLockSignal::connect().context("failed to connect to logind")?);
    let controller = RecognitionController::new(
        services,
        lock,
        app.unlocker()?,
        app.config.recognition_timing(),
        app.config.max_photos_per_user,
    );

    let activation = controller.activate()?;
    let mut finished = tokio::task::spawn_blocking(move || activation.join());
    let outcome = tokio::select! {
        outcome = &mut finished => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; stopping recognition");
            controller.stop();
            match tokio::time::timeout(app.config.shutdown_timeout(), &mut finished).await {
                Ok(outcome) => outcome?,
                Err(_) => force_exit("recognition did not stop in time"),
            }
        }
    };

    shutdown_camera(&camera, app.config.shutdown_timeout());
    match outcome {
        Some(RecognitionOutcome::Matched { user, distance }) => {
            println!("Recognised {user} (distance {distance:.3})");
            if !controller.wait_for_unlock(UNLOCK_EXIT_WAIT) {
                tracing::warn!(target: "lockface::auth", user = %user, "unlock attempt still running at exit");
            }
            if !training.wait_idle(TRAINING_EXIT_WAIT) {
                tracing::warn!("background training still running at exit");
            }
            Ok(())
        }
        Some(RecognitionOutcome::CameraFailed(message)) => bail!("recognition stopped: {message}"),
        Some(RecognitionOutcome::Stopped) | None => Ok(()),
    }
}

fn delete(app: App, name: &str, yes: bool) -> Result<()> {
    let operator = TerminalOperator::new();
    if !yes && !operator.confirm("Delete", &format!("Delete {name} and all their photos?")) {
        println!("Aborted");
        return Ok(());
    }

    if !UserRegistry::delete(app.store.as_ref(), name)? {
        bail!("no such user: {name}");
    }
    println!("Deleted {name}");

    match app.trainer()?.train() {
        Ok(accuracy) => println!("Model retrained (accuracy {:.1}%)", accuracy * 100.0),
        Err(TrainError::NoTrainingImages) => {
            // Nobody left: a stale gallery would still recognise the deleted user.
            match std::fs::remove_file(&app.config.gallery_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context("failed to remove gallery"),
            }
            println!("No users left; model removed");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn list(app: &App, json: bool) -> Result<()> {
    let users = app
        .store
        .list()?
        .into_iter()
        .map(|name| {
            let photos = app.store.count(&name)?;
            Ok(UserSummary { name, photos })
        })
        .collect::<Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
    } else if users.is_empty() {
        println!("No users registered");
    } else {
        for user in &users {
            println!("{:<24} {:>4} photos", user.name, user.photos);
        }
    }
    Ok(())
}

fn train(app: &App) -> Result<()> {
    match app.trainer()?.train() {
        Ok(accuracy) => {
            println!("Model trained (accuracy {:.1}%)", accuracy * 100.0);
            Ok(())
        }
        Err(TrainError::NoTrainingImages) => bail!("no training images; register a user first"),
        Err(e) => Err(e.into()),
    }
}

fn shutdown_camera(camera: &CaptureSession, timeout: Duration) {
    if !camera.shutdown(timeout) {
        force_exit("capture thread did not exit");
    }
}

fn force_exit(reason: &str) -> ! {
    tracing::error!(reason, "forcing exit");
    std::process::exit(1);
}
