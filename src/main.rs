//! # nested-view
//!
//! Developer harness for the view backend: opens one on-screen view on the
//! host compositor (or on an in-memory one with `--headless`), paints a
//! solid frame into a shared-memory buffer, and pumps both connections for
//! a while.

use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info};
use wayland_server::Display;

use nested_view_backend::format::FOURCC_XRGB8888;
use nested_view_backend::upstream::UpstreamEvent;
use nested_view_backend::{
    AttachedBuffer, BackendClient, BackendConfig, InputTarget, RecordingUpstream, SurfaceKind,
    Upstream, ViewBackend, WaylandDisplay,
};

#[derive(Parser)]
#[command(name = "nested-view")]
#[command(about = "Show a nested view backend surface on the host compositor")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/nested-view/backend.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Use an in-memory compositor instead of connecting to one
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Width of the painted frame
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Height of the painted frame
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Number of dispatch iterations before exiting
    #[arg(long, default_value_t = 100)]
    iterations: u32,
}

/// Logs what the backend tells the embedder.
struct LoggingClient;

impl BackendClient for LoggingClient {
    fn dispatch_set_size(&self, width: u32, height: u32) {
        info!("📐 Host compositor proposed {}x{}", width, height);
    }

    fn input(&self) -> InputTarget {
        InputTarget(1)
    }
}

enum Host {
    Wayland(Rc<WaylandDisplay>),
    Headless(Rc<RecordingUpstream>),
}

impl Host {
    fn upstream(&self) -> Rc<dyn Upstream> {
        match self {
            Host::Wayland(display) => display.clone() as Rc<dyn Upstream>,
            Host::Headless(recording) => recording.clone() as Rc<dyn Upstream>,
        }
    }

    fn pump(&self, timeout_ms: i32) -> Result<()> {
        match self {
            Host::Wayland(display) => {
                display.flush()?;
                display.dispatch_timeout(timeout_ms)?;
            }
            Host::Headless(_) => {}
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting nested view backend harness");
    info!("📄 Version: {}", env!("CARGO_PKG_VERSION"));
    info!("🔨 Built: {}", option_env!("BUILD_DATE").unwrap_or("unknown"));
    if let Some(commit) = option_env!("GIT_COMMIT") {
        debug!("Commit: {}", commit);
    }

    // Load configuration
    let config = match BackendConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            info!("📝 Using default configuration");
            BackendConfig::default()
        }
    };
    config.validate().context("Invalid configuration")?;

    let host = if cli.headless {
        info!("🧪 Running against an in-memory compositor");
        Host::Headless(Rc::new(RecordingUpstream::default().with_initial_configure()))
    } else {
        let display = WaylandDisplay::connect().context("Failed to connect to the host compositor")?;
        Host::Wayland(Rc::new(display))
    };

    let mut display: Display<ViewBackend> =
        Display::new().context("Failed to create the nested display")?;
    let mut backend = ViewBackend::new(
        &display.handle(),
        host.upstream(),
        Rc::new(LoggingClient),
        config,
    );
    backend.initialize();

    let surface = backend.create_surface(SurfaceKind::OnScreen);
    let mut buffer = backend
        .try_alloc_buffer(FOURCC_XRGB8888, cli.width, cli.height)
        .context("Failed to allocate a frame buffer")?;
    for pixel in buffer.data_mut().chunks_exact_mut(4) {
        pixel.copy_from_slice(&0xff33_6699u32.to_le_bytes());
    }

    let handle = buffer
        .handle()
        .context("Frame buffer has no upstream object")?;
    backend.surface_attach(
        surface,
        Some(AttachedBuffer {
            buffer: handle,
            x: 0,
            y: 0,
        }),
    )?;
    backend.surface_damage(surface, 0, 0, cli.width as i32, cli.height as i32)?;
    backend.surface_commit(surface)?;
    info!("🖼️ Committed a {}x{} frame", cli.width, cli.height);

    for iteration in 0..cli.iterations {
        if let Host::Headless(recording) = &host {
            // Present every outstanding frame immediately.
            let callback = backend.surface(surface).and_then(|s| s.frame_callback());
            if let Some(callback) = callback {
                recording.push_event(UpstreamEvent::FrameDone {
                    callback,
                    time: iteration * 16,
                });
            }
        }

        host.pump(16)?;
        backend.dispatch_upstream();
        display
            .dispatch_clients(&mut backend)
            .context("Failed to dispatch nested clients")?;
        display
            .flush_clients()
            .context("Failed to flush nested clients")?;
    }

    backend.destroy_surface(surface)?;
    drop(buffer);
    info!("👋 Done after {} iterations", cli.iterations);
    Ok(())
}
