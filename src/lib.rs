//! # Nested View Backend
//!
//! A view backend for an embeddable web engine that runs a small nested
//! Wayland server for the engine's renderer and shows the result on a host
//! ("upstream") Wayland compositor.
//!
//! ## Architecture
//!
//! - `backend`: [`ViewBackend`], the per-view root object and server state
//! - `view_display`: downstream surface bookkeeping and frame callbacks
//! - `surface`: relays one surface upstream, with its window roles
//! - `popup`: transient popups positioned against the main surface
//! - `buffer`: shared-memory buffers backed by anonymous files
//! - `drm`: the `wl_drm` proxy between nested clients and the host
//! - `upstream`: the host compositor connection, real and recorded
//! - `config`: TOML configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use nested_view_backend::{
//!     BackendClient, BackendConfig, InputTarget, SurfaceKind, ViewBackend, WaylandDisplay,
//! };
//! use wayland_server::Display;
//!
//! struct Embedder;
//!
//! impl BackendClient for Embedder {
//!     fn dispatch_set_size(&self, width: u32, height: u32) {
//!         println!("resized to {width}x{height}");
//!     }
//!     fn input(&self) -> InputTarget {
//!         InputTarget(1)
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let upstream = Rc::new(WaylandDisplay::connect()?);
//!     let display = Display::<ViewBackend>::new()?;
//!     let mut backend = ViewBackend::new(
//!         &display.handle(),
//!         upstream,
//!         Rc::new(Embedder),
//!         BackendConfig::default(),
//!     );
//!     backend.create_surface(SurfaceKind::OnScreen);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod drm;
pub mod embedder;
pub mod error;
pub mod format;
pub mod popup;
pub mod protocols;
pub mod surface;
pub mod upstream;
pub mod view_display;

// Re-export main types for easy access
pub use backend::ViewBackend;
pub use buffer::{Buffer, BufferInfo};
pub use config::BackendConfig;
pub use embedder::{BackendClient, InputTarget, PopupClient};
pub use error::{AllocError, BackendError, UpstreamError};
pub use popup::PopupId;
pub use surface::Surface;
pub use upstream::{RecordingUpstream, Upstream, UpstreamEvent, UpstreamGlobals, WaylandDisplay};
pub use view_display::{AttachedBuffer, SurfaceId, SurfaceKind, ViewDisplay};
