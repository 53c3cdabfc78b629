//! Top-level and embedded surfaces
//!
//! A [`Surface`] mirrors one downstream surface onto an upstream
//! `wl_surface`. On-screen surfaces additionally get a shell role so the
//! host compositor maps them as a window, and are registered for input.
//!
//! The shell role is chosen once, at construction, from the globals the
//! upstream compositor advertised: the modern shell when present, the
//! legacy shell otherwise. A platform (ivi) role is attached on top when
//! that global exists. Configure events from all three converge on the
//! same size handler.
//!
//! A modern role may not show a buffer before its first configure is
//! acked. Attaches and commits made before that are held back and replayed
//! right after the ack.

use std::rc::Rc;

use log::{debug, trace, warn};

use crate::config::BackendConfig;
use crate::embedder::BackendClient;
use crate::upstream::{
    CallbackHandle, IviSurfaceHandle, ShellSurfaceHandle, SurfaceHandle, Upstream, UpstreamEvent,
    XdgSurfaceHandle,
};
use crate::view_display::{AttachedBuffer, CommitState, Damage, SurfaceKind};

/// The window role of an on-screen surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellRole {
    /// Off-screen, or no shell global upstream.
    None,
    Modern(XdgSurfaceHandle),
    Legacy(ShellSurfaceHandle),
}

/// Last size negotiated with the upstream compositor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizingData {
    pub width: u32,
    pub height: u32,
}

/// Requests held back until the first configure is acked.
#[derive(Debug, Default)]
struct Deferred {
    /// Attach latched by a held-back commit.
    committed_attach: Option<Option<AttachedBuffer>>,
    commit: Option<CommitState>,
    /// Attach made after the last held-back commit.
    pending_attach: Option<Option<AttachedBuffer>>,
}

impl Deferred {
    fn commit(&mut self, state: &CommitState) {
        if let Some(attach) = self.pending_attach.take() {
            self.committed_attach = Some(attach);
        }
        let mut state = state.clone();
        let earlier = self.commit.take().and_then(|commit| commit.damage);
        if let Some(Damage {
            x,
            y,
            width,
            height,
        }) = earlier
        {
            match state.damage.as_mut() {
                Some(damage) => damage.expand(x, y, width, height),
                None => state.damage = earlier,
            }
        }
        self.commit = Some(state);
    }
}

/// What a surface did with an upstream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The event is for another object.
    Ignored,
    Handled,
    /// The outstanding frame callback fired with this timestamp.
    FrameComplete(u32),
}

pub struct Surface {
    kind: SurfaceKind,
    upstream: Rc<dyn Upstream>,
    client: Rc<dyn BackendClient>,

    surface: Option<SurfaceHandle>,
    role: ShellRole,
    platform: Option<IviSurfaceHandle>,
    frame_callback: Option<CallbackHandle>,
    input_registered: bool,

    /// False while a modern role waits for its first configure.
    configured: bool,
    deferred: Deferred,

    resizing: ResizingData,
}

impl Surface {
    pub fn new(
        upstream: Rc<dyn Upstream>,
        client: Rc<dyn BackendClient>,
        kind: SurfaceKind,
        config: &BackendConfig,
    ) -> Self {
        let surface = upstream.create_surface();
        let mut this = Self {
            kind,
            upstream,
            client,
            surface: Some(surface),
            role: ShellRole::None,
            platform: None,
            frame_callback: None,
            input_registered: false,
            configured: true,
            deferred: Deferred::default(),
            resizing: ResizingData::default(),
        };

        if kind == SurfaceKind::OnScreen {
            this.map_as_window(surface, config);
        }

        this
    }

    fn map_as_window(&mut self, surface: SurfaceHandle, config: &BackendConfig) {
        let upstream = &self.upstream;
        let globals = upstream.globals();
        let title = config.window.title.as_str();

        self.role = if globals.xdg_wm_base {
            let role = upstream.create_xdg_surface(surface);
            upstream.xdg_surface_set_title(role, title);
            debug!("Surface {:?} mapped with xdg_toplevel", surface);
            self.configured = false;
            ShellRole::Modern(role)
        } else if globals.shell {
            let role = upstream.create_shell_surface(surface);
            upstream.shell_surface_set_toplevel(role);
            upstream.shell_surface_set_title(role, title);
            debug!("Surface {:?} mapped with wl_shell_surface", surface);
            ShellRole::Legacy(role)
        } else {
            ShellRole::None
        };

        if globals.ivi_application {
            let ivi_id = config.ivi.surface_id();
            self.platform = Some(upstream.create_ivi_surface(ivi_id, surface));
            debug!("Surface {:?} registered as ivi surface {}", surface, ivi_id);
        }

        if self.role == ShellRole::None && self.platform.is_none() {
            warn!("No upstream shell global; surface {:?} stays unmapped", surface);
        }

        upstream.register_input_client(surface, self.client.input());
        self.input_registered = true;
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    /// The upstream surface, until teardown.
    pub fn handle(&self) -> Option<SurfaceHandle> {
        self.surface
    }

    pub fn role(&self) -> ShellRole {
        self.role
    }

    pub fn platform_role(&self) -> Option<IviSurfaceHandle> {
        self.platform
    }

    pub fn frame_callback(&self) -> Option<CallbackHandle> {
        self.frame_callback
    }

    pub fn size(&self) -> ResizingData {
        self.resizing
    }

    /// Whether the upstream surface may show buffers yet.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Relays an attach. No buffer detaches at the origin.
    pub fn on_surface_attach(&mut self, buffer: Option<&AttachedBuffer>) {
        let Some(surface) = self.surface else {
            return;
        };
        if !self.configured {
            self.deferred.pending_attach = Some(buffer.copied());
            return;
        }
        match buffer {
            Some(attached) => {
                self.upstream
                    .surface_attach(surface, Some(attached.buffer), attached.x, attached.y)
            }
            None => self.upstream.surface_attach(surface, None, 0, 0),
        }
    }

    /// Relays a commit, arming a fresh frame callback first.
    pub fn on_surface_commit(&mut self, state: &CommitState) {
        let Some(surface) = self.surface else {
            return;
        };
        if !self.configured {
            trace!("Holding back commit on {:?} until configured", surface);
            self.deferred.commit(state);
            return;
        }

        if let Some(stale) = self.frame_callback.take() {
            self.upstream.destroy_callback(stale);
        }
        self.frame_callback = Some(self.upstream.surface_frame(surface));

        if let Some(damage) = state.damage {
            self.upstream
                .surface_damage(surface, damage.x, damage.y, damage.width, damage.height);
        }

        self.upstream.surface_commit(surface);
    }

    pub fn handle_event(&mut self, event: &UpstreamEvent) -> SurfaceEvent {
        match *event {
            UpstreamEvent::FrameDone { callback, time } if self.frame_callback == Some(callback) => {
                self.frame_callback = None;
                self.upstream.destroy_callback(callback);
                SurfaceEvent::FrameComplete(time)
            }
            UpstreamEvent::XdgConfigure {
                role,
                width,
                height,
                serial,
            } if self.role == ShellRole::Modern(role) => {
                self.configure(width, height);
                self.upstream.xdg_surface_ack_configure(role, serial);
                if !self.configured {
                    self.configured = true;
                    self.replay();
                }
                SurfaceEvent::Handled
            }
            UpstreamEvent::ShellConfigure {
                role,
                width,
                height,
                ..
            } if self.role == ShellRole::Legacy(role) => {
                self.configure(width, height);
                SurfaceEvent::Handled
            }
            UpstreamEvent::ShellPing { role, serial } if self.role == ShellRole::Legacy(role) => {
                self.upstream.shell_surface_pong(role, serial);
                SurfaceEvent::Handled
            }
            UpstreamEvent::ShellPopupDone { role } if self.role == ShellRole::Legacy(role) => {
                SurfaceEvent::Handled
            }
            UpstreamEvent::IviConfigure {
                role,
                width,
                height,
            } if self.platform == Some(role) => {
                self.configure(width, height);
                SurfaceEvent::Handled
            }
            _ => SurfaceEvent::Ignored,
        }
    }

    /// Zero by zero means the compositor leaves the size to the client.
    fn configure(&mut self, width: i32, height: i32) {
        if width == 0 && height == 0 {
            trace!("Configure without a size on {:?}", self.surface);
            return;
        }
        let width = width.max(0) as u32;
        let height = height.max(0) as u32;
        debug!("Upstream resized {:?} to {}x{}", self.surface, width, height);
        self.client.dispatch_set_size(width, height);
        self.resizing = ResizingData { width, height };
    }

    fn replay(&mut self) {
        let Deferred {
            committed_attach,
            commit,
            pending_attach,
        } = std::mem::take(&mut self.deferred);
        if let Some(attach) = committed_attach {
            self.on_surface_attach(attach.as_ref());
        }
        if let Some(state) = commit {
            debug!("Replaying held-back commit on {:?}", self.surface);
            self.on_surface_commit(&state);
        }
        if let Some(attach) = pending_attach {
            self.on_surface_attach(attach.as_ref());
        }
    }

    /// Releases every upstream object in dependency order. Safe to call
    /// more than once.
    pub fn teardown(&mut self) {
        self.deferred = Deferred::default();
        let upstream = &self.upstream;

        if std::mem::take(&mut self.input_registered) {
            if let Some(surface) = self.surface {
                upstream.unregister_input_client(surface);
            }
        }
        if let Some(role) = self.platform.take() {
            upstream.destroy_ivi_surface(role);
        }
        match std::mem::replace(&mut self.role, ShellRole::None) {
            ShellRole::Modern(role) => upstream.destroy_xdg_surface(role),
            ShellRole::Legacy(role) => upstream.destroy_shell_surface(role),
            ShellRole::None => {}
        }
        if let Some(callback) = self.frame_callback.take() {
            upstream.destroy_callback(callback);
        }
        if let Some(surface) = self.surface.take() {
            upstream.destroy_surface(surface);
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.teardown();
    }
}
