//! Transient popups
//!
//! A popup is its own upstream surface, positioned against the main
//! surface with whichever popup protocol the upstream compositor offers.
//! The compositor dismisses it on outside interaction; the embedder hears
//! about that once, and destroys the popup whenever it likes afterwards.
//!
//! A modern popup shows nothing until its first configure is acked; a
//! buffer attached before that is shown right after the ack.

use std::rc::Rc;

use log::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::embedder::PopupClient;
use crate::upstream::{
    BufferHandle, CallbackHandle, ShellSurfaceHandle, SurfaceHandle, Upstream, UpstreamEvent,
    XdgPopupHandle,
};

/// Key of a popup inside one view backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PopupId(u64);

impl PopupId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupRole {
    /// Dismissed, or no popup protocol upstream.
    None,
    Modern(XdgPopupHandle),
    Legacy(ShellSurfaceHandle),
}

/// A buffer as shown on the popup surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Content {
    buffer: BufferHandle,
    width: i32,
    height: i32,
}

/// What a popup did with an upstream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupEvent {
    Ignored,
    Handled,
    FrameDisplayed,
    Dismissed,
}

pub struct Popup {
    client: Rc<dyn PopupClient>,
    upstream: Rc<dyn Upstream>,

    surface: Option<SurfaceHandle>,
    role: PopupRole,
    frame_callback: Option<CallbackHandle>,

    configured: bool,
    /// Latest attach made before the popup was configured.
    deferred: Option<Option<Content>>,
}

impl Popup {
    /// Creates the popup surface anchored at (`x`, `y`) on `parent`.
    pub fn new(
        upstream: Rc<dyn Upstream>,
        client: Rc<dyn PopupClient>,
        parent: SurfaceHandle,
        x: i32,
        y: i32,
    ) -> Self {
        let surface = upstream.create_surface();
        let serial = upstream.serial();
        let globals = upstream.globals();

        let role = if globals.xdg_wm_base {
            match upstream.create_xdg_popup(surface, parent, serial, x, y) {
                Some(popup) => PopupRole::Modern(popup),
                None => {
                    warn!("Parent {:?} has no xdg surface; popup stays unmapped", parent);
                    PopupRole::None
                }
            }
        } else if globals.shell {
            let role = upstream.create_shell_surface(surface);
            upstream.shell_surface_set_popup(role, parent, serial, x, y);
            PopupRole::Legacy(role)
        } else {
            warn!("No upstream shell global; popup stays unmapped");
            PopupRole::None
        };
        debug!("Popup on {:?} at ({}, {}) with {:?}", parent, x, y, role);

        upstream.register_input_client(surface, client.input());

        Self {
            client,
            upstream,
            surface: Some(surface),
            role,
            frame_callback: None,
            configured: !matches!(role, PopupRole::Modern(_)),
            deferred: None,
        }
    }

    pub fn handle(&self) -> Option<SurfaceHandle> {
        self.surface
    }

    pub fn role(&self) -> PopupRole {
        self.role
    }

    pub fn frame_callback(&self) -> Option<CallbackHandle> {
        self.frame_callback
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Shows `buffer`, or unmaps the popup content with `None`.
    pub fn attach_buffer(&mut self, buffer: Option<&Buffer>) {
        let content = buffer.and_then(|buffer| {
            let handle = buffer.handle()?;
            buffer.mark_busy();
            Some(Content {
                buffer: handle,
                width: buffer.width() as i32,
                height: buffer.height() as i32,
            })
        });

        if !self.configured {
            trace!("Holding back popup content on {:?} until configured", self.surface);
            self.deferred = Some(content);
            return;
        }
        self.show(content);
    }

    fn show(&mut self, content: Option<Content>) {
        if let Some(stale) = self.frame_callback.take() {
            self.upstream.destroy_callback(stale);
        }
        let Some(surface) = self.surface else {
            return;
        };

        match content {
            Some(content) => {
                self.frame_callback = Some(self.upstream.surface_frame(surface));
                self.upstream.surface_attach(surface, Some(content.buffer), 0, 0);
                self.upstream
                    .surface_damage(surface, 0, 0, content.width, content.height);
            }
            None => self.upstream.surface_attach(surface, None, 0, 0),
        }

        self.upstream.surface_commit(surface);
    }

    pub fn handle_event(&mut self, event: &UpstreamEvent) -> PopupEvent {
        match *event {
            UpstreamEvent::FrameDone { callback, .. } if self.frame_callback == Some(callback) => {
                self.frame_callback = None;
                self.upstream.destroy_callback(callback);
                self.client.dispatch_frame_displayed();
                PopupEvent::FrameDisplayed
            }
            UpstreamEvent::XdgPopupConfigure { popup, serial }
                if self.role == PopupRole::Modern(popup) =>
            {
                self.upstream.xdg_popup_ack_configure(popup, serial);
                if !self.configured {
                    self.configured = true;
                    if let Some(content) = self.deferred.take() {
                        self.show(content);
                    }
                }
                PopupEvent::Handled
            }
            UpstreamEvent::XdgPopupDone { popup } if self.role == PopupRole::Modern(popup) => {
                self.role = PopupRole::None;
                self.upstream.destroy_xdg_popup(popup);
                self.dismissed()
            }
            UpstreamEvent::ShellPopupDone { role } if self.role == PopupRole::Legacy(role) => {
                self.role = PopupRole::None;
                self.upstream.destroy_shell_surface(role);
                self.dismissed()
            }
            UpstreamEvent::ShellPing { role, serial } if self.role == PopupRole::Legacy(role) => {
                self.upstream.shell_surface_pong(role, serial);
                PopupEvent::Handled
            }
            UpstreamEvent::ShellConfigure { role, .. } if self.role == PopupRole::Legacy(role) => {
                trace!("Ignoring configure for popup {:?}", self.surface);
                PopupEvent::Handled
            }
            _ => PopupEvent::Ignored,
        }
    }

    fn dismissed(&mut self) -> PopupEvent {
        debug!("Popup {:?} dismissed upstream", self.surface);
        self.client.dispatch_dismissed();
        PopupEvent::Dismissed
    }

    /// Releases whatever upstream objects are still live. Safe to call
    /// more than once, including after a dismissal.
    pub fn teardown(&mut self) {
        self.deferred = None;
        let upstream = &self.upstream;

        match std::mem::replace(&mut self.role, PopupRole::None) {
            PopupRole::Modern(popup) => upstream.destroy_xdg_popup(popup),
            PopupRole::Legacy(role) => upstream.destroy_shell_surface(role),
            PopupRole::None => {}
        }
        if let Some(surface) = self.surface.take() {
            upstream.unregister_input_client(surface);
            upstream.destroy_surface(surface);
        }
        if let Some(callback) = self.frame_callback.take() {
            upstream.destroy_callback(callback);
        }
    }
}

impl Drop for Popup {
    fn drop(&mut self) {
        self.teardown();
    }
}
