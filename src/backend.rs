//! The per-view root object
//!
//! [`ViewBackend`] is what the embedder creates for each view. It is the
//! state of the nested server's `Display`, publishes the proxied `wl_drm`
//! global there, owns the cursor theme, and creates and owns every
//! surface, popup and shared-memory buffer of the view. Upstream events
//! are routed from here to whichever of those owns them.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use log::{debug, info, trace, warn};
use wayland_backend::server::GlobalId;
use wayland_server::protocol::wl_buffer::WlBuffer;
use wayland_server::DisplayHandle;

use crate::buffer::Buffer;
use crate::config::BackendConfig;
use crate::drm::DrmRelay;
use crate::embedder::{BackendClient, PopupClient};
use crate::error::{AllocError, BackendError, UpstreamError};
use crate::popup::{Popup, PopupEvent, PopupId};
use crate::protocols::drm::server::wl_drm::WlDrm;
use crate::surface::Surface;
use crate::upstream::{
    BufferHandle, CursorThemeHandle, DrmHandle, SurfaceHandle, Upstream, UpstreamEvent,
};
use crate::view_display::{AttachedBuffer, FrameCallback, SurfaceId, SurfaceKind, ViewDisplay};

/// `get_renderer_host_fd` answer: this backend has no renderer host.
pub const NO_RENDERER_HOST_FD: i32 = -1;

pub struct ViewBackend {
    upstream: Rc<dyn Upstream>,
    client: Rc<dyn BackendClient>,
    config: BackendConfig,

    display_handle: DisplayHandle,
    drm_global: Option<GlobalId>,
    drm: DrmRelay<WlDrm, WlBuffer>,
    cursor_theme: Option<CursorThemeHandle>,

    view_display: ViewDisplay,
    popups: BTreeMap<PopupId, Popup>,
    next_popup: u64,
    shm_buffers: HashMap<BufferHandle, Weak<Cell<bool>>>,
}

impl ViewBackend {
    pub fn new(
        display_handle: &DisplayHandle,
        upstream: Rc<dyn Upstream>,
        client: Rc<dyn BackendClient>,
        config: BackendConfig,
    ) -> Self {
        let globals = upstream.globals().clone();

        let drm_global = match globals.drm {
            Some(advertised) if config.drm.enabled => {
                let version = advertised.min(config.drm.max_version);
                info!("🎮 Publishing wl_drm v{} to nested clients", version);
                Some(display_handle.create_global::<ViewBackend, WlDrm, ()>(version, ()))
            }
            Some(_) => {
                debug!("wl_drm proxy disabled by configuration");
                None
            }
            None => None,
        };

        let cursor_theme = if config.cursor.enabled && globals.shm {
            let theme = upstream.load_cursor_theme(config.cursor.theme.as_deref(), config.cursor.size);
            match theme {
                Some(theme) => upstream.set_cursor(Some((theme, config.cursor.name.as_str()))),
                None => warn!("No cursor theme available"),
            }
            theme
        } else {
            None
        };

        info!("✅ View backend created");
        Self {
            drm: DrmRelay::new(upstream.clone()),
            upstream,
            client,
            config,
            display_handle: display_handle.clone(),
            drm_global,
            cursor_theme,
            view_display: ViewDisplay::new(),
            popups: BTreeMap::new(),
            next_popup: 0,
            shm_buffers: HashMap::new(),
        }
    }

    /// Nothing to set up beyond construction.
    pub fn initialize(&mut self) {
        debug!("View backend initialized");
    }

    pub fn renderer_host_fd(&self) -> i32 {
        NO_RENDERER_HOST_FD
    }

    /// The upstream connection, for `get_display`.
    pub fn display(&self) -> Rc<dyn Upstream> {
        self.upstream.clone()
    }

    /// Upstream surface of the main surface, for `get_surface`.
    pub fn main_surface_handle(&self) -> Option<SurfaceHandle> {
        self.view_display.main_surface().and_then(Surface::handle)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn cursor_theme(&self) -> Option<CursorThemeHandle> {
        self.cursor_theme
    }

    pub fn view_display(&self) -> &ViewDisplay {
        &self.view_display
    }

    // --- surfaces ---

    pub fn create_surface(&mut self, kind: SurfaceKind) -> SurfaceId {
        let surface = Surface::new(
            self.upstream.clone(),
            self.client.clone(),
            kind,
            &self.config,
        );
        self.view_display.insert(surface)
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.view_display.surface(id)
    }

    pub fn surface_attach(
        &mut self,
        id: SurfaceId,
        buffer: Option<AttachedBuffer>,
    ) -> Result<(), BackendError> {
        self.view_display.attach(id, buffer)
    }

    pub fn surface_damage(
        &mut self,
        id: SurfaceId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> Result<(), BackendError> {
        self.view_display.damage(id, x, y, width, height)
    }

    pub fn surface_frame(
        &mut self,
        id: SurfaceId,
        callback: Box<dyn FrameCallback>,
    ) -> Result<(), BackendError> {
        self.view_display.frame(id, callback, false)
    }

    pub fn surface_render_callback(
        &mut self,
        id: SurfaceId,
        callback: Box<dyn FrameCallback>,
    ) -> Result<(), BackendError> {
        self.view_display.frame(id, callback, true)
    }

    pub fn surface_commit(&mut self, id: SurfaceId) -> Result<(), BackendError> {
        self.view_display.commit(id)
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) -> Result<(), BackendError> {
        self.view_display.destroy(id)
    }

    // --- buffers ---

    /// Allocates a shared-memory buffer.
    pub fn try_alloc_buffer(
        &mut self,
        format: u32,
        width: u32,
        height: u32,
    ) -> Result<Buffer, AllocError> {
        let buffer = Buffer::allocate(
            self.upstream.clone(),
            &self.config.shm,
            format,
            width,
            height,
        )?;
        self.shm_buffers.retain(|_, flag| flag.strong_count() > 0);
        if let Some(handle) = buffer.handle() {
            self.shm_buffers
                .insert(handle, Rc::downgrade(buffer.release_flag()));
        }
        Ok(buffer)
    }

    /// `alloc_buffer`: no buffer on any failure.
    pub fn alloc_buffer(&mut self, format: u32, width: u32, height: u32) -> Option<Buffer> {
        self.try_alloc_buffer(format, width, height)
            .map_err(|e| warn!("Buffer allocation failed: {}", e))
            .ok()
    }

    // --- popups ---

    /// Creates a popup positioned against the main surface.
    pub fn try_create_popup(
        &mut self,
        client: Rc<dyn PopupClient>,
        x: i32,
        y: i32,
    ) -> Result<PopupId, BackendError> {
        let parent = self
            .main_surface_handle()
            .ok_or(BackendError::NoMainSurface)?;
        let popup = Popup::new(self.upstream.clone(), client, parent, x, y);

        self.next_popup += 1;
        let id = PopupId::from_raw(self.next_popup);
        self.popups.insert(id, popup);
        Ok(id)
    }

    /// `create_popup`: no popup without a main surface.
    pub fn create_popup(&mut self, client: Rc<dyn PopupClient>, x: i32, y: i32) -> Option<PopupId> {
        self.try_create_popup(client, x, y)
            .map_err(|e| warn!("Popup creation failed: {}", e))
            .ok()
    }

    pub fn popup(&self, id: PopupId) -> Option<&Popup> {
        self.popups.get(&id)
    }

    pub fn popup_attach_buffer(
        &mut self,
        id: PopupId,
        buffer: Option<&Buffer>,
    ) -> Result<(), BackendError> {
        self.popups
            .get_mut(&id)
            .ok_or(BackendError::UnknownPopup(id))?
            .attach_buffer(buffer);
        Ok(())
    }

    pub fn destroy_popup(&mut self, id: PopupId) -> Result<(), BackendError> {
        self.popups
            .remove(&id)
            .map(drop)
            .ok_or(BackendError::UnknownPopup(id))
    }

    // --- wl_drm proxy ---

    pub(crate) fn drm_relay(&mut self) -> &mut DrmRelay<WlDrm, WlBuffer> {
        &mut self.drm
    }

    /// Relays a nested client's `wl_drm` bind. The client's device and
    /// format events have been sent when this returns.
    pub(crate) fn drm_bind(&mut self, resource: WlDrm, version: u32) -> Result<DrmHandle, UpstreamError> {
        let drm = self.drm.bind(resource, version)?;
        self.dispatch_upstream();
        Ok(drm)
    }

    pub(crate) fn drm_authenticate(&mut self, drm: DrmHandle, id: u32) {
        if let Err(e) = self.drm.authenticate(drm, id) {
            warn!("wl_drm authentication roundtrip failed: {}", e);
        }
        self.dispatch_upstream();
    }

    pub fn drm_binding_count(&self) -> usize {
        self.drm.binding_count()
    }

    // --- upstream events ---

    /// Routes every queued upstream event to its owner.
    pub fn dispatch_upstream(&mut self) {
        for event in self.upstream.take_events() {
            self.route(&event);
        }
    }

    fn route(&mut self, event: &UpstreamEvent) {
        if self.drm.handle_event(event) {
            return;
        }

        if let UpstreamEvent::BufferRelease { buffer } = event {
            if let Some(flag) = self.shm_buffers.get(buffer).and_then(Weak::upgrade) {
                flag.set(true);
                return;
            }
        }

        for popup in self.popups.values_mut() {
            if popup.handle_event(event) != PopupEvent::Ignored {
                return;
            }
        }

        if !self.view_display.handle_event(event) {
            trace!("Unrouted upstream event {:?}", event);
        }
    }
}

impl Drop for ViewBackend {
    fn drop(&mut self) {
        self.popups.clear();
        self.view_display.clear();
        self.drm.clear();

        self.upstream.set_cursor(None);
        if let Some(theme) = self.cursor_theme.take() {
            self.upstream.destroy_cursor_theme(theme);
        }

        if let Some(global) = self.drm_global.take() {
            self.display_handle.remove_global::<ViewBackend>(global);
        }
        info!("View backend destroyed");
    }
}
