//! `wayland-client` implementation of [`Upstream`]
//!
//! Every upstream proxy lives in a table keyed by the raw value of the
//! handle given out for it, and carries that key as its user data so the
//! `Dispatch` impls can tag the events they queue. Proxies that have no
//! destructor on the wire (`wl_callback`, `wl_shell_surface`, `wl_drm`) are
//! destroyed by dropping their table entry; events that arrive for a key
//! that is no longer in its table are discarded.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use log::{debug, info, trace, warn};
use wayland_client::globals::{registry_queue_init, GlobalList, GlobalListContents};
use wayland_client::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_pointer, wl_registry, wl_seat, wl_shell,
    wl_shell_surface, wl_shm, wl_shm_pool, wl_surface,
};
use wayland_client::{
    backend::WaylandError, delegate_noop, Connection, Dispatch, EventQueue, Proxy, QueueHandle,
    WEnum,
};
use wayland_cursor::CursorTheme;
use wayland_protocols::xdg::shell::client::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};

use super::{
    BufferHandle, CallbackHandle, CursorThemeHandle, DrmHandle, DrmPlanes, IviSurfaceHandle,
    ShellSurfaceHandle, SurfaceHandle, Upstream, UpstreamEvent, UpstreamGlobals,
    XdgPopupHandle, XdgSurfaceHandle,
};
use crate::embedder::InputTarget;
use crate::error::UpstreamError;
use crate::protocols::drm::client::wl_drm;
use crate::protocols::ivi::client::{ivi_application, ivi_surface};

/// Highest `wl_drm` version the client bindings understand.
const DRM_MAX_VERSION: u32 = 2;

/// Which kind of role an `xdg_surface` carries.
#[derive(Debug, Clone, Copy)]
enum XdgRoleData {
    Toplevel(u64),
    Popup(u64),
}

struct XdgToplevelRole {
    surface: u64,
    xdg_surface: xdg_surface::XdgSurface,
    toplevel: xdg_toplevel::XdgToplevel,
    pending_size: (i32, i32),
}

struct XdgPopupRole {
    xdg_surface: xdg_surface::XdgSurface,
    popup: xdg_popup::XdgPopup,
}

struct ActiveCursor {
    theme: u64,
    name: String,
}

/// Dispatch state for the upstream event queue.
struct UpstreamState {
    qh: QueueHandle<UpstreamState>,
    globals: GlobalList,
    next_key: u64,
    serial: u32,

    compositor: wl_compositor::WlCompositor,
    shm: Option<wl_shm::WlShm>,
    xdg_wm_base: Option<xdg_wm_base::XdgWmBase>,
    shell: Option<wl_shell::WlShell>,
    ivi_application: Option<ivi_application::IviApplication>,
    seat: Option<wl_seat::WlSeat>,
    pointer: Option<wl_pointer::WlPointer>,
    drm_version: Option<u32>,

    surfaces: HashMap<u64, wl_surface::WlSurface>,
    callbacks: HashMap<u64, wl_callback::WlCallback>,
    buffers: HashMap<u64, wl_buffer::WlBuffer>,
    xdg_toplevels: HashMap<u64, XdgToplevelRole>,
    xdg_popups: HashMap<u64, XdgPopupRole>,
    shell_surfaces: HashMap<u64, wl_shell_surface::WlShellSurface>,
    ivi_surfaces: HashMap<u64, ivi_surface::IviSurface>,
    drms: HashMap<u64, wl_drm::WlDrm>,

    cursor_themes: HashMap<u64, CursorTheme>,
    cursor_surface: Option<wl_surface::WlSurface>,
    cursor: Option<ActiveCursor>,
    pointer_serial: Option<u32>,
    input_clients: HashMap<u64, InputTarget>,

    events: Vec<UpstreamEvent>,
}

impl UpstreamState {
    fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    /// Attaches the active cursor image to the cursor surface, or hides
    /// the pointer when no cursor is selected.
    fn apply_cursor(&mut self) {
        let (Some(pointer), Some(serial)) = (self.pointer.as_ref(), self.pointer_serial) else {
            return;
        };
        let Some(active) = self.cursor.as_ref() else {
            pointer.set_cursor(serial, None, 0, 0);
            return;
        };
        let Some(theme) = self.cursor_themes.get_mut(&active.theme) else {
            return;
        };
        let Some(cursor) = theme.get_cursor(&active.name) else {
            warn!("Cursor {} is missing from the theme", active.name);
            return;
        };
        let surface = self
            .cursor_surface
            .get_or_insert_with(|| self.compositor.create_surface(&self.qh, 0));
        let image = &cursor[0];
        let (width, height) = image.dimensions();
        let (hotspot_x, hotspot_y) = image.hotspot();
        surface.attach(Some(&**image), 0, 0);
        surface.damage(0, 0, width as i32, height as i32);
        surface.commit();
        pointer.set_cursor(serial, Some(&*surface), hotspot_x as i32, hotspot_y as i32);
    }
}

struct Inner {
    queue: EventQueue<UpstreamState>,
    state: UpstreamState,
}

/// The process-wide connection to the host compositor.
pub struct WaylandDisplay {
    connection: Connection,
    globals: UpstreamGlobals,
    inner: RefCell<Inner>,
}

impl WaylandDisplay {
    /// Connects through `WAYLAND_DISPLAY` and binds every global the
    /// backend can use.
    pub fn connect() -> Result<Self, UpstreamError> {
        let connection =
            Connection::connect_to_env().map_err(|e| UpstreamError::Connect(e.to_string()))?;
        Self::from_connection(connection)
    }

    pub fn from_connection(connection: Connection) -> Result<Self, UpstreamError> {
        let (global_list, queue) = registry_queue_init::<UpstreamState>(&connection)
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let qh = queue.handle();

        let compositor = global_list
            .bind::<wl_compositor::WlCompositor, _, _>(&qh, 1..=4, ())
            .map_err(|_| UpstreamError::MissingGlobal("wl_compositor"))?;
        let shm = bind_optional::<wl_shm::WlShm>(&global_list, &qh, 1..=1);
        let xdg_wm_base = bind_optional::<xdg_wm_base::XdgWmBase>(&global_list, &qh, 1..=2);
        let shell = bind_optional::<wl_shell::WlShell>(&global_list, &qh, 1..=1);
        let ivi_application =
            bind_optional::<ivi_application::IviApplication>(&global_list, &qh, 1..=1);
        let seat = bind_optional::<wl_seat::WlSeat>(&global_list, &qh, 1..=5);

        let drm_version = global_list.contents().with_list(|list| {
            list.iter()
                .find(|global| global.interface == wl_drm::WlDrm::interface().name)
                .map(|global| global.version.min(DRM_MAX_VERSION))
        });
        match drm_version {
            Some(version) => info!("🎮 Upstream wl_drm v{} available", version),
            None => info!("Upstream compositor does not advertise wl_drm"),
        }

        let globals = UpstreamGlobals {
            compositor: true,
            shm: shm.is_some(),
            xdg_wm_base: xdg_wm_base.is_some(),
            shell: shell.is_some(),
            ivi_application: ivi_application.is_some(),
            seat: seat.is_some(),
            drm: drm_version,
        };
        info!("🔗 Connected to upstream compositor: {:?}", globals);

        let state = UpstreamState {
            qh,
            globals: global_list,
            next_key: 0,
            serial: 0,
            compositor,
            shm,
            xdg_wm_base,
            shell,
            ivi_application,
            seat,
            pointer: None,
            drm_version,
            surfaces: HashMap::new(),
            callbacks: HashMap::new(),
            buffers: HashMap::new(),
            xdg_toplevels: HashMap::new(),
            xdg_popups: HashMap::new(),
            shell_surfaces: HashMap::new(),
            ivi_surfaces: HashMap::new(),
            drms: HashMap::new(),
            cursor_themes: HashMap::new(),
            cursor_surface: None,
            cursor: None,
            pointer_serial: None,
            input_clients: HashMap::new(),
            events: Vec::new(),
        };

        Ok(Self {
            connection,
            globals,
            inner: RefCell::new(Inner { queue, state }),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Overrides the input serial used to grab popups.
    pub fn set_serial(&self, serial: u32) {
        self.inner.borrow_mut().state.serial = serial;
    }

    /// The proxy behind `handle`, for handing to the embedder.
    pub fn wl_surface(&self, handle: SurfaceHandle) -> Option<wl_surface::WlSurface> {
        self.inner.borrow().state.surfaces.get(&handle.raw()).cloned()
    }

    pub fn flush(&self) -> Result<(), UpstreamError> {
        self.connection
            .flush()
            .map_err(|e| UpstreamError::Dispatch(e.to_string()))
    }

    /// Reads whatever the compositor sent within `timeout_ms` and
    /// dispatches it. Returns the number of events dispatched.
    pub fn dispatch_timeout(&self, timeout_ms: i32) -> Result<usize, UpstreamError> {
        self.flush()?;
        let mut inner = self.inner.borrow_mut();
        let Inner { queue, state } = &mut *inner;

        if let Some(guard) = queue.prepare_read() {
            let mut poll_fd = libc::pollfd {
                fd: guard.connection_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut poll_fd, 1, timeout_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(UpstreamError::Dispatch(err.to_string()));
                }
            } else if poll_fd.revents & libc::POLLIN != 0 {
                match guard.read() {
                    Ok(_) => {}
                    Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(UpstreamError::Dispatch(e.to_string())),
                }
            }
        }

        queue
            .dispatch_pending(state)
            .map_err(|e| UpstreamError::Dispatch(e.to_string()))
    }
}

fn bind_optional<I>(
    globals: &GlobalList,
    qh: &QueueHandle<UpstreamState>,
    version: std::ops::RangeInclusive<u32>,
) -> Option<I>
where
    I: Proxy + 'static,
    UpstreamState: Dispatch<I, ()>,
{
    match globals.bind::<I, _, _>(qh, version, ()) {
        Ok(proxy) => Some(proxy),
        Err(e) => {
            debug!("Upstream {} not bound: {}", I::interface().name, e);
            None
        }
    }
}

impl Upstream for WaylandDisplay {
    fn globals(&self) -> &UpstreamGlobals {
        &self.globals
    }

    fn serial(&self) -> u32 {
        self.inner.borrow().state.serial
    }

    fn roundtrip(&self) -> Result<(), UpstreamError> {
        let mut inner = self.inner.borrow_mut();
        let Inner { queue, state } = &mut *inner;
        queue
            .roundtrip(state)
            .map(|_| ())
            .map_err(|e| UpstreamError::Dispatch(e.to_string()))
    }

    fn take_events(&self) -> Vec<UpstreamEvent> {
        std::mem::take(&mut self.inner.borrow_mut().state.events)
    }

    fn create_surface(&self) -> SurfaceHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        let surface = state.compositor.create_surface(&state.qh, key);
        state.surfaces.insert(key, surface);
        SurfaceHandle::from_raw(key)
    }

    fn surface_attach(&self, surface: SurfaceHandle, buffer: Option<BufferHandle>, x: i32, y: i32) {
        let inner = self.inner.borrow();
        let state = &inner.state;
        let Some(wl_surface) = state.surfaces.get(&surface.raw()) else {
            return;
        };
        let wl_buffer = buffer.and_then(|b| state.buffers.get(&b.raw()));
        wl_surface.attach(wl_buffer, x, y);
    }

    fn surface_damage(&self, surface: SurfaceHandle, x: i32, y: i32, width: i32, height: i32) {
        if let Some(wl_surface) = self.inner.borrow().state.surfaces.get(&surface.raw()) {
            wl_surface.damage(x, y, width, height);
        }
    }

    fn surface_frame(&self, surface: SurfaceHandle) -> CallbackHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        if let Some(wl_surface) = state.surfaces.get(&surface.raw()) {
            let callback = wl_surface.frame(&state.qh, key);
            state.callbacks.insert(key, callback);
        }
        CallbackHandle::from_raw(key)
    }

    fn surface_commit(&self, surface: SurfaceHandle) {
        if let Some(wl_surface) = self.inner.borrow().state.surfaces.get(&surface.raw()) {
            wl_surface.commit();
        }
    }

    fn destroy_surface(&self, surface: SurfaceHandle) {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        state.input_clients.remove(&surface.raw());
        if let Some(wl_surface) = state.surfaces.remove(&surface.raw()) {
            wl_surface.destroy();
        }
    }

    fn destroy_callback(&self, callback: CallbackHandle) {
        self.inner
            .borrow_mut()
            .state
            .callbacks
            .remove(&callback.raw());
    }

    fn create_xdg_surface(&self, surface: SurfaceHandle) -> XdgSurfaceHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        if let (Some(wm_base), Some(wl_surface)) =
            (state.xdg_wm_base.as_ref(), state.surfaces.get(&surface.raw()))
        {
            let xdg_surface =
                wm_base.get_xdg_surface(wl_surface, &state.qh, XdgRoleData::Toplevel(key));
            let toplevel = xdg_surface.get_toplevel(&state.qh, key);
            // The initial commit asks for the first configure.
            wl_surface.commit();
            state.xdg_toplevels.insert(
                key,
                XdgToplevelRole {
                    surface: surface.raw(),
                    xdg_surface,
                    toplevel,
                    pending_size: (0, 0),
                },
            );
        }
        XdgSurfaceHandle::from_raw(key)
    }

    fn xdg_surface_set_title(&self, role: XdgSurfaceHandle, title: &str) {
        if let Some(role) = self.inner.borrow().state.xdg_toplevels.get(&role.raw()) {
            role.toplevel.set_title(title.to_owned());
        }
    }

    fn xdg_surface_ack_configure(&self, role: XdgSurfaceHandle, serial: u32) {
        if let Some(role) = self.inner.borrow().state.xdg_toplevels.get(&role.raw()) {
            role.xdg_surface.ack_configure(serial);
        }
    }

    fn destroy_xdg_surface(&self, role: XdgSurfaceHandle) {
        if let Some(role) = self
            .inner
            .borrow_mut()
            .state
            .xdg_toplevels
            .remove(&role.raw())
        {
            role.toplevel.destroy();
            role.xdg_surface.destroy();
        }
    }

    fn create_xdg_popup(
        &self,
        surface: SurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
    ) -> Option<XdgPopupHandle> {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        let wm_base = state.xdg_wm_base.as_ref()?;
        let wl_surface = state.surfaces.get(&surface.raw())?;
        let parent_role = state
            .xdg_toplevels
            .values()
            .find(|role| role.surface == parent.raw())?;

        let positioner = wm_base.create_positioner(&state.qh, ());
        positioner.set_size(1, 1);
        positioner.set_anchor_rect(x, y, 1, 1);
        positioner.set_anchor(xdg_positioner::Anchor::TopLeft);
        positioner.set_gravity(xdg_positioner::Gravity::BottomRight);

        let xdg_surface = wm_base.get_xdg_surface(wl_surface, &state.qh, XdgRoleData::Popup(key));
        let popup = xdg_surface.get_popup(Some(&parent_role.xdg_surface), &positioner, &state.qh, key);
        positioner.destroy();
        if let Some(seat) = state.seat.as_ref() {
            popup.grab(seat, serial);
        }
        wl_surface.commit();

        state
            .xdg_popups
            .insert(key, XdgPopupRole { xdg_surface, popup });
        Some(XdgPopupHandle::from_raw(key))
    }

    fn xdg_popup_ack_configure(&self, popup: XdgPopupHandle, serial: u32) {
        if let Some(role) = self.inner.borrow().state.xdg_popups.get(&popup.raw()) {
            role.xdg_surface.ack_configure(serial);
        }
    }

    fn destroy_xdg_popup(&self, popup: XdgPopupHandle) {
        if let Some(role) = self.inner.borrow_mut().state.xdg_popups.remove(&popup.raw()) {
            role.popup.destroy();
            role.xdg_surface.destroy();
        }
    }

    fn create_shell_surface(&self, surface: SurfaceHandle) -> ShellSurfaceHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        if let (Some(shell), Some(wl_surface)) =
            (state.shell.as_ref(), state.surfaces.get(&surface.raw()))
        {
            let shell_surface = shell.get_shell_surface(wl_surface, &state.qh, key);
            state.shell_surfaces.insert(key, shell_surface);
        }
        ShellSurfaceHandle::from_raw(key)
    }

    fn shell_surface_set_toplevel(&self, role: ShellSurfaceHandle) {
        if let Some(shell_surface) = self.inner.borrow().state.shell_surfaces.get(&role.raw()) {
            shell_surface.set_toplevel();
        }
    }

    fn shell_surface_set_title(&self, role: ShellSurfaceHandle, title: &str) {
        if let Some(shell_surface) = self.inner.borrow().state.shell_surfaces.get(&role.raw()) {
            shell_surface.set_title(title.to_owned());
        }
    }

    fn shell_surface_set_popup(
        &self,
        role: ShellSurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
    ) {
        let inner = self.inner.borrow();
        let state = &inner.state;
        let (Some(shell_surface), Some(parent)) = (
            state.shell_surfaces.get(&role.raw()),
            state.surfaces.get(&parent.raw()),
        ) else {
            return;
        };
        match state.seat.as_ref() {
            Some(seat) => shell_surface.set_popup(
                seat,
                serial,
                parent,
                x,
                y,
                wl_shell_surface::Transient::empty(),
            ),
            None => warn!("No upstream seat to grab the popup with"),
        }
    }

    fn shell_surface_pong(&self, role: ShellSurfaceHandle, serial: u32) {
        if let Some(shell_surface) = self.inner.borrow().state.shell_surfaces.get(&role.raw()) {
            shell_surface.pong(serial);
        }
    }

    fn destroy_shell_surface(&self, role: ShellSurfaceHandle) {
        self.inner
            .borrow_mut()
            .state
            .shell_surfaces
            .remove(&role.raw());
    }

    fn create_ivi_surface(&self, ivi_id: u32, surface: SurfaceHandle) -> IviSurfaceHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        if let (Some(ivi), Some(wl_surface)) = (
            state.ivi_application.as_ref(),
            state.surfaces.get(&surface.raw()),
        ) {
            let ivi_surface = ivi.surface_create(ivi_id, wl_surface, &state.qh, key);
            state.ivi_surfaces.insert(key, ivi_surface);
        }
        IviSurfaceHandle::from_raw(key)
    }

    fn destroy_ivi_surface(&self, role: IviSurfaceHandle) {
        if let Some(ivi_surface) = self.inner.borrow_mut().state.ivi_surfaces.remove(&role.raw()) {
            ivi_surface.destroy();
        }
    }

    fn create_shm_buffer(
        &self,
        fd: BorrowedFd<'_>,
        size: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<BufferHandle, UpstreamError> {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let shm_format =
            wl_shm::Format::try_from(format).map_err(|_| UpstreamError::UnsupportedFormat(format))?;
        let key = state.next_key();
        let shm = state
            .shm
            .as_ref()
            .ok_or(UpstreamError::MissingGlobal("wl_shm"))?;

        let pool = shm.create_pool(fd, size, &state.qh, ());
        let buffer = pool.create_buffer(0, width, height, stride, shm_format, &state.qh, key);
        // The buffer keeps the pool's memory alive.
        pool.destroy();

        state.buffers.insert(key, buffer);
        Ok(BufferHandle::from_raw(key))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(wl_buffer) = self.inner.borrow_mut().state.buffers.remove(&buffer.raw()) {
            wl_buffer.destroy();
        }
    }

    fn bind_drm(&self, version: u32) -> Result<DrmHandle, UpstreamError> {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let advertised = state
            .drm_version
            .ok_or(UpstreamError::MissingGlobal("wl_drm"))?;
        let version = version.clamp(1, advertised);
        let key = state.next_key();
        let drm = state
            .globals
            .bind::<wl_drm::WlDrm, _, _>(&state.qh, 1..=version, key)
            .map_err(|e| UpstreamError::Bind {
                interface: "wl_drm",
                message: e.to_string(),
            })?;
        debug!("Bound upstream wl_drm v{} as {}", drm.version(), key);
        state.drms.insert(key, drm);
        Ok(DrmHandle::from_raw(key))
    }

    fn drm_authenticate(&self, drm: DrmHandle, id: u32) {
        if let Some(wl_drm) = self.inner.borrow().state.drms.get(&drm.raw()) {
            wl_drm.authenticate(id);
        }
    }

    fn drm_create_buffer(
        &self,
        drm: DrmHandle,
        name: u32,
        width: i32,
        height: i32,
        stride: u32,
        format: u32,
    ) -> BufferHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        if let Some(wl_drm) = state.drms.get(&drm.raw()) {
            let buffer = wl_drm.create_buffer(name, width, height, stride, format, &state.qh, key);
            state.buffers.insert(key, buffer);
        }
        BufferHandle::from_raw(key)
    }

    fn drm_create_planar_buffer(
        &self,
        drm: DrmHandle,
        name: u32,
        width: i32,
        height: i32,
        format: u32,
        planes: DrmPlanes,
    ) -> BufferHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        if let Some(wl_drm) = state.drms.get(&drm.raw()) {
            let [p0, p1, p2] = planes;
            let buffer = wl_drm.create_planar_buffer(
                name, width, height, format, p0.offset, p0.stride, p1.offset, p1.stride,
                p2.offset, p2.stride, &state.qh, key,
            );
            state.buffers.insert(key, buffer);
        }
        BufferHandle::from_raw(key)
    }

    fn drm_create_prime_buffer(
        &self,
        drm: DrmHandle,
        fd: BorrowedFd<'_>,
        width: i32,
        height: i32,
        format: u32,
        planes: DrmPlanes,
    ) -> BufferHandle {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let key = state.next_key();
        if let Some(wl_drm) = state.drms.get(&drm.raw()) {
            let [p0, p1, p2] = planes;
            let buffer = wl_drm.create_prime_buffer(
                fd, width, height, format, p0.offset, p0.stride, p1.offset, p1.stride,
                p2.offset, p2.stride, &state.qh, key,
            );
            state.buffers.insert(key, buffer);
        }
        BufferHandle::from_raw(key)
    }

    fn destroy_drm(&self, drm: DrmHandle) {
        self.inner.borrow_mut().state.drms.remove(&drm.raw());
    }

    fn register_input_client(&self, surface: SurfaceHandle, target: InputTarget) {
        self.inner
            .borrow_mut()
            .state
            .input_clients
            .insert(surface.raw(), target);
    }

    fn unregister_input_client(&self, surface: SurfaceHandle) {
        self.inner
            .borrow_mut()
            .state
            .input_clients
            .remove(&surface.raw());
    }

    fn load_cursor_theme(&self, name: Option<&str>, size: u32) -> Option<CursorThemeHandle> {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        let shm = state.shm.clone()?;
        let theme = match name {
            Some(name) => CursorTheme::load_from_name(&self.connection, shm, name, size),
            None => CursorTheme::load(&self.connection, shm, size),
        };
        match theme {
            Ok(theme) => {
                let key = state.next_key();
                state.cursor_themes.insert(key, theme);
                Some(CursorThemeHandle::from_raw(key))
            }
            Err(e) => {
                warn!("Failed to load cursor theme: {}", e);
                None
            }
        }
    }

    fn set_cursor(&self, cursor: Option<(CursorThemeHandle, &str)>) {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        state.cursor = cursor.map(|(theme, name)| ActiveCursor {
            theme: theme.raw(),
            name: name.to_owned(),
        });
        state.apply_cursor();
    }

    fn destroy_cursor_theme(&self, theme: CursorThemeHandle) {
        let mut inner = self.inner.borrow_mut();
        let state = &mut inner.state;
        if state
            .cursor
            .as_ref()
            .is_some_and(|active| active.theme == theme.raw())
        {
            state.cursor = None;
        }
        state.cursor_themes.remove(&theme.raw());
    }
}

impl Drop for WaylandDisplay {
    fn drop(&mut self) {
        let state = &mut self.inner.get_mut().state;
        if let Some(surface) = state.cursor_surface.take() {
            surface.destroy();
        }
        let _ = self.connection.flush();
    }
}

// --- Dispatch implementations ---

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for UpstreamState {
    fn event(
        _: &mut Self,
        _: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::GlobalRemove { name } = event {
            debug!("Upstream global {} removed", name);
        }
    }
}

delegate_noop!(UpstreamState: ignore wl_compositor::WlCompositor);
delegate_noop!(UpstreamState: ignore wl_shm::WlShm);
delegate_noop!(UpstreamState: ignore wl_shm_pool::WlShmPool);
delegate_noop!(UpstreamState: ignore wl_shell::WlShell);
delegate_noop!(UpstreamState: ignore xdg_positioner::XdgPositioner);
delegate_noop!(UpstreamState: ignore ivi_application::IviApplication);

impl Dispatch<wl_surface::WlSurface, u64> for UpstreamState {
    fn event(
        _: &mut Self,
        _: &wl_surface::WlSurface,
        _: wl_surface::Event,
        _: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_callback::WlCallback, u64> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &wl_callback::WlCallback,
        event: wl_callback::Event,
        key: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { callback_data } = event {
            if state.callbacks.remove(key).is_some() {
                state.events.push(UpstreamEvent::FrameDone {
                    callback: CallbackHandle::from_raw(*key),
                    time: callback_data,
                });
            } else {
                trace!("Dropping done for forgotten callback {}", key);
            }
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, u64> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        key: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            if state.buffers.contains_key(key) {
                state.events.push(UpstreamEvent::BufferRelease {
                    buffer: BufferHandle::from_raw(*key),
                });
            }
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for UpstreamState {
    fn event(
        _: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, XdgRoleData> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        data: &XdgRoleData,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let xdg_surface::Event::Configure { serial } = event else {
            return;
        };
        match *data {
            XdgRoleData::Toplevel(key) => {
                if let Some(role) = state.xdg_toplevels.get(&key) {
                    let (width, height) = role.pending_size;
                    state.events.push(UpstreamEvent::XdgConfigure {
                        role: XdgSurfaceHandle::from_raw(key),
                        width,
                        height,
                        serial,
                    });
                }
            }
            XdgRoleData::Popup(key) => {
                if state.xdg_popups.contains_key(&key) {
                    state.events.push(UpstreamEvent::XdgPopupConfigure {
                        popup: XdgPopupHandle::from_raw(key),
                        serial,
                    });
                }
            }
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, u64> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        key: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if let Some(role) = state.xdg_toplevels.get_mut(key) {
                    role.pending_size = (width, height);
                }
            }
            xdg_toplevel::Event::Close => trace!("Ignoring close for toplevel {}", key),
            _ => {}
        }
    }
}

impl Dispatch<xdg_popup::XdgPopup, u64> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &xdg_popup::XdgPopup,
        event: xdg_popup::Event,
        key: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_popup::Event::PopupDone = event {
            if state.xdg_popups.contains_key(key) {
                state.events.push(UpstreamEvent::XdgPopupDone {
                    popup: XdgPopupHandle::from_raw(*key),
                });
            }
        }
    }
}

impl Dispatch<wl_shell_surface::WlShellSurface, u64> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &wl_shell_surface::WlShellSurface,
        event: wl_shell_surface::Event,
        key: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if !state.shell_surfaces.contains_key(key) {
            trace!("Dropping event for forgotten shell surface {}", key);
            return;
        }
        let role = ShellSurfaceHandle::from_raw(*key);
        match event {
            wl_shell_surface::Event::Ping { serial } => {
                state.events.push(UpstreamEvent::ShellPing { role, serial });
            }
            wl_shell_surface::Event::Configure {
                edges,
                width,
                height,
            } => {
                let edges = match edges {
                    WEnum::Value(edges) => edges.bits(),
                    WEnum::Unknown(raw) => raw,
                };
                state.events.push(UpstreamEvent::ShellConfigure {
                    role,
                    edges,
                    width,
                    height,
                });
            }
            wl_shell_surface::Event::PopupDone => {
                state.events.push(UpstreamEvent::ShellPopupDone { role });
            }
            _ => {}
        }
    }
}

impl Dispatch<ivi_surface::IviSurface, u64> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &ivi_surface::IviSurface,
        event: ivi_surface::Event,
        key: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let ivi_surface::Event::Configure { width, height } = event {
            if state.ivi_surfaces.contains_key(key) {
                state.events.push(UpstreamEvent::IviConfigure {
                    role: IviSurfaceHandle::from_raw(*key),
                    width,
                    height,
                });
            }
        }
    }
}

impl Dispatch<wl_drm::WlDrm, u64> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &wl_drm::WlDrm,
        event: wl_drm::Event,
        key: &u64,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if !state.drms.contains_key(key) {
            trace!("Dropping event for forgotten wl_drm {}", key);
            return;
        }
        let drm = DrmHandle::from_raw(*key);
        let event = match event {
            wl_drm::Event::Device { name } => UpstreamEvent::DrmDevice { drm, name },
            wl_drm::Event::Format { format } => UpstreamEvent::DrmFormat { drm, format },
            wl_drm::Event::Authenticated => UpstreamEvent::DrmAuthenticated { drm },
            wl_drm::Event::Capabilities { value } => UpstreamEvent::DrmCapabilities { drm, value },
            _ => return,
        };
        state.events.push(event);
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for UpstreamState {
    fn event(
        state: &mut Self,
        seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities {
            capabilities: WEnum::Value(caps),
        } = event
        {
            if caps.contains(wl_seat::Capability::Pointer) && state.pointer.is_none() {
                state.pointer = Some(seat.get_pointer(qh, ()));
            }
        }
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for UpstreamState {
    fn event(
        state: &mut Self,
        _: &wl_pointer::WlPointer,
        event: wl_pointer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_pointer::Event::Enter {
                serial, surface, ..
            } => {
                state.serial = serial;
                state.pointer_serial = Some(serial);
                if let Some(target) = surface
                    .data::<u64>()
                    .and_then(|key| state.input_clients.get(key))
                {
                    trace!("Pointer entered surface routed to {:?}", target);
                }
                state.apply_cursor();
            }
            wl_pointer::Event::Button { serial, .. } => {
                state.serial = serial;
            }
            wl_pointer::Event::Leave { .. } => {
                state.pointer_serial = None;
            }
            _ => {}
        }
    }
}
