//! In-memory upstream connection
//!
//! `RecordingUpstream` answers every request locally and keeps a log of
//! what was asked. It stands in for the host compositor in tests and in
//! headless runs of the developer binary. Replies that a real compositor
//! would send in response to a request (the `wl_drm` device/format burst,
//! `authenticated`) are held back until the next roundtrip, like on the
//! wire.
//!
//! It also watches for the one mistake a real `xdg_wm_base` compositor
//! answers with a fatal error: committing a buffer on an `xdg_surface`
//! before its first configure was acked. Such commits are collected in
//! [`RecordingUpstream::unconfigured_buffer_commits`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::BorrowedFd;

use log::trace;

use super::{
    BufferHandle, CallbackHandle, CursorThemeHandle, DrmHandle, DrmPlanes, IviSurfaceHandle,
    ShellSurfaceHandle, SurfaceHandle, Upstream, UpstreamEvent, UpstreamGlobals,
    XdgPopupHandle, XdgSurfaceHandle,
};
use crate::embedder::InputTarget;
use crate::error::UpstreamError;

/// One request as it would have gone over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateSurface(SurfaceHandle),
    Attach {
        surface: SurfaceHandle,
        buffer: Option<BufferHandle>,
        x: i32,
        y: i32,
    },
    Damage {
        surface: SurfaceHandle,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    Frame {
        surface: SurfaceHandle,
        callback: CallbackHandle,
    },
    Commit(SurfaceHandle),
    DestroySurface(SurfaceHandle),
    DestroyCallback(CallbackHandle),
    CreateXdgSurface {
        surface: SurfaceHandle,
        role: XdgSurfaceHandle,
    },
    XdgSetTitle {
        role: XdgSurfaceHandle,
        title: String,
    },
    XdgAckConfigure {
        role: XdgSurfaceHandle,
        serial: u32,
    },
    DestroyXdgSurface(XdgSurfaceHandle),
    CreateXdgPopup {
        surface: SurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
        popup: XdgPopupHandle,
    },
    XdgPopupAckConfigure {
        popup: XdgPopupHandle,
        serial: u32,
    },
    DestroyXdgPopup(XdgPopupHandle),
    CreateShellSurface {
        surface: SurfaceHandle,
        role: ShellSurfaceHandle,
    },
    ShellSetToplevel(ShellSurfaceHandle),
    ShellSetTitle {
        role: ShellSurfaceHandle,
        title: String,
    },
    ShellSetPopup {
        role: ShellSurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
    },
    ShellPong {
        role: ShellSurfaceHandle,
        serial: u32,
    },
    DestroyShellSurface(ShellSurfaceHandle),
    CreateIviSurface {
        ivi_id: u32,
        surface: SurfaceHandle,
        role: IviSurfaceHandle,
    },
    DestroyIviSurface(IviSurfaceHandle),
    CreateShmBuffer {
        buffer: BufferHandle,
        size: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    },
    DestroyBuffer(BufferHandle),
    BindDrm {
        drm: DrmHandle,
        version: u32,
    },
    DrmAuthenticate {
        drm: DrmHandle,
        id: u32,
    },
    DrmCreateBuffer {
        drm: DrmHandle,
        buffer: BufferHandle,
        name: u32,
        width: i32,
        height: i32,
        stride: u32,
        format: u32,
    },
    DrmCreatePlanarBuffer {
        drm: DrmHandle,
        buffer: BufferHandle,
        name: u32,
        width: i32,
        height: i32,
        format: u32,
        planes: DrmPlanes,
    },
    DrmCreatePrimeBuffer {
        drm: DrmHandle,
        buffer: BufferHandle,
        width: i32,
        height: i32,
        format: u32,
        planes: DrmPlanes,
    },
    DestroyDrm(DrmHandle),
    RegisterInput {
        surface: SurfaceHandle,
        target: InputTarget,
    },
    UnregisterInput(SurfaceHandle),
    LoadCursorTheme {
        theme: Option<CursorThemeHandle>,
        name: Option<String>,
        size: u32,
    },
    SetCursor(Option<(CursorThemeHandle, String)>),
    DestroyCursorTheme(CursorThemeHandle),
    Roundtrip,
}

/// Kinds of upstream objects tracked by [`RecordingUpstream::live_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Surface,
    Callback,
    Buffer,
    XdgSurface,
    XdgPopup,
    ShellSurface,
    IviSurface,
    Drm,
    CursorTheme,
}

#[derive(Debug, Default)]
struct RecordingState {
    next_key: u64,
    serial: u32,
    requests: Vec<Request>,
    live: HashMap<u64, ObjectKind>,
    // surface key -> modern role, to parent popups
    xdg_roles: HashMap<u64, XdgSurfaceHandle>,
    // popup key -> surface key
    popup_surfaces: HashMap<u64, u64>,
    // surfaces with an xdg role whose first configure is not acked yet
    awaiting_configure: HashSet<u64>,
    // surfaces with a buffer attached
    buffer_attached: HashSet<u64>,
    unconfigured_commits: Vec<SurfaceHandle>,
    configure_serial: u32,
    input_clients: HashMap<SurfaceHandle, InputTarget>,
    cursor: Option<(CursorThemeHandle, String)>,
    events: Vec<UpstreamEvent>,
    // replies released by the next roundtrip
    in_flight: VecDeque<UpstreamEvent>,
}

impl RecordingState {
    fn allocate(&mut self, kind: ObjectKind) -> u64 {
        self.next_key += 1;
        self.live.insert(self.next_key, kind);
        self.next_key
    }

    fn next_configure_serial(&mut self) -> u32 {
        self.configure_serial += 1;
        self.configure_serial
    }
}

/// An [`Upstream`] that never leaves the process.
#[derive(Debug)]
pub struct RecordingUpstream {
    globals: UpstreamGlobals,
    drm_device: Option<(String, Vec<u32>)>,
    cursor_themes: bool,
    initial_configure: bool,
    failing_roundtrips: bool,
    state: RefCell<RecordingState>,
}

impl Default for RecordingUpstream {
    fn default() -> Self {
        Self::new(UpstreamGlobals::desktop())
    }
}

impl RecordingUpstream {
    pub fn new(globals: UpstreamGlobals) -> Self {
        Self {
            globals,
            drm_device: None,
            cursor_themes: true,
            initial_configure: false,
            failing_roundtrips: false,
            state: RefCell::new(RecordingState::default()),
        }
    }

    /// Answers every `wl_drm` bind with a device name and format list.
    pub fn with_drm_device(mut self, name: impl Into<String>, formats: Vec<u32>) -> Self {
        self.drm_device = Some((name.into(), formats));
        self
    }

    /// Makes cursor theme loading fail, as on a system without themes.
    pub fn without_cursor_themes(mut self) -> Self {
        self.cursor_themes = false;
        self
    }

    /// Answers every new `xdg_surface` with an initial zero-size configure,
    /// as a compositor does after the role's first commit.
    pub fn with_initial_configure(mut self) -> Self {
        self.initial_configure = true;
        self
    }

    /// Makes every roundtrip fail, as when the connection has broken.
    pub fn with_failing_roundtrips(mut self) -> Self {
        self.failing_roundtrips = true;
        self
    }

    /// Queues an event as if the compositor had just sent it.
    pub fn push_event(&self, event: UpstreamEvent) {
        self.state.borrow_mut().events.push(event);
    }

    pub fn set_serial(&self, serial: u32) {
        self.state.borrow_mut().serial = serial;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.borrow().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.borrow_mut().requests.clear();
    }

    /// Number of logged requests matching `pred`.
    pub fn count(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.state.borrow().requests.iter().filter(|r| pred(r)).count()
    }

    /// Position of the first logged request matching `pred`.
    pub fn position(&self, pred: impl Fn(&Request) -> bool) -> Option<usize> {
        self.state.borrow().requests.iter().position(|r| pred(r))
    }

    pub fn roundtrips(&self) -> usize {
        self.count(|r| matches!(r, Request::Roundtrip))
    }

    pub fn is_live(&self, raw: u64) -> bool {
        self.state.borrow().live.contains_key(&raw)
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state
            .borrow()
            .live
            .values()
            .filter(|k| **k == kind)
            .count()
    }

    pub fn input_target(&self, surface: SurfaceHandle) -> Option<InputTarget> {
        self.state.borrow().input_clients.get(&surface).copied()
    }

    pub fn cursor(&self) -> Option<(CursorThemeHandle, String)> {
        self.state.borrow().cursor.clone()
    }

    /// Surfaces that committed a buffer before acking their first
    /// `xdg_surface.configure`, once per offending commit.
    pub fn unconfigured_buffer_commits(&self) -> Vec<SurfaceHandle> {
        self.state.borrow().unconfigured_commits.clone()
    }

    fn record(&self, request: Request) {
        trace!("upstream <- {:?}", request);
        self.state.borrow_mut().requests.push(request);
    }

    fn allocate(&self, kind: ObjectKind) -> u64 {
        self.state.borrow_mut().allocate(kind)
    }

    fn release(&self, raw: u64) {
        self.state.borrow_mut().live.remove(&raw);
    }

    fn create_buffer_object(&self) -> BufferHandle {
        BufferHandle::from_raw(self.allocate(ObjectKind::Buffer))
    }
}

impl Upstream for RecordingUpstream {
    fn globals(&self) -> &UpstreamGlobals {
        &self.globals
    }

    fn serial(&self) -> u32 {
        self.state.borrow().serial
    }

    fn roundtrip(&self) -> Result<(), UpstreamError> {
        self.record(Request::Roundtrip);
        if self.failing_roundtrips {
            return Err(UpstreamError::Dispatch("connection reset by peer".to_string()));
        }
        let mut state = self.state.borrow_mut();
        let replies: Vec<_> = state.in_flight.drain(..).collect();
        state.events.extend(replies);
        Ok(())
    }

    fn take_events(&self) -> Vec<UpstreamEvent> {
        std::mem::take(&mut self.state.borrow_mut().events)
    }

    fn create_surface(&self) -> SurfaceHandle {
        let surface = SurfaceHandle::from_raw(self.allocate(ObjectKind::Surface));
        self.record(Request::CreateSurface(surface));
        surface
    }

    fn surface_attach(&self, surface: SurfaceHandle, buffer: Option<BufferHandle>, x: i32, y: i32) {
        {
            let mut state = self.state.borrow_mut();
            if buffer.is_some() {
                state.buffer_attached.insert(surface.raw());
            } else {
                state.buffer_attached.remove(&surface.raw());
            }
        }
        self.record(Request::Attach {
            surface,
            buffer,
            x,
            y,
        });
    }

    fn surface_damage(&self, surface: SurfaceHandle, x: i32, y: i32, width: i32, height: i32) {
        self.record(Request::Damage {
            surface,
            x,
            y,
            width,
            height,
        });
    }

    fn surface_frame(&self, surface: SurfaceHandle) -> CallbackHandle {
        let callback = CallbackHandle::from_raw(self.allocate(ObjectKind::Callback));
        self.record(Request::Frame { surface, callback });
        callback
    }

    fn surface_commit(&self, surface: SurfaceHandle) {
        {
            let mut state = self.state.borrow_mut();
            let key = surface.raw();
            if state.awaiting_configure.contains(&key) && state.buffer_attached.contains(&key) {
                state.unconfigured_commits.push(surface);
            }
        }
        self.record(Request::Commit(surface));
    }

    fn destroy_surface(&self, surface: SurfaceHandle) {
        self.release(surface.raw());
        {
            let mut state = self.state.borrow_mut();
            state.xdg_roles.remove(&surface.raw());
            state.awaiting_configure.remove(&surface.raw());
            state.buffer_attached.remove(&surface.raw());
        }
        self.record(Request::DestroySurface(surface));
    }

    fn destroy_callback(&self, callback: CallbackHandle) {
        self.release(callback.raw());
        self.record(Request::DestroyCallback(callback));
    }

    fn create_xdg_surface(&self, surface: SurfaceHandle) -> XdgSurfaceHandle {
        let role = XdgSurfaceHandle::from_raw(self.allocate(ObjectKind::XdgSurface));
        {
            let mut state = self.state.borrow_mut();
            state.xdg_roles.insert(surface.raw(), role);
            state.awaiting_configure.insert(surface.raw());
            if self.initial_configure {
                let serial = state.next_configure_serial();
                state.events.push(UpstreamEvent::XdgConfigure {
                    role,
                    width: 0,
                    height: 0,
                    serial,
                });
            }
        }
        self.record(Request::CreateXdgSurface { surface, role });
        role
    }

    fn xdg_surface_set_title(&self, role: XdgSurfaceHandle, title: &str) {
        self.record(Request::XdgSetTitle {
            role,
            title: title.to_owned(),
        });
    }

    fn xdg_surface_ack_configure(&self, role: XdgSurfaceHandle, serial: u32) {
        {
            let mut state = self.state.borrow_mut();
            let surface = state
                .xdg_roles
                .iter()
                .find(|(_, existing)| **existing == role)
                .map(|(surface, _)| *surface);
            if let Some(surface) = surface {
                state.awaiting_configure.remove(&surface);
            }
        }
        self.record(Request::XdgAckConfigure { role, serial });
    }

    fn destroy_xdg_surface(&self, role: XdgSurfaceHandle) {
        self.release(role.raw());
        {
            let mut state = self.state.borrow_mut();
            let surfaces: Vec<u64> = state
                .xdg_roles
                .iter()
                .filter(|(_, existing)| **existing == role)
                .map(|(surface, _)| *surface)
                .collect();
            for surface in surfaces {
                state.xdg_roles.remove(&surface);
                state.awaiting_configure.remove(&surface);
            }
        }
        self.record(Request::DestroyXdgSurface(role));
    }

    fn create_xdg_popup(
        &self,
        surface: SurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
    ) -> Option<XdgPopupHandle> {
        if !self.state.borrow().xdg_roles.contains_key(&parent.raw()) {
            return None;
        }
        let popup = XdgPopupHandle::from_raw(self.allocate(ObjectKind::XdgPopup));
        {
            let mut state = self.state.borrow_mut();
            state.popup_surfaces.insert(popup.raw(), surface.raw());
            state.awaiting_configure.insert(surface.raw());
            if self.initial_configure {
                let serial = state.next_configure_serial();
                state
                    .events
                    .push(UpstreamEvent::XdgPopupConfigure { popup, serial });
            }
        }
        self.record(Request::CreateXdgPopup {
            surface,
            parent,
            serial,
            x,
            y,
            popup,
        });
        Some(popup)
    }

    fn xdg_popup_ack_configure(&self, popup: XdgPopupHandle, serial: u32) {
        {
            let mut state = self.state.borrow_mut();
            if let Some(surface) = state.popup_surfaces.get(&popup.raw()).copied() {
                state.awaiting_configure.remove(&surface);
            }
        }
        self.record(Request::XdgPopupAckConfigure { popup, serial });
    }

    fn destroy_xdg_popup(&self, popup: XdgPopupHandle) {
        self.release(popup.raw());
        {
            let mut state = self.state.borrow_mut();
            if let Some(surface) = state.popup_surfaces.remove(&popup.raw()) {
                state.awaiting_configure.remove(&surface);
            }
        }
        self.record(Request::DestroyXdgPopup(popup));
    }

    fn create_shell_surface(&self, surface: SurfaceHandle) -> ShellSurfaceHandle {
        let role = ShellSurfaceHandle::from_raw(self.allocate(ObjectKind::ShellSurface));
        self.record(Request::CreateShellSurface { surface, role });
        role
    }

    fn shell_surface_set_toplevel(&self, role: ShellSurfaceHandle) {
        self.record(Request::ShellSetToplevel(role));
    }

    fn shell_surface_set_title(&self, role: ShellSurfaceHandle, title: &str) {
        self.record(Request::ShellSetTitle {
            role,
            title: title.to_owned(),
        });
    }

    fn shell_surface_set_popup(
        &self,
        role: ShellSurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
    ) {
        self.record(Request::ShellSetPopup {
            role,
            parent,
            serial,
            x,
            y,
        });
    }

    fn shell_surface_pong(&self, role: ShellSurfaceHandle, serial: u32) {
        self.record(Request::ShellPong { role, serial });
    }

    fn destroy_shell_surface(&self, role: ShellSurfaceHandle) {
        self.release(role.raw());
        self.record(Request::DestroyShellSurface(role));
    }

    fn create_ivi_surface(&self, ivi_id: u32, surface: SurfaceHandle) -> IviSurfaceHandle {
        let role = IviSurfaceHandle::from_raw(self.allocate(ObjectKind::IviSurface));
        self.record(Request::CreateIviSurface {
            ivi_id,
            surface,
            role,
        });
        role
    }

    fn destroy_ivi_surface(&self, role: IviSurfaceHandle) {
        self.release(role.raw());
        self.record(Request::DestroyIviSurface(role));
    }

    fn create_shm_buffer(
        &self,
        _fd: BorrowedFd<'_>,
        size: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<BufferHandle, UpstreamError> {
        if !self.globals.shm {
            return Err(UpstreamError::MissingGlobal("wl_shm"));
        }
        let buffer = self.create_buffer_object();
        self.record(Request::CreateShmBuffer {
            buffer,
            size,
            width,
            height,
            stride,
            format,
        });
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.release(buffer.raw());
        self.record(Request::DestroyBuffer(buffer));
    }

    fn bind_drm(&self, version: u32) -> Result<DrmHandle, UpstreamError> {
        if self.globals.drm.is_none() {
            return Err(UpstreamError::MissingGlobal("wl_drm"));
        }
        let drm = DrmHandle::from_raw(self.allocate(ObjectKind::Drm));
        self.record(Request::BindDrm { drm, version });
        if let Some((name, formats)) = &self.drm_device {
            let mut state = self.state.borrow_mut();
            state.in_flight.push_back(UpstreamEvent::DrmDevice {
                drm,
                name: name.clone(),
            });
            for format in formats {
                state.in_flight.push_back(UpstreamEvent::DrmFormat {
                    drm,
                    format: *format,
                });
            }
            if version >= 2 {
                state
                    .in_flight
                    .push_back(UpstreamEvent::DrmCapabilities { drm, value: 1 });
            }
        }
        Ok(drm)
    }

    fn drm_authenticate(&self, drm: DrmHandle, id: u32) {
        self.record(Request::DrmAuthenticate { drm, id });
        self.state
            .borrow_mut()
            .in_flight
            .push_back(UpstreamEvent::DrmAuthenticated { drm });
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
        let buffer = self.create_buffer_object();
        self.record(Request::DrmCreateBuffer {
            drm,
            buffer,
            name,
            width,
            height,
            stride,
            format,
        });
        buffer
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
        let buffer = self.create_buffer_object();
        self.record(Request::DrmCreatePlanarBuffer {
            drm,
            buffer,
            name,
            width,
            height,
            format,
            planes,
        });
        buffer
    }

    fn drm_create_prime_buffer(
        &self,
        drm: DrmHandle,
        _fd: BorrowedFd<'_>,
        width: i32,
        height: i32,
        format: u32,
        planes: DrmPlanes,
    ) -> BufferHandle {
        let buffer = self.create_buffer_object();
        self.record(Request::DrmCreatePrimeBuffer {
            drm,
            buffer,
            width,
            height,
            format,
            planes,
        });
        buffer
    }

    fn destroy_drm(&self, drm: DrmHandle) {
        self.release(drm.raw());
        self.record(Request::DestroyDrm(drm));
    }

    fn register_input_client(&self, surface: SurfaceHandle, target: InputTarget) {
        self.state.borrow_mut().input_clients.insert(surface, target);
        self.record(Request::RegisterInput { surface, target });
    }

    fn unregister_input_client(&self, surface: SurfaceHandle) {
        self.state.borrow_mut().input_clients.remove(&surface);
        self.record(Request::UnregisterInput(surface));
    }

    fn load_cursor_theme(&self, name: Option<&str>, size: u32) -> Option<CursorThemeHandle> {
        let theme = self
            .cursor_themes
            .then(|| CursorThemeHandle::from_raw(self.allocate(ObjectKind::CursorTheme)));
        self.record(Request::LoadCursorTheme {
            theme,
            name: name.map(str::to_owned),
            size,
        });
        theme
    }

    fn set_cursor(&self, cursor: Option<(CursorThemeHandle, &str)>) {
        let cursor = cursor.map(|(theme, name)| (theme, name.to_owned()));
        self.state.borrow_mut().cursor = cursor.clone();
        self.record(Request::SetCursor(cursor));
    }

    fn destroy_cursor_theme(&self, theme: CursorThemeHandle) {
        self.release(theme.raw());
        self.record(Request::DestroyCursorTheme(theme));
    }
}
