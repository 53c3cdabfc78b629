//! The upstream compositor connection
//!
//! Everything the backend asks of the host compositor goes through the
//! [`Upstream`] trait. Objects are named by small typed handles instead of
//! proxies so that the relay logic can run against [`RecordingUpstream`]
//! as well as the real `wayland-client` connection in [`wayland`].
//!
//! Upstream protocol events are not delivered through callbacks. The
//! connection queues them as [`UpstreamEvent`] values and the owner drains
//! them with [`Upstream::take_events`] after each dispatch, routing every
//! event to the object that owns the handle it names.

use std::os::fd::BorrowedFd;

use crate::embedder::InputTarget;
use crate::error::UpstreamError;

pub mod recording;
pub mod wayland;

pub use recording::{RecordingUpstream, Request};
pub use wayland::WaylandDisplay;

macro_rules! upstream_handles {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl $name {
                /// Wraps a raw key handed out by an [`Upstream`] implementation.
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

upstream_handles! {
    /// An upstream `wl_surface`.
    SurfaceHandle;
    /// A one-shot upstream `wl_callback` from `wl_surface.frame`.
    CallbackHandle;
    /// An upstream `wl_buffer`, shared-memory or DRM backed.
    BufferHandle;
    /// A modern shell role (`xdg_surface` + `xdg_toplevel`).
    XdgSurfaceHandle;
    /// A legacy `wl_shell_surface`, either top-level or popup.
    ShellSurfaceHandle;
    /// A platform-shell `ivi_surface`.
    IviSurfaceHandle;
    /// A modern positioned popup (`xdg_surface` + `xdg_popup`).
    XdgPopupHandle;
    /// One client's binding of the upstream `wl_drm` global.
    DrmHandle;
    /// A loaded cursor theme.
    CursorThemeHandle;
}

/// Which upstream globals were advertised when the connection was set up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamGlobals {
    pub compositor: bool,
    pub shm: bool,
    pub xdg_wm_base: bool,
    pub shell: bool,
    pub ivi_application: bool,
    pub seat: bool,
    /// Advertised `wl_drm` version, if any.
    pub drm: Option<u32>,
}

impl UpstreamGlobals {
    /// Everything a desktop compositor usually offers, with the modern shell.
    pub fn desktop() -> Self {
        Self {
            compositor: true,
            shm: true,
            xdg_wm_base: true,
            shell: false,
            ivi_application: false,
            seat: true,
            drm: Some(2),
        }
    }
}

/// Offset and stride of one plane of a planar DRM buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmPlane {
    pub offset: i32,
    pub stride: i32,
}

/// The three planes carried by planar and prime DRM buffer requests.
pub type DrmPlanes = [DrmPlane; 3];

/// Events received from the upstream compositor, tagged with the handle
/// of the object they were sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// `wl_callback.done`
    FrameDone { callback: CallbackHandle, time: u32 },
    /// `xdg_toplevel.configure` folded into the `xdg_surface.configure`
    /// that latches it.
    XdgConfigure {
        role: XdgSurfaceHandle,
        width: i32,
        height: i32,
        serial: u32,
    },
    /// `wl_shell_surface.ping`
    ShellPing { role: ShellSurfaceHandle, serial: u32 },
    /// `wl_shell_surface.configure`
    ShellConfigure {
        role: ShellSurfaceHandle,
        edges: u32,
        width: i32,
        height: i32,
    },
    /// `wl_shell_surface.popup_done`
    ShellPopupDone { role: ShellSurfaceHandle },
    /// `ivi_surface.configure`
    IviConfigure {
        role: IviSurfaceHandle,
        width: i32,
        height: i32,
    },
    /// `xdg_surface.configure` of a popup; its geometry is fixed by the
    /// positioner, so only the serial matters.
    XdgPopupConfigure { popup: XdgPopupHandle, serial: u32 },
    /// `xdg_popup.popup_done`
    XdgPopupDone { popup: XdgPopupHandle },
    /// `wl_buffer.release`
    BufferRelease { buffer: BufferHandle },
    /// `wl_drm.device`
    DrmDevice { drm: DrmHandle, name: String },
    /// `wl_drm.format`
    DrmFormat { drm: DrmHandle, format: u32 },
    /// `wl_drm.authenticated`
    DrmAuthenticated { drm: DrmHandle },
    /// `wl_drm.capabilities`
    DrmCapabilities { drm: DrmHandle, value: u32 },
}

/// The host compositor as seen by the backend.
///
/// One connection is shared by every view in the process; components hold
/// an `Rc<dyn Upstream>` rather than reaching for a global. All methods take
/// `&self` because the connection is only ever touched from the dispatch
/// thread. Destroy methods tolerate handles that are already gone.
pub trait Upstream {
    fn globals(&self) -> &UpstreamGlobals;

    /// Serial of the most recent input event, used to grab popups.
    fn serial(&self) -> u32;

    /// Blocks until the compositor has processed every request sent so far.
    /// Events received meanwhile are queued for [`Upstream::take_events`].
    fn roundtrip(&self) -> Result<(), UpstreamError>;

    /// Drains the events queued since the last call.
    fn take_events(&self) -> Vec<UpstreamEvent>;

    fn create_surface(&self) -> SurfaceHandle;
    fn surface_attach(&self, surface: SurfaceHandle, buffer: Option<BufferHandle>, x: i32, y: i32);
    fn surface_damage(&self, surface: SurfaceHandle, x: i32, y: i32, width: i32, height: i32);
    fn surface_frame(&self, surface: SurfaceHandle) -> CallbackHandle;
    fn surface_commit(&self, surface: SurfaceHandle);
    fn destroy_surface(&self, surface: SurfaceHandle);
    fn destroy_callback(&self, callback: CallbackHandle);

    fn create_xdg_surface(&self, surface: SurfaceHandle) -> XdgSurfaceHandle;
    fn xdg_surface_set_title(&self, role: XdgSurfaceHandle, title: &str);
    fn xdg_surface_ack_configure(&self, role: XdgSurfaceHandle, serial: u32);
    fn destroy_xdg_surface(&self, role: XdgSurfaceHandle);

    /// Creates a positioned popup on `surface`, anchored at (`x`, `y`) on
    /// `parent`. Returns `None` when `parent` carries no modern shell role.
    fn create_xdg_popup(
        &self,
        surface: SurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
    ) -> Option<XdgPopupHandle>;
    fn xdg_popup_ack_configure(&self, popup: XdgPopupHandle, serial: u32);
    fn destroy_xdg_popup(&self, popup: XdgPopupHandle);

    fn create_shell_surface(&self, surface: SurfaceHandle) -> ShellSurfaceHandle;
    fn shell_surface_set_toplevel(&self, role: ShellSurfaceHandle);
    fn shell_surface_set_title(&self, role: ShellSurfaceHandle, title: &str);
    fn shell_surface_set_popup(
        &self,
        role: ShellSurfaceHandle,
        parent: SurfaceHandle,
        serial: u32,
        x: i32,
        y: i32,
    );
    fn shell_surface_pong(&self, role: ShellSurfaceHandle, serial: u32);
    fn destroy_shell_surface(&self, role: ShellSurfaceHandle);

    fn create_ivi_surface(&self, ivi_id: u32, surface: SurfaceHandle) -> IviSurfaceHandle;
    fn destroy_ivi_surface(&self, role: IviSurfaceHandle);

    /// Wraps `fd` in a one-off pool and creates a buffer covering all of it.
    /// `format` is already in `wl_shm` numbering.
    #[allow(clippy::too_many_arguments)]
    fn create_shm_buffer(
        &self,
        fd: BorrowedFd<'_>,
        size: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<BufferHandle, UpstreamError>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    fn bind_drm(&self, version: u32) -> Result<DrmHandle, UpstreamError>;
    fn drm_authenticate(&self, drm: DrmHandle, id: u32);
    #[allow(clippy::too_many_arguments)]
    fn drm_create_buffer(
        &self,
        drm: DrmHandle,
        name: u32,
        width: i32,
        height: i32,
        stride: u32,
        format: u32,
    ) -> BufferHandle;
    #[allow(clippy::too_many_arguments)]
    fn drm_create_planar_buffer(
        &self,
        drm: DrmHandle,
        name: u32,
        width: i32,
        height: i32,
        format: u32,
        planes: DrmPlanes,
    ) -> BufferHandle;
    #[allow(clippy::too_many_arguments)]
    fn drm_create_prime_buffer(
        &self,
        drm: DrmHandle,
        fd: BorrowedFd<'_>,
        width: i32,
        height: i32,
        format: u32,
        planes: DrmPlanes,
    ) -> BufferHandle;
    fn destroy_drm(&self, drm: DrmHandle);

    /// Routes input arriving on `surface` to `target`.
    fn register_input_client(&self, surface: SurfaceHandle, target: InputTarget);
    fn unregister_input_client(&self, surface: SurfaceHandle);

    fn load_cursor_theme(&self, name: Option<&str>, size: u32) -> Option<CursorThemeHandle>;
    /// Selects the pointer cursor, or clears it with `None`.
    fn set_cursor(&self, cursor: Option<(CursorThemeHandle, &str)>);
    fn destroy_cursor_theme(&self, theme: CursorThemeHandle);
}
