//! The `wl_drm` proxy
//!
//! Nested clients bind a `wl_drm` global published by the backend. Each
//! binding gets its own upstream `wl_drm`, and everything is relayed 1:1:
//! requests go up unchanged, and events from an upstream binding go back
//! to the one downstream resource it was bound for. Buffers created through
//! the proxy get their upstream `wl_buffer.release` relayed the same way.
//!
//! [`DrmRelay`] holds the tables and is generic over the downstream side so
//! it can be driven without a live client. The `wayland-server` glue at the
//! bottom of this file feeds it from [`ViewBackend`].

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;
use std::sync::OnceLock;

use log::{debug, trace, warn};
use wayland_backend::protocol::ProtocolError;
use wayland_backend::server::{ClientId, DisconnectReason};
use wayland_server::protocol::wl_buffer;
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use crate::backend::ViewBackend;
use crate::error::UpstreamError;
use crate::protocols::drm::server::wl_drm;
use crate::upstream::{BufferHandle, DrmHandle, DrmPlane, DrmPlanes, Upstream, UpstreamEvent};

/// `wl_display.error.no_memory`
const WL_DISPLAY_NO_MEMORY: u32 = 2;

/// Downstream end of one `wl_drm` binding.
pub trait DrmResource {
    fn send_device(&self, name: &str);
    fn send_format(&self, format: u32);
    fn send_authenticated(&self);
    fn send_capabilities(&self, value: u32);
    /// Fails the requesting client with `wl_display.error.no_memory`.
    fn post_no_memory(&self);
}

/// Downstream end of a buffer created through the proxy.
pub trait DrmBufferResource {
    /// Whether the downstream object could be created.
    fn is_usable(&self) -> bool;
    fn send_release(&self);
}

/// Arguments of `wl_drm.create_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrmBufferParams {
    pub name: u32,
    pub width: i32,
    pub height: i32,
    pub stride: u32,
    pub format: u32,
}

/// Arguments of `wl_drm.create_planar_buffer` and
/// `wl_drm.create_prime_buffer`, minus the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrmPlanarParams {
    pub width: i32,
    pub height: i32,
    pub format: u32,
    pub planes: DrmPlanes,
}

pub struct DrmRelay<R, B> {
    upstream: Rc<dyn Upstream>,
    bindings: HashMap<DrmHandle, R>,
    buffers: HashMap<BufferHandle, B>,
}

impl<R: DrmResource, B: DrmBufferResource> DrmRelay<R, B> {
    pub fn new(upstream: Rc<dyn Upstream>) -> Self {
        Self {
            upstream,
            bindings: HashMap::new(),
            buffers: HashMap::new(),
        }
    }

    /// Binds an upstream `wl_drm` for `resource` and waits for the
    /// compositor to answer. The replies are queued upstream; route them
    /// with [`DrmRelay::handle_event`] before returning to the client.
    pub fn bind(&mut self, resource: R, version: u32) -> Result<DrmHandle, UpstreamError> {
        let drm = self.upstream.bind_drm(version)?;
        self.bindings.insert(drm, resource);
        debug!("Relaying wl_drm v{} as {:?}", version, drm);
        if let Err(e) = self.upstream.roundtrip() {
            self.unbind(drm);
            return Err(e);
        }
        Ok(drm)
    }

    /// Forwards `wl_drm.authenticate` and waits for the compositor to
    /// process it.
    pub fn authenticate(&mut self, drm: DrmHandle, id: u32) -> Result<(), UpstreamError> {
        if !self.bindings.contains_key(&drm) {
            return Ok(());
        }
        self.upstream.drm_authenticate(drm, id);
        debug!("Authenticating {:?} upstream", drm);
        self.upstream.roundtrip()
    }

    /// Checks the downstream buffer before anything goes upstream. An
    /// unusable one fails the client with no-memory.
    fn admit(&self, drm: DrmHandle, buffer: &B) -> bool {
        let Some(resource) = self.bindings.get(&drm) else {
            return false;
        };
        if buffer.is_usable() {
            return true;
        }
        warn!("No memory for a wl_buffer on {:?}", drm);
        resource.post_no_memory();
        false
    }

    pub fn create_buffer(
        &mut self,
        drm: DrmHandle,
        buffer: B,
        params: DrmBufferParams,
    ) -> Option<BufferHandle> {
        if !self.admit(drm, &buffer) {
            return None;
        }
        let DrmBufferParams {
            name,
            width,
            height,
            stride,
            format,
        } = params;
        let handle = self
            .upstream
            .drm_create_buffer(drm, name, width, height, stride, format);
        self.buffers.insert(handle, buffer);
        Some(handle)
    }

    pub fn create_planar_buffer(
        &mut self,
        drm: DrmHandle,
        buffer: B,
        name: u32,
        params: DrmPlanarParams,
    ) -> Option<BufferHandle> {
        if !self.admit(drm, &buffer) {
            return None;
        }
        let handle = self.upstream.drm_create_planar_buffer(
            drm,
            name,
            params.width,
            params.height,
            params.format,
            params.planes,
        );
        self.buffers.insert(handle, buffer);
        Some(handle)
    }

    pub fn create_prime_buffer(
        &mut self,
        drm: DrmHandle,
        buffer: B,
        fd: OwnedFd,
        params: DrmPlanarParams,
    ) -> Option<BufferHandle> {
        if !self.admit(drm, &buffer) {
            return None;
        }
        let handle = self.upstream.drm_create_prime_buffer(
            drm,
            fd.as_fd(),
            params.width,
            params.height,
            params.format,
            params.planes,
        );
        self.buffers.insert(handle, buffer);
        Some(handle)
    }

    /// Destroys the upstream buffer behind a downstream one. Idempotent.
    pub fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer).is_some() {
            self.upstream.destroy_buffer(buffer);
        }
    }

    /// Drops one client's binding and its upstream `wl_drm`. Idempotent.
    pub fn unbind(&mut self, drm: DrmHandle) {
        if self.bindings.remove(&drm).is_some() {
            self.upstream.destroy_drm(drm);
            debug!("Dropped wl_drm relay {:?}", drm);
        }
    }

    /// Relays an upstream event if it concerns a binding or buffer of
    /// this proxy. Returns whether it did.
    pub fn handle_event(&mut self, event: &UpstreamEvent) -> bool {
        match event {
            UpstreamEvent::DrmDevice { drm, name } => {
                self.relay(*drm, |resource| resource.send_device(name))
            }
            UpstreamEvent::DrmFormat { drm, format } => {
                self.relay(*drm, |resource| resource.send_format(*format))
            }
            UpstreamEvent::DrmAuthenticated { drm } => {
                self.relay(*drm, |resource| resource.send_authenticated())
            }
            UpstreamEvent::DrmCapabilities { drm, value } => {
                self.relay(*drm, |resource| resource.send_capabilities(*value))
            }
            UpstreamEvent::BufferRelease { buffer } => match self.buffers.get(buffer) {
                Some(resource) => {
                    resource.send_release();
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn relay(&self, drm: DrmHandle, send: impl FnOnce(&R)) -> bool {
        match self.bindings.get(&drm) {
            Some(resource) => {
                send(resource);
                true
            }
            None => {
                trace!("Dropping event for unbound {:?}", drm);
                // Still a wl_drm event; nobody else wants it.
                true
            }
        }
    }

    /// Tears down every binding and buffer.
    pub fn clear(&mut self) {
        for (buffer, _) in self.buffers.drain() {
            self.upstream.destroy_buffer(buffer);
        }
        for (drm, _) in self.bindings.drain() {
            self.upstream.destroy_drm(drm);
        }
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

// --- wayland-server glue ---

/// User data of a downstream `wl_drm`.
#[derive(Debug, Default)]
pub struct DrmResourceData {
    upstream: OnceLock<DrmHandle>,
}

impl DrmResourceData {
    pub fn upstream(&self) -> Option<DrmHandle> {
        self.upstream.get().copied()
    }
}

/// User data of a downstream `wl_buffer` created through the proxy.
#[derive(Debug, Default)]
pub struct DrmBufferData {
    upstream: OnceLock<BufferHandle>,
}

impl DrmBufferData {
    pub fn upstream(&self) -> Option<BufferHandle> {
        self.upstream.get().copied()
    }
}

fn no_memory() -> DisconnectReason {
    DisconnectReason::ProtocolError(ProtocolError {
        code: WL_DISPLAY_NO_MEMORY,
        object_id: 1,
        object_interface: "wl_display".into(),
        message: "no memory".into(),
    })
}

fn post_no_memory(resource: &impl Resource) {
    let (Some(handle), Some(client)) = (resource.handle().upgrade(), resource.client()) else {
        return;
    };
    handle.kill_client(client.id(), no_memory());
}

impl DrmResource for wl_drm::WlDrm {
    fn send_device(&self, name: &str) {
        self.device(name.to_owned());
    }

    fn send_format(&self, format: u32) {
        self.format(format);
    }

    fn send_authenticated(&self) {
        self.authenticated();
    }

    fn send_capabilities(&self, value: u32) {
        if self.version() >= 2 {
            self.capabilities(value);
        }
    }

    fn post_no_memory(&self) {
        post_no_memory(self);
    }
}

impl DrmBufferResource for wl_buffer::WlBuffer {
    fn is_usable(&self) -> bool {
        self.is_alive()
    }

    fn send_release(&self) {
        if self.is_alive() {
            self.release();
        }
    }
}

impl GlobalDispatch<wl_drm::WlDrm, ()> for ViewBackend {
    fn bind(
        state: &mut Self,
        handle: &DisplayHandle,
        client: &Client,
        resource: New<wl_drm::WlDrm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let resource = data_init.init(resource, DrmResourceData::default());
        if !resource.is_alive() {
            // A dead resource no longer knows its client.
            warn!("No memory for a wl_drm binding");
            handle.backend_handle().kill_client(client.id(), no_memory());
            return;
        }

        let version = resource.version();
        match state.drm_bind(resource.clone(), version) {
            Ok(drm) => {
                if let Some(data) = resource.data::<DrmResourceData>() {
                    let _ = data.upstream.set(drm);
                }
            }
            Err(e) => {
                warn!("Failed to relay wl_drm: {}", e);
                resource.post_error(wl_drm::Error::AuthenticateFail, e.to_string());
            }
        }
    }
}

impl Dispatch<wl_drm::WlDrm, DrmResourceData> for ViewBackend {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_drm::WlDrm,
        request: wl_drm::Request,
        data: &DrmResourceData,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(drm) = data.upstream() else {
            return;
        };

        match request {
            wl_drm::Request::Authenticate { id } => state.drm_authenticate(drm, id),
            wl_drm::Request::CreateBuffer {
                id,
                name,
                width,
                height,
                stride,
                format,
            } => {
                let buffer = data_init.init(id, DrmBufferData::default());
                let params = DrmBufferParams {
                    name,
                    width,
                    height,
                    stride,
                    format,
                };
                let upstream = state.drm_relay().create_buffer(drm, buffer.clone(), params);
                bind_buffer(&buffer, upstream);
            }
            wl_drm::Request::CreatePlanarBuffer {
                id,
                name,
                width,
                height,
                format,
                offset0,
                stride0,
                offset1,
                stride1,
                offset2,
                stride2,
            } => {
                let buffer = data_init.init(id, DrmBufferData::default());
                let params = DrmPlanarParams {
                    width,
                    height,
                    format,
                    planes: planes([offset0, offset1, offset2], [stride0, stride1, stride2]),
                };
                let upstream =
                    state
                        .drm_relay()
                        .create_planar_buffer(drm, buffer.clone(), name, params);
                bind_buffer(&buffer, upstream);
            }
            wl_drm::Request::CreatePrimeBuffer {
                id,
                name,
                width,
                height,
                format,
                offset0,
                stride0,
                offset1,
                stride1,
                offset2,
                stride2,
            } => {
                let buffer = data_init.init(id, DrmBufferData::default());
                let params = DrmPlanarParams {
                    width,
                    height,
                    format,
                    planes: planes([offset0, offset1, offset2], [stride0, stride1, stride2]),
                };
                let upstream =
                    state
                        .drm_relay()
                        .create_prime_buffer(drm, buffer.clone(), name, params);
                bind_buffer(&buffer, upstream);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_drm::WlDrm,
        data: &DrmResourceData,
    ) {
        if let Some(drm) = data.upstream() {
            state.drm_relay().unbind(drm);
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, DrmBufferData> for ViewBackend {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_buffer::WlBuffer,
        _request: wl_buffer::Request,
        _data: &DrmBufferData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // `destroy` is the only request; `destroyed` does the work.
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_buffer::WlBuffer,
        data: &DrmBufferData,
    ) {
        if let Some(buffer) = data.upstream() {
            state.drm_relay().destroy_buffer(buffer);
        }
    }
}

fn bind_buffer(buffer: &wl_buffer::WlBuffer, upstream: Option<BufferHandle>) {
    if let (Some(upstream), Some(data)) = (upstream, buffer.data::<DrmBufferData>()) {
        let _ = data.upstream.set(upstream);
    }
}

fn planes(offsets: [i32; 3], strides: [i32; 3]) -> DrmPlanes {
    let mut planes = [DrmPlane::default(); 3];
    for (plane, (offset, stride)) in planes.iter_mut().zip(offsets.into_iter().zip(strides)) {
        *plane = DrmPlane { offset, stride };
    }
    planes
}
