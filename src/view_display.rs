//! Downstream surface bookkeeping
//!
//! `ViewDisplay` holds the nested server's view of every surface: the state
//! a client has staged since its last commit, the frame callbacks waiting
//! for the next presented frame, and which on-screen surface is the main
//! one. It owns the [`Surface`] relays and drives them through
//! `on_surface_attach`/`on_surface_commit`.

use std::collections::BTreeMap;

use log::{debug, trace};
use wayland_server::protocol::wl_callback::WlCallback;

use crate::error::BackendError;
use crate::surface::{Surface, SurfaceEvent};
use crate::upstream::{BufferHandle, UpstreamEvent};

/// Key of a surface inside one [`ViewDisplay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Whether a surface is shown as a window or rendered off-screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    OnScreen,
    OffScreen,
}

/// Accumulated damage, in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Damage {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Damage {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Grows this rectangle to the bounding box of itself and the given one.
    pub fn expand(&mut self, x: i32, y: i32, width: i32, height: i32) {
        let right = self.right().max(x.saturating_add(width));
        let bottom = self.bottom().max(y.saturating_add(height));
        self.x = self.x.min(x);
        self.y = self.y.min(y);
        self.width = right.saturating_sub(self.x);
        self.height = bottom.saturating_sub(self.y);
    }

    fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }
}

/// A buffer attached by a downstream client, with the attach offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedBuffer {
    pub buffer: BufferHandle,
    pub x: i32,
    pub y: i32,
}

/// State staged by a client between two commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitState {
    pub buffer: Option<AttachedBuffer>,
    /// Set by any attach, including an attach of no buffer.
    pub buffer_attached: bool,
    pub damage: Option<Damage>,
}

/// A downstream frame callback.
pub trait FrameCallback {
    /// Fires the callback; it is consumed by doing so.
    fn complete(self: Box<Self>, time: u32);
}

impl FrameCallback for WlCallback {
    fn complete(self: Box<Self>, time: u32) {
        let callback = *self;
        callback.done(time);
    }
}

#[derive(Default)]
struct Pending {
    state: CommitState,
    frame_callbacks: Vec<Box<dyn FrameCallback>>,
    render_callbacks: Vec<Box<dyn FrameCallback>>,
}

struct SurfaceEntry {
    surface: Surface,
    pending: Pending,
    current_callbacks: Vec<Box<dyn FrameCallback>>,
}

impl SurfaceEntry {
    fn frame_complete(&mut self, time: u32) {
        for callback in self.current_callbacks.drain(..) {
            callback.complete(time);
        }
    }
}

/// The nested server's surfaces for one view.
#[derive(Default)]
pub struct ViewDisplay {
    next_id: u64,
    surfaces: BTreeMap<SurfaceId, SurfaceEntry>,
    main_surface: Option<SurfaceId>,
}

impl ViewDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `surface`. The newest on-screen surface becomes
    /// the main surface.
    pub fn insert(&mut self, surface: Surface) -> SurfaceId {
        self.next_id += 1;
        let id = SurfaceId(self.next_id);
        if surface.kind() == SurfaceKind::OnScreen {
            self.main_surface = Some(id);
        }
        debug!("Surface {:?} created ({:?})", id, surface.kind());
        self.surfaces.insert(
            id,
            SurfaceEntry {
                surface,
                pending: Pending::default(),
                current_callbacks: Vec::new(),
            },
        );
        id
    }

    fn entry_mut(&mut self, id: SurfaceId) -> Result<&mut SurfaceEntry, BackendError> {
        self.surfaces
            .get_mut(&id)
            .ok_or(BackendError::UnknownSurface(id))
    }

    /// `wl_surface.attach`: replaces the staged buffer and relays it
    /// upstream right away.
    pub fn attach(
        &mut self,
        id: SurfaceId,
        buffer: Option<AttachedBuffer>,
    ) -> Result<(), BackendError> {
        let entry = self.entry_mut(id)?;
        entry.pending.state.buffer = buffer;
        entry.pending.state.buffer_attached = true;
        entry.surface.on_surface_attach(buffer.as_ref());
        Ok(())
    }

    /// `wl_surface.damage`
    pub fn damage(
        &mut self,
        id: SurfaceId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> Result<(), BackendError> {
        let pending = &mut self.entry_mut(id)?.pending.state;
        match pending.damage.as_mut() {
            Some(damage) => damage.expand(x, y, width, height),
            None => pending.damage = Some(Damage::new(x, y, width, height)),
        }
        Ok(())
    }

    /// `wl_surface.frame`, or the render callback when `render` is set.
    pub fn frame(
        &mut self,
        id: SurfaceId,
        callback: Box<dyn FrameCallback>,
        render: bool,
    ) -> Result<(), BackendError> {
        let pending = &mut self.entry_mut(id)?.pending;
        if render {
            pending.render_callbacks.push(callback);
        } else {
            pending.frame_callbacks.push(callback);
        }
        Ok(())
    }

    /// `wl_surface.commit`
    pub fn commit(&mut self, id: SurfaceId) -> Result<(), BackendError> {
        let entry = self.entry_mut(id)?;
        let pending = std::mem::take(&mut entry.pending);
        entry.current_callbacks.extend(pending.frame_callbacks);
        entry.current_callbacks.extend(pending.render_callbacks);
        entry.surface.on_surface_commit(&pending.state);
        Ok(())
    }

    /// Fires every frame callback latched by previous commits.
    pub fn frame_complete(&mut self, id: SurfaceId, time: u32) -> Result<(), BackendError> {
        self.entry_mut(id)?.frame_complete(time);
        Ok(())
    }

    /// Drops the surface, tearing down its upstream objects.
    pub fn destroy(&mut self, id: SurfaceId) -> Result<(), BackendError> {
        self.surfaces
            .remove(&id)
            .ok_or(BackendError::UnknownSurface(id))?;
        if self.main_surface == Some(id) {
            self.main_surface = None;
        }
        debug!("Surface {:?} destroyed", id);
        Ok(())
    }

    /// Destroys every surface, oldest first.
    pub fn clear(&mut self) {
        while let Some((id, _)) = self.surfaces.pop_first() {
            trace!("Surface {:?} destroyed with its view", id);
        }
        self.main_surface = None;
    }

    /// Offers an upstream event to every surface. Returns whether one of
    /// them owned it.
    pub fn handle_event(&mut self, event: &UpstreamEvent) -> bool {
        for (id, entry) in self.surfaces.iter_mut() {
            match entry.surface.handle_event(event) {
                SurfaceEvent::Ignored => continue,
                SurfaceEvent::Handled => return true,
                SurfaceEvent::FrameComplete(time) => {
                    trace!("Frame complete on {:?} at {}", id, time);
                    entry.frame_complete(time);
                    return true;
                }
            }
        }
        false
    }

    pub fn main_surface_id(&self) -> Option<SurfaceId> {
        self.main_surface
    }

    pub fn main_surface(&self) -> Option<&Surface> {
        self.main_surface
            .and_then(|id| self.surfaces.get(&id))
            .map(|entry| &entry.surface)
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id).map(|entry| &entry.surface)
    }

    /// Frame callbacks latched by commits and not yet fired.
    pub fn pending_frame_callbacks(&self, id: SurfaceId) -> usize {
        self.surfaces
            .get(&id)
            .map_or(0, |entry| entry.current_callbacks.len())
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}
