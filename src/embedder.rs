//! Callbacks installed by the embedding application
//!
//! These mirror the dispatch half of the embedder's backend ABI: the
//! backend calls them, it never implements them.

/// Opaque key identifying where input for a surface must be delivered.
///
/// The input router that consumes it lives outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputTarget(pub u64);

/// The embedder's view backend handle.
pub trait BackendClient {
    /// The upstream compositor proposed a new size for the view.
    fn dispatch_set_size(&self, width: u32, height: u32);

    /// Input routing key for the view's top-level surfaces.
    fn input(&self) -> InputTarget;
}

/// The embedder's handle for one popup.
pub trait PopupClient {
    /// The frame attached last has been presented.
    fn dispatch_frame_displayed(&self);

    /// The upstream compositor dismissed the popup.
    fn dispatch_dismissed(&self);

    /// Input routing key for the popup surface.
    fn input(&self) -> InputTarget;
}
