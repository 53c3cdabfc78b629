//! Shared fixtures for the view backend integration tests
//!
//! Every test drives a real `wayland_server::Display<ViewBackend>` against
//! a `RecordingUpstream`, with the embedder side mocked.

#![allow(dead_code)]

use std::rc::Rc;

use mockall::mock;
use nested_view_backend::popup::PopupRole;
use nested_view_backend::surface::ShellRole;
use nested_view_backend::upstream::UpstreamGlobals;
use nested_view_backend::{
    BackendClient, BackendConfig, InputTarget, PopupClient, PopupId, RecordingUpstream,
    SurfaceId, UpstreamEvent, ViewBackend,
};
use wayland_server::Display;

mock! {
    pub Embedder {}

    impl BackendClient for Embedder {
        fn dispatch_set_size(&self, width: u32, height: u32);
        fn input(&self) -> InputTarget;
    }
}

mock! {
    pub PopupEmbedder {}

    impl PopupClient for PopupEmbedder {
        fn dispatch_frame_displayed(&self);
        fn dispatch_dismissed(&self);
        fn input(&self) -> InputTarget;
    }
}

/// Input key handed out by [`embedder`].
pub const VIEW_INPUT: InputTarget = InputTarget(7);
/// Input key handed out by [`popup_embedder`].
pub const POPUP_INPUT: InputTarget = InputTarget(9);

/// An embedder that answers `input` and expects nothing else.
pub fn embedder() -> MockEmbedder {
    let mut embedder = MockEmbedder::new();
    embedder.expect_input().return_const(VIEW_INPUT);
    embedder
}

/// A popup embedder that answers `input` and expects nothing else.
pub fn popup_embedder() -> MockPopupEmbedder {
    let mut popup = MockPopupEmbedder::new();
    popup.expect_input().return_const(POPUP_INPUT);
    popup
}

/// Only the legacy shell, as on older compositors.
pub fn legacy_globals() -> UpstreamGlobals {
    UpstreamGlobals {
        compositor: true,
        shm: true,
        xdg_wm_base: false,
        shell: true,
        ivi_application: false,
        seat: true,
        drm: None,
    }
}

pub struct Harness {
    pub backend: ViewBackend,
    pub display: Display<ViewBackend>,
    pub upstream: Rc<RecordingUpstream>,
}

impl Harness {
    pub fn new(upstream: RecordingUpstream, embedder: MockEmbedder) -> Self {
        Self::with_config(upstream, embedder, BackendConfig::default())
    }

    pub fn with_config(
        upstream: RecordingUpstream,
        embedder: MockEmbedder,
        config: BackendConfig,
    ) -> Self {
        let display = Display::<ViewBackend>::new().expect("nested display");
        let upstream = Rc::new(upstream);
        let backend = ViewBackend::new(
            &display.handle(),
            upstream.clone(),
            Rc::new(embedder),
            config,
        );
        Self {
            backend,
            display,
            upstream,
        }
    }

    /// Delivers whatever the recording upstream has queued.
    pub fn dispatch(&mut self) {
        self.backend.dispatch_upstream();
    }

    /// Delivers the first configure of a modern shell surface, so that
    /// its commits reach the upstream compositor.
    pub fn configure(&mut self, id: SurfaceId) {
        let surface = self.backend.surface(id).expect("surface");
        if let ShellRole::Modern(role) = surface.role() {
            self.upstream.push_event(UpstreamEvent::XdgConfigure {
                role,
                width: 0,
                height: 0,
                serial: 1,
            });
            self.dispatch();
        }
    }

    /// Delivers the first configure of a modern popup.
    pub fn configure_popup(&mut self, id: PopupId) {
        let popup = self.backend.popup(id).expect("popup");
        if let PopupRole::Modern(popup) = popup.role() {
            self.upstream
                .push_event(UpstreamEvent::XdgPopupConfigure { popup, serial: 1 });
            self.dispatch();
        }
    }
}
