// Surface lifecycle integration tests
//
// Covers shell role selection, frame pacing, size negotiation and
// teardown against a recorded upstream compositor.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{embedder, legacy_globals, Harness, MockEmbedder, VIEW_INPUT};
use mockall::predicate::eq;
use nested_view_backend::surface::ShellRole;
use nested_view_backend::upstream::recording::ObjectKind;
use nested_view_backend::upstream::{BufferHandle, Request, UpstreamGlobals};
use nested_view_backend::view_display::FrameCallback;
use nested_view_backend::{
    AttachedBuffer, RecordingUpstream, SurfaceKind, Upstream, UpstreamEvent,
};

/// Frame callback that records the times it was completed with.
struct Recorded(Rc<RefCell<Vec<u32>>>);

impl FrameCallback for Recorded {
    fn complete(self: Box<Self>, time: u32) {
        self.0.borrow_mut().push(time);
    }
}

#[test]
fn test_legacy_only_compositor_gets_shell_surface() {
    let mut harness = Harness::new(RecordingUpstream::new(legacy_globals()), embedder());

    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let surface = harness.backend.surface(id).expect("surface");

    let ShellRole::Legacy(role) = surface.role() else {
        panic!("expected a legacy shell role, got {:?}", surface.role());
    };
    let upstream = &harness.upstream;
    assert_eq!(upstream.count(|r| *r == Request::ShellSetToplevel(role)), 1);
    assert_eq!(
        upstream.count(|r| *r
            == Request::ShellSetTitle {
                role,
                title: "WPE".to_string()
            }),
        1
    );
    assert_eq!(upstream.live_count(ObjectKind::XdgSurface), 0);
}

#[test]
fn test_modern_shell_is_preferred() {
    let globals = UpstreamGlobals {
        shell: true,
        ..UpstreamGlobals::desktop()
    };
    let mut harness = Harness::new(RecordingUpstream::new(globals), embedder());

    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let surface = harness.backend.surface(id).expect("surface");

    assert!(matches!(surface.role(), ShellRole::Modern(_)));
    assert_eq!(harness.upstream.live_count(ObjectKind::ShellSurface), 0);
    let handle = surface.handle().expect("upstream surface");
    assert_eq!(harness.upstream.input_target(handle), Some(VIEW_INPUT));
}

#[test]
fn test_platform_role_is_added_when_advertised() {
    let globals = UpstreamGlobals {
        xdg_wm_base: false,
        ivi_application: true,
        ..UpstreamGlobals::desktop()
    };
    let mut harness = Harness::new(RecordingUpstream::new(globals), embedder());

    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let surface = harness.backend.surface(id).expect("surface");

    assert_eq!(surface.role(), ShellRole::None);
    assert!(surface.platform_role().is_some());
    assert_eq!(harness.upstream.live_count(ObjectKind::IviSurface), 1);
}

#[test]
fn test_offscreen_surface_has_no_role_or_input() {
    let mut client = MockEmbedder::new();
    client.expect_input().never();
    let mut harness = Harness::new(RecordingUpstream::default(), client);

    let id = harness.backend.create_surface(SurfaceKind::OffScreen);
    let surface = harness.backend.surface(id).expect("surface");

    assert_eq!(surface.role(), ShellRole::None);
    assert!(surface.platform_role().is_none());
    assert!(harness.backend.main_surface_handle().is_none());
    assert_eq!(harness.upstream.live_count(ObjectKind::XdgSurface), 0);
}

#[test]
fn test_destroy_without_commit_skips_callback() {
    let mut harness = Harness::new(RecordingUpstream::default(), embedder());
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let handle = harness
        .backend
        .surface(id)
        .and_then(|s| s.handle())
        .expect("upstream surface");

    harness.backend.destroy_surface(id).expect("destroy");

    let upstream = &harness.upstream;
    assert_eq!(upstream.count(|r| matches!(r, Request::DestroyCallback(_))), 0);
    assert_eq!(upstream.count(|r| *r == Request::DestroySurface(handle)), 1);
    assert_eq!(upstream.live_count(ObjectKind::Surface), 0);
    assert_eq!(upstream.live_count(ObjectKind::XdgSurface), 0);
    assert!(upstream.input_target(handle).is_none());
    assert!(harness.backend.main_surface_handle().is_none());
}

#[test]
fn test_teardown_releases_role_before_surface() {
    let mut harness = Harness::new(RecordingUpstream::new(legacy_globals()), embedder());
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    harness.backend.surface_commit(id).expect("commit");

    harness.backend.destroy_surface(id).expect("destroy");

    let upstream = &harness.upstream;
    let role = upstream
        .position(|r| matches!(r, Request::DestroyShellSurface(_)))
        .expect("role destroyed");
    let callback = upstream
        .position(|r| matches!(r, Request::DestroyCallback(_)))
        .expect("callback destroyed");
    let surface = upstream
        .position(|r| matches!(r, Request::DestroySurface(_)))
        .expect("surface destroyed");
    assert!(role < callback && callback < surface);
}

#[test]
fn test_each_commit_keeps_a_single_frame_callback() {
    let mut harness = Harness::new(RecordingUpstream::default(), embedder());
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    harness.configure(id);

    harness.backend.surface_commit(id).expect("commit");
    let first = harness
        .backend
        .surface(id)
        .and_then(|s| s.frame_callback())
        .expect("frame callback");
    harness.backend.surface_commit(id).expect("commit");

    assert_eq!(harness.upstream.live_count(ObjectKind::Callback), 1);
    assert_eq!(
        harness
            .upstream
            .count(|r| *r == Request::DestroyCallback(first)),
        1
    );

    // The stale callback firing late must not complete anything.
    let times = Rc::new(RefCell::new(Vec::new()));
    harness
        .backend
        .surface_frame(id, Box::new(Recorded(times.clone())))
        .expect("frame");
    harness.backend.surface_commit(id).expect("commit");
    harness
        .upstream
        .push_event(UpstreamEvent::FrameDone { callback: first, time: 1 });
    harness.dispatch();
    assert!(times.borrow().is_empty());
}

#[test]
fn test_commit_relays_damage_and_completes_frames() {
    let mut harness = Harness::new(RecordingUpstream::default(), embedder());
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    harness.configure(id);
    let handle = harness
        .backend
        .surface(id)
        .and_then(|s| s.handle())
        .expect("upstream surface");

    let times = Rc::new(RefCell::new(Vec::new()));
    harness
        .backend
        .surface_frame(id, Box::new(Recorded(times.clone())))
        .expect("frame");
    harness
        .backend
        .surface_render_callback(id, Box::new(Recorded(times.clone())))
        .expect("render callback");
    harness.backend.surface_damage(id, 0, 0, 10, 10).expect("damage");
    harness.backend.surface_damage(id, 20, 5, 10, 10).expect("damage");
    harness.backend.surface_commit(id).expect("commit");

    assert_eq!(
        harness.upstream.count(|r| *r
            == Request::Damage {
                surface: handle,
                x: 0,
                y: 0,
                width: 30,
                height: 15
            }),
        1
    );
    assert_eq!(harness.backend.view_display().pending_frame_callbacks(id), 2);

    let callback = harness
        .backend
        .surface(id)
        .and_then(|s| s.frame_callback())
        .expect("frame callback");
    harness
        .upstream
        .push_event(UpstreamEvent::FrameDone { callback, time: 42 });
    harness.dispatch();

    assert_eq!(*times.borrow(), vec![42, 42]);
    assert_eq!(harness.backend.view_display().pending_frame_callbacks(id), 0);
    assert!(harness.backend.surface(id).and_then(|s| s.frame_callback()).is_none());
}

#[test]
fn test_modern_configure_resizes_and_acks() {
    let mut client = embedder();
    client
        .expect_dispatch_set_size()
        .with(eq(800), eq(600))
        .times(1)
        .return_const(());
    let mut harness = Harness::new(RecordingUpstream::default(), client);
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let ShellRole::Modern(role) = harness.backend.surface(id).expect("surface").role() else {
        panic!("expected a modern shell role");
    };

    harness.upstream.push_event(UpstreamEvent::XdgConfigure {
        role,
        width: 800,
        height: 600,
        serial: 5,
    });
    harness.dispatch();

    let size = harness.backend.surface(id).expect("surface").size();
    assert_eq!((size.width, size.height), (800, 600));
    assert_eq!(
        harness
            .upstream
            .count(|r| *r == Request::XdgAckConfigure { role, serial: 5 }),
        1
    );
}

#[test]
fn test_zero_configure_is_acked_without_resize() {
    let mut client = embedder();
    client.expect_dispatch_set_size().never();
    let mut harness = Harness::new(RecordingUpstream::default(), client);
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let ShellRole::Modern(role) = harness.backend.surface(id).expect("surface").role() else {
        panic!("expected a modern shell role");
    };

    harness.upstream.push_event(UpstreamEvent::XdgConfigure {
        role,
        width: 0,
        height: 0,
        serial: 9,
    });
    harness.dispatch();

    assert_eq!(
        harness
            .upstream
            .count(|r| *r == Request::XdgAckConfigure { role, serial: 9 }),
        1
    );
    let size = harness.backend.surface(id).expect("surface").size();
    assert_eq!((size.width, size.height), (0, 0));
}

#[test]
fn test_buffer_waits_for_first_configure() {
    let mut harness = Harness::new(RecordingUpstream::default(), embedder());
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let surface = harness.backend.surface(id).expect("surface");
    let handle = surface.handle().expect("upstream surface");
    let ShellRole::Modern(role) = surface.role() else {
        panic!("expected a modern shell role");
    };
    let buffer = BufferHandle::from_raw(900);

    harness
        .backend
        .surface_attach(id, Some(AttachedBuffer { buffer, x: 0, y: 0 }))
        .expect("attach");
    harness.backend.surface_damage(id, 0, 0, 8, 8).expect("damage");
    harness.backend.surface_commit(id).expect("commit");

    let upstream = harness.upstream.clone();
    assert!(!harness.backend.surface(id).expect("surface").is_configured());
    assert_eq!(upstream.count(|r| matches!(r, Request::Attach { .. })), 0);
    assert_eq!(upstream.count(|r| *r == Request::Commit(handle)), 0);
    assert!(harness.backend.surface(id).and_then(|s| s.frame_callback()).is_none());

    upstream.push_event(UpstreamEvent::XdgConfigure {
        role,
        width: 0,
        height: 0,
        serial: 3,
    });
    harness.dispatch();

    let ack = upstream
        .position(|r| *r == Request::XdgAckConfigure { role, serial: 3 })
        .expect("configure acked");
    let attach = upstream
        .position(|r| {
            *r == Request::Attach {
                surface: handle,
                buffer: Some(buffer),
                x: 0,
                y: 0,
            }
        })
        .expect("attach replayed");
    let commit = upstream
        .position(|r| *r == Request::Commit(handle))
        .expect("commit replayed");
    assert!(ack < attach && attach < commit);
    assert_eq!(
        upstream.count(|r| *r
            == Request::Damage {
                surface: handle,
                x: 0,
                y: 0,
                width: 8,
                height: 8
            }),
        1
    );
    assert!(harness.backend.surface(id).and_then(|s| s.frame_callback()).is_some());
    assert!(upstream.unconfigured_buffer_commits().is_empty());
}

#[test]
fn test_commit_before_ack_is_flagged_upstream() {
    let upstream = RecordingUpstream::default();
    let surface = upstream.create_surface();
    let role = upstream.create_xdg_surface(surface);

    upstream.surface_attach(surface, Some(BufferHandle::from_raw(900)), 0, 0);
    upstream.surface_commit(surface);
    assert_eq!(upstream.unconfigured_buffer_commits(), vec![surface]);

    upstream.xdg_surface_ack_configure(role, 1);
    upstream.surface_commit(surface);
    assert_eq!(upstream.unconfigured_buffer_commits(), vec![surface]);
}

#[test]
fn test_initial_configure_releases_first_frame() {
    let mut harness = Harness::new(
        RecordingUpstream::default().with_initial_configure(),
        embedder(),
    );
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let handle = harness
        .backend
        .surface(id)
        .and_then(|s| s.handle())
        .expect("upstream surface");

    harness
        .backend
        .surface_attach(
            id,
            Some(AttachedBuffer {
                buffer: BufferHandle::from_raw(900),
                x: 0,
                y: 0,
            }),
        )
        .expect("attach");
    harness.backend.surface_commit(id).expect("commit");
    harness.dispatch();

    assert!(harness.backend.surface(id).expect("surface").is_configured());
    assert_eq!(harness.upstream.count(|r| *r == Request::Commit(handle)), 1);
    assert!(harness.upstream.unconfigured_buffer_commits().is_empty());
}

#[test]
fn test_legacy_ping_is_answered_and_configure_resizes() {
    let mut client = embedder();
    client
        .expect_dispatch_set_size()
        .with(eq(320), eq(240))
        .times(1)
        .return_const(());
    let mut harness = Harness::new(RecordingUpstream::new(legacy_globals()), client);
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let ShellRole::Legacy(role) = harness.backend.surface(id).expect("surface").role() else {
        panic!("expected a legacy shell role");
    };

    harness
        .upstream
        .push_event(UpstreamEvent::ShellPing { role, serial: 77 });
    harness.upstream.push_event(UpstreamEvent::ShellConfigure {
        role,
        edges: 0,
        width: 320,
        height: 240,
    });
    harness.dispatch();

    assert_eq!(
        harness
            .upstream
            .count(|r| *r == Request::ShellPong { role, serial: 77 }),
        1
    );
}

#[test]
fn test_zero_legacy_configure_keeps_size() {
    let mut client = embedder();
    client
        .expect_dispatch_set_size()
        .with(eq(320), eq(240))
        .times(1)
        .return_const(());
    let mut harness = Harness::new(RecordingUpstream::new(legacy_globals()), client);
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let ShellRole::Legacy(role) = harness.backend.surface(id).expect("surface").role() else {
        panic!("expected a legacy shell role");
    };

    for (width, height) in [(320, 240), (0, 0)] {
        harness.upstream.push_event(UpstreamEvent::ShellConfigure {
            role,
            edges: 0,
            width,
            height,
        });
    }
    harness.dispatch();

    let size = harness.backend.surface(id).expect("surface").size();
    assert_eq!((size.width, size.height), (320, 240));
}

#[test]
fn test_zero_platform_configure_keeps_size() {
    let mut client = embedder();
    client
        .expect_dispatch_set_size()
        .with(eq(1024), eq(768))
        .times(1)
        .return_const(());
    let globals = UpstreamGlobals {
        xdg_wm_base: false,
        ivi_application: true,
        ..UpstreamGlobals::desktop()
    };
    let mut harness = Harness::new(RecordingUpstream::new(globals), client);
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let role = harness
        .backend
        .surface(id)
        .and_then(|s| s.platform_role())
        .expect("ivi role");

    for (width, height) in [(1024, 768), (0, 0)] {
        harness
            .upstream
            .push_event(UpstreamEvent::IviConfigure { role, width, height });
    }
    harness.dispatch();

    let size = harness.backend.surface(id).expect("surface").size();
    assert_eq!((size.width, size.height), (1024, 768));
}

#[test]
fn test_events_for_destroyed_surface_are_dropped() {
    let mut client = embedder();
    client.expect_dispatch_set_size().never();
    let mut harness = Harness::new(RecordingUpstream::default(), client);
    let id = harness.backend.create_surface(SurfaceKind::OnScreen);
    let ShellRole::Modern(role) = harness.backend.surface(id).expect("surface").role() else {
        panic!("expected a modern shell role");
    };
    harness.backend.destroy_surface(id).expect("destroy");
    harness.upstream.clear_requests();

    harness.upstream.push_event(UpstreamEvent::XdgConfigure {
        role,
        width: 100,
        height: 100,
        serial: 1,
    });
    harness.dispatch();

    assert!(harness.upstream.requests().is_empty());
}

#[test]
fn test_cursor_is_selected_and_released_with_backend() {
    let harness = Harness::new(RecordingUpstream::default(), embedder());
    let theme = harness.backend.cursor_theme().expect("cursor theme");
    assert_eq!(harness.upstream.cursor(), Some((theme, "left_ptr".to_string())));

    let upstream = harness.upstream.clone();
    drop(harness);

    let cleared = upstream
        .position(|r| *r == Request::SetCursor(None))
        .expect("cursor cleared");
    let destroyed = upstream
        .position(|r| *r == Request::DestroyCursorTheme(theme))
        .expect("theme destroyed");
    assert!(cleared < destroyed);
    assert_eq!(upstream.live_count(ObjectKind::CursorTheme), 0);
}

#[test]
fn test_cursor_is_cleared_without_a_theme() {
    let harness = Harness::new(
        RecordingUpstream::default().without_cursor_themes(),
        embedder(),
    );
    assert!(harness.backend.cursor_theme().is_none());

    let upstream = harness.upstream.clone();
    drop(harness);

    assert_eq!(upstream.count(|r| *r == Request::SetCursor(None)), 1);
    assert_eq!(
        upstream.count(|r| matches!(r, Request::DestroyCursorTheme(_))),
        0
    );
}

#[test]
fn test_unknown_surface_is_an_error() {
    let mut harness = Harness::new(RecordingUpstream::default(), embedder());
    let id = harness.backend.create_surface(SurfaceKind::OffScreen);
    harness.backend.destroy_surface(id).expect("destroy");

    assert!(harness.backend.surface_commit(id).is_err());
    assert!(harness.backend.destroy_surface(id).is_err());
}
