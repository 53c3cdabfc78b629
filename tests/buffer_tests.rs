// Shared-memory buffer integration tests
//
// Allocation goes through a real temp directory; the upstream side is
// recorded so the exact wl_shm requests can be checked.

mod common;

use std::fs;
use std::rc::Rc;

use common::{embedder, popup_embedder, Harness};
use nested_view_backend::format::{FOURCC_ARGB8888, FOURCC_XRGB8888, SHM_FORMAT_ARGB8888};
use nested_view_backend::upstream::recording::ObjectKind;
use nested_view_backend::upstream::{Request, UpstreamGlobals};
use nested_view_backend::{AllocError, BackendConfig, RecordingUpstream, SurfaceKind, UpstreamEvent};
use serial_test::serial;
use tempfile::{tempdir, TempDir};

const RUNTIME_VAR: &str = "NESTED_VIEW_TEST_RUNTIME_DIR";

fn config() -> BackendConfig {
    let mut config = BackendConfig::default();
    config.shm.runtime_dir_var = RUNTIME_VAR.to_string();
    config
}

fn runtime_dir() -> TempDir {
    let dir = tempdir().expect("temp runtime dir");
    std::env::set_var(RUNTIME_VAR, dir.path());
    dir
}

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").map(|d| d.count()).unwrap_or(0)
}

#[test]
#[serial]
fn test_argb_buffer_uses_upstream_format_constant() {
    let _dir = runtime_dir();
    let mut harness = Harness::with_config(RecordingUpstream::default(), embedder(), config());

    let buffer = harness
        .backend
        .try_alloc_buffer(FOURCC_ARGB8888, 4, 4)
        .expect("allocation");

    assert_eq!(buffer.stride(), 16);
    assert_eq!(buffer.size(), 64);
    assert_eq!(buffer.data().len(), 64);

    let handle = buffer.handle().expect("upstream buffer");
    let expected = Request::CreateShmBuffer {
        buffer: handle,
        size: 64,
        width: 4,
        height: 4,
        stride: 16,
        format: SHM_FORMAT_ARGB8888,
    };
    assert_eq!(harness.upstream.count(|r| *r == expected), 1);
}

#[test]
#[serial]
fn test_buffer_info_describes_the_mapping() {
    let _dir = runtime_dir();
    let mut harness = Harness::with_config(RecordingUpstream::default(), embedder(), config());

    let mut buffer = harness
        .backend
        .try_alloc_buffer(FOURCC_XRGB8888, 8, 2)
        .expect("allocation");
    buffer.data_mut().fill(0xab);

    let info = buffer.info();
    assert_eq!(info.format, FOURCC_XRGB8888);
    assert_eq!((info.width, info.height, info.stride), (8, 2, 32));
    assert!(!info.data.is_null());
    assert!(buffer.data().iter().all(|b| *b == 0xab));
}

#[test]
#[serial]
fn test_backing_file_is_unlinked() {
    let dir = runtime_dir();
    let mut harness = Harness::with_config(RecordingUpstream::default(), embedder(), config());

    let buffer = harness.backend.alloc_buffer(FOURCC_ARGB8888, 16, 16);

    assert!(buffer.is_some());
    assert_eq!(fs::read_dir(dir.path()).expect("runtime dir").count(), 0);
}

#[test]
#[serial]
fn test_missing_runtime_dir_yields_no_buffer_and_no_fd_leak() {
    std::env::remove_var(RUNTIME_VAR);
    let mut harness = Harness::with_config(RecordingUpstream::default(), embedder(), config());
    let before = open_fds();

    let result = harness.backend.try_alloc_buffer(FOURCC_ARGB8888, 4, 4);
    assert!(matches!(result, Err(AllocError::NoRuntimeDir(ref var)) if var == RUNTIME_VAR));
    assert!(harness.backend.alloc_buffer(FOURCC_ARGB8888, 4, 4).is_none());

    assert_eq!(open_fds(), before);
    assert_eq!(
        harness
            .upstream
            .count(|r| matches!(r, Request::CreateShmBuffer { .. })),
        0
    );
}

#[test]
#[serial]
fn test_no_shm_global_yields_no_buffer() {
    let _dir = runtime_dir();
    let globals = UpstreamGlobals {
        shm: false,
        ..UpstreamGlobals::desktop()
    };
    let mut harness = Harness::with_config(RecordingUpstream::new(globals), embedder(), config());

    let result = harness.backend.try_alloc_buffer(FOURCC_ARGB8888, 4, 4);
    assert!(matches!(result, Err(AllocError::NoShm)));
}

#[test]
#[serial]
fn test_degenerate_sizes_are_rejected() {
    let _dir = runtime_dir();
    let mut harness = Harness::with_config(RecordingUpstream::default(), embedder(), config());

    assert!(matches!(
        harness.backend.try_alloc_buffer(FOURCC_ARGB8888, 0, 4),
        Err(AllocError::EmptyBuffer { .. })
    ));
    assert!(matches!(
        harness.backend.try_alloc_buffer(FOURCC_ARGB8888, 65536, 65536),
        Err(AllocError::TooLarge { .. })
    ));
}

#[test]
#[serial]
fn test_drop_destroys_upstream_buffer_once_and_closes_its_fd() {
    let _dir = runtime_dir();
    let mut harness = Harness::with_config(RecordingUpstream::default(), embedder(), config());
    let before = open_fds();

    let buffer = harness
        .backend
        .try_alloc_buffer(FOURCC_ARGB8888, 4, 4)
        .expect("allocation");
    let handle = buffer.handle().expect("upstream buffer");
    assert_eq!(harness.upstream.live_count(ObjectKind::Buffer), 1);
    assert_eq!(open_fds(), before + 1);

    drop(buffer);

    assert_eq!(open_fds(), before);
    assert_eq!(
        harness
            .upstream
            .count(|r| *r == Request::DestroyBuffer(handle)),
        1
    );
    assert!(!harness.upstream.is_live(handle.raw()));
}

#[test]
#[serial]
fn test_release_rearms_after_popup_attach() {
    let _dir = runtime_dir();
    let mut harness = Harness::with_config(RecordingUpstream::default(), embedder(), config());
    harness.backend.create_surface(SurfaceKind::OnScreen);
    let popup = harness
        .backend
        .try_create_popup(Rc::new(popup_embedder()), 10, 10)
        .expect("popup");

    let buffer = harness
        .backend
        .try_alloc_buffer(FOURCC_ARGB8888, 4, 4)
        .expect("allocation");
    assert!(buffer.is_released());

    harness
        .backend
        .popup_attach_buffer(popup, Some(&buffer))
        .expect("attach");
    assert!(!buffer.is_released());

    harness.upstream.push_event(UpstreamEvent::BufferRelease {
        buffer: buffer.handle().expect("upstream buffer"),
    });
    harness.dispatch();
    assert!(buffer.is_released());
}
