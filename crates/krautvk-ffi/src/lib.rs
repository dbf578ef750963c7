// SPDX-License-Identifier: CEPL-1.0
//! C ABI over one window and one renderer per thread.
//!
//! ```c
//! int  init(int width, int height, const char *title, int fullscreen, const char *root_path);
//! bool windowShouldClose(void);
//! void pollEvents(void);
//! void draw(void);
//! void terminate(void);
//! ```
//!
//! `init` returns 0 or a negative status code naming the step that failed.
//! Every other call is a no-op before `init` and after `terminate`.
//!
//! All calls must come from the process main thread. The windowing system
//! allows one event loop per process, so `init` after `terminate` returns -1.
//! A panic never crosses the boundary: `init` reports it as -1 and the other
//! calls log it.
#![deny(unsafe_op_in_unsafe_fn)]

use krautvk_core::init_tracing;
use krautvk_platform::{PlatformError, PolledWindow, SurfaceEvent, WindowConfig};
use krautvk_render::{RenderConfig, RenderSize, Renderer};
use krautvk_render_vk::{InitStage, VkRenderer};
use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr};
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{error, info};

pub const STATUS_OK: c_int = 0;
pub const STATUS_ALREADY_INITIALISED: c_int = -15;

struct Harness {
    // STRICT FIELD ORDER: renderer (and its surface) before the window.
    renderer: VkRenderer,
    window: PolledWindow,
}

thread_local! {
    static HARNESS: RefCell<Option<Harness>> = const { RefCell::new(None) };
}

fn platform_status(err: &PlatformError) -> c_int {
    match err {
        PlatformError::EventLoop(_) => InitStage::WindowSystem.status_code(),
        PlatformError::Window(_) | PlatformError::NotResumed => InitStage::Window.status_code(),
    }
}

/// `<root>/data`, with Windows separators normalised.
fn shader_dir(root: &str) -> PathBuf {
    let root = root.replace('\\', "/");
    PathBuf::from(root.trim_end_matches('/')).join("data")
}

/// # Safety
/// `ptr` is null or a NUL-terminated string valid for the duration of the call.
unsafe fn opt_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

/// Runs `f`, turning a panic into `fallback`.
fn guarded<T>(call: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        error!("{call} panicked: {msg}");
        fallback
    })
}

/// Hands resize events to the renderer; returns how many were rejected.
fn forward_resizes<E: Display>(
    events: impl IntoIterator<Item = SurfaceEvent>,
    mut resize: impl FnMut(RenderSize) -> Result<(), E>,
) -> usize {
    let mut rejected = 0;
    for event in events {
        if let SurfaceEvent::Resized(size) = event {
            if let Err(e) = resize(size) {
                error!("resize to {}x{} failed: {e:#}", size.width, size.height);
                rejected += 1;
            }
        }
    }
    rejected
}

fn open(window_cfg: &WindowConfig, render_cfg: &RenderConfig) -> Result<Harness, c_int> {
    let window = PolledWindow::open(window_cfg).map_err(|e| {
        error!("{e}");
        platform_status(&e)
    })?;
    let renderer = VkRenderer::create(
        window.window(),
        window.window(),
        window.inner_size(),
        render_cfg,
    )
    .map_err(|e| {
        error!("{e:#}");
        e.status_code()
    })?;
    Ok(Harness { renderer, window })
}

/// # Safety
/// `title` and `root_path` are null or NUL-terminated strings valid for the call.
#[export_name = "init"]
pub unsafe extern "C" fn krautvk_init(
    width: c_int,
    height: c_int,
    title: *const c_char,
    fullscreen: c_int,
    root_path: *const c_char,
) -> c_int {
    init_tracing();
    guarded("init", InitStage::WindowSystem.status_code(), || unsafe {
        init_inner(width, height, title, fullscreen, root_path)
    })
}

/// # Safety
/// Same contract as [`krautvk_init`].
unsafe fn init_inner(
    width: c_int,
    height: c_int,
    title: *const c_char,
    fullscreen: c_int,
    root_path: *const c_char,
) -> c_int {
    if HARNESS.with_borrow(|h| h.is_some()) {
        return STATUS_ALREADY_INITIALISED;
    }
    let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
        error!("invalid window size {width}x{height}");
        return InitStage::Window.status_code();
    };

    let mut window_cfg = WindowConfig {
        width,
        height,
        fullscreen: fullscreen != 0,
        ..Default::default()
    };
    if let Some(title) = unsafe { opt_str(title) } {
        window_cfg.title = title;
    }
    let render_cfg = RenderConfig {
        shader_dir: unsafe { opt_str(root_path) }.map(|root| shader_dir(&root)),
        ..Default::default()
    };

    match open(&window_cfg, &render_cfg) {
        Ok(harness) => {
            HARNESS.set(Some(harness));
            info!("init complete");
            STATUS_OK
        }
        Err(code) => code,
    }
}

/// True once the window was asked to close, or when nothing is initialised.
#[export_name = "windowShouldClose"]
pub extern "C" fn krautvk_window_should_close() -> bool {
    guarded("windowShouldClose", true, || {
        HARNESS.with_borrow(|h| h.as_ref().map_or(true, |h| h.window.should_close()))
    })
}

#[export_name = "pollEvents"]
pub extern "C" fn krautvk_poll_events() {
    guarded("pollEvents", (), || {
        HARNESS.with_borrow_mut(|h| {
            let Some(h) = h else { return };
            h.window.pump();
            let events = h.window.drain_events();
            forward_resizes(events, |size| h.renderer.resize(size));
        })
    });
}

#[export_name = "draw"]
pub extern "C" fn krautvk_draw() {
    guarded("draw", (), || {
        HARNESS.with_borrow_mut(|h| {
            if let Some(h) = h {
                if let Err(e) = h.renderer.render() {
                    error!("draw failed: {e:#}");
                }
            }
        })
    });
}

#[export_name = "terminate"]
pub extern "C" fn krautvk_terminate() {
    guarded("terminate", (), || {
        if HARNESS.take().is_some() {
            info!("terminated");
        }
    });
}
