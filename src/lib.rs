//! StreamDivert: transparent packet-redirecting TCP proxy.
//!
//! Connections from configured source addresses to a redirect port are
//! diverted at the packet level to a local relay, which forwards them to a
//! per-source target. The Rust API lives in [`divert`]; this file also
//! exposes a small C FFI for `cdylib` consumers.

pub mod capture;
pub mod config;
pub mod divert;
pub mod error;
pub mod packet;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use config::ProxySettings;
use divert::DivertProxy;
use error::{clear_error, last_error_code, set_proxy_error, take_last_error, ProxyError, SUCCESS};

/// Opaque handle handed to C callers.
pub struct ProxyHandle {
    proxy: DivertProxy,
}

/// Allocate a C string on the heap.  Caller frees via `streamdivert_free_string`.
fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Read a `*const c_char` into a `&str`, returning `None` on null or invalid UTF-8.
unsafe fn from_c_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

/// Borrow the proxy behind a handle, recording an error for null handles.
unsafe fn with_handle<'a>(handle: *const ProxyHandle) -> Result<&'a DivertProxy, i32> {
    match handle.as_ref() {
        Some(h) => Ok(&h.proxy),
        None => {
            let e = ProxyError::InvalidParam("handle is null".into());
            set_proxy_error(&e);
            Err(e.code())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Create a proxy from a JSON object with the same shape as one entry of the
/// configuration file's `proxies` array. Returns null on error.
/// Destroy with `streamdivert_destroy`.
#[no_mangle]
pub unsafe extern "C" fn streamdivert_create(config_json: *const c_char) -> *mut ProxyHandle {
    clear_error();

    // Initialise logger (ignore errors if already set)
    let _ = env_logger::try_init();

    let json = match from_c_str(config_json) {
        Some(s) => s,
        None => {
            set_proxy_error(&ProxyError::InvalidParam("config_json is null or invalid".into()));
            return ptr::null_mut();
        }
    };

    let proxy = ProxySettings::from_json(json)
        .map_err(ProxyError::from)
        .and_then(DivertProxy::new);
    match proxy {
        Ok(proxy) => {
            log::info!("{} created (v{})", proxy, env!("CARGO_PKG_VERSION"));
            Box::into_raw(Box::new(ProxyHandle { proxy }))
        }
        Err(e) => {
            set_proxy_error(&e);
            ptr::null_mut()
        }
    }
}

/// Start diverting and relaying.  Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn streamdivert_start(handle: *const ProxyHandle) -> i32 {
    clear_error();
    let proxy = match with_handle(handle) {
        Ok(p) => p,
        Err(code) => return code,
    };
    match proxy.start() {
        Ok(()) => SUCCESS,
        Err(e) => {
            set_proxy_error(&e);
            e.code()
        }
    }
}

/// Stop the proxy.  Returns 0 whether or not it was running.
#[no_mangle]
pub unsafe extern "C" fn streamdivert_stop(handle: *const ProxyHandle) -> i32 {
    clear_error();
    match with_handle(handle) {
        Ok(proxy) => {
            proxy.stop();
            SUCCESS
        }
        Err(code) => code,
    }
}

/// Returns 1 if running, 0 if not, negative on error.
#[no_mangle]
pub unsafe extern "C" fn streamdivert_is_running(handle: *const ProxyHandle) -> i32 {
    match with_handle(handle) {
        Ok(proxy) => i32::from(proxy.is_running()),
        Err(code) => code,
    }
}

/// Stop (if running) and free the proxy.  Null is ignored.
#[no_mangle]
pub unsafe extern "C" fn streamdivert_destroy(handle: *mut ProxyHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Get proxy statistics as JSON.
/// Caller must free the returned string.
#[no_mangle]
pub unsafe extern "C" fn streamdivert_stats_json(handle: *const ProxyHandle) -> *mut c_char {
    clear_error();
    let proxy = match with_handle(handle) {
        Ok(p) => p,
        Err(_) => return ptr::null_mut(),
    };
    match serde_json::to_string(&proxy.stats()) {
        Ok(s) => to_c_string(&s),
        Err(e) => {
            set_proxy_error(&ProxyError::Internal(format!("JSON serialization failed: {}", e)));
            ptr::null_mut()
        }
    }
}

/// Return the library version string.  Caller must free with `streamdivert_free_string`.
#[no_mangle]
pub extern "C" fn streamdivert_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION"))
}

/// Free a string previously returned by the library.
#[no_mangle]
pub unsafe extern "C" fn streamdivert_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Error
// ═══════════════════════════════════════════════════════════════════════════

/// Get the last error message.  Returns null if no error.
/// Caller must free the returned string.
#[no_mangle]
pub extern "C" fn streamdivert_last_error() -> *mut c_char {
    match take_last_error() {
        Some(msg) => to_c_string(&msg),
        None => ptr::null_mut(),
    }
}

/// Get the last error code.  Returns 0 (`SUCCESS`) if no error.
#[no_mangle]
pub extern "C" fn streamdivert_last_error_code() -> i32 {
    last_error_code()
}
