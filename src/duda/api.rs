//! Capability table handed to service modules
//!
//! Native modules never see Rust types: they receive a pointer to
//! [`DudaApi`] in `duda_init` and an opaque `DudaRequest` pointer in every
//! method callback, and go through the function table for everything else.

use super::request::{DudaRequest, Events};
use crate::http::Status;
use std::ffi::{c_char, c_int, CStr};
use std::ptr;

/// Version of the table layout, bumped on incompatible changes
pub const DUDA_API_VERSION: u32 = 1;

/// Native end-of-request callback
pub type NativeEndCallback = unsafe extern "C" fn(*mut DudaRequest);

/// Function table passed to `duda_init`
#[repr(C)]
pub struct DudaApi {
    pub version: u32,
    pub body_write: unsafe extern "C" fn(*mut DudaRequest, *const u8, usize) -> c_int,
    pub set_status: unsafe extern "C" fn(*mut DudaRequest, c_int) -> c_int,
    pub add_header: unsafe extern "C" fn(*mut DudaRequest, *const c_char, *const c_char) -> c_int,
    pub event_register_write: unsafe extern "C" fn(*mut DudaRequest, c_int) -> c_int,
    pub event_unregister_write: unsafe extern "C" fn(*mut DudaRequest, c_int) -> c_int,
    pub event_is_registered_write: unsafe extern "C" fn(*const DudaRequest, c_int) -> c_int,
    pub param_count: unsafe extern "C" fn(*const DudaRequest) -> c_int,
    pub param: unsafe extern "C" fn(*const DudaRequest, c_int, *mut usize) -> *const u8,
    pub set_end_callback:
        unsafe extern "C" fn(*mut DudaRequest, Option<NativeEndCallback>) -> c_int,
}

static MASTER: DudaApi = DudaApi {
    version: DUDA_API_VERSION,
    body_write,
    set_status,
    add_header,
    event_register_write,
    event_unregister_write,
    event_is_registered_write,
    param_count,
    param,
    set_end_callback,
};

/// The process-wide table
pub fn master() -> &'static DudaApi {
    &MASTER
}

fn status(ok: bool) -> c_int {
    if ok {
        0
    } else {
        -1
    }
}

unsafe extern "C" fn body_write(dr: *mut DudaRequest, data: *const u8, len: usize) -> c_int {
    let Some(dr) = dr.as_mut() else { return -1 };
    if data.is_null() && len > 0 {
        return -1;
    }
    let bytes = if len == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(data, len)
    };
    status(dr.body_write(bytes))
}

unsafe extern "C" fn set_status(dr: *mut DudaRequest, code: c_int) -> c_int {
    let Some(dr) = dr.as_mut() else { return -1 };
    let Some(code) = u16::try_from(code).ok().and_then(Status::new) else {
        return -1;
    };
    if dr.headers_sent() {
        return -1;
    }
    dr.set_status(code);
    0
}

unsafe extern "C" fn add_header(
    dr: *mut DudaRequest,
    name: *const c_char,
    value: *const c_char,
) -> c_int {
    let Some(dr) = dr.as_mut() else { return -1 };
    if name.is_null() || value.is_null() {
        return -1;
    }
    let name = CStr::from_ptr(name).to_string_lossy().into_owned();
    let value = CStr::from_ptr(value).to_string_lossy().into_owned();
    status(dr.add_header(name, value))
}

unsafe extern "C" fn event_register_write(dr: *mut DudaRequest, events: c_int) -> c_int {
    let Some(dr) = dr.as_mut() else { return -1 };
    let events = Events::from_bits(events as u8);
    if events.is_empty() {
        return -1;
    }
    dr.event_register_write(events);
    0
}

unsafe extern "C" fn event_unregister_write(dr: *mut DudaRequest, events: c_int) -> c_int {
    let Some(dr) = dr.as_mut() else { return -1 };
    status(dr.event_unregister_write(Events::from_bits(events as u8)))
}

unsafe extern "C" fn event_is_registered_write(dr: *const DudaRequest, events: c_int) -> c_int {
    let Some(dr) = dr.as_ref() else { return 0 };
    dr.event_is_registered_write(Events::from_bits(events as u8)) as c_int
}

unsafe extern "C" fn param_count(dr: *const DudaRequest) -> c_int {
    dr.as_ref().map(|dr| dr.params().len() as c_int).unwrap_or(0)
}

/// Pointer to parameter `index` (not NUL-terminated), length in `len`
unsafe extern "C" fn param(dr: *const DudaRequest, index: c_int, len: *mut usize) -> *const u8 {
    let value = dr
        .as_ref()
        .and_then(|dr| usize::try_from(index).ok().and_then(|i| dr.param(i)));
    match value {
        Some(value) => {
            if !len.is_null() {
                *len = value.len();
            }
            value.as_ptr()
        }
        None => ptr::null(),
    }
}

unsafe extern "C" fn set_end_callback(
    dr: *mut DudaRequest,
    callback: Option<NativeEndCallback>,
) -> c_int {
    let Some(dr) = dr.as_mut() else { return -1 };
    let Some(callback) = callback else { return -1 };
    dr.set_end_callback(move |dr: &mut DudaRequest| unsafe { callback(dr as *mut DudaRequest) });
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duda::request::tests::request_for;
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static END_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_end(_dr: *mut DudaRequest) {
        END_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_native_response_building() {
        let api = master();
        let mut dr = request_for("/blog/posts/list/42", 3);
        let ptr = &mut dr as *mut DudaRequest;
        let name = CString::new("Content-Type").unwrap();
        let value = CString::new("text/plain").unwrap();

        unsafe {
            assert_eq!((api.set_status)(ptr, 201), 0);
            assert_eq!((api.set_status)(ptr, 9000), -1);
            assert_eq!((api.add_header)(ptr, name.as_ptr(), value.as_ptr()), 0);
            assert_eq!((api.body_write)(ptr, b"hello".as_ptr(), 5), 0);
            assert_eq!((api.body_write)(ptr, ptr::null(), 3), -1);
        }

        assert_eq!(dr.status().code(), 201);
        assert_eq!(dr.pending_body(), 5);
        assert_eq!(api.version, DUDA_API_VERSION);
    }

    #[test]
    fn test_native_params() {
        let api = master();
        let dr = request_for("/blog/posts/list/42", 3);
        let ptr = &dr as *const DudaRequest;
        let mut len = 0usize;

        unsafe {
            assert_eq!((api.param_count)(ptr), 1);
            let p = (api.param)(ptr, 0, &mut len);
            assert_eq!(std::slice::from_raw_parts(p, len), b"42");
            assert!((api.param)(ptr, 1, &mut len).is_null());
            assert!((api.param)(ptr, -1, &mut len).is_null());
        }
    }

    #[test]
    fn test_native_events_and_end_callback() {
        let api = master();
        let mut dr = request_for("/blog/posts/list", 3);
        let ptr = &mut dr as *mut DudaRequest;
        let flush = Events::BODY_FLUSH.bits() as c_int;

        unsafe {
            assert_eq!((api.event_is_registered_write)(ptr, flush), 0);
            assert_eq!((api.event_register_write)(ptr, flush), 0);
            assert_eq!((api.event_is_registered_write)(ptr, flush), 1);
            assert_eq!((api.event_register_write)(ptr, 0), -1);
            assert_eq!((api.event_unregister_write)(ptr, flush), 0);
            assert_eq!((api.event_unregister_write)(ptr, flush), -1);
            assert_eq!((api.set_end_callback)(ptr, Some(count_end)), 0);
        }

        let before = END_CALLS.load(Ordering::SeqCst);
        if let Some(end) = dr.take_end_callback() {
            end(&mut dr);
        }
        assert_eq!(END_CALLS.load(Ordering::SeqCst), before + 1);
    }
}
