//! Native service modules
//!
//! A native module is a shared object exporting:
//!
//! - `int duda_init(const DudaApi *api)`, zero meaning success
//! - `_duda_interfaces`, a [`DudaInterfaceTable`] describing its methods
//! - one `void callback(DudaRequest *dr)` per declared method, exported
//!   under the declared callback name

use super::api::DudaApi;
use super::registry::{Handler, InterfaceDef, MethodDef, ModuleLoader, ServiceModule};
use super::request::DudaRequest;
use super::{Error, Result};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

/// Symbol of the initialization entry point
pub const INIT_SYMBOL: &str = "duda_init";
/// Symbol of the interface table
pub const INTERFACES_SYMBOL: &str = "_duda_interfaces";

pub type NativeInit = unsafe extern "C" fn(*const DudaApi) -> c_int;
pub type NativeCallback = unsafe extern "C" fn(*mut DudaRequest);

#[repr(C)]
pub struct DudaMethodDef {
    pub uid: *const c_char,
    pub callback: *const c_char,
}

#[repr(C)]
pub struct DudaInterfaceDef {
    pub uid: *const c_char,
    pub methods: *const DudaMethodDef,
    pub n_methods: usize,
}

#[repr(C)]
pub struct DudaInterfaceTable {
    pub interfaces: *const DudaInterfaceDef,
    pub n_interfaces: usize,
}

fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dynamic loader error".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

unsafe fn c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

/// Copy a module's interface table into owned definitions
///
/// # Safety
///
/// Every non-null pointer in `table` must point to valid entries and
/// NUL-terminated strings for the duration of the call.
unsafe fn read_interface_table(
    table: &DudaInterfaceTable,
) -> std::result::Result<Vec<InterfaceDef>, String> {
    if table.interfaces.is_null() {
        return Ok(Vec::new());
    }
    let raw_ifaces = std::slice::from_raw_parts(table.interfaces, table.n_interfaces);

    let mut interfaces = Vec::with_capacity(raw_ifaces.len());
    for raw in raw_ifaces {
        let uid = c_string(raw.uid).ok_or_else(|| "interface without uid".to_string())?;

        let raw_methods = if raw.methods.is_null() {
            &[][..]
        } else {
            std::slice::from_raw_parts(raw.methods, raw.n_methods)
        };

        let mut methods = Vec::with_capacity(raw_methods.len());
        for m in raw_methods {
            let (Some(method_uid), Some(callback)) = (c_string(m.uid), c_string(m.callback)) else {
                return Err(format!("incomplete method entry in '{}'", uid));
            };
            methods.push(MethodDef {
                uid: method_uid,
                callback,
            });
        }

        interfaces.push(InterfaceDef { uid, methods });
    }

    Ok(interfaces)
}

/// Loads modules with `dlopen`
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn open(&self, app_name: &str, path: &Path) -> Result<Box<dyn ServiceModule>> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::ModuleLoad {
            app: app_name.to_string(),
            reason: "path contains a NUL byte".to_string(),
        })?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY) };
        if handle.is_null() {
            return Err(Error::ModuleLoad {
                app: app_name.to_string(),
                reason: last_dl_error(),
            });
        }

        Ok(Box::new(DylibModule {
            app_name: app_name.to_string(),
            handle,
        }))
    }
}

struct DylibModule {
    app_name: String,
    handle: *mut c_void,
}

// The handle is only used for dlsym lookups, which are thread-safe, and is
// closed once in Drop.
unsafe impl Send for DylibModule {}
unsafe impl Sync for DylibModule {}

impl DylibModule {
    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            libc::dlerror();
            let sym = libc::dlsym(self.handle, c_name.as_ptr());
            if !libc::dlerror().is_null() || sym.is_null() {
                return None;
            }
            Some(sym)
        }
    }

    fn load_error(&self, reason: String) -> Error {
        Error::ModuleLoad {
            app: self.app_name.clone(),
            reason,
        }
    }
}

impl ServiceModule for DylibModule {
    fn init(&mut self, api: &'static DudaApi) -> Result<()> {
        let sym = self
            .symbol(INIT_SYMBOL)
            .ok_or_else(|| self.load_error(format!("missing {}", INIT_SYMBOL)))?;
        let init: NativeInit = unsafe { std::mem::transmute::<*mut c_void, NativeInit>(sym) };

        let status = unsafe { init(api as *const DudaApi) };
        if status != 0 {
            return Err(Error::ModuleInit { status });
        }
        Ok(())
    }

    fn interfaces(&self) -> Result<Vec<InterfaceDef>> {
        let sym = self
            .symbol(INTERFACES_SYMBOL)
            .ok_or_else(|| self.load_error(format!("missing {}", INTERFACES_SYMBOL)))?;
        let table = unsafe { &*(sym as *const DudaInterfaceTable) };
        unsafe { read_interface_table(table) }.map_err(|reason| self.load_error(reason))
    }

    fn resolve(&self, symbol: &str) -> Option<Arc<dyn Handler>> {
        let sym = self.symbol(symbol)?;
        let callback = unsafe { std::mem::transmute::<*mut c_void, NativeCallback>(sym) };
        Some(Arc::new(NativeHandler(callback)))
    }
}

impl Drop for DylibModule {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

struct NativeHandler(NativeCallback);

impl Handler for NativeHandler {
    fn call(&self, dr: &mut DudaRequest) {
        unsafe { (self.0)(dr as *mut DudaRequest) }
    }
}
