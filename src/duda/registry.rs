//! Web service registry
//!
//! At startup every service configured under a virtual host is looked up as
//! `<services_root>/<app_name>.duda`, opened through a [`ModuleLoader`],
//! initialized, and has each declared method bound to a [`Handler`]. A
//! service that fails any of these steps is disabled; the others load on.
//!
//! The resulting [`ServiceTable`] is built once before the workers start
//! and only read afterwards.

use super::api::DudaApi;
use super::request::DudaRequest;
use super::{Error, Result};
use crate::config::{HostId, ServerConfig};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File suffix of service modules
pub const SERVICE_EXTENSION: &str = "duda";

/// A bound service method
pub trait Handler: Send + Sync {
    fn call(&self, dr: &mut DudaRequest);
}

impl<F> Handler for F
where
    F: Fn(&mut DudaRequest) + Send + Sync,
{
    fn call(&self, dr: &mut DudaRequest) {
        self(dr)
    }
}

/// Method entry of a module's interface table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub uid: String,
    /// Symbol the callback is exported under
    pub callback: String,
}

/// Interface entry of a module's interface table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDef {
    pub uid: String,
    pub methods: Vec<MethodDef>,
}

/// An opened service module
pub trait ServiceModule: Send + Sync {
    /// Run the module's initialization entry point
    fn init(&mut self, api: &'static DudaApi) -> Result<()>;

    /// The interfaces the module declares
    fn interfaces(&self) -> Result<Vec<InterfaceDef>>;

    /// Resolve an exported callback symbol
    fn resolve(&self, symbol: &str) -> Option<Arc<dyn Handler>>;
}

/// Opens service modules from disk
pub trait ModuleLoader {
    fn open(&self, app_name: &str, path: &Path) -> Result<Box<dyn ServiceModule>>;
}

/// A method with its bound callback
#[derive(Clone)]
pub struct MethodDescriptor {
    uid: String,
    callback: String,
    handler: Arc<dyn Handler>,
}

impl MethodDescriptor {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Symbol name the handler was bound from
    pub fn callback(&self) -> &str {
        &self.callback
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("uid", &self.uid)
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    uid: String,
    methods: Vec<MethodDescriptor>,
}

impl InterfaceDescriptor {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }
}

/// One configured web service
pub struct ServiceDescriptor {
    app_name: String,
    path: PathBuf,
    enabled: bool,
    interfaces: Vec<InterfaceDescriptor>,
    failure: Option<Error>,
    // Declared after `interfaces` so bound handlers drop before the module.
    _module: Option<Box<dyn ServiceModule>>,
}

impl ServiceDescriptor {
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn interfaces(&self) -> &[InterfaceDescriptor] {
        &self.interfaces
    }

    /// Why the service was disabled
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Find a bound method, first match wins on both levels
    pub fn find_method(&self, interface: &str, method: &str) -> Option<&MethodDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.uid == interface)?
            .methods
            .iter()
            .find(|m| m.uid == method)
    }

    fn disabled(app_name: &str, path: PathBuf, failure: Error) -> Self {
        warn!(app = %app_name, path = %path.display(), error = %failure, "Web service disabled");
        ServiceDescriptor {
            app_name: app_name.to_string(),
            path,
            enabled: false,
            interfaces: Vec::new(),
            failure: Some(failure),
            _module: None,
        }
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("app_name", &self.app_name)
            .field("path", &self.path)
            .field("enabled", &self.enabled)
            .field("interfaces", &self.interfaces)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

/// The services of one virtual host
#[derive(Debug)]
pub struct VhostServices {
    host: HostId,
    services: Vec<ServiceDescriptor>,
}

impl VhostServices {
    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// First service whose application name equals `app_name`
    pub fn find(&self, app_name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.app_name == app_name)
    }
}

/// Services of every virtual host, read-only after startup
#[derive(Debug, Default)]
pub struct ServiceTable {
    vhosts: Vec<VhostServices>,
}

impl ServiceTable {
    /// Load every configured service through `loader`
    pub fn load(config: &ServerConfig, loader: &dyn ModuleLoader, api: &'static DudaApi) -> Self {
        let vhosts = config
            .vhosts
            .iter()
            .enumerate()
            .map(|(i, vhost)| VhostServices {
                host: HostId(i),
                services: vhost
                    .services
                    .iter()
                    .map(|app| load_service(&config.services_root, app, loader, api))
                    .collect(),
            })
            .collect();

        ServiceTable { vhosts }
    }

    /// Services bound to `host`
    pub fn vhost(&self, host: HostId) -> Option<&VhostServices> {
        self.vhosts.iter().find(|v| v.host == host)
    }

    pub fn vhosts(&self) -> &[VhostServices] {
        &self.vhosts
    }
}

/// Path of a service module under the services root
pub fn service_path(root: &Path, app_name: &str) -> PathBuf {
    root.join(format!("{}.{}", app_name, SERVICE_EXTENSION))
}

fn load_service(
    root: &Path,
    app_name: &str,
    loader: &dyn ModuleLoader,
    api: &'static DudaApi,
) -> ServiceDescriptor {
    let path = service_path(root, app_name);

    match fs::metadata(&path) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            let failure = Error::ModuleLoad {
                app: app_name.to_string(),
                reason: "not a regular file".to_string(),
            };
            return ServiceDescriptor::disabled(app_name, path, failure);
        }
        Err(e) => {
            let failure = Error::ModuleLoad {
                app: app_name.to_string(),
                reason: e.to_string(),
            };
            return ServiceDescriptor::disabled(app_name, path, failure);
        }
    }

    match bind_service(app_name, &path, loader, api) {
        Ok((module, interfaces)) => {
            info!(
                app = %app_name,
                path = %path.display(),
                interfaces = interfaces.len(),
                "Web service loaded"
            );
            ServiceDescriptor {
                app_name: app_name.to_string(),
                path,
                enabled: true,
                interfaces,
                failure: None,
                _module: Some(module),
            }
        }
        Err(failure) => ServiceDescriptor::disabled(app_name, path, failure),
    }
}

fn bind_service(
    app_name: &str,
    path: &Path,
    loader: &dyn ModuleLoader,
    api: &'static DudaApi,
) -> Result<(Box<dyn ServiceModule>, Vec<InterfaceDescriptor>)> {
    let mut module = loader.open(app_name, path)?;
    module.init(api)?;
    debug!(app = %app_name, "duda_init() done");

    let mut interfaces = Vec::new();
    for iface in module.interfaces()? {
        let mut methods = Vec::with_capacity(iface.methods.len());
        for method in iface.methods {
            let handler = module.resolve(&method.callback).ok_or_else(|| Error::SymbolBind {
                app: app_name.to_string(),
                interface: iface.uid.clone(),
                method: method.uid.clone(),
                symbol: method.callback.clone(),
            })?;
            methods.push(MethodDescriptor {
                uid: method.uid,
                callback: method.callback,
                handler,
            });
        }
        interfaces.push(InterfaceDescriptor {
            uid: iface.uid,
            methods,
        });
    }

    Ok((module, interfaces))
}

type Init = Box<dyn FnMut(&'static DudaApi) -> i32 + Send + Sync>;

/// A service module linked into the process
///
/// Declares interfaces and exports symbols the same way a native module
/// does, so the registry treats both alike.
#[derive(Default)]
pub struct StaticModule {
    init: Option<Init>,
    interfaces: Vec<InterfaceDef>,
    symbols: HashMap<String, Arc<dyn Handler>>,
}

impl StaticModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initialization entry point; a nonzero return fails the load
    pub fn on_init(
        mut self,
        init: impl FnMut(&'static DudaApi) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Box::new(init));
        self
    }

    /// Declare `interface/method`, bound to the `callback` symbol
    pub fn method(mut self, interface: &str, method: &str, callback: &str) -> Self {
        let def = MethodDef {
            uid: method.to_string(),
            callback: callback.to_string(),
        };
        match self.interfaces.iter_mut().find(|i| i.uid == interface) {
            Some(iface) => iface.methods.push(def),
            None => self.interfaces.push(InterfaceDef {
                uid: interface.to_string(),
                methods: vec![def],
            }),
        }
        self
    }

    /// Export a callback under `name`
    pub fn symbol(mut self, name: &str, handler: impl Handler + 'static) -> Self {
        self.symbols.insert(name.to_string(), Arc::new(handler));
        self
    }
}

impl ServiceModule for StaticModule {
    fn init(&mut self, api: &'static DudaApi) -> Result<()> {
        let status = self.init.as_mut().map(|init| init(api)).unwrap_or(0);
        if status != 0 {
            return Err(Error::ModuleInit { status });
        }
        Ok(())
    }

    fn interfaces(&self) -> Result<Vec<InterfaceDef>> {
        Ok(self.interfaces.clone())
    }

    fn resolve(&self, symbol: &str) -> Option<Arc<dyn Handler>> {
        self.symbols.get(symbol).cloned()
    }
}

type Factory = Box<dyn Fn() -> StaticModule + Send + Sync>;

/// Loader for modules linked into the process, keyed by application name
#[derive(Default)]
pub struct StaticLoader {
    factories: HashMap<String, Factory>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `app_name` loadable
    pub fn register(
        &mut self,
        app_name: impl Into<String>,
        factory: impl Fn() -> StaticModule + Send + Sync + 'static,
    ) -> &mut Self {
        self.factories.insert(app_name.into(), Box::new(factory));
        self
    }
}

impl ModuleLoader for StaticLoader {
    fn open(&self, app_name: &str, _path: &Path) -> Result<Box<dyn ServiceModule>> {
        let factory = self.factories.get(app_name).ok_or_else(|| Error::ModuleLoad {
            app: app_name.to_string(),
            reason: "no module registered under this name".to_string(),
        })?;
        Ok(Box::new(factory()))
    }
}
