//! Path routing for web services
//!
//! A service path has the shape `/<app>/<interface>/<method>[/<param>]*`.
//! Empty segments from repeated slashes are skipped.

use super::{Error, Result};

/// Segments of a service request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPath {
    app_name: String,
    interface: String,
    method: String,
    params: Vec<String>,
}

impl RoutedPath {
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

/// Split a processed URI into app name, interface, method and parameters
///
/// Fails when the interface or method segment is missing, or with
/// [`Error::ParamOverflow`] when more than `max_params` parameters follow.
pub fn parse_path(uri: &str, max_params: usize) -> Result<RoutedPath> {
    let mut segments = uri.split('/').filter(|s| !s.is_empty());

    let (app_name, interface, method) =
        match (segments.next(), segments.next(), segments.next()) {
            (Some(app), Some(iface), Some(method)) => (app, iface, method),
            _ => return Err(Error::MalformedPath(uri.to_string())),
        };

    let mut params = Vec::new();
    for segment in segments {
        if params.len() >= max_params {
            return Err(Error::ParamOverflow { max: max_params });
        }
        params.push(segment.to_string());
    }

    Ok(RoutedPath {
        app_name: app_name.to_string(),
        interface: interface.to_string(),
        method: method.to_string(),
        params,
    })
}

/// The prospective application name of a processed URI
///
/// Only the segment between the leading slash and the next one counts; a
/// URI without that second slash can never reach a service method. Names
/// shorter than two characters are never services, so `/b/posts` is left to
/// the fallback handler.
pub fn service_segment(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix('/')?;
    let end = rest.find('/')?;
    let name = &rest[..end];
    (name.len() > 1).then_some(name)
}
