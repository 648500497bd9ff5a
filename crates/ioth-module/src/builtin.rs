//! Statically registered backends.
//!
//! A `BackendFactory` makes a backend known by name without any shared
//! object. Registrations are consulted before module search, so they
//! also shadow modules of the same name.

use std::fmt;
use std::sync::Arc;

use ioth_core::backend::StackBackend;
use ioth_core::error::Result;
use ioth_core::spec::InterfaceSpec;

use crate::host::HostStack;

/// Constructor: `(interfaces, options) -> backend`.
pub type CreateFn =
    dyn Fn(&[InterfaceSpec<'_>], Option<&str>) -> Result<Box<dyn StackBackend>> + Send + Sync;

#[derive(Clone)]
pub struct BackendFactory {
    pub name: String,
    /// SPDX identifier checked by the license gate, like a module's.
    pub license: Option<String>,
    pub create: Arc<CreateFn>,
}

impl BackendFactory {
    pub fn new<F>(name: impl Into<String>, create: F) -> Self
    where
        F: Fn(&[InterfaceSpec<'_>], Option<&str>) -> Result<Box<dyn StackBackend>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            license: None,
            create: Arc::new(create),
        }
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn create(
        &self,
        interfaces: &[InterfaceSpec<'_>],
        options: Option<&str>,
    ) -> Result<Box<dyn StackBackend>> {
        (self.create)(interfaces, options)
    }
}

impl fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendFactory")
            .field("name", &self.name)
            .field("license", &self.license)
            .finish_non_exhaustive()
    }
}

/// Host stack under both of its conventional names.
pub fn defaults() -> Vec<BackendFactory> {
    ["host", HostStack::NAME]
        .into_iter()
        .map(|name| {
            BackendFactory::new(name, |_, _| {
                Ok(Box::new(HostStack::new()) as Box<dyn StackBackend>)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_host_and_kernel() {
        let names: Vec<_> = defaults().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["host", "kernel"]);
    }

    #[test]
    fn factory_creates_backend() {
        let f = &defaults()[1];
        let b = f.create(&[], None).unwrap();
        assert_eq!(b.name(), "kernel");
        assert!(f.license.is_none());
    }

    #[test]
    fn factory_sees_interfaces_and_options() {
        let f = BackendFactory::new("recorder", |ifaces, opts| {
            assert_eq!(ifaces.len(), 1);
            assert_eq!(ifaces[0].ifname, Some("eth0"));
            assert_eq!(opts, Some("mtu=1400"));
            Ok(Box::new(HostStack::new()) as Box<dyn StackBackend>)
        })
        .with_license("GPL-2.0-or-later");
        let ifaces = [InterfaceSpec::parse("eth0=vde://")];
        assert!(f.create(&ifaces, Some("mtu=1400")).is_ok());
        assert_eq!(f.license.as_deref(), Some("GPL-2.0-or-later"));
    }
}
