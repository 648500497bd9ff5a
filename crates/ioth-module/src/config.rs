//! Registry construction.

use ioth_core::error::Result;

use crate::builtin::{self, BackendFactory};
use crate::loader::LoaderConfig;
use crate::registry::Ioth;

/// Builder for an [`Ioth`] registry.
///
/// Each setting can be overridden before building.
pub struct IothBuilder {
    loader: Option<LoaderConfig>,
    license: Option<String>,
    backends: Vec<BackendFactory>,
    default_stack: Option<String>,
}

impl Default for IothBuilder {
    fn default() -> Self {
        Self {
            loader: None, // None = LoaderConfig::from_env()
            license: None,
            backends: builtin::defaults(),
            default_stack: None,
        }
    }
}

impl IothBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Program license for the license gate.
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    /// Register a backend. A later registration replaces an earlier one
    /// with the same name, including the built-in ones.
    pub fn backend(mut self, factory: BackendFactory) -> Self {
        self.backends.push(factory);
        self
    }

    /// Create the default stack from `name[,options]` at build time
    /// instead of using the host stack.
    pub fn default_stack(mut self, spec: impl Into<String>) -> Self {
        self.default_stack = Some(spec.into());
        self
    }

    /// Build the registry.
    ///
    /// 1. Resolves the loader configuration
    /// 2. Installs static registrations
    /// 3. Applies the program license
    /// 4. Creates the default stack, if one was requested
    pub fn build(self) -> Result<Ioth> {
        let loader = self.loader.unwrap_or_else(LoaderConfig::from_env);
        let ioth = Ioth::from_parts(loader, self.backends, self.license);
        if let Some(spec) = self.default_stack {
            let stack = ioth.new_stack(&spec)?;
            ioth.set_default_stack(Some(stack))?;
        }
        Ok(ioth)
    }
}
