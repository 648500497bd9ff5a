//! Module search.
//!
//! For a backend `X`, each directory in the search path is tried in
//! order, and within a directory the restartable variant first:
//!
//! ```text
//!   $HOME/.ioth/ioth_X-r.so      isolated link map
//!   $HOME/.ioth/ioth_X.so        base link map
//!   /usr/local/lib/ioth/ioth_X-r.so
//!   /usr/local/lib/ioth/ioth_X.so
//!   ./ioth_X-r.so, ./ioth_X.so   (debug builds or IOTH_SEARCH_CWD=1)
//! ```
//!
//! The first candidate that loads wins.

use std::ffi::OsString;
use std::path::PathBuf;

use tracing::{debug, info};

use ioth_core::env::{flag_value, home_relative, path_value};
use ioth_core::error::{IothError, Result};

use crate::dynlib::{Library, Module, Namespace};

/// Symbol and file name prefix.
pub const SYMBOL_PREFIX: &str = "ioth_";

const USER_DIR: &str = ".ioth";
const SYSTEM_DIR: &str = "/usr/local/lib/ioth";

/// Where and how modules are looked up.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub user_dir: PathBuf,
    pub system_dir: PathBuf,
    pub search_cwd: bool,
    pub prefix: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_dir: home_relative(USER_DIR),
            system_dir: PathBuf::from(SYSTEM_DIR),
            search_cwd: cfg!(debug_assertions),
            prefix: SYMBOL_PREFIX.to_owned(),
        }
    }
}

impl LoaderConfig {
    /// Defaults overridden by `IOTH_USER_PATH`, `IOTH_SYSTEM_PATH` and
    /// `IOTH_SEARCH_CWD`.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var_os(key))
    }

    /// Defaults overridden by the same variables, read through `var`.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let d = Self::default();
        Self {
            user_dir: path_value(var("IOTH_USER_PATH")).unwrap_or(d.user_dir),
            system_dir: path_value(var("IOTH_SYSTEM_PATH")).unwrap_or(d.system_dir),
            search_cwd: flag_value(var("IOTH_SEARCH_CWD"), d.search_cwd),
            prefix: d.prefix,
        }
    }

    /// Search directories in order.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.user_dir.clone(), self.system_dir.clone()];
        if self.search_cwd {
            dirs.push(PathBuf::from("."));
        }
        dirs
    }

    /// Every file tried for backend `name`, in order.
    pub fn candidates(&self, name: &str) -> Vec<(PathBuf, Namespace)> {
        self.search_dirs()
            .into_iter()
            .flat_map(|dir| {
                [
                    (dir.join(format!("{}{name}-r.so", self.prefix)), Namespace::Isolated),
                    (dir.join(format!("{}{name}.so", self.prefix)), Namespace::Shared),
                ]
            })
            .collect()
    }

    /// Load the first candidate and resolve its symbols.
    pub fn load(&self, name: &str) -> Result<Module> {
        let lib = self.open(name)?;
        Module::resolve(lib, &self.prefix, name)
    }

    fn open(&self, name: &str) -> Result<Library> {
        for (path, ns) in self.candidates(name) {
            match Library::open(&path, ns) {
                Ok(lib) => {
                    info!(module = name, path = %path.display(), namespace = ?ns, "module loaded");
                    return Ok(lib);
                }
                Err(error) => {
                    debug!(module = name, path = %path.display(), %error, "candidate rejected");
                }
            }
        }
        Err(IothError::ModuleNotFound {
            name: name.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynlib::tests::{fixture_dir, unix_pair, FixtureData};
    use crate::dynlib::DynStack;
    use ioth_core::abi::OpSet;
    use ioth_core::backend::StackBackend;
    use libc::c_int;
    use nix::errno::Errno;
    use std::ffi::CStr;

    fn config(cwd: bool) -> LoaderConfig {
        LoaderConfig {
            user_dir: PathBuf::from("/home/u/.ioth"),
            system_dir: PathBuf::from("/usr/local/lib/ioth"),
            search_cwd: cwd,
            prefix: SYMBOL_PREFIX.to_owned(),
        }
    }

    #[test]
    fn candidate_order() {
        let c = config(false).candidates("vdestack");
        let paths: Vec<_> = c.iter().map(|(p, ns)| (p.to_str().unwrap(), *ns)).collect();
        assert_eq!(
            paths,
            vec![
                ("/home/u/.ioth/ioth_vdestack-r.so", Namespace::Isolated),
                ("/home/u/.ioth/ioth_vdestack.so", Namespace::Shared),
                ("/usr/local/lib/ioth/ioth_vdestack-r.so", Namespace::Isolated),
                ("/usr/local/lib/ioth/ioth_vdestack.so", Namespace::Shared),
            ]
        );
    }

    #[test]
    fn cwd_is_searched_last() {
        let c = config(true).candidates("picox");
        assert_eq!(c.len(), 6);
        assert_eq!(c[4].0, PathBuf::from("./ioth_picox-r.so"));
        assert_eq!(c[5].0, PathBuf::from("./ioth_picox.so"));
    }

    #[test]
    fn missing_module_is_not_found() {
        let mut cfg = config(false);
        cfg.user_dir = PathBuf::from("/nonexistent/a");
        cfg.system_dir = PathBuf::from("/nonexistent/b");
        match cfg.load("nosuchstack") {
            Err(IothError::ModuleNotFound { name }) => assert_eq!(name, "nosuchstack"),
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("loaded a module from nowhere"),
        }
    }

    #[test]
    fn variables_override_defaults() {
        let vars = |key: &str| match key {
            "IOTH_SYSTEM_PATH" => Some(OsString::from("/opt/ioth-test")),
            "IOTH_USER_PATH" => Some(OsString::new()),
            "IOTH_SEARCH_CWD" => Some(OsString::from("on")),
            _ => None,
        };
        let cfg = LoaderConfig::from_vars(vars);
        assert_eq!(cfg.system_dir, PathBuf::from("/opt/ioth-test"));
        assert_eq!(cfg.user_dir, LoaderConfig::default().user_dir);
        assert!(cfg.search_cwd);
        assert_eq!(cfg.prefix, SYMBOL_PREFIX);

        let cfg = LoaderConfig::from_vars(|_| None);
        assert_eq!(cfg.system_dir, PathBuf::from(SYSTEM_DIR));
        assert_eq!(cfg.search_cwd, cfg!(debug_assertions));
    }

    fn fixture_config(dir: PathBuf) -> LoaderConfig {
        LoaderConfig {
            user_dir: dir,
            system_dir: PathBuf::from("/nonexistent/system"),
            search_cwd: false,
            prefix: SYMBOL_PREFIX.to_owned(),
        }
    }

    fn instance(stack: &DynStack) -> c_int {
        unsafe { (*(stack.stack_data() as *const FixtureData)).instance }
    }

    #[test]
    fn loads_module_from_search_path() {
        let Some(dir) = fixture_dir("ioth_fixture.so") else {
            return;
        };
        let module = fixture_config(dir).load("fixture").unwrap();
        assert_eq!(module.name(), "fixture");
        assert_eq!(module.license(), Some("SPDX-License-Identifier: LGPL-2.1-or-later"));

        let stack = module.instantiate(&["vde://", "tap://tap0"], "mtu=1400").unwrap();
        assert_eq!(stack.native_ops(), OpSet::MINIMAL);
        let data = unsafe { &*(stack.stack_data() as *const FixtureData) };
        assert_eq!(data.ifaces, 2);
        let options = unsafe { CStr::from_ptr(data.options.as_ptr()) };
        assert_eq!(options.to_str().unwrap(), "mtu=1400");

        // Narrow primitives reach the module through its message slots.
        let (a, b) = unix_pair();
        assert_eq!(stack.write(a, b"from module").unwrap(), 11);
        let mut buf = [0u8; 32];
        let n = stack.read(b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"from module");
        stack.close(a).unwrap();
        stack.close(b).unwrap();

        let fd = stack.socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0).unwrap();
        stack.close(fd).unwrap();
        stack.release().unwrap();
    }

    #[test]
    fn module_newstack_failure_is_backend_error() {
        let Some(dir) = fixture_dir("ioth_fixture.so") else {
            return;
        };
        let module = fixture_config(dir).load("fixture").unwrap();
        let err = module.instantiate(&[], "fail").err().unwrap();
        assert!(matches!(err, IothError::Backend(Errno::EPERM)));
    }

    #[test]
    fn default_variant_shares_one_copy() {
        let Some(dir) = fixture_dir("ioth_fixture.so") else {
            return;
        };
        let cfg = fixture_config(dir);
        let a = cfg.load("fixture").unwrap().instantiate(&[], "").unwrap();
        let b = cfg.load("fixture").unwrap().instantiate(&[], "").unwrap();
        assert_eq!((instance(&a), instance(&b)), (1, 2));
        a.release().unwrap();
        b.release().unwrap();
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn restartable_variant_gets_private_copies() {
        let Some(dir) = fixture_dir("ioth_fixture-r.so") else {
            return;
        };
        let cfg = fixture_config(dir);
        let a = cfg.load("fixture").unwrap().instantiate(&[], "").unwrap();
        let b = cfg.load("fixture").unwrap().instantiate(&["vde://"], "").unwrap();
        assert_eq!((instance(&a), instance(&b)), (1, 1));
        a.release().unwrap();
        b.release().unwrap();
    }
}
