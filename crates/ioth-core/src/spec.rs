//! Stack and interface specification strings.
//!
//! A stack is requested as `name[,options]`: the backend name, then an
//! options string handed to the backend verbatim. An empty name selects
//! the host stack.
//!
//! Interfaces are backend-defined attachment strings such as
//! `vde://` or `eth1=vxvde://234.0.0.1`. The only structure the core
//! knows about is the optional `ifname=` prefix.

use crate::error::{IothError, Result};

/// Maximum interface name length, not counting the terminator.
pub const IFNAME_MAX: usize = libc::IFNAMSIZ - 1;

/// Parsed `name[,options]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSpec<'a> {
    pub name: &'a str,
    pub options: Option<&'a str>,
}

impl<'a> StackSpec<'a> {
    /// Split at the first comma.
    ///
    /// Rejected: options with an empty name (`",opts"`), options that
    /// themselves contain a comma, names that could escape the module
    /// directory, and interior NULs.
    pub fn parse(spec: &'a str) -> Result<Self> {
        if spec.contains('\0') {
            return Err(IothError::InvalidInput(format!("stack spec {spec:?} contains NUL")));
        }
        let (name, options) = match spec.split_once(',') {
            Some((name, options)) => (name, Some(options)),
            None => (spec, None),
        };
        if name.is_empty() && options.is_some() {
            return Err(IothError::InvalidInput(format!(
                "stack spec {spec:?}: options given without a backend name"
            )));
        }
        if options.is_some_and(|o| o.contains(',')) {
            return Err(IothError::InvalidInput(format!(
                "stack spec {spec:?}: options contain a second comma"
            )));
        }
        if name.contains('/') || name == "." || name == ".." {
            return Err(IothError::InvalidInput(format!(
                "stack spec {spec:?}: invalid backend name"
            )));
        }
        Ok(Self { name, options })
    }

    /// Empty name: the host stack, no module.
    pub fn is_host(&self) -> bool {
        self.name.is_empty()
    }
}

/// Interface attachment string with its optional `ifname=` prefix split off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSpec<'a> {
    pub ifname: Option<&'a str>,
    pub endpoint: &'a str,
}

impl<'a> InterfaceSpec<'a> {
    /// The prefix is split when an `=` is present and comes before the
    /// `://` scheme delimiter, or when there is no scheme delimiter.
    pub fn parse(spec: &'a str) -> Self {
        let scheme = spec.find("://");
        match spec.find('=') {
            Some(eq) if scheme.map_or(true, |s| eq < s) => Self {
                ifname: Some(truncate_ifname(&spec[..eq])),
                endpoint: &spec[eq + 1..],
            },
            _ => Self {
                ifname: None,
                endpoint: spec,
            },
        }
    }

    /// Interface name, or `<prefix><index>` when none was given.
    pub fn ifname_or(&self, prefix: &str, index: usize) -> String {
        match self.ifname {
            Some(name) => name.to_owned(),
            None => truncate_ifname(&format!("{prefix}{index}")).to_owned(),
        }
    }
}

fn truncate_ifname(name: &str) -> &str {
    if name.len() <= IFNAME_MAX {
        return name;
    }
    let mut end = IFNAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_only() {
        let s = StackSpec::parse("vdestack").unwrap();
        assert_eq!(s.name, "vdestack");
        assert_eq!(s.options, None);
        assert!(!s.is_host());
    }

    #[test]
    fn name_and_options() {
        let s = StackSpec::parse("picox,mac=80:01:01:01:01:01").unwrap();
        assert_eq!(s.name, "picox");
        assert_eq!(s.options, Some("mac=80:01:01:01:01:01"));

        let s = StackSpec::parse("picox,").unwrap();
        assert_eq!(s.options, Some(""));
    }

    #[test]
    fn empty_is_host() {
        assert!(StackSpec::parse("").unwrap().is_host());
    }

    #[test]
    fn malformed_specs_rejected() {
        for bad in [",opts", "picox,a,b", "../evil", "a/b", "..", "x\0y"] {
            let err = StackSpec::parse(bad).unwrap_err();
            assert!(matches!(err, IothError::InvalidInput(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn interface_prefix_before_scheme() {
        let i = InterfaceSpec::parse("eth1=vxvde://234.0.0.1");
        assert_eq!(i.ifname, Some("eth1"));
        assert_eq!(i.endpoint, "vxvde://234.0.0.1");
    }

    #[test]
    fn equals_after_scheme_is_not_prefix() {
        let i = InterfaceSpec::parse("vxvde://234.0.0.1/port=5000");
        assert_eq!(i.ifname, None);
        assert_eq!(i.endpoint, "vxvde://234.0.0.1/port=5000");
    }

    #[test]
    fn equals_without_scheme_is_prefix() {
        let i = InterfaceSpec::parse("tap0=tap");
        assert_eq!(i.ifname, Some("tap0"));
        assert_eq!(i.endpoint, "tap");
    }

    #[test]
    fn plain_endpoint_gets_indexed_name() {
        let i = InterfaceSpec::parse("vde://");
        assert_eq!(i.ifname, None);
        assert_eq!(i.ifname_or("vde", 2), "vde2");
    }

    #[test]
    fn long_names_truncated() {
        let i = InterfaceSpec::parse("averyveryverylongifname=vde://");
        assert_eq!(i.ifname.map(str::len), Some(IFNAME_MAX));
    }
}
