//! License compatibility gate.
//!
//! A backend module may declare an SPDX identifier. Before it is
//! initialised, the declared license is checked against the license the
//! calling program declared (if any). Only a handful of combinations are
//! understood; anything else is denied.

const SPDX_PREFIX: &str = "SPDX-License-Identifier: ";

/// Callers whose license may load a `GPL-2.0-or-later` (or
/// `GPL-2.0-only OR GPL-3.0-only`) backend.
const GPL2_COMPATIBLE: &[&str] = &[
    "GPL-2.0-only",
    "GPL-3.0-only",
    "GPL-2.0-or-later",
    "GPL-3.0-or-later",
];

const GPL3_COMPATIBLE: &[&str] = &["GPL-3.0-only", "GPL-3.0-or-later"];

fn strip_spdx(id: &str) -> &str {
    match id.get(..SPDX_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(SPDX_PREFIX) => &id[SPDX_PREFIX.len()..],
        _ => id,
    }
}

fn one_of(id: &str, set: &[&str]) -> bool {
    set.iter().any(|s| s.eq_ignore_ascii_case(id))
}

/// `true` if a program under `caller` may load a backend under `backend`.
pub fn check_license(caller: Option<&str>, backend: Option<&str>) -> bool {
    let backend = match backend {
        None => return true,
        Some(b) => strip_spdx(b),
    };
    if backend
        .get(..5)
        .is_some_and(|p| p.eq_ignore_ascii_case("LGPL-"))
    {
        return true;
    }
    let caller = match caller {
        None => return false,
        Some(c) => strip_spdx(c),
    };
    if caller.eq_ignore_ascii_case(backend) {
        return true;
    }
    if backend.eq_ignore_ascii_case("GPL-2.0-or-later")
        || backend.eq_ignore_ascii_case("GPL-2.0-only OR GPL-3.0-only")
    {
        return one_of(caller, GPL2_COMPATIBLE);
    }
    if backend.eq_ignore_ascii_case("GPL-3.0-or-later") {
        return one_of(caller, GPL3_COMPATIBLE);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_backend_is_permitted() {
        assert!(check_license(None, None));
        assert!(check_license(Some("MIT"), None));
    }

    #[test]
    fn lgpl_backend_is_permitted_for_anyone() {
        assert!(check_license(None, Some("LGPL-2.1-or-later")));
        assert!(check_license(
            Some("Proprietary"),
            Some("SPDX-License-Identifier: lgpl-2.1-or-later")
        ));
    }

    #[test]
    fn restricted_backend_needs_declared_caller() {
        assert!(!check_license(None, Some("GPL-2.0-or-later")));
    }

    #[test]
    fn gpl2_or_later_accepts_gpl_family() {
        assert!(check_license(Some("GPL-3.0-only"), Some("GPL-2.0-or-later")));
        assert!(check_license(
            Some("SPDX-License-Identifier: GPL-2.0-only"),
            Some("SPDX-License-Identifier: GPL-2.0-or-later")
        ));
        assert!(check_license(
            Some("gpl-3.0-or-later"),
            Some("GPL-2.0-only OR GPL-3.0-only")
        ));
    }

    #[test]
    fn gpl3_or_later_rejects_gpl2_only() {
        assert!(!check_license(Some("GPL-2.0-only"), Some("GPL-3.0-or-later")));
        assert!(check_license(Some("GPL-3.0-only"), Some("GPL-3.0-or-later")));
    }

    #[test]
    fn identical_unknown_licenses_match() {
        assert!(check_license(Some("MPL-2.0"), Some("mpl-2.0")));
        assert!(!check_license(Some("MIT"), Some("MPL-2.0")));
    }

    #[test]
    fn prefix_only_is_stripped_once() {
        assert_eq!(strip_spdx("SPDX-License-Identifier: MIT"), "MIT");
        assert_eq!(strip_spdx("MIT"), "MIT");
        assert_eq!(strip_spdx(""), "");
    }
}
