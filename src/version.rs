//! Version strings for the scw binary.
//!
//! Release builds may set `SCW_GIT_REV` at compile time to stamp the revision.

use std::sync::LazyLock;

pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build revision (empty when not set).
pub const GIT_REV: &str = match option_env!("SCW_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static FULL_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}\nwire protocol version {}",
        full_version(),
        crate::worker::protocol::WIRE_VERSION
    )
});

/// `"X.Y.Z"`, or `"X.Y.Z (rev)"` when built with a revision.
///
/// ```
/// let version = scw::version::full_version();
/// assert!(version.starts_with(env!("CARGO_PKG_VERSION")));
/// ```
pub fn full_version() -> String {
    FULL_VERSION.clone()
}

/// Text for `--version`, including the worker wire protocol version.
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_format() {
        let version = full_version();
        if GIT_REV.is_empty() {
            assert_eq!(version, PKG_VERSION);
        } else {
            assert!(version.contains(GIT_REV));
        }
    }

    #[test]
    fn test_long_version_mentions_wire_protocol() {
        let long = long_version();
        assert!(long.starts_with(&full_version()));
        assert!(long.contains("wire protocol version 1"));
    }
}
