// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Build version reporting

/// The version string served by `/version`.
///
/// The crate version with the git SHA of the build attached as semver
/// build metadata, e.g. `0.3.0+4f2a91c`.
pub fn get_version() -> String {
    let sha = env!("VERGEN_GIT_SHA");
    format!("{}+{sha}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_carries_build_metadata() {
        let version = get_version();
        assert!(version.starts_with(env!("CARGO_PKG_VERSION")), "{version}");
        assert!(version.contains('+'), "{version}");
    }
}
