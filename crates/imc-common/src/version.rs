//! API version triple.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `major.minor.patch` version of an API surface.
///
/// Compatibility follows the usual contract: the major version must match
/// exactly, the minor version must be at least what the caller requires, and
/// the patch level never gates anything.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ApiVersion {
    /// Incompatible revisions.
    pub major: u16,
    /// Backwards-compatible additions.
    pub minor: u16,
    /// Behaviour-preserving fixes.
    pub patch: u16,
}

impl ApiVersion {
    /// Builds a version triple.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a provider at `self` satisfies a caller requiring `required`.
    pub fn is_compatible_with(self, required: ApiVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_requires_exact_major() {
        let provided = ApiVersion::new(2, 3, 0);
        assert!(provided.is_compatible_with(ApiVersion::new(2, 0, 0)));
        assert!(provided.is_compatible_with(ApiVersion::new(2, 3, 9)));
        assert!(!provided.is_compatible_with(ApiVersion::new(2, 4, 0)));
        assert!(!provided.is_compatible_with(ApiVersion::new(1, 0, 0)));
        assert!(!provided.is_compatible_with(ApiVersion::new(3, 0, 0)));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(ApiVersion::new(1, 2, 3) < ApiVersion::new(1, 3, 0));
        assert!(ApiVersion::new(1, 2, 3) < ApiVersion::new(2, 0, 0));
    }
}
