//! The set of stage kinds a backend can execute.

use super::BackendKind;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A small set of [`BackendKind`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    /// The empty set.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// Every kind.
    #[must_use]
    pub const fn all() -> Self {
        Self(0b1111)
    }

    /// A set holding one kind.
    #[must_use]
    pub const fn only(kind: BackendKind) -> Self {
        Self(bit(kind))
    }

    /// Builds a set from kinds.
    #[must_use]
    pub fn of(kinds: impl IntoIterator<Item = BackendKind>) -> Self {
        kinds.into_iter().fold(Self::none(), Self::with)
    }

    /// Adds a kind.
    #[must_use]
    pub const fn with(self, kind: BackendKind) -> Self {
        Self(self.0 | bit(kind))
    }

    /// Returns true if the kind is in the set.
    #[must_use]
    pub const fn supports(self, kind: BackendKind) -> bool {
        self.0 & bit(kind) != 0
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The kinds in the set, in declaration order.
    #[must_use]
    pub fn kinds(self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .collect()
    }
}

const fn bit(kind: BackendKind) -> u8 {
    match kind {
        BackendKind::Process => 0b0001,
        BackendKind::Container => 0b0010,
        BackendKind::ComposeService => 0b0100,
        BackendKind::ClusterWorkload => 0b1000,
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.kinds().iter().map(ToString::to_string).collect();
        f.write_str(&names.join(","))
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.kinds().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kinds = Vec::<BackendKind>::deserialize(deserializer)?;
        Ok(Self::of(kinds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_membership() {
        let caps = Capabilities::only(BackendKind::Container).with(BackendKind::Process);
        assert!(caps.supports(BackendKind::Container));
        assert!(caps.supports(BackendKind::Process));
        assert!(!caps.supports(BackendKind::ClusterWorkload));
        assert_eq!(caps.kinds(), vec![BackendKind::Process, BackendKind::Container]);
    }

    #[test]
    fn test_capabilities_all_and_none() {
        assert!(Capabilities::none().is_empty());
        for kind in BackendKind::ALL {
            assert!(Capabilities::all().supports(kind));
        }
    }

    #[test]
    fn test_capabilities_serde() {
        let caps: Capabilities = serde_json::from_str(r#"["container", "compose-service"]"#).unwrap();
        assert_eq!(
            caps,
            Capabilities::of([BackendKind::Container, BackendKind::ComposeService])
        );
        assert_eq!(caps.to_string(), "container,compose-service");
        assert_eq!(
            serde_json::to_string(&caps).unwrap(),
            r#"["container","compose-service"]"#
        );
    }
}
