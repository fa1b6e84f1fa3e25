//! Runner labels and their per-batch allocation.
//!
//! A label is the only handle the stop path has on a registered runner, so
//! every instance in a batch must receive a distinct one. Labels are derived
//! from the provider's instance identity, which is already unique, so no
//! coordination with the registry is needed.

use std::collections::BTreeSet;
use std::fmt;

use crate::provider::InstanceId;

/// Prefix applied to generated labels when none is configured.
pub const DEFAULT_LABEL_PREFIX: &str = "runner";

const SHORT_SUFFIX_LEN: usize = 8;

/// Label under which a runner registers with the CI platform.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RunnerLabel(String);

impl RunnerLabel {
    /// Wraps an existing label value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the label as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for RunnerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunnerLabel {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RunnerLabel {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for RunnerLabel {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Hands out unique labels for the instances of a single batch.
#[derive(Clone, Debug)]
pub struct LabelAllocator {
    prefix: String,
    assigned: BTreeSet<RunnerLabel>,
}

impl LabelAllocator {
    /// Creates an allocator producing `<prefix>-<suffix>` labels.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            assigned: BTreeSet::new(),
        }
    }

    /// Returns the label for `instance_id`, distinct from every label already
    /// handed out by this allocator.
    ///
    /// The suffix is the first eight alphanumeric characters of the identity.
    /// On a collision the full sanitised identity is used, then an index is
    /// appended.
    pub fn assign(&mut self, instance_id: &InstanceId) -> RunnerLabel {
        let sanitized = sanitize(instance_id.as_str());
        let short: String = sanitized.chars().take(SHORT_SUFFIX_LEN).collect();

        for suffix in [short.as_str(), sanitized.as_str()] {
            if suffix.is_empty() {
                continue;
            }
            let label = RunnerLabel::new(format!("{}-{suffix}", self.prefix));
            if self.assigned.insert(label.clone()) {
                return label;
            }
        }

        let base = if sanitized.is_empty() {
            "instance"
        } else {
            sanitized.as_str()
        };
        let mut index = self.assigned.len();
        loop {
            let label = RunnerLabel::new(format!("{}-{base}-{index}", self.prefix));
            if self.assigned.insert(label.clone()) {
                return label;
            }
            index += 1;
        }
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("6f1c2a3b-4c5d-6e7f-8091-a2b3c4d5e6f7", "runner-6f1c2a3b")]
    #[case("i-0ABCDEF1234567890", "runner-i0abcdef")]
    #[case("abc", "runner-abc")]
    fn assign_uses_short_identity_suffix(#[case] id: &str, #[case] expected: &str) {
        let mut allocator = LabelAllocator::new(DEFAULT_LABEL_PREFIX);
        let label = allocator.assign(&InstanceId::from(id));
        assert_eq!(label.as_str(), expected);
    }

    #[rstest]
    fn assign_falls_back_to_full_identity_on_collision() {
        let mut allocator = LabelAllocator::new("ci");
        let first = allocator.assign(&InstanceId::from("aaaaaaaa-1111"));
        let second = allocator.assign(&InstanceId::from("aaaaaaaa-2222"));

        assert_eq!(first.as_str(), "ci-aaaaaaaa");
        assert_eq!(second.as_str(), "ci-aaaaaaaa2222");
    }

    #[rstest]
    fn assign_appends_index_when_identity_repeats() {
        let mut allocator = LabelAllocator::new("ci");
        let labels = (0..3)
            .map(|_| allocator.assign(&InstanceId::from("same")))
            .collect::<BTreeSet<_>>();

        assert_eq!(labels.len(), 3, "labels must stay unique: {labels:?}");
    }

    #[rstest]
    fn assign_handles_identity_without_alphanumerics() {
        let mut allocator = LabelAllocator::new("ci");
        let label = allocator.assign(&InstanceId::from("---"));
        assert!(label.as_str().starts_with("ci-instance-"), "got {label}");
    }
}
