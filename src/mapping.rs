//! The instance to runner label mapping handed from `start` to `stop`.
//!
//! The mapping is the only state shared between the two invocations, so its
//! JSON form is a stable exchange format: an object whose keys are instance
//! identities and whose values are runner labels. Entry order is preserved
//! through a round trip.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::label::RunnerLabel;
use crate::provider::InstanceId;
use crate::script::{InputSourceError, resolve_text_input};

/// Errors raised while building, parsing, or locating a mapping.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum MappingError {
    /// Raised when an instance identity appears twice.
    #[error("instance `{0}` appears more than once in the mapping")]
    DuplicateInstance(InstanceId),
    /// Raised when a runner label appears twice.
    #[error("runner label `{0}` appears more than once in the mapping")]
    DuplicateLabel(RunnerLabel),
    /// Raised when an identity or label is blank.
    #[error("mapping entries must have a non-empty instance id and label")]
    BlankEntry,
    /// Raised when the JSON text is malformed.
    #[error("invalid instance mapping: {0}")]
    Parse(String),
    /// Raised when the mapping could not be serialised.
    #[error("failed to serialise instance mapping: {0}")]
    Serialise(String),
    /// Raised when neither an inline mapping nor a mapping file is given.
    #[error("an instance mapping is required (inline JSON or a file path)")]
    Missing,
    /// Raised when the mapping source could not be resolved.
    #[error(transparent)]
    Source(#[from] InputSourceError),
}

/// Ordered association of instance identities with runner labels.
///
/// Both identities and labels are unique within a mapping.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceLabelMapping {
    entries: Vec<(InstanceId, RunnerLabel)>,
}

impl InstanceLabelMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when the identity or label is blank or already
    /// present.
    pub fn insert(&mut self, instance_id: InstanceId, label: RunnerLabel) -> Result<(), MappingError> {
        if instance_id.as_str().trim().is_empty() || label.as_str().trim().is_empty() {
            return Err(MappingError::BlankEntry);
        }
        if self.entries.iter().any(|(id, _)| *id == instance_id) {
            return Err(MappingError::DuplicateInstance(instance_id));
        }
        if self.entries.iter().any(|(_, existing)| *existing == label) {
            return Err(MappingError::DuplicateLabel(label));
        }
        self.entries.push((instance_id, label));
        Ok(())
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the mapping holds no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&InstanceId, &RunnerLabel)> {
        self.entries.iter().map(|(id, label)| (id, label))
    }

    /// Instance identities in insertion order.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Runner labels in insertion order.
    #[must_use]
    pub fn labels(&self) -> Vec<RunnerLabel> {
        self.entries.iter().map(|(_, label)| label.clone()).collect()
    }

    /// Looks up the label assigned to `instance_id`.
    #[must_use]
    pub fn label_for(&self, instance_id: &InstanceId) -> Option<&RunnerLabel> {
        self.entries
            .iter()
            .find(|(id, _)| id == instance_id)
            .map(|(_, label)| label)
    }

    /// Serialises the mapping as a compact JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Serialise`] if JSON encoding fails.
    pub fn to_json(&self) -> Result<String, MappingError> {
        serde_json::to_string(self).map_err(|err| MappingError::Serialise(err.to_string()))
    }

    /// Parses a mapping from JSON.
    ///
    /// Accepts the object form written by [`Self::to_json`] as well as an
    /// array of `[instance id, label]` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when the text is malformed or an entry is
    /// blank or duplicated.
    pub fn from_json(text: &str) -> Result<Self, MappingError> {
        let raw: RawEntries =
            serde_json::from_str(text).map_err(|err| MappingError::Parse(err.to_string()))?;
        raw.0
            .into_iter()
            .try_fold(Self::new(), |mut mapping, (id, label)| {
                mapping.insert(InstanceId::new(id), RunnerLabel::new(label))?;
                Ok(mapping)
            })
    }
}

impl Serialize for InstanceLabelMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, label) in &self.entries {
            map.serialize_entry(id.as_str(), label.as_str())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for InstanceLabelMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEntries::deserialize(deserializer)?;
        raw.0
            .into_iter()
            .try_fold(Self::new(), |mut mapping, (id, label)| {
                mapping
                    .insert(InstanceId::new(id), RunnerLabel::new(label))
                    .map_err(de::Error::custom)?;
                Ok(mapping)
            })
    }
}

/// Entries as they appear on the wire, before uniqueness checks.
///
/// Duplicate object keys are kept so the caller can reject them rather than
/// silently keeping the last value.
struct RawEntries(Vec<(String, String)>);

impl<'de> Deserialize<'de> for RawEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RawEntriesVisitor)
    }
}

struct RawEntriesVisitor;

impl<'de> Visitor<'de> for RawEntriesVisitor {
    type Value = RawEntries;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an object of instance id to label, or a list of [id, label] pairs")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((id, label)) = access.next_entry::<String, String>()? {
            entries.push((id, label));
        }
        Ok(RawEntries(entries))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some(pair) = access.next_element::<(String, String)>()? {
            entries.push(pair);
        }
        Ok(RawEntries(entries))
    }
}

/// Resolves the mapping for `stop` from inline JSON or a file.
///
/// # Errors
///
/// Returns [`MappingError::Missing`] when neither source is set, and the
/// source or parse error otherwise.
pub fn resolve_mapping(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<InstanceLabelMapping, MappingError> {
    let text = resolve_text_input("instance mapping", inline, file)?.ok_or(MappingError::Missing)?;
    InstanceLabelMapping::from_json(&text)
}

/// Returns the labels of `mapping` unioned with `extra`, without duplicates.
#[must_use]
pub fn labels_with_extra(mapping: &InstanceLabelMapping, extra: &[RunnerLabel]) -> Vec<RunnerLabel> {
    let mut seen = BTreeSet::new();
    mapping
        .labels()
        .into_iter()
        .chain(extra.iter().cloned())
        .filter(|label| seen.insert(label.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn mapping_of(pairs: &[(&str, &str)]) -> InstanceLabelMapping {
        let mut mapping = InstanceLabelMapping::new();
        for (id, label) in pairs {
            mapping
                .insert(InstanceId::from(*id), RunnerLabel::from(*label))
                .expect("entries should be unique");
        }
        mapping
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(17)]
    fn json_round_trip_preserves_entries(#[case] size: usize) {
        let mut mapping = InstanceLabelMapping::new();
        for index in (0..size).rev() {
            mapping
                .insert(
                    InstanceId::new(format!("id-{index}")),
                    RunnerLabel::new(format!("runner-{index}")),
                )
                .expect("unique entries");
        }

        let text = mapping.to_json().expect("serialise");
        let parsed = InstanceLabelMapping::from_json(&text).expect("parse");
        assert_eq!(parsed, mapping);
    }

    #[rstest]
    fn serialises_as_object() {
        let mapping = mapping_of(&[("i-2", "runner-b"), ("i-1", "runner-a")]);
        assert_eq!(
            mapping.to_json().expect("serialise"),
            r#"{"i-2":"runner-b","i-1":"runner-a"}"#
        );
    }

    #[rstest]
    fn parses_pair_list() {
        let parsed = InstanceLabelMapping::from_json(r#"[["i-1","runner-a"],["i-2","runner-b"]]"#)
            .expect("pair list should parse");
        assert_eq!(parsed, mapping_of(&[("i-1", "runner-a"), ("i-2", "runner-b")]));
    }

    #[rstest]
    #[case(r#"{"i-1":"runner-a","i-1":"runner-b"}"#, MappingError::DuplicateInstance(InstanceId::from("i-1")))]
    #[case(r#"{"i-1":"runner-a","i-2":"runner-a"}"#, MappingError::DuplicateLabel(RunnerLabel::from("runner-a")))]
    #[case(r#"{"":"runner-a"}"#, MappingError::BlankEntry)]
    fn rejects_invalid_entries(#[case] text: &str, #[case] expected: MappingError) {
        let err = InstanceLabelMapping::from_json(text).expect_err("mapping should be rejected");
        assert_eq!(err, expected);
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"i-1": 3}"#)]
    #[case("42")]
    fn rejects_malformed_json(#[case] text: &str) {
        let err = InstanceLabelMapping::from_json(text).expect_err("malformed input");
        assert!(matches!(err, MappingError::Parse(_)), "unexpected error: {err:?}");
    }

    #[rstest]
    fn label_lookup_and_accessors() {
        let mapping = mapping_of(&[("i-1", "runner-a"), ("i-2", "runner-b")]);
        assert_eq!(mapping.len(), 2);
        assert_eq!(
            mapping.label_for(&InstanceId::from("i-2")),
            Some(&RunnerLabel::from("runner-b"))
        );
        assert_eq!(mapping.label_for(&InstanceId::from("i-3")), None);
        assert_eq!(
            mapping.instance_ids(),
            vec![InstanceId::from("i-1"), InstanceId::from("i-2")]
        );
    }

    #[rstest]
    fn resolve_requires_a_source() {
        assert_eq!(resolve_mapping(None, None), Err(MappingError::Missing));
    }

    #[rstest]
    fn resolve_reads_mapping_file() {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"i-1":"runner-a"}}"#).expect("write mapping");
        let path = file.path().to_string_lossy().into_owned();

        let mapping = resolve_mapping(None, Some(&path)).expect("file mapping");
        assert_eq!(mapping, mapping_of(&[("i-1", "runner-a")]));
    }

    #[rstest]
    fn extra_labels_are_unioned_once() {
        let mapping = mapping_of(&[("i-1", "runner-a")]);
        let labels = labels_with_extra(
            &mapping,
            &[RunnerLabel::from("runner-a"), RunnerLabel::from("manual")],
        );
        assert_eq!(
            labels,
            vec![RunnerLabel::from("runner-a"), RunnerLabel::from("manual")]
        );
    }
}
