//! Rekon core types: object identity, identity sets, annotations, paths.

#![forbid(unsafe_code)]

pub mod annotations;
pub mod pathexp;
pub mod unstructured;

use serde::{Deserialize, Serialize};

/// Separates the fields of a serialized identity. Allowable as a ConfigMap
/// data key, but not allowed inside a resource name.
const FIELD_SEPARATOR: char = '_';
/// RBAC resource names may contain `:`, which ConfigMap keys disallow.
/// Transcoded to a double underscore in the stored form.
const COLON_TRANSCODED: &str = "__";

pub const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

const RBAC_KINDS: [&str; 4] = ["Role", "ClusterRole", "RoleBinding", "ClusterRoleBinding"];

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty name for object")]
    EmptyName,
    #[error("empty kind for object")]
    EmptyKind,
    #[error("unable to parse stored object metadata: {0}")]
    Malformed(String),
    #[error("too many fields within: {0}")]
    ExtraFields(String),
}

/// The minimal identity of a cluster object: group, kind, namespace, name.
///
/// The version is deliberately excluded; the API server does not treat two
/// versions of the same kind as different resources, and identities are used
/// for pruning and teardown where that distinction would be harmful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjMeta {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjMeta {
    /// Build a validated identity. Namespace may be empty; name and kind not.
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ParseError> {
        let kind = kind.into();
        let name = name.into();
        if name.is_empty() {
            return Err(ParseError::EmptyName);
        }
        if kind.is_empty() {
            return Err(ParseError::EmptyKind);
        }
        Ok(Self { group: group.into(), kind, namespace: namespace.into(), name })
    }

    pub fn is_rbac(&self) -> bool {
        self.group == RBAC_GROUP && RBAC_KINDS.contains(&self.kind.as_str())
    }

    /// Parse the stored form, e.g. `test-namespace_test-name_apps_ReplicaSet`.
    ///
    /// The name field may contain a double underscore, which transcodes a
    /// colon in RBAC resource names. Parsing walks in from both ends because
    /// only the name may contain extra separators.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let first = s.find(FIELD_SEPARATOR).ok_or_else(|| ParseError::Malformed(s.to_string()))?;
        let namespace = &s[..first];
        let rest = &s[first + 1..];
        let last = rest.rfind(FIELD_SEPARATOR).ok_or_else(|| ParseError::Malformed(s.to_string()))?;
        let kind = &rest[last + 1..];
        let rest = &rest[..last];
        let mid = rest.rfind(FIELD_SEPARATOR).ok_or_else(|| ParseError::Malformed(s.to_string()))?;
        let group = &rest[mid + 1..];
        let name = rest[..mid].replace(COLON_TRANSCODED, ":");
        if name.contains(FIELD_SEPARATOR) {
            return Err(ParseError::ExtraFields(s.to_string()));
        }
        Self::new(group, kind, namespace, name)
    }
}

impl std::fmt::Display for ObjMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = if self.is_rbac() {
            self.name.replace(':', COLON_TRANSCODED)
        } else {
            self.name.clone()
        };
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.namespace,
            name,
            self.group,
            self.kind,
            sep = FIELD_SEPARATOR
        )
    }
}

impl std::str::FromStr for ObjMeta {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An ordered set of identities. Order is insertion order; equality and the
/// set operations ignore it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjMetaSet(Vec<ObjMeta>);

impl ObjMetaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &ObjMeta) -> bool {
        self.0.contains(id)
    }

    /// Append if not already present.
    pub fn insert(&mut self, id: ObjMeta) {
        if !self.0.contains(&id) {
            self.0.push(id);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ObjMeta> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ObjMeta] {
        &self.0
    }

    /// Elements of `self` that are not in `other` (A - B).
    pub fn diff(&self, other: &ObjMetaSet) -> ObjMetaSet {
        self.0.iter().filter(|id| !other.contains(id)).cloned().collect()
    }

    /// Elements present in both sets.
    pub fn intersect(&self, other: &ObjMetaSet) -> ObjMetaSet {
        self.0.iter().filter(|id| other.contains(id)).cloned().collect()
    }

    pub fn union(&self, other: &ObjMetaSet) -> ObjMetaSet {
        let mut out = self.clone();
        for id in other.iter() {
            out.insert(id.clone());
        }
        out
    }

    pub fn set_equals(&self, other: &ObjMetaSet) -> bool {
        self.len() == other.len() && self.0.iter().all(|id| other.contains(id))
    }

    /// Stable fingerprint of the membership: FNV-32a over the sorted
    /// serialized identities, rendered as lowercase hex.
    pub fn hash(&self) -> String {
        let mut keys: Vec<String> = self.0.iter().map(|id| id.to_string()).collect();
        keys.sort();
        let mut h: u32 = 0x811c_9dc5;
        for key in &keys {
            for b in key.as_bytes() {
                h ^= u32::from(*b);
                h = h.wrapping_mul(0x0100_0193);
            }
        }
        format!("{h:x}")
    }
}

impl PartialEq for ObjMetaSet {
    fn eq(&self, other: &Self) -> bool {
        self.set_equals(other)
    }
}

impl From<Vec<ObjMeta>> for ObjMetaSet {
    fn from(v: Vec<ObjMeta>) -> Self {
        let mut out = ObjMetaSet::new();
        for id in v {
            out.insert(id);
        }
        out
    }
}

impl FromIterator<ObjMeta> for ObjMetaSet {
    fn from_iter<T: IntoIterator<Item = ObjMeta>>(iter: T) -> Self {
        let mut out = ObjMetaSet::new();
        for id in iter {
            out.insert(id);
        }
        out
    }
}

impl IntoIterator for ObjMetaSet {
    type Item = ObjMeta;
    type IntoIter = std::vec::IntoIter<ObjMeta>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ObjMetaSet {
    type Item = &'a ObjMeta;
    type IntoIter = std::slice::Iter<'a, ObjMeta>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

pub mod prelude {
    pub use super::{ObjMeta, ObjMetaSet, ParseError};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(group: &str, kind: &str, ns: &str, name: &str) -> ObjMeta {
        ObjMeta::new(group, kind, ns, name).unwrap()
    }

    #[test]
    fn serialize_parse_round_trip() {
        let cases = vec![
            id("apps", "ReplicaSet", "test-namespace", "test-name"),
            id("", "ConfigMap", "default", "cm"),
            id("", "Namespace", "", "test-namespace"),
            id("stable.example.com", "CronTab", "ns", "cron-tab-01"),
        ];
        for want in cases {
            let s = want.to_string();
            let got = ObjMeta::parse(&s).unwrap();
            assert_eq!(got, want, "round trip through {s}");
        }
    }

    #[test]
    fn rbac_names_transcode_colons() {
        let want = id(RBAC_GROUP, "ClusterRole", "", "system:controller:resourcequota-controller");
        let s = want.to_string();
        assert!(s.contains("__"), "expected transcoded colon in {s}");
        assert!(!s.contains(':'), "serialized form must not contain a colon: {s}");
        let got = ObjMeta::parse(&s).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(ObjMeta::parse("not-enough-fields").is_err());
        assert!(ObjMeta::parse("ns_name").is_err());
        // name with a bare underscore left over after transcoding
        assert!(ObjMeta::parse("ns_a_b_c_apps_Deployment").is_err());
    }

    #[test]
    fn validation_rejects_empty_name_and_kind() {
        assert!(matches!(ObjMeta::new("", "Pod", "ns", ""), Err(ParseError::EmptyName)));
        assert!(matches!(ObjMeta::new("", "", "ns", "x"), Err(ParseError::EmptyKind)));
    }

    #[test]
    fn set_arithmetic() {
        let a: ObjMetaSet = vec![
            id("", "Pod", "ns", "a"),
            id("", "Pod", "ns", "b"),
            id("apps", "Deployment", "ns", "c"),
        ]
        .into();
        let b: ObjMetaSet = vec![id("", "Pod", "ns", "b")].into();

        let diff = a.diff(&b);
        assert_eq!(diff.len(), 2);
        assert!(!diff.contains(&id("", "Pod", "ns", "b")));

        let inter = a.intersect(&b);
        assert_eq!(inter.len(), 1);

        // diff(A,B) ∪ intersect(A,B) = A
        assert!(diff.union(&inter).set_equals(&a));

        let union = a.union(&b);
        assert!(union.set_equals(&a));
    }

    #[test]
    fn hash_ignores_order() {
        let a: ObjMetaSet = vec![id("", "Pod", "ns", "a"), id("", "Pod", "ns", "b")].into();
        let b: ObjMetaSet = vec![id("", "Pod", "ns", "b"), id("", "Pod", "ns", "a")].into();
        assert!(a.set_equals(&b));
        assert_eq!(a.hash(), b.hash());
        let c: ObjMetaSet = vec![id("", "Pod", "ns", "a")].into();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn insert_dedupes() {
        let mut s = ObjMetaSet::new();
        s.insert(id("", "Pod", "ns", "a"));
        s.insert(id("", "Pod", "ns", "a"));
        assert_eq!(s.len(), 1);
    }
}
