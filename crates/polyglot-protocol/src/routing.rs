//! Kernel URIs and routing slips.
//!
//! A routing slip is the ordered, append-only provenance chain of kernel URIs
//! a command or event has traversed. Entries are kept as strings because a
//! command slip also records arrival markers (`kernel://host/name?tag=arrived`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

const SCHEME: &str = "kernel://";
const ARRIVED_TAG: &str = "arrived";

/// Address of a kernel: `kernel://<host-or-composite-name>/<kernel-name>`.
///
/// Parsing normalizes an empty path to `/` and drops any query, so a host
/// root is always `kernel://host/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelUri(String);

impl KernelUri {
    pub fn parse(raw: &str) -> KernelResult<Self> {
        let rest = raw
            .strip_prefix(SCHEME)
            .ok_or_else(|| KernelError::InvalidKernelUri(raw.to_owned()))?;
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, "/"),
        };
        if authority.is_empty() || authority.contains(char::is_whitespace) {
            return Err(KernelError::InvalidKernelUri(raw.to_owned()));
        }
        Ok(Self(format!("{SCHEME}{authority}{path}")))
    }

    /// Root URI of a host or composite named `name`.
    pub fn for_host(name: &str) -> KernelResult<Self> {
        Self::parse(&format!("{SCHEME}{name}/"))
    }

    /// `kernel://local/`, the default host root.
    pub fn local() -> Self {
        Self(format!("{SCHEME}local/"))
    }

    /// URI of a child kernel named `name` below this one.
    pub fn join(&self, name: &str) -> Self {
        Self(format!("{}/{name}", self.0.trim_end_matches('/')))
    }

    /// The `kernel://host/` root this URI lives under.
    pub fn host_root(&self) -> Self {
        Self(format!("{SCHEME}{}/", self.authority()))
    }

    pub fn authority(&self) -> &str {
        let rest = &self.0[SCHEME.len()..];
        rest.split('/').next().unwrap_or(rest)
    }

    pub fn path(&self) -> &str {
        let rest = &self.0[SCHEME.len()..];
        rest.find('/').map_or("/", |index| &rest[index..])
    }

    /// Whether both URIs live on the same host.
    pub fn same_host(&self, other: &KernelUri) -> bool {
        self.authority() == other.authority()
    }

    /// Routing-slip entry marking that a command arrived at this kernel.
    pub fn arrived_marker(&self) -> String {
        format!("{}?tag={ARRIVED_TAG}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for KernelUri {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KernelUri> for String {
    fn from(value: KernelUri) -> Self {
        value.0
    }
}

impl std::str::FromStr for KernelUri {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Ordered provenance chain for a command or an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingSlip {
    entries: Vec<String>,
}

impl RoutingSlip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `uri` to the slip.
    ///
    /// Returns `Ok(false)` when `uri` is already the last entry. Fails with
    /// [`KernelError::RoutingCycleDetected`] when the append would make the
    /// tail of the slip repeat the contiguous run immediately before it; the
    /// slip is left untouched in that case.
    pub fn stamp(&mut self, uri: impl AsRef<str>) -> KernelResult<bool> {
        let uri = uri.as_ref();
        if self.entries.last().map(String::as_str) == Some(uri) {
            return Ok(false);
        }
        if self.would_repeat_cycle(uri) {
            return Err(KernelError::RoutingCycleDetected {
                uri: uri.to_owned(),
                slip: self.entries.clone(),
            });
        }
        self.entries.push(uri.to_owned());
        Ok(true)
    }

    /// Record that a command reached the kernel at `uri`.
    pub fn stamp_as_arrived(&mut self, uri: &KernelUri) -> KernelResult<bool> {
        self.stamp(uri.arrived_marker())
    }

    fn would_repeat_cycle(&self, uri: &str) -> bool {
        let candidate: Vec<&str> = self
            .entries
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(uri))
            .collect();
        let len = candidate.len();
        (2..=len / 2).any(|run| candidate[len - run..] == candidate[len - 2 * run..len - run])
    }

    /// Append the entries of `other`, skipping the prefix both slips share.
    ///
    /// Either every entry is appended or, on a cycle, none is.
    pub fn continue_with(&mut self, other: &RoutingSlip) -> KernelResult<()> {
        let tail = if other.starts_with(self) {
            &other.entries[self.entries.len()..]
        } else {
            &other.entries[..]
        };
        let mut next = self.clone();
        for entry in tail {
            next.stamp(entry)?;
        }
        *self = next;
        Ok(())
    }

    /// Whether `uri` appears in the slip. With `ignore_query`, arrival markers
    /// count as occurrences of their kernel.
    pub fn contains(&self, uri: &str, ignore_query: bool) -> bool {
        self.entries.iter().any(|entry| {
            let entry = if ignore_query {
                entry.split('?').next().unwrap_or(entry)
            } else {
                entry
            };
            entry == uri
        })
    }

    pub fn starts_with(&self, prefix: &RoutingSlip) -> bool {
        self.entries.starts_with(&prefix.entries)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn last(&self) -> Option<&str> {
        self.entries.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<String>> for RoutingSlip {
    fn from(entries: Vec<String>) -> Self {
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slip(entries: &[&str]) -> RoutingSlip {
        RoutingSlip::from(entries.iter().map(|e| (*e).to_owned()).collect::<Vec<_>>())
    }

    #[test]
    fn uri_parse_normalizes_root_and_drops_query() {
        let root = KernelUri::parse("kernel://vscode").unwrap();
        assert_eq!(root.as_str(), "kernel://vscode/");
        let child = KernelUri::parse("kernel://vscode/csharp?tag=arrived").unwrap();
        assert_eq!(child.as_str(), "kernel://vscode/csharp");
        assert_eq!(child.authority(), "vscode");
        assert_eq!(child.path(), "/csharp");
        assert_eq!(child.host_root(), root);
        assert!(child.same_host(&root));
    }

    #[test]
    fn uri_parse_rejects_other_schemes() {
        let err = KernelUri::parse("http://vscode/csharp").expect_err("wrong scheme");
        assert!(matches!(err, KernelError::InvalidKernelUri(_)));
        assert!(KernelUri::parse("kernel:///csharp").is_err());
    }

    #[test]
    fn join_builds_child_uri() {
        let root = KernelUri::for_host("local").unwrap();
        assert_eq!(root.join("fsharp").as_str(), "kernel://local/fsharp");
        assert_eq!(
            root.join("fsharp").arrived_marker(),
            "kernel://local/fsharp?tag=arrived"
        );
    }

    #[test]
    fn uri_serializes_as_plain_string() {
        let uri = KernelUri::parse("kernel://a/b").unwrap();
        assert_eq!(serde_json::to_string(&uri).unwrap(), "\"kernel://a/b\"");
        let bad = serde_json::from_str::<KernelUri>("\"nope\"");
        assert!(bad.is_err());
    }

    #[test]
    fn consecutive_stamp_is_noop() {
        let mut slip = RoutingSlip::new();
        assert!(slip.stamp("kernel://a/").unwrap());
        assert!(!slip.stamp("kernel://a/").unwrap());
        assert_eq!(slip.len(), 1);
    }

    #[test]
    fn non_consecutive_repeat_is_allowed() {
        let mut slip = slip(&["kernel://a/", "kernel://b/"]);
        assert!(slip.stamp("kernel://a/").unwrap());
        assert_eq!(slip.entries(), ["kernel://a/", "kernel://b/", "kernel://a/"]);
    }

    #[test]
    fn repeating_a_contiguous_run_is_a_cycle() {
        let mut slip = slip(&["kernel://a/", "kernel://b/", "kernel://a/"]);
        let before = slip.clone();
        let err = slip.stamp("kernel://b/").expect_err("cycle");
        assert!(matches!(err, KernelError::RoutingCycleDetected { .. }));
        assert_eq!(slip, before);

        let mut longer = self::slip(&["x", "a", "b", "c", "a", "b"]);
        assert!(longer.stamp("c").is_err());
        assert!(longer.stamp("d").unwrap());
    }

    #[test]
    fn stamping_preserves_existing_order() {
        let mut slip = RoutingSlip::new();
        let uris = ["kernel://a/", "kernel://a/x", "kernel://b/", "kernel://a/"];
        for uri in uris {
            let before = slip.clone();
            slip.stamp(uri).unwrap();
            assert!(slip.starts_with(&before));
        }
        assert_eq!(slip.len(), 4);
    }

    #[test]
    fn contains_can_ignore_arrival_markers() {
        let uri = KernelUri::parse("kernel://a/x").unwrap();
        let mut slip = RoutingSlip::new();
        slip.stamp_as_arrived(&uri).unwrap();
        assert!(!slip.contains(uri.as_str(), false));
        assert!(slip.contains(uri.as_str(), true));
    }

    #[test]
    fn continue_with_skips_shared_prefix() {
        let mut local = slip(&["kernel://l/x?tag=arrived", "kernel://r/?tag=arrived"]);
        let remote = slip(&[
            "kernel://l/x?tag=arrived",
            "kernel://r/?tag=arrived",
            "kernel://r/x?tag=arrived",
            "kernel://r/x",
        ]);
        local.continue_with(&remote).unwrap();
        assert_eq!(local, remote);
    }

    #[test]
    fn continue_with_is_all_or_nothing() {
        let mut local = slip(&["a", "b"]);
        let before = local.clone();
        let other = slip(&["c", "a", "b", "c"]);
        assert!(local.continue_with(&other).is_err());
        assert_eq!(local, before);
    }

    #[test]
    fn slip_serializes_as_array() {
        let slip = slip(&["kernel://a/"]);
        assert_eq!(serde_json::to_string(&slip).unwrap(), r#"["kernel://a/"]"#);
    }
}
