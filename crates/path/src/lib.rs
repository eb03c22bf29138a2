//! Kubernetes API path parsing and link resolution.
//!
//! Pure functions over the path grammar `/{prefix}/GROUP/VERSION/RESOURCE/NAME`
//! plus the in-memory [`ApiRegistry`] consulted for disambiguation. No I/O.
//!
//! The grammar is ambiguous for some segment counts (`GROUP` and `VERSION`
//! are both DNS labels), so [`parse`] falls back to a heuristic for those.
//! The decision table is load-bearing for link resolution downstream and is
//! kept exactly as-is, including the cases it gets wrong.

#![forbid(unsafe_code)]

use porthole_core::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parsed canonical form of a Kubernetes REST path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PathRef {
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl PathRef {
    /// `GROUP/VERSION`, or just `VERSION` for the core group.
    pub fn api_version_with_group(&self) -> String {
        join_nonempty(&[&self.api_group, &self.api_version])
    }

    /// Collection endpoint prefix: `prefix/group/version/resource`.
    pub fn api_base(&self) -> String {
        join_nonempty(&[
            &self.api_prefix,
            &self.api_group,
            &self.api_version,
            self.resource.as_deref().unwrap_or(""),
        ])
    }

    /// Rebuild input for [`build`], preserving namespace and name.
    pub fn link(&self) -> LinkRef {
        LinkRef {
            api_prefix: Some(self.api_prefix.clone()),
            api_version: self.api_version_with_group(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Input for [`build`]; `api_version` is the version-with-group form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkRef {
    pub api_prefix: Option<String>,
    pub api_version: String,
    pub resource: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// Reference to a Kubernetes object as found in owner/involved-object fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn join_nonempty(parts: &[&str]) -> String {
    parts.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join("/")
}

/// `v` followed by a digit, e.g. `v1`, `v1beta1`.
fn version_like(segment: &str) -> bool {
    let mut chars = segment.chars();
    chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// Parse a raw Kubernetes REST path into its canonical descriptor.
///
/// Splits at the first `namespaces` segment when present: everything before
/// it is group/version, everything after is `[namespace, resource, name?]`,
/// except that 0 or 1 trailing segments mean the resource itself is
/// `namespaces`. Without that segment, disambiguation follows the exact
/// precedence: 4 segments map to (group, version, resource, name), 2 to
/// (version, resource), 1 to (version) alone; any other count engages the
/// heuristic (leading `.`-bearing segment is a DNS group, else a `v<digit>`
/// second segment promotes the first two to (group, version)).
pub fn parse(raw: &str) -> GatewayResult<PathRef> {
    // Equivalent of resolving against an origin: keep the path component only.
    let path = raw.split(['?', '#']).next().unwrap_or("");
    let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };

    let mut segments = path.split('/');
    let _ = segments.next(); // leading empty segment
    let api_prefix = format!("/{}", segments.next().unwrap_or(""));
    let parts: Vec<&str> = segments.collect();

    let (left, right, namespaced) = match parts.iter().position(|s| *s == "namespaces") {
        Some(i) => (&parts[..i], &parts[i + 1..], true),
        None => (&parts[..], &[][..], false),
    };

    let api_group;
    let api_version;
    let mut resource = None;
    let mut namespace = None;
    let mut name = None;

    if namespaced {
        match right.len() {
            // The split swallowed the `namespaces` segment; 0 or 1 trailing
            // segments mean it was the resource itself, not a namespace scope.
            0 | 1 => {
                resource = Some("namespaces".to_string());
                name = right.first().map(|s| s.to_string());
            }
            _ => {
                namespace = Some(right[0].to_string());
                resource = Some(right[1].to_string());
                name = right.get(2).map(|s| s.to_string());
            }
        }
        api_version = left.last().map(|s| s.to_string()).unwrap_or_default();
        api_group = left[..left.len().saturating_sub(1)].join("/");
    } else {
        match left.len() {
            4 => {
                api_group = left[0].to_string();
                api_version = left[1].to_string();
                resource = Some(left[2].to_string());
                name = Some(left[3].to_string());
            }
            2 => {
                api_group = String::new();
                api_version = left[0].to_string();
                resource = Some(left[1].to_string());
            }
            1 => {
                api_group = String::new();
                api_version = left[0].to_string();
            }
            0 => return Err(GatewayError::MalformedPath(path)),
            _ => {
                // Ambiguous: GROUP and VERSION are both DNS labels, so there
                // is no well-defined split. Heuristic, preserved exactly:
                // a dotted first segment is a DNS-style group; a v<digit>
                // second segment makes the first two (group, version);
                // otherwise the first segment alone is the version.
                if left[0].contains('.') || version_like(left[1]) {
                    api_group = left[0].to_string();
                    api_version = left[1].to_string();
                    resource = Some(left[2..].join("/"));
                } else {
                    api_group = String::new();
                    api_version = left[0].to_string();
                    resource = Some(left[1].to_string());
                    name = left.get(2).map(|s| s.to_string());
                }
            }
        }
    }

    let parsed = PathRef { api_prefix, api_group, api_version, resource, namespace, name };
    if parsed.api_base() == "/" || parsed.api_base().is_empty() {
        return Err(GatewayError::MalformedPath(path));
    }
    Ok(parsed)
}

/// Strict inverse of [`parse`] for the unambiguous cases: joins
/// `[prefix, version-with-group, namespaces/<ns>, resource, name]`, dropping
/// empty segments. The prefix defaults to `/apis`.
pub fn build(link: &LinkRef) -> String {
    let api_prefix = link.api_prefix.as_deref().unwrap_or("/apis");
    let namespace = link
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .map(|ns| format!("namespaces/{ns}"))
        .unwrap_or_default();
    join_nonempty(&[
        api_prefix,
        &link.api_version,
        &namespace,
        link.resource.as_deref().unwrap_or(""),
        link.name.as_deref().unwrap_or(""),
    ])
}

/// English pluralization used when guessing a resource collection from a
/// kind: trailing `s` appends `es`, anything else appends `s`.
fn guess_resource(kind: &str) -> String {
    if kind.ends_with('s') {
        format!("{}es", kind.to_lowercase())
    } else {
        format!("{}s", kind.to_lowercase())
    }
}

/// Turn an object reference into a browsable link.
///
/// Resolution order favours exactness over the common case of version drift:
/// 1. registry match on `(kind, apiVersionWithGroup)`;
/// 2. pluralized guess tried against `/apis` then `/api`, accepted when the
///    guessed base is registered;
/// 3. registry match on kind alone (owner refs may carry stale versions);
/// 4. the unverified guess from step 2 with the default prefix.
pub fn resolve_link(
    reference: &ObjectRef,
    parent_namespace: Option<&str>,
    registry: &ApiRegistry,
) -> String {
    if reference.kind.is_empty() {
        return String::new();
    }
    let namespace = reference.namespace.as_deref().or(parent_namespace);

    if let Some(entry) = registry.find_by_kind_version(&reference.kind, &reference.api_version) {
        return entry.url_for(namespace, Some(&reference.name));
    }

    let resource = guess_resource(&reference.kind);
    for api_prefix in ["/apis", "/api"] {
        let link = build(&LinkRef {
            api_prefix: Some(api_prefix.to_string()),
            api_version: reference.api_version.clone(),
            resource: Some(resource.clone()),
            namespace: namespace.map(str::to_string),
            name: Some(reference.name.clone()),
        });
        if parse(&link).is_ok_and(|p| registry.get(&p.api_base()).is_some()) {
            return link;
        }
    }

    if let Some(entry) = registry.find_by_kind(&reference.kind) {
        return entry.url_for(namespace, Some(&reference.name));
    }

    // The resource may still exist upstream even though nothing registered it.
    build(&LinkRef {
        api_prefix: None,
        api_version: reference.api_version.clone(),
        resource: Some(resource),
        namespace: namespace.map(str::to_string),
        name: Some(reference.name.clone()),
    })
}

/// One resolved resource kind, keyed by its canonical base path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub canonical_base: String,
    pub kind: String,
    pub preferred_version: Option<String>,
    pub namespaced: bool,
}

impl RegistryEntry {
    /// Version-with-group, preferring the server's preferred version.
    pub fn api_version_with_group(&self) -> String {
        match parse(&self.canonical_base) {
            Ok(p) => {
                let version = self.preferred_version.as_deref().unwrap_or(&p.api_version);
                join_nonempty(&[&p.api_group, version])
            }
            Err(_) => String::new(),
        }
    }

    /// Object URL under this entry's base. The namespace is included only for
    /// namespaced kinds; guessed links elsewhere do not get that courtesy.
    pub fn url_for(&self, namespace: Option<&str>, name: Option<&str>) -> String {
        let base = match parse(&self.canonical_base) {
            Ok(p) => p,
            Err(_) => return self.canonical_base.clone(),
        };
        build(&LinkRef {
            api_prefix: Some(base.api_prefix),
            api_version: self.api_version_with_group(),
            resource: base.resource,
            namespace: if self.namespaced { namespace.map(str::to_string) } else { None },
            name: name.map(str::to_string),
        })
    }
}

/// In-memory map of known resource kinds, written once per distinct kind on
/// first resolution and read-mostly afterward. Insertion order is kept so
/// kind-only fallback lookups are deterministic.
#[derive(Debug, Default)]
pub struct ApiRegistry {
    entries: Vec<RegistryEntry>,
    by_base: HashMap<String, usize>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for its canonical base. Re-registration of
    /// the same base is expected to converge to the same value.
    pub fn register(&mut self, entry: RegistryEntry) {
        match self.by_base.get(&entry.canonical_base) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.by_base.insert(entry.canonical_base.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn get(&self, base: &str) -> Option<&RegistryEntry> {
        self.by_base.get(base).map(|&i| &self.entries[i])
    }

    pub fn find_by_kind_version(&self, kind: &str, version_with_group: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.api_version_with_group() == version_with_group)
    }

    pub fn find_by_kind(&self, kind: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
