// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability requirements and the matcher that turns them into an
//! eligibility set.
//!
//! A task declares what it needs; a delegate advertises [`DelegateFacts`].
//! A delegate is eligible when every requirement evaluates to `true` against
//! its facts and its scoping rules admit the task's setup abstractions.
//! Requirements that cannot be evaluated (malformed data) count as
//! unsatisfied for that delegate.
//!
//! New capability kinds are a new [`Capability`] variant plus an arm in
//! [`Capability::evaluate`]; the dispatcher never inspects variants.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::delegate::DelegateRecord;

/// Selector origin recorded for selectors supplied directly on a task.
pub const TASK_SELECTOR_ORIGIN: &str = "task_selectors";

/// A precondition a delegate must satisfy to run a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    /// The delegate can reach the host of `url`.
    HttpCheck {
        /// Target URL, `scheme://host[:port][/path]`.
        url: String,
    },
    /// The delegate has environment variable `name`, optionally with `value`.
    EnvVarCheck {
        /// Variable name.
        name: String,
        /// Required value, any value when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// A system property of the delegate equals `expected`.
    SystemEnvCheck {
        /// Property name, e.g. `os.name`.
        property: String,
        /// Required value.
        expected: String,
    },
    /// The delegate advertises every tag in `selectors`.
    SelectorMatch {
        /// Required tags.
        selectors: BTreeSet<String>,
        /// Where the selectors came from.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
    /// The delegate can open a TCP socket to `host:port`.
    SocketCheck {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
}

/// Why a capability could not be validated or evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// A required field is empty.
    #[error("{kind} capability requires a non-empty {field}")]
    EmptyField {
        /// Capability kind.
        kind: &'static str,
        /// Missing field.
        field: &'static str,
    },

    /// URL could not be parsed into a host.
    #[error("malformed url '{0}'")]
    MalformedUrl(String),

    /// Serialized capability could not be decoded.
    #[error("undecodable capability payload: {0}")]
    Undecodable(String),
}

impl Capability {
    /// Build a selector requirement from task selector tags.
    pub fn selectors<I, S>(selectors: I, origin: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::SelectorMatch {
            selectors: selectors.into_iter().map(Into::into).collect(),
            origin: origin.map(str::to_string),
        }
    }

    /// Stable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HttpCheck { .. } => "http_check",
            Self::EnvVarCheck { .. } => "env_var_check",
            Self::SystemEnvCheck { .. } => "system_env_check",
            Self::SelectorMatch { .. } => "selector_match",
            Self::SocketCheck { .. } => "socket_check",
        }
    }

    /// Structural checks applied at submission time.
    pub fn validate(&self) -> Result<(), CapabilityError> {
        let kind = self.kind();
        let empty = |field| Err(CapabilityError::EmptyField { kind, field });
        match self {
            Self::HttpCheck { url } if url.trim().is_empty() => empty("url"),
            Self::EnvVarCheck { name, .. } if name.trim().is_empty() => empty("name"),
            Self::SystemEnvCheck { property, .. } if property.trim().is_empty() => {
                empty("property")
            }
            Self::SelectorMatch { selectors, .. }
                if selectors.is_empty() || selectors.iter().any(|s| s.trim().is_empty()) =>
            {
                empty("selectors")
            }
            Self::SocketCheck { host, .. } if host.trim().is_empty() => empty("host"),
            Self::SocketCheck { port: 0, .. } => empty("port"),
            _ => Ok(()),
        }
    }

    /// Evaluate against a delegate's advertised facts.
    pub fn evaluate(&self, facts: &DelegateFacts) -> Result<bool, CapabilityError> {
        match self {
            Self::HttpCheck { url } => {
                let host = host_of(url)?;
                Ok(facts
                    .reachable_hosts
                    .iter()
                    .any(|pattern| host_matches(pattern, &host)))
            }
            Self::EnvVarCheck { name, value } => Ok(match (facts.env.get(name), value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            }),
            Self::SystemEnvCheck { property, expected } => Ok(facts
                .system_properties
                .get(property)
                .is_some_and(|actual| actual.eq_ignore_ascii_case(expected))),
            Self::SelectorMatch { selectors, .. } => {
                Ok(selectors.iter().all(|s| facts.tags.contains(s)))
            }
            Self::SocketCheck { host, port } => {
                let host = host.to_ascii_lowercase();
                Ok(facts.reachable_sockets.iter().any(|entry| {
                    entry == "*"
                        || match entry.rsplit_once(':') {
                            Some((h, p)) => {
                                host_matches(h, &host) && (p == "*" || p == port.to_string())
                            }
                            None => false,
                        }
                }))
            }
        }
    }

    /// Decode the wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CapabilityError> {
        serde_json::from_slice(bytes).map_err(|e| CapabilityError::Undecodable(e.to_string()))
    }

    /// Encode the wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Enum of plain strings and sets; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

fn host_of(url: &str) -> Result<String, CapabilityError> {
    let malformed = || CapabilityError::MalformedUrl(url.to_string());
    let (_, rest) = url.split_once("://").ok_or_else(malformed)?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();
    let host = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split(']').next().unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };
    if host.is_empty() {
        return Err(malformed());
    }
    Ok(host.to_ascii_lowercase())
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{}", suffix)),
        None => pattern == host,
    }
}

/// Runtime facts a delegate advertises when it registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateFacts {
    /// Selector tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// System properties (os, arch, runtime versions).
    #[serde(default)]
    pub system_properties: BTreeMap<String, String>,
    /// Host patterns reachable over HTTP.
    #[serde(default)]
    pub reachable_hosts: Vec<String>,
    /// `host:port` patterns reachable over TCP.
    #[serde(default)]
    pub reachable_sockets: Vec<String>,
}

/// Delegate scoping rules: setup-abstraction key to allowed values.
pub type ScopingRules = BTreeMap<String, Vec<String>>;

/// Whether `rules` admit a task with `setup_abstractions`.
///
/// Every rule key must be present on the task with one of the allowed values.
/// No rules admit everything.
pub fn scoping_allows(rules: &ScopingRules, setup_abstractions: &BTreeMap<String, String>) -> bool {
    rules.iter().all(|(key, allowed)| {
        setup_abstractions
            .get(key)
            .is_some_and(|value| allowed.iter().any(|a| a == value))
    })
}

/// Computes delegate eligibility for a set of requirements.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityMatcher;

impl CapabilityMatcher {
    /// Whether `delegate` may execute a task with these requirements.
    pub fn is_eligible(
        &self,
        requirements: &[Capability],
        setup_abstractions: &BTreeMap<String, String>,
        delegate: &DelegateRecord,
    ) -> bool {
        if !scoping_allows(&delegate.scoping_rules, setup_abstractions) {
            return false;
        }
        requirements.iter().all(|capability| {
            match capability.evaluate(&delegate.facts) {
                Ok(satisfied) => satisfied,
                Err(e) => {
                    debug!(
                        delegate_id = %delegate.delegate_id,
                        capability = capability.kind(),
                        error = %e,
                        "Capability evaluation failed, treating as unsatisfied"
                    );
                    false
                }
            }
        })
    }

    /// The eligible subset of `delegates`, in input order.
    pub fn eligible_delegates<'a>(
        &self,
        requirements: &[Capability],
        setup_abstractions: &BTreeMap<String, String>,
        delegates: &'a [DelegateRecord],
    ) -> Vec<&'a DelegateRecord> {
        delegates
            .iter()
            .filter(|d| self.is_eligible(requirements, setup_abstractions, d))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn delegate(id: &str, facts: DelegateFacts) -> DelegateRecord {
        let now = Utc::now();
        DelegateRecord {
            delegate_id: id.to_string(),
            account_id: "acct".to_string(),
            host_name: format!("{id}.internal"),
            facts,
            scoping_rules: ScopingRules::new(),
            registered_at: now,
            last_heartbeat_at: now,
        }
    }

    fn facts_with_tags(tags: &[&str]) -> DelegateFacts {
        DelegateFacts {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_http_check_host_patterns() {
        let facts = DelegateFacts {
            reachable_hosts: vec!["*.example.com".to_string(), "git.corp".to_string()],
            ..Default::default()
        };
        let check = |url: &str| {
            Capability::HttpCheck {
                url: url.to_string(),
            }
            .evaluate(&facts)
        };

        assert_eq!(check("https://api.example.com/v1"), Ok(true));
        assert_eq!(check("https://user:pw@GIT.corp:8443/repo"), Ok(true));
        assert_eq!(check("https://example.com"), Ok(false));
        assert_eq!(check("https://other.org"), Ok(false));
        assert!(matches!(
            check("not a url"),
            Err(CapabilityError::MalformedUrl(_))
        ));
    }

    #[test]
    fn test_wildcard_host_reaches_everything() {
        let facts = DelegateFacts {
            reachable_hosts: vec!["*".to_string()],
            ..Default::default()
        };
        let cap = Capability::HttpCheck {
            url: "http://[::1]:8080/health".to_string(),
        };
        assert_eq!(cap.evaluate(&facts), Ok(true));
    }

    #[test]
    fn test_env_var_check() {
        let mut facts = DelegateFacts::default();
        facts.env.insert("KUBECONFIG".to_string(), "/etc/kube".to_string());

        let any = Capability::EnvVarCheck {
            name: "KUBECONFIG".to_string(),
            value: None,
        };
        let exact = Capability::EnvVarCheck {
            name: "KUBECONFIG".to_string(),
            value: Some("/other".to_string()),
        };
        let missing = Capability::EnvVarCheck {
            name: "AWS_REGION".to_string(),
            value: None,
        };
        assert_eq!(any.evaluate(&facts), Ok(true));
        assert_eq!(exact.evaluate(&facts), Ok(false));
        assert_eq!(missing.evaluate(&facts), Ok(false));
    }

    #[test]
    fn test_socket_check() {
        let facts = DelegateFacts {
            reachable_sockets: vec!["db.internal:5432".to_string(), "*.cache:*".to_string()],
            ..Default::default()
        };
        let socket = |host: &str, port| Capability::SocketCheck {
            host: host.to_string(),
            port,
        };
        assert_eq!(socket("db.internal", 5432).evaluate(&facts), Ok(true));
        assert_eq!(socket("db.internal", 3306).evaluate(&facts), Ok(false));
        assert_eq!(socket("redis.cache", 6379).evaluate(&facts), Ok(true));
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let empty_selectors = Capability::SelectorMatch {
            selectors: BTreeSet::new(),
            origin: None,
        };
        assert_eq!(
            empty_selectors.validate(),
            Err(CapabilityError::EmptyField {
                kind: "selector_match",
                field: "selectors"
            })
        );
        assert!(
            Capability::HttpCheck { url: " ".to_string() }
                .validate()
                .is_err()
        );
        assert!(
            Capability::SocketCheck {
                host: "h".to_string(),
                port: 0
            }
            .validate()
            .is_err()
        );
        assert!(Capability::selectors(["gpu"], None).validate().is_ok());
    }

    #[test]
    fn test_wire_encoding() {
        let cap = Capability::SystemEnvCheck {
            property: "os.name".to_string(),
            expected: "linux".to_string(),
        };
        let bytes = cap.to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("\"kind\":\"system_env_check\""));
        assert_eq!(Capability::from_bytes(&bytes), Ok(cap));
        assert!(matches!(
            Capability::from_bytes(b"{\"kind\":\"teleport\"}"),
            Err(CapabilityError::Undecodable(_))
        ));
    }

    #[test]
    fn test_no_requirements_means_every_delegate() {
        let delegates = vec![
            delegate("d1", DelegateFacts::default()),
            delegate("d2", facts_with_tags(&["linux"])),
        ];
        let eligible = CapabilityMatcher.eligible_delegates(&[], &BTreeMap::new(), &delegates);
        assert_eq!(eligible.len(), 2);
    }

    #[test]
    fn test_all_requirements_must_hold() {
        let mut gpu = facts_with_tags(&["gpu", "linux"]);
        gpu.env.insert("CUDA_HOME".to_string(), "/opt/cuda".to_string());
        let delegates = vec![
            delegate("d1", facts_with_tags(&["linux"])),
            delegate("d2", gpu),
        ];
        let requirements = vec![
            Capability::selectors(["gpu", "linux"], Some(TASK_SELECTOR_ORIGIN)),
            Capability::EnvVarCheck {
                name: "CUDA_HOME".to_string(),
                value: None,
            },
        ];

        let eligible =
            CapabilityMatcher.eligible_delegates(&requirements, &BTreeMap::new(), &delegates);
        let ids: Vec<_> = eligible.iter().map(|d| d.delegate_id.as_str()).collect();
        assert_eq!(ids, vec!["d2"]);
    }

    #[test]
    fn test_malformed_capability_fails_closed() {
        let delegates = vec![delegate(
            "d1",
            DelegateFacts {
                reachable_hosts: vec!["*".to_string()],
                ..Default::default()
            },
        )];
        let requirements = vec![Capability::HttpCheck {
            url: "://".to_string(),
        }];
        assert!(
            CapabilityMatcher
                .eligible_delegates(&requirements, &BTreeMap::new(), &delegates)
                .is_empty()
        );
    }

    #[test]
    fn test_scoping_rules() {
        let mut scoped = delegate("d1", DelegateFacts::default());
        scoped
            .scoping_rules
            .insert("envId".to_string(), vec!["prod".to_string()]);

        let mut setup = BTreeMap::new();
        assert!(!CapabilityMatcher.is_eligible(&[], &setup, &scoped));

        setup.insert("envId".to_string(), "qa".to_string());
        assert!(!CapabilityMatcher.is_eligible(&[], &setup, &scoped));

        setup.insert("envId".to_string(), "prod".to_string());
        assert!(CapabilityMatcher.is_eligible(&[], &setup, &scoped));
    }
}
