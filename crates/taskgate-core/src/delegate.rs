// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delegate registry: registration, liveness and scoping rules.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::capability::{DelegateFacts, ScopingRules};
use crate::context::RequestContext;
use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

/// A registered delegate.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateRecord {
    pub delegate_id: String,
    pub account_id: String,
    pub host_name: String,
    pub facts: DelegateFacts,
    pub scoping_rules: ScopingRules,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// What a delegate announces when it (re)connects.
#[derive(Debug, Clone, Default)]
pub struct DelegateRegistration {
    pub delegate_id: String,
    pub host_name: String,
    pub facts: DelegateFacts,
}

/// Rejects empty maps and keys without allowed values.
pub fn validate_scoping_rules(rules: &ScopingRules) -> Result<()> {
    if rules.is_empty() {
        return Err(CoreError::invalid(
            "scoping_rules",
            "at least one scoping rule is required",
        ));
    }
    for (key, values) in rules {
        if key.trim().is_empty() {
            return Err(CoreError::invalid("scoping_rules", "rule key must not be empty"));
        }
        if values.is_empty() || values.iter().any(|v| v.trim().is_empty()) {
            return Err(CoreError::invalid(
                "scoping_rules",
                format!("rule '{}' must list at least one non-empty value", key),
            ));
        }
    }
    Ok(())
}

/// Liveness cutoff for a heartbeat timeout.
pub(crate) fn liveness_cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct DelegateRegistry {
    persistence: Arc<dyn Persistence>,
    heartbeat_timeout: Duration,
}

impl DelegateRegistry {
    pub fn new(persistence: Arc<dyn Persistence>, heartbeat_timeout: Duration) -> Self {
        Self {
            persistence,
            heartbeat_timeout,
        }
    }

    /// Insert or refresh a delegate. Scoping rules survive re-registration.
    #[instrument(skip(self, ctx, registration), fields(delegate_id = %registration.delegate_id))]
    pub async fn register(
        &self,
        ctx: &RequestContext,
        registration: DelegateRegistration,
    ) -> Result<DelegateRecord> {
        if registration.delegate_id.trim().is_empty() {
            return Err(CoreError::invalid("delegate_id", "delegate id is required"));
        }

        let now = Utc::now();
        let record = DelegateRecord {
            delegate_id: registration.delegate_id,
            account_id: ctx.account_id().to_string(),
            host_name: registration.host_name,
            facts: registration.facts,
            scoping_rules: ScopingRules::new(),
            registered_at: now,
            last_heartbeat_at: now,
        };
        self.persistence.upsert_delegate(&record).await?;

        info!(
            account_id = %record.account_id,
            host_name = %record.host_name,
            tags = record.facts.tags.len(),
            "Delegate registered"
        );

        self.persistence
            .get_delegate(ctx.account_id(), &record.delegate_id)
            .await?
            .ok_or(CoreError::DelegateNotFound {
                delegate_id: record.delegate_id,
            })
    }

    /// Record a heartbeat. Returns false for unknown delegates.
    pub async fn heartbeat(&self, ctx: &RequestContext, delegate_id: &str) -> Result<bool> {
        let known = self
            .persistence
            .touch_delegate(ctx.account_id(), delegate_id, Utc::now())
            .await?;
        if !known {
            debug!(delegate_id, "Heartbeat from unregistered delegate");
        }
        Ok(known)
    }

    pub async fn get(&self, ctx: &RequestContext, delegate_id: &str) -> Result<DelegateRecord> {
        self.persistence
            .get_delegate(ctx.account_id(), delegate_id)
            .await?
            .ok_or_else(|| CoreError::DelegateNotFound {
                delegate_id: delegate_id.to_string(),
            })
    }

    /// Replace a delegate's scoping rules. Validated before any write.
    #[instrument(skip(self, ctx, rules))]
    pub async fn update_scoping_rules(
        &self,
        ctx: &RequestContext,
        delegate_id: &str,
        rules: ScopingRules,
    ) -> Result<()> {
        validate_scoping_rules(&rules)?;

        let updated = self
            .persistence
            .update_scoping_rules(ctx.account_id(), delegate_id, &rules)
            .await?;
        if !updated {
            return Err(CoreError::DelegateNotFound {
                delegate_id: delegate_id.to_string(),
            });
        }

        info!(rules = rules.len(), "Delegate scoping rules updated");
        Ok(())
    }

    /// Delegates of the account whose heartbeat is within the timeout.
    pub async fn live_delegates(&self, account_id: &str) -> Result<Vec<DelegateRecord>> {
        let cutoff = liveness_cutoff(Utc::now(), self.heartbeat_timeout);
        self.persistence.list_live_delegates(account_id, cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_scoping_rules_rejected() {
        let err = validate_scoping_rules(&ScopingRules::new()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_rule_without_values_rejected() {
        let mut rules = ScopingRules::new();
        rules.insert("envId".to_string(), vec![]);
        assert!(validate_scoping_rules(&rules).is_err());

        rules.insert("envId".to_string(), vec!["".to_string()]);
        assert!(validate_scoping_rules(&rules).is_err());

        rules.insert("envId".to_string(), vec!["prod".to_string()]);
        assert!(validate_scoping_rules(&rules).is_ok());
    }

    #[test]
    fn test_liveness_cutoff() {
        let now = Utc::now();
        let cutoff = liveness_cutoff(now, Duration::from_secs(90));
        assert_eq!(now - cutoff, chrono::Duration::seconds(90));
    }
}
