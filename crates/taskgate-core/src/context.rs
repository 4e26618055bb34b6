// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request-scoped context passed explicitly to every engine operation.

use taskgate_protocol::delegate_proto::AccountId;

use crate::error::{CoreError, Result};

/// Identity a request executes under. Every store access is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    account_id: String,
}

impl RequestContext {
    /// Build a context for `account_id`. Blank ids are rejected.
    pub fn new(account_id: impl Into<String>) -> Result<Self> {
        let account_id = account_id.into();
        if account_id.trim().is_empty() {
            return Err(CoreError::invalid("account_id", "account id is required"));
        }
        Ok(Self { account_id })
    }

    /// Build a context from the wire scoping envelope.
    pub fn from_envelope(envelope: Option<&AccountId>) -> Result<Self> {
        match envelope {
            Some(account) => Self::new(account.id.clone()),
            None => Err(CoreError::invalid("account_id", "account id is required")),
        }
    }

    /// The account this request is scoped to.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}
