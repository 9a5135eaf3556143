//! `ConnectionManager`: a read-only view onto the OAuth/credential store
//! (spec.md §1 names it out of scope). The engine consults it only to
//! classify `auth`/`permission` failures and to decide whether a workflow
//! can run at all — it never writes credentials itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Expired,
    Revoked,
}

/// A `(service, account)` pair and its current auth status — the
/// supplemental entity SPEC_FULL.md adds to resolve `ErrorKind::Auth`
/// classification without modeling the credential store itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub service: String,
    pub account: String,
    pub status: ConnectionStatus,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn status(&self, service: &str, account: &str) -> Result<Connection, StoreError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    #[derive(Default)]
    pub struct StaticConnectionManager {
        statuses: RwLock<HashMap<(String, String), ConnectionStatus>>,
    }

    impl StaticConnectionManager {
        pub fn set(&self, service: &str, account: &str, status: ConnectionStatus) {
            self.statuses
                .write()
                .unwrap()
                .insert((service.to_string(), account.to_string()), status);
        }
    }

    #[async_trait]
    impl ConnectionManager for StaticConnectionManager {
        async fn status(&self, service: &str, account: &str) -> Result<Connection, StoreError> {
            let status = self
                .statuses
                .read()
                .unwrap()
                .get(&(service.to_string(), account.to_string()))
                .copied()
                .unwrap_or(ConnectionStatus::Active);
            Ok(Connection {
                service: service.to_string(),
                account: account.to_string(),
                status,
                checked_at: Utc::now(),
            })
        }
    }
}
