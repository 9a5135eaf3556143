//! `HandlerState`: small durable scratch between runs of one handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerState {
    pub workflow_id: Uuid,
    pub handler_name: String,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl HandlerState {
    pub fn new(workflow_id: Uuid, handler_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            workflow_id,
            handler_name: handler_name.into(),
            data,
            updated_at: Utc::now(),
        }
    }

    /// Last-writer-wins merge on `updated_at`.
    pub fn merge(&mut self, incoming: HandlerState) {
        if incoming.updated_at >= self.updated_at {
            self.data = incoming.data;
            self.updated_at = incoming.updated_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins_on_updated_at() {
        let wf = Uuid::now_v7();
        let mut a = HandlerState::new(wf, "h", serde_json::json!({"v": 1}));
        a.updated_at = Utc::now() - chrono::Duration::seconds(10);

        let b = HandlerState::new(wf, "h", serde_json::json!({"v": 2}));
        a.merge(b.clone());
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn stale_merge_is_ignored() {
        let wf = Uuid::now_v7();
        let mut a = HandlerState::new(wf, "h", serde_json::json!({"v": 1}));
        let mut stale = HandlerState::new(wf, "h", serde_json::json!({"v": 0}));
        stale.updated_at = a.updated_at - chrono::Duration::seconds(10);

        a.merge(stale);
        assert_eq!(a.data, serde_json::json!({"v": 1}));
    }
}
