//! `Tool`: a concrete external API (Gmail, Drive, a billing provider, ...).
//!
//! Every tool call a handler makes is phase-gated (`crate::handler::gate`)
//! and, for mutations, ledgered (`crate::ledger`) before it ever reaches
//! one of these. The concrete tools themselves — real HTTP clients against
//! real services — are out of scope (spec.md §1); this is the seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;

/// One external API surface, addressed as `(namespace, method)`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The namespace this tool answers to, e.g. `"email"`, `"drive"`.
    fn namespace(&self) -> &str;

    /// Non-mutating call (tool-gate capability `read`).
    async fn read(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, EngineError>;

    /// Mutating call (tool-gate capability `mutate`). Called at most once
    /// per consumer run, with the mutation already ledgered as `in_flight`
    /// by the caller (spec.md §4.3).
    async fn mutate(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, EngineError>;
}

/// Namespace -> tool lookup, the handler driver's view of "what's callable".
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.namespace().to_string(), tool);
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(namespace).cloned()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;

    pub struct EchoTool {
        pub namespace: String,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn namespace(&self) -> &str {
            &self.namespace
        }

        async fn read(
            &self,
            _method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, EngineError> {
            Ok(params)
        }

        async fn mutate(
            &self,
            _method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, EngineError> {
            Ok(params)
        }
    }
}
