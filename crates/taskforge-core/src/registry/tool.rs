//! The `Tool` trait -- the execution interface for `tool:<name>` tasks
//! (spec §4.4 "Execution contract"). Same shape as [`super::agent::Agent`]
//! minus usage accounting, since tool invocations are not charged against
//! an LLM usage budget.

use anyhow::Result;
use async_trait::async_trait;

/// Adapter interface for a concrete tool implementation (search,
/// calculator, ...). Concrete bodies are out of scope (spec §1).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &serde_json::Value) -> Result<serde_json::Value>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Tool) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTool;

    #[async_trait]
    impl Tool for NoopTool {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&self, _input: &serde_json::Value) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    #[tokio::test]
    async fn noop_tool_is_object_safe() {
        let tool: Box<dyn Tool> = Box::new(NoopTool);
        let result = tool.run(&serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!({}));
    }
}
