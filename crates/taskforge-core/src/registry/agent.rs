//! The `Agent` trait -- the execution interface for `agent:<type>` tasks
//! and subtasks (spec §4.4 "Execution contract").
//!
//! Modeled directly on the teacher's `Harness` trait: object-safe,
//! `async_trait`, one execution entry point.

use anyhow::Result;
use async_trait::async_trait;

/// Usage and cost reported by a single agent invocation (spec §3.1).
#[derive(Debug, Clone, Default)]
pub struct AgentUsage {
    pub model_used: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost: rust_decimal::Decimal,
}

/// Output of a single agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub output: serde_json::Value,
    pub usage: AgentUsage,
}

/// Adapter interface for a concrete agent implementation. Concrete bodies
/// (LLM clients, prompt construction) are out of scope (spec §1); this
/// crate only defines the seam `TaskMachine` dispatches through.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable name this agent is registered under (e.g. "research").
    fn name(&self) -> &str;

    /// Run the agent once against `input`, returning its output and usage.
    async fn run(&self, input: &serde_json::Value) -> Result<AgentOutput>;
}

// Compile-time assertion: Agent must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, input: &serde_json::Value) -> Result<AgentOutput> {
            Ok(AgentOutput {
                output: input.clone(),
                usage: AgentUsage {
                    model_used: Some("test-model".to_string()),
                    input_tokens: Some(10),
                    output_tokens: Some(5),
                    cost: rust_decimal::Decimal::new(1, 2),
                },
            })
        }
    }

    #[tokio::test]
    async fn echo_agent_round_trips_input() {
        let agent: Box<dyn Agent> = Box::new(EchoAgent);
        let input = serde_json::json!({"topic": "solar panels"});
        let result = agent.run(&input).await.unwrap();
        assert_eq!(result.output, input);
        assert_eq!(result.usage.input_tokens, Some(10));
    }
}
