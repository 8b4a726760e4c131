use async_trait::async_trait;
use nanocell_core::types::ToolDefinition;
use nanocell_core::{Error, Result};
use serde_json::{json, Value};

use crate::{required_str, Tool, ToolContext};

pub struct SpawnTool;

#[async_trait]
impl Tool for SpawnTool {
    fn schema(&self) -> ToolDefinition {
        ToolDefinition {
            name: "spawn".to_string(),
            description: "Spawn a subagent to handle a task in the background. \
                Use this for long-running or independent work; you will be told the result when it finishes. \
                Do not use it for things you can answer directly."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "The task for the subagent to complete"
                    },
                    "label": {
                        "type": "string",
                        "description": "Optional short label for the task"
                    }
                },
                "required": ["task"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        required_str(params, "task").map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<String> {
        let spawn_handle = ctx.spawn_handle.as_ref().ok_or_else(|| {
            Error::Tool("No spawn handle available. Subagent spawning is not configured.".to_string())
        })?;

        let task = required_str(&params, "task")?;
        let label = params
            .get("label")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        spawn_handle.spawn(task, label, &ctx.channel, &ctx.chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpawnHandle;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSpawner {
        calls: Mutex<Vec<(String, Option<String>, String, String)>>,
    }

    impl SpawnHandle for RecordingSpawner {
        fn spawn(&self, task: &str, label: Option<&str>, channel: &str, chat_id: &str) -> Result<String> {
            self.calls.lock().unwrap().push((
                task.to_string(),
                label.map(str::to_string),
                channel.to_string(),
                chat_id.to_string(),
            ));
            Ok("started".to_string())
        }
    }

    #[test]
    fn test_spawn_validate() {
        let tool = SpawnTool;
        assert_eq!(tool.schema().name, "spawn");
        assert!(tool.validate(&json!({"task": "do something"})).is_ok());
        assert!(tool.validate(&json!({"task": ""})).is_err());
        assert!(tool.validate(&json!({"label": "x"})).is_err());
    }

    #[tokio::test]
    async fn test_spawn_passes_origin() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut ctx = ToolContext::new("telegram", "42");
        ctx.spawn_handle = Some(spawner.clone());

        let out = SpawnTool
            .execute(ctx, json!({"task": "research rust", "label": "research"}))
            .await
            .unwrap();
        assert_eq!(out, "started");

        let calls = spawner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            (
                "research rust".to_string(),
                Some("research".to_string()),
                "telegram".to_string(),
                "42".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_spawn_without_handle_fails() {
        let result = SpawnTool.execute(ToolContext::default(), json!({"task": "x"})).await;
        assert!(result.is_err());
    }
}
