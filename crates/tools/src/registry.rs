use futures::FutureExt;
use nanocell_core::types::ToolDefinition;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{Tool, ToolContext};

/// Name-keyed set of tools. Execution never fails: every problem comes back
/// as text for the model to read on its next turn.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool` under its schema name, replacing any previous binding.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            debug!(name = %name, "Replacing registered tool");
        } else {
            debug!(name = %name, "Registering tool");
        }
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions of every registered tool, sorted by name.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.schema()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn execute(&self, name: &str, params: Value) -> String {
        self.execute_with_context(name, ToolContext::default(), params)
            .await
    }

    pub async fn execute_with_context(&self, name: &str, ctx: ToolContext, params: Value) -> String {
        let Some(tool) = self.get(name) else {
            warn!(tool = name, "Tool not found");
            return format!("Error: Tool '{}' not found", name);
        };

        if let Err(e) = tool.validate(&params) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return format!("Error executing {}: {}", name, e);
        }

        debug!(tool = name, "Executing tool");
        match AssertUnwindSafe(tool.execute(ctx, params)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "Tool execution failed");
                format!("Error executing {}: {}", name, e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(tool = name, panic = %message, "Tool panicked");
                format!("Error executing {}: {}", name, message)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}
