//! Retained info documents
//!
//! The broker retains the last publication on the `__agentInfo__` and
//! `__classInfo__` topics, so late subscribers discover agent and class
//! state from these documents alone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent availability as carried in the retained status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// The agent is connected and serving
    Online,
    /// The agent ended, or its connection terminated abnormally
    Offline,
}

/// Retained document published under `{domain}/{agent}/__agentInfo__`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent availability
    pub status: AgentStatus,
    /// Host the agent runs on
    pub hostname: String,
    /// Embedder-supplied version string
    pub version: String,
}

/// Retained document published under `{domain}/{agent}/{class}/__classInfo__`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    /// Name of the described class
    pub class_name: String,
    /// Currently existing instance identifiers
    pub instances: Vec<String>,
    /// Remotely callable member functions
    pub member_functions: Vec<String>,
    /// Remotely callable static functions
    pub static_functions: Vec<String>,
    /// Optional per-method metadata
    pub meta: BTreeMap<String, MethodMeta>,
}

/// Introspection metadata for one method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodMeta {
    /// Human-readable method description
    pub description: String,
    /// Parameter names and types, in call order
    pub params: Vec<ParamMeta>,
    /// Return type description
    pub ret: String,
}

/// Name and type of one method parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamMeta {
    /// Parameter name
    pub name: String,
    /// Parameter type description
    #[serde(rename = "type")]
    pub param_type: String,
}

/// Presence message received on `{clientId}/__clientInfo__`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStatus {
    /// `"online"` or `"offline"`
    pub status: String,
}

impl ClientStatus {
    /// Whether the client reported itself gone.
    pub fn is_offline(&self) -> bool {
        self.status == "offline"
    }
}
