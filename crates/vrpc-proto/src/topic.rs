//! Broker topic scheme
//!
//! Topics encode the dispatch target as
//! `{domain}/{agent}/{class}/{instance}/{method}`, with the reserved segment
//! `__static__` in instance position for static calls. Retained metadata
//! lives under `__agentInfo__` and `__classInfo__`; client presence under
//! `{clientId}/__clientInfo__`.

use crate::ProtocolError;

/// Reserved topic leaf for the retained agent status document
pub const AGENT_INFO: &str = "__agentInfo__";

/// Reserved topic leaf for the retained per-class metadata document
pub const CLASS_INFO: &str = "__classInfo__";

/// Reserved topic leaf for client presence messages
pub const CLIENT_INFO: &str = "__clientInfo__";

/// Reserved instance segment marking a static dispatch topic
pub const STATIC_SEGMENT: &str = "__static__";

/// Characters that must not appear in domain or agent names
const FORBIDDEN: [char; 4] = ['+', '/', '#', '*'];

/// Validate a domain or agent name.
///
/// Names become topic segments, so they must be non-empty and free of the
/// wildcard and separator characters `+ / # *`.
pub fn validate_segment(segment: &str) -> Result<(), ProtocolError> {
    if segment.is_empty() {
        return Err(ProtocolError::InvalidSegment("must not be empty".to_string()));
    }
    if segment.contains(&FORBIDDEN[..]) {
        return Err(ProtocolError::InvalidSegment(format!(
            "\"{}\" must not contain any of '+', '/', '#', '*'",
            segment
        )));
    }
    Ok(())
}

/// Topic of the retained agent status document.
pub fn agent_info(domain: &str, agent: &str) -> String {
    format!("{}/{}/{}", domain, agent, AGENT_INFO)
}

/// Topic of the retained metadata document for a class.
pub fn class_info(domain: &str, agent: &str, class: &str) -> String {
    format!("{}/{}/{}/{}", domain, agent, class, CLASS_INFO)
}

/// Dispatch topic for a static function of a class.
pub fn static_dispatch(domain: &str, agent: &str, class: &str, method: &str) -> String {
    format!("{}/{}/{}/{}/{}", domain, agent, class, STATIC_SEGMENT, method)
}

/// Wildcard subscription covering every method of one instance.
pub fn instance_wildcard(domain: &str, agent: &str, class: &str, instance: &str) -> String {
    format!("{}/{}/{}/{}/+", domain, agent, class, instance)
}

/// Presence topic of a client.
pub fn client_info(client_id: &str) -> String {
    format!("{}/{}", client_id, CLIENT_INFO)
}

/// Extract the client id a presence topic belongs to.
///
/// Client ids are exactly three segments, so a dispatch topic whose method
/// segment happens to collide does not parse as a presence topic.
pub fn client_id_from_info_topic(topic: &str) -> Option<&str> {
    let client_id = topic.strip_suffix(CLIENT_INFO)?.strip_suffix('/')?;
    let segments: Vec<&str> = client_id.split('/').collect();
    if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(client_id)
}

/// Derive the client id from a reply topic.
///
/// Reply topics start with the three segments identifying the client; the
/// remainder is private routing detail.
pub fn client_id_from_sender(sender: &str) -> Option<String> {
    let segments: Vec<&str> = sender.split('/').collect();
    if segments.len() < 3 || segments[..3].iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments[..3].join("/"))
}

/// A parsed dispatch topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTopic {
    /// Broker-enforced namespace
    pub domain: String,
    /// Agent the call targets
    pub agent: String,
    /// Class segment
    pub class: String,
    /// Instance segment; `None` for static dispatch
    pub instance: Option<String>,
    /// Method segment
    pub method: String,
}

impl DispatchTopic {
    /// Parse a five-segment dispatch topic.
    ///
    /// Returns `None` for topics outside the dispatch scheme (retained
    /// metadata topics, presence topics, malformed input).
    pub fn parse(topic: &str) -> Option<Self> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() != 5 || segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        let [domain, agent, class, instance, method] =
            [segments[0], segments[1], segments[2], segments[3], segments[4]];
        if method == CLASS_INFO || method == AGENT_INFO || method == CLIENT_INFO {
            return None;
        }
        Some(Self {
            domain: domain.to_string(),
            agent: agent.to_string(),
            class: class.to_string(),
            instance: (instance != STATIC_SEGMENT).then(|| instance.to_string()),
            method: method.to_string(),
        })
    }

    /// The call context this topic resolves to: the instance id for member
    /// calls, the class name for static calls.
    pub fn context(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.class)
    }
}
