//! Agent configuration surface

use crate::AgentError;
use vrpc_proto::topic;

/// Default broker endpoint
pub const DEFAULT_BROKER: &str = "mqtts://vrpc.io:8883";

/// Broker authentication method
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Auth {
    /// Connect without credentials
    #[default]
    Anonymous,
    /// Token authentication: username `__token__`, password = token
    Token(String),
    /// Explicit username and password
    Credentials {
        /// Broker username
        username: String,
        /// Broker password
        password: String,
    },
}

/// Configuration record the agent is constructed with.
///
/// `domain` and `agent` become topic segments and are validated at
/// construction; an invalid name refuses to start the agent.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Broker-enforced namespace the agent lives in
    pub domain: String,
    /// Name of this agent within the domain
    pub agent: String,
    /// Broker URL, `mqtt[s]://host[:port]`
    pub broker: String,
    /// Broker authentication
    pub auth: Auth,
    /// Downgrade all traffic from QoS 1 to QoS 0
    pub best_effort: bool,
    /// Version string published in the retained agent status document
    pub version: String,
}

impl AgentOptions {
    /// Create options for an agent in a domain.
    pub fn new(domain: impl Into<String>, agent: impl Into<String>) -> Result<Self, AgentError> {
        let domain = domain.into();
        let agent = agent.into();
        topic::validate_segment(&domain)
            .map_err(|err| AgentError::Config(format!("domain: {}", err)))?;
        topic::validate_segment(&agent)
            .map_err(|err| AgentError::Config(format!("agent: {}", err)))?;
        Ok(Self {
            domain,
            agent,
            broker: DEFAULT_BROKER.to_string(),
            auth: Auth::Anonymous,
            best_effort: false,
            version: String::new(),
        })
    }

    /// Set the broker URL.
    pub fn with_broker(mut self, url: impl Into<String>) -> Self {
        self.broker = url.into();
        self
    }

    /// Authenticate with an access token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Auth::Token(token.into());
        self
    }

    /// Authenticate with username and password.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = Auth::Credentials {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    /// Downgrade all publications and subscriptions to QoS 0.
    pub fn with_best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    /// Set the version string for the agent status document.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// A parsed broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BrokerUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerUrl {
    /// Parse `scheme://host[:port]`, with `mqtt`/`tcp` plain and
    /// `mqtts`/`ssl` TLS; default ports 1883 and 8883.
    pub fn parse(url: &str) -> Result<Self, AgentError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| AgentError::Config(format!("broker URL has no scheme: {}", url)))?;
        let tls = match scheme {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(AgentError::Config(format!(
                    "unsupported broker scheme: {}",
                    other
                )))
            }
        };
        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AgentError::Config(format!("invalid broker port: {}", port)))?;
                (host, port)
            }
            None => (authority, if tls { 8883 } else { 1883 }),
        };
        if host.is_empty() {
            return Err(AgentError::Config(format!("broker URL has no host: {}", url)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}
