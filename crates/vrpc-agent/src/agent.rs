//! Broker session lifecycle and message routing
//!
//! [`VrpcAgent`] drives a single cooperative loop: broker messages arrive
//! serialized and each one is fully processed (dispatch, reply, tracking)
//! before the next is accepted. Deferred results and callback invocations
//! re-enter the loop through the adapter's emission channel.

use crate::adapter::Adapter;
use crate::broker::{self, Broker, MqttBroker};
use crate::class::ClassDescriptor;
use crate::config::AgentOptions;
use crate::tracker::ClientTracker;
use crate::{AgentError, Result};
use rumqttc::{AsyncClient, Event, LastWill, Packet};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use vrpc_proto::envelope::{CALL_ALL, CREATE, CREATE_NAMED, DELETE, GET_NAMED};
use vrpc_proto::{topic, AgentInfo, AgentStatus, ClientStatus, DispatchTopic, Envelope};

/// Delay between reconnect attempts after a lost connection
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Constructed, not yet serving
    Init,
    /// Discarding a stale durable session
    Cleaning,
    /// Waiting for the broker to accept the operational connection
    Connecting,
    /// Connected and serving
    Connected,
    /// Connection lost, retrying
    Reconnecting,
    /// Shutdown in progress
    Ending,
    /// Shutdown complete
    Ended,
}

/// Externally observable session events
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// First connection established
    Connect,
    /// Connection re-established after a loss
    Reconnect,
    /// Connection closed
    Close,
    /// Connection lost
    Offline,
    /// Connection-level failure
    Error(String),
    /// Session ended
    End,
}

/// Shutdown options for [`AgentHandle::end`]
#[derive(Debug, Clone, Copy, Default)]
pub struct EndOptions {
    /// Also clear the retained agent and class info documents
    pub unregister: bool,
}

/// Handle for ending a serving agent from another task.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    end_tx: mpsc::Sender<EndOptions>,
}

impl AgentHandle {
    /// End the session: publish offline status, optionally clear all
    /// retained documents, close the connection.
    pub async fn end(&self, options: EndOptions) -> Result<()> {
        self.end_tx
            .send(options)
            .await
            .map_err(|_| AgentError::Connection("agent is not serving".to_string()))
    }
}

/// An agent: registered classes plus one broker session serving them.
pub struct VrpcAgent {
    options: AgentOptions,
    adapter: Adapter,
    tracker: ClientTracker,
    status: SessionStatus,
    reconnected: bool,
    client_id: String,
    callback_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    end_tx: mpsc::Sender<EndOptions>,
    end_rx: Option<mpsc::Receiver<EndOptions>>,
    events_tx: broadcast::Sender<AgentEvent>,
}

impl VrpcAgent {
    /// Create an agent from validated options.
    pub fn new(options: AgentOptions) -> Self {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = mpsc::channel(1);
        let (events_tx, _) = broadcast::channel(16);
        let mut adapter = Adapter::new();
        adapter.on_callback(callback_tx);
        let client_id = broker_client_id(&options.domain, &options.agent);
        Self {
            options,
            adapter,
            tracker: ClientTracker::new(),
            status: SessionStatus::Init,
            reconnected: false,
            client_id,
            callback_rx: Some(callback_rx),
            end_tx,
            end_rx: Some(end_rx),
            events_tx,
        }
    }

    /// Register a class with the agent's adapter.
    pub fn register(&mut self, descriptor: ClassDescriptor) {
        self.adapter.register(descriptor);
    }

    /// Read-only access to the adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Mutable access to the adapter, e.g. to pre-create named instances.
    pub fn adapter_mut(&mut self) -> &mut Adapter {
        &mut self.adapter
    }

    /// The deterministic broker client id of this agent.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current session state.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Subscribe to session events.
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    /// A handle for ending the session while [`VrpcAgent::serve`] runs.
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            end_tx: self.end_tx.clone(),
        }
    }

    /// Connect to the broker and serve until [`AgentHandle::end`] is called.
    ///
    /// A clean-session connect first discards any stale durable session,
    /// then the operational persistent-session connection is opened with an
    /// offline last-will and the message loop runs.
    pub async fn serve(&mut self) -> Result<()> {
        let mut callback_rx = self
            .callback_rx
            .take()
            .ok_or_else(|| AgentError::Config("serve may only be called once".to_string()))?;
        let mut end_rx = self
            .end_rx
            .take()
            .ok_or_else(|| AgentError::Config("serve may only be called once".to_string()))?;

        self.set_status(SessionStatus::Cleaning);
        self.clean_stale_session().await?;

        self.set_status(SessionStatus::Connecting);
        let will_payload = agent_info_payload(&self.options, AgentStatus::Offline)?;
        let will = LastWill::new(
            topic::agent_info(&self.options.domain, &self.options.agent),
            will_payload,
            broker::qos_for(self.options.best_effort),
            true,
        );
        let mqtt = broker::mqtt_options(&self.options, &self.client_id, false, Some(will))?;
        let (client, mut eventloop) = AsyncClient::new(mqtt, 64);
        let broker = MqttBroker::new(client, self.options.best_effort);
        info!(
            domain = %self.options.domain,
            agent = %self.options.agent,
            id = %self.client_id,
            "agent serving"
        );

        loop {
            tokio::select! {
                Some(options) = end_rx.recv() => {
                    self.set_status(SessionStatus::Ending);
                    self.shutdown(&broker, options).await;
                    self.set_status(SessionStatus::Ended);
                    self.emit(AgentEvent::End);
                    return Ok(());
                }
                Some(emission) = callback_rx.recv() => {
                    self.publish_emission(&broker, emission).await;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        debug!(session_present = ack.session_present, "broker accepted connection");
                        if let Err(err) = self.on_connect(&broker).await {
                            warn!(error = %err, "connect-time publications failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&broker, &publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if self.status == SessionStatus::Connected {
                            // only a loss after a successful connect makes the
                            // next ConnAck a reconnect; a failed first attempt
                            // must still run the initial subscriptions
                            self.emit(AgentEvent::Offline);
                            self.emit(AgentEvent::Close);
                            self.reconnected = true;
                        }
                        self.emit(AgentEvent::Error(err.to_string()));
                        self.set_status(SessionStatus::Reconnecting);
                        warn!(error = %err, "broker connection lost, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }
    }

    /// Open and immediately close a clean session, discarding whatever
    /// durable state a prior crashed instance left at the broker.
    async fn clean_stale_session(&self) -> Result<()> {
        debug!(id = %self.client_id, "discarding stale broker session");
        let mqtt = broker::mqtt_options(&self.options, &self.client_id, true, None)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt, 8);
        let cleanup = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if client.disconnect().await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), cleanup).await.is_err() {
            warn!("session cleanup timed out");
        }
        Ok(())
    }

    /// Connect-time publications and subscriptions.
    async fn on_connect(&mut self, broker: &dyn Broker) -> Result<()> {
        self.set_status(SessionStatus::Connected);
        if self.reconnected {
            // the persistent session restored all subscriptions
            self.reconnected = false;
            self.emit(AgentEvent::Reconnect);
            self.publish_agent_info(broker, AgentStatus::Online).await?;
            return Ok(());
        }
        self.emit(AgentEvent::Connect);
        self.subscribe_static_topics(broker).await?;
        self.publish_agent_info(broker, AgentStatus::Online).await?;
        for class in self.adapter.get_available_classes() {
            // instances created before serving are advertised in the class
            // info document and must be dispatchable from the start
            for instance in self.adapter.get_available_instances(&class) {
                self.watch_instance(broker, &class, &instance).await;
            }
            self.publish_class_info(broker, &class).await?;
        }
        Ok(())
    }

    async fn subscribe_static_topics(&self, broker: &dyn Broker) -> Result<()> {
        let mut topics = Vec::new();
        for class in self.adapter.get_available_classes() {
            for method in self.adapter.get_available_static_functions(&class) {
                topics.push(topic::static_dispatch(
                    &self.options.domain,
                    &self.options.agent,
                    &class,
                    &method,
                ));
            }
            for method in [CREATE, CREATE_NAMED, GET_NAMED, DELETE, CALL_ALL] {
                topics.push(topic::static_dispatch(
                    &self.options.domain,
                    &self.options.agent,
                    &class,
                    method,
                ));
            }
        }
        if topics.is_empty() {
            return Ok(());
        }
        broker.subscribe(&topics).await
    }

    /// Route one broker message: client presence or RPC dispatch.
    async fn handle_publish(&mut self, broker: &dyn Broker, topic_str: &str, payload: &[u8]) {
        if let Some(client_id) = topic::client_id_from_info_topic(topic_str) {
            let client_id = client_id.to_string();
            self.handle_client_info(broker, &client_id, payload).await;
            return;
        }
        let Some(dispatch) = DispatchTopic::parse(topic_str) else {
            warn!(topic = topic_str, "ignoring message on unrecognized topic");
            return;
        };
        let mut envelope = match Envelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic = topic_str, error = %err, "dropping malformed envelope");
                return;
            }
        };
        envelope.context = dispatch.context().to_string();
        envelope.method = dispatch.method.clone();
        self.handle_dispatch(broker, &dispatch, envelope).await;
    }

    /// Dispatch an RPC envelope, publish the reply, maintain the tracker.
    ///
    /// A named deletion republishes its class info before the reply, a named
    /// creation after it; a late subscriber thus never sees an instance
    /// listed without its creator holding the reply, nor a deleted instance
    /// after the deletion was acknowledged.
    async fn handle_dispatch(
        &mut self,
        broker: &dyn Broker,
        dispatch: &DispatchTopic,
        mut envelope: Envelope,
    ) {
        let method = envelope.method.clone();
        let args = envelope.args();

        // capture what dispatch is about to destroy or overwrite
        let deletion_target = (method == DELETE)
            .then(|| args.first().and_then(Value::as_str))
            .flatten()
            .and_then(|id| {
                self.adapter
                    .class_of(id)
                    .map(|class| (id.to_string(), class, self.adapter.is_named(id)))
            });
        let named_pre_existing = (method == CREATE_NAMED)
            .then(|| args.first().and_then(Value::as_str))
            .flatten()
            .map(|name| self.adapter.has_instance(name));

        self.adapter.call(&mut envelope);
        let succeeded = envelope.error().is_none();

        let mut republish_after: Option<String> = None;
        if succeeded {
            match method.as_str() {
                CREATE => {
                    if let Some(id) = envelope.return_value().and_then(Value::as_str) {
                        let id = id.to_string();
                        self.watch_instance(broker, &dispatch.class, &id).await;
                        self.track_instance(broker, envelope.sender.as_deref(), &id, false)
                            .await;
                    }
                }
                CREATE_NAMED => {
                    if let Some(name) = envelope.return_value().and_then(Value::as_str) {
                        let name = name.to_string();
                        if named_pre_existing == Some(false) {
                            self.watch_instance(broker, &dispatch.class, &name).await;
                            republish_after = Some(dispatch.class.clone());
                        }
                        self.track_instance(broker, envelope.sender.as_deref(), &name, true)
                            .await;
                    }
                }
                GET_NAMED => {
                    if let Some(name) = envelope.return_value().and_then(Value::as_str) {
                        let name = name.to_string();
                        self.track_instance(broker, envelope.sender.as_deref(), &name, true)
                            .await;
                    }
                }
                DELETE if envelope.return_value() == Some(&Value::Bool(true)) => {
                    if let Some((id, class, named)) = deletion_target {
                        self.forget_instance(broker, &class, &id, named).await;
                    }
                }
                _ => {}
            }
        }

        self.publish_reply(broker, &envelope).await;

        if let Some(class) = republish_after {
            if let Err(err) = self.publish_class_info(broker, &class).await {
                warn!(class = %class, error = %err, "class info republish failed");
            }
        }
    }

    /// A client reported itself offline: delete its anonymous instances,
    /// drop its event listeners, release its presence subscription.
    async fn handle_client_info(&mut self, broker: &dyn Broker, client_id: &str, payload: &[u8]) {
        let status = match serde_json::from_slice::<ClientStatus>(payload) {
            Ok(status) => status,
            Err(err) => {
                warn!(client = client_id, error = %err, "dropping malformed client status");
                return;
            }
        };
        if !status.is_offline() {
            return;
        }
        info!(client = client_id, "client went offline, reclaiming its resources");

        let (instances, was_tracked) = self.tracker.remove_client(client_id);
        for instance in instances {
            let Some(class) = self.adapter.class_of(&instance) else {
                continue;
            };
            let mut envelope = Envelope {
                context: class.clone(),
                method: DELETE.to_string(),
                ..Default::default()
            };
            envelope.set_arg(1, Value::String(instance.clone()));
            self.adapter.call(&mut envelope);
            match envelope.return_value() {
                Some(Value::Bool(true)) => {
                    debug!(instance = %instance, "deleted instance of offline client")
                }
                _ => warn!(
                    instance = %instance,
                    error = envelope.error().unwrap_or("deletion refused"),
                    "could not delete instance of offline client"
                ),
            }
            let wildcard = topic::instance_wildcard(
                &self.options.domain,
                &self.options.agent,
                &class,
                &instance,
            );
            if let Err(err) = broker.unsubscribe(&wildcard).await {
                warn!(topic = %wildcard, error = %err, "unsubscribe failed");
            }
        }

        self.adapter.unregister_event_listeners(client_id);

        if was_tracked {
            let info_topic = topic::client_info(client_id);
            if let Err(err) = broker.unsubscribe(&info_topic).await {
                warn!(topic = %info_topic, error = %err, "unsubscribe failed");
            }
        }
    }

    /// Subscribe to the dispatch wildcard of a fresh instance.
    async fn watch_instance(&self, broker: &dyn Broker, class: &str, instance: &str) {
        let wildcard =
            topic::instance_wildcard(&self.options.domain, &self.options.agent, class, instance);
        if let Err(err) = broker.subscribe(&[wildcard.clone()]).await {
            warn!(topic = %wildcard, error = %err, "subscribe failed");
        }
    }

    /// Unsubscribe a deleted instance and update the tracker; a named
    /// deletion also republishes the class info.
    async fn forget_instance(&mut self, broker: &dyn Broker, class: &str, instance: &str, named: bool) {
        let wildcard =
            topic::instance_wildcard(&self.options.domain, &self.options.agent, class, instance);
        if let Err(err) = broker.unsubscribe(&wildcard).await {
            warn!(topic = %wildcard, error = %err, "unsubscribe failed");
        }
        for client in self.tracker.untrack_instance(instance) {
            let info_topic = topic::client_info(&client);
            if let Err(err) = broker.unsubscribe(&info_topic).await {
                warn!(topic = %info_topic, error = %err, "unsubscribe failed");
            }
        }
        if named {
            if let Err(err) = self.publish_class_info(broker, class).await {
                warn!(class, error = %err, "class info republish failed");
            }
        }
    }

    /// Correlate an instance with the calling client; a newly tracked
    /// client gets a presence subscription.
    async fn track_instance(
        &mut self,
        broker: &dyn Broker,
        sender: Option<&str>,
        instance: &str,
        named: bool,
    ) {
        let Some(client_id) = sender.and_then(topic::client_id_from_sender) else {
            warn!(instance, "cannot derive client id from sender, instance is untracked");
            return;
        };
        let newly_tracked = if named {
            self.tracker.track_named(&client_id, instance)
        } else {
            self.tracker.track_anonymous(&client_id, instance)
        };
        if newly_tracked {
            let info_topic = topic::client_info(&client_id);
            if let Err(err) = broker.subscribe(&[info_topic.clone()]).await {
                warn!(topic = %info_topic, error = %err, "subscribe failed");
            }
        }
    }

    /// Publish the mutated envelope back to its sender.
    async fn publish_reply(&self, broker: &dyn Broker, envelope: &Envelope) {
        let Some(sender) = envelope.sender.as_deref() else {
            warn!("envelope carries no sender, dropping reply");
            return;
        };
        match envelope.to_json_lossy() {
            Ok(json) => {
                if let Err(err) = broker.publish(sender, json.into_bytes(), false).await {
                    warn!(topic = sender, error = %err, "reply publish failed");
                }
            }
            Err(err) => warn!(topic = sender, error = %err, "reply serialization failed"),
        }
    }

    /// Publish a callback or promise emission to its sender.
    async fn publish_emission(&self, broker: &dyn Broker, envelope: Envelope) {
        self.publish_reply(broker, &envelope).await;
    }

    async fn publish_agent_info(&self, broker: &dyn Broker, status: AgentStatus) -> Result<()> {
        let payload = agent_info_payload(&self.options, status)?;
        let info_topic = topic::agent_info(&self.options.domain, &self.options.agent);
        broker.publish(&info_topic, payload, true).await
    }

    async fn publish_class_info(&self, broker: &dyn Broker, class: &str) -> Result<()> {
        let Some(info) = self.adapter.class_info(class) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(&info)
            .map_err(|err| AgentError::Transport(format!("class info serialization: {}", err)))?;
        let info_topic = topic::class_info(&self.options.domain, &self.options.agent, class);
        broker.publish(&info_topic, payload, true).await
    }

    /// End-of-session sequence: offline status, optional unregistration,
    /// disconnect and final durable-state cleanup.
    async fn shutdown(&mut self, broker: &dyn Broker, options: EndOptions) {
        info!(unregister = options.unregister, "ending agent session");
        if let Err(err) = self.publish_agent_info(broker, AgentStatus::Offline).await {
            warn!(error = %err, "offline status publish failed");
        }
        if options.unregister {
            let agent_topic = topic::agent_info(&self.options.domain, &self.options.agent);
            if let Err(err) = broker.publish(&agent_topic, Vec::new(), true).await {
                warn!(error = %err, "agent info clear failed");
            }
            for class in self.adapter.get_available_classes() {
                let class_topic =
                    topic::class_info(&self.options.domain, &self.options.agent, &class);
                if let Err(err) = broker.publish(&class_topic, Vec::new(), true).await {
                    warn!(class = %class, error = %err, "class info clear failed");
                }
            }
        }
        if let Err(err) = broker.disconnect().await {
            warn!(error = %err, "disconnect failed");
        }
        if let Err(err) = self.clean_stale_session().await {
            warn!(error = %err, "final session cleanup failed");
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!(from = ?self.status, to = ?status, "session status");
            self.status = status;
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Drain queued callback and promise emissions outside the serve loop.
    #[cfg(test)]
    async fn drain_emissions(&mut self, broker: &dyn Broker) {
        let mut pending = Vec::new();
        if let Some(callback_rx) = self.callback_rx.as_mut() {
            while let Ok(envelope) = callback_rx.try_recv() {
                pending.push(envelope);
            }
        }
        for envelope in pending {
            self.publish_reply(broker, &envelope).await;
        }
    }
}

/// Deterministic broker client id: reconnects reuse the same durable
/// session, and the id stays within the 23-character MQTT limit.
fn broker_client_id(domain: &str, agent: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", domain, agent).as_bytes());
    let hex = format!("{:x}", digest);
    format!("vrpca{}", &hex[..18])
}

fn agent_info_payload(options: &AgentOptions, status: AgentStatus) -> Result<Vec<u8>> {
    let info = AgentInfo {
        status,
        hostname: local_hostname(),
        version: options.version.clone(),
    };
    serde_json::to_vec(&info)
        .map_err(|err| AgentError::Transport(format!("agent info serialization: {}", err)))
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
