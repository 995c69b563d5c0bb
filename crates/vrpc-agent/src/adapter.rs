//! Class registry and RPC dispatch
//!
//! The adapter holds the registered classes and their live instances and
//! dispatches RPC envelopes against them. User-visible failures never
//! escape [`Adapter::call`]; they land in the envelope's `e` entry and the
//! envelope travels back to the caller either way.

use crate::class::{
    CallArgs, Callback, CallbackSink, ClassDescriptor, Deferred, EventHub, Instance, Ret,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;
use vrpc_proto::envelope::{
    placeholder_id, promise_tag, CALL_ALL, CREATE, CREATE_NAMED, DELETE, GET_NAMED,
};
use vrpc_proto::{topic, ClassInfo, Envelope, MethodMeta};

/// Lifetime category of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    /// Auto-generated id, lifetime bound to the creating client
    Anonymous,
    /// Caller-chosen id, survives client disconnects
    Named,
}

struct InstanceRecord {
    object: Instance,
    class_name: String,
    kind: InstanceKind,
    seq: u64,
    hub: EventHub,
}

/// Class registry, instance table and dispatch engine.
#[derive(Default)]
pub struct Adapter {
    classes: HashMap<String, ClassDescriptor>,
    instances: HashMap<String, InstanceRecord>,
    next_seq: u64,
    next_promise: u64,
    sink: Option<CallbackSink>,
}

impl Adapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class to the registry; a same-named registration replaces the
    /// previous one.
    pub fn register(&mut self, descriptor: ClassDescriptor) {
        let name = descriptor.name().to_string();
        if self.classes.insert(name.clone(), descriptor).is_some() {
            debug!(class = %name, "replaced class registration");
        } else {
            debug!(class = %name, "registered class");
        }
    }

    /// Install the sink receiving callback and promise emissions.
    pub fn on_callback(&mut self, sink: CallbackSink) {
        self.sink = Some(sink);
    }

    /// Registered class names, sorted.
    pub fn get_available_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instance ids of a class, in creation order.
    pub fn get_available_instances(&self, class: &str) -> Vec<String> {
        let mut entries: Vec<(&String, u64)> = self
            .instances
            .iter()
            .filter(|(_, record)| record.class_name == class)
            .map(|(id, record)| (id, record.seq))
            .collect();
        entries.sort_by_key(|(_, seq)| *seq);
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Remotely callable member functions of a class.
    pub fn get_available_member_functions(&self, class: &str) -> Vec<String> {
        self.classes
            .get(class)
            .map(ClassDescriptor::member_names)
            .unwrap_or_default()
    }

    /// Remotely callable static functions of a class.
    pub fn get_available_static_functions(&self, class: &str) -> Vec<String> {
        self.classes
            .get(class)
            .map(ClassDescriptor::static_names)
            .unwrap_or_default()
    }

    /// Per-method introspection metadata of a class.
    pub fn get_available_meta_data(&self, class: &str) -> BTreeMap<String, MethodMeta> {
        self.classes
            .get(class)
            .map(|descriptor| descriptor.meta().clone())
            .unwrap_or_default()
    }

    /// The retained metadata document for a class.
    pub fn class_info(&self, class: &str) -> Option<ClassInfo> {
        let descriptor = self.classes.get(class)?;
        Some(ClassInfo {
            class_name: descriptor.name().to_string(),
            instances: self.get_available_instances(class),
            member_functions: descriptor.member_names(),
            static_functions: descriptor.static_names(),
            meta: descriptor.meta().clone(),
        })
    }

    /// Whether an instance with this id exists.
    pub fn has_instance(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Whether the instance was created under a caller-chosen name.
    pub fn is_named(&self, id: &str) -> bool {
        self.instances
            .get(id)
            .map(|record| record.kind == InstanceKind::Named)
            .unwrap_or(false)
    }

    /// The class an instance belongs to.
    pub fn class_of(&self, id: &str) -> Option<String> {
        self.instances.get(id).map(|record| record.class_name.clone())
    }

    /// Event subscriptions of an instance as `(client, event, callback id)`.
    pub fn subscriptions_of(&self, id: &str) -> Vec<(String, String, String)> {
        self.instances
            .get(id)
            .map(|record| record.hub.subscriptions())
            .unwrap_or_default()
    }

    /// Construct an anonymous instance; returns its generated id.
    pub fn create_anonymous(&mut self, class: &str, args: Vec<Value>) -> Result<String, String> {
        let id = Uuid::new_v4().simple().to_string();
        self.construct(class, &id, InstanceKind::Anonymous, args, None)?;
        Ok(id)
    }

    /// Construct a named instance; an existing id is left untouched.
    pub fn create_named(&mut self, class: &str, name: &str, args: Vec<Value>) -> Result<(), String> {
        if self.instances.contains_key(name) {
            return Ok(());
        }
        self.construct(class, name, InstanceKind::Named, args, None)
    }

    /// Destroy an instance; `false` when no such instance exists.
    pub fn delete_instance(&mut self, id: &str) -> bool {
        match self.instances.remove(id) {
            Some(record) => {
                debug!(class = %record.class_name, id, "destroyed instance");
                true
            }
            None => false,
        }
    }

    /// Detach every event subscription a client registered, across all
    /// instances.
    pub fn unregister_event_listeners(&self, client_id: &str) {
        let mut removed = 0;
        for record in self.instances.values() {
            removed += record.hub.detach_client(client_id);
        }
        if removed > 0 {
            debug!(client = client_id, removed, "detached event listeners");
        }
    }

    /// Dispatch an RPC envelope, mutating it in place.
    ///
    /// After the call the envelope carries a return value under `data.r`
    /// or an error string under `data.e`, never both.
    pub fn call(&mut self, envelope: &mut Envelope) {
        match envelope.method.as_str() {
            CREATE => self.handle_create(envelope),
            CREATE_NAMED => self.handle_create_named(envelope),
            GET_NAMED => self.handle_get_named(envelope),
            DELETE => self.handle_delete(envelope),
            CALL_ALL => self.handle_call_all(envelope),
            _ => self.handle_invoke(envelope),
        }
    }

    fn handle_create(&mut self, envelope: &mut Envelope) {
        let class = envelope.context.clone();
        if !self.classes.contains_key(&class) {
            envelope.set_error(format!("Could not find context: {}", class));
            return;
        }
        let id = Uuid::new_v4().simple().to_string();
        match self.construct(
            &class,
            &id,
            InstanceKind::Anonymous,
            envelope.args(),
            envelope.sender.clone(),
        ) {
            Ok(()) => envelope.set_return(Value::String(id)),
            Err(err) => envelope.set_error(err),
        }
    }

    fn handle_create_named(&mut self, envelope: &mut Envelope) {
        let class = envelope.context.clone();
        if !self.classes.contains_key(&class) {
            envelope.set_error(format!("Could not find context: {}", class));
            return;
        }
        let args = envelope.args();
        let Some(name) = args.first().and_then(Value::as_str).map(str::to_string) else {
            envelope.set_error("Expected instance name as first argument");
            return;
        };
        if self.instances.contains_key(&name) {
            envelope.set_return(Value::String(name));
            return;
        }
        match self.construct(
            &class,
            &name,
            InstanceKind::Named,
            args[1..].to_vec(),
            envelope.sender.clone(),
        ) {
            Ok(()) => envelope.set_return(Value::String(name)),
            Err(err) => envelope.set_error(err),
        }
    }

    fn handle_get_named(&mut self, envelope: &mut Envelope) {
        let args = envelope.args();
        let Some(name) = args.first().and_then(Value::as_str) else {
            envelope.set_error("Expected instance name as first argument");
            return;
        };
        match self.instances.get(name) {
            Some(record) if record.kind == InstanceKind::Named => {
                envelope.set_return(Value::String(name.to_string()));
            }
            _ => envelope.set_error(format!("Could not find instance: {}", name)),
        }
    }

    fn handle_delete(&mut self, envelope: &mut Envelope) {
        let args = envelope.args();
        let Some(name) = args.first().and_then(Value::as_str).map(str::to_string) else {
            envelope.set_error("Expected instance name as first argument");
            return;
        };
        let deleted = self.delete_instance(&name);
        envelope.set_return(Value::Bool(deleted));
    }

    fn handle_call_all(&mut self, envelope: &mut Envelope) {
        let class = envelope.context.clone();
        let Some(descriptor) = self.classes.get(&class) else {
            envelope.set_error(format!("Could not find context: {}", class));
            return;
        };
        let args = envelope.args();
        let Some(method) = args.first().and_then(Value::as_str).map(str::to_string) else {
            envelope.set_error("Expected method name as first argument");
            return;
        };
        let Some(member) = descriptor.member(&method).cloned() else {
            envelope.set_error(format!("Could not find function: {}", method));
            return;
        };
        let rest = args[1..].to_vec();

        let mut targets: Vec<(String, u64, Instance, EventHub)> = self
            .instances
            .iter()
            .filter(|(_, record)| record.class_name == class)
            .map(|(id, record)| (id.clone(), record.seq, record.object.clone(), record.hub.clone()))
            .collect();
        targets.sort_by_key(|(_, seq, _, _)| *seq);

        let mut results = Vec::with_capacity(targets.len());
        for (id, _, object, hub) in targets {
            let call_args = CallArgs::new(
                rest.clone(),
                self.sink.clone(),
                envelope.sender.clone(),
                Some(hub),
            );
            match member(&object, &call_args) {
                Ok(Ret::Value(value)) => results.push(json!({ "id": id, "val": value })),
                Ok(Ret::Deferred(deferred)) => {
                    let tag = self.defer(deferred, envelope.sender.clone());
                    results.push(json!({ "id": id, "val": tag }));
                }
                Err(err) => results.push(json!({ "id": id, "err": err })),
            }
        }
        envelope.set_return(Value::Array(results));
    }

    fn handle_invoke(&mut self, envelope: &mut Envelope) {
        let context = envelope.context.clone();
        let method = envelope.method.clone();

        if let Some(descriptor) = self.classes.get(&context) {
            let Some(function) = descriptor.static_fn(&method).cloned() else {
                envelope.set_error(format!("Could not find function: {}", method));
                return;
            };
            let call_args = CallArgs::new(
                envelope.args(),
                self.sink.clone(),
                envelope.sender.clone(),
                None,
            );
            let result = function(&call_args);
            self.finish(envelope, &call_args, result);
        } else if let Some(record) = self.instances.get(&context) {
            let class_name = record.class_name.clone();
            let object = record.object.clone();
            let hub = record.hub.clone();
            let Some(descriptor) = self.classes.get(&class_name) else {
                envelope.set_error(format!("Could not find context: {}", context));
                return;
            };
            if let Some(event) = descriptor.event_name(&method).map(str::to_string) {
                self.register_event_listener(envelope, &hub, &event);
                return;
            }
            let Some(function) = descriptor.member(&method).cloned() else {
                envelope.set_error(format!("Could not find function: {}", method));
                return;
            };
            let call_args = CallArgs::new(
                envelope.args(),
                self.sink.clone(),
                envelope.sender.clone(),
                Some(hub),
            );
            let result = function(&object, &call_args);
            self.finish(envelope, &call_args, result);
        } else {
            envelope.set_error(format!("Could not find context: {}", context));
        }
    }

    fn finish(
        &mut self,
        envelope: &mut Envelope,
        call_args: &CallArgs,
        result: Result<Ret, String>,
    ) {
        for (i, value) in call_args.dirty_slots() {
            envelope.set_arg(i + 1, value);
        }
        match result {
            Ok(Ret::Value(value)) => envelope.set_return(value),
            Ok(Ret::Deferred(deferred)) => {
                let tag = self.defer(deferred, envelope.sender.clone());
                envelope.set_return(Value::String(tag));
            }
            Err(err) => envelope.set_error(err),
        }
    }

    /// Convert a pending computation into a promise tag and arrange for
    /// its resolution to reach the callback sink.
    fn defer(&mut self, deferred: Deferred, sender: Option<String>) -> String {
        let tag = promise_tag(self.next_promise);
        self.next_promise += 1;
        match self.sink.clone() {
            Some(sink) => {
                let id = tag.clone();
                tokio::spawn(async move {
                    let mut emission = Envelope {
                        sender,
                        id: Some(id),
                        ..Default::default()
                    };
                    match deferred.await {
                        Ok(value) => emission.set_return(value),
                        Err(err) => emission.set_error(err),
                    }
                    if sink.send(emission).is_err() {
                        warn!("dropping deferred result, agent has ended");
                    }
                });
            }
            None => warn!(tag = %tag, "no callback sink installed, deferred result will be lost"),
        }
        tag
    }

    fn register_event_listener(&mut self, envelope: &mut Envelope, hub: &EventHub, event: &str) {
        let Some(sink) = self.sink.clone() else {
            envelope.set_error("No callback sink installed");
            return;
        };
        let Some(sender) = envelope.sender.clone() else {
            envelope.set_error("Expected sender information");
            return;
        };
        let Some(client_id) = topic::client_id_from_sender(&sender) else {
            envelope.set_error("Expected sender information");
            return;
        };
        let args = envelope.args();
        let Some(id) = args.iter().find_map(placeholder_id).map(str::to_string) else {
            envelope.set_error("Expected callback argument");
            return;
        };
        debug!(client = %client_id, event, callback = %id, "attached event listener");
        hub.attach(&client_id, event, Callback::new(id, Some(sender), sink));
        envelope.set_return(Value::Bool(true));
    }

    fn construct(
        &mut self,
        class: &str,
        id: &str,
        kind: InstanceKind,
        args: Vec<Value>,
        sender: Option<String>,
    ) -> Result<(), String> {
        let descriptor = self
            .classes
            .get(class)
            .ok_or_else(|| format!("Could not find context: {}", class))?;
        let constructor = descriptor
            .constructor()
            .cloned()
            .ok_or_else(|| format!("Class has no constructor: {}", class))?;
        let hub = EventHub::default();
        let call_args = CallArgs::new(args, self.sink.clone(), sender, Some(hub.clone()));
        let object = constructor(&call_args)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.instances.insert(
            id.to_string(),
            InstanceRecord {
                object,
                class_name: class.to_string(),
                kind,
                seq,
                hub,
            },
        );
        debug!(class, id, "created instance");
        Ok(())
    }
}
