//! Class descriptors, call arguments and callback plumbing
//!
//! Classes are registered as tables of trampolines over type-erased JSON
//! values. A [`ClassBuilder`] assembles constructors, member functions,
//! static functions, event sources and introspection metadata into a
//! [`ClassDescriptor`] the adapter dispatches against.

use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;
use vrpc_proto::envelope::placeholder_id;
use vrpc_proto::{Envelope, MethodMeta, ParamMeta};

/// A live, type-erased instance held by the registry
pub type Instance = Arc<dyn Any + Send + Sync>;

/// A deferred method result, resolved after dispatch returns
pub type Deferred = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Sink receiving callback and promise emissions
pub type CallbackSink = mpsc::UnboundedSender<Envelope>;

/// What a method invocation produced
pub enum Ret {
    /// An immediate return value
    Value(Value),
    /// A pending computation; its resolution is emitted later under a
    /// promise tag
    Deferred(Deferred),
}

/// Result of a constructor, member or static invocation.
///
/// The error string becomes the `e` entry of the reply envelope.
pub type MethodResult = Result<Ret, String>;

pub(crate) type CtorFn = Arc<dyn Fn(&CallArgs) -> Result<Instance, String> + Send + Sync>;
pub(crate) type MemberFn = Arc<dyn Fn(&Instance, &CallArgs) -> MethodResult + Send + Sync>;
pub(crate) type StaticFn = Arc<dyn Fn(&CallArgs) -> MethodResult + Send + Sync>;

/// A remote callback handle.
///
/// Wraps a placeholder argument; invoking it encodes the arguments into an
/// envelope and hands it to the agent for publication on the caller's reply
/// topic. The handle may be cloned and outlive the dispatch that produced
/// it.
#[derive(Debug, Clone)]
pub struct Callback {
    id: String,
    sender: Option<String>,
    sink: CallbackSink,
}

impl Callback {
    pub(crate) fn new(id: impl Into<String>, sender: Option<String>, sink: CallbackSink) -> Self {
        Self {
            id: id.into(),
            sender,
            sink,
        }
    }

    /// The correlation id the caller chose for this callback.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Invoke the remote callback with positional arguments.
    pub fn invoke(&self, args: Vec<Value>) {
        let envelope = Envelope::emission(self.id.clone(), self.sender.clone(), args);
        if self.sink.send(envelope).is_err() {
            warn!(id = %self.id, "dropping callback invocation, agent has ended");
        }
    }
}

/// Per-instance event subscriber table.
///
/// Constructors receive a clone through [`CallArgs::events`]; objects fire
/// events with [`EventHub::emit`], and the adapter attaches or detaches
/// remote subscribers as clients come and go.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

#[derive(Debug, Clone)]
struct Subscriber {
    client_id: String,
    event: String,
    callback: Callback,
}

impl EventHub {
    /// Fire an event, invoking every callback subscribed to it.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        let subscribers = self.inner.lock().unwrap();
        for subscriber in subscribers.iter().filter(|s| s.event == event) {
            subscriber.callback.invoke(args.clone());
        }
    }

    /// Attach a subscriber; an identical `(client, event, callback id)`
    /// triple replaces the previous registration.
    pub(crate) fn attach(&self, client_id: &str, event: &str, callback: Callback) {
        let mut subscribers = self.inner.lock().unwrap();
        subscribers.retain(|s| {
            !(s.client_id == client_id && s.event == event && s.callback.id() == callback.id())
        });
        subscribers.push(Subscriber {
            client_id: client_id.to_string(),
            event: event.to_string(),
            callback,
        });
    }

    /// Drop every subscription a client registered; returns how many.
    pub(crate) fn detach_client(&self, client_id: &str) -> usize {
        let mut subscribers = self.inner.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|s| s.client_id != client_id);
        before - subscribers.len()
    }

    /// The `(client, event, callback id)` triples currently attached.
    pub fn subscriptions(&self) -> Vec<(String, String, String)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.client_id.clone(), s.event.clone(), s.callback.id().to_string()))
            .collect()
    }
}

struct Slot {
    value: Value,
    dirty: bool,
}

/// Positional arguments of one invocation.
///
/// Wraps the `_1..=_N` values of the envelope. Placeholder arguments resolve
/// to [`Callback`] handles; slots written through [`CallArgs::set_value`]
/// are copied back into the envelope as out-parameters after dispatch.
pub struct CallArgs {
    slots: Mutex<Vec<Slot>>,
    sink: Option<CallbackSink>,
    sender: Option<String>,
    hub: Option<EventHub>,
}

impl CallArgs {
    pub(crate) fn new(
        values: Vec<Value>,
        sink: Option<CallbackSink>,
        sender: Option<String>,
        hub: Option<EventHub>,
    ) -> Self {
        Self {
            slots: Mutex::new(
                values
                    .into_iter()
                    .map(|value| Slot { value, dirty: false })
                    .collect(),
            ),
            sink,
            sender,
            hub,
        }
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Whether the invocation carries no arguments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The argument at position `i` (0-based).
    pub fn value(&self, i: usize) -> Option<Value> {
        self.slots.lock().unwrap().get(i).map(|slot| slot.value.clone())
    }

    /// All arguments in order.
    pub fn values(&self) -> Vec<Value> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.value.clone())
            .collect()
    }

    /// Write an out-parameter back into slot `i`.
    ///
    /// The updated value replaces the original `_<i+1>` entry of the reply
    /// envelope.
    pub fn set_value(&self, i: usize, value: Value) {
        if let Some(slot) = self.slots.lock().unwrap().get_mut(i) {
            slot.value = value;
            slot.dirty = true;
        }
    }

    /// Resolve the argument at position `i` as a callback handle.
    ///
    /// Succeeds when the argument carries a `__f__`/`__p__` placeholder tag
    /// and the adapter has a callback sink installed.
    pub fn callback(&self, i: usize) -> Option<Callback> {
        let id = {
            let slots = self.slots.lock().unwrap();
            placeholder_id(&slots.get(i)?.value)?.to_string()
        };
        let sink = self.sink.clone()?;
        Some(Callback::new(id, self.sender.clone(), sink))
    }

    /// The event hub of the instance under construction or dispatch.
    pub fn events(&self) -> Option<EventHub> {
        self.hub.clone()
    }

    /// The reply topic of the caller, if one was supplied.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub(crate) fn dirty_slots(&self) -> Vec<(usize, Value)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.dirty)
            .map(|(i, slot)| (i, slot.value.clone()))
            .collect()
    }
}

/// A registered class: trampoline tables plus introspection metadata.
pub struct ClassDescriptor {
    name: String,
    constructor: Option<CtorFn>,
    members: HashMap<String, MemberFn>,
    statics: HashMap<String, StaticFn>,
    events: HashMap<String, String>,
    meta: BTreeMap<String, MethodMeta>,
}

impl ClassDescriptor {
    /// The registered class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn constructor(&self) -> Option<&CtorFn> {
        self.constructor.as_ref()
    }

    pub(crate) fn member(&self, name: &str) -> Option<&MemberFn> {
        self.members.get(name)
    }

    pub(crate) fn static_fn(&self, name: &str) -> Option<&StaticFn> {
        self.statics.get(name)
    }

    /// The event a member function subscribes to, if it is an event source.
    pub(crate) fn event_name(&self, method: &str) -> Option<&str> {
        self.events.get(method).map(String::as_str)
    }

    /// Remotely callable member functions, event sources included.
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.keys().chain(self.events.keys()).cloned().collect();
        names.sort();
        names.dedup();
        names
    }

    /// Remotely callable static functions.
    pub fn static_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.statics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Per-method introspection metadata.
    pub fn meta(&self) -> &BTreeMap<String, MethodMeta> {
        &self.meta
    }
}

/// Builder assembling a [`ClassDescriptor`] for instances of `T`.
pub struct ClassBuilder<T> {
    descriptor: ClassDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ClassBuilder<T> {
    /// Start a descriptor for a class named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ClassDescriptor {
                name: name.into(),
                constructor: None,
                members: HashMap::new(),
                statics: HashMap::new(),
                events: HashMap::new(),
                meta: BTreeMap::new(),
            },
            _marker: PhantomData,
        }
    }

    /// Install the constructor.
    ///
    /// Arguments arrive positionally; the constructor may keep the event
    /// hub from [`CallArgs::events`] to fire events later.
    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallArgs) -> Result<T, String> + Send + Sync + 'static,
    {
        self.descriptor.constructor = Some(Arc::new(move |args| {
            f(args).map(|object| Arc::new(object) as Instance)
        }));
        self
    }

    /// Register a member function.
    pub fn member<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&T, &CallArgs) -> MethodResult + Send + Sync + 'static,
    {
        self.descriptor.members.insert(
            name.into(),
            Arc::new(move |instance, args| {
                let object = instance
                    .downcast_ref::<T>()
                    .ok_or_else(|| "Invalid instance type".to_string())?;
                f(object, args)
            }),
        );
        self
    }

    /// Register a static function.
    pub fn static_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallArgs) -> MethodResult + Send + Sync + 'static,
    {
        self.descriptor.statics.insert(name.into(), Arc::new(f));
        self
    }

    /// Mark `method` as an event source registering subscribers for `event`.
    ///
    /// The adapter synthesizes the method: a remote call with a callback
    /// placeholder attaches that callback to the instance's event hub until
    /// the subscribing client goes offline.
    pub fn event(mut self, method: impl Into<String>, event: impl Into<String>) -> Self {
        self.descriptor.events.insert(method.into(), event.into());
        self
    }

    /// Attach introspection metadata to a method.
    pub fn meta(
        mut self,
        method: impl Into<String>,
        description: impl Into<String>,
        params: Vec<(&str, &str)>,
        ret: impl Into<String>,
    ) -> Self {
        self.descriptor.meta.insert(
            method.into(),
            MethodMeta {
                description: description.into(),
                params: params
                    .into_iter()
                    .map(|(name, param_type)| ParamMeta {
                        name: name.to_string(),
                        param_type: param_type.to_string(),
                    })
                    .collect(),
                ret: ret.into(),
            },
        );
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> ClassDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter {
        count: i64,
    }

    fn sink() -> (CallbackSink, mpsc::UnboundedReceiver<Envelope>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_builder_collects_tables() {
        let descriptor = ClassBuilder::<Counter>::new("Counter")
            .constructor(|_| Ok(Counter { count: 0 }))
            .member("value", |obj, _| Ok(Ret::Value(json!(obj.count))))
            .static_fn("describe", |_| Ok(Ret::Value(json!("a counter"))))
            .event("onChange", "changed")
            .meta("value", "Current count", vec![], "integer")
            .build();

        assert_eq!(descriptor.name(), "Counter");
        assert_eq!(descriptor.member_names(), vec!["onChange", "value"]);
        assert_eq!(descriptor.static_names(), vec!["describe"]);
        assert_eq!(descriptor.event_name("onChange"), Some("changed"));
        assert_eq!(descriptor.event_name("value"), None);
        assert_eq!(descriptor.meta()["value"].ret, "integer");
    }

    #[test]
    fn test_member_downcasts_instance() {
        let descriptor = ClassBuilder::<Counter>::new("Counter")
            .constructor(|args| {
                Ok(Counter {
                    count: args.value(0).and_then(|v| v.as_i64()).unwrap_or(0),
                })
            })
            .member("value", |obj, _| Ok(Ret::Value(json!(obj.count))))
            .build();

        let args = CallArgs::new(vec![json!(7)], None, None, None);
        let instance = descriptor.constructor().unwrap()(&args).unwrap();

        let empty = CallArgs::new(vec![], None, None, None);
        let result = descriptor.member("value").unwrap()(&instance, &empty);
        match result {
            Ok(Ret::Value(v)) => assert_eq!(v, json!(7)),
            _ => panic!("expected immediate value"),
        }

        let wrong: Instance = Arc::new(42u8);
        let result = descriptor.member("value").unwrap()(&wrong, &empty);
        assert_eq!(result.err(), Some("Invalid instance type".to_string()));
    }

    #[test]
    fn test_call_args_out_parameters() {
        let args = CallArgs::new(vec![json!(1), json!(2)], None, None, None);
        args.set_value(1, json!("updated"));

        assert_eq!(args.dirty_slots(), vec![(1, json!("updated"))]);
        assert_eq!(args.value(1), Some(json!("updated")));
        assert_eq!(args.value(0), Some(json!(1)));
    }

    #[test]
    fn test_callback_resolution_requires_placeholder_and_sink() {
        let (tx, _rx) = sink();
        let args = CallArgs::new(
            vec![json!("__f__cb-1"), json!("plain")],
            Some(tx),
            Some("d/h/c1/reply".to_string()),
            None,
        );

        let callback = args.callback(0).unwrap();
        assert_eq!(callback.id(), "cb-1");
        assert!(args.callback(1).is_none());

        let without_sink = CallArgs::new(vec![json!("__f__cb-1")], None, None, None);
        assert!(without_sink.callback(0).is_none());
    }

    #[test]
    fn test_callback_invocation_emits_envelope() {
        let (tx, mut rx) = sink();
        let callback = Callback::new("cb-9", Some("d/h/c1/reply".to_string()), tx);
        callback.invoke(vec![json!(1), json!("two")]);

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.id.as_deref(), Some("cb-9"));
        assert_eq!(envelope.sender.as_deref(), Some("d/h/c1/reply"));
        assert_eq!(envelope.data.get("_1"), Some(&json!(1)));
        assert_eq!(envelope.data.get("_2"), Some(&json!("two")));
    }

    #[test]
    fn test_event_hub_attach_emit_detach() {
        let (tx, mut rx) = sink();
        let hub = EventHub::default();

        hub.attach("d/h/c1", "changed", Callback::new("cb-1", None, tx.clone()));
        hub.attach("d/h/c2", "changed", Callback::new("cb-2", None, tx.clone()));
        hub.attach("d/h/c1", "other", Callback::new("cb-3", None, tx));

        hub.emit("changed", vec![json!(5)]);
        let ids: Vec<_> = [rx.try_recv().unwrap(), rx.try_recv().unwrap()]
            .iter()
            .map(|e| e.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["cb-1", "cb-2"]);
        assert!(rx.try_recv().is_err());

        assert_eq!(hub.detach_client("d/h/c1"), 2);
        hub.emit("changed", vec![json!(6)]);
        assert_eq!(rx.try_recv().unwrap().id.as_deref(), Some("cb-2"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_hub_replaces_duplicate_subscription() {
        let (tx, mut rx) = sink();
        let hub = EventHub::default();

        hub.attach("d/h/c1", "changed", Callback::new("cb-1", None, tx.clone()));
        hub.attach("d/h/c1", "changed", Callback::new("cb-1", None, tx));
        assert_eq!(hub.subscriptions().len(), 1);

        hub.emit("changed", vec![]);
        rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
