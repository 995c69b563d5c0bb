//! Integration tests driving the public adapter surface the way a broker
//! session does: envelopes in, mutated envelopes out, emissions on the
//! callback channel.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use vrpc_agent::{Adapter, CallArgs, ClassBuilder, ClassDescriptor, Ret};
use vrpc_proto::Envelope;

struct Registry {
    entries: Mutex<HashMap<String, Value>>,
}

fn registry_class() -> ClassDescriptor {
    ClassBuilder::<Registry>::new("Registry")
        .constructor(|_: &CallArgs| {
            Ok(Registry {
                entries: Mutex::new(HashMap::new()),
            })
        })
        .member("put", |obj, args| {
            let key = args
                .value(0)
                .and_then(|v| v.as_str().map(String::from))
                .ok_or("Expected key as first argument")?;
            obj.entries
                .lock()
                .unwrap()
                .insert(key, args.value(1).unwrap_or(Value::Null));
            Ok(Ret::Value(Value::Bool(true)))
        })
        .member("size", |obj, _| {
            Ok(Ret::Value(json!(obj.entries.lock().unwrap().len())))
        })
        .member("computeLater", |_, args| {
            let delay = args.value(0).and_then(|v| v.as_u64()).unwrap_or(1);
            Ok(Ret::Deferred(Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                Ok(json!(delay * 2))
            })))
        })
        .static_fn("version", |_| Ok(Ret::Value(json!("1.0"))))
        .build()
}

fn call(adapter: &mut Adapter, context: &str, method: &str, args: Vec<Value>) -> Envelope {
    let mut envelope = Envelope {
        context: context.to_string(),
        method: method.to_string(),
        sender: Some("itest.vrpc/host/client/reply".to_string()),
        ..Default::default()
    };
    for (i, arg) in args.into_iter().enumerate() {
        envelope.set_arg(i + 1, arg);
    }
    adapter.call(&mut envelope);
    envelope
}

#[test]
fn full_instance_lifecycle() {
    let mut adapter = Adapter::new();
    adapter.register(registry_class());
    assert_eq!(adapter.get_available_classes(), vec!["Registry"]);

    // anonymous instance
    let reply = call(&mut adapter, "Registry", "__create__", vec![]);
    let id = reply.return_value().unwrap().as_str().unwrap().to_string();
    assert_eq!(adapter.get_available_instances("Registry"), vec![id.clone()]);

    // named instance alongside it
    let reply = call(&mut adapter, "Registry", "__createNamed__", vec![json!("shared")]);
    assert_eq!(reply.return_value(), Some(&json!("shared")));

    let reply = call(&mut adapter, &id, "put", vec![json!("a"), json!(1)]);
    assert_eq!(reply.return_value(), Some(&Value::Bool(true)));
    let reply = call(&mut adapter, "shared", "size", vec![]);
    assert_eq!(reply.return_value(), Some(&json!(0)));

    // static dispatch goes through the class context
    let reply = call(&mut adapter, "Registry", "version", vec![]);
    assert_eq!(reply.return_value(), Some(&json!("1.0")));

    // deletion makes the context unreachable
    let reply = call(&mut adapter, "Registry", "__delete__", vec![json!(id.clone())]);
    assert_eq!(reply.return_value(), Some(&Value::Bool(true)));
    let reply = call(&mut adapter, &id, "size", vec![]);
    assert_eq!(
        reply.error(),
        Some(format!("Could not find context: {}", id).as_str())
    );
    assert_eq!(adapter.get_available_instances("Registry"), vec!["shared"]);
}

#[test]
fn every_reply_carries_result_or_error() {
    let mut adapter = Adapter::new();
    adapter.register(registry_class());
    let probes = vec![
        ("Registry", "__create__", vec![]),
        ("Registry", "__createNamed__", vec![json!("x")]),
        ("Registry", "__createNamed__", vec![]),
        ("Registry", "__getNamed__", vec![json!("x")]),
        ("Registry", "__getNamed__", vec![json!("missing")]),
        ("Registry", "__delete__", vec![json!("x")]),
        ("Registry", "__callAll__", vec![json!("size")]),
        ("Registry", "version", vec![]),
        ("Registry", "unknown", vec![]),
        ("Missing", "anything", vec![]),
        ("no-such-instance", "size", vec![]),
    ];
    for (context, method, args) in probes {
        let reply = call(&mut adapter, context, method, args);
        assert!(
            reply.return_value().is_some() != reply.error().is_some(),
            "{}/{} must set exactly one of r and e: {:?}",
            context,
            method,
            reply.data
        );
    }
}

#[test]
fn call_all_aggregates_per_instance_results() {
    let mut adapter = Adapter::new();
    adapter.register(registry_class());
    call(&mut adapter, "Registry", "__createNamed__", vec![json!("first")]);
    call(&mut adapter, "Registry", "__createNamed__", vec![json!("second")]);
    call(&mut adapter, "first", "put", vec![json!("k"), json!(true)]);

    let reply = call(&mut adapter, "Registry", "__callAll__", vec![json!("size")]);
    assert_eq!(
        reply.return_value(),
        Some(&json!([
            { "id": "first", "val": 1 },
            { "id": "second", "val": 0 },
        ]))
    );
}

#[tokio::test]
async fn deferred_results_resolve_through_the_callback_channel() {
    let mut adapter = Adapter::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter.on_callback(tx);
    adapter.register(registry_class());

    let reply = call(&mut adapter, "Registry", "__createNamed__", vec![json!("worker")]);
    assert_eq!(reply.return_value(), Some(&json!("worker")));

    let reply = call(&mut adapter, "worker", "computeLater", vec![json!(3)]);
    let tag = reply.return_value().unwrap().as_str().unwrap().to_string();
    assert!(tag.starts_with("__p__"));

    let emission = rx.recv().await.expect("deferred result must be emitted");
    assert_eq!(emission.id.as_deref(), Some(tag.as_str()));
    assert_eq!(emission.return_value(), Some(&json!(6)));
    assert_eq!(
        emission.sender.as_deref(),
        Some("itest.vrpc/host/client/reply")
    );
}

#[test]
fn envelope_wire_round_trip_matches_dispatch_expectations() {
    let wire = br#"{"context":"Registry","method":"put","data":{"_1":"k","_2":[1,2,3]},"sender":"itest.vrpc/host/client/reply","id":"42"}"#;
    let envelope = Envelope::from_json(wire).unwrap();
    assert_eq!(envelope.args(), vec![json!("k"), json!([1, 2, 3])]);

    let mut adapter = Adapter::new();
    adapter.register(registry_class());
    call(&mut adapter, "Registry", "__createNamed__", vec![json!("r")]);

    let mut envelope = envelope;
    envelope.context = "r".to_string();
    adapter.call(&mut envelope);

    let reparsed = Envelope::from_json(envelope.to_json().unwrap().as_bytes()).unwrap();
    assert_eq!(reparsed, envelope);
    assert_eq!(reparsed.return_value(), Some(&Value::Bool(true)));
    assert_eq!(reparsed.id.as_deref(), Some("42"));
}
