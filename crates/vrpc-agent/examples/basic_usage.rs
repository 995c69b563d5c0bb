//! Basic usage example for the VRPC agent
//!
//! Registers a small key/value class and serves it over a local broker.
//! Remote clients can then create instances, call their methods and
//! subscribe to their events through the broker alone.
//!
//! Run against a local MQTT broker:
//!
//! ```sh
//! cargo run --example basic_usage -- mqtt://localhost:1883
//! ```

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use vrpc_agent::{AgentOptions, ClassBuilder, EventHub, Ret, VrpcAgent};

struct KeyValueStore {
    entries: Mutex<HashMap<String, Value>>,
    events: EventHub,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mqtt://localhost:1883".to_string());

    let class = ClassBuilder::<KeyValueStore>::new("KeyValueStore")
        .constructor(|args| {
            Ok(KeyValueStore {
                entries: Mutex::new(HashMap::new()),
                events: args.events().ok_or("missing event hub")?,
            })
        })
        .member("set", |obj, args| {
            let key = args
                .value(0)
                .and_then(|v| v.as_str().map(String::from))
                .ok_or("Expected key as first argument")?;
            let value = args.value(1).unwrap_or(Value::Null);
            obj.entries.lock().unwrap().insert(key.clone(), value.clone());
            obj.events.emit("set", vec![json!(key), value]);
            Ok(Ret::Value(Value::Bool(true)))
        })
        .member("get", |obj, args| {
            let key = args
                .value(0)
                .and_then(|v| v.as_str().map(String::from))
                .ok_or("Expected key as first argument")?;
            let value = obj.entries.lock().unwrap().get(&key).cloned();
            Ok(Ret::Value(value.unwrap_or(Value::Null)))
        })
        .member("keys", |obj, _| {
            let mut keys: Vec<String> = obj.entries.lock().unwrap().keys().cloned().collect();
            keys.sort();
            Ok(Ret::Value(json!(keys)))
        })
        .event("onSet", "set")
        .meta(
            "set",
            "Stores a value under a key and notifies subscribers",
            vec![("key", "string"), ("value", "any")],
            "boolean",
        )
        .build();

    let options = AgentOptions::new("public.vrpc", "kv-agent")?
        .with_broker(broker)
        .with_version(env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut agent = VrpcAgent::new(options);
        agent.register(class);

        let handle = agent.handle();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = handle.end(Default::default()).await;
        });

        agent.serve().await
    })?;
    Ok(())
}
