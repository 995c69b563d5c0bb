//! RPC envelope and the reserved wire vocabulary
//!
//! Every message between clients and agents is an [`Envelope`]: a JSON
//! dictionary carrying a call context, a method name, positional arguments
//! under the keys `_1, _2, …` and, after dispatch, a return value under `r`
//! or an error string under `e`.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved method name: construct an anonymous instance
pub const CREATE: &str = "__create__";

/// Reserved method name: construct or fetch a named instance
pub const CREATE_NAMED: &str = "__createNamed__";

/// Reserved method name: look up a named instance
pub const GET_NAMED: &str = "__getNamed__";

/// Reserved method name: destroy an instance
pub const DELETE: &str = "__delete__";

/// Reserved method name: invoke a method on every instance of a class
pub const CALL_ALL: &str = "__callAll__";

/// Data key carrying the return value after dispatch
pub const RETURN_KEY: &str = "r";

/// Data key carrying the error string after a failed dispatch
pub const ERROR_KEY: &str = "e";

/// Tag prefix identifying a callback placeholder argument
pub const CALLBACK_PREFIX: &str = "__f__";

/// Tag prefix identifying a promise placeholder
pub const PROMISE_PREFIX: &str = "__p__";

/// Sentinel substituted for a return value that failed to serialize
pub const NOT_SERIALIZABLE: &str = "__vrpc::not-serializable__";

/// A single RPC message, in either direction.
///
/// Unknown top-level keys survive a parse/serialize round trip untouched;
/// the agent replies by mutating `data` and publishing the envelope back
/// verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Class name (static calls and creation) or instance identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,

    /// Method name, possibly one of the reserved lifecycle names
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// Positional arguments `_1..=_N`, plus `r`/`e` after dispatch
    #[serde(default)]
    pub data: Map<String, Value>,

    /// Reply topic chosen by the caller; treated as opaque
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Opaque correlation identifier chosen by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Top-level keys this implementation does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope for a callback or promise emission.
    ///
    /// The arguments are laid out positionally under `_1..=_N`; the `id`
    /// correlates the emission with the placeholder the caller supplied.
    pub fn emission(id: impl Into<String>, sender: Option<String>, args: Vec<Value>) -> Self {
        let mut data = Map::new();
        for (i, arg) in args.into_iter().enumerate() {
            data.insert(format!("_{}", i + 1), arg);
        }
        Self {
            data,
            sender,
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Parse an envelope from its UTF-8 JSON wire form.
    pub fn from_json(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serialize the envelope to its UTF-8 JSON wire form.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize, substituting an unserializable return value.
    ///
    /// A reply must always reach the caller; if the return value under `r`
    /// cannot be serialized it is replaced with [`NOT_SERIALIZABLE`] and
    /// serialization is retried.
    pub fn to_json_lossy(&self) -> Result<String, ProtocolError> {
        match self.to_json() {
            Ok(json) => Ok(json),
            Err(_) => {
                let mut fallback = self.clone();
                fallback
                    .data
                    .insert(RETURN_KEY.to_string(), Value::String(NOT_SERIALIZABLE.to_string()));
                fallback.to_json()
            }
        }
    }

    /// Extract the positional arguments `_1, _2, …` in order.
    ///
    /// Extraction stops at the first missing index.
    pub fn args(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for n in 1usize.. {
            match self.data.get(&format!("_{}", n)) {
                Some(value) => out.push(value.clone()),
                None => break,
            }
        }
        out
    }

    /// Overwrite the positional argument slot `_<n>` (1-based).
    pub fn set_arg(&mut self, n: usize, value: Value) {
        self.data.insert(format!("_{}", n), value);
    }

    /// Place a return value under `r`, clearing any previous error.
    pub fn set_return(&mut self, value: Value) {
        self.data.remove(ERROR_KEY);
        self.data.insert(RETURN_KEY.to_string(), value);
    }

    /// Place an error string under `e`, clearing any previous return value.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.data.remove(RETURN_KEY);
        self.data
            .insert(ERROR_KEY.to_string(), Value::String(message.into()));
    }

    /// The return value placed by dispatch, if any.
    pub fn return_value(&self) -> Option<&Value> {
        self.data.get(RETURN_KEY)
    }

    /// The error string placed by dispatch, if any.
    pub fn error(&self) -> Option<&str> {
        self.data.get(ERROR_KEY).and_then(Value::as_str)
    }

    /// Whether the reserved lifecycle names contain `method`.
    pub fn is_lifecycle_method(method: &str) -> bool {
        matches!(method, CREATE | CREATE_NAMED | GET_NAMED | DELETE | CALL_ALL)
    }
}

/// Extract the correlation id from a placeholder argument.
///
/// A string value tagged `__f__<id>` or `__p__<id>` yields `<id>`; anything
/// else is a literal argument.
pub fn placeholder_id(value: &Value) -> Option<&str> {
    let s = value.as_str()?;
    s.strip_prefix(CALLBACK_PREFIX)
        .or_else(|| s.strip_prefix(PROMISE_PREFIX))
}

/// Build the promise tag for a deferred return value.
pub fn promise_tag(n: u64) -> String {
    format!("{}{}", PROMISE_PREFIX, n)
}

/// Whether a value carries a promise tag.
pub fn is_promise_tag(value: &Value) -> bool {
    value
        .as_str()
        .map(|s| s.starts_with(PROMISE_PREFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_args_are_positional_and_ordered() {
        let mut envelope = Envelope::default();
        envelope.set_arg(2, json!("second"));
        envelope.set_arg(1, json!("first"));
        envelope.set_arg(3, json!(3));

        assert_eq!(envelope.args(), vec![json!("first"), json!("second"), json!(3)]);
    }

    #[test]
    fn test_args_stop_at_first_gap() {
        let mut envelope = Envelope::default();
        envelope.set_arg(1, json!(true));
        envelope.set_arg(3, json!("unreachable"));

        assert_eq!(envelope.args(), vec![json!(true)]);
    }

    #[test]
    fn test_return_and_error_are_exclusive() {
        let mut envelope = Envelope::default();

        envelope.set_return(json!(42));
        assert_eq!(envelope.return_value(), Some(&json!(42)));
        assert_eq!(envelope.error(), None);

        envelope.set_error("boom");
        assert_eq!(envelope.return_value(), None);
        assert_eq!(envelope.error(), Some("boom"));

        envelope.set_return(json!("ok"));
        assert_eq!(envelope.return_value(), Some(&json!("ok")));
        assert_eq!(envelope.error(), None);
    }

    #[test]
    fn test_round_trip_preserves_unknown_keys() {
        let wire = r#"{"context":"TestClass","method":"__create__","data":{"_1":"x"},"sender":"a/b/c/reply","id":"7","encoding":"json"}"#;
        let envelope = Envelope::from_json(wire.as_bytes()).unwrap();

        assert_eq!(envelope.context, "TestClass");
        assert_eq!(envelope.extra.get("encoding"), Some(&json!("json")));

        let reparsed = Envelope::from_json(envelope.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(envelope, reparsed);
    }

    #[test]
    fn test_placeholder_id_strips_either_prefix() {
        assert_eq!(placeholder_id(&json!("__f__cb-1")), Some("cb-1"));
        assert_eq!(placeholder_id(&json!("__p__42")), Some("42"));
        assert_eq!(placeholder_id(&json!("plain string")), None);
        assert_eq!(placeholder_id(&json!(17)), None);
    }

    #[test]
    fn test_promise_tag_round_trip() {
        let tag = promise_tag(9);
        assert_eq!(tag, "__p__9");
        assert!(is_promise_tag(&Value::String(tag)));
        assert!(!is_promise_tag(&json!("__f__9")));
    }

    #[test]
    fn test_emission_layout() {
        let envelope = Envelope::emission("cb-1", Some("s4".to_string()), vec![json!(1), json!("two")]);

        assert_eq!(envelope.id.as_deref(), Some("cb-1"));
        assert_eq!(envelope.sender.as_deref(), Some("s4"));
        assert_eq!(envelope.data.get("_1"), Some(&json!(1)));
        assert_eq!(envelope.data.get("_2"), Some(&json!("two")));
        assert!(envelope.context.is_empty());
    }

    #[test]
    fn test_lifecycle_method_names() {
        for name in [CREATE, CREATE_NAMED, GET_NAMED, DELETE, CALL_ALL] {
            assert!(Envelope::is_lifecycle_method(name));
        }
        assert!(!Envelope::is_lifecycle_method("hasEntry"));
    }

    proptest! {
        #[test]
        fn test_round_trip_properties(
            context in "[a-zA-Z0-9]{1,12}",
            method in "[a-zA-Z0-9_]{1,16}",
            sender in prop::option::of("[a-z/]{1,20}"),
            id in prop::option::of("[a-z0-9-]{1,12}"),
            args in prop::collection::vec(
                prop_oneof![
                    Just(Value::Null),
                    any::<bool>().prop_map(Value::from),
                    any::<i32>().prop_map(Value::from),
                    "[a-zA-Z ]{0,24}".prop_map(Value::from),
                ],
                0..5,
            ),
        ) {
            let mut envelope = Envelope {
                context,
                method,
                sender,
                id,
                ..Default::default()
            };
            for (i, arg) in args.iter().enumerate() {
                envelope.set_arg(i + 1, arg.clone());
            }

            let reparsed = Envelope::from_json(envelope.to_json().unwrap().as_bytes()).unwrap();
            prop_assert_eq!(&envelope, &reparsed);
            prop_assert_eq!(envelope.args(), args);
        }
    }
}
