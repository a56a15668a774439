//! The message model: [`Value`] and the wire structures built from it.
//!
//! Everything that crosses the broker is a [`Value::Map`] at the top level.
//! The typed structures ([`JobRequest`], [`JobResponse`], and friends)
//! convert to and from that map form with `to_value` / `from_value`; the
//! serializers only ever see [`Value`]s.

use crate::errors::MalformedMessage;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// A fixed-precision currency amount: ISO 4217 code plus minor units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyAmount {
    /// Uppercase three-letter currency code, e.g. `"USD"`.
    pub code: String,
    /// The amount in the currency's minor unit (cents for USD).
    pub minor: i64,
}

impl CurrencyAmount {
    pub fn new(code: impl Into<String>, minor: i64) -> Self {
        Self { code: code.into().to_uppercase(), minor }
    }
}

/// A self-describing value that can cross the wire.
///
/// Covers JSON-shaped data (null, booleans, 64-bit signed integers, IEEE-754
/// doubles, strings, lists, string-keyed maps) plus the extension types both
/// canonical serializers round-trip: UTC datetimes with microsecond
/// precision, dates, times, string-backed arbitrary-precision decimals,
/// currency amounts, and raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Arbitrary-precision decimal, carried as its canonical string form.
    Decimal(String),
    Currency(CurrencyAmount),
}

impl Value {
    /// An empty map value.
    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Map member lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Whether this value counts as present for expansion purposes: not
    /// null, not `false`, not zero, and not an empty string/list/map.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            _ => true,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<CurrencyAmount> for Value {
    fn from(v: CurrencyAmount) -> Self {
        Value::Currency(v)
    }
}

/// An error in the canonical wire format.
///
/// `code` is a machine-readable uppercase identifier and is always present.
/// `field` marks field-validation errors; `is_caller_error` separates caller
/// faults (bad input, unknown action) from service faults for downstream
/// observability.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub traceback: Option<String>,
    pub variables: Option<BTreeMap<String, String>>,
    pub denied_permissions: Option<Vec<String>>,
    pub is_caller_error: bool,
}

impl Error {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            traceback: None,
            variables: None,
            denied_permissions: None,
            is_caller_error: false,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Marks this error as caused by the caller's input.
    pub fn caller_error(mut self) -> Self {
        self.is_caller_error = true;
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("code".to_owned(), Value::Str(self.code.clone()));
        map.insert("message".to_owned(), Value::Str(self.message.clone()));
        if let Some(field) = &self.field {
            map.insert("field".to_owned(), Value::Str(field.clone()));
        }
        if let Some(traceback) = &self.traceback {
            map.insert("traceback".to_owned(), Value::Str(traceback.clone()));
        }
        if let Some(variables) = &self.variables {
            map.insert(
                "variables".to_owned(),
                Value::Map(
                    variables
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
                        .collect(),
                ),
            );
        }
        if let Some(denied) = &self.denied_permissions {
            map.insert(
                "denied_permissions".to_owned(),
                Value::List(denied.iter().map(|p| Value::Str(p.clone())).collect()),
            );
        }
        map.insert("is_caller_error".to_owned(), Value::Bool(self.is_caller_error));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedMessage> {
        let map = value
            .as_map()
            .ok_or_else(|| MalformedMessage("error entry is not a map".to_owned()))?;
        let code = map
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedMessage("error is missing its code".to_owned()))?;
        let message = map.get("message").and_then(Value::as_str).unwrap_or_default();
        let mut error = Error::new(code, message);
        if let Some(field) = map.get("field").and_then(Value::as_str) {
            error.field = Some(field.to_owned());
        }
        if let Some(traceback) = map.get("traceback").and_then(Value::as_str) {
            error.traceback = Some(traceback.to_owned());
        }
        if let Some(variables) = map.get("variables").and_then(Value::as_map) {
            error.variables = Some(
                variables
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_owned()))
                    .collect(),
            );
        }
        if let Some(denied) = map.get("denied_permissions").and_then(Value::as_list) {
            error.denied_permissions =
                Some(denied.iter().filter_map(|p| p.as_str().map(str::to_owned)).collect());
        }
        error.is_caller_error =
            map.get("is_caller_error").and_then(Value::as_bool).unwrap_or(false);
        Ok(error)
    }
}

/// One named operation on a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub action: String,
    pub body: Value,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, body: Value) -> Self {
        Self { action: action.into(), body }
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("action".to_owned(), Value::Str(self.action.clone()));
        map.insert("body".to_owned(), self.body.clone());
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedMessage> {
        let map = value
            .as_map()
            .ok_or_else(|| MalformedMessage("action request is not a map".to_owned()))?;
        let action = map
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedMessage("action request is missing its action".to_owned()))?;
        let body = map.get("body").cloned().unwrap_or_else(Value::empty_map);
        Ok(Self { action: action.to_owned(), body })
    }
}

/// The result of one action: a body, or errors, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResponse {
    pub action: String,
    /// `Value::Null` when the action failed before producing a body.
    pub body: Value,
    pub errors: Vec<Error>,
}

impl ActionResponse {
    pub fn new(action: impl Into<String>, body: Value) -> Self {
        Self { action: action.into(), body, errors: Vec::new() }
    }

    pub fn from_errors(action: impl Into<String>, errors: Vec<Error>) -> Self {
        Self { action: action.into(), body: Value::Null, errors }
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("action".to_owned(), Value::Str(self.action.clone()));
        map.insert("body".to_owned(), self.body.clone());
        map.insert(
            "errors".to_owned(),
            Value::List(self.errors.iter().map(Error::to_value).collect()),
        );
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedMessage> {
        let map = value
            .as_map()
            .ok_or_else(|| MalformedMessage("action response is not a map".to_owned()))?;
        let action = map
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| MalformedMessage("action response is missing its action".to_owned()))?;
        let body = map.get("body").cloned().unwrap_or(Value::Null);
        let errors = match map.get("errors") {
            Some(Value::List(entries)) => {
                entries.iter().map(Error::from_value).collect::<Result<Vec<_>, _>>()?
            }
            _ => Vec::new(),
        };
        Ok(Self { action: action.to_owned(), body, errors })
    }
}

/// Request context, propagated verbatim to nested calls a server makes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    /// Opaque string linking nested calls in logs; generated by the client
    /// when the caller does not supply one.
    pub correlation_id: String,
    /// The envelope request id, mirrored into the context at send time.
    pub request_id: Option<u64>,
    /// Feature-flag switches, set semantics.
    pub switches: BTreeSet<i64>,
    /// Caller identity and service-defined keys, carried opaquely.
    pub extra: BTreeMap<String, Value>,
}

impl Context {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self { correlation_id: correlation_id.into(), ..Default::default() }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("correlation_id".to_owned(), Value::Str(self.correlation_id.clone()));
        if let Some(request_id) = self.request_id {
            map.insert("request_id".to_owned(), Value::Int(request_id as i64));
        }
        map.insert(
            "switches".to_owned(),
            Value::List(self.switches.iter().map(|s| Value::Int(*s)).collect()),
        );
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedMessage> {
        let map = value
            .as_map()
            .ok_or_else(|| MalformedMessage("context is not a map".to_owned()))?;
        let mut context = Context::default();
        for (key, entry) in map {
            match key.as_str() {
                "correlation_id" => {
                    context.correlation_id =
                        entry.as_str().unwrap_or_default().to_owned();
                }
                "request_id" => context.request_id = entry.as_u64(),
                "switches" => {
                    if let Some(switches) = entry.as_list() {
                        context.switches =
                            switches.iter().filter_map(Value::as_i64).collect();
                    }
                }
                _ => {
                    context.extra.insert(key.clone(), entry.clone());
                }
            }
        }
        Ok(context)
    }
}

/// Per-job control directives.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Control {
    /// Keep executing actions after one returns errors.
    pub continue_on_error: bool,
    /// The server must not enqueue a response.
    pub suppress_response: bool,
    /// Client-requested timeout in seconds, if any.
    pub timeout: Option<u64>,
    pub extra: BTreeMap<String, Value>,
}

impl Control {
    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("continue_on_error".to_owned(), Value::Bool(self.continue_on_error));
        map.insert("suppress_response".to_owned(), Value::Bool(self.suppress_response));
        if let Some(timeout) = self.timeout {
            map.insert("timeout".to_owned(), Value::Int(timeout as i64));
        }
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedMessage> {
        let map = value
            .as_map()
            .ok_or_else(|| MalformedMessage("control is not a map".to_owned()))?;
        let mut control = Control::default();
        for (key, entry) in map {
            match key.as_str() {
                "continue_on_error" => {
                    control.continue_on_error = entry.as_bool().unwrap_or(false);
                }
                "suppress_response" => {
                    control.suppress_response = entry.as_bool().unwrap_or(false);
                }
                "timeout" => control.timeout = entry.as_u64(),
                _ => {
                    control.extra.insert(key.clone(), entry.clone());
                }
            }
        }
        Ok(control)
    }
}

/// An ordered group of actions sent together to one service.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub actions: Vec<ActionRequest>,
    pub context: Context,
    pub control: Control,
}

impl JobRequest {
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "actions".to_owned(),
            Value::List(self.actions.iter().map(ActionRequest::to_value).collect()),
        );
        map.insert("context".to_owned(), self.context.to_value());
        map.insert("control".to_owned(), self.control.to_value());
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedMessage> {
        let map = value
            .as_map()
            .ok_or_else(|| MalformedMessage("job request is not a map".to_owned()))?;
        let actions = match map.get("actions") {
            Some(Value::List(entries)) => entries
                .iter()
                .map(ActionRequest::from_value)
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(MalformedMessage("job request has no actions list".to_owned())),
        };
        let context = match map.get("context") {
            Some(value) => Context::from_value(value)?,
            None => Context::default(),
        };
        let control = match map.get("control") {
            Some(value) => Control::from_value(value)?,
            None => Control::default(),
        };
        Ok(Self { actions, context, control })
    }
}

/// The aggregated result of a job: one response per executed action, plus
/// any job-level errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobResponse {
    pub actions: Vec<ActionResponse>,
    pub context: BTreeMap<String, Value>,
    pub errors: Vec<Error>,
}

impl JobResponse {
    pub fn from_errors(errors: Vec<Error>) -> Self {
        Self { errors, ..Default::default() }
    }

    /// Whether any job-level or action-level errors are present.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.actions.iter().any(|a| !a.errors.is_empty())
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "actions".to_owned(),
            Value::List(self.actions.iter().map(ActionResponse::to_value).collect()),
        );
        map.insert("context".to_owned(), Value::Map(self.context.clone()));
        map.insert(
            "errors".to_owned(),
            Value::List(self.errors.iter().map(Error::to_value).collect()),
        );
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedMessage> {
        let map = value
            .as_map()
            .ok_or_else(|| MalformedMessage("job response is not a map".to_owned()))?;
        let actions = match map.get("actions") {
            Some(Value::List(entries)) => entries
                .iter()
                .map(ActionResponse::from_value)
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let context = match map.get("context") {
            Some(Value::Map(context)) => context.clone(),
            _ => BTreeMap::new(),
        };
        let errors = match map.get("errors") {
            Some(Value::List(entries)) => {
                entries.iter().map(Error::from_value).collect::<Result<Vec<_>, _>>()?
            }
            _ => Vec::new(),
        };
        Ok(Self { actions, context, errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vlist, vmap};

    #[test]
    fn test_value_accessors() {
        let value = vmap! { "n" => 7, "s" => "text", "flag" => true };
        assert_eq!(value.get("n").and_then(Value::as_i64), Some(7));
        assert_eq!(value.get("s").and_then(Value::as_str), Some("text"));
        assert_eq!(value.get("flag").and_then(Value::as_bool), Some(true));
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(3).is_truthy());
        assert!(vlist![1].is_truthy());
        assert!(!vlist![].is_truthy());
    }

    #[test]
    fn test_error_round_trip_with_all_fields() {
        let error = Error::new("INVALID", "number must not be negative")
            .with_field("number")
            .with_traceback("at square()")
            .with_variables(BTreeMap::from([("number".to_owned(), "-1".to_owned())]))
            .caller_error();
        let decoded = Error::from_value(&error.to_value()).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn test_error_requires_code() {
        let value = vmap! { "message" => "no code here" };
        assert!(Error::from_value(&value).is_err());
    }

    #[test]
    fn test_job_request_round_trip() {
        let request = JobRequest {
            actions: vec![
                ActionRequest::new("square", vmap! { "number" => 7 }),
                ActionRequest::new("echo", vmap! { "text" => "hello" }),
            ],
            context: Context {
                correlation_id: "abc".to_owned(),
                request_id: Some(41),
                switches: BTreeSet::from([1, 5]),
                extra: BTreeMap::from([("caller".to_owned(), Value::Str("tests".to_owned()))]),
            },
            control: Control {
                continue_on_error: true,
                suppress_response: false,
                timeout: Some(10),
                extra: BTreeMap::new(),
            },
        };
        let decoded = JobRequest::from_value(&request.to_value()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_job_request_without_actions_is_malformed() {
        assert!(JobRequest::from_value(&vmap! { "context" => vmap! {} }).is_err());
    }

    #[test]
    fn test_job_response_round_trip_preserves_action_order() {
        let response = JobResponse {
            actions: vec![
                ActionResponse::new("square", vmap! { "square" => 9 }),
                ActionResponse::from_errors(
                    "square",
                    vec![Error::new("INVALID", "negative").with_field("number").caller_error()],
                ),
            ],
            context: BTreeMap::from([(
                "correlation_id".to_owned(),
                Value::Str("abc".to_owned()),
            )]),
            errors: Vec::new(),
        };
        let decoded = JobResponse::from_value(&response.to_value()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.actions[0].action, "square");
        assert!(decoded.actions[1].body.is_null());
        assert!(decoded.has_errors());
    }

    #[test]
    fn test_context_extra_keys_survive() {
        let context = Context {
            correlation_id: "xyz".to_owned(),
            request_id: None,
            switches: BTreeSet::new(),
            extra: BTreeMap::from([("tenant".to_owned(), Value::Str("acme".to_owned()))]),
        };
        let decoded = Context::from_value(&context.to_value()).unwrap();
        assert_eq!(decoded.extra.get("tenant").and_then(Value::as_str), Some("acme"));
    }
}
