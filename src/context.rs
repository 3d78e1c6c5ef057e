//! Context builder.
//!
//! Resolves caller arguments against the declared parameter schema and
//! assembles the `ctx` object handed to `handler(ctx)`:
//!
//! ```text
//! ctx = { args: {...}, secrets: {...}, user: {...} | null }
//! ```
//!
//! Everything here runs in the Building phase. A rejection means no code
//! is ever run for the request.

use crate::error::SandboxError;
use crate::sanitize::check_key;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const DEFAULT_TIME_ZONE: &str = "America/New_York";

/// Declared type of a function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Number,
    Boolean,
}

/// One entry of a function's declared parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgumentType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ArgumentSpec {
    pub fn new(name: impl Into<String>, arg_type: ArgumentType) -> Self {
        Self {
            name: name.into(),
            arg_type,
            required: false,
            default_value: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A resolved argument value. Objects and arrays never get this far.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

impl ArgumentValue {
    /// Coerce `value` to the declared type.
    pub fn coerce(value: &Value, arg_type: ArgumentType) -> Result<Self, String> {
        match (arg_type, value) {
            (ArgumentType::String, Value::String(s)) => Ok(Self::String(s.clone())),
            (ArgumentType::String, Value::Number(n)) => Ok(Self::String(n.to_string())),
            (ArgumentType::String, Value::Bool(b)) => Ok(Self::String(b.to_string())),

            (ArgumentType::Number, Value::Number(n)) => n
                .as_f64()
                .map(Self::Number)
                .ok_or_else(|| format!("{n} is not a representable number")),
            (ArgumentType::Number, Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(Self::Number(n)),
                _ => Err(format!("'{s}' is not a number")),
            },

            (ArgumentType::Boolean, Value::Bool(b)) => Ok(Self::Boolean(*b)),
            (ArgumentType::Boolean, Value::String(s)) => match s.trim() {
                "true" | "1" => Ok(Self::Boolean(true)),
                "false" | "0" => Ok(Self::Boolean(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            (ArgumentType::Boolean, Value::Number(n)) => match n.as_f64() {
                Some(v) if v == 1.0 => Ok(Self::Boolean(true)),
                Some(v) if v == 0.0 => Ok(Self::Boolean(false)),
                _ => Err(format!("{n} is not a boolean")),
            },

            (_, other) => Err(format!("expected {arg_type:?}, got {}", json_kind(other))),
        }
    }

    /// Type an undeclared argument from its JSON shape.
    pub fn infer(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Bool(b) => Ok(Self::Boolean(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(Self::Number)
                .ok_or_else(|| format!("{n} is not a representable number")),
            other => Err(format!(
                "undeclared arguments must be primitives, got {}",
                json_kind(other)
            )),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `null`, `""` and absent all mean "not supplied".
fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// An OAuth connection of the calling user.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredential {
    pub service: String,
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl fmt::Debug for OAuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("service", &self.service)
            .field("is_default", &self.is_default)
            .finish_non_exhaustive()
    }
}

/// Fixed-shape secrets record exposed as `ctx.secrets`.
///
/// `Debug` prints names only.
#[derive(Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SecretSet(BTreeMap<String, String>);

impl SecretSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SandboxError> {
        let name = name.into();
        check_key(&name).map_err(SandboxError::Validation)?;
        self.0.insert(name, value.into());
        Ok(())
    }

    /// Derive the secrets of a user from their OAuth connections and
    /// environment variables.
    ///
    /// Each credential yields `<PREFIX>_ACCESS_TOKEN`, `<PREFIX>_ID_TOKEN` and
    /// `<PREFIX>_EMAIL_ADDRESS`, where the prefix is the service name split
    /// on non-alphanumerics, joined with `_` and upper-cased. Per service the
    /// default credential wins, otherwise the first one. Environment
    /// variables are applied last.
    pub fn for_user<I, K, V>(oauth: &[OAuthCredential], env_vars: I) -> Result<Self, SandboxError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut secrets = Self::new();

        for credential in oauth {
            let prefix = service_prefix(&credential.service);
            if prefix.is_empty() {
                continue;
            }
            let access_key = format!("{prefix}_ACCESS_TOKEN");
            if !credential.is_default && secrets.0.contains_key(&access_key) {
                continue;
            }
            secrets.insert(access_key, credential.access_token.clone())?;
            secrets.insert(
                format!("{prefix}_ID_TOKEN"),
                credential.id_token.clone().unwrap_or_default(),
            )?;
            secrets.insert(
                format!("{prefix}_EMAIL_ADDRESS"),
                credential.email_address.clone().unwrap_or_default(),
            )?;
        }

        for (name, value) in env_vars {
            secrets.insert(name, value)?;
        }

        Ok(secrets)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

fn service_prefix(service: &str) -> String {
    service
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
        .to_ascii_uppercase()
}

/// Non-secret profile fields of the calling user, exposed as `ctx.user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl UserProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time_zone: default_time_zone(),
        }
    }
}

fn default_time_zone() -> String {
    DEFAULT_TIME_ZONE.to_string()
}

/// Input to one sandbox run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub code: String,
    pub declared_arguments: Vec<ArgumentSpec>,
    pub supplied_arguments: Map<String, Value>,
    pub secrets: SecretSet,
    pub user: Option<UserProfile>,
    /// Overrides the configured execution timeout for this request.
    pub timeout: Option<Duration>,
    /// Correlates the analytics report with the caller's own records.
    pub operation_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn declare(mut self, spec: ArgumentSpec) -> Self {
        self.declared_arguments.push(spec);
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.supplied_arguments.insert(name.into(), value.into());
        self
    }

    pub fn secrets(mut self, secrets: SecretSet) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }
}

/// The `ctx` object of one execution. Never shared between requests.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxContext {
    pub args: BTreeMap<String, ArgumentValue>,
    pub secrets: SecretSet,
    pub user: Option<UserProfile>,
}

impl SandboxContext {
    pub fn to_json(&self) -> Result<String, SandboxError> {
        serde_json::to_string(self).map_err(|e| SandboxError::Runtime(e.into()))
    }
}

/// Resolve and validate the arguments of `request` and assemble its context.
pub fn build_context(request: &ExecutionRequest) -> Result<SandboxContext, SandboxError> {
    let mut args = BTreeMap::new();

    for spec in &request.declared_arguments {
        check_key(&spec.name).map_err(SandboxError::Validation)?;

        let supplied = request.supplied_arguments.get(&spec.name);
        let value = if !is_missing(supplied) {
            supplied
        } else if !is_missing(spec.default_value.as_ref()) {
            spec.default_value.as_ref()
        } else {
            None
        };

        match value {
            Some(value) => {
                let resolved = ArgumentValue::coerce(value, spec.arg_type).map_err(|e| {
                    SandboxError::Validation(format!("Invalid argument '{}': {e}", spec.name))
                })?;
                args.insert(spec.name.clone(), resolved);
            }
            None if spec.required => {
                return Err(SandboxError::Validation(format!(
                    "Missing required argument: {}",
                    spec.name
                )));
            }
            None => {}
        }
    }

    for (name, value) in &request.supplied_arguments {
        if args.contains_key(name)
            || request.declared_arguments.iter().any(|s| &s.name == name)
        {
            continue;
        }
        check_key(name).map_err(SandboxError::Validation)?;
        if value.is_null() {
            continue;
        }
        let resolved = ArgumentValue::infer(value)
            .map_err(|e| SandboxError::Validation(format!("Invalid argument '{name}': {e}")))?;
        args.insert(name.clone(), resolved);
    }

    Ok(SandboxContext {
        args,
        secrets: request.secrets.clone(),
        user: request.user.clone(),
    })
}
