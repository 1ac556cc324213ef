//! Deterministic cache keys for commands
//!
//! The hash covers everything that can change a command's result: the connection it
//! runs on, its text, every bound parameter in position order, and the policy salt.
//! Owner context and dependency tags travel with the key but are not hashed.

use crate::cache::types::{CacheKey, DependencyTag};
use crate::policy::CachePolicy;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

/// Escape backslash, double quote and line breaks so a hashed field cannot run into
/// the next one
fn escape_field(text: &str) -> Cow<'_, str> {
    if !text.contains(|c: char| matches!(c, '\\' | '"' | '\n' | '\r')) {
        return Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Value bound to a command parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Null => write!(f, "null"),
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(x) => write!(f, "{}", x),
            ParameterValue::Text(s) => write!(f, "{}", s),
            ParameterValue::Bytes(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            ParameterValue::Timestamp(ts) => {
                write!(f, "{}", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

impl ParameterValue {
    /// Name of the variant, hashed alongside the value
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Null => "Null",
            ParameterValue::Bool(_) => "Bool",
            ParameterValue::Int(_) => "Int",
            ParameterValue::Float(_) => "Float",
            ParameterValue::Text(_) => "Text",
            ParameterValue::Bytes(_) => "Bytes",
            ParameterValue::Timestamp(_) => "Timestamp",
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(value.into())
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

impl From<Vec<u8>> for ParameterValue {
    fn from(value: Vec<u8>) -> Self {
        ParameterValue::Bytes(value)
    }
}

impl From<DateTime<Utc>> for ParameterValue {
    fn from(value: DateTime<Utc>) -> Self {
        ParameterValue::Timestamp(value)
    }
}

impl<T: Into<ParameterValue>> From<Option<T>> for ParameterValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ParameterValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl fmt::Display for ParameterDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterDirection::Input => write!(f, "Input"),
            ParameterDirection::Output => write!(f, "Output"),
            ParameterDirection::InputOutput => write!(f, "InputOutput"),
            ParameterDirection::ReturnValue => write!(f, "ReturnValue"),
        }
    }
}

/// A bound command parameter as the database layer describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParameter {
    pub name: String,
    pub value: ParameterValue,
    pub size: i32,
    pub precision: u8,
    pub scale: u8,
    pub direction: ParameterDirection,
}

impl CommandParameter {
    /// An input parameter with zero size, precision and scale
    pub fn input(name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            size: 0,
            precision: 0,
            scale: 0,
            direction: ParameterDirection::Input,
        }
    }

    pub fn with_size(mut self, size: i32) -> Self {
        self.size = size;
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Line hashed into the key for this parameter.
    ///
    /// `Null` is written bare; every other value is quoted and escaped, and the
    /// variant name follows, so `Text("null")` and `Int(1)` vs `Text("1")` differ.
    pub fn descriptor(&self) -> String {
        let value = match &self.value {
            ParameterValue::Null => "null".to_string(),
            other => format!("\"{}\"", escape_field(&other.to_string())),
        };
        format!(
            "{}={},type={},size={},precision={},scale={},direction={}",
            escape_field(&self.name),
            value,
            self.value.type_name(),
            self.size,
            self.precision,
            self.scale,
            self.direction
        )
    }
}

/// Builder for command cache keys
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    command_text: String,
    connection_identity: String,
    parameters: Vec<CommandParameter>,
    owner_context: String,
    salt_key: String,
    dependencies: BTreeSet<DependencyTag>,
    hash_prefix: Option<String>,
}

impl CacheKeyBuilder {
    /// Create a new cache key builder for a command
    pub fn new(command_text: impl Into<String>) -> Self {
        Self {
            command_text: command_text.into(),
            ..Default::default()
        }
    }

    /// Set the connection identity (typically the connection string)
    pub fn connection(mut self, identity: impl Into<String>) -> Self {
        self.connection_identity = identity.into();
        self
    }

    /// Append a bound parameter
    pub fn parameter(mut self, parameter: CommandParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameters(mut self, parameters: impl IntoIterator<Item = CommandParameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn owner_context(mut self, owner: impl Into<String>) -> Self {
        self.owner_context = owner.into();
        self
    }

    /// Take the salt key from a policy
    pub fn policy(mut self, policy: &CachePolicy) -> Self {
        self.salt_key = policy.salt_key().to_string();
        self
    }

    pub fn salt_key(mut self, salt: impl Into<String>) -> Self {
        self.salt_key = salt.into();
        self
    }

    /// Attach the tags the key is indexed under (not hashed)
    pub fn dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn hash_prefix(mut self, prefix: Option<impl Into<String>>) -> Self {
        self.hash_prefix = prefix.map(Into::into);
        self
    }

    /// Build the cache key. Fields are escaped before they are newline-joined, so
    /// no field can imitate the boundary of another.
    pub fn build(self) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(escape_field(&self.connection_identity).as_bytes());
        hasher.update(b"\n");
        hasher.update(escape_field(&self.command_text).as_bytes());
        for parameter in &self.parameters {
            hasher.update(b"\n");
            hasher.update(parameter.descriptor().as_bytes());
        }
        hasher.update(b"\n");
        hasher.update(escape_field(&self.salt_key).as_bytes());

        let digest = hex::encode(hasher.finalize());
        let hash = match self.hash_prefix {
            Some(prefix) => format!("{}{}", prefix, digest),
            None => digest,
        };

        CacheKey {
            hash,
            owner_context: self.owner_context,
            dependencies: self.dependencies,
        }
    }
}

/// Build a key in one call
pub fn build_key(
    command_text: &str,
    parameters: &[CommandParameter],
    connection_identity: &str,
    owner_context: &str,
    policy: &CachePolicy,
    dependencies: BTreeSet<DependencyTag>,
    hash_prefix: Option<&str>,
) -> CacheKey {
    CacheKeyBuilder::new(command_text)
        .connection(connection_identity)
        .parameters(parameters.iter().cloned())
        .owner_context(owner_context)
        .policy(policy)
        .dependencies(dependencies)
        .hash_prefix(hash_prefix)
        .build()
}
