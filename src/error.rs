use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty type encoding")]
    Empty,
    #[error("type encoding {encoding:?} ends inside a token at offset {offset}")]
    Truncated { encoding: String, offset: usize },
    #[error("unexpected {found:?} at offset {offset} in type encoding {encoding:?}")]
    Unexpected {
        encoding: String,
        offset: usize,
        found: char,
    },
    #[error("method encoding {encoding:?} declares {found} arguments, expected {expected}")]
    ArgumentCount {
        encoding: String,
        expected: usize,
        found: usize,
    },
    #[error("method encoding {0:?} is missing the receiver and selector slots")]
    MissingImplicitSlots(String),
    #[error("invalid property attribute string {0:?}")]
    PropertyAttributes(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Class,
    Protocol,
    Method,
    Property,
    Ivar,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Class => "class",
            EntityKind::Protocol => "protocol",
            EntityKind::Method => "method",
            EntityKind::Property => "property",
            EntityKind::Ivar => "ivar",
        })
    }
}

/// An exception raised inside the foreign runtime while a call was running.
/// Carried through opaquely; the bridge never interprets it.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignException {
    pub name: String,
    pub reason: String,
    pub address: Option<usize>,
}

impl fmt::Display for ForeignException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("type decoding failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("{kind} not found: {name}")]
    NotFound { kind: EntityKind, name: String },

    #[error("value {value} is out of range for {target}")]
    ArgumentRange { value: String, target: String },

    #[error("field mismatch for {type_name}: {detail}")]
    FieldMismatch { type_name: String, detail: String },

    #[error("string conversion failed: {0}")]
    Encoding(String),

    #[error("cannot convert {found} to {expected}")]
    TypeMismatch { expected: String, found: String },

    #[error("{target} has no member named {name:?}")]
    NoSuchMember { target: String, name: String },

    #[error("selector {selector:?} takes {expected} arguments, {found} given")]
    ArgumentCount {
        selector: String,
        expected: usize,
        found: usize,
    },

    #[error("property {0:?} is read-only")]
    ReadonlyProperty(String),

    #[error("{target} does not respond to selector {selector:?}")]
    DoesNotRespond { target: String, selector: String },

    #[error("no declared signature for {selector:?} on {class}")]
    NoSignature { class: String, selector: String },

    #[error("marshalling not supported for {0}")]
    Unsupported(String),

    #[error("{class} may only be messaged from its owning thread")]
    WrongThread { class: String },

    #[error("foreign exception: {0}")]
    ForeignException(ForeignException),

    #[error("failed to load the foreign runtime: {0}")]
    RuntimeLoad(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        BridgeError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound { .. })
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
