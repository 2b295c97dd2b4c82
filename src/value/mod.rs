use crate::proxy::{InstanceProxy, ProxyHandle};
use std::fmt;

pub mod boxing;
pub mod layout;
pub mod marshal;
pub mod object;
pub mod slot;
pub mod string;

pub use marshal::Marshaller;
pub use object::{ObjectHandle, Ownership};
pub use slot::ForeignSlot;

/// A value on the host side of the bridge.
#[derive(Clone)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// A selector by name.
    Selector(String),
    /// A raw address, for pointer-typed slots.
    Pointer(usize),
    Object(ProxyHandle),
    /// Named fields in declaration order.
    Struct(Vec<(String, HostValue)>),
    List(Vec<HostValue>),
    Set(Vec<HostValue>),
    Dict(Vec<(HostValue, HostValue)>),
}

/// [`HostValue`] variants without payload; keys the boxing adapters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostKind {
    Nil,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Selector,
    Pointer,
    Object,
    Struct,
    List,
    Set,
    Dict,
}

impl HostValue {
    pub fn kind(&self) -> HostKind {
        match self {
            HostValue::Nil => HostKind::Nil,
            HostValue::Bool(_) => HostKind::Bool,
            HostValue::Int(_) | HostValue::UInt(_) => HostKind::Int,
            HostValue::Float(_) => HostKind::Float,
            HostValue::Str(_) => HostKind::Str,
            HostValue::Bytes(_) => HostKind::Bytes,
            HostValue::Selector(_) => HostKind::Selector,
            HostValue::Pointer(_) => HostKind::Pointer,
            HostValue::Object(_) => HostKind::Object,
            HostValue::Struct(_) => HostKind::Struct,
            HostValue::List(_) => HostKind::List,
            HostValue::Set(_) => HostKind::Set,
            HostValue::Dict(_) => HostKind::Dict,
        }
    }

    /// Short name of the variant for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            HostKind::Nil => "nil",
            HostKind::Bool => "bool",
            HostKind::Int => "integer",
            HostKind::Float => "float",
            HostKind::Str => "string",
            HostKind::Bytes => "bytes",
            HostKind::Selector => "selector",
            HostKind::Pointer => "pointer",
            HostKind::Object => "object",
            HostKind::Struct => "struct",
            HostKind::List => "list",
            HostKind::Set => "set",
            HostKind::Dict => "dict",
        }
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        HostValue::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::UInt(u) => i64::try_from(*u).ok(),
            HostValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            HostValue::Int(i) => u64::try_from(*i).ok(),
            HostValue::UInt(u) => Some(*u),
            HostValue::Bool(b) => Some(*b as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ProxyHandle> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceProxy> {
        match self {
            HostValue::Object(ProxyHandle::Instance(i)) => Some(i),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&HostValue> {
        match self {
            HostValue::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        use HostValue::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (UInt(a), UInt(b)) => a == b,
            (Int(a), UInt(b)) | (UInt(b), Int(a)) => u64::try_from(*a).is_ok_and(|a| a == *b),
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Selector(a), Selector(b)) => a == b,
            (Pointer(a), Pointer(b)) => a == b,
            (Object(a), Object(b)) => a.object_ptr() == b.object_ptr(),
            (Struct(a), Struct(b)) => a == b,
            (List(a), List(b)) | (Set(a), Set(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => write!(f, "nil"),
            HostValue::Bool(b) => write!(f, "{b}"),
            HostValue::Int(i) => write!(f, "{i}"),
            HostValue::UInt(u) => write!(f, "{u}u"),
            HostValue::Float(x) => write!(f, "{x:?}"),
            HostValue::Str(s) => write!(f, "{s:?}"),
            HostValue::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            HostValue::Selector(s) => write!(f, "@selector({s})"),
            HostValue::Pointer(p) => write!(f, "{}", crate::utils::format_address(*p)),
            HostValue::Object(o) => write!(f, "{o:?}"),
            HostValue::Struct(fields) => {
                let mut s = f.debug_struct("struct");
                for (name, value) in fields {
                    s.field(name, value);
                }
                s.finish()
            }
            HostValue::List(items) => f.debug_list().entries(items).finish(),
            HostValue::Set(items) => f.debug_set().entries(items).finish(),
            HostValue::Dict(items) => f
                .debug_map()
                .entries(items.iter().map(|(k, v)| (k, v)))
                .finish(),
        }
    }
}

macro_rules! from_int {
    ($variant:ident as $target:ty: $($t:ty),*) => {
        $(impl From<$t> for HostValue {
            fn from(v: $t) -> Self {
                HostValue::$variant(v as $target)
            }
        })*
    };
}

from_int!(Int as i64: i8, i16, i32, i64, isize);
from_int!(UInt as u64: u8, u16, u32, u64, usize);
from_int!(Float as f64: f32, f64);

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Bool(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Str(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        HostValue::Bytes(v)
    }
}

impl From<ProxyHandle> for HostValue {
    fn from(v: ProxyHandle) -> Self {
        HostValue::Object(v)
    }
}

impl From<InstanceProxy> for HostValue {
    fn from(v: InstanceProxy) -> Self {
        HostValue::Object(ProxyHandle::Instance(v))
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(HostValue::Nil, Into::into)
    }
}
