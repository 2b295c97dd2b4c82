use serde::Serialize;
use std::{
    fmt::{self, Debug, Display, Formatter, Write},
    hash::{Hash, Hasher},
};

pub mod encoding;
pub mod members;

pub use encoding::{decode, decode_method_encoding, decode_property_attributes};

/// A decoded type encoding.
///
/// Descriptors are immutable once built and compare structurally by their
/// canonical encoding, so `l` and `i` (both 32-bit signed) are the same type.
#[derive(Clone, Serialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum TypeDescriptor {
    Void,
    Bool,
    Integer { bits: u8, signed: bool },
    Float { bits: u8 },
    CString,
    /// `@`, optionally with the class name hint of `@"NSString"`.
    ObjectRef { class_hint: Option<String> },
    ClassRef,
    SelectorRef,
    Block,
    Struct(Aggregate),
    Union(Aggregate),
    Array { element: Box<TypeDescriptor>, length: usize },
    Pointer(Box<TypeDescriptor>),
    /// `bN`, only meaningful as a struct or union field.
    BitField { width: u8 },
    Unknown(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Aggregate {
    /// `None` for the anonymous `?` tag.
    pub name: Option<String>,
    /// `None` when the encoding only names the aggregate (`{CGRect}`).
    pub fields: Option<Vec<Field>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Field {
    pub name: Option<String>,
    pub ty: TypeDescriptor,
}

impl Field {
    /// The name host aggregates use for this field: the declared name, or
    /// `_field_<index>` when the encoding leaves it out.
    pub fn host_name(&self, index: usize) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("_field_{index}"),
        }
    }
}

impl Aggregate {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("?")
    }

    pub fn is_opaque(&self) -> bool {
        self.fields.is_none()
    }

    pub fn fields(&self) -> &[Field] {
        self.fields.as_deref().unwrap_or(&[])
    }

    fn encode_into(&self, out: &mut String, open: char, close: char) {
        out.push(open);
        out.push_str(self.display_name());
        if let Some(fields) = &self.fields {
            out.push('=');
            for f in fields {
                if let Some(n) = &f.name {
                    let _ = write!(out, "\"{n}\"");
                }
                f.ty.encode_into(out);
            }
        }
        out.push(close);
    }
}

/// The variant of a [`TypeDescriptor`] without its payload; used to key the
/// marshaller's codec registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TypeTag {
    Void,
    Bool,
    Integer,
    Float,
    CString,
    ObjectRef,
    ClassRef,
    SelectorRef,
    Block,
    Struct,
    Union,
    Array,
    Pointer,
    BitField,
    Unknown,
}

impl TypeDescriptor {
    pub const fn int(bits: u8) -> Self {
        TypeDescriptor::Integer { bits, signed: true }
    }

    pub const fn uint(bits: u8) -> Self {
        TypeDescriptor::Integer {
            bits,
            signed: false,
        }
    }

    pub const fn object() -> Self {
        TypeDescriptor::ObjectRef { class_hint: None }
    }

    pub fn object_of(class: impl Into<String>) -> Self {
        TypeDescriptor::ObjectRef {
            class_hint: Some(class.into()),
        }
    }

    pub fn tag(&self) -> TypeTag {
        match self {
            TypeDescriptor::Void => TypeTag::Void,
            TypeDescriptor::Bool => TypeTag::Bool,
            TypeDescriptor::Integer { .. } => TypeTag::Integer,
            TypeDescriptor::Float { .. } => TypeTag::Float,
            TypeDescriptor::CString => TypeTag::CString,
            TypeDescriptor::ObjectRef { .. } => TypeTag::ObjectRef,
            TypeDescriptor::ClassRef => TypeTag::ClassRef,
            TypeDescriptor::SelectorRef => TypeTag::SelectorRef,
            TypeDescriptor::Block => TypeTag::Block,
            TypeDescriptor::Struct(_) => TypeTag::Struct,
            TypeDescriptor::Union(_) => TypeTag::Union,
            TypeDescriptor::Array { .. } => TypeTag::Array,
            TypeDescriptor::Pointer(_) => TypeTag::Pointer,
            TypeDescriptor::BitField { .. } => TypeTag::BitField,
            TypeDescriptor::Unknown(_) => TypeTag::Unknown,
        }
    }

    /// Whether values of this type are foreign object identities.
    pub fn is_object_like(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::ObjectRef { .. } | TypeDescriptor::ClassRef | TypeDescriptor::Block
        )
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, TypeDescriptor::Struct(_) | TypeDescriptor::Union(_))
    }

    /// The canonical encoding of this descriptor.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut String) {
        match self {
            TypeDescriptor::Void => out.push('v'),
            TypeDescriptor::Bool => out.push('B'),
            TypeDescriptor::Integer { bits, signed } => out.push(match (*bits, *signed) {
                (8, true) => 'c',
                (8, false) => 'C',
                (16, true) => 's',
                (16, false) => 'S',
                (32, true) => 'i',
                (32, false) => 'I',
                (_, true) => 'q',
                (_, false) => 'Q',
            }),
            TypeDescriptor::Float { bits: 32 } => out.push('f'),
            TypeDescriptor::Float { .. } => out.push('d'),
            TypeDescriptor::CString => out.push('*'),
            TypeDescriptor::ObjectRef { class_hint: None } => out.push('@'),
            TypeDescriptor::ObjectRef {
                class_hint: Some(c),
            } => {
                let _ = write!(out, "@\"{c}\"");
            }
            TypeDescriptor::ClassRef => out.push('#'),
            TypeDescriptor::SelectorRef => out.push(':'),
            TypeDescriptor::Block => out.push_str("@?"),
            TypeDescriptor::Struct(a) => a.encode_into(out, '{', '}'),
            TypeDescriptor::Union(a) => a.encode_into(out, '(', ')'),
            TypeDescriptor::Array { element, length } => {
                let _ = write!(out, "[{length}");
                element.encode_into(out);
                out.push(']');
            }
            TypeDescriptor::Pointer(p) => {
                out.push('^');
                p.encode_into(out);
            }
            TypeDescriptor::BitField { width } => {
                let _ = write!(out, "b{width}");
            }
            TypeDescriptor::Unknown(raw) => out.push_str(raw),
        }
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

impl Eq for TypeDescriptor {}

impl Hash for TypeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encode().hash(state);
    }
}

impl Display for TypeDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Debug for TypeDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Void => write!(f, "void"),
            TypeDescriptor::Bool => write!(f, "bool"),
            TypeDescriptor::Integer { bits, signed: true } => write!(f, "i{bits}"),
            TypeDescriptor::Integer {
                bits,
                signed: false,
            } => write!(f, "u{bits}"),
            TypeDescriptor::Float { bits } => write!(f, "f{bits}"),
            TypeDescriptor::CString => write!(f, "char*"),
            TypeDescriptor::ObjectRef { class_hint: None } => write!(f, "id"),
            TypeDescriptor::ObjectRef {
                class_hint: Some(c),
            } => write!(f, "{c}*"),
            TypeDescriptor::ClassRef => write!(f, "Class"),
            TypeDescriptor::SelectorRef => write!(f, "SEL"),
            TypeDescriptor::Block => write!(f, "block"),
            TypeDescriptor::Struct(a) | TypeDescriptor::Union(a) => {
                let keyword = if matches!(self, TypeDescriptor::Struct(_)) {
                    "struct"
                } else {
                    "union"
                };
                write!(f, "{keyword} {}", a.display_name())?;
                if let Some(fields) = &a.fields {
                    write!(f, " {{ ")?;
                    for (i, field) in fields.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}: {:?}", field.host_name(i), field.ty)?;
                    }
                    write!(f, " }}")?;
                }
                Ok(())
            }
            TypeDescriptor::Array { element, length } => write!(f, "[{element:?}; {length}]"),
            TypeDescriptor::Pointer(p) => write!(f, "*{p:?}"),
            TypeDescriptor::BitField { width } => write!(f, "u32:{width}"),
            TypeDescriptor::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_canonical() {
        let point = TypeDescriptor::Struct(Aggregate {
            name: Some("CGPoint".into()),
            fields: Some(vec![
                Field {
                    name: None,
                    ty: TypeDescriptor::Float { bits: 64 },
                },
                Field {
                    name: None,
                    ty: TypeDescriptor::Float { bits: 64 },
                },
            ]),
        });
        assert_eq!(point.encode(), "{CGPoint=dd}");
        assert_eq!(
            TypeDescriptor::Pointer(Box::new(point)).to_string(),
            "^{CGPoint=dd}"
        );
        assert_eq!(TypeDescriptor::object_of("NSString").encode(), "@\"NSString\"");
        assert_eq!(TypeDescriptor::Block.encode(), "@?");
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(TypeDescriptor::int(32), TypeDescriptor::int(32));
        assert_ne!(TypeDescriptor::int(32), TypeDescriptor::uint(32));
        assert_ne!(TypeDescriptor::object(), TypeDescriptor::object_of("NSArray"));
    }

    #[test]
    fn test_unnamed_field_host_name() {
        let f = Field {
            name: None,
            ty: TypeDescriptor::Bool,
        };
        assert_eq!(f.host_name(2), "_field_2");
    }

    #[test]
    fn test_debug_output() {
        let arr = TypeDescriptor::Array {
            element: Box::new(TypeDescriptor::uint(8)),
            length: 4,
        };
        assert_eq!(format!("{arr:?}"), "[u8; 4]");
    }
}
