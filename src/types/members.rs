use super::TypeDescriptor;
use serde::Serialize;
use std::fmt::{self, Debug, Formatter};

/// Where a [`MethodSignature`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SignatureOrigin {
    /// Decoded from a method encoding found in runtime metadata.
    Declared,
    /// Synthesized because no declaration was found.
    Fallback,
    /// Supplied by the caller.
    Override,
}

/// Host-visible call signature of a method. The receiver and selector slots
/// are implied and never listed in `arguments`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MethodSignature {
    pub arguments: Vec<TypeDescriptor>,
    pub return_type: TypeDescriptor,
    pub variadic: bool,
    pub origin: SignatureOrigin,
}

impl MethodSignature {
    pub fn new(arguments: Vec<TypeDescriptor>, return_type: TypeDescriptor) -> Self {
        Self {
            arguments,
            return_type,
            variadic: false,
            origin: SignatureOrigin::Override,
        }
    }

    /// Every argument and the return typed as a plain object reference.
    pub fn generic(arity: usize) -> Self {
        Self {
            arguments: vec![TypeDescriptor::object(); arity],
            return_type: TypeDescriptor::object(),
            variadic: false,
            origin: SignatureOrigin::Fallback,
        }
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn arity(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_fallback(&self) -> bool {
        self.origin == SignatureOrigin::Fallback
    }

    /// Method encoding of this signature without stack offsets, e.g. `v@:q`.
    pub fn encode(&self) -> String {
        let mut out = self.return_type.encode();
        out.push_str("@:");
        for a in &self.arguments {
            out.push_str(&a.encode());
        }
        out
    }
}

impl Debug for MethodSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, a) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{a:?}")?;
        }
        if self.variadic {
            if !self.arguments.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ") -> {:?}", self.return_type)?;
        if self.origin != SignatureOrigin::Declared {
            write!(f, " [{:?}]", self.origin)?;
        }
        Ok(())
    }
}

/// Decoded property attribute string (`T@"NSString",&,N,V_name`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PropertyAttributes {
    pub ty: TypeDescriptor,
    pub readonly: bool,
    pub copy: bool,
    pub retain: bool,
    pub weak: bool,
    pub nonatomic: bool,
    pub dynamic: bool,
    pub getter: Option<String>,
    pub setter: Option<String>,
    pub ivar: Option<String>,
}

impl PropertyAttributes {
    pub fn of_type(ty: TypeDescriptor) -> Self {
        Self {
            ty,
            readonly: false,
            copy: false,
            retain: false,
            weak: false,
            nonatomic: false,
            dynamic: false,
            getter: None,
            setter: None,
            ivar: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PropertyDescription {
    pub name: String,
    pub attributes: PropertyAttributes,
}

impl PropertyDescription {
    pub fn ty(&self) -> &TypeDescriptor {
        &self.attributes.ty
    }

    pub fn is_readonly(&self) -> bool {
        self.attributes.readonly
    }

    pub fn getter(&self) -> String {
        self.attributes
            .getter
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    /// `None` for read-only properties.
    pub fn setter(&self) -> Option<String> {
        if self.attributes.readonly {
            return None;
        }
        if let Some(s) = &self.attributes.setter {
            return Some(s.clone());
        }
        let mut chars = self.name.chars();
        let first = chars.next()?;
        Some(format!(
            "set{}{}:",
            first.to_uppercase(),
            chars.as_str()
        ))
    }

    pub fn getter_signature(&self) -> MethodSignature {
        MethodSignature::new(vec![], self.ty().clone())
    }

    pub fn setter_signature(&self) -> MethodSignature {
        MethodSignature::new(vec![self.ty().clone()], TypeDescriptor::Void)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IvarDescription {
    pub name: String,
    pub ty: TypeDescriptor,
    pub offset: isize,
}
