//! Parser for the runtime's textual type encodings.
//!
//! The grammar is read left to right in a single pass without backtracking.
//! Codes this parser does not know degrade to [`TypeDescriptor::Unknown`] so
//! newer runtimes never make decoding fail outright; only structural
//! characters in a leading position are errors.

use super::{
    members::{MethodSignature, PropertyAttributes, SignatureOrigin},
    Aggregate, Field, TypeDescriptor,
};
use crate::error::DecodeError;

const QUALIFIERS: &[u8] = b"rnNoORVAj";

/// Decode a complete type encoding. Trailing input is an error.
pub fn decode(encoding: &str) -> Result<TypeDescriptor, DecodeError> {
    if encoding.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut p = Parser::new(encoding);
    let ty = p.parse_type(false)?;
    if !p.at_end() {
        return Err(p.unexpected());
    }
    Ok(ty)
}

/// Decode a method encoding such as `v24@0:8@16`, dropping the receiver and
/// selector slots, and check that exactly `arg_count` arguments remain.
pub fn decode_method_encoding(
    full_encoding: &str,
    arg_count: usize,
) -> Result<MethodSignature, DecodeError> {
    if full_encoding.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut p = Parser::new(full_encoding);
    let return_type = p.parse_type(false)?;
    p.skip_offset();

    let mut slots = vec![];
    while !p.at_end() {
        slots.push(p.parse_type(false)?);
        p.skip_offset();
    }

    if slots.len() < 2 {
        return Err(DecodeError::MissingImplicitSlots(full_encoding.to_string()));
    }
    let arguments = slots.split_off(2);
    if arguments.len() != arg_count {
        return Err(DecodeError::ArgumentCount {
            encoding: full_encoding.to_string(),
            expected: arg_count,
            found: arguments.len(),
        });
    }

    Ok(MethodSignature {
        arguments,
        return_type,
        variadic: false,
        origin: SignatureOrigin::Declared,
    })
}

/// Decode a property attribute string. The leading `T<type>` attribute is
/// mandatory; unrecognised attribute letters are ignored.
pub fn decode_property_attributes(attributes: &str) -> Result<PropertyAttributes, DecodeError> {
    let invalid = || DecodeError::PropertyAttributes(attributes.to_string());

    let Some(rest) = attributes.strip_prefix('T') else {
        return Err(invalid());
    };
    let mut p = Parser::new(rest);
    let ty = p.parse_type(false).map_err(|_| invalid())?;
    let tail = &rest[p.pos..];
    let tail = match tail.strip_prefix(',') {
        Some(t) => t,
        None if tail.is_empty() => "",
        None => return Err(invalid()),
    };

    let mut out = PropertyAttributes::of_type(ty);
    for attr in tail.split(',').filter(|a| !a.is_empty()) {
        let value = attr.get(1..).unwrap_or("");
        match attr.as_bytes()[0] {
            b'R' => out.readonly = true,
            b'C' => out.copy = true,
            b'&' => out.retain = true,
            b'W' => out.weak = true,
            b'N' => out.nonatomic = true,
            b'D' => out.dynamic = true,
            b'G' => out.getter = Some(value.to_string()),
            b'S' => out.setter = Some(value.to_string()),
            b'V' => out.ivar = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(out)
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn truncated(&self) -> DecodeError {
        DecodeError::Truncated {
            encoding: self.src.to_string(),
            offset: self.pos,
        }
    }

    fn unexpected(&self) -> DecodeError {
        DecodeError::Unexpected {
            encoding: self.src.to_string(),
            offset: self.pos,
            found: self
                .src
                .get(self.pos..)
                .and_then(|s| s.chars().next())
                .unwrap_or('\0'),
        }
    }

    fn next(&mut self) -> Result<u8, DecodeError> {
        let c = self.peek().ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(c)
    }

    fn expect(&mut self, c: u8) -> Result<(), DecodeError> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(self.unexpected()),
            None => Err(self.truncated()),
        }
    }

    fn number(&mut self) -> Option<usize> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        self.src[start..self.pos].parse().ok()
    }

    /// Stack offsets in method encodings, optionally signed.
    fn skip_offset(&mut self) {
        if matches!(self.peek(), Some(b'+' | b'-'))
            && matches!(self.peek_at(1), Some(b'0'..=b'9'))
        {
            self.pos += 1;
        }
        self.number();
    }

    /// Text up to the next `"`, consuming both quotes.
    fn quoted(&mut self) -> Result<&'a str, DecodeError> {
        self.expect(b'"')?;
        let start = self.pos;
        match self.src[start..].find('"') {
            Some(len) => {
                self.pos = start + len + 1;
                Ok(&self.src[start..start + len])
            }
            None => {
                self.pos = self.bytes.len();
                Err(self.truncated())
            }
        }
    }

    fn parse_type(&mut self, named_fields: bool) -> Result<TypeDescriptor, DecodeError> {
        while matches!(self.peek(), Some(c) if QUALIFIERS.contains(&c)) {
            self.pos += 1;
        }

        let start = self.pos;
        let c = self.next()?;
        let ty = match c {
            b'c' => TypeDescriptor::int(8),
            b'C' => TypeDescriptor::uint(8),
            b's' => TypeDescriptor::int(16),
            b'S' => TypeDescriptor::uint(16),
            b'i' | b'l' => TypeDescriptor::int(32),
            b'I' | b'L' => TypeDescriptor::uint(32),
            b'q' => TypeDescriptor::int(64),
            b'Q' => TypeDescriptor::uint(64),
            b'f' => TypeDescriptor::Float { bits: 32 },
            b'd' => TypeDescriptor::Float { bits: 64 },
            b'B' => TypeDescriptor::Bool,
            b'v' => TypeDescriptor::Void,
            b'*' => TypeDescriptor::CString,
            b'#' => TypeDescriptor::ClassRef,
            b':' => TypeDescriptor::SelectorRef,
            b'?' => TypeDescriptor::Unknown("?".into()),
            b'@' => self.parse_object(named_fields)?,
            b'^' => TypeDescriptor::Pointer(Box::new(self.parse_type(false)?)),
            b'[' => {
                let Some(length) = self.number() else {
                    return Err(if self.at_end() {
                        self.truncated()
                    } else {
                        self.unexpected()
                    });
                };
                let element = self.parse_type(false)?;
                self.expect(b']')?;
                TypeDescriptor::Array {
                    element: Box::new(element),
                    length,
                }
            }
            b'{' => TypeDescriptor::Struct(self.parse_aggregate(b'}')?),
            b'(' => TypeDescriptor::Union(self.parse_aggregate(b')')?),
            b'b' => {
                let digits = self.pos;
                match self.number().map(u8::try_from) {
                    Some(Ok(width)) => TypeDescriptor::BitField { width },
                    Some(Err(_)) => {
                        self.pos = digits;
                        return Err(self.unexpected());
                    }
                    None if self.at_end() => return Err(self.truncated()),
                    None => return Err(self.unexpected()),
                }
            }
            b'}' | b']' | b')' | b'"' | b'=' | b',' | b'0'..=b'9' => {
                self.pos = start;
                return Err(self.unexpected());
            }
            _ => {
                // Keep whole UTF-8 sequences together.
                let ch = self.src[start..].chars().next().unwrap_or('?');
                self.pos = start + ch.len_utf8();
                TypeDescriptor::Unknown(ch.to_string())
            }
        };
        Ok(ty)
    }

    fn parse_object(&mut self, named_fields: bool) -> Result<TypeDescriptor, DecodeError> {
        match self.peek() {
            Some(b'?') => {
                self.pos += 1;
                if self.peek() == Some(b'<') {
                    self.skip_block_signature()?;
                }
                Ok(TypeDescriptor::Block)
            }
            Some(b'"') => {
                if named_fields && !self.quoted_is_class_hint() {
                    return Ok(TypeDescriptor::object());
                }
                let class = self.quoted()?;
                Ok(TypeDescriptor::object_of(class))
            }
            _ => Ok(TypeDescriptor::object()),
        }
    }

    /// Inside a struct with named fields `@"X"` is ambiguous: the quoted
    /// text is a class hint only when another field name or the closing
    /// delimiter follows it.
    fn quoted_is_class_hint(&self) -> bool {
        let rest = &self.src[self.pos + 1..];
        match rest.find('"') {
            Some(len) => matches!(
                rest.as_bytes().get(len + 1),
                None | Some(b'"' | b'}' | b')')
            ),
            None => true,
        }
    }

    fn skip_block_signature(&mut self) -> Result<(), DecodeError> {
        let mut depth = 0usize;
        loop {
            match self.next()? {
                b'<' => depth += 1,
                b'>' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    fn parse_aggregate(&mut self, close: u8) -> Result<Aggregate, DecodeError> {
        let start = self.pos;
        loop {
            match self.peek() {
                None => return Err(self.truncated()),
                Some(b'=') => break,
                Some(c) if c == close => break,
                Some(_) => self.pos += 1,
            }
        }
        let name = match &self.src[start..self.pos] {
            "?" | "" => None,
            n => Some(n.to_string()),
        };

        if self.peek() == Some(close) {
            self.pos += 1;
            return Ok(Aggregate { name, fields: None });
        }

        self.expect(b'=')?;
        let mut fields = vec![];
        let named = self.peek() == Some(b'"');
        loop {
            match self.peek() {
                None => return Err(self.truncated()),
                Some(c) if c == close => {
                    self.pos += 1;
                    break;
                }
                Some(b'"') => {
                    let field_name = self.quoted()?.to_string();
                    let ty = self.parse_type(true)?;
                    fields.push(Field {
                        name: Some(field_name),
                        ty,
                    });
                }
                Some(_) => {
                    let ty = self.parse_type(named)?;
                    fields.push(Field { name: None, ty });
                }
            }
        }

        Ok(Aggregate {
            name,
            fields: Some(fields),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> TypeDescriptor {
        decode("{CGPoint=dd}").unwrap()
    }

    #[test]
    fn test_primitives() {
        assert_eq!(decode("i").unwrap(), TypeDescriptor::int(32));
        assert_eq!(decode("Q").unwrap(), TypeDescriptor::uint(64));
        assert_eq!(decode("l").unwrap(), TypeDescriptor::int(32));
        assert_eq!(decode("d").unwrap(), TypeDescriptor::Float { bits: 64 });
        assert_eq!(decode("B").unwrap(), TypeDescriptor::Bool);
        assert_eq!(decode("*").unwrap(), TypeDescriptor::CString);
        assert_eq!(decode("#").unwrap(), TypeDescriptor::ClassRef);
        assert_eq!(decode(":").unwrap(), TypeDescriptor::SelectorRef);
        assert_eq!(decode("v").unwrap(), TypeDescriptor::Void);
    }

    #[test]
    fn test_objects_and_blocks() {
        assert_eq!(decode("@").unwrap(), TypeDescriptor::object());
        assert_eq!(
            decode("@\"NSString\"").unwrap(),
            TypeDescriptor::object_of("NSString")
        );
        assert_eq!(decode("@?").unwrap(), TypeDescriptor::Block);
        assert_eq!(decode("@?<v@?@>").unwrap(), TypeDescriptor::Block);
    }

    #[test]
    fn test_qualifiers_are_skipped() {
        assert_eq!(
            decode("r*").unwrap(),
            TypeDescriptor::CString,
        );
        assert_eq!(
            decode("Vv").unwrap(),
            TypeDescriptor::Void,
        );
        assert_eq!(
            decode("^r^{CGPoint=dd}").unwrap().encode(),
            "^^{CGPoint=dd}"
        );
    }

    #[test]
    fn test_struct_fields() {
        let TypeDescriptor::Struct(agg) = point() else {
            panic!("expected struct");
        };
        assert_eq!(agg.name.as_deref(), Some("CGPoint"));
        assert_eq!(agg.fields().len(), 2);

        let rect = decode("{CGRect={CGPoint=dd}{CGSize=dd}}").unwrap();
        let TypeDescriptor::Struct(agg) = &rect else {
            panic!("expected struct");
        };
        assert_eq!(agg.fields()[0].ty, point());
    }

    #[test]
    fn test_named_fields_and_class_hint_ambiguity() {
        let ty = decode("{Pair=\"first\"@\"second\"i}").unwrap();
        let TypeDescriptor::Struct(agg) = &ty else {
            panic!("expected struct");
        };
        assert_eq!(agg.fields()[0].name.as_deref(), Some("first"));
        assert_eq!(agg.fields()[0].ty, TypeDescriptor::object());
        assert_eq!(agg.fields()[1].name.as_deref(), Some("second"));

        let ty = decode("{Box=\"value\"@\"NSString\"}").unwrap();
        let TypeDescriptor::Struct(agg) = &ty else {
            panic!("expected struct");
        };
        assert_eq!(agg.fields()[0].ty, TypeDescriptor::object_of("NSString"));

        let ty = decode("{Two=\"a\"@\"NSString\"\"b\"i}").unwrap();
        let TypeDescriptor::Struct(agg) = &ty else {
            panic!("expected struct");
        };
        assert_eq!(agg.fields()[0].ty, TypeDescriptor::object_of("NSString"));
        assert_eq!(agg.fields()[1].ty, TypeDescriptor::int(32));
    }

    #[test]
    fn test_opaque_and_anonymous_aggregates() {
        let TypeDescriptor::Struct(agg) = decode("{__CFString}").unwrap() else {
            panic!("expected struct");
        };
        assert!(agg.is_opaque());

        let TypeDescriptor::Union(agg) = decode("(?=iq)").unwrap() else {
            panic!("expected union");
        };
        assert_eq!(agg.name, None);
        assert_eq!(agg.fields().len(), 2);
    }

    #[test]
    fn test_arrays_pointers_bitfields() {
        assert_eq!(
            decode("[4i]").unwrap(),
            TypeDescriptor::Array {
                element: Box::new(TypeDescriptor::int(32)),
                length: 4
            }
        );
        assert_eq!(
            decode("^?").unwrap(),
            TypeDescriptor::Pointer(Box::new(TypeDescriptor::Unknown("?".into())))
        );
        assert_eq!(decode("b3").unwrap(), TypeDescriptor::BitField { width: 3 });
        assert_eq!(decode("{F=b1b7}").unwrap().encode(), "{F=b1b7}");
        assert!(matches!(decode("b300"), Err(DecodeError::Unexpected { offset: 1, .. })));
    }

    #[test]
    fn test_unknown_codes_degrade() {
        assert_eq!(decode("Z").unwrap(), TypeDescriptor::Unknown("Z".into()));
        assert_eq!(
            decode("^Z").unwrap(),
            TypeDescriptor::Pointer(Box::new(TypeDescriptor::Unknown("Z".into())))
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(""), Err(DecodeError::Empty));
        assert!(matches!(decode("{CGPoint=dd"), Err(DecodeError::Truncated { .. })));
        assert!(matches!(decode("^"), Err(DecodeError::Truncated { .. })));
        assert!(matches!(decode("[4"), Err(DecodeError::Truncated { .. })));
        assert!(matches!(
            decode("}"),
            Err(DecodeError::Unexpected { found: '}', .. })
        ));
        assert!(matches!(
            decode("ii"),
            Err(DecodeError::Unexpected { offset: 1, .. })
        ));
        assert!(matches!(decode("@\"NSStr"), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_idempotent() {
        for e in ["{CGRect={CGPoint=dd}{CGSize=dd}}", "^@", "(u=iq)", "[2^v]"] {
            assert_eq!(decode(e).unwrap(), decode(e).unwrap());
            assert_eq!(decode(e).unwrap().encode(), e);
        }
    }

    #[test]
    fn test_method_encoding() {
        let sig = decode_method_encoding("v24@0:8@16", 1).unwrap();
        assert_eq!(sig.arguments, vec![TypeDescriptor::object()]);
        assert_eq!(sig.return_type, TypeDescriptor::Void);
        assert_eq!(sig.origin, SignatureOrigin::Declared);

        let sig = decode_method_encoding("{CGPoint=dd}40@0:8{CGPoint=dd}16", 1).unwrap();
        assert_eq!(sig.return_type, point());

        let sig = decode_method_encoding("q@:", 0).unwrap();
        assert!(sig.arguments.is_empty());

        let sig = decode_method_encoding("Vv20@0:4i-8", 1).unwrap();
        assert_eq!(sig.arguments, vec![TypeDescriptor::int(32)]);
    }

    #[test]
    fn test_method_encoding_length_invariant() {
        for (e, n) in [("v@:", 0), ("v@:i", 1), ("@32@0:8@16:24", 2), ("d@:dd{CGPoint=dd}", 3)] {
            assert_eq!(decode_method_encoding(e, n).unwrap().arguments.len(), n);
        }
    }

    #[test]
    fn test_method_encoding_errors() {
        assert!(matches!(
            decode_method_encoding("v24@0:8@16", 2),
            Err(DecodeError::ArgumentCount {
                expected: 2,
                found: 1,
                ..
            })
        ));
        assert!(matches!(
            decode_method_encoding("v@", 0),
            Err(DecodeError::MissingImplicitSlots(_))
        ));
        assert_eq!(decode_method_encoding("", 0), Err(DecodeError::Empty));
    }

    #[test]
    fn test_property_attributes() {
        let attrs = decode_property_attributes("T@\"NSString\",&,N,V_name").unwrap();
        assert_eq!(attrs.ty, TypeDescriptor::object_of("NSString"));
        assert!(attrs.retain);
        assert!(attrs.nonatomic);
        assert!(!attrs.readonly);
        assert_eq!(attrs.ivar.as_deref(), Some("_name"));

        let attrs = decode_property_attributes("Tc,R,GisHidden").unwrap();
        assert!(attrs.readonly);
        assert_eq!(attrs.getter.as_deref(), Some("isHidden"));

        let attrs = decode_property_attributes("T{CGPoint=dd},SmoveTo:").unwrap();
        assert_eq!(attrs.ty, point());
        assert_eq!(attrs.setter.as_deref(), Some("moveTo:"));

        assert!(matches!(
            decode_property_attributes("R,N"),
            Err(DecodeError::PropertyAttributes(_))
        ));
    }
}
