//! Conversion between [`HostValue`]s and the bytes of foreign call slots.
//!
//! Each [`TypeTag`] maps to one codec. Codecs write into a byte range sized
//! by the type's layout, so aggregates recurse by handing each field its own
//! sub-range. Host memory a slot points at (C strings, byte buffers, boxed
//! objects) is recorded as an [`Anchor`] and kept alive by the slot.

use super::{
    boxing::{BoxingRegistry, ObjectAdapter},
    layout::{type_layout, BitFieldLayout, HasLayout, LayoutManager},
    object::{ObjectHandle, Ownership},
    slot::{read_pointer, write_pointer, Anchor, ForeignSlot},
    string::{bytes_to_c_string, from_c_string, to_c_string},
    HostKind, HostValue,
};
use crate::{
    bridge::Bridge,
    error::{BridgeError, Result},
    metrics::{CacheCounters, CacheStat},
    proxy::{InstanceProxy, ProxyHandle},
    runtime::{ObjPtr, ObjectKind, SelPtr},
    types::{Aggregate, TypeDescriptor, TypeTag},
};
use dashmap::DashMap;
use enum_dispatch::enum_dispatch;
use parking_lot::RwLock;
use std::{collections::HashMap, ffi::c_char, mem::size_of, sync::Arc};
use tracing::trace;

/// How a decoded value relates to the memory it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeMode {
    /// Ownership to adopt for a top-level object reference.
    pub ownership: Ownership,
    /// Read object-like members as raw addresses. Used for union members,
    /// where at most one of the overlapping interpretations is meaningful.
    pub passive: bool,
}

impl DecodeMode {
    pub fn new(ownership: Ownership) -> Self {
        Self {
            ownership,
            passive: false,
        }
    }

    fn nested(self) -> Self {
        Self {
            ownership: Ownership::Borrowed,
            ..self
        }
    }
}

fn mismatch(expected: &TypeDescriptor, found: &HostValue) -> BridgeError {
    BridgeError::TypeMismatch {
        expected: expected.to_string(),
        found: found.kind_name().to_string(),
    }
}

#[enum_dispatch]
pub trait SlotCodec {
    fn encode(
        &self,
        bridge: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        anchors: &mut Vec<Anchor>,
    ) -> Result<()>;

    fn decode(
        &self,
        bridge: &Bridge,
        bytes: &[u8],
        ty: &TypeDescriptor,
        mode: DecodeMode,
    ) -> Result<HostValue>;
}

#[enum_dispatch(SlotCodec)]
#[derive(Clone, Copy, Debug)]
pub enum Codec {
    VoidCodec,
    ScalarCodec,
    CStringCodec,
    ObjectCodec,
    SelectorCodec,
    AggregateCodec,
    ArrayCodec,
    PointerCodec,
    BitFieldCodec,
    OpaqueCodec,
}

#[derive(Clone, Copy, Debug)]
pub struct VoidCodec;

impl SlotCodec for VoidCodec {
    fn encode(&self, _: &Bridge, _: &HostValue, _: &TypeDescriptor, _: &mut [u8], _: &mut Vec<Anchor>) -> Result<()> {
        Err(BridgeError::Unsupported("void argument".to_string()))
    }

    fn decode(&self, _: &Bridge, _: &[u8], _: &TypeDescriptor, _: DecodeMode) -> Result<HostValue> {
        Ok(HostValue::Nil)
    }
}

/// Booleans, integers and floats. Values outside the target's range are
/// rejected, never truncated.
#[derive(Clone, Copy, Debug)]
pub struct ScalarCodec;

fn integer_range(bits: u8, signed: bool) -> (i128, i128) {
    let bits = u32::from(bits.min(64));
    if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn write_int(out: &mut [u8], bits: u8, value: i128) {
    match bits {
        8 => out[..1].copy_from_slice(&(value as u8).to_ne_bytes()),
        16 => out[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
        32 => out[..4].copy_from_slice(&(value as u32).to_ne_bytes()),
        _ => out[..8].copy_from_slice(&(value as u64).to_ne_bytes()),
    }
}

fn read_int(bytes: &[u8], bits: u8, signed: bool) -> HostValue {
    macro_rules! read {
        ($t:ty) => {{
            let mut buf = [0u8; size_of::<$t>()];
            buf.copy_from_slice(&bytes[..size_of::<$t>()]);
            <$t>::from_ne_bytes(buf)
        }};
    }
    match (bits, signed) {
        (8, true) => HostValue::Int(read!(i8) as i64),
        (8, false) => HostValue::UInt(read!(u8) as u64),
        (16, true) => HostValue::Int(read!(i16) as i64),
        (16, false) => HostValue::UInt(read!(u16) as u64),
        (32, true) => HostValue::Int(read!(i32) as i64),
        (32, false) => HostValue::UInt(read!(u32) as u64),
        (_, true) => HostValue::Int(read!(i64)),
        (_, false) => HostValue::UInt(read!(u64)),
    }
}

impl SlotCodec for ScalarCodec {
    fn encode(
        &self,
        _: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        _: &mut Vec<Anchor>,
    ) -> Result<()> {
        let out_of_range = || BridgeError::ArgumentRange {
            value: format!("{value:?}"),
            target: ty.to_string(),
        };
        match ty {
            TypeDescriptor::Bool => {
                out[0] = match value {
                    HostValue::Bool(b) => *b as u8,
                    HostValue::Int(0) | HostValue::UInt(0) => 0,
                    HostValue::Int(1) | HostValue::UInt(1) => 1,
                    HostValue::Int(_) | HostValue::UInt(_) => return Err(out_of_range()),
                    other => return Err(mismatch(ty, other)),
                };
            }
            TypeDescriptor::Integer { bits, signed } => {
                let v: i128 = match value {
                    HostValue::Int(i) => *i as i128,
                    HostValue::UInt(u) => *u as i128,
                    HostValue::Bool(b) => *b as i128,
                    other => return Err(mismatch(ty, other)),
                };
                let (min, max) = integer_range(*bits, *signed);
                if v < min || v > max {
                    return Err(out_of_range());
                }
                write_int(out, *bits, v);
            }
            TypeDescriptor::Float { bits } => {
                // Integers must be exactly representable at the target precision.
                let rounded = |f: f64| if *bits == 32 { f as f32 as f64 } else { f };
                let v = match value {
                    HostValue::Float(f) => *f,
                    HostValue::Int(i) => {
                        let f = rounded(*i as f64);
                        if f as i128 != i128::from(*i) {
                            return Err(out_of_range());
                        }
                        f
                    }
                    HostValue::UInt(u) => {
                        let f = rounded(*u as f64);
                        if f as u128 != u128::from(*u) {
                            return Err(out_of_range());
                        }
                        f
                    }
                    other => return Err(mismatch(ty, other)),
                };
                if *bits == 32 {
                    if v.is_finite() && v.abs() > f32::MAX as f64 {
                        return Err(out_of_range());
                    }
                    out[..4].copy_from_slice(&(v as f32).to_ne_bytes());
                } else {
                    out[..8].copy_from_slice(&v.to_ne_bytes());
                }
            }
            other => return Err(BridgeError::Unsupported(format!("{other} as a scalar"))),
        }
        Ok(())
    }

    fn decode(&self, _: &Bridge, bytes: &[u8], ty: &TypeDescriptor, _: DecodeMode) -> Result<HostValue> {
        Ok(match ty {
            TypeDescriptor::Bool => HostValue::Bool(bytes[0] != 0),
            TypeDescriptor::Integer { bits, signed } => read_int(bytes, *bits, *signed),
            TypeDescriptor::Float { bits: 32 } => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes[..4]);
                HostValue::Float(f32::from_ne_bytes(buf) as f64)
            }
            TypeDescriptor::Float { .. } => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                HostValue::Float(f64::from_ne_bytes(buf))
            }
            other => return Err(BridgeError::Unsupported(format!("{other} as a scalar"))),
        })
    }
}

/// NUL-terminated UTF-8.
#[derive(Clone, Copy, Debug)]
pub struct CStringCodec;

impl SlotCodec for CStringCodec {
    fn encode(
        &self,
        _: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        anchors: &mut Vec<Anchor>,
    ) -> Result<()> {
        let c = match value {
            HostValue::Nil => {
                write_pointer(out, 0);
                return Ok(());
            }
            HostValue::Pointer(p) => {
                write_pointer(out, *p);
                return Ok(());
            }
            HostValue::Str(s) => to_c_string(s)?,
            HostValue::Bytes(b) => bytes_to_c_string(b)?,
            other => return Err(mismatch(ty, other)),
        };
        write_pointer(out, c.as_ptr() as usize);
        anchors.push(Anchor::CString(c));
        Ok(())
    }

    fn decode(&self, _: &Bridge, bytes: &[u8], _: &TypeDescriptor, mode: DecodeMode) -> Result<HostValue> {
        let address = read_pointer(bytes);
        if address == 0 {
            return Ok(HostValue::Nil);
        }
        if mode.passive {
            return Ok(HostValue::Pointer(address));
        }
        // SAFETY: a non-null `char *` returned by the foreign side points at a
        // NUL-terminated string.
        unsafe { from_c_string(address as *const c_char) }.map(HostValue::Str)
    }
}

/// Object, class and block references.
#[derive(Clone, Copy, Debug)]
pub struct ObjectCodec;

impl SlotCodec for ObjectCodec {
    fn encode(
        &self,
        bridge: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        anchors: &mut Vec<Anchor>,
    ) -> Result<()> {
        let address = match (value, ty) {
            (HostValue::Nil, _) => 0,
            (HostValue::Pointer(p), _) => *p,
            (HostValue::Object(ProxyHandle::Instance(i)), _) => {
                anchors.push(Anchor::Object(i.handle().clone()));
                i.handle().ptr().address()
            }
            (HostValue::Object(proxy), _) => proxy.object_ptr().address(),
            (HostValue::Str(name), TypeDescriptor::ClassRef) => {
                bridge.resolve_class(name)?.class_ptr().address()
            }
            (other, TypeDescriptor::ObjectRef { class_hint }) => {
                let boxed = bridge
                    .marshaller()
                    .box_value(bridge, other, class_hint.as_deref())?;
                let address = boxed.ptr().address();
                anchors.push(Anchor::Object(boxed));
                address
            }
            (other, _) => return Err(mismatch(ty, other)),
        };
        write_pointer(out, address);
        Ok(())
    }

    fn decode(&self, bridge: &Bridge, bytes: &[u8], _: &TypeDescriptor, mode: DecodeMode) -> Result<HostValue> {
        let Some(ptr) = ObjPtr::from_raw(read_pointer(bytes) as *mut _) else {
            return Ok(HostValue::Nil);
        };
        if mode.passive {
            return Ok(HostValue::Pointer(ptr.address()));
        }
        let runtime = bridge.runtime();
        Ok(HostValue::Object(match runtime.object_kind(ptr) {
            ObjectKind::Class => ProxyHandle::Class(bridge.class_proxy(ptr.as_class())?),
            ObjectKind::Protocol => ProxyHandle::Protocol(bridge.protocol_proxy(ptr.as_protocol())?),
            ObjectKind::Instance => {
                let handle = ObjectHandle::new(ptr, mode.ownership, runtime.clone());
                ProxyHandle::Instance(InstanceProxy::new(bridge.clone(), handle))
            }
        }))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SelectorCodec;

impl SlotCodec for SelectorCodec {
    fn encode(
        &self,
        bridge: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        _: &mut Vec<Anchor>,
    ) -> Result<()> {
        let address = match value {
            HostValue::Nil => 0,
            HostValue::Str(name) | HostValue::Selector(name) => {
                bridge.marshaller().selector(bridge, name)?.address()
            }
            other => return Err(mismatch(ty, other)),
        };
        write_pointer(out, address);
        Ok(())
    }

    fn decode(&self, bridge: &Bridge, bytes: &[u8], _: &TypeDescriptor, mode: DecodeMode) -> Result<HostValue> {
        let Some(sel) = SelPtr::from_raw(read_pointer(bytes) as *mut _) else {
            return Ok(HostValue::Nil);
        };
        if mode.passive {
            return Ok(HostValue::Pointer(sel.address()));
        }
        Ok(HostValue::Selector(bridge.runtime().selector_name(sel)?))
    }
}

/// Structs field by field in declared order; unions as exactly one member.
#[derive(Clone, Copy, Debug)]
pub struct AggregateCodec;

fn aggregate_parts(ty: &TypeDescriptor) -> Result<(&Aggregate, LayoutManager)> {
    let agg = match ty {
        TypeDescriptor::Struct(a) | TypeDescriptor::Union(a) => a,
        other => return Err(BridgeError::Unsupported(format!("{other} as an aggregate"))),
    };
    Ok((agg, type_layout(ty)?))
}

impl SlotCodec for AggregateCodec {
    fn encode(
        &self,
        bridge: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        anchors: &mut Vec<Anchor>,
    ) -> Result<()> {
        let (agg, layout) = aggregate_parts(ty)?;
        let LayoutManager::AggregateLayout(layout) = layout else {
            return Err(BridgeError::Unsupported(format!("{ty} as an aggregate")));
        };
        let HostValue::Struct(given) = value else {
            return Err(mismatch(ty, value));
        };
        let marshaller = bridge.marshaller();
        let expected: Vec<String> = agg
            .fields()
            .iter()
            .enumerate()
            .map(|(i, f)| f.host_name(i))
            .collect();
        let field_mismatch = |detail: String| BridgeError::FieldMismatch {
            type_name: agg.display_name().to_string(),
            detail,
        };

        if layout.is_union {
            let [(name, member)] = given.as_slice() else {
                return Err(field_mismatch(format!(
                    "a union takes exactly one member, {} given",
                    given.len()
                )));
            };
            let index = expected
                .iter()
                .position(|e| e == name)
                .ok_or_else(|| field_mismatch(format!("no member named {name:?}")))?;
            let range = layout.fields[index].as_range();
            return marshaller.encode_into(bridge, member, &agg.fields()[index].ty, &mut out[range], anchors);
        }

        let given_names: Vec<&str> = given.iter().map(|(n, _)| n.as_str()).collect();
        if given_names != expected {
            return Err(field_mismatch(format!(
                "expected fields {expected:?}, got {given_names:?}"
            )));
        }
        for ((field, slot), (_, v)) in agg.fields().iter().zip(&layout.fields).zip(given) {
            let unit = &mut out[slot.as_range()];
            match &slot.layout {
                LayoutManager::BitFieldLayout(bits) => encode_bit_field(v, &field.ty, bits, unit)?,
                _ => marshaller.encode_into(bridge, v, &field.ty, unit, anchors)?,
            }
        }
        Ok(())
    }

    fn decode(&self, bridge: &Bridge, bytes: &[u8], ty: &TypeDescriptor, mode: DecodeMode) -> Result<HostValue> {
        let (agg, layout) = aggregate_parts(ty)?;
        let LayoutManager::AggregateLayout(layout) = layout else {
            return Err(BridgeError::Unsupported(format!("{ty} as an aggregate")));
        };
        let mode = DecodeMode {
            passive: mode.passive || layout.is_union,
            ..mode.nested()
        };
        let marshaller = bridge.marshaller();
        agg.fields()
            .iter()
            .zip(&layout.fields)
            .map(|(field, slot)| {
                let unit = &bytes[slot.as_range()];
                let value = match &slot.layout {
                    LayoutManager::BitFieldLayout(bits) => HostValue::UInt(bits.read(unit)),
                    _ => marshaller.decode_from(bridge, unit, &field.ty, mode)?,
                };
                Ok((slot.name.clone(), value))
            })
            .collect::<Result<Vec<_>>>()
            .map(HostValue::Struct)
    }
}

/// Fixed-length C arrays, from host lists of exactly that length. 8-bit
/// element arrays also accept host bytes.
#[derive(Clone, Copy, Debug)]
pub struct ArrayCodec;

impl SlotCodec for ArrayCodec {
    fn encode(
        &self,
        bridge: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        anchors: &mut Vec<Anchor>,
    ) -> Result<()> {
        let TypeDescriptor::Array { element, length } = ty else {
            return Err(BridgeError::Unsupported(format!("{ty} as an array")));
        };
        let wrong_length = |found: usize| BridgeError::FieldMismatch {
            type_name: ty.to_string(),
            detail: format!("expected {length} elements, got {found}"),
        };
        match value {
            HostValue::Bytes(b) if matches!(**element, TypeDescriptor::Integer { bits: 8, .. }) => {
                if b.len() != *length {
                    return Err(wrong_length(b.len()));
                }
                out[..b.len()].copy_from_slice(b);
                Ok(())
            }
            HostValue::List(items) => {
                if items.len() != *length {
                    return Err(wrong_length(items.len()));
                }
                let size = type_layout(element)?.size();
                let marshaller = bridge.marshaller();
                for (i, item) in items.iter().enumerate() {
                    marshaller.encode_into(bridge, item, element, &mut out[i * size..(i + 1) * size], anchors)?;
                }
                Ok(())
            }
            other => Err(mismatch(ty, other)),
        }
    }

    fn decode(&self, bridge: &Bridge, bytes: &[u8], ty: &TypeDescriptor, mode: DecodeMode) -> Result<HostValue> {
        let TypeDescriptor::Array { element, length } = ty else {
            return Err(BridgeError::Unsupported(format!("{ty} as an array")));
        };
        let size = type_layout(element)?.size();
        let marshaller = bridge.marshaller();
        (0..*length)
            .map(|i| marshaller.decode_from(bridge, &bytes[i * size..(i + 1) * size], element, mode.nested()))
            .collect::<Result<Vec<_>>>()
            .map(HostValue::List)
    }
}

/// Raw pointers. Host bytes are copied into an anchored buffer and passed by
/// address; nothing is written back.
#[derive(Clone, Copy, Debug)]
pub struct PointerCodec;

impl SlotCodec for PointerCodec {
    fn encode(
        &self,
        _: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        anchors: &mut Vec<Anchor>,
    ) -> Result<()> {
        let address = match value {
            HostValue::Nil => 0,
            HostValue::Pointer(p) => *p,
            HostValue::Bytes(b) => {
                let mut buffer = vec![0u64; b.len().div_ceil(8).max(1)];
                // SAFETY: the buffer holds at least `b.len()` bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(b.as_ptr(), buffer.as_mut_ptr() as *mut u8, b.len());
                }
                let address = buffer.as_ptr() as usize;
                anchors.push(Anchor::Buffer(buffer));
                address
            }
            HostValue::Str(s) => {
                let c = to_c_string(s)?;
                let address = c.as_ptr() as usize;
                anchors.push(Anchor::CString(c));
                address
            }
            HostValue::Object(ProxyHandle::Instance(i)) => {
                anchors.push(Anchor::Object(i.handle().clone()));
                i.handle().ptr().address()
            }
            HostValue::Object(proxy) => proxy.object_ptr().address(),
            other => return Err(mismatch(ty, other)),
        };
        write_pointer(out, address);
        Ok(())
    }

    fn decode(&self, _: &Bridge, bytes: &[u8], _: &TypeDescriptor, _: DecodeMode) -> Result<HostValue> {
        Ok(match read_pointer(bytes) {
            0 => HostValue::Nil,
            address => HostValue::Pointer(address),
        })
    }
}

fn encode_bit_field(value: &HostValue, ty: &TypeDescriptor, bits: &BitFieldLayout, unit: &mut [u8]) -> Result<()> {
    let out_of_range = || BridgeError::ArgumentRange {
        value: format!("{value:?}"),
        target: ty.to_string(),
    };
    let v = match value {
        HostValue::UInt(u) => *u,
        HostValue::Int(i) => u64::try_from(*i).map_err(|_| out_of_range())?,
        HostValue::Bool(b) => *b as u64,
        other => return Err(mismatch(ty, other)),
    };
    if v > bits.max_value() {
        return Err(out_of_range());
    }
    bits.write(unit, v);
    Ok(())
}

/// Bit-fields as unsigned integers. Inside a struct the aggregate codec
/// places them within their shared unit; on their own they start at bit 0.
#[derive(Clone, Copy, Debug)]
pub struct BitFieldCodec;

fn standalone_bits(ty: &TypeDescriptor) -> Result<BitFieldLayout> {
    match type_layout(ty)? {
        LayoutManager::BitFieldLayout(bits) => Ok(bits),
        _ => Err(BridgeError::Unsupported(format!("{ty} as a bit-field"))),
    }
}

impl SlotCodec for BitFieldCodec {
    fn encode(
        &self,
        _: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        _: &mut Vec<Anchor>,
    ) -> Result<()> {
        encode_bit_field(value, ty, &standalone_bits(ty)?, out)
    }

    fn decode(&self, _: &Bridge, bytes: &[u8], ty: &TypeDescriptor, _: DecodeMode) -> Result<HostValue> {
        Ok(HostValue::UInt(standalone_bits(ty)?.read(bytes)))
    }
}

/// Types the decoder could not interpret travel as uninterpreted bytes.
#[derive(Clone, Copy, Debug)]
pub struct OpaqueCodec;

impl SlotCodec for OpaqueCodec {
    fn encode(
        &self,
        _: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        _: &mut Vec<Anchor>,
    ) -> Result<()> {
        match value {
            HostValue::Nil => out.fill(0),
            HostValue::Pointer(p) => write_pointer(out, *p),
            HostValue::Bytes(b) if b.len() <= out.len() => {
                out.fill(0);
                out[..b.len()].copy_from_slice(b);
            }
            HostValue::Bytes(b) => {
                return Err(BridgeError::ArgumentRange {
                    value: format!("{} bytes", b.len()),
                    target: ty.to_string(),
                })
            }
            other => return Err(mismatch(ty, other)),
        }
        Ok(())
    }

    fn decode(&self, _: &Bridge, bytes: &[u8], _: &TypeDescriptor, _: DecodeMode) -> Result<HostValue> {
        Ok(HostValue::Bytes(bytes.to_vec()))
    }
}

/// Type of a variadic argument, chosen from the host value alone.
pub fn infer_variadic(value: &HostValue) -> TypeDescriptor {
    match value {
        HostValue::Int(_) => TypeDescriptor::int(64),
        HostValue::UInt(_) => TypeDescriptor::uint(64),
        HostValue::Float(_) => TypeDescriptor::Float { bits: 64 },
        HostValue::Bool(_) => TypeDescriptor::int(32),
        _ => TypeDescriptor::object(),
    }
}

pub struct Marshaller {
    codecs: HashMap<TypeTag, Codec>,
    selectors: DashMap<String, SelPtr>,
    selector_counters: CacheCounters,
    adapters: RwLock<BoxingRegistry>,
    autobox: bool,
}

impl Marshaller {
    pub fn new(autobox: bool) -> Self {
        let codecs: HashMap<TypeTag, Codec> = HashMap::from([
            (TypeTag::Void, VoidCodec.into()),
            (TypeTag::Bool, ScalarCodec.into()),
            (TypeTag::Integer, ScalarCodec.into()),
            (TypeTag::Float, ScalarCodec.into()),
            (TypeTag::CString, CStringCodec.into()),
            (TypeTag::ObjectRef, ObjectCodec.into()),
            (TypeTag::ClassRef, ObjectCodec.into()),
            (TypeTag::Block, ObjectCodec.into()),
            (TypeTag::SelectorRef, SelectorCodec.into()),
            (TypeTag::Struct, AggregateCodec.into()),
            (TypeTag::Union, AggregateCodec.into()),
            (TypeTag::Array, ArrayCodec.into()),
            (TypeTag::Pointer, PointerCodec.into()),
            (TypeTag::BitField, BitFieldCodec.into()),
            (TypeTag::Unknown, OpaqueCodec.into()),
        ]);
        Self {
            codecs,
            selectors: DashMap::new(),
            selector_counters: CacheCounters::default(),
            adapters: RwLock::new(BoxingRegistry::default()),
            autobox,
        }
    }

    fn codec(&self, tag: TypeTag) -> Result<Codec> {
        self.codecs
            .get(&tag)
            .copied()
            .ok_or_else(|| BridgeError::Unsupported(format!("no codec for {tag:?}")))
    }

    /// Marshal one host value into a fresh slot laid out for `ty`.
    pub fn to_foreign(&self, bridge: &Bridge, value: &HostValue, ty: &TypeDescriptor) -> Result<ForeignSlot> {
        let layout = type_layout(ty)?;
        let mut slot = ForeignSlot::zeroed(layout.size());
        let mut anchors = vec![];
        self.encode_into(bridge, value, ty, slot.bytes_mut(), &mut anchors)?;
        for anchor in anchors {
            slot.anchor(anchor);
        }
        trace!(ty = %ty, ?value, ?slot, "marshalled argument");
        Ok(slot)
    }

    pub fn encode_into(
        &self,
        bridge: &Bridge,
        value: &HostValue,
        ty: &TypeDescriptor,
        out: &mut [u8],
        anchors: &mut Vec<Anchor>,
    ) -> Result<()> {
        self.codec(ty.tag())?.encode(bridge, value, ty, out, anchors)
    }

    /// Unmarshal a slot of type `ty`. A top-level object reference adopts
    /// `ownership`; nested ones are borrowed.
    pub fn to_host(
        &self,
        bridge: &Bridge,
        slot: &ForeignSlot,
        ty: &TypeDescriptor,
        ownership: Ownership,
    ) -> Result<HostValue> {
        self.decode_from(bridge, slot.bytes(), ty, DecodeMode::new(ownership))
    }

    pub fn decode_from(
        &self,
        bridge: &Bridge,
        bytes: &[u8],
        ty: &TypeDescriptor,
        mode: DecodeMode,
    ) -> Result<HostValue> {
        self.codec(ty.tag())?.decode(bridge, bytes, ty, mode)
    }

    /// Interned selector for `name`, cached per name.
    pub fn selector(&self, bridge: &Bridge, name: &str) -> Result<SelPtr> {
        if let Some(sel) = self.selectors.get(name) {
            self.selector_counters.record_hit();
            return Ok(*sel);
        }
        self.selector_counters.record_miss();
        let sel = *self
            .selectors
            .entry(name.to_string())
            .or_try_insert_with(|| {
                self.selector_counters.record_decode();
                bridge.runtime().register_selector(name)
            })?;
        Ok(sel)
    }

    pub fn selector_stats(&self) -> CacheStat {
        self.selector_counters.snapshot(self.selectors.len())
    }

    /// Replace the adapter used to box host values of `kind`.
    pub fn register_adapter(&self, kind: HostKind, adapter: Arc<dyn ObjectAdapter>) {
        self.adapters.write().register(kind, adapter);
    }

    /// Box a host value into a new foreign object the caller owns.
    pub fn box_value(&self, bridge: &Bridge, value: &HostValue, class_hint: Option<&str>) -> Result<ObjectHandle> {
        let no_adapter = || BridgeError::TypeMismatch {
            expected: class_hint.map_or("@".to_string(), |c| format!("@\"{c}\"")),
            found: value.kind_name().to_string(),
        };
        if !self.autobox {
            return Err(no_adapter());
        }
        let adapter = self.adapters.read().get(value.kind()).ok_or_else(no_adapter)?;
        let default = adapter.class_name();
        let class = match class_hint {
            Some(hint) if hint != default && bridge.cache().is_subclass(hint, default) => hint,
            _ => default,
        };
        trace!(kind = ?value.kind(), class, "boxing host value");
        let class = bridge.resolve_class(class)?;
        adapter.to_object(bridge, value, &class)
    }

    /// The object a host value stands for: existing proxies as they are,
    /// `nil` as `None`, anything else boxed.
    pub fn object_for(&self, bridge: &Bridge, value: &HostValue) -> Result<Option<ObjectHandle>> {
        match value {
            HostValue::Nil => Ok(None),
            HostValue::Object(ProxyHandle::Instance(i)) => Ok(Some(i.handle().clone())),
            HostValue::Object(proxy) => Ok(Some(ObjectHandle::new(
                proxy.object_ptr(),
                Ownership::Borrowed,
                bridge.runtime().clone(),
            ))),
            other => self.box_value(bridge, other, None).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{runtime::local::LocalRuntime, runtime::ForeignRuntime, types::decode};

    fn bridge() -> Bridge {
        Bridge::new(Arc::new(LocalRuntime::new()))
    }

    fn roundtrip(b: &Bridge, value: HostValue, encoding: &str) -> HostValue {
        let ty = decode(encoding).unwrap();
        let m = b.marshaller();
        let slot = m.to_foreign(b, &value, &ty).unwrap();
        m.to_host(b, &slot, &ty, Ownership::Borrowed).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip_at_bounds() {
        let b = bridge();
        for (v, e) in [
            (HostValue::Int(i8::MIN as i64), "c"),
            (HostValue::Int(i16::MAX as i64), "s"),
            (HostValue::Int(i32::MIN as i64), "i"),
            (HostValue::Int(i64::MAX), "q"),
            (HostValue::UInt(u8::MAX as u64), "C"),
            (HostValue::UInt(u32::MAX as u64), "I"),
            (HostValue::UInt(u64::MAX), "Q"),
            (HostValue::Float(1.5), "f"),
            (HostValue::Float(-0.1), "d"),
            (HostValue::Bool(true), "B"),
        ] {
            assert_eq!(roundtrip(&b, v.clone(), e), v, "{e}");
        }
        assert_eq!(
            roundtrip(&b, HostValue::Int(1 << 53), "d"),
            HostValue::Float(9_007_199_254_740_992.0)
        );
        assert_eq!(roundtrip(&b, HostValue::Int(-3), "f"), HostValue::Float(-3.0));
    }

    #[test]
    fn test_range_checks() {
        let b = bridge();
        let m = b.marshaller();
        for (v, e) in [
            (HostValue::Int(128), "c"),
            (HostValue::Int(-1), "C"),
            (HostValue::UInt(1 << 32), "I"),
            (HostValue::Int(-1), "Q"),
            (HostValue::UInt(u64::MAX), "q"),
            (HostValue::Int(2), "B"),
            (HostValue::Float(1e300), "f"),
            (HostValue::Int((1 << 53) + 1), "d"),
            (HostValue::UInt(u64::MAX), "d"),
            (HostValue::Int(16_777_217), "f"),
        ] {
            assert!(
                matches!(
                    m.to_foreign(&b, &v, &decode(e).unwrap()),
                    Err(BridgeError::ArgumentRange { .. })
                ),
                "{v:?} as {e}"
            );
        }
        assert!(matches!(
            m.to_foreign(&b, &HostValue::Str("1".into()), &decode("i").unwrap()),
            Err(BridgeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_struct_layout_and_roundtrip() {
        let b = bridge();
        let ty = decode("{Pair=\"x\"i\"y\"i}").unwrap();
        let value = HostValue::record([("x", 3.into()), ("y", (-4).into())]);
        let slot = b.marshaller().to_foreign(&b, &value, &ty).unwrap();
        let mut expected = 3i32.to_ne_bytes().to_vec();
        expected.extend((-4i32).to_ne_bytes());
        assert_eq!(slot.bytes(), expected.as_slice());
        assert_eq!(
            b.marshaller().to_host(&b, &slot, &ty, Ownership::Borrowed).unwrap(),
            value
        );
    }

    #[test]
    fn test_struct_field_names_must_match() {
        let b = bridge();
        let ty = decode("{Pair=\"x\"i\"y\"i}").unwrap();
        for value in [
            HostValue::record([("y", 1.into()), ("x", 2.into())]),
            HostValue::record([("x", 1.into())]),
            HostValue::record([("x", 1.into()), ("y", 2.into()), ("z", 3.into())]),
        ] {
            assert!(matches!(
                b.marshaller().to_foreign(&b, &value, &ty),
                Err(BridgeError::FieldMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_unnamed_fields_use_positional_names() {
        let b = bridge();
        let value = HostValue::record([("_field_0", 1.5.into()), ("_field_1", 2.5.into())]);
        assert_eq!(roundtrip(&b, value.clone(), "{CGPoint=dd}"), value);
    }

    #[test]
    fn test_nested_struct_with_padding() {
        let b = bridge();
        let value = HostValue::record([
            ("flag", HostValue::Int(1)),
            ("inner", HostValue::record([("v", HostValue::Float(2.0))])),
        ]);
        let ty = decode("{Outer=\"flag\"c\"inner\"{Inner=\"v\"d}}").unwrap();
        let slot = b.marshaller().to_foreign(&b, &value, &ty).unwrap();
        assert_eq!(slot.size(), 16);
        assert_eq!(&slot.bytes()[8..], 2.0f64.to_ne_bytes());
        assert_eq!(
            b.marshaller().to_host(&b, &slot, &ty, Ownership::Borrowed).unwrap(),
            value
        );
    }

    #[test]
    fn test_union_takes_one_member() {
        let b = bridge();
        let ty = decode("(Value=\"i\"i\"d\"d)").unwrap();
        let slot = b
            .marshaller()
            .to_foreign(&b, &HostValue::record([("i", 7.into())]), &ty)
            .unwrap();
        assert_eq!(slot.size(), 8);
        let decoded = b.marshaller().to_host(&b, &slot, &ty, Ownership::Borrowed).unwrap();
        assert_eq!(decoded.field("i"), Some(&HostValue::Int(7)));
        assert!(decoded.field("d").is_some());

        assert!(matches!(
            b.marshaller().to_foreign(
                &b,
                &HostValue::record([("i", 1.into()), ("d", 1.0.into())]),
                &ty
            ),
            Err(BridgeError::FieldMismatch { .. })
        ));
    }

    #[test]
    fn test_union_object_members_are_addresses() {
        let b = bridge();
        let ty = decode("(Either=\"obj\"@\"raw\"Q)").unwrap();
        let decoded = roundtrip(&b, HostValue::record([("raw", HostValue::UInt(0x1000))]), "(Either=\"obj\"@\"raw\"Q)");
        assert_eq!(decoded.field("obj"), Some(&HostValue::Pointer(0x1000)));
        assert!(ty.is_aggregate());
    }

    #[test]
    fn test_bit_fields_share_a_unit() {
        let b = bridge();
        let ty = decode("{Flags=\"on\"b1\"level\"b7\"count\"i}").unwrap();
        let value = HostValue::record([
            ("on", HostValue::UInt(1)),
            ("level", HostValue::UInt(100)),
            ("count", HostValue::Int(-2)),
        ]);
        let slot = b.marshaller().to_foreign(&b, &value, &ty).unwrap();
        assert_eq!(slot.size(), 8);
        if cfg!(target_endian = "little") {
            assert_eq!(&slot.bytes()[..4], (1u32 | 100 << 1).to_ne_bytes());
        }
        assert_eq!(&slot.bytes()[4..], (-2i32).to_ne_bytes());
        assert_eq!(
            b.marshaller().to_host(&b, &slot, &ty, Ownership::Borrowed).unwrap(),
            value
        );

        let too_wide = HostValue::record([
            ("on", HostValue::UInt(2)),
            ("level", HostValue::UInt(0)),
            ("count", HostValue::Int(0)),
        ]);
        assert!(matches!(
            b.marshaller().to_foreign(&b, &too_wide, &ty),
            Err(BridgeError::ArgumentRange { .. })
        ));
    }

    #[test]
    fn test_float_union_roundtrip() {
        let b = bridge();
        let value = HostValue::record([("d", HostValue::Float(2.5))]);
        let decoded = roundtrip(&b, value, "(Real=\"f\"f\"d\"d)");
        assert_eq!(decoded.field("d"), Some(&HostValue::Float(2.5)));
    }

    #[test]
    fn test_arrays() {
        let b = bridge();
        let value = HostValue::List(vec![1.into(), 2.into(), 3.into()]);
        assert_eq!(roundtrip(&b, value, "[3s]"), HostValue::List(vec![1.into(), 2.into(), 3.into()]));
        assert_eq!(
            roundtrip(&b, HostValue::Bytes(b"ab".to_vec()), "[2C]"),
            HostValue::List(vec![HostValue::UInt(b'a' as u64), HostValue::UInt(b'b' as u64)])
        );
        assert!(matches!(
            b.marshaller().to_foreign(&b, &HostValue::List(vec![1.into()]), &decode("[3s]").unwrap()),
            Err(BridgeError::FieldMismatch { .. })
        ));
    }

    #[test]
    fn test_c_strings() {
        let b = bridge();
        assert_eq!(roundtrip(&b, "héllo".into(), "*"), HostValue::from("héllo"));
        assert_eq!(roundtrip(&b, HostValue::Nil, "*"), HostValue::Nil);
        assert!(matches!(
            b.marshaller().to_foreign(&b, &"a\0b".into(), &TypeDescriptor::CString),
            Err(BridgeError::Encoding(_))
        ));
    }

    #[test]
    fn test_selectors_are_cached() {
        let b = bridge();
        assert_eq!(
            roundtrip(&b, HostValue::Str("doThing:".into()), ":"),
            HostValue::Selector("doThing:".into())
        );
        roundtrip(&b, HostValue::Selector("doThing:".into()), ":");
        let stats = b.marshaller().selector_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_unknown_is_opaque_bytes() {
        let b = bridge();
        let decoded = roundtrip(&b, HostValue::Bytes(vec![1, 2, 3]), "Z");
        let HostValue::Bytes(bytes) = decoded else {
            panic!("expected bytes, got {decoded:?}");
        };
        assert_eq!(&bytes[..3], &[1, 2, 3]);
        assert!(bytes[3..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_pointers() {
        let b = bridge();
        assert_eq!(roundtrip(&b, HostValue::Pointer(0x40), "^v"), HostValue::Pointer(0x40));
        assert_eq!(roundtrip(&b, HostValue::Nil, "^i"), HostValue::Nil);
        let slot = b
            .marshaller()
            .to_foreign(&b, &HostValue::Bytes(vec![9, 8]), &decode("^C").unwrap())
            .unwrap();
        let address = slot.read_pointer();
        // SAFETY: the anchored buffer lives as long as `slot`.
        assert_eq!(unsafe { *(address as *const u8).add(1) }, 8);
    }

    #[test]
    fn test_objects_and_ownership() {
        let rt = Arc::new(LocalRuntime::new());
        let b = Bridge::new(rt.clone());
        let obj = rt.instantiate("NSObject").unwrap();
        let slot = ForeignSlot::from_bytes(&obj.address().to_ne_bytes());
        let value = b
            .marshaller()
            .to_host(&b, &slot, &TypeDescriptor::object(), Ownership::Owned)
            .unwrap();
        assert!(value.as_instance().is_some());
        drop(value);
        assert_eq!(rt.stats().releases(), 1);
        assert_eq!(rt.stats().live_objects(), 0);

        let class = ForeignSlot::from_bytes(&rt.lookup_class("NSObject").unwrap().address().to_ne_bytes());
        let value = b
            .marshaller()
            .to_host(&b, &class, &TypeDescriptor::ClassRef, Ownership::Borrowed)
            .unwrap();
        assert!(matches!(value, HostValue::Object(ProxyHandle::Class(_))));
    }

    #[test]
    fn test_class_by_name() {
        let b = bridge();
        let slot = b
            .marshaller()
            .to_foreign(&b, &"NSObject".into(), &TypeDescriptor::ClassRef)
            .unwrap();
        assert_eq!(
            slot.read_pointer(),
            b.runtime().lookup_class("NSObject").unwrap().address()
        );
        assert!(b
            .marshaller()
            .to_foreign(&b, &"Missing".into(), &TypeDescriptor::ClassRef)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_autobox_disabled_is_type_mismatch() {
        let rt = Arc::new(LocalRuntime::new());
        let config = crate::config::BridgeConfig {
            autobox: false,
            ..Default::default()
        };
        let b = Bridge::with_config(rt, config);
        assert!(matches!(
            b.marshaller().to_foreign(&b, &"text".into(), &TypeDescriptor::object()),
            Err(BridgeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_variadic_inference() {
        assert_eq!(infer_variadic(&HostValue::Int(1)), TypeDescriptor::int(64));
        assert_eq!(infer_variadic(&HostValue::Float(1.0)), TypeDescriptor::Float { bits: 64 });
        assert_eq!(infer_variadic(&HostValue::Bool(true)), TypeDescriptor::int(32));
        assert_eq!(infer_variadic(&"s".into()), TypeDescriptor::object());
    }
}
