use crate::{
    error::{BridgeError, Result},
    types::{Aggregate, TypeDescriptor},
};
use enum_dispatch::enum_dispatch;
use libffi::middle::Type;
use std::{mem::size_of, ops::Range};

#[enum_dispatch]
pub trait HasLayout {
    fn size(&self) -> usize;
    fn align(&self) -> usize;
}

#[enum_dispatch(HasLayout)]
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutManager {
    AggregateLayout,
    ArrayLayout,
    BitFieldLayout,
    Scalar,
}

impl LayoutManager {
    pub fn type_tag(&self) -> &'static str {
        match self {
            LayoutManager::AggregateLayout(a) if a.is_union => "union",
            LayoutManager::AggregateLayout(_) => "struct",
            LayoutManager::ArrayLayout(_) => "arr",
            LayoutManager::BitFieldLayout(_) => "bits",
            LayoutManager::Scalar(s) => match s {
                Scalar::Void => "void",
                Scalar::Int8 => "i8",
                Scalar::Int16 => "i16",
                Scalar::Int32 => "i32",
                Scalar::Int64 => "i64",
                Scalar::Float32 => "f32",
                Scalar::Float64 => "f64",
                Scalar::Pointer => "ptr",
            },
        }
    }

    /// The libffi description of this layout.
    pub fn to_ffi_type(&self) -> Type {
        match self {
            LayoutManager::Scalar(s) => s.to_ffi_type(),
            LayoutManager::BitFieldLayout(_) => Type::u32(),
            LayoutManager::ArrayLayout(a) => {
                Type::structure((0..a.length).map(|_| a.element.to_ffi_type()))
            }
            LayoutManager::AggregateLayout(a) if a.is_union || a.has_bit_fields() => a.unit_ffi_type(),
            LayoutManager::AggregateLayout(a) => {
                Type::structure(a.fields.iter().map(|f| f.layout.to_ffi_type()))
            }
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            LayoutManager::AggregateLayout(_) | LayoutManager::ArrayLayout(_)
        )
    }

    /// Byte ranges of every scalar this layout contains, relative to `base`.
    fn collect_leaves(&self, base: usize, out: &mut Vec<(Range<usize>, Scalar)>) {
        match self {
            LayoutManager::Scalar(s) if s.size() > 0 => out.push((base..base + s.size(), *s)),
            LayoutManager::Scalar(_) => {}
            LayoutManager::BitFieldLayout(b) => {
                let bytes = b.byte_range();
                if !bytes.is_empty() {
                    out.push((base + bytes.start..base + bytes.end, Scalar::Int32));
                }
            }
            LayoutManager::ArrayLayout(a) => {
                for i in 0..a.length {
                    a.element.collect_leaves(base + a.element_range(i).start, out);
                }
            }
            LayoutManager::AggregateLayout(a) => {
                for f in &a.fields {
                    f.layout.collect_leaves(base + f.position, out);
                }
            }
        }
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    let misalignment = value % align;
    if misalignment == 0 {
        value
    } else {
        value + align - misalignment
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scalar {
    Void,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Pointer,
}

impl HasLayout for Scalar {
    fn size(&self) -> usize {
        match self {
            Scalar::Void => 0,
            Scalar::Int8 => 1,
            Scalar::Int16 => 2,
            Scalar::Int32 | Scalar::Float32 => 4,
            Scalar::Int64 | Scalar::Float64 => 8,
            Scalar::Pointer => size_of::<usize>(),
        }
    }

    fn align(&self) -> usize {
        self.size().max(1)
    }
}

impl Scalar {
    fn for_alignment(align: usize) -> Scalar {
        match align {
            1 => Scalar::Int8,
            2 => Scalar::Int16,
            4 => Scalar::Int32,
            _ => Scalar::Int64,
        }
    }

    fn to_ffi_type(self) -> Type {
        match self {
            Scalar::Void => Type::void(),
            Scalar::Int8 => Type::u8(),
            Scalar::Int16 => Type::u16(),
            Scalar::Int32 => Type::u32(),
            Scalar::Int64 => Type::u64(),
            Scalar::Float32 => Type::f32(),
            Scalar::Float64 => Type::f64(),
            Scalar::Pointer => Type::pointer(),
        }
    }
}

/// A bit-field within its `unsigned int` storage unit. `shift` counts bits
/// in allocation order from the start of the unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitFieldLayout {
    pub shift: u32,
    pub width: u32,
}
impl HasLayout for BitFieldLayout {
    fn size(&self) -> usize {
        BitFieldLayout::UNIT
    }

    fn align(&self) -> usize {
        BitFieldLayout::UNIT
    }
}
impl BitFieldLayout {
    /// Bytes in a storage unit.
    pub const UNIT: usize = 4;
    const UNIT_BITS: usize = Self::UNIT * 8;

    pub fn max_value(&self) -> u64 {
        (1u64 << self.width) - 1
    }

    /// Bytes of the unit the field's bits fall in.
    pub fn byte_range(&self) -> Range<usize> {
        let start = self.shift as usize;
        start / 8..(start + self.width as usize).div_ceil(8)
    }

    fn register_shift(&self) -> u32 {
        if cfg!(target_endian = "little") {
            self.shift
        } else {
            Self::UNIT_BITS as u32 - self.shift - self.width
        }
    }

    fn unit_value(unit: &[u8]) -> u32 {
        let mut buf = [0u8; Self::UNIT];
        buf.copy_from_slice(&unit[..Self::UNIT]);
        u32::from_ne_bytes(buf)
    }

    pub fn read(&self, unit: &[u8]) -> u64 {
        if self.width == 0 {
            return 0;
        }
        (u64::from(Self::unit_value(unit)) >> self.register_shift()) & self.max_value()
    }

    /// Store `value` into the field's bits, leaving the rest of the unit
    /// untouched. `value` must already fit in the field.
    pub fn write(&self, unit: &mut [u8], value: u64) {
        if self.width == 0 {
            return;
        }
        let shift = self.register_shift();
        let mask = self.max_value() << shift;
        let word = (u64::from(Self::unit_value(unit)) & !mask) | ((value << shift) & mask);
        unit[..Self::UNIT].copy_from_slice(&(word as u32).to_ne_bytes());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    pub position: usize,
    pub layout: LayoutManager,
}
impl FieldLayout {
    pub fn as_range(&self) -> Range<usize> {
        self.position..self.position + self.layout.size()
    }
}

/// C layout of a struct or union: fields in declared order, each at its
/// natural alignment, the total rounded up to the largest alignment.
/// Adjacent bit-fields share an `unsigned int` unit until one would straddle
/// a unit boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateLayout {
    pub fields: Vec<FieldLayout>,
    pub total_size: usize,
    pub align: usize,
    pub is_union: bool,
}
impl HasLayout for AggregateLayout {
    fn size(&self) -> usize {
        self.total_size
    }

    fn align(&self) -> usize {
        self.align
    }
}
impl AggregateLayout {
    fn new(fields: impl IntoIterator<Item = (String, LayoutManager)>, is_union: bool) -> Self {
        let mut mapping = vec![];
        // Struct cursor in bits, union size in bytes.
        let mut bits = 0;
        let mut union_size = 0;
        let mut align = 1;

        for (name, layout) in fields {
            align = usize::max(align, layout.align());
            let (position, layout) = match layout {
                _ if is_union => {
                    union_size = usize::max(union_size, layout.size());
                    (0, layout)
                }
                LayoutManager::BitFieldLayout(b) => {
                    let width = b.width as usize;
                    let used = bits % BitFieldLayout::UNIT_BITS;
                    if width == 0 || used + width > BitFieldLayout::UNIT_BITS {
                        bits = align_up(bits, BitFieldLayout::UNIT_BITS);
                    }
                    let unit = bits / BitFieldLayout::UNIT_BITS * BitFieldLayout::UNIT;
                    let shift = (bits % BitFieldLayout::UNIT_BITS) as u32;
                    bits += width;
                    (unit, BitFieldLayout { shift, ..b }.into())
                }
                layout => {
                    let aligned = align_up(bits.div_ceil(8), layout.align());
                    bits = (aligned + layout.size()) * 8;
                    (aligned, layout)
                }
            };
            mapping.push(FieldLayout {
                name,
                position,
                layout,
            });
        }

        let end = if is_union { union_size } else { bits.div_ceil(8) };
        Self {
            fields: mapping,
            total_size: align_up(end, align),
            align,
            is_union,
        }
    }

    pub fn has_bit_fields(&self) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f.layout, LayoutManager::BitFieldLayout(_)))
    }

    /// libffi has neither unions nor bit-fields. Such aggregates are passed
    /// as units of their alignment: a floating-point unit where only
    /// floating-point members overlap it, an integer unit otherwise.
    fn unit_ffi_type(&self) -> Type {
        let mut leaves = vec![];
        for f in &self.fields {
            f.layout.collect_leaves(f.position, &mut leaves);
        }
        let unit = Scalar::for_alignment(self.align);
        let unit_size = unit.size();
        let mut types = vec![];
        for start in (0..self.total_size).step_by(unit_size) {
            let end = start + unit_size;
            let overlapping: Vec<Scalar> = leaves
                .iter()
                .filter(|(range, _)| range.start < end && start < range.end)
                .map(|(_, s)| *s)
                .collect();
            let all_float = !overlapping.is_empty()
                && overlapping
                    .iter()
                    .all(|s| matches!(s, Scalar::Float32 | Scalar::Float64));
            match unit_size {
                8 if all_float && overlapping.contains(&Scalar::Float64) => types.push(Type::f64()),
                8 if all_float => types.extend([Type::f32(), Type::f32()]),
                4 if all_float => types.push(Type::f32()),
                _ => types.push(unit.to_ffi_type()),
            }
        }
        Type::structure(types)
    }

    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayLayout {
    pub element: Box<LayoutManager>,
    pub length: usize,
}
impl HasLayout for ArrayLayout {
    fn size(&self) -> usize {
        self.element.size() * self.length
    }

    fn align(&self) -> usize {
        self.element.align()
    }
}
impl ArrayLayout {
    pub fn new(element: LayoutManager, length: usize) -> Self {
        Self {
            element: Box::new(element),
            length,
        }
    }

    pub fn element_range(&self, index: usize) -> Range<usize> {
        let size = self.element.size();
        index * size..(index + 1) * size
    }
}

fn bit_field_layout(width: u8) -> Result<LayoutManager> {
    if usize::from(width) > BitFieldLayout::UNIT_BITS {
        return Err(BridgeError::Unsupported(format!(
            "bit-field of {width} bits"
        )));
    }
    Ok(BitFieldLayout {
        shift: 0,
        width: u32::from(width),
    }
    .into())
}

fn aggregate_layout(ty: &TypeDescriptor, agg: &Aggregate, is_union: bool) -> Result<LayoutManager> {
    if agg.fields().is_empty() {
        return Err(BridgeError::Unsupported(format!(
            "aggregate {} without a field list",
            ty
        )));
    }
    let fields = agg
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| match &f.ty {
            TypeDescriptor::Void => Err(BridgeError::Unsupported(format!("void field in {ty}"))),
            other => Ok((f.host_name(i), type_layout(other)?)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(AggregateLayout::new(fields, is_union).into())
}

/// Platform C layout of a descriptor. Unknown types occupy one pointer-sized
/// slot; aggregates without a field list cannot be laid out. A bit-field on
/// its own is laid out as a whole storage unit.
pub fn type_layout(ty: &TypeDescriptor) -> Result<LayoutManager> {
    Ok(match ty {
        TypeDescriptor::Void => Scalar::Void.into(),
        TypeDescriptor::Bool => Scalar::Int8.into(),
        TypeDescriptor::Integer { bits, .. } => match bits {
            8 => Scalar::Int8,
            16 => Scalar::Int16,
            32 => Scalar::Int32,
            _ => Scalar::Int64,
        }
        .into(),
        TypeDescriptor::Float { bits: 32 } => Scalar::Float32.into(),
        TypeDescriptor::Float { .. } => Scalar::Float64.into(),
        TypeDescriptor::CString
        | TypeDescriptor::ObjectRef { .. }
        | TypeDescriptor::ClassRef
        | TypeDescriptor::SelectorRef
        | TypeDescriptor::Block
        | TypeDescriptor::Pointer(_)
        | TypeDescriptor::Unknown(_) => Scalar::Pointer.into(),
        TypeDescriptor::Struct(a) => return aggregate_layout(ty, a, false),
        TypeDescriptor::Union(a) => return aggregate_layout(ty, a, true),
        TypeDescriptor::BitField { width } => return bit_field_layout(*width),
        TypeDescriptor::Array { element, .. } if matches!(**element, TypeDescriptor::BitField { .. }) => {
            return Err(BridgeError::Unsupported(format!("array of bit-fields {ty}")))
        }
        TypeDescriptor::Array { element, length } => {
            ArrayLayout::new(type_layout(element)?, *length).into()
        }
    })
}

/// libffi type for a call slot of type `ty`. Top-level integers keep their
/// signedness so narrow arguments are extended the way the callee expects.
pub fn ffi_type(ty: &TypeDescriptor) -> Result<Type> {
    Ok(match ty {
        TypeDescriptor::Integer { bits, signed: true } => match bits {
            8 => Type::i8(),
            16 => Type::i16(),
            32 => Type::i32(),
            _ => Type::i64(),
        },
        TypeDescriptor::BitField { .. } => {
            return Err(BridgeError::Unsupported(format!("bit-field {ty} as a call slot")))
        }
        other => type_layout(other)?.to_ffi_type(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::decode;

    fn layout(e: &str) -> LayoutManager {
        type_layout(&decode(e).unwrap()).unwrap()
    }

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(layout("c").size(), 1);
        assert_eq!(layout("s").size(), 2);
        assert_eq!(layout("i").size(), 4);
        assert_eq!(layout("q").size(), 8);
        assert_eq!(layout("@").size(), size_of::<usize>());
        assert_eq!(layout("B").type_tag(), "i8");
    }

    #[test]
    fn test_struct_padding() {
        let l = layout("{S=ciq}");
        let LayoutManager::AggregateLayout(a) = &l else {
            panic!("expected aggregate");
        };
        assert_eq!(a.fields[0].position, 0);
        assert_eq!(a.fields[1].position, 4);
        assert_eq!(a.fields[2].position, 8);
        assert_eq!(l.size(), 16);
        assert_eq!(l.align(), 8);
    }

    #[test]
    fn test_trailing_padding() {
        let l = layout("{T=qc}");
        assert_eq!(l.size(), 16);
        let l = layout("{P=ii}");
        assert_eq!(l.size(), 8);
        assert_eq!(l.align(), 4);
    }

    #[test]
    fn test_nested_and_arrays() {
        let l = layout("{CGRect={CGPoint=dd}{CGSize=dd}}");
        assert_eq!(l.size(), 32);
        let l = layout("{A=c[3s]}");
        let LayoutManager::AggregateLayout(a) = &l else {
            panic!("expected aggregate");
        };
        assert_eq!(a.fields[1].position, 2);
        assert_eq!(l.size(), 8);
    }

    #[test]
    fn test_union_layout() {
        let l = layout("(U=cqi)");
        let LayoutManager::AggregateLayout(a) = &l else {
            panic!("expected aggregate");
        };
        assert!(a.fields.iter().all(|f| f.position == 0));
        assert_eq!(l.size(), 8);
        assert_eq!(l.type_tag(), "union");
    }

    #[test]
    fn test_bit_field_packing() {
        assert_eq!(layout("{F=b1b7}").size(), 4);
        assert_eq!(layout("{F=b1b7}").align(), 4);

        let l = layout("{G=b1q}");
        let LayoutManager::AggregateLayout(a) = &l else {
            panic!("expected aggregate");
        };
        assert_eq!(a.fields[1].position, 8);
        assert_eq!(l.size(), 16);

        // A field that would straddle a unit starts the next one.
        let l = layout("{S=b30b4}");
        let LayoutManager::AggregateLayout(a) = &l else {
            panic!("expected aggregate");
        };
        assert_eq!(a.fields[1].position, 4);
        assert_eq!(
            a.fields[1].layout,
            LayoutManager::BitFieldLayout(BitFieldLayout { shift: 0, width: 4 })
        );
        assert_eq!(l.size(), 8);

        // Ordinary fields follow the last used byte, not the whole unit.
        let l = layout("{C=b3c}");
        let LayoutManager::AggregateLayout(a) = &l else {
            panic!("expected aggregate");
        };
        assert_eq!(a.fields[1].position, 1);
        assert_eq!(l.size(), 4);
    }

    #[test]
    fn test_bit_field_bits() {
        let bits = BitFieldLayout { shift: 3, width: 4 };
        let mut unit = [0xffu8; 4];
        bits.write(&mut unit, 0b1010);
        assert_eq!(bits.read(&unit), 0b1010);
        assert_eq!(bits.max_value(), 15);
        assert_eq!(bits.byte_range(), 0..1);
        if cfg!(target_endian = "little") {
            assert_eq!(u32::from_ne_bytes(unit), !(0b0101 << 3));
        }
    }

    #[test]
    fn test_bit_fields_are_not_call_slots() {
        let ty = decode("b3").unwrap();
        assert_eq!(type_layout(&ty).unwrap().size(), 4);
        assert!(matches!(ffi_type(&ty), Err(BridgeError::Unsupported(_))));
        assert!(matches!(
            type_layout(&decode("{W=b40}").unwrap()),
            Err(BridgeError::Unsupported(_))
        ));
        assert!(matches!(
            type_layout(&decode("[2b3]").unwrap()),
            Err(BridgeError::Unsupported(_))
        ));
    }

    fn element_kinds(ty: &Type) -> Vec<u32> {
        // SAFETY: struct types carry a null-terminated element list.
        unsafe {
            let mut element = (*ty.as_raw_ptr()).elements;
            let mut kinds = vec![];
            while !(*element).is_null() {
                kinds.push(u32::from((**element).type_));
                element = element.add(1);
            }
            kinds
        }
    }

    #[test]
    fn test_union_ffi_type_follows_member_classes() {
        use libffi::raw::{FFI_TYPE_DOUBLE, FFI_TYPE_FLOAT, FFI_TYPE_UINT32, FFI_TYPE_UINT64};
        let kinds = |e: &str| element_kinds(&ffi_type(&decode(e).unwrap()).unwrap());
        assert_eq!(kinds("(U=dd)"), [FFI_TYPE_DOUBLE]);
        assert_eq!(kinds("(U=fd)"), [FFI_TYPE_DOUBLE]);
        assert_eq!(kinds("(U=ff)"), [FFI_TYPE_FLOAT]);
        assert_eq!(kinds("(U=dq)"), [FFI_TYPE_UINT64]);
        assert_eq!(kinds("(U=fi)"), [FFI_TYPE_UINT32]);
        assert_eq!(kinds("{F=b1b7}"), [FFI_TYPE_UINT32]);
        assert_eq!(kinds("{B=b1f}"), [FFI_TYPE_UINT32, FFI_TYPE_FLOAT]);
    }

    #[test]
    fn test_field_lookup_by_host_name() {
        let l = layout("{P=ii}");
        let LayoutManager::AggregateLayout(a) = &l else {
            panic!("expected aggregate");
        };
        assert_eq!(a.field("_field_1").map(|f| f.as_range()), Some(4..8));
    }

    #[test]
    fn test_opaque_struct_is_unsupported() {
        assert!(matches!(
            type_layout(&decode("{__CFString}").unwrap()),
            Err(BridgeError::Unsupported(_))
        ));
    }
}
