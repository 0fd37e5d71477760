//! Field specifications and the offset table derived from them.
//!
//! A [`FieldSpec`] names a buffer type, its revision and an ordered list of
//! fields. [`Layout::compute`] turns it into an arena-style offset table over
//! one contiguous payload allocation; each field is aligned to the size of its
//! scalar component.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{FlowError, FlowResult};

/// Scalar element kinds a field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldKind {
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    U32 = 5,
    I32 = 6,
    U64 = 7,
    I64 = 8,
    F32 = 9,
    F64 = 10,
    /// Complex sample stored as `[re, im]` of `f32`.
    ComplexF32 = 11,
    /// Complex sample stored as `[re, im]` of `f64`.
    ComplexF64 = 12,
}

impl FieldKind {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => 4,
            FieldKind::U64 | FieldKind::I64 | FieldKind::F64 | FieldKind::ComplexF32 => 8,
            FieldKind::ComplexF64 => 16,
        }
    }

    /// Size of the unit that is byte-swapped independently (complex values
    /// swap each component).
    pub fn swap_unit(self) -> usize {
        match self {
            FieldKind::ComplexF32 => 4,
            FieldKind::ComplexF64 => 8,
            other => other.size(),
        }
    }

    /// Alignment of the field inside the payload.
    pub fn align(self) -> usize {
        self.swap_unit()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            1 => FieldKind::U8,
            2 => FieldKind::I8,
            3 => FieldKind::U16,
            4 => FieldKind::I16,
            5 => FieldKind::U32,
            6 => FieldKind::I32,
            7 => FieldKind::U64,
            8 => FieldKind::I64,
            9 => FieldKind::F32,
            10 => FieldKind::F64,
            11 => FieldKind::ComplexF32,
            12 => FieldKind::ComplexF64,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::U8 => "u8",
            FieldKind::I8 => "i8",
            FieldKind::U16 => "u16",
            FieldKind::I16 => "i16",
            FieldKind::U32 => "u32",
            FieldKind::I32 => "i32",
            FieldKind::U64 => "u64",
            FieldKind::I64 => "i64",
            FieldKind::F32 => "f32",
            FieldKind::F64 => "f64",
            FieldKind::ComplexF32 => "complex<f32>",
            FieldKind::ComplexF64 => "complex<f64>",
        };
        f.write_str(name)
    }
}

/// One named, shaped field of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Dimensions; an empty shape is a single scalar.
    pub shape: Vec<usize>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            kind,
            shape: shape.to_vec(),
        }
    }

    pub fn scalar(name: impl Into<String>, kind: FieldKind) -> Self {
        Self::new(name, kind, &[])
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes occupied by the field.
    pub fn byte_len(&self) -> usize {
        self.count() * self.kind.size()
    }
}

/// The full description of one buffer type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    pub type_name: String,
    pub revision: u32,
    pub fields: Vec<FieldDescriptor>,
}

impl FieldSpec {
    pub fn new(type_name: impl Into<String>, revision: u32) -> Self {
        Self {
            type_name: type_name.into(),
            revision,
            fields: Vec::new(),
        }
    }

    /// Builder-style field addition.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, shape: &[usize]) -> Self {
        self.fields.push(FieldDescriptor::new(name, kind, shape));
        self
    }

    /// 64-bit fingerprint of the spec, carried on the wire as the version tag.
    ///
    /// Any change to the type name, revision, a field's name, kind, shape or
    /// order yields a different tag.
    pub fn version_tag(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.type_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.revision.to_le_bytes());
        for field in &self.fields {
            hasher.update((field.name.len() as u32).to_le_bytes());
            hasher.update(field.name.as_bytes());
            hasher.update([field.kind.code(), field.shape.len() as u8]);
            for dim in &field.shape {
                hasher.update((*dim as u64).to_le_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(tag)
    }

    /// Structural checks that do not depend on the computed offsets.
    pub fn validate(&self) -> FlowResult<()> {
        if self.type_name.is_empty() || self.type_name.len() > u16::MAX as usize {
            return Err(FlowError::layout("type name must be 1..=65535 bytes"));
        }
        if self.fields.len() > u16::MAX as usize {
            return Err(FlowError::layout("too many fields"));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() || field.name.len() > u16::MAX as usize {
                return Err(FlowError::layout(format!("field #{i} has an invalid name")));
            }
            if field.shape.len() > u8::MAX as usize {
                return Err(FlowError::layout(format!("field '{}' has too many dimensions", field.name)));
            }
            if field.shape.iter().any(|&d| d > u32::MAX as usize) {
                return Err(FlowError::layout(format!("field '{}' dimension exceeds u32", field.name)));
            }
            if self.fields[..i].iter().any(|other| other.name == field.name) {
                return Err(FlowError::layout(format!("duplicate field '{}'", field.name)));
            }
        }
        Ok(())
    }
}

/// Placement of one field inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    pub kind: FieldKind,
    pub offset: usize,
    pub count: usize,
}

impl FieldSlot {
    pub fn byte_len(&self) -> usize {
        self.count * self.kind.size()
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.byte_len()
    }
}

/// Offset table computed from a [`FieldSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    slots: Vec<FieldSlot>,
    names: Vec<String>,
    size: usize,
    version_tag: u64,
}

/// Payload storage alignment; every field alignment divides it.
pub const PAYLOAD_ALIGN: usize = 16;

/// Largest payload a layout may describe.
pub const MAX_PAYLOAD: usize = 1 << 30;

impl Layout {
    pub fn compute(spec: &FieldSpec) -> FlowResult<Self> {
        spec.validate()?;

        let mut offset = 0usize;
        let mut slots = Vec::with_capacity(spec.fields.len());
        let mut names = Vec::with_capacity(spec.fields.len());
        for field in &spec.fields {
            let align = field.kind.align();
            offset = (offset + align - 1) & !(align - 1);
            let count = field
                .shape
                .iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| FlowError::layout(format!("field '{}' is too large", field.name)))?;
            slots.push(FieldSlot {
                kind: field.kind,
                offset,
                count,
            });
            names.push(field.name.clone());
            offset = count
                .checked_mul(field.kind.size())
                .and_then(|len| offset.checked_add(len))
                .filter(|&end| end <= MAX_PAYLOAD)
                .ok_or_else(|| {
                    FlowError::layout(format!(
                        "field '{}' takes the payload past {MAX_PAYLOAD} bytes",
                        field.name
                    ))
                })?;
        }
        let size = (offset + PAYLOAD_ALIGN - 1) & !(PAYLOAD_ALIGN - 1);

        Ok(Self {
            slots,
            names,
            size,
            version_tag: spec.version_tag(),
        })
    }

    /// Payload size in bytes, padded to [`PAYLOAD_ALIGN`].
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn version_tag(&self) -> u64 {
        self.version_tag
    }

    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    pub fn lookup(&self, name: &str) -> Option<FieldSlot> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.slots[i])
    }
}
