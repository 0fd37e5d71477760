// The typed, versioned unit of streaming data.

use std::fmt;

use super::layout::{FieldKind, FieldSlot, FieldSpec, Layout, PAYLOAD_ALIGN};
use crate::error::{FlowError, FlowResult};

/// Byte order of a payload in memory or on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    #[cfg(target_endian = "little")]
    pub const NATIVE: ByteOrder = ByteOrder::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: ByteOrder = ByteOrder::Big;

    /// The canonical order used on the wire.
    pub const WIRE: ByteOrder = ByteOrder::Little;
}

/// Element types that may be viewed through [`StreamBuffer::field`].
///
/// # Safety
/// Implementors must be plain-old-data whose size equals `KIND.size()` and
/// whose alignment divides `KIND.align()`; every bit pattern must be valid.
pub unsafe trait Scalar: Copy + 'static {
    const KIND: FieldKind;
}

unsafe impl Scalar for u8 {
    const KIND: FieldKind = FieldKind::U8;
}
unsafe impl Scalar for i8 {
    const KIND: FieldKind = FieldKind::I8;
}
unsafe impl Scalar for u16 {
    const KIND: FieldKind = FieldKind::U16;
}
unsafe impl Scalar for i16 {
    const KIND: FieldKind = FieldKind::I16;
}
unsafe impl Scalar for u32 {
    const KIND: FieldKind = FieldKind::U32;
}
unsafe impl Scalar for i32 {
    const KIND: FieldKind = FieldKind::I32;
}
unsafe impl Scalar for u64 {
    const KIND: FieldKind = FieldKind::U64;
}
unsafe impl Scalar for i64 {
    const KIND: FieldKind = FieldKind::I64;
}
unsafe impl Scalar for f32 {
    const KIND: FieldKind = FieldKind::F32;
}
unsafe impl Scalar for f64 {
    const KIND: FieldKind = FieldKind::F64;
}
unsafe impl Scalar for [f32; 2] {
    const KIND: FieldKind = FieldKind::ComplexF32;
}
unsafe impl Scalar for [f64; 2] {
    const KIND: FieldKind = FieldKind::ComplexF64;
}

/// Storage unit guaranteeing `PAYLOAD_ALIGN` alignment of the arena.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub(crate) struct Block(pub(crate) [u8; PAYLOAD_ALIGN]);

/// A typed, versioned block of memory carrying one unit of streaming data.
///
/// The payload is a single owned allocation addressed through the
/// [`Layout`] offset table; its shape is fixed by [`init`](Self::init) and the
/// allocation is reused for every later exchange. The optional extra payload
/// carries data whose size is only known at run time.
#[derive(Clone)]
pub struct StreamBuffer {
    pub(crate) spec: Option<FieldSpec>,
    pub(crate) layout: Option<Layout>,
    pub(crate) storage: Vec<Block>,
    pub(crate) extra: Vec<u8>,
    pub(crate) sequence: u64,
    pub(crate) order: ByteOrder,
}

impl StreamBuffer {
    /// An uninitialised buffer; call [`init`](Self::init) before use.
    pub fn new() -> Self {
        Self {
            spec: None,
            layout: None,
            storage: Vec::new(),
            extra: Vec::new(),
            sequence: 0,
            order: ByteOrder::NATIVE,
        }
    }

    pub fn with_spec(spec: &FieldSpec) -> FlowResult<Self> {
        let mut buffer = Self::new();
        buffer.init(spec)?;
        Ok(buffer)
    }

    /// Allocate the payload and fix its layout.
    ///
    /// Calling `init` again with an identical spec is a no-op that keeps the
    /// current contents; any other spec is a layout error.
    pub fn init(&mut self, spec: &FieldSpec) -> FlowResult<()> {
        if let Some(current) = &self.spec {
            if current == spec {
                return Ok(());
            }
            return Err(FlowError::layout(format!(
                "buffer already initialised as '{}' rev {}; cannot re-init as '{}' rev {}",
                current.type_name, current.revision, spec.type_name, spec.revision
            )));
        }

        let layout = Layout::compute(spec)?;
        self.storage = vec![Block([0u8; PAYLOAD_ALIGN]); layout.size() / PAYLOAD_ALIGN];
        self.layout = Some(layout);
        self.spec = Some(spec.clone());
        self.order = ByteOrder::NATIVE;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.layout.is_some()
    }

    pub fn spec(&self) -> Option<&FieldSpec> {
        self.spec.as_ref()
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub(crate) fn require_layout(&self) -> FlowResult<&Layout> {
        self.layout
            .as_ref()
            .ok_or_else(|| FlowError::layout("buffer used before init()"))
    }

    pub fn version_tag(&self) -> Option<u64> {
        self.layout.as_ref().map(Layout::version_tag)
    }

    /// Raw payload bytes in the buffer's current byte order.
    pub fn payload(&self) -> &[u8] {
        let len = self.storage.len() * PAYLOAD_ALIGN;
        // Safety: Block is repr(C) over a byte array, so the arena is
        // `len` contiguous initialised bytes.
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr() as *const u8, len) }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.storage.len() * PAYLOAD_ALIGN;
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_mut_ptr() as *mut u8, len) }
    }

    pub fn extra(&self) -> &[u8] {
        &self.extra
    }

    /// Mutable access to the variable-length side channel.
    pub fn extra_mut(&mut self) -> &mut Vec<u8> {
        &mut self.extra
    }

    /// Replace the extra payload, reusing its allocation.
    pub fn set_extra(&mut self, bytes: &[u8]) {
        self.extra.clear();
        self.extra.extend_from_slice(bytes);
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Bump the sequence counter for the next unit and return the new value.
    pub fn advance_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    fn typed_slot<T: Scalar>(&self, name: &str) -> FlowResult<FieldSlot> {
        let layout = self.require_layout()?;
        let slot = layout
            .lookup(name)
            .ok_or_else(|| FlowError::layout(format!("no field named '{name}'")))?;
        if slot.kind != T::KIND {
            return Err(FlowError::layout(format!(
                "field '{name}' holds {}, not {}",
                slot.kind,
                T::KIND
            )));
        }
        if self.order != ByteOrder::NATIVE {
            return Err(FlowError::layout(format!(
                "field '{name}' viewed while payload is in {:?} order",
                self.order
            )));
        }
        Ok(slot)
    }

    /// Typed read-only view of one field.
    pub fn field<T: Scalar>(&self, name: &str) -> FlowResult<&[T]> {
        let slot = self.typed_slot::<T>(name)?;
        let bytes = &self.payload()[slot.range()];
        // Safety: the offset is aligned to T's alignment, the arena is
        // PAYLOAD_ALIGN aligned, and the range holds exactly `count` Ts.
        Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, slot.count) })
    }

    /// Typed mutable view of one field.
    pub fn field_mut<T: Scalar>(&mut self, name: &str) -> FlowResult<&mut [T]> {
        let slot = self.typed_slot::<T>(name)?;
        let bytes = &mut self.payload_mut()[slot.range()];
        Ok(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, slot.count) })
    }

    /// Zero the payload and drop the extra payload, keeping both allocations.
    pub fn clear(&mut self) {
        self.payload_mut().fill(0);
        self.extra.clear();
    }

    /// Convert the payload to `target` order. Idempotent: converting to the
    /// order the payload is already in does nothing.
    pub fn swap_bytes(&mut self, target: ByteOrder) -> FlowResult<()> {
        if self.order == target {
            return Ok(());
        }
        let layout = self
            .layout
            .take()
            .ok_or_else(|| FlowError::layout("buffer used before init()"))?;
        let payload = self.payload_mut();
        for slot in layout.slots() {
            swap_field(&mut payload[slot.range()], slot.kind.swap_unit());
        }
        self.layout = Some(layout);
        self.order = target;
        Ok(())
    }
}

/// Reverse each `unit`-sized group of bytes in place.
pub(crate) fn swap_field(bytes: &mut [u8], unit: usize) {
    if unit > 1 {
        for chunk in bytes.chunks_exact_mut(unit) {
            chunk.reverse();
        }
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StreamBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec
            && self.order == other.order
            && self.sequence == other.sequence
            && self.payload() == other.payload()
            && self.extra == other.extra
    }
}

impl fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("type", &self.spec.as_ref().map(|s| s.type_name.as_str()))
            .field("revision", &self.spec.as_ref().map(|s| s.revision))
            .field("version_tag", &self.version_tag().map(|t| format!("{t:#018x}")))
            .field("payload_len", &self.payload().len())
            .field("extra_len", &self.extra.len())
            .field("sequence", &self.sequence)
            .field("order", &self.order)
            .finish()
    }
}
