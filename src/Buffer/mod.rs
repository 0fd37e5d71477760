pub mod Buffer;
pub mod Buffer_impl;
pub mod capability;
pub mod layout;

pub use capability::{Serializable, Streamable, Transposable};
pub use layout::{FieldDescriptor, FieldKind, FieldSlot, FieldSpec, Layout, MAX_PAYLOAD, PAYLOAD_ALIGN};
pub use Buffer::{ByteOrder, Scalar, StreamBuffer}; // re-export for stable path
pub use Buffer_impl::WIRE_MAGIC;
