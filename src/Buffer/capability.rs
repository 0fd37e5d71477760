//! Capabilities a concrete buffer type offers to links and the
//! redistribution engine.

use bytes::{Buf, BufMut};

use super::Buffer::{swap_field, ByteOrder, StreamBuffer};
use crate::error::{FlowError, FlowResult, TransportFault};

/// Encode to and decode from the self-describing wire blob.
pub trait Serializable {
    /// Append the encoded form to `out`.
    fn encode(&self, out: &mut Vec<u8>) -> FlowResult<()>;
    /// Decode `bytes` into `self`, reusing its storage.
    fn decode(&mut self, bytes: &[u8]) -> FlowResult<()>;
}

/// Access to the per-unit sequence counter.
pub trait Streamable {
    fn sequence(&self) -> u64;
    fn set_sequence(&mut self, sequence: u64);
}

/// Splits into a fixed number of sub-messages for the transpose path.
///
/// Part 0 is always the small header; the remaining parts carry bulk data.
pub trait Transposable {
    const PARTS: usize;

    /// Fill `parts[i]` with sub-message `i`, reusing each vector.
    fn split_parts(&self, parts: &mut [Vec<u8>]) -> FlowResult<()>;

    /// Rebuild `self` from sub-messages produced by `split_parts`.
    fn assemble_parts(&mut self, parts: &[Vec<u8>]) -> FlowResult<()>;
}

impl Serializable for StreamBuffer {
    fn encode(&self, out: &mut Vec<u8>) -> FlowResult<()> {
        self.serialize_into(out)
    }

    fn decode(&mut self, bytes: &[u8]) -> FlowResult<()> {
        self.deserialize_into(bytes)
    }
}

impl Streamable for StreamBuffer {
    fn sequence(&self) -> u64 {
        StreamBuffer::sequence(self)
    }

    fn set_sequence(&mut self, sequence: u64) {
        StreamBuffer::set_sequence(self, sequence)
    }
}

fn malformed_part(message: String) -> FlowError {
    FlowError::transport("transpose", TransportFault::Malformed, message)
}

// header part: [version_tag u64][sequence u64][extra_len u64][extra]
// payload part: payload in wire order
impl Transposable for StreamBuffer {
    const PARTS: usize = 2;

    fn split_parts(&self, parts: &mut [Vec<u8>]) -> FlowResult<()> {
        if parts.len() != Self::PARTS {
            return Err(FlowError::layout(format!(
                "expected {} parts, got {}",
                Self::PARTS,
                parts.len()
            )));
        }
        let layout = self.require_layout()?;

        let header = &mut parts[0];
        header.clear();
        header.put_u64_le(layout.version_tag());
        header.put_u64_le(self.sequence);
        header.put_u64_le(self.extra.len() as u64);
        header.put_slice(&self.extra);

        let body = &mut parts[1];
        body.clear();
        body.put_slice(self.payload());
        if self.order != ByteOrder::WIRE {
            for slot in layout.slots() {
                swap_field(&mut body[slot.range()], slot.kind.swap_unit());
            }
        }
        Ok(())
    }

    fn assemble_parts(&mut self, parts: &[Vec<u8>]) -> FlowResult<()> {
        if parts.len() != Self::PARTS {
            return Err(FlowError::layout(format!(
                "expected {} parts, got {}",
                Self::PARTS,
                parts.len()
            )));
        }
        let expected = self.require_layout()?.version_tag();

        let mut header: &[u8] = &parts[0];
        if header.remaining() < 24 {
            return Err(malformed_part(format!("header part is {} bytes", header.len())));
        }
        let found = header.get_u64_le();
        if found != expected {
            return Err(FlowError::ProtocolMismatch { expected, found });
        }
        let sequence = header.get_u64_le();
        let extra_len = header.get_u64_le() as usize;
        if header.remaining() != extra_len {
            return Err(malformed_part(format!(
                "header announces {extra_len} extra bytes, carries {}",
                header.remaining()
            )));
        }

        let body = &parts[1];
        if body.len() != self.payload().len() {
            return Err(malformed_part(format!(
                "payload part is {} bytes, layout expects {}",
                body.len(),
                self.payload().len()
            )));
        }

        self.payload_mut().copy_from_slice(body);
        self.order = ByteOrder::WIRE;
        self.extra.clear();
        self.extra.extend_from_slice(header);
        self.sequence = sequence;
        self.swap_bytes(ByteOrder::NATIVE)
    }
}
