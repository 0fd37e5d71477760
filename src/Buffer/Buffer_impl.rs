// Wire codec for StreamBuffer.
//
// [magic "RTFB"][version_tag u64][type_name: u16 len + bytes][revision u32]
// [field_count u16]{ [name: u16 len + bytes][kind u8][ndims u8][dims u32 * ndims] }
// [sequence u64][payload_len u64][payload][extra_len u64][extra]
//
// Every integer and every payload element is little endian.

use bytes::{Buf, BufMut};

use super::layout::{FieldDescriptor, FieldKind, FieldSpec, Layout};
use super::Buffer::{swap_field, ByteOrder, StreamBuffer};
use crate::error::{FlowError, FlowResult, TransportFault};

/// Leading bytes of every serialized buffer.
pub const WIRE_MAGIC: [u8; 4] = *b"RTFB";

fn malformed(message: impl Into<String>) -> FlowError {
    FlowError::transport("wire", TransportFault::Malformed, message)
}

#[inline]
fn need(buf: &&[u8], n: usize, what: &str) -> FlowResult<()> {
    if buf.remaining() < n {
        return Err(malformed(format!(
            "truncated frame: {what} needs {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_len_u64(buf: &mut &[u8], what: &str) -> FlowResult<usize> {
    need(buf, 8, what)?;
    let len = buf.get_u64_le();
    usize::try_from(len).map_err(|_| malformed(format!("{what} length {len} overflows")))
}

/// Wire fields preceding the payload, borrowed from the frame.
struct Preamble<'a> {
    version_tag: u64,
    type_name: &'a str,
    revision: u32,
    descriptors: &'a [u8],
    field_count: usize,
}

fn read_preamble<'a>(buf: &mut &'a [u8]) -> FlowResult<Preamble<'a>> {
    need(buf, 4, "magic")?;
    if buf[..4] != WIRE_MAGIC {
        return Err(malformed("bad magic"));
    }
    buf.advance(4);

    need(buf, 8, "version tag")?;
    let version_tag = buf.get_u64_le();

    need(buf, 2, "type name length")?;
    let name_len = buf.get_u16_le() as usize;
    need(buf, name_len, "type name")?;
    let type_name = std::str::from_utf8(&buf[..name_len])
        .map_err(|_| malformed("type name is not valid utf-8"))?;
    buf.advance(name_len);

    need(buf, 4, "revision")?;
    let revision = buf.get_u32_le();

    need(buf, 2, "field count")?;
    let field_count = buf.get_u16_le() as usize;

    // Walk the descriptor table without allocating; keep the raw bytes.
    let start: &'a [u8] = *buf;
    for _ in 0..field_count {
        need(buf, 2, "field name length")?;
        let len = buf.get_u16_le() as usize;
        need(buf, len + 2, "field descriptor")?;
        buf.advance(len + 1);
        let ndims = buf.get_u8() as usize;
        need(buf, ndims * 4, "field shape")?;
        buf.advance(ndims * 4);
    }
    let consumed = start.len() - buf.len();

    Ok(Preamble {
        version_tag,
        type_name,
        revision,
        descriptors: &start[..consumed],
        field_count,
    })
}

fn parse_descriptors(mut raw: &[u8], count: usize) -> FlowResult<Vec<FieldDescriptor>> {
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        // Bounds were checked by read_preamble.
        let len = raw.get_u16_le() as usize;
        let name = std::str::from_utf8(&raw[..len])
            .map_err(|_| malformed("field name is not valid utf-8"))?
            .to_string();
        raw.advance(len);
        let code = raw.get_u8();
        let kind = FieldKind::from_code(code)
            .ok_or_else(|| malformed(format!("unknown field kind {code}")))?;
        let ndims = raw.get_u8() as usize;
        let shape = (0..ndims).map(|_| raw.get_u32_le() as usize).collect();
        fields.push(FieldDescriptor { name, kind, shape });
    }
    Ok(fields)
}

/// Walks `[sequence][payload_len][payload][extra_len][extra]` without
/// copying and checks it is exactly one body for a `payload_len` payload.
fn check_body(mut buf: &[u8], payload_len: usize) -> FlowResult<()> {
    need(&buf, 8, "sequence")?;
    buf.advance(8);

    let declared = get_len_u64(&mut buf, "payload")?;
    if declared != payload_len {
        return Err(malformed(format!(
            "payload is {declared} bytes, layout expects {payload_len}"
        )));
    }
    need(&buf, payload_len, "payload")?;
    buf.advance(payload_len);

    let extra_len = get_len_u64(&mut buf, "extra payload")?;
    need(&buf, extra_len, "extra payload")?;
    buf.advance(extra_len);

    if buf.has_remaining() {
        return Err(malformed(format!("{} trailing bytes", buf.remaining())));
    }
    Ok(())
}

impl StreamBuffer {
    /// Exact size of the serialized form.
    pub fn encoded_len(&self) -> usize {
        let spec_len = self.spec.as_ref().map_or(0, |spec| {
            2 + spec.type_name.len()
                + 4
                + 2
                + spec
                    .fields
                    .iter()
                    .map(|f| 2 + f.name.len() + 2 + 4 * f.shape.len())
                    .sum::<usize>()
        });
        4 + 8 + spec_len + 8 + 8 + self.payload().len() + 8 + self.extra.len()
    }

    /// Serialize into a fresh blob.
    pub fn serialize(&self) -> FlowResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.serialize_into(&mut out)?;
        Ok(out)
    }

    /// Append the serialized form to `out`. Does not allocate when `out`
    /// already has room.
    pub fn serialize_into(&self, out: &mut Vec<u8>) -> FlowResult<()> {
        let layout = self.require_layout()?;
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| FlowError::layout("buffer used before init()"))?;

        out.reserve(self.encoded_len());
        out.put_slice(&WIRE_MAGIC);
        out.put_u64_le(layout.version_tag());
        out.put_u16_le(spec.type_name.len() as u16);
        out.put_slice(spec.type_name.as_bytes());
        out.put_u32_le(spec.revision);
        out.put_u16_le(spec.fields.len() as u16);
        for field in &spec.fields {
            out.put_u16_le(field.name.len() as u16);
            out.put_slice(field.name.as_bytes());
            out.put_u8(field.kind.code());
            out.put_u8(field.shape.len() as u8);
            for dim in &field.shape {
                out.put_u32_le(*dim as u32);
            }
        }
        out.put_u64_le(self.sequence);
        out.put_u64_le(self.payload().len() as u64);
        let start = out.len();
        out.put_slice(self.payload());
        if self.order != ByteOrder::WIRE {
            for slot in layout.slots() {
                let range = slot.range();
                swap_field(
                    &mut out[start + range.start..start + range.end],
                    slot.kind.swap_unit(),
                );
            }
        }
        out.put_u64_le(self.extra.len() as u64);
        out.put_slice(&self.extra);
        Ok(())
    }

    /// Rebuild a buffer from a self-describing blob, in native byte order.
    pub fn deserialize(bytes: &[u8]) -> FlowResult<StreamBuffer> {
        Self::deserialize_as(bytes, ByteOrder::NATIVE)
    }

    /// Rebuild a buffer whose payload ends up in `host` order, as a host of
    /// that endianness would see it.
    pub fn deserialize_as(bytes: &[u8], host: ByteOrder) -> FlowResult<StreamBuffer> {
        let mut buf = bytes;
        let pre = read_preamble(&mut buf)?;
        let spec = FieldSpec {
            type_name: pre.type_name.to_string(),
            revision: pre.revision,
            fields: parse_descriptors(pre.descriptors, pre.field_count)?,
        };
        let computed = spec.version_tag();
        if computed != pre.version_tag {
            return Err(FlowError::ProtocolMismatch {
                expected: computed,
                found: pre.version_tag,
            });
        }

        let layout = Layout::compute(&spec).map_err(|e| malformed(e.to_string()))?;
        check_body(buf, layout.size())?;

        let mut buffer = StreamBuffer::with_spec(&spec)?;
        buffer.read_body(&mut buf)?;
        buffer.swap_bytes(host)?;
        Ok(buffer)
    }

    /// Steady-state receive path: decode into this already-initialised
    /// buffer, reusing its payload and extra allocations.
    ///
    /// The version tag on the wire must match this buffer's type.
    pub fn deserialize_into(&mut self, bytes: &[u8]) -> FlowResult<()> {
        let expected = self.require_layout()?.version_tag();
        let mut buf = bytes;
        let pre = read_preamble(&mut buf)?;
        if pre.version_tag != expected {
            return Err(FlowError::ProtocolMismatch {
                expected,
                found: pre.version_tag,
            });
        }
        self.read_body(&mut buf)?;
        self.swap_bytes(ByteOrder::NATIVE)
    }

    /// Copies a body already accepted by [`check_body`]; the buffer is left
    /// untouched when the frame is rejected.
    fn read_body(&mut self, buf: &mut &[u8]) -> FlowResult<()> {
        check_body(*buf, self.payload().len())?;
        let sequence = buf.get_u64_le();
        let payload_len = buf.get_u64_le() as usize;
        self.payload_mut().copy_from_slice(&buf[..payload_len]);
        self.order = ByteOrder::WIRE;
        buf.advance(payload_len);

        let extra_len = buf.get_u64_le() as usize;
        self.extra.clear();
        self.extra.extend_from_slice(&buf[..extra_len]);
        buf.advance(extra_len);
        self.sequence = sequence;
        Ok(())
    }

    /// Version tag of a serialized blob without decoding the rest.
    pub fn peek_version_tag(bytes: &[u8]) -> FlowResult<u64> {
        let mut buf = bytes;
        need(&buf, 12, "header")?;
        if buf[..4] != WIRE_MAGIC {
            return Err(malformed("bad magic"));
        }
        buf.advance(4);
        Ok(buf.get_u64_le())
    }

    /// Layout matching a serialized blob, for receivers that size buffers
    /// from the first frame they see.
    pub fn peek_layout(bytes: &[u8]) -> FlowResult<(FieldSpec, Layout)> {
        let mut buf = bytes;
        let pre = read_preamble(&mut buf)?;
        let spec = FieldSpec {
            type_name: pre.type_name.to_string(),
            revision: pre.revision,
            fields: parse_descriptors(pre.descriptors, pre.field_count)?,
        };
        let layout = Layout::compute(&spec)?;
        Ok((spec, layout))
    }
}
