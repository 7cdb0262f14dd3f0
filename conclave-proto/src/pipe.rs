//! Endian-aware wire primitives over a duplex byte stream.
//!
//! Writers always emit the host's native byte order. After a connection is
//! established both sides send [`ENDIAN_MARKER`]; a reader that receives the
//! marker byte-swapped flags "swap on read" and byte-swaps every multi-byte
//! primitive from then on. All scalars on the wire are 32-bit floats, all
//! cardinals 32-bit unsigned, strings length-prefixed without a terminator.

use std::io::{self, Read, Write};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use conclave_types::{OrthoTransform, Plane, Point, RigidTransform, Rotation, Vector};

/// Marker exchanged after connect to detect a byte-order mismatch.
pub const ENDIAN_MARKER: u16 = 0x4D43;

/// Upper bound on length-prefixed strings; anything larger is treated as a
/// framing error rather than an allocation request.
const MAX_STRING_LEN: u32 = 1 << 16;

/// Build the error used for any violation of the wire protocol. Such errors
/// are fatal for the connection they occur on and must never propagate to
/// other connections.
pub fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Reading half of a message pipe.
///
/// Borrows the connection's underlying (typically buffered) stream together
/// with the connection's swap flag, so the same primitives work over a TCP
/// stream, an in-memory batch buffer, or a test cursor.
pub struct PipeReader<'a> {
    inner: &'a mut dyn Read,
    swap: bool,
}

impl<'a> PipeReader<'a> {
    pub fn new(inner: &'a mut dyn Read, swap: bool) -> Self {
        PipeReader { inner, swap }
    }

    /// Whether this pipe byte-swaps multi-byte primitives on read.
    pub fn must_swap(&self) -> bool {
        self.swap
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    pub fn read_i8(&mut self) -> io::Result<i8> {
        self.inner.read_i8()
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let v = self.inner.read_u16::<NativeEndian>()?;
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn read_i16(&mut self) -> io::Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let v = self.inner.read_u32::<NativeEndian>()?;
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        let v = self.inner.read_u64::<NativeEndian>()?;
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> io::Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> io::Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)
    }

    /// Consume and discard exactly `n` bytes.
    pub fn skip(&mut self, n: usize) -> io::Result<()> {
        io::copy(&mut Read::take(&mut *self.inner, n as u64), &mut io::sink()).and_then(|copied| {
            if copied == n as u64 {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short read while skipping payload",
                ))
            }
        })
    }

    pub fn read_string(&mut self) -> io::Result<String> {
        let len = self.read_u32()?;
        if len > MAX_STRING_LEN {
            return Err(protocol_error(format!("string length {} exceeds limit", len)));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| protocol_error("string is not valid UTF-8"))
    }

    pub fn read_message_id(&mut self) -> io::Result<u16> {
        self.read_u16()
    }

    pub fn read_point(&mut self) -> io::Result<Point> {
        Ok(Point([self.read_f32()?, self.read_f32()?, self.read_f32()?]))
    }

    pub fn read_vector(&mut self) -> io::Result<Vector> {
        Ok(Vector([self.read_f32()?, self.read_f32()?, self.read_f32()?]))
    }

    pub fn read_rotation(&mut self) -> io::Result<Rotation> {
        Ok(Rotation([
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ]))
    }

    pub fn read_rigid(&mut self) -> io::Result<RigidTransform> {
        Ok(RigidTransform {
            translation: self.read_vector()?,
            rotation: self.read_rotation()?,
        })
    }

    pub fn read_ortho(&mut self) -> io::Result<OrthoTransform> {
        Ok(OrthoTransform {
            translation: self.read_vector()?,
            rotation: self.read_rotation()?,
            scale: self.read_f32()?,
        })
    }

    pub fn read_plane(&mut self) -> io::Result<Plane> {
        Ok(Plane {
            normal: self.read_vector()?,
            offset: self.read_f32()?,
        })
    }
}

/// Writing half of a message pipe. Always writes native byte order; the
/// receiving side swaps as negotiated.
pub struct PipeWriter<'a> {
    inner: &'a mut dyn Write,
}

impl<'a> PipeWriter<'a> {
    pub fn new(inner: &'a mut dyn Write) -> Self {
        PipeWriter { inner }
    }

    pub fn write_u8(&mut self, v: u8) -> io::Result<()> {
        self.inner.write_u8(v)
    }

    pub fn write_i8(&mut self, v: i8) -> io::Result<()> {
        self.inner.write_i8(v)
    }

    pub fn write_u16(&mut self, v: u16) -> io::Result<()> {
        self.inner.write_u16::<NativeEndian>(v)
    }

    pub fn write_i16(&mut self, v: i16) -> io::Result<()> {
        self.inner.write_i16::<NativeEndian>(v)
    }

    pub fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.inner.write_u32::<NativeEndian>(v)
    }

    pub fn write_i32(&mut self, v: i32) -> io::Result<()> {
        self.inner.write_i32::<NativeEndian>(v)
    }

    pub fn write_u64(&mut self, v: u64) -> io::Result<()> {
        self.inner.write_u64::<NativeEndian>(v)
    }

    pub fn write_i64(&mut self, v: i64) -> io::Result<()> {
        self.inner.write_i64::<NativeEndian>(v)
    }

    pub fn write_f32(&mut self, v: f32) -> io::Result<()> {
        self.write_u32(v.to_bits())
    }

    pub fn write_f64(&mut self, v: f64) -> io::Result<()> {
        self.write_u64(v.to_bits())
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)
    }

    pub fn write_string(&mut self, s: &str) -> io::Result<()> {
        self.write_u32(s.len() as u32)?;
        self.inner.write_all(s.as_bytes())
    }

    pub fn write_message_id(&mut self, id: u16) -> io::Result<()> {
        self.write_u16(id)
    }

    pub fn write_point(&mut self, p: Point) -> io::Result<()> {
        for c in p.0 {
            self.write_f32(c)?;
        }
        Ok(())
    }

    pub fn write_vector(&mut self, v: Vector) -> io::Result<()> {
        for c in v.0 {
            self.write_f32(c)?;
        }
        Ok(())
    }

    pub fn write_rotation(&mut self, r: Rotation) -> io::Result<()> {
        for c in r.0 {
            self.write_f32(c)?;
        }
        Ok(())
    }

    pub fn write_rigid(&mut self, t: RigidTransform) -> io::Result<()> {
        self.write_vector(t.translation)?;
        self.write_rotation(t.rotation)
    }

    pub fn write_ortho(&mut self, t: OrthoTransform) -> io::Result<()> {
        self.write_vector(t.translation)?;
        self.write_rotation(t.rotation)?;
        self.write_f32(t.scale)
    }

    pub fn write_plane(&mut self, p: Plane) -> io::Result<()> {
        self.write_vector(p.normal)?;
        self.write_f32(p.offset)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Send this side's endian marker.
pub fn send_endian_marker(stream: &mut dyn Write) -> io::Result<()> {
    stream.write_u16::<NativeEndian>(ENDIAN_MARKER)?;
    stream.flush()
}

/// Read the peer's endian marker; returns the swap-on-read flag for this
/// connection.
pub fn read_endian_marker(stream: &mut dyn Read) -> io::Result<bool> {
    let marker = stream.read_u16::<NativeEndian>()?;
    if marker == ENDIAN_MARKER {
        Ok(false)
    } else if marker == ENDIAN_MARKER.swap_bytes() {
        Ok(true)
    } else {
        Err(protocol_error(format!("bad endian marker 0x{:04x}", marker)))
    }
}

/// An in-memory message batch.
///
/// Plugins append messages between ticks; the engine writes the batch as an
/// opaque `<u32 size><bytes>` run so receivers lacking the plugin can skip
/// it without desynchronising the framing.
#[derive(Default)]
pub struct MessageBuffer {
    data: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        MessageBuffer::default()
    }

    /// Borrow a pipe writer appending to the buffer.
    pub fn writer(&mut self) -> PipeWriter<'_> {
        PipeWriter::new(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Emit the batch as a size-prefixed opaque payload.
    pub fn write_to(&self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_u32(self.data.len() as u32)?;
        pipe.write_bytes(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn scalar_roundtrip_same_endian() {
        let mut buf = Vec::new();
        {
            let mut w = PipeWriter::new(&mut buf);
            w.write_u16(0xBEEF).unwrap();
            w.write_u32(0xDEAD_BEEF).unwrap();
            w.write_i64(-123_456_789_012).unwrap();
            w.write_f32(std::f32::consts::PI).unwrap();
            w.write_string("viewer-0").unwrap();
        }
        let mut cur = Cursor::new(buf);
        let mut r = PipeReader::new(&mut cur, false);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_i64().unwrap(), -123_456_789_012);
        assert_eq!(r.read_f32().unwrap(), std::f32::consts::PI);
        assert_eq!(r.read_string().unwrap(), "viewer-0");
    }

    #[test]
    fn scalar_roundtrip_swapped_endian() {
        // Pre-swap everything the writer emits, as a foreign-endian peer
        // would produce, and check the swapping reader recovers the values.
        let mut buf = Vec::new();
        {
            let mut w = PipeWriter::new(&mut buf);
            w.write_u16(0x1234u16.swap_bytes()).unwrap();
            w.write_u32(0x0A0B0C0Du32.swap_bytes()).unwrap();
            w.write_u64(0x0102030405060708u64.swap_bytes()).unwrap();
            w.write_u32(1.5f32.to_bits().swap_bytes()).unwrap();
        }
        let mut cur = Cursor::new(buf);
        let mut r = PipeReader::new(&mut cur, true);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0x0A0B0C0D);
        assert_eq!(r.read_u64().unwrap(), 0x0102030405060708);
        assert_eq!(r.read_f32().unwrap(), 1.5);
    }

    #[test]
    fn swapped_strings_swap_only_the_length() {
        let mut buf = Vec::new();
        {
            let mut w = PipeWriter::new(&mut buf);
            w.write_u32(5u32.swap_bytes()).unwrap();
            w.write_bytes(b"hello").unwrap();
        }
        let mut cur = Cursor::new(buf);
        let mut r = PipeReader::new(&mut cur, true);
        assert_eq!(r.read_string().unwrap(), "hello");
    }

    #[test]
    fn geometry_roundtrip() {
        use conclave_types::{OrthoTransform, Rotation, Vector};
        let t = OrthoTransform::new(
            Vector::new(1.0, 2.0, 3.0),
            Rotation::from_axis_angle(Vector::new(0.0, 0.0, 1.0), 0.5),
            2.5,
        );
        let mut buf = Vec::new();
        PipeWriter::new(&mut buf).write_ortho(t).unwrap();
        assert_eq!(buf.len(), 8 * 4);
        let mut cur = Cursor::new(buf);
        let got = PipeReader::new(&mut cur, false).read_ortho().unwrap();
        assert_eq!(got, t);
    }

    #[test]
    fn endian_marker_detection() {
        let mut native = Vec::new();
        send_endian_marker(&mut native).unwrap();
        assert!(!read_endian_marker(&mut Cursor::new(native.clone())).unwrap());

        let swapped: Vec<u8> = native.iter().rev().copied().collect();
        assert!(read_endian_marker(&mut Cursor::new(swapped)).unwrap());

        let garbage = vec![0xFFu8, 0xFF];
        assert!(read_endian_marker(&mut Cursor::new(garbage)).is_err());
    }

    #[test]
    fn skip_consumes_exact_bytes() {
        let mut buf = Vec::new();
        {
            let mut w = PipeWriter::new(&mut buf);
            w.write_bytes(&[0u8; 17]).unwrap();
            w.write_u32(42).unwrap();
        }
        let mut cur = Cursor::new(buf);
        let mut r = PipeReader::new(&mut cur, false);
        r.skip(17).unwrap();
        assert_eq!(r.read_u32().unwrap(), 42);
        assert!(r.skip(1).is_err());
    }

    #[test]
    fn message_buffer_is_size_prefixed() {
        let mut batch = MessageBuffer::new();
        {
            let mut w = batch.writer();
            w.write_message_id(3).unwrap();
            w.write_u32(7).unwrap();
        }
        let mut out = Vec::new();
        batch.write_to(&mut PipeWriter::new(&mut out)).unwrap();

        let mut cur = Cursor::new(out);
        let mut r = PipeReader::new(&mut cur, false);
        assert_eq!(r.read_u32().unwrap(), 6);
        assert_eq!(r.read_message_id().unwrap(), 3);
        assert_eq!(r.read_u32().unwrap(), 7);
    }

    #[test]
    fn oversized_string_is_a_protocol_error() {
        let mut buf = Vec::new();
        PipeWriter::new(&mut buf).write_u32(u32::MAX).unwrap();
        let mut cur = Cursor::new(buf);
        let err = PipeReader::new(&mut cur, false).read_string().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
