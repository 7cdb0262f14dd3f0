//! Shared-annotation protocol.
//!
//! Each client owns a set of single-stroke curves in the shared
//! navigational frame. Curve creation, vertex appends, and deletions
//! travel as batched action messages terminated by UPDATE_END; authorship
//! is implicit in the client id the server attaches to each fan-out block,
//! so the wire format cannot delete another client's curves.

mod client;
mod server;

pub use client::SketchClient;
pub use server::SketchServer;

use std::io;

use conclave_proto::pipe::protocol_error;
use conclave_proto::{PipeReader, PipeWriter};
use conclave_types::Point;

/// Protocol name binding the two plugin halves.
pub const PROTOCOL_NAME: &str = "sketch";
/// Protocol version carried in the connect payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message ids, relative to the plugin's negotiated base.
pub const ADD_CURVE: u16 = 0;
pub const APPEND_POINT: u16 = 1;
pub const DELETE_CURVE: u16 = 2;
pub const DELETE_ALL_CURVES: u16 = 3;
pub const UPDATE_END: u16 = 4;
pub const NUM_MESSAGES: u16 = 5;

const MAX_CURVE_VERTICES: u32 = 1 << 20;

/// A single annotation stroke.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    /// Cosmetic line width.
    pub line_width: f32,
    /// RGB color.
    pub color: [u8; 3],
    /// Vertices in the shared navigational frame.
    pub vertices: Vec<Point>,
}

impl Curve {
    pub fn new(line_width: f32, color: [u8; 3]) -> Self {
        Curve {
            line_width,
            color,
            vertices: Vec::new(),
        }
    }

    pub fn read(pipe: &mut PipeReader) -> io::Result<Curve> {
        let line_width = pipe.read_f32()?;
        let mut color = [0u8; 3];
        pipe.read_bytes(&mut color)?;
        let count = pipe.read_u32()?;
        if count > MAX_CURVE_VERTICES {
            return Err(protocol_error("implausible curve vertex count"));
        }
        let mut vertices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            vertices.push(pipe.read_point()?);
        }
        Ok(Curve {
            line_width,
            color,
            vertices,
        })
    }

    pub fn write(&self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_f32(self.line_width)?;
        pipe.write_bytes(&self.color)?;
        pipe.write_u32(self.vertices.len() as u32)?;
        for vertex in &self.vertices {
            pipe.write_point(*vertex)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn curve_roundtrip() {
        let mut curve = Curve::new(3.0, [255, 128, 0]);
        curve.vertices.push(Point::new(0.0, 0.0, 0.0));
        curve.vertices.push(Point::new(1.0, 2.0, 3.0));

        let mut buf = Vec::new();
        curve.write(&mut PipeWriter::new(&mut buf)).unwrap();
        let mut cur = Cursor::new(buf);
        let got = Curve::read(&mut PipeReader::new(&mut cur, false)).unwrap();
        assert_eq!(got, curve);
    }
}
