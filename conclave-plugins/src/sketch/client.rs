//! Client half of the annotation protocol.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Cursor};

use conclave_proto::pipe::protocol_error;
use conclave_proto::{ClientPlugin, MessageBuffer, PipeReader, PipeWriter};
use conclave_types::{ClientId, Point};

use super::{
    Curve, ADD_CURVE, APPEND_POINT, DELETE_ALL_CURVES, DELETE_CURVE, NUM_MESSAGES, PROTOCOL_NAME,
    PROTOCOL_VERSION, UPDATE_END,
};

/// Client-side annotation plugin.
///
/// Local edits append to an outgoing batch drained with each CLIENT_UPDATE;
/// remote clients' curves are mirrored in id-keyed maps for the renderer.
pub struct SketchClient {
    message_id_base: u16,
    next_curve_id: u32,
    local_curves: HashMap<u32, Curve>,
    remotes: HashMap<ClientId, HashMap<u32, Curve>>,
    batch: MessageBuffer,
}

impl SketchClient {
    pub fn new() -> Self {
        SketchClient {
            message_id_base: 0,
            next_curve_id: 1,
            local_curves: HashMap::new(),
            remotes: HashMap::new(),
            batch: MessageBuffer::new(),
        }
    }

    /// Start a new stroke; vertices are appended with
    /// [`append_point`](SketchClient::append_point).
    pub fn add_curve(&mut self, line_width: f32, color: [u8; 3]) -> u32 {
        let id = self.next_curve_id;
        self.next_curve_id += 1;
        let curve = Curve::new(line_width, color);

        let mut w = self.batch.writer();
        let _ = w.write_message_id(ADD_CURVE);
        let _ = w.write_u32(id);
        let _ = curve.write(&mut w);
        self.local_curves.insert(id, curve);
        id
    }

    /// Append a vertex to a local stroke.
    pub fn append_point(&mut self, id: u32, vertex: Point) {
        let curve = match self.local_curves.get_mut(&id) {
            Some(curve) => curve,
            None => return,
        };
        let index = curve.vertices.len() as u32;
        curve.vertices.push(vertex);

        let mut w = self.batch.writer();
        let _ = w.write_message_id(APPEND_POINT);
        let _ = w.write_u32(id);
        let _ = w.write_u32(index);
        let _ = w.write_point(vertex);
    }

    /// Delete one local stroke.
    pub fn delete_curve(&mut self, id: u32) {
        if self.local_curves.remove(&id).is_some() {
            let mut w = self.batch.writer();
            let _ = w.write_message_id(DELETE_CURVE);
            let _ = w.write_u32(id);
        }
    }

    /// Delete all local strokes.
    pub fn delete_all_curves(&mut self) {
        self.local_curves.clear();
        let mut w = self.batch.writer();
        let _ = w.write_message_id(DELETE_ALL_CURVES);
    }

    /// The local curve set.
    pub fn local_curves(&self) -> &HashMap<u32, Curve> {
        &self.local_curves
    }

    /// The mirrored curves of one remote client.
    pub fn remote_curves(&self, id: ClientId) -> Option<&HashMap<u32, Curve>> {
        self.remotes.get(&id)
    }

    fn apply_batch(
        curves: &mut HashMap<u32, Curve>,
        data: &[u8],
        swap: bool,
    ) -> io::Result<bool> {
        let len = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let mut changed = false;
        while cursor.position() < len {
            let mut r = PipeReader::new(&mut cursor, swap);
            match r.read_message_id()? {
                ADD_CURVE => {
                    let id = r.read_u32()?;
                    curves.insert(id, Curve::read(&mut r)?);
                    changed = true;
                }
                APPEND_POINT => {
                    let id = r.read_u32()?;
                    let index = r.read_u32()?;
                    let vertex = r.read_point()?;
                    let curve = curves.get_mut(&id).ok_or_else(|| {
                        protocol_error(format!("sketch: vertex for unknown curve {}", id))
                    })?;
                    if index as usize != curve.vertices.len() {
                        return Err(protocol_error("sketch: vertex index out of sequence"));
                    }
                    curve.vertices.push(vertex);
                    changed = true;
                }
                DELETE_CURVE => {
                    let id = r.read_u32()?;
                    curves.remove(&id);
                    changed = true;
                }
                DELETE_ALL_CURVES => {
                    curves.clear();
                    changed = true;
                }
                other => {
                    return Err(protocol_error(format!(
                        "sketch: unknown batched message {}",
                        other
                    )));
                }
            }
        }
        Ok(changed)
    }
}

impl Default for SketchClient {
    fn default() -> Self {
        SketchClient::new()
    }
}

impl ClientPlugin for SketchClient {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn num_messages(&self) -> u16 {
        NUM_MESSAGES
    }

    fn message_id_base(&self) -> u16 {
        self.message_id_base
    }

    fn set_message_id_base(&mut self, base: u16) {
        self.message_id_base = base;
    }

    fn send_connect_request(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_u32(4)?;
        pipe.write_u32(PROTOCOL_VERSION)
    }

    fn receive_client_connect(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<()> {
        let mut curves = HashMap::new();
        let count = pipe.read_u32()?;
        for _ in 0..count {
            let id = pipe.read_u32()?;
            curves.insert(id, Curve::read(pipe)?);
        }
        self.remotes.insert(remote, curves);
        Ok(())
    }

    fn disconnect_client(&mut self, remote: ClientId) {
        self.remotes.remove(&remote);
    }

    fn send_client_update(&mut self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_bytes(self.batch.as_slice())?;
        self.batch.clear();
        pipe.write_message_id(UPDATE_END)
    }

    fn receive_server_update(&mut self, remote: ClientId, pipe: &mut PipeReader) -> io::Result<bool> {
        let size = pipe.read_u32()?;
        let mut data = vec![0u8; size as usize];
        pipe.read_bytes(&mut data)?;
        let swap = pipe.must_swap();
        match self.remotes.get_mut(&remote) {
            Some(curves) => Self::apply_batch(curves, &data, swap),
            None => Err(protocol_error(format!(
                "sketch: update for unknown client {}",
                remote
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::SketchServer;
    use conclave_proto::ServerPlugin;

    fn new_server_state(server: &SketchServer) -> conclave_proto::PluginState {
        let mut buf = Vec::new();
        PipeWriter::new(&mut buf).write_u32(PROTOCOL_VERSION).unwrap();
        let mut cur = Cursor::new(buf);
        server
            .receive_connect_request(4, &mut PipeReader::new(&mut cur, false))
            .unwrap()
            .expect("connect accepted")
    }

    #[test]
    fn stroke_propagates_to_peer() {
        let mut author = SketchClient::new();
        let id = author.add_curve(2.0, [0, 255, 0]);
        author.append_point(id, Point::new(0.0, 0.0, 0.0));
        author.append_point(id, Point::new(0.0, 1.0, 0.0));

        let mut update = Vec::new();
        author
            .send_client_update(&mut PipeWriter::new(&mut update))
            .unwrap();

        let server = SketchServer::new();
        let mut state = new_server_state(&server);
        let mut update_cur = Cursor::new(update);
        server
            .receive_client_update(&mut state, &mut PipeReader::new(&mut update_cur, false))
            .unwrap();

        let mut dest_state = new_server_state(&server);
        let mut fanout = Vec::new();
        server
            .send_server_update(&mut state, &mut dest_state, &mut PipeWriter::new(&mut fanout))
            .unwrap();

        let mut viewer = SketchClient::new();
        let peer = ClientId::new(3);
        viewer.remotes.insert(peer, HashMap::new());
        let mut fanout_cur = Cursor::new(fanout);
        assert!(viewer
            .receive_server_update(peer, &mut PipeReader::new(&mut fanout_cur, false))
            .unwrap());

        let curves = viewer.remote_curves(peer).unwrap();
        assert_eq!(curves.len(), 1);
        let curve = curves.values().next().unwrap();
        assert_eq!(curve.vertices.len(), 2);
        assert_eq!(curve.color, [0, 255, 0]);
    }

    #[test]
    fn late_joiner_receives_full_curve_set() {
        let mut author = SketchClient::new();
        let id = author.add_curve(1.0, [10, 20, 30]);
        author.append_point(id, Point::new(1.0, 1.0, 1.0));

        let mut update = Vec::new();
        author
            .send_client_update(&mut PipeWriter::new(&mut update))
            .unwrap();

        let server = SketchServer::new();
        let mut state = new_server_state(&server);
        let mut update_cur = Cursor::new(update);
        server
            .receive_client_update(&mut state, &mut PipeReader::new(&mut update_cur, false))
            .unwrap();

        // A client joining later gets the curves via CLIENT_CONNECT.
        let mut dest_state = new_server_state(&server);
        let mut connect = Vec::new();
        server
            .send_client_connect(&mut state, &mut dest_state, &mut PipeWriter::new(&mut connect))
            .unwrap();

        let mut late = SketchClient::new();
        let peer = ClientId::new(9);
        let mut connect_cur = Cursor::new(connect);
        late.receive_client_connect(peer, &mut PipeReader::new(&mut connect_cur, false))
            .unwrap();
        let curves = late.remote_curves(peer).unwrap();
        assert_eq!(curves.values().next().unwrap().vertices.len(), 1);
    }

    #[test]
    fn deleting_another_clients_curves_is_not_expressible() {
        // The wire format scopes every message to the sending client's own
        // curve set; there is no id space for foreign curves.
        let mut client = SketchClient::new();
        client.delete_curve(42); // unknown id: no message is batched
        let mut update = Vec::new();
        client
            .send_client_update(&mut PipeWriter::new(&mut update))
            .unwrap();
        assert_eq!(update.len(), 2); // just UPDATE_END
    }
}
