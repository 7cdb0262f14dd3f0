//! Input-device-sharing protocol.
//!
//! Clients share abstract input devices (tracking type, buttons,
//! valuators, 6-DoF pose plus ray direction and velocities) and the tools
//! bound to them. Device changes travel as delta messages gated by an
//! 8-bit mask; everything is batched between ticks and carried inside the
//! base protocol's update messages.

mod client;
mod server;

pub use client::DevicesClient;
pub use server::DevicesServer;

use std::io;

use conclave_proto::pipe::protocol_error;
use conclave_proto::{PipeReader, PipeWriter};
use conclave_types::{RigidTransform, Vector};

/// Protocol name binding the two plugin halves.
pub const PROTOCOL_NAME: &str = "devices";
/// Protocol version carried in the connect payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message ids, relative to the plugin's negotiated base.
pub const CREATE_DEVICE: u16 = 0;
pub const DESTROY_DEVICE: u16 = 1;
pub const CREATE_TOOL: u16 = 2;
pub const DESTROY_TOOL: u16 = 3;
pub const DEVICE_STATES: u16 = 4;
pub const NUM_MESSAGES: u16 = 5;

/// Bits naming which parts of a device state changed.
pub mod device_mask {
    pub const NO_CHANGE: u8 = 0x00;
    pub const RAY_DIRECTION: u8 = 0x01;
    pub const TRANSFORM: u8 = 0x02;
    pub const VELOCITY: u8 = 0x04;
    pub const BUTTON: u8 = 0x08;
    pub const VALUATOR: u8 = 0x10;
    pub const FULL_UPDATE: u8 = 0x1f;
}

/// State of one shared input device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub track_type: i32,
    pub num_buttons: u32,
    pub num_valuators: u32,
    /// Cumulative update mask (bits from [`device_mask`]).
    pub update_mask: u8,
    /// Preferred ray direction in device space.
    pub ray_direction: Vector,
    /// Pose in the owning client's physical space.
    pub transform: RigidTransform,
    pub linear_velocity: Vector,
    pub angular_velocity: Vector,
    /// Button flags, bit-packed.
    pub button_states: Vec<u8>,
    pub valuator_states: Vec<f32>,
}

impl DeviceState {
    pub fn new(track_type: i32, num_buttons: u32, num_valuators: u32) -> Self {
        DeviceState {
            track_type,
            num_buttons,
            num_valuators,
            update_mask: device_mask::NO_CHANGE,
            ray_direction: Vector::new(0.0, 1.0, 0.0),
            transform: RigidTransform::IDENTITY,
            linear_velocity: Vector::ZERO,
            angular_velocity: Vector::ZERO,
            button_states: vec![0; ((num_buttons + 7) / 8) as usize],
            valuator_states: vec![0.0; num_valuators as usize],
        }
    }

    /// Create a device from the layout fields on the wire.
    pub fn read_layout(pipe: &mut PipeReader) -> io::Result<DeviceState> {
        let track_type = pipe.read_i32()?;
        let num_buttons = pipe.read_u32()?;
        let num_valuators = pipe.read_u32()?;
        if num_buttons > 256 || num_valuators > 256 {
            return Err(protocol_error("implausible device layout"));
        }
        Ok(DeviceState::new(track_type, num_buttons, num_valuators))
    }

    pub fn write_layout(&self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_i32(self.track_type)?;
        pipe.write_u32(self.num_buttons)?;
        pipe.write_u32(self.num_valuators)
    }

    /// Apply a delta from the wire; the received mask accumulates.
    pub fn read_delta(&mut self, pipe: &mut PipeReader) -> io::Result<()> {
        let update = pipe.read_u8()?;
        if update & device_mask::RAY_DIRECTION != 0 {
            self.ray_direction = pipe.read_vector()?;
        }
        if update & device_mask::TRANSFORM != 0 {
            self.transform = pipe.read_rigid()?;
        }
        if update & device_mask::VELOCITY != 0 {
            self.linear_velocity = pipe.read_vector()?;
            self.angular_velocity = pipe.read_vector()?;
        }
        if update & device_mask::BUTTON != 0 {
            pipe.read_bytes(&mut self.button_states)?;
        }
        if update & device_mask::VALUATOR != 0 {
            for v in self.valuator_states.iter_mut() {
                *v = pipe.read_f32()?;
            }
        }
        self.update_mask |= update;
        Ok(())
    }

    /// Write a delta under the given mask.
    pub fn write_delta(&self, update: u8, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_u8(update)?;
        if update & device_mask::RAY_DIRECTION != 0 {
            pipe.write_vector(self.ray_direction)?;
        }
        if update & device_mask::TRANSFORM != 0 {
            pipe.write_rigid(self.transform)?;
        }
        if update & device_mask::VELOCITY != 0 {
            pipe.write_vector(self.linear_velocity)?;
            pipe.write_vector(self.angular_velocity)?;
        }
        if update & device_mask::BUTTON != 0 {
            pipe.write_bytes(&self.button_states)?;
        }
        if update & device_mask::VALUATOR != 0 {
            for v in &self.valuator_states {
                pipe.write_f32(*v)?;
            }
        }
        Ok(())
    }

    pub fn button(&self, index: u32) -> bool {
        self.button_states[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    pub fn set_button(&mut self, index: u32, pressed: bool) {
        let byte = (index / 8) as usize;
        let bit = 1u8 << (index % 8);
        let current = self.button_states[byte] & bit != 0;
        if current != pressed {
            if pressed {
                self.button_states[byte] |= bit;
            } else {
                self.button_states[byte] &= !bit;
            }
            self.update_mask |= device_mask::BUTTON;
        }
    }

    pub fn set_valuator(&mut self, index: u32, value: f32) {
        if self.valuator_states[index as usize] != value {
            self.valuator_states[index as usize] = value;
            self.update_mask |= device_mask::VALUATOR;
        }
    }
}

/// One input slot of a tool: a device and a button/valuator index on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub device_id: u32,
    pub index: u32,
}

/// A tool bound to shared devices.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolState {
    pub class_name: String,
    pub button_slots: Vec<Slot>,
    pub valuator_slots: Vec<Slot>,
}

impl ToolState {
    pub fn read(pipe: &mut PipeReader) -> io::Result<ToolState> {
        fn read_slots(pipe: &mut PipeReader) -> io::Result<Vec<Slot>> {
            let count = pipe.read_u32()?;
            if count > 256 {
                return Err(protocol_error("implausible tool layout"));
            }
            let mut slots = Vec::with_capacity(count as usize);
            for _ in 0..count {
                slots.push(Slot {
                    device_id: pipe.read_u32()?,
                    index: pipe.read_u32()?,
                });
            }
            Ok(slots)
        }
        let class_name = pipe.read_string()?;
        let button_slots = read_slots(pipe)?;
        let valuator_slots = read_slots(pipe)?;
        Ok(ToolState {
            class_name,
            button_slots,
            valuator_slots,
        })
    }

    pub fn write(&self, pipe: &mut PipeWriter) -> io::Result<()> {
        pipe.write_string(&self.class_name)?;
        pipe.write_u32(self.button_slots.len() as u32)?;
        for slot in &self.button_slots {
            pipe.write_u32(slot.device_id)?;
            pipe.write_u32(slot.index)?;
        }
        pipe.write_u32(self.valuator_slots.len() as u32)?;
        for slot in &self.valuator_slots {
            pipe.write_u32(slot.device_id)?;
            pipe.write_u32(slot.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn device_delta_roundtrip() {
        let mut source = DeviceState::new(0, 10, 3);
        source.set_button(9, true);
        source.set_valuator(2, 0.75);
        source.ray_direction = Vector::new(0.0, 0.0, 1.0);
        source.update_mask |= device_mask::RAY_DIRECTION;

        let mut buf = Vec::new();
        source
            .write_delta(source.update_mask, &mut PipeWriter::new(&mut buf))
            .unwrap();

        let mut dest = DeviceState::new(0, 10, 3);
        let mut cur = Cursor::new(buf);
        dest.read_delta(&mut PipeReader::new(&mut cur, false)).unwrap();
        assert!(dest.button(9));
        assert!(!dest.button(0));
        assert_eq!(dest.valuator_states[2], 0.75);
        assert_eq!(dest.ray_direction, Vector::new(0.0, 0.0, 1.0));
        assert_eq!(
            dest.update_mask,
            device_mask::RAY_DIRECTION | device_mask::BUTTON | device_mask::VALUATOR
        );
    }

    #[test]
    fn unchanged_fields_do_not_travel() {
        let source = DeviceState::new(0, 8, 0);
        let mut buf = Vec::new();
        source
            .write_delta(device_mask::NO_CHANGE, &mut PipeWriter::new(&mut buf))
            .unwrap();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn tool_roundtrip() {
        let tool = ToolState {
            class_name: "RayMenuTool".into(),
            button_slots: vec![Slot { device_id: 1, index: 0 }],
            valuator_slots: vec![
                Slot { device_id: 1, index: 0 },
                Slot { device_id: 2, index: 1 },
            ],
        };
        let mut buf = Vec::new();
        tool.write(&mut PipeWriter::new(&mut buf)).unwrap();
        let mut cur = Cursor::new(buf);
        let got = ToolState::read(&mut PipeReader::new(&mut cur, false)).unwrap();
        assert_eq!(got, tool);
    }
}
