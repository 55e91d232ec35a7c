//! Alva ABT, Delphi and Satellite displays (protocol 1).

use log::error;
use std::sync::Arc;
use std::time::Duration;

use super::{find_model, Identity, Model, Variant};
use crate::error::Result;
use crate::framer::{Expect, FrameFormat, Framer, LengthRule};
use crate::gio::{Descriptor, Endpoint, SerialParameters, UsbChannelDefinition};
use crate::identify::{Probe, Response};

pub const BAUD: u32 = 9600;

const ESCAPE: u8 = 0x1B;
const PACKET: u8 = 0x7F;
const FILLER: u8 = 0x7E;
const CARRIAGE_RETURN: u8 = b'\r';
const ID_PREFIX: [u8; 4] = [ESCAPE, b'I', b'D', b'='];

const fn packet_size(count: u8) -> usize {
    count as usize * 2 + 4
}

pub const MODELS: &[Model] = &[
    Model::new(0x00, "ABT 320", 20, 3, 1),
    Model::new(0x01, "ABT 340", 40, 3, 1),
    Model::new(0x02, "ABT 340 Desktop", 40, 5, 1),
    Model::new(0x03, "ABT 380", 80, 5, 1),
    Model::new(0x04, "ABT 382 Twin Space", 80, 5, 1),
    Model::new(0x0A, "Delphi 420", 20, 3, 1),
    Model::new(0x0B, "Delphi 440", 40, 3, 1),
    Model::new(0x0C, "Delphi 440 Desktop", 40, 5, 1),
    Model::new(0x0D, "Delphi 480", 80, 5, 1),
    Model::new(0x0E, "Satellite 544", 40, 3, 1),
    Model::new(0x0F, "Satellite 570 Pro", 66, 3, 1),
    Model::new(0x10, "Satellite 584 Pro", 80, 3, 1),
    Model::new(0x11, "Satellite 544 Traveller", 40, 3, 1),
    Model::new(0x13, "Braille System 40", 40, 0, 1),
];

pub fn descriptor() -> Descriptor {
    let mut descriptor = Descriptor::default();
    descriptor.serial.parameters = Some(SerialParameters::with_baud(BAUD));
    descriptor.usb.channels = vec![UsbChannelDefinition::new(0x06B0, 0x0001)];
    descriptor
}

fn expect(packet: &[u8]) -> Expect {
    let offset = packet.len() - 1;
    let byte = packet[offset];

    match packet[0] {
        PACKET => {
            if offset > 0 && offset % 2 == 0 && byte != FILLER {
                return Expect::Invalid;
            }
            match packet.get(3) {
                Some(&count) => Expect::Length(packet_size(count)),
                None => Expect::More,
            }
        }
        ESCAPE => match ID_PREFIX.get(offset) {
            Some(&expected) if expected != byte => Expect::Invalid,
            _ => Expect::Length(ID_PREFIX.len() + 1),
        },
        _ => Expect::Length(2),
    }
}

/// `7F type 7E n 7E v1 .. 7E vn`, `ESC I D = id` and two-byte `7x key`.
pub fn format() -> FrameFormat {
    let mut start = vec![ESCAPE];
    start.extend(0x70..=0x7F);
    FrameFormat::new(&start, LengthRule::Lookup(Arc::new(expect)))
        .ignoring(&[0x00])
        .with_max_length(packet_size(0xFF))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputPacket {
    Identity(u8),
    /// `values[0]` is the value count.
    Values { kind: u8, values: Vec<u8> },
    Key { kind: u8, code: u8 },
}

impl InputPacket {
    pub fn decode(packet: &[u8]) -> Option<Self> {
        match packet {
            [ESCAPE, b'I', b'D', b'=', id] => Some(InputPacket::Identity(*id)),
            [PACKET, kind, rest @ ..] if rest.len() % 2 == 0 => Some(InputPacket::Values {
                kind: *kind,
                values: rest.iter().skip(1).step_by(2).copied().collect(),
            }),
            [kind, code] if kind & 0xF0 == 0x70 => Some(InputPacket::Key {
                kind: *kind,
                code: *code,
            }),
            _ => None,
        }
    }
}

/// `ESC F U N code CR`
pub fn function(code: u8) -> [u8; 6] {
    [ESCAPE, b'F', b'U', b'N', code, CARRIAGE_RETURN]
}

pub const IDENTIFY_FUNCTION: u8 = 0x06;

pub struct AlvaProbe;

impl AlvaProbe {
    pub fn new() -> Self {
        AlvaProbe
    }
}

impl Default for AlvaProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for AlvaProbe {
    fn variant(&self) -> Variant {
        Variant::Alva
    }

    fn format(&self) -> FrameFormat {
        format()
    }

    fn attempts(&self) -> usize {
        3
    }

    fn window(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()> {
        framer.write_packet(endpoint, &function(IDENTIFY_FUNCTION))?;
        Ok(())
    }

    fn handle(&mut self, packet: &[u8]) -> Response {
        match InputPacket::decode(packet) {
            Some(InputPacket::Identity(id)) => match find_model(MODELS, id) {
                Some(model) => Response::Done(Identity::new(model)),
                None => {
                    error!("detected unknown Alva model with ID {:02X} (hex)", id);
                    Response::Fail
                }
            },
            _ => Response::Unexpected,
        }
    }
}
