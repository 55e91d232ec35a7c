//! HIMS Braille Sense / Sync Braille and the Inceptor, which share the
//! fixed 10-byte input frame.

use log::debug;
use std::time::Duration;

use super::{Identity, Model, Variant};
use crate::error::Result;
use crate::framer::{sum8, FrameFormat, Framer, LengthRule, Policy};
use crate::gio::{Descriptor, Endpoint, SerialParameters, UsbChannelDefinition};
use crate::identify::{Probe, Response};

pub const BAUD: u32 = 115200;

const START: u8 = 0xFA;
const END: u8 = 0xFB;
const LINE_FEED: u8 = 0x0A;
const PACKET_SIZE: usize = 10;
const OUTPUT_OVERHEAD: usize = 18;

/// Sync Braille and Inceptor columns come from the `Cells` reply.
pub const MODELS: &[Model] = &[
    Model::new(1, "Braille Sense", 32, 0, 1),
    Model::new(2, "Sync Braille", 0, 0, 1),
];

pub const INCEPTOR_MODELS: &[Model] = &[Model::new(1, "Inceptor", 0, 0, 1)];

pub fn descriptor() -> Descriptor {
    let mut descriptor = Descriptor::default();
    descriptor.serial.parameters = Some(SerialParameters::with_baud(BAUD));
    descriptor.usb.channels = vec![
        UsbChannelDefinition {
            data: Some(&MODELS[0]),
            ..UsbChannelDefinition::new(0x045E, 0x930A)
        },
        UsbChannelDefinition {
            data: Some(&MODELS[1]),
            ..UsbChannelDefinition::new(0x0403, 0x6001)
        },
    ];
    descriptor.bluetooth.channel = 4;
    descriptor
}

pub fn inceptor_descriptor() -> Descriptor {
    let mut descriptor = Descriptor::default();
    descriptor.serial.parameters = Some(SerialParameters::with_baud(BAUD));
    descriptor.usb.channels = vec![UsbChannelDefinition {
        output_endpoint: 1,
        data: Some(&INCEPTOR_MODELS[0]),
        ..UsbChannelDefinition::new(0x1209, 0xABC0)
    }];
    descriptor.bluetooth.channel = 1;
    descriptor
}

/// `FA type count data r0 r1 r2 r3 chk FB`
pub fn format(variant: Variant) -> FrameFormat {
    let format = FrameFormat::new(&[START], LengthRule::Fixed(PACKET_SIZE)).with_terminator(END);
    match variant {
        Variant::Inceptor => format
            .with_checksum(2, sum8, Policy::Strict)
            // the Bluetooth firmware sends a LF after each packet
            .ignoring(&[LINE_FEED]),
        _ => format.with_checksum(2, sum8, Policy::Lenient),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPacket {
    Cursor(u8),
    Keys(u16),
    Cells(u8),
}

impl InputPacket {
    pub fn decode(packet: &[u8]) -> Option<Self> {
        if packet.len() != PACKET_SIZE || packet[0] != START {
            return None;
        }
        match packet[1] {
            0x00 => Some(InputPacket::Cursor(packet[3])),
            0x01 => Some(InputPacket::Keys(u16::from_le_bytes([packet[4], packet[5]]))),
            0x02 => Some(InputPacket::Cells(packet[3])),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPacket<'a> {
    pub kind: u8,
    pub mode: u8,
    pub data1: &'a [u8],
    pub data2: &'a [u8],
}

impl<'a> OutputPacket<'a> {
    pub fn cells_request(zeros: &'a [u8]) -> Self {
        OutputPacket {
            kind: 0xFB,
            mode: 0x01,
            data1: zeros,
            data2: &[],
        }
    }

    pub fn display(cells: &'a [u8]) -> Self {
        OutputPacket {
            kind: 0xFC,
            mode: 0x01,
            data1: cells,
            data2: &[],
        }
    }

    /// `type type mode F0 len1 data1 F1 F2 len2 data2 F3 00 00 00 00 chk FD FD`
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data1.len() + self.data2.len() + OUTPUT_OVERHEAD);
        bytes.extend_from_slice(&[self.kind, self.kind, self.mode, 0xF0]);
        bytes.extend_from_slice(&(self.data1.len() as u16).to_le_bytes());
        bytes.extend_from_slice(self.data1);
        bytes.extend_from_slice(&[0xF1, 0xF2]);
        bytes.extend_from_slice(&(self.data2.len() as u16).to_le_bytes());
        bytes.extend_from_slice(self.data2);
        bytes.extend_from_slice(&[0xF3, 0, 0, 0, 0, 0]);
        let checksum = bytes.len() - 1;
        bytes.extend_from_slice(&[0xFD, 0xFD]);
        bytes[checksum] = sum8(&bytes);
        bytes
    }
}

/// Asks for the cell count, which both variants answer with a `Cells` packet.
pub struct HimsProbe {
    variant: Variant,
    model: Model,
}

impl HimsProbe {
    pub fn new(variant: Variant) -> Self {
        let model = match variant {
            Variant::Inceptor => INCEPTOR_MODELS[0],
            _ => MODELS[0],
        };
        HimsProbe { variant, model }
    }

    fn request_size(&self) -> usize {
        match self.variant {
            Variant::Inceptor => 20,
            _ => 32,
        }
    }
}

impl Probe for HimsProbe {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn format(&self) -> FrameFormat {
        format(self.variant)
    }

    fn attempts(&self) -> usize {
        2
    }

    fn window(&self) -> Duration {
        Duration::from_millis(1000)
    }

    fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()> {
        // serial and bluetooth links only reach the Braille Sense
        if let Some(model) = endpoint.tag::<Model>() {
            self.model = *model;
        }
        let zeros = vec![0; self.request_size()];
        framer.write_packet(endpoint, &OutputPacket::cells_request(&zeros).encode())?;
        Ok(())
    }

    fn handle(&mut self, packet: &[u8]) -> Response {
        match InputPacket::decode(packet) {
            Some(InputPacket::Cells(0)) => {
                debug!("{} reported no cells", self.model.name);
                Response::Unexpected
            }
            Some(InputPacket::Cells(count)) => Response::Done(Identity::new(Model {
                text_columns: count,
                ..self.model
            })),
            _ => Response::Unexpected,
        }
    }
}
