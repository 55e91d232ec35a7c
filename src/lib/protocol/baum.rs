//! Baum Vario family: doubled-escape framing, responses sized by code.

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use super::{Identity, Model, Variant};
use crate::error::Result;
use crate::framer::{Expect, FrameFormat, Framer, LengthRule};
use crate::gio::{Descriptor, Endpoint, SerialParameters, UsbChannelDefinition};
use crate::identify::{Probe, Response};

pub const BAUD: u32 = 19200;
pub const ESCAPE: u8 = 0x1B;
pub const MAXIMUM_CELL_COUNT: u8 = 84;

const DEVICE_IDENTITY_LENGTH: usize = 16;
const SERIAL_NUMBER_LENGTH: usize = 8;
const BLUETOOTH_NAME_LENGTH: usize = 14;

pub const MODELS: &[Model] = &[
    Model::new(1, "Vario 40", 40, 0, 1),
    Model::new(2, "PocketVario", 24, 0, 1),
    Model::new(3, "SuperVario 40", 40, 0, 1),
    Model::new(4, "SuperVario 32", 32, 0, 1),
    Model::new(5, "SuperVario 64", 64, 0, 1),
    Model::new(6, "SuperVario 80", 80, 0, 1),
    Model::new(7, "VarioPro 80", 80, 0, 1),
    Model::new(8, "VarioPro 64", 64, 0, 1),
    Model::new(9, "VarioPro 40", 40, 0, 1),
    Model::new(10, "EcoVario 24", 24, 0, 1),
    Model::new(11, "EcoVario 40", 40, 0, 1),
    Model::new(12, "VarioConnect 40", 40, 0, 1),
    Model::new(13, "VarioConnect 32", 32, 0, 1),
    Model::new(14, "VarioConnect 24", 24, 0, 1),
    Model::new(15, "VarioConnect 64", 64, 0, 1),
    Model::new(16, "VarioConnect 80", 80, 0, 1),
    Model::new(17, "EcoVario 32", 32, 0, 1),
    Model::new(18, "EcoVario 64", 64, 0, 1),
    Model::new(19, "EcoVario 80", 80, 0, 1),
    Model::new(20, "Refreshabraille 18", 18, 0, 1),
    Model::new(21, "Inka", 56, 0, 1),
    Model::new(22, "DM80P", 84, 0, 1),
];

const INKA: Model = MODELS[20];
const DM80P: Model = MODELS[21];
const GENERIC: Model = Model::new(0, "Baum", 0, 0, 1);

// (vendor, product, index into MODELS)
const USB_CHANNELS: &[(u16, u16, usize)] = &[
    (0x0403, 0xFE70, 0),
    (0x0403, 0xFE71, 1),
    (0x0403, 0xFE72, 2),
    (0x0403, 0xFE73, 3),
    (0x0403, 0xFE74, 4),
    (0x0403, 0xFE75, 5),
    (0x0403, 0xFE76, 6),
    (0x0403, 0xFE77, 7),
    (0x0904, 0x2000, 8),
    (0x0904, 0x2001, 9),
    (0x0904, 0x2002, 10),
    (0x0904, 0x2007, 11),
    (0x0904, 0x2008, 12),
    (0x0904, 0x2009, 13),
    (0x0904, 0x2010, 14),
    (0x0904, 0x2011, 15),
    (0x0904, 0x2012, 8),
    (0x0904, 0x2014, 16),
    (0x0904, 0x2015, 17),
    (0x0904, 0x2016, 18),
    (0x0904, 0x3000, 19),
];

pub fn descriptor() -> Descriptor {
    let mut descriptor = Descriptor::default();
    descriptor.serial.parameters = Some(SerialParameters::with_baud(BAUD));
    descriptor.usb.channels = USB_CHANNELS
        .iter()
        .map(|&(vendor, product, model)| UsbChannelDefinition {
            serial: Some(SerialParameters::with_baud(BAUD)),
            data: Some(&MODELS[model]),
            ..UsbChannelDefinition::new(vendor, product)
        })
        .collect();
    descriptor
}

mod code {
    pub const CELL_COUNT: u8 = 0x01;
    pub const VERSION_NUMBER: u8 = 0x05;
    pub const GET_KEYS: u8 = 0x08;
    pub const MODE_SETTING: u8 = 0x11;
    pub const SET_MODE: u8 = 0x12;
    pub const COMMUNICATION_CHANNEL: u8 = 0x16;
    pub const POWERDOWN: u8 = 0x17;
    pub const HORIZONTAL_SENSORS: u8 = 0x20;
    pub const VERTICAL_SENSORS: u8 = 0x21;
    pub const ROUTING_KEYS: u8 = 0x22;
    pub const SWITCHES: u8 = 0x23;
    pub const TOP_KEYS: u8 = 0x24;
    pub const HORIZONTAL_SENSOR: u8 = 0x25;
    pub const VERTICAL_SENSOR: u8 = 0x26;
    pub const ROUTING_KEY: u8 = 0x27;
    pub const FRONT_KEYS_6: u8 = 0x28;
    pub const BACK_KEYS_6: u8 = 0x29;
    pub const COMMAND_KEYS: u8 = 0x2B;
    pub const FRONT_KEYS_10: u8 = 0x2C;
    pub const BACK_KEYS_10: u8 = 0x2D;
    pub const ENTRY_KEYS: u8 = 0x33;
    pub const JOYSTICK: u8 = 0x34;
    pub const ERROR_CODE: u8 = 0x40;
    pub const DEVICE_IDENTITY: u8 = 0x84;
    pub const SERIAL_NUMBER: u8 = 0x8A;
    pub const BLUETOOTH_NAME: u8 = 0x8C;
}

fn key_group_size(count: u8) -> usize {
    (count as usize + 7) / 8
}

/// What the length rule needs to know about the display.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Zero until known.
    pub cells: u8,
    pub inka: bool,
}

impl Layout {
    /// Total size of a response starting with `code`, escape excluded.
    pub fn response_length(&self, code: u8) -> Option<usize> {
        use code::*;

        let length = match code {
            CELL_COUNT | VERSION_NUMBER | COMMUNICATION_CHANNEL | POWERDOWN | SWITCHES | TOP_KEYS
            | HORIZONTAL_SENSOR | ROUTING_KEY | FRONT_KEYS_6 | BACK_KEYS_6 | COMMAND_KEYS | JOYSTICK
            | ERROR_CODE => 2,
            MODE_SETTING | FRONT_KEYS_10 | BACK_KEYS_10 | ENTRY_KEYS => 3,
            VERTICAL_SENSOR if self.inka => 2,
            VERTICAL_SENSOR => 3,
            VERTICAL_SENSORS | SERIAL_NUMBER => 1 + SERIAL_NUMBER_LENGTH,
            BLUETOOTH_NAME => 1 + BLUETOOTH_NAME_LENGTH,
            DEVICE_IDENTITY => 1 + DEVICE_IDENTITY_LENGTH,
            // an Inka is the only display that sends these unasked
            ROUTING_KEYS if self.inka || self.cells == 0 => 2,
            ROUTING_KEYS | HORIZONTAL_SENSORS => key_group_size(self.cells) + 1,
            _ => return None,
        };
        Some(length)
    }
}

pub fn format(layout: Layout) -> FrameFormat {
    let lookup = move |packet: &[u8]| match layout.response_length(packet[0]) {
        Some(length) => Expect::Length(length),
        None => Expect::Unknown,
    };
    FrameFormat::escaped(ESCAPE, LengthRule::Lookup(Arc::new(lookup)))
}

fn text_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputPacket {
    CellCount(u8),
    VersionNumber(u8),
    Switches(u8),
    RoutingKeys(Vec<u8>),
    DeviceIdentity(String),
    SerialNumber(String),
    BluetoothName(String),
    Other { code: u8, data: Vec<u8> },
}

impl InputPacket {
    pub fn decode(packet: &[u8]) -> Option<Self> {
        let (&code, data) = packet.split_first()?;
        let byte = data.first().copied();
        let decoded = match code {
            code::CELL_COUNT => InputPacket::CellCount(byte?),
            code::VERSION_NUMBER => InputPacket::VersionNumber(byte?),
            code::SWITCHES => InputPacket::Switches(byte?),
            code::ROUTING_KEYS => InputPacket::RoutingKeys(data.to_vec()),
            code::DEVICE_IDENTITY => InputPacket::DeviceIdentity(text_field(data)),
            code::SERIAL_NUMBER => InputPacket::SerialNumber(text_field(data)),
            code::BLUETOOTH_NAME => InputPacket::BluetoothName(text_field(data)),
            _ => InputPacket::Other {
                code,
                data: data.to_vec(),
            },
        };
        Some(decoded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    DisplayData(&'a [u8]),
    GetVersionNumber,
    GetKeys,
    SetMode { mode: u8, setting: u8 },
    GetDeviceIdentity,
    GetSerialNumber,
}

impl<'a> Request<'a> {
    /// Unescaped bytes; the framer adds the escape.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::DisplayData(cells) => {
                let mut bytes = vec![0x01];
                bytes.extend_from_slice(cells);
                bytes
            }
            Request::GetVersionNumber => vec![code::VERSION_NUMBER],
            Request::GetKeys => vec![code::GET_KEYS],
            Request::SetMode { mode, setting } => vec![code::SET_MODE, *mode, *setting],
            Request::GetDeviceIdentity => vec![code::DEVICE_IDENTITY],
            Request::GetSerialNumber => vec![code::SERIAL_NUMBER],
        }
    }
}

/// Cell count taken from the first number in a device identity such as
/// "Baum SuperVario40".
fn assumed_cell_count(identity: &str) -> Option<u8> {
    let start = identity.find(|c: char| ('1'..='9').contains(&c))?;
    let digits: String = identity[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse::<u8>()
        .ok()
        .filter(|count| (1..=MAXIMUM_CELL_COUNT).contains(count))
}

pub struct BaumProbe {
    model: Model,
    assumed: Option<u8>,
}

impl BaumProbe {
    pub fn new() -> Self {
        BaumProbe {
            model: GENERIC,
            assumed: None,
        }
    }

    fn with_cells(&self, cells: u8) -> Identity {
        Identity::new(Model {
            text_columns: cells,
            ..self.model
        })
    }
}

impl Default for BaumProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for BaumProbe {
    fn variant(&self) -> Variant {
        Variant::Baum
    }

    fn format(&self) -> FrameFormat {
        format(Layout::default())
    }

    fn attempts(&self) -> usize {
        2
    }

    fn window(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()> {
        if let Some(model) = endpoint.tag::<Model>() {
            self.model = *model;
        }
        self.assumed = None;

        for request in [
            Request::GetDeviceIdentity,
            Request::GetSerialNumber,
            Request::DisplayData(&[0]),
            Request::GetKeys,
        ] {
            framer.write_packet(endpoint, &request.encode())?;
        }
        Ok(())
    }

    fn handle(&mut self, packet: &[u8]) -> Response {
        match InputPacket::decode(packet) {
            Some(InputPacket::CellCount(count)) if (1..=MAXIMUM_CELL_COUNT).contains(&count) => {
                Response::Done(self.with_cells(count))
            }
            Some(InputPacket::CellCount(count)) => {
                debug!("unexpected cell count: {}", count);
                Response::Unexpected
            }
            Some(InputPacket::RoutingKeys(_)) => {
                info!("Baum device identity: Inka");
                Response::Done(Identity::new(INKA))
            }
            Some(InputPacket::Switches(_)) => {
                info!("Baum device identity: DM80P");
                Response::Done(Identity::new(DM80P))
            }
            Some(InputPacket::DeviceIdentity(identity)) => {
                info!("Baum device identity: {}", identity);
                if let Some(count) = assumed_cell_count(&identity) {
                    self.assumed = Some(count);
                }
                Response::Continue
            }
            Some(InputPacket::SerialNumber(serial)) => {
                info!("Baum serial number: {}", serial);
                Response::Continue
            }
            _ => Response::Unexpected,
        }
    }

    fn exhausted(&mut self) -> Option<Identity> {
        let count = self.assumed.take()?;
        Some(self.with_cells(count))
    }
}
