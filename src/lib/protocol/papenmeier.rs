//! Papenmeier BrailleX: protocol 1 (binary) on older serial models,
//! protocol 2 (hex nibbles) everywhere else.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::{find_model, Identity, Model, Variant};
use crate::error::Result;
use crate::framer::{Expect, FrameFormat, Framer, LengthRule};
use crate::gio::{Descriptor, Endpoint, SerialParameters, TransportKind, UsbChannelDefinition};
use crate::identify::{Probe, Response};

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

pub const MODELS: &[Model] = &[
    Model::new(0, "BrailleX Compact 486", 40, 0, 1),
    Model::new(1, "BrailleX 2D Lite (plus)", 40, 13, 1),
    Model::new(2, "BrailleX Compact/Tiny", 40, 0, 1),
    Model::new(3, "BrailleX 2D Screen Soft", 80, 22, 1),
    Model::new(6, "BrailleX IB 80 CR Soft", 80, 4, 1),
    Model::new(64, "BrailleX EL 2D-40", 40, 13, 1),
    Model::new(65, "BrailleX EL 2D-66", 66, 13, 1),
    Model::new(66, "BrailleX EL 80", 80, 2, 1),
    Model::new(67, "BrailleX EL 2D-80", 80, 20, 1),
    Model::new(68, "BrailleX EL 40 P", 40, 0, 1),
    Model::new(69, "BrailleX Elba 32", 32, 0, 1),
    Model::new(70, "BrailleX Elba 20", 20, 0, 1),
    Model::new(85, "BrailleX EL40s", 40, 0, 1),
    Model::new(86, "BrailleX EL80-II", 80, 2, 1),
    Model::new(87, "BrailleX EL66s", 66, 0, 1),
    Model::new(88, "BrailleX EL80s", 80, 0, 1),
    Model::new(89, "BrailleX Trio", 40, 0, 2),
    Model::new(90, "BrailleX EL70s", 70, 0, 1),
    Model::new(91, "BrailleX EL2D-80s", 80, 20, 1),
    Model::new(92, "BrailleX Elba (Trio 20)", 20, 0, 2),
    Model::new(93, "BrailleX Elba (Trio 32)", 32, 0, 2),
];

pub fn descriptor() -> Descriptor {
    let mut descriptor = Descriptor::default();
    descriptor.serial.parameters = Some(SerialParameters::with_baud(19200));
    descriptor.usb.channels = vec![UsbChannelDefinition {
        serial: Some(SerialParameters::with_baud(115200)),
        ..UsbChannelDefinition::new(0x0403, 0xF208)
    }];
    descriptor.bluetooth.channel = 1;
    descriptor
}

pub fn speeds(kind: TransportKind) -> Vec<u32> {
    match kind {
        TransportKind::Serial => vec![19200, 38400],
        TransportKind::Usb => vec![115200, 57600],
        _ => vec![115200],
    }
}

/// Serial lines may carry either protocol; the others only speak 2.
pub fn probes(kind: TransportKind) -> Vec<Box<dyn Probe>> {
    match kind {
        TransportKind::Serial => vec![Box::new(Protocol1Probe), Box::new(Protocol2Probe::new(1))],
        _ => vec![Box::new(Protocol2Probe::new(3))],
    }
}

fn identify_model(id: u8, major: u8, minor: u8) -> Response {
    info!("Papenmeier ID: {}  Version: {}.{:02}", id, major, minor);
    match find_model(MODELS, id) {
        Some(model) => {
            info!("{}  Size: {}", model.name, model.text_columns);
            Response::Done(Identity::with_version(model, major, minor))
        }
        None => {
            warn!("unknown Papenmeier ID: {}", id);
            Response::Fail
        }
    }
}

pub mod protocol1 {
    use super::*;

    pub const SEND: u8 = b'S';
    pub const IDENTIFY: u8 = b'I';
    pub const RECEIVE: u8 = b'K';
    pub const IDENTITY_LENGTH: usize = 10;
    pub const KEY_LENGTH: usize = 10;

    pub fn error_message(code: u8) -> Option<&'static str> {
        match code {
            0x03 => Some("missing identification byte"),
            0x04 => Some("data too long"),
            0x05 => Some("data starts beyond end of structure"),
            0x06 => Some("data extends beyond end of structure"),
            0x07 => Some("data framing error"),
            _ => None,
        }
    }

    fn expect(packet: &[u8]) -> Expect {
        let id = match packet.get(1) {
            Some(&id) => id,
            None => return Expect::More,
        };
        match id {
            IDENTIFY => Expect::Length(IDENTITY_LENGTH),
            RECEIVE => match packet.get(4..6) {
                Some(&[high, low]) => match u16::from_be_bytes([high, low]) as usize {
                    KEY_LENGTH => Expect::Length(KEY_LENGTH),
                    length => {
                        warn!("unexpected input packet length: {}", length);
                        Expect::Unknown
                    }
                },
                _ => Expect::More,
            },
            code if error_message(code).is_some() => Expect::Length(3),
            _ => Expect::Unknown,
        }
    }

    /// `STX id .. ETX`
    pub fn format() -> FrameFormat {
        FrameFormat::new(&[STX], LengthRule::Lookup(Arc::new(expect))).with_terminator(ETX)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum InputPacket {
        Identity { model: u8, major: u8, minor: u8 },
        Key { code: u16, pressed: bool, time: u16 },
        Error(u8),
    }

    impl InputPacket {
        pub fn decode(packet: &[u8]) -> Option<Self> {
            match *packet {
                [STX, IDENTIFY, model, major, tens, ones, _, _, _, ETX] => Some(InputPacket::Identity {
                    model,
                    major,
                    minor: tens.wrapping_mul(10).wrapping_add(ones),
                }),
                [STX, RECEIVE, code_high, code_low, _, _, pressed, time_high, time_low, ETX] => {
                    Some(InputPacket::Key {
                        code: u16::from_be_bytes([code_high, code_low]),
                        pressed: pressed == 1,
                        time: u16::from_be_bytes([time_high, time_low]),
                    })
                }
                [STX, code, ETX] if error_message(code).is_some() => Some(InputPacket::Error(code)),
                _ => None,
            }
        }
    }

    /// `STX 'S' addr size data ETX`, where size counts the whole packet.
    pub fn encode(address: u16, data: &[u8]) -> Vec<u8> {
        let size = (data.len() + 7) as u16;
        let mut bytes = Vec::with_capacity(size as usize);
        bytes.extend_from_slice(&[STX, SEND]);
        bytes.extend_from_slice(&address.to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());
        bytes.extend_from_slice(data);
        bytes.push(ETX);
        bytes
    }

    /// A send with a wrong size, which the display answers with its identity.
    pub const IDENTIFY_REQUEST: [u8; 7] = [STX, SEND, 0, 0, 0, 0, ETX];
}

pub mod protocol2 {
    use super::*;

    pub const IDENTITY: u8 = 0x0A;
    pub const IDENTIFY_COMMAND: u8 = 0x02;

    fn high_nibble(byte: u8) -> u8 {
        byte & 0xF0
    }

    fn low_nibble(byte: u8) -> u8 {
        byte & 0x0F
    }

    /// Total packet size announced by a complete header.
    fn size(header: &[u8]) -> usize {
        let length = (low_nibble(header[2]) << 4 | low_nibble(header[3])) as usize;
        if low_nibble(header[1]) == IDENTITY {
            length + 5
        } else {
            length * 2 + 5
        }
    }

    fn expect(packet: &[u8]) -> Expect {
        let offset = packet.len() - 1;
        let byte = packet[offset];
        let marker = match offset {
            0 => return Expect::More,
            1 => 0x40,
            2 | 3 => 0x50,
            _ if offset + 1 == size(packet) => return Expect::Length(offset + 1),
            _ => 0x30,
        };
        if high_nibble(byte) != marker {
            return Expect::Invalid;
        }
        if offset == 3 {
            Expect::Length(size(packet))
        } else {
            Expect::More
        }
    }

    /// `STX 4t 5h 5l (3n)* ETX`
    pub fn format() -> FrameFormat {
        FrameFormat::new(&[STX], LengthRule::Lookup(Arc::new(expect)))
            .with_terminator(ETX)
            .restarting_on_start()
            .with_max_length(0x203)
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct InputPacket {
        pub kind: u8,
        /// Raw nibbles for identity packets, whole bytes otherwise.
        pub data: Vec<u8>,
    }

    impl InputPacket {
        pub fn decode(packet: &[u8]) -> Option<Self> {
            if packet.len() < 5 || packet[0] != STX || packet.last() != Some(&ETX) {
                return None;
            }
            let kind = low_nibble(packet[1]);
            let body = &packet[4..packet.len() - 1];
            let data = if kind == IDENTITY {
                body.iter().map(|&b| low_nibble(b)).collect()
            } else {
                body.chunks_exact(2)
                    .map(|pair| low_nibble(pair[0]) << 4 | low_nibble(pair[1]))
                    .collect()
            };
            Some(InputPacket { kind, data })
        }

        /// (model, major, minor)
        pub fn identity(&self) -> Option<(u8, u8, u8)> {
            match (self.kind, self.data.as_slice()) {
                (IDENTITY, &[n0, n1, n2, n3, n4, ..]) => Some((n0 << 4 | n1, n2, n3 * 10 + n4)),
                _ => None,
            }
        }
    }

    pub fn encode(command: u8, data: &[u8]) -> Vec<u8> {
        let count = data.len() as u8;
        let mut bytes = Vec::with_capacity(data.len() * 2 + 5);
        bytes.extend_from_slice(&[STX, 0x40 | command, 0x50 | count >> 4, 0x50 | (count & 0x0F)]);
        for &byte in data {
            bytes.push(0x30 | byte >> 4);
            bytes.push(0x30 | (byte & 0x0F));
        }
        bytes.push(ETX);
        bytes
    }
}

pub struct Protocol1Probe;

impl Probe for Protocol1Probe {
    fn variant(&self) -> Variant {
        Variant::Papenmeier1
    }

    fn format(&self) -> FrameFormat {
        protocol1::format()
    }

    fn attempts(&self) -> usize {
        1
    }

    fn window(&self) -> Duration {
        Duration::from_millis(1000)
    }

    fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()> {
        framer.write_packet(endpoint, &protocol1::IDENTIFY_REQUEST)?;
        Ok(())
    }

    fn handle(&mut self, packet: &[u8]) -> Response {
        match protocol1::InputPacket::decode(packet) {
            Some(protocol1::InputPacket::Identity { model, major, minor }) => identify_model(model, major, minor),
            Some(protocol1::InputPacket::Error(code)) => {
                if let Some(message) = protocol1::error_message(code) {
                    warn!("output packet error: {:02X}: {}", code, message);
                }
                Response::Unexpected
            }
            _ => {
                warn!("not an identification packet: {:02X?}", packet);
                Response::Unexpected
            }
        }
    }
}

pub struct Protocol2Probe {
    attempts: usize,
}

impl Protocol2Probe {
    pub fn new(attempts: usize) -> Self {
        Protocol2Probe { attempts }
    }
}

impl Probe for Protocol2Probe {
    fn variant(&self) -> Variant {
        Variant::Papenmeier2
    }

    fn format(&self) -> FrameFormat {
        protocol2::format()
    }

    fn attempts(&self) -> usize {
        self.attempts
    }

    fn window(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()> {
        framer.write_packet(endpoint, &protocol2::encode(protocol2::IDENTIFY_COMMAND, &[]))?;
        Ok(())
    }

    fn handle(&mut self, packet: &[u8]) -> Response {
        match protocol2::InputPacket::decode(packet).and_then(|packet| packet.identity()) {
            Some((model, major, minor)) => identify_model(model, major, minor),
            None => Response::Unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gio::fake::{FakeDevice, FakeTransport};
    use crate::identify::identify;
    use crate::protocol::Family;
    use proptest::prelude::*;

    const P1_IDENTITY: [u8; 10] = [STX, b'I', 64, 1, 2, 5, 0, 0, 0, ETX];
    // model 0x59 (Trio), firmware 1.25
    const P2_IDENTITY: [u8; 10] = [STX, 0x4A, 0x50, 0x55, 0x35, 0x39, 0x31, 0x32, 0x35, ETX];

    fn read(format: FrameFormat, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let fake = FakeTransport::new();
        for chunk in chunks {
            fake.push(chunk);
        }
        let mut endpoint = fake.endpoint(Descriptor::default().serial.options);
        let mut framer = Framer::new(format);
        let mut packets = Vec::new();
        loop {
            match framer.read_packet(&mut endpoint, false) {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        packets
    }

    #[test]
    fn protocol1_packets() {
        let key = [STX, b'K', 0x03, 0x06, 0x00, 0x0A, 0x01, 0x00, 0x10, ETX];
        let wrong_length = [STX, b'K', 0x03, 0x06, 0x00, 0x0B];
        let error = [STX, 0x05, ETX];
        let packets = read(protocol1::format(), &[&wrong_length, &key, &error, &P1_IDENTITY]);
        assert_eq!(packets, vec![key.to_vec(), error.to_vec(), P1_IDENTITY.to_vec()]);

        assert_eq!(
            protocol1::InputPacket::decode(&key),
            Some(protocol1::InputPacket::Key {
                code: 0x0306,
                pressed: true,
                time: 0x10
            })
        );
        assert_eq!(
            protocol1::InputPacket::decode(&P1_IDENTITY),
            Some(protocol1::InputPacket::Identity {
                model: 64,
                major: 1,
                minor: 25
            })
        );
        assert_eq!(protocol1::InputPacket::decode(&error), Some(protocol1::InputPacket::Error(5)));
    }

    #[test]
    fn protocol1_output() {
        assert_eq!(
            protocol1::encode(0x0100, &[0xAA, 0xBB]),
            vec![STX, b'S', 0x01, 0x00, 0x00, 0x09, 0xAA, 0xBB, ETX]
        );
    }

    #[test]
    fn protocol2_packets() {
        let keys = protocol2::encode(0x0B, &[0x12, 0xF0]);
        assert_eq!(keys, vec![STX, 0x4B, 0x50, 0x52, 0x31, 0x32, 0x3F, 0x30, ETX]);

        // a restart mid-packet, then a corrupted nibble
        let packets = read(
            protocol2::format(),
            &[&[STX, 0x4B, 0x50], &keys, &[STX, 0x4B, 0x50, 0x51, 0x31, 0x7F, ETX], &P2_IDENTITY],
        );
        assert_eq!(packets, vec![keys.clone(), P2_IDENTITY.to_vec()]);

        let decoded = protocol2::InputPacket::decode(&keys).unwrap();
        assert_eq!(decoded.kind, 0x0B);
        assert_eq!(decoded.data, vec![0x12, 0xF0]);
        assert_eq!(
            protocol2::InputPacket::decode(&P2_IDENTITY).unwrap().identity(),
            Some((89, 1, 25))
        );
    }

    #[test]
    fn serial_protocol1() {
        let device = FakeDevice::new(19200, |request| {
            if request == protocol1::IDENTIFY_REQUEST {
                Some(P1_IDENTITY.to_vec())
            } else {
                None
            }
        });
        let mut endpoint = Endpoint::with_transport(Box::new(device), descriptor().serial.options);
        let family = Family::Papenmeier;
        let kind = endpoint.kind();

        let identified = identify(&mut endpoint, &family.speeds(kind), &mut family.probes(kind)).unwrap();
        assert_eq!(identified.variant, Variant::Papenmeier1);
        assert_eq!(identified.speed, 19200);
        assert_eq!(identified.identity.model.name, "BrailleX EL 2D-40");
        assert_eq!(identified.identity.version, Some((1, 25)));
    }

    #[test]
    fn serial_protocol2_at_second_speed() {
        let device = FakeDevice::new(38400, |request| {
            if request == protocol2::encode(protocol2::IDENTIFY_COMMAND, &[]) {
                Some(P2_IDENTITY.to_vec())
            } else {
                None
            }
        });
        let requests = device.requests();
        let mut endpoint = Endpoint::with_transport(Box::new(device), descriptor().serial.options);

        let identified = identify(
            &mut endpoint,
            &speeds(TransportKind::Serial),
            &mut probes(TransportKind::Serial),
        )
        .unwrap();
        assert_eq!(identified.variant, Variant::Papenmeier2);
        assert_eq!(identified.speed, 38400);
        assert_eq!(identified.identity.model.protocol_revision, 2);

        let bauds: Vec<u32> = requests.lock().unwrap().iter().map(|(baud, _)| *baud).collect();
        assert_eq!(bauds, vec![19200, 19200, 38400, 38400]);
    }

    #[test]
    fn unknown_identity_fails() {
        let device = FakeDevice::fixed_rate(|_| Some(vec![STX, 0x4A, 0x50, 0x55, 0x3F, 0x3F, 0x31, 0x32, 0x35, ETX]));
        let requests = device.requests();
        let mut endpoint = Endpoint::with_transport(Box::new(device), descriptor().bluetooth.options);

        assert!(identify(
            &mut endpoint,
            &speeds(TransportKind::Bluetooth),
            &mut probes(TransportKind::Bluetooth)
        )
        .is_err());
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn probes_per_transport() {
        let serial = probes(TransportKind::Serial);
        assert_eq!(serial.len(), 2);
        assert_eq!(serial[0].variant(), Variant::Papenmeier1);
        assert_eq!(serial[1].attempts(), 1);

        let usb = probes(TransportKind::Usb);
        assert_eq!(usb.len(), 1);
        assert_eq!(usb[0].attempts(), 3);
        assert_eq!(speeds(TransportKind::Usb), vec![115200, 57600]);
    }

    proptest! {
        #[test]
        fn protocol2_frames_any_payload(
            command in (0u8..16).prop_filter("identity", |c| *c != protocol2::IDENTITY),
            data in proptest::collection::vec(any::<u8>(), 0..=255),
        ) {
            let bytes = protocol2::encode(command, &data);
            prop_assert_eq!(bytes.len(), 2 * data.len() + 5);

            let packets = read(protocol2::format(), &[bytes.as_slice()]);
            prop_assert_eq!(&packets, &vec![bytes]);
            let decoded = protocol2::InputPacket::decode(&packets[0]).unwrap();
            prop_assert_eq!(decoded.kind, command);
            prop_assert_eq!(decoded.data, data);
        }
    }
}
