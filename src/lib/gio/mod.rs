mod bluetooth;
#[cfg(test)]
pub(crate) mod fake;
mod hid;
pub mod identifier;
mod serial;
mod usb;

pub use bluetooth::BluetoothTransport;
pub use hid::{report_size, HidReportSize, HidTransport, ReportKind};
pub use rusb::{Recipient, RequestType};
pub use serial::SerialTransport;
pub use usb::UsbTransport;

use crate::error::{Error, Result};
use identifier::BluetoothAddress;
use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::any::Any;
use std::fmt::Display;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

/// Opaque per-model data a driver attaches to a descriptor entry.
pub type Tag = &'static (dyn Any + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Usb,
    Bluetooth,
    Hid,
}

impl TransportKind {
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Usb => "usb",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Hid => "hid",
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParameters {
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for SerialParameters {
    fn default() -> Self {
        Self::with_baud(9600)
    }
}

impl SerialParameters {
    pub const fn with_baud(baud: u32) -> Self {
        SerialParameters {
            baud,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }

    /// Bits on the wire per character, start bit included.
    pub fn character_size(&self) -> u32 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        1 + self.data_bits as u32 + parity + self.stop_bits as u32
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.baud / self.character_size()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub tag: Option<Tag>,
    pub ready_delay: Duration,
    pub input_timeout: Duration,
    pub output_timeout: Duration,
    pub request_timeout: Duration,
}

impl Options {
    const fn with_timeouts(input: u64, output: u64, request: u64) -> Self {
        Options {
            tag: None,
            ready_delay: Duration::ZERO,
            input_timeout: Duration::from_millis(input),
            output_timeout: Duration::from_millis(output),
            request_timeout: Duration::from_millis(request),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UsbChannelDefinition {
    pub vendor: u16,
    pub product: u16,
    pub configuration: u8,
    pub interface: u8,
    pub alternative: u8,
    pub input_endpoint: u8,
    pub output_endpoint: u8,
    pub serial: Option<SerialParameters>,
    pub data: Option<Tag>,
}

impl UsbChannelDefinition {
    /// Configuration 1, interface 0, setting 0, bulk endpoints 1 in and 2 out.
    pub const fn new(vendor: u16, product: u16) -> Self {
        UsbChannelDefinition {
            vendor,
            product,
            configuration: 1,
            interface: 0,
            alternative: 0,
            input_endpoint: 1,
            output_endpoint: 2,
            serial: None,
            data: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HidFilter {
    pub vendor: u16,
    pub product: u16,
    pub data: Option<Tag>,
}

#[derive(Debug, Clone)]
pub struct SerialDescriptor {
    pub parameters: Option<SerialParameters>,
    pub options: Options,
}

#[derive(Debug, Clone)]
pub struct UsbDescriptor {
    pub channels: Vec<UsbChannelDefinition>,
    pub options: Options,
}

#[derive(Debug, Clone)]
pub struct BluetoothDescriptor {
    pub channel: u8,
    pub options: Options,
}

#[derive(Debug, Clone)]
pub struct HidDescriptor {
    pub filters: Vec<HidFilter>,
    pub options: Options,
}

/// Which transports a driver accepts, and how to open each of them.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub serial: SerialDescriptor,
    pub usb: UsbDescriptor,
    pub bluetooth: BluetoothDescriptor,
    pub hid: HidDescriptor,
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor {
            serial: SerialDescriptor {
                parameters: None,
                options: Options::with_timeouts(100, 0, 0),
            },
            usb: UsbDescriptor {
                channels: Vec::new(),
                options: Options::with_timeouts(1000, 1000, 1000),
            },
            bluetooth: BluetoothDescriptor {
                channel: 0,
                options: Options::with_timeouts(100, 0, 5000),
            },
            hid: HidDescriptor {
                filters: Vec::new(),
                options: Options::with_timeouts(100, 0, 1000),
            },
        }
    }
}

/// A USB control transfer, minus its data stage.
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest {
    pub recipient: Recipient,
    pub kind: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// The capability interface behind an `Endpoint`.
///
/// Reads take two waits: `initial` bounds the wait for the first byte and
/// `subsequent` the wait for each continuation inside the same call. A read
/// that sees nothing returns `Ok(0)`.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn read_data(&mut self, buffer: &mut [u8], initial: Duration, subsequent: Duration)
        -> Result<usize>;

    fn await_input(&mut self, timeout: Duration) -> Result<bool>;

    fn write_data(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    fn reconfigure(&mut self, _parameters: &SerialParameters) -> Result<()> {
        Err(Error::NotSerial(self.kind().name()))
    }

    fn resource_name(&mut self, _timeout: Duration) -> Result<String> {
        Err(Error::NotCapable(self.kind().name()))
    }

    fn tell(&mut self, _request: &ControlRequest, _data: &[u8], _timeout: Duration) -> Result<usize> {
        Err(Error::NotCapable(self.kind().name()))
    }

    fn ask(&mut self, _request: &ControlRequest, _buffer: &mut [u8], _timeout: Duration) -> Result<usize> {
        Err(Error::NotCapable(self.kind().name()))
    }

    fn hid_descriptor(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        Err(Error::NotCapable(self.kind().name()))
    }

    fn get_hid_report(
        &mut self,
        _kind: ReportKind,
        _id: u8,
        _buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        Err(Error::NotCapable(self.kind().name()))
    }

    fn set_hid_report(&mut self, _kind: ReportKind, _id: u8, _data: &[u8], _timeout: Duration) -> Result<usize> {
        Err(Error::NotCapable(self.kind().name()))
    }
}

const STAGING_SIZE: usize = 0x40;

struct Staging {
    buffer: [u8; STAGING_SIZE],
    from: usize,
    to: usize,
    error: Option<Error>,
}

impl Staging {
    fn new() -> Self {
        Staging {
            buffer: [0; STAGING_SIZE],
            from: 0,
            to: 0,
            error: None,
        }
    }

    fn staged(&self) -> &[u8] {
        &self.buffer[self.from..self.to]
    }
}

/// One open connection to a display.
pub struct Endpoint {
    transport: Box<dyn Transport>,
    options: Options,
    bytes_per_second: u32,
    input: Staging,
    hid_items: Option<Vec<u8>>,
}

impl Endpoint {
    pub fn with_transport(transport: Box<dyn Transport>, options: Options) -> Self {
        Endpoint {
            transport,
            options,
            bytes_per_second: 0,
            input: Staging::new(),
            hid_items: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The driver tag selected at connect time.
    pub fn tag<T: Any>(&self) -> Option<&'static T> {
        self.options.tag.and_then(|tag| tag.downcast_ref::<T>())
    }

    pub fn set_rate(&mut self, parameters: &SerialParameters) {
        self.bytes_per_second = parameters.bytes_per_second();
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.bytes_per_second
    }

    pub fn milliseconds_to_transfer(&self, count: usize) -> u64 {
        if self.bytes_per_second == 0 {
            return 0;
        }
        count as u64 * 1000 / self.bytes_per_second as u64 + 1
    }

    /// Reads up to `buffer.len()` bytes. `Ok(0)` means nothing arrived.
    ///
    /// A transport error seen after some bytes were delivered is kept and
    /// reported by the next call that would otherwise deliver nothing.
    pub fn read_data(&mut self, buffer: &mut [u8], wait: bool) -> Result<usize> {
        let mut wait = wait;
        let mut count = 0;

        while count < buffer.len() {
            let staged = self.input.staged();
            if !staged.is_empty() {
                let n = staged.len().min(buffer.len() - count);
                buffer[count..count + n].copy_from_slice(&staged[..n]);
                self.input.from += n;
                count += n;
                continue;
            }
            self.input.from = 0;
            self.input.to = 0;

            if let Some(error) = self.input.error.take() {
                if count == 0 {
                    return Err(error);
                }
                self.input.error = Some(error);
                break;
            }

            let initial = if wait {
                self.options.input_timeout
            } else {
                Duration::ZERO
            };
            match self
                .transport
                .read_data(&mut self.input.buffer, initial, Duration::ZERO)
            {
                Ok(0) => break,
                Ok(n) => {
                    debug!("generic input: {:02X?}", &self.input.buffer[..n]);
                    self.input.to = n;
                    wait = true;
                }
                Err(e) if e.is_timeout() => break,
                Err(e) => self.input.error = Some(e),
            }
        }

        Ok(count)
    }

    pub fn read_byte(&mut self, wait: bool) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        Ok(match self.read_data(&mut byte, wait)? {
            0 => None,
            _ => Some(byte[0]),
        })
    }

    pub fn discard_input(&mut self) -> Result<()> {
        let mut buffer = [0u8; STAGING_SIZE];
        while self.read_data(&mut buffer, false)? > 0 {}
        Ok(())
    }

    pub fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        if !self.input.staged().is_empty() {
            return Ok(true);
        }
        self.transport.await_input(timeout)
    }

    /// Writes everything or fails; no retries.
    pub fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        let count = self
            .transport
            .write_data(data, self.options.output_timeout)
            .map_err(|e| Error::WriteFailed(e.to_string()))?;
        if count < data.len() {
            warn!("truncated write: {} of {} bytes", count, data.len());
        }
        Ok(count)
    }

    pub fn reconfigure(&mut self, parameters: &SerialParameters) -> Result<()> {
        self.transport.reconfigure(parameters)?;
        self.set_rate(parameters);
        Ok(())
    }

    pub fn resource_name(&mut self) -> Result<String> {
        self.transport.resource_name(self.options.request_timeout)
    }

    pub fn tell(
        &mut self,
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize> {
        let request = ControlRequest {
            recipient,
            kind,
            request,
            value,
            index,
        };
        self.transport
            .tell(&request, data, self.options.request_timeout)
    }

    pub fn ask(
        &mut self,
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let request = ControlRequest {
            recipient,
            kind,
            request,
            value,
            index,
        };
        self.transport
            .ask(&request, buffer, self.options.request_timeout)
    }

    /// Sizes of the report `id`, or `None` if the device doesn't declare it.
    pub fn hid_report_size(&mut self, id: u8) -> Result<Option<HidReportSize>> {
        if self.hid_items.is_none() {
            let items = self.transport.hid_descriptor(self.options.request_timeout)?;
            debug!("hid items: {} bytes", items.len());
            self.hid_items = Some(items);
        }
        Ok(report_size(self.hid_items.as_deref().unwrap_or(&[]), id))
    }

    pub fn get_report(&mut self, id: u8, buffer: &mut [u8]) -> Result<usize> {
        self.transport
            .get_hid_report(ReportKind::Input, id, buffer, self.options.request_timeout)
    }

    pub fn set_report(&mut self, id: u8, data: &[u8]) -> Result<usize> {
        self.transport
            .set_hid_report(ReportKind::Output, id, data, self.options.request_timeout)
    }

    pub fn get_feature(&mut self, id: u8, buffer: &mut [u8]) -> Result<usize> {
        self.transport
            .get_hid_report(ReportKind::Feature, id, buffer, self.options.request_timeout)
    }

    pub fn set_feature(&mut self, id: u8, data: &[u8]) -> Result<usize> {
        self.transport
            .set_hid_report(ReportKind::Feature, id, data, self.options.request_timeout)
    }

    /// Releases the handle and the cached report items.
    pub fn disconnect(mut self) {
        self.hid_items = None;
        debug!("{} endpoint closed", self.kind());
    }

    fn start(&mut self) -> Result<()> {
        if !self.options.ready_delay.is_zero() {
            thread::sleep(self.options.ready_delay);
        }
        self.discard_input()
    }
}

struct Opened {
    transport: Box<dyn Transport>,
    options: Options,
    rate: Option<SerialParameters>,
}

fn open_transport(identifier: &str, descriptor: &Descriptor) -> Option<Result<Opened>> {
    if let Some(parameters) = &descriptor.serial.parameters {
        if let Some(name) = identifier::is_serial_device(identifier) {
            return Some(
                SerialTransport::open(&identifier::device_path(name), parameters).map(|t| Opened {
                    transport: Box::new(t),
                    options: descriptor.serial.options,
                    rate: Some(*parameters),
                }),
            );
        }
    }

    if !descriptor.usb.channels.is_empty() {
        if let Some(serial_number) = identifier::is_usb_device(identifier) {
            return Some(
                UsbTransport::open(&descriptor.usb.channels, serial_number).map(|t| {
                    let definition = *t.definition();
                    let mut options = descriptor.usb.options;
                    if options.tag.is_none() {
                        options.tag = definition.data;
                    }
                    Opened {
                        transport: Box::new(t),
                        options,
                        rate: definition.serial,
                    }
                }),
            );
        }
    }

    if descriptor.bluetooth.channel != 0 {
        if let Some(address) = identifier::is_bluetooth_device(identifier) {
            let options = descriptor.bluetooth.options;
            return Some(address.parse::<BluetoothAddress>().and_then(|address| {
                BluetoothTransport::connect(
                    address,
                    descriptor.bluetooth.channel,
                    options.request_timeout,
                )
                .map(|t| Opened {
                    transport: Box::new(t),
                    options,
                    rate: None,
                })
            }));
        }
    }

    if !descriptor.hid.filters.is_empty() {
        if let Some(name) = identifier::is_hid_device(identifier) {
            return Some(
                HidTransport::open(&identifier::device_path(name), &descriptor.hid.filters).map(
                    |(t, filter)| {
                        let mut options = descriptor.hid.options;
                        options.tag = filter.data.or(options.tag);
                        Opened {
                            transport: Box::new(t),
                            options,
                            rate: None,
                        }
                    },
                ),
            );
        }
    }

    None
}

/// Opens the first transport class of `descriptor` that accepts `identifier`.
pub fn connect(identifier: &str, descriptor: &Descriptor) -> Result<Endpoint> {
    let opened = match open_transport(identifier, descriptor) {
        Some(Ok(opened)) => opened,
        Some(Err(e)) => {
            return Err(Error::ConnectFailed {
                identifier: identifier.to_string(),
                reason: e.to_string(),
            })
        }
        None => {
            warn!("unsupported resource identifier: {}", identifier);
            return Err(Error::Unsupported(identifier.to_string()));
        }
    };

    let mut endpoint = Endpoint::with_transport(opened.transport, opened.options);
    if let Some(parameters) = &opened.rate {
        endpoint.set_rate(parameters);
    }
    debug!("{} endpoint open: {}", endpoint.kind(), identifier);

    endpoint.start()?;
    Ok(endpoint)
}

pub(crate) fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

/// Waits until `fd` has `events` or `timeout` runs out.
pub(crate) fn await_fd(fd: RawFd, events: PollFlags, timeout: Duration) -> Result<bool> {
    let mut fds = [PollFd::new(fd, events)];
    loop {
        match poll(&mut fds, timeout_millis(timeout)) {
            Ok(n) => return Ok(n > 0),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeTransport;
    use super::*;

    fn endpoint(transport: &FakeTransport) -> Endpoint {
        transport.endpoint(Descriptor::default().serial.options)
    }

    #[test]
    fn descriptor_defaults() {
        let descriptor = Descriptor::default();
        assert_eq!(descriptor.serial.options.input_timeout, Duration::from_millis(100));
        assert_eq!(descriptor.usb.options.input_timeout, Duration::from_millis(1000));
        assert_eq!(descriptor.usb.options.request_timeout, Duration::from_millis(1000));
        assert_eq!(descriptor.bluetooth.options.request_timeout, Duration::from_millis(5000));
        assert_eq!(descriptor.hid.options.input_timeout, Duration::from_millis(100));
        assert!(descriptor.serial.options.ready_delay.is_zero());
        assert_eq!(SerialParameters::default().baud, 9600);
    }

    #[test]
    fn transfer_rate() {
        let mut parameters = SerialParameters::with_baud(19200);
        assert_eq!(parameters.character_size(), 10);
        assert_eq!(parameters.bytes_per_second(), 1920);

        parameters.parity = Parity::Even;
        parameters.stop_bits = 2;
        assert_eq!(parameters.bytes_per_second(), 1600);

        let mut endpoint = endpoint(&FakeTransport::new());
        assert_eq!(endpoint.milliseconds_to_transfer(100), 0);
        endpoint.set_rate(&SerialParameters::with_baud(9600));
        assert_eq!(endpoint.bytes_per_second(), 960);
        assert_eq!(endpoint.milliseconds_to_transfer(96), 101);
    }

    #[test]
    fn read_drains_chunks_in_order() {
        let transport = FakeTransport::new();
        transport.push(&[1, 2, 3]);
        transport.push(&[4, 5]);
        let mut endpoint = endpoint(&transport);

        let mut buffer = [0u8; 4];
        assert_eq!(endpoint.read_data(&mut buffer, false).unwrap(), 4);
        assert_eq!(buffer, [1, 2, 3, 4]);
        assert_eq!(endpoint.read_byte(false).unwrap(), Some(5));
        assert_eq!(endpoint.read_byte(false).unwrap(), None);
    }

    #[test]
    fn deferred_error_after_partial_read() {
        let transport = FakeTransport::new();
        transport.push(&[0x10, 0x20]);
        transport.fail_next();
        let mut endpoint = endpoint(&transport);

        let mut buffer = [0u8; 8];
        assert_eq!(endpoint.read_data(&mut buffer, false).unwrap(), 2);
        assert_eq!(&buffer[..2], &[0x10, 0x20]);
        assert!(matches!(endpoint.read_data(&mut buffer, false), Err(Error::Io(_))));
        assert_eq!(endpoint.read_data(&mut buffer, false).unwrap(), 0);
    }

    #[test]
    fn await_input_sees_staged_bytes() {
        let transport = FakeTransport::new();
        transport.push(&[7, 8]);
        let mut endpoint = endpoint(&transport);

        assert_eq!(endpoint.read_byte(false).unwrap(), Some(7));
        assert!(endpoint.await_input(Duration::ZERO).unwrap());
        endpoint.discard_input().unwrap();
        assert!(!endpoint.await_input(Duration::ZERO).unwrap());
    }

    #[test]
    fn capabilities_are_unsupported_on_serial() {
        let mut endpoint = endpoint(&FakeTransport::new());
        let mut buffer = [0u8; 4];
        assert!(endpoint.get_feature(1, &mut buffer).unwrap_err().is_unsupported());
        assert!(endpoint.set_report(1, &buffer).unwrap_err().is_unsupported());
        assert!(endpoint
            .ask(Recipient::Device, RequestType::Vendor, 0, 0, 0, &mut buffer)
            .unwrap_err()
            .is_unsupported());
    }

    #[test]
    fn tag_downcast() {
        static NAME: &str = "sync braille";
        let mut options = Descriptor::default().usb.options;
        options.tag = Some(&NAME);
        let endpoint = FakeTransport::new().endpoint(options);
        assert_eq!(endpoint.tag::<&str>(), Some(&"sync braille"));
        assert_eq!(endpoint.tag::<u32>(), None);
    }

    #[test]
    fn unsupported_identifier() {
        let descriptor = Descriptor::default();
        assert!(matches!(
            connect("usb:", &descriptor),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            connect("ttyS0", &descriptor),
            Err(Error::Unsupported(_))
        ));
    }
}
