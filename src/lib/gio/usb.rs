use super::{
    ControlRequest, FlowControl, Parity, ReportKind, SerialParameters, Transport, TransportKind,
    UsbChannelDefinition,
};
use crate::error::{Error, Result};
use log::{debug, warn};
use rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, TransferType, UsbContext};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const FTDI_VENDOR: u16 = 0x0403;

const FTDI_MODEM_CONTROL: u8 = 0x01;
const FTDI_FLOW_CONTROL: u8 = 0x02;
const FTDI_BAUD_RATE: u8 = 0x03;
const FTDI_DATA_FORMAT: u8 = 0x04;
const FTDI_STATUS_SIZE: usize = 2;

const HID_GET_REPORT: u8 = 0x01;
const HID_SET_REPORT: u8 = 0x09;
const GET_DESCRIPTOR: u8 = 0x06;
const HID_REPORT_DESCRIPTOR: u16 = 0x22;

/// FT232BM divisor for `baud`, split as (value, index).
pub(crate) fn ftdi_baud_divisor(baud: u32) -> Result<(u16, u16)> {
    const BASE: u32 = 48_000_000;
    const MASK: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

    if baud == 0 || baud > BASE / 16 {
        return Err(Error::NotSerial("usb"));
    }
    let eighths = BASE / 2 / baud;
    let mut divisor = (eighths >> 3) | (MASK[(eighths & 7) as usize] << 14);
    if divisor == 1 {
        divisor = 0;
    } else if divisor == 0x4001 {
        divisor = 1;
    }
    Ok(((divisor & 0xFFFF) as u16, (divisor >> 16) as u16))
}

pub(crate) fn ftdi_data_format(parameters: &SerialParameters) -> Result<u16> {
    let parity = match parameters.parity {
        Parity::None => 0x000,
        Parity::Odd => 0x100,
        Parity::Even => 0x200,
        Parity::Mark => 0x300,
        Parity::Space => 0x400,
    };
    let stop = match parameters.stop_bits {
        1 => 0x0000,
        2 => 0x1000,
        _ => return Err(Error::NotSerial("usb")),
    };
    Ok(parameters.data_bits as u16 | parity | stop)
}

fn ftdi_flow_control(flow: FlowControl) -> (u16, u16) {
    match flow {
        FlowControl::None => (0, 0),
        FlowControl::Hardware => (0, 0x0100),
        FlowControl::Software => (0x1311, 0x0400),
    }
}

#[derive(Debug, Clone, Copy)]
struct Pipe {
    address: u8,
    transfer: TransferType,
    packet_size: usize,
}

pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    definition: UsbChannelDefinition,
    input: Option<Pipe>,
    output: Option<Pipe>,
    pending: VecDeque<u8>,
}

fn matches_serial(handle: &DeviceHandle<Context>, device: &Device<Context>, serial_number: &str) -> bool {
    if serial_number.is_empty() {
        return true;
    }
    let found = device
        .device_descriptor()
        .and_then(|descriptor| handle.read_serial_number_string_ascii(&descriptor));
    match found {
        Ok(found) => found == serial_number,
        Err(_) => false,
    }
}

fn find_pipes(device: &Device<Context>, definition: &UsbChannelDefinition) -> Result<(Option<Pipe>, Option<Pipe>)> {
    let config = device.active_config_descriptor()?;
    let mut input = None;
    let mut output = None;

    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            if setting.interface_number() != definition.interface
                || setting.setting_number() != definition.alternative
            {
                continue;
            }
            for endpoint in setting.endpoint_descriptors() {
                let pipe = Pipe {
                    address: endpoint.address(),
                    transfer: endpoint.transfer_type(),
                    packet_size: endpoint.max_packet_size() as usize,
                };
                match endpoint.direction() {
                    Direction::In if endpoint.number() == definition.input_endpoint => {
                        input = Some(pipe)
                    }
                    Direction::Out if endpoint.number() == definition.output_endpoint => {
                        output = Some(pipe)
                    }
                    _ => {}
                }
            }
        }
    }

    Ok((input, output))
}

impl UsbTransport {
    /// Opens the first device matching one of `definitions`.
    pub fn open(definitions: &[UsbChannelDefinition], serial_number: &str) -> Result<Self> {
        let context = Context::new()?;

        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            let definition = match definitions.iter().find(|d| {
                d.vendor == descriptor.vendor_id() && d.product == descriptor.product_id()
            }) {
                Some(definition) => definition,
                None => continue,
            };
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(e) => {
                    debug!(
                        "usb open {:04X}:{:04X} failed: {}",
                        definition.vendor, definition.product, e
                    );
                    continue;
                }
            };
            if !matches_serial(&handle, &device, serial_number) {
                continue;
            }
            return Self::prepare(handle, &device, *definition);
        }

        Err(rusb::Error::NoDevice.into())
    }

    fn prepare(
        handle: DeviceHandle<Context>,
        device: &Device<Context>,
        definition: UsbChannelDefinition,
    ) -> Result<Self> {
        if handle.active_configuration()? != definition.configuration {
            handle.set_active_configuration(definition.configuration)?;
        }
        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(e) => return Err(e.into()),
        }
        handle.claim_interface(definition.interface)?;
        if definition.alternative != 0 {
            handle.set_alternate_setting(definition.interface, definition.alternative)?;
        }

        let (input, output) = find_pipes(device, &definition)?;
        if definition.input_endpoint != 0 && input.is_none() {
            warn!("usb input endpoint {} not found", definition.input_endpoint);
        }

        let mut transport = UsbTransport {
            handle,
            definition,
            input,
            output,
            pending: VecDeque::new(),
        };
        if let Some(parameters) = &definition.serial {
            match transport.reconfigure(parameters) {
                Ok(()) => {}
                Err(e) if e.is_unsupported() => {}
                Err(e) => return Err(e),
            }
        }

        debug!(
            "usb open OK: {:04X}:{:04X} interface {}",
            definition.vendor, definition.product, definition.interface
        );
        Ok(transport)
    }

    pub fn definition(&self) -> &UsbChannelDefinition {
        &self.definition
    }

    fn is_ftdi(&self) -> bool {
        self.definition.vendor == FTDI_VENDOR
    }

    fn take_pending(&mut self, buffer: &mut [u8]) -> usize {
        let n = self.pending.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }

    /// One input transfer; returns how many data bytes it queued.
    fn fill(&mut self, timeout: Duration) -> Result<usize> {
        let pipe = self.input.ok_or(Error::NotCapable("usb"))?;
        // libusb treats zero as "forever"
        let timeout = timeout.max(Duration::from_millis(1));
        let mut packet = vec![0u8; pipe.packet_size.max(8)];

        let result = match pipe.transfer {
            TransferType::Interrupt => self.handle.read_interrupt(pipe.address, &mut packet, timeout),
            _ => self.handle.read_bulk(pipe.address, &mut packet, timeout),
        };
        let count = match result {
            Ok(count) => count,
            Err(rusb::Error::Timeout) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let data = if self.is_ftdi() {
            packet.get(FTDI_STATUS_SIZE..count).unwrap_or(&[])
        } else {
            &packet[..count]
        };
        self.pending.extend(data);
        Ok(data.len())
    }

    fn vendor_out(&mut self, request: u8, value: u16, index: u16) -> Result<()> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(request_type, request, value, index, &[], Duration::from_millis(1000))?;
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.definition.interface) {
            debug!("usb release failed: {}", e);
        }
    }
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn read_data(&mut self, buffer: &mut [u8], initial: Duration, subsequent: Duration) -> Result<usize> {
        let mut count = 0;
        let mut deadline = Instant::now() + initial;

        loop {
            count += self.take_pending(&mut buffer[count..]);
            if count == buffer.len() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.fill(remaining)? > 0 {
                deadline = Instant::now() + subsequent;
            } else if Instant::now() >= deadline {
                break;
            }
        }

        Ok(count)
    }

    fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.fill(remaining)? == 0 && Instant::now() >= deadline {
                break;
            }
        }
        Ok(!self.pending.is_empty())
    }

    fn write_data(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let pipe = self.output.ok_or(Error::NotCapable("usb"))?;
        let timeout = timeout.max(Duration::from_millis(1));
        Ok(match pipe.transfer {
            TransferType::Interrupt => self.handle.write_interrupt(pipe.address, data, timeout)?,
            _ => self.handle.write_bulk(pipe.address, data, timeout)?,
        })
    }

    fn reconfigure(&mut self, parameters: &SerialParameters) -> Result<()> {
        if !self.is_ftdi() {
            return Err(Error::NotSerial("usb"));
        }

        let (value, index) = ftdi_baud_divisor(parameters.baud)?;
        self.vendor_out(FTDI_BAUD_RATE, value, index)?;
        self.vendor_out(FTDI_DATA_FORMAT, ftdi_data_format(parameters)?, 0)?;
        let (value, index) = ftdi_flow_control(parameters.flow_control);
        self.vendor_out(FTDI_FLOW_CONTROL, value, index)?;
        // raise DTR and RTS
        self.vendor_out(FTDI_MODEM_CONTROL, 0x0303, 0)?;

        debug!("ftdi reconfigured: {} baud", parameters.baud);
        Ok(())
    }

    fn resource_name(&mut self, timeout: Duration) -> Result<String> {
        let descriptor = self.handle.device().device_descriptor()?;
        let languages = self.handle.read_languages(timeout)?;
        match languages.first() {
            Some(language) => Ok(self.handle.read_product_string(*language, &descriptor, timeout)?),
            None => Ok(self.handle.read_product_string_ascii(&descriptor)?),
        }
    }

    fn tell(&mut self, request: &ControlRequest, data: &[u8], timeout: Duration) -> Result<usize> {
        let request_type = rusb::request_type(Direction::Out, request.kind, request.recipient);
        Ok(self.handle.write_control(
            request_type,
            request.request,
            request.value,
            request.index,
            data,
            timeout,
        )?)
    }

    fn ask(&mut self, request: &ControlRequest, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let request_type = rusb::request_type(Direction::In, request.kind, request.recipient);
        Ok(self.handle.read_control(
            request_type,
            request.request,
            request.value,
            request.index,
            buffer,
            timeout,
        )?)
    }

    fn hid_descriptor(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut items = vec![0u8; 0x1000];
        let request = ControlRequest {
            recipient: Recipient::Interface,
            kind: RequestType::Standard,
            request: GET_DESCRIPTOR,
            value: HID_REPORT_DESCRIPTOR << 8,
            index: self.definition.interface as u16,
        };
        let count = self.ask(&request, &mut items, timeout)?;
        items.truncate(count);
        Ok(items)
    }

    fn get_hid_report(&mut self, kind: ReportKind, id: u8, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let request = ControlRequest {
            recipient: Recipient::Interface,
            kind: RequestType::Class,
            request: HID_GET_REPORT,
            value: kind.report_value(id),
            index: self.definition.interface as u16,
        };
        self.ask(&request, buffer, timeout)
    }

    fn set_hid_report(&mut self, kind: ReportKind, id: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let request = ControlRequest {
            recipient: Recipient::Interface,
            kind: RequestType::Class,
            request: HID_SET_REPORT,
            value: kind.report_value(id),
            index: self.definition.interface as u16,
        };
        self.tell(&request, data, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ftdi_divisors() {
        assert_eq!(ftdi_baud_divisor(9600).unwrap(), (0x4138, 0));
        assert_eq!(ftdi_baud_divisor(19200).unwrap(), (0x809C, 0));
        assert_eq!(ftdi_baud_divisor(115200).unwrap(), (0x001A, 0));
        assert_eq!(ftdi_baud_divisor(3_000_000).unwrap(), (0, 0));
        assert_eq!(ftdi_baud_divisor(2_000_000).unwrap(), (1, 0));
        assert!(ftdi_baud_divisor(0).is_err());
    }

    #[test]
    fn ftdi_line_format() {
        assert_eq!(ftdi_data_format(&SerialParameters::default()).unwrap(), 0x0008);

        let mut parameters = SerialParameters::with_baud(19200);
        parameters.parity = Parity::Odd;
        parameters.stop_bits = 2;
        assert_eq!(ftdi_data_format(&parameters).unwrap(), 0x1108);

        parameters.stop_bits = 3;
        assert!(ftdi_data_format(&parameters).is_err());
    }
}
