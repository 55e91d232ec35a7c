#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux::is_port_open;

#[cfg(not(target_os = "linux"))]
fn is_port_open(_port_name: &str) -> bool {
    false
}

use super::{await_fd, FlowControl, Parity, SerialParameters, Transport, TransportKind};
use crate::error::{Error, Result};
use log::debug;
use nix::poll::PollFlags;
use serialport::{DataBits, ErrorKind, SerialPort, StopBits, TTYPort};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

fn invalid(what: &str) -> Error {
    serialport::Error::new(ErrorKind::InvalidInput, what).into()
}

fn data_bits(bits: u8) -> Result<DataBits> {
    Ok(match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        _ => return Err(invalid("unsupported data bits")),
    })
}

fn stop_bits(bits: u8) -> Result<StopBits> {
    Ok(match bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        _ => return Err(invalid("unsupported stop bits")),
    })
}

fn parity(parity: Parity) -> Result<serialport::Parity> {
    Ok(match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
        Parity::Mark | Parity::Space => return Err(invalid("unsupported parity")),
    })
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
        FlowControl::Software => serialport::FlowControl::Software,
    }
}

pub struct SerialTransport {
    port: TTYPort,
    name: String,
}

impl SerialTransport {
    pub fn open(path: &str, parameters: &SerialParameters) -> Result<Self> {
        if is_port_open(path) {
            return Err(Error::PortBusy(path.to_string()));
        }

        let port = serialport::new(path, parameters.baud)
            .data_bits(data_bits(parameters.data_bits)?)
            .stop_bits(stop_bits(parameters.stop_bits)?)
            .parity(parity(parameters.parity)?)
            .flow_control(flow_control(parameters.flow_control))
            .timeout(Duration::ZERO)
            .open_native()?;

        debug!("serial open OK: {} @ {} baud", path, parameters.baud);
        Ok(SerialTransport {
            port,
            name: path.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn read_data(&mut self, buffer: &mut [u8], initial: Duration, subsequent: Duration) -> Result<usize> {
        let mut count = 0;
        let mut timeout = initial;

        while count < buffer.len() {
            if !self.await_input(timeout)? {
                break;
            }
            match self.port.read(&mut buffer[count..]) {
                Ok(0) => break,
                Ok(n) => {
                    count += n;
                    timeout = subsequent;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    break
                }
                Err(_) if count > 0 => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(count)
    }

    fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        await_fd(self.port.as_raw_fd(), PollFlags::POLLIN, timeout)
    }

    fn write_data(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.port.set_timeout(timeout)?;
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(data.len())
    }

    fn reconfigure(&mut self, parameters: &SerialParameters) -> Result<()> {
        self.port.set_baud_rate(parameters.baud)?;
        self.port.set_data_bits(data_bits(parameters.data_bits)?)?;
        self.port.set_stop_bits(stop_bits(parameters.stop_bits)?)?;
        self.port.set_parity(parity(parameters.parity)?)?;
        self.port
            .set_flow_control(flow_control(parameters.flow_control))?;
        debug!("serial reconfigured: {} @ {} baud", self.name, parameters.baud);
        Ok(())
    }

    fn resource_name(&mut self, _timeout: Duration) -> Result<String> {
        Ok(self.name.clone())
    }
}
