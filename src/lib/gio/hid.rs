use super::{await_fd, HidFilter, Transport, TransportKind};
use crate::error::{Error, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::poll::PollFlags;
use nix::sys::stat::Mode;
use nix::unistd::{close, read, write};
use nix::{ioctl_read, ioctl_read_buf, ioctl_readwrite_buf};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Input = 1,
    Output = 2,
    Feature = 3,
}

impl ReportKind {
    /// wValue of a GET_REPORT/SET_REPORT class request.
    pub fn report_value(self, id: u8) -> u16 {
        (self as u16) << 8 | id as u16
    }
}

/// Report sizes in bytes, report id byte included when there is one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HidReportSize {
    pub input: usize,
    pub output: usize,
    pub feature: usize,
}

mod item {
    pub const INPUT: u8 = 0x80;
    pub const OUTPUT: u8 = 0x90;
    pub const FEATURE: u8 = 0xB0;
    pub const REPORT_SIZE: u8 = 0x74;
    pub const REPORT_ID: u8 = 0x84;
    pub const REPORT_COUNT: u8 = 0x94;
    pub const LONG: u8 = 0xFC;
}

/// Walks short items, yielding (type, unsigned value).
/// A truncated item ends the walk with `Err(())`.
fn items(bytes: &[u8]) -> impl Iterator<Item = std::result::Result<(u8, u32), ()>> + '_ {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        let (&prefix, tail) = rest.split_first()?;
        let kind = prefix & 0xFC;
        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        if kind == item::LONG {
            // data size, long tag, data
            let long = tail.first().map(|&n| n as usize + 2).unwrap_or(usize::MAX);
            if long > tail.len() {
                rest = &[];
                return Some(Err(()));
            }
            rest = &tail[long..];
            return Some(Ok((kind, 0)));
        }
        if size > tail.len() {
            rest = &[];
            return Some(Err(()));
        }
        let value = tail[..size]
            .iter()
            .rev()
            .fold(0u32, |value, &byte| value << 8 | byte as u32);
        rest = &tail[size..];
        Some(Ok((kind, value)))
    })
}

/// Sizes of report `id` according to the report descriptor `bytes`.
///
/// Id 0 means the device doesn't number its reports; a descriptor that
/// declares report ids has no report 0.
pub fn report_size(bytes: &[u8], id: u8) -> Option<HidReportSize> {
    let unnumbered = id == 0;
    let mut found = unnumbered;

    let mut bits = [0u32; 3];
    let mut current_id = 0u32;
    let mut size = 0u32;
    let mut count = 0u32;

    for entry in items(bytes) {
        let (kind, value) = entry.ok()?;
        match kind {
            item::REPORT_ID => {
                if unnumbered {
                    return None;
                }
                current_id = value;
                if current_id == id as u32 {
                    found = true;
                }
            }
            item::INPUT | item::OUTPUT | item::FEATURE => {
                if current_id == id as u32 {
                    let slot = match kind {
                        item::INPUT => 0,
                        item::OUTPUT => 1,
                        _ => 2,
                    };
                    bits[slot] = bits[slot].checked_add(size.checked_mul(count)?)?;
                }
            }
            item::REPORT_SIZE => size = value,
            item::REPORT_COUNT => count = value,
            _ => {}
        }
    }

    if !found {
        return None;
    }

    let to_bytes = |bits: u32| {
        let mut bytes = ((u64::from(bits) + 7) / 8) as usize;
        if bytes > 0 && !unnumbered {
            bytes += 1;
        }
        bytes
    };
    let sizes = HidReportSize {
        input: to_bytes(bits[0]),
        output: to_bytes(bits[1]),
        feature: to_bytes(bits[2]),
    };
    debug!(
        "report size: {:02X} In:{} Out:{} Ftr:{}",
        id, sizes.input, sizes.output, sizes.feature
    );
    Some(sizes)
}

mod ioctl {
    use super::*;

    pub const DESCRIPTOR_SIZE: usize = 4096;

    #[allow(non_camel_case_types)]
    #[repr(C)]
    pub struct hidraw_report_descriptor {
        pub size: u32,
        pub value: [u8; DESCRIPTOR_SIZE],
    }

    #[allow(non_camel_case_types)]
    #[derive(Debug, Default)]
    #[repr(C)]
    pub struct hidraw_devinfo {
        pub bustype: u32,
        pub vendor: i16,
        pub product: i16,
    }

    ioctl_read!(descriptor_size, b'H', 0x01, libc::c_int);
    ioctl_read!(descriptor, b'H', 0x02, hidraw_report_descriptor);
    ioctl_read!(device_info, b'H', 0x03, hidraw_devinfo);
    ioctl_read_buf!(device_name, b'H', 0x04, u8);
    ioctl_readwrite_buf!(set_feature, b'H', 0x06, u8);
    ioctl_readwrite_buf!(get_feature, b'H', 0x07, u8);
    ioctl_readwrite_buf!(get_input, b'H', 0x0A, u8);
    ioctl_readwrite_buf!(set_output, b'H', 0x0B, u8);
}

const REPORT_CAPACITY: usize = 0x400;

/// A Linux hidraw device node.
pub struct HidTransport {
    fd: RawFd,
    path: String,
    pending: VecDeque<u8>,
}

fn filter_matches(filter: &HidFilter, vendor: u16, product: u16) -> bool {
    (filter.vendor == 0 || filter.vendor == vendor) && (filter.product == 0 || filter.product == product)
}

impl HidTransport {
    pub fn open(path: &str, filters: &[HidFilter]) -> Result<(Self, HidFilter)> {
        let fd = open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())?;
        let transport = HidTransport {
            fd,
            path: path.to_string(),
            pending: VecDeque::new(),
        };

        let mut info = ioctl::hidraw_devinfo::default();
        unsafe { ioctl::device_info(fd, &mut info) }?;
        let (vendor, product) = (info.vendor as u16, info.product as u16);

        match filters.iter().find(|f| filter_matches(f, vendor, product)) {
            Some(filter) => {
                debug!("hid open OK: {} {:04X}:{:04X}", path, vendor, product);
                Ok((transport, *filter))
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:04X}:{:04X} not handled", vendor, product),
            )
            .into()),
        }
    }

    fn fill(&mut self) -> Result<usize> {
        let mut report = [0u8; REPORT_CAPACITY];
        loop {
            match read(self.fd, &mut report) {
                Ok(n) => {
                    self.pending.extend(&report[..n]);
                    return Ok(n);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_pending(&mut self, buffer: &mut [u8]) -> usize {
        let n = self.pending.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        if let Err(e) = close(self.fd) {
            debug!("hid close failed: {}", e);
        }
    }
}

impl Transport for HidTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Hid
    }

    fn read_data(&mut self, buffer: &mut [u8], initial: Duration, subsequent: Duration) -> Result<usize> {
        let mut count = self.take_pending(buffer);
        let mut timeout = initial;

        while count < buffer.len() {
            if count > 0 {
                timeout = subsequent;
            }
            if !await_fd(self.fd, PollFlags::POLLIN, timeout)? || self.fill()? == 0 {
                break;
            }
            count += self.take_pending(&mut buffer[count..]);
        }

        Ok(count)
    }

    fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        await_fd(self.fd, PollFlags::POLLIN, timeout)
    }

    fn write_data(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        Ok(write(self.fd, data)?)
    }

    fn resource_name(&mut self, _timeout: Duration) -> Result<String> {
        let mut name = [0u8; 0x100];
        let count = unsafe { ioctl::device_name(self.fd, &mut name) }? as usize;
        let name = &name[..count.min(name.len())];
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        match String::from_utf8_lossy(&name[..end]).into_owned() {
            name if name.is_empty() => Ok(self.path.clone()),
            name => Ok(name),
        }
    }

    fn hid_descriptor(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        let mut size: libc::c_int = 0;
        unsafe { ioctl::descriptor_size(self.fd, &mut size) }?;

        let mut descriptor = Box::new(ioctl::hidraw_report_descriptor {
            size: (size.max(0) as usize).min(ioctl::DESCRIPTOR_SIZE) as u32,
            value: [0; ioctl::DESCRIPTOR_SIZE],
        });
        unsafe { ioctl::descriptor(self.fd, descriptor.as_mut()) }?;
        Ok(descriptor.value[..descriptor.size as usize].to_vec())
    }

    fn get_hid_report(&mut self, kind: ReportKind, id: u8, buffer: &mut [u8], _timeout: Duration) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }
        buffer[0] = id;
        let count = match kind {
            ReportKind::Input => unsafe { ioctl::get_input(self.fd, buffer) }?,
            ReportKind::Feature => unsafe { ioctl::get_feature(self.fd, buffer) }?,
            ReportKind::Output => return Err(Error::NotCapable("hid")),
        };
        Ok(count.max(0) as usize)
    }

    fn set_hid_report(&mut self, kind: ReportKind, id: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        let mut report = Vec::with_capacity(data.len() + 1);
        report.push(id);
        report.extend_from_slice(data);
        let count = match kind {
            ReportKind::Output => unsafe { ioctl::set_output(self.fd, &mut report) }?,
            ReportKind::Feature => unsafe { ioctl::set_feature(self.fd, &mut report) }?,
            ReportKind::Input => return Err(Error::NotCapable("hid")),
        };
        if (count.max(0) as usize) < report.len() {
            warn!("short hid report write: {} of {}", count, report.len());
        }
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Vendor-defined page, one 8 byte input report and one 40 byte output
    // report, both numbered.
    const NUMBERED: &[u8] = &[
        0x06, 0x00, 0xFF, // usage page (vendor)
        0x09, 0x01, // usage
        0xA1, 0x01, // collection (application)
        0x85, 0x01, // report id 1
        0x75, 0x08, // report size 8
        0x95, 0x08, // report count 8
        0x81, 0x02, // input
        0x85, 0x02, // report id 2
        0x95, 0x28, // report count 40
        0x91, 0x02, // output
        0xB1, 0x02, // feature
        0xC0, // end collection
    ];

    const UNNUMBERED: &[u8] = &[
        0x06, 0x00, 0xFF, 0x09, 0x01, 0xA1, 0x01, //
        0x75, 0x01, // report size 1
        0x95, 0x0C, // report count 12
        0x81, 0x02, // input
        0x75, 0x08, 0x95, 0x02, // 2 bytes
        0x91, 0x02, // output
        0xC0,
    ];

    #[test]
    fn numbered_reports() {
        assert_eq!(
            report_size(NUMBERED, 1),
            Some(HidReportSize {
                input: 9,
                output: 0,
                feature: 0
            })
        );
        assert_eq!(
            report_size(NUMBERED, 2),
            Some(HidReportSize {
                input: 0,
                output: 41,
                feature: 41
            })
        );
        assert_eq!(report_size(NUMBERED, 3), None);
        assert_eq!(report_size(NUMBERED, 0), None);
    }

    #[test]
    fn oversized_report_fields() {
        let overflowing = [
            0x77, 0xFF, 0xFF, 0xFF, 0xFF, // report size 0xFFFFFFFF
            0x97, 0x02, 0x00, 0x00, 0x00, // report count 2
            0x81, 0x02, // input
        ];
        assert_eq!(report_size(&overflowing, 0), None);

        let largest = [
            0x77, 0xFF, 0xFF, 0xFF, 0xFF, // report size 0xFFFFFFFF
            0x95, 0x01, // report count 1
            0x81, 0x02, // input
        ];
        assert_eq!(report_size(&largest, 0).map(|sizes| sizes.input), Some(0x2000_0000));
    }

    #[test]
    fn unnumbered_reports() {
        assert_eq!(
            report_size(UNNUMBERED, 0),
            Some(HidReportSize {
                input: 2,
                output: 2,
                feature: 0
            })
        );
    }

    #[test]
    fn truncated_item() {
        assert_eq!(report_size(&[0x75, 0x08, 0x96, 0x01], 0), None);
    }

    #[test]
    fn report_values() {
        assert_eq!(ReportKind::Input.report_value(0), 0x0100);
        assert_eq!(ReportKind::Feature.report_value(0x05), 0x0305);
    }
}
