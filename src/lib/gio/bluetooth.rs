use super::identifier::BluetoothAddress;
use super::{await_fd, timeout_millis, Transport, TransportKind};
use crate::error::{Error, Result};
use lazy_static::lazy_static;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{getsockopt, sockopt};
use nix::unistd::{close, read, write};
use std::collections::HashMap;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

const BTPROTO_RFCOMM: libc::c_int = 3;

#[allow(non_camel_case_types)]
#[repr(C)]
struct sockaddr_rc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

lazy_static! {
    static ref CONNECT_ERRORS: Mutex<HashMap<BluetoothAddress, Errno>> = Mutex::new(HashMap::new());
}

fn remember_error(address: BluetoothAddress, error: Errno) {
    if let Ok(mut errors) = CONNECT_ERRORS.lock() {
        errors.insert(address, error);
    }
}

fn recall_error(address: BluetoothAddress) -> Option<Errno> {
    CONNECT_ERRORS
        .lock()
        .ok()
        .and_then(|errors| errors.get(&address).copied())
}

fn forget_error(address: BluetoothAddress) {
    if let Ok(mut errors) = CONNECT_ERRORS.lock() {
        errors.remove(&address);
    }
}

/// An RFCOMM stream socket.
pub struct BluetoothTransport {
    fd: RawFd,
    address: BluetoothAddress,
    channel: u8,
}

impl BluetoothTransport {
    pub fn connect(address: BluetoothAddress, channel: u8, timeout: Duration) -> Result<Self> {
        if let Some(error) = recall_error(address) {
            debug!("previous connect to {} failed: {}", address, error);
        }

        match Self::open(address, channel, timeout) {
            Ok(transport) => {
                forget_error(address);
                debug!("bluetooth open OK: {} channel {}", address, channel);
                Ok(transport)
            }
            Err(e) => {
                if let Error::Sys(errno) = &e {
                    remember_error(address, *errno);
                }
                Err(e)
            }
        }
    }

    fn open(address: BluetoothAddress, channel: u8, timeout: Duration) -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
        if fd < 0 {
            return Err(Errno::last().into());
        }
        // owns fd from here on, so early returns close it
        let transport = BluetoothTransport {
            fd,
            address,
            channel,
        };

        fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        let remote = sockaddr_rc {
            rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: address.to_bdaddr(),
            rc_channel: channel,
        };
        let result = unsafe {
            libc::connect(
                fd,
                &remote as *const sockaddr_rc as *const libc::sockaddr,
                mem::size_of::<sockaddr_rc>() as libc::socklen_t,
            )
        };
        if result < 0 {
            let errno = Errno::last();
            if errno != Errno::EINPROGRESS {
                return Err(errno.into());
            }
            let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
            if poll(&mut fds, timeout_millis(timeout))? == 0 {
                return Err(Errno::ETIMEDOUT.into());
            }
            let status = getsockopt(fd, sockopt::SocketError)?;
            if status != 0 {
                return Err(Errno::from_i32(status).into());
            }
        }

        Ok(transport)
    }
}

impl Drop for BluetoothTransport {
    fn drop(&mut self) {
        if let Err(e) = close(self.fd) {
            debug!("bluetooth close failed: {}", e);
        }
    }
}

impl Transport for BluetoothTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn read_data(&mut self, buffer: &mut [u8], initial: Duration, subsequent: Duration) -> Result<usize> {
        let mut count = 0;
        let mut timeout = initial;

        while count < buffer.len() {
            if !self.await_input(timeout)? {
                break;
            }
            match read(self.fd, &mut buffer[count..]) {
                Ok(0) => break,
                Ok(n) => {
                    count += n;
                    timeout = subsequent;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(_) if count > 0 => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(count)
    }

    fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        await_fd(self.fd, PollFlags::POLLIN, timeout)
    }

    fn write_data(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let mut count = 0;
        while count < data.len() {
            match write(self.fd, &data[count..]) {
                Ok(n) => count += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    if !await_fd(self.fd, PollFlags::POLLOUT, timeout)? {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    fn resource_name(&mut self, _timeout: Duration) -> Result<String> {
        Ok(format!("{} channel {}", self.address, self.channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_layout() {
        assert_eq!(mem::size_of::<sockaddr_rc>(), 10);
    }

    #[test]
    fn connect_errors_are_remembered() {
        let address: BluetoothAddress = "00:0A:0B:0C:0D:0E".parse().unwrap();
        assert_eq!(recall_error(address), None);
        remember_error(address, Errno::EHOSTDOWN);
        assert_eq!(recall_error(address), Some(Errno::EHOSTDOWN));
        forget_error(address);
        assert_eq!(recall_error(address), None);
    }
}
