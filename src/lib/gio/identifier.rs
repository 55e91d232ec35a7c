use lazy_static::lazy_static;
use regex::Regex;
use std::{fmt::Display, str::FromStr};

use crate::error::Error;

/// Strips `qualifier:` from the front of `identifier`.
///
/// The text before the first colon may abbreviate the qualifier
/// (`ser:/dev/ttyS0` matches `serial`), compared case-insensitively.
pub fn qualified<'a>(identifier: &'a str, qualifier: &str) -> Option<&'a str> {
    let (prefix, rest) = identifier.split_once(':')?;
    if prefix.is_empty() || prefix.len() > qualifier.len() {
        return None;
    }
    if qualifier[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(rest)
    } else {
        None
    }
}

pub fn has_qualifier(identifier: &str) -> bool {
    identifier.contains(':')
}

pub fn is_serial_device(identifier: &str) -> Option<&str> {
    if let Some(rest) = qualified(identifier, "serial") {
        return Some(rest);
    }
    if has_qualifier(identifier) {
        None
    } else {
        Some(identifier)
    }
}

pub fn is_usb_device(identifier: &str) -> Option<&str> {
    qualified(identifier, "usb")
}

pub fn is_bluetooth_device(identifier: &str) -> Option<&str> {
    ["bluetooth", "bt", "bluez"]
        .iter()
        .find_map(|q| qualified(identifier, q))
}

pub fn is_hid_device(identifier: &str) -> Option<&str> {
    qualified(identifier, "hid")
}

/// Relative device names live under `/dev`.
pub fn device_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/dev/{}", name)
    }
}

/// A Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BluetoothAddress(pub [u8; 6]);

impl BluetoothAddress {
    /// Byte order expected by the kernel's `bdaddr_t`.
    pub fn to_bdaddr(self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl FromStr for BluetoothAddress {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^([[:xdigit:]]{1,2}:){5}[[:xdigit:]]{1,2}$").unwrap();
        }

        if !RE.is_match(input) {
            return Err(Error::InvalidIdentifier(input.to_string()));
        }

        let mut address = [0u8; 6];
        for (byte, text) in address.iter_mut().zip(input.split(':')) {
            *byte = u8::from_str_radix(text, 16)
                .map_err(|_| Error::InvalidIdentifier(input.to_string()))?;
        }
        Ok(BluetoothAddress(address))
    }
}

impl Display for BluetoothAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifier_is_stripped() {
        assert_eq!(qualified("usb:1234", "usb"), Some("1234"));
        assert_eq!(qualified("USB:", "usb"), Some(""));
        assert_eq!(qualified("ser:ttyS0", "serial"), Some("ttyS0"));
        assert_eq!(qualified("serials:ttyS0", "serial"), None);
        assert_eq!(qualified(":ttyS0", "serial"), None);
        assert_eq!(qualified("ttyS0", "serial"), None);
    }

    #[test]
    fn unqualified_is_serial() {
        assert_eq!(is_serial_device("ttyUSB0"), Some("ttyUSB0"));
        assert_eq!(is_serial_device("serial:/dev/ttyS1"), Some("/dev/ttyS1"));
        assert_eq!(is_serial_device("usb:"), None);
        assert_eq!(is_usb_device("usb:A1B2"), Some("A1B2"));
    }

    #[test]
    fn bluetooth_aliases() {
        for id in &[
            "bluetooth:00:11:22:33:44:55",
            "bt:00:11:22:33:44:55",
            "bluez:00:11:22:33:44:55",
        ] {
            assert_eq!(is_bluetooth_device(id), Some("00:11:22:33:44:55"));
        }
        assert_eq!(is_bluetooth_device("usb:"), None);
    }

    #[test]
    fn device_path_prefix() {
        assert_eq!(device_path("ttyS0"), "/dev/ttyS0");
        assert_eq!(device_path("/dev/ttyACM0"), "/dev/ttyACM0");
    }

    #[test]
    fn parse_bluetooth_address() {
        let address: BluetoothAddress = "00:1a:2B:3:44:f5".parse().unwrap();
        assert_eq!(address.0, [0x00, 0x1A, 0x2B, 0x03, 0x44, 0xF5]);
        assert_eq!(address.to_bdaddr(), [0xF5, 0x44, 0x03, 0x2B, 0x1A, 0x00]);
        assert_eq!(address.to_string(), "00:1A:2B:03:44:F5");

        assert!("00:11:22:33:44".parse::<BluetoothAddress>().is_err());
        assert!("00:11:22:33:44:GG".parse::<BluetoothAddress>().is_err());
        assert!("001:11:22:33:44:55".parse::<BluetoothAddress>().is_err());
    }
}
