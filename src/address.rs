//! Bluetooth device addresses.
//!
//! BlueZ reports addresses as colon-separated hex strings and also encodes them into device
//! object paths (`/org/bluez/hci0/dev_AA_BB_CC_11_22_33`).

use core::fmt;
use std::str::FromStr;

/// Describes the meaning of the bytes in an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AddressType {
    /// Address follows the MAC address standard (vendor prefix plus device part).
    Public,
    /// Address is randomly generated, either static or private (BLE Privacy).
    Random,
}

impl FromStr for AddressType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "random" => Ok(Self::Random),
            _ => Err(crate::Error::from(format!("invalid address type '{}'", s))),
        }
    }
}

/// A 6-Byte Bluetooth device address.
///
/// Ordering follows the byte order, which matches the textual order of the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 6]);

impl Address {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Extracts the address encoded in a BlueZ device object path.
    ///
    /// Returns [`None`] if the last path segment is not of the form `dev_XX_XX_XX_XX_XX_XX`.
    pub fn from_device_path(path: &str) -> Option<Self> {
        let segment = path.rsplit('/').next()?;
        let hex = segment.strip_prefix("dev_")?;
        parse_groups(hex, '_').ok()
    }

    /// Formats the address the way BlueZ embeds it in device object paths.
    pub(crate) fn path_segment(&self) -> String {
        format!("dev_{}", self.to_string().replace(':', "_"))
    }
}

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl From<Address> for [u8; 6] {
    #[inline]
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// Parses a Bluetooth [`Address`] from a colon-separated hex string.
///
/// Example: `aa:ff:00:33:22:11`
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_groups(s, ':')
    }
}

fn parse_groups(s: &str, separator: char) -> Result<Address, ParseAddressError> {
    let mut bytes = [0; 6];
    let mut groups = s.split(separator);
    for byte in &mut bytes {
        let group = groups.next().ok_or(ParseAddressError::Length)?;
        if group.len() != 2 {
            return Err(ParseAddressError::Length);
        }
        // `from_str_radix` would accept a leading sign.
        if !group.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseAddressError::Digit(group.to_string()));
        }
        *byte = u8::from_str_radix(group, 16)
            .map_err(|_| ParseAddressError::Digit(group.to_string()))?;
    }

    if groups.next().is_some() {
        return Err(ParseAddressError::Length);
    }
    Ok(Address(bytes))
}

/// The error type returned by the [`FromStr`] implementation of [`Address`].
#[derive(Debug)]
pub enum ParseAddressError {
    /// Wrong number of groups, or a group that isn't exactly 2 digits wide.
    Length,
    /// A group contained a non-hex character.
    Digit(String),
}

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length => f.write_str("invalid device address"),
            Self::Digit(group) => write!(f, "invalid hex group '{}' in device address", group),
        }
    }
}

impl std::error::Error for ParseAddressError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let s = "AA:BB:CC:11:22:33";
        let addr = Address::from_str(s).unwrap();
        assert_eq!(addr.to_string(), s);
        assert_eq!(Address::from_str("aa:bb:cc:11:22:33").unwrap(), addr);
    }

    #[test]
    fn invalid() {
        Address::from_str("").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:3").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:333").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:44").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33 ").unwrap_err();
        Address::from_str("za:bb:cc:11:22:33").unwrap_err();
        Address::from_str("+a:bb:cc:11:22:33").unwrap_err();
    }

    #[test]
    fn device_path() {
        let addr = Address::from_device_path("/org/bluez/hci0/dev_00_1A_7D_DA_71_13").unwrap();
        assert_eq!(addr, Address::from_bytes([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]));
        assert_eq!(addr.path_segment(), "dev_00_1A_7D_DA_71_13");

        assert_eq!(Address::from_device_path("/org/bluez/hci0"), None);
        assert_eq!(Address::from_device_path("/org/bluez/hci0/dev_00_1A"), None);
    }

    #[test]
    fn address_type() {
        assert_eq!("public".parse::<AddressType>().unwrap(), AddressType::Public);
        assert_eq!("random".parse::<AddressType>().unwrap(), AddressType::Random);
        "Public".parse::<AddressType>().unwrap_err();
    }
}
