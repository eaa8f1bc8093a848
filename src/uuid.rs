//! Bluetooth service UUIDs.

use core::fmt;
use std::str::FromStr;

/// A 128-bit UUID identifying a Bluetooth profile or service.
///
/// BlueZ reports the services a device advertises as a list of these (the `UUIDs` property).
/// Most of them are 16-bit aliases assigned by the Bluetooth SIG, placed on the Bluetooth base
/// UUID. [`Uuid::from_u16`] and [`Uuid::as_u16`] convert between both forms.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(u128);

/// `00000000-0000-1000-8000-00805f9b34fb`
const BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const ALIAS_MASK: u128 = 0xffff_ffff << 96;

/// Well-known services and the names shown to users for them.
const SERVICE_NAMES: &[(u16, &str)] = &[
    (0x1101, "Serial Port"),
    (0x1103, "Dial-Up Networking"),
    (0x1105, "Object Push"),
    (0x1106, "File Transfer"),
    (0x1108, "Headset"),
    (0x110a, "Audio Source"),
    (0x110b, "Audio Sink"),
    (0x110c, "A/V Remote Control Target"),
    (0x110e, "A/V Remote Control"),
    (0x1112, "Headset Audio Gateway"),
    (0x1115, "PAN User"),
    (0x1116, "Network Access Point"),
    (0x1117, "Group Ad-hoc Network"),
    (0x111e, "Hands-Free"),
    (0x111f, "Hands-Free Audio Gateway"),
    (0x1124, "Human Interface Device"),
    (0x112f, "Phonebook Access"),
    (0x1132, "Message Access"),
    (0x1200, "PnP Information"),
    (0x1800, "Generic Access"),
    (0x1801, "Generic Attribute"),
    (0x180a, "Device Information"),
    (0x180d, "Heart Rate"),
    (0x180f, "Battery"),
    (0x1812, "HID over GATT"),
];

impl Uuid {
    /// Creates a [`Uuid`] from its 128-bit integer representation.
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Creates a [`Uuid`] from a 16-bit alias.
    pub const fn from_u16(short: u16) -> Self {
        Self(BASE | (short as u128) << 96)
    }

    /// Returns the 16-bit alias of this [`Uuid`], if it is one of the SIG-assigned short UUIDs.
    pub fn as_u16(&self) -> Option<u16> {
        let alias = (self.0 & ALIAS_MASK) >> 96;
        if self.0 & !ALIAS_MASK == BASE && alias <= u16::MAX as u128 {
            Some(alias as u16)
        } else {
            None
        }
    }

    /// Returns the human-readable name of the service, if it is a commonly used profile.
    pub fn service_name(&self) -> Option<&'static str> {
        let short = self.as_u16()?;
        SERVICE_NAMES
            .iter()
            .find(|(alias, _)| *alias == short)
            .map(|(_, name)| *name)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

/// Parses the canonical hyphenated form, eg. `0000110b-0000-1000-8000-00805f9b34fb`.
impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

        let mut value = 0u128;
        let mut parts = s.split('-');
        for len in GROUPS {
            let part = parts.next().ok_or(ParseUuidError::Eof)?;
            if part.len() < len {
                return Err(ParseUuidError::Eof);
            }
            if part.len() > len {
                return Err(ParseUuidError::InvalidDash);
            }
            for digit in part.chars() {
                let nibble = digit.to_digit(16).ok_or(ParseUuidError::InvalidDigit)?;
                value = value << 4 | nibble as u128;
            }
        }

        if parts.next().is_some() {
            return Err(ParseUuidError::TrailingData);
        }
        Ok(Self(value))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            v >> 96,
            (v >> 80) & 0xffff,
            (v >> 64) & 0xffff,
            (v >> 48) & 0xffff,
            v & 0xffff_ffff_ffff
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service_name() {
            Some(name) => write!(f, "{} ({})", self, name),
            None => fmt::Display::fmt(self, f),
        }
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Uuid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseUuidError {
    Eof,
    InvalidDigit,
    InvalidDash,
    TrailingData,
}

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eof => "unexpected end of input",
            Self::InvalidDigit => "invalid hex digit",
            Self::InvalidDash => "invalid character (`-` expected)",
            Self::TrailingData => "invalid trailing data",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ParseUuidError {}

/// Parses a `UUIDs` property value, skipping (and logging) entries that aren't valid UUIDs.
pub(crate) fn parse_list<S: AsRef<str>>(strings: &[S]) -> Vec<Uuid> {
    strings
        .iter()
        .map(AsRef::as_ref)
        .filter_map(|s| match Uuid::from_str(s) {
            Ok(uuid) => Some(uuid),
            Err(e) => {
                log::warn!("ignoring malformed service UUID '{}': {}", s, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base() {
        assert_eq!(
            Uuid::from_u128(BASE).to_string(),
            "00000000-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn parse() {
        let uuid: Uuid = "0000110B-0000-1000-8000-00805F9B34FB".parse().unwrap();
        assert_eq!(uuid, Uuid::from_u16(0x110b));
        assert_eq!(uuid.to_string(), "0000110b-0000-1000-8000-00805f9b34fb");

        let custom: Uuid = "7c9ac820-0886-4e50-bcca-588b883f8649".parse().unwrap();
        assert_eq!(custom.to_string(), "7c9ac820-0886-4e50-bcca-588b883f8649");
        assert_eq!(custom.as_u16(), None);
    }

    #[test]
    fn invalid() {
        assert_eq!("".parse::<Uuid>(), Err(ParseUuidError::Eof));
        assert_eq!(
            "0000110b-0000-1000-8000".parse::<Uuid>(),
            Err(ParseUuidError::Eof)
        );
        assert_eq!(
            "0000110b-0000-1000-8000-00805f9b34fg".parse::<Uuid>(),
            Err(ParseUuidError::InvalidDigit)
        );
        assert_eq!(
            "0000110b00000-1000-8000-00805f9b34fb".parse::<Uuid>(),
            Err(ParseUuidError::InvalidDash)
        );
        assert_eq!(
            "0000110b-0000-1000-8000-00805f9b34fb-".parse::<Uuid>(),
            Err(ParseUuidError::TrailingData)
        );
    }

    #[test]
    fn aliases() {
        assert_eq!(Uuid::from_u16(0x180d).as_u16(), Some(0x180d));
        assert_eq!(Uuid::from_u16(0x110e).service_name(), Some("A/V Remote Control"));
        assert_eq!(Uuid::from_u16(0xfff0).service_name(), None);
        // 32-bit aliases are on the base UUID too, but have no 16-bit form.
        assert_eq!(Uuid::from_u128(BASE | 0x0001_0000 << 96).as_u16(), None);
    }

    #[test]
    fn list_skips_malformed() {
        let uuids = parse_list(&[
            "00001108-0000-1000-8000-00805f9b34fb",
            "not-a-uuid",
            "0000110B-0000-1000-8000-00805F9B34FB",
        ]);
        assert_eq!(uuids, [Uuid::from_u16(0x1108), Uuid::from_u16(0x110b)]);
        assert!(parse_list::<String>(&[]).is_empty());
    }
}
