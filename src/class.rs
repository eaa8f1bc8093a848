//! Class of Device decoding.
//!
//! Devices report a 24-bit Class of Device in their `Class` property. It names the kind of device
//! (major and minor class) and the kinds of services it offers.

use bitflags::bitflags;

/// A raw Class of Device value as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceClass(u32);

/// The major device class (bits 8-12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MajorClass {
    Miscellaneous,
    Computer,
    Phone,
    NetworkAccessPoint,
    AudioVideo,
    Peripheral,
    Imaging,
    Wearable,
    Toy,
    Health,
    Uncategorized,
}

bitflags! {
    /// Major service classes (bits 13-23).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceClasses: u32 {
        const LIMITED_DISCOVERABLE = 1 << 13;
        const POSITIONING = 1 << 16;
        const NETWORKING = 1 << 17;
        const RENDERING = 1 << 18;
        const CAPTURING = 1 << 19;
        const OBJECT_TRANSFER = 1 << 20;
        const AUDIO = 1 << 21;
        const TELEPHONY = 1 << 22;
        const INFORMATION = 1 << 23;
    }
}

impl DeviceClass {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn major(&self) -> MajorClass {
        match (self.0 >> 8) & 0x1f {
            0x01 => MajorClass::Computer,
            0x02 => MajorClass::Phone,
            0x03 => MajorClass::NetworkAccessPoint,
            0x04 => MajorClass::AudioVideo,
            0x05 => MajorClass::Peripheral,
            0x06 => MajorClass::Imaging,
            0x07 => MajorClass::Wearable,
            0x08 => MajorClass::Toy,
            0x09 => MajorClass::Health,
            0x1f => MajorClass::Uncategorized,
            _ => MajorClass::Miscellaneous,
        }
    }

    /// The minor class (bits 2-7). Its meaning depends on [`DeviceClass::major`].
    pub fn minor(&self) -> u8 {
        ((self.0 >> 2) & 0x3f) as u8
    }

    pub fn services(&self) -> ServiceClasses {
        ServiceClasses::from_bits_truncate(self.0)
    }

    /// A freedesktop icon name for the device, for when the daemon doesn't report one.
    pub fn icon_hint(&self) -> &'static str {
        match self.major() {
            MajorClass::Computer => "computer",
            MajorClass::Phone => "phone",
            MajorClass::NetworkAccessPoint => "network-wireless",
            MajorClass::AudioVideo => match self.minor() {
                // Wearable headset, hands-free, headphones
                0x01 | 0x02 | 0x06 => "audio-headset",
                0x0b | 0x0c | 0x0d => "camera-video",
                _ => "audio-card",
            },
            MajorClass::Peripheral => match (self.minor() >> 4) & 0x03 {
                0x01 => "input-keyboard",
                0x02 => "input-mouse",
                _ => match self.minor() & 0x0f {
                    0x01 | 0x02 => "input-gaming",
                    0x05 => "input-tablet",
                    _ => "input-keyboard",
                },
            },
            MajorClass::Imaging => {
                if self.minor() & 0x08 != 0 {
                    "camera-photo"
                } else if self.minor() & 0x20 != 0 {
                    "printer"
                } else if self.minor() & 0x10 != 0 {
                    "scanner"
                } else if self.minor() & 0x04 != 0 {
                    "video-display"
                } else {
                    "bluetooth"
                }
            }
            _ => "bluetooth",
        }
    }
}

impl From<u32> for DeviceClass {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headset() {
        // Audio/Video, wearable headset, with audio + rendering services.
        let class = DeviceClass::from_raw(0x240404);
        assert_eq!(class.major(), MajorClass::AudioVideo);
        assert_eq!(class.minor(), 0x01);
        assert_eq!(
            class.services(),
            ServiceClasses::AUDIO | ServiceClasses::RENDERING
        );
        assert_eq!(class.icon_hint(), "audio-headset");
    }

    #[test]
    fn smartphone() {
        let class = DeviceClass::from_raw(0x5a020c);
        assert_eq!(class.major(), MajorClass::Phone);
        assert!(class.services().contains(ServiceClasses::TELEPHONY));
        assert!(class.services().contains(ServiceClasses::OBJECT_TRANSFER));
        assert_eq!(class.icon_hint(), "phone");
    }

    #[test]
    fn peripherals() {
        assert_eq!(DeviceClass::from_raw(0x002540).icon_hint(), "input-keyboard");
        assert_eq!(DeviceClass::from_raw(0x002580).icon_hint(), "input-mouse");
        assert_eq!(DeviceClass::from_raw(0x002508).icon_hint(), "input-gaming");
    }

    #[test]
    fn imaging() {
        assert_eq!(DeviceClass::from_raw(0x000620).icon_hint(), "camera-photo");
        assert_eq!(DeviceClass::from_raw(0x000680).icon_hint(), "printer");
        assert_eq!(DeviceClass::from_raw(0x000640).icon_hint(), "scanner");
        assert_eq!(DeviceClass::from_raw(0x000610).icon_hint(), "video-display");
        // Imaging without any of the known minor bits.
        assert_eq!(DeviceClass::from_raw(0x000600).icon_hint(), "bluetooth");
    }

    #[test]
    fn uncategorized() {
        let class = DeviceClass::from_raw(0x1f00);
        assert_eq!(class.major(), MajorClass::Uncategorized);
        assert_eq!(class.icon_hint(), "bluetooth");
        assert_eq!(DeviceClass::from_raw(0).major(), MajorClass::Miscellaneous);
    }
}
