//! sdio-disk - SD Status register
//!
//! The 512-bit SD Status register (ACMD13), read back after bus bring-up to
//! confirm the negotiated bus width and report the card's class.

use super::BusWidth;

/// The raw contents of the SD Status register, as sent by the card.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SdStatusRegister {
    data: [u8; 64],
}

impl Default for SdStatusRegister {
    fn default() -> Self {
        SdStatusRegister { data: [0u8; 64] }
    }
}

impl core::fmt::Debug for SdStatusRegister {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdStatusRegister")
            .field("dat_bus_width", &self.dat_bus_width())
            .field("sd_card_type", &self.sd_card_type())
            .field("speed_class", &self.speed_class())
            .field("au_size", &self.au_size())
            .finish()
    }
}

impl SdStatusRegister {
    /// Size of the register in bytes.
    pub const LEN: usize = 64;

    /// Wrap register contents received from the card.
    pub fn new(data: [u8; 64]) -> SdStatusRegister {
        SdStatusRegister { data }
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(dat_bus_width, u8, 0, 6, 2);
    define_field!(secured_mode, bool, 0, 5);
    define_field!(sd_card_type, u16, [(2, 0, 8), (3, 0, 8)]);
    define_field!(
        size_of_protected_area,
        u32,
        [(4, 0, 8), (5, 0, 8), (6, 0, 8), (7, 0, 8)]
    );
    define_field!(speed_class, u8, 8, 0, 8);
    define_field!(performance_move, u8, 9, 0, 8);
    define_field!(au_size, u8, 10, 4, 4);
    define_field!(erase_size, u16, [(11, 0, 8), (12, 0, 8)]);
    define_field!(erase_timeout, u8, 13, 2, 6);
    define_field!(erase_offset, u8, 13, 0, 2);
    define_field!(uhs_speed_grade, u8, 14, 4, 4);

    /// The data bus width the card reports it is currently using.
    pub fn bus_width(&self) -> Option<BusWidth> {
        match self.dat_bus_width() {
            0 => Some(BusWidth::One),
            2 => Some(BusWidth::Four),
            _ => None,
        }
    }

    /// The speed class in MB/s, as defined by the class code.
    pub fn speed_class_mbps(&self) -> Option<u8> {
        match self.speed_class() {
            0 => Some(0),
            1 => Some(2),
            2 => Some(4),
            3 => Some(6),
            4 => Some(10),
            _ => None,
        }
    }
}
