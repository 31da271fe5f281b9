//! SCSI odd parity

use crate::types::DataBus;

const fn build_lookup() -> [u16; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let dbp = if (i as u8).count_ones() % 2 == 0 {
            1 << 8
        } else {
            0
        };
        table[i] = i as u16 | dbp;
        i += 1;
    }
    table
}

/// Data byte -> 9-bit bus word with DBP set so the total is odd
static PARITY_LOOKUP: [u16; 256] = build_lookup();

/// Returns the bus image of `byte` with odd parity
#[inline(always)]
pub fn with_parity(byte: u8) -> DataBus {
    DataBus(PARITY_LOOKUP[byte as usize])
}

/// Checks a sampled bus word for odd parity
#[inline(always)]
pub fn parity_ok(bus: DataBus) -> bool {
    (bus.0 & 0x1FF).count_ones() % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_parity() {
        assert!(with_parity(0x00).parity());
        assert!(!with_parity(0x01).parity());
        assert!(with_parity(0x03).parity());
        assert!(!with_parity(0xFE).parity());
        for b in 0..=255u8 {
            let bus = with_parity(b);
            assert_eq!(bus.data(), b);
            assert!(parity_ok(bus));
        }
    }

    #[test]
    fn detects_flipped_bit() {
        let mut bus = with_parity(0x5A);
        bus.set_parity(!bus.parity());
        assert!(!parity_ok(bus));
        let bus = DataBus(with_parity(0x5A).0 ^ 0x10);
        assert!(!parity_ok(bus));
    }
}
