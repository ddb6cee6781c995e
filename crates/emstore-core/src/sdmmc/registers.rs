//! CSD and CID register decoding.

use serde::{Deserialize, Serialize};

use super::{BLOCK_LEN, SdError};

/// Card generation detected during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardType {
    /// MultiMediaCard, initialized with CMD1
    Mmc,
    /// SD version 1.x, byte addressed
    SdV1,
    /// SD version 2.0 standard capacity, byte addressed
    SdV2,
    /// SDHC/SDXC, block addressed
    SdHc,
}

impl CardType {
    /// Returns true if commands take a sector index instead of a byte offset.
    pub const fn block_addressed(self) -> bool {
        matches!(self, CardType::SdHc)
    }

    pub const fn label(self) -> &'static str {
        match self {
            CardType::Mmc => "MMC",
            CardType::SdV1 => "SDv1",
            CardType::SdV2 => "SDv2",
            CardType::SdHc => "SDHC",
        }
    }
}

/// What the protocol layer can learn about the inserted card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    pub sector_size: u16,
    pub sector_count: u32,
    pub card_type: CardType,
    pub manufacturer_id: u8,
    pub product_rev: u8,
    pub product_name: [u8; 5],
}

/// Sector count from a 16 byte CSD register.
pub fn sector_count_from_csd(csd: &[u8; 16]) -> Result<u32, SdError> {
    match csd[0] >> 6 {
        // CSD version 1.0
        0 => {
            let read_bl_len = u32::from(csd[5] & 0x0F);
            let c_size = (u32::from(csd[6] & 0x03) << 10)
                | (u32::from(csd[7]) << 2)
                | (u32::from(csd[8]) >> 6);
            let c_size_mult = (u32::from(csd[9] & 0x03) << 1) | (u32::from(csd[10]) >> 7);
            let blocks = (c_size + 1) << (c_size_mult + 2);
            let bytes = u64::from(blocks) << read_bl_len;
            Ok((bytes / BLOCK_LEN as u64) as u32)
        }
        // CSD version 2.0, capacity in 512 KiB units
        1 => {
            let c_size = (u32::from(csd[7] & 0x3F) << 16)
                | (u32::from(csd[8]) << 8)
                | u32::from(csd[9]);
            Ok((c_size + 1) * 1024)
        }
        _ => Err(SdError::UnsupportedCard),
    }
}

/// Manufacturer id, product revision and product name from a CID register.
pub fn identity_from_cid(cid: &[u8; 16]) -> (u8, u8, [u8; 5]) {
    let mut name = [0u8; 5];
    name.copy_from_slice(&cid[3..8]);
    (cid[0], cid[8], name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csd_v2_capacity() {
        // 8 GB SDHC: c_size = 15159
        let mut csd = [0u8; 16];
        csd[0] = 0x40;
        csd[7] = 0x00;
        csd[8] = 0x3B;
        csd[9] = 0x37;
        assert_eq!(sector_count_from_csd(&csd), Ok(15_160 * 1024));
    }

    #[test]
    fn test_csd_v1_capacity() {
        // read_bl_len 9, c_size 4095, c_size_mult 7 -> 4096 * 512 blocks of 512 bytes
        let mut csd = [0u8; 16];
        csd[5] = 0x09;
        csd[6] = 0x03;
        csd[7] = 0xFF;
        csd[8] = 0xC0;
        csd[9] = 0x03;
        csd[10] = 0x80;
        assert_eq!(sector_count_from_csd(&csd), Ok(4096 * 512));
    }

    #[test]
    fn test_csd_unknown_version() {
        let mut csd = [0u8; 16];
        csd[0] = 0x80;
        assert_eq!(sector_count_from_csd(&csd), Err(SdError::UnsupportedCard));
    }

    #[test]
    fn test_cid_identity() {
        let mut cid = [0u8; 16];
        cid[0] = 0x03;
        cid[3..8].copy_from_slice(b"SU08G");
        cid[8] = 0x80;
        let (mid, rev, name) = identity_from_cid(&cid);
        assert_eq!(mid, 0x03);
        assert_eq!(rev, 0x80);
        assert_eq!(&name, b"SU08G");
    }
}
