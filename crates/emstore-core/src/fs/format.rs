//! Formatting a card with an MBR and a single FAT16/FAT32 partition.
//!
//! `embedded-sdmmc` can only mount existing volumes, so the supervisor brings
//! its own minimal mkfs. The layout follows the usual SD conventions: one
//! primary partition aligned to 1 MiB, two FAT copies, FAT16 while the
//! cluster count allows it and FAT32 above that.

use log::info;
use thiserror_no_std::Error;

use crate::sdmmc::{BLOCK_LEN, BlockTransport, SdError, Sector};

/// First sector of the partition (1 MiB alignment)
pub const PARTITION_START: u32 = 2048;

/// Smallest card that can hold a FAT16 volume with 512 byte clusters
pub const MIN_CARD_SECTORS: u32 = PARTITION_START + 16 * 1024;

const VOLUME_LABEL: &[u8; 11] = b"EMSTORE    ";
const OEM_NAME: &[u8; 8] = b"EMSTORE ";
const MEDIA_FIXED: u8 = 0xF8;

const FAT16_ROOT_ENTRIES: u16 = 512;
const FAT16_MIN_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65525;
const FAT32_RESERVED_SECTORS: u16 = 32;
const FAT32_FSINFO_SECTOR: u16 = 1;
const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;

const PARTITION_TYPE_FAT16: u8 = 0x06;
const PARTITION_TYPE_FAT32_LBA: u8 = 0x0C;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("card too small to format ({0} sectors)")]
    TooSmall(u32),
    #[error("device error while formatting: {0}")]
    Device(SdError),
}

impl From<SdError> for FormatError {
    fn from(e: SdError) -> Self {
        FormatError::Device(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat16,
    Fat32,
}

/// Geometry of the volume written by [`format_card`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub kind: FatKind,
    pub partition_sectors: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_sectors: u32,
    pub root_dir_sectors: u32,
    pub cluster_count: u32,
}

impl Layout {
    pub fn for_card(card_sectors: u32) -> Result<Self, FormatError> {
        if card_sectors < MIN_CARD_SECTORS {
            return Err(FormatError::TooSmall(card_sectors));
        }
        let partition_sectors = card_sectors - PARTITION_START;

        let root_dir_sectors = u32::from(FAT16_ROOT_ENTRIES) * 32 / BLOCK_LEN as u32;
        let mut spc = 1;
        while spc <= 64 {
            let layout = Self::compute(FatKind::Fat16, partition_sectors, spc, 1, root_dir_sectors, 2);
            if layout.cluster_count < FAT16_MIN_CLUSTERS {
                break;
            }
            if layout.cluster_count < FAT16_MAX_CLUSTERS {
                return Ok(layout);
            }
            spc *= 2;
        }

        let spc = match partition_sectors {
            s if s < 16 * 1024 * 1024 => 8,
            s if s < 32 * 1024 * 1024 => 16,
            s if s < 64 * 1024 * 1024 => 32,
            _ => 64,
        };
        Ok(Self::compute(
            FatKind::Fat32,
            partition_sectors,
            spc,
            u32::from(FAT32_RESERVED_SECTORS),
            0,
            4,
        ))
    }

    fn compute(
        kind: FatKind,
        partition_sectors: u32,
        sectors_per_cluster: u32,
        reserved_sectors: u32,
        root_dir_sectors: u32,
        entry_len: u32,
    ) -> Self {
        let available = partition_sectors - reserved_sectors - root_dir_sectors;
        // Sized for the upper bound of clusters, the real count is lower once
        // the FATs take their share
        let fat_sectors = ((available / sectors_per_cluster + 2) * entry_len).div_ceil(BLOCK_LEN as u32);
        let cluster_count = (available - 2 * fat_sectors) / sectors_per_cluster;
        Self {
            kind,
            partition_sectors,
            sectors_per_cluster,
            reserved_sectors,
            fat_sectors,
            root_dir_sectors,
            cluster_count,
        }
    }

    fn fat_start(&self) -> u32 {
        PARTITION_START + self.reserved_sectors
    }

    /// First sector past the metadata that has to start out zeroed
    fn metadata_end(&self) -> u32 {
        let data_start = self.fat_start() + 2 * self.fat_sectors + self.root_dir_sectors;
        match self.kind {
            FatKind::Fat16 => data_start,
            // Root directory lives in cluster 2
            FatKind::Fat32 => data_start + self.sectors_per_cluster,
        }
    }
}

fn put_u16(buf: &mut Sector, offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Sector, offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn boot_sector(layout: &Layout, volume_id: u32) -> Sector {
    let mut bs = [0u8; BLOCK_LEN];
    bs[3..11].copy_from_slice(OEM_NAME);
    put_u16(&mut bs, 11, BLOCK_LEN as u16);
    bs[13] = layout.sectors_per_cluster as u8;
    put_u16(&mut bs, 14, layout.reserved_sectors as u16);
    bs[16] = 2;
    bs[21] = MEDIA_FIXED;
    put_u16(&mut bs, 24, 63);
    put_u16(&mut bs, 26, 255);
    put_u32(&mut bs, 28, PARTITION_START);

    match layout.kind {
        FatKind::Fat16 => {
            bs[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
            put_u16(&mut bs, 17, FAT16_ROOT_ENTRIES);
            if layout.partition_sectors < 0x1_0000 {
                put_u16(&mut bs, 19, layout.partition_sectors as u16);
            } else {
                put_u32(&mut bs, 32, layout.partition_sectors);
            }
            put_u16(&mut bs, 22, layout.fat_sectors as u16);
            bs[36] = 0x80;
            bs[38] = 0x29;
            put_u32(&mut bs, 39, volume_id);
            bs[43..54].copy_from_slice(VOLUME_LABEL);
            bs[54..62].copy_from_slice(b"FAT16   ");
        }
        FatKind::Fat32 => {
            bs[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
            put_u32(&mut bs, 32, layout.partition_sectors);
            put_u32(&mut bs, 36, layout.fat_sectors);
            // Version 0.0, the only one readers accept
            put_u16(&mut bs, 42, 0);
            put_u32(&mut bs, 44, 2);
            put_u16(&mut bs, 48, FAT32_FSINFO_SECTOR);
            put_u16(&mut bs, 50, FAT32_BACKUP_BOOT_SECTOR);
            bs[64] = 0x80;
            bs[66] = 0x29;
            put_u32(&mut bs, 67, volume_id);
            bs[71..82].copy_from_slice(VOLUME_LABEL);
            bs[82..90].copy_from_slice(b"FAT32   ");
        }
    }
    bs[510] = 0x55;
    bs[511] = 0xAA;
    bs
}

fn fs_info_sector(layout: &Layout) -> Sector {
    let mut fsi = [0u8; BLOCK_LEN];
    put_u32(&mut fsi, 0, 0x4161_5252);
    put_u32(&mut fsi, 484, 0x6141_7272);
    // Cluster 2 holds the root directory
    put_u32(&mut fsi, 488, layout.cluster_count - 1);
    put_u32(&mut fsi, 492, 3);
    put_u32(&mut fsi, 508, 0xAA55_0000);
    fsi
}

fn first_fat_sector(layout: &Layout) -> Sector {
    let mut fat = [0u8; BLOCK_LEN];
    match layout.kind {
        FatKind::Fat16 => {
            put_u16(&mut fat, 0, 0xFF00 | u16::from(MEDIA_FIXED));
            put_u16(&mut fat, 2, 0xFFFF);
        }
        FatKind::Fat32 => {
            put_u32(&mut fat, 0, 0x0FFF_FF00 | u32::from(MEDIA_FIXED));
            put_u32(&mut fat, 4, 0x0FFF_FFFF);
            // End of chain for the root directory cluster
            put_u32(&mut fat, 8, 0x0FFF_FFFF);
        }
    }
    fat
}

fn master_boot_record(layout: &Layout) -> Sector {
    let mut mbr = [0u8; BLOCK_LEN];
    let entry = 446;
    mbr[entry] = 0x00;
    // CHS fields are ignored by LBA readers, mark them as "use LBA"
    mbr[entry + 1..entry + 4].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    mbr[entry + 4] = match layout.kind {
        FatKind::Fat16 => PARTITION_TYPE_FAT16,
        FatKind::Fat32 => PARTITION_TYPE_FAT32_LBA,
    };
    mbr[entry + 5..entry + 8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    put_u32(&mut mbr, entry + 8, PARTITION_START);
    put_u32(&mut mbr, entry + 12, layout.partition_sectors);
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

/// Writes a fresh, empty volume over the whole card.
///
/// The partition table is invalidated first and written last, an interrupted
/// format leaves a card that does not mount rather than a half-built volume.
pub async fn format_card<B: BlockTransport>(transport: &mut B) -> Result<Layout, FormatError> {
    let layout = Layout::for_card(transport.sector_count())?;
    info!(
        "format: {:?}, {} clusters of {} sectors",
        layout.kind, layout.cluster_count, layout.sectors_per_cluster
    );

    let zero = [0u8; BLOCK_LEN];
    transport.write_block(0, &zero).await?;
    for sector in PARTITION_START..layout.metadata_end() {
        transport.write_block(sector, &zero).await?;
    }

    let fat = first_fat_sector(&layout);
    transport.write_block(layout.fat_start(), &fat).await?;
    transport
        .write_block(layout.fat_start() + layout.fat_sectors, &fat)
        .await?;

    let volume_id = 0x454D_0000 ^ transport.sector_count();
    let boot = boot_sector(&layout, volume_id);
    if layout.kind == FatKind::Fat32 {
        let fs_info = fs_info_sector(&layout);
        let fs_info_sector = PARTITION_START + u32::from(FAT32_FSINFO_SECTOR);
        let backup = PARTITION_START + u32::from(FAT32_BACKUP_BOOT_SECTOR);
        transport.write_block(fs_info_sector, &fs_info).await?;
        transport.write_block(backup, &boot).await?;
        transport.write_block(backup + 1, &fs_info).await?;
    }
    transport.write_block(PARTITION_START, &boot).await?;

    transport.write_block(0, &master_boot_record(&layout)).await?;
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdmmc::ram::RamCard;
    use embassy_futures::block_on;

    #[test]
    fn test_small_card_uses_fat16() {
        let layout = Layout::for_card(20 * 1024).expect("card is large enough");
        assert_eq!(layout.kind, FatKind::Fat16);
        assert_eq!(layout.sectors_per_cluster, 1);
        assert!(layout.cluster_count >= FAT16_MIN_CLUSTERS);
        // Every cluster plus the two reserved entries fits the FAT
        assert!((layout.cluster_count + 2) * 2 <= layout.fat_sectors * BLOCK_LEN as u32);
    }

    #[test]
    fn test_cluster_size_grows_with_card() {
        // 1 GiB
        let layout = Layout::for_card(2 * 1024 * 1024).expect("card is large enough");
        assert_eq!(layout.kind, FatKind::Fat16);
        assert_eq!(layout.sectors_per_cluster, 32);
        assert!(layout.cluster_count < FAT16_MAX_CLUSTERS);
    }

    #[test]
    fn test_large_card_uses_fat32() {
        // 8 GiB
        let layout = Layout::for_card(16 * 1024 * 1024).expect("card is large enough");
        assert_eq!(layout.kind, FatKind::Fat32);
        assert_eq!(layout.sectors_per_cluster, 8);
        assert!(layout.cluster_count >= FAT16_MAX_CLUSTERS);
        assert!((layout.cluster_count + 2) * 4 <= layout.fat_sectors * BLOCK_LEN as u32);
    }

    #[test]
    fn test_too_small() {
        assert_eq!(Layout::for_card(4096), Err(FormatError::TooSmall(4096)));
    }

    #[test]
    fn test_format_writes_mbr_and_boot_sector() {
        let card = RamCard::new(20 * 1024);
        let mut transport = card.clone();
        block_on(transport.initialize()).expect("card is present");
        let layout = block_on(format_card(&mut transport)).expect("format should succeed");

        let mbr = card.block(0);
        assert_eq!(&mbr[510..], &[0x55, 0xAA]);
        assert_eq!(mbr[450], PARTITION_TYPE_FAT16);
        assert_eq!(u32::from_le_bytes([mbr[454], mbr[455], mbr[456], mbr[457]]), PARTITION_START);

        let boot = card.block(PARTITION_START);
        assert_eq!(u16::from_le_bytes([boot[11], boot[12]]), 512);
        assert_eq!(&boot[43..54], VOLUME_LABEL);

        let fat = card.block(PARTITION_START + layout.reserved_sectors);
        assert_eq!(&fat[..4], &[0xF8, 0xFF, 0xFF, 0xFF]);
    }
}
