//! Superblock, indirect FAT and FAT of a folder card.
//!
//! These are the only parts of the card kept fully in memory. The FAT is
//! rebuilt from the host folder on every open; the superblock is loaded
//! from the `_pcsx2_superblock` sidecar.

use bytemuck::{Pod, Zeroable};

use crate::card::{BLOCK_SIZE, PAGES_PER_BLOCK, PAGE_SIZE};

pub const PAGES_PER_CLUSTER: usize = 2;
pub const CLUSTER_SIZE: usize = PAGE_SIZE * PAGES_PER_CLUSTER;
pub const CLUSTER_SIZE_RAW: usize = crate::card::PAGE_SIZE_RAW * PAGES_PER_CLUSTER;

/// Cluster count assumed when the superblock does not carry one (8 MiB).
pub const TOTAL_CLUSTERS: u32 = 0x2000;

pub const INDIRECT_FAT_CLUSTER_COUNT: usize = 1;
/// 32-bit pointers held by one cluster.
pub const POINTERS_PER_CLUSTER: usize = CLUSTER_SIZE / 4;
pub const FAT_SLOTS: usize = INDIRECT_FAT_CLUSTER_COUNT * POINTERS_PER_CLUSTER * POINTERS_PER_CLUSTER;

pub const DATA_CLUSTER_IN_USE_MASK: u32 = 0x8000_0000;
pub const NEXT_DATA_CLUSTER_MASK: u32 = 0x7FFF_FFFF;
pub const LAST_DATA_CLUSTER: u32 = 0x7FFF_FFFF;
pub const INDIRECT_FAT_UNUSED: u32 = 0xFFFF_FFFF;
/// Returned by the allocator when no data cluster is free.
pub const NO_FREE_CLUSTER: u32 = 0xFFFF_FFFF;

/// Minimum sidecar length for a superblock to be considered at all.
pub const SUPERBLOCK_MIN_LEN: usize = 0x154;

pub const SUPERBLOCK_MAGIC: &[u8; 28] = b"Sony PS2 Memory Card Format ";
pub const SUPERBLOCK_VERSION: &[u8; 7] = b"1.2.0.0";

/// Superblock occupying block 0, padded to a full block.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Superblock {
    pub magic: [u8; 28],
    pub version: [u8; 12],
    pub page_len: u16,
    pub pages_per_cluster: u16,
    pub pages_per_block: u16,
    pub unused: u16,
    pub clusters_per_card: u32,
    pub alloc_offset: u32,
    pub alloc_end: u32,
    pub rootdir_cluster: u32,
    pub backup_block1: u32,
    pub backup_block2: u32,
    pub unused2: [u8; 8],
    pub ifc_list: [u32; 32],
    pub bad_block_list: [u32; 32],
    pub card_type: u8,
    pub card_flags: u8,
    pub padding: [u8; BLOCK_SIZE - 0x152],
}

impl Superblock {
    /// A superblock with every byte set to `0xFF`, as on erased flash.
    pub fn erased() -> Self {
        let mut sb = Self::zeroed();
        bytemuck::bytes_of_mut(&mut sb).fill(0xFF);
        sb
    }

    /// A freshly formatted superblock for a card of `clusters` clusters.
    pub fn formatted(clusters: u32) -> Self {
        let mut sb = Self::erased();
        sb.magic = *SUPERBLOCK_MAGIC;
        sb.version = [0; 12];
        sb.version[..SUPERBLOCK_VERSION.len()].copy_from_slice(SUPERBLOCK_VERSION);
        sb.page_len = PAGE_SIZE as u16;
        sb.pages_per_cluster = PAGES_PER_CLUSTER as u16;
        sb.pages_per_block = PAGES_PER_BLOCK as u16;
        sb.unused = 0xFF00;
        sb.rootdir_cluster = 0;
        sb.unused2 = [0; 8];
        sb.ifc_list = [0; 32];
        sb.ifc_list[0] = 8;
        sb.bad_block_list = [INDIRECT_FAT_UNUSED; 32];
        sb.card_type = 2;
        sb.card_flags = 0x52;
        sb.resize(clusters);
        sb
    }

    /// Byte `0x16` of the magic is `'o'` on any formatted card.
    pub fn is_formatted(&self) -> bool {
        bytemuck::bytes_of(self)[0x16] == 0x6F
    }

    /// Cluster count from the superblock, or the 8 MiB default.
    pub fn size_in_clusters(&self) -> u32 {
        match self.clusters_per_card {
            0 | 0xFFFF_FFFF => TOTAL_CLUSTERS,
            clusters => clusters,
        }
    }

    /// Recompute the geometry fields for a card of `clusters` clusters.
    pub fn resize(&mut self, clusters: u32) {
        self.clusters_per_card = clusters;
        let alloc_offset = clusters / 0x100 + 9;
        self.alloc_offset = alloc_offset;
        self.alloc_end = clusters.wrapping_sub(0x10).wrapping_sub(alloc_offset);
        let blocks = clusters / (PAGES_PER_BLOCK / PAGES_PER_CLUSTER) as u32;
        self.backup_block1 = blocks.wrapping_sub(1);
        self.backup_block2 = blocks.wrapping_sub(2);
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }
}

/// In-memory system structures of a folder card.
pub struct SystemArea {
    pub superblock: Superblock,
    pub indirect_fat: Vec<u32>,
    pub fat: Vec<u32>,
    pub backup_block1: Vec<u8>,
    pub backup_block2: Vec<u8>,
}

impl Default for SystemArea {
    fn default() -> Self {
        Self {
            superblock: Superblock::erased(),
            indirect_fat: vec![INDIRECT_FAT_UNUSED; INDIRECT_FAT_CLUSTER_COUNT * POINTERS_PER_CLUSTER],
            fat: vec![0xFFFF_FFFF; FAT_SLOTS],
            backup_block1: vec![0xFF; BLOCK_SIZE],
            backup_block2: vec![0xFF; BLOCK_SIZE],
        }
    }
}

impl SystemArea {
    /// Reset everything to erased flash.
    pub fn reset(&mut self) {
        self.superblock = Superblock::erased();
        self.indirect_fat.fill(INDIRECT_FAT_UNUSED);
        self.fat.fill(0xFFFF_FFFF);
        self.backup_block1.fill(0xFF);
        self.backup_block2.fill(0xFF);
    }

    /// First word of backup block 2; anything but `0xFFFFFFFF` means an
    /// emulated save was cut short.
    pub fn programmed_block(&self) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.backup_block2[..4]);
        u32::from_le_bytes(word)
    }

    /// FAT slot of a data cluster. Out-of-range clusters read as free and terminal.
    pub fn fat_entry(&self, cluster: u32) -> u32 {
        self.fat
            .get(cluster as usize)
            .copied()
            .unwrap_or(LAST_DATA_CLUSTER)
    }

    pub fn set_fat_entry(&mut self, cluster: u32, value: u32) {
        if let Some(slot) = self.fat.get_mut(cluster as usize) {
            *slot = value;
        }
    }

    pub fn is_cluster_in_use(&self, cluster: u32) -> bool {
        self.fat_entry(cluster) & DATA_CLUSTER_IN_USE_MASK != 0
    }

    /// Next cluster in a chain, or `None` at the end of it.
    pub fn next_cluster(&self, cluster: u32) -> Option<u32> {
        match self.fat_entry(cluster) & NEXT_DATA_CLUSTER_MASK {
            LAST_DATA_CLUSTER => None,
            next => Some(next),
        }
    }

    pub fn fat_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.fat)
    }

    pub fn fat_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.fat)
    }

    pub fn indirect_fat_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indirect_fat)
    }

    pub fn indirect_fat_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.indirect_fat)
    }

    /// Lay out the indirect FAT and mark every data cluster free.
    pub fn create_fat(&mut self) {
        let total_clusters = self.superblock.clusters_per_card as usize;
        let fat_clusters = total_clusters
            .div_ceil(POINTERS_PER_CLUSTER)
            .min(self.indirect_fat.len());
        for i in 0..fat_clusters {
            self.indirect_fat[i] = self.free_system_cluster();
        }

        let data_clusters = (self.superblock.alloc_end as usize).min(self.fat.len());
        self.fat[..data_clusters].fill(LAST_DATA_CLUSTER);
    }

    /// One past the highest cluster used by block 0, the indirect FAT or the FAT.
    ///
    /// System clusters are never freed, so this never searches for gaps.
    pub fn free_system_cluster(&self) -> u32 {
        let sb = &self.superblock;
        let mut highest = u32::from(sb.pages_per_block / sb.pages_per_cluster.max(1)).saturating_sub(1);
        for &cluster in &sb.ifc_list[..INDIRECT_FAT_CLUSTER_COUNT] {
            highest = highest.max(cluster);
        }
        for &cluster in &self.indirect_fat {
            if cluster != INDIRECT_FAT_UNUSED {
                highest = highest.max(cluster);
            }
        }
        highest.wrapping_add(1)
    }

    /// Data clusters offered to the indexer, rounded down the way the BIOS reports them.
    ///
    /// 8 MiB: 7999 exposed of 8135.
    pub fn amount_data_clusters(&self) -> u32 {
        ((self.superblock.alloc_end / 1000) * 1000).saturating_sub(1)
    }

    /// First free data cluster, or [`NO_FREE_CLUSTER`].
    pub fn free_data_cluster(&self) -> u32 {
        let count = (self.amount_data_clusters() as usize).min(self.fat.len());
        self.fat[..count]
            .iter()
            .position(|&entry| entry & DATA_CLUSTER_IN_USE_MASK == 0)
            .map_or(NO_FREE_CLUSTER, |i| i as u32)
    }

    pub fn amount_free_data_clusters(&self) -> u32 {
        let count = (self.amount_data_clusters() as usize).min(self.fat.len());
        self.fat[..count]
            .iter()
            .filter(|&&entry| entry & DATA_CLUSTER_IN_USE_MASK == 0)
            .count() as u32
    }

    /// Follow a chain to its final cluster.
    pub fn last_cluster_of_data(&self, cluster: u32) -> u32 {
        let mut current = cluster;
        for _ in 0..self.fat.len() {
            match self.next_cluster(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    /// Every cluster of a chain starting at `cluster`, in order.
    pub fn chain(&self, cluster: u32) -> Vec<u32> {
        let mut clusters = Vec::new();
        let mut current = cluster & NEXT_DATA_CLUSTER_MASK;
        while current != LAST_DATA_CLUSTER && clusters.len() < self.fat.len() {
            clusters.push(current);
            current = self.fat_entry(current) & NEXT_DATA_CLUSTER_MASK;
        }
        clusters
    }
}
