//! Hamming-style ECC over 128-byte page chunks.
//!
//! Every 512-byte page carries four 3-byte codes in its 16-byte trailer,
//! one per 128-byte chunk. The folder card regenerates them on each read.

use crate::card::{ECC_SIZE, PAGE_SIZE};

/// Bytes covered by one 3-byte code.
pub const ECC_CHUNK_SIZE: usize = 0x80;

/// Column parity of each byte value in bits 0-6, line parity in bit 7.
const TABLE: [u8; 256] = [
    0x00, 0x87, 0x96, 0x11, 0xa5, 0x22, 0x33, 0xb4, 0xb4, 0x33, 0x22, 0xa5, 0x11, 0x96, 0x87, 0x00,
    0xc3, 0x44, 0x55, 0xd2, 0x66, 0xe1, 0xf0, 0x77, 0x77, 0xf0, 0xe1, 0x66, 0xd2, 0x55, 0x44, 0xc3,
    0xd2, 0x55, 0x44, 0xc3, 0x77, 0xf0, 0xe1, 0x66, 0x66, 0xe1, 0xf0, 0x77, 0xc3, 0x44, 0x55, 0xd2,
    0x11, 0x96, 0x87, 0x00, 0xb4, 0x33, 0x22, 0xa5, 0xa5, 0x22, 0x33, 0xb4, 0x00, 0x87, 0x96, 0x11,
    0xe1, 0x66, 0x77, 0xf0, 0x44, 0xc3, 0xd2, 0x55, 0x55, 0xd2, 0xc3, 0x44, 0xf0, 0x77, 0x66, 0xe1,
    0x22, 0xa5, 0xb4, 0x33, 0x87, 0x00, 0x11, 0x96, 0x96, 0x11, 0x00, 0x87, 0x33, 0xb4, 0xa5, 0x22,
    0x33, 0xb4, 0xa5, 0x22, 0x96, 0x11, 0x00, 0x87, 0x87, 0x00, 0x11, 0x96, 0x22, 0xa5, 0xb4, 0x33,
    0xf0, 0x77, 0x66, 0xe1, 0x55, 0xd2, 0xc3, 0x44, 0x44, 0xc3, 0xd2, 0x55, 0xe1, 0x66, 0x77, 0xf0,
    0xf0, 0x77, 0x66, 0xe1, 0x55, 0xd2, 0xc3, 0x44, 0x44, 0xc3, 0xd2, 0x55, 0xe1, 0x66, 0x77, 0xf0,
    0x33, 0xb4, 0xa5, 0x22, 0x96, 0x11, 0x00, 0x87, 0x87, 0x00, 0x11, 0x96, 0x22, 0xa5, 0xb4, 0x33,
    0x22, 0xa5, 0xb4, 0x33, 0x87, 0x00, 0x11, 0x96, 0x96, 0x11, 0x00, 0x87, 0x33, 0xb4, 0xa5, 0x22,
    0xe1, 0x66, 0x77, 0xf0, 0x44, 0xc3, 0xd2, 0x55, 0x55, 0xd2, 0xc3, 0x44, 0xf0, 0x77, 0x66, 0xe1,
    0x11, 0x96, 0x87, 0x00, 0xb4, 0x33, 0x22, 0xa5, 0xa5, 0x22, 0x33, 0xb4, 0x00, 0x87, 0x96, 0x11,
    0xd2, 0x55, 0x44, 0xc3, 0x77, 0xf0, 0xe1, 0x66, 0x66, 0xe1, 0xf0, 0x77, 0xc3, 0x44, 0x55, 0xd2,
    0xc3, 0x44, 0x55, 0xd2, 0x66, 0xe1, 0xf0, 0x77, 0x77, 0xf0, 0xe1, 0x66, 0xd2, 0x55, 0x44, 0xc3,
    0x00, 0x87, 0x96, 0x11, 0xa5, 0x22, 0x33, 0xb4, 0xb4, 0x33, 0x22, 0xa5, 0x11, 0x96, 0x87, 0x00,
];

/// Raw parity accumulators for one chunk.
struct Parity {
    column: u8,
    line_inverted: u8,
    line: u8,
}

fn accumulate(chunk: &[u8]) -> Parity {
    let mut parity = Parity {
        column: 0,
        line_inverted: 0,
        line: 0,
    };
    for (i, &byte) in chunk.iter().take(ECC_CHUNK_SIZE).enumerate() {
        let c = TABLE[byte as usize];
        parity.column ^= c;
        if c & 0x80 != 0 {
            let i = i as u8;
            parity.line_inverted ^= !i;
            parity.line ^= i;
        }
    }
    parity
}

/// ECC of one 128-byte chunk as presented in a folder card's page trailer.
pub fn calculate(chunk: &[u8]) -> [u8; 3] {
    let p = accumulate(chunk);
    [!p.column & 0x77, !p.line_inverted & 0x7F, !p.line & 0x7F]
}

/// ECC of one chunk as written when converting ECC-less dumps.
///
/// Identical to [`calculate`] except that bit 7 of the second byte keeps the
/// raw line parity instead of being masked off.
pub fn calculate_unmasked(chunk: &[u8]) -> [u8; 3] {
    let p = accumulate(chunk);
    [0x77 ^ (p.column & 0x77), 0x7F ^ p.line_inverted, 0x7F ^ p.line]
}

/// Full 16-byte trailer for a page: four codes, then `0xFF` padding.
pub fn page_ecc(page: &[u8; PAGE_SIZE]) -> [u8; ECC_SIZE] {
    let mut ecc = [0xFF; ECC_SIZE];
    for (i, chunk) in page.chunks_exact(ECC_CHUNK_SIZE).enumerate() {
        ecc[i * 3..i * 3 + 3].copy_from_slice(&calculate(chunk));
    }
    ecc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_mirrored() {
        for row in 0..8 {
            assert_eq!(TABLE[row * 16..row * 16 + 16], TABLE[(15 - row) * 16..(16 - row) * 16]);
        }
    }

    #[test]
    fn test_erased_chunk() {
        // 0xFF maps to 0x00 in the table, so nothing accumulates.
        let chunk = [0xFFu8; ECC_CHUNK_SIZE];
        assert_eq!(calculate(&chunk), [0x77, 0x7F, 0x7F]);
        assert_eq!(calculate_unmasked(&chunk), [0x77, 0x7F, 0x7F]);
    }

    #[test]
    fn test_zero_chunk() {
        let chunk = [0u8; ECC_CHUNK_SIZE];
        assert_eq!(calculate(&chunk), [0x77, 0x7F, 0x7F]);
    }

    #[test]
    fn test_single_byte() {
        let mut chunk = [0u8; ECC_CHUNK_SIZE];
        chunk[5] = 0x01;
        // TABLE[1] = 0x87: column 0x87, line_inverted !5 = 0xFA, line 5
        assert_eq!(calculate(&chunk), [!0x87u8 & 0x77, !0xFAu8 & 0x7F, !5u8 & 0x7F]);
        assert_eq!(calculate_unmasked(&chunk), [0x77 ^ 0x07, 0x7F ^ 0xFA, 0x7F ^ 5]);
    }

    #[test]
    fn test_deterministic() {
        let chunk: Vec<u8> = (0..ECC_CHUNK_SIZE as u32).map(|i| (i * 37 + 11) as u8).collect();
        let first = calculate(&chunk);
        for _ in 0..4 {
            assert_eq!(calculate(&chunk), first);
        }
    }

    #[test]
    fn test_variants_differ_only_in_high_bit() {
        let chunk: Vec<u8> = (0..ECC_CHUNK_SIZE as u32).map(|i| (i * 91 + 3) as u8).collect();
        let masked = calculate(&chunk);
        let unmasked = calculate_unmasked(&chunk);
        assert_eq!(masked[0], unmasked[0]);
        assert_eq!(masked[1], unmasked[1] & 0x7F);
        assert_eq!(masked[2], unmasked[2]);
    }

    #[test]
    fn test_page_ecc_layout() {
        let mut page = [0u8; PAGE_SIZE];
        page[0x80] = 0x01;
        let ecc = page_ecc(&page);
        assert_eq!(&ecc[0..3], &calculate(&page[0..0x80]));
        assert_eq!(&ecc[3..6], &calculate(&page[0x80..0x100]));
        assert_eq!(&ecc[12..16], &[0xFF; 4]);
    }
}
