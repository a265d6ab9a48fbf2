//! Perceptual image hashing (difference hash)
//!
//! Produces a 64-bit fingerprint that is stable under mild resizing,
//! re-encoding, and subtle watermarking, while visually distinct images
//! land far apart in Hamming distance.

use image::imageops::FilterType;
use image::DynamicImage;

use crate::types::Fingerprint;

/// Width of the reduced signature; one extra column so every row yields
/// eight left/right comparisons.
const HASH_WIDTH: u32 = 9;
/// Height of the reduced signature.
const HASH_HEIGHT: u32 = 8;

/// Compute the difference hash of a decoded image.
///
/// The image is reduced to a 9×8 grayscale signature with a Lanczos-3
/// filter, then each of the 64 horizontal neighbor pairs contributes one
/// bit: 1 when the left pixel is brighter than the right. Bits are packed
/// MSB-first, rows top-to-bottom, columns left-to-right, so an all-black
/// image hashes to `0` and a row-constant gradient that darkens
/// left-to-right hashes to `u64::MAX`.
pub fn dhash(img: &DynamicImage) -> Fingerprint {
    let signature = img
        .resize_exact(HASH_WIDTH, HASH_HEIGHT, FilterType::Lanczos3)
        .to_luma8();

    let mut hash: u64 = 0;
    for y in 0..HASH_HEIGHT {
        for x in 0..HASH_WIDTH - 1 {
            let left = signature.get_pixel(x, y)[0];
            let right = signature.get_pixel(x + 1, y)[0];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    hash
}

/// Number of differing bits between two fingerprints.
pub fn hamming_distance(a: Fingerprint, b: Fingerprint) -> u32 {
    (a ^ b).count_ones()
}
