//! GF(256) arithmetic over packet buffers.
//!
//! The field element type is generated by the `gf256` crate over the
//! polynomial `0x14d` with generator `0x2`, matching the decoder. Bulk
//! operations on byte slices go through a precomputed 256x256 product table
//! with u64-wide XOR for the add paths.

use gf256::gf::gf;

#[gf(polynomial = 0x14d, generator = 0x2)]
pub type Gf256;

/// Const-compatible GF(256) multiply for table generation.
/// Polynomial: 0x14d = x^8 + x^6 + x^3 + x^2 + 1
const fn gf_mul(a: u8, b: u8) -> u8 {
    let mut product = 0u16;
    let mut a = a as u16;
    let mut b = b;

    let mut bit = 0;
    while bit < 8 {
        if b & 1 != 0 {
            product ^= a;
        }
        a <<= 1;
        b >>= 1;
        bit += 1;
    }

    // Reduce the degree-14 product by the field polynomial
    let mut i = 15;
    while i >= 8 {
        if product & (1 << i) != 0 {
            product ^= 0x14d << (i - 8);
        }
        i -= 1;
    }

    product as u8
}

/// `PRODUCT[y][x] = x * y` in GF(256), computed once at compile time.
static PRODUCT: [[u8; 256]; 256] = {
    let mut tables = [[0u8; 256]; 256];
    let mut y = 0;
    while y < 256 {
        let mut x = 0;
        while x < 256 {
            tables[y][x] = gf_mul(x as u8, y as u8);
            x += 1;
        }
        y += 1;
    }
    tables
};

/// `x * x` in GF(256).
#[inline]
pub fn sqr(x: u8) -> u8 {
    PRODUCT[x as usize][x as usize]
}

/// `dst[i] ^= src[i]`
///
/// Addition and subtraction are both XOR in GF(256).
#[inline]
pub fn xor_mem(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());

    // Process 8 bytes at a time using u64
    let len = dst.len();
    let chunks = len / 8;
    for i in 0..chunks {
        let base = i * 8;
        let v1 = u64::from_ne_bytes(dst[base..base + 8].try_into().unwrap());
        let v2 = u64::from_ne_bytes(src[base..base + 8].try_into().unwrap());
        dst[base..base + 8].copy_from_slice(&(v1 ^ v2).to_ne_bytes());
    }

    for i in chunks * 8..len {
        dst[i] ^= src[i];
    }
}

/// `dst[i] = src[i] * y`
#[inline]
pub fn mul_mem(dst: &mut [u8], src: &[u8], y: u8) {
    debug_assert_eq!(dst.len(), src.len());

    if y == 0 {
        dst.fill(0);
        return;
    }
    if y == 1 {
        dst.copy_from_slice(src);
        return;
    }

    let table = &PRODUCT[y as usize];
    for (d, s) in dst.iter_mut().zip(src) {
        *d = table[*s as usize];
    }
}

/// `dst[i] ^= src[i] * y`
#[inline]
pub fn muladd_mem(dst: &mut [u8], y: u8, src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());

    if y == 0 {
        return;
    }
    if y == 1 {
        xor_mem(dst, src);
        return;
    }

    let table = &PRODUCT[y as usize];
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= table[*s as usize];
    }
}
