//! Pixel format numbering
//!
//! The embedder speaks DRM fourcc codes. `wl_shm` reuses fourcc codes for
//! every format except the two mandatory ones, which are 0 and 1 on the
//! wire. Anything crossing into `wl_shm` must go through [`to_shm_format`].

/// Builds a little-endian fourcc code.
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Embedder `ARGB8888` (`AR24`).
pub const FOURCC_ARGB8888: u32 = fourcc(b'A', b'R', b'2', b'4');
/// Embedder `XRGB8888` (`XR24`).
pub const FOURCC_XRGB8888: u32 = fourcc(b'X', b'R', b'2', b'4');

/// `wl_shm.format.argb8888`
pub const SHM_FORMAT_ARGB8888: u32 = 0;
/// `wl_shm.format.xrgb8888`
pub const SHM_FORMAT_XRGB8888: u32 = 1;

/// Bytes per pixel assumed for every shared-memory allocation.
///
/// Formats with another pixel size get a wrong stride; callers only
/// allocate 32-bit formats.
pub const BYTES_PER_PIXEL: u32 = 4;

/// Translates an embedder format into the `wl_shm` numbering.
pub fn to_shm_format(format: u32) -> u32 {
    match format {
        FOURCC_XRGB8888 => SHM_FORMAT_XRGB8888,
        FOURCC_ARGB8888 => SHM_FORMAT_ARGB8888,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fourcc_layout() {
        assert_eq!(FOURCC_ARGB8888, 0x3432_5241);
        assert_eq!(FOURCC_XRGB8888, 0x3432_5258);
    }

    #[test]
    fn test_mandatory_formats_are_remapped() {
        assert_eq!(to_shm_format(FOURCC_ARGB8888), SHM_FORMAT_ARGB8888);
        assert_eq!(to_shm_format(FOURCC_XRGB8888), SHM_FORMAT_XRGB8888);
    }

    #[test]
    fn test_other_fourcc_codes_pass_through() {
        let rgb565 = fourcc(b'R', b'G', b'1', b'6');
        assert_eq!(to_shm_format(rgb565), rgb565);
    }

    proptest! {
        #[test]
        fn prop_only_two_formats_change(format in any::<u32>()) {
            let mapped = to_shm_format(format);
            if format == FOURCC_ARGB8888 || format == FOURCC_XRGB8888 {
                prop_assert!(mapped == SHM_FORMAT_ARGB8888 || mapped == SHM_FORMAT_XRGB8888);
            } else {
                prop_assert_eq!(mapped, format);
            }
        }
    }
}
