//! Internet checksum (RFC 1071) and transport pseudo-header sums.

use std::net::IpAddr;

/// Sum 16-bit big-endian words into a 32-bit accumulator.
/// A trailing odd byte is padded with zero.
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold carries until the sum fits in 16 bits
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Folded ones'-complement sum of a buffer, not inverted.
///
/// Running this over a buffer that already carries a correct checksum
/// yields 0xFFFF.
pub fn checksum_fold(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Compute the internet checksum of a buffer
pub fn internet_checksum(data: &[u8]) -> u16 {
    !checksum_fold(data)
}

/// Check that a buffer containing its own checksum field verifies
pub fn verify_checksum(data: &[u8]) -> bool {
    checksum_fold(data) == 0xFFFF
}

/// Transport checksum over the IPv4/IPv6 pseudo-header plus `segment`.
///
/// The checksum field inside `segment` must be zeroed by the caller.
/// Returns 0 for mixed address families.
pub fn pseudo_header_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            // src(4) dst(4) zero(1) protocol(1) length(2)
            sum = sum_words(&src.octets(), sum);
            sum = sum_words(&dst.octets(), sum);
            sum = sum.wrapping_add(protocol as u32);
            sum = sum.wrapping_add(segment.len() as u32 & 0xFFFF);
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            // src(16) dst(16) length(4) zero(3) next_header(1)
            sum = sum_words(&src.octets(), sum);
            sum = sum_words(&dst.octets(), sum);
            sum = sum_words(&(segment.len() as u32).to_be_bytes(), sum);
            sum = sum.wrapping_add(protocol as u32);
        }
        _ => return 0,
    }
    !fold(sum_words(segment, sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_rfc1071_example() {
        // Example from RFC 1071 section 3: sum of these words is 0xddf2
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum_fold(&data), 0xddf2);
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn test_odd_length_pads_with_zero() {
        assert_eq!(checksum_fold(&[0xAB]), 0xAB00);
        assert_eq!(checksum_fold(&[0x12, 0x34, 0xAB]), 0x1234 + 0xAB00);
    }

    #[test]
    fn test_empty_buffer() {
        assert_eq!(internet_checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_carry_folding() {
        // 0xFFFF + 0xFFFF = 0x1FFFE -> 0xFFFF after fold
        assert_eq!(checksum_fold(&[0xFF, 0xFF, 0xFF, 0xFF]), 0xFFFF);
    }

    #[test]
    fn test_pseudo_header_v4_verifies() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let mut segment = vec![0u8; 20];
        segment[0..2].copy_from_slice(&50000u16.to_be_bytes());
        segment[2..4].copy_from_slice(&33434u16.to_be_bytes());
        segment[13] = 0x02;

        let cksum = pseudo_header_checksum(src, dst, 6, &segment);
        segment[16..18].copy_from_slice(&cksum.to_be_bytes());

        // Re-summing with the checksum in place must give zero after inversion
        assert_eq!(pseudo_header_checksum(src, dst, 6, &segment), 0);
    }

    #[test]
    fn test_pseudo_header_v6_verifies() {
        let src = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let dst = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2));
        let mut segment = vec![0x5Au8; 21];
        segment[16] = 0;
        segment[17] = 0;

        let cksum = pseudo_header_checksum(src, dst, 6, &segment);
        segment[16..18].copy_from_slice(&cksum.to_be_bytes());
        assert_eq!(pseudo_header_checksum(src, dst, 6, &segment), 0);
    }

    #[test]
    fn test_pseudo_header_mixed_families() {
        let src = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let dst = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(pseudo_header_checksum(src, dst, 6, &[0u8; 20]), 0);
    }

    use proptest::prelude::*;

    proptest! {
        /// Inserting the checksum into a reserved field makes the buffer verify
        #[test]
        fn proptest_checksum_verification_identity(
            data in prop::collection::vec(any::<u8>(), 2..512),
            offset in 0usize..256,
        ) {
            let mut data = data;
            // Checksum field must be 16-bit aligned
            let offset = (offset % (data.len() / 2)) * 2;
            data[offset] = 0;
            data[offset + 1] = 0;

            let cksum = internet_checksum(&data);
            data[offset..offset + 2].copy_from_slice(&cksum.to_be_bytes());

            prop_assert_eq!(checksum_fold(&data), 0xFFFF);
            prop_assert!(verify_checksum(&data));
        }

        #[test]
        fn proptest_checksum_no_panic(data in prop::collection::vec(any::<u8>(), 0..100)) {
            let _ = internet_checksum(&data);
        }
    }
}
