use crate::murmur_hash2;

/// Computes the 32-bit string hash used for subsystem/devtype matching on the wire and in the
/// compiled filter program.
pub fn string_hash32(s: &str) -> u32 {
    murmur_hash2(s.as_bytes(), 0)
}

/// Gets a bunch of bit numbers out of the hash, and sets the bits into a bitfield.
///
/// Used to build the tag bloom filter: the OR of `string_bloom64` over a tag set can be tested
/// for membership of a single tag with a single AND/compare.
pub fn string_bloom64(s: &str) -> u64 {
    let hash = string_hash32(s);

    (1u64 << (hash & 63))
        | (1u64 << ((hash >> 6) & 63))
        | (1u64 << ((hash >> 12) & 63))
        | (1u64 << ((hash >> 18) & 63))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_hash32_deterministic() {
        assert_eq!(string_hash32("block"), string_hash32("block"));
        assert_ne!(string_hash32("block"), string_hash32("net"));
    }

    #[test]
    fn test_string_bloom64_sets_four_bits() {
        let bloom = string_bloom64("foo");
        assert_eq!(bloom.count_ones(), 4);
    }

    #[test]
    fn test_string_bloom64_no_false_negatives() {
        let tags = ["foo", "bar", "baz"];
        let aggregate = tags.iter().fold(0u64, |acc, t| acc | string_bloom64(t));

        for t in tags {
            let b = string_bloom64(t);
            assert_eq!(aggregate & b, b);
        }
    }
}
