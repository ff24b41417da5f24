//! Checksum utilities for logtl
//!
//! On-device records are protected by CRC32C. Records that embed their own
//! checksum are hashed with that field treated as zero, which the streaming
//! calculator supports without copying the record.

/// Streaming CRC32C calculator
#[derive(Debug, Clone, Default)]
pub struct ChecksumCalculator {
    crc32c: u32,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub const fn new() -> Self {
        Self { crc32c: 0 }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
    }

    /// Feed `count` zero bytes (stand-in for an embedded checksum field)
    pub fn update_zeroed(&mut self, count: usize) {
        const ZEROES: [u8; 16] = [0u8; 16];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(ZEROES.len());
            self.update(&ZEROES[..n]);
            remaining -= n;
        }
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub const fn finalize(self) -> u32 {
        self.crc32c
    }
}

/// Checksum of `record` computed as if `record[field]` were all zeroes
#[must_use]
pub fn crc32c_with_zeroed_field(record: &[u8], field: std::ops::Range<usize>) -> u32 {
    let mut calc = ChecksumCalculator::new();
    calc.update(&record[..field.start]);
    calc.update_zeroed(field.len());
    calc.update(&record[field.end..]);
    calc.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);

        let mut calc = ChecksumCalculator::new();
        calc.update(&data[..1000]);
        calc.update(&data[1000..]);

        assert_eq!(calc.finalize(), crc32c::crc32c(&data));
    }

    #[test]
    fn test_zeroed_field() {
        let mut record = vec![0xA5u8; 64];
        record[8..12].copy_from_slice(&[1, 2, 3, 4]);

        let mut zeroed = record.clone();
        zeroed[8..12].fill(0);

        assert_eq!(
            crc32c_with_zeroed_field(&record, 8..12),
            crc32c::crc32c(&zeroed)
        );
    }
}
