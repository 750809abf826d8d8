/// Weak rolling checksum used to find candidate block matches in the delta encoder.
///
/// Two Adler-style sums over a fixed window, packed into a `u32`. Sliding by one byte
/// is O(1), so every offset of the target can be probed against the base blocks.
const MODULUS: u32 = 65521;

#[derive(Debug, Clone)]
pub struct RollingChecksum {
    low: u32,
    high: u32,
    len: u32,
}

impl RollingChecksum {
    pub fn over(window: &[u8]) -> Self {
        // Sum in u64 and reduce once; a 4 KiB window cannot overflow.
        let (low, high) = window.iter().fold((1u64, 0u64), |(low, high), &b| {
            let low = low + b as u64;
            (low, high + low)
        });
        Self {
            low: (low % MODULUS as u64) as u32,
            high: (high % MODULUS as u64) as u32,
            len: window.len() as u32,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;
        self.low = (self.low + MODULUS - out + inc) % MODULUS;
        let drop = (out * self.len) % MODULUS;
        self.high = (self.high + self.low + 2 * MODULUS - 1 - drop) % MODULUS;
    }

    pub fn value(&self) -> u32 {
        (self.high << 16) | self.low
    }
}
