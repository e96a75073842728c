use std::hash::Hasher;

use siphasher::sip128::{Hasher128, SipHasher24};

/// Bounded bloom filter over addresses. Once `capacity` distinct inserts have
/// been made it starts over empty, so the false positive rate never drifts
/// above the configured one.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: usize,
    inserted: usize,
}

impl BloomFilter {
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let rate = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-(capacity as f64) * rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / capacity as f64) * ln2).round().max(1.0) as u32;
        let words = num_bits.div_ceil(64) as usize;

        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes,
            capacity,
            inserted: 0,
        }
    }

    fn indexes(&self, item: &str) -> impl Iterator<Item = u64> {
        let mut hasher = SipHasher24::new();
        hasher.write(item.as_bytes());
        let hash = hasher.finish128();
        let (h1, h2, num_bits) = (hash.h1, hash.h2, self.num_bits);

        (0..u64::from(self.num_hashes))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }

    pub fn contains(&self, item: &str) -> bool {
        self.indexes(item)
            .all(|index| self.bits[(index / 64) as usize] & (1 << (index % 64)) != 0)
    }

    pub fn insert(&mut self, item: &str) {
        if self.contains(item) {
            return;
        }
        if self.inserted >= self.capacity {
            self.clear();
        }

        let indexes: Vec<u64> = self.indexes(item).collect();
        for index in indexes {
            self.bits[(index / 64) as usize] |= 1 << (index % 64);
        }
        self.inserted += 1;
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
        self.inserted = 0;
    }

    pub fn len(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }
}
