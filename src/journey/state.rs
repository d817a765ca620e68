//! Play state vectors: the pair of equal-length strings the plays endpoint
//! expects. The primary holds lowercase letters or `#` for empty cells, the
//! secondary holds `1`/`0` aligned to filled/empty.

use rand::Rng;
use rand::seq::index::sample;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

fn random_letter(rng: &mut impl Rng) -> u8 {
    LETTERS[rng.gen_range(0..LETTERS.len())]
}

/// A primary/secondary pair that always satisfies the alignment invariant:
/// `#` ↔ `0`, letter ↔ `1`, equal lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVector {
    primary: Vec<u8>,
    secondary: Vec<u8>,
}

impl StateVector {
    /// Fresh vector with roughly `fill_ratio` of the cells filled.
    pub fn generate(len: usize, fill_ratio: f64, rng: &mut impl Rng) -> Self {
        let mut primary = Vec::with_capacity(len);
        let mut secondary = Vec::with_capacity(len);
        for _ in 0..len {
            if rng.gen_bool(fill_ratio) {
                primary.push(random_letter(rng));
                secondary.push(b'1');
            } else {
                primary.push(b'#');
                secondary.push(b'0');
            }
        }
        StateVector { primary, secondary }
    }

    /// Fully solved vector: every cell a fresh letter, every secondary `1`.
    pub fn complete(len: usize, rng: &mut impl Rng) -> Self {
        StateVector {
            primary: (0..len).map(|_| random_letter(rng)).collect(),
            secondary: vec![b'1'; len],
        }
    }

    /// Simulate a burst of play: flip between 1 and min(5, len) distinct
    /// cells, emptying filled ones and filling empty ones.
    pub fn mutate(&mut self, rng: &mut impl Rng) {
        let len = self.primary.len();
        if len == 0 {
            return;
        }
        let changes = rng.gen_range(1..=5.min(len));
        for pos in sample(rng, len, changes) {
            if self.primary[pos] == b'#' {
                self.primary[pos] = random_letter(rng);
                self.secondary[pos] = b'1';
            } else {
                self.primary[pos] = b'#';
                self.secondary[pos] = b'0';
            }
        }
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn primary(&self) -> &str {
        std::str::from_utf8(&self.primary).expect("primary is ascii")
    }

    pub fn secondary(&self) -> &str {
        std::str::from_utf8(&self.secondary).expect("secondary is ascii")
    }
}
