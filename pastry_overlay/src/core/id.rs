use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use wyhash::{wyrng, WyHash};

/// The widest identifier supported, in bytes.
pub const MAX_ID_BYTES: usize = 32;

type IdBytes = SmallVec<[u8; 20]>;

/// A fixed width identifier on the overlay ring.
///
/// Identifiers are unsigned big-endian integers modulo `2^bit_len`. Ordering is numeric, so two
/// identifiers should only be compared when they come from the same ring (same width).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
  bytes: IdBytes,
}
impl Id {
  /// Builds an identifier from its big-endian bytes.
  pub fn from_bytes(bytes: &[u8]) -> Id {
    Id {
      bytes: SmallVec::from_slice(bytes),
    }
  }

  /// Builds a `bits` wide identifier holding the low bits of `value`, zero-extended when
  /// `bits` is over 128. `bits` must be a multiple of 8.
  pub fn from_u128(value: u128, bits: usize) -> Id {
    debug_assert!(bits % 8 == 0, "{} is not a whole number of bytes", bits);
    let len = bits / 8;
    let all = value.to_be_bytes();
    let mut bytes: IdBytes = SmallVec::from_elem(0u8, len);
    let take = std::cmp::min(len, all.len());
    bytes[len - take..].copy_from_slice(&all[all.len() - take..]);
    Id { bytes: bytes }
  }

  /// A uniformly random identifier, `bits` wide. `bits` must be a multiple of 8.
  pub fn random<R: Rng + ?Sized>(bits: usize, rng: &mut R) -> Id {
    debug_assert!(bits % 8 == 0, "{} is not a whole number of bytes", bits);
    let mut bytes: IdBytes = SmallVec::from_elem(0u8, bits / 8);
    rng.fill(&mut bytes[..]);
    Id { bytes: bytes }
  }

  /// Derives an identifier from any hashable value, typically the address of a node.
  pub fn hashed<H: Hash>(item: &H, bits: usize) -> Id {
    let mut hasher = WyHash::with_seed(0);
    item.hash(&mut hasher);
    let mut seed = hasher.finish();
    let len = bits / 8;
    let mut bytes = IdBytes::with_capacity(len);
    while bytes.len() < len {
      let word = wyrng(&mut seed).to_be_bytes();
      let take = std::cmp::min(word.len(), len - bytes.len());
      bytes.extend_from_slice(&word[..take]);
    }
    Id { bytes: bytes }
  }

  /// The width of this identifier in bits.
  pub fn bit_len(&self) -> usize {
    self.bytes.len() * 8
  }

  /// The big-endian bytes of this identifier.
  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  /// Bit `i`, counting from the least significant bit.
  pub fn bit(&self, i: usize) -> bool {
    match self.bytes.len().checked_sub(1 + i / 8) {
      Some(j) => (self.bytes[j] >> (i % 8)) & 1 == 1,
      None => false,
    }
  }

  /// The number of base `2^bits_per_digit` digits in an identifier this wide.
  pub fn num_digits(&self, bits_per_digit: usize) -> usize {
    (self.bit_len() + bits_per_digit - 1) / bits_per_digit
  }

  /// The `index`-th base `2^bits_per_digit` digit. Digit 0 is the least significant. The most
  /// significant digit is zero-padded when the width is not a multiple of the digit width.
  pub fn digit(&self, index: usize, bits_per_digit: usize) -> usize {
    let mut value = 0usize;
    for k in (0..bits_per_digit).rev() {
      let pos = index * bits_per_digit + k;
      value <<= 1;
      if pos < self.bit_len() && self.bit(pos) {
        value |= 1;
      }
    }
    value
  }

  /// The index of the most significant digit at which `self` and `other` differ, or `None` if
  /// the identifiers are equal.
  pub fn index_of_msdd(&self, other: &Id, bits_per_digit: usize) -> Option<usize> {
    (0..self.num_digits(bits_per_digit))
      .rev()
      .find(|i| self.digit(*i, bits_per_digit) != other.digit(*i, bits_per_digit))
  }

  /// Whether `other` lives on a ring of the same width.
  pub fn same_width(&self, other: &Id) -> bool {
    self.bytes.len() == other.bytes.len()
  }

  /// Distance travelled going clockwise (increasing) from `self` to `to`. Identifiers of
  /// different widths are compared as numbers on the wider ring.
  pub fn cw_distance(&self, to: &Id) -> Distance {
    Distance(wrapping_sub(&to.bytes, &self.bytes))
  }

  /// Circular distance: the shorter of the two ways around the ring.
  pub fn distance(&self, other: &Id) -> Distance {
    std::cmp::min(self.cw_distance(other), other.cw_distance(self))
  }

  /// Lowercase hex of the full identifier.
  pub fn to_hex(&self) -> String {
    self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
  }
}
impl fmt::Display for Id {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}
impl fmt::Debug for Id {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let hex = self.to_hex();
    if hex.len() > 8 {
      write!(f, "<0x{}..>", &hex[..8])
    } else {
      write!(f, "<0x{}>", hex)
    }
  }
}

/// An unsigned distance between two identifiers of the same width.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance(IdBytes);
impl Distance {
  /// True when the two identifiers were equal.
  pub fn is_zero(&self) -> bool {
    self.0.iter().all(|b| *b == 0)
  }
}

// a - b mod 2^(8 * len), both big-endian, the shorter one zero-extended to the longer
fn wrapping_sub(a: &[u8], b: &[u8]) -> IdBytes {
  let len = std::cmp::max(a.len(), b.len());
  let at = |x: &[u8], i: usize| match (i + x.len()).checked_sub(len) {
    Some(j) => x[j] as i16,
    None => 0,
  };
  let mut out: IdBytes = SmallVec::from_elem(0u8, len);
  let mut borrow = 0i16;
  for i in (0..len).rev() {
    let mut d = at(a, i) - at(b, i) - borrow;
    if d < 0 {
      d += 256;
      borrow = 1;
    } else {
      borrow = 0;
    }
    out[i] = d as u8;
  }
  out
}

#[cfg(test)]
use rand::rngs::SmallRng;
#[cfg(test)]
use rand::SeedableRng;

#[test]
fn test_digit_extraction() {
  let id = Id::from_u128(0b1101_0010, 8);
  assert_eq!(id.num_digits(2), 4);
  assert_eq!(id.digit(0, 2), 0b10);
  assert_eq!(id.digit(1, 2), 0b00);
  assert_eq!(id.digit(2, 2), 0b01);
  assert_eq!(id.digit(3, 2), 0b11);
  assert_eq!(id.digit(0, 4), 0x2);
  assert_eq!(id.digit(1, 4), 0xd);
  // 8 bits in base 8 digits: the top digit only has 2 real bits
  assert_eq!(id.num_digits(3), 3);
  assert_eq!(id.digit(2, 3), 0b11);
}

#[test]
fn test_msdd_digits() {
  let mut rng = SmallRng::seed_from_u64(7);
  for bits in [8usize, 16, 32, 160].iter() {
    for digit_bits in 1..=8usize {
      for _ in 0..50 {
        let a = Id::random(*bits, &mut rng);
        let b = Id::random(*bits, &mut rng);
        match a.index_of_msdd(&b, digit_bits) {
          None => assert_eq!(a, b),
          Some(i) => {
            assert_ne!(a.digit(i, digit_bits), b.digit(i, digit_bits));
            for j in i + 1..a.num_digits(digit_bits) {
              assert_eq!(a.digit(j, digit_bits), b.digit(j, digit_bits));
            }
          }
        }
      }
    }
  }
  let a = Id::from_u128(0xabcd, 16);
  assert_eq!(a.index_of_msdd(&a.clone(), 4), None);
}

#[test]
fn test_circular_distance() {
  let a = Id::from_u128(0x01, 8);
  let b = Id::from_u128(0xff, 8);
  assert_eq!(a.cw_distance(&b), Distance(SmallVec::from_slice(&[0xfe])));
  assert_eq!(b.cw_distance(&a), Distance(SmallVec::from_slice(&[0x02])));
  assert_eq!(a.distance(&b), Distance(SmallVec::from_slice(&[0x02])));
  assert_eq!(a.distance(&b), b.distance(&a));
  assert!(a.distance(&a).is_zero());

  let mut rng = SmallRng::seed_from_u64(11);
  for _ in 0..200 {
    let x = Id::random(32, &mut rng);
    let y = Id::random(32, &mut rng);
    let xv = u32::from_be_bytes([x.as_bytes()[0], x.as_bytes()[1], x.as_bytes()[2], x.as_bytes()[3]]);
    let yv = u32::from_be_bytes([y.as_bytes()[0], y.as_bytes()[1], y.as_bytes()[2], y.as_bytes()[3]]);
    let cw = yv.wrapping_sub(xv);
    let expected = std::cmp::min(cw, xv.wrapping_sub(yv));
    assert_eq!(x.cw_distance(&y).0.as_slice(), &cw.to_be_bytes()[..]);
    assert_eq!(x.distance(&y).0.as_slice(), &expected.to_be_bytes()[..]);
  }
}

#[test]
fn test_mismatched_widths_do_not_panic() {
  let narrow = Id::from_u128(0x01, 8);
  let wide = Id::from_u128(0x0100, 16);
  assert!(!narrow.same_width(&wide));
  assert_eq!(narrow.cw_distance(&wide), Distance(SmallVec::from_slice(&[0x00, 0xff])));
  assert_eq!(wide.cw_distance(&narrow), Distance(SmallVec::from_slice(&[0xff, 0x01])));
  assert_eq!(narrow.distance(&wide), wide.distance(&narrow));
  assert_eq!(narrow.index_of_msdd(&wide, 4), Some(0));
}

#[test]
fn test_from_u128_widths() {
  let wide = Id::from_u128(0xabcd, 160);
  assert_eq!(wide.bit_len(), 160);
  assert!(wide.as_bytes()[..18].iter().all(|b| *b == 0));
  assert_eq!(&wide.as_bytes()[18..], &[0xab, 0xcd]);
  assert_eq!(Id::from_u128(0xabcd, 8).as_bytes(), &[0xcd]);
}

#[test]
fn test_hashed_and_display() {
  let a = Id::hashed(&"127.0.0.1:4000", 160);
  let b = Id::hashed(&"127.0.0.1:4000", 160);
  let c = Id::hashed(&"127.0.0.1:4001", 160);
  assert_eq!(a, b);
  assert_ne!(a, c);
  assert_eq!(a.bit_len(), 160);
  assert_eq!(Id::from_u128(0x0a1b, 16).to_string(), "0a1b");
  assert_eq!(format!("{:?}", Id::from_u128(0x0a1b, 16)), "<0x0a1b>");
}
