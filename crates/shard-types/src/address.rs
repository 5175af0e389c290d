use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Div, Mul, Not, Rem};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::Digest;
use crate::error::TypeError;

/// A 160-bit unsigned integer, always reduced modulo 2^160.
///
/// `Address` is the universal sort and shard key: every chunk identifier
/// carries one, the file store derives on-disk placement from its leading
/// bits, and range queries are expressed as inclusive address intervals.
///
/// The value is held as a 32-bit high limb and a 128-bit low limb, so the
/// derived ordering is the unsigned numeric order. All arithmetic wraps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address {
    hi: u32,
    lo: u128,
}

impl Address {
    /// Width in bits.
    pub const BITS: u32 = 160;
    /// Width in bytes.
    pub const BYTES: usize = 20;
    /// Zero.
    pub const MIN: Self = Self { hi: 0, lo: 0 };
    /// 2^160 - 1.
    pub const MAX: Self = Self {
        hi: u32::MAX,
        lo: u128::MAX,
    };
    pub const ONE: Self = Self { hi: 0, lo: 1 };

    /// An address holding a small integer in its low bits.
    pub const fn from_u128(value: u128) -> Self {
        Self { hi: 0, lo: value }
    }

    /// Build from the 20-byte big-endian form.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        let mut hi = [0u8; 4];
        hi.copy_from_slice(&bytes[..4]);
        let mut lo = [0u8; 16];
        lo.copy_from_slice(&bytes[4..]);
        Self {
            hi: u32::from_be_bytes(hi),
            lo: u128::from_be_bytes(lo),
        }
    }

    /// The 20-byte big-endian form.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[..4].copy_from_slice(&self.hi.to_be_bytes());
        out[4..].copy_from_slice(&self.lo.to_be_bytes());
        out
    }

    /// Normalize a big-endian value of any byte width to 160 bits.
    ///
    /// Shorter inputs are shifted left (they occupy the most significant
    /// bits); longer inputs are shifted right (trailing bytes are dropped).
    pub fn from_be_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 20];
        let n = bytes.len().min(Self::BYTES);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self::from_bytes(buf)
    }

    /// Normalize a `width`-bit unsigned value to 160 bits.
    ///
    /// Bits of `value` above `width` are ignored. The result keeps the value
    /// in the most significant bits, shifting left when `width < 160` and
    /// right when `width > 160`.
    pub fn from_uint(value: u128, width: u32) -> Self {
        if width == 0 {
            return Self::MIN;
        }
        let masked = if width < 128 {
            value & ((1u128 << width) - 1)
        } else {
            value
        };
        let raw = Self::from_u128(masked);
        if width <= Self::BITS {
            raw.shl(Self::BITS - width)
        } else {
            raw.shr(width - Self::BITS)
        }
    }

    /// A uniformly random address.
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    /// A uniformly random address drawn from the given generator.
    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 20];
        rng.fill(&mut bytes[..]);
        Self::from_bytes(bytes)
    }

    /// 2^`exp`, or zero when `exp >= 160`.
    pub fn pow2(exp: u32) -> Self {
        Self::ONE.shl(exp)
    }

    pub fn is_zero(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    /// Logical shift left; bits shifted past bit 159 are lost.
    pub fn shl(&self, n: u32) -> Self {
        match n {
            0 => *self,
            n if n >= Self::BITS => Self::MIN,
            n if n >= 128 => Self {
                hi: (self.lo << (n - 128)) as u32,
                lo: 0,
            },
            n => Self {
                hi: (((self.hi as u128) << n) | (self.lo >> (128 - n))) as u32,
                lo: self.lo << n,
            },
        }
    }

    /// Logical shift right.
    pub fn shr(&self, n: u32) -> Self {
        match n {
            0 => *self,
            n if n >= Self::BITS => Self::MIN,
            n if n >= 128 => Self {
                hi: 0,
                lo: (self.hi >> (n - 128)) as u128,
            },
            n => Self {
                hi: if n < 32 { self.hi >> n } else { 0 },
                lo: (self.lo >> n) | ((self.hi as u128) << (128 - n)),
            },
        }
    }

    /// Addition modulo 2^160.
    pub fn wrapping_add(&self, other: &Self) -> Self {
        let (lo, carry) = self.lo.overflowing_add(other.lo);
        Self {
            hi: self.hi.wrapping_add(other.hi).wrapping_add(carry as u32),
            lo,
        }
    }

    /// Subtraction modulo 2^160.
    pub fn wrapping_sub(&self, other: &Self) -> Self {
        let (lo, borrow) = self.lo.overflowing_sub(other.lo);
        Self {
            hi: self.hi.wrapping_sub(other.hi).wrapping_sub(borrow as u32),
            lo,
        }
    }

    /// Add 2^`exp`.
    pub fn add_pow2(&self, exp: u32) -> Self {
        self.wrapping_add(&Self::pow2(exp))
    }

    /// Subtract one (zero wraps to [`Address::MAX`]).
    pub fn sub_one(&self) -> Self {
        self.wrapping_sub(&Self::ONE)
    }

    /// Add `n` with its 64 bits reversed into the most significant end.
    ///
    /// Successive small `n` land far apart in the address space (0, 2^159,
    /// 2^158, 2^159 + 2^158, ...), which makes `MIN.add_reversed(i)` a cheap
    /// generator of well-spread keys.
    pub fn add_reversed(&self, n: u64) -> Self {
        self.wrapping_add(&Self::from_uint(n.reverse_bits() as u128, 64))
    }

    /// Quotient and remainder of division by a non-zero small integer.
    ///
    /// # Panics
    ///
    /// Panics if `divisor` is zero.
    pub fn div_rem(&self, divisor: u32) -> (Self, u32) {
        assert!(divisor != 0, "attempt to divide an address by zero");
        let d = divisor as u128;
        let q_hi = self.hi / divisor;
        let r = (self.hi % divisor) as u128;

        let n1 = (r << 64) | (self.lo >> 64);
        let q1 = n1 / d;
        let r1 = n1 % d;
        let n2 = (r1 << 64) | (self.lo & u64::MAX as u128);
        let q2 = n2 / d;
        let r2 = n2 % d;

        (
            Self {
                hi: q_hi,
                lo: (q1 << 64) | q2,
            },
            r2 as u32,
        )
    }

    /// Multiplication by a small integer modulo 2^160.
    pub fn wrapping_mul_small(&self, factor: u32) -> Self {
        let f = factor as u128;
        let p0 = (self.lo & u64::MAX as u128) * f;
        let p1 = (self.lo >> 64) * f;
        let mid = p1 + (p0 >> 64);
        Self {
            hi: self
                .hi
                .wrapping_mul(factor)
                .wrapping_add((mid >> 64) as u32),
            lo: ((mid as u64 as u128) << 64) | (p0 as u64 as u128),
        }
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &Self) -> Self {
        *self ^ *other
    }

    /// Number of bits needed to express the XOR distance to `other`; zero
    /// when the addresses are equal, 160 when they differ in the top bit.
    pub fn bit_distance(&self, other: &Self) -> u32 {
        Self::BITS - self.distance(other).leading_zeros()
    }

    /// Value of bit `i`, counting from the least significant bit.
    pub fn bit(&self, i: u32) -> bool {
        match i {
            i if i >= Self::BITS => false,
            i if i >= 128 => (self.hi >> (i - 128)) & 1 == 1,
            i => (self.lo >> i) & 1 == 1,
        }
    }

    pub fn count_ones(&self) -> u32 {
        self.hi.count_ones() + self.lo.count_ones()
    }

    pub fn leading_zeros(&self) -> u32 {
        if self.hi != 0 {
            self.hi.leading_zeros()
        } else {
            32 + self.lo.leading_zeros()
        }
    }

    pub fn trailing_zeros(&self) -> u32 {
        if self.lo != 0 {
            self.lo.trailing_zeros()
        } else if self.hi != 0 {
            128 + self.hi.trailing_zeros()
        } else {
            Self::BITS
        }
    }

    /// Position of the most significant set bit.
    pub fn highest_set_bit(&self) -> Option<u32> {
        (!self.is_zero()).then(|| Self::BITS - 1 - self.leading_zeros())
    }

    /// Position of the least significant set bit.
    pub fn lowest_set_bit(&self) -> Option<u32> {
        (!self.is_zero()).then(|| self.trailing_zeros())
    }

    /// Positions of all set bits, ascending.
    pub fn set_bits(&self) -> impl Iterator<Item = u32> + '_ {
        (0..Self::BITS).filter(move |&i| self.bit(i))
    }

    /// The top `bits` bits as an integer (`bits <= 64`).
    pub fn prefix(&self, bits: u32) -> u64 {
        debug_assert!(bits <= 64, "prefix wider than 64 bits");
        if bits == 0 {
            return 0;
        }
        self.shr(Self::BITS - bits).lo as u64
    }

    /// The first and last address sharing the `bits`-bit `prefix`.
    pub fn prefix_range(prefix: u64, bits: u32) -> (Self, Self) {
        if bits == 0 {
            return (Self::MIN, Self::MAX);
        }
        let first = Self::from_uint(prefix as u128, bits);
        let last = first | Self::MAX.shr(bits);
        (first, last)
    }

    /// Lowercase hex, 40 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.to_bytes()[..4])
    }

    /// Parse a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != Self::BYTES {
            return Err(TypeError::InvalidLength {
                expected: Self::BYTES,
                actual: bytes.len(),
            });
        }
        Ok(Self::from_be_slice(&bytes))
    }
}

impl BitXor for Address {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        Self {
            hi: self.hi ^ rhs.hi,
            lo: self.lo ^ rhs.lo,
        }
    }
}

impl BitAnd for Address {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self {
            hi: self.hi & rhs.hi,
            lo: self.lo & rhs.lo,
        }
    }
}

impl BitOr for Address {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            hi: self.hi | rhs.hi,
            lo: self.lo | rhs.lo,
        }
    }
}

impl Not for Address {
    type Output = Self;

    fn not(self) -> Self {
        Self {
            hi: !self.hi,
            lo: !self.lo,
        }
    }
}

impl Div<u32> for Address {
    type Output = Self;

    fn div(self, rhs: u32) -> Self {
        self.div_rem(rhs).0
    }
}

impl Rem<u32> for Address {
    type Output = u32;

    fn rem(self, rhs: u32) -> u32 {
        self.div_rem(rhs).1
    }
}

impl Mul<u32> for Address {
    type Output = Self;

    fn mul(self, rhs: u32) -> Self {
        self.wrapping_mul_small(rhs)
    }
}

impl From<Digest> for Address {
    fn from(digest: Digest) -> Self {
        Self::from_bytes(*digest.as_bytes())
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl FromStr for Address {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <[u8; 20]>::deserialize(deserializer).map(Self::from_bytes)
    }
}
