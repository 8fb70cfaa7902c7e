//! 160-bit prime field curves used by the signature engine.
//!
//! Curves are not hard-coded: they are loaded from externally provisioned
//! tables of fixed-size records and selected by the key entry's curve id.

use crate::error::{Result, SceError};
use num_bigint::BigUint;
use num_traits::Zero;

/// Record layout: [p: 20][a: 20][b: 20][n: 21][gx: 20][gy: 20]
pub const CURVE_RECORD_SIZE: usize = 121;
pub const LOADER_CURVE_COUNT: usize = 64;
pub const VSH_CURVE_COUNT: usize = 3;

/// Affine point; `None` is the point at infinity
pub type Point = Option<(BigUint, BigUint)>;

/// Short Weierstrass curve y^2 = x^3 + ax + b over GF(p)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Curve {
    pub p: BigUint,
    pub a: BigUint,
    pub b: BigUint,
    /// Order of the generator
    pub n: BigUint,
    pub gx: BigUint,
    pub gy: BigUint,
}

impl Curve {
    pub fn from_record(record: &[u8]) -> Result<Self> {
        if record.len() != CURVE_RECORD_SIZE {
            return Err(SceError::Load(format!(
                "curve record must be {} bytes, got {}",
                CURVE_RECORD_SIZE,
                record.len()
            )));
        }
        let curve = Self {
            p: BigUint::from_bytes_be(&record[0..20]),
            a: BigUint::from_bytes_be(&record[20..40]),
            b: BigUint::from_bytes_be(&record[40..60]),
            n: BigUint::from_bytes_be(&record[60..81]),
            gx: BigUint::from_bytes_be(&record[81..101]),
            gy: BigUint::from_bytes_be(&record[101..121]),
        };
        if curve.p < BigUint::from(3u32) || curve.n < BigUint::from(2u32) {
            return Err(SceError::Load(format!(
                "curve record with degenerate modulus {} or order {}",
                curve.p, curve.n
            )));
        }
        Ok(curve)
    }

    pub fn to_record(&self) -> [u8; CURVE_RECORD_SIZE] {
        let mut record = [0u8; CURVE_RECORD_SIZE];
        write_be(&mut record[0..20], &self.p);
        write_be(&mut record[20..40], &self.a);
        write_be(&mut record[40..60], &self.b);
        write_be(&mut record[60..81], &self.n);
        write_be(&mut record[81..101], &self.gx);
        write_be(&mut record[101..121], &self.gy);
        record
    }

    pub fn generator(&self) -> Point {
        Some((self.gx.clone(), self.gy.clone()))
    }

    pub fn is_on_curve(&self, point: &Point) -> bool {
        match point {
            None => true,
            Some((x, y)) => {
                if x >= &self.p || y >= &self.p {
                    return false;
                }
                let lhs = (y * y) % &self.p;
                let rhs = (x * x * x + &self.a * x + &self.b) % &self.p;
                lhs == rhs
            }
        }
    }

    pub fn add(&self, lhs: &Point, rhs: &Point) -> Point {
        let (x1, y1) = match lhs {
            None => return rhs.clone(),
            Some(p) => p,
        };
        let (x2, y2) = match rhs {
            None => return lhs.clone(),
            Some(p) => p,
        };

        if x1 == x2 {
            if ((y1 + y2) % &self.p).is_zero() {
                return None;
            }
            return self.double(lhs);
        }

        let num = self.sub(y2, y1);
        let den = self.sub(x2, x1);
        let lambda = (num * inv_mod(&den, &self.p)) % &self.p;
        self.chord(&lambda, x1, y1, x2)
    }

    pub fn double(&self, point: &Point) -> Point {
        let (x, y) = point.as_ref()?;
        if y.is_zero() {
            return None;
        }
        let num = (BigUint::from(3u32) * x * x + &self.a) % &self.p;
        let den = (BigUint::from(2u32) * y) % &self.p;
        let lambda = (num * inv_mod(&den, &self.p)) % &self.p;
        self.chord(&lambda, x, y, x)
    }

    /// Scalar multiplication, double-and-add from the top bit
    pub fn mul(&self, k: &BigUint, point: &Point) -> Point {
        let mut acc: Point = None;
        for bit in (0..k.bits()).rev() {
            acc = self.double(&acc);
            if k.bit(bit) {
                acc = self.add(&acc, point);
            }
        }
        acc
    }

    fn chord(&self, lambda: &BigUint, x1: &BigUint, y1: &BigUint, x2: &BigUint) -> Point {
        let l2 = (lambda * lambda) % &self.p;
        let x3 = self.sub(&self.sub(&l2, x1), x2);
        let y3 = self.sub(&((lambda * self.sub(x1, &x3)) % &self.p), y1);
        Some((x3, y3))
    }

    fn sub(&self, a: &BigUint, b: &BigUint) -> BigUint {
        ((a % &self.p) + &self.p - (b % &self.p)) % &self.p
    }
}

/// Modular inverse for a prime modulus (Fermat)
pub(crate) fn inv_mod(value: &BigUint, modulus: &BigUint) -> BigUint {
    let exponent = modulus - BigUint::from(2u32);
    value.modpow(&exponent, modulus)
}

/// Left-pad `value` into `out`, truncating high bytes that do not fit
pub(crate) fn write_be(out: &mut [u8], value: &BigUint) {
    let bytes = value.to_bytes_be();
    out.fill(0);
    if bytes.len() >= out.len() {
        out.copy_from_slice(&bytes[bytes.len() - out.len()..]);
    } else {
        let start = out.len() - bytes.len();
        out[start..].copy_from_slice(&bytes);
    }
}

/// Split a curve table into records, enforcing the exact record count
pub fn parse_table(bytes: &[u8], expected: usize, label: &str) -> Result<Vec<Curve>> {
    if bytes.len() != expected * CURVE_RECORD_SIZE {
        return Err(SceError::Load(format!(
            "{} curve table must be {} bytes ({} records), got {}",
            label,
            expected * CURVE_RECORD_SIZE,
            expected,
            bytes.len()
        )));
    }
    bytes.chunks_exact(CURVE_RECORD_SIZE).map(Curve::from_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    #[test]
    fn test_generator_on_curve() {
        let curve = testkit::secp160r1();
        assert!(curve.is_on_curve(&curve.generator()));
    }

    #[test]
    fn test_order_annihilates_generator() {
        let curve = testkit::secp160r1();
        assert_eq!(curve.mul(&curve.n, &curve.generator()), None);
    }

    #[test]
    fn test_double_matches_add() {
        let curve = testkit::secp160r1();
        let g = curve.generator();
        assert_eq!(curve.double(&g), curve.add(&g, &g));
        let three = curve.mul(&BigUint::from(3u32), &g);
        assert_eq!(three, curve.add(&curve.double(&g), &g));
        assert!(curve.is_on_curve(&three));
    }

    #[test]
    fn test_record_roundtrip() {
        let curve = testkit::secp160r1();
        let parsed = Curve::from_record(&curve.to_record()).unwrap();
        assert_eq!(curve, parsed);
    }

    #[test]
    fn test_parse_table_rejects_wrong_count() {
        let record = testkit::secp160r1().to_record();
        let table: Vec<u8> = record.iter().copied().cycle().take(2 * CURVE_RECORD_SIZE).collect();
        assert!(parse_table(&table, 2, "test").is_ok());
        assert!(parse_table(&table, VSH_CURVE_COUNT, "vsh").is_err());
        assert!(parse_table(&table[..CURVE_RECORD_SIZE + 1], 2, "test").is_err());
    }

    #[test]
    fn test_from_record_rejects_degenerate_parameters() {
        let mut curve = testkit::secp160r1();
        curve.p = BigUint::from(1u32);
        assert!(matches!(Curve::from_record(&curve.to_record()), Err(SceError::Load(_))));

        let mut curve = testkit::secp160r1();
        curve.n = BigUint::from(1u32);
        assert!(matches!(Curve::from_record(&curve.to_record()), Err(SceError::Load(_))));

        let mut table = testkit::secp160r1().to_record().to_vec();
        table.extend_from_slice(&curve.to_record());
        assert!(matches!(parse_table(&table, 2, "test"), Err(SceError::Load(_))));
    }

    #[test]
    fn test_write_be_pads_left() {
        let mut out = [0xFFu8; 4];
        write_be(&mut out, &BigUint::from(0x0102u32));
        assert_eq!(out, [0, 0, 1, 2]);
    }
}
