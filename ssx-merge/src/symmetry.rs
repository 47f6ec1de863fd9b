//! Point-group operations, asymmetric-unit folding and systematic absences (§4.2).
//!
//! `to_asu` and `equivalents` only ever need the *Laue class* of a point group (the
//! centrosymmetric group that governs which reflections are measured as equal intensities under
//! Friedel's law), since that is what intensity merging folds into. Point-group identifiers that
//! name a non-centrosymmetric group are accepted and mapped onto their Laue class; see
//! `DESIGN.md` for the enumeration of every string this crate accepts.

use crate::error::{Error, Result};
use crate::rational::{Rational, RationalMatrix};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// A 3×3 integer matrix acting on Miller indices.
pub type IntMat3 = [[i32; 3]; 3];

const IDENTITY: IntMat3 = [[1, 0, 0], [0, 1, 0], [0, 0, 1]];
const INVERSION: IntMat3 = [[-1, 0, 0], [0, -1, 0], [0, 0, -1]];

fn mat_mul(a: &IntMat3, b: &IntMat3) -> IntMat3 {
    let mut out = [[0i32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn mat_apply(m: &IntMat3, v: (i32, i32, i32)) -> (i32, i32, i32) {
    let x = [v.0, v.1, v.2];
    let mut out = [0i32; 3];
    for i in 0..3 {
        out[i] = (0..3).map(|k| m[i][k] * x[k]).sum();
    }
    (out[0], out[1], out[2])
}

/// Generates the closure of a generator set under matrix multiplication. Bounded to avoid runaway
/// growth from a malformed (non-finite-order) generator set.
fn generate_group(generators: &[IntMat3]) -> Vec<IntMat3> {
    let mut ops = vec![IDENTITY];
    loop {
        let mut new_ops = Vec::new();
        for g in generators {
            for op in &ops {
                let candidate = mat_mul(g, op);
                if !ops.contains(&candidate) && !new_ops.contains(&candidate) {
                    new_ops.push(candidate);
                }
            }
        }
        if new_ops.is_empty() {
            break;
        }
        ops.extend(new_ops);
        if ops.len() > 192 {
            // no crystallographic point group has this many operators; guard against a bad
            // generator set looping forever.
            break;
        }
    }
    ops
}

/// Lattice centering, used for systematic absences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Centering {
    /// Primitive.
    P,
    /// A-face centered.
    A,
    /// B-face centered.
    B,
    /// C-face centered.
    C,
    /// Body centered.
    I,
    /// Face centered.
    F,
    /// Rhombohedral, hexagonal axes, obverse setting.
    R,
}

impl Centering {
    /// Parses a single centering letter (case-insensitive).
    pub fn parse(c: char) -> Result<Self> {
        match c.to_ascii_uppercase() {
            'P' => Ok(Self::P),
            'A' => Ok(Self::A),
            'B' => Ok(Self::B),
            'C' => Ok(Self::C),
            'I' => Ok(Self::I),
            'F' => Ok(Self::F),
            'R' => Ok(Self::R),
            other => Err(Error::BadInput(format!("unknown centering '{other}'"))),
        }
    }
}

/// A point-group's symmetry operation list, immutable after construction.
#[derive(Debug, Clone)]
pub struct PointGroup {
    name: String,
    ops: Vec<IntMat3>,
}

impl PointGroup {
    /// Parses a point-group identifier (e.g. `"1"`, `"mmm"`, `"6/mmm"`) into its operation list.
    ///
    /// Non-centrosymmetric identifiers are accepted and resolved to their Laue class.
    pub fn parse(name: &str) -> Result<Self> {
        let laue = laue_class(name)
            .ok_or_else(|| Error::BadInput(format!("unrecognised point group '{name}'")))?;
        let ops = generate_group(&laue);
        for op in &ops {
            check_unimodular(op, name)?;
        }
        Ok(Self {
            name: name.to_string(),
            ops,
        })
    }

    /// The identifier this group was parsed from.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full list of symmetry operators (including identity).
    #[must_use]
    pub fn operations(&self) -> &[IntMat3] {
        &self.ops
    }

    /// Folds `(h, k, l)` into the asymmetric unit. Pure function: the representative is the
    /// lexicographically greatest transformed triple, so folding is independent of operator order
    /// and idempotent.
    #[must_use]
    pub fn to_asu(&self, hkl: (i32, i32, i32)) -> (i32, i32, i32) {
        self.ops
            .iter()
            .map(|op| mat_apply(op, hkl))
            .max()
            .unwrap_or(hkl)
    }

    /// All symmetry-equivalent triples of `(h, k, l)`, deduplicated. Closed under `to_asu`: every
    /// element maps to the same representative.
    #[must_use]
    pub fn equivalents(&self, hkl: (i32, i32, i32)) -> Vec<(i32, i32, i32)> {
        self.ops.iter().map(|op| mat_apply(op, hkl)).unique().collect()
    }

    /// Reports whether `(h, k, l)` is a systematic absence under `centering`.
    #[must_use]
    pub fn forbidden(h: i32, k: i32, l: i32, centering: Centering) -> bool {
        match centering {
            Centering::P => false,
            Centering::A => (k + l).rem_euclid(2) != 0,
            Centering::B => (h + l).rem_euclid(2) != 0,
            Centering::C => (h + k).rem_euclid(2) != 0,
            Centering::I => (h + k + l).rem_euclid(2) != 0,
            Centering::F => {
                let parity = |x: i32| x.rem_euclid(2);
                !(parity(h) == parity(k) && parity(k) == parity(l))
            }
            Centering::R => (-h + k + l).rem_euclid(3) != 0,
        }
    }
}

/// Verifies `op` is unimodular (`det = ±1`), using exact rational arithmetic so a malformed
/// generator set is caught instead of silently producing a non-integer-preserving symmetry.
fn check_unimodular(op: &IntMat3, name: &str) -> Result<()> {
    let rows = [
        [i64::from(op[0][0]), i64::from(op[0][1]), i64::from(op[0][2])],
        [i64::from(op[1][0]), i64::from(op[1][1]), i64::from(op[1][2])],
        [i64::from(op[2][0]), i64::from(op[2][1]), i64::from(op[2][2])],
    ];
    let det = RationalMatrix::from_ints(rows)
        .det()
        .map_err(|_| Error::Overflow(format!("point group '{name}' operator determinant overflowed")))?;
    if det.cmp_exact(Rational::one()) != std::cmp::Ordering::Equal
        && det.cmp_exact(Rational::from_int(-1)) != std::cmp::Ordering::Equal
    {
        return Err(Error::BadInput(format!("point group '{name}' has a non-unimodular operator")));
    }
    Ok(())
}

/// Returns the generator matrices for the Laue class of `name`, or `None` if unrecognised.
fn laue_class(name: &str) -> Option<Vec<IntMat3>> {
    // monoclinic, unique axis b
    let two_b: IntMat3 = [[-1, 0, 0], [0, 1, 0], [0, 0, -1]];
    // orthorhombic
    let two_z: IntMat3 = [[-1, 0, 0], [0, -1, 0], [0, 0, 1]];
    let two_y: IntMat3 = [[-1, 0, 0], [0, 1, 0], [0, 0, -1]];
    // tetragonal
    let four_z: IntMat3 = [[0, -1, 0], [1, 0, 0], [0, 0, 1]];
    let two_x_tetra: IntMat3 = [[1, 0, 0], [0, -1, 0], [0, 0, -1]];
    // trigonal / hexagonal (hexagonal axes)
    let three_z: IntMat3 = [[0, -1, 0], [1, -1, 0], [0, 0, 1]];
    let six_z: IntMat3 = [[1, -1, 0], [1, 0, 0], [0, 0, 1]];
    let two_x_hex: IntMat3 = [[1, -1, 0], [0, -1, 0], [0, 0, -1]];
    // cubic
    let two_x_cubic: IntMat3 = [[1, 0, 0], [0, -1, 0], [0, 0, -1]];
    let two_y_cubic: IntMat3 = [[-1, 0, 0], [0, 1, 0], [0, 0, -1]];
    let two_z_cubic: IntMat3 = [[-1, 0, 0], [0, -1, 0], [0, 0, 1]];
    let three_111: IntMat3 = [[0, 0, 1], [1, 0, 0], [0, 1, 0]];
    let four_z_cubic: IntMat3 = [[0, -1, 0], [1, 0, 0], [0, 0, 1]];

    let ops: Vec<IntMat3> = match name {
        "1" | "-1" => vec![INVERSION],
        "2" | "m" | "2/m" => vec![two_b, INVERSION],
        "222" | "mm2" | "mmm" => vec![two_z, two_y, INVERSION],
        "4" | "-4" | "4/m" => vec![four_z, INVERSION],
        "422" | "4mm" | "-4mm" | "-42m" | "-4m2" | "4/mmm" => {
            vec![four_z, two_x_tetra, INVERSION]
        }
        "3" | "-3" => vec![three_z, INVERSION],
        "32" | "321" | "312" | "3m" | "3m1" | "31m" | "-3m" | "-3m1" | "-31m" => {
            vec![three_z, two_x_hex, INVERSION]
        }
        "6" | "-6" | "6/m" => vec![six_z, INVERSION],
        "622" | "6mm" | "-6m2" | "-62m" | "6/mmm" => vec![six_z, two_x_hex, INVERSION],
        "23" | "m-3" | "m3" => vec![two_x_cubic, two_y_cubic, two_z_cubic, three_111, INVERSION],
        "432" | "-43m" | "m-3m" | "m3m" => vec![
            two_x_cubic,
            two_y_cubic,
            two_z_cubic,
            three_111,
            four_z_cubic,
            INVERSION,
        ],
        _ => return None,
    };
    Some(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_asu_is_idempotent() {
        for name in ["1", "mmm", "4/mmm", "6/mmm", "m-3m"] {
            let pg = PointGroup::parse(name).unwrap();
            for hkl in [(2, 1, 3), (-1, -2, 5), (0, 3, -4), (7, -7, 1)] {
                let once = pg.to_asu(hkl);
                let twice = pg.to_asu(once);
                assert_eq!(once, twice, "group {name} hkl {hkl:?}");
            }
        }
    }

    #[test]
    fn equivalents_closed_under_to_asu() {
        let pg = PointGroup::parse("4/mmm").unwrap();
        let hkl = (2, 1, 3);
        let rep = pg.to_asu(hkl);
        for eq in pg.equivalents(hkl) {
            assert_eq!(pg.to_asu(eq), rep);
        }
    }

    #[test]
    fn mmm_forbids_none_for_primitive() {
        assert!(!PointGroup::forbidden(1, 0, 0, Centering::P));
    }

    #[test]
    fn body_centering_forbids_odd_sum() {
        assert!(PointGroup::forbidden(1, 0, 0, Centering::I));
        assert!(!PointGroup::forbidden(1, 1, 0, Centering::I));
    }

    #[test]
    fn scenario_5_asu_folding_422mmm() {
        // every equivalent of (2,1,3) under 4/mmm must fold to the same representative, and the
        // equivalence class must have the expected size (16, the order of the Laue class 4/mmm).
        let pg = PointGroup::parse("4/mmm").unwrap();
        let hkl = (2, 1, 3);
        let eqs = pg.equivalents(hkl);
        assert_eq!(eqs.len(), 16);
        let rep = pg.to_asu(hkl);
        for eq in eqs {
            assert_eq!(pg.to_asu(eq), rep);
        }
    }
}
