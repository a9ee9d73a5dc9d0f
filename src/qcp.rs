//! Quaternion Characteristic Polynomial solver (spec.md §4.2).
//!
//! Weighted superposition: the optimal rotation (and optionally translation) aligning a
//! `moved` point set onto a `target` point set, via Theobald's closed-form method (Newton
//! iteration on the characteristic polynomial of the 4x4 key matrix, no explicit
//! eigendecomposition). Ported from `examples/original_source/math/qcp.cpp` (the Godot engine's
//! `many_bone_ik` module) into idiomatic `f32`/`glam` Rust.

use glam::{Quat, Vec3};
use log::warn;

/// Precision knobs, mirroring `QCP::set_precision`/`set_max_iterations` in the original.
#[derive(Debug, Clone, Copy)]
pub struct QcpPrecision {
    pub eval_prec: f32,
    pub evec_prec: f32,
    pub max_iterations: u32,
}

impl Default for QcpPrecision {
    fn default() -> Self {
        Self {
            eval_prec: 1e-11,
            evec_prec: 1e-6,
            max_iterations: 50,
        }
    }
}

/// Result of a QCP solve.
#[derive(Debug, Clone, Copy)]
pub struct QcpSolution {
    pub rotation: Quat,
    pub translation: Vec3,
    pub rmsd_squared: f32,
}

/// Stateless weighted-superposition solver. Reusable across calls; holds only the
/// precision configuration, matching the teacher's preference for small, cheaply
/// constructed value types over global state.
#[derive(Debug, Clone, Copy)]
pub struct Qcp {
    precision: QcpPrecision,
}

impl Default for Qcp {
    fn default() -> Self {
        Self::new(QcpPrecision::default())
    }
}

impl Qcp {
    pub fn new(precision: QcpPrecision) -> Self {
        Self { precision }
    }

    /// Solve for the rotation (and, if `translate`, the translation) minimizing
    /// `Σ wᵢ ‖R·moved[i] + t − target[i]‖²`.
    ///
    /// On length mismatch, empty input, or all-zero weights, returns identity rotation and
    /// zero translation per spec.md §7's `InvalidInput` response — it does not propagate an
    /// error, since a bad effector must never poison the containing segment's solve.
    pub fn solve(&self, moved: &[Vec3], target: &[Vec3], weights: &[f32], translate: bool) -> QcpSolution {
        if moved.len() != target.len() || moved.len() != weights.len() || moved.is_empty() {
            return QcpSolution {
                rotation: Quat::IDENTITY,
                translation: Vec3::ZERO,
                rmsd_squared: 0.0,
            };
        }
        let wsum: f32 = weights.iter().sum();
        if !wsum.is_finite() || wsum <= 0.0 || !moved.iter().chain(target).all(|v| v.is_finite()) {
            return QcpSolution {
                rotation: Quat::IDENTITY,
                translation: Vec3::ZERO,
                rmsd_squared: 0.0,
            };
        }

        // QCP is not well posed for a single point pair (rank-1 input): the original source
        // special-cases it as the direct point-to-point rotation rather than running the
        // Newton/eigensystem path (examples/original_source/math/qcp.cpp::calc_optimal_rotation).
        if moved.len() == 1 {
            let m = moved[0];
            let t = target[0];
            let rotation = if m.length_squared() < 1e-20 || t.length_squared() < 1e-20 {
                Quat::IDENTITY
            } else {
                Quat::from_rotation_arc(m.normalize(), t.normalize())
            };
            let translation = if translate { t - rotation * m } else { Vec3::ZERO };
            return QcpSolution {
                rotation: canonicalize(rotation),
                translation,
                rmsd_squared: (rotation * m - t).length_squared(),
            };
        }

        let (moved_centroid, target_centroid) = weighted_centroids(moved, target, weights);
        let (moved_c, target_c): (Vec<Vec3>, Vec<Vec3>) = if translate {
            (
                moved.iter().map(|p| *p - moved_centroid).collect(),
                target.iter().map(|p| *p - target_centroid).collect(),
            )
        } else {
            (moved.to_vec(), target.to_vec())
        };

        let inner = InnerProduct::compute(&moved_c, &target_c, weights);
        let e0 = inner.e0;

        let lambda = match self.newton_largest_eigenvalue(&inner, e0) {
            Some(l) => l,
            None => {
                warn!("QCP: Newton iteration did not converge within {} iterations", self.precision.max_iterations);
                return QcpSolution {
                    rotation: Quat::IDENTITY,
                    translation: if translate { target_centroid - moved_centroid } else { Vec3::ZERO },
                    rmsd_squared: 0.0,
                };
            }
        };

        let rotation = match self.eigenvector_rotation(&inner, lambda) {
            Some(r) => r,
            None => {
                warn!("QCP: all four eigenvector fallback columns degenerate, returning identity");
                Quat::IDENTITY
            }
        };
        let rotation = canonicalize(rotation);

        let rmsd_squared = (2.0 * (e0 - lambda) / wsum).max(0.0);

        // t = target_centroid − R·moved_centroid, per spec.md §4.2 step 1.
        let translation = if translate {
            target_centroid - rotation * moved_centroid
        } else {
            Vec3::ZERO
        };

        QcpSolution {
            rotation,
            translation,
            rmsd_squared,
        }
    }

    fn newton_largest_eigenvalue(&self, inner: &InnerProduct, e0: f32) -> Option<f32> {
        let (c0, c1, c2) = inner.characteristic_coeffs();
        let mut eigv = e0;
        for _ in 0..self.precision.max_iterations {
            let x2 = eigv * eigv;
            let b = (x2 + c2) * eigv;
            let a = b + c1;
            let d = 2.0 * x2 * eigv + b + a;
            if d == 0.0 {
                break;
            }
            let delta = (a * eigv + c0) / d;
            eigv -= delta;
            if delta.abs() < (self.precision.eval_prec * eigv).abs() {
                return Some(eigv);
            }
        }
        // Even on a non-converged last iterate, the original still proceeds (it only warns),
        // but spec.md §7 treats a blown iteration cap as NumericallyDegenerate and asks the
        // caller to no-op. We return None to select that path.
        None
    }

    fn eigenvector_rotation(&self, inner: &InnerProduct, eigv: f32) -> Option<Quat> {
        let m = inner.key_matrix(eigv);
        (0..4).find_map(|row| m.adjoint_column(row, self.precision.evec_prec))
    }
}

fn canonicalize(q: Quat) -> Quat {
    if q.w < 0.0 {
        -q
    } else {
        q
    }
}

fn weighted_centroids(moved: &[Vec3], target: &[Vec3], weights: &[f32]) -> (Vec3, Vec3) {
    let wsum: f32 = weights.iter().sum();
    let mut c1 = Vec3::ZERO;
    let mut c2 = Vec3::ZERO;
    for i in 0..moved.len() {
        c1 += weights[i] * moved[i];
        c2 += weights[i] * target[i];
    }
    (c1 / wsum, c2 / wsum)
}

/// The nine weighted cross-covariance sums plus `E0`, matching `QCP::inner_product` /
/// `QCP::calc_sqrmsd` in the original.
struct InnerProduct {
    sxx: f32,
    sxy: f32,
    sxz: f32,
    syx: f32,
    syy: f32,
    syz: f32,
    szx: f32,
    szy: f32,
    szz: f32,
    e0: f32,
}

impl InnerProduct {
    fn compute(moved: &[Vec3], target: &[Vec3], weights: &[f32]) -> Self {
        let mut g1 = 0.0f32;
        let mut g2 = 0.0f32;
        let mut sxx = 0.0f32;
        let mut sxy = 0.0f32;
        let mut sxz = 0.0f32;
        let mut syx = 0.0f32;
        let mut syy = 0.0f32;
        let mut syz = 0.0f32;
        let mut szx = 0.0f32;
        let mut szy = 0.0f32;
        let mut szz = 0.0f32;

        for i in 0..moved.len() {
            let w = weights[i];
            let x1 = w * moved[i].x;
            let y1 = w * moved[i].y;
            let z1 = w * moved[i].z;
            g1 += x1 * moved[i].x + y1 * moved[i].y + z1 * moved[i].z;

            let (x2, y2, z2) = (target[i].x, target[i].y, target[i].z);
            g2 += w * (x2 * x2 + y2 * y2 + z2 * z2);

            sxx += x1 * x2;
            sxy += x1 * y2;
            sxz += x1 * z2;
            syx += y1 * x2;
            syy += y1 * y2;
            syz += y1 * z2;
            szx += z1 * x2;
            szy += z1 * y2;
            szz += z1 * z2;
        }

        Self {
            sxx,
            sxy,
            sxz,
            syx,
            syy,
            syz,
            szx,
            szy,
            szz,
            e0: (g1 + g2) * 0.5,
        }
    }

    fn characteristic_coeffs(&self) -> (f32, f32, f32) {
        let (sxx, sxy, sxz) = (self.sxx, self.sxy, self.sxz);
        let (syx, syy, syz) = (self.syx, self.syy, self.syz);
        let (szx, szy, szz) = (self.szx, self.szy, self.szz);

        let sxx2 = sxx * sxx;
        let syy2 = syy * syy;
        let szz2 = szz * szz;
        let sxy2 = sxy * sxy;
        let syz2 = syz * syz;
        let sxz2 = sxz * sxz;
        let syx2 = syx * syx;
        let szy2 = szy * szy;
        let szx2 = szx * szx;

        let syzszymsyyszz2 = 2.0 * (syz * szy - syy * szz);
        let sxx2syy2szz2syz2szy2 = syy2 + szz2 - sxx2 + syz2 + szy2;

        let c2 = -2.0 * (sxx2 + syy2 + szz2 + sxy2 + syx2 + sxz2 + szx2 + syz2 + szy2);
        let c1 = 8.0
            * (sxx * syz * szy + syy * szx * sxz + szz * sxy * syx
                - sxx * syy * szz
                - syz * szx * sxy
                - szy * syx * sxz);

        let sxzpszx = sxz + szx;
        let syzpszy = syz + szy;
        let sxypsyx = sxy + syx;
        let syzmszy = syz - szy;
        let sxzmszx = sxz - szx;
        let sxymsyx = sxy - syx;
        let sxxpsyy = sxx + syy;
        let sxxmsyy = sxx - syy;

        let sxy2sxz2syx2szx2 = sxy2 + sxz2 - syx2 - szx2;

        let c0 = sxy2sxz2syx2szx2 * sxy2sxz2syx2szx2
            + (sxx2syy2szz2syz2szy2 + syzszymsyyszz2) * (sxx2syy2szz2syz2szy2 - syzszymsyyszz2)
            + (-(sxzpszx) * (syzmszy) + (sxymsyx) * (sxxmsyy - szz))
                * (-(sxzmszx) * (syzpszy) + (sxymsyx) * (sxxmsyy + szz))
            + (-(sxzpszx) * (syzpszy) - (sxypsyx) * (sxxpsyy - szz))
                * (-(sxzmszx) * (syzmszy) - (sxypsyx) * (sxxpsyy + szz))
            + ((sxypsyx) * (syzpszy) + (sxzpszx) * (sxxmsyy + szz))
                * (-(sxymsyx) * (syzmszy) + (sxzpszx) * (sxxpsyy + szz))
            + ((sxypsyx) * (syzmszy) + (sxzmszx) * (sxxmsyy - szz))
                * (-(sxymsyx) * (syzpszy) + (sxzmszx) * (sxxpsyy - szz));

        (c0, c1, c2)
    }

    fn key_matrix(&self, eigv: f32) -> KeyMatrix {
        let sxxpsyy = self.sxx + self.syy;
        let syzmszy = self.syz - self.szy;
        let sxzmszx = self.sxz - self.szx;
        let sxymsyx = self.sxy - self.syx;
        let sxxmsyy = self.sxx - self.syy;
        let sxypsyx = self.sxy + self.syx;
        let sxzpszx = self.sxz + self.szx;
        let syzpszy = self.syz + self.szy;

        let a11 = sxxpsyy + self.szz - eigv;
        let a12 = syzmszy;
        let a13 = -sxzmszx;
        let a14 = sxymsyx;
        let a21 = syzmszy;
        let a22 = sxxmsyy - self.szz - eigv;
        let a23 = sxypsyx;
        let a24 = sxzpszx;
        let a31 = a13;
        let a32 = a23;
        let a33 = self.syy - self.sxx - self.szz - eigv;
        let a34 = syzpszy;
        let a41 = a14;
        let a42 = a24;
        let a43 = a34;
        let a44 = self.szz - sxxpsyy - eigv;

        KeyMatrix {
            rows: [
                [a11, a12, a13, a14],
                [a21, a22, a23, a24],
                [a31, a32, a33, a34],
                [a41, a42, a43, a44],
            ],
        }
    }
}

/// The symmetric 4x4 "key matrix" `C(λ) = S^T·S_block - λI` whose largest eigenvalue's
/// eigenvector gives the optimal quaternion (`calc_rotation` in the original).
struct KeyMatrix {
    rows: [[f32; 4]; 4],
}

impl KeyMatrix {
    /// Compute the adjoint-matrix column rooted at `row`, trying successive 3x3 cofactor
    /// expansions the way `calc_rotation`'s four nested fallbacks do, and return it as a
    /// quaternion if its norm clears `evec_prec`.
    fn adjoint_column(&self, row: usize, evec_prec: f32) -> Option<Quat> {
        let a = &self.rows;
        let a3344_4334 = a[2][2] * a[3][3] - a[3][2] * a[2][3];
        let a3244_4234 = a[2][1] * a[3][3] - a[3][1] * a[2][3];
        let a3243_4233 = a[2][1] * a[3][2] - a[3][1] * a[2][2];
        let a3143_4133 = a[2][0] * a[3][2] - a[3][0] * a[2][2];
        let a3144_4134 = a[2][0] * a[3][3] - a[3][0] * a[2][3];
        let a3142_4132 = a[2][0] * a[3][1] - a[3][0] * a[2][1];

        let (q1, q2, q3, q4) = match row {
            0 => (
                a[1][1] * a3344_4334 - a[1][2] * a3244_4234 + a[1][3] * a3243_4233,
                -a[1][0] * a3344_4334 + a[1][2] * a3144_4134 - a[1][3] * a3143_4133,
                a[1][0] * a3244_4234 - a[1][1] * a3144_4134 + a[1][3] * a3142_4132,
                -a[1][0] * a3243_4233 + a[1][1] * a3143_4133 - a[1][2] * a3142_4132,
            ),
            1 => (
                a[0][1] * a3344_4334 - a[0][2] * a3244_4234 + a[0][3] * a3243_4233,
                -a[0][0] * a3344_4334 + a[0][2] * a3144_4134 - a[0][3] * a3143_4133,
                a[0][0] * a3244_4234 - a[0][1] * a3144_4134 + a[0][3] * a3142_4132,
                -a[0][0] * a3243_4233 + a[0][1] * a3143_4133 - a[0][2] * a3142_4132,
            ),
            2 => {
                let a1324_1423 = a[0][2] * a[1][3] - a[0][3] * a[1][2];
                let a1224_1422 = a[0][1] * a[1][3] - a[0][3] * a[1][1];
                let a1223_1322 = a[0][1] * a[1][2] - a[0][2] * a[1][1];
                let a1124_1421 = a[0][0] * a[1][3] - a[0][3] * a[1][0];
                let a1123_1321 = a[0][0] * a[1][2] - a[0][2] * a[1][0];
                let a1122_1221 = a[0][0] * a[1][1] - a[0][1] * a[1][0];
                (
                    a[3][1] * a1324_1423 - a[3][2] * a1224_1422 + a[3][3] * a1223_1322,
                    -a[3][0] * a1324_1423 + a[3][2] * a1124_1421 - a[3][3] * a1123_1321,
                    a[3][0] * a1224_1422 - a[3][1] * a1124_1421 + a[3][3] * a1122_1221,
                    -a[3][0] * a1223_1322 + a[3][1] * a1123_1321 - a[3][2] * a1122_1221,
                )
            }
            _ => {
                let a1324_1423 = a[0][2] * a[1][3] - a[0][3] * a[1][2];
                let a1224_1422 = a[0][1] * a[1][3] - a[0][3] * a[1][1];
                let a1223_1322 = a[0][1] * a[1][2] - a[0][2] * a[1][1];
                let a1124_1421 = a[0][0] * a[1][3] - a[0][3] * a[1][0];
                let a1123_1321 = a[0][0] * a[1][2] - a[0][2] * a[1][0];
                let a1122_1221 = a[0][0] * a[1][1] - a[0][1] * a[1][0];
                (
                    a[2][1] * a1324_1423 - a[2][2] * a1224_1422 + a[2][3] * a1223_1322,
                    -a[2][0] * a1324_1423 + a[2][2] * a1124_1421 - a[2][3] * a1123_1321,
                    a[2][0] * a1224_1422 - a[2][1] * a1124_1421 + a[2][3] * a1122_1221,
                    -a[2][0] * a1223_1322 + a[2][1] * a1123_1321 - a[2][2] * a1122_1221,
                )
            }
        };

        let qsqr = q1 * q1 + q2 * q2 + q3 * q3 + q4 * q4;
        if qsqr < evec_prec {
            return None;
        }
        let norm = qsqr.sqrt().recip();
        // original order: Quat(q2, q3, q4, q1) == glam's (x, y, z, w)
        Some(Quat::from_xyzw(q2 * norm, q3 * norm, q4 * norm, q1 * norm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    fn uniform_weights(n: usize) -> Vec<f32> {
        vec![1.0; n]
    }

    #[test]
    fn identity_for_equal_point_sets() {
        let pts = vec![
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 1.0, 1.0),
        ];
        let qcp = Qcp::default();
        let sol = qcp.solve(&pts, &pts, &uniform_weights(pts.len()), false);
        assert!(sol.rotation.angle_between(Quat::IDENTITY) < 1e-4);
        assert!(sol.translation.length() < 1e-4);
    }

    #[test]
    fn recovers_known_rotation() {
        let mut rng = rand::rng();
        let pts: Vec<Vec3> = (0..6)
            .map(|_| Vec3::new(rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)))
            .collect();
        let r = Quat::from_euler(glam::EulerRot::XYZ, 0.4, -0.7, 1.1);
        let target: Vec<Vec3> = pts.iter().map(|p| r * *p).collect();

        let qcp = Qcp::default();
        let sol = qcp.solve(&pts, &target, &uniform_weights(pts.len()), false);
        let dot = sol.rotation.dot(r).abs();
        assert!(dot > 1.0 - 1e-4, "dot = {dot}");
    }

    #[test]
    fn recovers_translation() {
        let pts = vec![
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(-1.0, 0.0, 3.0),
            Vec3::new(2.0, -1.0, -1.0),
        ];
        let v = Vec3::new(3.0, -2.0, 1.5);
        let target: Vec<Vec3> = pts.iter().map(|p| *p + v).collect();

        let qcp = Qcp::default();
        let sol = qcp.solve(&pts, &target, &uniform_weights(pts.len()), true);
        assert!(sol.rotation.angle_between(Quat::IDENTITY) < 1e-3);
        assert!((sol.translation - v).length() < 1e-3, "t = {:?}", sol.translation);
    }

    #[test]
    fn rotation_is_normalized_and_canonical() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let pts: Vec<Vec3> = (0..5)
                .map(|_| Vec3::new(rng.random_range(-2.0..2.0), rng.random_range(-2.0..2.0), rng.random_range(-2.0..2.0)))
                .collect();
            let target: Vec<Vec3> = (0..5)
                .map(|_| Vec3::new(rng.random_range(-2.0..2.0), rng.random_range(-2.0..2.0), rng.random_range(-2.0..2.0)))
                .collect();
            let qcp = Qcp::default();
            let sol = qcp.solve(&pts, &target, &uniform_weights(pts.len()), false);
            assert!((sol.rotation.length() - 1.0).abs() < 1e-4);
            assert!(sol.rotation.w >= -1e-6);
            assert!(sol.rotation.is_finite());
        }
    }

    #[test]
    fn degenerate_single_point_returns_identity() {
        let qcp = Qcp::default();
        let sol = qcp.solve(&[Vec3::ZERO], &[Vec3::X], &[1.0], false);
        assert_eq!(sol.rotation, Quat::IDENTITY);
    }

    #[test]
    fn mismatched_lengths_return_identity() {
        let qcp = Qcp::default();
        let sol = qcp.solve(&[Vec3::X, Vec3::Y], &[Vec3::X], &[1.0, 1.0], false);
        assert_eq!(sol.rotation, Quat::IDENTITY);
    }

    #[test]
    fn all_zero_weights_return_identity() {
        let qcp = Qcp::default();
        let sol = qcp.solve(&[Vec3::X, Vec3::Y], &[Vec3::Y, Vec3::X], &[0.0, 0.0], false);
        assert_eq!(sol.rotation, Quat::IDENTITY);
    }
}
