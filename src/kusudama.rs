//! Open cone and Kusudama swing/twist constraint (spec.md §4.3).
//!
//! The swing region is the union of cones joined by pairwise tangent bands. Reworked from
//! `examples/original_source/constraints/{Kusudama,LimitCone}.{h,cpp}` into the closed-form
//! algorithm spec.md §4.3 describes — the original's nullable-pointer triangle-intersection
//! fallbacks are not carried over (spec.md §9 calls this out as a known wart not to reconcile).

use crate::error::IkError;
use glam::{Quat, Vec3};
use std::f32::consts::{PI, TAU};

/// A spherical cap on the unit sphere: center direction and half-angle, plus tangent data
/// valid only after `Kusudama::update_tangent_handles` runs.
#[derive(Debug, Clone, Copy)]
pub struct OpenCone {
    pub control_point: Vec3,
    pub radius: f32,
    /// Cushion factor in `(0, 1]`; `1.0` means a hard boundary (spec.md §3 "Supplemented
    /// features": `cushion`). Scales the effective hard radius used for resistance-weighted
    /// snapping.
    pub cushion: f32,

    tangent_radius: f32,
    tangent_center_1: Vec3,
    tangent_center_2: Vec3,
}

impl OpenCone {
    pub fn new(control_point: Vec3, radius: f32) -> Self {
        Self {
            control_point: control_point.normalize_or_zero(),
            radius: radius.clamp(0.0, PI),
            cushion: 1.0,
            tangent_radius: 0.0,
            tangent_center_1: Vec3::ZERO,
            tangent_center_2: Vec3::ZERO,
        }
    }

    pub fn with_cushion(mut self, cushion: f32) -> Self {
        self.cushion = cushion.clamp(0.001, 1.0);
        self
    }

    /// The cone's hard boundary after cushioning: `cushion == 1.0` leaves `radius` untouched;
    /// smaller cushion draws a soft radius in from `radius`, and `resistance` (the owning
    /// `Kusudama`'s field) controls how much of that cushion band is actually given up —
    /// `resistance == 0` keeps the boundary at `radius` (the full cushion band is free),
    /// `resistance == 1` pulls it all the way in to the soft radius.
    fn effective_radius(&self, resistance: f32) -> f32 {
        let soft = self.radius * self.cushion;
        soft + (self.radius - soft) * (1.0 - resistance.clamp(0.0, 1.0))
    }

    /// Closest point on this cone's (cushioned) boundary (or `p` itself, with `in_bounds =
    /// true`, if `p` is already inside). spec.md §4.3 step 1.
    fn closest_to_cone(&self, p: Vec3, resistance: f32) -> (Vec3, bool) {
        let radius = self.effective_radius(resistance);
        if p.dot(self.control_point) >= radius.cos() {
            return (p, true);
        }
        let axis = self.control_point.cross(p);
        if axis.length_squared() < 1e-12 {
            // p is antipodal to the control point; any rotation axis works.
            let axis = self.control_point.any_orthonormal_vector();
            return (Quat::from_axis_angle(axis, radius) * self.control_point, false);
        }
        let axis = axis.normalize();
        (Quat::from_axis_angle(axis, radius) * self.control_point, false)
    }
}

/// A swing-plus-twist constraint attached to one bone.
#[derive(Debug, Clone)]
pub struct Kusudama {
    cones: Vec<OpenCone>,
    /// `(min_axial_angle, angular_range)`, both in radians; `angular_range ∈ [0, 2π]`.
    min_axial_angle: f32,
    angular_range: f32,
    pub orientationally_constrained: bool,
    pub axially_constrained: bool,
    /// How strongly the bone is pulled back toward the interior of the allowed region.
    pub resistance: f32,
    rotational_freedom: f32,
}

impl Default for Kusudama {
    fn default() -> Self {
        Self {
            cones: Vec::new(),
            min_axial_angle: 0.0,
            angular_range: TAU,
            orientationally_constrained: false,
            axially_constrained: false,
            resistance: 0.0,
            rotational_freedom: 1.0,
        }
    }
}

impl Kusudama {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cones(&self) -> &[OpenCone] {
        &self.cones
    }

    /// Replace the cone sequence and recompute tangent handles + the rotational-freedom
    /// estimate (spec.md §3's `rotational_freedom`, §4.3's `update_tangent_handles`).
    pub fn set_cones(&mut self, cones: Vec<OpenCone>) -> Result<(), IkError> {
        for c in &cones {
            if !(0.0..=PI).contains(&c.radius) {
                return Err(IkError::OutOfRangeConfig(format!(
                    "cone radius {} outside [0, pi]",
                    c.radius
                )));
            }
        }
        self.cones = cones;
        self.update_tangent_handles();
        self.update_rotational_freedom();
        Ok(())
    }

    pub fn set_twist_range(&mut self, min_axial_angle: f32, angular_range: f32) -> Result<(), IkError> {
        if angular_range < 0.0 || angular_range > TAU {
            return Err(IkError::OutOfRangeConfig(format!(
                "twist angular range {} outside [0, 2*pi]",
                angular_range
            )));
        }
        self.min_axial_angle = min_axial_angle;
        self.angular_range = angular_range;
        Ok(())
    }

    pub fn min_axial_angle(&self) -> f32 {
        self.min_axial_angle
    }

    pub fn angular_range(&self) -> f32 {
        self.angular_range
    }

    pub fn rotational_freedom(&self) -> f32 {
        self.rotational_freedom
    }

    /// Recompute tangent-circle data for every adjacent cone pair (spec.md §4.3 "Tangent data
    /// update"). Must be called after any change to the cone list.
    fn update_tangent_handles(&mut self) {
        let n = self.cones.len();
        for i in 0..n {
            let (a, ra) = (self.cones[i].control_point, self.cones[i].radius);
            if i + 1 < n {
                let (b, rb) = (self.cones[i + 1].control_point, self.cones[i + 1].radius);
                let tangent_radius = (PI - ra - rb) / 2.0;
                let (t1, t2) = tangent_circle_centers(a, ra, b, rb, tangent_radius);
                let cone = &mut self.cones[i];
                cone.tangent_radius = tangent_radius;
                cone.tangent_center_1 = t1;
                cone.tangent_center_2 = t2;
            } else if n == 1 {
                // Single-cone kusudama: tangent directions default to any orthogonal.
                let t1 = a.any_orthonormal_vector();
                let cone = &mut self.cones[i];
                cone.tangent_radius = 0.0;
                cone.tangent_center_1 = t1;
                cone.tangent_center_2 = -t1;
            }
        }
    }

    /// Approximate fraction of the sphere's solid angle left unconstrained (spec.md §3). A
    /// cheap Monte-Carlo-free estimate: sum of cone solid angles (capped at the whole sphere),
    /// subtracted from 1. Matches the original's role (a cached approximation, not an exact
    /// area computation) without replicating its `optimizeLimitingAxes` retargeting dance,
    /// which spec.md §9 explicitly says may be omitted.
    fn update_rotational_freedom(&mut self) {
        if self.cones.is_empty() {
            self.rotational_freedom = 1.0;
            return;
        }
        let covered: f32 = self
            .cones
            .iter()
            .map(|c| (1.0 - c.radius.cos()) / 2.0)
            .sum();
        self.rotational_freedom = (1.0 - covered).clamp(0.0, 1.0);
    }

    /// Closest in-region direction to `p` (spec.md §4.3's `point_in_limits`). Returns `p`
    /// unchanged when unconstrained (empty cone list and `orientationally_constrained ==
    /// false`), per spec.md §4.3's failure semantics.
    pub fn point_in_limits(&self, p: Vec3) -> Vec3 {
        if self.cones.is_empty() {
            return p;
        }
        let p = p.normalize_or_zero();
        if p == Vec3::ZERO {
            return self.cones[0].control_point;
        }

        if self.cones.len() == 1 {
            let (closest, in_bounds) = self.cones[0].closest_to_cone(p, self.resistance);
            return if in_bounds { p } else { closest };
        }

        let mut best: Option<Vec3> = None;
        let mut best_dot = f32::NEG_INFINITY;

        for cone in &self.cones {
            let (closest, in_bounds) = cone.closest_to_cone(p, self.resistance);
            if in_bounds {
                return p;
            }
            let d = p.dot(closest);
            if d > best_dot {
                best_dot = d;
                best = Some(closest);
            }
        }

        for i in 0..self.cones.len() - 1 {
            if let Some((candidate, contained)) = self.on_great_tangent_triangle(p, i) {
                if contained {
                    return candidate;
                }
                let d = p.dot(candidate);
                if d > best_dot {
                    best_dot = d;
                    best = Some(candidate);
                }
            }
        }

        best.unwrap_or(p)
    }

    /// spec.md §4.3 step 3: tangent-band containment test between cones `i` and `i+1`.
    /// Returns `Some((point, contained))` where `contained` means `p` already lies within the
    /// tangent circle (so `point == p`); otherwise `point` is the projected boundary point.
    fn on_great_tangent_triangle(&self, p: Vec3, i: usize) -> Option<(Vec3, bool)> {
        let this_cone = &self.cones[i];
        let next_cone = &self.cones[i + 1];
        let c1xc2 = this_cone.control_point.cross(next_cone.control_point);
        if c1xc2.length_squared() < 1e-12 {
            return None;
        }
        let sign = p.dot(c1xc2);
        let tangent_center = if sign < 0.0 {
            this_cone.tangent_center_1
        } else {
            this_cone.tangent_center_2
        };

        if !point_in_spherical_triangle(p, this_cone.control_point, tangent_center, next_cone.control_point) {
            return None;
        }

        let tangent_cos = this_cone.tangent_radius.cos();
        if p.dot(tangent_center) > tangent_cos {
            Some((p, true))
        } else {
            let axis = tangent_center.cross(p);
            if axis.length_squared() < 1e-12 {
                return Some((tangent_center, false));
            }
            let axis = axis.normalize();
            let rotated = Quat::from_axis_angle(axis, this_cone.tangent_radius) * tangent_center;
            Some((rotated, false))
        }
    }

    /// Project the bone's current direction into the constraint frame, snap it into the
    /// allowed swing region, and apply the corrected rotation — clamped to `max_half_angle`
    /// to avoid overshoot (spec.md §4.3 "Snap-to-orientation-limit").
    pub fn snap_to_orientation_limit(&self, current_direction: Vec3, max_half_angle: f32) -> Quat {
        if !self.orientationally_constrained {
            return Quat::IDENTITY;
        }
        let corrected = self.point_in_limits(current_direction);
        let q = Quat::from_rotation_arc(current_direction.normalize_or_zero(), corrected.normalize_or_zero());
        clamp_to_cos_half_angle(q, (max_half_angle / 2.0).cos())
    }

    /// Decompose `local_rotation` (the bone's rotation expressed in the constraint frame)
    /// into swing and twist about +Y, and return the signed twist angle in `[0, 2π)` measured
    /// from `min_axial_angle`, matching `IKKusudama::snapToTwistLimits`'s `angleDelta2`.
    fn twist_angle(&self, local_rotation: Quat) -> f32 {
        let (_, twist) = swing_twist_decompose(local_rotation, Vec3::Y);
        let (axis, angle) = twist.to_axis_angle();
        let signed = angle * axis.y.signum();
        to_tau(signed)
    }

    /// Bring the bone's twist back into `[min_axial_angle, min_axial_angle + angular_range]`
    /// if it has drifted out, rotating about +Y by the minimal signed angle to the nearer
    /// endpoint. Returns the applied angle (0 if already in range). spec.md §4.3
    /// "Snap-to-twist-limit".
    pub fn snap_to_twist_limit(&self, local_rotation: Quat) -> f32 {
        if !self.axially_constrained || self.angular_range >= TAU {
            return 0.0;
        }
        let angle = self.twist_angle(local_rotation);
        let min = to_tau(self.min_axial_angle);
        let from_min = to_tau(angle - min);

        if from_min <= self.angular_range {
            return 0.0;
        }

        let dist_to_min = signed_angle_difference(from_min, 0.0).abs();
        let dist_to_max = signed_angle_difference(from_min, self.angular_range).abs();
        if dist_to_min < dist_to_max {
            -from_min
        } else {
            self.angular_range - from_min
        }
    }

    /// Bias the bone's twist toward the midpoint of the twist range, scaled by `resistance`,
    /// without overriding the hard clamp in `snap_to_twist_limit` — only applied when the
    /// bone is already in range (spec.md §3 "Axial twist return-to-center pull").
    pub fn pull_toward_twist_center(&self, local_rotation: Quat) -> f32 {
        if !self.axially_constrained || self.resistance <= 0.0 || self.angular_range >= TAU {
            return 0.0;
        }
        let angle = self.twist_angle(local_rotation);
        let min = to_tau(self.min_axial_angle);
        let from_min = to_tau(angle - min);
        if from_min > self.angular_range {
            return 0.0; // out of range: the hard clamp owns this bone this pass.
        }
        let mid = self.angular_range / 2.0;
        let delta = signed_angle_difference(from_min, mid);
        -delta * self.resistance
    }
}

fn tangent_circle_centers(a: Vec3, ra: f32, b: Vec3, rb: f32, tangent_radius: f32) -> (Vec3, Vec3) {
    let arc_normal = a.cross(b);
    if arc_normal.length_squared() < 1e-12 {
        let t1 = a.any_orthonormal_vector();
        return (t1, -t1);
    }
    let arc_normal = arc_normal.normalize();

    // Point on the plane through the tangent contact points on cone A's side, rotated by
    // (ra + tangent_radius) around the arc normal.
    let plane_dir_a = Quat::from_axis_angle(arc_normal, ra + tangent_radius) * a;
    let plane_dir_b = Quat::from_axis_angle(arc_normal, -(rb + tangent_radius)) * b;

    // The tangent-circle center lies on the unit sphere, in the plane bisecting A and B at
    // the computed offsets; average the two candidate directions and renormalize onto the
    // sphere, then reflect for the second solution.
    let mid = (plane_dir_a + plane_dir_b).normalize_or_zero();
    let t1 = if mid != Vec3::ZERO { mid } else { arc_normal };
    let t2 = reflect_about_great_circle(t1, a, b);
    (t1, t2)
}

fn reflect_about_great_circle(v: Vec3, a: Vec3, b: Vec3) -> Vec3 {
    let normal = a.cross(b).normalize_or_zero();
    if normal == Vec3::ZERO {
        return -v;
    }
    (v - 2.0 * v.dot(normal) * normal).normalize_or_zero()
}

fn point_in_spherical_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> bool {
    let n1 = a.cross(b);
    let n2 = b.cross(c);
    let n3 = c.cross(a);
    let s1 = p.dot(n1);
    let s2 = p.dot(n2);
    let s3 = p.dot(n3);
    (s1 >= 0.0 && s2 >= 0.0 && s3 >= 0.0) || (s1 <= 0.0 && s2 <= 0.0 && s3 <= 0.0)
}

/// Swing-twist decomposition of `q` about `twist_axis`: returns `(swing, twist)` such that
/// `q == swing * twist`.
pub fn swing_twist_decompose(q: Quat, twist_axis: Vec3) -> (Quat, Quat) {
    let axis = Vec3::new(q.x, q.y, q.z);
    let proj = axis.dot(twist_axis) * twist_axis;
    let twist_raw = Quat::from_xyzw(proj.x, proj.y, proj.z, q.w);
    let twist = if twist_raw.length_squared() < 1e-12 {
        Quat::IDENTITY
    } else {
        twist_raw.normalize()
    };
    let swing = q * twist.conjugate();
    (swing, twist)
}

/// Map an angle into `[0, 2π)`.
pub fn to_tau(angle: f32) -> f32 {
    let mut r = angle % TAU;
    if r < 0.0 {
        r += TAU;
    }
    r
}

/// Signed shortest angular distance from `b` to `a`, in `(-π, π]`.
fn signed_angle_difference(a: f32, b: f32) -> f32 {
    let d = (a - b) % TAU;
    if d > PI {
        d - TAU
    } else if d < -PI {
        d + TAU
    } else {
        d
    }
}

/// Damping clamp (spec.md §4.4): cap `q`'s rotation magnitude to `cos_half_angle`, preserving
/// its axis, after first ensuring `q.w >= 0`.
pub fn clamp_to_cos_half_angle(q: Quat, cos_half_angle: f32) -> Quat {
    let q = if q.w < 0.0 { -q } else { q };
    if q.w >= cos_half_angle {
        return q;
    }
    let denom = 1.0 - q.w * q.w;
    if denom <= 1e-12 {
        return q;
    }
    let scale = ((1.0 - cos_half_angle * cos_half_angle) / denom).sqrt();
    Quat::from_xyzw(q.x * scale, q.y * scale, q.z * scale, cos_half_angle).normalize()
}
