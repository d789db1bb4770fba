//! Monocular map initialization from two views.
//!
//! A homography and a fundamental matrix are estimated in parallel RANSAC
//! loops over the same minimal sets. The model that explains the matches
//! better is decomposed into motion hypotheses; the hypothesis that
//! triangulates the most points in front of both cameras, with enough
//! parallax, wins if there is a clear winner.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use tracing::debug;

use crate::features::KeyPoint;
use crate::geometry::SE3;
use crate::system::config::TrackingConfig;
use crate::tracking::matcher::OrbMatcher;
use crate::tracking::tracking_frame::Frame;

/// Keypoint standard deviation in pixels used for model scoring.
const SIGMA: f64 = 1.0;
const RANSAC_SET_SIZE: usize = 8;
/// Initialization matching ratio test.
const INIT_NN_RATIO: f64 = 0.9;
/// Median match displacement (pixels) below which the camera did not move.
const MIN_MEDIAN_DISPARITY: f64 = 1.0;
/// Homography score ratio above which the homography is decomposed.
const HOMOGRAPHY_SELECTION_RATIO: f64 = 0.40;
/// Cosine of the smallest parallax a point needs to be counted as triangulated.
const MIN_COS_PARALLAX: f64 = 0.99998;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Homography,
    Fundamental,
}

/// Why a pair of frames did not initialize the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitRejection {
    /// The current frame has too few keypoints; a new reference is needed.
    TooFewFeatures,
    /// Too few matches with the reference; a new reference is needed.
    TooFewMatches(usize),
    /// The matched keypoints did not move.
    NoMotion,
    /// Neither model produced a clear, well-conditioned reconstruction.
    NoReconstruction,
}

/// A successful two-view reconstruction. The reference camera is the world
/// origin.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// T_cw of the current frame.
    pub pose_cw: SE3,
    /// `(reference feature, current feature, point in the reference frame)`.
    pub triangulated: Vec<(usize, usize, Vector3<f64>)>,
    pub model: ModelKind,
    pub parallax_deg: f64,
}

pub struct Initializer {
    reference: Frame,
    prev_matched: Vec<Vector2<f64>>,
    config: TrackingConfig,
}

impl Initializer {
    /// Start from `reference`. `None` if it has too few keypoints.
    pub fn new(reference: &Frame, config: &TrackingConfig) -> Option<Self> {
        if reference.num_features() < config.init_min_features {
            return None;
        }
        let prev_matched = reference
            .keypoints
            .iter()
            .map(|kp| Vector2::new(kp.x as f64, kp.y as f64))
            .collect();
        Some(Self {
            reference: reference.clone(),
            prev_matched,
            config: config.clone(),
        })
    }

    pub fn reference(&self) -> &Frame {
        &self.reference
    }

    /// Try to reconstruct the scene from the reference and `current`.
    pub fn initialize(&mut self, current: &Frame) -> Result<TwoViewReconstruction, InitRejection> {
        if current.num_features() < self.config.init_min_features {
            return Err(InitRejection::TooFewFeatures);
        }

        let matcher = OrbMatcher::new(INIT_NN_RATIO, true);
        let (n_matches, matches12) = matcher.search_for_initialization(
            &self.reference,
            current,
            &mut self.prev_matched,
            self.config.init_search_window,
        );
        if n_matches < self.config.init_min_matches {
            return Err(InitRejection::TooFewMatches(n_matches));
        }

        let pairs: Vec<(usize, usize)> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        let kps1: Vec<&KeyPoint> = pairs.iter().map(|(i1, _)| &self.reference.keypoints[*i1]).collect();
        let kps2: Vec<&KeyPoint> = pairs.iter().map(|(_, i2)| &current.keypoints[*i2]).collect();

        let mut disparities: Vec<f64> = kps1
            .iter()
            .zip(&kps2)
            .map(|(a, b)| ((a.x - b.x) as f64).hypot((a.y - b.y) as f64))
            .collect();
        disparities.sort_by(|a, b| a.total_cmp(b));
        let median = disparities[disparities.len() / 2];
        if median < MIN_MEDIAN_DISPARITY {
            debug!("[Initializer] median disparity {:.2}px, no motion", median);
            return Err(InitRejection::NoMotion);
        }

        let p1: Vec<Vector2<f64>> = kps1.iter().map(|k| Vector2::new(k.x as f64, k.y as f64)).collect();
        let p2: Vec<Vector2<f64>> = kps2.iter().map(|k| Vector2::new(k.x as f64, k.y as f64)).collect();
        let k = current.camera.k_matrix();
        let params = ReconstructionParams {
            min_parallax_deg: self.config.init_min_parallax_deg,
            min_triangulated: self.config.init_min_triangulated,
        };

        let sets = ransac_sets(p1.len(), self.config.init_ransac_iterations, self.config.init_seed);
        let homography = find_homography(&p1, &p2, &sets);
        let fundamental = find_fundamental(&p1, &p2, &sets);
        let (Some((h21, sh, h_inliers)), Some((f21, sf, f_inliers))) = (homography, fundamental) else {
            return Err(InitRejection::NoReconstruction);
        };
        if sh + sf <= 0.0 {
            return Err(InitRejection::NoReconstruction);
        }
        let rh = sh / (sh + sf);
        debug!("[Initializer] {} matches, SH={:.1} SF={:.1} RH={:.2}", pairs.len(), sh, sf, rh);

        // An ambiguous planar decomposition falls back to F.
        let homography = (rh > HOMOGRAPHY_SELECTION_RATIO)
            .then(|| reconstruct_h(&h21, &k, &p1, &p2, &h_inliers, &params))
            .flatten();
        let (model, hypothesis) = match homography {
            Some(h) => (ModelKind::Homography, h),
            None => {
                let f = reconstruct_f(&f21, &k, &p1, &p2, &f_inliers, &params);
                (ModelKind::Fundamental, f.ok_or(InitRejection::NoReconstruction)?)
            }
        };

        let triangulated = pairs
            .iter()
            .zip(&hypothesis.points)
            .filter_map(|(&(i1, i2), p)| p.map(|p| (i1, i2, p)))
            .collect();
        Ok(TwoViewReconstruction {
            pose_cw: SE3::from_rt(hypothesis.rotation, hypothesis.translation),
            triangulated,
            model,
            parallax_deg: hypothesis.parallax_deg,
        })
    }
}

struct ReconstructionParams {
    min_parallax_deg: f64,
    min_triangulated: usize,
}

/// Outcome of one motion hypothesis.
struct Hypothesis {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    /// Per match: the point if triangulated with enough parallax.
    points: Vec<Option<Vector3<f64>>>,
    num_good: usize,
    parallax_deg: f64,
}

fn ransac_sets(n: usize, iterations: usize, seed: u64) -> Vec<Vec<usize>> {
    if n < RANSAC_SET_SIZE {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    (0..iterations)
        .map(|_| sample(&mut rng, n, RANSAC_SET_SIZE).into_vec())
        .collect()
}

/// Translate to the centroid and scale by the mean absolute deviation.
fn normalize(points: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let dev = points
        .iter()
        .fold(Vector2::zeros(), |acc: Vector2<f64>, p| acc + (p - mean).abs())
        / n;
    if dev.x <= f64::EPSILON || dev.y <= f64::EPSILON {
        return None;
    }
    let (sx, sy) = (1.0 / dev.x, 1.0 / dev.y);
    let normalized = points
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean.x * sx, 0.0, sy, -mean.y * sy, 0.0, 0.0, 1.0);
    Some((normalized, t))
}

/// Right singular vector of the smallest singular value, reshaped row-major.
fn null_vector_3x3(a: DMatrix<f64>) -> Option<Matrix3<f64>> {
    let cols = a.ncols();
    // A thin SVD of a wide matrix does not expose the null space.
    let a = if a.nrows() < cols {
        let mut padded = DMatrix::zeros(cols, cols);
        padded.rows_mut(0, a.nrows()).copy_from(&a);
        padded
    } else {
        a
    };
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v = v_t.row(min_idx);
    Some(Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]))
}

/// SVD of a 3×3 matrix with singular values sorted in descending order.
fn sorted_svd3(m: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let svd = (*m).svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let s = svd.singular_values;
    let mut order = [0usize, 1, 2];
    order.sort_by(|a, b| s[*b].total_cmp(&s[*a]));
    let mut u_sorted = Matrix3::zeros();
    let mut v_t_sorted = Matrix3::zeros();
    let mut s_sorted = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        u_sorted.set_column(dst, &u.column(src));
        v_t_sorted.set_row(dst, &v_t.row(src));
        s_sorted[dst] = s[src];
    }
    Some((u_sorted, s_sorted, v_t_sorted))
}

fn compute_h21(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);
        let r = 2 * i;
        a.row_mut(r)
            .copy_from_slice(&[0.0, 0.0, 0.0, -u1, -v1, -1.0, v2 * u1, v2 * v1, v2]);
        a.row_mut(r + 1)
            .copy_from_slice(&[u1, v1, 1.0, 0.0, 0.0, 0.0, -u2 * u1, -u2 * v1, -u2]);
    }
    null_vector_3x3(a)
}

fn compute_f21(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = p1.len();
    let mut a = DMatrix::zeros(n, 9);
    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);
        a.row_mut(i)
            .copy_from_slice(&[u2 * u1, u2 * v1, u2, v2 * u1, v2 * v1, v2, u1, v1, 1.0]);
    }
    let f = null_vector_3x3(a)?;

    // Enforce rank 2.
    let (u, mut s, v_t) = sorted_svd3(&f)?;
    s[2] = 0.0;
    Some(u * Matrix3::from_diagonal(&s) * v_t)
}

fn select(points: &[Vector2<f64>], set: &[usize]) -> Vec<Vector2<f64>> {
    set.iter().map(|&i| points[i]).collect()
}

/// Best homography over the RANSAC sets: `(H21, score, inliers)`.
fn find_homography(
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    sets: &[Vec<usize>],
) -> Option<(Matrix3<f64>, f64, Vec<bool>)> {
    let (n1, t1) = normalize(p1)?;
    let (n2, t2) = normalize(p2)?;
    let t2_inv = t2.try_inverse()?;

    let mut best: Option<(Matrix3<f64>, f64, Vec<bool>)> = None;
    for set in sets {
        let Some(hn) = compute_h21(&select(&n1, set), &select(&n2, set)) else {
            continue;
        };
        let h21 = t2_inv * hn * t1;
        let Some(h12) = h21.try_inverse() else {
            continue;
        };
        let (score, inliers) = check_homography(&h21, &h12, p1, p2);
        if best.as_ref().map_or(true, |b| score > b.1) {
            best = Some((h21, score, inliers));
        }
    }
    best
}

/// Best fundamental matrix over the RANSAC sets: `(F21, score, inliers)`.
fn find_fundamental(
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    sets: &[Vec<usize>],
) -> Option<(Matrix3<f64>, f64, Vec<bool>)> {
    let (n1, t1) = normalize(p1)?;
    let (n2, t2) = normalize(p2)?;

    let mut best: Option<(Matrix3<f64>, f64, Vec<bool>)> = None;
    for set in sets {
        let Some(fn_) = compute_f21(&select(&n1, set), &select(&n2, set)) else {
            continue;
        };
        let f21 = t2.transpose() * fn_ * t1;
        let (score, inliers) = check_fundamental(&f21, p1, p2);
        if best.as_ref().map_or(true, |b| score > b.1) {
            best = Some((f21, score, inliers));
        }
    }
    best
}

fn transfer(h: &Matrix3<f64>, p: &Vector2<f64>) -> Option<Vector2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    (q.z.abs() > f64::EPSILON).then(|| Vector2::new(q.x / q.z, q.y / q.z))
}

/// Symmetric transfer score of a homography.
fn check_homography(
    h21: &Matrix3<f64>,
    h12: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
) -> (f64, Vec<bool>) {
    const TH: f64 = 5.991;
    let inv_sigma2 = 1.0 / (SIGMA * SIGMA);
    let mut score = 0.0;
    let mut inliers = vec![true; p1.len()];

    for i in 0..p1.len() {
        for (from, to, h) in [(&p2[i], &p1[i], h12), (&p1[i], &p2[i], h21)] {
            let chi2 = transfer(h, from).map_or(f64::INFINITY, |q| (q - to).norm_squared() * inv_sigma2);
            if chi2 > TH {
                inliers[i] = false;
            } else {
                score += TH - chi2;
            }
        }
    }
    (score, inliers)
}

/// Symmetric epipolar-distance score of a fundamental matrix.
fn check_fundamental(f21: &Matrix3<f64>, p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> (f64, Vec<bool>) {
    const TH: f64 = 3.841;
    const TH_SCORE: f64 = 5.991;
    let inv_sigma2 = 1.0 / (SIGMA * SIGMA);
    let mut score = 0.0;
    let mut inliers = vec![true; p1.len()];

    let line_distance2 = |line: Vector3<f64>, p: &Vector2<f64>| {
        let den = line.x * line.x + line.y * line.y;
        if den <= f64::EPSILON {
            return f64::INFINITY;
        }
        let num = line.x * p.x + line.y * p.y + line.z;
        num * num / den
    };

    for i in 0..p1.len() {
        let x1 = Vector3::new(p1[i].x, p1[i].y, 1.0);
        let x2 = Vector3::new(p2[i].x, p2[i].y, 1.0);
        let checks = [
            line_distance2(f21 * x1, &p2[i]),
            line_distance2(f21.transpose() * x2, &p1[i]),
        ];
        for d2 in checks {
            let chi2 = d2 * inv_sigma2;
            if chi2 > TH {
                inliers[i] = false;
            } else {
                score += TH_SCORE - chi2;
            }
        }
    }
    (score, inliers)
}

/// Linear triangulation from two 3×4 projection matrices.
pub(crate) fn triangulate(
    p1: &Vector2<f64>,
    p2: &Vector2<f64>,
    proj1: &Matrix3x4<f64>,
    proj2: &Matrix3x4<f64>,
) -> Option<Vector3<f64>> {
    let mut a = nalgebra::Matrix4::zeros();
    a.set_row(0, &(proj1.row(2) * p1.x - proj1.row(0)));
    a.set_row(1, &(proj1.row(2) * p1.y - proj1.row(1)));
    a.set_row(2, &(proj2.row(2) * p2.x - proj2.row(0)));
    a.set_row(3, &(proj2.row(2) * p2.y - proj2.row(1)));
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x = v_t.row(min_idx);
    if x[3].abs() < f64::EPSILON {
        return None;
    }
    let p = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    (p.x.is_finite() && p.y.is_finite() && p.z.is_finite()).then_some(p)
}

fn projection(k: &Matrix3<f64>, r: &Matrix3<f64>, t: &Vector3<f64>) -> Matrix3x4<f64> {
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    rt.set_column(3, t);
    k * rt
}

fn project(k: &Matrix3<f64>, p: &Vector3<f64>) -> Vector2<f64> {
    Vector2::new(k[(0, 0)] * p.x / p.z + k[(0, 2)], k[(1, 1)] * p.y / p.z + k[(1, 2)])
}

/// Triangulate the inliers under motion `(r, t)` and count the points that
/// pass cheirality and reprojection tests.
fn check_rt(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    k: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    inliers: &[bool],
) -> Hypothesis {
    let th2 = 4.0 * SIGMA * SIGMA;
    let proj1 = projection(k, &Matrix3::identity(), &Vector3::zeros());
    let proj2 = projection(k, r, t);
    let o2 = -(r.transpose() * t);

    let mut points = vec![None; p1.len()];
    let mut cos_parallaxes = Vec::new();
    let mut num_good = 0;

    for i in 0..p1.len() {
        if !inliers[i] {
            continue;
        }
        let Some(x1) = triangulate(&p1[i], &p2[i], &proj1, &proj2) else {
            continue;
        };
        let n1 = x1;
        let n2 = x1 - o2;
        let cos_parallax = n1.dot(&n2) / (n1.norm() * n2.norm());

        if x1.z <= 0.0 && cos_parallax < MIN_COS_PARALLAX {
            continue;
        }
        let x2 = r * x1 + t;
        if x2.z <= 0.0 && cos_parallax < MIN_COS_PARALLAX {
            continue;
        }
        if (project(k, &x1) - p1[i]).norm_squared() > th2 {
            continue;
        }
        if (project(k, &x2) - p2[i]).norm_squared() > th2 {
            continue;
        }

        cos_parallaxes.push(cos_parallax);
        num_good += 1;
        if cos_parallax < MIN_COS_PARALLAX {
            points[i] = Some(x1);
        }
    }

    let parallax_deg = if cos_parallaxes.is_empty() {
        0.0
    } else {
        cos_parallaxes.sort_by(|a, b| a.total_cmp(b));
        let idx = 50.min(cos_parallaxes.len() - 1);
        cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
    };

    Hypothesis {
        rotation: *r,
        translation: *t,
        points,
        num_good,
        parallax_deg,
    }
}

fn reconstruct_f(
    f21: &Matrix3<f64>,
    k: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    inliers: &[bool],
    params: &ReconstructionParams,
) -> Option<Hypothesis> {
    let n = inliers.iter().filter(|b| **b).count();
    let e21 = k.transpose() * f21 * k;
    let (r1, r2, t) = decompose_essential(&e21)?;

    let hypotheses: Vec<Hypothesis> = [(r1, t), (r2, t), (r1, -t), (r2, -t)]
        .iter()
        .map(|(r, t)| check_rt(r, t, k, p1, p2, inliers))
        .collect();

    let max_good = hypotheses.iter().map(|h| h.num_good).max()?;
    let min_good = ((0.9 * n as f64) as usize).max(params.min_triangulated);
    let similar = hypotheses
        .iter()
        .filter(|h| h.num_good as f64 > 0.7 * max_good as f64)
        .count();
    if max_good < min_good || similar > 1 {
        debug!("[Initializer] F rejected: best {} of {} inliers, {} similar", max_good, n, similar);
        return None;
    }

    let best = hypotheses.into_iter().find(|h| h.num_good == max_good)?;
    (best.parallax_deg > params.min_parallax_deg).then_some(best)
}

fn decompose_essential(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let (u, _, v_t) = sorted_svd3(e)?;
    let t = u.column(2).normalize();
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let fix = |r: Matrix3<f64>| if r.determinant() < 0.0 { -r } else { r };
    Some((fix(u * w * v_t), fix(u * w.transpose() * v_t), t))
}

/// Faugeras decomposition of a calibrated homography into 8 hypotheses.
fn reconstruct_h(
    h21: &Matrix3<f64>,
    k: &Matrix3<f64>,
    p1: &[Vector2<f64>],
    p2: &[Vector2<f64>],
    inliers: &[bool],
    params: &ReconstructionParams,
) -> Option<Hypothesis> {
    let n = inliers.iter().filter(|b| **b).count();
    let a = k.try_inverse()? * h21 * k;
    let (u, w, v_t) = sorted_svd3(&a)?;
    let s = u.determinant() * v_t.determinant();
    let (d1, d2, d3) = (w[0], w[1], w[2]);
    if d3 <= 0.0 || d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        debug!("[Initializer] H rejected: degenerate singular values");
        return None;
    }

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1 = [aux1, aux1, -aux1, -aux1];
    let x3 = [aux3, -aux3, aux3, -aux3];

    let mut motions: Vec<(Matrix3<f64>, Vector3<f64>)> = Vec::with_capacity(8);

    // d' = d2
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];
    for i in 0..4 {
        let rp = Matrix3::new(ctheta, 0.0, -stheta[i], 0.0, 1.0, 0.0, stheta[i], 0.0, ctheta);
        let r = s * u * rp * v_t;
        let tp = Vector3::new(x1[i], 0.0, -x3[i]) * (d1 - d3);
        motions.push((r, (u * tp).normalize()));
    }

    // d' = -d2
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];
    for i in 0..4 {
        let rp = Matrix3::new(cphi, 0.0, sphi[i], 0.0, -1.0, 0.0, sphi[i], 0.0, -cphi);
        let r = s * u * rp * v_t;
        let tp = Vector3::new(x1[i], 0.0, x3[i]) * (d1 + d3);
        motions.push((r, (u * tp).normalize()));
    }
    let mut hypotheses: Vec<Hypothesis> = motions
        .iter()
        .map(|(r, t)| check_rt(r, t, k, p1, p2, inliers))
        .collect();
    // Stable sort: ties keep the decomposition order.
    hypotheses.sort_by(|a, b| b.num_good.cmp(&a.num_good));
    let second_best_good = hypotheses.get(1).map_or(0, |h| h.num_good);
    let best = hypotheses.into_iter().next()?;

    let clear_winner = (second_best_good as f64) < 0.75 * best.num_good as f64;
    if clear_winner
        && best.parallax_deg >= params.min_parallax_deg
        && best.num_good > params.min_triangulated
        && best.num_good as f64 > 0.9 * n as f64
    {
        Some(best)
    } else {
        debug!(
            "[Initializer] H rejected: best {} second {} parallax {:.2}",
            best.num_good, second_best_good, best.parallax_deg
        );
        None
    }
}
