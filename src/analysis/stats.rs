//! Numerical primitives behind the hypothesis tests.
//!
//! Every function returns `None` instead of a degenerate number: empty input,
//! zero variance, or a singular system.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, StudentsT};

pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}

pub fn sorted(xs: &[f64]) -> Vec<f64> {
    let mut v = xs.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

pub fn median(xs: &[f64]) -> Option<f64> {
    quantile(&sorted(xs), 0.5)
}

/// Linear-interpolated quantile of an already sorted slice.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Sample variance (n − 1 denominator).
pub fn variance(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs)?;
    Some(xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (xs.len() - 1) as f64)
}

pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationTest {
    pub r: f64,
    pub t: f64,
    pub p_value: f64,
    pub n: usize,
}

fn two_sided_t_p(t: f64, df: f64) -> Option<f64> {
    if !t.is_finite() {
        return Some(0.0);
    }
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

/// Pearson r with a two-sided t-based p-value. With a 0/1 `y` this is the
/// point-biserial correlation.
pub fn correlation_test(x: &[f64], y: &[f64]) -> Option<CorrelationTest> {
    let r = pearson(x, y)?;
    let n = x.len();
    if n < 3 {
        return None;
    }
    let df = (n - 2) as f64;
    let denom = 1.0 - r * r;
    let t = if denom <= 0.0 {
        f64::INFINITY.copysign(r)
    } else {
        r * (df / denom).sqrt()
    };
    Some(CorrelationTest {
        r,
        t,
        p_value: two_sided_t_p(t, df)?,
        n,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WelchTest {
    pub t: f64,
    pub df: f64,
    pub p_value: f64,
    pub cohens_d: f64,
    pub mean_a: f64,
    pub mean_b: f64,
}

/// Welch's two-sample t-test, with Cohen's d on the pooled deviation.
pub fn welch_t(a: &[f64], b: &[f64]) -> Option<WelchTest> {
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (ma, mb) = (mean(a)?, mean(b)?);
    let (va, vb) = (variance(a)?, variance(b)?);
    let se2 = va / na + vb / nb;
    if se2 <= 0.0 {
        return None;
    }
    let t = (ma - mb) / se2.sqrt();
    let df = se2 * se2 / ((va / na).powi(2) / (na - 1.0) + (vb / nb).powi(2) / (nb - 1.0));
    let pooled = (((na - 1.0) * va + (nb - 1.0) * vb) / (na + nb - 2.0)).sqrt();
    let cohens_d = if pooled > 0.0 { (ma - mb) / pooled } else { 0.0 };
    Some(WelchTest {
        t,
        df,
        p_value: two_sided_t_p(t, df)?,
        cohens_d,
        mean_a: ma,
        mean_b: mb,
    })
}

/// 2×2 table: rows are exposed / unexposed, columns are event / no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contingency {
    pub exposed_event: u64,
    pub exposed_none: u64,
    pub unexposed_event: u64,
    pub unexposed_none: u64,
}

impl Contingency {
    pub fn add(&mut self, exposed: bool, event: bool) {
        match (exposed, event) {
            (true, true) => self.exposed_event += 1,
            (true, false) => self.exposed_none += 1,
            (false, true) => self.unexposed_event += 1,
            (false, false) => self.unexposed_none += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.exposed_event + self.exposed_none + self.unexposed_event + self.unexposed_none
    }

    pub fn exposed_rate(&self) -> Option<f64> {
        rate(self.exposed_event, self.exposed_event + self.exposed_none)
    }

    pub fn unexposed_rate(&self) -> Option<f64> {
        rate(self.unexposed_event, self.unexposed_event + self.unexposed_none)
    }

    pub fn relative_risk(&self) -> Option<f64> {
        let e = self.exposed_rate()?;
        let u = self.unexposed_rate()?;
        (u > 0.0).then(|| e / u)
    }
}

fn rate(hits: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| hits as f64 / total as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub p_value: f64,
}

/// Pearson chi-square on a 2×2 table, one degree of freedom.
pub fn chi_square_2x2(t: &Contingency) -> Option<ChiSquareTest> {
    let n = t.total() as f64;
    let cells = [
        [t.exposed_event as f64, t.exposed_none as f64],
        [t.unexposed_event as f64, t.unexposed_none as f64],
    ];
    let rows = [cells[0][0] + cells[0][1], cells[1][0] + cells[1][1]];
    let cols = [cells[0][0] + cells[1][0], cells[0][1] + cells[1][1]];
    if n == 0.0 || rows.contains(&0.0) || cols.contains(&0.0) {
        return None;
    }
    let mut statistic = 0.0;
    for i in 0..2 {
        for j in 0..2 {
            let expected = rows[i] * cols[j] / n;
            statistic += (cells[i][j] - expected).powi(2) / expected;
        }
    }
    let dist = ChiSquared::new(1.0).ok()?;
    Some(ChiSquareTest {
        statistic,
        p_value: (1.0 - dist.cdf(statistic)).clamp(0.0, 1.0),
    })
}

/// Average ranks (1-based), ties share their mean rank.
pub fn ranks(xs: &[f64]) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..xs.len()).collect();
    idx.sort_by(|&a, &b| xs[a].total_cmp(&xs[b]));
    let mut out = vec![0.0; xs.len()];
    let mut i = 0;
    while i < idx.len() {
        let mut j = i;
        while j + 1 < idx.len() && xs[idx[j + 1]] == xs[idx[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &idx[i..=j] {
            out[k] = avg;
        }
        i = j + 1;
    }
    out
}

pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() {
        return None;
    }
    pearson(&ranks(x), &ranks(y))
}

/// Least-squares slope of `y` against `x`.
pub fn linear_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let sxx: f64 = x.iter().map(|a| (a - mx) * (a - mx)).sum();
    if sxx <= 0.0 {
        return None;
    }
    let sxy: f64 = x.iter().zip(y.iter()).map(|(a, b)| (a - mx) * (b - my)).sum();
    Some(sxy / sxx)
}

// ---------------------------------------------------------------------
//  Logistic regression
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    /// Intercept first, then one coefficient per feature.
    pub coefficients: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl LogisticModel {
    pub fn predict(&self, features: &[f64]) -> f64 {
        let z = self.coefficients[0]
            + self.coefficients[1..]
                .iter()
                .zip(features.iter())
                .map(|(b, x)| b * x)
                .sum::<f64>();
        sigmoid(z)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

const LOGISTIC_RIDGE: f64 = 1e-6;

/// Fit by iteratively reweighted least squares. A small ridge keeps the
/// Hessian positive definite; it is escalated if Cholesky still fails.
pub fn logistic_fit(rows: &[Vec<f64>], labels: &[bool], max_iters: usize) -> Option<LogisticModel> {
    let n = rows.len();
    if n == 0 || n != labels.len() {
        return None;
    }
    let p = rows[0].len() + 1;
    if rows.iter().any(|r| r.len() + 1 != p) {
        return None;
    }
    let x = DMatrix::<f64>::from_fn(n, p, |i, j| if j == 0 { 1.0 } else { rows[i][j - 1] });
    let y = DVector::<f64>::from_fn(n, |i, _| if labels[i] { 1.0 } else { 0.0 });

    let mut beta = DVector::<f64>::zeros(p);
    let mut iterations = 0;
    let mut converged = false;
    for it in 0..max_iters {
        iterations = it + 1;
        let eta = &x * &beta;
        let mu = eta.map(sigmoid);
        let w = mu.map(|m| (m * (1.0 - m)).max(1e-10));
        let grad = x.transpose() * (&y - &mu);

        let mut hessian = DMatrix::<f64>::zeros(p, p);
        for i in 0..n {
            let row = x.row(i);
            hessian += row.transpose() * row * w[i];
        }

        let mut step = None;
        let mut ridge = LOGISTIC_RIDGE;
        for _ in 0..5 {
            let mut h = hessian.clone();
            for d in 0..p {
                h[(d, d)] += ridge;
            }
            if let Some(c) = Cholesky::new(h) {
                step = Some(c.solve(&grad));
                break;
            }
            ridge *= 10.0;
        }
        let step = step?;
        beta += &step;
        if step.amax() < 1e-8 {
            converged = true;
            break;
        }
    }
    if beta.iter().any(|b| !b.is_finite()) {
        return None;
    }
    Some(LogisticModel {
        coefficients: beta.iter().copied().collect(),
        iterations,
        converged,
    })
}

/// ROC-AUC from the Mann–Whitney rank sum. `None` without both classes.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    if scores.len() != labels.len() {
        return None;
    }
    let pos = labels.iter().filter(|&&l| l).count();
    let neg = labels.len() - pos;
    if pos == 0 || neg == 0 {
        return None;
    }
    let r = ranks(scores);
    let rank_sum: f64 = r
        .iter()
        .zip(labels.iter())
        .filter(|(_, l)| **l)
        .map(|(r, _)| r)
        .sum();
    let u = rank_sum - (pos * (pos + 1)) as f64 / 2.0;
    Some(u / (pos * neg) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_interpolates() {
        let v = sorted(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(quantile(&v, 0.0), Some(1.0));
        assert_eq!(quantile(&v, 1.0), Some(4.0));
        assert!((quantile(&v, 0.5).unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn zero_variance_has_no_correlation() {
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
    }

    #[test]
    fn strong_correlation_is_significant() {
        let x: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + (v * 1.7).sin()).collect();
        let t = correlation_test(&x, &y).unwrap();
        assert!(t.r > 0.95);
        assert!(t.p_value < 1e-6);
    }

    #[test]
    fn ties_share_ranks() {
        assert_eq!(ranks(&[10.0, 20.0, 10.0]), vec![1.5, 3.0, 1.5]);
    }

    #[test]
    fn perfect_separation_has_unit_auc() {
        let scores = [0.1, 0.2, 0.8, 0.9];
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&scores, &labels), Some(1.0));
    }

    #[test]
    fn chi_square_detects_association() {
        let t = Contingency {
            exposed_event: 40,
            exposed_none: 10,
            unexposed_event: 10,
            unexposed_none: 40,
        };
        let c = chi_square_2x2(&t).unwrap();
        assert!(c.statistic > 30.0);
        assert!(c.p_value < 1e-6);
        assert!((t.relative_risk().unwrap() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn logistic_recovers_positive_slope() {
        let rows: Vec<Vec<f64>> = (0..200).map(|i| vec![(i % 20) as f64 / 20.0]).collect();
        // label is 1 mostly for large x, with some overlap
        let labels: Vec<bool> = (0..200)
            .map(|i| {
                let x = (i % 20) as f64 / 20.0;
                x > 0.5 || (i % 7 == 0)
            })
            .collect();
        let model = logistic_fit(&rows, &labels, 50).unwrap();
        assert!(model.coefficients[1] > 0.0);
        assert!(model.predict(&[0.9]) > model.predict(&[0.1]));
    }
}
