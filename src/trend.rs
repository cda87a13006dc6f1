//! Least-squares trend fitting over the archived duration series, plus the
//! summary statistics recorded with every sample.
//!
//! The exponential fit is a linear fit over `ln(y)` and stays in log space:
//! its slope is the per-record growth exponent, not a milliseconds rate.

/// Margin the exponential fit must clear before a series is reported as
/// exponential. Inside the margin the simpler model wins.
const R2_MARGIN: f64 = 0.02;

/// Slopes with magnitude below this read as flat.
const FLAT_SLOPE: f64 = 1e-6;

// ─── Fits ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitKind {
    Linear,
    Exponential,
}

impl FitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FitKind::Linear => "linear",
            FitKind::Exponential => "exponential",
        }
    }
}

/// One fitted model over the series as of some poll.
#[derive(Debug, Clone)]
pub struct Fit {
    pub kind: FitKind,
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    /// Points the fit actually used; the exponential fit drops y <= 0.
    pub n: usize,
}

/// Ordinary least squares for `y ~ slope * x + intercept`. Needs two
/// points and at least two distinct x values.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<Fit> {
    debug_assert_eq!(xs.len(), ys.len());
    let n = xs.len();
    if n < 2 {
        return None;
    }

    let nf = n as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xy: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();

    let denom = nf * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return None;
    }

    let slope = (nf * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / nf;

    let mean_y = sum_y / nf;
    let ss_res: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| {
            let e = y - (slope * x + intercept);
            e * e
        })
        .sum();
    let ss_tot: f64 = ys
        .iter()
        .map(|y| {
            let d = y - mean_y;
            d * d
        })
        .sum();
    // A constant series has no variance to explain; report 0, not NaN.
    let r_squared = if ss_tot != 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    Some(Fit {
        kind: FitKind::Linear,
        slope,
        intercept,
        r_squared,
        n,
    })
}

/// Log-linearized exponential: OLS over `(x, ln y)` for the strictly
/// positive y values. Slope, intercept and R-squared are all log-space.
pub fn exponential_fit(xs: &[f64], ys: &[f64]) -> Option<Fit> {
    let mut lx = Vec::with_capacity(xs.len());
    let mut ly = Vec::with_capacity(ys.len());
    for (x, y) in xs.iter().zip(ys) {
        if *y > 0.0 {
            lx.push(*x);
            ly.push(y.ln());
        }
    }
    if lx.len() < 2 {
        return None;
    }
    linear_fit(&lx, &ly).map(|fit| Fit {
        kind: FitKind::Exponential,
        ..fit
    })
}

/// Both fits over a duration series, x running 1..=N in arrival order.
pub fn fit_series(series: &[f64]) -> (Option<Fit>, Option<Fit>) {
    let xs: Vec<f64> = (1..=series.len()).map(|i| i as f64).collect();
    (linear_fit(&xs, series), exponential_fit(&xs, series))
}

// ─── Classification ──────────────────────────────────────────────

/// Reported shape of a series, chosen from the newest fit of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    InsufficientData,
    RoughlyConstant,
    LinearIncreasing,
    LinearDecreasing,
    ExponentialIncreasing,
    ExponentialDecreasing,
}

impl Trend {
    pub fn describe(self) -> &'static str {
        match self {
            Trend::InsufficientData => "insufficient data",
            Trend::RoughlyConstant => "roughly constant",
            Trend::LinearIncreasing => "linear (increasing)",
            Trend::LinearDecreasing => "linear (decreasing)",
            Trend::ExponentialIncreasing => "exponential (increasing)",
            Trend::ExponentialDecreasing => "exponential (decreasing)",
        }
    }
}

/// Model selection over `(slope, r_squared)` pairs. Linear wins unless the
/// exponential fit is better by more than the margin; a winning flat
/// linear slope reads as roughly constant.
pub fn classify(linear: Option<(f64, f64)>, exponential: Option<(f64, f64)>) -> Trend {
    if let Some((slope, lin_r2)) = linear {
        let exp_wins = matches!(exponential, Some((_, exp_r2)) if exp_r2 - lin_r2 > R2_MARGIN);
        if !exp_wins {
            return if slope.abs() < FLAT_SLOPE {
                Trend::RoughlyConstant
            } else if slope > 0.0 {
                Trend::LinearIncreasing
            } else {
                Trend::LinearDecreasing
            };
        }
    }
    match exponential {
        Some((slope, _)) if slope > 0.0 => Trend::ExponentialIncreasing,
        Some(_) => Trend::ExponentialDecreasing,
        None => Trend::InsufficientData,
    }
}

// ─── Per-batch summary ───────────────────────────────────────────

/// Statistics recorded with each sample. All fields are `None` when the
/// tick observed no usable durations, so absent data never reads as a
/// zero-millisecond pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationSummary {
    pub count: usize,
    pub mean_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
}

pub fn summarize(durations: &[f64]) -> DurationSummary {
    if durations.is_empty() {
        return DurationSummary::default();
    }
    let mut sorted = durations.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    DurationSummary {
        count: durations.len(),
        mean_ms: Some(mean),
        p50_ms: Some(percentile(&sorted, 50.0)),
        p95_ms: Some(percentile(&sorted, 95.0)),
    }
}

/// Percentile by linear interpolation between closest ranks: the value at
/// rank `p/100 * (n-1)`, interpolated between the surrounding order
/// statistics. `sorted` must be non-empty and ascending.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}
