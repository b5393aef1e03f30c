//! Robust estimation: weight functions, the reweighting step and the full
//! IRLS loop on a network with one gross error.
//!
//! The network is the braced two-point intersection used elsewhere
//! (A, B, C fixed; P, Q new; m = 10, n = 4).  All observations are exact
//! except d(A→P), which carries a +0.20 m blunder against σ = 0.01 m.

use approx::assert_relative_eq;
use survnet::equations::evaluate;
use survnet::prelude::*;
use survnet::robust::{reweight, PassStatistics};
use survnet::stats::erfc;
use survnet::types::MIN_WEIGHT_FACTOR;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

const DIST: ObservationKind = ObservationKind::HorizontalDistance;
const ANGLE: ObservationKind = ObservationKind::HorizontalAngle;
const BLUNDER: f64 = 0.20;

fn truth() -> Vec<Station> {
    vec![
        Station::fixed("A", [0.0, 0.0, 0.0]),
        Station::fixed("B", [600.0, 0.0, 0.0]),
        Station::fixed("C", [300.0, 500.0, 0.0]),
        Station::new("P", [250.0, 200.0, 0.0]),
        Station::new("Q", [380.0, 180.0, 0.0]),
    ]
}

fn measured(truth: &[Station], id: &str, kind: ObservationKind, refs: &[&str]) -> Observation {
    let pts: Vec<[f64; 3]> = refs
        .iter()
        .map(|r| truth.iter().find(|s| s.id == *r).map(|s| s.point).unwrap())
        .collect();
    let value = evaluate(id, kind, &pts, 0.0).unwrap().value;
    Observation::new(id, kind, refs, value)
}

fn blundered_network(config: &AdjustmentConfig) -> Network {
    blundered_network_with_noise(config, &[])
}

fn blundered_network_with_noise(config: &AdjustmentConfig, noise: &[(&str, f64)]) -> Network {
    let t = truth();
    let mut obs = vec![
        measured(&t, "dAP", DIST, &["A", "P"]),
        measured(&t, "dBP", DIST, &["B", "P"]),
        measured(&t, "dCP", DIST, &["C", "P"]),
        measured(&t, "dAQ", DIST, &["A", "Q"]),
        measured(&t, "dBQ", DIST, &["B", "Q"]),
        measured(&t, "dCQ", DIST, &["C", "Q"]),
        measured(&t, "dPQ", DIST, &["P", "Q"]),
        measured(&t, "aP", ANGLE, &["P", "A", "Q"]),
        measured(&t, "aQ", ANGLE, &["Q", "P", "B"]),
        measured(&t, "aA", ANGLE, &["A", "B", "P"]),
    ];
    obs[0].value += BLUNDER;
    for (id, e) in noise {
        let o = obs.iter_mut().find(|o| o.id == *id).unwrap();
        o.value += e;
    }

    let mut start = t;
    start[3].point = [250.3, 199.8, 0.0];
    start[4].point = [379.6, 180.4, 0.0];
    Network::new(Dimension::Planar, start, obs, config).unwrap()
}

fn all_methods() -> Vec<WeightFunction> {
    vec![
        WeightFunction::huber(),
        WeightFunction::danish(),
        WeightFunction::slope(),
        WeightFunction::hampel(),
        WeightFunction::tukey(),
        WeightFunction::epanechnikov(),
        WeightFunction::cauchy(),
        WeightFunction::exponential(),
        WeightFunction::andrews(),
        WeightFunction::wave(),
        WeightFunction::half_wave(),
        WeightFunction::wigner(),
        WeightFunction::trim(),
        WeightFunction::jacobi(),
        WeightFunction::cra(),
        WeightFunction::error_func(),
        WeightFunction::t(),
        WeightFunction::chain_bell(),
        WeightFunction::chain(),
        WeightFunction::ellipse_curve(),
    ]
}

fn noise() -> Vec<(&'static str, f64)> {
    vec![
        ("dAP", 0.004),
        ("dBP", -0.003),
        ("dCP", 0.002),
        ("dAQ", -0.005),
        ("dBQ", 0.001),
        ("dCQ", 0.003),
        ("dPQ", -0.002),
        ("aP", 2e-5),
        ("aQ", -1.5e-5),
        ("aA", 1e-5),
    ]
}

// ─────────────────────────────────────────────────────────────
//  Weight functions
// ─────────────────────────────────────────────────────────────

#[test]
fn weight_functions_are_bounded_symmetric_and_non_increasing() {
    for method in all_methods() {
        method.validate().unwrap();
        assert_eq!(method.weight(0.0), 1.0, "{method:?} at zero");

        let mut previous = 1.0;
        for k in 0..=200 {
            let w = k as f64 * 0.05;
            let f = method.weight(w);
            assert!((MIN_WEIGHT_FACTOR..=1.0).contains(&f), "{method:?}({w}) = {f}");
            assert_eq!(f, method.weight(-w), "{method:?} not symmetric at {w}");
            assert!(f <= previous + 1e-12, "{method:?} increases at {w}");
            previous = f;
        }
    }
}

#[test]
fn huber_and_danish_follow_their_definitions() {
    let huber = WeightFunction::huber();
    assert_eq!(huber, WeightFunction::default());
    assert_eq!(huber.weight(1.5), 1.0);
    assert_relative_eq!(huber.weight(3.0), 0.5, epsilon = 1e-15);

    let danish = WeightFunction::danish();
    assert_eq!(danish.weight(2.5), 1.0);
    assert_relative_eq!(danish.weight(5.0), (-4.0_f64).exp(), epsilon = 1e-15);

    // redescending functions reject far outliers completely
    assert_eq!(WeightFunction::tukey().weight(10.0), MIN_WEIGHT_FACTOR);
    assert_eq!(WeightFunction::trim().weight(2.6), MIN_WEIGHT_FACTOR);
    assert_relative_eq!(WeightFunction::tukey().weight(4.685 / 2.0), 0.5625, epsilon = 1e-12);
}

#[test]
fn bell_shaped_functions_follow_their_definitions() {
    let e = std::f64::consts::E;

    // (1 − x²)ⁿ with x = (w/c)ⁿ
    let jacobi = WeightFunction::Jacobi { c: 4.0, n: 1.0 };
    assert_relative_eq!(jacobi.weight(2.0), 0.75, epsilon = 1e-15);
    assert_eq!(jacobi.weight(4.5), MIN_WEIGHT_FACTOR);

    assert_relative_eq!(WeightFunction::error_func().weight(1.414), erfc(1.0), epsilon = 1e-12);
    assert_relative_eq!(WeightFunction::chain_bell().weight(1.0), 1.0 / (e / 2.0).cosh(), epsilon = 1e-15);
    assert_relative_eq!(WeightFunction::chain().weight(0.5), 2.0 - (e / 4.0).cosh(), epsilon = 1e-15);

    // two quarter ellipses meeting at one half
    let ellipse = WeightFunction::ellipse_curve();
    assert_relative_eq!(ellipse.weight(2.5), 0.5, epsilon = 1e-15);
    assert_relative_eq!(ellipse.weight(1.5), (1.0 + 0.8) / 2.0, epsilon = 1e-12);
    assert_relative_eq!(ellipse.weight(3.5), (1.0 - 0.8) / 2.0, epsilon = 1e-12);
    assert_eq!(ellipse.weight(5.0), MIN_WEIGHT_FACTOR);
}

#[test]
fn cra_and_t_take_their_scale_from_the_pass() {
    let stats = PassStatistics { variance_factor: 4.0, degrees_of_freedom: 3 };

    // exp(−|w|ⁿ / (σ̂₀²·c))
    let cra = WeightFunction::cra();
    assert_relative_eq!(cra.weight(2.0), (-2.0_f64).exp(), epsilon = 1e-15);
    assert_relative_eq!(cra.weight_with(2.0, &stats), (-0.5_f64).exp(), epsilon = 1e-15);
    assert!(cra.weight_with(2.0, &stats) > cra.weight(2.0));

    // (1 + |w|ⁿ / (c·k))^(−(k+1)/2) with k the degrees of freedom
    let t = WeightFunction::t();
    assert_relative_eq!(t.weight(1.0), 0.5, epsilon = 1e-15);
    assert_relative_eq!(t.weight_with(3.0, &stats), 0.0625, epsilon = 1e-15);

    // no degrees of freedom: fall back to k = 1
    let empty = PassStatistics { variance_factor: 1.0, degrees_of_freedom: 0 };
    assert_eq!(t.weight_with(1.0, &empty), t.weight(1.0));
}

#[test]
fn invalid_tuning_constants_are_rejected() {
    assert!(WeightFunction::Huber { c: -1.0 }.validate().is_err());
    assert!(WeightFunction::Tukey { c: f64::NAN }.validate().is_err());
    assert!(WeightFunction::Hampel { a: 3.0, b: 2.0, c: 8.0 }.validate().is_err());
    assert!(WeightFunction::Slope { c: 2.0, a: 0.0 }.validate().is_err());
    assert!(WeightFunction::Jacobi { c: 4.687, n: 0.0 }.validate().is_err());
    assert!(WeightFunction::T { c: -1.0, n: 2.0 }.validate().is_err());
    assert!(WeightFunction::EllipseCurve { c: f64::INFINITY }.validate().is_err());

    let mut config = AdjustmentConfig::robust(WeightFunction::Huber { c: 0.0 });
    assert!(matches!(config.validate(), Err(AdjustmentError::InvalidConfig(_))));
    config.robust.method = WeightFunction::huber();
    config.robust.max_passes = 0;
    assert!(config.validate().is_err());
}

#[test]
fn weight_function_serde_uses_method_tag() {
    let json = serde_json::to_string(&WeightFunction::Hampel { a: 1.0, b: 2.0, c: 4.0 }).unwrap();
    assert!(json.contains(r#""method":"hampel""#), "{json}");
    let back: WeightFunction = serde_json::from_str(r#"{"method":"half_wave","c":3.0}"#).unwrap();
    assert_eq!(back, WeightFunction::HalfWave { c: 3.0 });

    let json = serde_json::to_string(&WeightFunction::chain_bell()).unwrap();
    assert!(json.contains(r#""method":"chain_bell""#), "{json}");
    let back: WeightFunction = serde_json::from_str(r#"{"method":"t","c":1.0,"n":2.0}"#).unwrap();
    assert_eq!(back, WeightFunction::t());
    let back: WeightFunction = serde_json::from_str(r#"{"method":"ellipse_curve","c":2.5}"#).unwrap();
    assert_eq!(back, WeightFunction::ellipse_curve());
}

// ─────────────────────────────────────────────────────────────
//  Reweighting step
// ─────────────────────────────────────────────────────────────

#[test]
fn reweight_standardizes_with_a_priori_weight_and_redundancy() {
    // p⁰ = 1e4 (σ = 1 cm), r = 0.5  →  w = v·100/√0.5
    let a_priori = [1e4, 1e4, 1e4];
    let current = [1e4, 1e4, 1e4];
    let cofactors = [0.5e-4, 0.5e-4, 0.0];
    let residuals = [0.001, 0.05, 0.3];

    let config = AdjustmentConfig::robust(WeightFunction::huber());
    let (factors, standardized) =
        reweight(&residuals, &a_priori, &current, &cofactors, &config, &PassStatistics::default());

    let w0 = 0.001 * 100.0 / 0.5_f64.sqrt();
    let w1 = 0.05 * 100.0 / 0.5_f64.sqrt();
    assert_relative_eq!(standardized[0].unwrap(), w0, max_relative = 1e-12);
    assert_relative_eq!(standardized[1].unwrap(), w1, max_relative = 1e-12);
    assert_eq!(factors[0], 1.0);
    assert_relative_eq!(factors[1], 1.5 / w1, max_relative = 1e-12);

    // zero redundancy: uncontrolled, left alone
    assert!(standardized[2].is_none());
    assert_eq!(factors[2], 1.0);
}

#[test]
fn reweight_divides_by_the_a_priori_sigma() {
    // σ₀² = 4 halves every standardized residual
    let config = AdjustmentConfig { a_priori_variance: 4.0, ..AdjustmentConfig::robust(WeightFunction::huber()) };
    let (_, standardized) =
        reweight(&[0.05], &[1e4], &[1e4], &[0.5e-4], &config, &PassStatistics::default());
    assert_relative_eq!(standardized[0].unwrap(), 0.05 * 100.0 / (2.0 * 0.5_f64.sqrt()), max_relative = 1e-12);
}

#[test]
fn reweight_uses_redundancy_under_the_current_weights() {
    // a down-weighted observation: p = p⁰/100 and q_vv ≈ 1/p give r ≈ 1
    let config = AdjustmentConfig::robust(WeightFunction::huber());
    let (_, standardized) =
        reweight(&[0.2], &[1e4], &[1e2], &[0.99e-2], &config, &PassStatistics::default());
    assert_relative_eq!(standardized[0].unwrap(), 0.2 * 100.0 / 0.99_f64.sqrt(), max_relative = 1e-12);
}

// ─────────────────────────────────────────────────────────────
//  Full IRLS loop
// ─────────────────────────────────────────────────────────────

#[test]
fn danish_isolates_the_blunder() {
    let config = AdjustmentConfig::robust(WeightFunction::danish());
    let mut net = blundered_network(&config);
    let result = adjust(&mut net, &config).unwrap();

    let robust = result.robust.as_ref().unwrap();
    assert!(robust.converged, "passes = {}, change = {}", robust.passes, robust.max_weight_change);
    assert!(robust.passes >= 2);
    assert_eq!(robust.factors.len(), 10);

    let q = &result.quality;
    let blunder = q.observation("dAP").unwrap();
    assert!(blunder.robust_factor < 1e-3, "factor {}", blunder.robust_factor);
    for o in q.observations.iter().filter(|o| o.id != "dAP") {
        assert!(o.robust_factor > 0.99, "{}: factor {}", o.id, o.robust_factor);
    }

    // with the blunder switched off the rest fits the truth and the blunder
    // shows up at full size in its residual
    let p = net.station("P").unwrap().point;
    assert!((p[0] - 250.0).abs() < 1e-3 && (p[1] - 200.0).abs() < 1e-3, "P = {p:?}");
    assert_relative_eq!(blunder.residual, -BLUNDER, epsilon = 5e-3);
    assert!(!result.has_warnings(), "{:?}", result.warnings);
}

#[test]
fn rejected_blunder_stays_flagged_in_the_quality_report() {
    let config = AdjustmentConfig::robust(WeightFunction::danish());
    let mut net = blundered_network_with_noise(&config, &noise());
    let result = adjust(&mut net, &config).unwrap();

    let robust = result.robust.as_ref().unwrap();
    let q = &result.quality;
    let blunder = q.observation("dAP").unwrap();
    assert!(blunder.robust_factor < 1e-3, "factor {}", blunder.robust_factor);

    // standardized against p⁰, not the down-weighted p
    let w = blunder.standardized_residual.unwrap();
    assert!(w.abs() > 10.0, "standardized residual {w}");
    assert_relative_eq!(w, robust.standardized_residuals[0].unwrap(), max_relative = 1e-9);

    assert!(blunder.local_test.outlier);
    let worst = q
        .observations
        .iter()
        .max_by(|a, b| {
            let ta = a.local_test.tau.unwrap_or(0.0).abs();
            let tb = b.local_test.tau.unwrap_or(0.0).abs();
            ta.total_cmp(&tb)
        })
        .unwrap();
    assert_eq!(worst.id, "dAP");
    assert!(q.outliers().any(|o| o.id == "dAP"));
}

#[test]
fn huber_downweights_the_blunder_most() {
    let config = AdjustmentConfig::robust(WeightFunction::huber());
    let mut net = blundered_network(&config);
    let result = adjust(&mut net, &config).unwrap();

    let robust = result.robust.as_ref().unwrap();
    let (min_pos, min_factor) = robust
        .factors
        .iter()
        .copied()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap();
    assert_eq!(net.observations()[min_pos].id, "dAP");
    assert!(min_factor < 0.5, "factor {min_factor}");
    assert_eq!(result.mode, AdjustmentMode::Robust);
}

#[test]
fn pass_cap_reports_robust_non_convergence() {
    let mut config = AdjustmentConfig::robust(WeightFunction::danish());
    config.robust.max_passes = 1;
    let mut net = blundered_network(&config);
    let result = adjust(&mut net, &config).unwrap();

    let robust = result.robust.as_ref().unwrap();
    assert_eq!(robust.passes, 1);
    assert!(!robust.converged);
    // the single pass ran with unit factors
    assert!(robust.factors.iter().all(|&f| f == 1.0));
    assert!(result
        .warnings
        .iter()
        .any(|w| matches!(w, AdjustmentWarning::RobustNonConvergence { passes: 1, .. })));
}

// ─────────────────────────────────────────────────────────────
//  Non-robust modes
// ─────────────────────────────────────────────────────────────

#[test]
fn weighted_mode_flags_the_blunder_with_largest_tau() {
    let config = AdjustmentConfig::default();
    let mut net = blundered_network(&config);
    let result = adjust(&mut net, &config).unwrap();

    assert!(result.robust.is_none());
    let q = &result.quality;
    assert!(q.observations.iter().all(|o| o.robust_factor == 1.0));

    let worst = q
        .observations
        .iter()
        .max_by(|a, b| {
            let ta = a.local_test.tau.unwrap_or(0.0).abs();
            let tb = b.local_test.tau.unwrap_or(0.0).abs();
            ta.total_cmp(&tb)
        })
        .unwrap();
    assert_eq!(worst.id, "dAP");
    assert!(worst.local_test.outlier);

    // a single blunder in otherwise exact data gives |τ| = √f
    let tau = worst.local_test.tau.unwrap().abs();
    assert_relative_eq!(tau, 6.0_f64.sqrt(), max_relative = 1e-2);
    assert!(worst.local_test.critical.unwrap() < tau);

    // and the model as a whole is rejected
    assert!(!q.global_test.as_ref().unwrap().passed);
    assert!(q.outliers().any(|o| o.id == "dAP"));
}
