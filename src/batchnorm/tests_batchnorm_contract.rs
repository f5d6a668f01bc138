// =========================================================================
// FALSIFY-BN: batchnorm-kernel-v1.yaml contract (normalizar BatchNorm1d)
//
// Each test tries to falsify one mathematical invariant of the layer:
// standardization, denominator safety, the running-statistics update
// (including the biased/unbiased estimator split), and the backward
// pass against centered finite differences.
//
// References:
//   - provable-contracts/contracts/batchnorm-kernel-v1.yaml
//   - Ioffe & Szegedy (2015) "Batch Normalization"
// =========================================================================

use super::*;

fn matrix(rows: usize, cols: usize, data: &[f32]) -> Matrix<f32> {
    Matrix::from_vec(rows, cols, data.to_vec()).expect("data length matches rows * cols")
}

fn plain_layer(num_features: usize) -> BatchNorm1d {
    BatchNormConfig::new(num_features)
        .with_affine(false)
        .build()
        .expect("valid configuration")
}

/// FALSIFY-BN-001: Training standardization — per-channel mean ≈ 0, var ≈ 1
///
/// Without affine parameters, each channel of the training-mode output
/// has batch mean ≈ 0 and batch variance ≈ 1.
#[test]
fn falsify_bn_001_training_standardization() {
    let mut norm = plain_layer(3);
    let x = matrix(
        4,
        3,
        &[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0,
        ],
    );
    let y = norm.forward(x).expect("batch matches layer width");

    for c in 0..3 {
        let col = y.column(c);
        let mean = col.mean();
        let var: f32 = col
            .as_slice()
            .iter()
            .map(|&v| (v - mean).powi(2))
            .sum::<f32>()
            / 4.0;
        assert!(
            mean.abs() < 1e-4,
            "FALSIFIED BN-001: channel {c} mean = {mean}, expected ≈ 0"
        );
        assert!(
            (var - 1.0).abs() < 1e-2,
            "FALSIFIED BN-001: channel {c} var = {var}, expected ≈ 1"
        );
    }
}

/// FALSIFY-BN-002: Denominator safety — no NaN/Inf for constant channel
///
/// When all values in a channel are equal (zero variance), eps prevents
/// division by zero.
#[test]
fn falsify_bn_002_denominator_safety() {
    let mut norm = plain_layer(2);
    // Channel 0: all 5.0 (zero variance), Channel 1: varying
    let x = matrix(4, 2, &[5.0, 1.0, 5.0, 2.0, 5.0, 3.0, 5.0, 4.0]);
    let y = norm.forward(x).expect("batch matches layer width");

    for (i, &val) in y.as_slice().iter().enumerate() {
        assert!(
            val.is_finite(),
            "FALSIFIED BN-002: output[{i}] = {val} (NaN/Inf for constant channel)"
        );
    }
}

/// FALSIFY-BN-003: Known two-sample batch — exact statistics
///
/// Batch [[1,2,3],[3,2,1]] with momentum 0.1: channel means are all 2,
/// the normalized output is [[-1,0,1],[1,0,-1]] up to the eps-adjusted
/// scale, running_mean moves to 0.2 per channel, and running_var moves
/// to 1.1 / 0.9 / 1.1 (the update uses the unbiased estimate).
#[test]
fn falsify_bn_003_known_batch_statistics() {
    let mut norm = plain_layer(3);
    let x = matrix(2, 3, &[1.0, 2.0, 3.0, 3.0, 2.0, 1.0]);
    let y = norm.forward(x).expect("batch matches layer width");

    let saved_mean = norm.saved_mean().expect("training forward saves stats");
    for c in 0..3 {
        assert!(
            (saved_mean.get(c) - 2.0).abs() < 1e-6,
            "FALSIFIED BN-003: channel {c} batch mean = {}, expected 2",
            saved_mean.get(c)
        );
    }

    let expected = [-1.0, 0.0, 1.0, 1.0, 0.0, -1.0];
    for (i, &e) in expected.iter().enumerate() {
        assert!(
            (y.as_slice()[i] - e).abs() < 1e-3,
            "FALSIFIED BN-003: output[{i}] = {}, expected ≈ {e}",
            y.as_slice()[i]
        );
    }

    for c in 0..3 {
        assert!(
            (norm.running_mean().get(c) - 0.2).abs() < 1e-6,
            "FALSIFIED BN-003: running_mean[{c}] = {}, expected 0.2",
            norm.running_mean().get(c)
        );
    }
    let expected_var = [1.1, 0.9, 1.1];
    for (c, &e) in expected_var.iter().enumerate() {
        assert!(
            (norm.running_var().get(c) - e).abs() < 1e-5,
            "FALSIFIED BN-003: running_var[{c}] = {}, expected {e}",
            norm.running_var().get(c)
        );
    }
}

/// FALSIFY-BN-004: Eval uses running stats — BN_eval(x) != BN_train(x)
///
/// After one running-stats update, eval mode must produce different
/// output than training mode on the same batch.
#[test]
fn falsify_bn_004_eval_uses_running_stats() {
    let mut norm = plain_layer(2);
    let x = matrix(4, 2, &[10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0]);
    let y_train = norm.forward(x.clone()).expect("training forward");

    norm.eval();
    let y_eval = norm.forward(x).expect("eval forward");

    let any_differ = y_train
        .as_slice()
        .iter()
        .zip(y_eval.as_slice().iter())
        .any(|(&a, &b)| (a - b).abs() > 1e-4);
    assert!(
        any_differ,
        "FALSIFIED BN-004: eval output matches training output exactly"
    );
}

/// FALSIFY-BN-005: Estimator asymmetry — biased for inv_std, unbiased for EMA
///
/// A single channel [0, 2] has biased variance 1 and unbiased variance 2.
/// The saved inverse std must come from the biased estimate while the
/// running-variance update must consume the unbiased one.
#[test]
fn falsify_bn_005_variance_estimator_asymmetry() {
    let mut norm = plain_layer(1);
    let x = matrix(2, 1, &[0.0, 2.0]);
    norm.forward(x).expect("batch matches layer width");

    let inv_std = norm
        .saved_inv_std()
        .expect("training forward saves stats")
        .get(0);
    let expected_inv_std = 1.0 / (1.0f32 + norm.eps()).sqrt();
    assert!(
        (inv_std - expected_inv_std).abs() < 1e-6,
        "FALSIFIED BN-005: saved inv_std = {inv_std}, expected {expected_inv_std} (biased variance)"
    );

    // running_var = 0.9 * 1.0 + 0.1 * 2.0 (unbiased), NOT 0.9 + 0.1 * 1.0
    let rv = norm.running_var().get(0);
    assert!(
        (rv - 1.1).abs() < 1e-6,
        "FALSIFIED BN-005: running_var = {rv}, expected 1.1 (unbiased variance)"
    );
}

/// FALSIFY-BN-006: Input gradient matches centered finite differences
///
/// The analytic gradient must account for every element's influence on
/// the batch mean and variance, not just its own normalization.
#[test]
fn falsify_bn_006_gradient_matches_finite_difference() {
    let mut norm = BatchNormConfig::new(3)
        .with_seed(9)
        .build()
        .expect("valid configuration");
    let x = matrix(
        4,
        3,
        &[
            0.5, -1.2, 2.0, 1.5, 0.3, -0.7, -0.8, 1.1, 0.4, 2.2, -0.5, 1.6,
        ],
    );
    let dy = matrix(
        4,
        3,
        &[
            0.3, -1.0, 0.8, -0.6, 0.4, 1.2, 0.9, -0.2, -1.5, 0.1, 0.7, -0.4,
        ],
    );

    norm.forward(x.clone()).expect("training forward");
    let analytic = norm.backward_input(&x, &dy).expect("analytic gradient");

    // loss(x) = sum(dy * forward(x)); perturb each element in turn
    let loss = |layer: &mut BatchNorm1d, input: &Matrix<f32>| -> f64 {
        let y = layer.forward(input.clone()).expect("forward");
        y.as_slice()
            .iter()
            .zip(dy.as_slice().iter())
            .map(|(&a, &b)| f64::from(a) * f64::from(b))
            .sum()
    };

    let h = 1e-2f32;
    for i in 0..4 {
        for j in 0..3 {
            let original = x.get(i, j);

            let mut plus = x.clone();
            plus.set(i, j, original + h);
            let mut minus = x.clone();
            minus.set(i, j, original - h);

            let numeric = (loss(&mut norm, &plus) - loss(&mut norm, &minus)) / (2.0 * f64::from(h));
            let got = f64::from(analytic.get(i, j));
            assert!(
                (got - numeric).abs() < 1e-2,
                "FALSIFIED BN-006: grad[{i}][{j}] analytic {got} vs numeric {numeric}"
            );
        }
    }
}

/// FALSIFY-BN-007: Parameter-gradient accumulation linearity
///
/// Two accumulation passes over a batch equal one pass over the batch
/// duplicated row-wise (duplication keeps the batch statistics fixed,
/// so the sums add linearly).
#[test]
fn falsify_bn_007_param_gradient_linearity() {
    let x_data = [0.0f32, 10.0, 2.0, 20.0];
    let dy_data = [1.0f32, -2.0, 0.5, 4.0];

    let x = matrix(2, 2, &x_data);
    let dy = matrix(2, 2, &dy_data);

    let doubled: Vec<f32> = x_data.iter().chain(x_data.iter()).copied().collect();
    let dy_doubled: Vec<f32> = dy_data.iter().chain(dy_data.iter()).copied().collect();
    let x2 = matrix(4, 2, &doubled);
    let dy2 = matrix(4, 2, &dy_doubled);

    let mut twice = BatchNormConfig::new(2)
        .with_seed(13)
        .build()
        .expect("valid configuration");
    twice.forward(x.clone()).expect("training forward");
    twice.backward_params(&x, &dy, 1.0).expect("first pass");
    twice.backward_params(&x, &dy, 1.0).expect("second pass");

    let mut once = BatchNormConfig::new(2)
        .with_seed(13)
        .build()
        .expect("valid configuration");
    once.forward(x2.clone()).expect("training forward");
    once.backward_params(&x2, &dy2, 1.0).expect("single pass");

    for j in 0..2 {
        let gw_twice = twice.grad_weight().expect("affine layer").get(j);
        let gw_once = once.grad_weight().expect("affine layer").get(j);
        assert!(
            (gw_twice - gw_once).abs() < 1e-4,
            "FALSIFIED BN-007: grad_weight[{j}] {gw_twice} vs {gw_once}"
        );

        let gb_twice = twice.grad_bias().expect("affine layer").get(j);
        let gb_once = once.grad_bias().expect("affine layer").get(j);
        assert!(
            (gb_twice - gb_once).abs() < 1e-4,
            "FALSIFIED BN-007: grad_bias[{j}] {gb_twice} vs {gb_once}"
        );
    }
}

/// FALSIFY-BN-008: Input gradient sums to zero per channel
///
/// The normalization subtracts the batch mean, so shifting every sample
/// equally cannot change the loss: column sums of the input gradient
/// vanish.
#[test]
fn falsify_bn_008_gradient_sum_vanishes() {
    let mut norm = plain_layer(3);
    let x = matrix(
        4,
        3,
        &[
            0.5, -1.2, 2.0, 1.5, 0.3, -0.7, -0.8, 1.1, 0.4, 2.2, -0.5, 1.6,
        ],
    );
    let dy = matrix(
        4,
        3,
        &[
            0.3, -1.0, 0.8, -0.6, 0.4, 1.2, 0.9, -0.2, -1.5, 0.1, 0.7, -0.4,
        ],
    );

    norm.forward(x.clone()).expect("training forward");
    let dx = norm.backward(&x, &dy, 1.0).expect("full backward");

    for j in 0..3 {
        let col_sum = dx.column(j).sum();
        assert!(
            col_sum.abs() < 1e-4,
            "FALSIFIED BN-008: channel {j} gradient sum = {col_sum}, expected ≈ 0"
        );
    }
}

/// FALSIFY-BN-009: Error surface — invalid construction and call order
#[test]
fn falsify_bn_009_error_surface() {
    let err = BatchNorm1d::new(0).expect_err("zero features must fail");
    assert!(
        matches!(err, NormalizarError::InvalidHyperparameter { .. }),
        "FALSIFIED BN-009: zero features produced {err}"
    );

    let mut norm = plain_layer(2);
    let x = matrix(2, 2, &[0.0, 1.0, 2.0, 3.0]);
    let dy = matrix(2, 2, &[1.0; 4]);
    let err = norm
        .backward(&x, &dy, 1.0)
        .expect_err("backward before forward must fail");
    assert!(
        matches!(err, NormalizarError::PreconditionViolation { .. }),
        "FALSIFIED BN-009: backward-before-forward produced {err}"
    );
}
