//! Finite-difference checks of the gradient and curvature sweeps.
//!
//! For a module with output `y`, upstream gradient `g` and upstream curvature
//! `h`, the sweeps must produce
//!
//! - `dx_k  = Σ_j g_j ∂y_j/∂x_k`
//! - `ddx_k = Σ_j h_j (∂y_j/∂x_k)² + Σ_j g_j ∂²y_j/∂x_k²`
//!
//! for every input and parameter element. Both are estimated here with
//! central differences of `fprop`.

use ebgraph::losses::{BconvRecCost, CrossEntropy, DistanceL2, PenaltyL1, PenaltyL2};
use ebgraph::nn::{Bias, Linear, Module, ModuleError, Multiplication};
use ebgraph::tensor::State;

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const EPSILON: f64 = 1e-4;
const TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone, Copy)]
enum Target {
    Input(usize),
    Param(usize),
}

fn random_array(rng: &mut StdRng, shape: &[usize], low: f64, high: f64) -> ArrayD<f64> {
    let len = shape.iter().product();
    let values = (0..len).map(|_| rng.gen_range(low..high)).collect();
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
}

/// Values with magnitude in `[0.5, 1.5)` and a random sign.
fn away_from_zero(rng: &mut StdRng, shape: &[usize]) -> ArrayD<f64> {
    random_array(rng, shape, 0.5, 1.5).mapv(|v| if rng.gen_bool(0.5) { v } else { -v })
}

fn random_state(rng: &mut StdRng, shape: &[usize]) -> State {
    State::from_array(random_array(rng, shape, -1.0, 1.0))
}

fn forward(module: &mut dyn Module, inputs: &[State]) -> State {
    let refs: Vec<&State> = inputs.iter().collect();
    let mut output = State::default();
    module.fprop(&refs, &mut output).unwrap();
    output
}

fn value_mut<'a>(
    module: &'a mut dyn Module,
    inputs: &'a mut [State],
    target: Target,
) -> &'a mut ArrayD<f64> {
    match target {
        Target::Input(i) => &mut inputs[i].x,
        Target::Param(p) => {
            let param = module.parameters_mut().swap_remove(p);
            &mut param.x
        }
    }
}

fn perturb(module: &mut dyn Module, inputs: &mut [State], target: Target, index: usize, delta: f64) {
    value_mut(module, inputs, target).as_slice_mut().unwrap()[index] += delta;
}

fn objective(output: &ArrayD<f64>, g: &ArrayD<f64>) -> f64 {
    output.iter().zip(g.iter()).map(|(y, g)| y * g).sum()
}

struct Sweeps {
    input_dx: Vec<ArrayD<f64>>,
    input_ddx: Vec<ArrayD<f64>>,
    param_dx: Vec<ArrayD<f64>>,
    param_ddx: Vec<ArrayD<f64>>,
}

/// Runs all three sweeps from zeroed accumulators with the given upstream
/// gradient and curvature.
fn analytic(
    module: &mut dyn Module,
    inputs: &mut [State],
    g: &ArrayD<f64>,
    h: &ArrayD<f64>,
) -> Sweeps {
    let mut output = forward(module, inputs);
    output.dx.assign(g);
    output.ddx.assign(h);
    for state in inputs.iter_mut() {
        state.clear();
    }
    for param in module.parameters_mut() {
        param.clear();
    }
    {
        let mut refs: Vec<&mut State> = inputs.iter_mut().collect();
        module.bprop_input(&mut refs, &output).unwrap();
    }
    {
        let refs: Vec<&State> = inputs.iter().collect();
        module.bprop_param(&refs, &output).unwrap();
    }
    {
        let mut refs: Vec<&mut State> = inputs.iter_mut().collect();
        module.bbprop_input(&mut refs, &output).unwrap();
    }
    {
        let refs: Vec<&State> = inputs.iter().collect();
        module.bbprop_param(&refs, &output).unwrap();
    }
    Sweeps {
        input_dx: inputs.iter().map(|s| s.dx.clone()).collect(),
        input_ddx: inputs.iter().map(|s| s.ddx.clone()).collect(),
        param_dx: module.parameters().iter().map(|p| p.dx.clone()).collect(),
        param_ddx: module.parameters().iter().map(|p| p.ddx.clone()).collect(),
    }
}

/// Numeric gradient and Gauss-Newton curvature with respect to `target`.
fn numeric(
    module: &mut dyn Module,
    inputs: &mut [State],
    target: Target,
    g: &ArrayD<f64>,
    h: &ArrayD<f64>,
) -> (Vec<f64>, Vec<f64>) {
    let len = value_mut(module, inputs, target).len();
    let centre = objective(&forward(module, inputs).x, g);
    let mut grad = Vec::with_capacity(len);
    let mut curv = Vec::with_capacity(len);
    for k in 0..len {
        perturb(module, inputs, target, k, EPSILON);
        let plus = forward(module, inputs).x;
        perturb(module, inputs, target, k, -2.0 * EPSILON);
        let minus = forward(module, inputs).x;
        perturb(module, inputs, target, k, EPSILON);

        let f_plus = objective(&plus, g);
        let f_minus = objective(&minus, g);
        grad.push((f_plus - f_minus) / (2.0 * EPSILON));

        let gauss_newton: f64 = plus
            .iter()
            .zip(minus.iter())
            .zip(h.iter())
            .map(|((p, m), h)| {
                let jacobian = (p - m) / (2.0 * EPSILON);
                h * jacobian * jacobian
            })
            .sum();
        let second = (f_plus - 2.0 * centre + f_minus) / (EPSILON * EPSILON);
        curv.push(gauss_newton + second);
    }
    (grad, curv)
}

fn assert_close(what: &str, analytic: &ArrayD<f64>, numeric: &[f64]) {
    assert_eq!(analytic.len(), numeric.len(), "{}: length differs", what);
    for (k, (a, n)) in analytic.iter().zip(numeric).enumerate() {
        let tolerance = TOLERANCE * (1.0 + a.abs().max(n.abs()));
        assert!(
            (a - n).abs() <= tolerance,
            "{}[{}]: analytic {:.8}, numeric {:.8}",
            what,
            k,
            a,
            n
        );
    }
}

/// Checks every input and parameter of `module`, then checks that a second
/// backward call without clearing doubles the input gradients.
fn check_module(mut module: Box<dyn Module>, mut inputs: Vec<State>, rng: &mut StdRng) {
    let name = module.name();
    let out_shape = forward(module.as_mut(), &inputs).shape().to_vec();
    let g = random_array(rng, &out_shape, -1.0, 1.0);
    let h = random_array(rng, &out_shape, 0.0, 1.0);

    let sweeps = analytic(module.as_mut(), &mut inputs, &g, &h);
    for i in 0..inputs.len() {
        let (grad, curv) = numeric(module.as_mut(), &mut inputs, Target::Input(i), &g, &h);
        assert_close(&format!("{} input{} dx", name, i + 1), &sweeps.input_dx[i], &grad);
        assert_close(&format!("{} input{} ddx", name, i + 1), &sweeps.input_ddx[i], &curv);
    }
    for p in 0..sweeps.param_dx.len() {
        let (grad, curv) = numeric(module.as_mut(), &mut inputs, Target::Param(p), &g, &h);
        assert_close(&format!("{} param{} dx", name, p), &sweeps.param_dx[p], &grad);
        assert_close(&format!("{} param{} ddx", name, p), &sweeps.param_ddx[p], &curv);
    }

    let mut output = forward(module.as_mut(), &inputs);
    output.dx.assign(&g);
    let mut refs: Vec<&mut State> = inputs.iter_mut().collect();
    module.bprop_input(&mut refs, &output).unwrap();
    for (i, state) in inputs.iter().enumerate() {
        let doubled = &sweeps.input_dx[i] * 2.0;
        assert_close(
            &format!("{} input{} accumulated dx", name, i + 1),
            &state.dx,
            doubled.as_slice().unwrap(),
        );
    }
}

#[test]
fn test_linear() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut module = Linear::new(&[2, 3], &[4]);
    module.forget(&mut rng);
    let input = random_state(&mut rng, &[2, 3]);
    check_module(Box::new(module), vec![input], &mut rng);
}

#[test]
fn test_bias_elementwise() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut module = Bias::new(&[2, 3], false).unwrap();
    module.forget(&mut rng);
    let input = random_state(&mut rng, &[2, 3]);
    check_module(Box::new(module), vec![input], &mut rng);
}

#[test]
fn test_bias_per_feature() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut module = Bias::new(&[2, 2, 3], true).unwrap();
    module.forget(&mut rng);
    let input = random_state(&mut rng, &[2, 2, 3]);
    check_module(Box::new(module), vec![input], &mut rng);
}

#[test]
fn test_multiplication() {
    let mut rng = StdRng::seed_from_u64(4);
    let a = random_state(&mut rng, &[3, 2]);
    let b = random_state(&mut rng, &[3, 2]);
    check_module(Box::new(Multiplication::new()), vec![a, b], &mut rng);
}

#[test]
fn test_distance_l2() {
    let mut rng = StdRng::seed_from_u64(5);
    for average in [false, true] {
        let a = random_state(&mut rng, &[4]);
        let b = random_state(&mut rng, &[4]);
        check_module(Box::new(DistanceL2::new(average)), vec![a, b], &mut rng);
    }
}

#[test]
fn test_cross_entropy() {
    let mut rng = StdRng::seed_from_u64(6);
    for average in [false, true] {
        let logits = random_state(&mut rng, &[5]);
        let mut target = State::from_array(random_array(&mut rng, &[5], 0.0, 1.0));
        let total = target.x.sum();
        target.x.mapv_inplace(|t| t / total);
        check_module(Box::new(CrossEntropy::new(average)), vec![logits, target], &mut rng);
    }
}

#[test]
fn test_cross_entropy_unnormalized_target() {
    let mut rng = StdRng::seed_from_u64(7);
    let logits = random_state(&mut rng, &[2, 2]);
    let target = State::from_array(random_array(&mut rng, &[2, 2], 0.0, 2.0));
    check_module(Box::new(CrossEntropy::new(false)), vec![logits, target], &mut rng);
}

#[test]
fn test_penalty_l1_outside_dead_zone() {
    let mut rng = StdRng::seed_from_u64(8);
    for average in [false, true] {
        let input = State::from_array(away_from_zero(&mut rng, &[6]));
        check_module(Box::new(PenaltyL1::new(0.1, average)), vec![input], &mut rng);
    }
}

#[test]
fn test_penalty_l2() {
    let mut rng = StdRng::seed_from_u64(9);
    for average in [false, true] {
        let input = random_state(&mut rng, &[3, 2]);
        check_module(Box::new(PenaltyL2::new(average)), vec![input], &mut rng);
    }
}

#[test]
fn test_bconv_rec_cost() {
    let mut rng = StdRng::seed_from_u64(10);
    for average in [false, true] {
        let module = BconvRecCost::from_conv(&[4, 5], &[2, 3], average).unwrap();
        let target = random_state(&mut rng, &[4, 5]);
        let rec = random_state(&mut rng, &[4, 5]);
        check_module(Box::new(module), vec![target, rec], &mut rng);
    }
}

#[test]
fn test_every_module_rejects_mismatched_input() {
    let cases: Vec<(Box<dyn Module>, Vec<State>)> = vec![
        (Box::new(Linear::new(&[3], &[2])), vec![State::new(&[4])]),
        (Box::new(Bias::new(&[3], false).unwrap()), vec![State::new(&[4])]),
        (
            Box::new(Multiplication::new()),
            vec![State::new(&[3]), State::new(&[2])],
        ),
        (
            Box::new(DistanceL2::new(true)),
            vec![State::new(&[3]), State::new(&[2])],
        ),
        (
            Box::new(CrossEntropy::new(false)),
            vec![State::new(&[3]), State::new(&[2])],
        ),
        (
            Box::new(BconvRecCost::from_conv(&[3], &[2], true).unwrap()),
            vec![State::new(&[3]), State::new(&[4])],
        ),
    ];
    for (mut module, inputs) in cases {
        let refs: Vec<&State> = inputs.iter().collect();
        let mut output = State::new(&[7]);
        let result = module.fprop(&refs, &mut output);
        assert!(
            matches!(result, Err(ModuleError::ShapeMismatch { .. })),
            "{} accepted a mismatched input",
            module.name()
        );
        assert_eq!(output.shape(), &[7], "{} wrote its output", module.name());
    }
}
