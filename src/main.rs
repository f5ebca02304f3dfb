// src/main.rs
// Runs a few representative pooling shapes through both gradient engines and reports the
// plans they used.
use ferrox_poolgrad::initializers::{normal_tensor, uniform_tensor};
use ferrox_poolgrad::telemetry::init_tracing;
use ferrox_poolgrad::{
    Layout, MaxPool3dGrad, PlatformInfo, PoolGradError, PoolingParams, StrategyKind,
    max_pool3d_with_argmax,
};
use tracing::{info, warn};

struct Case {
    name: &'static str,
    shape: [usize; 5],
    params: PoolingParams,
}

fn cases() -> Vec<Case> {
    vec![
        Case {
            name: "video 2x2 spatial",
            shape: [1, 16, 8, 90, 160],
            params: PoolingParams::new([1, 2, 2], [1, 2, 2], [0; 3]),
        },
        Case {
            name: "overlapping cube",
            shape: [2, 8, 10, 11, 32],
            params: PoolingParams::new([2, 4, 5], [1, 2, 3], [1, 2, 2]),
        },
        Case {
            name: "padded 3x3x3",
            shape: [4, 4, 9, 9, 9],
            params: PoolingParams::cubic(3, 2, 1),
        },
        Case {
            name: "sparse windows",
            shape: [2, 1, 44, 38, 16],
            params: PoolingParams::new([22, 19, 4], [22, 19, 4], [0; 3]),
        },
    ]
}

fn run(case: &Case, platform: PlatformInfo) -> Result<(), PoolGradError> {
    let x = uniform_tensor::<f32>(&case.shape, -1.0, 1.0, 42)?;
    let (pooled, argmax) = max_pool3d_with_argmax::<f32, i32>(x.view(), &case.params, Layout::Ncdhw)?;
    let grad = normal_tensor::<f32>(pooled.shape(), 0.0, 1.0, 7)?;

    let op = MaxPool3dGrad::new(case.params).with_platform(platform);
    let auto = op.forward(grad.view(), argmax.view(), &case.shape)?;
    info!(
        case = case.name,
        strategy = %auto.plan.strategy,
        tiling_key = auto.plan.tiling_key(),
        blocks = auto.plan.total_blocks,
        cores = auto.plan.used_cores,
        workspace_bytes = auto.plan.workspace_bytes,
        "planned"
    );

    let other = match auto.plan.strategy.kind() {
        StrategyKind::Vectorized => StrategyKind::Simt,
        StrategyKind::Simt => StrategyKind::Vectorized,
    };
    let cross = op.force(other).forward(grad.view(), argmax.view(), &case.shape)?;
    let max_diff = auto
        .grad_input
        .iter()
        .zip(cross.grad_input.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    let grad_sum: f64 = grad.iter().map(|&g| g as f64).sum();
    let input_sum: f64 = auto.grad_input.iter().map(|&g| g as f64).sum();

    if max_diff > 1e-4 {
        warn!(case = case.name, max_diff, "engines disagree");
    }
    info!(
        case = case.name,
        cross = %cross.plan.strategy,
        max_diff,
        grad_sum,
        input_sum,
        vector_ops = auto.stats.kernel.vector_ops.max(cross.stats.kernel.vector_ops),
        "checked"
    );
    Ok(())
}

fn main() -> Result<(), PoolGradError> {
    init_tracing();
    let platform = PlatformInfo::from_env()?;
    info!(%platform, "platform");

    for case in cases() {
        run(&case, platform)?;
    }
    Ok(())
}
