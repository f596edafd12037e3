use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rust_vio::estimator::{Estimator, EstimatorConfig, GeometricSolver, ReprojectionGate};
use rust_vio::mapper::spawn_mapper;
use rust_vio::sim::{CircularTrajectory, Scene, SimTracker, SimTrackerConfig};

const NUM_STEPS: u64 = 600;
const STEP_NS: u64 = 33_333_333;
const MAPPER_QUEUE_CAPACITY: usize = 256;
const SEED: u64 = 42;
const LOG_EVERY: u64 = 50;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from {}", path);
            EstimatorConfig::from_file(&path)?
        }
        None => EstimatorConfig::default(),
    };

    let scene = Scene::cylinder(1500, 8.0, 2.0, SEED);
    let trajectory = CircularTrajectory::new(2.0, 0.01);
    let mut tracker = SimTracker::new(SimTrackerConfig::default(), SEED + 1);
    info!("Simulating {} landmarks over {} steps", scene.landmarks.len(), NUM_STEPS);

    let (mapper, mut mapper_worker) = spawn_mapper(MAPPER_QUEUE_CAPACITY);
    let solver = GeometricSolver::new(config.solver.clone());
    let mut estimator = Estimator::new(config, ReprojectionGate::default(), solver)?.with_mapper(mapper);
    let t_body_cam = *estimator.body_camera();

    let mut promoted = 0;
    let mut rejected = 0;
    let mut discarded = 0;
    for step in 0..NUM_STEPS {
        let body_pose = trajectory.body_pose(step, &t_body_cam);
        estimator.updater_mut().set_pose(body_pose);

        let camera_pose = body_pose.compose(&t_body_cam);
        let mut tracks = tracker.step(estimator.graph_mut(), &scene, &camera_pose);
        let report = estimator.process_tracks(step * STEP_NS, &mut tracks)?;

        promoted += report.promoted_features.len();
        rejected += report.rejected_by_filter.len();
        discarded += report.discarded_groups.len();

        if step % LOG_EVERY == 0 {
            info!(
                "step {:>4}: {:>3} tracks | state {:>2} features {:>2} groups | graph {:>4} features {:>3} groups | init depth {:.2}",
                step,
                report.num_tracks_out,
                report.num_instate_features,
                report.num_instate_groups,
                estimator.graph().num_graph_features(),
                estimator.graph().num_graph_groups(),
                report.init_depth
            );
        }
    }

    info!(
        "Done: {} promotions, {} filter rejections, {} group discards",
        promoted, rejected, discarded
    );

    drop(estimator);
    mapper_worker.shutdown();
    info!(
        "Mapper holds {} features and {} groups",
        mapper_worker.store().num_features(),
        mapper_worker.store().num_groups()
    );
    Ok(())
}
