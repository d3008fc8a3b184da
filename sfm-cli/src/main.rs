use log::*;
use sfm_pipeline::{
    BackendRegistry, Mode, Orchestrator, PipelineSettings, RetrievalMethod, RunConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "sfm",
    about = "Recovers camera poses and sparse point clouds from unordered photographs"
)]
struct Opt {
    /// The directory containing the scenes.
    ///
    /// Scenes are read from `<data>/<train|test>/<dataset>/<scene>/images` or from
    /// `<data>/<scene>/images`.
    #[structopt(short, long, parse(from_os_str))]
    data: PathBuf,
    /// The directory every scene output is written to.
    #[structopt(short, long, parse(from_os_str), default_value = "outputs")]
    output: PathBuf,
    /// Either `train` or `eval`. Eval reads the `test` split and writes `submission.csv`.
    #[structopt(short, long, default_value = "train")]
    mode: Mode,
    /// The feature backends to run, in order.
    #[structopt(short, long, default_value = "harris")]
    backends: Vec<String>,
    /// The retrieval method used to select pairs.
    #[structopt(short, long, default_value = "tiny-image")]
    retrieval: RetrievalMethod,
    /// Extract features from images turned upright.
    #[structopt(long)]
    rotation_matching: bool,
    /// Use the intrinsics of the first image for every image of a scene.
    #[structopt(long)]
    shared_camera: bool,
    /// Try to localize images that are unregistered after reconstruction.
    #[structopt(long)]
    localize_unregistered: bool,
    /// The refinement configuration file.
    #[structopt(long, parse(from_os_str))]
    refinement_config: Option<PathBuf>,
    /// Scenes with more images are not refined.
    #[structopt(long, default_value = "500")]
    refinement_memory_threshold: usize,
    /// Refine again even if a refined reconstruction is cached.
    #[structopt(long)]
    force_refinement: bool,
    /// Recompute every stage of every scene.
    #[structopt(long)]
    overwrite: bool,
    /// Scene names or `<dataset>/<scene>` keys to skip.
    #[structopt(long)]
    skip_scenes: Vec<String>,
    /// The pipeline settings file.
    #[structopt(short, long, parse(from_os_str), default_value = "sfm-settings.json")]
    settings: PathBuf,
    /// List the available feature backends and exit.
    #[structopt(long)]
    list_backends: bool,
}

fn main() -> ExitCode {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    let registry = BackendRegistry::with_defaults();

    if opt.list_backends {
        for name in registry.names() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    let config = RunConfig {
        mode: opt.mode,
        backends: opt.backends,
        retrieval: opt.retrieval,
        rotation_matching: opt.rotation_matching,
        shared_camera: opt.shared_camera,
        localize_unregistered: opt.localize_unregistered,
        refinement_config: opt.refinement_config,
        refinement_memory_threshold: opt.refinement_memory_threshold,
        force_refinement: opt.force_refinement,
        overwrite: opt.overwrite,
        skip_scenes: opt.skip_scenes,
        settings: PipelineSettings::load_or_default(Some(&opt.settings)),
        ..RunConfig::new(opt.data, opt.output)
    };

    let summary = match Orchestrator::new(config, &registry).and_then(|o| o.run()) {
        Ok(summary) => summary,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    for scene in &summary.scenes {
        println!(
            "{}: {:?}, {} of {} images registered, {} dropped pairs, refinement {}",
            scene.scene,
            scene.status,
            scene.registered,
            scene.images,
            scene.dropped_pairs.len(),
            scene
                .refinement
                .map_or("not run".to_string(), |outcome| format!("{:?}", outcome).to_lowercase())
        );
    }
    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
