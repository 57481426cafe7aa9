use brainage::cohort::{self, FeatureSet};
use brainage::compare::{self, CompareConfig, Correction};
use brainage::crossval::{self, CvConfig, ModelKind, ResultLabels};
use brainage::gap;
use brainage::hyperparams::{self, LearningCurve, SearchConfig};
use brainage::interp::contributions::{self, ContributionConfig};
use brainage::interp::manifest::Manifest;
use brainage::interp::render::{self, Colormap, SliceConfig};
use brainage::interp::slices::SliceSpec;
use brainage::progress::{CvProgressObserver, CvProgressStage};
use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

#[derive(Args)]
pub struct ContributionsArgs {
    /// Path to the voxel map (NIfTI)
    #[arg(short = 'm', long)]
    pub map_file: PathBuf,

    /// Path to the brain mask used for the percentile threshold
    #[arg(short = 'b', long)]
    pub brain_mask_file: PathBuf,

    /// Map values below this percentile (within the mask) are set to zero
    #[arg(short = 'p', long, default_value = "90")]
    pub percentile_threshold: f64,

    /// Directory holding the study's cortical, subcortical and white matter parcellations
    #[arg(short = 'a', long, required_unless_present = "manifest")]
    pub parcellations_path: Option<PathBuf>,

    /// TOML manifest describing the atlases (overrides --parcellations-path)
    #[arg(long, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// Where to write the ranked contributions as CSV
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct SlicesArgs {
    /// Path to the voxel map (NIfTI)
    #[arg(short = 'm', long)]
    pub map_file: PathBuf,

    /// Path to the template brain drawn underneath the map
    #[arg(short = 't', long)]
    pub template_file: PathBuf,

    /// Directory for the output images
    #[arg(short = 'o', long)]
    pub out_path: PathBuf,

    /// Also save a colorbar image per slice
    #[arg(short = 'c', long)]
    pub colorbar: bool,

    /// Colormap of the overlay (inferno, hot, gray)
    #[arg(short = 'l', long, default_value = "inferno", value_parser = parse_colormap)]
    pub colormap: Colormap,

    /// Lower and upper thresholds for map coloring
    #[arg(short = 'r', long, num_args = 2, default_values_t = [90.0, 99.0])]
    pub thresholds: Vec<f64>,

    /// Treat the thresholds as percentiles of map values within the brain mask
    #[arg(short = 'p', long, requires = "brain_mask_file")]
    pub percentile_thresholds: bool,

    /// Brain mask for percentile thresholds
    #[arg(short = 'b', long)]
    pub brain_mask_file: Option<PathBuf>,

    /// Slices to display, e.g. x97 z68
    #[arg(short = 's', long, num_args = 1.., value_parser = parse_slice)]
    pub slices: Option<Vec<SliceSpec>>,
}

#[derive(Args)]
pub struct SelectArgs {
    /// Configuration folders to search through
    #[arg(short = 'p', long, num_args = 1.., required = true)]
    pub config_paths: Vec<PathBuf>,

    /// Inner folders to search through, e.g. fold_0
    #[arg(short = 'i', long, num_args = 1.., required = true)]
    pub inner_folders: Vec<String>,

    /// Path to save the selected predictions to
    #[arg(short = 'd', long)]
    pub destination: Option<PathBuf>,

    /// Logged metric to minimize
    #[arg(short = 'm', long, default_value = hyperparams::DEFAULT_METRIC)]
    pub metric: String,

    /// Name of the prediction file inside each configuration folder
    #[arg(short = 'f', long, default_value = hyperparams::DEFAULT_PREDICTION_FILE)]
    pub file_name: String,
}

#[derive(Args)]
pub struct CurvesArgs {
    /// Path to the per-epoch metric log
    #[arg(short = 'l', long)]
    pub log_path: PathBuf,

    /// Where to write the curve as CSV
    #[arg(short = 'd', long)]
    pub destination: Option<PathBuf>,

    #[arg(long, default_value = "mae")]
    pub training_metric: String,

    #[arg(long, default_value = "val_mae")]
    pub validation_metric: String,
}

#[derive(Args)]
pub struct GapArgs {
    /// Prediction table with age and prediction columns
    pub input: PathBuf,

    /// Output table with the added bag column
    #[arg(short = 'o', long)]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Study name (EDIS, SLABS, GUSTO)
    #[arg(long)]
    pub name: String,

    /// Extension for BAG (pretrained, finetuned)
    #[arg(long)]
    pub ext: String,

    /// Cognitive measure to predict
    #[arg(long)]
    pub outcome: String,

    /// Covariates (demographics)
    #[arg(long, num_args = 1.., default_values_t = ["chron_age".to_string(), "sex".to_string()])]
    pub covars: Vec<String>,

    /// Use baseline BAG as a predictor
    #[arg(long)]
    pub use_bl: bool,

    /// Use change in BAG as a predictor
    #[arg(long)]
    pub use_ch: bool,

    /// Path to the study table (defaults to the conventional name in --dataframes-dir)
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    #[arg(long, default_value = "output/analysis/dataframes")]
    pub dataframes_dir: PathBuf,

    /// Results table to append to
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    #[arg(long, default_value = "10")]
    pub n_splits: usize,

    #[arg(long, default_value = "1")]
    pub n_repeats: usize,

    #[arg(long, default_value = "0")]
    pub random_state: u64,

    /// Regularization strengths to try for kernel ridge regression
    #[arg(long, num_args = 1.., default_values_t = crossval::DEFAULT_ALPHAS)]
    pub alphas: Vec<f64>,
}

#[derive(Args)]
pub struct CompareArgs {
    /// Extension for BAG (pretrained, finetuned)
    #[arg(long)]
    pub ext: String,

    /// Files containing CV results
    #[arg(long, num_args = 1.., required = true)]
    pub cv_result_files: Vec<PathBuf>,

    /// Where to write the comparison table
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Keep the first N CV repeats (rep 0 to N-1); rows of later repeats are ignored
    #[arg(long, default_value = "1")]
    pub n_repeats: usize,

    /// Multiple-comparison correction (BH, bonferroni, none)
    #[arg(long, default_value = "BH", value_parser = parse_correction)]
    pub correction: Correction,

    /// Prediction model (LR, KRR)
    #[arg(long, default_value = "KRR", value_parser = parse_model)]
    pub model: ModelKind,
}

fn parse_colormap(text: &str) -> Result<Colormap, String> {
    text.parse().map_err(|e: render::RenderError| e.to_string())
}

fn parse_slice(text: &str) -> Result<SliceSpec, String> {
    text.parse()
        .map_err(|e: brainage::interp::slices::SliceError| e.to_string())
}

fn parse_correction(text: &str) -> Result<Correction, String> {
    text.parse()
}

fn parse_model(text: &str) -> Result<ModelKind, String> {
    text.parse()
}

#[derive(Parser)]
#[command(
    name = "brainage",
    about = "Brain-age gap analysis toolkit",
    long_about = "Feature contribution maps over brain parcellations, map slice display, \
                 finetuning hyperparameter selection, and cross-validated prediction of \
                 cognitive outcomes from brain-age gaps."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank parcellation features by their mean thresholded map value
    #[command(about = "Calculate feature contributions (outputs: contributions CSV)")]
    Contributions(ContributionsArgs),

    /// Render thresholded map slices over a template brain
    #[command(about = "Display map slices (outputs: PNG images)")]
    Slices(SlicesArgs),

    /// Pick the best finetuning configuration per inner fold
    #[command(about = "Select hyperparameters from logged validation metrics")]
    Select(SelectArgs),

    /// Summarize a training log
    #[command(about = "Report training and validation learning curves")]
    Curves(CurvesArgs),

    /// Add the brain-age gap to a prediction table
    #[command(about = "Derive brain-age gaps (outputs: table with bag column)")]
    Gap(GapArgs),

    /// Predict a cognitive outcome with repeated stratified cross-validation
    #[command(about = "Predict cognition from brain age (appends CV results)")]
    Predict(PredictArgs),

    /// Compare feature sets with corrected resampled t-tests
    #[command(about = "Compare CV results across feature sets")]
    Compare(CompareArgs),

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Contributions(args)) => run_contributions(args),
        Some(Commands::Slices(args)) => run_slices(args),
        Some(Commands::Select(args)) => run_select(args),
        Some(Commands::Curves(args)) => run_curves(args),
        Some(Commands::Gap(args)) => run_gap(args),
        Some(Commands::Predict(args)) => run_predict(args),
        Some(Commands::Compare(args)) => run_compare(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Drives an `indicatif` bar from cross-validation progress events.
#[derive(Default)]
struct CvProgressBar {
    bar: Option<ProgressBar>,
}

impl CvProgressObserver for CvProgressBar {
    fn on_stage_start(&mut self, stage: CvProgressStage, total_splits: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_splits as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(stage.to_string());
        self.bar = Some(bar);
    }

    fn on_stage_advance(&mut self, stage: CvProgressStage, completed_splits: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_splits as u64);
            bar.set_message(stage.to_string());
        }
    }

    fn on_stage_finish(&mut self, stage: CvProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} done"));
        }
    }
}

fn run_contributions(args: ContributionsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = match (&args.manifest, &args.parcellations_path) {
        (Some(path), _) => Manifest::load(path)?,
        (None, Some(dir)) => Manifest::study_default(dir),
        (None, None) => {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Either --manifest or --parcellations-path is required",
            )));
        }
    };
    let config = ContributionConfig {
        map_file: args.map_file,
        brain_mask_file: args.brain_mask_file,
        percentile_threshold: args.percentile_threshold,
        atlases: manifest.into_plans()?,
    };

    let report = contributions::calculate_feature_contributions(&config)?;
    println!("{:<24} {:>14} {:>10} {:>14} {:>8}", "feature", "contribution", "relative", "tissue", "voxels");
    for row in &report {
        println!(
            "{:<24} {:>14.6} {:>10.4} {:>14} {:>8}",
            row.feature, row.contribution, row.relative, row.tissue, row.voxels
        );
    }
    if let Some(output) = &args.output {
        contributions::write_report(output, &report)?;
        println!("Contributions saved to: {}", output.display());
    }
    Ok(())
}

fn run_slices(args: SlicesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let [lower, upper] = <[f64; 2]>::try_from(args.thresholds.as_slice()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "--thresholds takes exactly two values",
        )
    })?;
    let config = SliceConfig {
        map_file: args.map_file,
        template_file: args.template_file,
        out_dir: args.out_path,
        slices: args.slices.unwrap_or_else(SliceConfig::default_slices),
        lower,
        upper,
        percentile_mask: args.brain_mask_file,
        percentile_thresholds: args.percentile_thresholds,
        colormap: args.colormap,
        colorbar: args.colorbar,
    };
    for path in render::display_map_slices(&config)? {
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn run_select(args: SelectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SearchConfig {
        metric: args.metric,
        prediction_file: args.file_name,
        ..SearchConfig::new(args.config_paths, args.inner_folders)
    };
    let mut outcome = hyperparams::search_hyperparameters(&config)?;
    for selection in &outcome.selections {
        println!(
            "{}: {} ({}={:.4}, epoch {})",
            selection.inner_folder,
            selection.source.display(),
            config.metric,
            selection.min_metric,
            selection.best_epoch
        );
    }
    if let Some(destination) = &args.destination {
        hyperparams::write_predictions(destination, &mut outcome)?;
        println!("Predictions saved to: {}", destination.display());
    }
    Ok(())
}

fn run_curves(args: CurvesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let curve = LearningCurve::load(&args.log_path, &args.training_metric, &args.validation_metric)?;
    let show = |value: Option<f64>| value.map_or_else(|| "NA".to_string(), |v| format!("{v:.4}"));
    println!("epoch\t{}\t{}", args.training_metric, args.validation_metric);
    for (epoch, (training, validation)) in curve.training.iter().zip(&curve.validation).enumerate() {
        println!("{epoch}\t{}\t{}", show(*training), show(*validation));
    }
    match curve.best_epoch() {
        Some((epoch, value)) => println!(
            "Lowest {} = {value:.4} at epoch {epoch} of {}",
            args.validation_metric,
            curve.epochs()
        ),
        None => println!("No finite {} values were logged", args.validation_metric),
    }
    if let Some(destination) = &args.destination {
        curve.write(destination)?;
        println!("Learning curve saved to: {}", destination.display());
    }
    Ok(())
}

fn run_gap(args: GapArgs) -> Result<(), Box<dyn std::error::Error>> {
    let summary = gap::derive_gap(&args.input, &args.output)?;
    println!(
        "{} samples, MAE {:.3}, r {:.3}, mean BAG {:.3}",
        summary.samples, summary.mean_absolute_error, summary.correlation, summary.mean_gap
    );
    println!("Brain-age gaps saved to: {}", args.output.display());
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let features = FeatureSet {
        covariates: args.covars,
        baseline_bag: args.use_bl,
        change_bag: args.use_ch,
        extension: args.ext.clone(),
    };
    let data_file = args.data_file.unwrap_or_else(|| {
        cohort::default_data_file(&args.dataframes_dir, &args.name, &features, &args.outcome)
    });
    let data = cohort::load_cohort(&data_file, &features, &args.outcome)?;

    let config = CvConfig {
        n_splits: args.n_splits,
        n_repeats: args.n_repeats,
        random_state: args.random_state,
        alphas: args.alphas,
        ..CvConfig::default()
    };
    let scores = crossval::run_cv(
        data.x.view(),
        data.y.view(),
        &config,
        &mut CvProgressBar::default(),
    )?;

    println!("rep\tfold\tLR\tKRR\talpha");
    for score in &scores {
        println!(
            "{}\t{}\t{:.4}\t{:.4}\t{}",
            score.repeat, score.fold, score.linear, score.kernel_ridge, score.best_alpha
        );
    }

    if let Some(output) = &args.output_file {
        let labels = ResultLabels {
            features: features.describe(),
            study: args.name,
            outcome: args.outcome,
            ext: args.ext,
        };
        crossval::append_results(output, &crossval::result_rows(&scores, &labels))?;
        println!("Results appended to: {}", output.display());
    }
    Ok(())
}

fn run_compare(args: CompareArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = CompareConfig {
        files: args.cv_result_files,
        ext: args.ext,
        model: args.model,
        n_repeats: args.n_repeats,
        correction: args.correction,
    };
    let rows = compare::load_results(&config)?;
    let comparisons = compare::compare_feature_sets(&rows, config.correction)?;

    for c in &comparisons {
        println!(
            "{}: {} vs {} (n={}): t={:.3}, p={:.4}, p_adj={:.4} {}",
            c.label, c.features_a, c.features_b, c.pairs, c.t, c.p, c.p_adjusted, c.stars
        );
    }
    if let Some(output) = &args.output_file {
        compare::write_comparisons(output, &comparisons)?;
        println!("Comparisons saved to: {}", output.display());
    }
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const MONTH: u64 = 30 * DAY;
    const YEAR: u64 = 365 * DAY;

    if seconds < MINUTE {
        format!("{} seconds ago", seconds)
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else if seconds < WEEK {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    } else if seconds < MONTH {
        format!("{:.1} weeks ago", seconds as f64 / WEEK as f64)
    } else if seconds < YEAR {
        format!("{:.1} months ago", seconds as f64 / MONTH as f64)
    } else {
        format!("{:.1} years ago", seconds as f64 / YEAR as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let release_tag = option_env!("BRAINAGE_RELEASE_TAG");
    let build_timestamp: u64 = env!("BRAINAGE_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("brainage {}", version);

    match release_tag {
        Some(tag) => println!("Release: {}", tag),
        None => println!("Release: development build"),
    }

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
