use clap::{Args, Parser, Subcommand, ValueHint};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{stdout, Stdout};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use scaleseg::metrics::IouAccumulator;
use scaleseg::models::load_checkpoint;
use scaleseg::prelude::*;
use scaleseg::transforms::build_pipeline;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Inspect ScaleSeg models, augmentation pipelines and datasets.
#[derive(Debug, Parser)]
#[command(name = "scaleseg", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the model and report feature shapes for a dummy input
    Inspect(InspectArgs),

    /// Run train_pipeline on one image and print the resulting metadata
    Augment(AugmentArgs),

    /// Segment one image and print the class histogram
    Predict(PredictArgs),

    /// Mean IoU of the model over data.train
    Eval(EvalArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Experiment config (JSON)
    #[arg(value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// Override a config entry, e.g. model.backbone.norm_eval=true (repeatable)
    #[arg(long = "cfg-options", value_name = "KEY=VALUE")]
    cfg_options: Vec<String>,
}

impl ConfigArgs {
    fn experiment(&self) -> CliResult<Experiment> {
        let mut config = Config::from_file(&self.config)?;
        config.apply_overrides(&self.cfg_options)?;
        Ok(Experiment::new(config))
    }
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[command(flatten)]
    cfg: ConfigArgs,

    /// Dummy input size
    #[arg(long, value_name = "HxW", default_value = "128x128", value_parser = parse_size)]
    size: (usize, usize),
}

#[derive(Debug, Args)]
struct AugmentArgs {
    #[command(flatten)]
    cfg: ConfigArgs,

    /// Input image
    #[arg(value_hint = ValueHint::FilePath)]
    image: PathBuf,

    /// Label map PNG paired with the image
    #[arg(long, value_hint = ValueHint::FilePath)]
    label: Option<PathBuf>,

    /// Number of pipeline runs
    #[arg(long, default_value_t = 3)]
    rounds: u64,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Debug, Args)]
struct PredictArgs {
    #[command(flatten)]
    cfg: ConfigArgs,

    /// Input image
    #[arg(value_hint = ValueHint::FilePath)]
    image: PathBuf,

    /// Weights saved as a bincode state dict
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EvalArgs {
    #[command(flatten)]
    cfg: ConfigArgs,

    /// Weights saved as a bincode state dict
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn parse_size(raw: &str) -> Result<(usize, usize), String> {
    let (h, w) = raw
        .split_once('x')
        .ok_or_else(|| format!("size `{}` is not HxW", raw))?;
    let dim = |v: &str| v.trim().parse::<usize>().map_err(|e| format!("size `{}`: {}", raw, e));
    Ok((dim(h)?, dim(w)?))
}

// ─── Output ─────────────────────────────────────────────────────────────────

fn heading(out: &mut Stdout, text: &str) -> CliResult<()> {
    execute!(out, SetForegroundColor(Color::Cyan), Print(format!("--- {} ---\n", text)), ResetColor)?;
    Ok(())
}

fn field(out: &mut Stdout, key: &str, value: impl std::fmt::Display) -> CliResult<()> {
    execute!(
        out,
        SetForegroundColor(Color::DarkGrey),
        Print(format!("  {:<18}", key)),
        SetForegroundColor(Color::White),
        Print(format!("{}\n", value)),
        ResetColor
    )?;
    Ok(())
}

fn success(out: &mut Stdout, text: &str) -> CliResult<()> {
    execute!(out, SetForegroundColor(Color::Green), Print(format!("{}\n", text)), ResetColor)?;
    Ok(())
}

// ─── Commands ───────────────────────────────────────────────────────────────

fn build_model(out: &mut Stdout, exp: &Experiment, checkpoint: Option<&Path>) -> CliResult<EncoderDecoder> {
    let mut model = exp.build_model()?;
    if let Some(path) = checkpoint {
        let report = load_checkpoint(&mut model, path)?;
        field(out, "checkpoint", format!("{} ({} tensors)", path.display(), report.loaded.len()))?;
    }
    model.train(false);
    Ok(model)
}

fn inspect(out: &mut Stdout, args: &InspectArgs) -> CliResult<()> {
    let exp = args.cfg.experiment()?;
    let (h, w) = args.size;
    let mut model = build_model(out, &exp, None)?;

    heading(out, "Model")?;
    field(out, "classes", model.num_classes())?;
    field(out, "parameters", model.num_parameters())?;
    field(out, "out_channels", format!("{:?}", model.backbone().out_channels()))?;

    let input = Tensor::randn(vec![1, 3, h, w], Some(0));
    for (i, feat) in model.extract_feat(&input)?.iter().enumerate() {
        field(out, &format!("feature {}", i), feat.shape())?;
    }
    field(out, "logits", model.encode_decode(&input)?.shape())?;
    success(out, "model built")
}

fn split_path(path: &Path) -> CliResult<(PathBuf, String)> {
    let name = path
        .file_name()
        .ok_or_else(|| format!("`{}` is not a file path", path.display()))?
        .to_string_lossy()
        .into_owned();
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((dir, name))
}

fn record_for(image: &Path, label: Option<&Path>) -> CliResult<SegResults> {
    let (img_dir, img_name) = split_path(image)?;
    let label = label.map(split_path).transpose()?;
    Ok(SegResults::from_files(
        img_dir,
        &img_name,
        label.as_ref().map(|(dir, _)| dir.clone()),
        label.as_ref().map(|(_, name)| name.as_str()),
    ))
}

fn augment(out: &mut Stdout, args: &AugmentArgs) -> CliResult<()> {
    let exp = args.cfg.experiment()?;
    let pipeline = exp.train_pipeline()?;

    heading(out, "Pipeline")?;
    execute!(out, Print(format!("{}\n", pipeline)))?;
    for round in 0..args.rounds {
        let mut results = record_for(&args.image, args.label.as_deref())?;
        let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(round));
        pipeline.apply(&mut results, &mut rng)?;

        heading(out, &format!("Round {}", round))?;
        field(out, "ori_shape", format!("{:?}", results.ori_shape))?;
        field(out, "img_shape", format!("{:?}", results.img_shape))?;
        field(out, "pad_shape", format!("{:?}", results.pad_shape))?;
        field(out, "scale_factor", format!("{:?}", results.scale_factor))?;
        field(out, "flip", format!("{:?}", results.flip))?;
        if let Some(seg) = results.gt_semantic_seg() {
            let mut classes: Vec<u8> = seg.data().to_vec();
            classes.sort_unstable();
            classes.dedup();
            field(out, "label values", format!("{:?}", classes))?;
        }
    }
    success(out, "pipeline ok")
}

fn predict(out: &mut Stdout, args: &PredictArgs) -> CliResult<()> {
    let exp = args.cfg.experiment()?;
    let mut model = build_model(out, &exp, args.checkpoint.as_deref())?;

    let pipeline = match exp.config.get("test_pipeline") {
        Some(cfg) => build_pipeline(cfg)?,
        None => build_pipeline(&serde_json::json!([{"type": "LoadImageFromFile"}]))?,
    };
    let mut results = record_for(&args.image, None)?;
    pipeline.apply(&mut results, &mut StdRng::seed_from_u64(0))?;
    let img = results.take_img()?.hwc_to_chw()?;
    let mut shape = vec![1];
    shape.extend(img.shape_vec());
    let pred = model.inference(&img.reshape(shape)?)?;

    let mut histogram = vec![0usize; model.num_classes()];
    for &c in pred.data() {
        if let Some(slot) = histogram.get_mut(c as usize) {
            *slot += 1;
        }
    }
    heading(out, "Prediction")?;
    field(out, "size", pred.shape())?;
    let total = pred.numel().max(1) as f64;
    for (class, count) in histogram.iter().enumerate().filter(|(_, &n)| n > 0) {
        field(out, &format!("class {}", class), format!("{:.2}%", 100.0 * *count as f64 / total))?;
    }
    success(out, "done")
}

const IGNORE_INDEX_KEY: &str = "model.decode_head.loss_decode.ignore_index";

/// Label value excluded from evaluation, as configured for the decode head's loss.
fn ignore_index(exp: &Experiment) -> CliResult<u8> {
    match exp.config.get(IGNORE_INDEX_KEY) {
        None => Ok(255),
        Some(v) => v
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| format!("{} must be an integer in 0..=255, got {}", IGNORE_INDEX_KEY, v).into()),
    }
}

fn eval(out: &mut Stdout, args: &EvalArgs) -> CliResult<()> {
    let exp = args.cfg.experiment()?;
    let ignore_index = ignore_index(&exp)?;

    let mut model = build_model(out, &exp, args.checkpoint.as_deref())?;
    let dataset = exp.train_dataset()?;
    let loader = DataLoader::new(&*dataset, args.batch_size, false, args.seed)?;
    let mut iou = IouAccumulator::new(model.num_classes(), ignore_index);

    heading(out, "Evaluation")?;
    field(out, "samples", dataset.len())?;
    for batch in loader {
        let batch = batch?;
        let gt = batch
            .gt_semantic_seg
            .ok_or("data.train has no annotations to evaluate against")?;
        let pred = model.inference(&batch.img)?;
        iou.update(&pred, &gt)?;
    }
    let report = iou.report();
    for (class, v) in report.iou.iter().enumerate() {
        field(out, &format!("IoU class {}", class), format!("{:.4}", v))?;
    }
    field(out, "mIoU", format!("{:.4}", report.miou))?;
    field(out, "aAcc", format!("{:.4}", report.all_acc))?;
    success(out, "evaluation finished")
}

fn run(out: &mut Stdout, cli: &Cli) -> CliResult<()> {
    match &cli.command {
        Command::Inspect(args) => inspect(out, args),
        Command::Augment(args) => augment(out, args),
        Command::Predict(args) => predict(out, args),
        Command::Eval(args) => eval(out, args),
    }
}

fn main() {
    init_logger();
    let cli = Cli::parse();
    let mut out = stdout();
    if let Err(err) = run(&mut out, &cli) {
        let _ = execute!(
            out,
            SetForegroundColor(Color::Red),
            Print(format!("error: {}\n", err)),
            ResetColor
        );
        std::process::exit(1);
    }
}
