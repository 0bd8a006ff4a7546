//! quickcls CLI

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use qcls_core::{ModelConfig, PoiSpec, StatModel};
use qcls_inference::{AsymptoticLimitTool, LimitConfig, MinimizerConfig, RunPhase};
use qcls_model::{CountingModel, DEFAULT_DATA_NAME, Workspace};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "quickcls")]
#[command(about = "quickcls - Asymptotic CLs upper limits")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: tracing::Level,

    /// Input workspace (counting JSON)
    #[arg(short, long)]
    input: PathBuf,

    /// Output file for the limit record (pretty JSON). Defaults to stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dataset to use as observed data
    #[arg(long, default_value = DEFAULT_DATA_NAME)]
    data_name: String,

    /// Parameter snapshot used as starting point and nominal Asimov point
    #[arg(long)]
    snapshot: Option<String>,

    /// POI descriptors, comma separated: `name`, `name=val` (fixed) or `name=val_lo_hi`.
    /// The first floating descriptor naming a model POI is scanned.
    #[arg(long, default_value = "")]
    poi: String,

    /// Nuisance parameters to hold constant, comma separated
    #[arg(long, default_value = "")]
    fix_np: String,

    /// Build Asimov data per band instead of using the closed form
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    better_bands: bool,

    /// Also refine the negative bands, profiling at the band POI value
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    better_neg_bands: bool,

    /// Also refine the negative bands, profiling at zero
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    set_neg_at_zero: bool,

    /// Starting minimizer strategy (0-2)
    #[arg(long, default_value_t = 0)]
    min_strat: u8,

    /// Minimizer print level (-1 silent)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    print_level: i32,

    /// Retries per fit after the first attempt
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// Relative precision on each limit
    #[arg(long, default_value_t = 0.005)]
    precision: f64,

    /// Offset the NLL during minimization
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    nll_offset: bool,

    /// Constant-term optimization level (0-2)
    #[arg(long, default_value_t = 2)]
    opt_const: u8,

    /// Compute expected limits
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    do_exp: bool,

    /// Compute the observed limit (ignored when blind)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    do_obs: bool,

    /// Never read the observed data
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    do_blind: bool,

    /// Use the q~mu test statistic
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    do_tilde: bool,

    /// Only report fits whose whole retry ladder failed
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    kill_below_fatal: bool,

    /// Start conditional fits from the previous scan points
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    use_pred_fit: bool,

    /// Profile Asimov nuisance parameters on observed data (ignored when blind)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    cond_exp: bool,

    /// Confidence level of the exclusion
    #[arg(long, default_value_t = 0.95)]
    target_cl: f64,

    /// CLs evaluations per limit before giving up
    #[arg(long, default_value_t = 100)]
    max_iterations: usize,

    /// Non-converged fits tolerated before the run aborts
    #[arg(long, default_value_t = 50)]
    max_failed_fits: usize,

    /// Run the observed and band scans in parallel
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    parallel: bool,

    /// Threads (0 = auto)
    #[arg(long, default_value = "0")]
    threads: usize,
}

impl Cli {
    fn limit_config(&self) -> LimitConfig {
        LimitConfig {
            target_cl: self.target_cl,
            precision: self.precision,
            better_bands: self.better_bands,
            better_negative_bands: self.better_neg_bands,
            profile_neg_at_zero: self.set_neg_at_zero,
            do_tilde: self.do_tilde,
            do_blind: self.do_blind,
            do_exp: self.do_exp,
            do_obs: self.do_obs,
            cond_expected: self.cond_exp,
            use_predictive_fit: self.use_pred_fit,
            max_iterations: self.max_iterations,
            max_failed_fits: self.max_failed_fits,
            parallel: self.parallel,
            minimizer: MinimizerConfig {
                strategy: self.min_strat,
                print_level: self.print_level,
                nll_offset: self.nll_offset,
                optimize_const: self.opt_const,
                max_retries: self.max_retries,
                kill_below_fatal: self.kill_below_fatal,
                ..MinimizerConfig::default()
            },
            ..LimitConfig::default()
        }
    }

    fn model_config(&self) -> Result<ModelConfig> {
        Ok(ModelConfig {
            pois: parse_poi_specs(&self.poi)?,
            fixed_nuisances: split_list(&self.fix_np).map(str::to_string).collect(),
            snapshot: self.snapshot.clone(),
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if cli.threads > 0 {
        let _ = rayon::ThreadPoolBuilder::new().num_threads(cli.threads).build_global();
    }

    let config = cli.limit_config();
    let model_config = cli.model_config()?;
    let tool = AsymptoticLimitTool::new(config.clone()).context("invalid limit options")?;

    let model = load_model(&cli.input)?;
    let data = model.dataset(&cli.data_name)?;

    let result = tool.run(&model, &model_config, &data)?;
    tracing::info!(
        poi = %result.poi,
        median = ?result.median(),
        observed = ?result.observed.as_ref().map(|o| o.mu),
        failed_fits = result.failed_fits,
        "limit run finished"
    );

    let record = result.to_record(&config);
    match &cli.output {
        Some(path) => {
            record.save(path).with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "limit record written");
        }
        None => println!("{}", serde_json::to_string_pretty(&record)?),
    }

    if result.phase == RunPhase::Failed {
        bail!("limit run failed after {} non-converged fits", result.failed_fits);
    }
    Ok(())
}

fn load_model(input: &Path) -> Result<CountingModel> {
    tracing::info!(path = %input.display(), "loading workspace");
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let workspace: Workspace = serde_json::from_str(&json)?;
    let model = CountingModel::from_workspace(&workspace)?;
    tracing::info!(parameters = model.parameters().len(), "workspace loaded");
    Ok(model)
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Parse `name`, `name=val` and `name=val_lo_hi`, comma separated.
fn parse_poi_specs(s: &str) -> Result<Vec<PoiSpec>> {
    split_list(s).map(parse_poi_spec).collect()
}

fn parse_poi_spec(token: &str) -> Result<PoiSpec> {
    let Some((name, rest)) = token.split_once('=') else {
        return Ok(PoiSpec::floating(token));
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("POI descriptor '{}' has no name", token);
    }
    let numbers = rest
        .split('_')
        .map(|v| match v.trim().parse::<f64>() {
            Ok(x) if x.is_finite() => Ok(x),
            _ => Err(anyhow::anyhow!("bad number '{}' in POI descriptor '{}'", v, token)),
        })
        .collect::<Result<Vec<f64>>>()?;
    match numbers.as_slice() {
        [value] => Ok(PoiSpec::fixed(name, *value)),
        [value, lo, hi] => {
            if lo >= hi || value < lo || value > hi {
                bail!("POI descriptor '{}': need lo <= val <= hi and lo < hi", token);
            }
            Ok(PoiSpec::ranged(name, *value, *lo, *hi))
        }
        _ => bail!("POI descriptor '{}' must be name, name=val or name=val_lo_hi", token),
    }
}
