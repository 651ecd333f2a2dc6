use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maginv::config;
use maginv::io::{write_bundle, Manifest, ResultBundle, Summary, SCHEMA_VERSION};
use maginv::pipeline::{export, forward_synthetic, run_inversion};
use maginv::viz::CsvSliceWriter;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "maginv")]
#[command(version)]
#[command(about = "Sparse-norm inversion of total magnetic intensity data")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file
    #[arg(short, long, global = true, default_value = "maginv.toml")]
    config: PathBuf,

    /// Output directory (overrides the directories in [output])
    #[arg(short, long, global = true)]
    out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full inversion
    Run {
        /// Also write a JSON result bundle next to the model file
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file
    Validate,
    /// Simulate the [synthetic] block and write an observation file
    Forward {
        /// Receiver height above topography (m)
        #[arg(long, default_value = "1.0")]
        height: f64,
    },
    /// Print version information
    Version,
}

fn load_config(path: &Path, out: Option<&Path>) -> Result<(config::Root, String)> {
    let (mut cfg, text) = config::Root::load(path)
        .with_context(|| format!("failed to load config: {}", path.display()))?;
    if let Some(dir) = out {
        cfg.output.rebase(dir);
    }
    Ok((cfg, text))
}

fn run(cfg_path: &Path, out: Option<&Path>, json: bool) -> Result<()> {
    let (cfg, cfg_text) = load_config(cfg_path, out)?;
    info!(project = %cfg.project.name, version = %cfg.project.version, "configuration loaded");

    let result = run_inversion(&cfg).context("inversion failed")?;
    export(&cfg.output, &result, &mut CsvSliceWriter).context("failed to write results")?;

    let o = &result.outcome;
    eprintln!(
        "[maginv] phase={} reason={} iterations={} phi_d={:.4e} (target {:.4e}) phi_m={:.4e} beta={:.4e}",
        o.phase, o.stop_reason, o.iterations, o.phi_d, result.target_misfit, o.phi_m, o.beta
    );
    eprintln!("[maginv] model: {}", cfg.output.model.display());

    if json {
        let json_path = cfg.output.model.with_extension("json");
        let bundle = ResultBundle {
            manifest: Manifest::new(&cfg, &cfg_text),
            summary: Summary::new(o, result.target_misfit, result.wall_time_ms),
            history: o.history.clone(),
        };
        write_bundle(&json_path, &bundle)
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        eprintln!("[maginv] JSON bundle: {}", json_path.display());
    }
    Ok(())
}

fn validate(cfg_path: &Path) -> Result<()> {
    let (cfg, _) = load_config(cfg_path, None)?;
    let mesh = maginv::pipeline::build_mesh(&cfg.mesh).context("invalid mesh")?;
    let shape = mesh.shape();

    eprintln!("[maginv] config valid: {}", cfg_path.display());
    eprintln!("  project: {} v{}", cfg.project.name, cfg.project.version);
    eprintln!(
        "  data: topography={}, observations={}, value column={}",
        cfg.data.topography.display(),
        cfg.data.observations.display(),
        cfg.data.columns.value
    );
    let components: Vec<String> = cfg.survey.components.iter().map(|c| c.to_string()).collect();
    eprintln!(
        "  survey: B0={} nT, I={} deg, D={} deg, components=[{}]",
        cfg.survey.strength_nt,
        cfg.survey.inclination_deg,
        cfg.survey.declination_deg,
        components.join(", ")
    );
    eprintln!("  mesh: {} x {} x {} = {} cells", shape[0], shape[1], shape[2], mesh.n_cells());
    eprintln!(
        "  model: background={:e}, bounds=[{}, {}]",
        cfg.model.background_susceptibility, cfg.model.lower_bound, cfg.model.upper_bound
    );
    eprintln!("  norms: {:?}", cfg.regularization.norms);
    eprintln!(
        "  optimization: max_iter={}, max_iter_ls={}, max_iter_cg={}, tol_cg={:.0e}",
        cfg.optimization.max_iter,
        cfg.optimization.max_iter_ls,
        cfg.optimization.max_iter_cg,
        cfg.optimization.tol_cg
    );
    eprintln!(
        "  irls: max_irls_iterations={}, f_min_change={:.0e}, cool_eps_fact={}",
        cfg.directives.irls.max_irls_iterations,
        cfg.directives.irls.f_min_change,
        cfg.directives.irls.cool_eps_fact
    );
    if let Some(syn) = &cfg.synthetic {
        eprintln!(
            "  synthetic: block {:?} .. {:?}, susceptibility={}",
            syn.min, syn.max, syn.susceptibility
        );
    }
    Ok(())
}

fn forward(cfg_path: &Path, out: Option<&Path>, height: f64) -> Result<()> {
    let (cfg, _) = load_config(cfg_path, out)?;
    let synthetic = forward_synthetic(&cfg, height).context("forward modelling failed")?;
    eprintln!(
        "[maginv] {} receivers, {} anomalous cells",
        synthetic.n_receivers, synthetic.n_anomalous
    );
    eprintln!("[maginv] observations: {}", synthetic.observations.display());
    eprintln!("[maginv] true model: {}", synthetic.true_model.display());
    Ok(())
}

fn print_version() {
    eprintln!("maginv - sparse-norm magnetic susceptibility inversion");
    eprintln!();
    eprintln!("  Version:         {}", env!("CARGO_PKG_VERSION"));
    eprintln!("  Schema Version:  {}", SCHEMA_VERSION);
    eprintln!("  Platform:        {}", std::env::consts::OS);
    eprintln!("  Architecture:    {}", std::env::consts::ARCH);
    eprintln!();
    eprintln!("Directive schedule:");
    eprintln!("  sensitivity weighting, beta estimate, output saver,");
    eprintln!("  IRLS updater, Jacobi preconditioner, target misfit");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let out = args.out.as_deref();

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => validate(&args.config),
        Commands::Forward { height } => forward(&args.config, out, height),
        Commands::Run { json } => run(&args.config, out, json),
    }
}
