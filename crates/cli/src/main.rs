use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use protspace_core::{
    match_structure_files, read_artifact, InputSource, Inspection, MatrixKind, MethodSpec, Metric,
    Pipeline, PrepareRequest, PrepareSummary, ProtspaceConfig, StyleOverrides, DEFAULT_CONFIG,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(
    name = "protspace",
    version = VERSION,
    about = "Assemble protein projections, metadata and styles into one artifact"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// -v for info, -vv for debug. RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reduce embeddings or a similarity matrix and merge the projections
    /// into an artifact, creating it when absent.
    Prepare {
        /// Embeddings (.csv/.tsv[.gz] or .json) or a square matrix with --matrix.
        #[arg(short = 'i', long)]
        input: PathBuf,
        /// Treat the input as a labeled square matrix.
        #[arg(long, action = ArgAction::SetTrue)]
        matrix: bool,
        #[arg(long = "matrix-kind", default_value = "similarity")]
        matrix_kind: String,
        /// Feature table with an `identifier` column.
        #[arg(short = 'm', long)]
        metadata: Option<PathBuf>,
        #[arg(short = 'o', long, default_value = "protspace.json")]
        output: PathBuf,
        /// Comma-separated `<method><dims>` list, e.g. pca2,umap3.
        #[arg(long, default_value = "pca2")]
        methods: String,
        #[arg(long, action = ArgAction::SetTrue)]
        overwrite: bool,
        /// Inline JSON or path to a JSON file of style overrides.
        #[arg(long)]
        styles: Option<String>,
        #[command(flatten)]
        reducer: ReducerArgs,
    },
    /// Apply style overrides to an existing artifact.
    Style {
        artifact: PathBuf,
        #[arg(long)]
        styles: String,
        /// Defaults to rewriting the artifact in place.
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Summarize an artifact.
    Inspect {
        artifact: PathBuf,
        #[arg(long, default_value_t = 5)]
        top: usize,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Match structure files in a directory against the artifact's identifiers.
    Structures {
        artifact: PathBuf,
        dir: PathBuf,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ReducerArgs {
    #[arg(long)]
    n_neighbors: Option<usize>,
    #[arg(long)]
    metric: Option<String>,
    #[arg(long)]
    random_state: Option<u64>,
    #[arg(long)]
    min_dist: Option<f64>,
    #[arg(long)]
    perplexity: Option<f64>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long = "mn-ratio")]
    mn_ratio: Option<f64>,
    #[arg(long = "fp-ratio")]
    fp_ratio: Option<f64>,
    #[arg(long)]
    n_init: Option<usize>,
    #[arg(long)]
    max_iter: Option<usize>,
    #[arg(long)]
    eps: Option<f64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = load_config(&config_path)?;

    match cli.command {
        Commands::Prepare {
            input,
            matrix,
            matrix_kind,
            metadata,
            output,
            methods,
            overwrite,
            styles,
            reducer,
        } => {
            apply_reducer_args(&mut config, &reducer)?;
            let source = if matrix {
                let kind = matrix_kind
                    .parse::<MatrixKind>()
                    .with_context(|| format!("invalid --matrix-kind {matrix_kind}"))?;
                InputSource::Matrix { path: input, kind }
            } else {
                InputSource::Embeddings(input)
            };
            let methods = MethodSpec::parse_list(&methods)
                .with_context(|| format!("invalid --methods {methods}"))?;
            let overrides = styles.as_deref().map(parse_overrides).transpose()?;
            let request = PrepareRequest {
                source,
                features: metadata,
                methods,
                output,
                overwrite,
                overrides,
            };
            let summary = Pipeline::new(&config)
                .prepare(&request)
                .with_context(|| format!("prepare failed for {}", request.output.display()))?;
            print_prepare_summary(&summary);
        }
        Commands::Style {
            artifact,
            styles,
            output,
        } => {
            let overrides = parse_overrides(&styles)?;
            let output = output.unwrap_or_else(|| artifact.clone());
            let applied = Pipeline::new(&config)
                .restyle(&artifact, &overrides, &output)
                .with_context(|| format!("failed to restyle {}", artifact.display()))?;
            println!("[protspace] Applied {applied} style entries -> {}", output.display());
        }
        Commands::Inspect {
            artifact,
            top,
            json,
        } => {
            let document = read_artifact(&artifact)
                .with_context(|| format!("failed to read {}", artifact.display()))?;
            let report = Inspection::measure(&document, top)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
        Commands::Structures {
            artifact,
            dir,
            json,
        } => {
            let document = read_artifact(&artifact)
                .with_context(|| format!("failed to read {}", artifact.display()))?;
            let files = gather_file_names(&dir)?;
            let matches = match_structure_files(document.identifiers(), files);
            if json {
                let value = serde_json::json!({
                    "matched": matches.matched,
                    "unmatched_files": matches.unmatched_files,
                    "without_structure": matches.without_structure,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "[protspace] Matched:           {}/{}",
                    matches.matched.len(),
                    document.len()
                );
                println!(
                    "[protspace] Unmatched files:   {}",
                    matches.unmatched_files.len()
                );
                for file in &matches.unmatched_files {
                    println!("  {file}");
                }
            }
        }
    }
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: &Path) -> Result<ProtspaceConfig> {
    ProtspaceConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn parse_overrides(input: &str) -> Result<StyleOverrides> {
    StyleOverrides::parse(input).context("invalid style overrides")
}

fn apply_reducer_args(config: &mut ProtspaceConfig, args: &ReducerArgs) -> Result<()> {
    let params = &mut config.reducer;
    if let Some(value) = args.n_neighbors {
        params.n_neighbors = value;
    }
    if let Some(value) = &args.metric {
        params.metric = value
            .parse::<Metric>()
            .with_context(|| format!("invalid --metric {value}"))?;
    }
    if let Some(value) = args.random_state {
        params.random_state = value;
    }
    if let Some(value) = args.min_dist {
        params.min_dist = value;
    }
    if let Some(value) = args.perplexity {
        params.perplexity = value;
    }
    if let Some(value) = args.learning_rate {
        params.learning_rate = value;
    }
    if let Some(value) = args.mn_ratio {
        params.mn_ratio = value;
    }
    if let Some(value) = args.fp_ratio {
        params.fp_ratio = value;
    }
    if let Some(value) = args.n_init {
        params.n_init = value;
    }
    if let Some(value) = args.max_iter {
        params.max_iter = value;
    }
    if let Some(value) = args.eps {
        params.eps = value;
    }
    params.validate()?;
    debug!(?params, "reducer parameters");
    Ok(())
}

fn gather_file_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if entry.file_type().is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn print_prepare_summary(summary: &PrepareSummary) {
    let report = &summary.merge;
    let mode = if summary.appended { "appended" } else { "created" };
    println!("[protspace] Artifact:          {} ({mode})", summary.output.display());
    if report.entities_adopted > 0 {
        println!("[protspace] Entities:          {}", report.entities_adopted);
    }
    if !report.projections_added.is_empty() {
        println!(
            "[protspace] Projections added: {}",
            report.projections_added.join(", ")
        );
    }
    if !report.projections_replaced.is_empty() {
        println!(
            "[protspace] Replaced:          {}",
            report.projections_replaced.join(", ")
        );
    }
    if !report.features_added.is_empty() {
        println!(
            "[protspace] Features added:    {}",
            report.features_added.join(", ")
        );
    }
    println!(
        "[protspace] Styles backfilled: {} colors, {} shapes",
        report.style.colors_added, report.style.shapes_added
    );
    for (feature, value, old, new) in &report.style.shapes_revalidated {
        println!("[protspace]   {feature}.{value}: {old} -> {new} (3D)");
    }
    if summary.overrides_applied > 0 {
        println!("[protspace] Overrides:         {}", summary.overrides_applied);
    }
    println!("[protspace] Elapsed:           {} ms", summary.elapsed_ms);
}
