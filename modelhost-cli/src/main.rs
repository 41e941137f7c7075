use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use modelhost_core::FrameworkFamily;
use modelhost_core::PredictorRegistry;
use modelhost_core::codec::decode_structured;
use modelhost_core::codec::read_sparse_column_names;
use modelhost_core::codec::resolve_mimetype_by_filename;
use modelhost_core::config::default_config_path;
use modelhost_core::hooks::list_manifests;
use modelhost_core::load_runner_config;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modelhost")]
#[command(
    about = "Inspect model directories, payloads and runner configuration",
    long_about = None
)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[arg(long, short, global = true, help = "Show verbose debug output")]
    verbose: bool,

    #[arg(
        long,
        global = true,
        help = "Runner configuration file (defaults to $XDG_CONFIG_HOME/modelhost/config.toml)"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show the resolved runner configuration")]
    Info,

    #[command(about = "Report hook manifests and the model artifact in a code directory")]
    Inspect {
        #[arg(help = "Model code directory")]
        code_dir: PathBuf,
    },

    #[command(about = "Decode a CSV or MTX payload the way the prediction server would")]
    Decode {
        #[arg(help = "Payload file (.csv or .mtx)")]
        file: PathBuf,

        #[arg(long, help = "Column names file for sparse payloads, one per line")]
        sparse_columns: Option<PathBuf>,

        #[arg(
            long,
            short = 'n',
            default_value = "5",
            help = "Number of decoded rows to print"
        )]
        rows: usize,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Info => handle_info(cli.config.as_deref())?,
        Commands::Inspect { code_dir } => handle_inspect(&code_dir)?,
        Commands::Decode {
            file,
            sparse_columns,
            rows,
        } => handle_decode(&file, sparse_columns.as_deref(), rows)?,
    }

    Ok(())
}

fn handle_info(config_path: Option<&Path>) -> Result<()> {
    let config = load_runner_config(config_path)?;
    match config_path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) if path.exists() => println!("Loaded configuration from {}", path.display()),
        _ => println!("No configuration file found, using environment only"),
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    if let Some(log_dir) = config.telemetry_log_dir() {
        println!("Telemetry events are written under {}", log_dir.display());
    }
    Ok(())
}

fn handle_inspect(code_dir: &Path) -> Result<()> {
    if !code_dir.is_dir() {
        anyhow::bail!("'{}' is not a directory", code_dir.display());
    }
    println!("Code directory: {}", code_dir.display());

    let manifests = list_manifests(code_dir)?;
    match manifests.as_slice() {
        [] => println!("Hooks: none (no custom.toml found)"),
        [(path, module)] => println!("Hooks: module '{module}' from {}", path.display()),
        many => {
            println!("Hooks: {} manifests found, a model directory may hold only one:", many.len());
            for (path, module) in many {
                println!("  {} -> {module}", path.display());
            }
        }
    }

    let registry = PredictorRegistry::standard();
    match registry.detect_artifact(code_dir) {
        Ok(artifact) => {
            let extension = artifact
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
                .unwrap_or_default();
            let families: Vec<&str> = FrameworkFamily::ALL
                .into_iter()
                .filter(|family| family.extensions().contains(&extension.as_str()))
                .map(FrameworkFamily::name)
                .collect();
            println!("Artifact: {}", artifact.display());
            println!("Candidate frameworks: {}", families.join(", "));
        }
        Err(err) => println!("Artifact: {err}"),
    }
    Ok(())
}

fn handle_decode(file: &Path, sparse_columns: Option<&Path>, rows: usize) -> Result<()> {
    let payload =
        fs::read(file).with_context(|| format!("failed to read payload '{}'", file.display()))?;
    let colnames = sparse_columns
        .map(|path| {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read column names '{}'", path.display()))?;
            Ok::<_, anyhow::Error>(read_sparse_column_names(&bytes)?)
        })
        .transpose()?;

    let filename = file.file_name().map(|name| name.to_string_lossy().into_owned());
    let mimetype = resolve_mimetype_by_filename(filename.as_deref());
    let table = decode_structured(&payload, mimetype, colnames.as_deref())?;

    println!(
        "{} rows x {} columns ({mimetype}{})",
        table.num_rows(),
        table.num_columns(),
        if table.is_sparse() { ", sparse" } else { "" }
    );
    println!("Columns: {}", table.column_names().join(", "));
    for record in table.records().into_iter().take(rows) {
        println!("{}", serde_json::Value::Object(record));
    }
    Ok(())
}
