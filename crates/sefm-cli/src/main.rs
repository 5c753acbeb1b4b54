//! CLI for sefm: pick the best spin-echo fieldmap pair per session and fix
//! BIDS sidecars.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sefm")]
#[command(about = "sefm: spin-echo fieldmap pair selection and BIDS sidecar correction")]
#[command(version = sefm_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select the best fieldmap pair of every session and correct its sidecars
    Run {
        /// Root of the BIDS dataset
        bids_dir: PathBuf,

        /// FSL installation directory (overrides the config file)
        #[arg(long)]
        fsl_dir: Option<PathBuf>,

        /// Only process these participants (with or without the `sub-` prefix)
        #[arg(long, num_args = 1..)]
        participant_label: Vec<String>,

        /// Keep registered and averaged volumes for inspection
        #[arg(long)]
        debug: bool,

        /// Base directory for per-session work dirs (default: the session's fmap dir)
        #[arg(long)]
        temp_dir: Option<PathBuf>,

        /// TOML config with [tools], [run] and [[manufacturer]] sections
        #[arg(long)]
        config: Option<PathBuf>,

        /// Where to write the run report (default: <BIDS_DIR>/sefm_report.json)
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Apply readout-time, IntendedFor and SliceTiming corrections to every sidecar
    Correct {
        /// Root of the BIDS dataset
        bids_dir: PathBuf,
    },

    /// Print eta-squared of CANDIDATE against REFERENCE
    Eta {
        reference: PathBuf,
        candidate: PathBuf,
    },

    /// Read or edit a single sidecar field
    Sidecar {
        #[command(subcommand)]
        action: SidecarAction,
    },
}

#[derive(Subcommand)]
enum SidecarAction {
    /// Print a field as JSON
    Get { json: PathBuf, field: String },

    /// Set a field. VALUE is parsed as JSON, falling back to a plain string
    Set {
        json: PathBuf,
        field: String,
        value: String,
    },

    /// Remove a field
    Remove { json: PathBuf, field: String },
}

fn main() {
    commands::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            bids_dir,
            fsl_dir,
            participant_label,
            debug,
            temp_dir,
            config,
            report,
        } => commands::run::run(commands::run::RunCommandConfig {
            bids_dir: &bids_dir,
            fsl_dir: fsl_dir.as_deref(),
            participants: &participant_label,
            debug,
            temp_dir: temp_dir.as_deref(),
            config_path: config.as_deref(),
            report_path: report.as_deref(),
        }),
        Commands::Correct { bids_dir } => commands::correct::run(&bids_dir),
        Commands::Eta {
            reference,
            candidate,
        } => commands::eta::run(&reference, &candidate),
        Commands::Sidecar { action } => match action {
            SidecarAction::Get { json, field } => commands::sidecar::get(&json, &field),
            SidecarAction::Set { json, field, value } => {
                commands::sidecar::set(&json, &field, &value)
            }
            SidecarAction::Remove { json, field } => commands::sidecar::remove(&json, &field),
        },
    }
}
