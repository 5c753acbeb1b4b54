//! `sefm run`: select fieldmap pairs and correct sidecars for a dataset.

use std::path::{Path, PathBuf};

use sefm_core::{
    ActiveWorkdirs, DatasetIndex, FslTools, PipelineConfig, REPORT_FILE, RunReport,
    SessionDriver,
};

use super::fail;

pub struct RunCommandConfig<'a> {
    pub bids_dir: &'a Path,
    pub fsl_dir: Option<&'a Path>,
    pub participants: &'a [String],
    pub debug: bool,
    pub temp_dir: Option<&'a Path>,
    pub config_path: Option<&'a Path>,
    pub report_path: Option<&'a Path>,
}

/// Config file (if any) with command-line flags applied on top.
fn build_config(cmd: &RunCommandConfig<'_>) -> sefm_core::Result<PipelineConfig> {
    let mut config = match cmd.config_path {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = cmd.fsl_dir {
        config.tools.fsl_dir = dir.to_path_buf();
    }
    if let Some(dir) = cmd.temp_dir {
        config.temp_dir = Some(dir.to_path_buf());
    }
    config.debug |= cmd.debug;
    Ok(config.with_participants(cmd.participants))
}

/// Delete in-progress work dirs on Ctrl+C, then exit.
fn ctrlc_handler(workdirs: &ActiveWorkdirs) {
    let workdirs = workdirs.clone();
    let installed = ctrlc::set_handler(move || {
        let removed = workdirs.purge();
        eprintln!("\nInterrupted; removed {removed} work dir(s). Rerun the cancelled session.");
        std::process::exit(130);
    });
    if let Err(e) = installed {
        log::warn!("Could not install Ctrl+C handler: {e}");
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Run {}", report.id);
    for session in &report.sessions {
        let key = session.key().to_string();
        if session.succeeded {
            match session.selected.and_then(|i| session.pairs.get(i)) {
                Some(pair) => println!(
                    "  ok      {key:<24} pair {} (min eta {:.4})",
                    pair.index, pair.score
                ),
                None => println!("  ok      {key}"),
            }
        } else {
            println!(
                "  FAILED  {key:<24} {}",
                session.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!(
        "\n{} succeeded, {} failed",
        report.succeeded().count(),
        report.failed().count()
    );
}

pub fn run(cmd: RunCommandConfig<'_>) {
    let config = build_config(&cmd).unwrap_or_else(|e| fail("configuration", e));

    let tools = FslTools::new(config.tools.clone());
    if !tools.is_available() {
        fail(
            "FSL not found",
            format!("no flirt under {}", config.tools.bin_dir().display()),
        );
    }

    let mut index = DatasetIndex::scan(cmd.bids_dir)
        .unwrap_or_else(|e| fail("cannot index dataset", e));
    println!(
        "Indexed {} image(s) under {}",
        index.len(),
        cmd.bids_dir.display()
    );

    let workdirs = ActiveWorkdirs::new();
    ctrlc_handler(&workdirs);

    let report = SessionDriver::new(&config, &tools)
        .with_workdirs(workdirs)
        .run(&mut index);
    print_summary(&report);

    let report_path = cmd
        .report_path
        .map_or_else(|| cmd.bids_dir.join(REPORT_FILE), PathBuf::from);
    match report.write(&report_path) {
        Ok(()) => println!("Report written to {}", report_path.display()),
        Err(e) => eprintln!("Warning: could not write report: {e}"),
    }

    if report.has_failures() {
        std::process::exit(1);
    }
}
