use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use curate_core::config::{CurateConfig, VcsMode};
use curate_runner::asl::VolumeType;
use curate_runner::editors::{TimeOutcome, TimeRoundingReport, DEFAULT_TIME_REPORT};
use curate_runner::group_rename::GroupRenameOptions;
use curate_runner::qc::{SliceOptions, T1HtmlOptions};
use curate_runner::{Action, OperationReport, Skipped};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "curate", version = "0.3.0", about = "BIDS dataset curation utilities")]
struct Cli {
    /// YAML config; defaults to `.curate.yaml` in the working directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured and per-command version-control mode.
    #[arg(long, value_enum, global = true)]
    vcs: Option<VcsArg>,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VcsArg {
    #[value(name = "git")]
    Git,
    #[value(name = "filesystem")]
    Filesystem,
}

impl From<VcsArg> for VcsMode {
    fn from(value: VcsArg) -> Self {
        match value {
            VcsArg::Git => VcsMode::Git,
            VcsArg::Filesystem => VcsMode::Filesystem,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VolumeArg {
    #[value(name = "label")]
    Label,
    #[value(name = "control")]
    Control,
}

impl From<VolumeArg> for VolumeType {
    fn from(value: VolumeArg) -> Self {
        match value {
            VolumeArg::Label => VolumeType::Label,
            VolumeArg::Control => VolumeType::Control,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    RemoveRun {
        bids_dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    FixRunRec {
        bids_dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    RenameM0scans {
        root: PathBuf,
        #[arg(long, default_value = "ses-1")]
        session: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    CleanupMultiruns {
        bids_dir: PathBuf,
        #[arg(long)]
        sheet: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    RenameKpgRuns {
        bids_dir: PathBuf,
        #[arg(long)]
        files_tsv: PathBuf,
        /// KeyParamGroup to collapse; repeatable. Defaults to the three run-02 groups.
        #[arg(long = "group")]
        groups: Vec<String>,
        #[arg(long, default_value = "ses-1")]
        session: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    GroupRename {
        bids_dir: PathBuf,
        #[arg(long)]
        summary_tsv: PathBuf,
        #[arg(long)]
        files_tsv: PathBuf,
        #[arg(long)]
        rename_log: PathBuf,
        #[arg(long)]
        search_term: String,
        #[arg(long = "delete-pattern")]
        delete_patterns: Vec<String>,
        #[arg(long)]
        delete_log: Option<PathBuf>,
        #[arg(long)]
        acq_rename_map: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    FixSessions {
        subject_dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    CopyPerfusion {
        source: PathBuf,
        dest: PathBuf,
        #[arg(long, default_value = "ses-1")]
        session: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    StripBidsUri {
        bids_dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    RoundAcqTime {
        bids_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_TIME_REPORT)]
        report: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    BackgroundSuppression {
        bids_dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    PerfMetadata {
        bids_dir: PathBuf,
        #[arg(long, default_value = "ses-1")]
        session: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    AslOddVolumes {
        bids_dir: PathBuf,
        #[arg(long, value_enum, default_value = "label")]
        first: VolumeArg,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    FracbackEvents {
        #[arg(long)]
        xml: PathBuf,
        #[arg(long)]
        logs_dir: PathBuf,
        #[arg(long)]
        session_map: PathBuf,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    MatchFracback {
        bids_root: PathBuf,
        subjects_root: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    BlockEvents {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    FindMultiruns {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        json: bool,
    },
    InitParticipants {
        bids_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Phenotype {
        #[command(subcommand)]
        command: PhenotypeCommands,
    },
    Qc {
        #[command(subcommand)]
        command: QcCommands,
    },
}

#[derive(Subcommand)]
enum PhenotypeCommands {
    Summarize {
        subjects_root: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Extract {
        subjects_root: PathBuf,
        #[arg(long)]
        subfield: String,
        /// Field path to drop; repeatable and comma-separated.
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Separate {
        input: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        no_misc: bool,
        #[arg(long)]
        json: bool,
    },
    Score {
        input_dir: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum QcCommands {
    Xcpd {
        xcpd_dir: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, default_value = curate_runner::qc::DEFAULT_ATLAS)]
        atlas: String,
        #[arg(long)]
        json: bool,
    },
    Qsi {
        #[arg(long)]
        qsiprep: PathBuf,
        #[arg(long)]
        qsirecon: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Build the T1w rating page, optionally rendering slices from NIfTI first.
    #[command(name = "t1-html")]
    T1Html {
        /// Directory holding `sub-*_ses-*_VIEW.png`; defaults to the PNG output dir.
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, num_args = 1.., default_values_t = curate_runner::qc::t1::DEFAULT_VIEWS.map(String::from))]
        views: Vec<String>,
        #[arg(long, default_value = curate_runner::qc::t1::DEFAULT_PNG_PATTERN)]
        pattern: String,
        #[arg(long)]
        allow_missing: bool,
        #[arg(long)]
        portable: bool,
        #[arg(long)]
        generate_from_nifti: bool,
        #[arg(long)]
        nifti_root: Option<PathBuf>,
        #[arg(long, default_value = curate_runner::qc::t1::DEFAULT_NIFTI_PATTERN)]
        nifti_pattern: String,
        #[arg(long)]
        png_outdir: Option<PathBuf>,
        #[arg(long, num_args = 2, default_values_t = curate_runner::qc::t1::DEFAULT_SAGITTAL)]
        sag_fracs: Vec<f64>,
        #[arg(long, num_args = 2, default_values_t = curate_runner::qc::t1::DEFAULT_AXIAL)]
        axi_fracs: Vec<f64>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let json_mode = command_json_mode(&cli.command);
    let result = load_config(cli.config.as_deref(), cli.vcs)
        .and_then(|config| run_command(cli.command, &config));
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

fn load_config(explicit: Option<&Path>, vcs: Option<VcsArg>) -> Result<CurateConfig> {
    let cwd = std::env::current_dir()?;
    let mut config = CurateConfig::resolve(explicit, &cwd)?;
    if let Some(mode) = vcs {
        config.vcs = Some(mode.into());
    }
    Ok(config)
}

fn run_command(command: Commands, config: &CurateConfig) -> Result<Option<Value>> {
    let dry = |flag: bool| flag || config.dry_run;
    match command {
        Commands::RemoveRun { bids_dir, dry_run, json } => {
            let mover = config.mover(VcsMode::Filesystem, dry(dry_run));
            let report = curate_runner::entities::remove_run_entities(&bids_dir, mover.as_ref())?;
            return finish_report("remove-run", &report, json);
        }
        Commands::FixRunRec { bids_dir, dry_run, json } => {
            let mover = config.mover(VcsMode::Filesystem, dry(dry_run));
            let report = curate_runner::entities::fix_run_rec_order(&bids_dir, mover.as_ref())?;
            return finish_report("fix-run-rec", &report, json);
        }
        Commands::RenameM0scans {
            root,
            session,
            dry_run,
            json,
        } => {
            let mover = config.mover(VcsMode::Git, dry(dry_run));
            let report = curate_runner::entities::rename_m0scans(&root, &session, mover.as_ref())?;
            return finish_report("rename-m0scans", &report, json);
        }
        Commands::CleanupMultiruns {
            bids_dir,
            sheet,
            dry_run,
            json,
        } => {
            let mover = config.mover(VcsMode::Git, dry(dry_run));
            let report = curate_runner::multirun::cleanup_multiruns(&bids_dir, &sheet, mover.as_ref())?;
            return finish_report("cleanup-multiruns", &report, json);
        }
        Commands::RenameKpgRuns {
            bids_dir,
            files_tsv,
            groups,
            session,
            dry_run,
            json,
        } => {
            let groups = if groups.is_empty() {
                curate_runner::multirun::DEFAULT_RUN_GROUPS
                    .iter()
                    .map(|g| g.to_string())
                    .collect()
            } else {
                groups
            };
            let mover = config.mover(VcsMode::Git, dry(dry_run));
            let report = curate_runner::multirun::rename_group_runs(
                &bids_dir,
                &files_tsv,
                &groups,
                &session,
                mover.as_ref(),
            )?;
            return finish_report("rename-kpg-runs", &report, json);
        }
        Commands::GroupRename {
            bids_dir,
            summary_tsv,
            files_tsv,
            rename_log,
            search_term,
            delete_patterns,
            delete_log,
            acq_rename_map,
            dry_run,
            json,
        } => {
            let acq_map = match &acq_rename_map {
                Some(path) => curate_runner::group_rename::load_acq_map(path)?,
                None => Vec::new(),
            };
            let opts = GroupRenameOptions {
                bids_dir,
                summary_tsv,
                files_tsv,
                rename_log,
                search_term,
                delete_patterns,
                delete_log,
                acq_map,
            };
            let mover = config.mover(VcsMode::Git, dry(dry_run));
            let result = curate_runner::group_rename::group_rename(&opts, mover.as_ref())?;
            if json {
                let mut payload = report_to_json("group-rename", &result.operations);
                payload["renamed"] = json!(result
                    .renamed
                    .iter()
                    .map(|(src, dst)| json!({"src": path_str(src), "dst": path_str(dst)}))
                    .collect::<Vec<_>>());
                payload["deleted"] = json!(result.deleted.iter().map(|p| path_str(p)).collect::<Vec<_>>());
                return Ok(Some(payload));
            }
            print_report(&result.operations);
            println!("renamed: {}", result.renamed.len());
            println!("deleted: {}", result.deleted.len());
            println!("rename_log: {}", opts.rename_log.display());
        }
        Commands::FixSessions {
            subject_dir,
            dry_run,
            json,
        } => {
            let report = curate_runner::dataset::fix_sessions(&subject_dir, dry(dry_run))?;
            return finish_report("fix-sessions", &report, json);
        }
        Commands::CopyPerfusion {
            source,
            dest,
            session,
            dry_run,
            json,
        } => {
            let report = curate_runner::dataset::copy_perfusion(&source, &dest, &session, dry(dry_run))?;
            return finish_report("copy-perfusion", &report, json);
        }
        Commands::StripBidsUri { bids_dir, dry_run, json } => {
            let report = curate_runner::editors::strip_bids_uris(&bids_dir, dry(dry_run))?;
            return finish_report("strip-bids-uri", &report, json);
        }
        Commands::RoundAcqTime {
            bids_dir,
            report,
            dry_run,
            json,
        } => {
            let result = curate_runner::editors::round_acquisition_times(&bids_dir, &report, dry(dry_run))?;
            if json {
                return Ok(Some(time_report_to_json(&result, &report)));
            }
            println!("scanned: {}", result.scanned);
            println!("with_acquisition_time: {}", result.entries.len());
            println!("changed: {}", result.changed());
            println!("skipped: {}", result.unparseable());
            println!("errors: {}", result.errors.len());
            println!("report: {}", report.display());
        }
        Commands::BackgroundSuppression { bids_dir, dry_run, json } => {
            let report = curate_runner::editors::set_background_suppression(&bids_dir, dry(dry_run))?;
            return finish_report("background-suppression", &report, json);
        }
        Commands::PerfMetadata {
            bids_dir,
            session,
            dry_run,
            json,
        } => {
            let report = curate_runner::editors::sync_perf_metadata(&bids_dir, &session, dry(dry_run))?;
            return finish_report("perf-metadata", &report, json);
        }
        Commands::AslOddVolumes {
            bids_dir,
            first,
            dry_run,
            json,
        } => {
            let report = curate_runner::asl::fix_odd_volumes(&bids_dir, first.into(), dry(dry_run))?;
            return finish_report("asl-odd-volumes", &report, json);
        }
        Commands::FracbackEvents {
            xml,
            logs_dir,
            session_map,
            output_dir,
            dry_run,
            json,
        } => {
            let opts = curate_runner::events::FracbackOptions {
                xml,
                logs_dir,
                output_dir,
                session_map,
                dry_run: dry(dry_run),
            };
            let result = curate_runner::events::convert_fracback(&opts)?;
            let sessions = result
                .sessions
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "fracback-events",
                    "dry_run": result.dry_run,
                    "sessions": sessions,
                    "skipped": skipped_to_json(&result.skipped),
                    "errors": skipped_to_json(&result.errors),
                })));
            }
            if result.dry_run {
                for session in &sessions {
                    emit_json(session);
                }
            } else {
                for s in &result.sessions {
                    println!("events: {} ({} rows)", s.events_tsv.display(), s.num_events);
                }
            }
            print_skips(&result.skipped, &result.errors);
            println!("sessions: {}", result.sessions.len());
        }
        Commands::MatchFracback {
            bids_root,
            subjects_root,
            out,
            json,
        } => {
            let rows = curate_runner::events::match_fracback_logs(&bids_root, &subjects_root, &out)?;
            let paired = rows.iter().filter(|r| r.func.is_some() && r.log.is_some()).count();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "match-fracback",
                    "rows": rows.len(),
                    "paired": paired,
                    "out": path_str(&out),
                })));
            }
            println!("rows: {}", rows.len());
            println!("paired: {}", paired);
            println!("out: {}", out.display());
        }
        Commands::BlockEvents { inputs, out, json } => {
            let events = curate_runner::events::merge_block_files(inputs.as_slice(), &out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "block-events",
                    "events": events.len(),
                    "out": path_str(&out),
                })));
            }
            println!("events: {}", events.len());
            println!("out: {}", out.display());
        }
        Commands::FindMultiruns { input, output, json } => {
            let rows = curate_runner::multirun::find_multiruns(&input, &output)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "find-multiruns",
                    "rows": rows,
                    "out": path_str(&output),
                })));
            }
            println!("rows: {}", rows);
            println!("out: {}", output.display());
        }
        Commands::InitParticipants { bids_dir, json } => {
            let (path, count) = curate_runner::dataset::init_participants(&bids_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init-participants",
                    "participants": count,
                    "out": path_str(&path),
                })));
            }
            println!("participants: {}", count);
            println!("out: {}", path.display());
        }
        Commands::Phenotype { command } => return run_phenotype(command),
        Commands::Qc { command } => return run_qc(command),
    }
    Ok(None)
}

fn run_phenotype(command: PhenotypeCommands) -> Result<Option<Value>> {
    match command {
        PhenotypeCommands::Summarize {
            subjects_root,
            out,
            json,
        } => {
            let summary = curate_runner::phenotype::summarize_info(&subjects_root, &out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "phenotype-summarize",
                    "candidates": summary.candidates,
                    "subjects": summary.subjects,
                    "fields": summary.fields.len(),
                    "out": path_str(&out),
                })));
            }
            println!("candidates: {}", summary.candidates);
            println!("subjects: {}", summary.subjects);
            println!("fields: {}", summary.fields.len());
            println!("out: {}", out.display());
        }
        PhenotypeCommands::Extract {
            subjects_root,
            subfield,
            excludes,
            out,
            json,
        } => {
            let excludes = curate_runner::phenotype::split_excludes(&excludes);
            let (rows, cols) =
                curate_runner::phenotype::extract_info_subfield(&subjects_root, &subfield, &excludes, &out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "phenotype-extract",
                    "rows": rows,
                    "columns": cols,
                    "out": path_str(&out),
                })));
            }
            println!("rows: {}", rows);
            println!("columns: {}", cols);
            println!("out: {}", out.display());
        }
        PhenotypeCommands::Separate {
            input,
            out_dir,
            no_misc,
            json,
        } => {
            let report = curate_runner::phenotype::separate_instruments(&input, &out_dir, !no_misc)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "phenotype-separate",
                    "instruments": report
                        .instruments
                        .iter()
                        .map(|(name, path)| json!({"instrument": name, "path": path_str(path)}))
                        .collect::<Vec<_>>(),
                    "misc": report.misc.as_deref().map(path_str),
                })));
            }
            for (name, path) in &report.instruments {
                println!("{}: {}", name, path.display());
            }
            if let Some(misc) = &report.misc {
                println!("misc: {}", misc.display());
            }
        }
        PhenotypeCommands::Score {
            input_dir,
            out_dir,
            json,
        } => {
            let report = curate_runner::phenotype::score_instruments(&input_dir, out_dir.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "phenotype-score",
                    "scored": report.scored.iter().map(|p| path_str(p)).collect::<Vec<_>>(),
                    "skipped": report.skipped,
                })));
            }
            for path in &report.scored {
                println!("scored: {}", path.display());
            }
            for name in &report.skipped {
                println!("no scorer: {}", name);
            }
        }
    }
    Ok(None)
}

fn run_qc(command: QcCommands) -> Result<Option<Value>> {
    match command {
        QcCommands::Xcpd {
            xcpd_dir,
            out_dir,
            atlas,
            json,
        } => {
            let report = curate_runner::qc::xcpd_qc(&xcpd_dir, &out_dir, &atlas)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "qc-xcpd",
                    "motion_files": report.motion_files,
                    "coverage_files": report.coverage_files,
                    "outputs": report.outputs.iter().map(|p| path_str(p)).collect::<Vec<_>>(),
                })));
            }
            println!("motion_files: {}", report.motion_files);
            println!("coverage_files: {}", report.coverage_files);
            for path in &report.outputs {
                println!("wrote: {}", path.display());
            }
        }
        QcCommands::Qsi {
            qsiprep,
            qsirecon,
            out_dir,
            json,
        } => {
            let report = curate_runner::qc::qsi_qc(&qsiprep, &qsirecon, &out_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "qc-qsi",
                    "pivoted": report.pivoted.len(),
                    "volume_rows": report.volume_rows,
                    "image_qc_rows": report.image_qc_rows,
                    "outputs": report.outputs.iter().map(|p| path_str(p)).collect::<Vec<_>>(),
                })));
            }
            println!("pivoted: {}", report.pivoted.len());
            println!("volume_rows: {}", report.volume_rows);
            println!("image_qc_rows: {}", report.image_qc_rows);
            for path in &report.outputs {
                println!("wrote: {}", path.display());
            }
        }
        QcCommands::T1Html {
            root,
            out,
            views,
            pattern,
            allow_missing,
            portable,
            generate_from_nifti,
            nifti_root,
            nifti_pattern,
            png_outdir,
            sag_fracs,
            axi_fracs,
            json,
        } => {
            let mut slices = None;
            let root = if generate_from_nifti {
                let nifti_root = nifti_root
                    .ok_or_else(|| anyhow!("--nifti-root is required with --generate-from-nifti"))?;
                let png_dir = match png_outdir.or_else(|| root.clone()) {
                    Some(dir) => dir,
                    None => std::env::current_dir()?.join("t1_qc_pngs"),
                };
                let mut opts = SliceOptions::new(nifti_root, &png_dir);
                opts.nifti_pattern = nifti_pattern;
                opts.sagittal = fraction_pair(&sag_fracs)?;
                opts.axial = fraction_pair(&axi_fracs)?;
                slices = Some(curate_runner::qc::generate_slices(&opts)?);
                root.unwrap_or(png_dir)
            } else {
                root.ok_or_else(|| anyhow!("--root is required unless --generate-from-nifti is set"))?
            };
            let mut opts = T1HtmlOptions::new(root, out);
            opts.views = views;
            opts.pattern = pattern;
            opts.allow_missing = allow_missing;
            opts.portable = portable;
            let report = curate_runner::qc::t1_qc_html(&opts)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "qc-t1-html",
                    "html": path_str(&report.html),
                    "rows": report.rows,
                    "views": report.views,
                    "copied": report.copied,
                    "pngs": slices.as_ref().map(|s| s.pngs.len()),
                    "failed": slices.as_ref().map(|s| s
                        .failed
                        .iter()
                        .map(|(p, e)| json!({"path": path_str(p), "error": e}))
                        .collect::<Vec<_>>()),
                })));
            }
            if let Some(slices) = &slices {
                println!("nifti_images: {}", slices.images);
                println!("pngs: {}", slices.pngs.len());
                for (path, err) in &slices.failed {
                    println!("FAILED: {}: {}", path.display(), err);
                }
            }
            println!("wrote: {}", report.html.display());
            println!("rows: {} | views per row: {}", report.rows, report.views);
            if report.copied > 0 {
                println!("copied: {} (share the page together with its assets/ folder)", report.copied);
            }
        }
    }
    Ok(None)
}

fn fraction_pair(values: &[f64]) -> Result<[f64; 2]> {
    match values {
        [a, b] if (0.0..=1.0).contains(a) && (0.0..=1.0).contains(b) => Ok([*a, *b]),
        _ => Err(anyhow!("slice fractions must be two values in [0, 1], got {:?}", values)),
    }
}

fn finish_report(command: &str, report: &OperationReport, json: bool) -> Result<Option<Value>> {
    if json {
        return Ok(Some(report_to_json(command, report)));
    }
    print_report(report);
    Ok(None)
}

fn print_report(report: &OperationReport) {
    for action in &report.actions {
        println!("{}", action);
    }
    print_skips(&report.skipped, &report.errors);
    println!("dry_run: {}", report.dry_run);
    println!("actions: {}", report.actions.len());
    println!("skipped: {}", report.skipped.len());
    println!("errors: {}", report.errors.len());
}

fn print_skips(skipped: &[Skipped], errors: &[Skipped]) {
    for s in skipped {
        println!("SKIP: {} ({})", s.path.display(), s.reason);
    }
    for e in errors {
        println!("ERROR: {} ({})", e.path.display(), e.reason);
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::RemoveRun { json, .. }
        | Commands::FixRunRec { json, .. }
        | Commands::RenameM0scans { json, .. }
        | Commands::CleanupMultiruns { json, .. }
        | Commands::RenameKpgRuns { json, .. }
        | Commands::GroupRename { json, .. }
        | Commands::FixSessions { json, .. }
        | Commands::CopyPerfusion { json, .. }
        | Commands::StripBidsUri { json, .. }
        | Commands::RoundAcqTime { json, .. }
        | Commands::BackgroundSuppression { json, .. }
        | Commands::PerfMetadata { json, .. }
        | Commands::AslOddVolumes { json, .. }
        | Commands::FracbackEvents { json, .. }
        | Commands::MatchFracback { json, .. }
        | Commands::BlockEvents { json, .. }
        | Commands::FindMultiruns { json, .. }
        | Commands::InitParticipants { json, .. } => *json,
        Commands::Phenotype { command } => match command {
            PhenotypeCommands::Summarize { json, .. }
            | PhenotypeCommands::Extract { json, .. }
            | PhenotypeCommands::Separate { json, .. }
            | PhenotypeCommands::Score { json, .. } => *json,
        },
        Commands::Qc { command } => match command {
            QcCommands::Xcpd { json, .. }
            | QcCommands::Qsi { json, .. }
            | QcCommands::T1Html { json, .. } => *json,
        },
    }
}

fn action_to_json(action: &Action) -> Value {
    let mut value = match action {
        Action::Rename { src, dst } | Action::Copy { src, dst } => {
            json!({"src": path_str(src), "dst": path_str(dst)})
        }
        Action::Remove { path } | Action::Write { path } => json!({"path": path_str(path)}),
        Action::Update { path, details } => json!({"path": path_str(path), "details": details}),
    };
    value["kind"] = json!(action.kind());
    value
}

fn skipped_to_json(items: &[Skipped]) -> Value {
    json!(items
        .iter()
        .map(|s| json!({"path": path_str(&s.path), "reason": s.reason}))
        .collect::<Vec<_>>())
}

fn report_to_json(command: &str, report: &OperationReport) -> Value {
    json!({
        "ok": true,
        "command": command,
        "dry_run": report.dry_run,
        "actions": report.actions.iter().map(action_to_json).collect::<Vec<_>>(),
        "skipped": skipped_to_json(&report.skipped),
        "errors": skipped_to_json(&report.errors),
    })
}

fn time_report_to_json(report: &TimeRoundingReport, report_path: &Path) -> Value {
    let entries: Vec<Value> = report
        .entries
        .iter()
        .map(|e| match &e.outcome {
            TimeOutcome::Rounded {
                before,
                after,
                changed,
            } => json!({
                "path": path_str(&e.path),
                "before": before,
                "after": after,
                "changed": changed,
            }),
            TimeOutcome::Skipped { before, reason } => json!({
                "path": path_str(&e.path),
                "before": before,
                "skipped": reason,
            }),
        })
        .collect();
    json!({
        "ok": true,
        "command": "round-acq-time",
        "dry_run": report.dry_run,
        "scanned": report.scanned,
        "changed": report.changed(),
        "unparseable": report.unparseable(),
        "entries": entries,
        "errors": report
            .errors
            .iter()
            .map(|(p, msg)| json!({"path": path_str(p), "reason": msg}))
            .collect::<Vec<_>>(),
        "report": path_str(report_path),
    })
}
