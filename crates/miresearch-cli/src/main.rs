use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::{info, warn, LevelFilter};
use miresearch_core::collection::{parse_scan_date, read_subject_numbers};
use miresearch_core::config::LogLevel;
use miresearch_core::logging::init_logger;
use miresearch_core::{Config, LoadRequest, SubjectId, SubjectList, SubjectRegistry};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "miresearch")]
#[command(about = "Organise medical imaging research subjects")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data root holding one directory per subject
    #[arg(short = 'y', long, global = true)]
    data_root: Option<PathBuf>,

    /// Subject ID prefix (guessed from the data root when not configured)
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Subject ID suffix, e.g. _NN
    #[arg(long, global = true, default_value = "")]
    suffix: String,

    /// Extra configuration file, read after the standard locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// No progress bars or console logging
    #[arg(long, global = true)]
    quiet: bool,

    #[command(flatten)]
    selection: Selection,
}

/// Which subjects a command acts on
#[derive(Args, Debug, Default)]
struct Selection {
    /// Subject numbers
    #[arg(short = 's', long = "subjects", global = true, num_args = 1..)]
    subjects: Vec<u64>,

    /// Subject number range, end exclusive
    #[arg(long, global = true, num_args = 2, value_names = ["START", "END"])]
    range: Vec<u64>,

    /// File of subject numbers
    #[arg(long, global = true)]
    subject_file: Option<PathBuf>,

    /// Every subject under the data root
    #[arg(long, global = true)]
    all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a DICOM study into a new or existing subject
    Load {
        /// DICOM directory, single file, or tar / tar.gz / zip archive
        source: PathBuf,

        /// Load into this subject number
        #[arg(long)]
        number: Option<u64>,

        /// Add to the subject even if it already exists
        #[arg(long)]
        force: bool,

        /// Anonymise with this patient name while loading
        #[arg(long)]
        anon: Option<String>,

        /// Load each subdirectory of SOURCE as its own study
        #[arg(long)]
        multi: bool,

        /// Always create a new subject, even if the study is already loaded
        #[arg(long)]
        ignore_uids: bool,
    },

    /// Print cached patient and study details
    Info {
        /// Every cached tag and series instead of the standard keys
        #[arg(long)]
        full: bool,
    },

    /// Print one summary line per subject
    Summary,

    /// Write the subject summary table to a CSV file
    SummaryCsv {
        /// Output file
        output: PathBuf,

        /// Extra metadata tags to add as columns
        #[arg(long, num_args = 1..)]
        tags: Vec<String>,
    },

    /// Replace the patient name in DICOM files and metadata
    Anonymise {
        /// Name to write (defaults to the configured anon_name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Write a tar archive of each subject and flag it archived
    Archive {
        /// Directory for the archives
        output_dir: PathBuf,

        /// Leave the RAW directory out of the archive
        #[arg(long)]
        exclude_raw: bool,
    },

    /// Rename a single subject
    Rename {
        /// New subject ID
        new_id: String,
    },

    /// Re-run post-processing
    RunPost,

    /// List subjects matching all the given criteria
    Query {
        #[arg(long)]
        patient_id: Option<String>,

        #[arg(long)]
        study_id: Option<String>,

        /// Case-insensitive part of the patient name
        #[arg(long)]
        name: Option<String>,

        /// Case-insensitive part of a series description
        #[arg(long)]
        series_description: Option<String>,

        /// First scan date, YYYYMMDD
        #[arg(long)]
        date_from: Option<String>,

        /// Last scan date, YYYYMMDD
        #[arg(long)]
        date_to: Option<String>,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Path to save configuration file
        #[arg(default_value = "miresearch.json")]
        path: PathBuf,
    },

    /// Print the effective configuration
    ShowConfig,
}

fn main() -> Result<(), anyhow::Error> {
    // Parse command line arguments
    let cli = Cli::parse();

    if let Commands::GenerateConfig { path } = &cli.command {
        Config::default().save_to_file(path)?;
        println!("Configuration file generated at: {}", path.display());
        return Ok(());
    }

    let (config, sources) = load_config(&cli)?;
    init_logging(&config)?;
    for source in &sources {
        info!("Using configuration file {}", source.display());
    }

    let open_registry = || -> anyhow::Result<SubjectRegistry> {
        Ok(SubjectRegistry::new(config.clone())?.with_suffix(cli.suffix.as_str()))
    };

    match &cli.command {
        // Written before any configuration was read
        Commands::GenerateConfig { .. } => {}

        Commands::ShowConfig => {
            println!("{}", config.to_json()?);
        }

        Commands::Load {
            source,
            number,
            force,
            anon,
            multi,
            ignore_uids,
        } => {
            let registry = open_registry()?;
            let request = LoadRequest {
                source: source.clone(),
                number: *number,
                force: *force,
                anon_name: anon.clone().or_else(|| config.anon_name.clone()),
                multi: *multi,
                ignore_uids: *ignore_uids,
            };
            let loaded = registry.load(&request)?;
            for subject in &loaded {
                println!("Loaded {} ({} files)", subject.id(), subject.count_dicoms());
            }
        }

        Commands::Info { full } => {
            let registry = open_registry()?;
            for subject in &selected(&registry, &cli.selection)? {
                println!("{}:", subject.id());
                let info = if *full {
                    subject
                        .info_full()
                        .with_context(|| format!("Reading metadata of {}", subject.id()))?
                } else {
                    subject.info()
                };
                for (key, value) in info {
                    println!("  {:<18} {}", key, value);
                }
            }
        }

        Commands::Summary => {
            let registry = open_registry()?;
            for row in selected(&registry, &cli.selection)?.table_rows() {
                println!("{}", row.fields().join("\t"));
            }
        }

        Commands::SummaryCsv { output, tags } => {
            let registry = open_registry()?;
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            let subjects = selection_or_all(&registry, &cli.selection)?;
            subjects.write_summary_csv(output, &tags)?;
            println!("Summary of {} subjects written to {}", subjects.len(), output.display());
        }

        Commands::Anonymise { name } => {
            let Some(name) = name.clone().or_else(|| config.anon_name.clone()) else {
                bail!("No anonymisation name given and none configured");
            };
            let registry = open_registry()?;
            for subject in &selected(&registry, &cli.selection)? {
                let count = subject
                    .anonymise(&name, registry.service())
                    .with_context(|| format!("Anonymising {}", subject.id()))?;
                println!("Anonymised {} ({} files)", subject.id(), count);
            }
        }

        Commands::Archive {
            output_dir,
            exclude_raw,
        } => {
            let registry = open_registry()?;
            for subject in &selected(&registry, &cli.selection)? {
                let archive = subject
                    .archive_to(output_dir, *exclude_raw)
                    .with_context(|| format!("Archiving {}", subject.id()))?;
                subject.set_archived()?;
                println!("Archived {} to {}", subject.id(), archive.display());
            }
        }

        Commands::Rename { new_id } => {
            let registry = open_registry()?;
            let subjects = selected(&registry, &cli.selection)?;
            let [subject] = subjects.as_slice() else {
                bail!("Rename needs exactly one subject, {} selected", subjects.len());
            };
            let renamed = subject.rename(SubjectId::parse_or_opaque(new_id))?;
            println!("Renamed {} to {}", subject.id(), renamed.id());
        }

        Commands::RunPost => {
            let registry = open_registry()?;
            let subjects = selected(&registry, &cli.selection)?;
            let done = registry.run_post_process(&subjects);
            println!("Post-processed {} of {} subjects", done, subjects.len());
        }

        Commands::Query {
            patient_id,
            study_id,
            name,
            series_description,
            date_from,
            date_to,
        } => {
            let registry = open_registry()?;
            let mut subjects = selection_or_all(&registry, &cli.selection)?;
            if let Some(patient_id) = patient_id {
                subjects = subjects.find_matching_patient_id(patient_id);
            }
            if let Some(study_id) = study_id {
                subjects = subjects.find_matching_study_id(study_id);
            }
            if let Some(name) = name {
                subjects = subjects.find_matching_name(name, None);
            }
            if let Some(description) = series_description {
                subjects = subjects.find_matching_series_description(description);
            }
            if date_from.is_some() || date_to.is_some() {
                let start = parse_scan_date(date_from.as_deref().unwrap_or("19000101"))?;
                let end = parse_scan_date(date_to.as_deref().unwrap_or("99991231"))?;
                subjects = subjects.filter_by_date_of_scan(start, end);
            }
            for subject in &subjects {
                println!("{}", subject.id());
            }
            info!("{} subjects matched", subjects.len());
        }
    }

    Ok(())
}

/// Standard configuration files, then `--config`, then command-line flags
fn load_config(cli: &Cli) -> anyhow::Result<(Config, Vec<PathBuf>)> {
    let mut paths = Config::search_paths();
    if let Some(explicit) = &cli.config {
        if !explicit.is_file() {
            bail!("Configuration file not found: {}", explicit.display());
        }
        paths.push(explicit.clone());
    }
    let (mut config, sources) = Config::load_layered(&paths)?;

    if let Some(data_root) = &cli.data_root {
        config.data_root = Some(data_root.clone());
    }
    if let Some(prefix) = &cli.prefix {
        config.subject_prefix = Some(prefix.clone());
    }
    if cli.quiet {
        config.quiet = true;
    }
    // Set log level based on verbosity
    config.log_level = match cli.verbose {
        0 => config.log_level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    config.validate()?;
    Ok((config, sources))
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let level = config.log_level.to_level_filter();
    match &config.log_dir {
        Some(log_dir) => init_logger(log_dir, level, config.quiet)?,
        None => {
            let console_level = if config.quiet { LevelFilter::Error } else { level };
            env_logger::Builder::new()
                .filter_level(console_level)
                .parse_default_env()
                .init();
        }
    }
    Ok(())
}

/// Subjects named by the selection flags; `--all` scans the data root
fn selection_list(registry: &SubjectRegistry, selection: &Selection) -> anyhow::Result<Option<SubjectList>> {
    if selection.all {
        return Ok(Some(registry.all_subjects()?));
    }

    let mut numbers = selection.subjects.clone();
    if let [start, end] = selection.range[..] {
        numbers.extend(start..end);
    }
    if let Some(file) = &selection.subject_file {
        numbers.extend(read_subject_numbers(file)?);
    }
    if numbers.is_empty() {
        return Ok(None);
    }
    Ok(Some(registry.subject_list(&numbers).reduce_to_set()))
}

/// Selected subjects that exist; an empty selection is an error
fn selected(registry: &SubjectRegistry, selection: &Selection) -> anyhow::Result<SubjectList> {
    let Some(list) = selection_list(registry, selection)? else {
        bail!("No subjects selected; use -s, --range, --subject-file or --all");
    };
    let existing = list.reduce_to_existing();
    if existing.len() < list.len() {
        warn!("{} selected subjects do not exist", list.len() - existing.len());
    }
    Ok(existing)
}

/// Selected subjects, or every subject when nothing is selected
fn selection_or_all(registry: &SubjectRegistry, selection: &Selection) -> anyhow::Result<SubjectList> {
    match selection_list(registry, selection)? {
        Some(list) => Ok(list.reduce_to_existing()),
        None => Ok(registry.all_subjects()?),
    }
}
