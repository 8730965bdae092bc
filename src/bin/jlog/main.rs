//! Binary entry point for the jlog administrative CLI.
#![forbid(unsafe_code)]

mod config;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use config::{CliConfig, Profile, ProfileUpdate};
use jlog::log::{
    format, locate_end, read_superblock, LogEnd, LogGeometry, LogOptions, RecordScanner,
    Superblock,
};
use jlog::primitives::io::{FileIo, StdFileIo};
use jlog::Lsn;

#[derive(Parser, Debug)]
#[command(
    name = "jlog",
    version,
    about = "Administrative CLI for journaling-filesystem logs",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "JLOG_CONFIG",
        value_name = "FILE",
        help = "CLI config file (defaults to the user config directory)"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Geometry profile from the config file")]
    profile: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct GeometryArgs {
    #[arg(long, help = "Log size in pages, including the two reserved pages")]
    pages: Option<u32>,

    #[arg(long, help = "Device block size in bytes")]
    block_size: Option<u32>,

    #[arg(
        long,
        value_name = "BLOCK",
        help = "Log lives inside a filesystem image starting at this block"
    )]
    inline_base: Option<u64>,
}

#[derive(Args, Debug)]
struct DeviceArgs {
    #[arg(value_name = "DEVICE", help = "Log device or image (falls back to the profile)")]
    device: Option<PathBuf>,

    #[command(flatten)]
    geometry: GeometryArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lay down an empty log.
    Format(DeviceArgs),
    /// Show the superblock.
    Inspect(DeviceArgs),
    /// Find the page holding the highest sequence number.
    LocateEnd(DeviceArgs),
    /// Decode records starting at a record boundary.
    Dump(DumpCmd),
    /// Manage geometry profiles.
    #[command(subcommand)]
    Profile(ProfileCmd),
}

#[derive(Args, Debug)]
struct DumpCmd {
    #[command(flatten)]
    target: DeviceArgs,

    #[arg(
        long,
        value_name = "SEQ:OFFSET",
        help = "Start LSN (defaults to the start of the last written page)"
    )]
    from: Option<String>,

    #[arg(long, default_value_t = 64, help = "Maximum records to print")]
    limit: usize,

    #[arg(long, help = "Include record data as hex")]
    hex: bool,
}

#[derive(Subcommand, Debug)]
enum ProfileCmd {
    /// Create or update a profile.
    Set {
        name: String,
        #[arg(long)]
        device: Option<PathBuf>,
        #[command(flatten)]
        geometry: GeometryArgs,
        #[arg(long)]
        buffer_pages: Option<usize>,
        #[arg(long, help = "Make this the default profile")]
        default: bool,
    },
    /// List profiles.
    List,
    /// Delete a profile.
    Delete { name: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct SuperblockReport {
    device: String,
    state: String,
    inline: bool,
    pages: u32,
    block_size: u32,
    serial: u32,
    end_page: u32,
    end_offset: usize,
    uuid: String,
    active: Vec<String>,
}

impl SuperblockReport {
    fn new(device: &str, sb: &Superblock) -> Self {
        let (end_page, end_offset) = sb.end_position();
        Self {
            device: device.to_string(),
            state: format!("{:?}", sb.state).to_lowercase(),
            inline: sb.inline,
            pages: sb.pages,
            block_size: sb.block_size,
            serial: sb.serial,
            end_page,
            end_offset,
            uuid: sb.uuid.to_string(),
            active: sb.active.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[derive(Serialize)]
struct RecordReport {
    start: String,
    end: String,
    kind: String,
    tid: u64,
    backchain: String,
    arg: u64,
    segments: usize,
    data_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Serialize)]
struct DumpReport {
    device: String,
    from: String,
    records: Vec<RecordReport>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ProfileList {
    default: Option<String>,
    profiles: Vec<Profile>,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.clone())?;
    let profile = resolve_profile(&config, cli.profile.as_deref())?;

    match cli.command {
        Command::Format(args) => {
            let (device, options) = resolve(&args, profile.as_ref())?;
            let io = StdFileIo::open(&device)?;
            let sb = format(&io, &options)?;
            let report = SuperblockReport::new(&device.display().to_string(), &sb);
            emit(cli.format, &report, || {
                println!(
                    "Formatted {} ({} pages, block size {}, uuid {})",
                    report.device, report.pages, report.block_size, report.uuid
                )
            })?;
        }
        Command::Inspect(args) => {
            let (device, options) = resolve(&args, profile.as_ref())?;
            let io = StdFileIo::open(&device)?;
            let sb = read_superblock(&io, &options.geometry())?;
            let report = SuperblockReport::new(&device.display().to_string(), &sb);
            emit(cli.format, &report, || print_superblock_text(&report))?;
        }
        Command::LocateEnd(args) => {
            let (device, options) = resolve(&args, profile.as_ref())?;
            let io = StdFileIo::open(&device)?;
            let (_, geometry) = open_geometry(&io, &options)?;
            let end = locate_end(&io, &geometry)?;
            emit(cli.format, &end, || print_end_text(&end))?;
        }
        Command::Dump(cmd) => {
            let (device, options) = resolve(&cmd.target, profile.as_ref())?;
            let io = StdFileIo::open(&device)?;
            let (_, geometry) = open_geometry(&io, &options)?;
            let from = match cmd.from.as_deref() {
                Some(raw) => parse_lsn(raw)?,
                None => {
                    let end = locate_end(&io, &geometry)?;
                    Lsn::from_parts(end.sequence, 0)
                }
            };
            let report = dump(&io, geometry, from, cmd.limit, cmd.hex, &device)?;
            emit(cli.format, &report, || print_dump_text(&report))?;
        }
        Command::Profile(cmd) => run_profile(cmd, &mut config, cli.format)?,
    }
    Ok(())
}

fn resolve_profile(
    config: &CliConfig,
    requested: Option<&str>,
) -> Result<Option<Profile>, Box<dyn Error>> {
    match requested {
        Some(name) => config
            .profile(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| format!("profile '{name}' not found").into()),
        None => Ok(config
            .default_profile_name()
            .and_then(|name| config.profile(name))
            .cloned()),
    }
}

/// Flags override the profile, the profile overrides defaults.
fn resolve(
    args: &DeviceArgs,
    profile: Option<&Profile>,
) -> Result<(PathBuf, LogOptions), Box<dyn Error>> {
    let device = args
        .device
        .clone()
        .or_else(|| profile.and_then(|p| p.device.clone()))
        .ok_or("no device given and the profile names none")?;
    let pages = args
        .geometry
        .pages
        .or(profile.and_then(|p| p.pages))
        .unwrap_or_else(|| LogOptions::default().geometry().pages);
    let inline_base = args
        .geometry
        .inline_base
        .or(profile.and_then(|p| p.inline_base));
    let mut options = match inline_base {
        Some(base) => LogOptions::inline(base, pages),
        None => LogOptions::external(pages),
    };
    if let Some(block_size) = args.geometry.block_size.or(profile.and_then(|p| p.block_size)) {
        options.block_size = block_size;
    }
    if let Some(buffer_pages) = profile.and_then(|p| p.buffer_pages) {
        options.buffer_pages = buffer_pages;
    }
    Ok((device, options))
}

/// Geometry of a formatted log; the size comes from its superblock.
fn open_geometry(
    io: &dyn FileIo,
    options: &LogOptions,
) -> Result<(Superblock, LogGeometry), Box<dyn Error>> {
    let requested = options.geometry();
    let sb = read_superblock(io, &requested)?;
    let geometry = LogGeometry {
        pages: sb.pages,
        block_size: sb.block_size,
        ..requested
    };
    geometry.validate()?;
    Ok((sb, geometry))
}

fn parse_lsn(raw: &str) -> Result<Lsn, Box<dyn Error>> {
    let (seq, off) = raw
        .split_once(':')
        .ok_or_else(|| format!("invalid LSN '{raw}', expected SEQ:OFFSET"))?;
    let seq: u64 = seq.trim().parse()?;
    let off: usize = off.trim().parse()?;
    if off >= jlog::log::LOG_PAGE_SIZE {
        return Err(format!("offset {off} lies outside a log page").into());
    }
    Ok(Lsn::from_parts(seq, off))
}

fn dump(
    io: &dyn FileIo,
    geometry: LogGeometry,
    from: Lsn,
    limit: usize,
    with_data: bool,
    device: &std::path::Path,
) -> Result<DumpReport, Box<dyn Error>> {
    let scanner = RecordScanner::new(io, geometry, from)?;
    let mut report = DumpReport {
        device: device.display().to_string(),
        from: from.to_string(),
        records: Vec::new(),
        error: None,
    };
    for record in scanner.take(limit) {
        match record {
            Ok(record) => report.records.push(RecordReport {
                start: record.start.to_string(),
                end: record.end.to_string(),
                kind: record.desc.kind.name().to_string(),
                tid: record.desc.tid,
                backchain: record.desc.backchain.to_string(),
                arg: record.desc.arg,
                segments: record.segments.len(),
                data_len: record.data.len(),
                data: with_data.then(|| hex::encode(&record.data)),
            }),
            Err(err) => {
                report.error = Some(err.to_string());
                break;
            }
        }
    }
    Ok(report)
}

fn run_profile(
    cmd: ProfileCmd,
    config: &mut CliConfig,
    format: OutputFormat,
) -> Result<(), Box<dyn Error>> {
    match cmd {
        ProfileCmd::Set {
            name,
            device,
            geometry,
            buffer_pages,
            default,
        } => {
            config.upsert_profile(
                &name,
                ProfileUpdate {
                    device,
                    pages: geometry.pages,
                    block_size: geometry.block_size,
                    buffer_pages,
                    inline_base: geometry.inline_base,
                },
            )?;
            if default {
                config.set_default_profile(Some(&name))?;
            }
            let path = config.persist()?;
            println!("Saved profile '{name}' to {}", path.display());
        }
        ProfileCmd::List => {
            let list = ProfileList {
                default: config.default_profile_name().map(str::to_string),
                profiles: config.profiles().cloned().collect(),
            };
            emit(format, &list, || {
                for profile in &list.profiles {
                    let marker = if list.default.as_deref() == Some(profile.name.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {} pages={} block_size={} inline_base={}",
                        profile.name,
                        show(profile.pages),
                        show(profile.block_size),
                        show(profile.inline_base)
                    );
                }
            })?;
        }
        ProfileCmd::Delete { name } => {
            config.delete_profile(&name)?;
            let path = config.persist()?;
            println!("Deleted profile '{name}' from {}", path.display());
        }
    }
    Ok(())
}

fn show<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_superblock_text(report: &SuperblockReport) {
    println!("Log superblock: {}", report.device);
    println!(
        "  state={} inline={} pages={} block_size={} serial={}",
        report.state, report.inline, report.pages, report.block_size, report.serial
    );
    println!("  end=page {} offset {}", report.end_page, report.end_offset);
    println!("  uuid={}", report.uuid);
    if report.active.is_empty() {
        println!("  active filesystems: none");
    } else {
        println!("  active filesystems:");
        for id in &report.active {
            println!("    {id}");
        }
    }
}

fn print_end_text(end: &LogEnd) {
    println!(
        "Log end: page {} sequence {} eor {}",
        end.page, end.sequence, end.eor
    );
}

fn print_dump_text(report: &DumpReport) {
    println!("Records of {} from {}:", report.device, report.from);
    for record in &report.records {
        println!(
            "  {:>12} .. {:<12} {:<11} tid={} back={} arg={} segs={} len={}",
            record.start,
            record.end,
            record.kind,
            record.tid,
            record.backchain,
            record.arg,
            record.segments,
            record.data_len
        );
        if let Some(data) = &record.data {
            println!("      {data}");
        }
    }
    if let Some(err) = &report.error {
        println!("  stopped: {err}");
    }
}
