//! CTF trace inspection command line
//!
//! Commands:
//!
//! - `ctf info <trace>` - trace identity, stream classes and packet counts
//! - `ctf events <trace>` - dump decoded events in file order

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use ctf_reader::{clock, ClockDisplay, CtfTrace};

/// CTF - Common Trace Format reader
#[derive(Parser)]
#[command(name = "ctf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show trace metadata: uuid, byte order, streams and event classes
    Info {
        /// Path to the trace directory
        trace: PathBuf,
    },

    /// Dump decoded events from the trace's streams
    Events {
        /// Path to the trace directory
        trace: PathBuf,

        /// Read only this stream file (default: all, in name order)
        #[arg(short, long)]
        stream: Option<usize>,

        /// Stop after this many events
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print the raw clock value instead of wall-clock time
        #[arg(long)]
        clock_raw: bool,

        /// Print seconds.nanoseconds instead of wall-clock time
        #[arg(long)]
        clock_seconds: bool,

        /// Prefix timestamps with the date
        #[arg(long)]
        clock_date: bool,

        /// Render timestamps in GMT instead of local time
        #[arg(long)]
        clock_gmt: bool,

        /// Offset in seconds added to rendered timestamps
        #[arg(long, default_value_t = 0)]
        clock_offset: i64,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    match cli.command {
        Commands::Info { trace } => run_info(&trace),
        Commands::Events {
            trace,
            stream,
            limit,
            clock_raw,
            clock_seconds,
            clock_date,
            clock_gmt,
            clock_offset,
        } => {
            let display = ClockDisplay {
                raw: clock_raw,
                seconds: clock_seconds,
                date: clock_date,
                gmt: clock_gmt,
                offset: clock_offset,
            };
            run_events(&trace, stream, limit, display)
        }
    }
}

fn run_info(path: &PathBuf) -> Result<()> {
    let trace = CtfTrace::open(path)
        .with_context(|| format!("failed to open trace at {}", path.display()))?;
    let meta = trace.meta();

    println!("trace:      {}", trace.path().display());
    println!("uuid:       {}", meta.uuid());
    println!("byte order: {}", meta.byte_order());
    if let Some(clock) = meta.clock() {
        println!("clock:      {} ({} Hz)", clock.name, clock.freq);
    }
    if !meta.env().is_empty() {
        println!("env:");
        for (key, value) in meta.env() {
            println!("  {key} = {value}");
        }
    }

    for class in meta.stream_classes() {
        println!("stream class {}:", class.id);
        println!("  event classes: {}", class.event_count());
        for id in 0..class.event_count() as u64 {
            if let Some(event) = class.event(id) {
                println!(
                    "    [{id}] {}",
                    event.name.as_deref().unwrap_or("<anonymous>")
                );
            }
        }
        for &index in class.file_streams() {
            if let Some(stream) = trace.stream(index) {
                println!(
                    "  file stream {index}: {} packets",
                    stream.pos().packet_count()
                );
            }
        }
    }

    Ok(())
}

fn run_events(
    path: &PathBuf,
    stream: Option<usize>,
    limit: Option<usize>,
    display: ClockDisplay,
) -> Result<()> {
    let mut trace = CtfTrace::open(path)
        .with_context(|| format!("failed to open trace at {}", path.display()))?;
    trace.set_clock_display(display);

    let streams: Vec<usize> = match stream {
        Some(index) => vec![index],
        None => (0..trace.stream_count()).collect(),
    };
    let limit = limit.unwrap_or(usize::MAX);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut printed = 0usize;

    'streams: for index in streams {
        while let Some(event) = trace
            .read_event(index)
            .with_context(|| format!("decode failure on stream {index}"))?
        {
            if printed >= limit {
                break 'streams;
            }
            print_event(&mut out, &trace, &event, &display)?;
            printed += 1;
        }
    }

    Ok(())
}

fn print_event(
    out: &mut dyn Write,
    trace: &CtfTrace,
    event: &ctf_reader::Event,
    display: &ClockDisplay,
) -> Result<()> {
    if let Some(timestamp) = event.timestamp {
        write!(out, "[")?;
        clock::write_timestamp(out, trace.meta().clock(), timestamp, display)?;
        write!(out, "] ")?;
    }
    let name = trace
        .event_name(event.stream_id, event.id)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("event_{}", event.id));
    write!(out, "{name}:")?;

    let defs = trace
        .stream(event.stream_index)
        .and_then(|s| s.event(event.id));
    if let Some(defs) = defs {
        if let Some(context) = &defs.context {
            write!(out, " context = {{")?;
            write_fields(out, context)?;
            write!(out, " }}")?;
        }
        if let Some(fields) = &defs.fields {
            write!(out, " {{")?;
            write_fields(out, fields)?;
            write!(out, " }}")?;
        }
    }
    writeln!(out)?;
    Ok(())
}

fn write_fields(out: &mut dyn Write, fields: &ctf_reader::StructDef) -> Result<()> {
    for (i, field) in fields.fields.iter().enumerate() {
        if i > 0 {
            write!(out, ",")?;
        }
        write!(out, " {} = {}", field.name, field.value)?;
    }
    Ok(())
}
