//! Hotspot report tool: `heapscope <trace-file> [frequency]`.
//!
//! Reads a finalized `.ctf` trace, feeds every sampled allocation's
//! backtrace into the hotspot tree, and prints a ranked report of the
//! backtrace fragments whose weight clears the frequency floor.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use heapscope::{Event, HeapscopeError, HeavyHitter, HotspotTree, LocId, TraceReader};

#[derive(Parser)]
#[command(name = "heapscope", about = "Rank allocation hotspots in a heapscope trace")]
struct Args {
    /// Trace file recorded by a profiling session
    trace: PathBuf,

    /// Frequency floor in (0, 1]: report fragments carrying at least this
    /// share of the sampled weight
    #[arg(default_value_t = 0.01)]
    frequency: f64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("HEAPSCOPE_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("heapscope: {err:#}");
        let code = err
            .downcast_ref::<HeapscopeError>()
            .map_or(1, HeapscopeError::exit_code);
        std::process::exit(code);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    if !(args.frequency > 0.0 && args.frequency <= 1.0) {
        return Err(HeapscopeError::InvalidFrequency {
            value: args.frequency,
        }
        .into());
    }

    let file = File::open(&args.trace)
        .with_context(|| format!("cannot open trace '{}'", args.trace.display()))?;

    // One order of magnitude of headroom between the reporting floor and
    // the counting error keeps threshold-edge fragments stable.
    let mut tree = HotspotTree::new(args.frequency / 10.0);
    let mut reader = TraceReader::new(BufReader::new(file));
    let mut allocations = 0u64;
    while let Some((_, event)) = reader
        .next_event()
        .with_context(|| format!("trace '{}' is unreadable", args.trace.display()))?
    {
        if let Event::Alloc(alloc) = event {
            tree.insert_backtrace(&alloc.backtrace, alloc.n_samples);
            allocations += 1;
        }
    }

    let hitters = tree.heavy_hitters(args.frequency)?;
    print_report(&reader, &hitters, tree.total_weight(), allocations);
    Ok(())
}

fn print_report<R: std::io::Read>(
    reader: &TraceReader<R>,
    hitters: &[HeavyHitter],
    total_weight: u64,
    allocations: u64,
) {
    println!("{allocations} sampled allocations, {total_weight} samples");

    let mut rank = 0;
    for hitter in hitters {
        let frames = display_frames(&hitter.label);
        if frames.is_empty() {
            continue;
        }
        rank += 1;

        #[allow(clippy::cast_precision_loss)]
        let share = 100.0 * hitter.light as f64 / total_weight.max(1) as f64;
        println!(
            "\n#{rank} {} samples ({share:.1}%), {} with callees, at most {}",
            hitter.light, hitter.total, hitter.upper_bound
        );
        for id in frames {
            match reader.resolve(*id) {
                Some(records) => {
                    for rec in records {
                        println!(
                            "    {}:{}:{} {}",
                            rec.filename, rec.line, rec.start_col, rec.defname
                        );
                    }
                }
                None => println!("    <0x{:016x}>", id.0),
            }
        }
    }

    if rank == 0 {
        println!("no fragment clears the frequency floor");
    }
}

/// A label is a fragment of a backtrace, possibly ending with the
/// stack-end marker; the marker itself is not a frame.
fn display_frames(label: &[LocId]) -> &[LocId] {
    match label.split_last() {
        Some((&last, rest)) if last == LocId::TERMINATOR => rest,
        _ => label,
    }
}
