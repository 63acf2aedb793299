// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Command line driver
//!
//! Two subcommands: `collect` builds a collection manifest from a capture
//! and prints it to standard output; `model` replays a manifest into one
//! output file per traced thread. Any unrecoverable setup error exits
//! non-zero.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use ipt_replay::binary::elf::ElfRegistry;
use ipt_replay::binary::kernel::KernelMap;
use ipt_replay::collection::Collection;
use ipt_replay::pool;
use ipt_replay::sideband::Model;
use ipt_replay::symbols::{SharedTable, Table};
use ipt_replay::timing::Timeline;
use ipt_replay::tracer::{self, ReplayOptions};
use ipt_replay::types::Tid;
use ipt_replay::RunStatistics;

#[derive(Parser)]
#[command(name = "ipt-replay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a collection manifest from a capture
    Collect {
        /// Scheduling/mmap log written by the capture driver
        #[arg(long)]
        sideband: PathBuf,
        /// Per-CPU trace files, in CPU order
        #[arg(required = true)]
        traces: Vec<PathBuf>,
    },
    /// Replay a collection into per-thread model files
    Model {
        /// Collection manifest
        #[arg(short = 'C', long)]
        collection: PathBuf,
        /// Symbol table output file
        #[arg(short = 'n', long)]
        symbols: PathBuf,
        /// Executable table output file
        #[arg(short = 'e', long)]
        executables: PathBuf,
        /// Host-path table output file
        #[arg(short = 'H', long)]
        host_executables: Option<PathBuf>,
        /// Kernel symbol map (System.map)
        #[arg(short = 'm', long)]
        system_map: Option<PathBuf>,
        /// Kernel image to disassemble kernel addresses from
        #[arg(short = 'k', long)]
        kernel_image: Option<PathBuf>,
        /// Directory holding the traced system's binaries
        #[arg(long)]
        sysroot: Option<PathBuf>,
        /// Per-thread output path; %u is replaced by the thread id
        #[arg(short = 'o', long, default_value = "task%u.model")]
        output: String,
        /// Per-thread call-stack low-water-mark report path (%u as above)
        #[arg(short = 'w', long)]
        low_water_marks: Option<String>,
        /// Maximum number of concurrent replay workers
        #[arg(short = 'P', long, default_value_t = 3)]
        workers: usize,
        /// Echo disassembled instructions into the output
        #[arg(short = 'd', long)]
        disassembly: bool,
        /// Give up on a replay stuck in a non-terminating loop
        #[arg(long)]
        loop_abort: bool,
    },
}

type Failure = Box<dyn std::error::Error + Send + Sync>;

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Failure> {
    match cli.command {
        Command::Collect { sideband, traces } => {
            let collection = Collection::build(&sideband, &traces)?;
            let stdout = io::stdout();
            collection.serialize(&mut stdout.lock())?;
            Ok(())
        }
        Command::Model {
            collection,
            symbols,
            executables,
            host_executables,
            system_map,
            kernel_image,
            sysroot,
            output,
            low_water_marks,
            workers,
            disassembly,
            loop_abort,
        } => {
            let manifest = Collection::deserialize(BufReader::new(File::open(&collection)?))?;
            let setup = ModelSetup {
                symbols,
                executables,
                host_executables,
                system_map,
                kernel_image,
                sysroot,
                output,
                low_water_marks,
                workers,
                options: ReplayOptions {
                    show_disassembly: disassembly,
                    loop_abort,
                    ..Default::default()
                },
            };
            run_model(&manifest, &setup)
        }
    }
}

struct ModelSetup {
    symbols: PathBuf,
    executables: PathBuf,
    host_executables: Option<PathBuf>,
    system_map: Option<PathBuf>,
    kernel_image: Option<PathBuf>,
    sysroot: Option<PathBuf>,
    output: String,
    low_water_marks: Option<String>,
    workers: usize,
    options: ReplayOptions,
}

fn run_model(collection: &Collection, setup: &ModelSetup) -> Result<(), Failure> {
    let model = Model::build(&fs::read(collection.sideband_path())?)?;

    // shared read-only inputs for every worker
    let mut traces = Vec::new();
    let mut timelines = Vec::new();
    for path in collection.trace_paths() {
        let data = fs::read(path)?;
        let mut timeline = Timeline::scan(&data)?;
        timeline.apply(&model.ratios());
        timelines.push(timeline);
        traces.push(data);
    }

    let kernel_map = match &setup.system_map {
        Some(path) => Some(KernelMap::read(path)?),
        None => None,
    };
    if kernel_map.is_some() != setup.kernel_image.is_some() {
        warn!("kernel resolution needs both a symbol map and an image; ignoring");
    }

    // truncate the shared tables up front
    SharedTable::create(&setup.symbols)?;
    SharedTable::create(&setup.executables)?;
    if let Some(path) = &setup.host_executables {
        SharedTable::create(path)?;
    }

    let initial_tsc = collection.earliest_tsc();
    info!(
        "replaying {} tasks with up to {} workers, earliest timestamp {initial_tsc:#x}",
        collection.task_count(),
        setup.workers
    );

    let results = pool::run_bounded(
        collection.tids_by_decreasing_size(),
        setup.workers,
        |tid| -> Result<RunStatistics, Failure> {
            replay_task(tid, collection, &model, &timelines, &traces, setup)
        },
    );

    let mut totals = RunStatistics::default();
    let mut failures = 0;
    for result in results {
        match result {
            Ok(stats) => totals.merge(&stats),
            Err(e) => {
                error!("{e}");
                failures += 1;
            }
        }
    }
    info!("replay finished: {totals}");

    if failures > 0 {
        return Err(format!("{failures} tasks failed to replay").into());
    }
    Ok(())
}

fn replay_task(
    tid: Tid,
    collection: &Collection,
    model: &Model,
    timelines: &[Timeline],
    traces: &[Vec<u8>],
    setup: &ModelSetup,
) -> Result<RunStatistics, Failure> {
    let task = collection
        .task(tid)
        .ok_or_else(|| format!("no such task: {tid}"))?;

    let output_path = format_path(&setup.output, tid);
    let writer = BufWriter::new(File::create(&output_path)?);

    let mut builder = tracer::builder(model, timelines)
        .with_source(ElfRegistry::new(setup.sysroot.clone()))
        .with_symbol_table(Table::Shared(SharedTable::open(&setup.symbols)?))
        .with_executable_table(Table::Shared(SharedTable::open(&setup.executables)?))
        .with_initial_tsc(collection.earliest_tsc())
        .with_options(setup.options.clone());
    if let Some(path) = &setup.host_executables {
        builder = builder.with_host_executable_table(SharedTable::open(path)?);
    }
    let kernel = match (&setup.system_map, &setup.kernel_image) {
        (Some(map_path), Some(image)) => {
            Some((KernelMap::read(map_path)?, image.to_string_lossy().into_owned()))
        }
        _ => None,
    };
    let mut replay = match &kernel {
        Some((map, image)) => builder.with_kernel(map, image.clone()).build(writer),
        None => builder.build(writer),
    };

    info!("task {tid} ({}): {} trace bytes", task.name(), task.size());
    let complete = replay.run_task(task, traces)?;
    if !complete {
        warn!("trace input for task {tid} ended abruptly");
        replay.diagnostic(&format!("WARNING: trace input for task {tid} ended abruptly"))?;
    }
    replay.report_statistics()?;

    if let Some(format) = &setup.low_water_marks {
        let mut file = File::create(format_path(format, tid))?;
        writeln!(file, "{tid}|{}", replay.stack_low_water_mark())?;
    }

    Ok(replay.statistics())
}

/// Expand `%u` in an output path format to the thread id
fn format_path(format: &str, tid: Tid) -> String {
    format.replace("%u", &tid.0.to_string())
}
