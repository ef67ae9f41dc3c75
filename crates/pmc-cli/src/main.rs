#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use pmc::{
    ATOMIC_MAPPING_CODE, CowSyncMode, Credentials, FileHandle, FsConfig, FsStats, PAGE_SIZE,
    PmcError, PmemFs, VirtAddr, cow_sync, fsync,
};
use serde::Serialize;
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const DEFAULT_PAGES: u64 = 16;
const DEFAULT_ROUNDS: u64 = 8;
const MAP_HINT: VirtAddr = VirtAddr(0x7f00_0000_0000);

#[derive(Debug, Serialize)]
struct ModeRow {
    code: u32,
    mode: String,
    msync_flag: Option<u32>,
    cow: bool,
    write_back: bool,
    emulated_latency: bool,
    per_page_flush: bool,
    deferred_free: bool,
}

#[derive(Debug, Default, Serialize)]
struct SimulationOutcome {
    rounds: u64,
    pages: u64,
    syncs_ok: u64,
    crashes: u64,
    recoveries: u64,
    flushes: u64,
    stats: Option<FsStats>,
}

#[derive(Debug)]
struct SimulateArgs {
    config: Option<String>,
    pages: u64,
    rounds: u64,
    json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "simulate" => simulate(parse_simulate(args)?),
        "modes" => {
            let json = args.any(|arg| arg == "--json");
            modes(json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("pmc-cli\n");
    println!("USAGE:");
    println!("  pmc-cli simulate [config.json] [--pages N] [--rounds N] [--json]");
    println!("  pmc-cli modes [--json]");
    println!();
    println!("Logging is controlled with RUST_LOG, e.g. RUST_LOG=pmc::sync=debug");
}

fn parse_simulate(mut args: impl Iterator<Item = String>) -> Result<SimulateArgs> {
    let mut parsed = SimulateArgs {
        config: None,
        pages: DEFAULT_PAGES,
        rounds: DEFAULT_ROUNDS,
        json: false,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => parsed.json = true,
            "--pages" | "--rounds" => {
                let Some(value) = args.next() else {
                    bail!("{arg} requires a value");
                };
                let value: u64 = value
                    .parse()
                    .with_context(|| format!("invalid value for {arg}: {value}"))?;
                if value == 0 {
                    bail!("{arg} must be non-zero");
                }
                if arg == "--pages" {
                    parsed.pages = value;
                } else {
                    parsed.rounds = value;
                }
            }
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            path => {
                if parsed.config.replace(path.to_owned()).is_some() {
                    bail!("simulate takes at most one config path");
                }
            }
        }
    }
    Ok(parsed)
}

fn load_config(path: Option<&str>) -> Result<FsConfig> {
    let Some(path) = path else {
        return Ok(FsConfig::default());
    };
    let text = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config {path}"))?;
    FsConfig::from_json_str(&text).with_context(|| format!("invalid config {path}"))
}

fn open_mapped(fs: &PmemFs, pages: u64) -> Result<(FileHandle, VirtAddr)> {
    let len = pages * PAGE_SIZE;
    let inode = fs.create_file(0o644, 0).context("create file")?;
    fs.set_blocksize_hint(&inode, len);
    fs.fallocate(&inode, 0, 0, len).context("fallocate")?;
    let handle = fs.open(inode.ino()).context("open file")?;
    let base = fs.mmap(&handle, MAP_HINT, len, false).context("mmap")?;
    Ok((handle, base))
}

fn simulate(args: SimulateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let fs = PmemFs::new(config).context("create filesystem")?;
    let (handle, base) = open_mapped(&fs, args.pages)?;
    let end = VirtAddr(base.0 + args.pages * PAGE_SIZE - 1);

    let mut outcome = SimulationOutcome {
        rounds: args.rounds,
        pages: args.pages,
        ..SimulationOutcome::default()
    };
    for round in 0..args.rounds {
        for mode in CowSyncMode::ALL {
            dirty_pages(&fs, &handle, round, mode.code(), args.pages)?;
            match cow_sync(&fs, &handle, base, end, mode, Credentials::default()) {
                Ok(report) => {
                    outcome.syncs_ok += 1;
                    tracing::debug!(
                        target: "pmc::cli",
                        round,
                        %mode,
                        dirty = report.dirty,
                        "sync done"
                    );
                }
                Err(PmcError::InjectedFault { point }) => {
                    outcome.crashes += 1;
                    tracing::warn!(target: "pmc::cli", round, %mode, point = %point, "simulated crash");
                    crash_and_recover(&fs, &mut outcome)?;
                }
                Err(PmcError::Degraded) => crash_and_recover(&fs, &mut outcome)?,
                Err(err) => return Err(err).with_context(|| format!("sync in {mode} mode")),
            }
        }

        let last = args.pages * PAGE_SIZE - 1;
        for code in [0, ATOMIC_MAPPING_CODE] {
            match fsync(&fs, &handle, 0, last, code) {
                Ok(()) => outcome.flushes += 1,
                Err(PmcError::InjectedFault { .. } | PmcError::Degraded) => {
                    outcome.crashes += 1;
                    crash_and_recover(&fs, &mut outcome)?;
                }
                Err(err) => return Err(err).with_context(|| format!("fsync code {code}")),
            }
        }
        fs.reset_crash_latch();
    }

    fs.reclaim_all();
    let stats = fs.stats();
    outcome.stats = Some(stats);
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("serialize outcome")?
        );
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

/// Store a round-specific marker in every other page.
fn dirty_pages(fs: &PmemFs, handle: &FileHandle, round: u64, code: u32, pages: u64) -> Result<()> {
    let marker = ((round << 8) | u64::from(code)).to_le_bytes();
    for page in (round % 2..pages).step_by(2) {
        fs.write_mapped(handle, page * PAGE_SIZE, &marker)
            .with_context(|| format!("store into page {page}"))?;
    }
    Ok(())
}

fn crash_and_recover(fs: &PmemFs, outcome: &mut SimulationOutcome) -> Result<()> {
    fs.power_fail();
    let report = fs.recover().context("recover after crash")?;
    outcome.recoveries += 1;
    tracing::info!(
        target: "pmc::cli",
        logs = report.logs_replayed,
        blocks_in_use = report.blocks_in_use,
        "recovered"
    );
    Ok(())
}

fn print_outcome(outcome: &SimulationOutcome) {
    println!("pmc simulation");
    println!("rounds: {}", outcome.rounds);
    println!("pages: {}", outcome.pages);
    println!("syncs_ok: {}", outcome.syncs_ok);
    println!("flushes: {}", outcome.flushes);
    println!("crashes: {}", outcome.crashes);
    println!("recoveries: {}", outcome.recoveries);
    if let Some(stats) = &outcome.stats {
        println!("commits: {}", stats.commits);
        println!("aborts: {}", stats.aborts);
        println!("cowed_blocks: {}", stats.cowed_blocks);
        println!("written_pages: {}", stats.written_pages);
        println!("deferred_frees: {}", stats.deferred_frees);
        println!("freed_blocks: {}", stats.freed_blocks);
        println!("emulated_ns: {}", stats.emulated_ns);
        println!("free_blocks: {}", stats.free_blocks);
        println!("fences: {}", stats.flush.fences);
        println!("lines_flushed: {}", stats.flush.lines_flushed);
    }
}

fn modes(json: bool) -> Result<()> {
    let rows: Vec<ModeRow> = CowSyncMode::ALL
        .into_iter()
        .map(|mode| ModeRow {
            code: mode.code(),
            mode: mode.to_string(),
            msync_flag: mode.msync_flag(),
            cow: mode.cow(),
            write_back: mode.write_back(),
            emulated_latency: mode.emulate(),
            per_page_flush: mode.per_page_flush(),
            deferred_free: mode.deferred_free(),
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("serialize modes")?
        );
        return Ok(());
    }
    println!("0..=10  flush");
    println!("{ATOMIC_MAPPING_CODE:<7} atomic-mapping, then flush");
    for row in rows {
        let flag = row
            .msync_flag
            .map_or_else(|| "-".to_owned(), |flag| format!("{flag:#05x}"));
        println!(
            "{:<7} {:<26} msync={flag:<6} cow={} write_back={} latency={} page_flush={} deferred_free={}",
            row.code,
            row.mode,
            row.cow,
            row.write_back,
            row.emulated_latency,
            row.per_page_flush,
            row.deferred_free,
        );
    }
    Ok(())
}
