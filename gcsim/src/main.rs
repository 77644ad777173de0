use clap::{Parser as ClapParser, ValueEnum};
use std::process;

use heap::{CollectorMode, GcScheduler, HeapSettings, SchedulerSettings};

mod world;

use world::World;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Serial,
    Incremental,
    Parallel,
}

impl From<Mode> for CollectorMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Serial => CollectorMode::Serial,
            Mode::Incremental => CollectorMode::Incremental,
            Mode::Parallel => CollectorMode::Parallel,
        }
    }
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Incremental, help = "How cycles run")]
    mode: Mode,

    #[arg(long, default_value_t = 20_000, help = "Mutator frames to run")]
    frames: u32,

    #[arg(long, default_value_t = 2000, help = "Frames between two cycles")]
    interval: u32,

    #[arg(long, default_value_t = 64, help = "Allocations per frame")]
    objects_per_frame: u32,

    #[arg(long, default_value_t = 16, help = "64 KiB pages committed at start")]
    initial_pages: u32,

    #[arg(long, default_value_t = 4096, help = "Maximum committed pages")]
    max_pages: u32,

    #[arg(long, default_value_t = 20_000, help = "Objects per sweep step")]
    sweep_budget: usize,

    #[arg(long, default_value_t = 0x5eed, help = "Workload seed")]
    seed: u64,

    #[arg(long, help = "Print the per-class heap report at the end")]
    stats: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let settings = HeapSettings {
        initial_pages: cli.initial_pages,
        max_pages: cli.max_pages,
        sweep_budget: cli.sweep_budget,
        ..HeapSettings::default()
    };
    if let Err(err) = settings.validate() {
        eprintln!("Invalid heap settings: {}", err);
        process::exit(2);
    }

    let mut world = match World::new(settings, cli.seed) {
        Ok(world) => world,
        Err(err) => {
            eprintln!("Error setting up the heap: {}", err);
            process::exit(1);
        }
    };

    let scheduler = GcScheduler::new(
        world.heap.clone(),
        SchedulerSettings {
            mode: cli.mode.into(),
            interval: cli.interval.max(1),
        },
    );
    let mut gc = match scheduler {
        Ok(gc) => gc,
        Err(err) => {
            eprintln!("Error starting the collector: {}", err);
            process::exit(1);
        }
    };

    for frame in 0..cli.frames {
        if let Err(err) = world.frame(cli.objects_per_frame) {
            eprintln!("Error in frame {}: {}", frame, err);
            for site in world.heap.stack_trace() {
                eprintln!("    at {}", site);
            }
            process::exit(1);
        }
        if let Err(err) = gc.tick(&mut world.pinned) {
            eprintln!("Error collecting in frame {}: {}", frame, err);
            process::exit(1);
        }
    }

    let last = match gc.finish() {
        Ok(stats) => stats.or_else(|| world.heap.last_stats()),
        Err(err) => {
            eprintln!("Error finishing the collection: {}", err);
            process::exit(1);
        }
    };
    drop(gc);

    let report = world.heap.verify();
    let s = &world.stats;
    println!(
        "{} frames, {} objects ({} bytes) allocated, {} out-of-memory retries",
        s.frames, s.objects, s.bytes, s.oom_retries
    );
    println!(
        "{} cycles, {} pages committed, heap top {}, {} bytes free in gaps",
        world.heap.generation(),
        world.heap.committed_pages(),
        world.heap.next_ptr(),
        world.heap.free_memory()
    );
    println!(
        "{} weak handles alive, {} cleared, {} revived",
        world.live_weak(),
        s.weak_cleared,
        s.weak_revived
    );
    if let Some(last) = last {
        println!("last {}", last);
    }
    if cli.stats {
        println!("{}", report);
    }
}
