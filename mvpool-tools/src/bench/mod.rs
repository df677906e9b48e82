//! A tool used to measure freeze and thaw latencies.

use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use log::info;
use mvpool::{env::Std, MfOffset, Options, PageKey, Region, TxnRegistry};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{Error, Result};

#[derive(Parser, Debug, Clone)]
#[clap(about = "Start bench testing")]
pub(crate) struct Args {
    /// Path of the freezer files folder.
    #[arg(long, required = true)]
    home: PathBuf,

    /// Size of each page.
    #[arg(short, long, default_value_t = 4096)]
    page_size: u32,

    /// Number of pages each thread freezes and thaws.
    #[arg(short, long, default_value_t = 100000)]
    num: u32,

    /// Number of concurrent threads to run.
    #[arg(short, long, default_value_t = 1)]
    threads: u32,

    /// Number of hash buckets.
    #[arg(long, default_value_t = 1024)]
    buckets: u32,

    /// How frozen versions are thawed.
    #[arg(long, default_value_t = ThawMode::Read)]
    thaw: ThawMode,

    /// Sync freezer files after every write.
    #[arg(long, default_value_t = false)]
    sync: bool,

    /// Sets the random seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ThawMode {
    /// Thaw every version into a fresh buffer.
    Read,
    /// Discard every version.
    Discard,
}

impl std::fmt::Display for ThawMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThawMode::Read => write!(f, "read"),
            ThawMode::Discard => write!(f, "discard"),
        }
    }
}

struct Latencies {
    freeze: Histogram<u64>,
    thaw: Histogram<u64>,
}

impl Latencies {
    fn new() -> Self {
        Latencies {
            freeze: new_histogram(),
            thaw: new_histogram(),
        }
    }

    fn merge(&mut self, other: &Latencies) {
        // Both use the same bounds, so adding never fails.
        let _ = self.freeze.add(&other.freeze);
        let _ = self.thaw.add(&other.thaw);
    }
}

fn new_histogram() -> Histogram<u64> {
    // Microseconds up to an hour with 2 significant digits are always valid.
    Histogram::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2).expect("valid histogram bounds")
}

fn record(hist: &mut Histogram<u64>, elapsed: Duration) {
    hist.saturating_record(elapsed.as_micros().max(1) as u64);
}

pub(crate) fn run(args: Args) -> Result<()> {
    if args.home.exists() {
        std::fs::remove_dir_all(&args.home)?;
    }
    let txns = Arc::new(TxnRegistry::new());
    let mut options = Options::default();
    options.num_buckets = args.buckets;
    options.sync_freezer_files = args.sync;
    options.region_size = usize::MAX;
    let region = Arc::new(Region::open(Std, &args.home, options, txns)?);
    let mf = region.register_file(args.page_size)?;

    let start = Instant::now();
    let handles = (0..args.threads)
        .map(|id| {
            let region = region.clone();
            let args = args.clone();
            thread::spawn(move || bench_thread(&region, &args, mf, id))
        })
        .collect::<Vec<_>>();
    let mut latencies = Latencies::new();
    for handle in handles {
        let thread_latencies = handle
            .join()
            .map_err(|_| Error::Verify("bench thread panicked".to_owned()))??;
        latencies.merge(&thread_latencies);
    }
    let elapsed = start.elapsed();

    region.verify()?;
    info!("{:?}", region.stats());
    let ops = latencies.freeze.len() + latencies.thaw.len();
    println!(
        "{} ops in {:.3}s, {:.0} ops/s",
        ops,
        elapsed.as_secs_f64(),
        ops as f64 / elapsed.as_secs_f64()
    );
    report("freeze", &latencies.freeze);
    report(&format!("thaw ({})", args.thaw), &latencies.thaw);

    if let Ok(region) = Arc::try_unwrap(region) {
        region.close();
    }
    Ok(())
}

fn bench_thread(region: &Region<Std>, args: &Args, mf: MfOffset, id: u32) -> Result<Latencies> {
    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(id as u64));
    let mut latencies = Latencies::new();
    let first = 1 + id * args.num;
    let mut data = vec![0u8; args.page_size as usize];

    let mut frozen = Vec::with_capacity(args.num as usize);
    for pgno in first..first + args.num {
        let page = PageKey::new(mf, pgno);
        rng.fill(&mut data[..]);
        let mut bucket = region.lock_page(page);
        let live = region.new_version(&mut bucket, page, None, &data)?;
        region.mark_clean(&mut bucket, live)?;
        region.pin(&mut bucket, live)?;

        let now = Instant::now();
        let refill = region.freeze(&mut bucket, live)?;
        record(&mut latencies.freeze, now.elapsed());

        let id = bucket
            .header(live)
            .and_then(|bh| bh.newer())
            .ok_or_else(|| Error::Verify(format!("page {page} has no frozen version")))?;
        region.unpin(&mut bucket, live)?;
        region.free_buffer(&mut bucket, live)?;
        if refill {
            region.alloc_frozen_headers(64)?;
        }
        frozen.push((page, id));
    }

    for (page, id) in frozen {
        let mut bucket = region.lock_page(page);
        region.pin(&mut bucket, id)?;
        let target = match args.thaw {
            ThawMode::Read => Some(region.alloc_buffer(&mut bucket, mf)?),
            ThawMode::Discard => None,
        };
        let now = Instant::now();
        region.thaw(&mut bucket, id, target)?;
        record(&mut latencies.thaw, now.elapsed());
        if let Some(target) = target {
            region.free_buffer(&mut bucket, target)?;
        }
    }
    Ok(latencies)
}

fn report(name: &str, hist: &Histogram<u64>) {
    println!(
        "{name}: count {} mean {:.1}us P50 {}us P75 {}us P99 {}us P99.9 {}us max {}us",
        hist.len(),
        hist.mean(),
        hist.value_at_quantile(0.50),
        hist.value_at_quantile(0.75),
        hist.value_at_quantile(0.99),
        hist.value_at_quantile(0.999),
        hist.max(),
    );
}
