//! A tool used to perform stress testing.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use log::{debug, info};
use mvpool::{
    env::Std, BhId, LockedBucket, MfOffset, Options, PageKey, ReaderId, Region, TdOffset,
    TxnRegistry,
};
use rand::{
    rngs::{OsRng, SmallRng},
    Rng, RngCore, SeedableRng,
};

use crate::{Error, Result};

/// Commit the open transaction of a worker after this many writes.
const WRITES_PER_TXN: usize = 16;

#[derive(Parser, Debug, Clone)]
#[clap(about = "Start stress testing")]
pub(crate) struct Args {
    /// Sets the directory of the freezer files
    #[clap(long, required = true)]
    home: PathBuf,

    /// Sets the number of worker threads
    #[clap(long, default_value_t = 4)]
    threads: u32,

    /// Sets the number of pages each worker works on
    #[clap(long, default_value_t = 64)]
    pages_per_thread: u32,

    /// Sets the page size
    #[clap(long, default_value_t = 4096)]
    page_size: u32,

    /// Sets the number of hash buckets
    #[clap(long, default_value_t = 16)]
    buckets: u32,

    /// Sets the max number of versions of a page
    #[clap(long, default_value_t = 4)]
    max_versions: usize,

    /// Sets the number of frozen headers carved on every refill
    #[clap(long, default_value_t = 8)]
    refill: usize,

    /// Sets the random seed
    #[clap(long)]
    seed: Option<u64>,

    /// How long we are running for, in seconds
    #[clap(long, default_value_t = 60)]
    runtime_seconds: u64,

    /// How often the region is verified, in seconds
    #[clap(long, default_value_t = 5)]
    verify_period_seconds: u64,
}

struct Job {
    stop: AtomicBool,
    args: Args,
    region: Region<Std>,
    txns: Arc<TxnRegistry>,
    mf: MfOffset,
    lsn: AtomicU64,
}

pub(crate) fn run(args: Args) -> Result<()> {
    if args.home.exists() {
        std::fs::remove_dir_all(&args.home)?;
    }
    let txns = Arc::new(TxnRegistry::new());
    let mut options = Options::default();
    options.num_buckets = args.buckets;
    let region = Region::open(Std, &args.home, options, txns.clone())?;
    let mf = region.register_file(args.page_size)?;
    let job = Arc::new(Job {
        stop: AtomicBool::new(false),
        args: args.clone(),
        region,
        txns,
        mf,
        lsn: AtomicU64::new(1),
    });

    let base_seed = args.seed.unwrap_or_else(|| OsRng.next_u64());
    info!("Spawn {} workers with base seed {base_seed}", args.threads);
    let workers = (0..args.threads)
        .map(|id| {
            let job = job.clone();
            let seed = base_seed.wrapping_add(id as u64);
            thread::spawn(move || worker(job, id, seed))
        })
        .collect::<Vec<_>>();

    let start = Instant::now();
    let runtime = Duration::from_secs(args.runtime_seconds);
    let period = Duration::from_secs(args.verify_period_seconds.max(1));
    while start.elapsed() < runtime {
        thread::sleep(period.min(runtime.saturating_sub(start.elapsed())));
        if workers.iter().any(|w| w.is_finished()) {
            break;
        }
        job.region.verify()?;
        info!("Verified after {:?}: {:?}", start.elapsed(), job.region.stats());
    }
    info!("Now past {} seconds, exit ...", start.elapsed().as_secs());
    job.stop.store(true, Ordering::Release);

    for worker in workers {
        worker
            .join()
            .map_err(|_| Error::Verify("worker panicked".to_owned()))??;
    }
    job.region.verify()?;
    let stats = job.region.stats();
    info!("{stats:?}");
    println!(
        "frozen {} thawed {} discarded {} failed {}",
        stats.frozen,
        stats.thawed,
        stats.discarded,
        stats.freeze_failed + stats.thaw_failed
    );

    if let Ok(job) = Arc::try_unwrap(job) {
        job.region.close();
    }
    Ok(())
}

struct Worker {
    job: Arc<Job>,
    rng: SmallRng,
    first_page: u32,
    /// The fill byte of every frozen version made by this worker.
    contents: HashMap<BhId, u8>,
    txn: Option<(TdOffset, usize)>,
    readers: Vec<ReaderId>,
}

fn worker(job: Arc<Job>, id: u32, seed: u64) -> Result<()> {
    let first_page = 1 + id * job.args.pages_per_thread;
    let mut worker = Worker {
        job,
        rng: SmallRng::seed_from_u64(seed),
        first_page,
        contents: Default::default(),
        txn: None,
        readers: Vec::new(),
    };
    while !worker.job.stop.load(Ordering::Acquire) {
        worker.step()?;
    }
    for reader in worker.readers.drain(..) {
        worker.job.txns.end_reader(reader);
    }
    Ok(())
}

impl Worker {
    fn step(&mut self) -> Result<()> {
        let job = self.job.clone();
        let pgno = self.first_page + self.rng.gen_range(0..job.args.pages_per_thread);
        let page = PageKey::new(job.mf, pgno);
        let mut bucket = job.region.lock_page(page);
        match self.rng.gen_range(0..10) {
            0..=2 => self.write(&job, &mut bucket, page),
            3..=5 => self.freeze(&job, &mut bucket, page),
            6..=8 => self.thaw(&job, &mut bucket, page),
            _ => {
                drop(bucket);
                self.read_snapshot(&job);
                Ok(())
            }
        }
    }

    fn write(&mut self, job: &Job, bucket: &mut LockedBucket<'_>, page: PageKey) -> Result<()> {
        if bucket.versions(page)?.len() >= job.args.max_versions {
            return Ok(());
        }
        let (td, writes) = match self.txn.take() {
            Some(txn) => txn,
            None => (job.txns.begin(), 0),
        };
        let fill = self.rng.gen::<u8>();
        let data = vec![fill; job.args.page_size as usize];
        let id = job.region.new_version(bucket, page, Some(td), &data)?;
        job.region.mark_clean(bucket, id)?;
        if writes + 1 >= WRITES_PER_TXN {
            let lsn = job.lsn.fetch_add(1, Ordering::AcqRel);
            job.txns.commit(td, lsn)?;
        } else {
            self.txn = Some((td, writes + 1));
        }
        Ok(())
    }

    fn freeze(&mut self, job: &Job, bucket: &mut LockedBucket<'_>, page: PageKey) -> Result<()> {
        let live = bucket
            .versions(page)?
            .into_iter()
            .filter(|&id| {
                bucket
                    .header(id)
                    .map_or(false, |bh| !bh.is_frozen() && bh.refs() == 0)
            })
            .collect::<Vec<_>>();
        if live.is_empty() {
            return Ok(());
        }
        let id = live[self.rng.gen_range(0..live.len())];
        let fill = match bucket.header(id).and_then(|bh| bh.data()) {
            Some(data) => data[0],
            None => return Ok(()),
        };
        job.region.wait_for_io(bucket, id);
        job.region.pin(bucket, id)?;
        let res = job.region.freeze(bucket, id);
        match res {
            Ok(refill) => {
                if let Some(frozen) = bucket.header(id).and_then(|bh| bh.newer()) {
                    self.contents.insert(frozen, fill);
                }
                job.region.unpin(bucket, id)?;
                job.region.free_buffer(bucket, id)?;
                if refill {
                    match job.region.alloc_frozen_headers(job.args.refill) {
                        Ok(n) => debug!("Refill {n} frozen headers"),
                        Err(mvpool::Error::OutOfMemory) => debug!("Region is full"),
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
            Err(mvpool::Error::OutOfMemory) => {
                job.region.unpin(bucket, id)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn thaw(&mut self, job: &Job, bucket: &mut LockedBucket<'_>, page: PageKey) -> Result<()> {
        let frozen = bucket
            .versions(page)?
            .into_iter()
            .filter(|&id| bucket.header(id).map_or(false, |bh| bh.is_frozen()))
            .collect::<Vec<_>>();
        if frozen.is_empty() {
            return Ok(());
        }
        let id = frozen[self.rng.gen_range(0..frozen.len())];
        job.region.pin(bucket, id)?;
        if self.rng.gen_bool(0.5) {
            let target = match job.region.alloc_buffer(bucket, job.mf) {
                Ok(target) => target,
                Err(mvpool::Error::OutOfMemory) => {
                    job.region.unpin(bucket, id)?;
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            job.region.thaw(bucket, id, Some(target))?;
            let expect = self.contents.get(&id).copied();
            let data = bucket.header(target).and_then(|bh| bh.data());
            match (data, expect) {
                (Some(data), Some(fill)) if data.iter().all(|&b| b == fill) => {}
                _ => {
                    return Err(Error::Verify(format!(
                        "page {page} thawed from {id} into {target} has wrong content"
                    )))
                }
            }
        } else if job.region.is_obsolete(bucket, id)? {
            job.region.thaw(bucket, id, None)?;
        } else {
            job.region.unpin(bucket, id)?;
        }
        Ok(())
    }

    /// Opens or closes a snapshot reader, which holds old versions back.
    fn read_snapshot(&mut self, job: &Job) {
        if self.readers.len() < 2 && self.rng.gen_bool(0.5) {
            let lsn = job.lsn.load(Ordering::Acquire);
            self.readers.push(job.txns.begin_reader(lsn));
        } else if !self.readers.is_empty() {
            let reader = self.readers.swap_remove(self.rng.gen_range(0..self.readers.len()));
            job.txns.end_reader(reader);
        }
    }
}
