//! Hammers one shared map and list from blocking threads and async tasks at the
//! same time, then checks that no update was lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use integration_tests_sync_collections::start_tracing;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sync_collections::{CollectionConfig, Error, LockingList, LockingMap};
use tracing::{debug, error, info};

#[derive(Parser, Debug, Clone)]
#[command(name = "collections_stress")]
#[command(about = "Concurrent stress run over LockingMap and LockingList")]
struct Args {
    /// Blocking worker threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Async worker tasks
    #[arg(long, default_value_t = 4)]
    tasks: usize,

    /// Operations per worker
    #[arg(long, default_value_t = 10_000)]
    ops: usize,

    /// Distinct map keys
    #[arg(long, default_value_t = 32)]
    keys: u64,

    /// TOML file with collection settings
    #[arg(long, value_name = "PATH")]
    config: Option<String>,
}

#[derive(Default)]
struct Tally {
    increments: AtomicU64,
    removed: AtomicU64,
    added: AtomicU64,
    taken: AtomicU64,
    sorts: AtomicU64,
}

struct Shared {
    map: LockingMap<u64, u64>,
    list: LockingList<u64>,
    tally: Tally,
    keys: u64,
}

enum Op {
    Increment(u64),
    Lookup(u64),
    Remove(u64),
    Push(u64),
    Take,
    Sort,
    Scan,
}

impl Op {
    fn pick(rng: &mut StdRng, keys: u64) -> Self {
        let key = rng.gen_range(0..keys);
        match rng.gen_range(0..100) {
            0..=34 => Op::Increment(key),
            35..=54 => Op::Lookup(key),
            55..=59 => Op::Remove(key),
            60..=79 => Op::Push(rng.gen()),
            80..=91 => Op::Take,
            92..=93 => Op::Sort,
            _ => Op::Scan,
        }
    }
}

impl Shared {
    fn record(&self, op: &Op, outcome: Result<Option<u64>, Error>) -> Result<(), Error> {
        let tally = &self.tally;
        match (op, outcome) {
            (Op::Increment(_), Ok(_)) => tally.increments.fetch_add(1, Ordering::Relaxed),
            (Op::Remove(_), Ok(Some(value))) => tally.removed.fetch_add(value, Ordering::Relaxed),
            (Op::Push(_), Ok(_)) => tally.added.fetch_add(1, Ordering::Relaxed),
            (Op::Take, Ok(Some(_))) => tally.taken.fetch_add(1, Ordering::Relaxed),
            (Op::Sort, Ok(_)) => tally.sorts.fetch_add(1, Ordering::Relaxed),
            // Another worker emptied the list first.
            (Op::Take, Err(Error::IndexOutOfRange { .. })) => 0,
            (_, Ok(_)) => 0,
            (_, Err(e)) => return Err(e),
        };
        Ok(())
    }

    fn run_blocking(&self, op: &Op) -> Result<Option<u64>, Error> {
        match *op {
            Op::Increment(key) => self.map.add_or_update(key, |_| 1, |_, v| v + 1).map(Some),
            Op::Lookup(key) => self.map.get(&key),
            Op::Remove(key) => self.map.try_remove(&key),
            Op::Push(item) => self.list.add(item).map(|_| None),
            Op::Take => self.list.remove_at(0).map(Some),
            Op::Sort => self.list.sort_by(|a, b| a.cmp(b)).map(|_| None),
            Op::Scan => {
                let mut total = 0_u64;
                self.map.for_each_locked(|_, v| total = total.wrapping_add(*v))?;
                Ok(Some(total))
            }
        }
    }

    async fn run_async(&self, op: &Op) -> Result<Option<u64>, Error> {
        match *op {
            Op::Increment(key) => self
                .map
                .add_or_update_async(key, |_| 1, |_, v| v + 1, None)
                .await
                .map(Some),
            Op::Lookup(key) => self.map.get_async(&key, None).await,
            Op::Remove(key) => self.map.try_remove_async(&key, None).await,
            Op::Push(item) => self.list.add_async(item, None).await.map(|_| None),
            Op::Take => self.list.remove_at_async(0, None).await.map(Some),
            Op::Sort => self
                .list
                .sort_by_async(|a, b| b.cmp(a), None)
                .await
                .map(|_| None),
            Op::Scan => {
                let mut entries = self.map.enumerate_async(None).await?;
                let total = entries.by_ref().map(|(_, v)| v).sum();
                entries.dispose_async().await;
                Ok(Some(total))
            }
        }
    }

    /// Every increment is either still in the map or was removed with its
    /// entry; every pushed item is either still in the list or was taken.
    fn verify(&self) -> Result<(), String> {
        let stored: u64 = self.map.values().map_err(|e| e.to_string())?.iter().sum();
        let increments = self.tally.increments.load(Ordering::SeqCst);
        let removed = self.tally.removed.load(Ordering::SeqCst);
        if stored + removed != increments {
            return Err(format!(
                "map lost updates: stored {stored} + removed {removed} != increments {increments}"
            ));
        }

        let len = self.list.count().map_err(|e| e.to_string())? as u64;
        let added = self.tally.added.load(Ordering::SeqCst);
        let taken = self.tally.taken.load(Ordering::SeqCst);
        if len + taken != added {
            return Err(format!(
                "list lost items: len {len} + taken {taken} != added {added}"
            ));
        }
        let keys = self.map.count().map_err(|e| e.to_string())? as u64;
        if keys > self.keys {
            return Err(format!("map holds {keys} keys, only {} exist", self.keys));
        }
        Ok(())
    }
}

fn load_config(path: Option<&str>) -> Result<CollectionConfig, Error> {
    match path {
        Some(path) => CollectionConfig::from_file(path),
        None => Ok(CollectionConfig::named("stress")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    start_tracing();
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    if args.keys == 0 {
        return Err("--keys must be at least 1".into());
    }
    info!(?args, ?config, "starting stress run");

    let shared = Arc::new(Shared {
        map: LockingMap::with_config(&CollectionConfig {
            name: format!("{}-map", config.name),
            ..config.clone()
        }),
        list: LockingList::with_config(&CollectionConfig {
            name: format!("{}-list", config.name),
            ..config.clone()
        }),
        tally: Tally::default(),
        keys: args.keys,
    });
    let started = Instant::now();

    let threads: Vec<_> = (0..args.threads)
        .map(|worker| {
            let (shared, ops) = (shared.clone(), args.ops);
            std::thread::spawn(move || -> Result<(), Error> {
                let mut rng = StdRng::seed_from_u64(worker as u64);
                for _ in 0..ops {
                    let op = Op::pick(&mut rng, shared.keys);
                    let outcome = shared.run_blocking(&op);
                    shared.record(&op, outcome)?;
                }
                debug!(worker, "blocking worker done");
                Ok(())
            })
        })
        .collect();

    let tasks: Vec<_> = (0..args.tasks)
        .map(|worker| {
            let (shared, ops) = (shared.clone(), args.ops);
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(1_000 + worker as u64);
                for _ in 0..ops {
                    let op = Op::pick(&mut rng, shared.keys);
                    let outcome = shared.run_async(&op).await;
                    shared.record(&op, outcome)?;
                }
                debug!(worker, "async worker done");
                Ok::<(), Error>(())
            })
        })
        .collect();

    for task in tasks {
        task.await??;
    }
    let joined = tokio::task::spawn_blocking(move || {
        threads
            .into_iter()
            .map(|t| t.join().map_err(|_| Error::InvalidState("worker panicked"))?)
            .collect::<Result<Vec<_>, Error>>()
    })
    .await?;
    joined?;

    let elapsed = started.elapsed();
    if let Err(reason) = shared.verify() {
        error!(%reason, "invariant violated");
        return Err(reason.into());
    }
    let tally = &shared.tally;
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        increments = tally.increments.load(Ordering::SeqCst),
        removed = tally.removed.load(Ordering::SeqCst),
        pushed = tally.added.load(Ordering::SeqCst),
        taken = tally.taken.load(Ordering::SeqCst),
        sorts = tally.sorts.load(Ordering::SeqCst),
        keys = shared.map.count()?,
        list_len = shared.list.count()?,
        "stress run passed"
    );
    shared.map.dispose_async().await;
    shared.list.dispose_async().await;
    Ok(())
}
