use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use futures::future::join_all;
use hdrhistogram::Histogram;

use trammel::{
    CheckIntervalDivisor, CheckIntervalMs, ConcurrencyLimit, CounterKey, CounterStore,
    MemoryCounterStore, Throttle, ThrottleOptions, Window,
};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Provider {
    Memory,
    Redis,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum WindowKind {
    Fixed,
    SelfExpiring,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "trammel-stress",
    about = "Load test harness for trammel: many throttle instances sharing one key"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Provider::Memory)]
    provider: Provider,

    #[arg(long, value_enum, default_value_t = WindowKind::Fixed)]
    window: WindowKind,

    /// Independent throttle instances sharing the key (simulated processes).
    #[arg(long, default_value_t = 4)]
    instances: usize,

    #[arg(long, default_value_t = 1000)]
    calls: usize,

    #[arg(long, default_value_t = 8)]
    limit: u64,

    /// Duration of each throttled operation.
    #[arg(long, default_value_t = 20)]
    work_ms: u64,

    #[arg(long, default_value_t = 10.0)]
    window_s: f64,

    #[arg(long, default_value_t = 4)]
    check_interval_divisor: u32,

    /// Explicit poll interval; overrides the divisor.
    #[arg(long)]
    check_interval_ms: Option<u64>,

    #[arg(long, default_value = "redis://127.0.0.1:16379/")]
    redis_url: String,

    #[arg(long, default_value = "trammel:stress")]
    key: String,
}

/// Live count of operations executing across every instance.
#[derive(Default)]
struct Concurrency {
    current: AtomicU64,
    peak: AtomicU64,
    over_limit_samples: AtomicU64,
}

fn build_options(args: &Args) -> ThrottleOptions {
    let window = match args.window {
        WindowKind::Fixed => Window::fixed_secs(args.window_s),
        WindowKind::SelfExpiring => Window::self_expiring_secs(args.window_s),
    }
    .unwrap();

    ThrottleOptions {
        key: CounterKey::try_from(args.key.clone()).unwrap(),
        limit: ConcurrencyLimit::try_from(args.limit).unwrap(),
        window,
        check_interval_divisor: CheckIntervalDivisor::try_from(args.check_interval_divisor)
            .unwrap(),
        check_interval_ms: args
            .check_interval_ms
            .map(|ms| CheckIntervalMs::try_from(ms).unwrap()),
    }
}

async fn run<S: CounterStore>(args: &Args, instances: Vec<Throttle<S>>) {
    instances[0].reset().await.unwrap();

    let concurrency = Arc::new(Concurrency::default());
    let errors = Arc::new(AtomicU64::new(0));
    let limit = args.limit;
    let work = Duration::from_millis(args.work_ms);

    let started = Instant::now();

    let handles: Vec<_> = (0..args.calls)
        .map(|i| {
            let throttle = instances[i % instances.len()].clone();
            let concurrency = Arc::clone(&concurrency);
            let errors = Arc::clone(&errors);

            tokio::spawn(async move {
                let submitted = Instant::now();

                let result = throttle
                    .run(|| async {
                        let now = concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
                        concurrency.peak.fetch_max(now, Ordering::SeqCst);
                        if now > limit {
                            concurrency.over_limit_samples.fetch_add(1, Ordering::Relaxed);
                        }

                        tokio::time::sleep(work).await;
                        concurrency.current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, std::convert::Infallible>(())
                    })
                    .await;

                if result.is_err() {
                    errors.fetch_add(1, Ordering::Relaxed);
                }

                submitted.elapsed()
            })
        })
        .collect();

    let mut hist = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3).unwrap();
    for latency in join_all(handles).await {
        let us = latency.unwrap().as_micros() as u64;
        let _ = hist.record(us.max(1));
    }

    let elapsed = started.elapsed();
    let store_count = instances[0].running_store_count().await.unwrap();

    print_results(args, elapsed, &hist, &concurrency, errors.load(Ordering::Relaxed), store_count);
}

fn print_results(
    args: &Args,
    elapsed: Duration,
    hist: &Histogram<u64>,
    concurrency: &Concurrency,
    errors: u64,
    store_count: i64,
) {
    println!(
        "provider={:?} window={:?} window_s={} instances={} calls={} limit={} work_ms={}",
        args.provider, args.window, args.window_s, args.instances, args.calls, args.limit, args.work_ms
    );

    let ideal_s = (args.calls as f64 / args.limit as f64).ceil() * args.work_ms as f64 / 1000.0;
    println!(
        "elapsed_s={:.3} ideal_s={:.3} calls_per_s={:.0}",
        elapsed.as_secs_f64(),
        ideal_s,
        args.calls as f64 / elapsed.as_secs_f64()
    );
    println!(
        "peak_concurrency={} limit={} over_limit_samples={} errors={} final_store_count={}",
        concurrency.peak.load(Ordering::Relaxed),
        args.limit,
        concurrency.over_limit_samples.load(Ordering::Relaxed),
        errors,
        store_count
    );

    if !hist.is_empty() {
        println!(
            "call_latency_us p50={} p95={} p99={} p999={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max()
        );
    } else {
        println!("no latency samples collected");
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let options = build_options(&args);
    let instances = args.instances.max(1);

    match args.provider {
        Provider::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            let throttles = (0..instances)
                .map(|_| Throttle::new(Arc::clone(&store), options.clone()))
                .collect();
            run(&args, throttles).await;
        }
        #[cfg(feature = "redis-tokio")]
        Provider::Redis => {
            use trammel::RedisCounterStore;

            let mut throttles = Vec::with_capacity(instances);
            for _ in 0..instances {
                // Separate clients, so each instance behaves like its own process.
                let client = redis::Client::open(args.redis_url.as_str()).unwrap();
                let store = RedisCounterStore::default_from_client(client).await.unwrap();
                throttles.push(Throttle::new(store, options.clone()));
            }
            run(&args, throttles).await;
        }
        #[cfg(not(feature = "redis-tokio"))]
        Provider::Redis => {
            eprintln!("built without redis-tokio; rebuild with `--features redis-tokio`");
        }
    }
}
