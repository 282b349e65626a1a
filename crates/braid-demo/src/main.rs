//! braid-demo: flattens synthetic delayed sources and prints what comes out.
//!
//! Each line of output is `<source>\t<sequence>`. Logging goes to stderr and
//! is controlled by `RUST_LOG`, or `BRAID_LOG` (debug, info, warn, error), with
//! `LOG_FORMAT=json` for JSON lines.

use std::process;
use std::time::{Duration, Instant};

use anyhow::Context;
use braid::{
    Concurrency, FrameScheduler, IdleScheduler, ImmediateScheduler, Inner, MergeConfig,
    PullStream, StreamError,
};
use futures::StreamExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Concat,
    Merge,
    /// Merge on a producer task, consumed through an in-memory bridge.
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pacing {
    Immediate,
    Frame,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Options {
    mode: Mode,
    sources: usize,
    items: usize,
    concurrency: Concurrency,
    delay: Duration,
    take: Option<usize>,
    pacing: Pacing,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: Mode::Merge,
            sources: 4,
            items: 3,
            concurrency: Concurrency::default(),
            delay: Duration::from_millis(10),
            take: None,
            pacing: Pacing::Immediate,
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("BRAID_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("braid={level},braid_demo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: braid-demo [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --mode <mode>          concat, merge, or bridge [default: merge]");
            eprintln!("  --sources <n>          Number of inner sources [default: 4]");
            eprintln!("  --items <n>            Items per source [default: 3]");
            eprintln!(
                "  --concurrency <n>      Merge limit or 'unbounded' [default: $BRAID_MERGE_CONCURRENCY or unbounded]"
            );
            eprintln!("  --delay-ms <ms>        Base delay between items [default: 10]");
            eprintln!("  --take <n>             Stop after n items");
            eprintln!("  --pacing <pacing>      immediate, frame, or idle [default: immediate]");
            process::exit(2);
        }
    };

    if let Err(e) = run(options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
        args.get(i)
            .map(String::as_str)
            .ok_or_else(|| format!("{flag} requires a value"))
    }

    fn number(raw: &str, flag: &str) -> Result<usize, String> {
        raw.parse()
            .map_err(|_| format!("{flag} expects a non-negative integer, got '{raw}'"))
    }

    let mut options = Options::default();
    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--mode" => {
                i += 1;
                options.mode = match value(args, i, flag)? {
                    "concat" => Mode::Concat,
                    "merge" => Mode::Merge,
                    "bridge" => Mode::Bridge,
                    other => return Err(format!("invalid mode '{other}'")),
                };
            }
            "--sources" => {
                i += 1;
                options.sources = number(value(args, i, flag)?, flag)?;
            }
            "--items" => {
                i += 1;
                options.items = number(value(args, i, flag)?, flag)?;
            }
            "--concurrency" => {
                i += 1;
                options.concurrency = match value(args, i, flag)? {
                    "unbounded" => Concurrency::Unbounded,
                    raw => Concurrency::Bounded(number(raw, flag)?),
                };
            }
            "--delay-ms" => {
                i += 1;
                options.delay = Duration::from_millis(number(value(args, i, flag)?, flag)? as u64);
            }
            "--take" => {
                i += 1;
                options.take = Some(number(value(args, i, flag)?, flag)?);
            }
            "--pacing" => {
                i += 1;
                options.pacing = match value(args, i, flag)? {
                    "immediate" => Pacing::Immediate,
                    "frame" => Pacing::Frame,
                    "idle" => Pacing::Idle,
                    other => return Err(format!("invalid pacing '{other}'")),
                };
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unexpected argument: {other}")),
        }
        i += 1;
    }
    Ok(options)
}

type Item = (usize, usize);

/// A source emitting `items` values, slower for higher ids modulo three.
fn synthetic(id: usize, items: usize, delay: Duration) -> PullStream<Item> {
    let pause = delay * (id % 3 + 1) as u32;
    PullStream::from_stream(futures::stream::iter(0..items).then(move |seq| async move {
        tokio::time::sleep(pause).await;
        Ok::<_, StreamError>((id, seq))
    }))
}

fn pipeline(options: &Options) -> anyhow::Result<PullStream<Item>> {
    let sources: Vec<_> = (0..options.sources)
        .map(|id| synthetic(id, options.items, options.delay))
        .collect();

    let flattened = match options.mode {
        Mode::Concat => braid::concat(sources).context("building concat")?,
        Mode::Merge | Mode::Bridge => {
            let inners: Vec<_> = sources.into_iter().map(Inner::Stream).collect();
            let outer = PullStream::iter(inners);
            let config = MergeConfig::new(options.concurrency);
            let config = match options.pacing {
                Pacing::Immediate => config.with_scheduler(ImmediateScheduler),
                Pacing::Frame => config.with_scheduler(FrameScheduler::sixty_hz()),
                Pacing::Idle => config.with_scheduler(IdleScheduler::default()),
            };
            braid::merge(outer, config).context("building merge")?
        }
    };

    let stream = match options.take {
        Some(n) => flattened.take(n),
        None => flattened,
    };
    Ok(if options.mode == Mode::Bridge {
        bridged(stream)
    } else {
        stream
    })
}

/// Serves `stream` from its own task and returns the consuming end.
fn bridged(stream: PullStream<Item>) -> PullStream<Item> {
    let (near, far) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        match braid::bridge::serve(stream, far).await {
            Ok(()) => tracing::debug!("Bridge producer finished"),
            Err(e) => tracing::warn!(error = %e, "Bridge producer failed"),
        }
    });
    braid::bridge::connect(near)
}

async fn run(options: Options) -> anyhow::Result<()> {
    tracing::info!(
        mode = ?options.mode,
        sources = options.sources,
        items = options.items,
        concurrency = %options.concurrency,
        "Starting pipeline"
    );

    let started = Instant::now();
    let stream = pipeline(&options)?;

    let mut reader = stream.into_reader()?;
    let mut count = 0usize;
    while let Some((source, seq)) = reader.read().await? {
        println!("{source}\t{seq}");
        count += 1;
    }

    tracing::info!(
        items = count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Pipeline finished"
    );
    Ok(())
}
