//! jsvm
//!
//! Evaluates scripts on a pool of thread-affine JavaScript engines.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use rquickjs::function::Rest;
use rquickjs::{Coerced, Ctx, Function, Value};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use jsvm::{ContextPool, EngineFactory, JsError, JsPromise, PoolConfig, set_async_function};

/// Thread-affine JavaScript engine pool
#[derive(Parser, Debug)]
#[command(name = "jsvm")]
#[command(about = "Run JavaScript on a pool of thread-affine engines", long_about = None)]
#[command(version)]
struct Args {
    /// Pool configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of engine threads
    #[arg(short, long)]
    pool_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate scripts and print their results as JSON
    Eval {
        /// Script files to evaluate
        files: Vec<PathBuf>,

        /// Inline expressions to evaluate
        #[arg(short, long)]
        expr: Vec<String>,
    },

    /// Measure job throughput across the pool
    Bench {
        /// Number of jobs to submit
        #[arg(short, long, default_value = "10000")]
        jobs: usize,

        /// Script each job evaluates
        #[arg(long, default_value = "1 + 1")]
        script: String,
    },
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jsvm=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PoolConfig::load(path)?,
        None => PoolConfig::default(),
    };
    if let Some(size) = args.pool_size {
        config.capacity = size;
    }
    config.validate()?;

    info!("Starting jsvm v{} with {} engine threads", env!("CARGO_PKG_VERSION"), config.capacity);
    let pool = Arc::new(ContextPool::with_factory(config.capacity, host_globals(config.factory())));

    match args.command {
        Command::Eval { files, expr } => eval(&pool, files, expr).await?,
        Command::Bench { jobs, script } => bench(&pool, jobs, script).await?,
    }

    info!("Pool status: {}", serde_json::to_string(&pool.status())?);
    pool.shutdown();
    Ok(())
}

/// Install `print` and an async `sleep(ms)` on every context.
fn host_globals(factory: EngineFactory) -> EngineFactory {
    factory.with_setup(|ctx| {
        let globals = ctx.globals();
        globals.set(
            "print",
            Function::new(ctx.clone(), |Rest(parts): Rest<Coerced<String>>| {
                let line: Vec<String> = parts.into_iter().map(|part| part.0).collect();
                println!("{}", line.join(" "));
            })?,
        )?;
        set_async_function(ctx, &globals, "sleep", |millis: Vec<u64>| async move {
            let millis = millis.first().copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, Infallible>(())
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

async fn eval(pool: &Arc<ContextPool>, files: Vec<PathBuf>, expr: Vec<String>) -> Result<()> {
    let mut scripts = Vec::with_capacity(files.len() + expr.len());
    for path in files {
        let source = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        scripts.push((path.display().to_string(), source));
    }
    scripts.extend(
        expr.into_iter()
            .enumerate()
            .map(|(index, source)| (format!("<expr {}>", index + 1), source)),
    );
    if scripts.is_empty() {
        return Err(anyhow!("Nothing to evaluate; pass script files or --expr"));
    }

    let runs = scripts.into_iter().map(|(name, source)| {
        let pool = pool.clone();
        async move {
            let result = run_script(&pool, source).await;
            (name, result)
        }
    });

    let mut failed = 0;
    for (name, result) in join_all(runs).await {
        match result {
            Ok(Some(value)) => println!("{name}: {}", serde_json::to_string_pretty(&value)?),
            Ok(None) => println!("{name}: undefined"),
            Err(err) => {
                failed += 1;
                eprintln!("{name}: error: {err:#}");
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{failed} script(s) failed"));
    }
    Ok(())
}

/// Evaluate `source` on the next pooled context and wait for its (possibly
/// asynchronous) result, rendered as JSON.
async fn run_script(pool: &ContextPool, source: String) -> Result<Option<serde_json::Value>> {
    let lease = pool.lease().await?;
    debug!(context = %lease.id(), "Evaluating script");

    let promise = lease
        .try_with_engine(move |engine| {
            engine.with(|ctx| -> Result<JsPromise<Option<String>>> {
                let value: Value = ctx.eval(source).map_err(|err| engine_error(&ctx, err))?;
                let stringify: Function = ctx
                    .eval("(value) => Promise.resolve(value).then((result) => JSON.stringify(result))")
                    .map_err(|err| engine_error(&ctx, err))?;
                let wrapped: Value = stringify.call((value,)).map_err(|err| engine_error(&ctx, err))?;
                Ok(JsPromise::from_value(&ctx, wrapped)?)
            })
        })?
        .await??;

    let json = promise.resolved_value().await?;
    json.map(|json| serde_json::from_str(&json).context("Script produced invalid JSON"))
        .transpose()
}

async fn bench(pool: &Arc<ContextPool>, jobs: usize, script: String) -> Result<()> {
    let script: Arc<str> = script.into();
    let started = Instant::now();

    let mut handles = Vec::with_capacity(jobs);
    for _ in 0..jobs {
        let lease = pool.lease().await?;
        let script = script.clone();
        handles.push(lease.try_with_engine(move |engine| engine.eval::<Coerced<String>>(&script))?);
    }

    let mut errors = 0;
    for handle in handles {
        if !matches!(handle.await, Ok(Ok(_))) {
            errors += 1;
        }
    }

    let elapsed = started.elapsed();
    let rate = jobs as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{jobs} jobs on {} contexts in {:.3}s ({rate:.0} jobs/s, {errors} errors)",
        pool.status().live,
        elapsed.as_secs_f64(),
    );
    Ok(())
}

fn engine_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> anyhow::Error {
    if matches!(err, rquickjs::Error::Exception) {
        anyhow!(JsError::thrown(ctx, ctx.catch()))
    } else {
        anyhow!("{err}")
    }
}
