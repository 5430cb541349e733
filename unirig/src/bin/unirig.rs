use std::{env, io::Read, path::Path, path::PathBuf};

use clap::Parser;
use metrics::gauge;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use unirig::{
    aggregate, bench,
    config::Config,
    normalize, observer, target,
};
use unirig_capture::{
    json::{BenchmarkRecord, NormalizedSample, RawSample, SeriesKind, SeriesMeta},
    writer::ArtifactWriter,
};
use uuid::Uuid;

use tokio::{
    runtime::Builder,
    signal,
    sync::broadcast,
    time::{self, Duration},
};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Target related error: {0}")]
    Target(#[from] target::Error),
    #[error("Observer returned an error: {0}")]
    Observer(#[from] observer::Error),
    #[error("Benchmark runner returned an error: {0}")]
    Bench(#[from] bench::Error),
    #[error("Failed to deserialize config: {0}")]
    Config(#[from] unirig::config::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Artifact write error: {0}")]
    Capture(#[from] unirig_capture::writer::Error),
    #[error("Artifact serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Observer produced no series")]
    NoSeries,
}

fn default_config_path() -> String {
    "/etc/unirig/unirig.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about = "Measure a workload's resource use and throughput")]
struct Args {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// validate the configuration file and exit
    #[clap(long)]
    config_check: bool,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("UNIRIG_CONFIG") {
        info!("Using config from env var 'UNIRIG_CONFIG'");
        Ok(env_var_value)
    } else {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{config_path}': {err}");
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn artifact_path(directory: &Path, label: &str, kind: SeriesKind) -> PathBuf {
    let suffix = match kind {
        SeriesKind::RawSamples => "raw_samples.jsonl",
        SeriesKind::NormalizedSamples => "normalized_samples.jsonl",
        SeriesKind::BenchmarkRecords => "benchmark_records.jsonl",
    };
    directory.join(format!("{label}_{suffix}"))
}

/// Read a benchmark artifact back: one meta line, then one record per
/// line.
fn load_benchmark_records(path: &Path) -> Result<Vec<BenchmarkRecord>, Error> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .skip(1)
        .map(|line| serde_json::from_str(line).map_err(Error::Json))
        .collect()
}

#[allow(clippy::too_many_lines)]
async fn inner_main(config: Config) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = unirig_signal::signal();
    let (target_running_watcher, target_running_broadcast) = unirig_signal::signal();
    let (target_done_watcher, target_done_broadcast) = unirig_signal::signal();
    let (bench_done_watcher, bench_done_broadcast) = unirig_signal::signal();

    std::fs::create_dir_all(&config.artifact_directory)?;
    let run_id = Uuid::new_v4();
    let label = config.label.clone();
    info!(%run_id, label = %label, "session starting");

    let (tgt_snd, _tgt_rcv) = broadcast::channel(1);

    //
    // OBSERVER
    //
    let raw_path = artifact_path(&config.artifact_directory, &label, SeriesKind::RawSamples);
    let raw_writer: ArtifactWriter<RawSample> = ArtifactWriter::create(
        &raw_path,
        &SeriesMeta {
            run_id,
            label: label.clone(),
            kind: SeriesKind::RawSamples,
        },
    )?;
    let mut osrv_joinset = tokio::task::JoinSet::new();
    let observer_server = observer::Server::new(
        observer::Config {
            sample_period_milliseconds: config.sample_period_milliseconds,
        },
        shutdown_watcher.clone(),
    );
    osrv_joinset.spawn(observer_server.run(tgt_snd.subscribe(), raw_writer));

    //
    // TARGET
    //
    let mut tsrv_joinset = tokio::task::JoinSet::new();
    let target_server =
        target::Server::new(config.target, label.clone(), shutdown_watcher.clone());
    tsrv_joinset.spawn(target_server.run(
        tgt_snd,
        target_running_broadcast,
        target_done_broadcast,
    ));

    //
    // BENCHMARK MATRIX
    //
    let benchmark_configured = config.benchmark.is_some();
    let bench_path = artifact_path(
        &config.artifact_directory,
        &label,
        SeriesKind::BenchmarkRecords,
    );
    let mut bsrv_joinset = tokio::task::JoinSet::new();
    if let Some(bench_config) = config.benchmark {
        let bench_writer: ArtifactWriter<BenchmarkRecord> = ArtifactWriter::create(
            &bench_path,
            &SeriesMeta {
                run_id,
                label: label.clone(),
                kind: SeriesKind::BenchmarkRecords,
            },
        )?;
        let bench_server = bench::Server::new(bench_config, shutdown_watcher.clone());
        let target_running = target_running_watcher.clone();
        bsrv_joinset.spawn(async move {
            info!("waiting for target startup before driving load");
            target_running.recv().await;
            bench_server.run(bench_writer, bench_done_broadcast).await
        });
    } else {
        drop(bench_done_broadcast);
    }

    // The originals were only held for cloning into the servers.
    drop(shutdown_watcher);
    drop(target_running_watcher);

    let target_done_wait = target_done_watcher.recv();
    tokio::pin!(target_done_wait);
    let bench_done_wait = bench_done_watcher.recv();
    tokio::pin!(bench_done_wait);
    let mut interval = time::interval(Duration::from_millis(400));
    let mut observer_outcome: Option<observer::SeriesSummary> = None;
    let mut matrix_outcome: Option<bench::MatrixSummary> = None;

    // A target task that errors out drops its `target_done` broadcaster,
    // which a watcher cannot tell apart from a deliberate signal. The
    // select is biased with the join arms ahead of the done-watchers so
    // the typed error wins that race.
    let res: Result<(), Error> = loop {
        tokio::select! {
            biased;
            _ = interval.tick() => {
                gauge!("unirig.running").set(1.0);
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            Some(res) = tsrv_joinset.join_next() => {
                match res {
                    Ok(Ok(())) => { /* target_done fires separately */ }
                    Ok(Err(err)) => {
                        error!("Target shut down unexpectedly: {err}");
                        break Err(Error::Target(err));
                    }
                    Err(err) => error!("Could not join the spawned target task: {err}"),
                }
            },
            Some(res) = osrv_joinset.join_next() => {
                match res {
                    Ok(Ok(summary)) => observer_outcome = Some(summary),
                    Ok(Err(err)) => {
                        error!("Observer shut down unexpectedly: {err}");
                        break Err(Error::Observer(err));
                    }
                    Err(err) => error!("Could not join the spawned observer task: {err}"),
                }
            },
            Some(res) = bsrv_joinset.join_next() => {
                match res {
                    Ok(Ok(summary)) => matrix_outcome = Some(summary),
                    Ok(Err(err)) => {
                        error!("Benchmark runner shut down unexpectedly: {err}");
                        break Err(Error::Bench(err));
                    }
                    Err(err) => error!("Could not join the spawned benchmark task: {err}"),
                }
            },
            () = &mut target_done_wait => {
                info!("target finished");
                break Ok(());
            },
            () = &mut bench_done_wait, if benchmark_configured => {
                info!("benchmark matrix finished");
                break Ok(());
            },
        }
    };

    shutdown_broadcast.signal();
    let mut res = res;

    // Collect whatever the loop did not already. The servers unwind
    // promptly once the shutdown signal lands.
    while let Some(join) = osrv_joinset.join_next().await {
        match join {
            Ok(Ok(summary)) => observer_outcome = Some(summary),
            Ok(Err(err)) => warn!("observer failed during shutdown: {err}"),
            Err(err) => warn!("could not join observer task: {err}"),
        }
    }
    while let Some(join) = bsrv_joinset.join_next().await {
        match join {
            Ok(Ok(summary)) => matrix_outcome = Some(summary),
            Ok(Err(err)) => warn!("benchmark runner failed during shutdown: {err}"),
            Err(err) => warn!("could not join benchmark task: {err}"),
        }
    }
    while let Some(join) = tsrv_joinset.join_next().await {
        match join {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // If the loop broke on the dropped `target_done` before
                // the join arm saw this error, surface it here.
                error!("target failed: {err}");
                if res.is_ok() {
                    res = Err(Error::Target(err));
                }
            }
            Err(err) => warn!("could not join target task: {err}"),
        }
    }

    res?;

    //
    // NORMALIZE
    //
    let summary = observer_outcome.ok_or(Error::NoSeries)?;
    info!(
        samples = summary.samples.len(),
        dropped = summary.dropped,
        truncated = summary.truncated,
        baseline_bytes = summary.baseline_bytes,
        "raw series closed"
    );
    let normalized = normalize::normalize(&summary.samples, summary.baseline_bytes);
    let normalized_path = artifact_path(
        &config.artifact_directory,
        &label,
        SeriesKind::NormalizedSamples,
    );
    let mut normalized_writer: ArtifactWriter<NormalizedSample> = ArtifactWriter::create(
        &normalized_path,
        &SeriesMeta {
            run_id,
            label: label.clone(),
            kind: SeriesKind::NormalizedSamples,
        },
    )?;
    for sample in &normalized {
        normalized_writer.append(sample)?;
    }

    //
    // AGGREGATE
    //
    if let Some(matrix) = matrix_outcome {
        info!(
            completed = matrix.completed,
            gaps = matrix.gaps,
            warmups_discarded = matrix.warmups_discarded,
            "matrix closed"
        );
        let records = load_benchmark_records(&bench_path)?;
        let report = aggregate::aggregate(&records);
        let report_path = config
            .artifact_directory
            .join(format!("{label}_aggregate.json"));
        std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
        info!(groups = report.groups.len(), path = %report_path.display(), "aggregate report written");
    }

    info!(%run_id, "session complete");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting unirig {version} run.");

    let args = Args::parse();
    let contents = load_config_contents(&args.config_path)?;
    let config = Config::deserialize(&contents).map_err(|err| {
        error!("Configuration validation failed: {err}");
        err
    })?;
    if args.config_check {
        info!("Configuration file is valid");
        return Ok(());
    }

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    // Load tool sub-processes hold kill_on_drop guards; a bounded runtime
    // teardown reaps anything a shutdown race left behind.
    runtime.shutdown_timeout(Duration::from_secs(30));
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_samples_a_short_lived_target() {
        let tmp_dir = tempfile::tempdir().expect("directory could not be created");
        let contents = format!(
            r#"
label: "smoke"
target:
  binary:
    command: "sleep"
    arguments: ["1"]
sample_period_milliseconds: 50
artifact_directory: "{dir}"
"#,
            dir = tmp_dir.path().display()
        );
        let config = Config::deserialize(&contents).expect("valid config");

        inner_main(config).await.expect("session runs");

        let raw = std::fs::read_to_string(
            tmp_dir.path().join("smoke_raw_samples.jsonl"),
        )
        .expect("raw artifact exists");
        // Meta line plus at least a handful of samples over one second.
        assert!(raw.lines().count() > 5);

        let normalized = std::fs::read_to_string(
            tmp_dir.path().join("smoke_normalized_samples.jsonl"),
        )
        .expect("normalized artifact exists");
        assert_eq!(normalized.lines().count(), raw.lines().count());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread")]
    async fn resolver_failure_is_a_target_error_not_a_missing_series() {
        let tmp_dir = tempfile::tempdir().expect("directory could not be created");
        let contents = format!(
            r#"
label: "failing"
target:
  binary:
    command: "sleep"
    arguments: ["0.2"]
    worker_marker: "no-such-worker"
sample_period_milliseconds: 50
artifact_directory: "{dir}"
"#,
            dir = tmp_dir.path().display()
        );
        let config = Config::deserialize(&contents).expect("valid config");

        let result = inner_main(config).await;
        assert!(matches!(
            result,
            Err(Error::Target(target::Error::Resolve(_)))
        ));
    }

    #[test]
    fn artifact_paths_carry_label_and_kind() {
        let path = artifact_path(Path::new("/tmp/out"), "nanos", SeriesKind::RawSamples);
        assert_eq!(path, PathBuf::from("/tmp/out/nanos_raw_samples.jsonl"));
    }
}
