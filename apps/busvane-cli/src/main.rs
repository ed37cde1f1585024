use anyhow::Result;
use busvane_search::SearchQuery;
use busvane_stats::RateReport;
use busvane_transport::MemoryBus;
use busvane_watch::{TopicWatcher, WatcherConfig};
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "busvane", version, about = "Topic discovery and rate inspection utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a synthetic in-memory bus and print per-topic rates
    Demo(DemoArgs),
    /// Evaluate a search query against labels
    Search(SearchArgs),
}

#[derive(Args)]
struct DemoArgs {
    /// Seconds to watch before printing the final table
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Only show rows matching this query (all words must match)
    #[arg(long, default_value = "")]
    filter: String,
    /// Emit JSON instead of a table
    #[arg(long)]
    json: bool,
    /// Make one topic leave the bus mid-run and come back
    #[arg(long)]
    churn: bool,
}

#[derive(Args)]
struct SearchArgs {
    /// Whitespace-separated words, matched case-insensitively
    query: String,
    /// Labels to test; read from stdin when omitted
    labels: Vec<String>,
    /// Emit JSON (match flag and highlight spans per label)
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo(args) => run_demo(args).await,
        Commands::Search(args) => run_search(args),
    }
}

/// Topic name, publish period, payload size for the synthetic publishers.
const DEMO_TOPICS: &[(&str, u64, usize)] = &[
    ("/model/pose", 20, 64),
    ("/model/cmd_vel", 100, 24),
    ("/sensor/scan", 100, 120_000),
    ("/sensor/imu", 10, 256),
    ("/diagnostics", 1_000, 300),
];

async fn run_demo(args: DemoArgs) -> Result<()> {
    let query = SearchQuery::parse(&args.filter);
    let bus = MemoryBus::new();
    bus.set_topics(DEMO_TOPICS.iter().map(|(topic, _, _)| *topic))
        .await;

    let watcher = TopicWatcher::spawn(Arc::new(bus.clone()), WatcherConfig::from_env());
    let mut tasks = spawn_publishers(&bus);
    if args.churn {
        tasks.push(spawn_churn(&bus, args.seconds));
    }
    info!(seconds = args.seconds, "demo bus running; ctrl-c stops early");

    tokio::select! {
        _ = sleep(Duration::from_secs(args.seconds)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
    }

    let report = watcher.latest_report();
    for task in &tasks {
        task.abort();
    }
    watcher.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&filtered(&report, &query))?);
    } else {
        print_table(&report, &query);
    }
    Ok(())
}

fn spawn_publishers(bus: &MemoryBus) -> Vec<tokio::task::JoinHandle<()>> {
    DEMO_TOPICS
        .iter()
        .map(|(topic, period_ms, byte_size)| {
            let bus = bus.clone();
            let topic = topic.to_string();
            let period = Duration::from_millis(*period_ms);
            let byte_size = *byte_size;
            tokio::spawn(async move {
                let mut tick = interval(period);
                loop {
                    tick.tick().await;
                    bus.publish(&topic, byte_size).await;
                }
            })
        })
        .collect()
}

fn spawn_churn(bus: &MemoryBus, seconds: u64) -> tokio::task::JoinHandle<()> {
    let bus = bus.clone();
    let phase = Duration::from_millis(seconds.saturating_mul(1_000) / 3);
    tokio::spawn(async move {
        sleep(phase).await;
        bus.remove_topic("/diagnostics").await;
        info!("demo: /diagnostics left the bus");
        sleep(phase).await;
        bus.add_topic("/diagnostics").await;
        info!("demo: /diagnostics came back");
    })
}

/// Keep only rows whose own fields (name, Hz, bandwidth) match the query.
fn filtered(report: &RateReport, query: &SearchQuery) -> RateReport {
    let mut out = report.clone();
    out.topics.retain(|topic, sample| {
        let hz = sample.hz.to_string();
        let bandwidth = sample.display_bandwidth();
        query.matches_row(&[topic.as_str(), hz.as_str(), bandwidth.as_str()])
    });
    out
}

fn print_table(report: &RateReport, query: &SearchQuery) {
    let report = filtered(report, query);
    if report.topics.is_empty() {
        println!("no matching topics");
        return;
    }
    let name_width = report
        .topics
        .keys()
        .map(|topic| topic.len())
        .max()
        .unwrap_or(0)
        .max("TOPIC".len());
    println!(
        "{:<name_width$}  {:>8}  {:>12}  {:>10}",
        "TOPIC", "HZ", "BANDWIDTH", "MESSAGES"
    );
    for (topic, sample) in &report.topics {
        let padding = " ".repeat(name_width - topic.len());
        println!(
            "{}{}  {:>8}  {:>12}  {:>10}",
            emphasize(query, topic),
            padding,
            sample.hz,
            sample.display_bandwidth(),
            sample.total_messages
        );
    }
    if !report.generated.is_empty() {
        println!(
            "\nwindow ending {} ({} orphaned)",
            report.generated, report.orphan_messages
        );
    }
}

/// Render `label` with its matching runs wrapped in ANSI bold.
fn emphasize(query: &SearchQuery, label: &str) -> String {
    let mut out = String::with_capacity(label.len() + 16);
    for segment in query.segments(label) {
        if segment.emphasized {
            out.push_str("\x1b[1m");
            out.push_str(&segment.text);
            out.push_str("\x1b[0m");
        } else {
            out.push_str(&segment.text);
        }
    }
    out
}

fn run_search(args: SearchArgs) -> Result<()> {
    let query = SearchQuery::parse(&args.query);
    let labels: Vec<String> = if args.labels.is_empty() {
        io::stdin().lock().lines().collect::<Result<_, _>>()?
    } else {
        args.labels
    };

    if args.json {
        let rows: Vec<serde_json::Value> = labels
            .iter()
            .map(|label| {
                serde_json::json!({
                    "label": label,
                    "matched": query.matches(label),
                    "spans": query.highlight_spans(label),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for label in &labels {
            if query.matches(label) {
                println!("{}", emphasize(&query, label));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use busvane_stats::{scale_bandwidth, RateSample};

    fn sample(hz: u64, window_bytes: u64) -> RateSample {
        let (bandwidth, unit) = scale_bandwidth(window_bytes);
        RateSample {
            hz,
            bandwidth,
            unit,
            total_messages: hz,
        }
    }

    #[test]
    fn filter_matches_against_all_row_fields() {
        let mut report = RateReport::default();
        report.topics.insert("/model/pose".into(), sample(10, 1_500));
        report.topics.insert("/sensor/scan".into(), sample(2, 500));

        let by_name = filtered(&report, &SearchQuery::parse("pose"));
        assert_eq!(by_name.topics.len(), 1);
        assert!(by_name.topics.contains_key("/model/pose"));

        let by_unit = filtered(&report, &SearchQuery::parse("kb/s"));
        assert_eq!(by_unit.topics.len(), 1);
        assert!(by_unit.topics.contains_key("/model/pose"));

        let all = filtered(&report, &SearchQuery::parse(""));
        assert_eq!(all.topics.len(), 2);
    }

    #[test]
    fn emphasize_wraps_matches_in_bold() {
        let query = SearchQuery::parse("pose");
        assert_eq!(
            emphasize(&query, "/model/pose"),
            "/model/\x1b[1mpose\x1b[0m"
        );
        assert_eq!(emphasize(&query, ""), "");
        assert_eq!(emphasize(&SearchQuery::parse(""), "/plain"), "/plain");
    }
}
