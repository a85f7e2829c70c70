use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use proxy_inventory::{
    config::Settings,
    inventory::{ExportHeader, Inventory, SharedInventory},
    logging::init_logging,
    proxy::{split_subscription, HttpProber, ProxyRecord, ProxyStatus, Scheme, Subscription, SubscriptionFetcher},
    query::{query, GroupFilter, QueryFilter, SortKey, SortSpec},
    scheduler::{AutoTester, SchedulerEvent, TestScheduler},
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Proxy connection-string inventory and connectivity tester
#[derive(Parser)]
#[command(name = "proxy-inventory")]
#[command(about = "Decode, test, classify and export proxy connection strings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode connection strings and list them
    List {
        /// Input files of connection strings, `-` for stdin
        #[arg(required = true)]
        input: Vec<PathBuf>,
        #[command(flatten)]
        view: ViewArgs,
    },
    /// Fetch subscriptions and print or save their connection strings
    Fetch {
        /// Subscription URLs; the configured subscriptions are used when empty
        #[arg(short, long)]
        url: Vec<String>,
        /// Output file for the fetched connection strings
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test connection strings once and show the results
    Test {
        /// Input files of connection strings, `-` for stdin
        #[arg(required = true)]
        input: Vec<PathBuf>,
        #[command(flatten)]
        test: TestArgs,
        #[command(flatten)]
        view: ViewArgs,
        /// Write the connection strings of the listed records to this file
        #[arg(short, long)]
        export: Option<PathBuf>,
    },
    /// Test, then keep re-testing on the configured interval until Ctrl-C
    Watch {
        /// Input files of connection strings, `-` for stdin
        #[arg(required = true)]
        input: Vec<PathBuf>,
        #[command(flatten)]
        test: TestArgs,
        /// Minutes between unattended passes
        #[arg(long)]
        interval: Option<u64>,
        /// Re-test every record, not only untested and inactive ones
        #[arg(long)]
        all: bool,
    },
    /// Export deduplicated connection strings with subscription headers
    Export {
        /// Input files of connection strings, `-` for stdin
        #[arg(required = true)]
        input: Vec<PathBuf>,
        /// Output file, stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Profile title header
        #[arg(long)]
        title: Option<String>,
        /// Profile update interval header, in hours
        #[arg(long)]
        update_interval: Option<u32>,
        #[command(flatten)]
        view: ViewArgs,
    },
}

#[derive(Args)]
struct TestArgs {
    /// Number of concurrent probes (1-20)
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,
    /// Probe timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args)]
struct ViewArgs {
    /// Status filter (untested, testing, active, slow, inactive)
    #[arg(long)]
    status: Option<String>,
    /// Scheme filter (vmess, vless, ss, trojan, unknown)
    #[arg(long)]
    scheme: Option<String>,
    /// Group filter: a group name, or `none` for records without a manual group
    #[arg(short, long)]
    group: Option<String>,
    /// Case-insensitive search over name and host
    #[arg(short, long)]
    search: Option<String>,
    /// Sort key (name, latency, country, score, tested, speed, group)
    #[arg(long)]
    sort: Option<String>,
    /// Sort descending
    #[arg(long)]
    desc: bool,
    /// Print records as JSON
    #[arg(long)]
    json: bool,
}

impl ViewArgs {
    /// Every record, fastest first
    fn default_view() -> Self {
        Self {
            status: None,
            scheme: None,
            group: None,
            search: None,
            sort: Some("latency".to_string()),
            desc: false,
            json: false,
        }
    }

    fn filter(&self) -> Result<QueryFilter> {
        let mut filter = QueryFilter::new();
        if let Some(ref status) = self.status {
            filter = filter.with_status(parse_status(status)?);
        }
        if let Some(ref scheme) = self.scheme {
            filter = filter.with_scheme(parse_scheme(scheme)?);
        }
        if let Some(ref group) = self.group {
            filter = filter.with_group(GroupFilter::parse(group));
        }
        if let Some(ref search) = self.search {
            filter = filter.with_search(search);
        }
        Ok(filter)
    }

    fn sort(&self) -> Result<Option<SortSpec>> {
        let Some(ref key) = self.sort else {
            return Ok(None);
        };
        let key = parse_sort_key(key)?;
        Ok(Some(if self.desc {
            SortSpec::descending(key)
        } else {
            SortSpec::ascending(key)
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    init_logging(&settings.log)?;

    match cli.command {
        Commands::List { input, view } => {
            let inventory = load_inventory(&input, &settings)?;
            print_view(&inventory, &view)?;
        }
        Commands::Fetch { url, output } => {
            let subscriptions: Vec<Subscription> = if url.is_empty() {
                settings.subscriptions.clone()
            } else {
                url.iter().map(|u| Subscription::new(u, u)).collect()
            };
            if subscriptions.is_empty() {
                return Err(anyhow!("No subscription URLs given or configured"));
            }

            let fetcher = SubscriptionFetcher::new()?;
            let mut inventory = Inventory::new();
            for result in fetcher.fetch_all(&subscriptions).await {
                if let Some(error) = result.error {
                    eprintln!("Error fetching {}: {}", result.source, error);
                    continue;
                }
                let summary = inventory.import(&result.links);
                eprintln!(
                    "{}: {} new, {} duplicates",
                    result.source,
                    summary.added.len(),
                    summary.duplicates
                );
            }

            write_output(output.as_ref(), &inventory.export(None, &[]))?;
        }
        Commands::Test {
            input,
            test,
            view,
            export,
        } => {
            let inventory = load_inventory(&input, &settings)?.into_shared();
            let scheduler = build_scheduler(&settings, &test, inventory.clone())?;

            run_with_progress(&scheduler).await?;

            let mut inventory = inventory.write().await;
            inventory.classify(&settings.smart_groups);
            print_view(&inventory, &view)?;

            if let Some(path) = export {
                let ids: Vec<_> = query(inventory.records(), &view.filter()?, None)
                    .iter()
                    .map(|r| r.id)
                    .collect();
                std::fs::write(&path, inventory.export(Some(&ids), &[]))?;
                println!("Saved {} connection strings to {:?}", ids.len(), path);
            }
        }
        Commands::Watch {
            input,
            test,
            interval,
            all,
        } => {
            let inventory = load_inventory(&input, &settings)?.into_shared();
            let scheduler = build_scheduler(&settings, &test, inventory.clone())?;

            let mut test_settings = scheduler.settings().await;
            if let Some(minutes) = interval {
                test_settings.auto_test_interval_minutes = minutes;
            }
            if all {
                test_settings.auto_test_only_inactive = false;
            }
            scheduler.set_settings(test_settings).await;

            run_with_progress(&scheduler).await?;

            let (_active_tx, active_rx) = watch::channel(true);
            let mut auto = AutoTester::start(scheduler.clone(), active_rx)
                .await
                .ok_or_else(|| anyhow!("Auto-test interval is 0; pass --interval or set test.auto_test_interval_minutes"))?;

            println!("Watching {} proxies, Ctrl-C to stop", inventory.read().await.len());
            tokio::signal::ctrl_c().await?;
            auto.stop();
            scheduler.stop();

            let mut inventory = inventory.write().await;
            inventory.classify(&settings.smart_groups);
            print_view(&inventory, &ViewArgs::default_view())?;
        }
        Commands::Export {
            input,
            output,
            title,
            update_interval,
            view,
        } => {
            let inventory = load_inventory(&input, &settings)?;

            let mut headers = Vec::new();
            if let Some(ref title) = title {
                headers.push(ExportHeader::profile_title(title));
            }
            if let Some(hours) = update_interval {
                headers.push(ExportHeader::profile_update_interval(hours));
            }

            let ids: Vec<_> = query(inventory.records(), &view.filter()?, None)
                .iter()
                .map(|r| r.id)
                .collect();
            write_output(output.as_ref(), &inventory.export(Some(&ids), &headers))?;
        }
    }

    Ok(())
}

/// Read every input, split it like a subscription body and import the links
fn load_inventory(inputs: &[PathBuf], settings: &Settings) -> Result<Inventory> {
    let mut inventory = Inventory::new();

    for input in inputs {
        let content = if input.as_os_str() == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else {
            std::fs::read_to_string(input).with_context(|| format!("Failed to read {:?}", input))?
        };

        let summary = inventory.import(split_subscription(&content));
        info!(
            "Loaded {} links from {:?} ({} duplicates)",
            summary.added.len(),
            input,
            summary.duplicates
        );
    }

    inventory.classify(&settings.smart_groups);
    Ok(inventory)
}

fn build_scheduler(settings: &Settings, args: &TestArgs, inventory: SharedInventory) -> Result<TestScheduler> {
    let mut test_settings = settings.test.clone();
    if let Some(concurrency) = args.concurrency {
        test_settings.concurrency = concurrency;
    }
    if let Some(timeout) = args.timeout {
        test_settings.timeout_ms = timeout;
    }

    let prober = HttpProber::with_settings(&settings.prober)?;
    Ok(TestScheduler::new(inventory, Arc::new(prober), test_settings))
}

/// Run the pending candidates, printing progress; Ctrl-C stops the run
async fn run_with_progress(scheduler: &TestScheduler) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SchedulerEvent::Started { total } => println!("Testing {} proxies...", total),
                SchedulerEvent::Tested { progress, .. } => {
                    eprint!(
                        "\r[{:>5.1}%] {}/{} tested, {} ok, {} failed",
                        progress.percent_complete(),
                        progress.tested,
                        progress.total,
                        progress.succeeded,
                        progress.failed
                    );
                }
                SchedulerEvent::Finished(summary) => {
                    eprintln!();
                    if summary.cancelled {
                        println!("Stopped, {} proxies left untested", summary.reverted);
                    }
                }
            }
        }
    });

    let stopper = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                scheduler.stop();
            }
        })
    };

    let result = scheduler.run_pending(None, Some(tx)).await;
    stopper.abort();
    if let Err(e) = printer.await {
        warn!("Progress printer failed: {}", e);
    }

    let summary = result?;
    println!(
        "Results: {} ok, {} failed of {}",
        summary.progress.succeeded, summary.progress.failed, summary.progress.total
    );
    Ok(())
}

fn print_view(inventory: &Inventory, view: &ViewArgs) -> Result<()> {
    let records = query(inventory.records(), &view.filter()?, view.sort()?);

    if view.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No proxies found.");
        return Ok(());
    }

    for record in records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &ProxyRecord) {
    let latency = record
        .latency()
        .map(|l| format!("{}ms", l))
        .unwrap_or_else(|| "-".to_string());
    let country = record
        .country_code
        .as_deref()
        .unwrap_or("--");

    println!(
        "{:<9} {:<11} {:>7} {:>3} {:>5}KB/s {}  {} ({})",
        record.status.to_string(),
        record.scheme.to_string(),
        latency,
        record.score,
        record.speed_kbps,
        country,
        record.name,
        record.address()
    );

    let groups: Vec<&str> = record
        .manual_group
        .iter()
        .chain(record.dynamic_groups.iter())
        .map(String::as_str)
        .collect();
    if !groups.is_empty() {
        println!("          groups: {}", groups.join(", "));
    }
}

fn write_output(path: Option<&PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, content)?;
            println!("Saved to {:?}", path);
        }
        None => println!("{}", content),
    }
    Ok(())
}

fn parse_status(s: &str) -> Result<ProxyStatus> {
    match s.to_lowercase().as_str() {
        "untested" => Ok(ProxyStatus::Untested),
        "testing" => Ok(ProxyStatus::Testing),
        "active" => Ok(ProxyStatus::Active),
        "slow" => Ok(ProxyStatus::Slow),
        "inactive" => Ok(ProxyStatus::Inactive),
        _ => Err(anyhow!(
            "Invalid status: {}. Use: untested, testing, active, slow, inactive",
            s
        )),
    }
}

fn parse_scheme(s: &str) -> Result<Scheme> {
    match s.to_lowercase().as_str() {
        "unknown" => Ok(Scheme::Unknown),
        "shadowsocks" => Ok(Scheme::Shadowsocks),
        other => match Scheme::from_prefix(other) {
            Scheme::Unknown => Err(anyhow!(
                "Invalid scheme: {}. Use: vmess, vless, ss, trojan, unknown",
                s
            )),
            scheme => Ok(scheme),
        },
    }
}

fn parse_sort_key(s: &str) -> Result<SortKey> {
    match s.to_lowercase().as_str() {
        "name" => Ok(SortKey::Name),
        "latency" => Ok(SortKey::Latency),
        "country" => Ok(SortKey::Country),
        "score" => Ok(SortKey::Score),
        "tested" | "last_tested" => Ok(SortKey::LastTestedAt),
        "speed" => Ok(SortKey::Speed),
        "group" => Ok(SortKey::Group),
        _ => Err(anyhow!(
            "Invalid sort key: {}. Use: name, latency, country, score, tested, speed, group",
            s
        )),
    }
}
