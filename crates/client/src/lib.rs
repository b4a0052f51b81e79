//! Headless console client: resolves the player, starts a session and drives it
//! from stdin, one command per line.

use anyhow::Context;
use clap::Parser;
use crowntap::engine::{
    now_ms, BalanceCache, Config, HttpAuthority, IdentityResolver, PlatformUser, RemoteAuthority,
    Session, SessionHandle, Snapshot, TapEvent, TapOutcome, TapRejection,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

pub const USAGE: &str = "\
commands:
  tap [x y]                      tap the coin (centre when no position is given)
  burst <n> [interval_ms]        tap n times
  flush                          sync the pending delta now
  online | offline               toggle network availability
  status                         print the balance
  task start <id> <points>       start a timed task
  task claim <id>                claim a finished task
  quiz <id> <points> right|wrong submit a quiz answer
  log [n]                        recent sync attempts
  quit";

#[derive(Debug, Clone, Parser)]
#[command(name = "crowntap", version, about = "Tap-to-earn console client")]
pub struct Args {
    /// YAML config file; flags below override it.
    #[arg(long, env = "CROWNTAP_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "CROWNTAP_API_URL")]
    pub api_url: Option<String>,

    #[arg(long, env = "CROWNTAP_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Chat-platform account id. Without one a device identity is used.
    #[arg(long, env = "CROWNTAP_USER_ID")]
    pub user_id: Option<String>,

    #[arg(long, env = "CROWNTAP_USERNAME", requires = "user_id")]
    pub username: Option<String>,
}

impl Args {
    pub fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(url) = self.api_url {
            config.api_url = url;
        }
        if let Some(path) = self.db_path {
            config.db_path = path;
        }
        if let Some(id) = self.user_id {
            config.platform_user = Some(PlatformUser {
                id,
                username: self.username,
            });
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Tap { at: Option<(f64, f64)> },
    Burst { count: u32, interval_ms: u64 },
    Flush,
    Online,
    Offline,
    Status,
    StartTask { id: String, points: f64 },
    ClaimTask { id: String },
    Quiz { id: String, points: f64, correct: bool },
    Log { limit: usize },
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> anyhow::Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let cmd = match words.as_slice() {
            ["tap"] => ConsoleCommand::Tap { at: None },
            ["tap", x, y] => ConsoleCommand::Tap {
                at: Some((number(x, "x")?, number(y, "y")?)),
            },
            ["burst", n] => ConsoleCommand::Burst {
                count: n.parse().context("burst count")?,
                interval_ms: 0,
            },
            ["burst", n, ms] => ConsoleCommand::Burst {
                count: n.parse().context("burst count")?,
                interval_ms: ms.parse().context("burst interval")?,
            },
            ["flush"] => ConsoleCommand::Flush,
            ["online"] => ConsoleCommand::Online,
            ["offline"] => ConsoleCommand::Offline,
            ["status"] => ConsoleCommand::Status,
            ["task", "start", id, points] => ConsoleCommand::StartTask {
                id: id.to_string(),
                points: number(points, "task points")?,
            },
            ["task", "claim", id] => ConsoleCommand::ClaimTask { id: id.to_string() },
            ["quiz", id, points, verdict] => ConsoleCommand::Quiz {
                id: id.to_string(),
                points: number(points, "quiz points")?,
                correct: match *verdict {
                    "right" => true,
                    "wrong" => false,
                    other => anyhow::bail!("quiz verdict must be right or wrong, got {other:?}"),
                },
            },
            ["log"] => ConsoleCommand::Log { limit: 10 },
            ["log", n] => ConsoleCommand::Log {
                limit: n.parse().context("log length")?,
            },
            ["quit"] | ["exit"] => ConsoleCommand::Quit,
            _ => anyhow::bail!("unknown command: {line:?}"),
        };
        Ok(cmd)
    }
}

fn number(raw: &str, what: &str) -> anyhow::Result<f64> {
    let v: f64 = raw.parse().with_context(|| format!("{what} is not a number: {raw:?}"))?;
    anyhow::ensure!(v.is_finite(), "{what} must be finite");
    Ok(v)
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.into_config()?;
    let cache = BalanceCache::new(config.db_path.clone());
    // Fail fast if sqlite is unavailable.
    cache.open().context("open local cache")?;

    let remote: Arc<dyn RemoteAuthority> = Arc::new(HttpAuthority::new(
        config.api_url.clone(),
        config.sync.request_timeout(),
    )?);
    let (user, registration) =
        IdentityResolver::new(cache.clone(), config.platform_user.clone(), remote.clone())
            .resolve_with_registration()
            .await
            .context("resolve user identity")?;
    info!(user = %user, api_url = %config.api_url, db = %config.db_path.display(), "starting session");

    let session = Session::start_with(&config, user, cache.clone(), remote, registration);
    let handle = session.handle();
    let centre = (config.surface.width / 2.0, config.surface.height / 2.0);

    println!("{USAGE}");
    print_status(&handle.snapshot());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let cmd = match line.parse::<ConsoleCommand>() {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("{e:#}\n{USAGE}");
                continue;
            }
        };
        if cmd == ConsoleCommand::Quit {
            break;
        }
        if let Err(e) = execute(&handle, &cache, cmd, centre).await {
            eprintln!("error: {e:#}");
        }
    }

    session.shutdown().await;
    print_status(&handle.snapshot());
    Ok(())
}

async fn execute(
    handle: &SessionHandle,
    cache: &BalanceCache,
    cmd: ConsoleCommand,
    centre: (f64, f64),
) -> anyhow::Result<()> {
    match cmd {
        ConsoleCommand::Tap { at } => {
            let (x, y) = at.unwrap_or(centre);
            let outcome = handle.tap(TapEvent { timestamp_ms: now_ms(), x, y }).await?;
            println!("{}", describe(outcome));
        }
        ConsoleCommand::Burst { count, interval_ms } => {
            let mut accepted = 0;
            for _ in 0..count {
                let (x, y) = centre;
                if handle.tap(TapEvent { timestamp_ms: now_ms(), x, y }).await?.is_accepted() {
                    accepted += 1;
                }
                if interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
            println!("{accepted}/{count} taps accepted");
            print_status(&handle.snapshot());
        }
        ConsoleCommand::Flush => handle.flush().await?,
        ConsoleCommand::Online => handle.set_online(true).await?,
        ConsoleCommand::Offline => handle.set_online(false).await?,
        ConsoleCommand::Status => print_status(&handle.snapshot()),
        ConsoleCommand::StartTask { id, points } => {
            handle.start_task(&id, points).await?;
            println!("task {id} started");
        }
        ConsoleCommand::ClaimTask { id } => {
            let points = handle.claim_task(&id).await?;
            println!("task {id} claimed: +{points}");
        }
        ConsoleCommand::Quiz { id, points, correct } => {
            let earned = handle.submit_quiz(&id, correct, points).await?;
            println!("quiz {id} submitted: +{earned}");
        }
        ConsoleCommand::Log { limit } => {
            for entry in cache.recent_sync_log(handle.user(), limit)? {
                println!(
                    "{} {:<6} sent={} total={} {}",
                    entry.ts_ms,
                    entry.outcome.as_str(),
                    entry.points_sent,
                    entry.authority_total.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                    entry.error.unwrap_or_default()
                );
            }
        }
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

pub fn describe(outcome: TapOutcome) -> String {
    match outcome {
        TapOutcome::Accepted { points, multiplier } => format!("+{points:.2} (x{multiplier:.2})"),
        TapOutcome::Rejected(TapRejection::OutOfBounds) => "missed the coin".to_string(),
        TapOutcome::Rejected(TapRejection::Exhausted) => "out of energy".to_string(),
    }
}

pub fn status_line(s: &Snapshot) -> String {
    let mut line = format!(
        "{}: {:.0} points ({:.2} confirmed + {:.2} pending) | energy {:.0}/{:.0} | taps {}",
        s.user,
        s.displayed.trunc(),
        s.confirmed, s.pending, s.energy, s.max_energy, s.taps
    );
    if !s.online {
        line.push_str(" | offline");
    }
    if s.sync_in_flight {
        line.push_str(" | syncing");
    }
    if let Some(err) = &s.last_sync_error {
        line.push_str(&format!(" | last sync failed: {err}"));
    }
    line
}

fn print_status(s: &Snapshot) {
    println!("{}", status_line(s));
}
