mod cli;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cli::{AuthCommand, CacheCommand, Cli, Commands, DbCommand};
use dmcommons::prelude::*;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.profile.default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    init_tracing(&config);

    let bridge = Bridge::connect(config, true).await?;
    let json = cli.json;

    match cli.command {
        Commands::Fetch { reference, refresh } => {
            let artifact = bridge.fetch_artifact(&reference, refresh).await?;
            if json { return print_json(&artifact); }
            print_artifact(&artifact);
        }
        Commands::Preview { reference, wikitext } => {
            let plans = bridge.preview(&reference).await?;
            if json { return print_json(&plans); }
            for plan in &plans {
                match plan {
                    PlanOutcome::Ready(p) => {
                        println!("{}: File:{} [{}]", p.media_id, p.filename, p.license.template);
                        if wikitext {
                            println!("{}", p.wikitext);
                        }
                    }
                    PlanOutcome::NoFreeLicense { media_id, .. } => println!("{media_id}: skipped (no free license)"),
                }
            }
        }
        Commands::Upload { reference, dry_run, media, ignore_warnings } => {
            let report = bridge.upload(&reference, UploadOptions { dry_run, media, ignore_warnings }).await?;
            if json { return print_json(&report); }
            print_report(&report);
        }
        Commands::Jobs { status } => {
            let status = status.as_deref().map(str::parse::<JobStatus>).transpose()?;
            let jobs = bridge.list_jobs(status).await?;
            if json { return print_json(&jobs); }
            if jobs.is_empty() {
                println!("No upload jobs.");
            }
            for job in &jobs {
                print_job(job);
            }
        }
        Commands::Retry => {
            let report = bridge.retry_failed().await?;
            if json { return print_json(&report); }
            if report.jobs.is_empty() {
                println!("No failed jobs to retry.");
            } else {
                print_report(&report);
            }
        }
        Commands::Auth { command } => match command {
            AuthCommand::Begin => {
                let url = bridge.begin_auth().await?;
                if json { return print_json(&serde_json::json!({ "authorize_url": url })); }
                println!("Open this URL and approve access:\n\n  {url}\n");
                println!("Then run: dmcommons auth complete <verifier>");
            }
            AuthCommand::Complete { verifier } => {
                let username = bridge.complete_auth(&verifier).await?;
                if json { return print_json(&serde_json::json!({ "username": username })); }
                println!("Authorized as {username}");
            }
            AuthCommand::Status => {
                let user = bridge.auth_status().await?;
                if json { return print_json(&serde_json::json!({ "username": user })); }
                match user {
                    Some(u) => println!("Authorized as {u}"),
                    None => println!("Not authorized"),
                }
            }
            AuthCommand::Logout => {
                let removed = bridge.logout().await?;
                if json { return print_json(&serde_json::json!({ "logged_out": removed })); }
                println!("{}", if removed { "Logged out" } else { "No stored authorization" });
            }
        },
        Commands::Cache { command } => {
            let removed = match command {
                CacheCommand::Clear { prefix } => bridge.clear_cache_prefix(prefix.as_deref()).await?,
                CacheCommand::Purge => bridge.purge_expired_cache().await?,
            };
            if json { return print_json(&serde_json::json!({ "removed": removed })); }
            println!("Removed {removed} cache entries");
        }
        Commands::Db { command: DbCommand::Vacuum } => {
            bridge.vacuum_db().await?;
            if !json { println!("Database vacuumed"); }
        }
        Commands::Stats => {
            let stats = bridge.stats().await?;
            if json { return print_json(&stats); }
            println!("Artifacts:     {}", stats.artifacts);
            println!("Cache entries: {} ({} expired)", stats.cache_entries, stats.expired_cache_entries);
            for (status, n) in &stats.jobs_by_status {
                println!("Jobs {status:<9} {n}");
            }
            println!("Authorized as: {}", stats.authorized_as.as_deref().unwrap_or("-"));
        }
    }
    Ok(())
}

fn print_artifact(a: &Artifact) {
    println!("{} ({})", a.title, a.id);
    if let Some(owner) = &a.owner { println!("  owner:    {owner}"); }
    if !a.licenses.is_empty() { println!("  licenses: {}", a.licenses.join(", ")); }
    println!("  pictures: {}", a.pictures.len());
    println!("  source:   {}", a.source_url);
}

fn print_job(job: &UploadJob) {
    let detail = job.page_url.as_deref().or(job.error.as_deref()).unwrap_or("");
    println!("{:<10} {:<14} {:<12} {} {}", job.status, job.artifact_id, job.media_id, job.filename, detail);
}

fn print_report(report: &UploadReport) {
    for job in &report.jobs {
        print_job(job);
    }
    if report.jobs.is_empty() {
        for plan in &report.plans {
            if let PlanOutcome::Ready(p) = plan {
                println!("would upload {} as File:{}", p.media_id, p.filename);
            }
        }
    }
    println!(
        "planned {}, uploaded {}, duplicate {}, skipped {}, failed {}",
        report.planned, report.uploaded, report.duplicate, report.skipped, report.failed
    );
}
