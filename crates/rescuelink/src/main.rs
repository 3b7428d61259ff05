//! `rescuelink` - CLI for the crash detection and SOS alert pipeline
//!
//! This binary drives the alert pipeline from recorded sensor streams and
//! manages the local alert queues and user profile.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use rescuelink::cli::{
    Cli, Command, ConfigCommand, HistoryCommand, MonitorCommand, ProfileCommand, QueueArg,
    QueueCommand, SosAction,
};
use rescuelink::pipeline::CountdownCanceller;
use rescuelink::{
    init_logging, AlertKind, AlertRecord, Config, DeliveryResult, ReplaySource, Services,
    UpdateResult, UserIdentity,
};

/// How far back `sos update` looks for the alert to follow up.
const RECENT_ALERTS: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    match cli.command {
        Command::Config(cmd) => handle_config(cli.config, cmd),
        Command::Monitor(cmd) => {
            let services = open_services(cli.config, cmd.countdown)?;
            handle_monitor(&services, &cmd).await
        }
        Command::Sos(cmd) => {
            let services = open_services(cli.config, None)?;
            match cmd.action {
                None => {
                    let result = services.pipeline().trigger_sos().await?;
                    print_delivery(&result, cmd.json)
                }
                Some(SosAction::Update { alert, json }) => {
                    handle_sos_update(&services, alert, json || cmd.json).await
                }
            }
        }
        Command::Retry(cmd) => {
            let services = open_services(cli.config, None)?;
            let report = services.pipeline().delivery().retry_pending().await?;
            if cmd.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            if report.attempted == 0 {
                println!("No pending alerts.");
            } else {
                println!(
                    "Retried {} alert(s): {} sent, {} still pending.",
                    report.attempted, report.delivered, report.still_pending
                );
            }
            if report.updates_attempted > 0 {
                println!(
                    "Retried {} location update(s): {} sent.",
                    report.updates_attempted, report.updates_delivered
                );
            }
            Ok(())
        }
        Command::Queue(cmd) => handle_queue(&open_services(cli.config, None)?, cmd),
        Command::History(cmd) => handle_history(&open_services(cli.config, None)?, &cmd).await,
        Command::Profile(cmd) => handle_profile(&open_services(cli.config, None)?, cmd),
        Command::Status(cmd) => handle_status(&open_services(cli.config, None)?, cmd.json),
    }
}

fn open_services(path: Option<PathBuf>, countdown: Option<u64>) -> anyhow::Result<Services> {
    let mut config = Config::load_from(path).context("loading configuration")?;
    if let Some(secs) = countdown {
        config = config.with_countdown(secs).context("applying --countdown")?;
    }
    Services::open(config).context("opening local storage")
}

async fn handle_sos_update(
    services: &Services,
    alert: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let pipeline = services.pipeline();
    let alert_id = match alert {
        Some(id) => id,
        None => pipeline
            .delivery()
            .history(RECENT_ALERTS)
            .await
            .into_iter()
            .find(|record| record.kind == AlertKind::Sos)
            .map(|record| record.alert_id)
            .context("no SOS alert to update; pass --alert")?,
    };

    let result = pipeline.send_location_update(&alert_id).await?;
    print_update(&result, json)
}

fn print_update(result: &UpdateResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("{}", result.user_message());
    println!("  Alert:      {}", result.alert_id);
    println!("  Update:     {}", result.update_id);
    if let Some(collection) = &result.collection {
        println!("  Collection: {collection}");
    }
    if let Some(reason) = &result.reason {
        println!("  Reason:     {reason}");
    }
    Ok(())
}

async fn handle_monitor(services: &Services, cmd: &MonitorCommand) -> anyhow::Result<()> {
    let source = ReplaySource::open(&cmd.replay)
        .with_context(|| format!("reading {}", cmd.replay.display()))?
        .realtime(cmd.realtime);

    let canceller = Arc::new(CountdownCanceller::new());
    {
        let canceller = Arc::clone(&canceller);
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() {
                    break;
                }
                canceller.cancel();
            }
        });
    }

    eprintln!(
        "Monitoring {} (press Enter to cancel a crash countdown)",
        cmd.replay.display()
    );
    let outcome = services
        .pipeline()
        .monitor(Box::new(source), &canceller)
        .await;

    let report = match outcome {
        Ok(report) => report,
        Err(e) if e.is_sensor_unavailable() => {
            eprintln!("Crash detection not available: {e}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Processed {} motion samples and {} speed readings.",
        report.motion_samples, report.speed_readings
    );
    println!(
        "Impacts: {} detected, {} suppressed, {} cancelled.",
        report.impacts, report.suppressed, report.cancelled
    );
    for result in &report.alerts {
        print_delivery(result, false)?;
    }
    Ok(())
}

fn print_delivery(result: &DeliveryResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("{}", result.user_message());
    println!("  Alert:      {}", result.alert_id);
    println!("  State:      {}", result.state);
    if let Some(collection) = &result.collection {
        println!("  Collection: {collection}");
    }
    if let Some(reason) = &result.reason {
        println!("  Reason:     {reason}");
    }
    Ok(())
}

fn handle_queue(services: &Services, cmd: QueueCommand) -> anyhow::Result<()> {
    let delivery = services.pipeline().delivery();
    match cmd {
        QueueCommand::List { only, json } => {
            let snapshot = delivery.snapshot()?;
            let show = |queue: QueueArg| only.is_none() || only == Some(queue);

            if json {
                let mut value = serde_json::Map::new();
                if show(QueueArg::Pending) {
                    value.insert("pending".to_string(), serde_json::to_value(&snapshot.pending)?);
                }
                if show(QueueArg::Sent) {
                    value.insert("sent".to_string(), serde_json::to_value(&snapshot.sent)?);
                }
                if show(QueueArg::Updates) {
                    value.insert("updates".to_string(), serde_json::to_value(&snapshot.updates)?);
                }
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            for (queue, name, entries, capacity) in [
                (QueueArg::Pending, "pending", &snapshot.pending, delivery.pending().capacity()),
                (QueueArg::Sent, "sent", &snapshot.sent, delivery.sent().capacity()),
            ] {
                if !show(queue) {
                    continue;
                }
                println!("{name} ({}/{capacity})", entries.len());
                for entry in entries {
                    println!(
                        "  {}  {:<8} {:<8} saved {}  retries {}",
                        entry.record.alert_id,
                        entry.record.kind.to_string(),
                        entry.record.severity.to_string(),
                        entry.saved_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.retry_count
                    );
                }
            }
            if show(QueueArg::Updates) {
                println!(
                    "updates ({}/{})",
                    snapshot.updates.len(),
                    delivery.updates().capacity()
                );
                for entry in &snapshot.updates {
                    println!(
                        "  {}  for {}  saved {}  retries {}",
                        entry.record.update_id,
                        entry.record.alert_id,
                        entry.saved_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.retry_count
                    );
                }
            }
        }
        QueueCommand::Clear { queue, yes } => {
            if !yes {
                bail!("this removes every entry from the {queue:?} queue; pass --yes to confirm");
            }
            let removed = match queue {
                QueueArg::Pending => delivery.pending().clear()?,
                QueueArg::Sent => delivery.sent().clear()?,
                QueueArg::Updates => delivery.updates().clear()?,
            };
            println!("Removed {removed} entries.");
        }
    }
    Ok(())
}

async fn handle_history(services: &Services, cmd: &HistoryCommand) -> anyhow::Result<()> {
    let records = services.pipeline().delivery().history(cmd.limit).await;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No alerts yet.");
        return Ok(());
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &AlertRecord) {
    let location = record.location.map_or_else(
        || "no location".to_string(),
        |p| format!("{:.5}, {:.5}", p.latitude, p.longitude),
    );
    println!(
        "{}  {:<5} {:<8} {:<12} {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.kind.to_string(),
        record.severity.to_string(),
        record.delivery_state.to_string(),
        location
    );
}

fn handle_profile(services: &Services, cmd: ProfileCommand) -> anyhow::Result<()> {
    let composer = services.pipeline().composer();
    match cmd {
        ProfileCommand::Show { json } => {
            let identity = composer.load_identity();
            if json {
                println!("{}", serde_json::to_string_pretty(&identity)?);
            } else {
                println!("User ID: {}", identity.user_id);
                println!("Name:    {}", identity.user_name);
                println!("Email:   {}", identity.user_email);
                println!("Phone:   {}", identity.user_phone);
            }
        }
        ProfileCommand::Set {
            user_id,
            name,
            email,
            phone,
        } => {
            let current = composer.load_identity();
            let updated = UserIdentity::with_fallbacks(
                user_id.or(Some(current.user_id)),
                name.or(Some(current.user_name)),
                email.or(Some(current.user_email)),
                phone.or(Some(current.user_phone)),
            );
            composer.save_identity(&updated)?;
            println!("Profile updated.");
        }
    }
    Ok(())
}

fn handle_status(services: &Services, json: bool) -> anyhow::Result<()> {
    let config = services.config();
    let stats = services.storage().stats()?;
    let delivery = services.pipeline().delivery();
    let pending = delivery.pending().len()?;
    let sent = delivery.sent().len()?;
    let updates = delivery.updates().len()?;
    let thresholds = config.thresholds();

    if json {
        let status = serde_json::json!({
            "database_path": services.storage().path(),
            "schema_version": stats.schema_version,
            "db_size_bytes": stats.db_size_bytes,
            "remote": services.remote_name(),
            "endpoint": config.delivery.endpoint,
            "pending_alerts": pending,
            "sent_alerts": sent,
            "pending_updates": updates,
            "sensitivity": config.detection.sensitivity,
            "moderate_g": thresholds.moderate_g,
            "severe_g": thresholds.severe_g,
            "device_location": config.device_location(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("rescuelink status");
    println!("-----------------");
    println!("Database:      {}", services.storage().path().display());
    println!("Schema:        v{}", stats.schema_version);
    println!(
        "Remote:        {}",
        config.delivery.endpoint.as_deref().unwrap_or("offline")
    );
    println!("Pending:       {pending}");
    println!("Sent:          {sent}");
    println!("Updates:       {updates} pending");
    println!(
        "Sensitivity:   {} (moderate {:.1}G, severe {:.1}G)",
        config.detection.sensitivity, thresholds.moderate_g, thresholds.severe_g
    );
    match config.device_location() {
        Some(p) => println!("Location:      {:.5}, {:.5}", p.latitude, p.longitude),
        None => println!("Location:      not configured"),
    }
    Ok(())
}

fn handle_config(path: Option<PathBuf>, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                let thresholds = config.thresholds();
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Detection]");
                println!("  Sensitivity:        {}", config.detection.sensitivity);
                println!("  Moderate / severe:  {:.1}G / {:.1}G", thresholds.moderate_g, thresholds.severe_g);
                println!("  Min speed (km/h):   {}", config.detection.min_speed_kmh);
                println!("  Cooldown (ms):      {}", config.detection.cooldown_ms);
                println!("  Countdown (s):      {}", config.detection.countdown_secs);
                println!();
                println!("[Delivery]");
                println!(
                    "  Endpoint:           {}",
                    config.delivery.endpoint.as_deref().unwrap_or("(offline)")
                );
                println!("  SOS chain:          {}", config.delivery.sos_collections.join(" -> "));
                println!("  Crash chain:        {}", config.delivery.crash_collections.join(" -> "));
                println!("  Updates:            {}", config.delivery.updates_collection);
                println!("  Write timeout (ms): {}", config.delivery.write_timeout_ms);
                println!("  Queue capacity:     {}", config.delivery.queue_capacity);
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("configuration error: {e}"),
            }
        }
    }
    Ok(())
}
