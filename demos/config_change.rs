use rjunos::logging::{LogLevel, LogSettings};
use rjunos::options::{ConfigMode, LoadAction};
use rjunos::output::{OutputOptions, OutputSink};
use rjunos::session::{
    CommitOptions, ConfigChange, ConfigChangeSummary, ConfigRequest, ConnectionManager,
    ConnectionOptions, LoadRequest,
};
use std::error::Error;

fn print_change_plan(change: &ConfigChange) {
    println!(
        "dry-run change={} mode={} check={} commit={}",
        change.name,
        change.config.mode,
        change.check,
        change.commit.is_some()
    );
    for (idx, load) in change.loads.iter().enumerate() {
        println!("  load[{idx}] action={} source={:?}", load.action, load.source);
    }
}

fn print_change_report(summary: &ConfigChangeSummary) {
    println!(
        "change={} changed={} committed={} failed_stage={:?}",
        summary.name, summary.changed, summary.committed, summary.failed_stage
    );
    if let Some(diff) = &summary.diff {
        println!("{diff}");
    }
    if let Some(reason) = &summary.failure_reason {
        println!("  failure_reason={reason}");
    }
    if let Some(reason) = &summary.close_error {
        println!("  close_error={reason}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let dry_run = std::env::args().any(|arg| arg == "--dry-run");

    let change = ConfigChange::new("disable-ge0", ConfigRequest::new(ConfigMode::Exclusive))
        .with_load(LoadRequest::lines(
            LoadAction::Merge,
            [
                "set interfaces ge-0/0/0 disable",
                "set interfaces ge-0/0/0 description \"parked\"",
            ],
        ))
        .with_commit(CommitOptions {
            comment: Some("park ge-0/0/0".to_string()),
            ..Default::default()
        });

    // Unreadable sources and bad modes fail here, before any connection.
    change.validate()?;
    if dry_run {
        print_change_plan(&change);
        return Ok(());
    }

    let options = ConnectionOptions {
        host: Some("192.168.1.1".to_string()),
        user: Some("admin".to_string()),
        password: Some("password".to_string()),
        ..Default::default()
    };
    let log = LogSettings {
        level: Some(LogLevel::Debug),
        ..Default::default()
    };
    let mut manager = ConnectionManager::start(&options, &log)?;
    let mut sink = OutputSink::new(
        manager.host(),
        OutputOptions {
            dest_dir: Some(std::env::temp_dir()),
            ..Default::default()
        },
    );

    let result = manager.apply_change(&change, Some(&mut sink)).await;
    let summary = manager.finish(result).await?;
    print_change_report(&summary);
    if summary.failed() {
        return Err("configuration change failed; inspect the report above".into());
    }
    Ok(())
}
