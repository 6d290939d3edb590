//! Queue worker and producer wired to Sentinel-discovered Redis.

use std::thread;

use tracing::{info, warn};

use keyline_infra::{Job, ResilientConnection, WorkFn, create_queue, create_resilient_client};

pub mod command;
pub mod settings;

pub use command::Command;
pub use settings::Settings;

pub fn run(command: Command, settings: &Settings) -> anyhow::Result<()> {
    let connection = create_resilient_client(
        settings.sentinels.clone(),
        settings.master.clone(),
        settings.client.clone(),
    )?;
    log_connection_events(&connection)?;

    let outcome = match command {
        Command::Consume => consume(&connection, settings),
        Command::Push(values) => produce(&connection, settings, &values, false),
        Command::PushUrgent(values) => produce(&connection, settings, &values, true),
        Command::Len => {
            let queue = create_queue(
                connection.clone(),
                settings.queue.clone(),
                None,
                settings.queue_options.clone(),
            );
            println!("{}", queue.len()?);
            Ok(())
        }
    };

    connection.close();
    outcome
}

/// Consume until the connection is closed or fails for good.
///
/// Queue events are deliberately not subscribed to here: a failing job has
/// no observer and takes the process down for the supervisor to restart.
fn consume(connection: &ResilientConnection, settings: &Settings) -> anyhow::Result<()> {
    let worker: WorkFn = Box::new(|job: Job| -> anyhow::Result<()> {
        info!(
            queue = %job.queue(),
            bytes = job.payload().len(),
            payload = job.as_str().unwrap_or("<binary>"),
            "job received"
        );
        Ok(())
    });

    let queue = create_queue(
        connection.clone(),
        settings.queue.clone(),
        Some(worker),
        settings.queue_options.clone(),
    );
    queue.open()?;
    queue.join()?;
    Ok(())
}

fn produce(
    connection: &ResilientConnection,
    settings: &Settings,
    values: &[String],
    urgent: bool,
) -> anyhow::Result<()> {
    let queue = create_queue(
        connection.clone(),
        settings.queue.clone(),
        None,
        settings.queue_options.clone(),
    );

    for value in values {
        if urgent {
            queue.push_urgent(value)?;
        } else {
            queue.push(value)?;
        }
    }

    info!(queue = %settings.queue, count = values.len(), urgent, "values pushed");
    Ok(())
}

fn log_connection_events(connection: &ResilientConnection) -> anyhow::Result<()> {
    let notices = connection.subscribe();
    thread::Builder::new()
        .name("keyline-connection-log".to_string())
        .spawn(move || {
            while let Ok(notice) = notices.recv() {
                match notice.to_json() {
                    Ok(json) => info!(notice = %json, "connection event"),
                    Err(err) => warn!(error = %err, "unrenderable connection event"),
                }
            }
        })?;
    Ok(())
}
