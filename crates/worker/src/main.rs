use keyline_worker::{Command, Settings};

fn main() -> anyhow::Result<()> {
    keyline_observability::init();

    let command = Command::parse(std::env::args().skip(1))?;
    let settings = Settings::from_env()?;

    tracing::info!(
        master = %settings.master,
        queue = %settings.queue,
        sentinels = settings.sentinels.len(),
        "keyline worker starting"
    );

    keyline_worker::run(command, &settings)
}
