use controller::{config::Settings, controller::run, telemetry, State};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let settings = Settings::from_env();
    let state = State::new(settings);
    run(state).await?;
    Ok(())
}
