use anyhow::{bail, Context};
use chrono::Local;
use glam::EulerRot;
use gyrolink::config::Config;
use gyrolink::endpoint::sensor::SimulatedSensor;
use gyrolink::endpoint::source::spawn_source;
use gyrolink::endpoint::viewer::spawn_viewer;
use gyrolink::endpoint::ViewerUpdate;
use gyrolink::logger;
use gyrolink::relay::Relay;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const USAGE: &str = "usage: gyrolink relay | viewer | source <session-id>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let config = Config::from_env().context("reading GYROLINK_* configuration")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["relay"] => run_relay(&config).await,
        ["viewer"] => run_viewer(&config).await,
        ["source", session_id] => run_source(&config, session_id).await,
        _ => bail!(USAGE),
    }
}

async fn run_relay(config: &Config) -> anyhow::Result<()> {
    let relay = Relay::bind(&config.relay_addr)
        .await
        .with_context(|| format!("binding relay to {}", config.relay_addr))?;
    info!(addr = %relay.local_addr()?, "relay up");
    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("relay stopping"),
    }
    Ok(())
}

enum Input {
    Update(Result<ViewerUpdate, RecvError>),
    Line(Option<String>),
    Quit,
}

async fn run_viewer(config: &Config) -> anyhow::Result<()> {
    let mut handle = spawn_viewer(config).await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    println!("type 'c' + enter to calibrate, ctrl-c to quit");

    loop {
        let input = tokio::select! {
            update = handle.first_updates.recv() => Input::Update(update),
            line = stdin.next_line() => Input::Line(line?),
            _ = tokio::signal::ctrl_c() => Input::Quit,
        };
        match input {
            Input::Update(Ok(update)) => print_update(&update),
            Input::Update(Err(RecvError::Lagged(n))) => warn!(skipped = n, "display fell behind"),
            Input::Update(Err(RecvError::Closed)) | Input::Line(None) | Input::Quit => break,
            Input::Line(Some(line)) => {
                if line.trim() == "c" && !handle.request_calibration() {
                    break;
                }
            }
        }
    }

    handle.shutdown();
    let _ = handle.task.await;
    Ok(())
}

fn print_update(update: &ViewerUpdate) {
    let at = Local::now().format("%H:%M:%S%.3f");
    match update {
        ViewerUpdate::Session {
            session_id,
            pairing_url,
        } => println!("{at} session {session_id}: open {pairing_url} on the phone"),
        ViewerUpdate::Orientation(q) => {
            let (yaw, pitch, roll) = q.to_euler(EulerRot::YXZ);
            println!(
                "{at} yaw {:7.2} pitch {:7.2} roll {:7.2}",
                yaw.to_degrees(),
                pitch.to_degrees(),
                roll.to_degrees()
            );
        }
        // plotted by a real UI; too chatty for a terminal
        ViewerUpdate::History(_) => {}
        other => println!("{at} {other:?}"),
    }
}

async fn run_source(config: &Config, session_id: &str) -> anyhow::Result<()> {
    let mut handle = spawn_source(
        config,
        session_id.to_string(),
        Box::new(SimulatedSensor::new()),
    )
    .await?;
    let finished = tokio::select! {
        _ = &mut handle.task => true,
        _ = tokio::signal::ctrl_c() => false,
    };
    if !finished {
        handle.shutdown();
        let _ = handle.task.await;
    }
    Ok(())
}
