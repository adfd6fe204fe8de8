use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "attendly", about = "Attendly face-recognition attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true, env = "ATTENDLY_SYSTEM_BUS", value_parser = clap::builder::BoolishValueParser::new())]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from one or more face photos
    Enroll {
        /// Identity id (e.g. roll number)
        id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Image files, one reference embedding each
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Remove an enrolled identity
    Remove {
        id: String,
    },
    /// List enrolled identities
    List,
    /// Start the capture loop
    Start,
    /// Stop the capture loop and release the camera
    Stop,
    /// Show daemon status
    Status,
    /// Show attendance records
    Report {
        /// First day (YYYY-MM-DD), default today
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day (YYYY-MM-DD), default `from`
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Only this identity
        #[arg(long)]
        id: Option<String>,
    },
    /// Show attendance percentages per identity
    Summary {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 10)]
        frames: usize,
        /// Save the last usable frame as an image
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.attendly.Attendance1",
    default_service = "org.attendly.Attendance1",
    default_path = "/org/attendly/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, identity_id: &str, name: &str, image_paths: Vec<String>) -> zbus::Result<u32>;
    async fn remove_identity(&self, identity_id: &str) -> zbus::Result<()>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn start_capture(&self) -> zbus::Result<()>;
    async fn stop_capture(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn query(&self, from: &str, to: &str, identity_id: &str) -> zbus::Result<String>;
    async fn summary(&self, from: &str, to: &str) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test { device, frames, output } = &cli.command {
        return camera_test(device, *frames, output.as_deref());
    }

    tracing::debug!(system_bus = cli.system, "connecting to attendlyd");
    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("attendlyd is not reachable")?;

    match cli.command {
        Commands::Enroll { id, name, images } => {
            // The daemon resolves paths from its own working directory.
            let paths = images
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p)
                        .with_context(|| format!("cannot read {}", p.display()))
                        .map(|p| p.to_string_lossy().into_owned())
                })
                .collect::<Result<Vec<_>>>()?;
            let count = proxy.enroll(&id, &name, paths).await?;
            println!("Enrolled {id} ({name}) with {count} reference(s)");
        }
        Commands::Remove { id } => {
            proxy.remove_identity(&id).await?;
            println!("Removed {id}");
        }
        Commands::List => {
            let list: Value = serde_json::from_str(&proxy.list_identities().await?)?;
            let rows = identity_lines(&list);
            if rows.is_empty() {
                println!("No identities enrolled");
            }
            for line in rows {
                println!("{line}");
            }
        }
        Commands::Start => {
            proxy.start_capture().await?;
            println!("Capture started");
        }
        Commands::Stop => {
            proxy.stop_capture().await?;
            println!("Capture stopped");
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Report { from, to, id } => {
            let from = from.unwrap_or_else(|| chrono::Local::now().date_naive());
            let to = to.unwrap_or(from);
            check_range(from, to)?;
            let json = proxy
                .query(&from.to_string(), &to.to_string(), id.as_deref().unwrap_or(""))
                .await?;
            let records: Value = serde_json::from_str(&json)?;
            let rows = record_lines(&records);
            if rows.is_empty() {
                println!("No attendance between {from} and {to}");
            }
            for line in rows {
                println!("{line}");
            }
        }
        Commands::Summary { from, to } => {
            let to = to.unwrap_or_else(|| chrono::Local::now().date_naive());
            check_range(from, to)?;
            let summary: Value = serde_json::from_str(&proxy.summary(&from.to_string(), &to.to_string()).await?)?;
            for line in summary_lines(&summary) {
                println!("{line}");
            }
        }
        Commands::Test { .. } => unreachable!("handled before connecting"),
    }

    Ok(())
}

/// Open the camera, grab frames and report brightness and dark-frame rate.
fn camera_test(device: &str, frames: usize, output: Option<&std::path::Path>) -> Result<()> {
    println!("Available capture devices:");
    for info in attendly_hw::Camera::list_devices() {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let mut camera = attendly_hw::Camera::open(device, 640, 480)?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let mut dark = 0usize;
    let mut last_good = None;
    for _ in 0..frames {
        let frame = camera.grab()?;
        println!(
            "  frame {:>4}: brightness {:6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        if frame.is_dark {
            dark += 1;
        } else {
            last_good = Some(frame);
        }
    }
    println!("{dark}/{frames} dark frames");

    if let Some(path) = output {
        let Some(frame) = last_good else {
            bail!("no usable frame to save");
        };
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image.save(path).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn check_range(from: NaiveDate, to: NaiveDate) -> Result<()> {
    if from > to {
        bail!("--from {from} is after --to {to}");
    }
    Ok(())
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn identity_lines(list: &Value) -> Vec<String> {
    list.as_array()
        .map(|items| {
            items
                .iter()
                .map(|i| {
                    let refs = i.get("references").and_then(Value::as_u64).unwrap_or(0);
                    format!("{:<16} {:<24} {refs} reference(s)", str_field(i, "id"), str_field(i, "name"))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn record_lines(records: &Value) -> Vec<String> {
    records
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|r| {
                    let time_out = r.get("time_out").and_then(Value::as_str).unwrap_or("open");
                    format!(
                        "{}  {:<16} in {:<12} out {:<12} {}",
                        str_field(r, "date"),
                        str_field(r, "identity_id"),
                        str_field(r, "time_in"),
                        time_out,
                        str_field(r, "status"),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn summary_lines(summary: &Value) -> Vec<String> {
    summary
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|s| {
                    let num = |key: &str| s.get(key).and_then(Value::as_f64).unwrap_or(0.0);
                    format!(
                        "{:<16} {:<24} {:>3}/{:<3} {:5.1}%",
                        str_field(s, "identity_id"),
                        str_field(s, "name"),
                        num("present_days"),
                        num("total_days"),
                        num("percentage"),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}
