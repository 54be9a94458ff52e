use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn register(&self, course: &str, roll: &str, name: &str, image: &[u8]) -> zbus::Result<String>;
    fn reregister(&self, course: &str, roll: &str, name: &str, image: &[u8]) -> zbus::Result<String>;
    fn deactivate(&self, course: &str, roll: &str) -> zbus::Result<bool>;
    fn recognize(&self, course: &str, image: &[u8]) -> zbus::Result<String>;
    fn attendance(&self, course: &str, from: &str, to: &str) -> zbus::Result<String>;
    fn summary(&self, course: &str, date: &str) -> zbus::Result<String>;
    fn list_students(&self, course: &str) -> zbus::Result<String>;
    fn get_student(&self, course: &str, roll: &str) -> zbus::Result<String>;
    fn retract(&self, course: &str, roll: &str, date: &str) -> zbus::Result<bool>;
    fn purge(&self, course: &str, before: &str) -> zbus::Result<u32>;
    fn rebuild(&self, course: &str) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from a single-face detections document
    Register {
        course: String,
        roll: String,
        name: String,
        /// Detections document produced by the embedding service
        photo: PathBuf,
    },
    /// Replace an existing student's name and face
    Reregister {
        course: String,
        roll: String,
        name: String,
        photo: PathBuf,
    },
    /// Deactivate a student (kept for attendance history)
    Deactivate { course: String, roll: String },
    /// Match every face in a photo and record attendance
    Recognize { course: String, photo: PathBuf },
    /// Attendance records for an inclusive date range (YYYY-MM-DD)
    Attendance {
        course: String,
        from: String,
        /// Defaults to FROM
        to: Option<String>,
    },
    /// Present/absent roster for a day (default: today)
    Summary { course: String, date: Option<String> },
    /// List students of a course
    Students { course: String },
    /// Show one student
    Student { course: String, roll: String },
    /// Remove one day's attendance for a student
    Retract {
        course: String,
        roll: String,
        date: String,
    },
    /// Delete attendance records dated before a day
    Purge { course: String, before: String },
    /// Rebuild a course index from the identity store
    Rebuild { course: String },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("cannot reach rollcalld")?;

    match cli.command {
        Commands::Register {
            course,
            roll,
            name,
            photo,
        } => {
            let image = read_photo(&photo)?;
            print_json(&proxy.register(&course, &roll, &name, &image).await?)?;
        }
        Commands::Reregister {
            course,
            roll,
            name,
            photo,
        } => {
            let image = read_photo(&photo)?;
            print_json(&proxy.reregister(&course, &roll, &name, &image).await?)?;
        }
        Commands::Deactivate { course, roll } => {
            if proxy.deactivate(&course, &roll).await? {
                println!("Student {roll} deactivated in {course}");
            } else {
                println!("Student {roll} was already inactive in {course}");
            }
        }
        Commands::Recognize { course, photo } => {
            let image = read_photo(&photo)?;
            print_json(&proxy.recognize(&course, &image).await?)?;
        }
        Commands::Attendance { course, from, to } => {
            let to = to.unwrap_or_else(|| from.clone());
            print_json(&proxy.attendance(&course, &from, &to).await?)?;
        }
        Commands::Summary { course, date } => {
            print_json(&proxy.summary(&course, date.as_deref().unwrap_or("")).await?)?;
        }
        Commands::Students { course } => {
            print_json(&proxy.list_students(&course).await?)?;
        }
        Commands::Student { course, roll } => {
            print_json(&proxy.get_student(&course, &roll).await?)?;
        }
        Commands::Retract { course, roll, date } => {
            if proxy.retract(&course, &roll, &date).await? {
                println!("Attendance of {roll} on {date} retracted");
            } else {
                println!("No attendance for {roll} on {date}");
            }
        }
        Commands::Purge { course, before } => {
            let removed = proxy.purge(&course, &before).await?;
            println!("Purged {removed} record(s) before {before} in {course}");
        }
        Commands::Rebuild { course } => {
            let entries = proxy.rebuild(&course).await?;
            println!("Index for {course} rebuilt with {entries} student(s)");
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "read photo");
    Ok(bytes)
}

/// Pretty-print a JSON reply, falling back to the raw string.
fn print_json(raw: &str) -> Result<()> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{raw}"),
    }
    Ok(())
}
