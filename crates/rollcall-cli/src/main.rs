use anyhow::Result;
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use serde_json::Value;

#[zbus::proxy(
    interface = "org.freedesktop.Rollcall1",
    default_service = "org.freedesktop.Rollcall1",
    default_path = "/org/freedesktop/Rollcall1"
)]
trait Rollcall {
    async fn start_camera(&self) -> zbus::Result<()>;
    async fn stop_camera(&self) -> zbus::Result<()>;
    async fn capture(&self) -> zbus::Result<()>;
    async fn register_student(&self, student_id: &str, name: &str, age: &str)
        -> zbus::Result<String>;
    async fn report(&self, date: &str) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance console")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera loop (matching and attendance marking)
    Start,
    /// Stop the camera loop
    Stop,
    /// Capture the face in front of the camera for registration
    Capture,
    /// Register a student with the last captured face
    Register {
        /// Unique student ID
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        age: String,
    },
    /// Show the attendance report
    Report {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
    },
    /// List enrolled students
    List,
    /// Show daemon status
    Status,
    /// List local V4L2 capture devices (does not need the daemon)
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        let devices = Camera::list_devices();
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for d in devices {
            println!("{}\t{}\t{}\t{}", d.path, d.name, d.driver, d.bus);
        }
        return Ok(());
    }

    let conn = zbus::Connection::session().await?;
    tracing::debug!("connected to session bus");
    let proxy = RollcallProxy::new(&conn).await?;

    match cli.command {
        Commands::Start => {
            proxy.start_camera().await?;
            println!("Camera started");
        }
        Commands::Stop => {
            proxy.stop_camera().await?;
            println!("Camera stopped");
        }
        Commands::Capture => {
            proxy.capture().await?;
            println!("Face captured successfully");
        }
        Commands::Register { id, name, age } => {
            proxy.register_student(&id, &name, &age).await?;
            println!("Student {id} registered");
        }
        Commands::Report { date } => {
            let json = proxy.report(date.as_deref().unwrap_or("")).await?;
            print_report(&serde_json::from_str(&json)?);
        }
        Commands::List => {
            let json = proxy.list_students().await?;
            print_students(&serde_json::from_str(&json)?);
        }
        Commands::Status => {
            let json = proxy.status().await?;
            let status: Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices => unreachable!("handled above"),
    }

    Ok(())
}

fn print_report(rows: &Value) {
    println!("{:<12} {:<24} TIME", "STUDENT ID", "NAME");
    for row in rows.as_array().into_iter().flatten() {
        println!(
            "{:<12} {:<24} {}",
            text(&row["student_id"]),
            text(&row["name"]),
            row["time"].as_str().unwrap_or("absent")
        );
    }
}

fn print_students(students: &Value) {
    println!("{:<12} {:<24} AGE", "STUDENT ID", "NAME");
    for s in students.as_array().into_iter().flatten() {
        println!("{:<12} {:<24} {}", text(&s["student_id"]), text(&s["name"]), s["age"]);
    }
}

fn text(v: &Value) -> &str {
    v.as_str().unwrap_or("")
}
