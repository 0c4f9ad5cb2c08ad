use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facegate.Gate1",
    default_service = "org.facegate.Gate1",
    default_path = "/org/facegate/Gate1"
)]
trait Gate {
    fn authenticate(&self, image: &str) -> zbus::Result<String>;
    fn simulate(&self, employee_id: i64) -> zbus::Result<String>;
    fn enroll(&self, employee_id: i64, image: &str) -> zbus::Result<String>;
    fn create_role(
        &self,
        role_name: &str,
        description: &str,
        security_level: i32,
        max_attempts: i32,
        can_enroll_others: bool,
    ) -> zbus::Result<String>;
    fn create_employee(
        &self,
        role_id: i64,
        first_name: &str,
        last_name: &str,
        email: &str,
        department: &str,
    ) -> zbus::Result<String>;
    fn set_employee_active(&self, employee_id: i64, active: bool) -> zbus::Result<bool>;
    fn list_employees(&self) -> zbus::Result<String>;
    fn get_signature(&self, employee_id: i64) -> zbus::Result<String>;
    fn recent_attempts(&self, limit: u32) -> zbus::Result<String>;
    fn attempt_summary(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate employee face authentication CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate the face in an image file
    Authenticate {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Enroll an employee's face from an image file
    Enroll {
        #[arg(short, long)]
        employee: i64,
        image: PathBuf,
    },
    /// Simulate an authentication attempt without imagery
    Simulate {
        #[arg(short, long)]
        employee: i64,
    },
    /// Create a role
    AddRole {
        name: String,
        #[arg(short, long, default_value_t = 1)]
        security_level: i32,
        #[arg(long, default_value_t = 3)]
        max_attempts: i32,
        #[arg(long)]
        can_enroll_others: bool,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Create an employee
    AddEmployee {
        #[arg(short, long)]
        role: i64,
        first_name: String,
        last_name: String,
        email: String,
        #[arg(short, long, default_value = "")]
        department: String,
    },
    /// Deactivate an employee (excluded from matching)
    Deactivate { employee: i64 },
    /// Reactivate an employee
    Activate { employee: i64 },
    /// List active employees
    Employees,
    /// Show an employee's enrolled signature
    Signature { employee: i64 },
    /// Show recent authentication attempts
    Attempts {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// Show dashboard figures: attempt counts, today's attempts, success rate
    Summary,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let gate = GateProxy::new(&conn)
        .await
        .context("facegated is not reachable; is the daemon running?")?;

    let json = match cli.command {
        Commands::Authenticate { image } => gate.authenticate(&image_payload(&image)?).await?,
        Commands::Enroll { employee, image } => {
            gate.enroll(employee, &image_payload(&image)?).await?
        }
        Commands::Simulate { employee } => gate.simulate(employee).await?,
        Commands::AddRole {
            name,
            security_level,
            max_attempts,
            can_enroll_others,
            description,
        } => {
            gate.create_role(&name, &description, security_level, max_attempts, can_enroll_others)
                .await?
        }
        Commands::AddEmployee {
            role,
            first_name,
            last_name,
            email,
            department,
        } => {
            gate.create_employee(role, &first_name, &last_name, &email, &department)
                .await?
        }
        Commands::Deactivate { employee } => {
            gate.set_employee_active(employee, false).await?;
            format!("{{\"employee_id\":{employee},\"is_active\":false}}")
        }
        Commands::Activate { employee } => {
            gate.set_employee_active(employee, true).await?;
            format!("{{\"employee_id\":{employee},\"is_active\":true}}")
        }
        Commands::Employees => gate.list_employees().await?,
        Commands::Signature { employee } => gate.get_signature(employee).await?,
        Commands::Attempts { limit } => gate.recent_attempts(limit).await?,
        Commands::Summary => gate.attempt_summary().await?,
        Commands::Status => gate.status().await?,
    };

    print_json(&json);
    Ok(())
}

/// Read an image file and encode it the way a browser capture arrives.
fn image_payload(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "image loaded");
    Ok(format!(
        "data:{};base64,{}",
        mime_for(path),
        general_purpose::STANDARD.encode(bytes)
    ))
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}
