use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `AttendProxy` (async) and `AttendProxyBlocking`.
#[zbus::proxy(
    interface = "org.libattend.Attend1",
    default_service = "org.libattend.Attend1",
    default_path = "/org/libattend/Attend1"
)]
trait Attend {
    async fn recognize(&self, station: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn verify(&self, code: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn confirm_attendance(&self, station: &str, code: &str) -> zbus::Result<String>;
    async fn pending_recognition(&self, station: &str) -> zbus::Result<String>;
    async fn check_out(&self, code: &str) -> zbus::Result<String>;
    async fn present_members(&self) -> zbus::Result<String>;
    async fn history(&self, code: &str, limit: u32) -> zbus::Result<String>;
    async fn add_user(&self, code: &str, name: &str) -> zbus::Result<i64>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn remove_user(&self, code: &str) -> zbus::Result<bool>;
    async fn enroll_faces(&self, code: &str, images: Vec<Vec<u8>>) -> zbus::Result<u32>;
    async fn reload_gallery(&self) -> zbus::Result<u64>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "attend", about = "Library attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send kiosk frames for recognition, in order
    Recognize {
        /// Station (camera) id
        #[arg(short, long, default_value = "kiosk")]
        station: String,
        /// Image files (JPEG/PNG)
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Check one image against a claimed member code
    Verify { code: String, image: PathBuf },
    /// Confirm the pending recognition by typing the member code
    Confirm {
        #[arg(short, long, default_value = "kiosk")]
        station: String,
        code: String,
    },
    /// Show the recognition waiting for confirmation
    Pending {
        #[arg(short, long, default_value = "kiosk")]
        station: String,
    },
    /// Close a member's open session
    Checkout { code: String },
    /// List members currently checked in
    Present,
    /// Show a member's completed sessions
    History {
        code: String,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Register a member
    AddUser { code: String, name: String },
    /// List registered members
    Users,
    /// Delete a member and everything recorded for them
    RemoveUser { code: String },
    /// Add reference face images for a member
    Enroll {
        code: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Rebuild the daemon's gallery from storage
    Reload,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendProxy::new(&conn)
        .await
        .context("attendd is not reachable")?;

    match cli.command {
        Commands::Recognize { station, frames } => {
            for path in frames {
                let reply = proxy.recognize(&station, read_image(&path)?).await?;
                tracing::debug!(frame = %path.display(), "frame sent");
                println!("{reply}");
            }
        }
        Commands::Verify { code, image } => {
            println!("{}", proxy.verify(&code, read_image(&image)?).await?);
        }
        Commands::Confirm { station, code } => {
            println!("{}", proxy.confirm_attendance(&station, &code).await?);
        }
        Commands::Pending { station } => {
            println!("{}", proxy.pending_recognition(&station).await?);
        }
        Commands::Checkout { code } => {
            println!("{}", proxy.check_out(&code).await?);
        }
        Commands::Present => {
            println!("{}", proxy.present_members().await?);
        }
        Commands::History { code, limit } => {
            println!("{}", proxy.history(&code, limit).await?);
        }
        Commands::AddUser { code, name } => {
            let id = proxy.add_user(&code, &name).await?;
            println!("Added {code} ({name}) as #{id}");
        }
        Commands::Users => {
            println!("{}", proxy.list_users().await?);
        }
        Commands::RemoveUser { code } => {
            if proxy.remove_user(&code).await? {
                println!("Removed {code}");
            } else {
                bail!("no member with code {code}");
            }
        }
        Commands::Enroll { code, images } => {
            let payload = images
                .iter()
                .map(|p| read_image(p))
                .collect::<Result<Vec<_>>>()?;
            let total = proxy.enroll_faces(&code, payload).await?;
            println!("{code} now has {total} reference face(s)");
        }
        Commands::Reload => {
            let version = proxy.reload_gallery().await?;
            println!("Gallery rebuilt (version {version})");
        }
        Commands::Status => {
            println!("{}", proxy.status().await?);
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}
