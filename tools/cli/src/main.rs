//! Lexideck storage CLI - operate on the dual-backend file store.
//!
//! This tool exposes the storage facade on the command line: health checks,
//! directory listing, uploads, downloads, deletion and the OAuth2 consent
//! flow that produces the refresh token the facade needs.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use futures::StreamExt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lexideck_common::LogicalPath;
use lexideck_storage::gdrive::AuthManager;
use lexideck_storage::{
    Credential, CredentialStore, Encoding, StorageConfig, StorageFacade, WriteOptions,
};

#[derive(Parser)]
#[command(name = "lexideck")]
#[command(about = "Lexideck - dual-backend file storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Read settings from a KEY=value file instead of the environment.
    #[arg(short, long, global = true)]
    env_file: Option<PathBuf>,

    /// Read settings from a JSON file instead of the environment.
    #[arg(short, long, global = true, conflicts_with = "env_file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check local storage, connectivity and credentials.
    Health,

    /// List a remote directory.
    Ls {
        /// Directory path (default: root).
        #[arg(default_value = "/")]
        path: String,
    },

    /// Create a directory chain.
    Mkdir {
        /// Directory path to create.
        path: String,

        /// Create locally first and replicate in the background.
        #[arg(long)]
        local_first: bool,
    },

    /// Upload a local file.
    Put {
        /// Source file to upload.
        source: PathBuf,

        /// Destination logical path.
        dest: String,

        /// Content type for the remote copy.
        #[arg(short, long)]
        mime_type: Option<String>,

        /// Write to the local mirror first and replicate in the background.
        #[arg(long)]
        local_first: bool,
    },

    /// Download a file to stdout or a local path.
    Cat {
        /// Logical path of the file.
        path: String,

        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a file.
    Rm {
        /// Logical path of the file.
        path: String,
    },

    /// Print the OAuth2 consent URL.
    AuthUrl {
        /// Also open it in the default browser.
        #[arg(long)]
        open: bool,
    },

    /// Run the OAuth2 consent flow and store the resulting tokens.
    Login {
        /// Do not try to open a browser.
        #[arg(long)]
        no_browser: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "lexideck", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.env_file.as_deref(), cli.config.as_deref())?;

    match cli.command {
        Commands::Health => cmd_health(&config).await,
        Commands::Ls { path } => cmd_ls(&config, &path).await,
        Commands::Mkdir { path, local_first } => cmd_mkdir(&config, &path, local_first).await,
        Commands::Put {
            source,
            dest,
            mime_type,
            local_first,
        } => cmd_put(&config, &source, &dest, mime_type, local_first).await,
        Commands::Cat { path, output } => cmd_cat(&config, &path, output.as_deref()).await,
        Commands::Rm { path } => cmd_rm(&config, &path).await,
        Commands::AuthUrl { open } => cmd_auth_url(&config, open),
        Commands::Login { no_browser } => cmd_login(&config, no_browser).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn load_config(env_file: Option<&Path>, json: Option<&Path>) -> Result<StorageConfig> {
    match (env_file, json) {
        (Some(path), _) => StorageConfig::from_env_file(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        (None, Some(path)) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            StorageConfig::from_json(&content).context("Invalid JSON configuration")
        }
        (None, None) => StorageConfig::from_env().context("Invalid environment configuration"),
    }
}

fn open_storage(config: &StorageConfig) -> Result<StorageFacade> {
    StorageFacade::new(config).context("Failed to initialize storage")
}

/// Check connectivity and credentials.
async fn cmd_health(config: &StorageConfig) -> Result<()> {
    let storage = open_storage(config)?;
    let report = storage.health_check().await.context("Health check failed")?;

    println!("Storage is healthy.");
    println!("  Backend: {}", report.backend);
    if let Some(user) = &report.user {
        println!("  Account: {}", user);
    }
    match (report.quota_usage, report.quota_limit) {
        (Some(used), Some(limit)) => println!("  Quota: {} of {} bytes", used, limit),
        (Some(used), None) => println!("  Quota: {} bytes used (unlimited)", used),
        _ => {}
    }
    println!("  Credentials: {:?}", report.credential_state);
    match &report.local_root {
        Some(root) => println!("  Local mirror: {}", root.display()),
        None => println!("  Local mirror: disabled"),
    }

    Ok(())
}

/// List directory contents.
async fn cmd_ls(config: &StorageConfig, path: &str) -> Result<()> {
    let storage = open_storage(config)?;
    let names = storage
        .readdir(path)
        .await
        .context("Failed to list directory")?;

    if names.is_empty() {
        println!("Directory is empty.");
    } else {
        for name in names {
            println!("{}", name);
        }
    }

    Ok(())
}

/// Create a directory chain.
async fn cmd_mkdir(config: &StorageConfig, path: &str, local_first: bool) -> Result<()> {
    let storage = open_storage(config)?;

    if local_first {
        let local = storage
            .mkdir_sync(path)
            .context("Failed to create local directory")?;
        info!("Created {}; replicating", local.display());
        storage.flush_shadow_writes().await;
    } else {
        let id = storage
            .mkdir(path)
            .await
            .context("Failed to create directory")?;
        info!("Folder id: {}", id);
    }

    println!("Directory created: {}", LogicalPath::parse(path));

    Ok(())
}

/// Upload a file.
async fn cmd_put(
    config: &StorageConfig,
    source: &Path,
    dest: &str,
    mime_type: Option<String>,
    local_first: bool,
) -> Result<()> {
    let remote = file_path(dest)?;
    info!("Uploading {} as {}", source.display(), remote);

    let content = tokio::fs::read(source)
        .await
        .context("Failed to read source file")?;

    let storage = open_storage(config)?;
    let options = WriteOptions {
        encoding: Encoding::Binary,
        mime_type,
    };

    if local_first {
        storage
            .write_file_sync(dest, &content, &options)
            .context("Failed to write local copy")?;
        storage.flush_shadow_writes().await;
    } else {
        let id = storage
            .write_file(dest, &content, &options)
            .await
            .context("Failed to upload file")?;
        info!("File id: {}", id);
    }

    println!("File stored: {} ({} bytes)", remote, content.len());

    Ok(())
}

/// Stream a file to stdout or disk.
async fn cmd_cat(config: &StorageConfig, path: &str, output: Option<&Path>) -> Result<()> {
    let storage = open_storage(config)?;
    let mut stream = storage.create_read_stream(path);

    match output {
        Some(dest) => {
            let mut file = tokio::fs::File::create(dest)
                .await
                .context("Failed to create output file")?;
            let mut written = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Failed to read file")?;
                file.write_all(&chunk).await?;
                written += chunk.len();
            }
            file.flush().await?;
            println!("File saved: {} ({} bytes)", dest.display(), written);
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            while let Some(chunk) = stream.next().await {
                stdout.write_all(&chunk.context("Failed to read file")?)?;
            }
            stdout.flush()?;
        }
    }

    Ok(())
}

/// Delete a file.
async fn cmd_rm(config: &StorageConfig, path: &str) -> Result<()> {
    let remote = file_path(path)?;
    let storage = open_storage(config)?;
    storage
        .unlink(path)
        .await
        .context("Failed to remove file")?;

    println!("File removed: {}", remote);

    Ok(())
}

/// Normalized remote path of a file argument.
fn file_path(path: &str) -> Result<LogicalPath> {
    let remote = LogicalPath::parse(path);
    anyhow::ensure!(!remote.is_root(), "Not a file path: {:?}", path);
    Ok(remote)
}

fn auth_manager(config: &StorageConfig) -> Result<AuthManager> {
    anyhow::ensure!(
        !config.client_id.is_empty() && !config.client_secret.is_empty(),
        "GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET must be set"
    );
    AuthManager::new(config.auth_config()).context("Invalid OAuth2 configuration")
}

/// Print the consent URL.
fn cmd_auth_url(config: &StorageConfig, open_browser: bool) -> Result<()> {
    let (url, _csrf) = auth_manager(config)?.authorization_url();
    println!("{}", url);

    if open_browser {
        open::that(&url).with_context(|| "Failed to open system default browser")?;
    }

    Ok(())
}

/// Run the consent flow and persist the tokens.
async fn cmd_login(config: &StorageConfig, no_browser: bool) -> Result<()> {
    let auth = auth_manager(config)?;
    let (url, csrf) = auth.authorization_url();

    println!("Visit this URL to grant access:\n\n  {}\n", url);
    if !no_browser {
        if let Err(e) = open::that(&url) {
            info!("Could not open a browser: {}", e);
        }
    }

    print!("Paste the redirected URL or the authorization code: ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut input)
        .context("Failed to read input")?;

    let code = extract_code(input.trim(), &csrf)?;
    let tokens = auth
        .exchange_code(&code)
        .await
        .context("Failed to exchange authorization code")?;

    let mut credential: Credential = config.credential();
    credential.access_token = tokens.access_token.clone();
    credential.refresh_token = tokens.refresh_token.clone();
    credential.expires_at = tokens.expires_at;

    let store = CredentialStore::new(credential, config.credential_files.clone());
    let path = store.persist().await.context("Failed to save tokens")?;

    println!("Login successful. Tokens saved to {}", path.display());

    Ok(())
}

/// Pull the authorization code out of a pasted redirect URL, checking the
/// CSRF state when present. Bare codes are returned as is.
fn extract_code(input: &str, csrf: &str) -> Result<String> {
    anyhow::ensure!(!input.is_empty(), "No authorization code given");

    if !input.starts_with("http://") && !input.starts_with("https://") {
        return Ok(input.to_string());
    }

    let url = url::Url::parse(input).context("Invalid redirect URL")?;
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };

    if let Some(error) = param("error") {
        anyhow::bail!("Authorization was denied: {}", error);
    }
    if let Some(state) = param("state") {
        anyhow::ensure!(state == csrf, "State mismatch; restart the login");
    }

    param("code").context("Redirect URL has no code parameter")
}
