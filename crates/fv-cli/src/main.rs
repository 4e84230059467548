//! fieldvault: end-to-end encrypted field store CLI
//!
//! Account commands:
//!   init                      - provision key material for a user
//!   reset --yes               - destroy all key material and rows (dev only)
//!
//! Field commands (unlock with FIELDVAULT_PASSPHRASE or a prompt):
//!   put / get                 - encrypt fields into a row, decrypt a row
//!   find / index              - blind-index lookup, raw blind index
//!
//! Server-managed records:
//!   seal / open               - AES-256-GCM under the server secret
//!
//!   config show               - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fv_core::config::FieldVaultConfig;
use fv_core::types::{FieldColumns, FieldValue};
use fv_crypto::{KdfParams, SealedRecord, ServerCipher};
use fv_session::{ResetAuthorization, RetryPolicy, Session};
use fv_store::{JsonFileStore, KeyStore, RecordStore, RowColumns};

const PASSPHRASE_ENV: &str = "FIELDVAULT_PASSPHRASE";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "fieldvault",
    version,
    about = "End-to-end encrypted field store",
    long_about = "fieldvault: provision accounts, encrypt and search fields, and seal server-side records"
)]
struct Cli {
    /// Path to fieldvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "FIELDVAULT_CONFIG",
        default_value = "~/.config/fieldvault/config.toml"
    )]
    config: PathBuf,

    /// Account the command acts on
    #[arg(long, short = 'u', env = "FIELDVAULT_USER", default_value = "default")]
    user: String,

    /// Store file (overrides config)
    #[arg(long, env = "FIELDVAULT_STORE")]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long, env = "FIELDVAULT_LOG")]
    log: Option<String>,

    /// Log format; overrides config
    #[arg(long, env = "FIELDVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision key material for the user (asks for the passphrase twice)
    Init,

    /// Encrypt a field value into a row
    Put {
        #[arg(long, short = 's')]
        scope: String,
        #[arg(long, short = 't')]
        table: String,
        #[arg(long, short = 'r')]
        row: String,
        #[arg(long, short = 'f')]
        field: String,
        /// Plaintext value
        value: String,
        /// Also store a blind index so the field can be found with `find`
        #[arg(long)]
        searchable: bool,
    },

    /// Decrypt fields of a row
    Get {
        #[arg(long, short = 's')]
        scope: String,
        #[arg(long, short = 't')]
        table: String,
        #[arg(long, short = 'r')]
        row: String,
        /// Field names (default: every field stored on the row)
        fields: Vec<String>,
    },

    /// Find rows whose searchable field equals a value
    Find {
        #[arg(long, short = 's')]
        scope: String,
        #[arg(long, short = 't')]
        table: String,
        #[arg(long, short = 'f')]
        field: String,
        value: String,
    },

    /// Print the blind index of a value
    Index {
        #[arg(long, short = 's')]
        scope: String,
        value: String,
    },

    /// Destroy every row and all key material of the user (irreversible)
    ///
    /// Refused in production, and unless the variable named by
    /// reset.allow_env is set to 1 or true.
    Reset {
        /// Confirm irreversible data loss
        #[arg(long)]
        yes: bool,
    },

    /// Seal a record under the server secret; prints JSON
    Seal {
        /// Associated data bound to the record
        #[arg(long, default_value = "")]
        aad: String,
        plaintext: String,
    },

    /// Open a sealed JSON record produced by `seal`
    Open {
        #[arg(long, default_value = "")]
        aad: String,
        record: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(
        if config.log.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
    );
    init_logging(&level, &format);

    if !config_path.exists() {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        Commands::Seal { aad, plaintext } => cmd_seal(&config, &aad, &plaintext),
        Commands::Open { aad, record } => cmd_open(&config, &aad, &record),
        command => {
            let store_path = cli
                .store
                .clone()
                .unwrap_or_else(|| expand_tilde(&config.storage.path));
            let store = Arc::new(
                JsonFileStore::open(&store_path)
                    .await
                    .with_context(|| format!("opening store: {}", store_path.display()))?,
            );
            store.health_check().await.context("store health check")?;
            let session = Session::new(store.clone(), cli.user.clone(), config.storage.encoding);
            run_session_command(command, &config, &session, store.as_ref()).await
        }
    }
}

async fn run_session_command(
    command: Commands,
    config: &FieldVaultConfig,
    session: &Session<JsonFileStore>,
    store: &JsonFileStore,
) -> Result<()> {
    match command {
        Commands::Init => cmd_init(config, session).await,
        Commands::Reset { yes } => cmd_reset(config, session, store, yes).await,
        Commands::Put { scope, table, row, field, value, searchable } => {
            unlock(config, session).await?;
            cmd_put(session, store, &scope, &table, &row, &field, &value, searchable).await
        }
        Commands::Get { scope, table, row, fields } => {
            unlock(config, session).await?;
            cmd_get(session, store, &scope, &table, &row, &fields).await
        }
        Commands::Find { scope, table, field, value } => {
            unlock(config, session).await?;
            cmd_find(session, store, &scope, &table, &field, &value).await
        }
        Commands::Index { scope, value } => {
            unlock(config, session).await?;
            println!("{}", session.compute_blind_index(&scope, &value).await?);
            Ok(())
        }
        Commands::Seal { .. } | Commands::Open { .. } | Commands::Config { .. } => {
            anyhow::bail!("command does not use a session")
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<FieldVaultConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        FieldVaultConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(FieldVaultConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Passphrase handling ───────────────────────────────────────────────────────

/// Passphrase from FIELDVAULT_PASSPHRASE, else an interactive prompt.
fn read_passphrase(prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt).context("reading passphrase")?;
    Ok(SecretString::from(value))
}

async fn unlock(config: &FieldVaultConfig, session: &Session<JsonFileStore>) -> Result<()> {
    let passphrase = read_passphrase("Passphrase: ")?;
    let policy = RetryPolicy::from_config(&config.unlock);
    session
        .auto_unlock(&passphrase, &policy)
        .await
        .with_context(|| format!("unlocking account '{}'", session.user_id()))
}

// ── `fieldvault init` ─────────────────────────────────────────────────────────

async fn cmd_init(config: &FieldVaultConfig, session: &Session<JsonFileStore>) -> Result<()> {
    let passphrase = read_passphrase("New passphrase: ")?;
    if std::env::var(PASSPHRASE_ENV).is_err() {
        let confirm = rpassword::prompt_password("Confirm passphrase: ")
            .context("reading passphrase")?;
        use secrecy::ExposeSecret;
        if confirm != passphrase.expose_secret() {
            anyhow::bail!("passphrases do not match");
        }
    }

    let params = KdfParams::from_config(&config.kdf);
    session
        .provision(&passphrase, &params)
        .await
        .with_context(|| format!("provisioning account '{}'", session.user_id()))?;
    session.lock();

    println!(
        "provisioned '{}' (argon2id m={} KiB, t={}, p={})",
        session.user_id(),
        params.memory_kib,
        params.time_cost,
        params.parallelism
    );
    Ok(())
}

// ── `fieldvault put` ──────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn cmd_put(
    session: &Session<JsonFileStore>,
    store: &JsonFileStore,
    scope: &str,
    table: &str,
    row: &str,
    field: &str,
    value: &str,
    searchable: bool,
) -> Result<()> {
    let stored = if searchable {
        session
            .encrypt_searchable_field(scope, table, row, field, value)
            .await?
    } else {
        session.encrypt_field(scope, table, row, field, value).await?
    };

    let names = FieldColumns::for_field(field);
    if stored.bi.is_none() {
        // An index left by an earlier searchable write still matches the old value
        store
            .clear_columns(session.user_id(), table, row, &[names.bi.clone()])
            .await
            .context("clearing blind index")?;
    }

    let mut columns = RowColumns::new();
    columns.insert(names.enc, stored.enc);
    columns.insert(names.iv, stored.iv);
    if let Some(bi) = stored.bi {
        columns.insert(names.bi, bi);
    }

    store
        .upsert_columns(session.user_id(), table, row, columns)
        .await
        .context("writing row")?;
    let kind = if searchable { " (searchable)" } else { "" };
    println!("{table}/{row}: stored {field}{kind}");
    Ok(())
}

// ── `fieldvault get` ──────────────────────────────────────────────────────────

async fn cmd_get(
    session: &Session<JsonFileStore>,
    store: &JsonFileStore,
    scope: &str,
    table: &str,
    row: &str,
    fields: &[String],
) -> Result<()> {
    let columns = store
        .load_row(session.user_id(), table, row)
        .await?
        .with_context(|| format!("row not found: {table}/{row}"))?;

    let names: Vec<&str> = if fields.is_empty() {
        stored_field_names(&columns)
    } else {
        fields.iter().map(String::as_str).collect()
    };

    let values = session
        .decrypt_fields(scope, table, row, &columns, &names)
        .await?;

    for (field, value) in &values {
        match value {
            FieldValue::Present(plaintext) => println!("{field}: {plaintext}"),
            FieldValue::Absent => println!("{field}: <absent>"),
            FieldValue::Failed(e) => println!("{field}: <error: {e}>"),
        }
    }
    Ok(())
}

/// Field names that have a ciphertext column on the row
fn stored_field_names(columns: &RowColumns) -> Vec<&str> {
    columns
        .keys()
        .filter_map(|name| name.strip_suffix(fv_core::types::ENC_SUFFIX))
        .collect()
}

// ── `fieldvault find` ─────────────────────────────────────────────────────────

async fn cmd_find(
    session: &Session<JsonFileStore>,
    store: &JsonFileStore,
    scope: &str,
    table: &str,
    field: &str,
    value: &str,
) -> Result<()> {
    let rows = matching_rows(session, store, scope, table, field, value).await?;
    if rows.is_empty() {
        tracing::info!(table, field, "no matching rows");
    }
    for row in rows {
        println!("{row}");
    }
    Ok(())
}

/// Rows whose blind index for `field` matches `value`, keeping only those
/// whose ciphertext still decrypts to a value with that index.
async fn matching_rows(
    session: &Session<JsonFileStore>,
    store: &JsonFileStore,
    scope: &str,
    table: &str,
    field: &str,
    value: &str,
) -> Result<Vec<String>> {
    let digest = session.compute_blind_index(scope, value).await?;
    let column = FieldColumns::for_field(field).bi;
    let candidates = store
        .find_rows(session.user_id(), table, &column, &digest)
        .await?;

    let mut rows = Vec::with_capacity(candidates.len());
    for row in candidates {
        let Some(columns) = store.load_row(session.user_id(), table, &row).await? else {
            continue;
        };
        let values = session
            .decrypt_fields(scope, table, &row, &columns, &[field])
            .await?;
        let confirmed = match values.get(field) {
            Some(FieldValue::Present(current)) => {
                session.blind_index_matches(scope, current, &digest).await?
            }
            _ => false,
        };
        if confirmed {
            rows.push(row);
        } else {
            tracing::warn!(table, row = %row, field, "stale blind index, skipping row");
        }
    }
    Ok(rows)
}

// ── `fieldvault reset` ────────────────────────────────────────────────────────

async fn cmd_reset(
    config: &FieldVaultConfig,
    session: &Session<JsonFileStore>,
    store: &JsonFileStore,
    confirmed: bool,
) -> Result<()> {
    let auth = ResetAuthorization::from_env(&config.reset);
    // Authorization is checked before the confirmation flag so a forbidden
    // environment always reports the real reason.
    auth.check()?;
    if !confirmed {
        anyhow::bail!(
            "reset destroys all encrypted data for '{}'; pass --yes to confirm",
            session.user_id()
        );
    }

    let report = session.force_reset(store, &auth).await?;
    println!(
        "reset '{}': {} rows, {} scope keys deleted; master key {}",
        report.user_id,
        report.rows_deleted,
        report.scope_keys_deleted,
        if report.master_key_cleared { "cleared" } else { "was not present" }
    );
    Ok(())
}

// ── `fieldvault seal` / `fieldvault open` ─────────────────────────────────────

fn server_cipher(config: &FieldVaultConfig) -> Result<ServerCipher> {
    let secret = std::env::var(&config.server.secret_env)
        .with_context(|| format!("{} environment variable not set", config.server.secret_env))?;
    Ok(ServerCipher::from_secret(
        &SecretString::from(secret),
        &config.server.context,
    )?)
}

fn cmd_seal(config: &FieldVaultConfig, aad: &str, plaintext: &str) -> Result<()> {
    let sealed = server_cipher(config)?.seal(plaintext.as_bytes(), aad.as_bytes())?;
    println!("{}", serde_json::to_string(&sealed).context("serializing sealed record")?);
    Ok(())
}

fn cmd_open(config: &FieldVaultConfig, aad: &str, record: &str) -> Result<()> {
    let sealed: SealedRecord = serde_json::from_str(record).context("parsing sealed record")?;
    let plaintext = server_cipher(config)?.open(&sealed, aad.as_bytes())?;
    let text = String::from_utf8(plaintext).context("opened record is not UTF-8")?;
    println!("{text}");
    Ok(())
}

// ── `fieldvault config show` ──────────────────────────────────────────────────

fn cmd_config_show(config: &FieldVaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
