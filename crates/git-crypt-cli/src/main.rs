//! git-crypt: transparent file encryption for git working trees
//!
//! Repository commands:
//!   init                    - generate a key and install the filter drivers
//!   unlock KEYFILE...       - install keys and decrypt the working tree
//!   lock [-k NAME]          - remove a key and re-encrypt the working tree
//!   status [-e] [-f]        - show which tracked paths are encrypted
//!   export-key KEYFILE      - copy an installed key out of the repository
//!   keygen KEYFILE          - generate a standalone key file
//!
//! Filter commands, invoked by git rather than by people:
//!   clean, smudge, diff
//!
//! Exit codes: 0 on success, 1 on an operation error, 2 on a usage error.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use git_crypt_core::GitCryptError;
use git_crypt_crypto::envelope::{self, Header};
use git_crypt_crypto::keyfile::{validate_key_name, KeyFile};
use git_crypt_vcs::{attributes, checkout, config as driver_config, Repository};

// ── CLI structure ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "git-crypt",
    version,
    about = "Transparent file encryption in git",
    long_about = "git-crypt: store selected tracked files encrypted in the repository \
                  while keeping them plaintext in the working tree"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a key for this repository and install the filter drivers
    Init {
        /// Key name (omit for the default key)
        #[arg(short = 'k', long = "key-name")]
        key_name: Option<String>,
    },

    /// Generate a standalone key file
    Keygen {
        /// Where to write the new key file
        keyfile: PathBuf,
    },

    /// Copy an installed key to a file for sharing
    #[command(name = "export-key")]
    ExportKey {
        /// Key name (omit for the default key)
        #[arg(short = 'k', long = "key-name")]
        key_name: Option<String>,
        /// Where to write the exported key
        keyfile: PathBuf,
    },

    /// Install keys from files and decrypt the working tree
    Unlock {
        /// Key files previously written by keygen or export-key
        keyfiles: Vec<PathBuf>,
    },

    /// Remove an installed key and re-encrypt the working tree
    Lock {
        /// Key name (omit for the default key)
        #[arg(short = 'k', long = "key-name")]
        key_name: Option<String>,
    },

    /// Show the encryption state of every tracked path
    Status {
        /// Only list paths bound to a key
        #[arg(short = 'e', long = "encrypted-only")]
        encrypted_only: bool,
        /// Re-stage bound paths whose staged blob is not encrypted
        #[arg(short = 'f', long = "fix")]
        fix: bool,
    },

    /// Encrypt stdin to stdout (git clean filter)
    #[command(hide = true)]
    Clean {
        #[arg(long = "key-name")]
        key_name: Option<String>,
    },

    /// Decrypt stdin to stdout (git smudge filter)
    #[command(hide = true)]
    Smudge {
        #[arg(long = "key-name")]
        key_name: Option<String>,
    },

    /// Decrypt a file to stdout (git diff textconv)
    #[command(hide = true)]
    Diff {
        #[arg(long = "key-name")]
        key_name: Option<String>,
        /// File to show
        path: PathBuf,
    },

    /// Print the version
    Version,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    // Usage errors exit 2 through clap before we get here.
    let cli = Cli::parse();
    init_logging();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("git-crypt: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("GIT_CRYPT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { key_name } => cmd_init(key_name.as_deref()),
        Commands::Keygen { keyfile } => cmd_keygen(&keyfile),
        Commands::ExportKey { key_name, keyfile } => cmd_export_key(key_name.as_deref(), &keyfile),
        Commands::Unlock { keyfiles } => cmd_unlock(&keyfiles),
        Commands::Lock { key_name } => cmd_lock(key_name.as_deref()),
        Commands::Status {
            encrypted_only,
            fix,
        } => cmd_status(encrypted_only, fix),
        Commands::Clean { key_name } => cmd_clean(key_name.as_deref()),
        Commands::Smudge { key_name } => cmd_smudge(key_name.as_deref()),
        Commands::Diff { key_name, path } => cmd_diff(key_name.as_deref(), &path),
        Commands::Version => {
            println!("git-crypt {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ── Key store on disk ─────────────────────────────────────────────────────────

fn display_key_name(key_name: Option<&str>) -> String {
    key_name.unwrap_or("default").to_string()
}

/// Load the installed key file for a name; a missing file means the
/// repository is locked for that key.
fn load_key(repo: &Repository, key_name: Option<&str>) -> Result<KeyFile> {
    let path = repo.key_path(key_name);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(GitCryptError::KeyUnavailable.into())
        }
        Err(e) => return Err(GitCryptError::io("reading", &path, e).into()),
    };
    KeyFile::parse(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Write key material into the repository's private key store, creating the
/// 0o700 directories on the way.
fn install_key_bytes(repo: &Repository, key_name: Option<&str>, data: &[u8]) -> Result<()> {
    let path = repo.key_path(key_name);
    let keys_dir = repo.keys_dir();
    fs::create_dir_all(&keys_dir).map_err(|e| GitCryptError::io("creating", &keys_dir, e))?;
    restrict_dir(&repo.git_dir().join("git-crypt"))?;
    restrict_dir(&keys_dir)?;
    write_private_file(&path, data, true)
}

/// Write a file readable only by its owner. `overwrite = false` makes an
/// existing file an error instead of clobbering it.
fn write_private_file(path: &Path, data: &[u8], overwrite: bool) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| GitCryptError::io("writing", path, e))?;
    file.write_all(data)
        .map_err(|e| GitCryptError::io("writing", path, e))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| GitCryptError::io("restricting", path, e).into())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<()> {
    Ok(())
}

fn executable_path() -> Result<PathBuf> {
    std::env::current_exe().map_err(|e| {
        GitCryptError::io_stream("resolving", "git-crypt executable path", e).into()
    })
}

// ── `git-crypt init` ──────────────────────────────────────────────────────────

fn cmd_init(key_name: Option<&str>) -> Result<()> {
    if let Some(name) = key_name {
        validate_key_name(name)?;
    }
    let repo = Repository::discover()?;
    repo.require_clean()?;

    if repo.key_path(key_name).exists() {
        return Err(GitCryptError::AlreadyInitialized(display_key_name(key_name)).into());
    }

    let mut keys = match key_name {
        Some(name) => KeyFile::with_name(name)?,
        None => KeyFile::new(),
    };
    keys.generate();
    install_key_bytes(&repo, key_name, &keys.serialize())?;
    driver_config::install(&repo, key_name, &executable_path()?)?;

    info!(key = %display_key_name(key_name), "repository initialized");
    println!(
        "Generated key '{}' and installed the git-crypt filters.",
        display_key_name(key_name)
    );
    println!("Mark files for encryption in .gitattributes, e.g.:");
    println!(
        "    secrets/** filter={name} diff={name}",
        name = driver_config::filter_name(key_name)
    );
    Ok(())
}

// ── `git-crypt keygen` ────────────────────────────────────────────────────────

fn cmd_keygen(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists; refusing to overwrite it", path.display());
    }
    let mut keys = KeyFile::new();
    keys.generate();
    write_private_file(path, &keys.serialize(), false)?;
    println!("Generated key file {}", path.display());
    Ok(())
}

// ── `git-crypt export-key` ────────────────────────────────────────────────────

fn cmd_export_key(key_name: Option<&str>, dest: &Path) -> Result<()> {
    let repo = Repository::discover()?;
    repo.require_clean()?;

    let src = repo.key_path(key_name);
    let data = match fs::read(&src) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(GitCryptError::NotInitialized(display_key_name(key_name)).into())
        }
        Err(e) => return Err(GitCryptError::io("reading", &src, e).into()),
    };
    write_private_file(dest, &data, true)?;
    println!(
        "Exported key '{}' to {}",
        display_key_name(key_name),
        dest.display()
    );
    Ok(())
}

// ── `git-crypt unlock` ────────────────────────────────────────────────────────

fn cmd_unlock(keyfiles: &[PathBuf]) -> Result<()> {
    let repo = Repository::discover()?;
    repo.require_clean()?;

    if keyfiles.is_empty() {
        anyhow::bail!(
            "no key files given; asymmetric (GPG) unlocking is not supported by this build"
        );
    }

    let exe = executable_path()?;
    let mut to_refresh = Vec::new();
    for path in keyfiles {
        let data = fs::read(path).map_err(|e| GitCryptError::io("reading", path, e))?;
        let keys = KeyFile::parse(&data).with_context(|| format!("parsing {}", path.display()))?;
        let name = keys.name().map(str::to_string);
        let name = name.as_deref();

        install_key_bytes(&repo, name, &keys.serialize())?;
        driver_config::install(&repo, name, &exe)?;

        let mut paths = attributes::encrypted_paths(&repo, name)?;
        info!(
            key = %display_key_name(name),
            files = paths.len(),
            "installed key"
        );
        to_refresh.append(&mut paths);
    }

    checkout::refresh_paths(&repo, &to_refresh)?;
    println!("Unlocked {} file(s).", to_refresh.len());
    Ok(())
}

// ── `git-crypt lock` ──────────────────────────────────────────────────────────

fn cmd_lock(key_name: Option<&str>) -> Result<()> {
    let repo = Repository::discover()?;
    repo.require_clean()?;

    let key_path = repo.key_path(key_name);
    if !key_path.exists() {
        return Err(GitCryptError::NotInitialized(display_key_name(key_name)).into());
    }

    // Enumerate while the attribute configuration is still in place.
    let paths = attributes::encrypted_paths(&repo, key_name)?;

    fs::remove_file(&key_path).map_err(|e| GitCryptError::io("removing", &key_path, e))?;
    driver_config::uninstall(&repo, key_name)?;
    checkout::refresh_paths(&repo, &paths)?;

    println!(
        "Locked '{}'; {} file(s) in the working tree are encrypted again.",
        display_key_name(key_name),
        paths.len()
    );
    Ok(())
}

// ── `git-crypt status` ────────────────────────────────────────────────────────

fn cmd_status(encrypted_only: bool, fix: bool) -> Result<()> {
    let repo = Repository::discover()?;
    repo.require_clean()?;

    let entries = attributes::list_index(&repo)?;
    let paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
    let filter_attrs = attributes::filter_attrs(&repo, &paths)?;
    let diff_attrs = attributes::attr_values(&repo, &paths, "diff")?;

    // Bound paths whose staged blob is not an envelope, with their key name.
    let mut mis_staged: Vec<(String, Option<String>)> = Vec::new();

    for ((entry, attr), diff_attr) in entries.iter().zip(&filter_attrs).zip(&diff_attrs) {
        let binding = attr.as_deref().and_then(attributes::key_name_of);
        match binding {
            Some(key_name) => {
                let label = match key_name {
                    None => String::new(),
                    Some(name) => format!(" [key: {name}]"),
                };

                let mut warnings = Vec::new();
                if !staged_blob_is_encrypted(&repo, &entry.oid)? {
                    warnings.push("staged version is NOT encrypted".to_string());
                    mis_staged.push((entry.path.clone(), key_name.map(str::to_string)));
                }
                let driver = driver_config::filter_name(key_name);
                if diff_attr.as_deref() != Some(driver.as_str()) {
                    // Without the diff driver, `git diff` shows raw ciphertext.
                    warnings.push(format!("diff={driver} attribute not set"));
                }

                if warnings.is_empty() {
                    println!("    encrypted: {}{}", entry.path, label);
                } else {
                    println!(
                        "    encrypted: {}{} *** WARNING: {} ***",
                        entry.path,
                        label,
                        warnings.join("; ")
                    );
                }
            }
            None if encrypted_only => {}
            None => println!("not encrypted: {}", entry.path),
        }
    }

    if fix {
        for (path, key_name) in &mis_staged {
            // Re-staging routes the file through the clean filter, which
            // needs the bound key to be installed.
            if !repo.key_path(key_name.as_deref()).exists() {
                return Err(GitCryptError::KeyUnavailable.into());
            }
            checkout::touch(&repo.worktree().join(path))?;
            repo.git().args(["add", "--"]).arg(path.as_str()).run()?;
            println!("staged encrypted version of {path}");
        }
    } else if !mis_staged.is_empty() {
        println!("Run 'git-crypt status -f' to stage encrypted versions of the files above.");
    }
    Ok(())
}

fn staged_blob_is_encrypted(repo: &Repository, oid: &str) -> Result<bool> {
    let blob = repo.git().args(["cat-file", "blob", oid]).output()?;
    Ok(blob.starts_with(envelope::MAGIC))
}

// ── Filter driver: `clean`, `smudge`, `diff` ──────────────────────────────────

fn cmd_clean(key_name: Option<&str>) -> Result<()> {
    let repo = Repository::discover()?;
    let keys = load_key(&repo, key_name)?;
    let entry = keys.latest()?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();
    envelope::encrypt(&mut input, entry, &mut output)?;
    output
        .flush()
        .map_err(|e| GitCryptError::io_stream("flushing", "standard output", e))?;
    Ok(())
}

fn cmd_smudge(key_name: Option<&str>) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    match envelope::read_header(&mut input)? {
        Header::Encrypted { nonce } => {
            // Only an actual envelope needs the key store.
            let repo = Repository::discover()?;
            let keys = load_key(&repo, key_name)?;
            envelope::decrypt_body(&nonce, &mut input, &keys, &mut output)?;
        }
        Header::Plaintext { prefix } => {
            envelope::passthrough(&prefix, &mut input, &mut output)?;
        }
    }
    output
        .flush()
        .map_err(|e| GitCryptError::io_stream("flushing", "standard output", e))?;
    Ok(())
}

fn cmd_diff(key_name: Option<&str>, path: &Path) -> Result<()> {
    let mut file = fs::File::open(path).map_err(|e| GitCryptError::io("opening", path, e))?;
    let stdout = io::stdout();
    let mut output = stdout.lock();

    match envelope::read_header(&mut file)? {
        Header::Encrypted { nonce } => {
            // Best-effort: without a usable key, show the raw bytes.
            let keys = Repository::discover()
                .ok()
                .and_then(|repo| load_key(&repo, key_name).ok());
            match keys {
                Some(keys) => envelope::decrypt_body(&nonce, &mut file, &keys, &mut output)?,
                None => {
                    let mut prefix = Vec::with_capacity(envelope::HEADER_LEN);
                    prefix.extend_from_slice(envelope::MAGIC);
                    prefix.extend_from_slice(&nonce);
                    envelope::passthrough(&prefix, &mut file, &mut output)?;
                }
            }
        }
        Header::Plaintext { prefix } => {
            envelope::passthrough(&prefix, &mut file, &mut output)?;
        }
    }
    output
        .flush()
        .map_err(|e| GitCryptError::io_stream("flushing", "standard output", e))?;
    Ok(())
}
