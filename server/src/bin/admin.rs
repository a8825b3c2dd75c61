//! Offline administration: inspection, quota edits, orphan collection and
//! master-key format conversion. Runs against the data directory with the
//! server stopped; diagnostics go to stderr and any failure exits
//! non-zero.

use clap::{Parser, Subcommand};
use krin::config::resolve_passphrase;
use krin::crypto::{Algorithm, MasterKey};
use krin::db::Db;
use krin::error::ServerResult;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "krin-admin", version)]
struct Args {
    /// Directory holding the master key, metadata and blobs.
    #[arg(long, env = "KRIN_DATA_DIR")]
    data_dir: PathBuf,

    #[arg(long, env = "KRIN_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[arg(long, env = "KRIN_PASSPHRASE_FILE", conflicts_with = "passphrase")]
    passphrase_file: Option<PathBuf>,

    #[arg(
        long,
        env = "KRIN_PASSPHRASE_CMD",
        conflicts_with_all = ["passphrase", "passphrase_file"]
    )]
    passphrase_cmd: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all accounts.
    Users,
    /// Print one user record as JSON.
    ShowUser { id: u64 },
    /// Decrypt an arbitrary stored object to stdout.
    Cat { key: String },
    /// Set or clear (no value) a user's storage quota in bytes.
    EditQuota {
        id: u64,
        bytes: Option<i64>,
    },
    /// Change a user's email address.
    RenameUser { id: u64, email: String },
    /// List blobs no fileset references; `--delete` removes them.
    FindOrphans {
        #[arg(long)]
        delete: bool,
    },
    /// Advance a user's deletion-log floor, pruning older tombstones.
    PruneDeletes { id: u64, before: i64 },
    /// Decrypt a blob's server-side envelope into a file.
    DecryptBlob { name: String, out: PathBuf },
    /// Re-encrypt the whole tree under the other AEAD algorithm.
    ConvertMasterKey {
        #[arg(value_parser = ["aes", "chacha"])]
        algorithm: String,
    },
}

fn run(args: Args) -> ServerResult<()> {
    let passphrase = resolve_passphrase(
        args.passphrase.as_deref(),
        args.passphrase_file.as_deref(),
        args.passphrase_cmd.as_deref(),
    )?;

    if let Cmd::ConvertMasterKey { ref algorithm } = args.cmd {
        let algorithm = match algorithm.as_str() {
            "aes" => Algorithm::Aes256Gcm,
            _ => Algorithm::Chacha20Poly1305,
        };
        return krin::convert::convert_master_key(&args.data_dir, &passphrase, algorithm);
    }

    let master = MasterKey::open(&args.data_dir.join(krin::MASTER_KEY_FILE), &passphrase)?;
    let db = Db::open(&args.data_dir, Arc::new(master), None)?;

    match args.cmd {
        Cmd::ConvertMasterKey { .. } => unreachable!("handled above"),
        Cmd::Users => {
            for id in db.user_ids()? {
                if let Some(user) = db.user_by_id(id)? {
                    println!(
                        "{}\t{}\tadmin={}\tapproved={}\tdisabled={}\tquota={:?}\tused={}",
                        id,
                        user.email,
                        user.admin,
                        !user.need_approval,
                        user.login_disabled,
                        db.quota(id)?,
                        db.space_used(id)?,
                    );
                }
            }
        }
        Cmd::ShowUser { id } => {
            let user = db.user_by_id(id)?.ok_or(krin::error::ServerError::NotFound)?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Cmd::Cat { key } => {
            let path = db.store().object_path(&key);
            let context = db.store().context_for_physical(&path)?;
            let file = std::fs::File::open(&path)?;
            let mut reader = krin::crypto::StreamReader::new(db.master(), context, file)?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            std::io::stdout().write_all(&buf)?;
        }
        Cmd::EditQuota { id, bytes } => {
            db.edit_quota(id, bytes)?;
            eprintln!("quota for {} set to {:?}", id, bytes);
        }
        Cmd::RenameUser { id, email } => {
            db.rename_user(id, &email)?;
            eprintln!("user {} renamed to {}", id, email);
        }
        Cmd::FindOrphans { delete } => {
            let orphans = db.find_orphan_blobs()?;
            for path in &orphans {
                println!("{}", path.display());
                if delete {
                    std::fs::remove_file(path)?;
                }
            }
            eprintln!(
                "{} orphan blob(s){}",
                orphans.len(),
                if delete { " removed" } else { "" }
            );
        }
        Cmd::PruneDeletes { id, before } => {
            db.prune_deletes(id, before)?;
            eprintln!("deletion log floor for {} advanced to {}", id, before);
        }
        Cmd::DecryptBlob { name, out } => {
            let mut reader = db.store().blob_reader(&name)?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            std::fs::write(&out, &buf)?;
            eprintln!("{} bytes written to {}", buf.len(), out.display());
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
