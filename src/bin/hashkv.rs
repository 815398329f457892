//! hashkv command line tool
//!
//! Runs one database operation per invocation.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use hashkv::{
    Capabilities, Config, Database, HashKvError, ImportPolicy, OpenFlags, RecoveryOptions,
};
use tracing_subscriber::{fmt, EnvFilter};

/// hashkv
#[derive(Parser, Debug)]
#[command(name = "hashkv")]
#[command(about = "Embedded single-file hashed key-value database")]
#[command(version)]
struct Args {
    /// Database file
    #[arg(short, long, default_value = "hashkv.db")]
    database: PathBuf,

    /// Open mode: r, w, c or n, plus L (no lock), M (no mmap), S (sync).
    /// Defaults to r for queries, w for updates and c for loads.
    #[arg(short, long)]
    mode: Option<String>,

    /// Block size for newly created databases
    #[arg(short, long, default_value = "4096")]
    block_size: u32,

    /// Wait for the file lock instead of failing
    #[arg(long)]
    wait_lock: bool,

    /// Keys and values are base64 on the command line and in output,
    /// for binary data
    #[arg(long)]
    base64: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value of a key
    Fetch { key: String },

    /// Store a new key (fails if it exists)
    Insert { key: String, value: String },

    /// Store a key, overwriting any existing value
    Replace { key: String, value: String },

    /// Delete a key
    Delete { key: String },

    /// Exit 0 if the key exists, 1 otherwise
    Exists { key: String },

    /// Print every key
    Keys,

    /// Print every key and value
    List,

    /// Print the number of records
    Count,

    /// Flush everything to disk
    Sync,

    /// Rewrite the file compactly
    Reorganize,

    /// Write all records to a binary export file
    Export { file: PathBuf },

    /// Read records from a binary export file
    Import {
        file: PathBuf,
        /// Overwrite existing keys
        #[arg(long)]
        replace: bool,
    },

    /// Write all records to an ASCII dump file
    Dump { file: PathBuf },

    /// Read records from an ASCII dump file
    Load {
        file: PathBuf,
        /// Overwrite existing keys
        #[arg(long)]
        replace: bool,
    },

    /// Copy permissions, times and owner from another database
    Copymeta { source: PathBuf },

    /// Check the file structure
    Check,

    /// Rebuild the database from the records in the file
    Recover {
        /// Keep the damaged file as <name>.~N~
        #[arg(long)]
        backup: bool,
        /// Give up after this many damaged frames
        #[arg(long)]
        max_failures: Option<u64>,
        /// Rebuild even if the file checks out healthy
        #[arg(long)]
        force: bool,
    },

    /// Print directory and bucket statistics
    Stats,

    /// Print the features of this build
    Capabilities,
}

impl Commands {
    fn default_mode(&self) -> &'static str {
        match self {
            Commands::Fetch { .. }
            | Commands::Exists { .. }
            | Commands::Keys
            | Commands::List
            | Commands::Count
            | Commands::Export { .. }
            | Commands::Dump { .. }
            | Commands::Check
            | Commands::Stats
            | Commands::Capabilities => "r",
            Commands::Import { .. } | Commands::Load { .. } => "c",
            _ => "w",
        }
    }
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,hashkv=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Commands::Capabilities = args.command {
        for name in Capabilities::get().names() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    let mode = args.mode.as_deref().unwrap_or(args.command.default_mode());
    let flags = match OpenFlags::parse(mode) {
        Ok(flags) => flags,
        Err(e) => {
            eprintln!("hashkv: {}", e.diagnostic());
            return ExitCode::from(2);
        }
    };

    let config = Config::builder()
        .block_size(args.block_size)
        .blocking_lock(args.wait_lock)
        .build();

    let db = match Database::open_with(&args.database, flags, config) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("hashkv: {}: {}", args.database.display(), e.diagnostic());
            return ExitCode::FAILURE;
        }
    };

    let encoding = if args.base64 {
        Encoding::Base64
    } else {
        Encoding::Text
    };

    let code = match run(&db, &args.command, encoding) {
        Ok(code) => code,
        Err(e) => {
            let message = db.last_error().unwrap_or_else(|| e.diagnostic());
            eprintln!("hashkv: {}", message);
            ExitCode::FAILURE
        }
    };

    if let Err(e) = db.close() {
        eprintln!("hashkv: close: {}", e.diagnostic());
        return ExitCode::FAILURE;
    }
    code
}

/// How keys and values are written on the command line and printed
#[derive(Debug, Clone, Copy)]
enum Encoding {
    Text,
    Base64,
}

impl Encoding {
    fn decode(self, arg: &str) -> hashkv::Result<Vec<u8>> {
        match self {
            Encoding::Text => Ok(arg.as_bytes().to_vec()),
            Encoding::Base64 => STANDARD.decode(arg).map_err(|e| {
                HashKvError::InvalidArgument(format!("{:?} is not valid base64: {}", arg, e))
            }),
        }
    }

    fn write(self, out: &mut impl Write, datum: &[u8]) -> std::io::Result<()> {
        match self {
            Encoding::Text => out.write_all(datum),
            Encoding::Base64 => out.write_all(STANDARD.encode(datum).as_bytes()),
        }
    }
}

fn run(db: &Database, command: &Commands, encoding: Encoding) -> hashkv::Result<ExitCode> {
    let mut out = std::io::stdout().lock();

    match command {
        Commands::Fetch { key } => {
            let value = db.fetch(&encoding.decode(key)?)?;
            encoding.write(&mut out, &value)?;
            out.write_all(b"\n")?;
        }
        Commands::Insert { key, value } => {
            db.insert(&encoding.decode(key)?, &encoding.decode(value)?)?;
        }
        Commands::Replace { key, value } => {
            db.replace(&encoding.decode(key)?, &encoding.decode(value)?)?;
        }
        Commands::Delete { key } => db.delete(&encoding.decode(key)?)?,
        Commands::Exists { key } => {
            if !db.exists(&encoding.decode(key)?)? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Keys => {
            for key in db.keys() {
                encoding.write(&mut out, &key?)?;
                out.write_all(b"\n")?;
            }
        }
        Commands::List => {
            for record in db.iter() {
                let (key, value) = record?;
                encoding.write(&mut out, &key)?;
                out.write_all(b"\t")?;
                encoding.write(&mut out, &value)?;
                out.write_all(b"\n")?;
            }
        }
        Commands::Count => writeln!(out, "{}", db.count()?)?,
        Commands::Sync => db.sync()?,
        Commands::Reorganize => db.reorganize()?,
        Commands::Export { file } => writeln!(out, "{} records exported", db.export(file)?)?,
        Commands::Import { file, replace } => {
            let count = db.import(file, policy(*replace))?;
            writeln!(out, "{} records imported", count)?;
        }
        Commands::Dump { file } => writeln!(out, "{} records dumped", db.dump(file)?)?,
        Commands::Load { file, replace } => {
            let count = db.load(file, policy(*replace))?;
            writeln!(out, "{} records loaded", count)?;
        }
        Commands::Copymeta { source } => {
            let source = Database::open(source, "rL")?;
            db.copy_metadata(&source)?;
        }
        Commands::Check => {
            if db.needs_recovery() {
                writeln!(out, "needs recovery")?;
                return Ok(ExitCode::FAILURE);
            }
            writeln!(out, "ok")?;
        }
        Commands::Recover {
            backup,
            max_failures,
            force,
        } => {
            let options = RecoveryOptions {
                backup: *backup,
                max_failures: *max_failures,
                force: *force,
            };
            let report = db.recover(options)?;
            writeln!(
                out,
                "recovered {} records, discarded {} frames, {} duplicates, {} uncommitted",
                report.recovered, report.discarded, report.duplicates, report.uncommitted
            )?;
            if let Some(path) = report.backup_path {
                writeln!(out, "original kept as {}", path.display())?;
            }
        }
        Commands::Stats => {
            let stats = db.bucket_stats()?;
            writeln!(out, "directory bits:   {}", stats.directory_bits)?;
            writeln!(out, "directory slots:  {}", stats.directory_slots)?;
            writeln!(out, "buckets:          {}", stats.buckets)?;
            writeln!(out, "records:          {}", stats.entries)?;
            writeln!(out, "bucket capacity:  {}", stats.bucket_capacity)?;
            writeln!(out, "block size:       {}", stats.block_size)?;
            writeln!(out, "free regions:     {}", stats.free_regions)?;
            writeln!(out, "free bytes:       {}", stats.free_bytes)?;
            writeln!(out, "allocated bytes:  {}", stats.allocated_bytes)?;
            writeln!(out, "file size:        {}", stats.file_size)?;
        }
        Commands::Capabilities => {}
    }

    Ok(ExitCode::SUCCESS)
}

fn policy(replace: bool) -> ImportPolicy {
    if replace {
        ImportPolicy::Replace
    } else {
        ImportPolicy::Insert
    }
}
