//! Create a new blockchain database and push the genesis block.
//!
//! ```bash
//! initchain <directory>
//! ```
//!
//! Exit codes: 0 on success, 1 when no directory is given, -1 on
//! filesystem errors.

use std::env;
use std::path::Path;
use std::process::exit;

use bitcoin::constants::genesis_block;
use bitcoin::Network;
use coindb::{ActiveHeights, Database};
use eyre::{bail, Result, WrapErr};

fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("initchain: no directory specified");
        exit(1);
    }

    if let Err(error) = run(Path::new(&args[1])) {
        eprintln!("initchain: {:#}", error);
        exit(-1);
    }
}

fn run(prefix: &Path) -> Result<()> {
    if prefix.exists() {
        bail!("directory '{}' already exists", prefix.display());
    }
    std::fs::create_dir_all(prefix)
        .wrap_err_with(|| format!("failed to create directory '{}'", prefix.display()))?;

    Database::initialize(prefix)?;

    let mut database = Database::open(prefix, ActiveHeights::default())?;
    database.push(&genesis_block(Network::Bitcoin))?;

    Ok(())
}
