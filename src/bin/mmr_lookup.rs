//! Dump every row stored under a key in a record multimap.
//!
//! ```bash
//! mmr_lookup <hex_key> <value_size> <map_file> <rows_file>
//! ```
//!
//! Rows print newest first, one hex line each, matching the multimap's
//! chain order.

use std::env;
use std::process::exit;

use coindb::table::RecordMultimap;
use coindb::MemoryMap;
use eyre::{Result, WrapErr};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        eprintln!("usage: mmr_lookup <hex_key> <value_size> <map_file> <rows_file>");
        exit(1);
    }

    if let Err(error) = run(&args) {
        eprintln!("mmr_lookup: {:#}", error);
        exit(-1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let key = hex::decode(&args[1]).wrap_err_with(|| format!("invalid hex key '{}'", args[1]))?;
    let value_size: usize = args[2]
        .parse()
        .wrap_err_with(|| format!("invalid value size '{}'", args[2]))?;

    let lookup_file = MemoryMap::open(&args[3])?;
    let rows_file = MemoryMap::open(&args[4])?;
    let multimap = RecordMultimap::start(&lookup_file, &rows_file, key.len(), value_size)?;

    for payload in multimap.iter(&lookup_file, &rows_file, &key)? {
        println!("{}", hex::encode(payload?));
    }

    Ok(())
}
