//! Print the value of a slab hash table entry.
//!
//! ```bash
//! read_htdb_slab_value <file> <hex_key> <value_size> [offset]
//! ```

use std::env;
use std::process::exit;

use coindb::table::SlabHashTable;
use coindb::MemoryMap;
use eyre::{bail, Result, WrapErr};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 4 && args.len() != 5 {
        eprintln!("usage: read_htdb_slab_value <file> <hex_key> <value_size> [offset]");
        exit(1);
    }

    if let Err(error) = run(&args) {
        eprintln!("read_htdb_slab_value: {:#}", error);
        exit(-1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let key = hex::decode(&args[2]).wrap_err_with(|| format!("invalid hex key '{}'", args[2]))?;
    let value_size: usize = args[3]
        .parse()
        .wrap_err_with(|| format!("invalid value size '{}'", args[3]))?;
    let offset: u64 = match args.get(4) {
        Some(raw) => raw
            .parse()
            .wrap_err_with(|| format!("invalid offset '{}'", raw))?,
        None => 0,
    };

    let file = MemoryMap::open(&args[1])?;
    let table = SlabHashTable::start(&file, offset, key.len())?;

    let Some(position) = table.get(&file, &key)? else {
        bail!("key not found");
    };
    println!("{}", hex::encode(table.value(&file, position, value_size)?));

    Ok(())
}
