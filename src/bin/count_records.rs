//! Print the record count of a record allocator inside a database file.
//!
//! ```bash
//! count_records <file> <record_size> [offset]
//! ```

use std::env;
use std::process::exit;

use coindb::table::RecordAllocator;
use coindb::MemoryMap;
use eyre::{Result, WrapErr};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 && args.len() != 4 {
        eprintln!("usage: count_records <file> <record_size> [offset]");
        exit(1);
    }

    if let Err(error) = run(&args) {
        eprintln!("count_records: {:#}", error);
        exit(-1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let record_size: usize = args[2]
        .parse()
        .wrap_err_with(|| format!("invalid record size '{}'", args[2]))?;
    let offset: u64 = match args.get(3) {
        Some(raw) => raw
            .parse()
            .wrap_err_with(|| format!("invalid offset '{}'", raw))?,
        None => 0,
    };

    let file = MemoryMap::open(&args[1])?;
    let allocator = RecordAllocator::start(&file, offset, record_size)?;
    println!("{}", allocator.count());

    Ok(())
}
