use std::io::{self, BufRead, Write};

use leafdb::file::{BUFFER_POOL_SIZE, BufferPool, DiskManager};
use leafdb::index::{BPlusTree, IndexResult};

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./leafdb.db".to_string());

    let disk = match DiskManager::open(&path) {
        Ok(disk) => disk,
        Err(e) => {
            eprintln!("Failed to open database file {path}: {e}");
            std::process::exit(1);
        }
    };
    let pool = BufferPool::new(disk, BUFFER_POOL_SIZE);
    let mut tree = match BPlusTree::new(pool) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("Failed to load index: {e}");
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        match execute(&mut tree, line) {
            Ok(Some(output)) => println!("{output}"),
            Ok(None) => print_usage(),
            Err(e) => eprintln!("Error: {e}"),
        }

        stdout.flush().unwrap();
    }
}

/// Run one command line; `Ok(None)` means it did not parse
fn execute(tree: &mut BPlusTree, line: &str) -> IndexResult<Option<String>> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();

    let output = match command {
        "insert" => {
            let (Some(key), Some(value)) = (parse_key(parts.next()), parts.next()) else {
                return Ok(None);
            };
            tree.insert(key, value)?;
            "ok".to_string()
        }
        "search" => {
            let Some(key) = parse_key(parts.next()) else {
                return Ok(None);
            };
            match tree.search(key)? {
                Some(value) => value,
                None => "(not found)".to_string(),
            }
        }
        "remove" => {
            let Some(key) = parse_key(parts.next()) else {
                return Ok(None);
            };
            if tree.remove(key)? {
                "removed".to_string()
            } else {
                "(not found)".to_string()
            }
        }
        "scan" => {
            let (Some(start), Some(end)) = (parse_key(parts.next()), parse_key(parts.next()))
            else {
                return Ok(None);
            };
            let results = tree.scan(start, end)?;
            let mut out = format!("{} entries", results.len());
            for (key, value) in results {
                out.push_str(&format!("\n{key},{value}"));
            }
            out
        }
        _ => return Ok(None),
    };

    Ok(Some(output))
}

fn parse_key(token: Option<&str>) -> Option<i32> {
    token.and_then(|t| t.parse().ok())
}

fn print_usage() {
    eprintln!("commands: insert <key> <value> | search <key> | remove <key> | scan <lo> <hi> | exit");
}
