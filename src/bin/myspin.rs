/*
 * myspin.rs - A slow pipeline stage for testing the shell
 *
 * usage: myspin <n>
 * Sleeps for <n> seconds in 1-second chunks, then copies stdin to stdout.
 */

use std::env;
use std::io;
use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <n>", args[0]);
        process::exit(2);
    }

    let secs = args[1].parse::<u64>().unwrap_or_else(|_| {
        eprintln!("Error: <n> must be a non-negative integer");
        process::exit(2);
    });

    for _ in 0..secs {
        thread::sleep(Duration::from_secs(1));
    }

    // Only returns once every writer of our stdin has closed it.
    if let Err(err) = io::copy(&mut io::stdin().lock(), &mut io::stdout().lock()) {
        eprintln!("copy error: {}", err);
        process::exit(1);
    }

    process::exit(0);
}
