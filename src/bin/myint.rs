/*
 * myint.rs - A pipeline stage that interrupts itself
 *
 * usage: myint <n>
 * Sleeps for <n> seconds and sends SIGINT to itself, as a Ctrl-C at the
 * terminal would.
 */

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::env;
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

    thread::sleep(Duration::from_secs(secs));

    let pid = Pid::from_raw(process::id() as i32);

    if let Err(err) = signal::kill(pid, Signal::SIGINT) {
        eprintln!("kill (int) error: {}", err);
        process::exit(1);
    }

    // SIGINT is delivered before kill returns unless it is blocked or ignored.
    thread::sleep(Duration::from_secs(1));
    eprintln!("myint: SIGINT did not terminate the process");
    process::exit(1);
}
