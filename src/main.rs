#[macro_use]
extern crate log;

mod shell;

use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    let config: shell::config::Config = argh::from_env();
    let mut s = shell::Shell::new(config);
    let status = s.run_interactive();
    process::exit(status);
}
