mod config;
mod miner;

use anyhow::Result;

use config::Config;
use miner::Shutdown;

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::parse()?;

    let debug = match &cfg {
        Config::Search(search) => search.engines.debug,
        Config::Bench(bench) => bench.engines.debug,
        Config::Info => false,
    };
    miner::ui::install_logger(debug);

    match cfg {
        Config::Info => {
            miner::print_info();
            Ok(())
        }
        Config::Search(search) => miner::run_search(&search, &Shutdown::install()?),
        Config::Bench(bench) => miner::run_benchmark(&bench, &Shutdown::install()?),
    }
}
