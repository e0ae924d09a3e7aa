extern crate env_logger;
#[macro_use]
extern crate log;
extern crate perf_sampler;

use std::env;
use std::process;

use perf_sampler::AgentConfig;

fn main() {
    env_logger::Builder::from_default_env().init();

    let config = match AgentConfig::from_args(env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = perf_sampler::run(config) {
        error!("fatal: {}", e);
        process::exit(1);
    }
}
