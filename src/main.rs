use clap::Parser;
use connect_proxy::config::Args;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match args.validate() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = connect_proxy::run(config) {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
