use std::sync::Arc;
use std::{env, process};

use egressproxy::config::Config;
use egressproxy::establish::{Establisher, SystemResolver};
use egressproxy::proxy::{run_http_proxy, run_socks5_proxy};

use log::{error, info};
use tokio::runtime::Runtime;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} config.toml", args[0]);
        return;
    }

    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let code = match run(&args[1]) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    };

    log::logger().flush();
    process::exit(code);
}

fn run(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(path)?;
    let establisher = Establisher::new(
        config.balancer()?,
        Arc::new(SystemResolver),
        config.connect_timeout(),
    );
    info!("Egress {:?}", config.egress);

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let socks5 = async {
            match &config.listen.socks5 {
                Some(listen) => run_socks5_proxy(listen, establisher.clone()).await,
                None => Ok(()),
            }
        };
        let http = async {
            match &config.listen.http {
                Some(listen) => run_http_proxy(listen, establisher.clone()).await,
                None => Ok(()),
            }
        };

        tokio::select! {
            r = async { futures::try_join!(socks5, http) } => r.map(|_| ()),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        }
    })?;

    Ok(())
}
