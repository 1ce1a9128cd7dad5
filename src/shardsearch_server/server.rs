use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use itertools::Itertools;
use shardsearch::auth::TokenAuthorizer;
use shardsearch::config::ProxyConfig;
use shardsearch::partition::compute_partitions;
use shardsearch::proxy::Proxy;
use shardsearch::upstream::HttpBackend;

use crate::http_server::http_server;

fn ctrl_channel() -> Result<Receiver<()>, ctrlc::Error> {
    let (sender, receiver) = bounded(20);
    ctrlc::set_handler(move || {
        let _ = sender.send(());
    })?;

    Ok(receiver)
}

fn commandline(sender: Sender<String>) {
    loop {
        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) => break,
            Ok(_n) => {
                let input_string = input.trim().to_owned();
                let _ = sender.send(input_string.clone());
                if input_string.to_lowercase() == "quit" {
                    break;
                }
            }
            Err(error) => tracing::error!("console: {error}"),
        }
    }
}

fn print_partitions(config: &ProxyConfig) {
    match compute_partitions(config.partition_domain, config.num_partitions) {
        Ok(ranges) => println!(
            "{} partitions over {} by {:?}: {}",
            config.num_partitions,
            config.partition_key,
            config.partition_mode,
            ranges
                .iter()
                .map(|range| format!("[{}..{}]", range.start, range.end))
                .join(" ")
        ),
        Err(e) => println!("{e}"),
    }
}

pub(crate) async fn initialize(
    params: HashMap<String, String>,
    env: HashMap<String, String>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Arc::new(ProxyConfig::load(&params, &env)?);
    tracing::info!(
        "{} partitions over '{}' in {:?} mode, upstream {}",
        config.num_partitions,
        config.partition_key,
        config.partition_mode,
        config.upstream_url
    );

    let backend = HttpBackend::new(&config);
    let authorizer = Box::new(TokenAuthorizer::new(&config.tokens));
    if config.tokens.is_empty() {
        tracing::warn!("no caller tokens configured, every request will be rejected");
    }
    let proxy = Arc::new(Proxy::new(config.clone(), backend, authorizer));

    let (sender_commandline, receiver_commandline) = bounded(20);
    let receiver_ctrl_c = ctrl_channel()?;
    tokio::task::spawn_blocking(move || commandline(sender_commandline));

    let local_ip = config.local_ip.clone();
    let local_port = config.local_port;
    tokio::spawn(async move { http_server(proxy, &local_ip, local_port).await });

    print_partitions(&config);

    loop {
        select! {
            recv(receiver_ctrl_c) -> _ => {
                println!("Server stopped by Ctrl-C");
                return Ok(());
            }

            recv(receiver_commandline) -> message => {
                let Ok(m) = message else {
                    // console closed, only Ctrl-C remains
                    let _ = receiver_ctrl_c.recv();
                    println!("Server stopped by Ctrl-C");
                    return Ok(());
                };
                let parameter: Vec<&str> = m.split_whitespace().collect();
                let command = parameter.first().map(|p| p.to_lowercase()).unwrap_or_default();

                match command.as_str() {
                    "partitions" => print_partitions(&config),
                    "upstream" => println!("upstream {}", config.upstream_url),
                    "quit" => {
                        println!("Server stopped by quit");
                        return Ok(());
                    }
                    "" => {}
                    other => println!("unknown command '{other}', use partitions, upstream or quit"),
                }
            }
        }
    }
}
