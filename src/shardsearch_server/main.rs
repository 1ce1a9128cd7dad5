#![crate_name = "shardsearch_server"]

//! # `shardsearch_server`
//! **shardsearch server** is a standalone partitioned search proxy to be accessed via HTTP.
//! * splits every search over N partitions of one logical collection and merges the results
//! * scoped, short-lived search keys; the admin key never leaves the proxy
//! * token based access control
//! ### Command line parameters
//! ```text
//! * config              (optional JSON config file)
//! * upstream_url        (default = http://127.0.0.1:8108)
//! * admin_api_key       (or env SHARDSEARCH_ADMIN_API_KEY, required)
//! * search_api_key      (or env SHARDSEARCH_SEARCH_API_KEY, default = admin_api_key)
//! * num_partitions      (default = 1)
//! * partition_key       (default = partition)
//! * partition_domain    (default = 100)
//! * partition_mode      (filter | alias, default = filter)
//! * local_ip            (default = 0.0.0.0)
//! * local_port          (default = 8109)
//! shardsearch_server local_port=8109 upstream_url="http://127.0.0.1:8108" num_partitions=4
//! ```
//! ### Console commands
//! ```text
//! quit to exit
//! ```
//! ### Logging
//! Log verbosity follows `RUST_LOG`, default `info`.

use std::collections::HashMap;
use std::env;
use std::error::Error;

use tracing_subscriber::EnvFilter;

use crate::server::initialize;

#[doc(hidden)]
mod http_server;
#[doc(hidden)]
mod server;
#[doc(hidden)]
pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

#[doc(hidden)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let mut params = HashMap::new();
    if args.len() > 1 {
        for s in args {
            if let Some((key, value)) = s.split_once('=') {
                params.insert(
                    key.trim().to_owned(),
                    value.trim().trim_matches('"').to_owned(),
                );
            }
        }
    }

    let env_vars: HashMap<String, String> = env::vars().collect();

    println!("shardsearch server v{} starting ...", VERSION);
    println!("Hit CTRL-C or enter 'quit' to shutdown server");

    initialize(params, env_vars).await?;

    Ok(())
}
