pub mod common;
pub mod fleet_e2e;

use common::Error;
use fleet_e2e::{fleet_deletion_e2e_test, fleet_e2e_test, fleet_scaling_e2e_test};
use std::env;
use tracing::*;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str).unwrap_or_default() {
        "fleet" => {
            info!("Running fleet end-to-end test");
            fleet_e2e_test().await
        }
        "fleet-scaling" => {
            info!("Running fleet end-to-end test for scaling");
            fleet_scaling_e2e_test().await
        }
        "fleet-deletion" => {
            info!("Running fleet end-to-end test for deletion");
            fleet_deletion_e2e_test().await
        }
        _ => {
            warn!("Please specify one of fleet, fleet-scaling or fleet-deletion");
            Ok(())
        }
    }
}
