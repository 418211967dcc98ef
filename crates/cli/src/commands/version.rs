//! Client and server version

use anyhow::Result;
use serde::Serialize;

use crate::client::ApiClient;
use crate::output::{print_error, print_json, OutputFormat};

#[derive(Debug, Serialize)]
struct Versions {
    client: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
}

pub async fn show_version(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let server = match client.version().await {
        Ok(version) => Some(version),
        Err(e) => {
            print_error(&format!("Could not reach scheduler: {:#}", e));
            None
        }
    };
    let versions = Versions {
        client: env!("CARGO_PKG_VERSION"),
        server,
    };

    match format {
        OutputFormat::Json => print_json(&versions),
        OutputFormat::Table => {
            println!("Client Version: {}", versions.client);
            if let Some(server) = &versions.server {
                println!("Server Version: {}", server);
            }
        }
    }

    Ok(())
}
